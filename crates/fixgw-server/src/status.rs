//! Connection tracking and the `@xstatus` report.
//!
//! The collector keeps one [`ConnectionStats`] per open connection plus
//! gateway-wide counters, and gathers the sections contributed by other
//! components (replication, quorum) through [`StatusProvider`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fixgw_core::ItemStore;

/// A component that contributes a section to the status report.
pub trait StatusProvider: Send + Sync {
    /// Section name under `plugins`.
    fn name(&self) -> &str;

    fn status(&self) -> serde_json::Value;
}

/// Live counters for one connection.
#[derive(Debug)]
pub struct ConnectionStats {
    pub id: u64,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    subscriptions: AtomicUsize,
}

impl ConnectionStats {
    fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            connected_at: Utc::now(),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub fn record_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_subscriptions(&self, count: usize) {
        self.subscriptions.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStatus {
        ConnectionStatus {
            id: self.id,
            peer: self.peer.to_string(),
            connected_at: self.connected_at.to_rfc3339(),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
        }
    }
}

/// One entry of the `connections` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub id: u64,
    pub peer: String,
    pub connected_at: String,
    pub messages_in: u64,
    pub messages_out: u64,
    pub subscriptions: usize,
}

/// Gateway-wide figures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    /// Uptime in seconds.
    pub uptime: u64,
    pub items: usize,
    pub connections: usize,
    /// Connections accepted since start.
    pub total_connections: u64,
    pub messages_in: u64,
    pub messages_out: u64,
}

/// The full `@xstatus` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub plugins: BTreeMap<String, serde_json::Value>,
    pub connections: Vec<ConnectionStatus>,
    pub performance: Performance,
}

/// Collects connection and component status.
pub struct StatusCollector {
    start_time: Instant,
    next_id: AtomicU64,
    total_connections: AtomicU64,
    connections: Mutex<BTreeMap<u64, Arc<ConnectionStats>>>,
    providers: Mutex<Vec<Arc<dyn StatusProvider>>>,
}

impl StatusCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            next_id: AtomicU64::new(1),
            total_connections: AtomicU64::new(0),
            connections: Mutex::new(BTreeMap::new()),
            providers: Mutex::new(Vec::new()),
        }
    }

    fn connections(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<ConnectionStats>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection and return its counters.
    pub fn connection_opened(&self, peer: SocketAddr) -> Arc<ConnectionStats> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(ConnectionStats::new(id, peer));
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.connections().insert(id, Arc::clone(&stats));
        stats
    }

    pub fn connection_closed(&self, id: u64) {
        self.connections().remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    pub fn register_provider(&self, provider: Arc<dyn StatusProvider>) {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(provider);
    }

    /// Build the status report for the given store.
    pub fn report(&self, store: &ItemStore) -> StatusReport {
        let connections: Vec<ConnectionStatus> =
            self.connections().values().map(|c| c.snapshot()).collect();

        let providers: Vec<Arc<dyn StatusProvider>> = self
            .providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let plugins = providers
            .iter()
            .map(|p| (p.name().to_string(), p.status()))
            .collect();

        StatusReport {
            plugins,
            performance: Performance {
                uptime: self.start_time.elapsed().as_secs(),
                items: store.len(),
                connections: connections.len(),
                total_connections: self.total_connections.load(Ordering::Relaxed),
                messages_in: connections.iter().map(|c| c.messages_in).sum(),
                messages_out: connections.iter().map(|c| c.messages_out).sum(),
            },
            connections,
        }
    }
}

impl Default for StatusCollector {
    fn default() -> Self {
        Self::new()
    }
}
