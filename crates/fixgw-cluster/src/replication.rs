//! Peer replication.
//!
//! Every key this node owns is pushed to every configured peer with `@w`.
//! Each peer has its own task, connection and queue of pending keys:
//!
//! - A store subscription on each owned key enqueues the key on every
//!   peer's queue when it changes. Queues hold each key at most once.
//! - A paced drain loop sends the current value of each pending key. If the
//!   echo guard shows the key was just written by that same peer, the block
//!   is consumed and nothing is sent.
//! - All owned keys are re-enqueued on (re)connect and every refresh
//!   interval, so peers keep their copies fresh relative to `tol`.
//! - A transport failure requeues the key and reconnects with exponential
//!   backoff.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use fixgw_core::config::ReplicationSettings;
use fixgw_core::{Handler, ItemStore, Reading};
use fixgw_server::{ClientError, EchoGuard, NetfixClient, Shutdown, StatusProvider};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::error::ClusterError;

/// Subscription owner name used for the store subscriptions.
pub const OWNER: &str = "replication";

/// Keys waiting to be sent, in arrival order, without duplicates.
#[derive(Debug, Default)]
struct PendingKeys {
    order: VecDeque<String>,
    queued: HashSet<String>,
}

impl PendingKeys {
    fn push(&mut self, key: &str) -> bool {
        if self.queued.insert(key.to_string()) {
            self.order.push_back(key.to_string());
            true
        } else {
            false
        }
    }

    fn pop(&mut self) -> Option<String> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// One peer and its counters.
#[derive(Debug)]
struct PeerLink {
    address: String,
    pending: Mutex<PendingKeys>,
    connected: AtomicBool,
    sent: AtomicU64,
    suppressed: AtomicU64,
    failures: AtomicU64,
}

impl PeerLink {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            pending: Mutex::new(PendingKeys::default()),
            connected: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingKeys> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, key: &str) {
        self.pending().push(key);
    }

    fn enqueue_all(&self, keys: &[String]) {
        let mut pending = self.pending();
        for key in keys {
            pending.push(key);
        }
    }

    fn next_key(&self) -> Option<String> {
        self.pending().pop()
    }

    fn snapshot(&self) -> PeerStatus {
        PeerStatus {
            address: self.address.clone(),
            connected: self.connected.load(Ordering::Relaxed),
            pending: self.pending().len(),
            sent: self.sent.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub address: String,
    pub connected: bool,
    pub pending: usize,
    pub sent: u64,
    pub suppressed: u64,
    pub failures: u64,
}

/// Pushes owned keys to peer netfix servers.
pub struct Replicator {
    store: Arc<ItemStore>,
    echo: Arc<EchoGuard>,
    settings: ReplicationSettings,
    outputs: Arc<[String]>,
    links: Vec<Arc<PeerLink>>,
    handler: Handler,
}

impl Replicator {
    /// Create a replicator for the configured peers and outputs.
    ///
    /// `echo` must be the guard shared with this node's netfix server.
    pub fn new(
        store: Arc<ItemStore>,
        echo: Arc<EchoGuard>,
        settings: ReplicationSettings,
    ) -> Result<Self, ClusterError> {
        if let Some(missing) = settings.outputs.iter().find(|k| !store.contains(k)) {
            return Err(ClusterError::UnknownOutput(missing.clone()));
        }

        let links: Vec<Arc<PeerLink>> = settings
            .peers
            .iter()
            .map(|address| Arc::new(PeerLink::new(address)))
            .collect();

        let targets = links.clone();
        let handler: Handler = Arc::new(move |address: &str, _: &Reading| {
            for link in &targets {
                link.enqueue(address);
            }
        });

        Ok(Self {
            outputs: settings.outputs.clone().into(),
            store,
            echo,
            settings,
            links,
            handler,
        })
    }

    pub fn peer_status(&self) -> Vec<PeerStatus> {
        self.links.iter().map(|link| link.snapshot()).collect()
    }

    /// Subscribe to the owned keys and spawn one task per peer.
    pub fn start(&self, shutdown: Shutdown) -> Result<Vec<JoinHandle<()>>, ClusterError> {
        for key in self.outputs.iter() {
            self.store.subscribe(OWNER, key, Arc::clone(&self.handler))?;
        }
        info!(
            peers = self.links.len(),
            outputs = self.outputs.len(),
            "Replication started"
        );

        let handles = self
            .links
            .iter()
            .map(|link| {
                let task = LinkTask {
                    link: Arc::clone(link),
                    store: Arc::clone(&self.store),
                    echo: Arc::clone(&self.echo),
                    outputs: Arc::clone(&self.outputs),
                    settings: self.settings.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(task.run())
            })
            .collect();
        Ok(handles)
    }

    /// Remove the store subscriptions.
    pub fn detach(&self) {
        self.store.unsubscribe_all(OWNER);
    }
}

impl StatusProvider for Replicator {
    fn name(&self) -> &str {
        "replication"
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "outputs": self.outputs.len(),
            "peers": self.peer_status(),
        })
    }
}

struct LinkTask {
    link: Arc<PeerLink>,
    store: Arc<ItemStore>,
    echo: Arc<EchoGuard>,
    outputs: Arc<[String]>,
    settings: ReplicationSettings,
    shutdown: Shutdown,
}

impl LinkTask {
    async fn run(self) {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: self.settings.reconnect_min(),
            max: self.settings.reconnect_max(),
        });
        let address = self.link.address.clone();

        while !self.shutdown.is_triggered() {
            let connect = NetfixClient::connect(&address, self.settings.response_timeout());
            let connected = tokio::select! {
                _ = self.shutdown.wait() => break,
                result = connect => result,
            };

            match connected {
                Ok((client, _updates)) => {
                    info!("Replication link to {} up", address);
                    backoff.reset();
                    self.link.connected.store(true, Ordering::Relaxed);
                    self.link.enqueue_all(&self.outputs);

                    let result = self.drain(&client).await;
                    self.link.connected.store(false, Ordering::Relaxed);
                    match result {
                        Ok(()) => break,
                        Err(e) => warn!("Replication link to {} failed: {}", address, e),
                    }
                }
                Err(e) => debug!("Cannot connect to peer {}: {}", address, e),
            }

            let delay = backoff.next_delay();
            debug!("Reconnecting to {} in {:?}", address, delay);
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = sleep(delay) => {}
            }
        }
        info!("Replication link to {} stopped", address);
    }

    /// Send pending keys until shutdown (`Ok`) or a transport failure.
    async fn drain(&self, client: &NetfixClient) -> Result<(), ClientError> {
        let peer_ip = client.peer_addr().ip();
        let mut send_tick = interval(self.settings.interval());
        send_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Everything was just enqueued on connect.
        let refresh = self.settings.refresh_interval();
        let mut refresh_tick = interval_at(Instant::now() + refresh, refresh);
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => return Ok(()),
                _ = refresh_tick.tick() => self.link.enqueue_all(&self.outputs),
                _ = send_tick.tick() => self.flush(client, peer_ip).await?,
            }
        }
    }

    /// Send every pending key. Returns early on shutdown, leaving the rest
    /// queued.
    async fn flush(&self, client: &NetfixClient, peer_ip: IpAddr) -> Result<(), ClientError> {
        while !self.shutdown.is_triggered() {
            let Some(key) = self.link.next_key() else {
                break;
            };
            if self.echo.take(peer_ip, &key) {
                debug!(key = %key, peer = %self.link.address, "Suppressed echo");
                self.link.suppressed.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let value = match self.store.read(&key) {
                Ok(Reading::Item(report)) => report.value,
                Ok(Reading::Aux(Some(value))) => value,
                Ok(Reading::Aux(None)) => continue,
                Err(e) => {
                    warn!("Cannot replicate {}: {}", key, e);
                    continue;
                }
            };

            let written = tokio::select! {
                _ = self.shutdown.wait() => {
                    self.link.enqueue(&key);
                    return Ok(());
                }
                result = client.write(&key, &value) => result,
            };
            match written {
                Ok(_) => {
                    self.link.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(ClientError::Protocol { command, code }) => {
                    // The peer refused this key; retrying will not help.
                    warn!(peer = %self.link.address, "Peer rejected '{}' with {}", command, code);
                    self.link.failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.link.enqueue(&key);
                    self.link.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixgw_core::{DataType, ItemDefinition};

    fn test_store() -> Arc<ItemStore> {
        Arc::new(
            ItemStore::from_definitions([
                ItemDefinition::new("ALT", DataType::Float),
                ItemDefinition::new("IAS", DataType::Float),
            ])
            .unwrap(),
        )
    }

    fn settings(peers: &[&str], outputs: &[&str]) -> ReplicationSettings {
        ReplicationSettings {
            peers: peers.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            ..ReplicationSettings::default()
        }
    }

    #[test]
    fn test_pending_keys_deduplicate() {
        let mut pending = PendingKeys::default();
        assert!(pending.push("ALT"));
        assert!(pending.push("IAS"));
        assert!(!pending.push("ALT"));
        assert_eq!(pending.len(), 2);

        assert_eq!(pending.pop().as_deref(), Some("ALT"));
        assert!(pending.push("ALT"));
        assert_eq!(pending.pop().as_deref(), Some("IAS"));
        assert_eq!(pending.pop().as_deref(), Some("ALT"));
        assert_eq!(pending.pop(), None);
    }

    #[test]
    fn test_unknown_output_rejected() {
        let result = Replicator::new(
            test_store(),
            Arc::new(EchoGuard::new()),
            settings(&["127.0.0.1:3490"], &["NOPE"]),
        );
        assert!(matches!(result, Err(ClusterError::UnknownOutput(k)) if k == "NOPE"));
    }

    #[tokio::test]
    async fn test_changes_enqueue_on_every_peer() {
        let store = test_store();
        let replicator = Replicator::new(
            Arc::clone(&store),
            Arc::new(EchoGuard::new()),
            settings(&["127.0.0.1:1", "127.0.0.1:2"], &["ALT"]),
        )
        .unwrap();
        let shutdown = Shutdown::new();
        let handles = replicator.start(shutdown.clone()).unwrap();
        assert_eq!(handles.len(), 2);

        store.write("ALT", 10.0).unwrap();
        store.write("ALT", 20.0).unwrap();
        store.write("IAS", 5.0).unwrap();
        for status in replicator.peer_status() {
            assert_eq!(status.pending, 1);
        }

        replicator.detach();
        assert_eq!(store.get_raw("ALT").unwrap().subscriber_count(), 0);

        shutdown.trigger();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
