//! Per-connection protocol handling.
//!
//! A [`Connection`] owns everything the receive loop needs to answer one
//! client: its subscriptions, its outbound queue and the one-shot output
//! inhibit used to swallow the notification caused by its own write.
//! Dispatch is synchronous; replies and subscription updates share the
//! outbound queue so the client sees them in the order they were produced.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use fixgw_core::{
    split_address, DataType, FlagKind, Handler, ItemStore, Reading, StoreError, UpdateHandler,
};
use fixgw_protocol::{
    decode_frame, encode_ack, encode_aux_reply, encode_aux_update, encode_describe, encode_error,
    encode_item_reply, encode_list, encode_status, encode_value_update, Command, ErrorCode, Frame,
    ValueUpdate,
};

use crate::echo::EchoGuard;
use crate::shutdown::Shutdown;
use crate::status::{ConnectionStats, StatusCollector};

/// Items queued for the send loop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outbound {
    Line(String),
    /// Stop the send loop after everything queued before it.
    Close,
}

/// The address whose next notification this connection should not see.
#[derive(Debug, Clone, Default)]
struct OutputInhibit(Arc<Mutex<Option<String>>>);

impl OutputInhibit {
    fn set(&self, address: &str) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.to_string());
    }

    fn clear(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Returns true, and clears the inhibit, if `address` is inhibited.
    fn consume(&self, address: &str) -> bool {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_deref() == Some(address) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

/// Store subscription that forwards changes to a connection's queue.
struct ConnectionSubscriber {
    data_type: DataType,
    tx: UnboundedSender<Outbound>,
    inhibit: OutputInhibit,
}

impl UpdateHandler for ConnectionSubscriber {
    fn on_update(&self, address: &str, reading: &Reading) {
        if self.inhibit.consume(address) {
            return;
        }
        let line = match reading {
            Reading::Item(report) => encode_value_update(address, self.data_type, report),
            Reading::Aux(value) => encode_aux_update(address, value.as_ref()),
        };
        // A closed queue means the connection is going away.
        let _ = self.tx.send(Outbound::Line(line));
    }
}

/// Shared state every connection of a server needs.
#[derive(Clone)]
pub(crate) struct ServerContext {
    pub store: Arc<ItemStore>,
    pub echo: Arc<EchoGuard>,
    pub status: Arc<StatusCollector>,
    pub shutdown: Shutdown,
    pub buffer_size: usize,
}

pub(crate) struct Connection {
    owner: String,
    peer: SocketAddr,
    ctx: ServerContext,
    stats: Arc<ConnectionStats>,
    tx: UnboundedSender<Outbound>,
    inhibit: OutputInhibit,
    subscriptions: HashMap<String, Handler>,
}

impl Connection {
    pub(crate) fn new(
        ctx: &ServerContext,
        stats: Arc<ConnectionStats>,
        tx: UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            owner: format!("netfix-{}", stats.id),
            peer: stats.peer,
            ctx: ctx.clone(),
            stats,
            tx,
            inhibit: OutputInhibit::default(),
            subscriptions: HashMap::new(),
        }
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn send(&self, line: String) {
        let _ = self.tx.send(Outbound::Line(line));
    }

    /// Handle one received line.
    pub(crate) fn handle_line(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return;
        }
        self.stats.record_in();

        match decode_frame(line) {
            Ok(Frame::Command(command)) => self.handle_command(command),
            Ok(Frame::Value(update)) => self.handle_value_update(update),
            Err(e) => warn!(peer = %self.peer, "Dropping frame {:?}: {}", line, e),
        }
    }

    /// Run a store write on behalf of this connection: the peer's address is
    /// blocked for replication and this connection's own notification for
    /// the address is swallowed.
    fn write_as_peer<T>(
        &self,
        address: &str,
        write: impl FnOnce(&ItemStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let ip = self.peer.ip();
        self.ctx.echo.block(ip, address);
        self.inhibit.set(address);
        let result = write(&self.ctx.store);
        self.inhibit.clear();
        if result.is_err() {
            self.ctx.echo.clear(ip, address);
        }
        result
    }

    fn handle_value_update(&mut self, update: ValueUpdate) {
        if !self.ctx.store.contains(&update.key) {
            warn!(peer = %self.peer, key = %update.key, "Dropping update for unknown key");
            return;
        }

        let (key, aux) = split_address(&update.key);
        let value = update.value.as_str();
        let result = match (update.flags, aux) {
            (Some(flags), None) => self.write_as_peer(key, |store| {
                store.write_with_flags(key, value, flags).map(drop)
            }),
            _ => self.write_as_peer(&update.key, |store| store.write(&update.key, value).map(drop)),
        };

        if let Err(e) = result {
            warn!(peer = %self.peer, "Dropping update: {}", e);
        }
    }

    fn handle_command(&mut self, command: Command) {
        let letter = command.letter();
        match command {
            Command::List => {
                for message in encode_list(self.ctx.store.list_keys(), self.ctx.buffer_size) {
                    self.send(message);
                }
            }
            Command::Read { key } => {
                let reply = match self.ctx.store.read(&key) {
                    Ok(Reading::Item(report)) => encode_item_reply(letter, &key, &report),
                    Ok(Reading::Aux(value)) => encode_aux_reply(letter, &key, value.as_ref()),
                    Err(_) => encode_error(letter, &key, ErrorCode::KeyNotFound),
                };
                self.send(reply);
            }
            Command::Write { key, value } => {
                let reply = self.handle_write(&key, value.as_deref());
                self.send(reply);
            }
            Command::Subscribe { key } => {
                let reply = self.handle_subscribe(&key);
                self.send(reply);
            }
            Command::Unsubscribe { key } => {
                let reply = self.handle_unsubscribe(&key);
                self.send(reply);
            }
            Command::Query { key } => {
                let reply = match self.ctx.store.describe(&key) {
                    Ok(def) => encode_describe(&def),
                    Err(_) => encode_error(letter, &key, ErrorCode::KeyNotFound),
                };
                self.send(reply);
            }
            Command::SetFlag { key, flag, setting } => {
                let reply = self.handle_set_flag(&key, &flag, &setting);
                self.send(reply);
            }
            Command::Status => {
                let report = self.ctx.status.report(&self.ctx.store);
                let reply = match serde_json::to_string(&report) {
                    Ok(json) => encode_status(&json),
                    Err(e) => {
                        warn!("Failed to encode status: {}", e);
                        encode_error(letter, "status", ErrorCode::KeyNotFound)
                    }
                };
                self.send(reply);
            }
            Command::Kill => {
                info!(peer = %self.peer, "Shutdown requested by client");
                self.send(encode_ack(letter, "kill"));
                self.ctx.shutdown.trigger();
            }
            Command::Extended(payload) => {
                self.send(encode_error(letter, &payload, ErrorCode::KeyNotFound));
            }
            Command::Unknown { letter, payload } => {
                debug!(peer = %self.peer, "Unknown command '{}'", letter);
                self.send(encode_error(letter, &payload, ErrorCode::UnknownCommand));
            }
        }
    }

    fn handle_write(&self, address: &str, value: Option<&str>) -> String {
        if !self.ctx.store.contains(address) {
            return encode_error('w', address, ErrorCode::KeyNotFound);
        }
        let Some(value) = value else {
            return encode_error('w', address, ErrorCode::BadValue);
        };

        match self.write_as_peer(address, |store| store.write(address, value)) {
            Ok(Reading::Item(report)) => encode_item_reply('w', address, &report),
            Ok(Reading::Aux(value)) => encode_aux_reply('w', address, value.as_ref()),
            Err(StoreError::KeyNotFound(_)) => encode_error('w', address, ErrorCode::KeyNotFound),
            Err(_) => encode_error('w', address, ErrorCode::BadValue),
        }
    }

    fn handle_subscribe(&mut self, address: &str) -> String {
        if !self.ctx.store.contains(address) {
            return encode_error('s', address, ErrorCode::KeyNotFound);
        }
        if self.subscriptions.contains_key(address) {
            return encode_error('s', address, ErrorCode::Rejected);
        }

        let (key, _) = split_address(address);
        let data_type = match self.ctx.store.get_raw(key) {
            Ok(item) => item.data_type(),
            Err(_) => return encode_error('s', address, ErrorCode::KeyNotFound),
        };
        let handler: Handler = Arc::new(ConnectionSubscriber {
            data_type,
            tx: self.tx.clone(),
            inhibit: self.inhibit.clone(),
        });

        match self
            .ctx
            .store
            .subscribe(&self.owner, address, Arc::clone(&handler))
        {
            Ok(()) => {
                self.subscriptions.insert(address.to_string(), handler);
                self.stats.set_subscriptions(self.subscriptions.len());
                encode_ack('s', address)
            }
            Err(StoreError::DuplicateSubscription { .. }) => {
                encode_error('s', address, ErrorCode::Rejected)
            }
            Err(_) => encode_error('s', address, ErrorCode::KeyNotFound),
        }
    }

    fn handle_unsubscribe(&mut self, address: &str) -> String {
        if !self.ctx.store.contains(address) {
            return encode_error('u', address, ErrorCode::KeyNotFound);
        }
        if let Some(handler) = self.subscriptions.remove(address) {
            if let Err(e) = self.ctx.store.unsubscribe(&self.owner, address, &handler) {
                warn!(peer = %self.peer, "Unsubscribe failed: {}", e);
            }
            self.stats.set_subscriptions(self.subscriptions.len());
        }
        encode_ack('u', address)
    }

    fn handle_set_flag(&self, key: &str, flag: &str, setting: &str) -> String {
        let payload = format!("{};{};{}", key, flag, setting);
        let (_, aux) = split_address(key);
        if aux.is_some() || !self.ctx.store.contains(key) {
            return encode_error('f', key, ErrorCode::KeyNotFound);
        }
        if flag.parse::<FlagKind>().is_err() {
            return encode_error('f', key, ErrorCode::Rejected);
        }
        let on = match setting.trim() {
            "1" => true,
            "0" => false,
            _ => return encode_error('f', key, ErrorCode::BadValue),
        };

        match self.ctx.store.set_flag(key, flag, on) {
            Ok(_) => encode_ack('f', &payload),
            Err(StoreError::UnknownFlag(_)) => encode_error('f', key, ErrorCode::Rejected),
            Err(_) => encode_error('f', key, ErrorCode::KeyNotFound),
        }
    }

    /// Drop every subscription and stop the send loop.
    pub(crate) fn close(&mut self) {
        let removed = self.ctx.store.unsubscribe_all(&self.owner);
        self.subscriptions.clear();
        self.stats.set_subscriptions(0);
        debug!(peer = %self.peer, removed, "Connection closed");
        let _ = self.tx.send(Outbound::Close);
    }
}
