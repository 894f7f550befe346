//! Echo suppression between peers.
//!
//! When a peer writes a key to this node, the key is blocked for that peer's
//! address for a short time. The replication link to the same address
//! consumes the block instead of sending the value straight back.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How long a block stays valid when nobody consumes it.
pub const DEFAULT_BLOCK_TTL: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct EchoGuard {
    ttl: Duration,
    blocks: Mutex<HashMap<IpAddr, HashMap<String, Instant>>>,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_BLOCK_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, HashMap<String, Instant>>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `key` was just received from `peer`.
    pub fn block(&self, peer: IpAddr, key: &str) {
        self.lock()
            .entry(peer)
            .or_default()
            .insert(key.to_string(), Instant::now());
    }

    /// Consume the block for `key` from `peer`.
    ///
    /// Returns true when a live block existed, meaning the value should not
    /// be sent back to that peer.
    pub fn take(&self, peer: IpAddr, key: &str) -> bool {
        let mut blocks = self.lock();
        let Some(keys) = blocks.get_mut(&peer) else {
            return false;
        };
        let live = keys
            .remove(key)
            .is_some_and(|at| at.elapsed() <= self.ttl);
        if keys.is_empty() {
            blocks.remove(&peer);
        }
        live
    }

    /// Drop a block without checking it, e.g. after a failed write.
    pub fn clear(&self, peer: IpAddr, key: &str) {
        let _ = self.take(peer, key);
    }

    /// Number of outstanding blocks, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired blocks.
    pub fn purge(&self) {
        let ttl = self.ttl;
        let mut blocks = self.lock();
        blocks.retain(|_, keys| {
            keys.retain(|_, at| at.elapsed() <= ttl);
            !keys.is_empty()
        });
    }
}

impl Default for EchoGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_block_is_consumed_once() {
        let guard = EchoGuard::new();
        guard.block(localhost(), "ALT");

        assert!(guard.take(localhost(), "ALT"));
        assert!(!guard.take(localhost(), "ALT"));
        assert!(guard.is_empty());
    }

    #[test]
    fn test_blocks_are_per_peer() {
        let guard = EchoGuard::new();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        guard.block(localhost(), "ALT");

        assert!(!guard.take(other, "ALT"));
        assert!(!guard.take(localhost(), "IAS"));
        assert!(guard.take(localhost(), "ALT"));
    }

    #[test]
    fn test_expired_block_does_not_suppress() {
        let guard = EchoGuard::with_ttl(Duration::ZERO);
        guard.block(localhost(), "ALT");
        std::thread::sleep(Duration::from_millis(5));

        assert!(!guard.take(localhost(), "ALT"));
    }

    #[test]
    fn test_purge() {
        let guard = EchoGuard::with_ttl(Duration::ZERO);
        guard.block(localhost(), "ALT");
        guard.block(localhost(), "IAS");
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(guard.len(), 2);
        guard.purge();
        assert!(guard.is_empty());
    }
}
