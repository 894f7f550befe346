//! Quorum leader election.
//!
//! Every node writes its vote (its own node id) into its `QVOTE<id>` item,
//! and replication carries that item to every other node. Each node then
//! reads all vote items from its own store and decides locally:
//!
//! - a vote is valid when it carries no quality flag and is a real node id;
//!   a node that stopped voting goes `old` once its `tol` expires
//! - with more than two nodes, a node is never leader unless it sees valid
//!   votes from more than half of them
//! - otherwise the node holding the highest valid vote is leader
//!
//! The decision is exposed through [`LeaderHandle`] and mirrored into the
//! `LEADER` item.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info};

use fixgw_core::config::{vote_key, QuorumSettings, LEADER_KEY};
use fixgw_core::ItemStore;
use fixgw_server::{Shutdown, StatusProvider};

use crate::error::ClusterError;

/// Cloneable view of this node's leadership.
#[derive(Debug, Clone)]
pub struct LeaderHandle(Arc<AtomicBool>);

impl LeaderHandle {
    fn new(leader: bool) -> Self {
        Self(Arc::new(AtomicBool::new(leader)))
    }

    pub fn is_leader(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Whether an action that may require leadership can run now.
    pub fn permits(&self, require_leader: bool) -> bool {
        !require_leader || self.is_leader()
    }

    fn set(&self, leader: bool) -> bool {
        self.0.swap(leader, Ordering::AcqRel)
    }
}

/// The outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Election {
    pub nodes_seen: u32,
    pub max_vote: Option<i64>,
    pub has_quorum: bool,
    pub leader: bool,
}

/// Decide leadership from the votes visible in `store`.
///
/// Only the node ids in `voters` are read; nodes whose vote item is missing
/// are expected to have been excluded already.
pub fn evaluate(store: &ItemStore, nodeid: u32, total_nodes: u32, voters: &[u32]) -> Election {
    let mut nodes_seen = 0;
    let mut max_vote: Option<i64> = None;

    for id in voters {
        let Ok(report) = store.read_item(&vote_key(*id)) else {
            continue;
        };
        let vote = match report.value.as_i64() {
            Some(vote) if vote >= 1 && report.flags.is_clear() => vote,
            _ => continue,
        };
        nodes_seen += 1;
        max_vote = Some(max_vote.map_or(vote, |max| max.max(vote)));
    }

    let has_quorum = total_nodes <= 2 || nodes_seen * 2 > total_nodes;
    let leader = has_quorum && max_vote == Some(i64::from(nodeid));
    Election {
        nodes_seen,
        max_vote,
        has_quorum,
        leader,
    }
}

pub struct QuorumElector {
    store: Arc<ItemStore>,
    enabled: bool,
    nodeid: u32,
    total_nodes: u32,
    interval: Duration,
    startup_grace: Duration,
    voters: Vec<u32>,
    leader: LeaderHandle,
}

impl QuorumElector {
    /// Create an elector. Nodes whose vote item is not defined are logged
    /// and left out of every election.
    pub fn new(store: Arc<ItemStore>, settings: &QuorumSettings) -> Self {
        let mut voters = Vec::new();
        if settings.enabled {
            for id in 1..=settings.total_nodes {
                let key = vote_key(id);
                if store.contains(&key) {
                    voters.push(id);
                } else {
                    error!("{}", ClusterError::QuorumMisconfigured { key });
                }
            }
        }

        Self {
            store,
            enabled: settings.enabled,
            nodeid: settings.nodeid,
            total_nodes: settings.total_nodes,
            interval: settings.interval(),
            startup_grace: settings.startup_grace(),
            voters,
            // A disabled elector always reports leadership.
            leader: LeaderHandle::new(!settings.enabled),
        }
    }

    pub fn leader_handle(&self) -> LeaderHandle {
        self.leader.clone()
    }

    pub fn nodeid(&self) -> u32 {
        self.nodeid
    }

    pub fn evaluate(&self) -> Election {
        evaluate(&self.store, self.nodeid, self.total_nodes, &self.voters)
    }

    /// Cast this node's vote, evaluate and publish the result.
    pub fn step(&self) -> Election {
        if let Err(e) = self.store.write(&vote_key(self.nodeid), self.nodeid) {
            error!("Failed to cast vote: {}", e);
        }
        let election = self.evaluate();
        debug!(
            seen = election.nodes_seen,
            max = ?election.max_vote,
            quorum = election.has_quorum,
            "Election"
        );
        self.publish(election.leader);
        election
    }

    fn publish(&self, leader: bool) {
        let was = self.leader.set(leader);
        if was != leader {
            if leader {
                info!("Node {} is now leader", self.nodeid);
            } else {
                info!("Node {} is no longer leader", self.nodeid);
            }
        }
        if self.store.contains(LEADER_KEY) {
            if let Err(e) = self.store.write(LEADER_KEY, leader) {
                error!("Failed to publish leader flag: {}", e);
            }
        }
    }

    /// Run elections until shutdown.
    ///
    /// Leadership is held during the startup grace window so outputs are not
    /// suppressed while peers' votes are still arriving.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        if !self.enabled {
            info!("Quorum disabled; node always acts as leader");
            self.publish(true);
            return;
        }

        if !self.startup_grace.is_zero() {
            self.publish(true);
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = sleep(self.startup_grace) => {}
            }
        }

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    self.step();
                }
            }
        }
        info!("Quorum elector stopped");
    }
}

impl StatusProvider for QuorumElector {
    fn name(&self) -> &str {
        "quorum"
    }

    fn status(&self) -> serde_json::Value {
        let election = self.evaluate();
        serde_json::json!({
            "enabled": self.enabled,
            "nodeid": self.nodeid,
            "totalNodes": self.total_nodes,
            "nodesSeen": election.nodes_seen,
            "leader": self.leader.is_leader(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixgw_core::{DataType, ItemDefinition, Value};

    fn settings(nodeid: u32, total_nodes: u32) -> QuorumSettings {
        QuorumSettings {
            enabled: true,
            nodeid,
            total_nodes,
            interval: Some(50),
            startup_grace: Some(0),
            vote_tol: Some(2000),
        }
    }

    fn node_store(total_nodes: u32) -> Arc<ItemStore> {
        let mut defs: Vec<ItemDefinition> = (1..=total_nodes)
            .map(|id| ItemDefinition::new(vote_key(id), DataType::Int).with_tol(2000))
            .collect();
        defs.push(ItemDefinition::new(LEADER_KEY, DataType::Bool));
        Arc::new(ItemStore::from_definitions(defs).unwrap())
    }

    /// A node's view where only the given peers' votes are fresh.
    fn node_view(nodeid: u32, total_nodes: u32, visible: &[u32]) -> QuorumElector {
        let store = node_store(total_nodes);
        for id in visible {
            store.write(&vote_key(*id), *id).unwrap();
        }
        QuorumElector::new(store, &settings(nodeid, total_nodes))
    }

    #[test]
    fn test_highest_vote_wins() {
        let all = [1, 2, 3];
        let leaders: Vec<bool> = all
            .iter()
            .map(|id| node_view(*id, 3, &all).step().leader)
            .collect();
        assert_eq!(leaders, vec![false, false, true]);
    }

    #[test]
    fn test_no_leader_without_majority() {
        // Node 3 alone sees only its own vote.
        let elector = node_view(3, 3, &[]);
        let election = elector.step();
        assert_eq!(election.nodes_seen, 1);
        assert!(!election.has_quorum);
        assert!(!election.leader);
        assert_eq!(
            elector.store.read_item(LEADER_KEY).unwrap().value,
            Value::Bool(false)
        );
    }

    #[test]
    fn test_partition_has_at_most_one_leader() {
        // {1, 2} | {3}: the majority side elects node 2, node 3 steps down.
        let views = [
            node_view(1, 3, &[2]).step(),
            node_view(2, 3, &[1]).step(),
            node_view(3, 3, &[]).step(),
        ];
        let leaders: Vec<usize> = views
            .iter()
            .enumerate()
            .filter(|(_, e)| e.leader)
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(leaders, vec![2]);
    }

    #[test]
    fn test_stale_votes_are_ignored() {
        let elector = node_view(2, 3, &[1, 3]);
        let store = Arc::clone(&elector.store);
        store.set_flag(&vote_key(3), "o", true).unwrap();

        let election = elector.step();
        assert_eq!(election.nodes_seen, 2);
        assert_eq!(election.max_vote, Some(2));
        assert!(election.leader);
    }

    #[test]
    fn test_two_nodes_need_no_majority() {
        let election = node_view(2, 2, &[]).step();
        assert!(election.has_quorum);
        assert!(election.leader);

        let election = node_view(1, 2, &[2]).step();
        assert!(!election.leader);
    }

    #[test]
    fn test_missing_vote_item_is_excluded() {
        let store = Arc::new(
            ItemStore::from_definitions([
                ItemDefinition::new(vote_key(1), DataType::Int),
                ItemDefinition::new(vote_key(2), DataType::Int),
            ])
            .unwrap(),
        );
        store.write(&vote_key(2), 2).unwrap();
        let elector = QuorumElector::new(store, &settings(2, 3));
        assert_eq!(elector.voters, vec![1, 2]);

        let election = elector.step();
        assert_eq!(election.nodes_seen, 1);
        assert!(!election.leader);
    }

    #[test]
    fn test_disabled_elector_is_always_leader() {
        let store = node_store(3);
        let elector = QuorumElector::new(
            store,
            &QuorumSettings {
                enabled: false,
                ..settings(1, 3)
            },
        );
        let handle = elector.leader_handle();
        assert!(handle.is_leader());
        assert!(handle.permits(true));
    }

    #[test]
    fn test_permits() {
        let handle = LeaderHandle::new(false);
        assert!(handle.permits(false));
        assert!(!handle.permits(true));
    }

    #[tokio::test]
    async fn test_startup_grace_holds_leadership() {
        let store = node_store(3);
        let elector = QuorumElector::new(
            Arc::clone(&store),
            &QuorumSettings {
                startup_grace: Some(200),
                ..settings(1, 3)
            },
        );
        let handle = elector.leader_handle();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(Arc::new(elector).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_leader());
        assert_eq!(store.read_item(LEADER_KEY).unwrap().value, Value::Bool(true));

        // Alone among three nodes: no quorum once the grace ends.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!handle.is_leader());

        shutdown.trigger();
        task.await.unwrap();
    }
}
