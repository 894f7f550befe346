//! Multi-node tests: real netfix servers on ephemeral ports, replication
//! between them and quorum election on top.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use fixgw_cluster::{LeaderHandle, QuorumElector, Replicator};
use fixgw_core::config::{vote_key, QuorumSettings, ReplicationSettings, LEADER_KEY};
use fixgw_core::{DataType, Flags, ItemDefinition, ItemStore, Value};
use fixgw_protocol::ValueUpdate;
use fixgw_server::{
    spawn_sweeper, EchoGuard, NetfixClient, NetfixServer, ServerConfig, Shutdown,
};

fn replication(peers: &[SocketAddr], outputs: &[&str]) -> ReplicationSettings {
    ReplicationSettings {
        peers: peers.iter().map(|a| a.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        interval: Some(50),
        refresh_interval: Some(60_000),
        response_timeout: Some(1000),
        reconnect_min: Some(50),
        reconnect_max: Some(200),
    }
}

fn flight_store() -> Arc<ItemStore> {
    Arc::new(
        ItemStore::from_definitions([
            ItemDefinition::new("ALT", DataType::Float),
            ItemDefinition::new("IAS", DataType::Float),
        ])
        .unwrap(),
    )
}

/// Serve `store` on `listener` and return the server task.
fn serve(
    listener: TcpListener,
    store: Arc<ItemStore>,
    echo: Arc<EchoGuard>,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    let config = ServerConfig {
        bind_addr: listener.local_addr().unwrap().to_string(),
        ..ServerConfig::default()
    };
    let server = NetfixServer::new(config, store)
        .with_echo_guard(echo)
        .with_shutdown(shutdown);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    })
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_owned_keys_replicate_to_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_b = listener.local_addr().unwrap();
    let store_b = flight_store();
    let shutdown = Shutdown::new();
    let server_b = serve(
        listener,
        Arc::clone(&store_b),
        Arc::new(EchoGuard::new()),
        shutdown.clone(),
    );

    let store_a = flight_store();
    let replicator = Replicator::new(
        Arc::clone(&store_a),
        Arc::new(EchoGuard::new()),
        replication(&[addr_b], &["ALT"]),
    )
    .unwrap();
    let links = replicator.start(shutdown.clone()).unwrap();

    store_a.write("ALT", 2500.0).unwrap();
    store_a.write("IAS", 120.0).unwrap();
    wait_for("ALT on peer", || {
        store_b.read_item("ALT").unwrap().value == Value::Float(2500.0)
    })
    .await;
    // Keys the node does not own stay local.
    assert_eq!(store_b.read_item("IAS").unwrap().value, Value::Float(0.0));

    let status = replicator.peer_status();
    assert!(status[0].connected);
    assert!(status[0].sent >= 1);

    shutdown.trigger();
    for handle in links {
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
    timeout(Duration::from_secs(2), server_b).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_values_from_peer_are_not_sent_back() {
    // The peer is played by the test: it records every line and
    // acknowledges each `@w`.
    let fake_peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_addr = fake_peer.local_addr().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_b = listener.local_addr().unwrap();
    let store_b = flight_store();
    let echo_b = Arc::new(EchoGuard::new());
    let shutdown = Shutdown::new();
    let _server_b = serve(
        listener,
        Arc::clone(&store_b),
        Arc::clone(&echo_b),
        shutdown.clone(),
    );

    let replicator = Replicator::new(
        Arc::clone(&store_b),
        echo_b,
        replication(&[fake_addr], &["ALT"]),
    )
    .unwrap();
    let _links = replicator.start(shutdown.clone()).unwrap();

    let (stream, _) = timeout(Duration::from_secs(2), fake_peer.accept())
        .await
        .expect("replicator should connect")
        .unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some((key, value)) = line.strip_prefix("@w").and_then(|r| r.split_once(';')) {
                let ack = format!("@w{key};{value};00000\n");
                if write_half.write_all(ack.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = seen_tx.send(line);
        }
    });

    // Owned keys are sent on connect.
    let first = timeout(Duration::from_secs(2), seen.recv()).await.unwrap();
    assert_eq!(first.as_deref(), Some("@wALT;0.0"));

    // The peer writes ALT to this node...
    let (client, _updates) = NetfixClient::connect(&addr_b.to_string(), Duration::from_secs(1))
        .await
        .unwrap();
    client
        .send_update(&ValueUpdate {
            key: "ALT".to_string(),
            value: "100".to_string(),
            flags: Some(Flags::default()),
        })
        .await
        .unwrap();
    assert_eq!(client.read("ALT").await.unwrap().value, "100.0");

    // ...and does not get it back.
    assert!(timeout(Duration::from_millis(400), seen.recv()).await.is_err());
    assert_eq!(replicator.peer_status()[0].suppressed, 1);

    // Local changes still go out.
    store_b.write("ALT", 200.0).unwrap();
    let next = timeout(Duration::from_secs(2), seen.recv()).await.unwrap();
    assert_eq!(next.as_deref(), Some("@wALT;200.0"));

    shutdown.trigger();
}

#[tokio::test]
async fn test_shutdown_interrupts_unanswered_write() {
    // A peer that accepts and reads but never answers.
    let silent_peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent_peer.local_addr().unwrap();

    let settings = ReplicationSettings {
        response_timeout: Some(10_000),
        ..replication(&[silent_addr], &["ALT", "IAS"])
    };
    let shutdown = Shutdown::new();
    let replicator = Replicator::new(flight_store(), Arc::new(EchoGuard::new()), settings).unwrap();
    let links = replicator.start(shutdown.clone()).unwrap();

    let (stream, _) = timeout(Duration::from_secs(2), silent_peer.accept())
        .await
        .expect("replicator should connect")
        .unwrap();
    let mut lines = BufReader::new(stream).lines();
    let first = timeout(Duration::from_secs(2), lines.next_line()).await.unwrap().unwrap();
    assert_eq!(first.as_deref(), Some("@wALT;0.0"));

    // The write of ALT is still waiting for its reply.
    shutdown.trigger();
    for handle in links {
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("link should stop without waiting for the reply")
            .unwrap();
    }
    // Nothing more goes out after shutdown.
    assert!(matches!(
        timeout(Duration::from_millis(200), lines.next_line()).await,
        Err(_) | Ok(Ok(None)) | Ok(Err(_))
    ));
}

struct Node {
    store: Arc<ItemStore>,
    leader: LeaderHandle,
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    async fn stop(self) {
        self.shutdown.trigger();
        for task in self.tasks {
            timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        }
    }
}

fn start_node(nodeid: u32, total_nodes: u32, listener: TcpListener, peer: SocketAddr) -> Node {
    let mut defs: Vec<ItemDefinition> = (1..=total_nodes)
        .map(|id| ItemDefinition::new(vote_key(id), DataType::Int).with_tol(300))
        .collect();
    defs.push(ItemDefinition::new(LEADER_KEY, DataType::Bool));
    let store = Arc::new(ItemStore::from_definitions(defs).unwrap());
    let echo = Arc::new(EchoGuard::new());
    let shutdown = Shutdown::new();

    let mut tasks = vec![serve(
        listener,
        Arc::clone(&store),
        Arc::clone(&echo),
        shutdown.clone(),
    )];
    tasks.push(spawn_sweeper(
        Arc::clone(&store),
        Arc::clone(&echo),
        Duration::from_millis(50),
        shutdown.clone(),
    ));

    let own_vote = vote_key(nodeid);
    let settings = ReplicationSettings {
        refresh_interval: Some(100),
        ..replication(&[peer], &[own_vote.as_str()])
    };
    let replicator = Replicator::new(Arc::clone(&store), echo, settings).unwrap();
    tasks.extend(replicator.start(shutdown.clone()).unwrap());

    let elector = QuorumElector::new(
        Arc::clone(&store),
        &QuorumSettings {
            enabled: true,
            nodeid,
            total_nodes,
            interval: Some(50),
            startup_grace: Some(0),
            vote_tol: Some(300),
        },
    );
    let leader = elector.leader_handle();
    tasks.push(tokio::spawn(Arc::new(elector).run(shutdown.clone())));

    Node {
        store,
        leader,
        shutdown,
        tasks,
    }
}

#[tokio::test]
async fn test_two_node_election_and_failover() {
    let listener_1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_1 = listener_1.local_addr().unwrap();
    let addr_2 = listener_2.local_addr().unwrap();

    let node_1 = start_node(1, 2, listener_1, addr_2);
    let node_2 = start_node(2, 2, listener_2, addr_1);

    // Both nodes see both votes; the higher id leads.
    wait_for("votes to replicate", || {
        node_1.store.read_item(&vote_key(2)).unwrap().value == Value::Int(2)
            && node_2.store.read_item(&vote_key(1)).unwrap().value == Value::Int(1)
    })
    .await;
    wait_for("node 2 to lead", || {
        node_2.leader.is_leader() && !node_1.leader.is_leader()
    })
    .await;
    assert_eq!(
        node_2.store.read_item(LEADER_KEY).unwrap().value,
        Value::Bool(true)
    );

    // Node 2 goes away; its vote goes stale on node 1, which takes over.
    node_2.stop().await;
    wait_for("node 1 to take over", || node_1.leader.is_leader()).await;
    assert!(node_1.store.read_item(&vote_key(2)).unwrap().flags.old);
    assert_eq!(
        node_1.store.read_item(LEADER_KEY).unwrap().value,
        Value::Bool(true)
    );

    node_1.stop().await;
}
