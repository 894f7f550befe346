//! fixgw gateway node.
//!
//! Loads the gateway configuration, serves netfix, replicates owned keys
//! to peers and runs the quorum elector until Ctrl+C or a remote `@xkill`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fixgw_cluster::{QuorumElector, Replicator};
use fixgw_core::config::{vote_key, ConfigSource, JsonFileSource};
use fixgw_core::ItemStore;
use fixgw_server::{spawn_sweeper, EchoGuard, NetfixServer, ServerConfig, Shutdown, StatusCollector};

#[derive(Parser, Debug)]
#[command(name = "fixgw", version, about = "Flight data gateway node")]
struct Args {
    /// Gateway configuration file (JSON)
    #[arg(short, long, default_value = "fixgw.json")]
    config: PathBuf,

    /// Override the quorum node id
    #[arg(long)]
    nodeid: Option<u32>,

    /// Override the netfix listen address
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,fixgw_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!("fixgw starting with {}", args.config.display());

    let mut config = JsonFileSource::new(&args.config)
        .load()
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.netfix.bind_addr = bind;
    }
    if let Some(nodeid) = args.nodeid {
        match config.quorum.as_mut() {
            Some(quorum) => quorum.nodeid = nodeid,
            None => anyhow::bail!("--nodeid given but the configuration has no quorum section"),
        }
    }
    config.validate()?;

    let store = Arc::new(ItemStore::from_definitions(config.item_definitions())?);
    tracing::info!("Item store ready with {} items", store.len());

    let shutdown = Shutdown::new();
    let echo = Arc::new(EchoGuard::new());
    let status = Arc::new(StatusCollector::new());

    let server = NetfixServer::new(ServerConfig::from(&config.netfix), Arc::clone(&store))
        .with_echo_guard(Arc::clone(&echo))
        .with_status(Arc::clone(&status))
        .with_shutdown(shutdown.clone());
    // Bind up front so a busy port fails startup instead of a background task.
    let listener = server.bind().await?;

    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    tasks.push((
        "netfix server",
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                tracing::error!("Netfix server error: {}", e);
            }
        }),
    ));
    tasks.push((
        "sweeper",
        spawn_sweeper(
            Arc::clone(&store),
            Arc::clone(&echo),
            config.sweep_interval(),
            shutdown.clone(),
        ),
    ));

    let replicator = match config.replication.clone() {
        Some(mut settings) => {
            // The own vote only reaches the other nodes through replication.
            if let Some(quorum) = config.quorum.as_ref().filter(|q| q.enabled) {
                let own_vote = vote_key(quorum.nodeid);
                if !settings.outputs.contains(&own_vote) {
                    tracing::debug!("Adding {} to replication outputs", own_vote);
                    settings.outputs.push(own_vote);
                }
            }
            let replicator = Arc::new(Replicator::new(
                Arc::clone(&store),
                Arc::clone(&echo),
                settings,
            )?);
            status.register_provider(replicator.clone());
            for handle in replicator.start(shutdown.clone())? {
                tasks.push(("replication link", handle));
            }
            Some(replicator)
        }
        None => None,
    };

    if let Some(settings) = &config.quorum {
        let elector = Arc::new(QuorumElector::new(Arc::clone(&store), settings));
        status.register_provider(elector.clone());
        tasks.push(("quorum elector", tokio::spawn(elector.run(shutdown.clone()))));
    }

    tracing::info!("fixgw ready, netfix on {}", config.netfix.bind_addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = shutdown.wait() => {
            tracing::info!("Shutdown requested by a client, stopping...");
        }
    }
    shutdown.trigger();
    if let Some(replicator) = &replicator {
        replicator.detach();
    }

    let grace = config.shutdown_grace();
    let deadline = Instant::now() + grace;
    let results = join_all(
        tasks
            .into_iter()
            .map(|(name, handle)| async move { (name, timeout_at(deadline, handle).await) }),
    )
    .await;

    let mut unfinished = Vec::new();
    for (name, result) in results {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("{} task failed: {}", name, e),
            Err(_) => unfinished.push(name),
        }
    }
    if !unfinished.is_empty() {
        anyhow::bail!(
            "tasks still running after {:?}: {}",
            grace,
            unfinished.join(", ")
        );
    }

    tracing::info!("fixgw stopped");
    Ok(())
}
