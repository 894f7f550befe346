//! Periodic staleness sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use fixgw_core::ItemStore;

use crate::echo::EchoGuard;
use crate::shutdown::Shutdown;

/// Spawn the task that marks expired items `old` and purges expired echo
/// blocks, once per `period`, until shutdown.
pub fn spawn_sweeper(
    store: Arc<ItemStore>,
    echo: Arc<EchoGuard>,
    period: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    let stale = store.sweep_stale();
                    if stale > 0 {
                        debug!(stale, "Items went stale");
                    }
                    echo.purge();
                }
            }
        }
        info!("Staleness sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixgw_core::{DataType, ItemDefinition};

    #[tokio::test]
    async fn test_sweeper_marks_items_old() {
        let store = Arc::new(
            ItemStore::from_definitions([
                ItemDefinition::new("ALT", DataType::Float).with_tol(50),
                ItemDefinition::new("IAS", DataType::Float),
            ])
            .unwrap(),
        );
        store.write("ALT", 100.0).unwrap();

        let shutdown = Shutdown::new();
        let handle = spawn_sweeper(
            Arc::clone(&store),
            Arc::new(EchoGuard::new()),
            Duration::from_millis(20),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.read_item("ALT").unwrap().flags.old);
        assert!(!store.read_item("IAS").unwrap().flags.old);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }
}
