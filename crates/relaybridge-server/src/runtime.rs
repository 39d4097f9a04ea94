use crate::config::Config;
use relaybridge_core::backfill::{BackfillWorker, HistoryClient};
use relaybridge_core::bridge::Bridge;
use relaybridge_core::dedup::DedupRegistry;
use relaybridge_core::expiry::{ExpiryTicker, RoomRedactor};
use relaybridge_core::send_lock::AccountSendSerializer;
use relaybridge_db::DbPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The bridge engine plus its background loops.
pub struct Runtime {
    pub bridge: Bridge,
    pub backfill: Option<Arc<BackfillWorker>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn start(
        config: &Config,
        pool: DbPool,
        history: Arc<dyn HistoryClient>,
        redactor: Arc<dyn RoomRedactor>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let send_locks = Arc::new(AccountSendSerializer::new());
        let dedup = DedupRegistry::new(
            config.dedup.capacity,
            config.dedup.action_capacity,
            Duration::from_secs(config.dedup.idle_chat_ttl_seconds),
        );
        let bridge = Bridge::new(pool.clone(), dedup, send_locks.clone());
        let mut tasks = Vec::new();

        tasks.push(spawn_send_lock_pruner(
            send_locks,
            Duration::from_secs(config.send_lock.prune_interval_seconds.max(1)),
            shutdown.clone(),
        ));

        let backfill = if config.backfill.enabled {
            let worker = Arc::new(BackfillWorker::new(
                pool.clone(),
                history,
                config.backfill.settings(),
            ));
            tasks.push(worker.clone().spawn(shutdown.clone()));
            Some(worker)
        } else {
            tracing::info!("backfill: disabled by configuration");
            None
        };

        if config.disappearing.enabled {
            let ticker = ExpiryTicker::new(
                pool,
                redactor,
                Duration::from_secs(config.disappearing.poll_interval_seconds.max(1)),
            );
            tasks.push(ticker.spawn(shutdown.clone()));
        } else {
            tracing::info!("expiry: disabled by configuration");
        }

        Self {
            bridge,
            backfill,
            shutdown,
            tasks,
        }
    }

    /// Stop every loop and wait for them. Running backfill jobs are left
    /// pending.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("background task ended abnormally: {}", e);
            }
        }
    }
}

fn spawn_send_lock_pruner(
    send_locks: Arc<AccountSendSerializer>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // skip immediate first tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    send_locks.prune_idle();
                }
            }
        }
    })
}
