//! Worker pool: N concurrent receive → handle loops over one broker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::executor::{Disposition, TaskExecutor};
use crate::error::Result;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// Long-poll wait per receive.
    pub receive_timeout: Duration,
    /// Pause after a failed receive before trying again.
    pub idle_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            receive_timeout: Duration::from_secs(5),
            idle_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    executor: TaskExecutor,
    config: WorkerConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl WorkerPool {
    pub fn new(executor: TaskExecutor, config: WorkerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            executor,
            config,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Ask every worker to stop after its current delivery.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run the workers until [`shutdown`](Self::shutdown) is called.
    ///
    /// An in-flight delivery is finished before its worker exits; an
    /// unfinished one would otherwise wait out its visibility timeout.
    pub async fn run(&self) -> Result<()> {
        let workers = self.config.workers.max(1);
        info!(
            workers,
            queue = self.executor.broker().queue(),
            "worker pool started"
        );

        let mut set = JoinSet::new();
        for n in 0..workers {
            let pool = self.clone();
            set.spawn(async move { pool.worker_loop().await }.instrument(info_span!("worker", n)));
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("worker task ended abnormally: {e}");
            }
        }

        info!("worker pool stopped");
        Ok(())
    }

    /// Receive and settle at most one delivery. `None` when the queue stayed
    /// empty for the receive timeout.
    pub async fn run_once(&self) -> Result<Option<Disposition>> {
        let Some(delivery) = self
            .executor
            .broker()
            .receive(self.config.receive_timeout)
            .await?
        else {
            return Ok(None);
        };
        self.executor.handle(&delivery).await.map(Some)
    }

    async fn worker_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                r = self.executor.broker().receive(self.config.receive_timeout) => r,
            };

            match received {
                Ok(Some(delivery)) => match self.executor.handle(&delivery).await {
                    Ok(disposition) => {
                        debug!(id = %delivery.work_id, %disposition, "delivery settled");
                    }
                    Err(e) => {
                        warn!(
                            id = %delivery.work_id,
                            msg_id = %delivery.msg_id,
                            error = %e,
                            "delivery left unsettled, will be redelivered"
                        );
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "receive failed, backing off");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.config.idle_backoff) => {}
                    }
                }
            }
        }
        debug!("worker stopped");
    }
}
