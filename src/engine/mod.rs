//! The engine: submission, status queries, and the executor/pool wiring.
//!
//! `Engine` is built once at startup and holds everything a worker or a
//! submitter needs. Clones share the same store, broker and registry.

pub mod executor;
pub mod hook;
pub mod pool;
pub mod registry;

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, MessageId};
use crate::diagnostics::{self, HealthReport};
use crate::error::{Error, Result};
use crate::model::{NewWorkItem, State, WorkFilter, WorkId, WorkItem};
use crate::retry::RetryPolicy;
use crate::store::WorkStore;
use crate::telemetry::metrics;

pub use executor::{Disposition, ExecutorConfig, TaskExecutor};
pub use hook::HookHandler;
pub use pool::{WorkerConfig, WorkerPool};
pub use registry::{EchoHandler, Handler, Registry, handler_fn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ping the broker before creating a row; fail fast if it is down.
    pub preflight: bool,
    /// Reject submissions whose kind has no registered handler.
    pub validate_kinds: bool,
    /// Retry policy for store reads (`status`, `get`, `list`).
    pub read_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preflight: true,
            validate_kinds: true,
            read_retry: RetryPolicy::reads(),
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn WorkStore>,
    broker: BrokerClient,
    registry: Arc<Registry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn WorkStore>,
        broker: BrokerClient,
        registry: Registry,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            broker,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkStore> {
        &self.store
    }

    pub fn broker(&self) -> &BrokerClient {
        &self.broker
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Create a work item and enqueue it for processing.
    ///
    /// The id is returned as soon as the message is enqueued; the item is
    /// visible as CREATED immediately. If the row was written but the
    /// enqueue ran out of retries the result is `NotEnqueued` carrying the
    /// id: the item stays CREATED until [`resubmit`](Self::resubmit).
    pub async fn submit(&self, new: NewWorkItem) -> Result<WorkId> {
        let start = Instant::now();
        let kind = new.work_kind().to_string();

        if self.config.validate_kinds && !self.registry.contains(&kind) {
            record_submit(&kind, "rejected");
            return Err(Error::UnknownKind(kind));
        }

        if self.config.preflight {
            if let Err(e) = self.broker.ping().await {
                warn!(error = %e, "broker pre-flight failed, rejecting submission");
                record_submit(&kind, "rejected");
                return Err(match e {
                    e @ Error::BrokerUnavailable(_) => e,
                    other => Error::BrokerUnavailable(other.to_string()),
                });
            }
        }

        let item = self.store.create(new).await?;
        let id = item.id;
        debug!(id = %id, kind = %item.kind, "work item created");

        let msg_id = match self.broker.enqueue(id).await {
            Ok(msg_id) => msg_id,
            Err(e) => {
                warn!(id = %id, error = %e, "work item created but not enqueued");
                record_submit(&kind, "not_enqueued");
                return Err(Error::NotEnqueued {
                    id,
                    reason: e.to_string(),
                });
            }
        };

        record_submit(&kind, "ok");
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "work.submit")],
        );
        info!(id = %id, kind = %item.kind, msg_id = %msg_id, "work submitted");
        Ok(id)
    }

    /// Enqueue an item again. Only CREATED items qualify: anything further
    /// along already has (or had) a live message.
    pub async fn resubmit(&self, id: WorkId) -> Result<MessageId> {
        let item = self.get(id).await?;
        if item.state != State::Created {
            return Err(Error::StateConflict {
                id,
                expected: State::Created,
                actual: item.state,
            });
        }
        let msg_id = self.broker.enqueue(id).await.map_err(|e| Error::NotEnqueued {
            id,
            reason: e.to_string(),
        })?;
        info!(id = %id, msg_id = %msg_id, "work item re-enqueued");
        Ok(msg_id)
    }

    /// Last persisted state. Never touches the broker.
    pub async fn status(&self, id: WorkId) -> Result<State> {
        self.get(id).await.map(|item| item.state)
    }

    pub async fn get(&self, id: WorkId) -> Result<WorkItem> {
        self.config
            .read_retry
            .run("store.get", Error::is_persistence, || self.store.get(id))
            .await
    }

    pub async fn list(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>> {
        self.config
            .read_retry
            .run("store.list", Error::is_persistence, || self.store.list(filter))
            .await
    }

    pub async fn health(&self) -> HealthReport {
        diagnostics::check(&self.broker, self.store.as_ref()).await
    }

    pub fn executor(&self, config: ExecutorConfig) -> TaskExecutor {
        TaskExecutor::new(
            Arc::clone(&self.store),
            self.broker.clone(),
            Arc::clone(&self.registry),
            config,
        )
    }

    pub fn worker_pool(&self, executor: ExecutorConfig, workers: WorkerConfig) -> WorkerPool {
        WorkerPool::new(self.executor(executor), workers)
    }
}

fn record_submit(kind: &str, result: &'static str) {
    metrics::work_submitted().add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("result", result),
        ],
    );
}
