//! Task executor: drives one delivery through the work item state machine.
//!
//! Per delivery: fetch the item, settle duplicates and orphans without
//! doing work, claim CREATED → PROCESSING, run the handler, record
//! COMPLETED or ERROR, then ack. Every state change goes through the
//! store's conditional `transition`; the executor never trusts a copy of
//! the item across an await.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, error, info, warn};

use tokio::task::{JoinError, JoinHandle};

use super::registry::Registry;
use crate::broker::{BrokerClient, Delivery};
use crate::error::{Error, Result};
use crate::model::{State, WorkId, WorkItem};
use crate::retry::RetryPolicy;
use crate::store::WorkStore;
use crate::telemetry::metrics;
use crate::telemetry::work::{
    record_disposition, record_kind, record_state_transition, start_delivery_span,
};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Must match the broker's visibility timeout; heartbeats extend by this much.
    pub visibility_timeout: Duration,
    /// Extend the visibility deadline every `visibility_timeout / 2` while a handler runs.
    pub heartbeat: bool,
    /// Hard limit on one handler run. On expiry the handler task is aborted
    /// and the item fails. `None` lets a handler run (and heartbeat) forever.
    pub time_limit: Option<Duration>,
    /// Retry policy for the initial item fetch.
    pub read_retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(900),
            heartbeat: true,
            time_limit: Some(Duration::from_secs(900)),
            read_retry: RetryPolicy::reads(),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Handler succeeded, item COMPLETED, message acked.
    Completed,
    /// Handler failed (or COMPLETED could not be written), item ERROR, acked.
    Failed,
    /// Neither COMPLETED nor ERROR could be written; item left PROCESSING, acked.
    Stranded,
    /// Item was already COMPLETED/ERROR; acked without work.
    AlreadyTerminal,
    /// Another executor owns or finished the item; acked without (further) work.
    ClaimedElsewhere,
    /// No such item; message dropped.
    Orphaned,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::Failed => "failed",
            Disposition::Stranded => "stranded",
            Disposition::AlreadyTerminal => "already_terminal",
            Disposition::ClaimedElsewhere => "claimed_elsewhere",
            Disposition::Orphaned => "orphaned",
        }
    }

    /// Did this delivery run the handler?
    pub fn performed(self) -> bool {
        matches!(
            self,
            Disposition::Completed | Disposition::Failed | Disposition::Stranded
        )
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    store: Arc<dyn WorkStore>,
    broker: BrokerClient,
    registry: Arc<Registry>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn WorkStore>,
        broker: BrokerClient,
        registry: Arc<Registry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            config,
        }
    }

    pub fn broker(&self) -> &BrokerClient {
        &self.broker
    }

    /// Settle one delivery.
    ///
    /// `Err` means the delivery was left unsettled (store unreachable before
    /// the claim, or ack retries exhausted); the broker redelivers it after
    /// the visibility deadline.
    pub async fn handle(&self, delivery: &Delivery) -> Result<Disposition> {
        let span = start_delivery_span(delivery);
        let disposition = self
            .settle(delivery, &span)
            .instrument(span.clone())
            .await?;

        record_disposition(&span, disposition.as_str());
        metrics::deliveries().add(1, &[KeyValue::new("disposition", disposition.as_str())]);
        Ok(disposition)
    }

    async fn settle(&self, delivery: &Delivery, span: &Span) -> Result<Disposition> {
        let id = delivery.work_id;

        let item = match self
            .config
            .read_retry
            .run("store.get", Error::is_persistence, || self.store.get(id))
            .await
        {
            Ok(item) => item,
            Err(Error::NotFound(_)) => {
                warn!(id = %id, msg_id = %delivery.msg_id, "message references no work item, dropping");
                self.broker.nack(delivery, false).await?;
                return Ok(Disposition::Orphaned);
            }
            Err(e) => return Err(e),
        };
        record_kind(span, &item.kind);

        if item.state.is_terminal() {
            debug!(id = %id, state = %item.state, "already terminal, acking duplicate");
            return self.ack(delivery, Disposition::AlreadyTerminal).await;
        }

        let item = match item.state {
            State::Created => match self
                .store
                .transition(id, State::Created, State::Processing)
                .await
            {
                Ok(item) => {
                    record_state_transition(span, State::Created, State::Processing);
                    item
                }
                Err(Error::StateConflict { actual, .. }) => {
                    info!(id = %id, %actual, "lost claim race");
                    return self.ack(delivery, Disposition::ClaimedElsewhere).await;
                }
                Err(e) => return Err(e),
            },
            // The previous holder's deadline expired; resume its work.
            _ if delivery.is_redelivery() => {
                warn!(
                    id = %id,
                    read_count = delivery.read_count,
                    "resuming item left PROCESSING by an expired delivery"
                );
                item
            }
            _ => {
                info!(id = %id, "item already PROCESSING under another delivery");
                return self.ack(delivery, Disposition::ClaimedElsewhere).await;
            }
        };

        let start = Instant::now();
        let outcome = self.perform(&item, delivery).await;
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "work.perform")],
        );

        let disposition = match outcome {
            Ok(()) => match self
                .store
                .transition(id, State::Processing, State::Completed)
                .await
            {
                Ok(_) => {
                    record_state_transition(span, State::Processing, State::Completed);
                    info!(id = %id, duration_ms = start.elapsed().as_millis() as u64, "work completed");
                    Disposition::Completed
                }
                Err(Error::StateConflict { actual, .. }) => {
                    warn!(id = %id, %actual, "item finalized by another executor");
                    Disposition::ClaimedElsewhere
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "could not record COMPLETED, recording ERROR");
                    self.mark_error(id, span).await
                }
            },
            Err(e) => {
                warn!(id = %id, error = %e, "work failed");
                self.mark_error(id, span).await
            }
        };

        self.ack(delivery, disposition).await
    }

    /// Best effort PROCESSING → ERROR. Never fails; a store error leaves
    /// the item PROCESSING for an out-of-band sweep.
    async fn mark_error(&self, id: WorkId, span: &Span) -> Disposition {
        match self
            .store
            .transition(id, State::Processing, State::Error)
            .await
        {
            Ok(_) => {
                record_state_transition(span, State::Processing, State::Error);
                Disposition::Failed
            }
            Err(Error::StateConflict { actual, .. }) => {
                warn!(id = %id, %actual, "item finalized by another executor");
                Disposition::ClaimedElsewhere
            }
            Err(e) => {
                error!(id = %id, error = %e, "could not record ERROR; item left PROCESSING");
                Disposition::Stranded
            }
        }
    }

    async fn ack(&self, delivery: &Delivery, disposition: Disposition) -> Result<Disposition> {
        if !self.broker.ack(delivery).await? {
            debug!(msg_id = %delivery.msg_id, "message already gone at ack");
        }
        Ok(disposition)
    }

    /// Run the handler on its own task so a panic fails the item instead of
    /// the worker. Heartbeats keep the delivery invisible meanwhile.
    async fn perform(&self, item: &WorkItem, delivery: &Delivery) -> Result<()> {
        let handler = self
            .registry
            .get(&item.kind)
            .ok_or_else(|| Error::UnknownKind(item.kind.clone()))?;

        let owned = item.clone();
        let mut task =
            tokio::spawn(async move { handler.perform(&owned).await }.in_current_span());

        let joined = match self.config.time_limit {
            Some(limit) => {
                match tokio::time::timeout(limit, self.join(&mut task, delivery)).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        task.abort();
                        warn!(
                            id = %item.id,
                            limit_ms = limit.as_millis() as u64,
                            "handler hit its time limit, aborted"
                        );
                        return Err(Error::WorkFailure(format!(
                            "time limit of {}ms exceeded",
                            limit.as_millis()
                        )));
                    }
                }
            }
            None => self.join(&mut task, delivery).await,
        };

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ Error::WorkFailure(_))) => Err(e),
            Ok(Err(e)) => Err(Error::WorkFailure(e.to_string())),
            Err(join) if join.is_panic() => Err(Error::WorkFailure(format!(
                "handler panicked: {}",
                panic_message(join.into_panic())
            ))),
            Err(join) => Err(Error::WorkFailure(format!("handler task aborted: {join}"))),
        }
    }

    /// Wait for the handler task, heartbeating if enabled.
    async fn join(
        &self,
        task: &mut JoinHandle<Result<()>>,
        delivery: &Delivery,
    ) -> std::result::Result<Result<()>, JoinError> {
        if !self.config.heartbeat {
            return task.await;
        }
        let period = (self.config.visibility_timeout / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                joined = &mut *task => return joined,
                _ = ticker.tick() => self.heartbeat(delivery).await,
            }
        }
    }

    async fn heartbeat(&self, delivery: &Delivery) {
        match self
            .broker
            .extend(delivery, self.config.visibility_timeout)
            .await
        {
            Ok(true) => debug!(msg_id = %delivery.msg_id, "visibility extended"),
            Ok(false) => warn!(msg_id = %delivery.msg_id, "message gone while working"),
            Err(e) => warn!(msg_id = %delivery.msg_id, error = %e, "heartbeat failed"),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
