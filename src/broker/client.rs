//! Retrying front for a `Broker`.
//!
//! Transport hiccups on enqueue/ack/nack/extend are retried here with
//! bounded exponential backoff so they never surface as item-level
//! failures. Only `BrokerUnavailable` is retried.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;

use super::{Broker, Delivery, MessageId};
use crate::error::{Error, Result};
use crate::model::WorkId;
use crate::retry::RetryPolicy;
use crate::telemetry::metrics;

#[derive(Clone)]
pub struct BrokerClient {
    broker: Arc<dyn Broker>,
    queue: String,
    retry: RetryPolicy,
}

impl BrokerClient {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            broker,
            queue: queue.into(),
            retry,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    fn record(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }

    pub async fn enqueue(&self, work_id: WorkId) -> Result<MessageId> {
        let id = self
            .retry
            .run("broker.enqueue", Error::is_broker_unavailable, || {
                self.broker.enqueue(work_id)
            })
            .await?;
        self.record("send");
        Ok(id)
    }

    /// Not retried: the worker loop owns idle backoff.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let delivery = self.broker.receive(timeout).await?;
        self.record(if delivery.is_some() { "read" } else { "read_empty" });
        Ok(delivery)
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<bool> {
        let removed = self
            .retry
            .run("broker.ack", Error::is_broker_unavailable, || {
                self.broker.ack(delivery)
            })
            .await?;
        self.record("archive");
        Ok(removed)
    }

    pub async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.retry
            .run("broker.nack", Error::is_broker_unavailable, || {
                self.broker.nack(delivery, requeue)
            })
            .await?;
        self.record(if requeue { "requeue" } else { "delete" });
        Ok(())
    }

    pub async fn extend(&self, delivery: &Delivery, by: Duration) -> Result<bool> {
        self.retry
            .run("broker.extend", Error::is_broker_unavailable, || {
                self.broker.extend(delivery, by)
            })
            .await
    }

    pub async fn ping(&self) -> Result<()> {
        self.broker.ping().await
    }

    pub async fn server_version(&self) -> Result<Option<String>> {
        self.broker.server_version().await
    }

    pub async fn pubsub_self_test(&self) -> Result<Option<bool>> {
        self.broker.pubsub_self_test().await
    }
}
