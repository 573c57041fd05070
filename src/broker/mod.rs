//! Delivery queue between submission and the worker pool.
//!
//! Messages carry only a work item id; state lives in the store. Delivery
//! is at-least-once: a delivery that is neither acked nor nacked before
//! its visibility deadline becomes visible again and is handed to another
//! worker. That redelivery is the only recovery for a worker that dies
//! mid-item.

pub mod client;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::WorkId;

pub use client::BrokerClient;
pub use memory::MemoryBroker;

/// Broker-assigned message id, returned by `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One delivery attempt of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub msg_id: MessageId,
    pub work_id: WorkId,
    /// 1 on first delivery, incremented on every redelivery.
    pub read_count: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Visibility deadline. Past this, the message is redelivered.
    pub visible_until: DateTime<Utc>,
}

impl Delivery {
    /// Has this message been handed out before (and not acked)?
    pub fn is_redelivery(&self) -> bool {
        self.read_count > 1
    }
}

/// Message body on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub work_item_id: WorkId,
}

/// Wall-clock deadline `d` from now, saturating at now on overflow.
pub(crate) fn deadline_after(d: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

/// Raw queue transport. Implementations report connectivity problems as
/// `Error::BrokerUnavailable`; retrying is `BrokerClient`'s job.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, work_id: WorkId) -> Result<MessageId>;

    /// Wait up to `timeout` for a visible message. `None` on timeout.
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>>;

    /// Remove the message for good. `false` if it was already gone.
    async fn ack(&self, delivery: &Delivery) -> Result<bool>;

    /// Give the message back (`requeue`) or drop it.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

    /// Push the visibility deadline out to now + `by`. `false` if the message is gone.
    async fn extend(&self, delivery: &Delivery, by: Duration) -> Result<bool>;

    /// Connectivity round-trip.
    async fn ping(&self) -> Result<()>;

    async fn server_version(&self) -> Result<Option<String>>;

    /// Publish/subscribe round-trip on a throwaway channel. `None` when the
    /// transport has no pub/sub.
    async fn pubsub_self_test(&self) -> Result<Option<bool>> {
        Ok(None)
    }
}
