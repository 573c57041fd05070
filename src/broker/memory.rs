//! In-process broker with pgmq-style visibility timeouts.
//!
//! A received message stays in the queue, invisible until its deadline.
//! Ack removes it; if nobody acks, it becomes visible again with a higher
//! read count. Fault switches simulate broker outages for tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;
use tracing::debug;

use super::{Broker, Delivery, MessageId};
use crate::error::{Error, Result};
use crate::model::WorkId;

struct Message {
    work_id: WorkId,
    enqueued_at: DateTime<Utc>,
    visible_at: Instant,
    read_count: u32,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    messages: BTreeMap<i64, Message>,
    archived: Vec<MessageId>,
    dropped: Vec<MessageId>,
    unavailable: bool,
    failures_pending: u32,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            Err(Error::BrokerUnavailable("memory broker offline".to_string()))
        } else {
            Ok(())
        }
    }

    /// Availability check that also consumes one injected failure.
    fn check_op(&mut self) -> Result<()> {
        self.check_available()?;
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(Error::BrokerUnavailable(
                "memory broker: injected failure".to_string(),
            ));
        }
        Ok(())
    }
}

/// Queue for tests and local development.
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    notify: Notify,
    visibility_timeout: Duration,
    pubsub: broadcast::Sender<String>,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        let (pubsub, _) = broadcast::channel(16);
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Default::default()
            }),
            notify: Notify::new(),
            visibility_timeout,
            pubsub,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Simulate the broker going down (or coming back).
    pub async fn set_available(&self, available: bool) {
        self.inner.lock().await.unavailable = !available;
    }

    /// Fail the next `n` enqueue/ack/nack/extend calls.
    pub async fn fail_next(&self, n: u32) {
        self.inner.lock().await.failures_pending = n;
    }

    /// Messages still in the queue, visible or not.
    pub async fn pending(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    pub async fn archived(&self) -> Vec<MessageId> {
        self.inner.lock().await.archived.clone()
    }

    pub async fn dropped(&self) -> Vec<MessageId> {
        self.inner.lock().await.dropped.clone()
    }
}

/// `now + d`, saturating at a far-future instant instead of overflowing.
fn instant_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

fn delivery(id: i64, msg: &Message, visible_for: Duration) -> Delivery {
    Delivery {
        msg_id: MessageId(id),
        work_id: msg.work_id,
        read_count: msg.read_count,
        enqueued_at: msg.enqueued_at,
        visible_until: super::deadline_after(visible_for),
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, work_id: WorkId) -> Result<MessageId> {
        let id = {
            let mut inner = self.inner.lock().await;
            inner.check_op()?;
            let id = inner.next_id;
            inner.next_id += 1;
            inner.messages.insert(
                id,
                Message {
                    work_id,
                    enqueued_at: Utc::now(),
                    visible_at: Instant::now(),
                    read_count: 0,
                },
            );
            id
        };
        self.notify.notify_waiters();
        debug!(msg_id = id, work_id = %work_id, "message enqueued");
        Ok(MessageId(id))
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = instant_after(timeout);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visible = {
                let mut inner = self.inner.lock().await;
                inner.check_available()?;
                let now = Instant::now();
                if let Some((id, msg)) = inner
                    .messages
                    .iter_mut()
                    .find(|(_, m)| m.visible_at <= now)
                {
                    msg.visible_at = instant_after(self.visibility_timeout);
                    msg.read_count += 1;
                    return Ok(Some(delivery(*id, msg, self.visibility_timeout)));
                }
                inner.messages.values().map(|m| m.visible_at).min()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.check_op()?;
        let removed = inner.messages.remove(&delivery.msg_id.0).is_some();
        if removed {
            inner.archived.push(delivery.msg_id);
        }
        Ok(removed)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.check_op()?;
            if requeue {
                if let Some(msg) = inner.messages.get_mut(&delivery.msg_id.0) {
                    msg.visible_at = Instant::now();
                }
            } else if inner.messages.remove(&delivery.msg_id.0).is_some() {
                inner.dropped.push(delivery.msg_id);
            }
        }
        if requeue {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn extend(&self, delivery: &Delivery, by: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.check_op()?;
        match inner.messages.get_mut(&delivery.msg_id.0) {
            Some(msg) => {
                msg.visible_at = instant_after(by);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.inner.lock().await.check_available()
    }

    async fn server_version(&self) -> Result<Option<String>> {
        self.inner.lock().await.check_available()?;
        Ok(Some(format!("memory/{}", env!("CARGO_PKG_VERSION"))))
    }

    async fn pubsub_self_test(&self) -> Result<Option<bool>> {
        self.inner.lock().await.check_available()?;
        let mut rx = self.pubsub.subscribe();
        let probe = format!("probe-{}", uuid::Uuid::new_v4());
        if self.pubsub.send(probe.clone()).is_err() {
            return Ok(Some(false));
        }
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        Ok(Some(matches!(got, Ok(Ok(ref msg)) if *msg == probe)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_times_out_on_empty_queue() {
        let broker = MemoryBroker::new(Duration::from_secs(30));
        let got = broker.receive(Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn received_message_is_invisible_until_deadline() {
        let broker = MemoryBroker::new(Duration::from_millis(100));
        let work_id = WorkId::new();
        broker.enqueue(work_id).await.unwrap();

        let first = broker.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(first.work_id, work_id);
        assert_eq!(first.read_count, 1);
        assert!(!first.is_redelivery());

        // Still in flight: nothing visible.
        assert!(broker.receive(Duration::from_millis(20)).await.unwrap().is_none());

        // Deadline passes without an ack: redelivered.
        let second = broker.receive(Duration::from_millis(500)).await.unwrap().unwrap();
        assert_eq!(second.msg_id, first.msg_id);
        assert_eq!(second.read_count, 2);
        assert!(second.is_redelivery());
    }

    #[tokio::test]
    async fn second_ack_is_a_noop() {
        let broker = MemoryBroker::new(Duration::from_secs(30));
        broker.enqueue(WorkId::new()).await.unwrap();
        let d = broker.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(broker.ack(&d).await.unwrap());
        assert!(!broker.ack(&d).await.unwrap());
        assert_eq!(broker.pending().await, 0);
        assert_eq!(broker.archived().await, vec![d.msg_id]);
    }

    #[tokio::test]
    async fn nack_requeue_makes_message_visible_immediately() {
        let broker = MemoryBroker::new(Duration::from_secs(30));
        broker.enqueue(WorkId::new()).await.unwrap();
        let d = broker.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        broker.nack(&d, true).await.unwrap();
        let again = broker.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(again.msg_id, d.msg_id);

        broker.nack(&again, false).await.unwrap();
        assert_eq!(broker.pending().await, 0);
        assert_eq!(broker.dropped().await, vec![d.msg_id]);
    }

    #[tokio::test]
    async fn enqueue_wakes_waiting_receiver() {
        let broker = std::sync::Arc::new(MemoryBroker::new(Duration::from_secs(30)));
        let waiter = tokio::spawn({
            let broker = broker.clone();
            async move { broker.receive(Duration::from_secs(5)).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let work_id = WorkId::new();
        broker.enqueue(work_id).await.unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.work_id, work_id);
    }

    #[tokio::test]
    async fn unbounded_timeouts_saturate() {
        let broker = MemoryBroker::new(Duration::MAX);
        broker.enqueue(WorkId::new()).await.unwrap();
        let d = broker.receive(Duration::MAX).await.unwrap().unwrap();
        assert!(broker.extend(&d, Duration::MAX).await.unwrap());
        assert!(broker.receive(Duration::ZERO).await.unwrap().is_none());
        assert!(broker.ack(&d).await.unwrap());
    }

    #[tokio::test]
    async fn outage_reports_broker_unavailable() {
        let broker = MemoryBroker::new(Duration::from_secs(30));
        broker.set_available(false).await;
        assert!(broker.enqueue(WorkId::new()).await.unwrap_err().is_broker_unavailable());
        assert!(broker.ping().await.is_err());
        broker.set_available(true).await;
        assert!(broker.ping().await.is_ok());
        assert_eq!(broker.pubsub_self_test().await.unwrap(), Some(true));
    }
}
