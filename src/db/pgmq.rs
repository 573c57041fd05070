//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read_with_poll,
//! pgmq.archive, pgmq.delete, pgmq.set_vt.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::broker::{Broker, Delivery, Envelope, MessageId, deadline_after};
use crate::error::{Error, Result};
use crate::model::WorkId;

/// A message read from a pgmq queue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

/// Connection-level failures are "broker unavailable" (and retried);
/// anything else is a real database error.
fn broker_error(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::BrokerUnavailable(e.to_string()),
        other => Error::Database(other),
    }
}

fn whole_seconds(d: Duration) -> i32 {
    i32::try_from(d.as_secs()).unwrap_or(i32::MAX)
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Version of the installed pgmq extension, if any.
    pub async fn pgmq_version(&self) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT extversion FROM pg_extension WHERE extname = 'pgmq'")
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|r| r.0))
    }
}

/// pgmq-backed broker. Messages are `{"work_item_id": "<uuid>"}`.
pub struct PgmqBroker {
    pool: PgPool,
    queue: String,
    visibility_timeout: Duration,
}

impl PgmqBroker {
    pub fn new(pool: PgPool, queue: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            queue: queue.into(),
            visibility_timeout,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn to_delivery(&self, msg: PgmqMessage) -> Result<Delivery> {
        let envelope: Envelope = serde_json::from_value(msg.message).map_err(|e| {
            Error::Other(format!("bad pgmq payload on msg {}: {e}", msg.msg_id))
        })?;
        Ok(Delivery {
            msg_id: MessageId(msg.msg_id),
            work_id: envelope.work_item_id,
            read_count: u32::try_from(msg.read_ct).unwrap_or(0),
            enqueued_at: msg.enqueued_at,
            visible_until: msg.vt,
        })
    }

    async fn archive(&self, msg_id: i64) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT pgmq.archive($1, $2)")
            .bind(&self.queue)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await
            .map_err(broker_error)?;
        Ok(row.0)
    }
}

#[async_trait]
impl Broker for PgmqBroker {
    async fn enqueue(&self, work_id: WorkId) -> Result<MessageId> {
        let payload = serde_json::to_value(Envelope {
            work_item_id: work_id,
        })
        .map_err(|e| Error::Other(format!("serialize envelope: {e}")))?;

        let row: (i64,) = sqlx::query_as("SELECT * FROM pgmq.send($1, $2, $3)")
            .bind(&self.queue)
            .bind(&payload)
            .bind(0i32)
            .fetch_one(&self.pool)
            .await
            .map_err(broker_error)?;
        debug!(queue = %self.queue, msg_id = row.0, work_id = %work_id, "message sent");
        Ok(MessageId(row.0))
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let vt = whole_seconds(self.visibility_timeout).max(1);
        let poll_seconds = whole_seconds(timeout);

        let msg = if poll_seconds == 0 {
            sqlx::query_as::<_, PgmqMessage>(
                "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)",
            )
            .bind(&self.queue)
            .bind(vt)
            .fetch_optional(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, PgmqMessage>(
                "SELECT msg_id, read_ct, enqueued_at, vt, message
                 FROM pgmq.read_with_poll($1, $2, 1, $3, 100)",
            )
            .bind(&self.queue)
            .bind(vt)
            .bind(poll_seconds)
            .fetch_optional(&self.pool)
            .await
        }
        .map_err(broker_error)?;

        let Some(msg) = msg else {
            return Ok(None);
        };
        let msg_id = msg.msg_id;
        match self.to_delivery(msg) {
            Ok(delivery) => Ok(Some(delivery)),
            // Undecodable bodies would otherwise come back every visibility timeout.
            Err(e) => {
                warn!(queue = %self.queue, msg_id, error = %e, "archiving undecodable message");
                self.archive(msg_id).await?;
                Ok(None)
            }
        }
    }

    /// Archive rather than delete: acked messages are kept for audit.
    async fn ack(&self, delivery: &Delivery) -> Result<bool> {
        self.archive(delivery.msg_id.0).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        if requeue {
            sqlx::query("SELECT * FROM pgmq.set_vt($1, $2, 0)")
                .bind(&self.queue)
                .bind(delivery.msg_id.0)
                .execute(&self.pool)
                .await
                .map_err(broker_error)?;
        } else {
            sqlx::query("SELECT pgmq.delete($1, $2)")
                .bind(&self.queue)
                .bind(delivery.msg_id.0)
                .execute(&self.pool)
                .await
                .map_err(broker_error)?;
        }
        Ok(())
    }

    async fn extend(&self, delivery: &Delivery, by: Duration) -> Result<bool> {
        let rows = sqlx::query("SELECT * FROM pgmq.set_vt($1, $2, $3)")
            .bind(&self.queue)
            .bind(delivery.msg_id.0)
            .bind(whole_seconds(by).max(1))
            .fetch_all(&self.pool)
            .await
            .map_err(broker_error)?;
        debug!(
            msg_id = %delivery.msg_id,
            until = %deadline_after(by),
            "visibility extended"
        );
        Ok(!rows.is_empty())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn server_version(&self) -> Result<Option<String>> {
        let server: (String,) = sqlx::query_as("SHOW server_version")
            .fetch_one(&self.pool)
            .await
            .map_err(broker_error)?;
        let pgmq: Option<(String,)> =
            sqlx::query_as("SELECT extversion FROM pg_extension WHERE extname = 'pgmq'")
                .fetch_optional(&self.pool)
                .await
                .map_err(broker_error)?;
        Ok(Some(match pgmq {
            Some((v,)) => format!("postgres {} / pgmq {v}", server.0),
            None => format!("postgres {} / pgmq missing", server.0),
        }))
    }

    /// LISTEN on a throwaway channel and NOTIFY it. Touches no tables.
    async fn pubsub_self_test(&self) -> Result<Option<bool>> {
        let channel = format!("projectq_probe_{}", uuid::Uuid::new_v4().simple());
        let mut listener = sqlx::postgres::PgListener::connect_with(&self.pool)
            .await
            .map_err(broker_error)?;
        listener.listen(&channel).await.map_err(broker_error)?;

        sqlx::query("SELECT pg_notify($1, 'probe')")
            .bind(&channel)
            .execute(&self.pool)
            .await
            .map_err(broker_error)?;

        let got = tokio::time::timeout(Duration::from_secs(1), listener.recv()).await;
        Ok(Some(matches!(got, Ok(Ok(ref n)) if n.channel() == channel)))
    }
}
