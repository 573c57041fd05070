//! Work item persistence: create, fetch, conditional transition, list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::*;
use crate::store::WorkStore;
use crate::telemetry::metrics;

const COLUMNS: &str = "id, kind, state, topic, notes, name, created_at, updated_at";

#[async_trait]
impl WorkStore for super::Db {
    async fn create(&self, new: NewWorkItem) -> Result<WorkItem> {
        let id = WorkId::new();
        let row: WorkItemRow = sqlx::query_as(&format!(
            "INSERT INTO work_items (id, kind, state, topic, notes, name, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, now(), now())
             RETURNING {COLUMNS}"
        ))
        .bind(id.0)
        .bind(&new.kind)
        .bind(State::Created.as_str())
        .bind(&new.metadata.topic)
        .bind(&new.metadata.notes)
        .bind(&new.metadata.name)
        .fetch_one(self.pool())
        .await?;

        row.try_into_work_item()
    }

    async fn get(&self, id: WorkId) -> Result<WorkItem> {
        let row: Option<WorkItemRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM work_items WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or(Error::NotFound(id))?.try_into_work_item()
    }

    /// Optimistic concurrency: the `state = $3` guard is the only lock.
    async fn transition(&self, id: WorkId, expected: State, to: State) -> Result<WorkItem> {
        if !expected.can_transition_to(to) {
            return Err(Error::InvalidTransition { from: expected, to });
        }

        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items SET state = $1, updated_at = GREATEST(now(), updated_at)
             WHERE id = $2 AND state = $3
             RETURNING {COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(id.0)
        .bind(expected.as_str())
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            // Lost the race or the row is gone; find out which.
            let current: Option<(String,)> =
                sqlx::query_as("SELECT state FROM work_items WHERE id = $1")
                    .bind(id.0)
                    .fetch_optional(self.pool())
                    .await?;
            return match current {
                None => Err(Error::NotFound(id)),
                Some((state,)) => Err(Error::StateConflict {
                    id,
                    expected,
                    actual: state.parse()?,
                }),
            };
        };

        metrics::work_state_transitions().add(1, &metrics::transition_labels(expected, to));
        row.try_into_work_item()
    }

    async fn list(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM work_items
             WHERE ($1::text IS NULL OR state = $1)
               AND ($2::text IS NULL OR kind = $2)
             ORDER BY created_at DESC
             LIMIT $3"
        ))
        .bind(filter.state.map(State::as_str))
        .bind(filter.kind.as_deref())
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        self.health_check().await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    kind: String,
    state: String,
    topic: String,
    notes: Option<String>,
    name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkItemRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: WorkId(self.id),
            kind: self.kind,
            state: self.state.parse()?,
            metadata: Metadata {
                topic: self.topic,
                notes: self.notes,
                name: self.name,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
