//! In-process work item store.
//!
//! Same contract as the Postgres store, backed by a map behind a lock.
//! Outage switches let tests exercise the persistence-failure paths.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{NewWorkItem, State, WorkFilter, WorkId, WorkItem};
use crate::telemetry::metrics;

#[derive(Default)]
struct Inner {
    items: HashMap<WorkId, WorkItem>,
    unavailable: bool,
    failing_targets: HashSet<State>,
    failing_reads: u32,
}

/// Map-backed store for tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the whole store going down (or coming back).
    pub async fn set_available(&self, available: bool) {
        self.inner.write().await.unavailable = !available;
    }

    /// Make every transition into `to` fail with a persistence error.
    pub async fn fail_transitions_to(&self, to: State) {
        self.inner.write().await.failing_targets.insert(to);
    }

    /// Make the next `n` calls to `get` fail with a persistence error.
    pub async fn fail_next_reads(&self, n: u32) {
        self.inner.write().await.failing_reads = n;
    }

    pub async fn clear_faults(&self) {
        let mut inner = self.inner.write().await;
        inner.unavailable = false;
        inner.failing_targets.clear();
        inner.failing_reads = 0;
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn unavailable() -> Error {
    Error::Persistence("memory store offline".to_string())
}

#[async_trait]
impl super::WorkStore for MemoryStore {
    async fn create(&self, new: NewWorkItem) -> Result<WorkItem> {
        let mut inner = self.inner.write().await;
        if inner.unavailable {
            return Err(unavailable());
        }

        let now = Utc::now();
        let item = WorkItem {
            id: WorkId::new(),
            kind: new.kind,
            state: State::Created,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        inner.items.insert(item.id, item.clone());
        debug!(id = %item.id, kind = %item.kind, "work item created");
        Ok(item)
    }

    async fn get(&self, id: WorkId) -> Result<WorkItem> {
        let mut inner = self.inner.write().await;
        if inner.unavailable {
            return Err(unavailable());
        }
        if inner.failing_reads > 0 {
            inner.failing_reads -= 1;
            return Err(unavailable());
        }
        inner.items.get(&id).cloned().ok_or(Error::NotFound(id))
    }

    async fn transition(&self, id: WorkId, expected: State, to: State) -> Result<WorkItem> {
        if !expected.can_transition_to(to) {
            return Err(Error::InvalidTransition { from: expected, to });
        }

        let mut inner = self.inner.write().await;
        if inner.unavailable || inner.failing_targets.contains(&to) {
            return Err(unavailable());
        }

        let item = inner.items.get_mut(&id).ok_or(Error::NotFound(id))?;
        if item.state != expected {
            return Err(Error::StateConflict {
                id,
                expected,
                actual: item.state,
            });
        }

        item.state = to;
        item.updated_at = item.updated_at.max(Utc::now());

        metrics::work_state_transitions().add(1, &metrics::transition_labels(expected, to));
        Ok(item.clone())
    }

    async fn list(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>> {
        let inner = self.inner.read().await;
        if inner.unavailable {
            return Err(unavailable());
        }
        let mut items: Vec<WorkItem> = inner
            .items
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(filter.limit);
        Ok(items)
    }

    async fn ping(&self) -> Result<()> {
        if self.inner.read().await.unavailable {
            return Err(unavailable());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorkStore;

    #[tokio::test]
    async fn transition_is_conditional() {
        let store = MemoryStore::new();
        let item = store.create(NewWorkItem::new("T")).await.unwrap();

        store
            .transition(item.id, State::Created, State::Processing)
            .await
            .unwrap();
        let err = store
            .transition(item.id, State::Created, State::Processing)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::StateConflict {
                actual: State::Processing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn updated_at_never_goes_backwards() {
        let store = MemoryStore::new();
        let item = store.create(NewWorkItem::new("T")).await.unwrap();
        let claimed = store
            .transition(item.id, State::Created, State::Processing)
            .await
            .unwrap();
        let done = store
            .transition(item.id, State::Processing, State::Completed)
            .await
            .unwrap();
        assert!(claimed.updated_at >= item.updated_at);
        assert!(done.updated_at >= claimed.updated_at);
        assert_eq!(done.created_at, item.created_at);
    }

    #[tokio::test]
    async fn outage_blocks_reads_and_writes() {
        let store = MemoryStore::new();
        let item = store.create(NewWorkItem::new("T")).await.unwrap();
        store.set_available(false).await;
        assert!(store.get(item.id).await.unwrap_err().is_persistence());
        assert!(store.create(NewWorkItem::new("U")).await.is_err());
        store.set_available(true).await;
        assert_eq!(store.get(item.id).await.unwrap().state, State::Created);
    }

    #[tokio::test]
    async fn read_faults_are_counted_and_clearable() {
        let store = MemoryStore::new();
        let item = store.create(NewWorkItem::new("T")).await.unwrap();
        store.fail_next_reads(1).await;
        assert!(store.get(item.id).await.unwrap_err().is_persistence());
        assert!(store.get(item.id).await.is_ok());

        store.fail_next_reads(5).await;
        store.fail_transitions_to(State::Processing).await;
        store.clear_faults().await;
        assert!(store.get(item.id).await.is_ok());
        assert!(
            store
                .transition(item.id, State::Created, State::Processing)
                .await
                .is_ok()
        );
    }
}
