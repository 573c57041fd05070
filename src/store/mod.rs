//! Work item store: the single source of truth for item state.
//!
//! `transition` is the only sanctioned way to change state. It is a
//! conditional update, so two executors racing on the same item cannot
//! both win.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{NewWorkItem, State, WorkFilter, WorkId, WorkItem};

pub use memory::MemoryStore;

#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Insert a new item in state CREATED with a fresh id and timestamps.
    async fn create(&self, new: NewWorkItem) -> Result<WorkItem>;

    /// Fetch an item by id, `Error::NotFound` if absent.
    async fn get(&self, id: WorkId) -> Result<WorkItem>;

    /// Move `id` from `expected` to `to`.
    ///
    /// Fails with `InvalidTransition` if the pair is not in the state
    /// machine, `NotFound` if the row is gone, and `StateConflict` if the
    /// persisted state is not `expected`.
    async fn transition(&self, id: WorkId, expected: State, to: State) -> Result<WorkItem>;

    async fn list(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;
}
