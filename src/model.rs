//! Core data model.
//!
//! A work item is a submitted project moving through a fixed lifecycle:
//! CREATED → PROCESSING → COMPLETED | ERROR. The caller's metadata rides
//! along untouched; the engine only cares about identity, kind and state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Kind used when the submitter does not name one.
pub const DEFAULT_KIND: &str = "project";

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier.
    pub id: WorkId,

    /// Which registered handler performs this item.
    pub kind: String,

    /// Current lifecycle state.
    pub state: State,

    /// Caller-owned fields. The engine doesn't interpret these.
    pub metadata: Metadata,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(WorkId)
            .map_err(|e| Error::Other(format!("invalid work id '{s}': {e}")))
    }
}

/// Opaque submitter fields (topic, notes and the name set later by processing).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub topic: String,
    pub notes: Option<String>,
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Persisted, waiting for a worker.
    Created,
    /// Claimed by an executor, handler running.
    Processing,
    /// Handler succeeded. Terminal.
    Completed,
    /// Handler failed or could not be run. Terminal.
    Error,
}

impl State {
    pub const ALL: [State; 4] = [
        State::Created,
        State::Processing,
        State::Completed,
        State::Error,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Created, Processing) | (Processing, Completed) | (Processing, Error)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Created => "CREATED",
            State::Processing => "PROCESSING",
            State::Completed => "COMPLETED",
            State::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(State::Created),
            "PROCESSING" => Ok(State::Processing),
            "COMPLETED" => Ok(State::Completed),
            "ERROR" => Ok(State::Error),
            _ => Err(Error::Other(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for creating new work items. The engine's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub(crate) kind: String,
    pub(crate) metadata: Metadata,
}

impl NewWorkItem {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            kind: DEFAULT_KIND.to_string(),
            metadata: Metadata {
                topic: topic.into(),
                notes: None,
                name: None,
            },
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.metadata.notes = Some(notes.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.metadata.name = Some(name.into());
        self
    }

    pub fn work_kind(&self) -> &str {
        &self.kind
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Query filter for listing work items. Newest first.
#[derive(Debug, Clone)]
pub struct WorkFilter {
    pub state: Option<State>,
    pub kind: Option<String>,
    pub limit: usize,
}

impl Default for WorkFilter {
    fn default() -> Self {
        Self {
            state: None,
            kind: None,
            limit: 100,
        }
    }
}

impl WorkFilter {
    pub fn state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        self.state.is_none_or(|s| s == item.state)
            && self.kind.as_deref().is_none_or(|k| k == item.kind)
    }
}
