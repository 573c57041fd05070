//! Hook handler: perform a work item by running an external executable.
//!
//! Each run gets a fresh working directory holding `work.json` (the item).
//! The hook sees `PROJECTQ_WORK_ID`, `PROJECTQ_KIND` and `PROJECTQ_WORK_DIR`.
//! Exit status 0 is success; anything else fails the item.

use crate::error::{Error, Result};
use crate::model::WorkItem;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::Handler;

pub struct HookHandler {
    command: PathBuf,
    base_dir: PathBuf,
}

impl HookHandler {
    pub fn new(command: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            base_dir: base_dir.into(),
        }
    }

    /// Make the working directory and write work.json.
    async fn prepare(&self, item: &WorkItem) -> Result<PathBuf> {
        let dir = self.base_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let work_json = serde_json::to_string_pretty(item)
            .map_err(|e| Error::Other(format!("serialize work item: {e}")))?;
        tokio::fs::write(dir.join("work.json"), work_json).await?;

        debug!(id = %item.id, dir = %dir.display(), "hook dir prepared");
        Ok(dir)
    }

    async fn run(&self, item: &WorkItem, dir: &Path) -> Result<()> {
        // Relative commands resolve against the process CWD, not the work dir.
        let command = if self.command.is_relative() {
            std::env::current_dir()?.join(&self.command)
        } else {
            self.command.clone()
        };

        let status = Command::new(&command)
            .current_dir(dir)
            .env("PROJECTQ_WORK_DIR", dir)
            .env("PROJECTQ_WORK_ID", item.id.to_string())
            .env("PROJECTQ_KIND", &item.kind)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| Error::WorkFailure(format!("spawn {}: {e}", command.display())))?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::WorkFailure(format!(
                "hook {} exited with status {}",
                command.display(),
                status.code().unwrap_or(-1)
            )))
        }
    }
}

#[async_trait]
impl Handler for HookHandler {
    async fn perform(&self, item: &WorkItem) -> Result<()> {
        let start = Instant::now();
        let dir = self.prepare(item).await?;
        let result = self.run(item, &dir).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => info!(id = %item.id, duration_ms, "hook completed"),
            Err(e) => warn!(id = %item.id, duration_ms, error = %e, "hook failed"),
        }

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(dir = %dir.display(), "cleanup error: {e}");
        }
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::{Metadata, State, WorkId};
    use chrono::Utc;

    fn item() -> WorkItem {
        WorkItem {
            id: WorkId::new(),
            kind: "project".to_string(),
            state: State::Processing,
            metadata: Metadata {
                topic: "T".to_string(),
                ..Default::default()
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn base() -> PathBuf {
        std::env::temp_dir()
            .join("projectq-hook-test")
            .join(Uuid::new_v4().to_string())
    }

    #[tokio::test]
    async fn zero_exit_is_success_and_dir_is_removed() {
        let base = base();
        let hook = HookHandler::new("/bin/true", &base);
        hook.perform(&item()).await.unwrap();
        let leftover = std::fs::read_dir(&base).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn non_zero_exit_is_work_failure() {
        let hook = HookHandler::new("/bin/false", base());
        let err = hook.perform(&item()).await.unwrap_err();
        assert!(matches!(err, Error::WorkFailure(_)));
    }

    #[tokio::test]
    async fn missing_executable_is_work_failure() {
        let hook = HookHandler::new("/nonexistent/projectq-hook", base());
        let err = hook.perform(&item()).await.unwrap_err();
        assert!(matches!(err, Error::WorkFailure(_)));
    }
}
