//! Handler registry.
//!
//! A handler is the pluggable business logic behind one work kind. The
//! registry is built once at startup and shared read-only by every worker.

use crate::error::{Error, Result};
use crate::model::WorkItem;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::hook::HookHandler;

/// Performs the actual work for an item. `Err` means the work failed and
/// the item ends in ERROR.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn perform(&self, item: &WorkItem) -> Result<()>;
}

/// Closure-backed handler, see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(WorkItem) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn perform(&self, item: &WorkItem) -> Result<()> {
        (self.f)(item.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Always succeeds. Useful to check the pipeline end to end.
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn perform(&self, item: &WorkItem) -> Result<()> {
        info!(
            id = %item.id,
            kind = %item.kind,
            topic = %item.metadata.topic,
            "echo handler"
        );
        Ok(())
    }
}

/// Registry of handlers, indexed by work kind.
#[derive(Default, Clone)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Registry {
    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, kind: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Build from `kind=target` specs. `target` is `echo` or a path to an
    /// executable run as a [`HookHandler`] under `work_base`.
    pub fn from_specs(specs: &[String], work_base: &Path) -> Result<Self> {
        let mut registry = Self::empty();
        for spec in specs {
            let (kind, target) = spec.split_once('=').ok_or_else(|| {
                Error::Config(format!("handler spec '{spec}' is not of the form kind=target"))
            })?;
            let (kind, target) = (kind.trim(), target.trim());
            if kind.is_empty() || target.is_empty() {
                return Err(Error::Config(format!("handler spec '{spec}' is incomplete")));
            }
            let handler: Arc<dyn Handler> = if target == "echo" {
                Arc::new(EchoHandler)
            } else {
                Arc::new(HookHandler::new(target, work_base))
            };
            registry.register(kind, handler);
        }
        Ok(registry)
    }

    /// Look up a handler by kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handler_specs() {
        let specs = vec!["project=echo".to_string(), "render = ./hooks/render.sh".to_string()];
        let registry = Registry::from_specs(&specs, Path::new("/tmp")).unwrap();
        assert_eq!(registry.kinds(), vec!["project", "render"]);
    }

    #[test]
    fn rejects_malformed_specs() {
        let bad = vec!["project".to_string()];
        assert!(matches!(
            Registry::from_specs(&bad, Path::new("/tmp")),
            Err(Error::Config(_))
        ));
        let empty = vec!["=echo".to_string()];
        assert!(Registry::from_specs(&empty, Path::new("/tmp")).is_err());
    }
}
