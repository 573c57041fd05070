//! Shared in-memory fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use projectq::broker::{BrokerClient, MemoryBroker};
use projectq::engine::{
    Engine, EngineConfig, ExecutorConfig, Handler, Registry, WorkerConfig, handler_fn,
};
use projectq::error::{Error, Result};
use projectq::model::WorkItem;
use projectq::retry::RetryPolicy;
use projectq::store::MemoryStore;

pub const QUEUE: &str = "projects";

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub broker: Arc<MemoryBroker>,
    pub engine: Engine,
}

pub fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::exponential(attempts, Duration::from_millis(1), Duration::from_millis(5))
}

pub fn harness(registry: Registry) -> Harness {
    harness_with(registry, Duration::from_secs(30), EngineConfig::default())
}

pub fn harness_with(registry: Registry, visibility: Duration, config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new(visibility));
    let client = BrokerClient::new(broker.clone(), QUEUE, fast_retry(3));
    let engine = Engine::new(
        store.clone(),
        client,
        registry,
        EngineConfig {
            read_retry: fast_retry(3),
            ..config
        },
    );
    Harness {
        store,
        broker,
        engine,
    }
}

impl Harness {
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            visibility_timeout: self.broker.visibility_timeout(),
            heartbeat: false,
            time_limit: None,
            read_retry: fast_retry(3),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: 2,
            receive_timeout: Duration::from_millis(100),
            idle_backoff: Duration::from_millis(10),
        }
    }
}

/// Handler that counts calls and succeeds.
pub fn counting(calls: Arc<AtomicU32>) -> Arc<dyn Handler> {
    handler_fn(move |_item| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

/// Handler that counts calls and sleeps before succeeding.
pub fn slow(calls: Arc<AtomicU32>, delay: Duration) -> Arc<dyn Handler> {
    handler_fn(move |_item| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(())
        }
    })
}

/// Handler that never returns.
pub fn stuck() -> Arc<dyn Handler> {
    handler_fn(|_item| async {
        std::future::pending::<()>().await;
        Ok(())
    })
}

pub fn failing() -> Arc<dyn Handler> {
    handler_fn(|_item| async { Err::<(), _>(Error::WorkFailure("boom".to_string())) })
}

pub struct Panicking;

#[async_trait]
impl Handler for Panicking {
    async fn perform(&self, _item: &WorkItem) -> Result<()> {
        panic!("handler exploded")
    }
}
