//! Broker and store health probe.
//!
//! Read-only: the probe pings, asks for versions and round-trips a pub/sub
//! message on a throwaway channel. It never reads or writes work items or
//! queue messages.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::broker::BrokerClient;
use crate::store::WorkStore;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Broker answered a ping.
    pub reachable: bool,
    /// Ping round-trip, serialized as milliseconds.
    #[serde(rename = "latency_ms", serialize_with = "as_millis")]
    pub latency: Option<Duration>,
    pub server_version: Option<String>,
    /// Free-form findings, one per failed or skipped check.
    pub diagnostics: Vec<String>,
    pub store_reachable: bool,
    pub queue: String,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.reachable && self.store_reachable
    }
}

fn as_millis<S: Serializer>(latency: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match latency {
        Some(d) => s.serialize_some(&(d.as_secs_f64() * 1000.0)),
        None => s.serialize_none(),
    }
}

/// Probe the broker and the store. Failures are reported in the result,
/// never returned as errors.
pub async fn check(broker: &BrokerClient, store: &dyn WorkStore) -> HealthReport {
    let mut diagnostics = Vec::new();

    let start = Instant::now();
    let (reachable, latency) = match broker.ping().await {
        Ok(()) => (true, Some(start.elapsed())),
        Err(e) => {
            diagnostics.push(format!("broker ping failed: {e}"));
            (false, None)
        }
    };

    let mut server_version = None;
    if reachable {
        match broker.server_version().await {
            Ok(v) => server_version = v,
            Err(e) => diagnostics.push(format!("server version unavailable: {e}")),
        }

        match broker.pubsub_self_test().await {
            Ok(Some(true)) => debug!("pub/sub self-test passed"),
            Ok(Some(false)) => diagnostics.push("pub/sub self-test: message not received".into()),
            Ok(None) => diagnostics.push("pub/sub self-test not supported".into()),
            Err(e) => diagnostics.push(format!("pub/sub self-test failed: {e}")),
        }
    }

    let store_reachable = match store.ping().await {
        Ok(()) => true,
        Err(e) => {
            diagnostics.push(format!("store ping failed: {e}"));
            false
        }
    };

    let report = HealthReport {
        reachable,
        latency,
        server_version,
        diagnostics,
        store_reachable,
        queue: broker.queue().to_string(),
        checked_at: Utc::now(),
    };
    if !report.is_healthy() {
        warn!(
            broker = report.reachable,
            store = report.store_reachable,
            "health check failed"
        );
    }
    report
}
