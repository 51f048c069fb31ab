//! Fault-injection boundary used by external drills. Injection itself is
//! driven by the orchestrator; this module holds the scenario vocabulary,
//! the recovery stopwatch and the bounded result log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::Result;
use crate::maintenance::Resource;
use crate::storage::{load_document, save_document, StateStore, CHAOS_RESULTS_KEY};

const RESULTS_CAP: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChaosScenario {
    AgentCrash,
    Latency { millis: u64 },
    ResourcePressure { resource: Resource },
}

impl fmt::Display for ChaosScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChaosScenario::AgentCrash => f.write_str("agent_crash"),
            ChaosScenario::Latency { millis } => write!(f, "latency({}ms)", millis),
            ChaosScenario::ResourcePressure { resource } => write!(f, "resource_pressure({})", resource),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosResult {
    pub scenario: ChaosScenario,
    pub agent: String,
    pub injected_at: DateTime<Utc>,
    pub recovered: bool,
    pub recovery_seconds: f64,
    pub rto_seconds: f64,
    pub within_rto: bool,
    pub detail: String,
}

impl ChaosResult {
    pub fn new(
        scenario: ChaosScenario,
        agent: &str,
        injected_at: DateTime<Utc>,
        recovery: Option<Duration>,
        rto: Duration,
        max_wait: Duration,
        detail: impl Into<String>,
    ) -> Self {
        let recovered = recovery.is_some();
        let recovery_seconds = recovery.unwrap_or(max_wait).as_secs_f64();
        Self {
            scenario,
            agent: agent.to_string(),
            injected_at,
            recovered,
            recovery_seconds,
            rto_seconds: rto.as_secs_f64(),
            within_rto: recovered && recovery_seconds <= rto.as_secs_f64(),
            detail: detail.into(),
        }
    }
}

/// Calls `probe` every `interval` until it reports recovery or `max_wait`
/// has passed. Returns the time from the call to the successful probe.
pub async fn measure_recovery<F, Fut>(interval: Duration, max_wait: Duration, mut probe: F) -> Option<Duration>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    loop {
        if probe().await {
            return Some(started.elapsed());
        }
        if started.elapsed() + interval > max_wait {
            return None;
        }
        tokio::time::sleep(interval).await;
    }
}

pub struct ChaosLog {
    results: Mutex<VecDeque<ChaosResult>>,
    store: Arc<dyn StateStore>,
}

impl ChaosLog {
    pub async fn load(store: Arc<dyn StateStore>) -> Self {
        let results = match load_document::<VecDeque<ChaosResult>>(store.as_ref(), CHAOS_RESULTS_KEY).await {
            Ok(Some(results)) => results,
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!("Starting without chaos results: {}", e);
                VecDeque::new()
            }
        };
        Self {
            results: Mutex::new(results),
            store,
        }
    }

    pub async fn record(&self, result: ChaosResult) {
        info!(
            agent = %result.agent,
            scenario = %result.scenario,
            "Chaos drill finished: recovered={} in {:.1}s (RTO {:.0}s)",
            result.recovered,
            result.recovery_seconds,
            result.rto_seconds
        );
        let mut results = self.results.lock().await;
        results.push_back(result);
        while results.len() > RESULTS_CAP {
            results.pop_front();
        }
        if let Err(e) = save_document(self.store.as_ref(), CHAOS_RESULTS_KEY, &*results).await {
            warn!("Failed to persist chaos results: {}", e);
        }
    }

    pub async fn results(&self, limit: usize) -> Vec<ChaosResult> {
        self.results.lock().await.iter().rev().take(limit).cloned().collect()
    }

    pub async fn flush(&self) -> Result<()> {
        let results = self.results.lock().await;
        save_document(self.store.as_ref(), CHAOS_RESULTS_KEY, &*results).await
    }
}
