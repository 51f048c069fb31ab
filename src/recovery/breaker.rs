//! Per (agent, fix) circuit breaker.
//!
//! `Closed` admits everything. After `threshold` consecutive failures the
//! breaker opens and rejects attempts until its cooldown has elapsed since the
//! last attempt; then exactly one probe is admitted (`HalfOpen`). A successful
//! probe closes it, a failed one reopens it and restarts the cooldown.
//! `RestartAgent` breakers that reach the restart cap latch open until an
//! operator resets them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{seconds_between, Clock};
use crate::error::Result;
use crate::recovery::FixType;
use crate::storage::{load_document, save_document, StateStore, BREAKERS_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub cooldown_seconds: f64,
    /// Set once the restart cap is hit; only an explicit reset clears it.
    #[serde(default)]
    pub latched: bool,
}

impl CircuitBreakerState {
    fn closed(cooldown_seconds: f64) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_attempt_at: None,
            cooldown_seconds,
            latched: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial after cooldown.
    Probe,
    /// `retry_after` is `None` while latched.
    Rejected { retry_after: Option<Duration> },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerTransition {
    None,
    Opened,
    Reopened,
    Closed,
    Latched,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerEntry {
    pub agent: String,
    pub fix: FixType,
    #[serde(flatten)]
    pub breaker: CircuitBreakerState,
}

type BreakerKey = (String, FixType);

pub struct CircuitBreakers {
    entries: Mutex<BTreeMap<BreakerKey, CircuitBreakerState>>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
    threshold: u32,
    restart_cap: u32,
    default_cooldown_seconds: f64,
    dirty: AtomicBool,
}

impl CircuitBreakers {
    pub async fn load(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        threshold: u32,
        restart_cap: u32,
        default_cooldown_seconds: f64,
    ) -> Self {
        let mut entries = BTreeMap::new();
        match load_document::<Vec<BreakerEntry>>(store.as_ref(), BREAKERS_KEY).await {
            Ok(Some(saved)) => {
                for entry in saved {
                    let mut breaker = entry.breaker;
                    // a probe that was in flight when we stopped never reported back
                    if breaker.state == BreakerState::HalfOpen {
                        breaker.state = BreakerState::Open;
                    }
                    entries.insert((entry.agent, entry.fix), breaker);
                }
                info!("Loaded {} circuit breakers", entries.len());
            }
            Ok(None) => {}
            Err(e) => warn!("Starting with closed circuit breakers: {}", e),
        }

        Self {
            entries: Mutex::new(entries),
            clock,
            store,
            threshold: threshold.max(1),
            restart_cap: restart_cap.max(1),
            default_cooldown_seconds,
            dirty: AtomicBool::new(false),
        }
    }

    /// Decides whether `fix` may run for `agent` now. Moving an open breaker
    /// to half-open happens here, under the lock, so only one caller gets the probe.
    pub async fn try_acquire(&self, agent: &str, fix: FixType) -> Admission {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let Some(breaker) = entries.get_mut(&(agent.to_string(), fix)) else {
            return Admission::Allowed;
        };

        let admission = match breaker.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => Admission::Rejected {
                retry_after: Some(Duration::from_secs_f64(breaker.cooldown_seconds.max(0.0))),
            },
            BreakerState::Open if breaker.latched => Admission::Rejected { retry_after: None },
            BreakerState::Open => {
                let elapsed = breaker
                    .last_attempt_at
                    .map(|at| seconds_between(at, now))
                    .unwrap_or(f64::INFINITY);
                if elapsed >= breaker.cooldown_seconds {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.last_attempt_at = Some(now);
                    info!(agent, fix = %fix, "Circuit breaker half-open, admitting one probe");
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_after: Some(Duration::from_secs_f64(breaker.cooldown_seconds - elapsed)),
                    }
                }
            }
        };

        if admission == Admission::Probe {
            self.persist_locked(&entries).await;
        }
        admission
    }

    pub async fn record_success(&self, agent: &str, fix: FixType) -> BreakerTransition {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let breaker = entries
            .entry((agent.to_string(), fix))
            .or_insert_with(|| CircuitBreakerState::closed(self.default_cooldown_seconds));

        let transition = if breaker.state == BreakerState::Closed {
            BreakerTransition::None
        } else {
            info!(agent, fix = %fix, "Circuit breaker closed");
            BreakerTransition::Closed
        };
        breaker.state = BreakerState::Closed;
        breaker.consecutive_failures = 0;
        breaker.latched = false;
        breaker.last_attempt_at = Some(now);

        self.persist_locked(&entries).await;
        transition
    }

    /// Counts a failed attempt. `cooldown_seconds` is the cooldown to apply if
    /// this failure opens the breaker.
    pub async fn record_failure(&self, agent: &str, fix: FixType, cooldown_seconds: f64) -> BreakerTransition {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let breaker = entries
            .entry((agent.to_string(), fix))
            .or_insert_with(|| CircuitBreakerState::closed(cooldown_seconds));

        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        breaker.last_attempt_at = Some(now);
        breaker.cooldown_seconds = cooldown_seconds;

        let previous = breaker.state;
        let mut transition = match previous {
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open;
                BreakerTransition::Reopened
            }
            BreakerState::Closed if breaker.consecutive_failures >= self.threshold => {
                breaker.state = BreakerState::Open;
                BreakerTransition::Opened
            }
            _ => BreakerTransition::None,
        };

        if fix == FixType::RestartAgent && !breaker.latched && breaker.consecutive_failures >= self.restart_cap {
            breaker.state = BreakerState::Open;
            breaker.latched = true;
            transition = BreakerTransition::Latched;
        }

        match transition {
            BreakerTransition::None => debug!(
                agent,
                fix = %fix,
                failures = breaker.consecutive_failures,
                "Fix failure recorded"
            ),
            _ => warn!(
                agent,
                fix = %fix,
                failures = breaker.consecutive_failures,
                ?transition,
                "Circuit breaker transition"
            ),
        }

        self.persist_locked(&entries).await;
        transition
    }

    /// Returns a half-open breaker to open when its probe was cancelled before it ran.
    pub async fn abandon(&self, agent: &str, fix: FixType) {
        let mut entries = self.entries.lock().await;
        if let Some(breaker) = entries.get_mut(&(agent.to_string(), fix)) {
            if breaker.state == BreakerState::HalfOpen {
                breaker.state = BreakerState::Open;
                debug!(agent, fix = %fix, "Probe abandoned, breaker open again");
                self.persist_locked(&entries).await;
            }
        }
    }

    /// Operator reset. Returns whether a breaker existed for the key.
    pub async fn reset(&self, agent: &str, fix: FixType) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(breaker) = entries.get_mut(&(agent.to_string(), fix)) else {
            return false;
        };
        breaker.state = BreakerState::Closed;
        breaker.consecutive_failures = 0;
        breaker.latched = false;
        info!(agent, fix = %fix, "Circuit breaker reset by operator");
        self.persist_locked(&entries).await;
        true
    }

    pub async fn get(&self, agent: &str, fix: FixType) -> Option<CircuitBreakerState> {
        self.entries.lock().await.get(&(agent.to_string(), fix)).cloned()
    }

    pub async fn snapshot(&self) -> Vec<BreakerEntry> {
        Self::to_document(&*self.entries.lock().await)
    }

    pub async fn flush_if_dirty(&self) {
        if self.dirty.load(Ordering::SeqCst) {
            let entries = self.entries.lock().await;
            self.persist_locked(&entries).await;
        }
    }

    pub async fn flush(&self) -> Result<()> {
        let entries = self.entries.lock().await;
        save_document(self.store.as_ref(), BREAKERS_KEY, &Self::to_document(&entries)).await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn to_document(entries: &BTreeMap<BreakerKey, CircuitBreakerState>) -> Vec<BreakerEntry> {
        entries
            .iter()
            .map(|((agent, fix), breaker)| BreakerEntry {
                agent: agent.clone(),
                fix: *fix,
                breaker: breaker.clone(),
            })
            .collect()
    }

    async fn persist_locked(&self, entries: &BTreeMap<BreakerKey, CircuitBreakerState>) {
        match save_document(self.store.as_ref(), BREAKERS_KEY, &Self::to_document(entries)).await {
            Ok(()) => self.dirty.store(false, Ordering::SeqCst),
            Err(e) => {
                warn!("Failed to persist circuit breakers, keeping them in memory: {}", e);
                self.dirty.store(true, Ordering::SeqCst);
            }
        }
    }
}
