use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::ErrorKind;
use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::recovery::FixType;
use crate::storage::{load_document, save_document, StateStore, LEARNER_KEY};

/// Attempt ids remembered for de-duplication.
const SEEN_ATTEMPTS_CAP: usize = 4096;

/// Pairs need this many attempts before retuning looks at them.
const RETUNE_MIN_ATTEMPTS: u64 = 10;
const RETUNE_TARGET_RATE: f64 = 0.7;
const RETUNE_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuccessStatistics {
    pub attempts: u64,
    pub successes: u64,
    pub total_recovery_seconds: f64,
    /// Last-touched sequence number, used for oldest-first eviction.
    #[serde(default)]
    pub seq: u64,
}

impl SuccessStatistics {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    /// Mean recovery time over successful attempts.
    pub fn avg_recovery_seconds(&self) -> f64 {
        if self.successes == 0 {
            0.0
        } else {
            self.total_recovery_seconds / self.successes as f64
        }
    }
}

/// Best known fix for one (agent, error kind) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub best_fix: FixType,
    pub total_attempts: u64,
}

/// Global retry/restart timing, widened by retuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParameters {
    pub backoff_initial_seconds: f64,
    pub backoff_multiplier: f64,
    pub backoff_max_seconds: f64,
    pub cooldown_seconds: f64,
}

impl StrategyParameters {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            backoff_initial_seconds: config.backoff_initial_seconds,
            backoff_multiplier: config.backoff_multiplier,
            backoff_max_seconds: config.backoff_max_seconds,
            cooldown_seconds: config.cooldown_seconds,
        }
    }

    /// `initial * multiplier^n`, capped at the maximum.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let raw = self.backoff_initial_seconds * self.backoff_multiplier.powi(attempt.min(64) as i32);
        Duration::from_secs_f64(raw.min(self.backoff_max_seconds).max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ParameterCaps {
    backoff_initial_seconds: f64,
    cooldown_seconds: f64,
}

/// One finished remediation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub attempt_id: Uuid,
    pub agent: String,
    pub kind: ErrorKind,
    pub fix: FixType,
    pub success: bool,
    pub recovery_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsEntry {
    pub agent: String,
    pub kind: ErrorKind,
    pub fix: FixType,
    pub stats: SuccessStatistics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StrategyEntry {
    agent: String,
    kind: ErrorKind,
    record: StrategyRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LearnerDocument {
    stats: Vec<StatsEntry>,
    strategies: Vec<StrategyEntry>,
    parameters: StrategyParameters,
    #[serde(default)]
    seen_attempts: Vec<Uuid>,
    #[serde(default)]
    next_seq: u64,
    #[serde(default)]
    generation: u64,
    #[serde(default)]
    retuned_generation: u64,
    #[serde(default)]
    last_retune_at: Option<DateTime<Utc>>,
}

type StatsKey = (String, ErrorKind, FixType);
type PairKey = (String, ErrorKind);

struct LearnerState {
    stats: BTreeMap<StatsKey, SuccessStatistics>,
    strategies: BTreeMap<PairKey, StrategyRecord>,
    parameters: StrategyParameters,
    seen_order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    next_seq: u64,
    /// Bumped on every recorded outcome.
    generation: u64,
    retuned_generation: u64,
    last_retune_at: Option<DateTime<Utc>>,
}

impl LearnerState {
    fn new(parameters: StrategyParameters) -> Self {
        Self {
            stats: BTreeMap::new(),
            strategies: BTreeMap::new(),
            parameters,
            seen_order: VecDeque::new(),
            seen: HashSet::new(),
            next_seq: 0,
            generation: 0,
            retuned_generation: 0,
            last_retune_at: None,
        }
    }

    fn from_document(doc: LearnerDocument) -> Self {
        let mut state = Self::new(doc.parameters);
        for entry in doc.stats {
            // drop anything that would break the rate invariant
            if entry.stats.successes > entry.stats.attempts {
                warn!("Skipping inconsistent statistics for {}/{}/{}", entry.agent, entry.kind, entry.fix);
                continue;
            }
            state.stats.insert((entry.agent, entry.kind, entry.fix), entry.stats);
        }
        for entry in doc.strategies {
            state.strategies.insert((entry.agent, entry.kind), entry.record);
        }
        for id in doc.seen_attempts {
            if state.seen.insert(id) {
                state.seen_order.push_back(id);
            }
        }
        state.next_seq = doc.next_seq;
        state.generation = doc.generation;
        state.retuned_generation = doc.retuned_generation;
        state.last_retune_at = doc.last_retune_at;
        state
    }

    fn to_document(&self) -> LearnerDocument {
        LearnerDocument {
            stats: self
                .stats
                .iter()
                .map(|((agent, kind, fix), stats)| StatsEntry {
                    agent: agent.clone(),
                    kind: *kind,
                    fix: *fix,
                    stats: stats.clone(),
                })
                .collect(),
            strategies: self
                .strategies
                .iter()
                .map(|((agent, kind), record)| StrategyEntry {
                    agent: agent.clone(),
                    kind: *kind,
                    record: record.clone(),
                })
                .collect(),
            parameters: self.parameters.clone(),
            seen_attempts: self.seen_order.iter().copied().collect(),
            next_seq: self.next_seq,
            generation: self.generation,
            retuned_generation: self.retuned_generation,
            last_retune_at: self.last_retune_at,
        }
    }

    fn remember_attempt(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.seen_order.push_back(id);
        while self.seen_order.len() > SEEN_ATTEMPTS_CAP {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    fn evict_oldest(&mut self, cap: usize) {
        while self.stats.len() > cap {
            let oldest = self
                .stats
                .iter()
                .min_by_key(|(_, s)| s.seq)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    debug!("Evicting statistics for {}/{}/{}", key.0, key.1, key.2);
                    self.stats.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Moves the best-strategy pointer when `fix` now strictly beats it, or
    /// ties it with a lower average recovery time.
    fn update_best(&mut self, agent: &str, kind: ErrorKind, fix: FixType) {
        let Some(candidate) = self.stats.get(&(agent.to_string(), kind, fix)).cloned() else {
            return;
        };
        let pair = (agent.to_string(), kind);

        let current_best = self.strategies.get(&pair).map(|r| r.best_fix);
        let replace = match current_best {
            None => true,
            Some(best) if best == fix => false,
            Some(best) => match self.stats.get(&(agent.to_string(), kind, best)) {
                None => true,
                Some(best_stats) => {
                    let (rate, best_rate) = (candidate.success_rate(), best_stats.success_rate());
                    rate > best_rate
                        || (rate == best_rate
                            && candidate.successes > 0
                            && candidate.avg_recovery_seconds() < best_stats.avg_recovery_seconds())
                }
            },
        };

        let record = self.strategies.entry(pair).or_insert(StrategyRecord {
            best_fix: fix,
            total_attempts: 0,
        });
        record.total_attempts += 1;
        if replace && record.best_fix != fix {
            debug!("Best fix for {}/{} is now {}", agent, kind, fix);
            record.best_fix = fix;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetuneReport {
    pub widened: bool,
    pub pairs_below_target: Vec<(String, ErrorKind)>,
    pub parameters: StrategyParameters,
}

/// Owns the success statistics and the tunable recovery timing.
pub struct AdaptiveLearner {
    state: Mutex<LearnerState>,
    store: Arc<dyn StateStore>,
    caps: ParameterCaps,
    stats_cap: usize,
    dirty: AtomicBool,
}

impl AdaptiveLearner {
    pub async fn load(store: Arc<dyn StateStore>, config: &RecoveryConfig, stats_cap: usize) -> Self {
        let defaults = StrategyParameters::from_config(config);
        let state = match load_document::<LearnerDocument>(store.as_ref(), LEARNER_KEY).await {
            Ok(Some(doc)) => {
                let state = LearnerState::from_document(doc);
                info!("Loaded {} recovery statistics", state.stats.len());
                state
            }
            Ok(None) => LearnerState::new(defaults),
            Err(e) => {
                warn!("Starting with empty recovery statistics: {}", e);
                LearnerState::new(defaults)
            }
        };

        Self {
            state: Mutex::new(state),
            store,
            caps: ParameterCaps {
                backoff_initial_seconds: config.backoff_initial_cap_seconds,
                cooldown_seconds: config.cooldown_cap_seconds,
            },
            stats_cap: stats_cap.max(1),
            dirty: AtomicBool::new(false),
        }
    }

    /// Records one attempt. Returns `false` when the attempt id was already recorded.
    pub async fn record_outcome(&self, outcome: &RecoveryOutcome) -> bool {
        let mut state = self.state.lock().await;
        if !state.remember_attempt(outcome.attempt_id) {
            debug!("Ignoring replayed attempt {}", outcome.attempt_id);
            return false;
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        let key = (outcome.agent.clone(), outcome.kind, outcome.fix);
        let stats = state.stats.entry(key).or_default();
        stats.attempts += 1;
        if outcome.success {
            stats.successes += 1;
            stats.total_recovery_seconds += outcome.recovery_seconds.max(0.0);
        }
        stats.seq = seq;

        state.update_best(&outcome.agent, outcome.kind, outcome.fix);
        state.evict_oldest(self.stats_cap);
        state.generation += 1;

        self.persist_locked(&state).await;
        true
    }

    pub async fn statistics(&self, agent: &str, kind: ErrorKind, fix: FixType) -> Option<SuccessStatistics> {
        let state = self.state.lock().await;
        state.stats.get(&(agent.to_string(), kind, fix)).cloned()
    }

    pub async fn all_statistics(&self) -> Vec<StatsEntry> {
        self.state.lock().await.to_document().stats
    }

    pub async fn best_fix(&self, agent: &str, kind: ErrorKind) -> Option<FixType> {
        let state = self.state.lock().await;
        state.strategies.get(&(agent.to_string(), kind)).map(|r| r.best_fix)
    }

    pub async fn parameters(&self) -> StrategyParameters {
        self.state.lock().await.parameters.clone()
    }

    /// Widens restart backoff and cooldown once when any well-sampled pair's
    /// best fix succeeds less than 70% of the time. Does nothing if no outcome
    /// arrived since the previous retune.
    pub async fn retune_parameters(&self, now: DateTime<Utc>) -> RetuneReport {
        let mut state = self.state.lock().await;

        let pairs_below_target: Vec<(String, ErrorKind)> = state
            .strategies
            .iter()
            .filter(|(_, record)| record.total_attempts >= RETUNE_MIN_ATTEMPTS)
            .filter(|((agent, kind), record)| {
                state
                    .stats
                    .get(&(agent.clone(), *kind, record.best_fix))
                    .map(|s| s.success_rate() < RETUNE_TARGET_RATE)
                    .unwrap_or(false)
            })
            .map(|(pair, _)| pair.clone())
            .collect();

        let fresh = state.generation != state.retuned_generation;
        let mut widened = false;

        if fresh && !pairs_below_target.is_empty() {
            let before = state.parameters.clone();
            let params = &mut state.parameters;
            params.backoff_initial_seconds =
                (params.backoff_initial_seconds * RETUNE_FACTOR).min(self.caps.backoff_initial_seconds);
            params.cooldown_seconds = (params.cooldown_seconds * RETUNE_FACTOR).min(self.caps.cooldown_seconds);
            widened = *params != before;

            if widened {
                info!(
                    backoff_initial = params.backoff_initial_seconds,
                    cooldown = params.cooldown_seconds,
                    "Widened recovery parameters for {} underperforming pairs",
                    pairs_below_target.len()
                );
            }
        }

        if fresh {
            state.retuned_generation = state.generation;
            state.last_retune_at = Some(now);
            self.persist_locked(&state).await;
        }

        RetuneReport {
            widened,
            pairs_below_target,
            parameters: state.parameters.clone(),
        }
    }

    pub async fn flush_if_dirty(&self) {
        if self.dirty.load(Ordering::SeqCst) {
            let state = self.state.lock().await;
            self.persist_locked(&state).await;
        }
    }

    pub async fn flush(&self) -> Result<()> {
        let state = self.state.lock().await;
        save_document(self.store.as_ref(), LEARNER_KEY, &state.to_document()).await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn persist_locked(&self, state: &LearnerState) {
        match save_document(self.store.as_ref(), LEARNER_KEY, &state.to_document()).await {
            Ok(()) => self.dirty.store(false, Ordering::SeqCst),
            Err(e) => {
                warn!("Failed to persist recovery statistics, keeping them in memory: {}", e);
                self.dirty.store(true, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn outcome(agent: &str, kind: ErrorKind, fix: FixType, success: bool, secs: f64) -> RecoveryOutcome {
        RecoveryOutcome {
            attempt_id: Uuid::new_v4(),
            agent: agent.to_string(),
            kind,
            fix,
            success,
            recovery_seconds: secs,
        }
    }

    async fn learner(store: Arc<dyn StateStore>) -> AdaptiveLearner {
        AdaptiveLearner::load(store, &RecoveryConfig::default(), 5000).await
    }

    #[tokio::test]
    async fn test_rates_stay_within_bounds() {
        let learner = learner(Arc::new(MemoryStore::new())).await;
        let pattern = [true, false, false, true, true, false, true];
        for (i, success) in pattern.iter().enumerate() {
            learner
                .record_outcome(&outcome("w", ErrorKind::ConnectionIssue, FixType::RetryWithBackoff, *success, i as f64))
                .await;
            let stats = learner
                .statistics("w", ErrorKind::ConnectionIssue, FixType::RetryWithBackoff)
                .await
                .unwrap();
            assert!(stats.successes <= stats.attempts);
            assert!((0.0..=1.0).contains(&stats.success_rate()));
        }
        let stats = learner
            .statistics("w", ErrorKind::ConnectionIssue, FixType::RetryWithBackoff)
            .await
            .unwrap();
        assert_eq!(stats.attempts, 7);
        assert_eq!(stats.successes, 4);
        // 0 + 3 + 4 + 6 over four successes
        assert_eq!(stats.avg_recovery_seconds(), 13.0 / 4.0);
    }

    #[tokio::test]
    async fn test_replayed_attempt_is_not_double_counted() {
        let learner = learner(Arc::new(MemoryStore::new())).await;
        let attempt = outcome("w", ErrorKind::MissingFile, FixType::CreateMissingPath, true, 1.0);

        assert!(learner.record_outcome(&attempt).await);
        assert!(!learner.record_outcome(&attempt).await);

        let mut distinct = attempt.clone();
        distinct.attempt_id = Uuid::new_v4();
        assert!(learner.record_outcome(&distinct).await);

        let stats = learner
            .statistics("w", ErrorKind::MissingFile, FixType::CreateMissingPath)
            .await
            .unwrap();
        assert_eq!(stats.attempts, 2);
    }

    #[tokio::test]
    async fn test_best_strategy_moves_on_strictly_better_rate_or_faster_tie() {
        let learner = learner(Arc::new(MemoryStore::new())).await;
        let kind = ErrorKind::TimeoutIssue;

        learner.record_outcome(&outcome("w", kind, FixType::RetryWithBackoff, true, 20.0)).await;
        assert_eq!(learner.best_fix("w", kind).await, Some(FixType::RetryWithBackoff));

        // same rate, slower: no change
        learner.record_outcome(&outcome("w", kind, FixType::RestartAgent, true, 30.0)).await;
        assert_eq!(learner.best_fix("w", kind).await, Some(FixType::RetryWithBackoff));

        // same rate, faster: takes over
        learner.record_outcome(&outcome("w", kind, FixType::IncreaseTimeout, true, 5.0)).await;
        assert_eq!(learner.best_fix("w", kind).await, Some(FixType::IncreaseTimeout));

        // worse rate does not
        learner.record_outcome(&outcome("w", kind, FixType::RetryWithBackoff, false, 0.0)).await;
        assert_eq!(learner.best_fix("w", kind).await, Some(FixType::IncreaseTimeout));
    }

    #[tokio::test]
    async fn test_retune_is_idempotent_and_capped() {
        let learner = learner(Arc::new(MemoryStore::new())).await;
        let now = Utc::now();

        for i in 0..10 {
            learner
                .record_outcome(&outcome("w", ErrorKind::ProcessExit, FixType::RestartAgent, i < 3, 2.0))
                .await;
        }

        let first = learner.retune_parameters(now).await;
        assert!(first.widened);
        assert_eq!(first.parameters.backoff_initial_seconds, 3.0);
        assert_eq!(first.parameters.cooldown_seconds, 450.0);

        // no new evidence, nothing changes
        let second = learner.retune_parameters(now).await;
        assert!(!second.widened);
        assert_eq!(second.parameters, first.parameters);

        for _ in 0..20 {
            learner
                .record_outcome(&outcome("w", ErrorKind::ProcessExit, FixType::RestartAgent, false, 0.0))
                .await;
            learner.retune_parameters(now).await;
        }
        let params = learner.parameters().await;
        assert_eq!(params.backoff_initial_seconds, 10.0);
        assert_eq!(params.cooldown_seconds, 900.0);
    }

    #[tokio::test]
    async fn test_statistics_survive_reload() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let first = learner(store.clone()).await;
        let attempt = outcome("w", ErrorKind::MissingDependency, FixType::InstallDependency, true, 4.0);
        first.record_outcome(&attempt).await;

        let reloaded = learner(store).await;
        assert_eq!(
            reloaded
                .statistics("w", ErrorKind::MissingDependency, FixType::InstallDependency)
                .await,
            first
                .statistics("w", ErrorKind::MissingDependency, FixType::InstallDependency)
                .await
        );
        // the replay guard survives too
        assert!(!reloaded.record_outcome(&attempt).await);
    }

    #[tokio::test]
    async fn test_oldest_statistics_evicted_past_cap() {
        let learner = AdaptiveLearner::load(Arc::new(MemoryStore::new()), &RecoveryConfig::default(), 2).await;
        learner.record_outcome(&outcome("a", ErrorKind::Unknown, FixType::RestartAgent, true, 1.0)).await;
        learner.record_outcome(&outcome("b", ErrorKind::Unknown, FixType::RestartAgent, true, 1.0)).await;
        learner.record_outcome(&outcome("c", ErrorKind::Unknown, FixType::RestartAgent, true, 1.0)).await;

        assert!(learner.statistics("a", ErrorKind::Unknown, FixType::RestartAgent).await.is_none());
        assert!(learner.statistics("c", ErrorKind::Unknown, FixType::RestartAgent).await.is_some());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let params = StrategyParameters::from_config(&RecoveryConfig::default());
        assert_eq!(params.backoff_for(0), Duration::from_secs(2));
        assert_eq!(params.backoff_for(3), Duration::from_secs(16));
        assert_eq!(params.backoff_for(10), Duration::from_secs(60));
    }
}
