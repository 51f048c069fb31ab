use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::AgentDescriptor;
use crate::chaos::{measure_recovery, ChaosLog, ChaosResult, ChaosScenario};
use crate::classifier::{Classification, ErrorClassifier, ErrorKind};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigManager};
use crate::error::{OrchestratorError, Result};
use crate::health::{
    ExternalSignals, HealthHistory, HealthMonitor, HealthSnapshot, HealthStatus, HealthTrend, ProcessControl,
    SysinfoProcessControl,
};
use crate::maintenance::{MaintenanceKind, MaintenanceRecord, MaintenanceWindow, PredictiveScheduler, Resource};
use crate::rca::{ExternalReasoner, HttpReasoner, Incident, RcaEngine, RcaReport};
use crate::recovery::breaker::BreakerEntry;
use crate::recovery::learner::{RetuneReport, StatsEntry};
use crate::recovery::{
    AdaptiveLearner, Admission, BreakerState, BreakerTransition, CircuitBreakers, FixExecutor, FixOutcome,
    FixSelector, FixType, RecoveryOutcome, RestartLedger, StrategyParameters,
};
use crate::storage::{FileStore, StateStore};
use crate::webhooks::{Alert, AlertLevel, AlertManager};

/// Everything the orchestrator publishes while it works.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecoveryEvent {
    HealthChanged {
        agent: String,
        from: Option<HealthStatus>,
        to: HealthStatus,
    },
    FixApplied {
        agent: String,
        kind: Option<ErrorKind>,
        fix: FixType,
        success: bool,
        detail: String,
        elapsed_seconds: f64,
    },
    FixRejected {
        agent: String,
        kind: ErrorKind,
        fix: FixType,
        retry_after_seconds: Option<f64>,
    },
    BreakerChanged {
        agent: String,
        fix: FixType,
        transition: BreakerTransition,
    },
    MaintenanceScheduled {
        window: MaintenanceWindow,
    },
    MaintenanceCompleted {
        record: MaintenanceRecord,
    },
    ManualIntervention {
        agent: String,
        reason: String,
    },
    ChaosCompleted {
        result: ChaosResult,
    },
    ConfigReloaded {
        agents: usize,
    },
}

/// What one agent's cycle saw and did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub agent: String,
    pub status: HealthStatus,
    pub failures: Vec<ErrorKind>,
    pub fixes: Vec<FixOutcome>,
    pub rejected: Vec<FixType>,
    pub manual_intervention: bool,
}

impl CycleReport {
    fn new(agent: &str, status: HealthStatus) -> Self {
        Self {
            agent: agent.to_string(),
            status,
            failures: Vec::new(),
            fixes: Vec::new(),
            rejected: Vec::new(),
            manual_intervention: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub process_pattern: String,
    pub status: Option<HealthStatus>,
    pub running: bool,
    pub last_observed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub agents: usize,
    pub started_at: DateTime<Utc>,
    pub ticks: u64,
    pub fixes_applied: u64,
    pub fixes_failed: u64,
    pub fixes_rejected: u64,
    pub incidents: usize,
    pub open_breakers: usize,
    pub pending_maintenance: usize,
    pub parameters: StrategyParameters,
}

/// Injectable capabilities the orchestrator is built from.
pub struct Collaborators {
    pub store: Arc<dyn StateStore>,
    pub process: Arc<dyn ProcessControl>,
    pub clock: Arc<dyn Clock>,
    pub reasoner: Option<Arc<dyn ExternalReasoner>>,
    pub alerts: AlertManager,
}

impl Collaborators {
    /// Production wiring: file store, host process table, wall clock.
    pub fn from_config(config: &Config) -> Result<Self> {
        let reasoner = HttpReasoner::from_config(&config.reasoner)?.map(|r| Arc::new(r) as Arc<dyn ExternalReasoner>);
        Ok(Self {
            store: Arc::new(FileStore::new(config.storage.state_dir.clone())?),
            process: Arc::new(SysinfoProcessControl::new()),
            clock: Arc::new(SystemClock),
            reasoner,
            alerts: AlertManager::from_config(&config.alerts)?,
        })
    }
}

#[derive(Default)]
struct SlotState {
    history: HealthHistory,
    ledger: RestartLedger,
    signals: ExternalSignals,
    /// Kinds already escalated to a human since the agent was last healthy.
    alerted: BTreeSet<ErrorKind>,
    /// Log size when the last remediation settled. Error lines ending at or
    /// before it have been answered.
    handled_log_offset: Option<u64>,
    /// Fix admitted by a breaker whose outcome is not recorded yet.
    in_flight_fix: Option<FixType>,
    injected_latency: Option<Duration>,
}

/// One supervised agent. Its state lock serializes the recovery cycle,
/// maintenance and chaos drills for that agent.
struct AgentSlot {
    descriptor: AgentDescriptor,
    state: Mutex<SlotState>,
}

impl AgentSlot {
    fn new(descriptor: AgentDescriptor) -> Self {
        Self {
            descriptor,
            state: Mutex::new(SlotState::default()),
        }
    }
}

pub struct RecoveryOrchestrator {
    config: RwLock<Config>,
    slots: RwLock<BTreeMap<String, Arc<AgentSlot>>>,

    // Pipeline
    monitor: HealthMonitor,
    classifier: ErrorClassifier,
    rca: RcaEngine,
    learner: Arc<AdaptiveLearner>,
    selector: FixSelector,
    breakers: CircuitBreakers,
    executor: FixExecutor,
    scheduler: PredictiveScheduler,
    chaos: ChaosLog,

    process: Arc<dyn ProcessControl>,
    clock: Arc<dyn Clock>,
    alerts: AlertManager,
    events: broadcast::Sender<RecoveryEvent>,
    concurrency: Arc<Semaphore>,

    // Statistics
    started_at: DateTime<Utc>,
    ticks: AtomicU64,
    fixes_applied: AtomicU64,
    fixes_failed: AtomicU64,
    fixes_rejected: AtomicU64,

    // Background tasks
    shutdown_signal: Mutex<Option<broadcast::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RecoveryOrchestrator {
    pub async fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            store,
            process,
            clock,
            reasoner,
            alerts,
        } = collaborators;
        let recovery = &config.recovery;

        let learner = Arc::new(AdaptiveLearner::load(store.clone(), recovery, config.storage.stats_cap).await);
        let breakers = CircuitBreakers::load(
            store.clone(),
            clock.clone(),
            recovery.failure_threshold,
            recovery.restart_cap,
            recovery.cooldown_seconds,
        )
        .await;
        let rca = RcaEngine::load(
            store.clone(),
            clock.clone(),
            reasoner,
            config.reasoner.timeout,
            config.reasoner.max_prompt_chars,
            config.storage.incident_cap,
        )
        .await?;
        let scheduler = PredictiveScheduler::load(store.clone(), clock.clone(), config.storage.history_cap).await;
        let chaos = ChaosLog::load(store.clone()).await;

        let monitor = HealthMonitor::new(
            process.clone(),
            clock.clone(),
            config.monitoring.log_tail_lines,
            config.log_tail_bytes(),
        );
        let executor = FixExecutor::new(process.clone(), recovery);
        let slots = config
            .agents
            .iter()
            .map(|a| (a.name.clone(), Arc::new(AgentSlot::new(AgentDescriptor::from_config(a)))))
            .collect();
        let (events, _) = broadcast::channel(1024);

        info!("Recovery orchestrator supervising {} agents", config.agents.len());

        Ok(Self {
            concurrency: Arc::new(Semaphore::new(recovery.max_concurrent_agents.max(1))),
            slots: RwLock::new(slots),
            monitor,
            classifier: ErrorClassifier::new()?,
            rca,
            selector: FixSelector::new(learner.clone()),
            learner,
            breakers,
            executor,
            scheduler,
            chaos,
            process,
            started_at: clock.now(),
            clock,
            alerts,
            events,
            config: RwLock::new(config),
            ticks: AtomicU64::new(0),
            fixes_applied: AtomicU64::new(0),
            fixes_failed: AtomicU64::new(0),
            fixes_rejected: AtomicU64::new(0),
            shutdown_signal: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the recovery, maintenance and retune loops, plus the config
    /// watcher when a manager is given.
    pub async fn start(self: &Arc<Self>, config_manager: Option<Arc<dyn ConfigManager + Send + Sync>>) -> Result<()> {
        info!("Starting recovery orchestrator");

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = self.tasks.lock().await;

        tasks.push(self.start_recovery_loop(shutdown_tx.subscribe()).await);
        tasks.push(self.start_maintenance_loop(shutdown_tx.subscribe()).await);
        tasks.push(self.start_retune_loop(shutdown_tx.subscribe()).await);
        if let Some(manager) = config_manager {
            tasks.push(self.start_config_watcher(manager, shutdown_tx.subscribe()));
        }

        *self.shutdown_signal.lock().await = Some(shutdown_tx);
        info!("Recovery orchestrator started");
        Ok(())
    }

    /// Lets every loop finish its current iteration, then flushes all state.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping recovery orchestrator");

        if let Some(shutdown_tx) = self.shutdown_signal.lock().await.take() {
            let _ = shutdown_tx.send(());
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.flush_all().await?;
        info!("Recovery orchestrator stopped");
        Ok(())
    }

    /// One pass over every agent. Agents run concurrently up to the
    /// configured limit; a stuck or panicking agent only loses its own cycle.
    pub async fn run_tick(self: &Arc<Self>) -> Vec<CycleReport> {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let slots: Vec<Arc<AgentSlot>> = self.slots.read().await.values().cloned().collect();
        let cycle_timeout = self.config.read().await.recovery.cycle_timeout;

        let mut handles = Vec::with_capacity(slots.len());
        for slot in slots {
            let orchestrator = Arc::clone(self);
            let agent = slot.descriptor.name().to_string();
            let handle = tokio::spawn(async move {
                let _permit = orchestrator.concurrency.clone().acquire_owned().await.ok();
                // the timed-out cycle is dropped here, releasing its slot lock
                let result = timeout(cycle_timeout, orchestrator.run_agent_cycle(&slot)).await;
                match result {
                    Ok(report) => Some(report),
                    Err(_) => {
                        warn!(agent = slot.descriptor.name(), "Recovery cycle timed out after {:?}", cycle_timeout);
                        // held across abandon so maintenance cannot take the probe in between
                        let mut state = slot.state.lock().await;
                        if let Some(fix) = state.in_flight_fix.take() {
                            orchestrator.breakers.abandon(slot.descriptor.name(), fix).await;
                        }
                        None
                    }
                }
            });
            handles.push((agent, handle));
        }

        let mut reports = Vec::new();
        for (agent, handle) in handles {
            match handle.await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => error!(agent = %agent, "Recovery cycle aborted: {}", e),
            }
        }

        self.flush_dirty().await;
        reports
    }

    /// Runs a single agent's cycle right away.
    pub async fn run_agent(&self, agent: &str) -> Result<CycleReport> {
        let slot = self.slot(agent).await?;
        Ok(self.run_agent_cycle(&slot).await)
    }

    async fn run_agent_cycle(&self, slot: &AgentSlot) -> CycleReport {
        let agent = &slot.descriptor;
        let name = agent.name();
        let mut state = slot.state.lock().await;

        if let Some(delay) = state.injected_latency.take() {
            debug!(agent = name, ?delay, "Injected latency");
            sleep(delay).await;
        }

        let snapshot = self.monitor.poll(agent).await;
        let previous = state.history.current().map(|s| s.status);
        if previous != Some(snapshot.status) {
            info!(agent = name, from = ?previous, to = ?snapshot.status, "Health changed");
            self.emit(RecoveryEvent::HealthChanged {
                agent: name.to_string(),
                from: previous,
                to: snapshot.status,
            });
        }
        state.history.push(snapshot.clone());

        let mut report = CycleReport::new(name, snapshot.status);
        match snapshot.status {
            HealthStatus::Healthy => {
                state.alerted.clear();
                return report;
            }
            HealthStatus::Unknown => {
                debug!(agent = name, "Health unknown, skipping remediation");
                return report;
            }
            HealthStatus::Degraded | HealthStatus::Stopped => {}
        }

        // a running agent is only remediated for errors logged after the last settled fix
        let lines: &[String] = if snapshot.running {
            snapshot.errors_after(state.handled_log_offset)
        } else {
            &snapshot.recent_error_lines
        };
        if snapshot.running && lines.is_empty() {
            debug!(agent = name, "No new failures since the last remediation");
            return report;
        }

        let limit = self.config.read().await.recovery.errors_per_cycle.max(1);
        let failures = self.collect_failures(lines, snapshot.running, limit);
        if failures.is_empty() {
            debug!(agent = name, "Failure lines matched no known signature");
            state.handled_log_offset = Some(snapshot.log_size);
            return report;
        }

        let log_text = snapshot.recent_error_lines.join("\n");
        for classification in &failures {
            report.failures.push(classification.kind);
            let restarted = self
                .remediate(agent, &mut state, &snapshot, classification, &log_text, &mut report)
                .await;
            if restarted {
                // everything else in this tail predates the fresh process
                break;
            }
        }

        // failed or held-back fixes are tried again next cycle on the same lines
        let unsettled = report.fixes.iter().any(|f| !f.success) || !report.rejected.is_empty();
        if report.manual_intervention || !unsettled {
            state.handled_log_offset = Some(snapshot.log_size);
        }

        report
    }

    /// Newest first, one per kind. A stopped agent with nothing classifiable
    /// still gets an `Unknown` failure so it can be restarted.
    fn collect_failures(&self, lines: &[String], running: bool, limit: usize) -> Vec<Classification> {
        let mut seen = BTreeSet::new();
        let mut failures = Vec::new();
        for line in lines.iter().rev() {
            if let Some(classification) = self.classifier.analyze(line) {
                if seen.insert(classification.kind) {
                    failures.push(classification);
                    if failures.len() >= limit {
                        break;
                    }
                }
            }
        }

        if failures.is_empty() && !running {
            failures.push(Classification {
                kind: ErrorKind::Unknown,
                severity: ErrorKind::Unknown.severity(),
                matched: "process not running".to_string(),
                detail: None,
            });
        }
        failures
    }

    /// RCA, fix selection behind the breakers, application and recording.
    /// Returns whether the agent was restarted.
    async fn remediate(
        &self,
        agent: &AgentDescriptor,
        state: &mut SlotState,
        snapshot: &HealthSnapshot,
        classification: &Classification,
        log_text: &str,
        report: &mut CycleReport,
    ) -> bool {
        let name = agent.name();
        let kind = classification.kind;
        let root_cause = self.rca.analyze(name, kind, log_text).await;
        info!(
            agent = name,
            kind = %kind,
            root_cause = %root_cause.label,
            confidence = root_cause.confidence,
            source = ?root_cause.source,
            "Root cause identified"
        );

        let catalog = kind.applicable_fixes();
        if catalog.is_empty() {
            let reason = format!("{} cannot be fixed automatically: {}", kind, root_cause.suggested_remedy);
            self.escalate(name, kind, state, reason);
            report.manual_intervention = true;
            self.rca.record_incident(name, &root_cause, None, false, log_text).await;
            return false;
        }

        let Some(decision) = self.selector.select_fix(name, kind, &root_cause, catalog).await else {
            return false;
        };

        let mut chosen = None;
        for candidate in decision.ranked() {
            if candidate.fix == FixType::RestartAgent {
                if let Some(wait) = self.restart_cap_reached(state).await {
                    self.refuse_restart(name, kind, state, wait, report).await;
                    continue;
                }
            }
            match self.breakers.try_acquire(name, candidate.fix).await {
                Admission::Allowed | Admission::Probe => {
                    chosen = Some(candidate.fix);
                    break;
                }
                Admission::Rejected { retry_after } => {
                    debug!(agent = name, fix = %candidate.fix, ?retry_after, "Fix held by circuit breaker");
                    self.fixes_rejected.fetch_add(1, Ordering::Relaxed);
                    report.rejected.push(candidate.fix);
                    self.emit(RecoveryEvent::FixRejected {
                        agent: name.to_string(),
                        kind,
                        fix: candidate.fix,
                        retry_after_seconds: retry_after.map(|d| d.as_secs_f64()),
                    });
                    if retry_after.is_none() {
                        self.escalate(
                            name,
                            kind,
                            state,
                            format!("{} is latched open after repeated failures", candidate.fix),
                        );
                        report.manual_intervention = true;
                    }
                }
            }
        }

        let Some(fix) = chosen else {
            info!(agent = name, kind = %kind, "Every candidate fix is held open, waiting for cooldown");
            return false;
        };

        let outcome = self.apply_fix(agent, state, fix, Some(kind), Some(classification)).await;
        self.rca
            .record_incident(name, &root_cause, Some(fix), outcome.success, log_text)
            .await;
        self.rca.generate_report(name, &root_cause).await;

        let mut restarted = fix == FixType::RestartAgent && outcome.success;
        let prepared = outcome.success && fix != FixType::RestartAgent;
        report.fixes.push(outcome);

        if prepared && !snapshot.running {
            // the fix cleared the way, the agent still has to come back
            if let Some(wait) = self.restart_cap_reached(state).await {
                self.refuse_restart(name, kind, state, wait, report).await;
            } else if self.breakers.try_acquire(name, FixType::RestartAgent).await.is_admitted() {
                let follow_up = self
                    .apply_fix(agent, state, FixType::RestartAgent, Some(kind), Some(classification))
                    .await;
                restarted = follow_up.success;
                report.fixes.push(follow_up);
            } else {
                report.rejected.push(FixType::RestartAgent);
            }
        }

        restarted
    }

    /// Time until the restart window rolls over once the agent has used up its
    /// restarts, `None` while restarts remain.
    async fn restart_cap_reached(&self, state: &mut SlotState) -> Option<Duration> {
        let (cap, window) = {
            let config = self.config.read().await;
            (config.recovery.restart_cap, config.recovery.restart_window)
        };
        let now = self.clock.now();
        if state.ledger.restarts_in_window(now, window) < cap {
            return None;
        }
        Some(state.ledger.window_remaining(now, window))
    }

    async fn refuse_restart(
        &self,
        name: &str,
        kind: ErrorKind,
        state: &mut SlotState,
        wait: Duration,
        report: &mut CycleReport,
    ) {
        let (cap, window) = {
            let config = self.config.read().await;
            (config.recovery.restart_cap, config.recovery.restart_window)
        };
        warn!(agent = name, ?wait, "Restart cap of {} reached", cap);
        self.fixes_rejected.fetch_add(1, Ordering::Relaxed);
        report.rejected.push(FixType::RestartAgent);
        report.manual_intervention = true;
        self.emit(RecoveryEvent::FixRejected {
            agent: name.to_string(),
            kind,
            fix: FixType::RestartAgent,
            retry_after_seconds: Some(wait.as_secs_f64()),
        });
        self.escalate(
            name,
            kind,
            state,
            format!(
                "Max restarts reached ({} within {} minutes). Manual intervention needed.",
                cap,
                window.as_secs() / 60
            ),
        );
    }

    /// Applies an already admitted fix and feeds the outcome to the learner
    /// (when it answered a classified failure) and the breaker.
    async fn apply_fix(
        &self,
        agent: &AgentDescriptor,
        state: &mut SlotState,
        fix: FixType,
        kind: Option<ErrorKind>,
        classification: Option<&Classification>,
    ) -> FixOutcome {
        let name = agent.name();
        if let Some(stale) = state.in_flight_fix.replace(fix).filter(|f| *f != fix) {
            // left behind by a cycle cancelled before its timeout handler ran
            self.breakers.abandon(name, stale).await;
        }
        let params = self.learner.parameters().await;
        let restart_window = self.config.read().await.recovery.restart_window;
        let restarts = state.ledger.restarts_in_window(self.clock.now(), restart_window);

        let outcome = self.executor.apply(fix, agent, classification, &params, restarts).await;
        if fix == FixType::RestartAgent {
            state.ledger.record_restart(self.clock.now());
        }

        if let Some(kind) = kind {
            self.learner
                .record_outcome(&RecoveryOutcome {
                    attempt_id: Uuid::new_v4(),
                    agent: name.to_string(),
                    kind,
                    fix,
                    success: outcome.success,
                    recovery_seconds: outcome.elapsed_seconds,
                })
                .await;
        }

        let transition = if outcome.success {
            self.fixes_applied.fetch_add(1, Ordering::Relaxed);
            info!(agent = name, fix = %fix, "Fix succeeded: {}", outcome.detail);
            self.breakers.record_success(name, fix).await
        } else {
            self.fixes_failed.fetch_add(1, Ordering::Relaxed);
            warn!(agent = name, fix = %fix, "Fix failed: {}", outcome.detail);
            self.breakers.record_failure(name, fix, params.cooldown_seconds).await
        };
        state.in_flight_fix = None;

        self.emit(RecoveryEvent::FixApplied {
            agent: name.to_string(),
            kind,
            fix,
            success: outcome.success,
            detail: outcome.detail.clone(),
            elapsed_seconds: outcome.elapsed_seconds,
        });
        if transition != BreakerTransition::None {
            self.emit(RecoveryEvent::BreakerChanged {
                agent: name.to_string(),
                fix,
                transition,
            });
        }
        if transition == BreakerTransition::Latched {
            let reason = format!(
                "{} failed to come back after repeated restarts; automatic restarts are suspended until the breaker is reset",
                name
            );
            self.escalate(name, kind.unwrap_or(ErrorKind::ProcessExit), state, reason);
        }

        outcome
    }

    /// Critical alert plus event, once per kind until the agent is healthy again.
    fn escalate(&self, agent: &str, kind: ErrorKind, state: &mut SlotState, reason: String) {
        if !state.alerted.insert(kind) {
            debug!(agent, kind = %kind, "Manual intervention already requested");
            return;
        }
        error!(agent, kind = %kind, "Manual intervention required: {}", reason);
        self.alerts.notify(
            Alert::new(AlertLevel::Critical, "Manual intervention required", reason.clone()).for_agent(agent),
        );
        self.emit(RecoveryEvent::ManualIntervention {
            agent: agent.to_string(),
            reason,
        });
    }

    /// Predicts and schedules maintenance for every agent, then executes
    /// whatever has come due.
    pub async fn run_maintenance(self: &Arc<Self>) -> Vec<MaintenanceRecord> {
        let slots: Vec<Arc<AgentSlot>> = self.slots.read().await.values().cloned().collect();
        for slot in &slots {
            self.schedule_maintenance_for(slot).await;
        }

        let mut records = Vec::new();
        for window in self.scheduler.take_due().await {
            self.alerts.notify(
                Alert::new(
                    AlertLevel::Info,
                    format!("Maintenance due: {}", window.kind),
                    window.reason.clone(),
                )
                .for_agent(window.agent.clone()),
            );
            if let Some(record) = self.execute_maintenance(window).await {
                self.emit(RecoveryEvent::MaintenanceCompleted { record: record.clone() });
                records.push(record);
            }
        }
        records
    }

    async fn schedule_maintenance_for(&self, slot: &AgentSlot) -> Vec<MaintenanceWindow> {
        let name = slot.descriptor.name();
        let trend = {
            let state = slot.state.lock().await;
            HealthTrend::from_history(&state.history, &state.signals)
        };
        let Some(trend) = trend else {
            return Vec::new();
        };

        let scheduled = self.scheduler.evaluate(name, &trend).await;
        for window in &scheduled {
            let level = match window.kind {
                MaintenanceKind::Cleanup => AlertLevel::Warning,
                MaintenanceKind::Restart | MaintenanceKind::Optimize => AlertLevel::Info,
            };
            self.alerts.notify(
                Alert::new(
                    level,
                    format!("Maintenance scheduled: {}", window.kind),
                    format!(
                        "{} at {}",
                        window.reason,
                        window.scheduled_at.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                )
                .for_agent(name),
            );
            self.emit(RecoveryEvent::MaintenanceScheduled { window: window.clone() });
        }
        scheduled
    }

    async fn execute_maintenance(&self, window: MaintenanceWindow) -> Option<MaintenanceRecord> {
        let slot = self.slots.read().await.get(&window.agent).cloned();
        let Some(slot) = slot else {
            return self
                .scheduler
                .complete(window.id, false, "agent is no longer configured")
                .await;
        };

        info!(agent = %window.agent, kind = %window.kind, "Running maintenance: {}", window.reason);
        let (success, notes) = match window.kind {
            MaintenanceKind::Restart | MaintenanceKind::Cleanup => {
                let fix = if window.kind == MaintenanceKind::Restart {
                    FixType::RestartAgent
                } else {
                    FixType::CleanupResources
                };
                let mut state = slot.state.lock().await;
                let capped = if fix == FixType::RestartAgent {
                    self.restart_cap_reached(&mut state).await
                } else {
                    None
                };
                match capped {
                    Some(wait) => (false, format!("restart cap reached, window rolls over in {}s", wait.as_secs())),
                    None if self.breakers.try_acquire(slot.descriptor.name(), fix).await.is_admitted() => {
                        let outcome = self.apply_fix(&slot.descriptor, &mut state, fix, None, None).await;
                        (outcome.success, outcome.detail)
                    }
                    None => (false, format!("{} held open by its circuit breaker", fix)),
                }
            }
            MaintenanceKind::Optimize => {
                let report = self.learner.retune_parameters(self.clock.now()).await;
                (true, format!("retuned parameters (widened: {})", report.widened))
            }
        };

        self.scheduler.complete(window.id, success, notes).await
    }

    pub async fn retune(&self) -> RetuneReport {
        self.learner.retune_parameters(self.clock.now()).await
    }

    /// Replaces the agent roster. Agents whose definition did not change keep
    /// their health history and restart ledger.
    pub async fn apply_config(&self, config: Config) -> Result<()> {
        let wanted: BTreeMap<String, AgentDescriptor> = config
            .agents
            .iter()
            .map(|a| (a.name.clone(), AgentDescriptor::from_config(a)))
            .collect();

        let removed = {
            let mut slots = self.slots.write().await;
            let removed: Vec<String> = slots.keys().filter(|n| !wanted.contains_key(*n)).cloned().collect();
            for name in &removed {
                slots.remove(name);
            }

            for (name, descriptor) in wanted {
                match slots.get(&name).cloned() {
                    Some(slot) if slot.descriptor == descriptor => {}
                    Some(slot) => {
                        info!(agent = %name, "Agent definition changed");
                        let state = std::mem::take(&mut *slot.state.lock().await);
                        slots.insert(
                            name,
                            Arc::new(AgentSlot {
                                descriptor,
                                state: Mutex::new(state),
                            }),
                        );
                    }
                    None => {
                        info!(agent = %name, "Agent added");
                        slots.insert(name, Arc::new(AgentSlot::new(descriptor)));
                    }
                }
            }
            removed
        };

        for name in &removed {
            info!(agent = %name, "Agent removed");
            self.scheduler.forget_agent(name).await;
        }

        let agents = config.agents.len();
        *self.config.write().await = config;
        self.emit(RecoveryEvent::ConfigReloaded { agents });
        Ok(())
    }

    /// Entry point for external anomaly detectors.
    pub async fn ingest_signals(&self, agent: &str, signals: ExternalSignals) -> Result<()> {
        let slot = self.slot(agent).await?;
        slot.state.lock().await.signals = signals;
        Ok(())
    }

    /// Operator reset of a breaker, including a latched restart breaker.
    pub async fn reset_breaker(&self, agent: &str, fix: FixType) -> Result<bool> {
        let slot = self.slot(agent).await?;
        let existed = self.breakers.reset(agent, fix).await;
        if existed {
            slot.state.lock().await.alerted.clear();
            self.emit(RecoveryEvent::BreakerChanged {
                agent: agent.to_string(),
                fix,
                transition: BreakerTransition::Closed,
            });
        }
        Ok(existed)
    }

    /// Injects a fault into one agent and measures how long recovery takes.
    pub async fn inject_scenario(self: &Arc<Self>, agent: &str, scenario: ChaosScenario) -> Result<ChaosResult> {
        let chaos = self.config.read().await.chaos.clone();
        if !chaos.enabled {
            return Err(OrchestratorError::ChaosDisabled);
        }
        let slot = self.slot(agent).await?;
        let injected_at = self.clock.now();
        warn!(agent, scenario = %scenario, "Injecting chaos scenario");

        let (recovery, detail) = match scenario {
            ChaosScenario::AgentCrash => {
                let killed = self.process.terminate(slot.descriptor.process_pattern()).await?;
                let recovery = measure_recovery(chaos.probe_interval, chaos.max_wait, || {
                    let orchestrator = Arc::clone(self);
                    let slot = Arc::clone(&slot);
                    async move {
                        orchestrator.run_agent_cycle(&slot).await;
                        matches!(
                            orchestrator.process.find(slot.descriptor.process_pattern()).await,
                            Ok(Some(_))
                        )
                    }
                })
                .await;
                let detail = if killed == 0 {
                    "agent was not running when the crash was injected".to_string()
                } else {
                    format!("terminated {} process(es)", killed)
                };
                (recovery, detail)
            }
            ChaosScenario::Latency { millis } => {
                slot.state.lock().await.injected_latency = Some(Duration::from_millis(millis));
                let recovery = measure_recovery(chaos.probe_interval, chaos.max_wait, || {
                    let orchestrator = Arc::clone(self);
                    let slot = Arc::clone(&slot);
                    async move { orchestrator.run_agent_cycle(&slot).await.status == HealthStatus::Healthy }
                })
                .await;
                (recovery, format!("{}ms of latency injected into the agent's cycle", millis))
            }
            ChaosScenario::ResourcePressure { resource } => {
                let saved = {
                    let mut state = slot.state.lock().await;
                    let saved = state.signals.clone();
                    match resource {
                        Resource::Memory => {
                            state.signals.memory_percent = Some(90.0);
                            state.signals.memory_growth_per_hour = Some(5.0);
                        }
                        Resource::Disk => {
                            state.signals.disk_percent = Some(90.0);
                            state.signals.disk_growth_per_hour = Some(5.0);
                        }
                    }
                    saved
                };
                let recovery = measure_recovery(chaos.probe_interval, chaos.max_wait, || {
                    let orchestrator = Arc::clone(self);
                    let slot = Arc::clone(&slot);
                    async move {
                        if slot.state.lock().await.history.current().is_none() {
                            orchestrator.run_agent_cycle(&slot).await;
                        }
                        orchestrator.schedule_maintenance_for(&slot).await;
                        orchestrator
                            .scheduler
                            .windows(Some(slot.descriptor.name()))
                            .await
                            .iter()
                            .any(|w| w.kind == MaintenanceKind::Cleanup)
                    }
                })
                .await;
                slot.state.lock().await.signals = saved;
                (recovery, format!("simulated {} pressure at 90%, growing 5%/h", resource))
            }
        };

        let result = ChaosResult::new(scenario, agent, injected_at, recovery, chaos.rto, chaos.max_wait, detail);
        self.chaos.record(result.clone()).await;
        self.emit(RecoveryEvent::ChaosCompleted { result: result.clone() });
        Ok(result)
    }

    pub async fn get_status(&self) -> OrchestratorStatus {
        let breakers = self.breakers.snapshot().await;
        OrchestratorStatus {
            agents: self.slots.read().await.len(),
            started_at: self.started_at,
            ticks: self.ticks.load(Ordering::Relaxed),
            fixes_applied: self.fixes_applied.load(Ordering::Relaxed),
            fixes_failed: self.fixes_failed.load(Ordering::Relaxed),
            fixes_rejected: self.fixes_rejected.load(Ordering::Relaxed),
            incidents: self.rca.incident_count().await,
            open_breakers: breakers.iter().filter(|b| b.breaker.state != BreakerState::Closed).count(),
            pending_maintenance: self.scheduler.windows(None).await.len(),
            parameters: self.learner.parameters().await,
        }
    }

    pub async fn agents(&self) -> Vec<AgentSummary> {
        let slots: Vec<Arc<AgentSlot>> = self.slots.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            let state = slot.state.lock().await;
            let current = state.history.current();
            summaries.push(AgentSummary {
                name: slot.descriptor.name().to_string(),
                process_pattern: slot.descriptor.process_pattern().to_string(),
                status: current.map(|s| s.status),
                running: current.map(|s| s.running).unwrap_or(false),
                last_observed: current.map(|s| s.observed_at),
            });
        }
        summaries
    }

    /// Latest snapshot for an agent, `None` before its first poll.
    pub async fn agent_health(&self, agent: &str) -> Result<Option<HealthSnapshot>> {
        let slot = self.slot(agent).await?;
        let state = slot.state.lock().await;
        Ok(state.history.current().cloned())
    }

    pub async fn incidents(&self, agent: Option<&str>, limit: usize) -> Vec<Incident> {
        self.rca.incidents(agent, limit).await
    }

    pub async fn reports(&self, limit: usize) -> Vec<RcaReport> {
        self.rca.reports(limit).await
    }

    pub async fn breakers(&self) -> Vec<BreakerEntry> {
        self.breakers.snapshot().await
    }

    pub async fn maintenance(&self) -> Vec<MaintenanceWindow> {
        self.scheduler.windows(None).await
    }

    pub async fn maintenance_history(&self, limit: usize) -> Vec<MaintenanceRecord> {
        self.scheduler.history(limit).await
    }

    pub async fn statistics(&self) -> Vec<StatsEntry> {
        self.learner.all_statistics().await
    }

    pub async fn chaos_results(&self, limit: usize) -> Vec<ChaosResult> {
        self.chaos.results(limit).await
    }

    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    /// Writes every store, returning the first failure after trying all of them.
    pub async fn flush_all(&self) -> Result<()> {
        let results = [
            self.learner.flush().await,
            self.breakers.flush().await,
            self.rca.flush().await,
            self.scheduler.flush().await,
            self.chaos.flush().await,
        ];
        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                error!("Final flush failed: {}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn flush_dirty(&self) {
        self.learner.flush_if_dirty().await;
        self.breakers.flush_if_dirty().await;
        self.rca.flush_if_dirty().await;
        self.scheduler.flush_if_dirty().await;
    }

    async fn slot(&self, agent: &str) -> Result<Arc<AgentSlot>> {
        self.slots
            .read()
            .await
            .get(agent)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent.to_string()))
    }

    fn emit(&self, event: RecoveryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Start the fast recovery loop
    async fn start_recovery_loop(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let period = self.config.read().await.monitoring.poll_interval;

        tokio::spawn(async move {
            let mut interval = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Recovery loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        let reports = orchestrator.run_tick().await;
                        let fixes: usize = reports.iter().map(|r| r.fixes.len()).sum();
                        if fixes > 0 {
                            info!("Recovery tick applied {} fixes across {} agents", fixes, reports.len());
                        }
                    }
                }
            }
        })
    }

    /// Start the slower maintenance loop
    async fn start_maintenance_loop(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let period = self.config.read().await.monitoring.maintenance_check_interval;

        tokio::spawn(async move {
            let mut interval = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Maintenance loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        let records = orchestrator.run_maintenance().await;
                        for record in records {
                            info!(
                                agent = %record.window.agent,
                                kind = %record.window.kind,
                                "Maintenance completed (success: {}): {}",
                                record.success,
                                record.notes
                            );
                        }
                    }
                }
            }
        })
    }

    async fn start_retune_loop(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let period = self.config.read().await.monitoring.retune_interval;

        tokio::spawn(async move {
            let mut interval = interval(period);
            // the first tick fires immediately and there is nothing to learn from yet
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Retune loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        orchestrator.retune().await;
                    }
                }
            }
        })
    }

    /// Start configuration watcher background task
    fn start_config_watcher(
        self: &Arc<Self>,
        config_manager: Arc<dyn ConfigManager + Send + Sync>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);

        tokio::spawn(async move {
            match config_manager.watch_config_changes().await {
                Ok(mut config_rx) => loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            debug!("Config watcher task received shutdown signal");
                            break;
                        }
                        new_config = config_rx.recv() => {
                            if let Some(new_config) = new_config {
                                info!("Configuration updated, applying agent roster");
                                if let Err(e) = orchestrator.apply_config(new_config).await {
                                    error!("Failed to apply new configuration: {}", e);
                                }
                            } else {
                                debug!("Config watcher channel closed");
                                break;
                            }
                        }
                    }
                },
                Err(e) => {
                    error!("Failed to start config watcher: {}", e);
                }
            }
        })
    }
}
