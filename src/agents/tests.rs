//! Fixtures shared by the orchestrator tests, plus end-to-end recovery scenarios
//! driven through a fake process table.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

use crate::agents::{AgentDescriptor, Collaborators, RecoveryEvent, RecoveryOrchestrator};
use crate::clock::{Clock, ManualClock};
use crate::config::{AgentConfig, Config};
use crate::error::{OrchestratorError, Result};
use crate::health::{ProcessControl, ProcessInfo};
use crate::storage::{MemoryStore, StateStore};
use crate::webhooks::{Alert, AlertManager, AlertSink};

#[derive(Default)]
pub(crate) struct FakeState {
    /// pattern -> pid
    pub running: BTreeMap<String, u32>,
    pub launch_fails: bool,
    /// How long a launch hangs before it returns.
    pub launch_delay: Duration,
    pub installer_works: bool,
    pub uptime: Duration,
    pub terminate_calls: usize,
    pub launch_calls: usize,
    pub commands: Vec<(String, Vec<String>)>,
    next_pid: u32,
}

/// In-memory process table. Launching an agent makes it "running" unless
/// launches are set to fail.
#[derive(Default)]
pub(crate) struct FakeProcess {
    state: Mutex<FakeState>,
}

impl FakeProcess {
    pub fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn start(&self, pattern: &str) {
        let mut state = self.lock();
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.running.insert(pattern.to_string(), pid);
    }
}

#[async_trait]
impl ProcessControl for FakeProcess {
    async fn find(&self, pattern: &str) -> Result<Option<ProcessInfo>> {
        let state = self.lock();
        Ok(state.running.get(pattern).map(|pid| ProcessInfo {
            pid: *pid,
            uptime: state.uptime,
            memory_bytes: 64 * 1024 * 1024,
            memory_percent: 10.0,
        }))
    }

    async fn terminate(&self, pattern: &str) -> Result<usize> {
        let mut state = self.lock();
        state.terminate_calls += 1;
        Ok(state.running.remove(pattern).map(|_| 1).unwrap_or(0))
    }

    async fn launch(&self, agent: &AgentDescriptor) -> Result<u32> {
        let delay = self.lock().launch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.launch_calls += 1;
        if state.launch_fails {
            return Err(OrchestratorError::ProcessControl("exec format error".into()));
        }
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.running.insert(agent.process_pattern().to_string(), pid);
        Ok(pid)
    }

    async fn run_command(&self, program: &str, args: &[String]) -> Result<bool> {
        let mut state = self.lock();
        state.commands.push((program.to_string(), args.to_vec()));
        Ok(state.installer_works)
    }
}

pub(crate) struct RecordingSink(pub mpsc::UnboundedSender<Alert>);

#[async_trait]
impl AlertSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        let _ = self.0.send(alert.clone());
        Ok(())
    }
}

/// Fast, deterministic settings: no backoff, no settle delay, quick chaos probes.
pub(crate) fn test_config(dir: &Path, names: &[&str]) -> Config {
    let mut config = Config::default();
    config.agents = names
        .iter()
        .map(|name| AgentConfig {
            name: name.to_string(),
            process_pattern: format!("{}.py", name),
            log_path: dir.join(format!("{}.log", name)),
            command: Some(vec!["python3".to_string(), format!("{}.py", name)]),
            env: BTreeMap::new(),
            working_dir: None,
            cleanup_paths: Vec::new(),
        })
        .collect();
    config.recovery.backoff_initial_seconds = 0.0;
    config.recovery.restart_settle = Duration::ZERO;
    config.recovery.fix_timeout = Duration::from_secs(5);
    config.chaos.probe_interval = Duration::from_millis(10);
    config.chaos.max_wait = Duration::from_secs(2);
    config
}

pub(crate) fn append_log(dir: &Path, agent: &str, lines: &[&str]) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{}.log", agent)))
        .unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
}

pub(crate) fn drain(rx: &mut broadcast::Receiver<RecoveryEvent>) -> Vec<RecoveryEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) struct Harness {
    pub orchestrator: Arc<RecoveryOrchestrator>,
    pub process: Arc<FakeProcess>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub alerts: mpsc::UnboundedReceiver<Alert>,
    pub dir: TempDir,
}

pub(crate) async fn harness(names: &[&str], configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), names);
    configure(&mut config);

    let process = Arc::new(FakeProcess::default());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
    let store = Arc::new(MemoryStore::new());
    let (tx, alerts) = mpsc::unbounded_channel();
    let mut manager = AlertManager::new();
    manager.add_sink(Arc::new(RecordingSink(tx)));

    let collaborators = Collaborators {
        store: store.clone() as Arc<dyn StateStore>,
        process: process.clone() as Arc<dyn ProcessControl>,
        clock: clock.clone(),
        reasoner: None,
        alerts: manager,
    };
    let orchestrator = Arc::new(RecoveryOrchestrator::new(config, collaborators).await.unwrap());

    Harness {
        orchestrator,
        process,
        clock,
        store,
        alerts,
        dir,
    }
}

mod scenarios {
    use super::*;
    use crate::classifier::ErrorKind;
    use crate::health::{ExternalSignals, HealthStatus};
    use crate::maintenance::MaintenanceKind;
    use crate::recovery::{BreakerState, BreakerTransition, FixType};
    use crate::webhooks::AlertLevel;

    #[tokio::test]
    async fn test_missing_dependency_is_installed() {
        let h = harness(&["worker-1"], |_| {}).await;
        h.process.start("worker-1.py");
        h.process.lock().installer_works = true;
        append_log(
            h.dir.path(),
            "worker-1",
            &[
                "INFO starting up",
                "Traceback (most recent call last):",
                "ModuleNotFoundError: No module named 'foo'",
            ],
        );

        let report = h.orchestrator.run_agent("worker-1").await.unwrap();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.failures, vec![ErrorKind::MissingDependency]);
        assert_eq!(report.fixes.len(), 1);
        assert_eq!(report.fixes[0].fix, FixType::InstallDependency);
        assert!(report.fixes[0].success, "{}", report.fixes[0].detail);

        let commands = h.process.lock().commands.clone();
        assert_eq!(
            commands,
            vec![(
                "python3".to_string(),
                vec!["-m", "pip", "install", "foo"].into_iter().map(String::from).collect::<Vec<_>>()
            )]
        );
        // the agent was running, nothing was restarted
        assert_eq!(h.process.lock().launch_calls, 0);

        let incidents = h.orchestrator.incidents(Some("worker-1"), 10).await;
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].root_cause, "missing_dependency");
        assert_eq!(incidents[0].fix, Some(FixType::InstallDependency));
        assert!(incidents[0].success);
        assert_eq!(h.orchestrator.reports(10).await.len(), 1);

        // same tail, nothing new to answer
        let again = h.orchestrator.run_agent("worker-1").await.unwrap();
        assert!(again.fixes.is_empty());
        assert_eq!(h.process.lock().commands.len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_agent_is_restarted() {
        let h = harness(&["worker-1"], |_| {}).await;
        let mut events = h.orchestrator.subscribe();

        let report = h.orchestrator.run_agent("worker-1").await.unwrap();
        assert_eq!(report.status, HealthStatus::Stopped);
        assert_eq!(report.failures, vec![ErrorKind::Unknown]);
        assert_eq!(report.fixes[0].fix, FixType::RestartAgent);
        assert!(report.fixes[0].success);

        let health = h.orchestrator.run_agent("worker-1").await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            RecoveryEvent::FixApplied { fix: FixType::RestartAgent, success: true, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            RecoveryEvent::HealthChanged { to: HealthStatus::Healthy, .. }
        )));
    }

    #[tokio::test]
    async fn test_failed_restarts_open_then_probe_closes_breaker() {
        let h = harness(&["worker-2"], |_| {}).await;
        h.process.lock().launch_fails = true;

        for _ in 0..3 {
            let report = h.orchestrator.run_agent("worker-2").await.unwrap();
            assert!(!report.fixes[0].success);
        }
        let breakers = h.orchestrator.breakers().await;
        assert_eq!(breakers.len(), 1);
        assert_eq!(breakers[0].breaker.state, BreakerState::Open);
        assert_eq!(breakers[0].breaker.consecutive_failures, 3);

        // within cooldown the process table is not touched
        let report = h.orchestrator.run_agent("worker-2").await.unwrap();
        assert!(report.fixes.is_empty());
        assert_eq!(report.rejected, vec![FixType::RestartAgent]);
        assert_eq!(h.process.lock().launch_calls, 3);
        assert_eq!(h.process.lock().terminate_calls, 3);

        h.clock.advance(Duration::from_secs(301));
        h.process.lock().launch_fails = false;

        let report = h.orchestrator.run_agent("worker-2").await.unwrap();
        assert!(report.fixes[0].success);
        let breakers = h.orchestrator.breakers().await;
        assert_eq!(breakers[0].breaker.state, BreakerState::Closed);
        assert_eq!(breakers[0].breaker.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_restart_cap_latches_until_reset() {
        let mut h = harness(&["worker-2"], |_| {}).await;
        h.process.lock().launch_fails = true;
        let mut events = h.orchestrator.subscribe();

        for _ in 0..3 {
            h.orchestrator.run_agent("worker-2").await.unwrap();
        }
        for _ in 0..2 {
            h.clock.advance(Duration::from_secs(301));
            let report = h.orchestrator.run_agent("worker-2").await.unwrap();
            assert_eq!(report.fixes.len(), 1, "probe should be admitted after cooldown");
        }

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            RecoveryEvent::BreakerChanged { transition: BreakerTransition::Latched, .. }
        )));
        assert!(events.iter().any(|e| matches!(e, RecoveryEvent::ManualIntervention { .. })));

        let alert = tokio::time::timeout(Duration::from_secs(1), h.alerts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.level, AlertLevel::Critical);
        assert_eq!(alert.agent.as_deref(), Some("worker-2"));

        // latched: no cooldown ever admits another restart
        h.clock.advance(Duration::from_secs(3600));
        let report = h.orchestrator.run_agent("worker-2").await.unwrap();
        assert!(report.fixes.is_empty());
        assert!(report.manual_intervention);
        assert_eq!(h.process.lock().launch_calls, 5);

        assert!(h.orchestrator.reset_breaker("worker-2", FixType::RestartAgent).await.unwrap());
        h.process.lock().launch_fails = false;
        let report = h.orchestrator.run_agent("worker-2").await.unwrap();
        assert!(report.fixes[0].success);
    }

    #[tokio::test]
    async fn test_repeated_failure_is_remediated_every_cycle() {
        let h = harness(&["worker-1"], |_| {}).await;
        h.process.start("worker-1.py");

        for cycle in 0..4 {
            append_log(h.dir.path(), "worker-1", &["ModuleNotFoundError: No module named 'foo'"]);
            let report = h.orchestrator.run_agent("worker-1").await.unwrap();
            assert_eq!(report.failures, vec![ErrorKind::MissingDependency], "cycle {}", cycle);
            assert_eq!(report.fixes.len(), 1, "cycle {}", cycle);
        }

        let attempts: u64 = h
            .orchestrator
            .statistics()
            .await
            .iter()
            .filter(|e| e.agent == "worker-1" && e.kind == ErrorKind::MissingDependency)
            .map(|e| e.stats.attempts)
            .sum();
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn test_failed_fix_is_retried_without_new_log_lines() {
        let h = harness(&["worker-1"], |_| {}).await;
        h.process.start("worker-1.py");
        append_log(h.dir.path(), "worker-1", &["ModuleNotFoundError: No module named 'foo'"]);

        let first = h.orchestrator.run_agent("worker-1").await.unwrap();
        assert_eq!(first.fixes[0].fix, FixType::InstallDependency);
        assert!(!first.fixes[0].success);

        // the failed install demoted itself, the restart is tried next
        let second = h.orchestrator.run_agent("worker-1").await.unwrap();
        assert_eq!(second.fixes.len(), 1);
        assert_eq!(second.fixes[0].fix, FixType::RestartAgent);
        assert!(second.fixes[0].success);

        let third = h.orchestrator.run_agent("worker-1").await.unwrap();
        assert!(third.fixes.is_empty());
        assert_eq!(h.process.lock().launch_calls, 1);
    }

    #[tokio::test]
    async fn test_restart_cap_stops_a_crash_loop() {
        let mut h = harness(&["worker-1"], |_| {}).await;

        let mut reports = Vec::new();
        for _ in 0..8 {
            h.process.lock().running.clear();
            reports.push(h.orchestrator.run_agent("worker-1").await.unwrap());
            h.clock.advance(Duration::from_secs(60));
        }
        assert_eq!(h.process.lock().launch_calls, 5);
        assert!(reports[..5].iter().all(|r| r.fixes.len() == 1 && r.fixes[0].success));
        for report in &reports[5..] {
            assert!(report.fixes.is_empty());
            assert_eq!(report.rejected, vec![FixType::RestartAgent]);
            assert!(report.manual_intervention);
        }

        let alert = tokio::time::timeout(Duration::from_secs(1), h.alerts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.level, AlertLevel::Critical);
        assert!(alert.message.starts_with("Max restarts reached"), "{}", alert.message);
        // one alert for the whole loop
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.alerts.try_recv().is_err());

        // the window rolls over and restarts resume
        h.clock.advance(Duration::from_secs(53 * 60));
        h.process.lock().running.clear();
        let report = h.orchestrator.run_agent("worker-1").await.unwrap();
        assert!(report.fixes[0].success);
        assert_eq!(h.process.lock().launch_calls, 6);
    }

    #[tokio::test]
    async fn test_cycle_timeout_returns_probe_to_open() {
        let h = harness(&["worker-2"], |c| c.recovery.cycle_timeout = Duration::from_millis(100)).await;
        h.process.lock().launch_fails = true;
        for _ in 0..3 {
            h.orchestrator.run_agent("worker-2").await.unwrap();
        }

        h.clock.advance(Duration::from_secs(301));
        {
            let mut process = h.process.lock();
            process.launch_fails = false;
            process.launch_delay = Duration::from_secs(5);
        }
        let reports = h.orchestrator.run_tick().await;
        assert!(reports.is_empty());

        let breakers = h.orchestrator.breakers().await;
        assert_eq!(breakers.len(), 1);
        assert_eq!(breakers[0].breaker.state, BreakerState::Open);
        assert_eq!(breakers[0].breaker.consecutive_failures, 3);

        // the cancelled probe used up this cooldown
        h.process.lock().launch_delay = Duration::ZERO;
        let report = h.orchestrator.run_agent("worker-2").await.unwrap();
        assert!(report.fixes.is_empty());
        assert_eq!(report.rejected, vec![FixType::RestartAgent]);
    }

    #[tokio::test]
    async fn test_localhost_dependency_needs_a_human() {
        let mut h = harness(&["worker-1"], |_| {}).await;
        h.process.start("worker-1.py");
        append_log(h.dir.path(), "worker-1", &["Failed to reach http://localhost:8000/api"]);

        let report = h.orchestrator.run_agent("worker-1").await.unwrap();
        assert_eq!(report.failures, vec![ErrorKind::LocalhostDependency]);
        assert!(report.fixes.is_empty());
        assert!(report.manual_intervention);

        let alert = tokio::time::timeout(Duration::from_secs(1), h.alerts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.title, "Manual intervention required");

        let incidents = h.orchestrator.incidents(None, 10).await;
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].fix, None);
        assert!(!incidents[0].success);
        assert_eq!(h.process.lock().launch_calls, 0);
    }

    #[tokio::test]
    async fn test_long_uptime_schedules_and_runs_preventive_restart() {
        let h = harness(&["worker-3"], |_| {}).await;
        h.process.start("worker-3.py");
        h.process.lock().uptime = Duration::from_secs(50 * 3600);
        append_log(h.dir.path(), "worker-3", &["INFO heartbeat"]);
        h.orchestrator
            .ingest_signals(
                "worker-3",
                ExternalSignals {
                    error_rate: Some(0.05),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        h.orchestrator.run_agent("worker-3").await.unwrap();
        let records = h.orchestrator.run_maintenance().await;
        assert!(records.is_empty());

        let windows = h.orchestrator.maintenance().await;
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].kind, MaintenanceKind::Restart);
        assert_eq!(windows[0].scheduled_at, h.clock.now() + chrono::Duration::hours(1));
        assert!(windows[0].reason.contains("uptime: 50.0h"));

        h.clock.advance(Duration::from_secs(3601));
        let records = h.orchestrator.run_maintenance().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].success, "{}", records[0].notes);
        assert_eq!(h.process.lock().launch_calls, 1);
        assert!(h.orchestrator.maintenance().await.is_empty());
        assert_eq!(h.orchestrator.maintenance_history(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_an_error() {
        let h = harness(&["worker-1"], |_| {}).await;
        assert!(matches!(
            h.orchestrator.run_agent("worker-9").await,
            Err(OrchestratorError::UnknownAgent(_))
        ));
        assert!(h.orchestrator.agent_health("worker-9").await.is_err());
        assert!(h.orchestrator.agent_health("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tick_covers_every_agent_and_persists() {
        let h = harness(&["worker-1", "worker-2"], |_| {}).await;
        h.process.start("worker-1.py");

        let mut reports = h.orchestrator.run_tick().await;
        reports.sort_by(|a, b| a.agent.cmp(&b.agent));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].status, HealthStatus::Healthy);
        assert_eq!(reports[1].status, HealthStatus::Stopped);
        assert!(reports[1].fixes[0].success);

        let status = h.orchestrator.get_status().await;
        assert_eq!(status.ticks, 1);
        assert_eq!(status.fixes_applied, 1);
        assert_eq!(status.incidents, 1);

        h.orchestrator.flush_all().await.unwrap();
        assert!(!h.store.is_empty().await);
    }
}
