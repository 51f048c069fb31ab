use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use recovery_orchestrator::agents::AgentDescriptor;
use recovery_orchestrator::chaos::ChaosScenario;
use recovery_orchestrator::clock::SystemClock;
use recovery_orchestrator::config::Config;
use recovery_orchestrator::health::{ProcessControl, ProcessInfo};
use recovery_orchestrator::maintenance::Resource;
use recovery_orchestrator::storage::MemoryStore;
use recovery_orchestrator::webhooks::AlertManager;
use recovery_orchestrator::{Collaborators, RecoveryEvent, RecoveryOrchestrator, Result};

/// Pretend process table: relaunching takes a moment, nothing is spawned.
#[derive(Default)]
struct SimulatedProcesses {
    running: Mutex<BTreeMap<String, u32>>,
    next_pid: Mutex<u32>,
}

#[async_trait]
impl ProcessControl for SimulatedProcesses {
    async fn find(&self, pattern: &str) -> Result<Option<ProcessInfo>> {
        Ok(self.running.lock().await.get(pattern).map(|pid| ProcessInfo {
            pid: *pid,
            uptime: Duration::from_secs(120),
            memory_bytes: 128 * 1024 * 1024,
            memory_percent: 12.5,
        }))
    }

    async fn terminate(&self, pattern: &str) -> Result<usize> {
        Ok(self.running.lock().await.remove(pattern).map(|_| 1).unwrap_or(0))
    }

    async fn launch(&self, agent: &AgentDescriptor) -> Result<u32> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut next_pid = self.next_pid.lock().await;
        *next_pid += 1;
        let pid = 4000 + *next_pid;
        self.running.lock().await.insert(agent.process_pattern().to_string(), pid);
        Ok(pid)
    }

    async fn run_command(&self, program: &str, args: &[String]) -> Result<bool> {
        info!("(simulated) {} {}", program, args.join(" "));
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    info!("Starting chaos drill demo");

    let log_dir = tempfile::tempdir()?;
    let mut config = Config::default();
    config.agents[0].log_path = log_dir.path().join("worker-1.log");
    config.recovery.backoff_initial_seconds = 0.5;
    config.recovery.restart_settle = Duration::from_millis(200);
    config.chaos.enabled = true;
    config.chaos.probe_interval = Duration::from_millis(500);
    config.chaos.max_wait = Duration::from_secs(10);
    config.chaos.rto = Duration::from_secs(5);

    let processes = Arc::new(SimulatedProcesses::default());
    let pattern = config.agents[0].process_pattern.clone();
    processes.running.lock().await.insert(pattern, 4000);

    let collaborators = Collaborators {
        store: Arc::new(MemoryStore::new()),
        process: processes.clone(),
        clock: Arc::new(SystemClock),
        reasoner: None,
        alerts: AlertManager::new(),
    };
    let orchestrator = Arc::new(RecoveryOrchestrator::new(config, collaborators).await?);

    // printing events as they happen
    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RecoveryEvent::FixApplied { agent, fix, success, detail, .. } => {
                    info!("{}: {} -> success={} ({})", agent, fix, success, detail);
                }
                RecoveryEvent::ChaosCompleted { result } => {
                    info!(
                        "Drill {} on {}: recovered={} in {:.1}s, within RTO: {}",
                        result.scenario, result.agent, result.recovered, result.recovery_seconds, result.within_rto
                    );
                }
                other => info!("Event: {:?}", other),
            }
        }
    });

    let drills = [
        ChaosScenario::AgentCrash,
        ChaosScenario::Latency { millis: 750 },
        ChaosScenario::ResourcePressure { resource: Resource::Disk },
    ];
    for scenario in drills {
        match orchestrator.inject_scenario("worker-1", scenario).await {
            Ok(result) if !result.within_rto => warn!("{} missed its RTO", result.scenario),
            Ok(_) => {}
            Err(e) => warn!("Drill failed to run: {}", e),
        }
    }

    let status = orchestrator.get_status().await;
    info!(
        "Fixes applied: {}, failed: {}, incidents: {}, pending maintenance: {}",
        status.fixes_applied, status.fixes_failed, status.incidents, status.pending_maintenance
    );

    orchestrator.stop().await?;
    printer.abort();
    info!("Chaos drill demo finished");
    Ok(())
}
