use async_trait::async_trait;
use serde::Serialize;
use std::fs::OpenOptions;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{Pid, PidExt, ProcessExt, Signal, System, SystemExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agents::AgentDescriptor;
use crate::error::{OrchestratorError, Result};

/// A live process matched by an agent's pattern.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
    pub memory_bytes: u64,
    /// Share of host memory, 0-100.
    pub memory_percent: f64,
}

/// Everything the orchestrator does to the outside process table goes
/// through here so tests can substitute a fake.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn find(&self, pattern: &str) -> Result<Option<ProcessInfo>>;
    /// Sends a termination signal to every match. Returns how many were signalled.
    async fn terminate(&self, pattern: &str) -> Result<usize>;
    /// Relaunches the agent detached, appending its output to the agent log.
    async fn launch(&self, agent: &AgentDescriptor) -> Result<u32>;
    /// Runs a command to completion and reports whether it exited successfully.
    async fn run_command(&self, program: &str, args: &[String]) -> Result<bool>;
}

pub struct SysinfoProcessControl {
    system: Mutex<System>,
    own_pid: Option<Pid>,
}

impl SysinfoProcessControl {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            own_pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn matches(process: &sysinfo::Process, pattern: &str) -> bool {
        let cmd = process.cmd();
        if cmd.is_empty() {
            process.name().contains(pattern)
        } else {
            cmd.join(" ").contains(pattern)
        }
    }
}

impl Default for SysinfoProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessControl for SysinfoProcessControl {
    async fn find(&self, pattern: &str) -> Result<Option<ProcessInfo>> {
        let mut system = self.system.lock().await;
        system.refresh_processes();
        system.refresh_memory();
        let total_memory = system.total_memory();

        let found = system
            .processes()
            .iter()
            .filter(|(pid, _)| Some(**pid) != self.own_pid)
            .filter(|(_, process)| Self::matches(process, pattern))
            .min_by_key(|(pid, _)| pid.as_u32())
            .map(|(pid, process)| {
                let memory_bytes = process.memory();
                let memory_percent = if total_memory > 0 {
                    memory_bytes as f64 / total_memory as f64 * 100.0
                } else {
                    0.0
                };
                ProcessInfo {
                    pid: pid.as_u32(),
                    uptime: Duration::from_secs(process.run_time()),
                    memory_bytes,
                    memory_percent,
                }
            });

        Ok(found)
    }

    async fn terminate(&self, pattern: &str) -> Result<usize> {
        let mut system = self.system.lock().await;
        system.refresh_processes();

        let mut signalled = 0;
        for (pid, process) in system.processes() {
            if Some(*pid) == self.own_pid || !Self::matches(process, pattern) {
                continue;
            }
            let sent = match process.kill_with(Signal::Term) {
                Some(sent) => sent,
                None => process.kill(),
            };
            if sent {
                debug!("Sent termination signal to pid {}", pid);
                signalled += 1;
            } else {
                warn!("Failed to signal pid {} matching '{}'", pid, pattern);
            }
        }

        Ok(signalled)
    }

    async fn launch(&self, agent: &AgentDescriptor) -> Result<u32> {
        let spec = agent.launch().ok_or_else(|| {
            OrchestratorError::ProcessControl(format!("Agent '{}' has no launch command", agent.name()))
        })?;

        if let Some(parent) = agent.log_path().parent() {
            std::fs::create_dir_all(parent).map_err(|e| OrchestratorError::ProcessControl(e.to_string()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(agent.log_path())
            .map_err(|e| OrchestratorError::ProcessControl(format!("Failed to open log for {}: {}", agent.name(), e)))?;
        let log_err = log
            .try_clone()
            .map_err(|e| OrchestratorError::ProcessControl(e.to_string()))?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(ref dir) = spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| OrchestratorError::ProcessControl(format!("Failed to launch {}: {}", agent.name(), e)))?;
        let pid = child.id().ok_or_else(|| {
            OrchestratorError::ProcessControl(format!("Launched {} exited before reporting a pid", agent.name()))
        })?;

        // reap the child whenever it exits
        let name = agent.name().to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Agent {} (pid {}) exited with {}", name, pid, status),
                Err(e) => warn!("Failed to wait on agent {} (pid {}): {}", name, pid, e),
            }
        });

        info!("Launched agent {} with pid {}", agent.name(), pid);
        Ok(pid)
    }

    async fn run_command(&self, program: &str, args: &[String]) -> Result<bool> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| OrchestratorError::ProcessControl(format!("Failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            warn!(
                "{} {:?} exited with {}: {}",
                program,
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }
}
