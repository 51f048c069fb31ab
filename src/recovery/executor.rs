use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::agents::AgentDescriptor;
use crate::classifier::Classification;
use crate::clock::seconds_between;
use crate::config::RecoveryConfig;
use crate::error::{OrchestratorError, Result};
use crate::health::ProcessControl;
use crate::recovery::{FixType, StrategyParameters};

/// Restarts of one agent inside the rolling window. The count is the
/// exponent of the restart backoff.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestartLedger {
    pub count: u32,
    pub window_started: Option<DateTime<Utc>>,
}

impl RestartLedger {
    pub fn restarts_in_window(&mut self, now: DateTime<Utc>, window: Duration) -> u32 {
        if let Some(started) = self.window_started {
            if seconds_between(started, now) > window.as_secs_f64() {
                debug!("Restart window elapsed, resetting count of {}", self.count);
                self.count = 0;
                self.window_started = Some(now);
            }
        }
        self.count
    }

    /// Time left before the current window rolls over.
    pub fn window_remaining(&self, now: DateTime<Utc>, window: Duration) -> Duration {
        match self.window_started {
            Some(started) => Duration::from_secs_f64((window.as_secs_f64() - seconds_between(started, now)).max(0.0)),
            None => Duration::ZERO,
        }
    }

    pub fn record_restart(&mut self, now: DateTime<Utc>) {
        if self.window_started.is_none() {
            self.window_started = Some(now);
        }
        self.count = self.count.saturating_add(1);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FixOutcome {
    pub fix: FixType,
    pub success: bool,
    pub detail: String,
    pub elapsed_seconds: f64,
}

/// Applies catalog fixes against the process table and file system.
pub struct FixExecutor {
    process: Arc<dyn ProcessControl>,
    fix_timeout: Duration,
    restart_settle: Duration,
    dependency_installer: Vec<String>,
}

impl FixExecutor {
    pub fn new(process: Arc<dyn ProcessControl>, config: &RecoveryConfig) -> Self {
        Self {
            process,
            fix_timeout: config.fix_timeout,
            restart_settle: config.restart_settle,
            dependency_installer: config.dependency_installer.clone(),
        }
    }

    /// Runs `fix` under the fix timeout (plus any backoff it waits out).
    /// Timeouts and process-control errors are reported as failed outcomes.
    pub async fn apply(
        &self,
        fix: FixType,
        agent: &AgentDescriptor,
        classification: Option<&Classification>,
        params: &StrategyParameters,
        restarts_in_window: u32,
    ) -> FixOutcome {
        let started = Instant::now();
        let backoff = match fix {
            FixType::RestartAgent => with_jitter(params.backoff_for(restarts_in_window)),
            FixType::RetryWithBackoff | FixType::IncreaseTimeout => params.backoff_for(0),
            _ => Duration::ZERO,
        };
        let detail = classification.and_then(|c| c.detail.as_deref());

        info!(agent = agent.name(), fix = %fix, "Applying fix");

        let result = timeout(self.fix_timeout + backoff, self.run(fix, agent, detail, backoff)).await;
        let (success, detail) = match result {
            Ok(Ok(message)) => (true, message),
            Ok(Err(FixFailure::Declined(message))) => (false, message),
            Ok(Err(FixFailure::Error(e))) => {
                warn!(agent = agent.name(), fix = %fix, policy = ?e.policy(), "Fix errored: {}", e);
                (false, e.to_string())
            }
            Err(_) => {
                warn!(agent = agent.name(), fix = %fix, "Fix timed out");
                (false, format!("timed out after {:?}", self.fix_timeout + backoff))
            }
        };

        FixOutcome {
            fix,
            success,
            detail,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        }
    }

    async fn run(
        &self,
        fix: FixType,
        agent: &AgentDescriptor,
        detail: Option<&str>,
        backoff: Duration,
    ) -> std::result::Result<String, FixFailure> {
        match fix {
            FixType::RestartAgent => self.restart(agent, backoff).await,
            FixType::InstallDependency => {
                let module = detail.ok_or_else(|| FixFailure::Declined("no module name captured".into()))?;
                self.install(module).await
            }
            FixType::CreateMissingPath => {
                let path = detail.ok_or_else(|| FixFailure::Declined("no path captured".into()))?;
                create_missing_path(Path::new(path)).await.map_err(FixFailure::Error)
            }
            FixType::RetryWithBackoff | FixType::IncreaseTimeout => {
                // the agent's own retry logic does the work, we only give it room
                sleep(backoff).await;
                match self.process.find(agent.process_pattern()).await? {
                    Some(info) => Ok(format!("agent still alive (pid {}) after {:?}", info.pid, backoff)),
                    None => Err(FixFailure::Declined("agent is not running".into())),
                }
            }
            FixType::CleanupResources => cleanup_paths(agent.cleanup_paths()).await,
        }
    }

    async fn restart(&self, agent: &AgentDescriptor, backoff: Duration) -> std::result::Result<String, FixFailure> {
        let signalled = self.process.terminate(agent.process_pattern()).await?;
        debug!(agent = agent.name(), signalled, ?backoff, "Waiting before relaunch");
        sleep(backoff).await;

        let pid = self.process.launch(agent).await?;
        sleep(self.restart_settle).await;

        match self.process.find(agent.process_pattern()).await? {
            Some(info) => Ok(format!("relaunched as pid {} (now {})", pid, info.pid)),
            None => Err(FixFailure::Declined(format!("relaunched pid {} did not stay up", pid))),
        }
    }

    async fn install(&self, module: &str) -> std::result::Result<String, FixFailure> {
        let Some((program, base_args)) = self.dependency_installer.split_first() else {
            return Err(FixFailure::Declined("no dependency installer configured".into()));
        };
        let mut args = base_args.to_vec();
        args.push(module.to_string());

        if self.process.run_command(program, &args).await? {
            Ok(format!("installed {}", module))
        } else {
            Err(FixFailure::Declined(format!("installer failed for {}", module)))
        }
    }
}

enum FixFailure {
    /// The fix ran, or could not run, and did not help.
    Declined(String),
    Error(OrchestratorError),
}

impl From<OrchestratorError> for FixFailure {
    fn from(e: OrchestratorError) -> Self {
        FixFailure::Error(e)
    }
}

fn with_jitter(backoff: Duration) -> Duration {
    if backoff.is_zero() {
        return backoff;
    }
    let jitter = rand::thread_rng().gen_range(0.0..=0.1);
    backoff.mul_f64(1.0 + jitter)
}

/// A path with an extension becomes an empty JSON document; anything else a directory.
async fn create_missing_path(path: &Path) -> Result<String> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(format!("{} already exists", path.display()));
    }

    if path.extension().is_some() {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, "{}").await?;
    } else {
        tokio::fs::create_dir_all(path).await?;
    }

    info!("Created missing path {}", path.display());
    Ok(format!("created {}", path.display()))
}

async fn cleanup_paths(paths: &[std::path::PathBuf]) -> std::result::Result<String, FixFailure> {
    if paths.is_empty() {
        return Err(FixFailure::Declined("no cleanup paths configured".into()));
    }

    let mut removed = 0usize;
    for path in paths {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(FixFailure::Error(e.into())),
        };

        if metadata.is_dir() {
            let mut dir = tokio::fs::read_dir(path).await.map_err(OrchestratorError::from)?;
            while let Some(entry) = dir.next_entry().await.map_err(OrchestratorError::from)? {
                let entry_path = entry.path();
                let result = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    tokio::fs::remove_dir_all(&entry_path).await
                } else {
                    tokio::fs::remove_file(&entry_path).await
                };
                match result {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Could not remove {}: {}", entry_path.display(), e),
                }
            }
        } else {
            // truncate files in place so open handles stay valid
            tokio::fs::write(path, b"").await.map_err(OrchestratorError::from)?;
            removed += 1;
        }
    }

    Ok(format!("cleaned {} entries", removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ErrorKind, Severity};
    use crate::health::process::MockProcessControl;
    use crate::health::ProcessInfo;
    use mockall::predicate::eq;
    use tempfile::tempdir;

    fn quick_config() -> RecoveryConfig {
        RecoveryConfig {
            restart_settle: Duration::ZERO,
            fix_timeout: Duration::from_secs(5),
            ..RecoveryConfig::default()
        }
    }

    fn quick_params() -> StrategyParameters {
        StrategyParameters {
            backoff_initial_seconds: 0.0,
            backoff_multiplier: 2.0,
            backoff_max_seconds: 60.0,
            cooldown_seconds: 300.0,
        }
    }

    fn classification(kind: ErrorKind, detail: &str) -> Classification {
        Classification {
            kind,
            severity: Severity::High,
            matched: String::new(),
            detail: Some(detail.to_string()),
        }
    }

    #[tokio::test]
    async fn test_install_runs_configured_installer() {
        let mut mock = MockProcessControl::new();
        mock.expect_run_command()
            .withf(|program, args| {
                program == "python3" && args == ["-m", "pip", "install", "foo"].map(String::from)
            })
            .times(1)
            .returning(|_, _| Ok(true));

        let executor = FixExecutor::new(Arc::new(mock), &quick_config());
        let agent = AgentDescriptor::new("worker-1", "worker_1.py", "/tmp/w.log");
        let outcome = executor
            .apply(
                FixType::InstallDependency,
                &agent,
                Some(&classification(ErrorKind::MissingDependency, "foo")),
                &quick_params(),
                0,
            )
            .await;
        assert!(outcome.success, "{}", outcome.detail);
    }

    #[tokio::test]
    async fn test_install_without_module_fails_without_running_anything() {
        let mut mock = MockProcessControl::new();
        mock.expect_run_command().times(0);
        let executor = FixExecutor::new(Arc::new(mock), &quick_config());
        let agent = AgentDescriptor::new("worker-1", "worker_1.py", "/tmp/w.log");

        let outcome = executor
            .apply(FixType::InstallDependency, &agent, None, &quick_params(), 0)
            .await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_restart_terminates_launches_and_verifies() {
        let mut mock = MockProcessControl::new();
        mock.expect_terminate().with(eq("worker_2.py")).times(1).returning(|_| Ok(1));
        mock.expect_launch().times(1).returning(|_| Ok(4242));
        mock.expect_find().times(1).returning(|_| {
            Ok(Some(ProcessInfo {
                pid: 4242,
                uptime: Duration::from_secs(1),
                memory_bytes: 0,
                memory_percent: 0.0,
            }))
        });

        let executor = FixExecutor::new(Arc::new(mock), &quick_config());
        let agent = AgentDescriptor::new("worker-2", "worker_2.py", "/tmp/w2.log");
        let outcome = executor
            .apply(FixType::RestartAgent, &agent, None, &quick_params(), 0)
            .await;
        assert!(outcome.success, "{}", outcome.detail);
    }

    #[tokio::test]
    async fn test_launch_error_counts_as_failure() {
        let mut mock = MockProcessControl::new();
        mock.expect_terminate().returning(|_| Ok(0));
        mock.expect_launch()
            .returning(|_| Err(OrchestratorError::ProcessControl("no launch command".into())));
        mock.expect_find().times(0);

        let executor = FixExecutor::new(Arc::new(mock), &quick_config());
        let agent = AgentDescriptor::new("worker-2", "worker_2.py", "/tmp/w2.log");
        let outcome = executor
            .apply(FixType::RestartAgent, &agent, None, &quick_params(), 0)
            .await;
        assert!(!outcome.success);
        assert!(outcome.detail.contains("no launch command"));
    }

    #[tokio::test]
    async fn test_create_missing_file_and_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("state/cache.json");
        let folder = dir.path().join("runtime/queue");

        create_missing_path(&file).await.unwrap();
        create_missing_path(&folder).await.unwrap();

        assert_eq!(std::fs::read_to_string(&file).unwrap(), "{}");
        assert!(folder.is_dir());
        assert!(create_missing_path(&file).await.unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn test_cleanup_empties_configured_paths() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(cache.join("nested")).unwrap();
        std::fs::write(cache.join("a.tmp"), "x").unwrap();
        let spill = dir.path().join("spill.log");
        std::fs::write(&spill, "lots of data").unwrap();

        let result = cleanup_paths(&[cache.clone(), spill.clone()]).await;
        assert!(result.is_ok());
        assert_eq!(std::fs::read_dir(&cache).unwrap().count(), 0);
        assert_eq!(std::fs::read_to_string(&spill).unwrap(), "");
    }

    #[test]
    fn test_restart_ledger_resets_after_window() {
        let mut ledger = RestartLedger::default();
        let t0 = Utc::now();
        let window = Duration::from_secs(3600);

        assert_eq!(ledger.restarts_in_window(t0, window), 0);
        ledger.record_restart(t0);
        ledger.record_restart(t0);
        assert_eq!(ledger.restarts_in_window(t0 + chrono::Duration::minutes(30), window), 2);
        assert_eq!(
            ledger.window_remaining(t0 + chrono::Duration::minutes(30), window),
            Duration::from_secs(1800)
        );
        assert_eq!(ledger.restarts_in_window(t0 + chrono::Duration::minutes(61), window), 0);
        assert_eq!(RestartLedger::default().window_remaining(t0, window), Duration::ZERO);
    }
}
