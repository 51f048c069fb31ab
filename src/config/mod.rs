use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use notify::{Watcher, RecursiveMode, Event, EventKind};
use tokio::sync::mpsc;
use tracing::{info, warn, error, debug};

use crate::error::{Result, OrchestratorError};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub monitoring: MonitorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reasoner: ReasonerConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub chaos: ChaosConfig,
}

/// One supervised agent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub name: String,
    /// Substring matched against the process command line.
    pub process_pattern: String,
    pub log_path: PathBuf,
    /// argv used to relaunch the agent; restarts fail without it.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub cleanup_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub failure_threshold: u32,
    pub cooldown_seconds: f64,
    pub restart_cap: u32,
    pub backoff_initial_seconds: f64,
    pub backoff_multiplier: f64,
    pub backoff_max_seconds: f64,
    pub backoff_initial_cap_seconds: f64,
    pub cooldown_cap_seconds: f64,
    #[serde(with = "humantime_serde")]
    pub restart_window: Duration,
    #[serde(with = "humantime_serde")]
    pub fix_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub restart_settle: Duration,
    #[serde(with = "humantime_serde")]
    pub cycle_timeout: Duration,
    pub max_concurrent_agents: usize,
    pub errors_per_cycle: usize,
    pub dependency_installer: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub maintenance_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub retune_interval: Duration,
    pub log_tail_lines: usize,
    pub log_tail_size: String, // "64KB"
    pub api_port: Option<u16>,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
    pub incident_cap: usize,
    pub stats_cap: usize,
    pub history_cap: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReasonerConfig {
    /// OpenAI-compatible chat completions URL. The reasoner is off when unset.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_prompt_chars: usize,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
    pub discord_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChaosConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub rto: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_seconds: 300.0,
            restart_cap: 5,
            backoff_initial_seconds: 2.0,
            backoff_multiplier: 2.0,
            backoff_max_seconds: 60.0,
            backoff_initial_cap_seconds: 10.0,
            cooldown_cap_seconds: 900.0,
            restart_window: Duration::from_secs(3600),
            fix_timeout: Duration::from_secs(60),
            restart_settle: Duration::from_secs(2),
            cycle_timeout: Duration::from_secs(180),
            max_concurrent_agents: 8,
            errors_per_cycle: 3,
            dependency_installer: vec![
                "python3".to_string(),
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
            ],
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            maintenance_check_interval: Duration::from_secs(300),
            retune_interval: Duration::from_secs(3600),
            log_tail_lines: 50,
            log_tail_size: "64KB".to_string(),
            api_port: None,
            api_token: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./state"),
            incident_cap: 1000,
            stats_cap: 5000,
            history_cap: 1000,
        }
    }
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(5),
            max_prompt_chars: 2000,
        }
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rto: Duration::from_secs(60),
            probe_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(120),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agents: vec![AgentConfig {
                name: "worker-1".to_string(),
                process_pattern: "worker_1.py".to_string(),
                log_path: PathBuf::from("./logs/worker-1.log"),
                command: Some(vec!["python3".to_string(), "worker_1.py".to_string()]),
                env: BTreeMap::new(),
                working_dir: None,
                cleanup_paths: Vec::new(),
            }],
            recovery: RecoveryConfig::default(),
            monitoring: MonitorConfig::default(),
            storage: StorageConfig::default(),
            reasoner: ReasonerConfig::default(),
            alerts: AlertConfig::default(),
            chaos: ChaosConfig::default(),
        }
    }
}

impl Config {
    /// Log tail size in bytes; falls back to the default when unparseable.
    pub fn log_tail_bytes(&self) -> u64 {
        FileConfigManager::parse_size_to_bytes(&self.monitoring.log_tail_size).unwrap_or(64 * 1024)
    }
}

#[async_trait::async_trait]
pub trait ConfigManager {
    async fn load_config(&self) -> Result<Config>;
    async fn save_config(&self, config: &Config) -> Result<()>;
    async fn watch_config_changes(&self) -> Result<tokio::sync::mpsc::Receiver<Config>>;
    fn validate_config(&self, config: &Config) -> Result<()>;
}

pub struct FileConfigManager {
    config_path: PathBuf,
}

impl FileConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }
}

#[async_trait::async_trait]
impl ConfigManager for FileConfigManager {
    async fn load_config(&self) -> Result<Config> {
        info!("Loading configuration from {:?}", self.config_path);

        // check if config file exists, create default if not
        if !self.config_path.exists() {
            warn!("Configuration file not found, creating default config at {:?}", self.config_path);
            self.create_default_config().await?;
        }

        let config_content = fs::read_to_string(&self.config_path)
            .map_err(|e| OrchestratorError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&config_content)
            .map_err(|e| OrchestratorError::Config(format!("Failed to parse TOML config: {}", e)))?;

        self.validate_config(&config)?;

        info!("Configuration loaded successfully ({} agents)", config.agents.len());
        Ok(config)
    }

    async fn watch_config_changes(&self) -> Result<tokio::sync::mpsc::Receiver<Config>> {
        let (tx, rx) = mpsc::channel(10);
        let config_path = self.config_path.clone();
        let config_manager = FileConfigManager::new(config_path.clone());

        tokio::spawn(async move {
            if let Err(e) = Self::watch_config_file(config_path, tx, config_manager).await {
                error!("Configuration file watcher error: {}", e);
            }
        });

        Ok(rx)
    }

    fn validate_config(&self, config: &Config) -> Result<()> {
        debug!("Validating configuration");

        // checking agents
        if config.agents.is_empty() {
            return Err(OrchestratorError::Config("At least one agent must be configured".to_string()));
        }

        let mut names = HashSet::new();
        for agent in &config.agents {
            if agent.name.trim().is_empty() {
                return Err(OrchestratorError::Config("Agent name cannot be empty".to_string()));
            }
            if !names.insert(agent.name.as_str()) {
                return Err(OrchestratorError::Config(format!("Duplicate agent name '{}'", agent.name)));
            }
            if agent.process_pattern.trim().is_empty() {
                return Err(OrchestratorError::Config(format!("Agent '{}' has an empty process_pattern", agent.name)));
            }
            if let Some(ref command) = agent.command {
                if command.is_empty() {
                    return Err(OrchestratorError::Config(format!("Agent '{}' has an empty command", agent.name)));
                }
            }
        }

        // checking recovery thresholds
        let recovery = &config.recovery;
        if recovery.failure_threshold == 0 {
            return Err(OrchestratorError::Config("failure_threshold must be greater than 0".to_string()));
        }
        if recovery.restart_cap < recovery.failure_threshold {
            return Err(OrchestratorError::Config("restart_cap cannot be lower than failure_threshold".to_string()));
        }
        if recovery.cooldown_seconds <= 0.0 {
            return Err(OrchestratorError::Config("cooldown_seconds must be greater than 0".to_string()));
        }
        if recovery.cooldown_cap_seconds < recovery.cooldown_seconds {
            return Err(OrchestratorError::Config("cooldown_cap_seconds cannot be lower than cooldown_seconds".to_string()));
        }
        if recovery.backoff_initial_seconds < 0.0 || recovery.backoff_multiplier < 1.0 {
            return Err(OrchestratorError::Config("backoff must be non-negative with a multiplier of at least 1".to_string()));
        }
        if recovery.backoff_initial_cap_seconds < recovery.backoff_initial_seconds {
            return Err(OrchestratorError::Config("backoff_initial_cap_seconds cannot be lower than backoff_initial_seconds".to_string()));
        }
        if recovery.backoff_max_seconds < recovery.backoff_initial_cap_seconds {
            return Err(OrchestratorError::Config("backoff_max_seconds cannot be lower than backoff_initial_cap_seconds".to_string()));
        }
        if recovery.max_concurrent_agents == 0 {
            return Err(OrchestratorError::Config("max_concurrent_agents must be greater than 0".to_string()));
        }
        if recovery.dependency_installer.is_empty() {
            return Err(OrchestratorError::Config("dependency_installer cannot be empty".to_string()));
        }

        // checking monitoring config
        let monitoring = &config.monitoring;
        if monitoring.poll_interval.is_zero()
            || monitoring.maintenance_check_interval.is_zero()
            || monitoring.retune_interval.is_zero()
        {
            return Err(OrchestratorError::Config("monitoring intervals must be greater than 0".to_string()));
        }
        if monitoring.log_tail_lines == 0 {
            return Err(OrchestratorError::Config("log_tail_lines must be greater than 0".to_string()));
        }
        if !Self::is_valid_size_format(&monitoring.log_tail_size) {
            return Err(OrchestratorError::Config(format!(
                "Invalid log_tail_size format '{}', expected format like '64KB', '1MB'",
                monitoring.log_tail_size
            )));
        }
        if let Some(port) = monitoring.api_port {
            if port < 1024 {
                return Err(OrchestratorError::Config("api_port must be between 1024 and 65535".to_string()));
            }
        }

        // checking storage caps
        if config.storage.incident_cap == 0 || config.storage.stats_cap == 0 || config.storage.history_cap == 0 {
            return Err(OrchestratorError::Config("storage caps must be greater than 0".to_string()));
        }

        // checking outbound urls
        let urls = [
            ("reasoner.endpoint", &config.reasoner.endpoint),
            ("alerts.webhook_url", &config.alerts.webhook_url),
            ("alerts.discord_webhook_url", &config.alerts.discord_webhook_url),
        ];
        for (field, url) in urls {
            if let Some(url) = url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(OrchestratorError::Config(format!("{} must start with http:// or https://", field)));
                }
            }
        }
        if config.reasoner.timeout.is_zero() {
            return Err(OrchestratorError::Config("reasoner.timeout must be greater than 0".to_string()));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    async fn save_config(&self, config: &Config) -> Result<()> {
        info!("Saving configuration to {:?}", self.config_path);

        let toml_content = toml::to_string_pretty(config)
            .map_err(|e| OrchestratorError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&self.config_path, toml_content)
            .map_err(|e| OrchestratorError::Config(format!("Failed to write config file: {}", e)))?;

        info!("Configuration saved successfully");
        Ok(())
    }
}

impl FileConfigManager {
    /// Create a default configuration file
    async fn create_default_config(&self) -> Result<()> {
        let default_config = Config::default();
        let toml_content = toml::to_string_pretty(&default_config)
            .map_err(|e| OrchestratorError::Config(format!("Failed to serialize default config: {}", e)))?;

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| OrchestratorError::Config(format!("Failed to create config directory: {}", e)))?;
        }

        fs::write(&self.config_path, toml_content)
            .map_err(|e| OrchestratorError::Config(format!("Failed to write default config: {}", e)))?;

        info!("Default configuration file created at {:?}", self.config_path);
        Ok(())
    }

    /// Watch configuration file for changes and send updates through the channel
    async fn watch_config_file(
        config_path: PathBuf,
        tx: mpsc::Sender<Config>,
        config_manager: FileConfigManager,
    ) -> Result<()> {
        let (file_tx, mut file_rx) = mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if let Err(e) = file_tx.blocking_send(event) {
                        error!("Failed to send file system event: {}", e);
                    }
                }
                Err(e) => error!("File system watcher error: {}", e),
            }
        }).map_err(|e| OrchestratorError::Config(format!("Failed to create file watcher: {}", e)))?;

        // Watch the config file's parent directory
        let watch_path = config_path.parent().unwrap_or(&config_path);
        watcher.watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| OrchestratorError::Config(format!("Failed to watch config directory: {}", e)))?;

        info!("Started watching configuration file: {:?}", config_path);

        while let Some(event) = file_rx.recv().await {
            match event.kind {
                EventKind::Modify(_) | EventKind::Create(_) => {
                    if event.paths.iter().any(|p| p == &config_path) {
                        debug!("Configuration file changed, reloading...");

                        // give the writer a moment to finish
                        tokio::time::sleep(Duration::from_millis(100)).await;

                        match config_manager.load_config().await {
                            Ok(new_config) => {
                                info!("Configuration reloaded successfully");
                                if let Err(e) = tx.send(new_config).await {
                                    error!("Failed to send updated config: {}", e);
                                    break;
                                }
                            }
                            Err(e) => {
                                // keep watching, the old config stays in force
                                error!("Failed to reload configuration: {}", e);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Validate size format (e.g., "64KB", "1MB")
    fn is_valid_size_format(size_str: &str) -> bool {
        Self::parse_size_to_bytes(size_str).is_ok()
    }

    /// Parse size string to bytes
    pub fn parse_size_to_bytes(size_str: &str) -> Result<u64> {
        let size_str = size_str.trim().to_uppercase();
        // Order matters - check longer suffixes first to avoid partial matches
        let multipliers = [
            ("GB", 1024 * 1024 * 1024),
            ("MB", 1024 * 1024),
            ("KB", 1024),
            ("B", 1),
        ];

        for (suffix, multiplier) in &multipliers {
            if let Some(number_part) = size_str.strip_suffix(suffix) {
                let number: u64 = number_part.trim().parse()
                    .map_err(|_| OrchestratorError::Config(format!("Invalid number in size format: {}", size_str)))?;
                return Ok(number * multiplier);
            }
        }

        Err(OrchestratorError::Config(format!("Invalid size format: {}", size_str)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("recovery.toml");
        let manager = FileConfigManager::new(config_path.clone());

        let config = manager.load_config().await.unwrap();

        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].name, "worker-1");
        assert_eq!(config.recovery.failure_threshold, 3);
        assert_eq!(config.recovery.cooldown_seconds, 300.0);
        assert_eq!(config.recovery.restart_cap, 5);
        assert!(config_path.exists());
    }

    #[tokio::test]
    async fn test_partial_config_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("recovery.toml");
        fs::write(
            &config_path,
            r#"
[[agents]]
name = "worker-2"
process_pattern = "worker_2.py"
log_path = "/var/log/worker-2.log"

[monitoring]
poll_interval = "15s"
log_tail_size = "128KB"
"#,
        )
        .unwrap();

        let manager = FileConfigManager::new(config_path);
        let config = manager.load_config().await.unwrap();

        assert_eq!(config.agents[0].name, "worker-2");
        assert!(config.agents[0].command.is_none());
        assert_eq!(config.monitoring.poll_interval, Duration::from_secs(15));
        assert_eq!(config.monitoring.maintenance_check_interval, Duration::from_secs(300));
        assert_eq!(config.log_tail_bytes(), 128 * 1024);
        assert_eq!(config.recovery.failure_threshold, 3);
    }

    #[tokio::test]
    async fn test_save_then_reload() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("recovery.toml");
        let manager = FileConfigManager::new(config_path);

        let mut config = Config::default();
        config.recovery.cooldown_seconds = 120.0;
        config.chaos.enabled = true;
        manager.save_config(&config).await.unwrap();

        let reloaded = manager.load_config().await.unwrap();
        assert_eq!(reloaded.recovery.cooldown_seconds, 120.0);
        assert!(reloaded.chaos.enabled);
    }

    #[test]
    fn test_config_validation() {
        let manager = FileConfigManager::new(PathBuf::from("test.toml"));

        assert!(manager.validate_config(&Config::default()).is_ok());

        let mut invalid_config = Config::default();
        invalid_config.agents.clear();
        assert!(manager.validate_config(&invalid_config).is_err());

        let mut invalid_config = Config::default();
        let duplicate = invalid_config.agents[0].clone();
        invalid_config.agents.push(duplicate);
        assert!(manager.validate_config(&invalid_config).is_err());

        let mut invalid_config = Config::default();
        invalid_config.recovery.failure_threshold = 0;
        assert!(manager.validate_config(&invalid_config).is_err());

        let mut invalid_config = Config::default();
        invalid_config.recovery.cooldown_cap_seconds = 10.0;
        assert!(manager.validate_config(&invalid_config).is_err());

        let mut invalid_config = Config::default();
        invalid_config.alerts.webhook_url = Some("ftp://alerts".to_string());
        assert!(manager.validate_config(&invalid_config).is_err());
    }

    #[test]
    fn test_parse_size_to_bytes() {
        assert_eq!(FileConfigManager::parse_size_to_bytes("64KB").unwrap(), 64 * 1024);
        assert_eq!(FileConfigManager::parse_size_to_bytes("1mb").unwrap(), 1024 * 1024);
        assert_eq!(FileConfigManager::parse_size_to_bytes("512B").unwrap(), 512);
        assert!(FileConfigManager::parse_size_to_bytes("invalid").is_err());
        assert!(!FileConfigManager::is_valid_size_format("100"));
    }
}
