use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::AgentConfig;

/// How to bring an agent back after it has been terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

/// Immutable identity of a supervised agent, built once from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentDescriptor {
    name: String,
    process_pattern: String,
    log_path: PathBuf,
    launch: Option<LaunchSpec>,
    cleanup_paths: Vec<PathBuf>,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, process_pattern: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            process_pattern: process_pattern.into(),
            log_path: log_path.into(),
            launch: None,
            cleanup_paths: Vec::new(),
        }
    }

    pub fn with_launch(mut self, launch: LaunchSpec) -> Self {
        self.launch = Some(launch);
        self
    }

    pub fn with_cleanup_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.cleanup_paths = paths;
        self
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let launch = config
            .command
            .as_ref()
            .and_then(|argv| argv.split_first())
            .map(|(program, args)| LaunchSpec {
                program: program.clone(),
                args: args.to_vec(),
                env: config.env.clone(),
                working_dir: config.working_dir.clone(),
            });

        Self {
            name: config.name.clone(),
            process_pattern: config.process_pattern.clone(),
            log_path: config.log_path.clone(),
            launch,
            cleanup_paths: config.cleanup_paths.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process_pattern(&self) -> &str {
        &self.process_pattern
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn launch(&self) -> Option<&LaunchSpec> {
        self.launch.as_ref()
    }

    pub fn cleanup_paths(&self) -> &[PathBuf] {
        &self.cleanup_paths
    }
}
