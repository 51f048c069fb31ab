use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Failures inside the orchestrator itself. Failures of the supervised agents
/// are described by [`crate::classifier::ErrorKind`] instead.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("External call failure: {0}")]
    ExternalCall(String),

    #[error("Process control failure: {0}")]
    ProcessControl(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Chaos injection is disabled")]
    ChaosDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log it and keep the in-memory state authoritative until the next flush.
    KeepInMemory,
    /// Log one warning and fall back to the rule-based path.
    FallBackToRules,
    /// Feed the circuit breaker like any other failed fix.
    CountAsFixFailure,
    /// Surface to the operator; the orchestrator cannot continue this operation.
    Abort,
}

impl OrchestratorError {
    pub fn policy(&self) -> FailurePolicy {
        match self {
            OrchestratorError::Persistence(_) => FailurePolicy::KeepInMemory,
            OrchestratorError::ExternalCall(_) => FailurePolicy::FallBackToRules,
            OrchestratorError::ProcessControl(_) => FailurePolicy::CountAsFixFailure,
            OrchestratorError::Config(_) => FailurePolicy::Abort,
            OrchestratorError::UnknownAgent(_) => FailurePolicy::Abort,
            OrchestratorError::ChaosDisabled => FailurePolicy::Abort,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Persistence(_) => "persistence",
            OrchestratorError::ExternalCall(_) => "external_call",
            OrchestratorError::ProcessControl(_) => "process_control",
            OrchestratorError::Config(_) => "config",
            OrchestratorError::UnknownAgent(_) => "unknown_agent",
            OrchestratorError::ChaosDisabled => "chaos_disabled",
        }
    }
}

// Conversion implementations for common error types
impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Persistence(err.to_string())
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(err: toml::de::Error) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for OrchestratorError {
    fn from(err: toml::ser::Error) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        OrchestratorError::ExternalCall(err.to_string())
    }
}

impl From<notify::Error> for OrchestratorError {
    fn from(err: notify::Error) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_failures_map_to_policies() {
        assert_eq!(
            OrchestratorError::Persistence("disk full".into()).policy(),
            FailurePolicy::KeepInMemory
        );
        assert_eq!(
            OrchestratorError::ExternalCall("503".into()).policy(),
            FailurePolicy::FallBackToRules
        );
        assert_eq!(
            OrchestratorError::ProcessControl("kill failed".into()).policy(),
            FailurePolicy::CountAsFixFailure
        );
    }

    #[test]
    fn test_io_error_is_a_persistence_failure() {
        let err: OrchestratorError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(err.kind(), "persistence");
        assert!(err.to_string().contains("nope"));
    }
}
