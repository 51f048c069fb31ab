pub mod breaker;
pub mod executor;
pub mod learner;
pub mod selector;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use breaker::{Admission, BreakerState, BreakerTransition, CircuitBreakerState, CircuitBreakers};
pub use executor::{FixExecutor, FixOutcome, RestartLedger};
pub use learner::{AdaptiveLearner, RecoveryOutcome, StrategyParameters, SuccessStatistics};
pub use selector::{FixCandidate, FixDecision, FixSelector};

/// The fixed remediation catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    RestartAgent,
    InstallDependency,
    CreateMissingPath,
    RetryWithBackoff,
    IncreaseTimeout,
    CleanupResources,
}

pub const CATALOG: [FixType; 6] = [
    FixType::RestartAgent,
    FixType::InstallDependency,
    FixType::CreateMissingPath,
    FixType::RetryWithBackoff,
    FixType::IncreaseTimeout,
    FixType::CleanupResources,
];

impl FixType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixType::RestartAgent => "restart_agent",
            FixType::InstallDependency => "install_dependency",
            FixType::CreateMissingPath => "create_missing_path",
            FixType::RetryWithBackoff => "retry_with_backoff",
            FixType::IncreaseTimeout => "increase_timeout",
            FixType::CleanupResources => "cleanup_resources",
        }
    }

    /// Success rate assumed before any attempt has been observed.
    pub fn default_prior(&self) -> f64 {
        match self {
            FixType::RestartAgent => 0.7,
            FixType::InstallDependency => 0.9,
            FixType::CreateMissingPath => 0.8,
            FixType::RetryWithBackoff => 0.6,
            FixType::IncreaseTimeout => 0.5,
            FixType::CleanupResources => 0.7,
        }
    }

    fn catalog_index(&self) -> usize {
        CATALOG.iter().position(|f| f == self).unwrap_or(CATALOG.len())
    }
}

impl fmt::Display for FixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FixType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CATALOG
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown fix type '{}'", s))
    }
}

/// How well a fix is expected to work for a given root-cause label.
pub fn root_cause_prior(root_cause: &str, fix: FixType) -> f64 {
    use FixType::*;
    match (root_cause, fix) {
        ("missing_dependency", InstallDependency) => 0.95,
        ("missing_dependency", RestartAgent) => 0.3,
        ("network_issue", RetryWithBackoff) => 0.8,
        ("network_issue", RestartAgent) => 0.4,
        ("resource_exhaustion", CleanupResources) => 0.9,
        ("resource_exhaustion", RestartAgent) => 0.8,
        ("missing_file", CreateMissingPath) => 0.95,
        ("missing_file", RestartAgent) => 0.2,
        ("timeout", IncreaseTimeout) => 0.7,
        ("timeout", RetryWithBackoff) => 0.6,
        _ => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_type_parses_its_own_label() {
        for fix in CATALOG {
            assert_eq!(fix.as_str().parse::<FixType>().unwrap(), fix);
        }
        assert!("reboot_host".parse::<FixType>().is_err());
    }

    #[test]
    fn test_root_cause_prior_defaults_to_half() {
        assert_eq!(root_cause_prior("missing_dependency", FixType::InstallDependency), 0.95);
        assert_eq!(root_cause_prior("missing_dependency", FixType::CleanupResources), 0.5);
        assert_eq!(root_cause_prior("cosmic_rays", FixType::RestartAgent), 0.5);
    }
}
