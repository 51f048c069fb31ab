use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{OrchestratorError, Result};
use crate::recovery::FixType;

/// Failure taxonomy for supervised agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingDependency,
    MissingFile,
    ConnectionIssue,
    TimeoutIssue,
    ResourceExhaustion,
    LocalhostDependency,
    KeyMissing,
    AttributeMismatch,
    ValueMismatch,
    ProcessExit,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::MissingDependency,
        ErrorKind::MissingFile,
        ErrorKind::ConnectionIssue,
        ErrorKind::TimeoutIssue,
        ErrorKind::ResourceExhaustion,
        ErrorKind::LocalhostDependency,
        ErrorKind::KeyMissing,
        ErrorKind::AttributeMismatch,
        ErrorKind::ValueMismatch,
        ErrorKind::ProcessExit,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingDependency => "missing_dependency",
            ErrorKind::MissingFile => "missing_file",
            ErrorKind::ConnectionIssue => "connection_issue",
            ErrorKind::TimeoutIssue => "timeout_issue",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::LocalhostDependency => "localhost_dependency",
            ErrorKind::KeyMissing => "key_missing",
            ErrorKind::AttributeMismatch => "attribute_mismatch",
            ErrorKind::ValueMismatch => "value_mismatch",
            ErrorKind::ProcessExit => "process_exit",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::ResourceExhaustion => Severity::Critical,
            ErrorKind::MissingDependency | ErrorKind::ProcessExit | ErrorKind::LocalhostDependency => Severity::High,
            ErrorKind::MissingFile
            | ErrorKind::ConnectionIssue
            | ErrorKind::KeyMissing
            | ErrorKind::AttributeMismatch => Severity::Medium,
            ErrorKind::TimeoutIssue | ErrorKind::ValueMismatch | ErrorKind::Unknown => Severity::Low,
        }
    }

    /// Fixes that make sense for this failure, in catalog order. Empty means
    /// the failure needs a human.
    pub fn applicable_fixes(&self) -> &'static [FixType] {
        match self {
            ErrorKind::MissingDependency => &[FixType::RestartAgent, FixType::InstallDependency],
            ErrorKind::MissingFile => &[FixType::RestartAgent, FixType::CreateMissingPath],
            ErrorKind::ConnectionIssue => &[FixType::RestartAgent, FixType::RetryWithBackoff],
            ErrorKind::TimeoutIssue => &[
                FixType::RestartAgent,
                FixType::RetryWithBackoff,
                FixType::IncreaseTimeout,
            ],
            ErrorKind::ResourceExhaustion => &[FixType::RestartAgent, FixType::CleanupResources],
            ErrorKind::LocalhostDependency => &[],
            ErrorKind::KeyMissing
            | ErrorKind::AttributeMismatch
            | ErrorKind::ValueMismatch
            | ErrorKind::ProcessExit
            | ErrorKind::Unknown => &[FixType::RestartAgent],
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Text the rule matched.
    pub matched: String,
    /// Module name, path or key captured by the rule, if any.
    pub detail: Option<String>,
}

struct Rule {
    kind: ErrorKind,
    pattern: Regex,
}

/// Ordered signature rules; the first match wins.
pub struct ErrorClassifier {
    rules: Vec<Rule>,
}

const RULES: [(ErrorKind, &str); 10] = [
    (
        ErrorKind::MissingDependency,
        r#"(?:ModuleNotFoundError|ImportError)(?:.*?No module named ['"]([^'"]+)['"])?"#,
    ),
    (
        ErrorKind::MissingFile,
        r#"FileNotFoundError(?:.*?No such file or directory:\s*['"]([^'"]+)['"])?"#,
    ),
    (
        ErrorKind::ConnectionIssue,
        r"ConnectionError|Connection refused|Connection reset|Connection timeout",
    ),
    (ErrorKind::TimeoutIssue, r"TimeoutError|Read timeout|timed out"),
    (
        ErrorKind::ResourceExhaustion,
        r"MemoryError|Out of memory|Cannot allocate memory|No space left on device",
    ),
    (ErrorKind::KeyMissing, r#"KeyError(?:.*?['"]([^'"]+)['"])?"#),
    (
        ErrorKind::AttributeMismatch,
        r#"AttributeError(?:.*?object has no attribute ['"]([^'"]+)['"])?"#,
    ),
    (ErrorKind::ValueMismatch, r"ValueError.*?could not convert|invalid literal"),
    (
        ErrorKind::ProcessExit,
        r"sys\.exit\(|exit\(1\)|exited with (?:status|code) [1-9]",
    ),
    (ErrorKind::LocalhostDependency, r"localhost|127\.0\.0\.1"),
];

impl ErrorClassifier {
    pub fn new() -> Result<Self> {
        let rules = RULES
            .iter()
            .map(|(kind, pattern)| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|pattern| Rule { kind: *kind, pattern })
                    .map_err(|e| OrchestratorError::Config(format!("Bad signature for {}: {}", kind, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn classify(&self, line: &str) -> Option<ErrorKind> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(line))
            .map(|rule| rule.kind)
    }

    pub fn analyze(&self, line: &str) -> Option<Classification> {
        self.rules.iter().find_map(|rule| {
            let captures = rule.pattern.captures(line)?;
            Some(Classification {
                kind: rule.kind,
                severity: rule.kind.severity(),
                matched: captures.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
                detail: captures.get(1).map(|m| m.as_str().to_string()),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new().unwrap()
    }

    #[test]
    fn test_module_not_found_captures_module() {
        let c = classifier();
        let result = c
            .analyze("ModuleNotFoundError: No module named 'foo'")
            .unwrap();
        assert_eq!(result.kind, ErrorKind::MissingDependency);
        assert_eq!(result.severity, Severity::High);
        assert_eq!(result.detail.as_deref(), Some("foo"));
    }

    #[test]
    fn test_missing_file_captures_path() {
        let result = classifier()
            .analyze("FileNotFoundError: [Errno 2] No such file or directory: 'state/cache.json'")
            .unwrap();
        assert_eq!(result.kind, ErrorKind::MissingFile);
        assert_eq!(result.detail.as_deref(), Some("state/cache.json"));
    }

    #[test]
    fn test_ambiguous_lines_resolve_to_earliest_rule() {
        let c = classifier();
        // connection before timeout before localhost
        assert_eq!(
            c.classify("Connection refused to localhost:8080"),
            Some(ErrorKind::ConnectionIssue)
        );
        assert_eq!(
            c.classify("Connection timeout after 30s"),
            Some(ErrorKind::ConnectionIssue)
        );
        assert_eq!(
            c.classify("TimeoutError while calling 127.0.0.1"),
            Some(ErrorKind::TimeoutIssue)
        );
        // dependency before everything
        assert_eq!(
            c.classify("ImportError: No module named 'redis' (MemoryError during import)"),
            Some(ErrorKind::MissingDependency)
        );
        assert_eq!(
            c.classify("MemoryError raised, KeyError: 'x'"),
            Some(ErrorKind::ResourceExhaustion)
        );
        assert_eq!(
            c.classify("sys.exit(1) called after http://localhost failed"),
            Some(ErrorKind::ProcessExit)
        );
    }

    #[test]
    fn test_case_insensitive_and_unmatched() {
        let c = classifier();
        assert_eq!(c.classify("out of memory"), Some(ErrorKind::ResourceExhaustion));
        assert_eq!(c.classify("request TIMED OUT"), Some(ErrorKind::TimeoutIssue));
        assert_eq!(c.classify("all systems nominal"), None);
        assert!(c.analyze("").is_none());
    }

    #[test]
    fn test_classification_is_deterministic() {
        let c = classifier();
        let line = "KeyError: 'price'";
        assert_eq!(c.classify(line), c.classify(line));
        assert_eq!(c.analyze(line).unwrap().detail.as_deref(), Some("price"));
    }

    #[test]
    fn test_localhost_needs_a_human() {
        assert!(ErrorKind::LocalhostDependency.applicable_fixes().is_empty());
        assert!(ErrorKind::MissingDependency
            .applicable_fixes()
            .contains(&FixType::InstallDependency));
    }
}
