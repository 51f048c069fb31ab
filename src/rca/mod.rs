pub mod reasoner;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::ErrorKind;
use crate::clock::Clock;
use crate::error::{OrchestratorError, Result};
use crate::recovery::FixType;
use crate::storage::{load_document, save_document, StateStore, INCIDENTS_KEY, REPORTS_KEY};

pub use reasoner::{build_prompt, ExternalReasoner, HttpReasoner, ReasonedCause};

const KNOWLEDGE_BASE_CONFIDENCE: f64 = 0.8;
const REPORT_CAP: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceSource {
    KnowledgeBase,
    RuleBased,
    ExternalReasoner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    pub label: String,
    pub category: ErrorKind,
    pub confidence: f64,
    pub suggested_remedy: String,
    pub source: InferenceSource,
    /// Matching prior incidents, when the knowledge base answered.
    #[serde(default)]
    pub similar_incidents: usize,
}

/// One resolved failure in the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub agent: String,
    pub kind: ErrorKind,
    pub root_cause: String,
    pub remedy: String,
    pub fix: Option<FixType>,
    pub success: bool,
    pub error_keywords: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub count: u64,
    pub successful_remedies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcaReport {
    pub id: Uuid,
    pub agent: String,
    pub generated_at: DateTime<Utc>,
    pub root_cause: RootCause,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnowledgeBase {
    incidents: VecDeque<Incident>,
    #[serde(default)]
    patterns: BTreeMap<String, PatternStats>,
}

struct TextRule {
    pattern: Regex,
    label: &'static str,
    confidence: f64,
}

pub struct RcaEngine {
    knowledge: Mutex<KnowledgeBase>,
    reports: Mutex<VecDeque<RcaReport>>,
    reasoner: Option<Arc<dyn ExternalReasoner>>,
    reasoner_timeout: Duration,
    max_prompt_chars: usize,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    incident_cap: usize,
    keyword_pattern: Regex,
    text_rules: Vec<TextRule>,
    incidents_dirty: AtomicBool,
    reports_dirty: AtomicBool,
}

/// Remedy text for a root-cause label.
pub fn remedy_for(label: &str) -> &'static str {
    match label {
        "missing_dependency" => "Install missing module via pip",
        "network_issue" => "Check network connectivity, retry with backoff",
        "resource_exhaustion" => "Restart agent, reduce workload, or scale resources",
        "missing_file" => "Create missing file or directory",
        "timeout" => "Increase timeout or optimize slow operations",
        "localhost_dependency" => "Remove the loopback dependency from the agent's configuration",
        "agent_exit" => "Restart agent",
        _ => "Investigate and fix manually",
    }
}

/// Label used when no text rule fires, derived from the classification alone.
fn label_for_kind(kind: ErrorKind) -> (&'static str, f64) {
    match kind {
        ErrorKind::MissingDependency => ("missing_dependency", 0.6),
        ErrorKind::MissingFile => ("missing_file", 0.6),
        ErrorKind::ConnectionIssue => ("network_issue", 0.6),
        ErrorKind::TimeoutIssue => ("timeout", 0.6),
        ErrorKind::ResourceExhaustion => ("resource_exhaustion", 0.6),
        ErrorKind::LocalhostDependency => ("localhost_dependency", 0.6),
        ErrorKind::ProcessExit => ("agent_exit", 0.6),
        ErrorKind::KeyMissing | ErrorKind::AttributeMismatch | ErrorKind::ValueMismatch | ErrorKind::Unknown => {
            ("unknown", 0.5)
        }
    }
}

impl RcaEngine {
    pub async fn load(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        reasoner: Option<Arc<dyn ExternalReasoner>>,
        reasoner_timeout: Duration,
        max_prompt_chars: usize,
        incident_cap: usize,
    ) -> Result<Self> {
        let knowledge = match load_document::<KnowledgeBase>(store.as_ref(), INCIDENTS_KEY).await {
            Ok(Some(kb)) => {
                info!("Loaded {} incidents into the knowledge base", kb.incidents.len());
                kb
            }
            Ok(None) => KnowledgeBase::default(),
            Err(e) => {
                warn!("Starting with an empty knowledge base: {}", e);
                KnowledgeBase::default()
            }
        };
        let reports = match load_document::<VecDeque<RcaReport>>(store.as_ref(), REPORTS_KEY).await {
            Ok(Some(reports)) => reports,
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!("Starting without RCA reports: {}", e);
                VecDeque::new()
            }
        };

        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| OrchestratorError::Config(format!("Bad RCA pattern {}: {}", pattern, e)))
        };
        let text_rules = vec![
            TextRule { pattern: compile(r"ImportError|ModuleNotFoundError")?, label: "missing_dependency", confidence: 0.9 },
            TextRule { pattern: compile(r"ConnectionError|Connection refused")?, label: "network_issue", confidence: 0.8 },
            TextRule { pattern: compile(r"MemoryError|Out of memory")?, label: "resource_exhaustion", confidence: 0.9 },
            TextRule { pattern: compile(r"FileNotFoundError")?, label: "missing_file", confidence: 0.8 },
            TextRule { pattern: compile(r"(?i)TimeoutError|timeout")?, label: "timeout", confidence: 0.7 },
            TextRule { pattern: compile(r"localhost|127\.0\.0\.1")?, label: "localhost_dependency", confidence: 0.9 },
        ];

        Ok(Self {
            knowledge: Mutex::new(knowledge),
            reports: Mutex::new(reports),
            reasoner,
            reasoner_timeout,
            max_prompt_chars,
            store,
            clock,
            incident_cap: incident_cap.max(1),
            keyword_pattern: compile(r"\w+Error|\w+Exception")?,
            text_rules,
            incidents_dirty: AtomicBool::new(false),
            reports_dirty: AtomicBool::new(false),
        })
    }

    /// Exception and error type names in `text`, sorted and de-duplicated.
    pub fn extract_keywords(&self, text: &str) -> Vec<String> {
        self.keyword_pattern
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Knowledge base first, then the external reasoner if one is configured,
    /// then the rule table. Never fails.
    pub async fn analyze(&self, agent: &str, kind: ErrorKind, log_text: &str) -> RootCause {
        let keywords = self.extract_keywords(log_text);

        if let Some(cause) = self.search_knowledge_base(agent, kind, &keywords).await {
            debug!(agent, root_cause = %cause.label, "Knowledge base match");
            return cause;
        }

        if let Some(ref reasoner) = self.reasoner {
            let prompt = build_prompt(agent, kind, log_text, self.max_prompt_chars);
            match tokio::time::timeout(self.reasoner_timeout, reasoner.reason(&prompt)).await {
                Ok(Ok(reasoned)) => {
                    return RootCause {
                        label: reasoned.root_cause,
                        category: kind,
                        confidence: reasoned.confidence,
                        suggested_remedy: reasoned.solution,
                        source: InferenceSource::ExternalReasoner,
                        similar_incidents: 0,
                    };
                }
                Ok(Err(e)) => warn!(agent, "External reasoner failed, using rules: {}", e),
                Err(_) => warn!(
                    agent,
                    "External reasoner timed out after {:?}, using rules", self.reasoner_timeout
                ),
            }
        }

        self.rule_based(kind, log_text)
    }

    /// Most frequent root cause among this agent's incidents that share an
    /// error keyword with the current one.
    async fn search_knowledge_base(&self, agent: &str, kind: ErrorKind, keywords: &[String]) -> Option<RootCause> {
        if keywords.is_empty() {
            return None;
        }
        let knowledge = self.knowledge.lock().await;

        let mut tally: BTreeMap<&str, (usize, usize)> = BTreeMap::new(); // label -> (count, newest index)
        let mut similar = 0;
        for (index, incident) in knowledge.incidents.iter().enumerate() {
            if incident.agent != agent || !incident.error_keywords.iter().any(|k| keywords.contains(k)) {
                continue;
            }
            similar += 1;
            let entry = tally.entry(incident.root_cause.as_str()).or_insert((0, index));
            entry.0 += 1;
            entry.1 = index;
        }

        let (label, _) = tally
            .iter()
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(a.1 .1.cmp(&b.1 .1)))?;

        // prefer a remedy that worked
        let matching = knowledge.incidents.iter().rev().filter(|i| i.agent == agent && i.root_cause == *label);
        let remedy = matching
            .clone()
            .find(|i| i.success)
            .or_else(|| matching.clone().next())
            .map(|i| i.remedy.clone())
            .unwrap_or_else(|| remedy_for(label).to_string());

        Some(RootCause {
            label: label.to_string(),
            category: kind,
            confidence: KNOWLEDGE_BASE_CONFIDENCE,
            suggested_remedy: remedy,
            source: InferenceSource::KnowledgeBase,
            similar_incidents: similar,
        })
    }

    pub fn rule_based(&self, kind: ErrorKind, log_text: &str) -> RootCause {
        let (label, confidence) = self
            .text_rules
            .iter()
            .find(|rule| rule.pattern.is_match(log_text))
            .map(|rule| (rule.label, rule.confidence))
            .unwrap_or_else(|| label_for_kind(kind));

        RootCause {
            label: label.to_string(),
            category: kind,
            confidence,
            suggested_remedy: remedy_for(label).to_string(),
            source: InferenceSource::RuleBased,
            similar_incidents: 0,
        }
    }

    /// Appends the incident once its outcome is known.
    pub async fn record_incident(
        &self,
        agent: &str,
        root_cause: &RootCause,
        fix: Option<FixType>,
        success: bool,
        log_text: &str,
    ) -> Incident {
        let incident = Incident {
            id: Uuid::new_v4(),
            agent: agent.to_string(),
            kind: root_cause.category,
            root_cause: root_cause.label.clone(),
            remedy: root_cause.suggested_remedy.clone(),
            fix,
            success,
            error_keywords: self.extract_keywords(log_text),
            recorded_at: self.clock.now(),
        };

        let mut knowledge = self.knowledge.lock().await;
        knowledge.incidents.push_back(incident.clone());
        while knowledge.incidents.len() > self.incident_cap {
            knowledge.incidents.pop_front();
        }

        let pattern = knowledge.patterns.entry(incident.root_cause.clone()).or_default();
        pattern.count += 1;
        if success && !pattern.successful_remedies.contains(&incident.remedy) {
            pattern.successful_remedies.push(incident.remedy.clone());
        }

        self.persist_knowledge(&knowledge).await;
        incident
    }

    pub async fn generate_report(&self, agent: &str, root_cause: &RootCause) -> RcaReport {
        let report = RcaReport {
            id: Uuid::new_v4(),
            agent: agent.to_string(),
            generated_at: self.clock.now(),
            root_cause: root_cause.clone(),
            recommendations: recommendations(root_cause),
        };

        let mut reports = self.reports.lock().await;
        reports.push_back(report.clone());
        while reports.len() > REPORT_CAP {
            reports.pop_front();
        }
        self.persist_reports(&reports).await;
        report
    }

    pub async fn incidents(&self, agent: Option<&str>, limit: usize) -> Vec<Incident> {
        let knowledge = self.knowledge.lock().await;
        knowledge
            .incidents
            .iter()
            .rev()
            .filter(|i| agent.map_or(true, |a| i.agent == a))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn incident_count(&self) -> usize {
        self.knowledge.lock().await.incidents.len()
    }

    pub async fn patterns(&self) -> BTreeMap<String, PatternStats> {
        self.knowledge.lock().await.patterns.clone()
    }

    pub async fn reports(&self, limit: usize) -> Vec<RcaReport> {
        self.reports.lock().await.iter().rev().take(limit).cloned().collect()
    }

    pub async fn flush_if_dirty(&self) {
        if self.incidents_dirty.load(Ordering::SeqCst) {
            let knowledge = self.knowledge.lock().await;
            self.persist_knowledge(&knowledge).await;
        }
        if self.reports_dirty.load(Ordering::SeqCst) {
            let reports = self.reports.lock().await;
            self.persist_reports(&reports).await;
        }
    }

    pub async fn flush(&self) -> Result<()> {
        {
            let knowledge = self.knowledge.lock().await;
            save_document(self.store.as_ref(), INCIDENTS_KEY, &*knowledge).await?;
            self.incidents_dirty.store(false, Ordering::SeqCst);
        }
        let reports = self.reports.lock().await;
        save_document(self.store.as_ref(), REPORTS_KEY, &*reports).await?;
        self.reports_dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn persist_knowledge(&self, knowledge: &KnowledgeBase) {
        match save_document(self.store.as_ref(), INCIDENTS_KEY, knowledge).await {
            Ok(()) => self.incidents_dirty.store(false, Ordering::SeqCst),
            Err(e) => {
                warn!("Failed to persist the knowledge base, keeping it in memory: {}", e);
                self.incidents_dirty.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn persist_reports(&self, reports: &VecDeque<RcaReport>) {
        match save_document(self.store.as_ref(), REPORTS_KEY, reports).await {
            Ok(()) => self.reports_dirty.store(false, Ordering::SeqCst),
            Err(e) => {
                warn!("Failed to persist RCA reports, keeping them in memory: {}", e);
                self.reports_dirty.store(true, Ordering::SeqCst);
            }
        }
    }
}

fn recommendations(root_cause: &RootCause) -> Vec<String> {
    let mut out = Vec::new();
    if !root_cause.suggested_remedy.is_empty() {
        out.push(format!("Immediate fix: {}", root_cause.suggested_remedy));
    }
    let follow_ups: &[&str] = match root_cause.label.as_str() {
        "missing_dependency" => &[
            "Add the dependency to the agent's requirements",
            "Validate dependencies when the agent starts",
        ],
        "resource_exhaustion" => &["Monitor resource usage proactively", "Set resource limits for the agent"],
        "network_issue" => &[
            "Retry with exponential backoff inside the agent",
            "Guard the remote call with a circuit breaker",
        ],
        "missing_file" => &["Create required paths when the agent starts"],
        "timeout" => &["Profile the slow operation before raising timeouts further"],
        "localhost_dependency" => &["Point the agent at a reachable service address"],
        _ => &[],
    };
    out.extend(follow_ups.iter().map(|s| s.to_string()));
    out
}
