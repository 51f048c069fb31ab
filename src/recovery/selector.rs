use serde::Serialize;
use std::sync::Arc;

use crate::classifier::ErrorKind;
use crate::rca::RootCause;
use crate::recovery::{root_cause_prior, AdaptiveLearner, FixType};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixCandidate {
    pub fix: FixType,
    /// Observed (or default) success rate blended 50/50 with the root-cause prior.
    pub prior_success_rate: f64,
    pub confidence: f64,
    pub observed_attempts: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixDecision {
    pub selected: FixCandidate,
    /// Next best candidates, at most three.
    pub alternatives: Vec<FixCandidate>,
}

impl FixDecision {
    /// Selected fix first, then the alternatives.
    pub fn ranked(&self) -> impl Iterator<Item = &FixCandidate> {
        std::iter::once(&self.selected).chain(self.alternatives.iter())
    }
}

/// Well-sampled fixes earn more confidence than untested ones.
pub fn confidence_for(attempts: u64) -> f64 {
    match attempts {
        n if n >= 100 => 0.9,
        n if n >= 50 => 0.7,
        n if n >= 10 => 0.5,
        _ => 0.3,
    }
}

pub struct FixSelector {
    learner: Arc<AdaptiveLearner>,
}

impl FixSelector {
    pub fn new(learner: Arc<AdaptiveLearner>) -> Self {
        Self { learner }
    }

    pub async fn select_fix(
        &self,
        agent: &str,
        kind: ErrorKind,
        root_cause: &RootCause,
        catalog: &[FixType],
    ) -> Option<FixDecision> {
        let mut candidates = Vec::with_capacity(catalog.len());
        for fix in catalog {
            let stats = self.learner.statistics(agent, kind, *fix).await;
            let observed_attempts = stats.as_ref().map(|s| s.attempts).unwrap_or(0);
            let observed = match stats {
                Some(ref s) if s.attempts > 0 => s.success_rate(),
                _ => fix.default_prior(),
            };
            candidates.push(FixCandidate {
                fix: *fix,
                prior_success_rate: (observed + root_cause_prior(&root_cause.label, *fix)) / 2.0,
                confidence: confidence_for(observed_attempts),
                observed_attempts,
            });
        }

        candidates.sort_by(|a, b| {
            b.prior_success_rate
                .total_cmp(&a.prior_success_rate)
                .then_with(|| b.confidence.total_cmp(&a.confidence))
                .then_with(|| a.fix.catalog_index().cmp(&b.fix.catalog_index()))
        });

        let mut ranked = candidates.into_iter();
        let selected = ranked.next()?;
        Some(FixDecision {
            selected,
            alternatives: ranked.take(3).collect(),
        })
    }
}
