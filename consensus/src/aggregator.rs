//! Consensus aggregation over one unit's attempts.
//!
//! Per-criterion medians are taken first and then summed: criteria carry
//! distinct attempt-level noise, so the median of totals would not line up
//! with the per-criterion breakdown.

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::feedback::FeedbackMerger;
use crate::flagger::{FlagInputs, ReviewFlagger};
use crate::stats::{mean, median, population_std_dev};
use crate::types::{
    Attempt, ConfidenceBreakdown, ConsensusParts, ConsensusResult, CriterionScore, GradableUnit,
};

/// Reduces a unit's attempts to one [`ConsensusResult`].
#[derive(Debug, Clone)]
pub struct ConsensusAggregator {
    attempt_count: usize,
    quorum: usize,
    self_report_weight: f64,
    flagger: ReviewFlagger,
    merger: FeedbackMerger,
}

impl ConsensusAggregator {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            attempt_count: config.attempt_count,
            quorum: config.effective_quorum(),
            self_report_weight: config.self_report_weight,
            flagger: ReviewFlagger::from_config(config),
            merger: FeedbackMerger::new(config.max_suggestions),
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Aggregate every attempt for `unit`; invalid attempts are ignored.
    pub fn aggregate(&self, unit: &GradableUnit, attempts: &[Attempt]) -> ConsensusResult {
        let valid: Vec<&Attempt> = attempts.iter().filter(|a| a.is_valid()).collect();
        let requested = self.attempt_count.max(attempts.len());
        let max_possible = unit.max_possible();

        let mut criterion_scores = Vec::with_capacity(unit.criteria.len());
        let mut dispersion = Vec::with_capacity(unit.criteria.len());
        for criterion in &unit.criteria {
            let values: Vec<f64> = valid
                .iter()
                .filter_map(|a| a.score_for(&criterion.name))
                .collect();
            criterion_scores.push(CriterionScore::new(criterion.name.clone(), median(&values)));
            if criterion.max_points > 0.0 {
                dispersion.push(population_std_dev(&values) / criterion.max_points);
            }
        }

        let totals: Vec<f64> = valid.iter().map(|a| a.total_score()).collect();
        let score_std_dev = population_std_dev(&totals);

        let confidence = if valid.is_empty() {
            ConfidenceBreakdown::ZERO
        } else {
            let self_reported = mean(&valid.iter().map(|a| a.confidence()).collect::<Vec<_>>());
            let agreement = (1.0 - mean(&dispersion)).clamp(0.0, 1.0);
            let w = self.self_report_weight;
            ConfidenceBreakdown {
                self_reported,
                agreement,
                blended: (w * self_reported + (1.0 - w) * agreement).clamp(0.0, 1.0),
            }
        };

        let total_score: f64 = criterion_scores.iter().map(|s| s.score).sum();
        let decision = self.flagger.review(&FlagInputs {
            valid_attempts: valid.len(),
            quorum: self.quorum,
            total_score,
            max_possible,
            confidence: confidence.blended,
            score_std_dev,
        });

        if valid.is_empty() {
            warn!(unit = %unit.id, requested, "no valid attempts, result needs manual review");
        }
        let merged = self
            .merger
            .merge(valid.iter().map(|a| (a.feedback(), a.suggestions())));

        debug!(
            unit = %unit.id,
            valid = valid.len(),
            requested,
            total = total_score,
            std_dev = score_std_dev,
            confidence = confidence.blended,
            "aggregated attempts"
        );
        if let Some(reason) = decision.reason {
            info!(unit = %unit.id, %reason, "result flagged for review");
        }

        ConsensusResult::from_parts(ConsensusParts {
            unit_id: unit.id.clone(),
            criterion_scores,
            max_possible,
            confidence,
            score_std_dev,
            valid_attempts: valid.len(),
            requested_attempts: requested,
            quorum: self.quorum,
            flag_reason: decision.reason,
            feedback: merged.feedback,
            suggestions: merged.suggestions,
        })
    }
}
