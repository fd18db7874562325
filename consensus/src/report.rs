//! Batch-level consistency statistics for quality monitoring.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stats::mean;
use crate::types::{ConsensusResult, FlagReason};

/// Aggregate statistics over a set of consensus results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub unit_count: usize,
    pub flagged_count: usize,
    /// Flagged units / all units (0.0 – 1.0)
    pub flagged_rate: f64,
    pub flag_reasons: BTreeMap<FlagReason, usize>,
    pub mean_confidence: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub mean_score_std_dev: f64,
    pub max_score_std_dev: f64,
    pub mean_percentage: f64,
    /// Valid attempts / requested attempts, summed over all units
    pub attempt_success_rate: f64,
    pub flagged_units: Vec<String>,
}

/// Builds a [`ConsistencyReport`] from results.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistencyReporter;

impl ConsistencyReporter {
    pub fn summarize(results: &[ConsensusResult]) -> ConsistencyReport {
        if results.is_empty() {
            return ConsistencyReport::default();
        }

        let confidences: Vec<f64> = results.iter().map(|r| r.confidence()).collect();
        let std_devs: Vec<f64> = results.iter().map(|r| r.score_std_dev()).collect();
        let percentages: Vec<f64> = results.iter().map(|r| r.percentage()).collect();

        let mut flag_reasons = BTreeMap::new();
        let mut flagged_units = Vec::new();
        for result in results.iter().filter(|r| r.flagged()) {
            flagged_units.push(result.unit_id().to_string());
            if let Some(reason) = result.flag_reason() {
                *flag_reasons.entry(reason).or_insert(0) += 1;
            }
        }

        let valid: usize = results.iter().map(|r| r.valid_attempts()).sum();
        let requested: usize = results.iter().map(|r| r.requested_attempts()).sum();

        ConsistencyReport {
            unit_count: results.len(),
            flagged_count: flagged_units.len(),
            flagged_rate: flagged_units.len() as f64 / results.len() as f64,
            flag_reasons,
            mean_confidence: mean(&confidences),
            min_confidence: confidences.iter().copied().fold(f64::INFINITY, f64::min),
            max_confidence: confidences.iter().copied().fold(0.0, f64::max),
            mean_score_std_dev: mean(&std_devs),
            max_score_std_dev: std_devs.iter().copied().fold(0.0, f64::max),
            mean_percentage: mean(&percentages),
            attempt_success_rate: if requested > 0 {
                valid as f64 / requested as f64
            } else {
                0.0
            },
            flagged_units,
        }
    }
}

impl ConsistencyReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Consistency Report")?;
        writeln!(f)?;
        writeln!(f, "| Metric | Value |")?;
        writeln!(f, "|--------|-------|")?;
        writeln!(f, "| Units | {} |", self.unit_count)?;
        writeln!(
            f,
            "| Flagged | {} ({:.1}%) |",
            self.flagged_count,
            self.flagged_rate * 100.0
        )?;
        writeln!(
            f,
            "| Confidence (mean / min / max) | {:.2} / {:.2} / {:.2} |",
            self.mean_confidence, self.min_confidence, self.max_confidence
        )?;
        writeln!(
            f,
            "| Score std-dev (mean / max) | {:.2} / {:.2} |",
            self.mean_score_std_dev, self.max_score_std_dev
        )?;
        writeln!(f, "| Mean percentage | {:.1}% |", self.mean_percentage)?;
        writeln!(
            f,
            "| Attempt success rate | {:.1}% |",
            self.attempt_success_rate * 100.0
        )?;

        if !self.flag_reasons.is_empty() {
            writeln!(f)?;
            writeln!(f, "## Flag reasons")?;
            writeln!(f)?;
            for (reason, count) in &self.flag_reasons {
                writeln!(f, "- {reason}: {count}")?;
            }
        }
        if !self.flagged_units.is_empty() {
            writeln!(f)?;
            writeln!(f, "## Needs review")?;
            writeln!(f)?;
            for unit in &self.flagged_units {
                writeln!(f, "- {unit}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ConsensusAggregator;
    use crate::config::EngineConfig;
    use crate::parser::parse_response;
    use crate::types::{Attempt, AttemptErrorKind, Criterion, GradableUnit};

    fn unit(id: &str) -> GradableUnit {
        GradableUnit::new(id, "p", "r", vec![Criterion::new("score", 10.0, "")])
    }

    fn valid(u: &GradableUnit, index: u32, score: f64) -> Attempt {
        let raw = format!(r#"{{"scores": {{"score": {score}}}, "confidence": 0.9}}"#);
        Attempt::from_response(index, raw.clone(), parse_response(&raw, &u.criteria), 1)
    }

    fn results() -> Vec<ConsensusResult> {
        let aggregator = ConsensusAggregator::from_config(&EngineConfig::with_attempts(3));
        let good = unit("good");
        let failed = unit("failed");
        vec![
            aggregator.aggregate(
                &good,
                &[valid(&good, 1, 8.0), valid(&good, 2, 8.0), valid(&good, 3, 8.0)],
            ),
            aggregator.aggregate(
                &failed,
                &[
                    valid(&failed, 1, 4.0),
                    Attempt::failed(2, AttemptErrorKind::Timeout, "t", 1),
                    Attempt::failed(3, AttemptErrorKind::Timeout, "t", 1),
                ],
            ),
        ]
    }

    #[test]
    fn test_empty_input_is_all_zero() {
        let report = ConsistencyReporter::summarize(&[]);
        assert_eq!(report, ConsistencyReport::default());
        assert_eq!(report.flagged_rate, 0.0);
    }

    #[test]
    fn test_counts_flags_and_attempt_success() {
        let report = ConsistencyReporter::summarize(&results());
        assert_eq!(report.unit_count, 2);
        assert_eq!(report.flagged_count, 1);
        assert_eq!(report.flagged_rate, 0.5);
        assert_eq!(report.flagged_units, vec!["failed".to_string()]);
        assert_eq!(report.flag_reasons.get(&FlagReason::InsufficientQuorum), Some(&1));
        assert!((report.attempt_success_rate - 4.0 / 6.0).abs() < 1e-9);
        assert!((report.mean_percentage - 60.0).abs() < 1e-9);
        assert!(report.min_confidence <= report.mean_confidence);
        assert!(report.mean_confidence <= report.max_confidence);
    }

    #[test]
    fn test_display_lists_units_needing_review() {
        let text = ConsistencyReporter::summarize(&results()).to_string();
        assert!(text.contains("| Units | 2 |"));
        assert!(text.contains("- insufficient_quorum: 1"));
        assert!(text.contains("- failed"));
    }

    #[test]
    fn test_report_round_trips_through_json() {
        let report = ConsistencyReporter::summarize(&results());
        let json = report.to_json().unwrap();
        assert!(json.contains("\"insufficient_quorum\": 1"));
        let back: ConsistencyReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
