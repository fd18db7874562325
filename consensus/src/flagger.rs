//! Review flagging policy.
//!
//! Priority order, first match wins:
//!
//! | # | Reason                | Condition                                        |
//! |---|-----------------------|--------------------------------------------------|
//! | 1 | `InsufficientQuorum`  | valid attempts < quorum                          |
//! | 2 | `ScoreExceedsMaximum` | total > max possible                             |
//! | 3 | `LowConfidence`       | confidence < `confidence_threshold`              |
//! | 4 | `HighVariance`        | σ(totals) > `variance_threshold_fraction × max`  |

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::types::FlagReason;

/// Tolerance for the score-exceeds-maximum check.
const SCORE_EPSILON: f64 = 1e-9;

/// The facts the policy looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlagInputs {
    pub valid_attempts: usize,
    pub quorum: usize,
    pub total_score: f64,
    pub max_possible: f64,
    pub confidence: f64,
    pub score_std_dev: f64,
}

/// Flag verdict for one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub flagged: bool,
    pub reason: Option<FlagReason>,
}

impl ReviewDecision {
    pub const CLEAR: Self = Self {
        flagged: false,
        reason: None,
    };

    fn flag(reason: FlagReason) -> Self {
        Self {
            flagged: true,
            reason: Some(reason),
        }
    }
}

/// Threshold policy; pure and cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReviewFlagger {
    pub confidence_threshold: f64,
    pub variance_threshold_fraction: f64,
}

impl ReviewFlagger {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            variance_threshold_fraction: config.variance_threshold_fraction,
        }
    }

    pub fn review(&self, inputs: &FlagInputs) -> ReviewDecision {
        if inputs.valid_attempts < inputs.quorum {
            return ReviewDecision::flag(FlagReason::InsufficientQuorum);
        }
        if inputs.total_score > inputs.max_possible + SCORE_EPSILON {
            return ReviewDecision::flag(FlagReason::ScoreExceedsMaximum);
        }
        if inputs.confidence < self.confidence_threshold {
            return ReviewDecision::flag(FlagReason::LowConfidence);
        }
        if inputs.score_std_dev > self.variance_threshold_fraction * inputs.max_possible {
            return ReviewDecision::flag(FlagReason::HighVariance);
        }
        ReviewDecision::CLEAR
    }
}

impl Default for ReviewFlagger {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
