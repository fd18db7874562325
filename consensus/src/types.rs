//! Core data model: rubric criteria, gradable units, attempts and consensus results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::parser::{ParseOutcome, ParsedResponse};

// ── Rubric ───────────────────────────────────────────────────────────────────

/// One rubric criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    /// Criterion name; the model must report a score under this key.
    pub name: String,
    /// Maximum points for this criterion (strictly positive).
    pub max_points: f64,
    /// What the criterion measures.
    #[serde(default)]
    pub description: String,
    /// Optional grading guidelines shown to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidelines: Option<String>,
}

impl Criterion {
    pub fn new(name: impl Into<String>, max_points: f64, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_points,
            description: description.into(),
            guidelines: None,
        }
    }

    pub fn with_guidelines(mut self, guidelines: impl Into<String>) -> Self {
        self.guidelines = Some(guidelines.into());
        self
    }
}

/// One (problem, student response, rubric) triple requiring a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradableUnit {
    /// Stable identifier, used to key audit records and results.
    pub id: String,
    /// Problem statement.
    pub problem: String,
    /// The student's response.
    pub response: String,
    /// Ordered rubric criteria.
    pub criteria: Vec<Criterion>,
}

impl GradableUnit {
    pub fn new(
        id: impl Into<String>,
        problem: impl Into<String>,
        response: impl Into<String>,
        criteria: Vec<Criterion>,
    ) -> Self {
        Self {
            id: id.into(),
            problem: problem.into(),
            response: response.into(),
            criteria,
        }
    }

    /// Sum of criterion maxima.
    pub fn max_possible(&self) -> f64 {
        self.criteria.iter().map(|c| c.max_points).sum()
    }

    /// Reject units that cannot produce a meaningful score.
    pub fn validate(&self) -> EngineResult<()> {
        if self.criteria.is_empty() {
            return Err(EngineError::unit(&self.id, "no rubric criteria"));
        }
        for criterion in &self.criteria {
            if !(criterion.max_points.is_finite() && criterion.max_points > 0.0) {
                return Err(EngineError::unit(
                    &self.id,
                    format!(
                        "criterion `{}` has max_points {}",
                        criterion.name, criterion.max_points
                    ),
                ));
            }
        }
        for (i, criterion) in self.criteria.iter().enumerate() {
            if self.criteria[..i].iter().any(|c| c.name == criterion.name) {
                return Err(EngineError::unit(
                    &self.id,
                    format!("duplicate criterion `{}`", criterion.name),
                ));
            }
        }
        Ok(())
    }
}

/// A score for one named criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub criterion: String,
    pub score: f64,
}

impl CriterionScore {
    pub fn new(criterion: impl Into<String>, score: f64) -> Self {
        Self {
            criterion: criterion.into(),
            score,
        }
    }
}

// ── Reasoning ────────────────────────────────────────────────────────────────

/// The six labeled reasoning segments, in the order the model must emit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningStepKind {
    Analysis,
    CriterionEvaluation,
    TechnicalAssessment,
    ConceptualUnderstanding,
    FinalScoring,
    Feedback,
}

impl ReasoningStepKind {
    /// All steps in their required order.
    pub const ALL: [Self; 6] = [
        Self::Analysis,
        Self::CriterionEvaluation,
        Self::TechnicalAssessment,
        Self::ConceptualUnderstanding,
        Self::FinalScoring,
        Self::Feedback,
    ];

    /// Label the model writes at the start of the segment.
    pub fn label(self) -> &'static str {
        match self {
            Self::Analysis => "Analysis",
            Self::CriterionEvaluation => "Criterion Evaluation",
            Self::TechnicalAssessment => "Technical Assessment",
            Self::ConceptualUnderstanding => "Conceptual Understanding",
            Self::FinalScoring => "Final Scoring",
            Self::Feedback => "Feedback",
        }
    }

    /// Position in the required order (0-based).
    pub fn position(self) -> usize {
        self as usize
    }

    /// Resolve a label as written by the model (any case, `_`/`-`/space separated).
    pub fn from_label(label: &str) -> Option<Self> {
        let words: Vec<String> = label
            .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
            .filter(|w| !w.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        let key = words.join(" ");
        Self::ALL
            .into_iter()
            .find(|kind| kind.label().eq_ignore_ascii_case(&key))
    }
}

impl fmt::Display for ReasoningStepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One labeled reasoning segment extracted from a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub kind: ReasoningStepKind,
    pub text: String,
}

/// How well the response followed the six-step reasoning structure.
///
/// Independent of score validity: a response can have perfect reasoning and
/// a malformed score block, or the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningQuality {
    /// All six segments present, in order.
    Complete,
    /// Some segments present, but missing or out of order.
    Partial,
    /// No recognisable segments.
    Absent,
}

impl fmt::Display for ReasoningQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial => write!(f, "partial"),
            Self::Absent => write!(f, "absent"),
        }
    }
}

// ── Attempts ─────────────────────────────────────────────────────────────────

/// Why an attempt was excluded from aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptErrorKind {
    /// The capability did not answer within the per-attempt timeout.
    Timeout,
    /// The capability failed (after retries, for transient errors).
    CapabilityError,
    /// The response had no usable score block. Never retried.
    MalformedScore,
    /// The grading session was cancelled before the attempt finished.
    Cancelled,
}

impl fmt::Display for AttemptErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::CapabilityError => write!(f, "capability_error"),
            Self::MalformedScore => write!(f, "malformed_score"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error kind plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    pub kind: AttemptErrorKind,
    pub detail: String,
}

/// One independent grading call's parsed result.
///
/// Built once by the executor and never modified. Invalid attempts carry no
/// scores and are kept only for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    index: u32,
    raw_response: String,
    scores: Vec<CriterionScore>,
    total_score: f64,
    confidence: f64,
    confidence_reported: bool,
    reasoning: Vec<ReasoningStep>,
    reasoning_quality: ReasoningQuality,
    feedback: String,
    suggestions: Vec<String>,
    valid: bool,
    error: Option<AttemptError>,
    calls: u32,
    timestamp: DateTime<Utc>,
}

impl Attempt {
    /// Build an attempt from a response the capability actually returned.
    pub fn from_response(index: u32, raw: impl Into<String>, parsed: ParsedResponse, calls: u32) -> Self {
        let ParsedResponse {
            reasoning,
            quality,
            outcome,
        } = parsed;
        let base = Self {
            index,
            raw_response: raw.into(),
            scores: Vec::new(),
            total_score: 0.0,
            confidence: 0.0,
            confidence_reported: false,
            reasoning,
            reasoning_quality: quality,
            feedback: String::new(),
            suggestions: Vec::new(),
            valid: false,
            error: None,
            calls,
            timestamp: Utc::now(),
        };

        match outcome {
            ParseOutcome::Valid(grade) => Self {
                scores: grade.scores,
                total_score: grade.total,
                confidence: grade.confidence,
                confidence_reported: grade.confidence_reported,
                feedback: grade.feedback,
                suggestions: grade.suggestions,
                valid: true,
                ..base
            },
            ParseOutcome::Invalid(detail) => Self {
                error: Some(AttemptError {
                    kind: AttemptErrorKind::MalformedScore,
                    detail,
                }),
                ..base
            },
        }
    }

    /// Build an attempt that never produced a usable response.
    pub fn failed(index: u32, kind: AttemptErrorKind, detail: impl Into<String>, calls: u32) -> Self {
        Self {
            index,
            raw_response: String::new(),
            scores: Vec::new(),
            total_score: 0.0,
            confidence: 0.0,
            confidence_reported: false,
            reasoning: Vec::new(),
            reasoning_quality: ReasoningQuality::Absent,
            feedback: String::new(),
            suggestions: Vec::new(),
            valid: false,
            error: Some(AttemptError {
                kind,
                detail: detail.into(),
            }),
            calls,
            timestamp: Utc::now(),
        }
    }

    /// 1-based attempt index.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn raw_response(&self) -> &str {
        &self.raw_response
    }

    /// Per-criterion scores in rubric order (empty when invalid).
    pub fn scores(&self) -> &[CriterionScore] {
        &self.scores
    }

    pub fn score_for(&self, criterion: &str) -> Option<f64> {
        self.scores
            .iter()
            .find(|s| s.criterion == criterion)
            .map(|s| s.score)
    }

    pub fn total_score(&self) -> f64 {
        self.total_score
    }

    /// Self-reported confidence, or the neutral default when none was reported.
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Whether the model reported its own confidence.
    pub fn confidence_reported(&self) -> bool {
        self.confidence_reported
    }

    pub fn reasoning(&self) -> &[ReasoningStep] {
        &self.reasoning
    }

    pub fn reasoning_quality(&self) -> ReasoningQuality {
        self.reasoning_quality
    }

    pub fn feedback(&self) -> &str {
        &self.feedback
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn error(&self) -> Option<&AttemptError> {
        self.error.as_ref()
    }

    pub fn error_kind(&self) -> Option<AttemptErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Capability calls made for this attempt (1 + retries).
    pub fn calls(&self) -> u32 {
        self.calls
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// ── Consensus ────────────────────────────────────────────────────────────────

/// Why a result needs human review. Only the highest-priority cause is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    /// Fewer valid attempts than the configured quorum.
    InsufficientQuorum,
    /// Consensus total above the sum of criterion maxima.
    ScoreExceedsMaximum,
    /// Blended confidence below the threshold.
    LowConfidence,
    /// Attempt totals disagree by more than the allowed fraction of max points.
    HighVariance,
}

impl FlagReason {
    pub const ALL: [Self; 4] = [
        Self::InsufficientQuorum,
        Self::ScoreExceedsMaximum,
        Self::LowConfidence,
        Self::HighVariance,
    ];
}

impl fmt::Display for FlagReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientQuorum => write!(f, "insufficient_quorum"),
            Self::ScoreExceedsMaximum => write!(f, "score_exceeds_maximum"),
            Self::LowConfidence => write!(f, "low_confidence"),
            Self::HighVariance => write!(f, "high_variance"),
        }
    }
}

/// Raw inputs of the blended confidence, exposed for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    /// Mean self-reported confidence over valid attempts.
    pub self_reported: f64,
    /// `1 − mean(σ_criterion / max_criterion)`, clamped to [0, 1].
    pub agreement: f64,
    /// Weighted blend of the two, clamped to [0, 1].
    pub blended: f64,
}

impl ConfidenceBreakdown {
    pub const ZERO: Self = Self {
        self_reported: 0.0,
        agreement: 0.0,
        blended: 0.0,
    };
}

/// The reconciled grade for one gradable unit.
///
/// Constructed only by [`ConsensusAggregator`](crate::aggregator::ConsensusAggregator);
/// a new grading call produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    unit_id: String,
    criterion_scores: Vec<CriterionScore>,
    total_score: f64,
    max_possible: f64,
    percentage: f64,
    confidence: ConfidenceBreakdown,
    score_std_dev: f64,
    valid_attempts: usize,
    requested_attempts: usize,
    quorum: usize,
    flagged: bool,
    flag_reason: Option<FlagReason>,
    feedback: String,
    suggestions: Vec<String>,
    graded_at: DateTime<Utc>,
}

/// Field bundle used by the aggregator to construct a result in one shot.
pub(crate) struct ConsensusParts {
    pub unit_id: String,
    pub criterion_scores: Vec<CriterionScore>,
    pub max_possible: f64,
    pub confidence: ConfidenceBreakdown,
    pub score_std_dev: f64,
    pub valid_attempts: usize,
    pub requested_attempts: usize,
    pub quorum: usize,
    pub flag_reason: Option<FlagReason>,
    pub feedback: String,
    pub suggestions: Vec<String>,
}

impl ConsensusResult {
    pub(crate) fn from_parts(parts: ConsensusParts) -> Self {
        let total_score: f64 = parts.criterion_scores.iter().map(|s| s.score).sum();
        let percentage = if parts.max_possible > 0.0 {
            total_score / parts.max_possible * 100.0
        } else {
            0.0
        };
        Self {
            unit_id: parts.unit_id,
            criterion_scores: parts.criterion_scores,
            total_score,
            max_possible: parts.max_possible,
            percentage,
            confidence: parts.confidence,
            score_std_dev: parts.score_std_dev,
            valid_attempts: parts.valid_attempts,
            requested_attempts: parts.requested_attempts,
            quorum: parts.quorum,
            flagged: parts.flag_reason.is_some(),
            flag_reason: parts.flag_reason,
            feedback: parts.feedback,
            suggestions: parts.suggestions,
            graded_at: Utc::now(),
        }
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// Per-criterion consensus (median) scores in rubric order.
    pub fn criterion_scores(&self) -> &[CriterionScore] {
        &self.criterion_scores
    }

    pub fn score_for(&self, criterion: &str) -> Option<f64> {
        self.criterion_scores
            .iter()
            .find(|s| s.criterion == criterion)
            .map(|s| s.score)
    }

    /// Sum of the per-criterion consensus scores.
    pub fn total_score(&self) -> f64 {
        self.total_score
    }

    pub fn max_possible(&self) -> f64 {
        self.max_possible
    }

    /// `total / max_possible × 100`.
    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    /// Blended confidence in [0, 1].
    pub fn confidence(&self) -> f64 {
        self.confidence.blended
    }

    pub fn confidence_breakdown(&self) -> ConfidenceBreakdown {
        self.confidence
    }

    /// Population standard deviation of valid attempts' totals.
    pub fn score_std_dev(&self) -> f64 {
        self.score_std_dev
    }

    pub fn valid_attempts(&self) -> usize {
        self.valid_attempts
    }

    pub fn requested_attempts(&self) -> usize {
        self.requested_attempts
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn quorum_met(&self) -> bool {
        self.valid_attempts >= self.quorum
    }

    pub fn flagged(&self) -> bool {
        self.flagged
    }

    pub fn flag_reason(&self) -> Option<FlagReason> {
        self.flag_reason
    }

    pub fn feedback(&self) -> &str {
        &self.feedback
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    pub fn graded_at(&self) -> DateTime<Utc> {
        self.graded_at
    }
}
