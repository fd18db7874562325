//! Self-Consistency Consensus Engine
//!
//! Grades one free-form submission by asking a language model the same
//! question N times, then reconciling the independent answers into a single
//! defensible score.
//!
//! # Pipeline
//!
//! ```text
//! GradableUnit + prompt
//!   → AttemptExecutor     N independent capability calls (timeout, retry, backoff)
//!   → ResponseParser      raw text → Valid(ParsedGrade) | Invalid(reason)
//!   → AuditSink           one record per attempt, valid or not
//!   → ConsensusAggregator per-criterion median, summed total, blended confidence
//!   → ReviewFlagger       single actionable flag reason
//!   → FeedbackMerger      deduplicated feedback and suggestions
//!   = GradingOutcome { result: ConsensusResult, attempts }
//! ```
//!
//! The model itself is injected through [`GradingCapability`]; the crate
//! never talks to a network. [`ScriptedCapability`] is a deterministic stand-in
//! for tests and offline runs.
//!
//! # Usage
//!
//! ```rust,ignore
//! use consensus::{ConsensusEngine, EngineConfig};
//!
//! let engine = ConsensusEngine::builder()
//!     .config(EngineConfig::default())
//!     .capability(capability)
//!     .build()?;
//!
//! let outcome = engine.grade_unit(&unit, &prompt).await?;
//! if outcome.result.flagged() {
//!     // route to human review
//! }
//! ```

pub mod aggregator;
pub mod audit;
pub mod capability;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod feedback;
pub mod flagger;
pub mod parser;
pub mod report;
pub mod stats;
pub mod types;

pub use aggregator::ConsensusAggregator;
pub use audit::{AuditError, AuditRecord, AuditResult, AuditSink, JsonlAuditSink, MemoryAuditSink};
pub use capability::{CapabilityError, GradingCapability, ScriptedCapability, ScriptedReply};
pub use config::{CancelPolicy, EngineConfig};
pub use engine::{ConsensusEngine, ConsensusEngineBuilder, GradingOutcome, GradingRequest};
pub use error::{EngineError, EngineResult};
pub use executor::{AttemptExecutor, AttemptState};
pub use feedback::{FeedbackMerger, MergedFeedback, FAILED_GRADING_FEEDBACK};
pub use flagger::{FlagInputs, ReviewDecision, ReviewFlagger};
pub use parser::{parse_response, ParseOutcome, ParsedGrade, ParsedResponse};
pub use report::{ConsistencyReport, ConsistencyReporter};
pub use types::{
    Attempt, AttemptError, AttemptErrorKind, ConfidenceBreakdown, ConsensusResult, Criterion,
    CriterionScore, FlagReason, GradableUnit, ReasoningQuality, ReasoningStep, ReasoningStepKind,
};

// Re-exported so callers can cancel grading sessions without a direct dependency.
pub use tokio_util::sync::CancellationToken;
