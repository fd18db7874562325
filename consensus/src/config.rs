//! Engine configuration.
//!
//! Passed by value into [`ConsensusEngine`](crate::engine::ConsensusEngine);
//! there is no ambient global state. Durations are (de)serialized as
//! milliseconds so TOML files stay readable:
//!
//! ```toml
//! attempt_count = 5
//! quorum = 3
//! per_attempt_timeout_ms = 60000
//! retry_budget = 3
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Default number of attempts per gradable unit.
const DEFAULT_ATTEMPT_COUNT: usize = 5;
/// Results below this blended confidence are flagged.
const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;
/// Std-dev of totals above this fraction of max points is flagged.
const DEFAULT_VARIANCE_THRESHOLD_FRACTION: f64 = 0.15;
const DEFAULT_PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_BUDGET: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
const DEFAULT_TEMPERATURE: f32 = 0.3;
const DEFAULT_SELF_REPORT_WEIGHT: f64 = 0.5;
const DEFAULT_MAX_CONCURRENT_UNITS: usize = 4;

/// What happens to in-flight attempts when a grading session is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Let in-flight attempts finish; attempts not yet started are skipped.
    #[default]
    Drain,
    /// Abort in-flight attempts immediately.
    Abort,
}

/// Immutable configuration for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts issued per gradable unit (N ≥ 1).
    pub attempt_count: usize,
    /// Minimum valid attempts for a trusted consensus. `None` = majority of N.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quorum: Option<usize>,
    /// Blended confidence below this is flagged `LowConfidence`.
    pub confidence_threshold: f64,
    /// Std-dev of attempt totals above `fraction × max_possible` is flagged `HighVariance`.
    pub variance_threshold_fraction: f64,
    /// Upper bound on a single capability call.
    #[serde(rename = "per_attempt_timeout_ms", with = "millis")]
    pub per_attempt_timeout: Duration,
    /// Retries for transient capability errors, per attempt.
    pub retry_budget: u32,
    /// First backoff delay; doubles on each retry.
    #[serde(rename = "backoff_base_ms", with = "millis")]
    pub backoff_base: Duration,
    /// Ceiling for a single backoff delay.
    #[serde(rename = "backoff_max_ms", with = "millis")]
    pub backoff_max: Duration,
    /// Sampling temperature passed to the capability.
    pub temperature: f32,
    /// Weight of self-reported confidence in the blend (agreement gets the rest).
    pub self_report_weight: f64,
    /// Units graded concurrently by `grade_batch`.
    pub max_concurrent_units: usize,
    pub cancel_policy: CancelPolicy,
    /// Cap on merged suggestions. `None` keeps all distinct suggestions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_suggestions: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attempt_count: DEFAULT_ATTEMPT_COUNT,
            quorum: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            variance_threshold_fraction: DEFAULT_VARIANCE_THRESHOLD_FRACTION,
            per_attempt_timeout: DEFAULT_PER_ATTEMPT_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            temperature: DEFAULT_TEMPERATURE,
            self_report_weight: DEFAULT_SELF_REPORT_WEIGHT,
            max_concurrent_units: DEFAULT_MAX_CONCURRENT_UNITS,
            cancel_policy: CancelPolicy::Drain,
            max_suggestions: None,
        }
    }
}

impl EngineConfig {
    /// Config with `attempt_count` attempts and the default (majority) quorum.
    pub fn with_attempts(attempt_count: usize) -> Self {
        Self {
            attempt_count,
            ..Self::default()
        }
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = Some(quorum);
        self
    }

    /// Quorum actually enforced: the configured value, else `N / 2 + 1`.
    pub fn effective_quorum(&self) -> usize {
        self.quorum.unwrap_or(self.attempt_count / 2 + 1)
    }

    /// Exponential backoff before retry `retry` (1-based), honouring a provider hint.
    pub fn backoff_delay(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let delay = self.backoff_base.saturating_mul(factor).min(self.backoff_max);
        match hint {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.attempt_count == 0 {
            return Err(EngineError::config("attempt_count must be at least 1"));
        }
        let quorum = self.effective_quorum();
        if quorum == 0 || quorum > self.attempt_count {
            return Err(EngineError::config(format!(
                "quorum {quorum} must be within 1..={}",
                self.attempt_count
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(EngineError::config(format!(
                "confidence_threshold {} must be within [0, 1]",
                self.confidence_threshold
            )));
        }
        if !(self.variance_threshold_fraction > 0.0 && self.variance_threshold_fraction <= 1.0) {
            return Err(EngineError::config(format!(
                "variance_threshold_fraction {} must be within (0, 1]",
                self.variance_threshold_fraction
            )));
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(EngineError::config("per_attempt_timeout must be non-zero"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(EngineError::config(format!(
                "backoff_base {:?} exceeds backoff_max {:?}",
                self.backoff_base, self.backoff_max
            )));
        }
        if !(0.0..=1.0).contains(&self.self_report_weight) {
            return Err(EngineError::config(format!(
                "self_report_weight {} must be within [0, 1]",
                self.self_report_weight
            )));
        }
        if self.max_concurrent_units == 0 {
            return Err(EngineError::config("max_concurrent_units must be at least 1"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(EngineError::config(format!(
                "temperature {} must be a non-negative number",
                self.temperature
            )));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
