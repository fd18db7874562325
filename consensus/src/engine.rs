//! Engine entry points: grade one unit, or a batch under a concurrency bound.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument, Span};

use crate::aggregator::ConsensusAggregator;
use crate::audit::{AuditSink, MemoryAuditSink};
use crate::capability::GradingCapability;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::executor::AttemptExecutor;
use crate::types::{Attempt, AttemptErrorKind, ConsensusResult, GradableUnit};

/// One unit plus the prompt to send for it.
#[derive(Debug, Clone)]
pub struct GradingRequest {
    pub unit: GradableUnit,
    pub prompt: String,
}

impl GradingRequest {
    pub fn new(unit: GradableUnit, prompt: impl Into<String>) -> Self {
        Self {
            unit,
            prompt: prompt.into(),
        }
    }
}

/// Consensus result plus every attempt behind it, invalid ones included.
#[derive(Debug, Clone)]
pub struct GradingOutcome {
    pub result: ConsensusResult,
    pub attempts: Vec<Attempt>,
}

/// Self-consistency grading engine.
///
/// Cheap to clone; clones share the capability and audit sink.
#[derive(Clone)]
pub struct ConsensusEngine {
    config: Arc<EngineConfig>,
    executor: AttemptExecutor,
    aggregator: ConsensusAggregator,
}

impl ConsensusEngine {
    pub fn builder() -> ConsensusEngineBuilder {
        ConsensusEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Grade one unit with no external cancellation.
    pub async fn grade_unit(&self, unit: &GradableUnit, prompt: &str) -> EngineResult<GradingOutcome> {
        self.grade_unit_with_cancel(unit, prompt, &CancellationToken::new())
            .await
    }

    /// Grade one unit. Fails only when the unit itself is unusable.
    pub async fn grade_unit_with_cancel(
        &self,
        unit: &GradableUnit,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<GradingOutcome> {
        unit.validate()?;
        Ok(self
            .grade_validated(Arc::new(unit.clone()), Arc::from(prompt), cancel.clone())
            .await)
    }

    /// Grade many units, at most `max_concurrent_units` at a time.
    ///
    /// Outcomes are returned in input order, one per request, even when
    /// cancelled. A unit that fails validation gets a flagged, zero-score
    /// outcome without any capability call; the rest of the batch still runs.
    pub async fn grade_batch(
        &self,
        requests: Vec<GradingRequest>,
        cancel: &CancellationToken,
    ) -> Vec<GradingOutcome> {
        let total = requests.len();
        info!(
            units = total,
            concurrency = self.config.max_concurrent_units,
            "starting batch"
        );

        let sem = Arc::new(Semaphore::new(self.config.max_concurrent_units));
        let units: Vec<Arc<GradableUnit>> =
            requests.iter().map(|r| Arc::new(r.unit.clone())).collect();
        let mut slots: Vec<Option<GradingOutcome>> = (0..total).map(|_| None).collect();
        let mut join_set: JoinSet<(usize, GradingOutcome)> = JoinSet::new();

        for (position, request) in requests.into_iter().enumerate() {
            let unit = units[position].clone();
            if let Err(e) = unit.validate() {
                warn!(unit = %unit.id, "skipping invalid unit: {e}");
                slots[position] = Some(self.failed_outcome(&unit, &e.to_string()));
                continue;
            }
            let engine = self.clone();
            let sem = sem.clone();
            let prompt: Arc<str> = Arc::from(request.prompt);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                // The semaphore is never closed; a failed acquire just runs unbounded.
                let _permit = sem.acquire().await.ok();
                let outcome = engine.grade_validated(unit, prompt, cancel).await;
                (position, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((position, outcome)) => slots[position] = Some(outcome),
                Err(e) => warn!("grading task failed: {e}"),
            }
        }

        let outcomes: Vec<GradingOutcome> = slots
            .into_iter()
            .zip(&units)
            .map(|(slot, unit)| {
                slot.unwrap_or_else(|| self.failed_outcome(unit, "grading task panicked"))
            })
            .collect();

        let flagged = outcomes.iter().filter(|o| o.result.flagged()).count();
        info!(units = total, flagged, "batch complete");
        outcomes
    }

    async fn grade_validated(
        &self,
        unit: Arc<GradableUnit>,
        prompt: Arc<str>,
        cancel: CancellationToken,
    ) -> GradingOutcome {
        let span = tracing::info_span!(
            "grade_unit",
            unit = %unit.id,
            attempts = self.config.attempt_count,
            valid = tracing::field::Empty,
            flagged = tracing::field::Empty,
        );
        let attempts = self
            .executor
            .run(unit.clone(), prompt, &cancel)
            .instrument(span.clone())
            .await;
        let result = span.in_scope(|| self.aggregator.aggregate(&unit, &attempts));
        record_outcome(&span, &result);

        info!(
            parent: &span,
            total = result.total_score(),
            max = result.max_possible(),
            confidence = result.confidence(),
            flag = ?result.flag_reason(),
            "unit graded"
        );
        GradingOutcome { result, attempts }
    }

    /// Outcome for a unit that was never graded: every attempt failed with `detail`.
    fn failed_outcome(&self, unit: &GradableUnit, detail: &str) -> GradingOutcome {
        let attempts: Vec<Attempt> = (1..=self.config.attempt_count as u32)
            .map(|i| Attempt::failed(i, AttemptErrorKind::CapabilityError, detail, 0))
            .collect();
        let result = self.aggregator.aggregate(unit, &attempts);
        GradingOutcome { result, attempts }
    }
}

fn record_outcome(span: &Span, result: &ConsensusResult) {
    span.record("valid", result.valid_attempts());
    span.record("flagged", result.flagged());
}

/// Builder for [`ConsensusEngine`].
#[derive(Default)]
pub struct ConsensusEngineBuilder {
    config: Option<EngineConfig>,
    capability: Option<Arc<dyn GradingCapability>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
}

impl ConsensusEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn capability(self, capability: impl GradingCapability + 'static) -> Self {
        self.shared_capability(Arc::new(capability))
    }

    pub fn shared_capability(mut self, capability: Arc<dyn GradingCapability>) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Where attempt records go. Defaults to an in-memory sink.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn build(self) -> EngineResult<ConsensusEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let capability = self.capability.ok_or(EngineError::MissingCapability)?;
        let audit = self
            .audit_sink
            .unwrap_or_else(|| Arc::new(MemoryAuditSink::new()));

        let config = Arc::new(config);
        Ok(ConsensusEngine {
            aggregator: ConsensusAggregator::from_config(&config),
            executor: AttemptExecutor::new(capability, config.clone(), audit),
            config,
        })
    }
}
