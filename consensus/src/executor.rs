//! Attempt fan-out with timeout, bounded retry and cancellation.
//!
//! ```text
//! run(unit, prompt)
//!   JoinSet::spawn(attempt_i) × N        independent capability calls
//!     Pending ─ok──────────────────────▶ Succeeded → parse → Attempt
//!        │ transient error, budget left
//!        ▼
//!     Retrying(k) ─ backoff ─ call ─...▶ Succeeded | Failed
//!     (timeout, rejected, budget spent) ▶ Failed
//!   audit each attempt as it completes
//!   join all → sort by index
//! ```
//!
//! Attempts share nothing but the read-only unit, prompt and capability
//! handle. Aggregation only ever sees the joined, index-sorted list.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::capability::{CapabilityError, GradingCapability};
use crate::config::{CancelPolicy, EngineConfig};
use crate::parser::parse_response;
use crate::types::{Attempt, AttemptErrorKind, GradableUnit};

/// Retry state of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// No call made yet.
    Pending,
    /// Waiting to make retry `k` (1-based).
    Retrying(u32),
    Succeeded,
    Failed,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Retries already scheduled.
    pub fn retries(self) -> u32 {
        match self {
            Self::Retrying(k) => k,
            _ => 0,
        }
    }

    pub fn after_success(self) -> Self {
        if self.is_terminal() {
            return self;
        }
        Self::Succeeded
    }

    /// Next state after a failed call.
    pub fn after_error(self, transient: bool, budget: u32) -> Self {
        if self.is_terminal() {
            return self;
        }
        let next = self.retries() + 1;
        if transient && next <= budget {
            Self::Retrying(next)
        } else {
            Self::Failed
        }
    }
}

/// Everything an attempt task needs; cloned into each task.
#[derive(Clone)]
struct AttemptContext {
    capability: Arc<dyn GradingCapability>,
    config: Arc<EngineConfig>,
    audit: Arc<dyn AuditSink>,
    unit: Arc<GradableUnit>,
    prompt: Arc<str>,
    cancel: CancellationToken,
}

/// Runs the N attempts for one unit.
#[derive(Clone)]
pub struct AttemptExecutor {
    capability: Arc<dyn GradingCapability>,
    config: Arc<EngineConfig>,
    audit: Arc<dyn AuditSink>,
}

impl AttemptExecutor {
    pub fn new(
        capability: Arc<dyn GradingCapability>,
        config: Arc<EngineConfig>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            capability,
            config,
            audit,
        }
    }

    /// Issue `attempt_count` attempts and return all of them, sorted by index.
    ///
    /// Always returns exactly `attempt_count` attempts; failures are recorded
    /// as invalid attempts rather than errors.
    pub async fn run(
        &self,
        unit: Arc<GradableUnit>,
        prompt: Arc<str>,
        cancel: &CancellationToken,
    ) -> Vec<Attempt> {
        let n = self.config.attempt_count as u32;
        let ctx = AttemptContext {
            capability: self.capability.clone(),
            config: self.config.clone(),
            audit: self.audit.clone(),
            unit: unit.clone(),
            prompt,
            cancel: cancel.clone(),
        };

        debug!(unit = %unit.id, attempts = n, "dispatching attempts");

        let mut join_set: JoinSet<Attempt> = JoinSet::new();
        for index in 1..=n {
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let attempt = if ctx.cancel.is_cancelled() {
                    Attempt::failed(
                        index,
                        AttemptErrorKind::Cancelled,
                        "session cancelled before attempt started",
                        0,
                    )
                } else {
                    run_attempt(&ctx, index).await
                };
                audit(ctx.audit.as_ref(), &ctx.unit.id, &attempt);
                attempt
            });
        }

        let abort_on_cancel = self.config.cancel_policy == CancelPolicy::Abort;
        let mut aborted = false;
        let mut attempts = Vec::with_capacity(n as usize);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if abort_on_cancel && !aborted => {
                    info!(unit = %unit.id, in_flight = join_set.len(), "cancellation requested, aborting attempts");
                    join_set.abort_all();
                    aborted = true;
                }
                next = join_set.join_next() => match next {
                    None => break,
                    Some(Ok(attempt)) => attempts.push(attempt),
                    Some(Err(e)) if e.is_panic() => {
                        warn!(unit = %unit.id, "attempt task panicked: {e}");
                    }
                    Some(Err(_)) => {}
                },
            }
        }

        // Aborted or panicked tasks never reached the audit sink.
        let seen: HashSet<u32> = attempts.iter().map(|a| a.index()).collect();
        for index in (1..=n).filter(|i| !seen.contains(i)) {
            let attempt = if aborted {
                Attempt::failed(
                    index,
                    AttemptErrorKind::Cancelled,
                    "attempt aborted by cancellation",
                    0,
                )
            } else {
                Attempt::failed(
                    index,
                    AttemptErrorKind::CapabilityError,
                    "attempt task panicked",
                    0,
                )
            };
            audit(self.audit.as_ref(), &unit.id, &attempt);
            attempts.push(attempt);
        }

        attempts.sort_by_key(|a| a.index());

        let valid = attempts.iter().filter(|a| a.is_valid()).count();
        debug!(unit = %unit.id, valid, requested = n, "attempts joined");
        attempts
    }
}

async fn run_attempt(ctx: &AttemptContext, index: u32) -> Attempt {
    let unit = &ctx.unit;
    let config = &ctx.config;
    let mut state = AttemptState::Pending;
    let mut calls = 0u32;

    loop {
        calls += 1;
        debug!(unit = %unit.id, attempt = index, call = calls, "calling capability");
        let call = ctx
            .capability
            .evaluate(&ctx.prompt, unit, config.temperature);

        let err = match tokio::time::timeout(config.per_attempt_timeout, call).await {
            Err(_) => {
                debug!(unit = %unit.id, attempt = index, from = ?state, to = ?AttemptState::Failed, "attempt timed out");
                return Attempt::failed(
                    index,
                    AttemptErrorKind::Timeout,
                    format!("no response within {:?}", config.per_attempt_timeout),
                    calls,
                );
            }
            Ok(Ok(raw)) => {
                let next = state.after_success();
                debug!(unit = %unit.id, attempt = index, from = ?state, to = ?next, "capability answered");
                let parsed = parse_response(&raw, &unit.criteria);
                let attempt = Attempt::from_response(index, raw, parsed, calls);
                if let Some(e) = attempt.error() {
                    warn!(unit = %unit.id, attempt = index, "malformed response: {}", e.detail);
                }
                return attempt;
            }
            Ok(Err(CapabilityError::Timeout)) => {
                debug!(unit = %unit.id, attempt = index, from = ?state, to = ?AttemptState::Failed, "capability timed out");
                return Attempt::failed(
                    index,
                    AttemptErrorKind::Timeout,
                    CapabilityError::Timeout.to_string(),
                    calls,
                );
            }
            Ok(Err(err)) => err,
        };

        let next = state.after_error(err.is_transient(), config.retry_budget);
        debug!(unit = %unit.id, attempt = index, from = ?state, to = ?next, "capability failed: {err}");
        state = next;

        let AttemptState::Retrying(retry) = state else {
            warn!(unit = %unit.id, attempt = index, calls, "attempt failed: {err}");
            return Attempt::failed(index, AttemptErrorKind::CapabilityError, err.to_string(), calls);
        };

        if ctx.cancel.is_cancelled() {
            return retry_skipped(index, &err, calls);
        }

        let delay = config.backoff_delay(retry, err.retry_after());
        warn!(
            unit = %unit.id,
            attempt = index,
            retry,
            budget = config.retry_budget,
            delay_ms = delay.as_millis() as u64,
            "transient capability error, retrying: {err}"
        );
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!(unit = %unit.id, attempt = index, retry, "cancelled during backoff");
                return retry_skipped(index, &err, calls);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// A retry that was due but never issued because the session was cancelled.
fn retry_skipped(index: u32, err: &CapabilityError, calls: u32) -> Attempt {
    Attempt::failed(
        index,
        AttemptErrorKind::CapabilityError,
        format!("{err} (retry skipped after cancellation)"),
        calls,
    )
}

fn audit(sink: &dyn AuditSink, unit_id: &str, attempt: &Attempt) {
    if let Err(e) = sink.record(&AuditRecord::new(unit_id, attempt.clone())) {
        error!(unit = %unit_id, attempt = attempt.index(), "failed to record audit entry: {e}");
    }
}
