//! The grading capability boundary.
//!
//! The engine only needs "send this prompt, get text back". Transport,
//! authentication and provider selection live behind [`GradingCapability`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::GradableUnit;

/// Failure modes a capability may report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// The provider itself gave up waiting.
    #[error("capability timed out")]
    Timeout,

    /// Provider rate limit; `retry_after` is the provider's hint, if any.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Network or provider-side failure that may succeed on retry.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The provider refused the request; retrying the same call will not help.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl CapabilityError {
    /// Whether the executor may retry the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transport(_))
    }

    /// Minimum wait requested by the provider.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A language model that can grade a unit.
///
/// Implementations must not share per-call state between invocations: every
/// call is an independent sample.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GradingCapability: Send + Sync {
    /// Evaluate `prompt` for `unit` and return the model's raw text.
    async fn evaluate(
        &self,
        prompt: &str,
        unit: &GradableUnit,
        temperature: f32,
    ) -> Result<String, CapabilityError>;
}

/// One canned behaviour for [`ScriptedCapability`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this text immediately.
    Text(String),
    /// Return this text after a delay.
    Delayed(Duration, String),
    /// Fail with this error.
    Fail(CapabilityError),
    /// Never answer; exercises the executor's timeout.
    Hang,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

/// Deterministic capability that replays a script, one reply per call.
///
/// Once the script is exhausted the last reply repeats. Attempts run
/// concurrently, so which attempt index receives which reply is not fixed;
/// the multiset of replies is.
#[derive(Debug)]
pub struct ScriptedCapability {
    script: Mutex<VecDeque<ScriptedReply>>,
    last: Mutex<Option<ScriptedReply>>,
    calls: AtomicU32,
}

impl ScriptedCapability {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            last: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    /// Capability that always returns `text`.
    pub fn always(text: impl Into<String>) -> Self {
        Self::new([ScriptedReply::Text(text.into())])
    }

    /// Total calls received so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        let popped = match self.script.lock() {
            Ok(mut script) => script.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match popped {
            Some(reply) => {
                *last = Some(reply.clone());
                Some(reply)
            }
            None => last.clone(),
        }
    }
}

#[async_trait]
impl GradingCapability for ScriptedCapability {
    async fn evaluate(
        &self,
        _prompt: &str,
        _unit: &GradableUnit,
        _temperature: f32,
    ) -> Result<String, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_reply() {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            Some(ScriptedReply::Fail(err)) => Err(err),
            Some(ScriptedReply::Hang) => {
                std::future::pending::<()>().await;
                Err(CapabilityError::Timeout)
            }
            None => Err(CapabilityError::Rejected("script is empty".to_string())),
        }
    }
}
