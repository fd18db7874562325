//! One grading run: batch in, results file out.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use consensus::{
    AuditSink, CancellationToken, ConsensusEngine, ConsensusResult, ConsistencyReport,
    ConsistencyReporter, GradingCapability, GradingRequest,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::GraderConfig;
use crate::input::GradingBatch;
use crate::prompts::{GradingPromptBuilder, PROMPT_VERSION};

/// Saved output of a grading run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub model: String,
    pub prompt_version: String,
    pub attempt_count: usize,
    pub cancelled: bool,
    pub results: Vec<ConsensusResult>,
}

impl GradingRun {
    pub fn report(&self) -> ConsistencyReport {
        ConsistencyReporter::summarize(&self.results)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize results")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read results {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid results file {}", path.display()))
    }
}

/// Grade every unit in `batch`.
pub async fn grade(
    config: &GraderConfig,
    batch: GradingBatch,
    capability: Arc<dyn GradingCapability>,
    audit: Option<Arc<dyn AuditSink>>,
    cancel: &CancellationToken,
) -> Result<GradingRun> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    let mut builder = ConsensusEngine::builder()
        .config(config.engine.clone())
        .shared_capability(capability);
    if let Some(sink) = audit {
        builder = builder.audit_sink(sink);
    }
    let engine = builder.build().context("Invalid engine configuration")?;

    let requests: Vec<GradingRequest> = batch
        .units
        .into_iter()
        .map(|unit| {
            let mut prompt = GradingPromptBuilder::new(&unit);
            if let Some(ctx) = &batch.context {
                prompt = prompt.with_context(ctx.clone());
            }
            let prompt = prompt.build();
            GradingRequest::new(unit, prompt)
        })
        .collect();

    info!(
        %run_id,
        units = requests.len(),
        attempts = config.engine.attempt_count,
        model = %config.provider.resolved_model(),
        "grading run started"
    );

    let outcomes = engine.grade_batch(requests, cancel).await;
    let results: Vec<ConsensusResult> = outcomes.into_iter().map(|o| o.result).collect();

    let run = GradingRun {
        run_id,
        started_at,
        finished_at: Utc::now(),
        model: config.provider.resolved_model().to_string(),
        prompt_version: PROMPT_VERSION.to_string(),
        attempt_count: config.engine.attempt_count,
        cancelled: cancel.is_cancelled(),
        results,
    };
    let flagged = run.results.iter().filter(|r| r.flagged()).count();
    info!(%run_id, units = run.results.len(), flagged, cancelled = run.cancelled, "grading run finished");
    Ok(run)
}
