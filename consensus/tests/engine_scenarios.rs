//! End-to-end grading through the public engine API.
//!
//! All model traffic goes through deterministic in-process capabilities.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use consensus::{
    AttemptErrorKind, CancelPolicy, CancellationToken, CapabilityError, ConsensusEngine,
    ConsistencyReporter, Criterion, EngineConfig, FlagReason, GradableUnit, GradingCapability,
    GradingRequest, JsonlAuditSink, ReasoningQuality, ScriptedCapability, ScriptedReply,
    FAILED_GRADING_FEEDBACK,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn unit(id: &str) -> GradableUnit {
    GradableUnit::new(
        id,
        "Train a classifier and discuss overfitting.",
        "I used a random forest with max_depth=5...",
        vec![
            Criterion::new("insight", 15.0, "Depth of insight"),
            Criterion::new("code", 10.0, "Code quality"),
        ],
    )
}

/// A well-formed six-step response.
fn response(insight: f64, code: f64, confidence: f64) -> String {
    format!(
        "## Step 1: Analysis\nThe student fits a forest.\n\n\
         ## Step 2: Criterion Evaluation\nInsight is reasonable.\n\n\
         ## Step 3: Technical Assessment\nNo leakage.\n\n\
         ## Step 4: Conceptual Understanding\nBasic bias/variance.\n\n\
         ## Step 5: Final Scoring\n{insight} and {code}.\n\n\
         ## Step 6: Feedback\nGood effort.\n\n\
         ```json\n{{\"scores\": {{\"insight\": {insight}, \"code\": {code}}}, \
         \"confidence\": {confidence}, \"feedback\": \"Good effort. Comment your code.\", \
         \"suggestions\": [\"Comment the training loop\", \"Plot the learning curve\"]}}\n```\n"
    )
}

fn engine(config: EngineConfig, replies: Vec<ScriptedReply>) -> ConsensusEngine {
    ConsensusEngine::builder()
        .config(config)
        .capability(ScriptedCapability::new(replies))
        .build()
        .unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_median_consensus_with_agreeing_attempts() {
    let replies = [13.0, 14.0, 12.0, 13.0, 15.0]
        .into_iter()
        .map(|s| ScriptedReply::text(response(s, 8.0, 0.85)))
        .collect();
    let engine = engine(EngineConfig::with_attempts(5), replies);

    let outcome = engine.grade_unit(&unit("a"), "grade").await.unwrap();
    let result = &outcome.result;

    assert_eq!(result.score_for("insight"), Some(13.0));
    assert_eq!(result.score_for("code"), Some(8.0));
    assert_eq!(result.total_score(), 21.0);
    assert_eq!(result.valid_attempts(), 5);
    assert!(result.confidence() >= 0.7);
    assert!(!result.flagged(), "unexpected flag {:?}", result.flag_reason());
    assert_eq!(
        result.suggestions(),
        ["Comment the training loop", "Plot the learning curve"]
    );
    assert_eq!(result.feedback(), "Good effort. Comment your code.");
    assert!(outcome
        .attempts
        .iter()
        .all(|a| a.reasoning_quality() == ReasoningQuality::Complete));
}

#[tokio::test]
async fn test_timeouts_below_quorum_force_review() {
    let mut replies = vec![
        ScriptedReply::Fail(CapabilityError::Timeout),
        ScriptedReply::Fail(CapabilityError::Timeout),
    ];
    replies.extend((0..3).map(|_| ScriptedReply::text(response(14.0, 9.0, 1.0))));
    let engine = engine(EngineConfig::with_attempts(5).with_quorum(4), replies);

    let outcome = engine.grade_unit(&unit("b"), "grade").await.unwrap();

    let timeouts = outcome
        .attempts
        .iter()
        .filter(|a| a.error_kind() == Some(AttemptErrorKind::Timeout))
        .count();
    assert_eq!(timeouts, 2);
    assert_eq!(outcome.result.valid_attempts(), 3);
    assert_eq!(outcome.result.score_std_dev(), 0.0);
    assert!(outcome.result.flagged());
    assert_eq!(outcome.result.flag_reason(), Some(FlagReason::InsufficientQuorum));
}

#[tokio::test]
async fn test_out_of_range_attempt_is_excluded_not_clamped() {
    let replies = vec![
        ScriptedReply::text(response(20.0, 8.0, 0.9)),
        ScriptedReply::text(response(12.0, 8.0, 0.9)),
        ScriptedReply::text(response(12.0, 8.0, 0.9)),
        ScriptedReply::text(response(13.0, 8.0, 0.9)),
        ScriptedReply::text(response(14.0, 8.0, 0.9)),
    ];
    let engine = engine(EngineConfig::with_attempts(5), replies);

    let outcome = engine.grade_unit(&unit("c"), "grade").await.unwrap();

    let malformed: Vec<_> = outcome
        .attempts
        .iter()
        .filter(|a| a.error_kind() == Some(AttemptErrorKind::MalformedScore))
        .collect();
    assert_eq!(malformed.len(), 1);
    assert!(malformed[0].raw_response().contains("\"insight\": 20"));
    assert_eq!(outcome.result.valid_attempts(), 4);
    // median of 12, 12, 13, 14; a clamped 15 would have pulled it to 13
    assert_eq!(outcome.result.score_for("insight"), Some(12.5));
}

#[tokio::test]
async fn test_total_failure_still_produces_result() {
    let replies = vec![ScriptedReply::Fail(CapabilityError::Rejected(
        "invalid api key".into(),
    ))];
    let engine = engine(EngineConfig::with_attempts(5), replies);

    let outcome = engine.grade_unit(&unit("d"), "grade").await.unwrap();
    let result = &outcome.result;

    assert_eq!(outcome.attempts.len(), 5);
    assert_eq!(result.total_score(), 0.0);
    assert_eq!(result.percentage(), 0.0);
    assert_eq!(result.feedback(), FAILED_GRADING_FEEDBACK);
    assert!(result.flagged());
    assert_eq!(result.flag_reason(), Some(FlagReason::InsufficientQuorum));
    assert_eq!(result.confidence(), 0.0);
}

// ── Audit trail ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_every_attempt_reaches_jsonl_audit() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(JsonlAuditSink::new(dir.path().join("audit.jsonl")));
    let engine = ConsensusEngine::builder()
        .config(EngineConfig::with_attempts(3))
        .capability(ScriptedCapability::new([
            ScriptedReply::text("no score block here"),
            ScriptedReply::text(response(10.0, 7.0, 0.8)),
            ScriptedReply::text(response(11.0, 7.0, 0.8)),
        ]))
        .audit_sink(sink.clone())
        .build()
        .unwrap();

    engine.grade_unit(&unit("audited"), "grade").await.unwrap();

    let mut records = sink.read_all().unwrap();
    records.sort_by_key(|r| r.attempt_index);
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.unit_id == "audited"));
    assert_eq!(
        records.iter().map(|r| r.attempt_index).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    let invalid = records.iter().filter(|r| !r.attempt.is_valid()).count();
    assert_eq!(invalid, 1);
}

// ── Batches ──────────────────────────────────────────────────────────────────

/// Scores each unit by its id and tracks peak concurrency.
#[derive(Default)]
struct KeyedCapability {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl GradingCapability for KeyedCapability {
    async fn evaluate(
        &self,
        _prompt: &str,
        unit: &GradableUnit,
        _temperature: f32,
    ) -> Result<String, CapabilityError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let n: u64 = unit.id.trim_start_matches('u').parse().unwrap_or(0);
        // Later units finish first.
        tokio::time::sleep(Duration::from_millis(1000 - n * 100)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(response(n as f64, 5.0, 0.9))
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_keeps_input_order_under_concurrency_bound() {
    let capability = Arc::new(KeyedCapability::default());
    let config = EngineConfig {
        max_concurrent_units: 2,
        ..EngineConfig::with_attempts(1)
    };
    let engine = ConsensusEngine::builder()
        .config(config)
        .shared_capability(capability.clone())
        .build()
        .unwrap();

    let requests: Vec<GradingRequest> = (1..=6)
        .map(|i| GradingRequest::new(unit(&format!("u{i}")), "grade"))
        .collect();
    let outcomes = engine
        .grade_batch(requests, &CancellationToken::new())
        .await;

    let ids: Vec<&str> = outcomes.iter().map(|o| o.result.unit_id()).collect();
    assert_eq!(ids, vec!["u1", "u2", "u3", "u4", "u5", "u6"]);
    assert_eq!(outcomes[3].result.score_for("insight"), Some(4.0));
    assert!(capability.peak.load(Ordering::SeqCst) <= 2);

    let report = ConsistencyReporter::summarize(
        &outcomes.iter().map(|o| o.result.clone()).collect::<Vec<_>>(),
    );
    assert_eq!(report.unit_count, 6);
    assert_eq!(report.attempt_success_rate, 1.0);
}

#[tokio::test]
async fn test_cancelled_batch_still_returns_every_unit() {
    let capability = Arc::new(ScriptedCapability::always(response(10.0, 5.0, 0.9)));
    let engine = ConsensusEngine::builder()
        .config(EngineConfig::with_attempts(3))
        .shared_capability(capability.clone())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let requests = vec![
        GradingRequest::new(unit("x"), "grade"),
        GradingRequest::new(unit("y"), "grade"),
    ];
    let outcomes = engine.grade_batch(requests, &cancel).await;

    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert!(outcome
            .attempts
            .iter()
            .all(|a| a.error_kind() == Some(AttemptErrorKind::Cancelled)));
        assert_eq!(outcome.result.flag_reason(), Some(FlagReason::InsufficientQuorum));
    }
    assert_eq!(capability.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abort_keeps_completed_attempts() {
    let capability = ScriptedCapability::new([
        ScriptedReply::text(response(9.0, 6.0, 0.9)),
        ScriptedReply::Delayed(Duration::from_secs(30), response(9.0, 6.0, 0.9)),
    ]);
    let config = EngineConfig {
        cancel_policy: CancelPolicy::Abort,
        ..EngineConfig::with_attempts(3)
    };
    let engine = ConsensusEngine::builder()
        .config(config)
        .capability(capability)
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let outcome = engine
        .grade_unit_with_cancel(&unit("abort"), "grade", &cancel)
        .await
        .unwrap();

    let valid = outcome.attempts.iter().filter(|a| a.is_valid()).count();
    let cancelled = outcome
        .attempts
        .iter()
        .filter(|a| a.error_kind() == Some(AttemptErrorKind::Cancelled))
        .count();
    assert_eq!((valid, cancelled), (1, 2));
    assert_eq!(outcome.result.score_for("insight"), Some(9.0));
    assert_eq!(outcome.result.flag_reason(), Some(FlagReason::InsufficientQuorum));
}
