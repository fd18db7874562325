//! Response parser — untrusted model text into a strict grade.
//!
//! A response has two independent parts:
//!
//! ```text
//! Analysis: ...                      ┐
//! Criterion Evaluation: ...          │ six labeled reasoning segments
//! Technical Assessment: ...          │ (missing/out of order → quality
//! Conceptual Understanding: ...      │  downgrade, never invalidation)
//! Final Scoring: ...                 │
//! Feedback: ...                      ┘
//! ```json
//! {"scores": {...}, "confidence": 0.8, "feedback": "...", "suggestions": [...]}
//! ```                                  ← score block (all-or-nothing)
//! ```
//!
//! The score block decides validity on its own. Every expected criterion must
//! carry a finite number within `[0, max]`; one bad entry invalidates the
//! whole attempt rather than granting partial credit.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::types::{Criterion, CriterionScore, ReasoningQuality, ReasoningStep, ReasoningStepKind};

/// Confidence assumed when the model does not report one.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Segment label at line start. Tolerates markdown headings, bold markers,
/// `Step N:` and `N.` prefixes, and `_`/`-` between words.
static SEGMENT_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?mi)^[ \t]*(?:#{1,6}[ \t]*)?(?:\*\*)?(?:step[ \t]*\d+[ \t]*[:.)\-][ \t]*|\d+[.)][ \t]*)?(analysis|criterion[ \t_-]+evaluation|technical[ \t_-]+assessment|conceptual[ \t_-]+understanding|final[ \t_-]+scoring|feedback)(?:\*\*)?[ \t]*(?::(?:\*\*)?|$)",
    )
    .expect("segment label regex should compile")
});

/// A fully validated score block.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedGrade {
    /// Scores in rubric order.
    pub scores: Vec<CriterionScore>,
    /// Sum of `scores`; any total the model reported is ignored.
    pub total: f64,
    pub confidence: f64,
    pub confidence_reported: bool,
    pub feedback: String,
    pub suggestions: Vec<String>,
}

/// Score-block verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Valid(ParsedGrade),
    /// Why the block was rejected.
    Invalid(String),
}

impl ParseOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Everything extracted from one raw response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    /// Recognised segments in the order they appear (first occurrence per kind).
    pub reasoning: Vec<ReasoningStep>,
    pub quality: ReasoningQuality,
    pub outcome: ParseOutcome,
}

/// Parse one raw response against the unit's criteria.
pub fn parse_response(raw: &str, criteria: &[Criterion]) -> ParsedResponse {
    let block = find_score_block(raw);
    let reasoning = extract_reasoning(raw, block.as_ref().map(|(start, _)| *start));
    let quality = classify_reasoning(&reasoning);

    let outcome = match block {
        Some((_, value)) => match validate_block(&value, criteria, &reasoning) {
            Ok(grade) => ParseOutcome::Valid(grade),
            Err(reason) => ParseOutcome::Invalid(reason),
        },
        None => ParseOutcome::Invalid("no JSON score block with a `scores` object".to_string()),
    };

    ParsedResponse {
        reasoning,
        quality,
        outcome,
    }
}

// ── Score block ──────────────────────────────────────────────────────────────

/// Locate the last top-level JSON object that carries a `scores` key.
///
/// Every `{` is tried as a start position so stray braces in the reasoning
/// text (student code, set notation) do not hide the real block. A parsed
/// object is skipped over whole, so its nested objects are never candidates.
/// When the model drafts a block and then restates it, the restated one wins.
fn find_score_block(raw: &str) -> Option<(usize, Value)> {
    let mut found = None;
    let mut resume = 0;
    for (start, _) in raw.match_indices('{') {
        if start < resume {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            resume = start + stream.byte_offset();
            if value.get("scores").is_some() {
                found = Some((start, value));
            }
        }
    }
    found
}

fn validate_block(
    block: &Value,
    criteria: &[Criterion],
    reasoning: &[ReasoningStep],
) -> Result<ParsedGrade, String> {
    let scores_obj = block
        .get("scores")
        .and_then(Value::as_object)
        .ok_or_else(|| "`scores` is not an object".to_string())?;

    let mut scores = Vec::with_capacity(criteria.len());
    for criterion in criteria {
        let value = lookup_score(scores_obj, &criterion.name)
            .ok_or_else(|| format!("missing score for criterion `{}`", criterion.name))?;
        let score = value
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("non-numeric score for `{}`: {}", criterion.name, value))?;
        if score < 0.0 || score > criterion.max_points {
            return Err(format!(
                "score {} for `{}` outside [0, {}]",
                score, criterion.name, criterion.max_points
            ));
        }
        scores.push(CriterionScore::new(criterion.name.clone(), score));
    }

    let total = scores.iter().map(|s| s.score).sum();
    let (confidence, confidence_reported) = read_confidence(block.get("confidence"));

    let feedback = block
        .get("feedback")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            reasoning
                .iter()
                .find(|step| step.kind == ReasoningStepKind::Feedback)
                .map(|step| step.text.clone())
        })
        .unwrap_or_default();

    let suggestions = block
        .get("suggestions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(ParsedGrade {
        scores,
        total,
        confidence,
        confidence_reported,
        feedback,
        suggestions,
    })
}

/// Exact key first, then a case- and separator-insensitive match.
fn lookup_score<'a>(scores: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(value) = scores.get(name) {
        return Some(value);
    }
    let wanted = normalize_key(name);
    scores
        .iter()
        .find(|(key, _)| normalize_key(key) == wanted)
        .map(|(_, value)| value)
}

fn normalize_key(key: &str) -> String {
    key.split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Confidence in [0, 1]; values in (1, 100] are read as percentages.
fn read_confidence(value: Option<&Value>) -> (f64, bool) {
    match value.and_then(Value::as_f64) {
        Some(c) if (0.0..=1.0).contains(&c) => (c, true),
        Some(c) if c > 1.0 && c <= 100.0 => (c / 100.0, true),
        _ => (DEFAULT_CONFIDENCE, false),
    }
}

// ── Reasoning segments ───────────────────────────────────────────────────────

fn extract_reasoning(raw: &str, block_start: Option<usize>) -> Vec<ReasoningStep> {
    let limit = block_start.unwrap_or(raw.len());
    let labels: Vec<(usize, usize, ReasoningStepKind)> = SEGMENT_LABEL_RE
        .captures_iter(raw)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let kind = ReasoningStepKind::from_label(caps.get(1)?.as_str())?;
            Some((whole.start(), whole.end(), kind))
        })
        .filter(|(start, _, _)| *start < limit)
        .collect();

    let mut steps: Vec<ReasoningStep> = Vec::new();
    for (i, (_, body_start, kind)) in labels.iter().enumerate() {
        if steps.iter().any(|s| s.kind == *kind) {
            continue;
        }
        let body_end = labels
            .get(i + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(limit)
            .min(limit);
        let text = clean_segment(&raw[*body_start..body_end]);
        steps.push(ReasoningStep { kind: *kind, text });
    }
    steps
}

/// Trim whitespace and a dangling code-fence opener left before the score block.
fn clean_segment(text: &str) -> String {
    text.trim()
        .trim_end_matches("```json")
        .trim_end_matches("```JSON")
        .trim_end_matches("```")
        .trim()
        .to_string()
}

fn classify_reasoning(steps: &[ReasoningStep]) -> ReasoningQuality {
    if steps.is_empty() {
        return ReasoningQuality::Absent;
    }
    let in_order = steps
        .windows(2)
        .all(|pair| pair[0].kind.position() < pair[1].kind.position());
    if steps.len() == ReasoningStepKind::ALL.len() && in_order {
        ReasoningQuality::Complete
    } else {
        ReasoningQuality::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> Vec<Criterion> {
        vec![
            Criterion::new("insight_quality", 15.0, "Depth of insight"),
            Criterion::new("code_quality", 10.0, "Correctness and style"),
        ]
    }

    const FULL_RESPONSE: &str = "\
## Step 1: Analysis
The student trains a decision tree and explains depth.

## Step 2: Criterion Evaluation
Insight is solid; code is mostly correct.

## Step 3: Technical Assessment
Uses sklearn correctly, no data leakage.

## Step 4: Conceptual Understanding
Understands bias/variance at a basic level.

## Step 5: Final Scoring
13/15 and 8/10.

## Step 6: Feedback
Good work overall.

```json
{
  \"scores\": {\"insight_quality\": 13, \"code_quality\": 8},
  \"total_score\": 99,
  \"confidence\": 0.85,
  \"feedback\": \"Clear analysis. Add comments to the code.\",
  \"suggestions\": [\"Comment the training loop\", \"Label plot axes\"]
}
```
";

    fn unwrap_valid(parsed: &ParsedResponse) -> &ParsedGrade {
        match &parsed.outcome {
            ParseOutcome::Valid(grade) => grade,
            ParseOutcome::Invalid(reason) => panic!("expected valid, got: {reason}"),
        }
    }

    #[test]
    fn test_parses_complete_response() {
        let parsed = parse_response(FULL_RESPONSE, &criteria());
        let grade = unwrap_valid(&parsed);

        assert_eq!(grade.scores[0], CriterionScore::new("insight_quality", 13.0));
        assert_eq!(grade.scores[1], CriterionScore::new("code_quality", 8.0));
        assert_eq!(grade.total, 21.0, "reported total_score must be ignored");
        assert_eq!(grade.confidence, 0.85);
        assert!(grade.confidence_reported);
        assert_eq!(grade.suggestions.len(), 2);
        assert_eq!(grade.feedback, "Clear analysis. Add comments to the code.");

        assert_eq!(parsed.quality, ReasoningQuality::Complete);
        assert_eq!(parsed.reasoning.len(), 6);
        assert_eq!(parsed.reasoning[0].kind, ReasoningStepKind::Analysis);
        assert!(parsed.reasoning[0].text.starts_with("The student trains"));
        assert_eq!(parsed.reasoning[5].text, "Good work overall.");
    }

    #[test]
    fn test_out_of_range_score_invalidates_attempt() {
        let raw = r#"{"scores": {"insight_quality": 20, "code_quality": 8}}"#;
        let parsed = parse_response(raw, &criteria());
        match parsed.outcome {
            ParseOutcome::Invalid(reason) => {
                assert!(reason.contains("insight_quality"), "{reason}");
                assert!(reason.contains("outside [0, 15]"), "{reason}");
            }
            ParseOutcome::Valid(_) => panic!("score above max must not be clamped"),
        }
    }

    #[test]
    fn test_negative_score_invalidates_attempt() {
        let raw = r#"{"scores": {"insight_quality": -1, "code_quality": 8}}"#;
        assert!(!parse_response(raw, &criteria()).outcome.is_valid());
    }

    #[test]
    fn test_missing_criterion_invalidates_attempt() {
        let raw = r#"{"scores": {"insight_quality": 12}}"#;
        match parse_response(raw, &criteria()).outcome {
            ParseOutcome::Invalid(reason) => {
                assert_eq!(reason, "missing score for criterion `code_quality`")
            }
            ParseOutcome::Valid(_) => panic!("partial credit must not be granted"),
        }
    }

    #[test]
    fn test_non_numeric_score_invalidates_attempt() {
        let raw = r#"{"scores": {"insight_quality": "twelve", "code_quality": 8}}"#;
        assert!(!parse_response(raw, &criteria()).outcome.is_valid());

        let raw = r#"{"scores": {"insight_quality": "12", "code_quality": 8}}"#;
        assert!(!parse_response(raw, &criteria()).outcome.is_valid());
    }

    #[test]
    fn test_missing_block_is_invalid() {
        let parsed = parse_response("Analysis: looks fine. I give it 20 points.", &criteria());
        assert!(!parsed.outcome.is_valid());
        assert_eq!(parsed.quality, ReasoningQuality::Partial);
    }

    #[test]
    fn test_confidence_defaults_to_neutral() {
        let raw = r#"{"scores": {"insight_quality": 10, "code_quality": 5}}"#;
        let parsed = parse_response(raw, &criteria());
        let grade = unwrap_valid(&parsed);
        assert_eq!(grade.confidence, DEFAULT_CONFIDENCE);
        assert!(!grade.confidence_reported);

        let raw = r#"{"scores": {"insight_quality": 10, "code_quality": 5}, "confidence": "high"}"#;
        let parsed = parse_response(raw, &criteria());
        assert_eq!(unwrap_valid(&parsed).confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_percentage_confidence_is_scaled() {
        let raw = r#"{"scores": {"insight_quality": 10, "code_quality": 5}, "confidence": 80}"#;
        let parsed = parse_response(raw, &criteria());
        assert!((unwrap_valid(&parsed).confidence - 0.8).abs() < 1e-12);

        let raw = r#"{"scores": {"insight_quality": 10, "code_quality": 5}, "confidence": 250}"#;
        let parsed = parse_response(raw, &criteria());
        assert_eq!(unwrap_valid(&parsed).confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_criterion_names_match_loosely() {
        let raw = r#"{"scores": {"Insight Quality": 10, "code-quality": 5}}"#;
        let parsed = parse_response(raw, &criteria());
        let grade = unwrap_valid(&parsed);
        assert_eq!(grade.scores[0].criterion, "insight_quality");
        assert_eq!(grade.total, 15.0);
    }

    #[test]
    fn test_stray_braces_before_block_are_skipped() {
        let raw = "Analysis: the student wrote `d = {1: 2}` which is fine.\n\
                   {\"scores\": {\"insight_quality\": 9, \"code_quality\": 9}, \"confidence\": 0.9}";
        let parsed = parse_response(raw, &criteria());
        assert_eq!(unwrap_valid(&parsed).total, 18.0);
    }

    #[test]
    fn test_final_block_wins_over_draft() {
        let raw = "\
## Step 5: Final Scoring
Draft: {\"scores\": {\"insight_quality\": 15, \"code_quality\": 10}}
On reflection the code has a bug.

## Step 6: Feedback
Fix the off-by-one.

```json
{\"scores\": {\"insight_quality\": 12, \"code_quality\": 6}, \"confidence\": 0.7}
```
";
        let parsed = parse_response(raw, &criteria());
        let grade = unwrap_valid(&parsed);
        assert_eq!(grade.total, 18.0);
        assert_eq!(grade.confidence, 0.7);
        assert_eq!(parsed.reasoning.len(), 2);
    }

    #[test]
    fn test_nested_scores_key_is_not_a_separate_block() {
        let criteria = vec![Criterion::new("scores", 10.0, "")];
        let raw = r#"{"scores": {"scores": 4}}"#;
        let parsed = parse_response(raw, &criteria);
        assert_eq!(unwrap_valid(&parsed).total, 4.0);
    }

    #[test]
    fn test_reasoning_out_of_order_is_partial_but_valid() {
        let raw = "Feedback: nice\nAnalysis: ok\n{\"scores\": {\"insight_quality\": 1, \"code_quality\": 1}}";
        let parsed = parse_response(raw, &criteria());
        assert!(parsed.outcome.is_valid());
        assert_eq!(parsed.quality, ReasoningQuality::Partial);
        assert_eq!(parsed.reasoning[0].kind, ReasoningStepKind::Feedback);
    }

    #[test]
    fn test_no_reasoning_is_absent_but_valid() {
        let raw = r#"{"scores": {"insight_quality": 1, "code_quality": 1}}"#;
        let parsed = parse_response(raw, &criteria());
        assert!(parsed.outcome.is_valid());
        assert_eq!(parsed.quality, ReasoningQuality::Absent);
    }

    #[test]
    fn test_feedback_falls_back_to_segment() {
        let raw = "Feedback: Try vectorising the loop.\n{\"scores\": {\"insight_quality\": 1, \"code_quality\": 1}}";
        let parsed = parse_response(raw, &criteria());
        assert_eq!(unwrap_valid(&parsed).feedback, "Try vectorising the loop.");
    }

    #[test]
    fn test_sentence_starting_with_label_word_is_not_a_segment() {
        let raw = "Analysis of the code shows good structure.\n{\"scores\": {\"insight_quality\": 1, \"code_quality\": 1}}";
        let parsed = parse_response(raw, &criteria());
        assert_eq!(parsed.quality, ReasoningQuality::Absent);
    }
}
