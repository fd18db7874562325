//! Grading prompt construction.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever the instructions change,
//! so audit records can be traced back to the prompt that produced them.

use std::fmt::Write;

use consensus::{GradableUnit, ReasoningStepKind};

/// Prompt version. Bump on any instruction change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// System message sent ahead of every grading prompt.
pub const GRADER_PREAMBLE: &str = "\
You are an expert instructor grading student homework. You grade strictly \
against the rubric, award partial credit only where the rubric allows it, \
and never invent criteria that are not listed.";

/// What each reasoning step asks the model to do.
fn step_instruction(kind: ReasoningStepKind) -> &'static str {
    match kind {
        ReasoningStepKind::Analysis => {
            "Summarise what the student did and what the problem asks for."
        }
        ReasoningStepKind::CriterionEvaluation => {
            "Go through each criterion and note the evidence for and against."
        }
        ReasoningStepKind::TechnicalAssessment => {
            "Assess code correctness, style, outputs and any execution errors."
        }
        ReasoningStepKind::ConceptualUnderstanding => {
            "Judge the explanations and the reasoning behind them."
        }
        ReasoningStepKind::FinalScoring => {
            "Decide the points for each criterion, between 0 and its maximum."
        }
        ReasoningStepKind::Feedback => {
            "Write constructive feedback the student can act on."
        }
    }
}

/// Builder for grading prompts.
pub struct GradingPromptBuilder<'a> {
    unit: &'a GradableUnit,
    context: Option<String>,
}

impl<'a> GradingPromptBuilder<'a> {
    pub fn new(unit: &'a GradableUnit) -> Self {
        Self {
            unit,
            context: None,
        }
    }

    /// Assignment-level context shown before the problem.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn build(&self) -> String {
        let unit = self.unit;
        let mut prompt = String::new();

        if let Some(ctx) = &self.context {
            let _ = write!(prompt, "ASSIGNMENT CONTEXT:\n{ctx}\n\n");
        }

        let _ = write!(prompt, "PROBLEM STATEMENT:\n{}\n\n", unit.problem.trim());
        let _ = write!(
            prompt,
            "TOTAL POINTS POSSIBLE: {}\n\n",
            format_points(unit.max_possible())
        );

        prompt.push_str("GRADING CRITERIA:\n");
        for criterion in &unit.criteria {
            let _ = write!(
                prompt,
                "- {} ({} points)",
                criterion.name,
                format_points(criterion.max_points)
            );
            if !criterion.description.is_empty() {
                let _ = write!(prompt, ": {}", criterion.description);
            }
            prompt.push('\n');
            if let Some(guidelines) = &criterion.guidelines {
                let _ = writeln!(prompt, "  Guidelines: {guidelines}");
            }
        }

        let _ = write!(
            prompt,
            "\nSTUDENT RESPONSE:\n{}\n\n",
            unit.response.trim()
        );

        prompt.push_str("REASONING:\nWork through these steps in order, each under its own heading:\n\n");
        for (i, kind) in ReasoningStepKind::ALL.into_iter().enumerate() {
            let _ = writeln!(
                prompt,
                "## Step {}: {}\n{}\n",
                i + 1,
                kind.label(),
                step_instruction(kind)
            );
        }

        prompt.push_str(&score_block_schema(unit));
        prompt
    }
}

/// JSON schema the model must end its answer with.
fn score_block_schema(unit: &GradableUnit) -> String {
    let scores = unit
        .criteria
        .iter()
        .map(|c| format!("\"{}\": <0-{}>", c.name, format_points(c.max_points)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "RESPONSE FORMAT:\n\
         After the six steps, output one JSON object in a ```json fenced block:\n\n\
         ```json\n\
         {{\n  \
           \"scores\": {{{scores}}},\n  \
           \"confidence\": <0.0-1.0>,\n  \
           \"feedback\": \"<feedback for the student>\",\n  \
           \"suggestions\": [\"<specific improvement>\", ...]\n\
         }}\n\
         ```\n\n\
         Every criterion must have a numeric score. Do not add criteria.\n"
    )
}

/// `10` rather than `10.0`, but keep fractional points.
fn format_points(points: f64) -> String {
    if points.fract() == 0.0 {
        format!("{points:.0}")
    } else {
        format!("{points}")
    }
}

/// Prompt for `unit` with no extra context.
pub fn grading_prompt(unit: &GradableUnit) -> String {
    GradingPromptBuilder::new(unit).build()
}
