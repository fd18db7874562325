//! Batch grading driver around the `consensus` engine.
//!
//! Loads units from JSON/YAML, builds grading prompts, talks to a model
//! provider and saves consensus results.

pub mod config;
pub mod input;
pub mod prompts;
pub mod provider;
pub mod run;

pub use config::{GraderConfig, ProviderConfig, ProviderKind};
pub use input::{load_batch, GradingBatch, InputError};
pub use prompts::{grading_prompt, GradingPromptBuilder, PROMPT_VERSION};
pub use provider::{
    build_capability, AnthropicCapability, MockCapability, OpenAiCapability, ProviderError,
};
pub use run::{grade, GradingRun};
