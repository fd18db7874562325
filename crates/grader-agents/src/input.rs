//! Batch input files.
//!
//! A batch is either a bare list of units or an object with an optional
//! assignment `context` and a `units` list, in JSON or YAML:
//!
//! ```yaml
//! context: "Homework 3: model selection"
//! units:
//!   - id: hw3-q1
//!     problem: "..."
//!     response: "..."
//!     criteria:
//!       - { name: insight, max_points: 15, description: "Depth of insight" }
//! ```

use std::path::Path;

use consensus::GradableUnit;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("unsupported input extension for {0} (expected .json, .yaml or .yml)")]
    UnsupportedFormat(String),

    #[error("duplicate unit id `{0}`")]
    DuplicateId(String),
}

/// Units to grade plus optional shared context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradingBatch {
    pub context: Option<String>,
    pub units: Vec<GradableUnit>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Units(Vec<GradableUnit>),
    Batch {
        #[serde(default)]
        context: Option<String>,
        units: Vec<GradableUnit>,
    },
}

impl From<BatchFile> for GradingBatch {
    fn from(file: BatchFile) -> Self {
        match file {
            BatchFile::Units(units) => Self {
                context: None,
                units,
            },
            BatchFile::Batch { context, units } => Self { context, units },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Json,
    Yaml,
}

impl InputFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("json") => Some(Self::Json),
            Some("yaml" | "yml") => Some(Self::Yaml),
            _ => None,
        }
    }
}

/// Load a batch, picking the format from the file extension.
pub fn load_batch(path: &Path) -> Result<GradingBatch, InputError> {
    let display = path.display().to_string();
    let format =
        InputFormat::from_path(path).ok_or_else(|| InputError::UnsupportedFormat(display.clone()))?;
    let text = std::fs::read_to_string(path).map_err(|source| InputError::Read {
        path: display.clone(),
        source,
    })?;
    parse_batch(&text, format, &display)
}

pub fn parse_batch(text: &str, format: InputFormat, origin: &str) -> Result<GradingBatch, InputError> {
    let file: BatchFile = match format {
        InputFormat::Json => serde_json::from_str(text).map_err(|source| InputError::Json {
            path: origin.to_string(),
            source,
        })?,
        InputFormat::Yaml => serde_yaml::from_str(text).map_err(|source| InputError::Yaml {
            path: origin.to_string(),
            source,
        })?,
    };
    let batch = GradingBatch::from(file);

    let mut seen = std::collections::HashSet::new();
    for unit in &batch.units {
        if !seen.insert(unit.id.as_str()) {
            return Err(InputError::DuplicateId(unit.id.clone()));
        }
    }
    Ok(batch)
}
