use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A single old-text to new-text substitution proposed for one file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOperation {
    #[serde(default)]
    pub old_string: String,
    #[serde(default)]
    pub new_string: String,
    #[serde(default)]
    pub replace_all: bool,
}

impl EditOperation {
    pub fn new(old_string: impl Into<String>, new_string: impl Into<String>) -> Self {
        Self {
            old_string: old_string.into(),
            new_string: new_string.into(),
            replace_all: false,
        }
    }

    pub fn replacing_all(old_string: impl Into<String>, new_string: impl Into<String>) -> Self {
        Self {
            replace_all: true,
            ..Self::new(old_string, new_string)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("edit #{index}: target text not found (exact or whitespace-normalized)")]
    MatchNotFound { index: usize },
}

/// What happened to one edit during a forward or reverse pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Exact { offset: usize },
    ReplacedAll { occurrences: usize },
    Fuzzy { start: usize, end: usize },
    Skipped(EditError),
}

impl EditOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, EditOutcome::Skipped(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            EditOutcome::Exact { .. } => "exact",
            EditOutcome::ReplacedAll { .. } => "replaced-all",
            EditOutcome::Fuzzy { .. } => "fuzzy",
            EditOutcome::Skipped(_) => "skipped",
        }
    }
}

/// Resulting content plus one outcome per edit, in edit-list order.
#[derive(Debug, Clone)]
pub struct TransformReport {
    pub content: String,
    pub outcomes: Vec<EditOutcome>,
}

impl TransformReport {
    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_skipped()).count()
    }

    pub fn applied(&self) -> usize {
        self.outcomes.len() - self.skipped()
    }
}

/// Loads an edit list from disk. `.json` files are parsed as JSON, anything else as YAML.
pub fn load_edits(path: &Path) -> Result<Vec<EditOperation>> {
    let data = fs::read(path).with_context(|| format!("reading edits {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let edits = if is_json {
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing JSON edits {}", path.display()))?
    } else {
        serde_yaml::from_slice(&data)
            .with_context(|| format!("parsing YAML edits {}", path.display()))?
    };
    Ok(edits)
}
