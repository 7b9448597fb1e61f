use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing_subscriber::EnvFilter;

use crate::diff::DiffStats;

pub const LOG_ENV: &str = "EDITREVIEW_LOG";
const JOURNAL_FILE: &str = "review_log.jsonl";

/// Installs the stderr subscriber; stdout is reserved for command output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: String,
    pub path: String,
    pub action: String,
    pub additions: usize,
    pub deletions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JournalEntry {
    pub fn now(path: &str, action: &str, stats: DiffStats, error: Option<&str>) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".into());
        Self {
            timestamp,
            path: path.to_string(),
            action: action.to_string(),
            additions: stats.additions,
            deletions: stats.deletions,
            error: error.map(str::to_string),
        }
    }
}

/// Append-only JSONL record of every terminal review decision, capped at
/// `max_entries` lines.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
    max_entries: usize,
}

impl Journal {
    pub fn new(dir: impl AsRef<Path>, max_entries: usize) -> Self {
        Self {
            path: dir.as_ref().join(JOURNAL_FILE),
            max_entries: max_entries.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {dir:?}"))?;
        }
        let json = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("opening {:?}", self.path))?;
        writeln!(file, "{json}")?;
        self.truncate()
    }

    /// The newest `count` entries, oldest first. Unparseable lines are skipped.
    pub fn tail(&self, count: usize) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let lines = self.lines()?;
        let start = lines.len().saturating_sub(count);
        Ok(lines[start..]
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    fn lines(&self) -> Result<Vec<String>> {
        let file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .with_context(|| format!("reading {:?}", self.path))?;
        let lines = BufReader::new(file).lines().collect::<Result<_, _>>()?;
        Ok(lines)
    }

    fn truncate(&self) -> Result<()> {
        let lines = self.lines()?;
        if lines.len() <= self.max_entries {
            return Ok(());
        }
        let keep = &lines[lines.len() - self.max_entries..];
        fs::write(&self.path, keep.join("\n") + "\n")?;
        Ok(())
    }
}
