use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::logging::Journal;

const CONFIG_CANDIDATES: [&str; 3] = [".editreview.yaml", ".editreview.yml", ".editreview.json"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub project_root: PathBuf,
    /// Encoding label used for new files and bytes that fail auto-detection.
    pub encoding: Option<String>,
    pub settle_delay_ms: u64,
    pub journal: JournalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            encoding: None,
            settle_delay_ms: 300,
            journal: JournalConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JournalConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub max_entries: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".editreview"),
            max_entries: 500,
        }
    }
}

impl Config {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// The journal, with a relative `dir` placed under the project root.
    pub fn journal(&self) -> Option<Journal> {
        if !self.journal.enabled {
            return None;
        }
        let dir = if self.journal.dir.is_absolute() {
            self.journal.dir.clone()
        } else {
            self.project_root.join(&self.journal.dir)
        };
        Some(Journal::new(dir, self.journal.max_entries))
    }

    /// Uses `explicit` when given, otherwise the first config file found in `root`,
    /// otherwise defaults. `project_root` always ends up set; a relative value
    /// from a file is taken relative to `root`.
    pub fn discover(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let found = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => CONFIG_CANDIDATES
                .iter()
                .map(|name| root.join(name))
                .find(|candidate| candidate.is_file()),
        };
        let Some(path) = found else {
            return Ok(Self {
                project_root: root.to_path_buf(),
                ..Self::default()
            });
        };
        let mut config = load_config(&path)?;
        if config.project_root.is_relative() {
            config.project_root = root.join(&config.project_root);
        }
        Ok(config)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let data = fs::read(path).with_context(|| format!("reading config {}", path.display()))?;
    if path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
    {
        serde_json::from_slice(&data).with_context(|| format!("parsing config {}", path.display()))
    } else {
        serde_yaml::from_slice(&data).with_context(|| format!("parsing config {}", path.display()))
    }
}
