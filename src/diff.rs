use std::fmt::Write as _;

use serde::Serialize;
use similar::{ChangeTag, TextDiff};

/// Line-level addition/deletion counts between two snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub additions: usize,
    pub deletions: usize,
}

/// Counts added and removed lines using the longest common subsequence of the
/// `\n`-split line sequences. Trailing empty segments are kept, so `"a\n"` is two
/// lines. Partially matching lines are never aligned.
pub fn diff_stats(before: &str, after: &str) -> DiffStats {
    let old: Vec<&str> = before.split('\n').collect();
    let new: Vec<&str> = after.split('\n').collect();
    let common = lcs_len(&old, &new);
    DiffStats {
        additions: new.len() - common,
        deletions: old.len() - common,
    }
}

fn lcs_len(old: &[&str], new: &[&str]) -> usize {
    // rolling rows of the (m+1) x (n+1) table
    let mut prev = vec![0usize; new.len() + 1];
    let mut row = vec![0usize; new.len() + 1];
    for line in old {
        for (j, candidate) in new.iter().enumerate() {
            row[j + 1] = if line == candidate {
                prev[j] + 1
            } else {
                prev[j + 1].max(row[j])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[new.len()]
}

#[derive(Debug, Clone, Copy)]
pub struct DiffDisplayConfig {
    pub context: usize,
    pub colorize: bool,
}

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

/// Renders a grouped line diff with `context` lines around each change.
pub fn render_diff(old: &str, new: &str, config: &DiffDisplayConfig) -> String {
    let diff = TextDiff::configure()
        .algorithm(similar::Algorithm::Myers)
        .diff_lines(old, new);

    let mut out = String::new();
    for (idx, group) in diff.grouped_ops(config.context).iter().enumerate() {
        if idx > 0 {
            out.push_str("...\n");
        }
        for op in group {
            for change in diff.iter_changes(op) {
                let (sign, color) = match change.tag() {
                    ChangeTag::Delete => ("- ", RED),
                    ChangeTag::Insert => ("+ ", GREEN),
                    ChangeTag::Equal => ("  ", ""),
                };
                let line = change.value().trim_end_matches('\n');
                if config.colorize && !color.is_empty() {
                    let _ = writeln!(out, "{color}{sign}{line}{RESET}");
                } else {
                    let _ = writeln!(out, "{sign}{line}");
                }
            }
        }
    }
    out
}

pub fn unified_diff(label: &str, old: &str, new: &str, context: usize) -> String {
    let diff = TextDiff::from_lines(old, new);
    diff.unified_diff()
        .context_radius(context)
        .header(&format!("a/{label}"), &format!("b/{label}"))
        .to_string()
}
