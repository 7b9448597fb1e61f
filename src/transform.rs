//! Forward application and reverse reconstruction of edit lists.
//!
//! Reconstruction undoes edits last-to-first by searching for each edit's
//! `new_string` and putting its `old_string` back. When a replacement text collides
//! with another edit's text the first match wins; this is a best-effort inverse,
//! not a unique one.

use tracing::{debug, warn};

use crate::edit::{EditError, EditOperation, EditOutcome, TransformReport};
use crate::normalize::{find_exact, find_fuzzy};

/// Applies `edits` in order to `base`, skipping any whose `old_string` is absent.
/// An empty `old_string` inserts `new_string` at the start of the content.
pub fn apply_forward(base: &str, edits: &[EditOperation]) -> String {
    apply_forward_report(base, edits).content
}

pub fn apply_forward_report(base: &str, edits: &[EditOperation]) -> TransformReport {
    let mut content = base.to_string();
    let mut outcomes = Vec::with_capacity(edits.len());

    for (index, edit) in edits.iter().enumerate() {
        let outcome = apply_edit(&mut content, edit).unwrap_or_else(|| {
            warn!(index, "old text not found while applying edit; skipping");
            EditOutcome::Skipped(EditError::MatchNotFound { index })
        });
        outcomes.push(outcome);
    }

    TransformReport { content, outcomes }
}

/// Derives the pre-edit content from `after` and the edits that produced it.
pub fn reconstruct_before(after: &str, edits: &[EditOperation]) -> String {
    reconstruct_before_report(after, edits).content
}

pub fn reconstruct_before_report(after: &str, edits: &[EditOperation]) -> TransformReport {
    let mut content = after.to_string();
    let mut outcomes = vec![None; edits.len()];

    for (index, edit) in edits.iter().enumerate().rev() {
        let exact = if edit.replace_all {
            replace_every(&mut content, &edit.new_string, &edit.old_string)
        } else {
            splice_first(&mut content, &edit.new_string, &edit.old_string)
        };
        // fuzzy fallback rewrites only the first matched region, even for replace-all
        let outcome =
            exact.or_else(|| splice_fuzzy(&mut content, &edit.new_string, &edit.old_string));
        outcomes[index] = Some(outcome.unwrap_or_else(|| {
            warn!(index, "new text not found while rebuilding original; skipping");
            EditOutcome::Skipped(EditError::MatchNotFound { index })
        }));
    }

    let outcomes: Vec<EditOutcome> = outcomes.into_iter().flatten().collect();
    debug!(edits = edits.len(), "rebuilt pre-edit content");
    TransformReport { content, outcomes }
}

/// Applies a single edit, returning `None` when its target text is missing.
pub fn apply_single(base: &str, edit: &EditOperation) -> Option<String> {
    let mut content = base.to_string();
    apply_edit(&mut content, edit).map(|_| content)
}

fn apply_edit(content: &mut String, edit: &EditOperation) -> Option<EditOutcome> {
    if edit.replace_all {
        replace_every(content, &edit.old_string, &edit.new_string)
    } else if edit.old_string.is_empty() {
        content.insert_str(0, &edit.new_string);
        Some(EditOutcome::Exact { offset: 0 })
    } else {
        splice_first(content, &edit.old_string, &edit.new_string)
    }
}

fn replace_every(content: &mut String, from: &str, to: &str) -> Option<EditOutcome> {
    find_exact(content, from)?;
    let occurrences = content.matches(from).count();
    *content = content.replace(from, to);
    Some(EditOutcome::ReplacedAll { occurrences })
}

fn splice_first(content: &mut String, from: &str, to: &str) -> Option<EditOutcome> {
    let offset = find_exact(content, from)?;
    content.replace_range(offset..offset + from.len(), to);
    Some(EditOutcome::Exact { offset })
}

fn splice_fuzzy(content: &mut String, from: &str, to: &str) -> Option<EditOutcome> {
    let (start, end) = find_fuzzy(content, from)?;
    content.replace_range(start..end, to);
    Some(EditOutcome::Fuzzy { start, end })
}
