//! JSON payloads exchanged with the messaging layer. Every message is an
//! object tagged by `type` with camelCase fields.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::edit::EditOperation;
use crate::review::SessionId;

/// Git-style status code marking a file the edits created.
const STATUS_ADDED: &str = "A";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InboundMessage {
    RefreshFile {
        file_path: String,
    },
    ShowDiff {
        file_path: String,
        #[serde(default)]
        old_content: String,
        #[serde(default)]
        new_content: String,
        #[serde(default)]
        title: Option<String>,
    },
    ShowMultiEditDiff {
        file_path: String,
        #[serde(default)]
        edits: Vec<EditOperation>,
        #[serde(default)]
        current_content: Option<String>,
    },
    ShowEditPreviewDiff {
        file_path: String,
        #[serde(default)]
        edits: Vec<EditOperation>,
        #[serde(default)]
        title: Option<String>,
    },
    ShowEditFullDiff {
        file_path: String,
        #[serde(default)]
        old_string: String,
        #[serde(default)]
        new_string: String,
        #[serde(default)]
        original_content: Option<String>,
        #[serde(default)]
        replace_all: bool,
        #[serde(default)]
        title: Option<String>,
    },
    ShowEditableDiff {
        file_path: String,
        #[serde(default)]
        operations: Vec<EditOperation>,
        #[serde(default)]
        status: Option<String>,
    },
    ShowInteractiveDiff {
        #[serde(default)]
        file_path: String,
        #[serde(default)]
        new_file_contents: Option<String>,
        #[serde(default)]
        operations: Option<Vec<EditOperation>>,
        #[serde(default)]
        tab_name: Option<String>,
        #[serde(default)]
        is_new_file: bool,
    },
    ResolveReview {
        session_id: SessionId,
        action: DiffAction,
        #[serde(default)]
        content: Option<String>,
    },
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::RefreshFile { .. } => "refresh_file",
            InboundMessage::ShowDiff { .. } => "show_diff",
            InboundMessage::ShowMultiEditDiff { .. } => "show_multi_edit_diff",
            InboundMessage::ShowEditPreviewDiff { .. } => "show_edit_preview_diff",
            InboundMessage::ShowEditFullDiff { .. } => "show_edit_full_diff",
            InboundMessage::ShowEditableDiff { .. } => "show_editable_diff",
            InboundMessage::ShowInteractiveDiff { .. } => "show_interactive_diff",
            InboundMessage::ResolveReview { .. } => "resolve_review",
        }
    }
}

pub fn is_added_status(status: Option<&str>) -> bool {
    status.is_some_and(|s| s.trim().eq_ignore_ascii_case(STATUS_ADDED))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiffAction {
    Apply,
    Reject,
    Dismiss,
}

impl DiffAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DiffAction::Apply => "APPLY",
            DiffAction::Reject => "REJECT",
            DiffAction::Dismiss => "DISMISS",
        }
    }
}

impl fmt::Display for DiffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResultPayload {
    pub file_path: String,
    pub action: DiffAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DiffResultPayload {
    pub fn applied(file_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            action: DiffAction::Apply,
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn rejected(file_path: impl Into<String>, error: Option<String>) -> Self {
        Self {
            file_path: file_path.into(),
            action: DiffAction::Reject,
            content: None,
            error,
        }
    }

    pub fn dismissed(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            action: DiffAction::Dismiss,
            content: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundEvent {
    DiffResult(DiffResultPayload),
    RemoveFileFromEdits {
        file_path: String,
    },
    UpdateFileInEdits {
        file_path: String,
        additions: usize,
        deletions: usize,
    },
    ErrorToast {
        message: String,
    },
}

impl OutboundEvent {
    pub fn toast(message: impl Into<String>) -> Self {
        OutboundEvent::ErrorToast {
            message: message.into(),
        }
    }
}
