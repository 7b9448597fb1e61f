use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::OutboundEvent;
use crate::review::{InteractiveDiffRequest, SessionId};

/// A read-only two-pane comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffView {
    pub file_path: PathBuf,
    pub title: String,
    pub left_label: String,
    pub right_label: String,
    pub left: String,
    pub right: String,
}

/// The editor surface that shows diffs and hosts review sessions. A session
/// presented here is resolved later through the service handle.
pub trait DiffHost: Send + 'static {
    fn show_diff(&mut self, view: DiffView);
    fn present_review(&mut self, id: SessionId, request: &InteractiveDiffRequest);
    fn refresh_file(&mut self, path: &Path);
}

/// Receives results and notifications meant for the UI surface.
pub trait EventSink: Send + 'static {
    fn emit(&mut self, event: OutboundEvent);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HostEvent {
    ShowDiff(DiffView),
    ReviewOpened {
        session_id: SessionId,
        request: InteractiveDiffRequest,
    },
    RefreshFile {
        file_path: PathBuf,
    },
}

/// Forwards host calls as [`HostEvent`]s.
#[derive(Debug, Clone)]
pub struct ChannelHost {
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl ChannelHost {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: HostEvent) {
        if self.tx.send(event).is_err() {
            debug!("host receiver closed; dropping event");
        }
    }
}

impl DiffHost for ChannelHost {
    fn show_diff(&mut self, view: DiffView) {
        self.send(HostEvent::ShowDiff(view));
    }

    fn present_review(&mut self, id: SessionId, request: &InteractiveDiffRequest) {
        self.send(HostEvent::ReviewOpened {
            session_id: id,
            request: request.clone(),
        });
    }

    fn refresh_file(&mut self, path: &Path) {
        self.send(HostEvent::RefreshFile {
            file_path: path.to_path_buf(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&mut self, event: OutboundEvent) {
        if self.tx.send(event).is_err() {
            debug!("event receiver closed; dropping event");
        }
    }
}
