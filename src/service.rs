//! The serialized review context.
//!
//! One task owns the session registry, the writer and the journal, and handles
//! every command in arrival order. Disk reads, settle delays and waits on a
//! reviewer run elsewhere and come back as commands, so a revert write and an
//! apply write for the same file can never interleave.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::diff::{DiffStats, diff_stats};
use crate::edit::EditOperation;
use crate::encoding::{EncodingPolicy, FileEncoding};
use crate::host::{DiffHost, DiffView, EventSink};
use crate::logging::{Journal, JournalEntry};
use crate::protocol::{DiffAction, DiffResultPayload, InboundMessage, OutboundEvent, is_added_status};
use crate::review::{
    InteractiveDiffRequest, ReviewError, ReviewOutcome, SessionHandle, SessionId,
    SessionRegistry, default_tab_label,
};
use crate::transform::{apply_forward, apply_single, reconstruct_before};
use crate::writer::{SafeWriter, read_decoded};

const FILE_NOT_FOUND: &str = "File not found";
const FILE_READ_FAILED: &str = "Failed to read file";
const EMPTY_PATH: &str = "File path is empty";
const NOTHING_TO_REVIEW: &str = "No new content or operations provided";

enum Command {
    Inbound(InboundMessage),
    Resolve {
        id: SessionId,
        outcome: ReviewOutcome,
        reply: oneshot::Sender<Result<(), ReviewError>>,
    },
    Prepared {
        path: PathBuf,
        job: Job,
        snapshot: Snapshot,
    },
    Finished {
        id: SessionId,
        outcome: ReviewOutcome,
    },
    Refresh {
        path: PathBuf,
    },
    Teardown {
        reply: oneshot::Sender<usize>,
    },
}

/// Disk state of a file as seen by a background read.
enum Snapshot {
    Text {
        text: String,
        encoding: Option<FileEncoding>,
    },
    Missing,
    Directory,
    Failed(String),
}

impl Snapshot {
    fn inline(text: String) -> Self {
        Snapshot::Text {
            text,
            encoding: None,
        }
    }

    fn describe(&self) -> &str {
        match self {
            Snapshot::Text { .. } => "readable",
            Snapshot::Missing => "file not found",
            Snapshot::Directory => "path is a directory",
            Snapshot::Failed(err) => err.as_str(),
        }
    }
}

fn read_snapshot(policy: &EncodingPolicy, path: &Path) -> Snapshot {
    match std::fs::metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Snapshot::Missing,
        Err(err) => Snapshot::Failed(err.to_string()),
        Ok(meta) if meta.is_dir() => Snapshot::Directory,
        Ok(_) => match read_decoded(policy, path) {
            Ok(decoded) => Snapshot::Text {
                text: decoded.text,
                encoding: Some(decoded.encoding),
            },
            Err(err) => Snapshot::Failed(err.to_string()),
        },
    }
}

/// Work waiting on a file read.
enum Job {
    MultiEdit {
        edits: Vec<EditOperation>,
    },
    EditPreview {
        edits: Vec<EditOperation>,
        title: Option<String>,
    },
    EditFull {
        original: String,
        title: Option<String>,
    },
    Editable {
        file_path: String,
        operations: Vec<EditOperation>,
        is_new: bool,
    },
    Interactive {
        file_path: String,
        proposal: Proposal,
        tab_name: Option<String>,
        is_new: bool,
    },
}

enum Proposal {
    Contents(String),
    Operations(Vec<EditOperation>),
}

impl Proposal {
    fn edit_count(&self) -> usize {
        match self {
            Proposal::Contents(_) => 1,
            Proposal::Operations(ops) => ops.len(),
        }
    }

    fn after(&self, before: &str) -> String {
        match self {
            Proposal::Contents(contents) => contents.clone(),
            Proposal::Operations(ops) => apply_forward(before, ops),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Edits are already on disk; rejecting writes the reconstructed original back.
    Editable,
    /// Nothing is on disk yet; only an apply writes.
    Interactive,
}

struct Pending {
    file_path: String,
    flow: Flow,
    request: InteractiveDiffRequest,
}

/// Cloneable entry point to a running review service. The service stops once
/// every handle is dropped and in-flight reads have reported back; sessions
/// still open at that point are dismissed without touching the disk.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<Command>,
}

fn stopped() -> anyhow::Error {
    anyhow!("review service has stopped")
}

impl ServiceHandle {
    pub fn submit(&self, message: InboundMessage) -> Result<()> {
        self.tx
            .send(Command::Inbound(message))
            .map_err(|_| stopped())
    }

    /// Resolves an open session. Fails with [`ReviewError`] for a session that
    /// is unknown or already resolved.
    pub async fn resolve(&self, id: SessionId, outcome: ReviewOutcome) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Resolve { id, outcome, reply })
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())??;
        Ok(())
    }

    /// Dismisses every open session, as when the hosting surface goes away.
    /// Returns how many sessions were closed.
    pub async fn teardown(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Teardown { reply })
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}

/// Starts the service on the current tokio runtime.
pub fn spawn<H, S>(config: &Config, host: H, sink: S) -> Result<ServiceHandle>
where
    H: DiffHost,
    S: EventSink,
{
    let policy = EncodingPolicy::new(config.encoding.as_deref())?;
    let writer = SafeWriter::new(&config.project_root, policy).with_context(|| {
        format!(
            "resolving project root {}",
            config.project_root.display()
        )
    })?;
    let (tx, rx) = mpsc::unbounded_channel();
    let service = ReviewService {
        registry: SessionRegistry::new(),
        writer,
        journal: config.journal(),
        host,
        sink,
        pending: HashMap::new(),
        settle_delay: config.settle_delay(),
        commands: tx.downgrade(),
        torn_down: false,
    };
    info!(root = %service.writer.root().display(), "review service started");
    tokio::spawn(service.run(rx));
    Ok(ServiceHandle { tx })
}

struct ReviewService<H, S> {
    registry: SessionRegistry,
    writer: SafeWriter,
    journal: Option<Journal>,
    host: H,
    sink: S,
    pending: HashMap<SessionId, Pending>,
    settle_delay: Duration,
    commands: mpsc::WeakUnboundedSender<Command>,
    /// Set once the review surface is gone; later reviews are dismissed on arrival.
    torn_down: bool,
}

impl<H: DiffHost, S: EventSink> ReviewService<H, S> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!(
            open = self.registry.len(),
            "review service stopped; open sessions dismissed"
        );
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Inbound(message) => self.on_message(message),
            Command::Resolve { id, outcome, reply } => {
                let result = self.registry.resolve(id, outcome).map(|_| ());
                let _ = reply.send(result);
            }
            Command::Prepared {
                path,
                job,
                snapshot,
            } => self.on_prepared(path, job, snapshot),
            Command::Finished { id, outcome } => self.finish(id, outcome),
            Command::Refresh { path } => self.host.refresh_file(&path),
            Command::Teardown { reply } => {
                self.torn_down = true;
                let ids = self.registry.dismiss_all();
                // settle here so the results go out before the caller moves on;
                // the waiters' own reports then find nothing pending
                for id in &ids {
                    self.finish(*id, ReviewOutcome::Dismissed);
                }
                info!(dismissed = ids.len(), "review surface torn down");
                let _ = reply.send(ids.len());
            }
        }
    }

    fn on_message(&mut self, message: InboundMessage) {
        debug!(kind = message.kind(), "inbound message");
        match message {
            InboundMessage::RefreshFile { file_path } => self.schedule_refresh(&file_path),
            InboundMessage::ShowDiff {
                file_path,
                old_content,
                new_content,
                title,
            } => {
                let path = self.writer.resolve(Path::new(&file_path));
                let name = display_name(&path);
                self.host.show_diff(DiffView {
                    title: title.unwrap_or_else(|| format!("File changes: {name}")),
                    left_label: format!("{name} (before)"),
                    right_label: format!("{name} (after)"),
                    left: old_content,
                    right: new_content,
                    file_path: path,
                });
            }
            InboundMessage::ShowMultiEditDiff {
                file_path,
                edits,
                current_content,
            } => {
                let path = self.writer.resolve(Path::new(&file_path));
                let job = Job::MultiEdit { edits };
                match current_content {
                    Some(after) => self.on_prepared(path, job, Snapshot::inline(after)),
                    None => self.prepare(path, job),
                }
            }
            InboundMessage::ShowEditPreviewDiff {
                file_path,
                edits,
                title,
            } => {
                let path = self.writer.resolve(Path::new(&file_path));
                self.prepare(path, Job::EditPreview { edits, title });
            }
            InboundMessage::ShowEditFullDiff {
                file_path,
                old_string,
                new_string,
                original_content,
                replace_all,
                title,
            } => {
                let path = self.writer.resolve(Path::new(&file_path));
                let edit = EditOperation {
                    old_string,
                    new_string,
                    replace_all,
                };
                match original_content.filter(|content| !content.is_empty()) {
                    None => {
                        let name = display_name(&path);
                        let title = title.unwrap_or_else(|| format!("Edit: {name}"));
                        self.host.show_diff(DiffView {
                            title: format!("{title} (edit only)"),
                            left_label: "old_string".to_string(),
                            right_label: "new_string".to_string(),
                            left: edit.old_string,
                            right: edit.new_string,
                            file_path: path,
                        });
                    }
                    Some(original) => match apply_single(&original, &edit) {
                        Some(after) => self.show_full_edit(path, title, original, after),
                        None => {
                            debug!(path = %path.display(), "edit target missing from original; comparing against disk");
                            self.prepare(path, Job::EditFull { original, title });
                        }
                    },
                }
            }
            InboundMessage::ShowEditableDiff {
                file_path,
                operations,
                status,
            } => {
                let is_new = is_added_status(status.as_deref());
                match self.writer.contain(Path::new(&file_path)) {
                    Ok(path) => self.prepare(
                        path,
                        Job::Editable {
                            file_path,
                            operations,
                            is_new,
                        },
                    ),
                    Err(err) => {
                        let message = err.to_string();
                        self.reject_early(&file_path, &message, Some(message.clone()));
                    }
                }
            }
            InboundMessage::ShowInteractiveDiff {
                file_path,
                new_file_contents,
                operations,
                tab_name,
                is_new_file,
            } => {
                if file_path.trim().is_empty() {
                    self.reject_early(&file_path, EMPTY_PATH, None);
                    return;
                }
                let proposal = match (new_file_contents, operations) {
                    (Some(contents), _) => Proposal::Contents(contents),
                    (None, Some(ops)) => Proposal::Operations(ops),
                    (None, None) => {
                        self.reject_early(&file_path, NOTHING_TO_REVIEW, None);
                        return;
                    }
                };
                let path = match self.writer.contain(Path::new(&file_path)) {
                    Ok(path) => path,
                    Err(err) => {
                        let message = err.to_string();
                        self.reject_early(&file_path, &message, Some(message.clone()));
                        return;
                    }
                };
                let job = Job::Interactive {
                    file_path,
                    proposal,
                    tab_name,
                    is_new: is_new_file,
                };
                if is_new_file {
                    self.on_prepared(path, job, Snapshot::inline(String::new()));
                } else {
                    self.prepare(path, job);
                }
            }
            InboundMessage::ResolveReview {
                session_id,
                action,
                content,
            } => {
                let outcome = match action {
                    DiffAction::Apply => ReviewOutcome::Applied(
                        content
                            .or_else(|| self.registry.get(session_id).map(|r| r.after.clone()))
                            .unwrap_or_default(),
                    ),
                    DiffAction::Reject => ReviewOutcome::Rejected { reason: None },
                    DiffAction::Dismiss => ReviewOutcome::Dismissed,
                };
                if let Err(err) = self.registry.resolve(session_id, outcome) {
                    warn!(error = %err, "resolve_review failed");
                    self.sink.emit(OutboundEvent::toast(err.to_string()));
                }
            }
        }
    }

    fn on_prepared(&mut self, path: PathBuf, job: Job, snapshot: Snapshot) {
        let encoding = match &snapshot {
            Snapshot::Text { encoding, .. } => *encoding,
            _ => None,
        };

        match job {
            Job::MultiEdit { edits } => {
                let after = match snapshot {
                    Snapshot::Text { text, .. } => text,
                    other => {
                        warn!(path = %path.display(), reason = other.describe(), "cannot show multi-edit diff");
                        return;
                    }
                };
                let before = reconstruct_before(&after, &edits);
                let name = display_name(&path);
                self.host.show_diff(DiffView {
                    title: format!("File changes: {name} ({} edits)", edits.len()),
                    left_label: format!("{name} (before)"),
                    right_label: format!("{name} (after)"),
                    left: before,
                    right: after,
                    file_path: path,
                });
            }
            Job::EditPreview { edits, title } => {
                let before = match snapshot {
                    Snapshot::Text { text, .. } => text,
                    Snapshot::Missing => String::new(),
                    Snapshot::Directory => {
                        warn!(path = %path.display(), "edit preview requested for a directory");
                        return;
                    }
                    Snapshot::Failed(err) => {
                        warn!(path = %path.display(), error = %err, "reading file for preview failed; previewing against empty content");
                        String::new()
                    }
                };
                let after = apply_forward(&before, &edits);
                let name = display_name(&path);
                self.host.show_diff(DiffView {
                    title: title.unwrap_or_else(|| format!("Edit preview: {name}")),
                    left_label: format!("{name} (current)"),
                    right_label: format!("{name} (after edit)"),
                    left: before,
                    right: after,
                    file_path: path,
                });
            }
            Job::EditFull { original, title } => {
                let after = match snapshot {
                    Snapshot::Text { text, .. } => text,
                    _ => String::new(),
                };
                self.show_full_edit(path, title, original, after);
            }
            Job::Editable {
                file_path,
                operations,
                is_new,
            } => {
                let after = match snapshot {
                    Snapshot::Text { text, .. } => text,
                    Snapshot::Missing if is_new => String::new(),
                    Snapshot::Missing => {
                        self.sink
                            .emit(OutboundEvent::toast(format!("{FILE_NOT_FOUND}: {file_path}")));
                        self.sink.emit(OutboundEvent::RemoveFileFromEdits {
                            file_path: file_path.clone(),
                        });
                        self.reject_early(&file_path, FILE_NOT_FOUND, None);
                        return;
                    }
                    other => {
                        let toast = format!("{FILE_READ_FAILED}: {}", other.describe());
                        self.reject_early(&file_path, FILE_READ_FAILED, Some(toast));
                        return;
                    }
                };
                let label = default_tab_label(&path, operations.len());
                let request = if is_new {
                    InteractiveDiffRequest::for_new_file(path, after, label)
                } else {
                    let before = reconstruct_before(&after, &operations);
                    InteractiveDiffRequest::for_modified_file(path, before, after, label)
                };
                self.open_review(file_path, Flow::Editable, request, encoding);
            }
            Job::Interactive {
                file_path,
                proposal,
                tab_name,
                is_new,
            } => {
                let before = match snapshot {
                    Snapshot::Text { text, .. } => text,
                    Snapshot::Missing => {
                        let toast = format!("{FILE_NOT_FOUND}: {file_path}");
                        self.reject_early(&file_path, FILE_NOT_FOUND, Some(toast));
                        return;
                    }
                    other => {
                        let toast = format!("{FILE_READ_FAILED}: {}", other.describe());
                        self.reject_early(&file_path, FILE_READ_FAILED, Some(toast));
                        return;
                    }
                };
                let after = proposal.after(&before);
                let label = tab_name
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| default_tab_label(&path, proposal.edit_count()));
                let request = if is_new {
                    InteractiveDiffRequest::for_new_file(path, after, label)
                } else {
                    InteractiveDiffRequest::for_modified_file(path, before, after, label)
                };
                self.open_review(file_path, Flow::Interactive, request, encoding);
            }
        }
    }

    fn show_full_edit(&mut self, path: PathBuf, title: Option<String>, before: String, after: String) {
        let name = display_name(&path);
        self.host.show_diff(DiffView {
            title: title.unwrap_or_else(|| format!("Edit: {name}")),
            left_label: format!("{name} (before)"),
            right_label: format!("{name} (after)"),
            left: before,
            right: after,
            file_path: path,
        });
    }

    fn open_review(
        &mut self,
        file_path: String,
        flow: Flow,
        request: InteractiveDiffRequest,
        encoding: Option<FileEncoding>,
    ) {
        if self.torn_down {
            debug!(path = %file_path, "review surface is gone; dismissing late request");
            self.send_result(DiffResultPayload::dismissed(file_path), DiffStats::default());
            return;
        }
        if let Some(encoding) = encoding {
            self.writer.track(&request.file_path, encoding);
        }
        let handle = self.registry.open(request.clone());
        let id = handle.id();
        self.host.present_review(id, &request);
        self.pending.insert(
            id,
            Pending {
                file_path,
                flow,
                request,
            },
        );
        self.watch(handle);
    }

    fn finish(&mut self, id: SessionId, outcome: ReviewOutcome) {
        let Some(Pending {
            file_path,
            flow,
            request,
        }) = self.pending.remove(&id)
        else {
            debug!(session = %id, "outcome for a settled session ignored");
            return;
        };

        match outcome {
            ReviewOutcome::Applied(content) => {
                match self.writer.write(&request.file_path, &content) {
                    Ok(receipt) => {
                        if receipt.lossy {
                            warn!(path = %receipt.path.display(), encoding = receipt.encoding, "some characters were not representable");
                        }
                        self.host.refresh_file(&receipt.path);
                        let stats = diff_stats(&request.before, &content);
                        if flow == Flow::Editable {
                            self.sink.emit(OutboundEvent::UpdateFileInEdits {
                                file_path: file_path.clone(),
                                additions: stats.additions,
                                deletions: stats.deletions,
                            });
                        }
                        self.send_result(DiffResultPayload::applied(file_path, content), stats);
                    }
                    Err(err) => {
                        warn!(path = %request.file_path.display(), error = %err, "applying reviewed content failed");
                        self.sink
                            .emit(OutboundEvent::toast(format!("Failed to write file: {err}")));
                        self.send_result(
                            DiffResultPayload::rejected(file_path, Some(err.to_string())),
                            DiffStats::default(),
                        );
                    }
                }
            }
            ReviewOutcome::Rejected { reason } => {
                if flow == Flow::Editable {
                    match self.writer.write(&request.file_path, &request.before) {
                        Ok(receipt) => self.host.refresh_file(&receipt.path),
                        Err(err) => {
                            warn!(path = %request.file_path.display(), error = %err, "reverting rejected edits failed");
                            self.sink
                                .emit(OutboundEvent::toast(format!("Failed to revert file: {err}")));
                        }
                    }
                    self.sink.emit(OutboundEvent::RemoveFileFromEdits {
                        file_path: file_path.clone(),
                    });
                }
                self.send_result(
                    DiffResultPayload::rejected(file_path, reason),
                    DiffStats::default(),
                );
            }
            ReviewOutcome::Dismissed => {
                self.send_result(DiffResultPayload::dismissed(file_path), DiffStats::default());
            }
        }

        let still_open = self
            .pending
            .values()
            .any(|other| other.request.file_path == request.file_path);
        if !still_open {
            self.writer.forget(&request.file_path);
        }
    }

    /// Terminal REJECT for a request that never reached a session.
    fn reject_early(&mut self, file_path: &str, error: &str, toast: Option<String>) {
        warn!(path = file_path, error, "review request rejected");
        if let Some(message) = toast {
            self.sink.emit(OutboundEvent::toast(message));
        }
        self.send_result(
            DiffResultPayload::rejected(file_path, Some(error.to_string())),
            DiffStats::default(),
        );
    }

    fn send_result(&mut self, payload: DiffResultPayload, stats: DiffStats) {
        info!(path = %payload.file_path, action = %payload.action, "review resolved");
        if let Some(journal) = &self.journal {
            let entry = JournalEntry::now(
                &payload.file_path,
                payload.action.as_str(),
                stats,
                payload.error.as_deref(),
            );
            if let Err(err) = journal.record(&entry) {
                warn!(error = %err, "failed to record review decision");
            }
        }
        self.sink.emit(OutboundEvent::DiffResult(payload));
    }

    /// Reads `path` on the blocking pool. Bounded work keeps the service alive
    /// until it reports back; only reviewer waits hold weak senders.
    fn prepare(&self, path: PathBuf, job: Job) {
        let Some(tx) = self.commands.upgrade() else {
            debug!(path = %path.display(), "service stopping; read not scheduled");
            return;
        };
        let policy = self.writer.policy().clone();
        tokio::task::spawn_blocking(move || {
            let snapshot = read_snapshot(&policy, &path);
            let _ = tx.send(Command::Prepared {
                path,
                job,
                snapshot,
            });
        });
    }

    fn watch(&self, handle: SessionHandle) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let id = handle.id();
            let outcome = handle.wait().await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Finished { id, outcome });
            }
        });
    }

    /// Waits for external writers to settle, then asks the host to reload the
    /// file. A literal path that exists wins over one resolved against the root.
    fn schedule_refresh(&self, file_path: &str) {
        let requested = file_path.to_string();
        let literal = PathBuf::from(file_path);
        let resolved = self.writer.resolve(&literal);
        let delay = self.settle_delay;
        let Some(tx) = self.commands.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let located = tokio::task::spawn_blocking(move || {
                if !literal.as_os_str().is_empty() && literal.exists() {
                    std::path::absolute(&literal).ok()
                } else if resolved.exists() {
                    Some(resolved)
                } else {
                    None
                }
            })
            .await
            .ok()
            .flatten();
            match located {
                Some(path) => {
                    let _ = tx.send(Command::Refresh { path });
                }
                None => warn!(path = %requested, "refresh requested for a file that does not exist"),
            }
        });
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use crate::host::{ChannelHost, ChannelSink, HostEvent};
    use std::fs;
    use tempfile::{TempDir, tempdir};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        dir: TempDir,
        handle: ServiceHandle,
        host: UnboundedReceiver<HostEvent>,
        events: UnboundedReceiver<OutboundEvent>,
    }

    impl Harness {
        fn start() -> Self {
            let dir = tempdir().unwrap();
            let config = Config {
                project_root: dir.path().to_path_buf(),
                settle_delay_ms: 10,
                journal: JournalConfig {
                    max_entries: 50,
                    ..JournalConfig::default()
                },
                ..Config::default()
            };
            let (host, host_rx) = ChannelHost::new();
            let (sink, events) = ChannelSink::new();
            let handle = spawn(&config, host, sink).unwrap();
            Self {
                dir,
                handle,
                host: host_rx,
                events,
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn write(&self, name: &str, content: &str) {
            fs::write(self.path(name), content).unwrap();
        }

        fn read(&self, name: &str) -> String {
            fs::read_to_string(self.path(name)).unwrap()
        }

        async fn host_event(&mut self) -> HostEvent {
            tokio::time::timeout(Duration::from_secs(5), self.host.recv())
                .await
                .expect("timed out waiting for host event")
                .expect("host channel closed")
        }

        async fn event(&mut self) -> OutboundEvent {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for outbound event")
                .expect("event channel closed")
        }

        async fn opened(&mut self) -> (SessionId, InteractiveDiffRequest) {
            match self.host_event().await {
                HostEvent::ReviewOpened {
                    session_id,
                    request,
                } => (session_id, request),
                other => panic!("expected review_opened, got {other:?}"),
            }
        }

        async fn result(&mut self) -> DiffResultPayload {
            loop {
                if let OutboundEvent::DiffResult(payload) = self.event().await {
                    return payload;
                }
            }
        }
    }

    fn interactive(file_path: &str, ops: Vec<EditOperation>) -> InboundMessage {
        InboundMessage::ShowInteractiveDiff {
            file_path: file_path.to_string(),
            new_file_contents: None,
            operations: Some(ops),
            tab_name: None,
            is_new_file: false,
        }
    }

    fn editable(file_path: &str, ops: Vec<EditOperation>) -> InboundMessage {
        InboundMessage::ShowEditableDiff {
            file_path: file_path.to_string(),
            operations: ops,
            status: None,
        }
    }

    #[tokio::test]
    async fn interactive_apply_writes_final_content() {
        let mut h = Harness::start();
        h.write("a.txt", "a\nb\nc\n");
        h.handle
            .submit(interactive("a.txt", vec![EditOperation::new("b", "B")]))
            .unwrap();

        let (id, request) = h.opened().await;
        assert_eq!(request.before, "a\nb\nc\n");
        assert_eq!(request.after, "a\nB\nc\n");
        assert_eq!(request.tab_label, "a.txt (1 edit(s))");
        assert!(!request.is_new_file);

        h.handle
            .resolve(id, ReviewOutcome::Applied("a\nB\nc\nd\n".into()))
            .await
            .unwrap();
        let result = h.result().await;
        assert_eq!(result, DiffResultPayload::applied("a.txt", "a\nB\nc\nd\n"));
        assert_eq!(h.read("a.txt"), "a\nB\nc\nd\n");
        let refreshed = h.host_event().await;
        assert_eq!(
            refreshed,
            HostEvent::RefreshFile {
                file_path: h.path("a.txt")
            }
        );

        let journal = Journal::new(h.dir.path().join(".editreview"), 50);
        let entries = journal.tail(5).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "APPLY");
        assert_eq!(entries[0].additions, 2);
    }

    #[tokio::test]
    async fn interactive_reject_leaves_disk_untouched() {
        let mut h = Harness::start();
        h.write("a.txt", "keep me\n");
        h.handle
            .submit(interactive("a.txt", vec![EditOperation::new("keep", "drop")]))
            .unwrap();
        let (id, _) = h.opened().await;
        h.handle
            .resolve(id, ReviewOutcome::Rejected { reason: None })
            .await
            .unwrap();
        assert_eq!(h.result().await.action, DiffAction::Reject);
        assert_eq!(h.read("a.txt"), "keep me\n");
    }

    #[tokio::test]
    async fn editable_reject_restores_reconstructed_original() {
        let mut h = Harness::start();
        h.write("lib.rs", "let x = new_value;\n");
        h.handle
            .submit(editable(
                "lib.rs",
                vec![EditOperation::new("old_value", "new_value")],
            ))
            .unwrap();
        let (id, request) = h.opened().await;
        assert_eq!(request.before, "let x = old_value;\n");

        h.handle
            .submit(InboundMessage::ResolveReview {
                session_id: id,
                action: DiffAction::Reject,
                content: None,
            })
            .unwrap();
        assert_eq!(
            h.event().await,
            OutboundEvent::RemoveFileFromEdits {
                file_path: "lib.rs".into()
            }
        );
        assert_eq!(h.result().await, DiffResultPayload::rejected("lib.rs", None));
        assert_eq!(h.read("lib.rs"), "let x = old_value;\n");
    }

    #[tokio::test]
    async fn editable_apply_reports_stats() {
        let mut h = Harness::start();
        h.write("lib.rs", "one\nTWO\nthree\n");
        h.handle
            .submit(editable("lib.rs", vec![EditOperation::new("two", "TWO")]))
            .unwrap();
        let (id, _) = h.opened().await;
        h.handle
            .submit(InboundMessage::ResolveReview {
                session_id: id,
                action: DiffAction::Apply,
                content: None,
            })
            .unwrap();
        assert_eq!(
            h.event().await,
            OutboundEvent::UpdateFileInEdits {
                file_path: "lib.rs".into(),
                additions: 1,
                deletions: 1,
            }
        );
        let result = h.result().await;
        assert_eq!(result.action, DiffAction::Apply);
        assert_eq!(result.content.as_deref(), Some("one\nTWO\nthree\n"));
        assert_eq!(h.read("lib.rs"), "one\nTWO\nthree\n");
    }

    #[tokio::test]
    async fn editable_missing_file_is_removed_and_rejected() {
        let mut h = Harness::start();
        h.handle.submit(editable("ghost.rs", vec![])).unwrap();
        assert!(matches!(h.event().await, OutboundEvent::ErrorToast { .. }));
        assert_eq!(
            h.event().await,
            OutboundEvent::RemoveFileFromEdits {
                file_path: "ghost.rs".into()
            }
        );
        assert_eq!(
            h.result().await,
            DiffResultPayload::rejected("ghost.rs", Some(FILE_NOT_FOUND.into()))
        );
    }

    #[tokio::test]
    async fn interactive_preparation_failures_reject() {
        let mut h = Harness::start();
        h.handle.submit(interactive("  ", vec![])).unwrap();
        assert_eq!(
            h.result().await,
            DiffResultPayload::rejected("  ", Some(EMPTY_PATH.into()))
        );

        h.handle.submit(interactive("absent.txt", vec![])).unwrap();
        assert!(matches!(h.event().await, OutboundEvent::ErrorToast { .. }));
        assert_eq!(
            h.result().await.error.as_deref(),
            Some(FILE_NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn paths_outside_root_are_rejected_before_review() {
        let mut h = Harness::start();
        h.handle
            .submit(InboundMessage::ShowInteractiveDiff {
                file_path: "../escape.txt".into(),
                new_file_contents: Some("x".into()),
                operations: None,
                tab_name: None,
                is_new_file: true,
            })
            .unwrap();
        let result = h.result().await;
        assert_eq!(result.action, DiffAction::Reject);
        assert!(result.error.unwrap().contains("outside the project root"));
        assert!(!h.dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn new_file_review_creates_directories() {
        let mut h = Harness::start();
        h.handle
            .submit(InboundMessage::ShowInteractiveDiff {
                file_path: "docs/guide.md".into(),
                new_file_contents: Some("# Guide\n".into()),
                operations: None,
                tab_name: Some("Guide".into()),
                is_new_file: true,
            })
            .unwrap();
        let (id, request) = h.opened().await;
        assert!(request.is_new_file);
        assert_eq!(request.before, "");
        assert_eq!(request.tab_label, "Guide");
        h.handle
            .resolve(id, ReviewOutcome::Applied(request.after.clone()))
            .await
            .unwrap();
        assert_eq!(h.result().await.action, DiffAction::Apply);
        assert_eq!(h.read("docs/guide.md"), "# Guide\n");
    }

    #[tokio::test]
    async fn write_failure_after_apply_becomes_reject() {
        let mut h = Harness::start();
        h.write("blocker", "a file, not a directory");
        h.handle
            .submit(InboundMessage::ShowInteractiveDiff {
                file_path: "blocker/child.txt".into(),
                new_file_contents: Some("x".into()),
                operations: None,
                tab_name: None,
                is_new_file: true,
            })
            .unwrap();
        let (id, request) = h.opened().await;
        h.handle
            .resolve(id, ReviewOutcome::Applied(request.after))
            .await
            .unwrap();
        assert!(matches!(h.event().await, OutboundEvent::ErrorToast { .. }));
        let result = h.result().await;
        assert_eq!(result.action, DiffAction::Reject);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn second_resolve_is_refused() {
        let mut h = Harness::start();
        h.write("a.txt", "a\n");
        h.handle
            .submit(interactive("a.txt", vec![EditOperation::new("a", "b")]))
            .unwrap();
        let (id, _) = h.opened().await;
        h.handle.resolve(id, ReviewOutcome::Dismissed).await.unwrap();
        let err = h
            .handle
            .resolve(id, ReviewOutcome::Applied("b\n".into()))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ReviewError>(),
            Some(&ReviewError::SessionAlreadyResolved(id))
        );
        assert_eq!(h.result().await, DiffResultPayload::dismissed("a.txt"));
        assert_eq!(h.read("a.txt"), "a\n");
    }

    #[tokio::test]
    async fn unknown_session_resolve_emits_toast() {
        let mut h = Harness::start();
        h.handle
            .submit(InboundMessage::ResolveReview {
                session_id: SessionId::new(),
                action: DiffAction::Apply,
                content: None,
            })
            .unwrap();
        let OutboundEvent::ErrorToast { message } = h.event().await else {
            panic!("expected a toast");
        };
        assert!(message.contains("no open review session"));
    }

    #[tokio::test]
    async fn teardown_dismisses_open_sessions() {
        let mut h = Harness::start();
        h.write("a.txt", "a\n");
        h.handle
            .submit(editable("a.txt", vec![EditOperation::new("z", "a")]))
            .unwrap();
        let (id, _) = h.opened().await;
        assert_eq!(h.handle.teardown().await.unwrap(), 1);
        assert_eq!(h.result().await, DiffResultPayload::dismissed("a.txt"));
        assert_eq!(h.read("a.txt"), "a\n");
        let err = h
            .handle
            .resolve(id, ReviewOutcome::Rejected { reason: None })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ReviewError>().is_some());
    }

    #[tokio::test]
    async fn dropping_handle_stops_without_mutation() {
        let mut h = Harness::start();
        h.write("a.txt", "a\n");
        h.handle
            .submit(editable("a.txt", vec![EditOperation::new("z", "a")]))
            .unwrap();
        h.opened().await;
        let Harness {
            dir,
            handle,
            mut events,
            ..
        } = h;
        drop(handle);
        let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "a\n");
    }

    #[tokio::test]
    async fn multi_edit_diff_reconstructs_before() {
        let mut h = Harness::start();
        h.handle
            .submit(InboundMessage::ShowMultiEditDiff {
                file_path: "a.txt".into(),
                edits: vec![EditOperation::new("b", "B")],
                current_content: Some("a\nB\nc\n".into()),
            })
            .unwrap();
        let HostEvent::ShowDiff(view) = h.host_event().await else {
            panic!("expected show_diff");
        };
        assert_eq!(view.title, "File changes: a.txt (1 edits)");
        assert_eq!(view.left, "a\nb\nc\n");
        assert_eq!(view.right, "a\nB\nc\n");
    }

    #[tokio::test]
    async fn edit_preview_reads_current_content() {
        let mut h = Harness::start();
        h.write("cfg.toml", "level = 1\n");
        h.handle
            .submit(InboundMessage::ShowEditPreviewDiff {
                file_path: "cfg.toml".into(),
                edits: vec![EditOperation::new("1", "2")],
                title: None,
            })
            .unwrap();
        let HostEvent::ShowDiff(view) = h.host_event().await else {
            panic!("expected show_diff");
        };
        assert_eq!(view.title, "Edit preview: cfg.toml");
        assert_eq!(view.left_label, "cfg.toml (current)");
        assert_eq!(view.right, "level = 2\n");
    }

    #[tokio::test]
    async fn edit_full_diff_without_original_shows_fragment() {
        let mut h = Harness::start();
        h.handle
            .submit(InboundMessage::ShowEditFullDiff {
                file_path: "x.rs".into(),
                old_string: "foo".into(),
                new_string: "bar".into(),
                original_content: None,
                replace_all: false,
                title: None,
            })
            .unwrap();
        let HostEvent::ShowDiff(view) = h.host_event().await else {
            panic!("expected show_diff");
        };
        assert_eq!(view.title, "Edit: x.rs (edit only)");
        assert_eq!((view.left.as_str(), view.right.as_str()), ("foo", "bar"));
    }

    #[tokio::test]
    async fn refresh_waits_then_notifies_host() {
        let mut h = Harness::start();
        h.write("a.txt", "a\n");
        h.handle
            .submit(InboundMessage::RefreshFile {
                file_path: "a.txt".into(),
            })
            .unwrap();
        let HostEvent::RefreshFile { file_path } = h.host_event().await else {
            panic!("expected refresh_file");
        };
        assert!(file_path.ends_with("a.txt"));
    }

    #[tokio::test]
    async fn new_file_from_operations_inserts_content() {
        let mut h = Harness::start();
        h.handle
            .submit(InboundMessage::ShowInteractiveDiff {
                file_path: "src/main.rs".into(),
                new_file_contents: None,
                operations: Some(vec![EditOperation::new("", "fn main() {}\n")]),
                tab_name: None,
                is_new_file: true,
            })
            .unwrap();
        let (id, request) = h.opened().await;
        assert!(request.is_new_file);
        assert_eq!(request.after, "fn main() {}\n");

        h.handle
            .submit(InboundMessage::ResolveReview {
                session_id: id,
                action: DiffAction::Apply,
                content: None,
            })
            .unwrap();
        assert_eq!(h.result().await.action, DiffAction::Apply);
        assert_eq!(h.read("src/main.rs"), "fn main() {}\n");
    }

    #[tokio::test]
    async fn editable_new_file_absent_from_disk_still_opens() {
        let mut h = Harness::start();
        h.handle
            .submit(InboundMessage::ShowEditableDiff {
                file_path: "fresh.rs".into(),
                operations: vec![EditOperation::new("", "pub fn f() {}\n")],
                status: Some("A".into()),
            })
            .unwrap();
        let (id, request) = h.opened().await;
        assert!(request.is_new_file);
        assert_eq!(request.before, "");
        assert_eq!(request.after, "");

        h.handle.resolve(id, ReviewOutcome::Dismissed).await.unwrap();
        assert_eq!(h.result().await, DiffResultPayload::dismissed("fresh.rs"));
        assert!(!h.path("fresh.rs").exists());
    }

    fn bare_service(
        root: &Path,
    ) -> (
        ReviewService<ChannelHost, ChannelSink>,
        mpsc::UnboundedSender<Command>,
        UnboundedReceiver<HostEvent>,
        UnboundedReceiver<OutboundEvent>,
    ) {
        let (host, host_rx) = ChannelHost::new();
        let (sink, events) = ChannelSink::new();
        let (tx, _) = mpsc::unbounded_channel();
        let service = ReviewService {
            registry: SessionRegistry::new(),
            writer: SafeWriter::new(root, EncodingPolicy::default()).unwrap(),
            journal: None,
            host,
            sink,
            pending: HashMap::new(),
            settle_delay: Duration::ZERO,
            commands: tx.downgrade(),
            torn_down: false,
        };
        (service, tx, host_rx, events)
    }

    #[tokio::test]
    async fn only_open_reviews_keep_a_tracked_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "a\n").unwrap();
        let (mut service, _tx, mut host, _events) = bare_service(dir.path());
        let text = || Snapshot::Text {
            text: "a\n".into(),
            encoding: Some(FileEncoding::utf8()),
        };

        service.handle(Command::Prepared {
            path: path.clone(),
            job: Job::MultiEdit { edits: vec![] },
            snapshot: text(),
        });
        assert!(!service.writer.is_tracked(&path));

        service.handle(Command::Prepared {
            path: path.clone(),
            job: Job::Interactive {
                file_path: "a.txt".into(),
                proposal: Proposal::Contents("b\n".into()),
                tab_name: None,
                is_new: false,
            },
            snapshot: text(),
        });
        assert!(service.writer.is_tracked(&path));

        let id = loop {
            if let HostEvent::ReviewOpened { session_id, .. } = host.try_recv().unwrap() {
                break session_id;
            }
        };
        service.handle(Command::Finished {
            id,
            outcome: ReviewOutcome::Applied("b\n".into()),
        });
        assert_eq!(fs::read_to_string(&path).unwrap(), "b\n");
        assert!(!service.writer.is_tracked(&path));
    }

    #[tokio::test]
    async fn reviews_prepared_after_teardown_are_dismissed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "a\n").unwrap();
        let (mut service, _tx, mut host, mut events) = bare_service(dir.path());

        let (reply, _) = oneshot::channel();
        service.handle(Command::Teardown { reply });
        service.handle(Command::Prepared {
            path: path.clone(),
            job: Job::Editable {
                file_path: "a.txt".into(),
                operations: vec![EditOperation::new("z", "a")],
                is_new: false,
            },
            snapshot: Snapshot::inline("a\n".into()),
        });

        assert!(service.registry.is_empty());
        assert!(service.pending.is_empty());
        assert!(host.try_recv().is_err());
        assert_eq!(
            events.try_recv().unwrap(),
            OutboundEvent::DiffResult(DiffResultPayload::dismissed("a.txt"))
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\n");
    }
}
