//! Review sessions: one proposed before/after pair waiting for a single human
//! decision.
//!
//! A session starts `Opened` and moves to exactly one terminal state. The
//! decision travels to whoever opened the session through a oneshot channel;
//! a session dropped without a decision reads as `Dismissed`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::diff::{DiffStats, diff_stats};

/// Resolved ids remembered so a late second `resolve` is reported as a repeat.
const RETIRED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// What the reviewing surface is asked to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveDiffRequest {
    pub file_path: PathBuf,
    pub is_new_file: bool,
    pub before: String,
    pub after: String,
    pub tab_label: String,
}

impl InteractiveDiffRequest {
    pub fn for_new_file(
        file_path: impl Into<PathBuf>,
        after: impl Into<String>,
        tab_label: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            is_new_file: true,
            before: String::new(),
            after: after.into(),
            tab_label: tab_label.into(),
        }
    }

    pub fn for_modified_file(
        file_path: impl Into<PathBuf>,
        before: impl Into<String>,
        after: impl Into<String>,
        tab_label: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            is_new_file: false,
            before: before.into(),
            after: after.into(),
            tab_label: tab_label.into(),
        }
    }

    pub fn stats(&self) -> DiffStats {
        diff_stats(&self.before, &self.after)
    }
}

/// `<file name> (<n> edit(s))`
pub fn default_tab_label(path: &Path, edits: usize) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    format!("{name} ({edits} edit(s))")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// Carries the final text, which the reviewer may have edited further.
    Applied(String),
    Rejected { reason: Option<String> },
    Dismissed,
}

impl ReviewOutcome {
    pub fn rejected_with(reason: impl Into<String>) -> Self {
        ReviewOutcome::Rejected {
            reason: Some(reason.into()),
        }
    }

    fn state(&self) -> ReviewState {
        match self {
            ReviewOutcome::Applied(_) => ReviewState::Applied,
            ReviewOutcome::Rejected { .. } => ReviewState::Rejected,
            ReviewOutcome::Dismissed => ReviewState::Dismissed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    Opened,
    Applied,
    Rejected,
    Dismissed,
}

impl ReviewState {
    pub fn is_terminal(self) -> bool {
        self != ReviewState::Opened
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReviewError {
    #[error("review session {0} was already resolved")]
    SessionAlreadyResolved(SessionId),
    #[error("no open review session with id {0}")]
    UnknownSession(SessionId),
}

#[derive(Debug)]
pub struct ReviewSession {
    id: SessionId,
    request: InteractiveDiffRequest,
    state: ReviewState,
    resolver: Option<oneshot::Sender<ReviewOutcome>>,
}

impl ReviewSession {
    pub fn open(request: InteractiveDiffRequest) -> (Self, SessionHandle) {
        let id = SessionId::new();
        let (tx, rx) = oneshot::channel();
        let session = Self {
            id,
            request,
            state: ReviewState::Opened,
            resolver: Some(tx),
        };
        (session, SessionHandle { id, receiver: rx })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> ReviewState {
        self.state
    }

    pub fn request(&self) -> &InteractiveDiffRequest {
        &self.request
    }

    pub fn into_request(self) -> InteractiveDiffRequest {
        self.request
    }

    /// Delivers `outcome` to the waiting handle. Only the first call counts.
    pub fn resolve(&mut self, outcome: ReviewOutcome) -> Result<(), ReviewError> {
        if self.state.is_terminal() {
            return Err(ReviewError::SessionAlreadyResolved(self.id));
        }
        self.state = outcome.state();
        if let Some(tx) = self.resolver.take() {
            // the waiter may already be gone; the state change still stands
            let _ = tx.send(outcome);
        }
        Ok(())
    }
}

/// Receiving end of a session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    receiver: oneshot::Receiver<ReviewOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn wait(self) -> ReviewOutcome {
        self.receiver.await.unwrap_or(ReviewOutcome::Dismissed)
    }
}

/// Open sessions keyed by id. Sessions are inserted on open and removed on
/// their terminal resolution.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, ReviewSession>,
    retired: VecDeque<SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, request: InteractiveDiffRequest) -> SessionHandle {
        let (session, handle) = ReviewSession::open(request);
        debug!(session = %session.id(), path = %session.request().file_path.display(), "review opened");
        self.sessions.insert(session.id(), session);
        handle
    }

    pub fn get(&self, id: SessionId) -> Option<&InteractiveDiffRequest> {
        self.sessions.get(&id).map(ReviewSession::request)
    }

    /// Resolves and removes the session, handing back its request.
    pub fn resolve(
        &mut self,
        id: SessionId,
        outcome: ReviewOutcome,
    ) -> Result<InteractiveDiffRequest, ReviewError> {
        let Some(mut session) = self.sessions.remove(&id) else {
            return Err(if self.retired.contains(&id) {
                ReviewError::SessionAlreadyResolved(id)
            } else {
                ReviewError::UnknownSession(id)
            });
        };
        session.resolve(outcome)?;
        self.retire(id);
        Ok(session.into_request())
    }

    /// Dismisses every open session, returning the ids that were closed.
    pub fn dismiss_all(&mut self) -> Vec<SessionId> {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in &ids {
            if let Err(err) = self.resolve(*id, ReviewOutcome::Dismissed) {
                debug!(%err, "dismiss skipped");
            }
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn retire(&mut self, id: SessionId) {
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(id);
    }
}
