//! Edit reconstruction and interactive diff review.
//!
//! Given a file's current content and the edits that produced it, rebuild what
//! the file looked like before, show the difference, and let a reviewer apply,
//! reject, or dismiss the change before anything is written.

pub mod config;
pub mod diff;
pub mod edit;
pub mod encoding;
pub mod host;
pub mod logging;
pub mod normalize;
pub mod protocol;
pub mod review;
pub mod service;
pub mod transform;
pub mod writer;

pub use config::Config;
pub use diff::{DiffStats, diff_stats};
pub use edit::{EditError, EditOperation, EditOutcome, TransformReport};
pub use normalize::{find_exact, find_fuzzy, normalize_whitespace};
pub use review::{
    InteractiveDiffRequest, ReviewError, ReviewOutcome, ReviewSession, ReviewState,
    SessionHandle, SessionId, SessionRegistry,
};
pub use service::{ServiceHandle, spawn};
pub use transform::{apply_forward, reconstruct_before};
pub use writer::{SafeWriter, WriteError};
