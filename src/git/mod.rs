//! Git polling.
//!
//! One [`Watcher`] per repository maintains a work tree and surfaces branch
//! advances as [`ChangeEvent`]s. The watcher is the sole writer of its work
//! directory; commits are sampled at the branch tip, so intermediate commits
//! between polls are intentionally skipped.

pub mod auth;
mod watcher;

pub use auth::{AuthConfig, AuthKind};
pub use watcher::Watcher;

use chrono::{DateTime, Utc};

/// A detected branch advance. `commit` is a jump target, not a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub commit: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug)]
pub enum GitError {
    #[error("could not run git; {0}")]
    Io(#[from] std::io::Error),

    #[error("git {operation} failed; {stderr}")]
    CommandFailed { operation: String, stderr: String },

    #[error("{0} exists but is not a git repository")]
    NotARepository(String),

    #[error("auth is misconfigured; {0}")]
    Auth(String),
}
