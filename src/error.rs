//! The engine's single error type.

use std::sync::Arc;

use thiserror::Error;

use crate::cx::CancelReason;

/// Every failure the engine can produce, one variant per error kind.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// `overrides::parse` could not make sense of the argument vector.
    #[error("parse error: {0}")]
    Parse(String),

    /// A CLI override collides with a target's compile-time configuration.
    #[error("override conflict: {0}")]
    Conflict(String),

    /// A target's body could not be invoked with the argument that was
    /// bound to it (wrong type, or no argument bound where one is required).
    #[error("unsupported target body signature: {0}")]
    Signature(String),

    /// `deps()` was called from outside an active run (no installed
    /// [`crate::deps::DepTracker`] on the calling thread).
    #[error("Deps(...) called outside of an active run")]
    NotDuringRun,

    /// A dependency reference could not be resolved (e.g. an unknown target
    /// name reached through a name-based dependency list).
    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    /// A target's body returned an error; `target` names which target, and
    /// `message` is the body's own error text.
    #[error("{target}: {message}")]
    BodyFailure { target: String, message: String },

    /// Execution was cut short by cancellation. `text` carries a
    /// human-readable rendering (including context like "during backoff"
    /// where relevant); `reason` is the underlying [`CancelReason`] for
    /// programmatic inspection.
    #[error("{text}")]
    Cancelled { reason: CancelReason, text: String },

    /// The `ChecksumSource` collaborator failed.
    #[error("cache check failed: {0}")]
    Cache(String),

    /// The `Watcher` collaborator failed.
    #[error("watch failed: {0}")]
    Watch(String),
}

impl EngineError {
    #[must_use]
    pub fn body_failure(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BodyFailure { target: target.into(), message: message.into() }
    }

    #[must_use]
    pub fn cancelled(reason: CancelReason) -> Self {
        let text = format!("cancelled: {reason}");
        Self::Cancelled { reason, text }
    }

    #[must_use]
    pub fn cancelled_during_backoff(reason: CancelReason) -> Self {
        let text = format!("cancelled during backoff: {reason}");
        Self::Cancelled { reason, text }
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// The result of running a single target: cached failures are shared via
/// `Arc` so every at-most-once reader of a dependency's outcome can clone it
/// cheaply.
pub type Outcome = Result<(), Arc<EngineError>>;
