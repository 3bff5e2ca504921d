//! Cancellation tokens.
//!
//! `Cx` is the cooperative cancellation token threaded through every body
//! invocation, dependency resolution, and parallel branch. It gates blocking
//! code directly: checking it is a cheap, explicit, synchronous call, not a
//! future being polled.
//!
//! Cancellation here is first-cause-wins: the first [`Cx::cancel`] call on a
//! token wins and later calls are no-ops. A token also observes cancellation
//! on any of its ancestors (see [`Cx::child`]), so cancelling a parent always
//! cancels every descendant, but a child's own cause is reported if it was
//! cancelled first.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::output::Printer;

/// How a cancellation was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelKind {
    /// Explicit cancellation requested by the host program.
    User,
    /// The target's configured timeout elapsed.
    Timeout,
    /// A sibling in the same fail-fast parallel group failed.
    FailFast,
    /// An ancestor context was cancelled.
    ParentCancelled,
    /// The engine itself is shutting down.
    Shutdown,
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Timeout => write!(f, "timeout"),
            Self::FailFast => write!(f, "fail-fast"),
            Self::ParentCancelled => write!(f, "parent cancelled"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Why a [`Cx`] was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReason {
    pub kind: CancelKind,
    pub message: Option<&'static str>,
}

impl CancelReason {
    #[must_use]
    pub const fn new(kind: CancelKind) -> Self {
        Self { kind, message: None }
    }

    #[must_use]
    pub const fn user(message: &'static str) -> Self {
        Self { kind: CancelKind::User, message: Some(message) }
    }

    #[must_use]
    pub const fn timeout() -> Self {
        Self::new(CancelKind::Timeout)
    }

    #[must_use]
    pub const fn sibling_failed() -> Self {
        Self::new(CancelKind::FailFast)
    }

    #[must_use]
    pub const fn parent_cancelled() -> Self {
        Self::new(CancelKind::ParentCancelled)
    }

    #[must_use]
    pub const fn shutdown() -> Self {
        Self::new(CancelKind::Shutdown)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(m) => write!(f, "{} ({m})", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// A single poll slice when waiting out a deadline or a cancellation. Short
/// enough that a fail-fast cancellation is observed with negligible slack.
const POLL_SLICE: Duration = Duration::from_millis(15);

#[derive(Clone)]
pub(crate) struct GroupInfo {
    pub printer: Printer,
    pub prefix: String,
}

struct CxState {
    reason: Option<CancelReason>,
}

struct CxInner {
    state: Mutex<CxState>,
    condvar: Condvar,
    parent: Option<Cx>,
    deadline: Option<Instant>,
    group: Option<GroupInfo>,
}

/// A cooperative cancellation token, cheaply cloneable and shareable across
/// threads.
#[derive(Clone)]
pub struct Cx(std::sync::Arc<CxInner>);

impl Cx {
    /// Creates a fresh, uncancelled root token for one engine run.
    #[must_use]
    pub fn new_root() -> Self {
        Self(std::sync::Arc::new(CxInner {
            state: Mutex::new(CxState { reason: None }),
            condvar: Condvar::new(),
            parent: None,
            deadline: None,
            group: None,
        }))
    }

    fn derive(&self, deadline: Option<Instant>, group: Option<GroupInfo>) -> Self {
        Self(std::sync::Arc::new(CxInner {
            state: Mutex::new(CxState { reason: None }),
            condvar: Condvar::new(),
            parent: Some(self.clone()),
            deadline,
            group,
        }))
    }

    /// Derives a child token. Cancelling the child never affects `self`;
    /// cancelling `self` (or any of its ancestors) is always observed by the
    /// child.
    #[must_use]
    pub fn child(&self) -> Self {
        self.derive(None, None)
    }

    /// Derives a child token that additionally expires after `timeout`.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        self.derive(Some(Instant::now() + timeout), None)
    }

    /// Derives a child token carrying ambient output routing information
    /// (see `crate::output`), used for parallel-group branches.
    #[must_use]
    pub(crate) fn child_with_group(&self, printer: Printer, prefix: String) -> Self {
        self.derive(None, Some(GroupInfo { printer, prefix }))
    }

    pub(crate) fn group(&self) -> Option<GroupInfo> {
        self.0.group.clone()
    }

    /// Requests cancellation with `reason`. Returns `true` if this call set
    /// the reason (first cause wins); `false` if the token was already
    /// cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let mut state = self.0.state.lock();
        if state.reason.is_some() {
            return false;
        }
        state.reason = Some(reason);
        drop(state);
        self.0.condvar.notify_all();
        true
    }

    /// The cancellation reason in effect for this token, if any: its own, or
    /// else the nearest ancestor's, or else a timeout synthesized from an
    /// elapsed deadline.
    #[must_use]
    pub fn effective_reason(&self) -> Option<CancelReason> {
        if let Some(reason) = self.0.state.lock().reason.clone() {
            return Some(reason);
        }
        if let Some(deadline) = self.0.deadline {
            if Instant::now() >= deadline {
                return Some(CancelReason::timeout());
            }
        }
        self.0.parent.as_ref().and_then(Self::effective_reason)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.effective_reason().is_some()
    }

    /// A single cooperative check: `Err` if cancelled, carrying the reason.
    pub fn checkpoint(&self) -> Result<(), CancelReason> {
        match self.effective_reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Sleeps for `dur`, waking early (within [`POLL_SLICE`]) if cancelled.
    /// Bodies that want to respect timeouts and fail-fast cancellation
    /// during a long wait should call this instead of `std::thread::sleep`.
    pub fn sleep(&self, dur: Duration) -> Result<(), CancelReason> {
        let deadline = Instant::now() + dur;
        let mut guard = self.0.state.lock();
        loop {
            if let Some(reason) = guard.reason.clone() {
                return Err(reason);
            }
            drop(guard);
            if let Some(reason) = self.ancestor_or_timeout_reason() {
                return Err(reason);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let slice = (deadline - now).min(POLL_SLICE);
            guard = self.0.state.lock();
            self.0.condvar.wait_for(&mut guard, slice);
        }
    }

    fn ancestor_or_timeout_reason(&self) -> Option<CancelReason> {
        if let Some(deadline) = self.0.deadline {
            if Instant::now() >= deadline {
                return Some(CancelReason::timeout());
            }
        }
        self.0.parent.as_ref().and_then(Self::effective_reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let cx = Cx::new_root();
        assert!(!cx.is_cancelled());
    }

    #[test]
    fn cancel_is_first_cause_wins() {
        let cx = Cx::new_root();
        assert!(cx.cancel(CancelReason::user("first")));
        assert!(!cx.cancel(CancelReason::sibling_failed()));
        assert_eq!(cx.effective_reason().unwrap().kind, CancelKind::User);
    }

    #[test]
    fn child_observes_parent_cancellation() {
        let parent = Cx::new_root();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel(CancelReason::shutdown());
        assert!(child.is_cancelled());
        assert_eq!(child.effective_reason().unwrap().kind, CancelKind::Shutdown);
    }

    #[test]
    fn cancelling_a_child_does_not_cancel_parent() {
        let parent = Cx::new_root();
        let child = parent.child();
        child.cancel(CancelReason::sibling_failed());
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn timeout_is_observed_without_explicit_cancel() {
        let parent = Cx::new_root();
        let child = parent.child_with_timeout(Duration::from_millis(20));
        assert!(!child.is_cancelled());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(child.effective_reason().unwrap().kind, CancelKind::Timeout);
    }

    #[test]
    fn sleep_wakes_promptly_on_cancel() {
        let cx = Cx::new_root();
        let sleeper = cx.clone();
        let handle = std::thread::spawn(move || sleeper.sleep(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(10));
        cx.cancel(CancelReason::user("stop"));
        let result = handle.join().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn sleep_returns_ok_once_duration_elapses_uncancelled() {
        let cx = Cx::new_root();
        assert!(cx.sleep(Duration::from_millis(10)).is_ok());
    }
}
