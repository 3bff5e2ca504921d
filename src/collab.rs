//! Boundary collaborators the engine depends on but does not implement:
//! content fingerprinting for cache checks, and filesystem watching for the
//! watch wrapper. Real implementations (hashing files matched by glob
//! patterns, inotify/FSEvents watching) live in the host program; this
//! crate only defines the seam and ships inert doubles for tests and for
//! targets that don't use caching or watching.

use std::path::Path;

use crate::cx::Cx;
use crate::error::EngineError;

/// Produces a "did the inputs change since last time" verdict for a
/// target's cache patterns, persisting whatever state it needs at
/// `state_file`.
pub trait ChecksumSource: Send + Sync {
    /// Returns `Ok(true)` if the body should run (inputs changed or no
    /// prior state exists), `Ok(false)` for a cache hit.
    fn changed(&self, patterns: &[String], state_file: &Path) -> Result<bool, EngineError>;
}

/// Runs `callback` once per detected change to `patterns`, for as long as
/// `cx` remains uncancelled.
pub trait Watcher: Send + Sync {
    fn watch(
        &self,
        cx: &Cx,
        patterns: &[String],
        callback: &mut dyn FnMut() -> Result<(), EngineError>,
    ) -> Result<(), EngineError>;
}

/// A [`ChecksumSource`] that always reports a change, so the body always
/// runs. The default for targets and runs that don't configure a real one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl ChecksumSource for NoCache {
    fn changed(&self, _patterns: &[String], _state_file: &Path) -> Result<bool, EngineError> {
        Ok(true)
    }
}

/// A [`Watcher`] that runs the callback exactly once and returns, without
/// actually watching anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatch;

impl Watcher for NoWatch {
    fn watch(
        &self,
        _cx: &Cx,
        _patterns: &[String],
        callback: &mut dyn FnMut() -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        callback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_cache_always_reports_changed() {
        let cache = NoCache;
        assert!(cache.changed(&["**/*.rs".to_string()], Path::new("/tmp/x")).unwrap());
    }

    #[test]
    fn no_watch_runs_callback_once() {
        let watcher = NoWatch;
        let cx = Cx::new_root();
        let mut calls = 0;
        watcher
            .watch(&cx, &[], &mut || {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 1);
    }
}
