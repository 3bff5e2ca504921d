//! Dependency tracker: at-most-once execution of targets within one
//! run, serial or parallel fan-out, `Deps(...)` usable both as a target's
//! declared dependency list and as an ad-hoc call from inside a body.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::collab::{ChecksumSource, Watcher};
use crate::cx::{CancelReason, Cx};
use crate::error::{EngineError, Outcome};
use crate::overrides::RuntimeOverrides;
use crate::target::{Target, TargetId};

struct InFlightSlot {
    resolved: Mutex<bool>,
    condvar: Condvar,
}

impl InFlightSlot {
    fn new() -> Self {
        Self { resolved: Mutex::new(false), condvar: Condvar::new() }
    }

    fn wait(&self) {
        let mut guard = self.resolved.lock();
        while !*guard {
            self.condvar.wait(&mut guard);
        }
    }

    fn resolve(&self) {
        *self.resolved.lock() = true;
        self.condvar.notify_all();
    }
}

struct TrackerState {
    done: HashMap<TargetId, Outcome>,
    in_flight: HashMap<TargetId, Arc<InFlightSlot>>,
}

/// Per-run state: which targets have already run (and with what outcome),
/// which are currently running, and the collaborators and root
/// cancellation token for this run.
pub struct DepTracker {
    ctx: Cx,
    state: Mutex<TrackerState>,
    checksum: Arc<dyn ChecksumSource>,
    watcher: Arc<dyn Watcher>,
    cache_dir: PathBuf,
    registry: Vec<Target>,
}

thread_local! {
    static ACTIVE: RefCell<Vec<Arc<DepTracker>>> = const { RefCell::new(Vec::new()) };
}

/// Pops the installed tracker from the current thread's ambient stack when
/// dropped.
pub struct ActiveGuard;

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl DepTracker {
    #[must_use]
    pub fn new(
        ctx: Cx,
        checksum: Arc<dyn ChecksumSource>,
        watcher: Arc<dyn Watcher>,
        cache_dir: PathBuf,
        registry: Vec<Target>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: Mutex::new(TrackerState { done: HashMap::new(), in_flight: HashMap::new() }),
            checksum,
            watcher,
            cache_dir,
            registry,
        })
    }

    #[must_use]
    pub fn ctx(&self) -> &Cx {
        &self.ctx
    }

    pub(crate) fn checksum(&self) -> &Arc<dyn ChecksumSource> {
        &self.checksum
    }

    pub(crate) fn watcher(&self) -> &Arc<dyn Watcher> {
        &self.watcher
    }

    pub(crate) fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    /// The full target registry this run was started with, used to resolve
    /// `--deps` override name strings to `Target`s.
    pub(crate) fn registry(&self) -> &[Target] {
        &self.registry
    }

    /// Installs `tracker` as this thread's active tracker for the lifetime
    /// of the returned guard. Every OS thread spawned for a dependency or a
    /// parallel branch must call this before invoking a target body, so
    /// nested `deps()` calls see the enclosing run.
    pub fn install(tracker: &Arc<DepTracker>) -> ActiveGuard {
        ACTIVE.with(|stack| stack.borrow_mut().push(Arc::clone(tracker)));
        ActiveGuard
    }

    #[must_use]
    pub fn active() -> Option<Arc<DepTracker>> {
        ACTIVE.with(|stack| stack.borrow().last().cloned())
    }

    /// Forgets every recorded outcome, so the next `run_one` call for any
    /// target executes it again instead of returning a cached result.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.done.clear();
        assert!(state.in_flight.is_empty(), "reset called while targets are still executing");
    }

    /// Runs `target` at most once for the lifetime of this tracker, caching
    /// (and sharing) its outcome with every other caller that asks for the
    /// same target.
    pub fn run_one(self: &Arc<Self>, cx: &Cx, target: &Target, overrides: &RuntimeOverrides) -> Outcome {
        let id = target.id();

        enum Decision {
            Done(Outcome),
            Wait(Arc<InFlightSlot>),
            Own,
        }

        let decision = {
            let mut state = self.state.lock();
            if let Some(outcome) = state.done.get(&id) {
                Decision::Done(outcome.clone())
            } else if let Some(slot) = state.in_flight.get(&id) {
                Decision::Wait(Arc::clone(slot))
            } else {
                state.in_flight.insert(id, Arc::new(InFlightSlot::new()));
                Decision::Own
            }
        };

        match decision {
            Decision::Done(outcome) => outcome,
            Decision::Wait(slot) => {
                slot.wait();
                self.state.lock().done.get(&id).cloned().unwrap_or_else(|| {
                    Err(Arc::new(EngineError::InvalidDependency(format!(
                        "{id} resolved without a recorded outcome"
                    ))))
                })
            }
            Decision::Own => {
                let outcome = crate::exec::execute_with_overrides(cx, overrides, target, self, None);
                let mut state = self.state.lock();
                state.done.insert(id, outcome.clone());
                let slot = state.in_flight.remove(&id).expect("in-flight slot present for owner");
                drop(state);
                slot.resolve();
                outcome
            }
        }
    }
}

/// Options for a `deps(...)` call: whether the listed targets run one after
/// another or fanned out across threads, whether a failure in one stops the
/// rest, and an optional narrower cancellation token.
#[derive(Clone, Default)]
pub struct DepsOpts {
    pub parallel: bool,
    pub continue_on_error: bool,
    pub with_context: Option<Cx>,
}

/// Runs `items` from inside a target body, using whichever [`DepTracker`]
/// is installed on the calling thread. Fails with
/// [`EngineError::NotDuringRun`] if none is installed.
pub fn deps(items: &[Target], opts: DepsOpts) -> Outcome {
    let tracker = DepTracker::active().ok_or_else(|| Arc::new(EngineError::NotDuringRun))?;
    let cx = opts.with_context.clone().unwrap_or_else(|| tracker.ctx().clone());
    run_items(&tracker, &cx, items, &opts)
}

/// Runs `items` (a target's declared dependency list, or an ad-hoc
/// `deps()` call's argument) under `tracker`, using `cx` as the root
/// cancellation token for this group.
pub(crate) fn run_items(tracker: &Arc<DepTracker>, cx: &Cx, items: &[Target], opts: &DepsOpts) -> Outcome {
    if opts.parallel {
        run_parallel(tracker, cx, items, opts.continue_on_error)
    } else {
        run_serial(tracker, cx, items, opts.continue_on_error)
    }
}

fn run_serial(tracker: &Arc<DepTracker>, cx: &Cx, items: &[Target], continue_on_error: bool) -> Outcome {
    let mut pending_failure: Option<Arc<EngineError>> = None;
    for item in items {
        // A prior captured failure under continue-on-error takes precedence
        // over a cancellation observed before the next item starts.
        if let Some(failure) = &pending_failure {
            if let Some(reason) = cx.effective_reason() {
                let _ = reason;
                return Err(Arc::clone(failure));
            }
        } else if let Some(reason) = cx.effective_reason() {
            return Err(Arc::new(EngineError::cancelled(reason)));
        }

        match tracker.run_one(cx, item, &RuntimeOverrides::default()) {
            Ok(()) => {}
            Err(e) => {
                if continue_on_error {
                    if pending_failure.is_none() {
                        pending_failure = Some(e);
                    }
                } else {
                    return Err(e);
                }
            }
        }
    }
    pending_failure.map_or(Ok(()), Err)
}

fn run_parallel(tracker: &Arc<DepTracker>, cx: &Cx, items: &[Target], continue_on_error: bool) -> Outcome {
    if items.is_empty() {
        return Ok(());
    }
    let child_ctx = if continue_on_error { cx.clone() } else { cx.child() };

    let handles: Vec<_> = items
        .iter()
        .cloned()
        .map(|item| {
            let tracker = Arc::clone(tracker);
            let branch_cx = child_ctx.clone();
            let fail_fast_ctx = child_ctx.clone();
            thread::spawn(move || {
                let _guard = DepTracker::install(&tracker);
                let outcome = tracker.run_one(&branch_cx, &item, &RuntimeOverrides::default());
                if !continue_on_error && outcome.is_err() {
                    fail_fast_ctx.cancel(CancelReason::sibling_failed());
                }
                outcome
            })
        })
        .collect();

    // First failure by enqueue order (ties broken by scheduler order).
    let mut first_failure = None;
    for handle in handles {
        let outcome = handle.join().unwrap_or_else(|_| {
            Err(Arc::new(EngineError::body_failure("<dependency>", "worker thread panicked")))
        });
        if first_failure.is_none() {
            if let Err(e) = outcome {
                first_failure = Some(e);
            }
        }
    }
    first_failure.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{NoCache, NoWatch};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn tracker() -> Arc<DepTracker> {
        DepTracker::new(Cx::new_root(), Arc::new(NoCache), Arc::new(NoWatch), PathBuf::from("/tmp"), Vec::new())
    }

    #[test]
    fn at_most_once_across_concurrent_callers() {
        let tracker = tracker();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let target = crate::target::targ(move |_cx| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            Ok(())
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let target = target.clone();
                thread::spawn(move || tracker.run_one(&Cx::new_root(), &target, &RuntimeOverrides::default()))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn serial_continue_on_error_keeps_the_first_failure() {
        let tracker = tracker();
        let a = crate::target::targ(|_cx| Err("boom".to_string())).name("a");
        let b = crate::target::targ(|_cx| Ok(())).name("b");
        let cx = Cx::new_root();
        let result = run_serial(&tracker, &cx, &[a, b], true);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("boom"));
    }

    #[test]
    fn parallel_fail_fast_cancels_siblings() {
        let tracker = tracker();
        let a = crate::target::targ(|_cx| Err("boom".to_string())).name("a");
        let b = crate::target::targ(|cx| cx.sleep(Duration::from_secs(5)).map_err(|e| e.to_string())).name("b");
        let cx = Cx::new_root();
        let result = run_parallel(&tracker, &cx, &[a, b], false);
        assert!(result.is_err());
    }
}
