//! The parallel runner: fan-out over a list of top-level selected
//! targets, with per-branch lifecycle messages, fail-fast or
//! continue-on-error sibling cancellation, and an aggregate summary line.

use std::sync::Arc;
use std::thread;

use crate::cx::{CancelReason, Cx};
use crate::deps::DepTracker;
use crate::error::{EngineError, Outcome};
use crate::output::{self, Printer, SharedSink};
use crate::overrides::RuntimeOverrides;
use crate::target::Target;

const PRINTER_CAPACITY: usize = 32;

/// One branch's result, kept alongside its target name for reporting.
pub struct BranchOutcome {
    pub name: String,
    pub result: Outcome,
}

/// Aggregate result of a parallel group.
pub struct ParallelSummary {
    pub pass: usize,
    pub fail: usize,
    pub cancelled: usize,
    pub branches: Vec<BranchOutcome>,
}

impl ParallelSummary {
    #[must_use]
    pub fn summary_line(&self) -> String {
        format!("PASS:{} FAIL:{} CANCELLED:{}", self.pass, self.fail, self.cancelled)
    }

    /// The first branch failure by declaration order (ties broken by
    /// scheduler order), or `None` if every branch passed or was cancelled
    /// without itself failing.
    #[must_use]
    pub fn first_failure(&self) -> Option<Arc<EngineError>> {
        self.branches.iter().find_map(|b| b.result.as_ref().err().cloned())
    }
}

/// Runs every target in `group` concurrently, one thread per branch, tagging
/// each branch's output with a column-aligned `[name]` prefix written
/// through a single dedicated printer thread.
pub fn run_parallel(
    cx: &Cx,
    tracker: &Arc<DepTracker>,
    group: &[Target],
    overrides: &RuntimeOverrides,
    continue_on_error: bool,
    sink: SharedSink,
) -> ParallelSummary {
    if group.is_empty() {
        return ParallelSummary { pass: 0, fail: 0, cancelled: 0, branches: Vec::new() };
    }

    let max_name_len = group.iter().map(|t| t.name_value().len()).max().unwrap_or(0);
    let fail_fast_ctx = if continue_on_error { cx.clone() } else { cx.child() };
    let (printer, drain) = Printer::new(sink, PRINTER_CAPACITY);

    let handles: Vec<_> = group
        .iter()
        .cloned()
        .map(|target| {
            let tracker = Arc::clone(tracker);
            let overrides = overrides.clone();
            let prefix = output::prefix_for(&target.name_value(), max_name_len);
            let branch_cx = fail_fast_ctx.child_with_group(printer.clone(), prefix);
            let fail_fast_ctx = fail_fast_ctx.clone();
            thread::spawn(move || {
                run_branch(&branch_cx, &tracker, &target, &overrides, continue_on_error, &fail_fast_ctx)
            })
        })
        .collect();

    let branches: Vec<BranchOutcome> = handles
        .into_iter()
        .map(|h| {
            h.join().unwrap_or_else(|_| BranchOutcome {
                name: "<unknown>".to_string(),
                result: Err(Arc::new(EngineError::body_failure("<unknown>", "worker thread panicked"))),
            })
        })
        .collect();

    drop(printer);
    let _ = drain.join();

    let mut pass = 0;
    let mut fail = 0;
    let mut cancelled = 0;
    for branch in &branches {
        match &branch.result {
            Ok(()) => pass += 1,
            Err(e) if e.is_cancelled() => cancelled += 1,
            Err(_) => fail += 1,
        }
    }
    ParallelSummary { pass, fail, cancelled, branches }
}

fn run_branch(
    branch_cx: &Cx,
    tracker: &Arc<DepTracker>,
    target: &Target,
    overrides: &RuntimeOverrides,
    continue_on_error: bool,
    fail_fast_ctx: &Cx,
) -> BranchOutcome {
    let _guard = DepTracker::install(tracker);
    let name = target.name_value();
    output::print_line(branch_cx, &format!("[{name}] starting..."));
    let result = tracker.run_one(branch_cx, target, overrides);
    match &result {
        Ok(()) => output::print_line(branch_cx, &format!("[{name}] PASS")),
        Err(e) if e.is_cancelled() => output::print_line(branch_cx, &format!("[{name}] CANCELLED")),
        Err(e) => {
            output::print_line(branch_cx, &format!("[{name}] FAIL: {e}"));
            if !continue_on_error {
                fail_fast_ctx.cancel(CancelReason::sibling_failed());
            }
        }
    }
    BranchOutcome { name, result }
}
