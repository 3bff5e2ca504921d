//! The executor: conflict check, declared-dependency resolution, cache
//! check, iteration/backoff/timeout loop, and the watch wrapper, around a
//! single target's body invocation.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cx::Cx;
use crate::deps::{self, DepTracker, DepsOpts};
use crate::error::{EngineError, Outcome};
use crate::overrides::{self, RuntimeOverrides};
use crate::target::{Body, DepMode, Target};

fn iteration_count(overrides: &RuntimeOverrides, target: &Target) -> u32 {
    let times = overrides.times.unwrap_or_else(|| target.times_value());
    times.max(1)
}

fn invoke_body(cx: &Cx, target: &Target, arg: Option<&(dyn Any + Send + Sync)>) -> Result<(), EngineError> {
    match target.body() {
        Body::Plain(f) => f(cx).map_err(|m| EngineError::body_failure(target.name_value(), m)),
        Body::Arg { call, arg_type, type_name } => {
            let Some(value) = arg else {
                return Err(EngineError::Signature(format!(
                    "{} requires an argument of type {type_name} but none was bound",
                    target.name_value()
                )));
            };
            if value.type_id() != arg_type {
                return Err(EngineError::Signature(format!(
                    "{} expected an argument of type {type_name}",
                    target.name_value()
                )));
            }
            call(cx, value).map_err(|m| EngineError::body_failure(target.name_value(), m))
        }
        Body::Shell(spec) => run_shell(cx, &spec).map_err(|m| EngineError::body_failure(target.name_value(), m)),
    }
}

fn run_shell(cx: &Cx, spec: &crate::target::ShellSpec) -> Result<(), String> {
    let mut command = std::process::Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(dir) = &spec.dir {
        command.current_dir(dir);
    }
    let mut child = command.spawn().map_err(|e| format!("failed to spawn {}: {e}", spec.program))?;
    loop {
        if let Some(status) = child.try_wait().map_err(|e| e.to_string())? {
            return if status.success() { Ok(()) } else { Err(format!("exited with {status}")) };
        }
        if let Some(reason) = cx.effective_reason() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(format!("killed: {reason}"));
        }
        std::thread::sleep(Duration::from_millis(15));
    }
}

fn run_predicate(cx: &Cx, command: &str) -> bool {
    run_shell(cx, &crate::target::ShellSpec::new(command)).is_ok()
}

fn cache_state_path(default_cache_dir: &PathBuf, overrides: &RuntimeOverrides, target: &Target) -> PathBuf {
    let dir = overrides.cache_dir.as_ref().map_or_else(|| default_cache_dir.clone(), PathBuf::from);
    dir.join(format!("{}.sum", target.name_value()))
}

/// Runs `target`'s body under `overrides`, applying its full policy stack:
/// conflict check, declared-dependency resolution, while-predicate,
/// cache-hit short circuit, retry/backoff/iteration, and watch wrapping.
/// `arg` is the argument bound to this invocation (only ever `Some` for the
/// single top-level target explicitly selected from the command line;
/// dependency and parallel-sibling invocations always pass `None`).
pub fn execute_with_overrides(
    cx: &Cx,
    overrides: &RuntimeOverrides,
    target: &Target,
    tracker: &Arc<DepTracker>,
    arg: Option<&(dyn Any + Send + Sync)>,
) -> Outcome {
    overrides::check_conflict(overrides, &target.config_snapshot()).map_err(Arc::new)?;

    let dep_mode = overrides.dep_mode.unwrap_or_else(|| target.dep_mode());
    let declared_deps = if overrides.deps.is_empty() {
        target.deps_list()
    } else {
        resolve_named_deps(tracker, &overrides.deps).map_err(Arc::new)?
    };
    if !declared_deps.is_empty() {
        let dep_opts =
            DepsOpts { parallel: dep_mode == DepMode::Parallel, continue_on_error: false, with_context: None };
        deps::run_items(tracker, cx, &declared_deps, &dep_opts)?;
    }

    let cache_patterns = if overrides.cache.is_empty() { target.cache_patterns() } else { overrides.cache.clone() };
    let watch_patterns = if overrides.watch.is_empty() { target.watch_patterns() } else { overrides.watch.clone() };
    let times = iteration_count(overrides, target);
    let retry = overrides.retry || target.retry_value();
    let backoff = overrides.backoff.or_else(|| target.backoff_value());
    let while_cmd = overrides.while_cmd.clone().or_else(|| target.while_cmd_value());
    let cache_path = cache_state_path(tracker.cache_dir(), overrides, target);
    let body_cx = target.timeout_value().map_or_else(|| cx.clone(), |timeout| cx.child_with_timeout(timeout));

    let run_body_with_retries = || -> Outcome {
        let mut last_failure: Option<Arc<EngineError>> = None;
        for attempt in 0..times {
            if let Some(command) = &while_cmd {
                if !run_predicate(&body_cx, command) {
                    return last_failure.map_or(Ok(()), Err);
                }
            }

            if let Some(reason) = body_cx.effective_reason() {
                return Err(last_failure.unwrap_or_else(|| Arc::new(EngineError::cancelled(reason))));
            }

            if !cache_patterns.is_empty() {
                match tracker.checksum().changed(&cache_patterns, &cache_path) {
                    Ok(false) => {
                        tracing::info!(target = %target.name_value(), "cache hit, skipping body");
                        return Ok(());
                    }
                    Ok(true) => {}
                    Err(e) => return Err(Arc::new(e)),
                }
            }

            tracing::info!(target = %target.name_value(), attempt, "invoking body");
            match invoke_body(&body_cx, target, arg) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let e = Arc::new(e);
                    last_failure = Some(Arc::clone(&e));
                    if !retry {
                        return Err(e);
                    }
                    if attempt + 1 < times {
                        let delay = backoff.map_or(Duration::ZERO, |b| b.delay_for(attempt));
                        if let Err(reason) = body_cx.sleep(delay) {
                            return Err(Arc::new(EngineError::cancelled_during_backoff(reason)));
                        }
                    }
                }
            }
        }
        last_failure.map_or(Ok(()), Err)
    };

    if watch_patterns.is_empty() {
        return run_body_with_retries();
    }

    let first = run_body_with_retries();
    if first.is_err() {
        return first;
    }

    let mut callback = || -> Result<(), EngineError> { run_body_with_retries().map_err(|e| (*e).clone()) };
    tracker.watcher().watch(&body_cx, &watch_patterns, &mut callback).map_err(Arc::new)
}

/// Resolves `--deps` override name strings against the run's target
/// registry, for a target that accepts CLI-supplied dependencies in place
/// of its own (empty) declared list.
fn resolve_named_deps(tracker: &Arc<DepTracker>, names: &[String]) -> Result<Vec<Target>, EngineError> {
    let mut resolved = Vec::with_capacity(names.len());
    for name in names {
        let dep = tracker
            .registry()
            .iter()
            .find(|t| &t.name_value() == name)
            .cloned()
            .ok_or_else(|| EngineError::InvalidDependency(format!("unknown dependency target \"{name}\"")))?;
        resolved.push(dep);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{NoCache, NoWatch};
    use crate::cx::Cx;
    use crate::deps::DepTracker;
    use crate::target::targ;

    fn tracker() -> Arc<DepTracker> {
        DepTracker::new(Cx::new_root(), Arc::new(NoCache), Arc::new(NoWatch), PathBuf::from("/tmp"), Vec::new())
    }

    #[test]
    fn iteration_count_clamps_zero_to_one() {
        let target = targ(|_cx| Ok(()));
        let overrides = RuntimeOverrides { times: Some(0), ..Default::default() };
        assert_eq!(iteration_count(&overrides, &target), 1);
    }

    #[test]
    fn retry_exhausts_all_attempts_then_surfaces_last_failure() {
        let tracker = tracker();
        let cx = Cx::new_root();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let target = targ(move |_cx| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err("boom".to_string())
        })
        .name("flaky")
        .retry(true)
        .times(3)
        .backoff(crate::target::Backoff::new(Duration::from_millis(1), 1.0));
        let overrides = RuntimeOverrides::default();
        let result = execute_with_overrides(&cx, &overrides, &target, &tracker, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("boom"));
    }

    #[test]
    fn without_retry_first_failure_returns_immediately() {
        let tracker = tracker();
        let cx = Cx::new_root();
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let target = targ(move |_cx| {
            attempts_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err("nope".to_string())
        })
        .times(5);
        let overrides = RuntimeOverrides::default();
        let result = execute_with_overrides(&cx, &overrides, &target, &tracker, None);
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn conflict_is_checked_before_the_body_ever_runs() {
        let tracker = tracker();
        let cx = Cx::new_root();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let target = targ(move |_cx| {
            ran_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .cache(["Cargo.lock"]);
        let overrides = RuntimeOverrides { cache: vec!["src/**".into()], ..Default::default() };
        let result = execute_with_overrides(&cx, &overrides, &target, &tracker, None);
        assert!(result.is_err());
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn cache_hit_short_circuits_the_body() {
        struct AlwaysCached;
        impl crate::collab::ChecksumSource for AlwaysCached {
            fn changed(&self, _patterns: &[String], _state_file: &std::path::Path) -> Result<bool, EngineError> {
                Ok(false)
            }
        }
        let tracker =
            DepTracker::new(Cx::new_root(), Arc::new(AlwaysCached), Arc::new(NoWatch), PathBuf::from("/tmp"), Vec::new());
        let cx = Cx::new_root();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let target = targ(move |_cx| {
            ran_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .cache(["src/**"]);
        let overrides = RuntimeOverrides::default();
        let result = execute_with_overrides(&cx, &overrides, &target, &tracker, None);
        assert!(result.is_ok());
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn cancellation_during_backoff_is_reported_as_such() {
        let tracker = tracker();
        let cx = Cx::new_root();
        let target = targ(|_cx| Err("boom".to_string()))
            .retry(true)
            .times(3)
            .backoff(crate::target::Backoff::new(Duration::from_secs(5), 1.0));
        let cx_for_cancel = cx.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cx_for_cancel.cancel(crate::cx::CancelReason::user("stop"));
        });
        let overrides = RuntimeOverrides::default();
        let result = execute_with_overrides(&cx, &overrides, &target, &tracker, None);
        handle.join().unwrap();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cancelled during backoff"));
    }
}
