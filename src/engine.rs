//! Entry point: parses the engine's own CLI overrides, resolves the
//! selected target(s), installs per-run ambient state, and dispatches to
//! the serial path or the parallel runner.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use crate::collab::{ChecksumSource, NoCache, NoWatch, Watcher};
use crate::cx::Cx;
use crate::deps::DepTracker;
use crate::error::{EngineError, Outcome};
use crate::output::{self, stdout_sink, SharedSink};
use crate::overrides;
use crate::parallel;
use crate::target::Target;

/// Everything the host program configures about one `engine::run` call
/// beyond the target registry and `argv` itself.
pub struct RunOptions {
    /// Selects a designated "default" target when no target name is given
    /// on the command line.
    pub allow_default: bool,
    /// If set, `run` renders a help listing instead of executing anything.
    pub help_only: bool,
    pub description: Option<String>,
    pub repo_url: Option<String>,
    pub examples: Vec<String>,
    /// Where the top-level serial path and the parallel summary line are
    /// written. Parallel branch output goes through this too, via the
    /// group printer.
    pub stdout: SharedSink,
    pub checksum: Arc<dyn ChecksumSource>,
    pub watcher: Arc<dyn Watcher>,
    pub default_cache_dir: PathBuf,
    /// The argument bound to the single top-level selected target, if any
    /// (see `target::Target::with_arg`). Binding the raw command-line
    /// tokens into this value is the host program's job; the engine only
    /// matches its runtime type against what the target's body expects.
    pub arg: Option<Box<dyn Any + Send + Sync>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            allow_default: false,
            help_only: false,
            description: None,
            repo_url: None,
            examples: Vec::new(),
            stdout: stdout_sink(),
            checksum: Arc::new(NoCache),
            watcher: Arc::new(NoWatch),
            default_cache_dir: PathBuf::from(".targ-cache"),
            arg: None,
        }
    }
}

/// What `engine::run` returns: the overall outcome. A parallel run's
/// overall outcome is its first failure, if any.
pub struct ExecuteResult {
    pub outcome: Outcome,
}

fn resolve_selection(
    targets: &[Target],
    names: &[String],
    allow_default: bool,
) -> Result<Vec<Target>, EngineError> {
    if names.is_empty() {
        if allow_default {
            return targets
                .iter()
                .find(|t| t.name_value() == "default")
                .cloned()
                .map(|t| vec![t])
                .ok_or_else(|| {
                    EngineError::Parse("no target specified and no \"default\" target is registered".to_string())
                });
        }
        return Err(EngineError::Parse("no target specified".to_string()));
    }
    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        let target = targets
            .iter()
            .find(|t| &t.name_value() == name)
            .cloned()
            .ok_or_else(|| EngineError::Parse(format!("unknown target \"{name}\"")))?;
        selected.push(target);
    }
    Ok(selected)
}

fn render_help(targets: &[Target], opts: &RunOptions) -> String {
    let mut out = String::new();
    if let Some(description) = &opts.description {
        out.push_str(description);
        out.push('\n');
    }
    if let Some(url) = &opts.repo_url {
        out.push_str(url);
        out.push('\n');
    }
    out.push_str("targets:\n");
    for target in targets {
        let description = target.description_text();
        if description.is_empty() {
            out.push_str(&format!("  {}\n", target.name_value()));
        } else {
            out.push_str(&format!("  {} - {description}\n", target.name_value()));
        }
    }
    for example in &opts.examples {
        out.push_str(example);
        out.push('\n');
    }
    out
}

/// Runs one of `targets`, selected by the first non-flag token(s) in
/// `argv`, applying any recognized engine overrides parsed out of `argv`
/// first.
pub fn run(argv: &[String], targets: &[Target], opts: RunOptions) -> ExecuteResult {
    let (overrides, remaining) = match overrides::parse(argv) {
        Ok(v) => v,
        Err(e) => return ExecuteResult { outcome: Err(Arc::new(e)) },
    };

    if opts.help_only || overrides.help {
        let mut sink = opts.stdout.lock();
        use std::io::Write as _;
        let _ = write!(sink, "{}", render_help(targets, &opts));
        drop(sink);
        return ExecuteResult { outcome: Ok(()) };
    }

    let selected_names: Vec<String> = remaining.into_iter().filter(|a| !a.starts_with('-')).collect();
    let selection = match resolve_selection(targets, &selected_names, opts.allow_default) {
        Ok(s) => s,
        Err(e) => return ExecuteResult { outcome: Err(Arc::new(e)) },
    };

    let root_cx = Cx::new_root();
    let tracker = DepTracker::new(
        root_cx.clone(),
        Arc::clone(&opts.checksum),
        Arc::clone(&opts.watcher),
        opts.default_cache_dir.clone(),
        targets.to_vec(),
    );
    let _tracker_guard = DepTracker::install(&tracker);
    let _sink_guard = output::install_default_sink(Arc::clone(&opts.stdout));

    let outcome = if overrides.parallel {
        let summary = parallel::run_parallel(&root_cx, &tracker, &selection, &overrides, false, Arc::clone(&opts.stdout));
        {
            use std::io::Write as _;
            let mut sink = opts.stdout.lock();
            let _ = writeln!(sink, "{}", summary.summary_line());
        }
        summary.first_failure().map_or(Ok(()), Err)
    } else {
        let mut outcome = Ok(());
        for target in &selection {
            outcome = crate::exec::execute_with_overrides(
                &root_cx,
                &overrides,
                target,
                &tracker,
                opts.arg.as_deref(),
            );
            if outcome.is_err() {
                break;
            }
        }
        outcome
    };

    ExecuteResult { outcome }
}
