//! The target model and its body: what gets run, and how.

use std::any::{Any, TypeId};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cx::Cx;
use crate::util::next_id;

/// Stable identity for a [`Target`], assigned once at construction and
/// unaffected by builder mutations or clones of the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(u64);

impl TargetId {
    fn new() -> Self {
        Self(next_id())
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target#{}", self.0)
    }
}

/// A shell-command body: spawned via `sh -c` for a raw command string, or
/// directly via `argv` when the program and its arguments are already
/// split.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
}

impl ShellSpec {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self { program: "sh".into(), args: vec!["-c".into(), command.into()], dir: None }
    }

    #[must_use]
    pub fn argv(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect(), dir: None }
    }

    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }
}

type PlainFn = dyn Fn(&Cx) -> Result<(), String> + Send + Sync;
type ArgFn = dyn Fn(&Cx, &(dyn Any + Send + Sync)) -> Result<(), String> + Send + Sync;

/// What a target actually does when invoked.
#[derive(Clone)]
pub enum Body {
    /// A closure taking only the cancellation token.
    Plain(Arc<PlainFn>),
    /// A closure taking the cancellation token and a bound argument value,
    /// whose runtime type must match `arg_type` (checked in
    /// `bind_and_invoke`; a mismatch or missing argument surfaces as
    /// [`crate::error::EngineError::Signature`]).
    Arg { call: Arc<ArgFn>, arg_type: TypeId, type_name: &'static str },
    /// A shell command.
    Shell(ShellSpec),
}

/// Trait converting ergonomic call-site values into a [`Body`]. Argument-
/// taking bodies are constructed through [`Target::with_arg`] instead, since
/// a single blanket `Fn(&Cx)` / `Fn(&Cx, &A)` pair of impls would overlap
/// under Rust's coherence rules.
pub trait IntoBody {
    fn into_body(self) -> Body;
}

impl<F> IntoBody for F
where
    F: Fn(&Cx) -> Result<(), String> + Send + Sync + 'static,
{
    fn into_body(self) -> Body {
        Body::Plain(Arc::new(self))
    }
}

impl IntoBody for ShellSpec {
    fn into_body(self) -> Body {
        Body::Shell(self)
    }
}

impl IntoBody for &str {
    fn into_body(self) -> Body {
        Body::Shell(ShellSpec::new(self))
    }
}

impl IntoBody for String {
    fn into_body(self) -> Body {
        Body::Shell(ShellSpec::new(self))
    }
}

/// How a target's declared dependency list is run: one after another, or
/// fanned out across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepMode {
    #[default]
    Serial,
    Parallel,
}

/// An item in a builder-level `.deps(...)` call: either a dependency target,
/// or a mode sentinel (the last one present wins).
pub enum DepArg {
    Target(Target),
    Mode(DepMode),
}

impl From<Target> for DepArg {
    fn from(t: Target) -> Self {
        Self::Target(t)
    }
}

impl From<DepMode> for DepArg {
    fn from(m: DepMode) -> Self {
        Self::Mode(m)
    }
}

/// Retry backoff schedule: `delay(attempt) = initial * multiplier^attempt`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, multiplier: f64) -> Self {
        Self { initial, multiplier }
    }

    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// A snapshot of the parts of a target's compile-time configuration that
/// the override engine checks for conflicts against CLI flags.
#[derive(Debug, Clone, Default)]
pub struct TargetConfig {
    pub watch_patterns: Vec<String>,
    pub cache_patterns: Vec<String>,
    pub watch_disabled: bool,
    pub cache_disabled: bool,
    pub has_deps: bool,
}

#[derive(Default)]
struct Fields {
    name: String,
    description: String,
    timeout: Option<Duration>,
    times: u32,
    retry: bool,
    backoff: Option<Backoff>,
    watch_patterns: Vec<String>,
    cache_patterns: Vec<String>,
    watch_disabled: bool,
    cache_disabled: bool,
    deps: Vec<Target>,
    dep_mode: DepMode,
    while_cmd: Option<String>,
}

struct TargetInner {
    id: TargetId,
    body: Body,
    fields: Mutex<Fields>,
}

/// A unit of work: a name, a body, and policy (timeout, retry, caching,
/// watch, dependencies). Cheap to clone; all clones share the same
/// identity and mutable fields.
#[derive(Clone)]
pub struct Target(Arc<TargetInner>);

/// Constructs a target from a plain closure or shell command.
#[must_use]
pub fn targ(body: impl IntoBody) -> Target {
    Target::new(body.into_body())
}

impl Target {
    fn new(body: Body) -> Self {
        let mut fields = Fields::default();
        fields.times = 1;
        Self(Arc::new(TargetInner { id: TargetId::new(), body, fields: Mutex::new(fields) }))
    }

    /// Constructs a target whose body additionally receives a bound
    /// argument of type `A`. The argument is supplied by the host program's
    /// own (out-of-scope) argument parser and threaded through
    /// `engine::run`.
    #[must_use]
    pub fn with_arg<A, F>(f: F) -> Self
    where
        A: Send + Sync + 'static,
        F: Fn(&Cx, &A) -> Result<(), String> + Send + Sync + 'static,
    {
        let call: Arc<ArgFn> = Arc::new(move |cx, value| {
            let Some(typed) = value.downcast_ref::<A>() else {
                return Err(format!("argument type mismatch for {}", std::any::type_name::<A>()));
            };
            f(cx, typed)
        });
        Self::new(Body::Arg { call, arg_type: TypeId::of::<A>(), type_name: std::any::type_name::<A>() })
    }

    #[must_use]
    pub fn id(&self) -> TargetId {
        self.0.id
    }

    pub(crate) fn body(&self) -> Body {
        self.0.body.clone()
    }

    #[must_use]
    pub fn name_value(&self) -> String {
        self.0.fields.lock().name.clone()
    }

    #[must_use]
    pub fn name(self, name: impl Into<String>) -> Self {
        self.0.fields.lock().name = name.into();
        self
    }

    #[must_use]
    pub fn description(self, description: impl Into<String>) -> Self {
        self.0.fields.lock().description = description.into();
        self
    }

    #[must_use]
    pub fn description_text(&self) -> String {
        self.0.fields.lock().description.clone()
    }

    #[must_use]
    pub fn timeout(self, timeout: Duration) -> Self {
        self.0.fields.lock().timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn timeout_value(&self) -> Option<Duration> {
        self.0.fields.lock().timeout
    }

    #[must_use]
    pub fn times(self, times: u32) -> Self {
        self.0.fields.lock().times = times;
        self
    }

    #[must_use]
    pub fn times_value(&self) -> u32 {
        self.0.fields.lock().times
    }

    #[must_use]
    pub fn retry(self, retry: bool) -> Self {
        self.0.fields.lock().retry = retry;
        self
    }

    #[must_use]
    pub fn retry_value(&self) -> bool {
        self.0.fields.lock().retry
    }

    #[must_use]
    pub fn backoff(self, backoff: Backoff) -> Self {
        self.0.fields.lock().backoff = Some(backoff);
        self
    }

    #[must_use]
    pub fn backoff_value(&self) -> Option<Backoff> {
        self.0.fields.lock().backoff
    }

    #[must_use]
    pub fn cache(self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.0.fields.lock().cache_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn cache_disabled(self, disabled: bool) -> Self {
        self.0.fields.lock().cache_disabled = disabled;
        self
    }

    #[must_use]
    pub fn watch(self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.0.fields.lock().watch_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn watch_disabled(self, disabled: bool) -> Self {
        self.0.fields.lock().watch_disabled = disabled;
        self
    }

    #[must_use]
    pub fn while_cmd(self, command: impl Into<String>) -> Self {
        self.0.fields.lock().while_cmd = Some(command.into());
        self
    }

    #[must_use]
    pub fn while_cmd_value(&self) -> Option<String> {
        self.0.fields.lock().while_cmd.clone()
    }

    /// Declares this target's dependency list, in order, plus an optional
    /// [`DepMode`] sentinel anywhere in the list (the last one wins).
    #[must_use]
    pub fn deps<I, T>(self, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<DepArg>,
    {
        let mut fields = self.0.fields.lock();
        let mut mode = fields.dep_mode;
        let mut list = Vec::new();
        for item in items {
            match item.into() {
                DepArg::Target(t) => list.push(t),
                DepArg::Mode(m) => mode = m,
            }
        }
        fields.deps = list;
        fields.dep_mode = mode;
        drop(fields);
        self
    }

    #[must_use]
    pub fn deps_list(&self) -> Vec<Target> {
        self.0.fields.lock().deps.clone()
    }

    #[must_use]
    pub fn dep_mode(&self) -> DepMode {
        self.0.fields.lock().dep_mode
    }

    #[must_use]
    pub fn cache_patterns(&self) -> Vec<String> {
        self.0.fields.lock().cache_patterns.clone()
    }

    #[must_use]
    pub fn watch_patterns(&self) -> Vec<String> {
        self.0.fields.lock().watch_patterns.clone()
    }

    #[must_use]
    pub fn config_snapshot(&self) -> TargetConfig {
        let fields = self.0.fields.lock();
        TargetConfig {
            watch_patterns: fields.watch_patterns.clone(),
            cache_patterns: fields.cache_patterns.clone(),
            watch_disabled: fields.watch_disabled,
            cache_disabled: fields.cache_disabled,
            has_deps: !fields.deps.is_empty(),
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target").field("id", &self.0.id).field("name", &self.name_value()).finish()
    }
}
