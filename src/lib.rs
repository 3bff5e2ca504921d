//! A dependency-aware build/task execution engine embedded in a host
//! program: targets declare what they depend on and how they should be
//! retried, cached, watched, and timed out; the engine resolves the
//! dependency graph at most once per run and fans out independent work
//! across OS threads.
//!
//! This crate has no implicit concurrency runtime: parallelism is plain
//! `std::thread` fan-out over shared, lock-guarded state, and cancellation
//! is cooperative (see [`cx::Cx`]).

pub mod collab;
pub mod cx;
pub mod deps;
pub mod engine;
pub mod error;
pub mod exec;
pub mod output;
pub mod overrides;
pub mod parallel;
pub mod target;
mod util;

pub use cx::{CancelKind, CancelReason, Cx};
pub use deps::{deps, DepTracker, DepsOpts};
pub use engine::{run, ExecuteResult, RunOptions};
pub use error::{EngineError, Outcome};
pub use output::print_line;
pub use overrides::RuntimeOverrides;
pub use target::{targ, Backoff, Body, DepArg, DepMode, ShellSpec, Target, TargetConfig, TargetId};
