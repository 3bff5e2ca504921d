//! Minimal demonstration front end: wires `clap`-parsed top-level flags
//! plus the engine's own override grammar to a handful of illustrative
//! targets. Real host programs register their own targets; this binary
//! exists to exercise the engine end to end, not as a production CLI.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use targ::{engine, print_line, targ, Backoff, RunOptions, Target};

/// A small, self-contained demonstration of the target execution engine.
#[derive(Parser, Debug)]
#[command(name = "targd", about = "Run one of a handful of demo targets", disable_help_flag = true)]
struct Cli {
    /// Everything after the program name is handed to the engine verbatim:
    /// its own overrides (--times, --retry, --watch, ...) plus the target
    /// name(s) to run.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,
}

fn demo_targets() -> Vec<Target> {
    let build = targ(|cx| {
        print_line(cx, "compiling...");
        Ok(())
    })
    .name("build")
    .description("compiles the project")
    .cache(["src/**/*.rs", "Cargo.toml"]);

    let test = targ(|cx| {
        print_line(cx, "running tests...");
        Ok(())
    })
    .name("test")
    .description("runs the test suite")
    .deps([build.clone()])
    .retry(true)
    .times(2)
    .backoff(Backoff::new(Duration::from_millis(200), 2.0));

    let lint = targ(|cx| {
        print_line(cx, "linting...");
        Ok(())
    })
    .name("lint")
    .description("runs the linter");

    vec![build, test, lint]
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let targets = demo_targets();

    let result = engine::run(
        &cli.rest,
        &targets,
        RunOptions { description: Some("demo target registry".to_string()), ..RunOptions::default() },
    );

    match result.outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
