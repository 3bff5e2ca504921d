//! Override engine: a hand-rolled grammar for the engine's own CLI
//! flags, plus the conflict policy checked against a target's compile-time
//! configuration.
//!
//! The grammar is bespoke enough (a position-sensitive `--parallel`/`-p`,
//! a variadic `--deps` that terminates at the next flag) that a declarative
//! parser doesn't fit well; everything else in the engine that wants a
//! real flag parser (the demonstration binary's own outer flags) reaches
//! for `clap` instead.

use crate::error::EngineError;
use crate::target::{Backoff, DepMode, TargetConfig};

/// The overrides recognized from the engine's own slice of `argv`, plus
/// whatever didn't parse as one of those flags (handed back to the host
/// program, which is expected to pass it on to its own argument parser).
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub times: Option<u32>,
    pub retry: bool,
    pub watch: Vec<String>,
    pub cache: Vec<String>,
    pub cache_dir: Option<String>,
    pub backoff: Option<Backoff>,
    pub dep_mode: Option<DepMode>,
    pub while_cmd: Option<String>,
    pub deps: Vec<String>,
    pub parallel: bool,
    pub help: bool,
}

fn is_flag(token: &str) -> bool {
    token.starts_with('-') && token != "-"
}

fn flag_name(token: &str) -> &str {
    token.split('=').next().unwrap_or(token)
}

fn inline_value(token: &str) -> Option<&str> {
    token.split_once('=').map(|(_, v)| v)
}

/// Parses the engine's recognized flags out of `argv`, returning the
/// collected overrides and every token that wasn't consumed (in original
/// order), for the host program's own parser to handle.
pub fn parse(argv: &[String]) -> Result<(RuntimeOverrides, Vec<String>), EngineError> {
    let mut overrides = RuntimeOverrides::default();
    let mut remaining = Vec::new();
    let mut seen_positional = false;

    let mut i = 0;
    while i < argv.len() {
        let token = argv[i].as_str();

        if !is_flag(token) {
            seen_positional = true;
            remaining.push(token.to_string());
            i += 1;
            continue;
        }

        let name = flag_name(token);
        let mut take_value = |i: &mut usize| -> Result<String, EngineError> {
            if let Some(v) = inline_value(token) {
                return Ok(v.to_string());
            }
            *i += 1;
            argv.get(*i)
                .cloned()
                .ok_or_else(|| EngineError::Parse(format!("{name} requires a value")))
        };

        match name {
            "--times" => {
                let value = take_value(&mut i)?;
                overrides.times = Some(
                    value
                        .parse()
                        .map_err(|_| EngineError::Parse(format!("--times expects an integer, got \"{value}\"")))?,
                );
            }
            "--retry" => overrides.retry = true,
            "--watch" => overrides.watch.push(take_value(&mut i)?),
            "--cache" => overrides.cache.push(take_value(&mut i)?),
            "--cache-dir" => overrides.cache_dir = Some(take_value(&mut i)?),
            "--backoff" => overrides.backoff = Some(parse_backoff(&take_value(&mut i)?)?),
            "--dep-mode" => overrides.dep_mode = Some(parse_dep_mode(&take_value(&mut i)?)?),
            "--while" => overrides.while_cmd = Some(take_value(&mut i)?),
            "--deps" => {
                i += 1;
                while i < argv.len() && !is_flag(argv[i].as_str()) && argv[i] != "--" {
                    overrides.deps.push(argv[i].clone());
                    i += 1;
                }
                continue;
            }
            "--parallel" | "-p" if !seen_positional => overrides.parallel = true,
            "--help" | "-h" => overrides.help = true,
            _ => remaining.push(token.to_string()),
        }
        i += 1;
    }

    Ok((overrides, remaining))
}

fn parse_dep_mode(value: &str) -> Result<DepMode, EngineError> {
    match value {
        "serial" => Ok(DepMode::Serial),
        "parallel" => Ok(DepMode::Parallel),
        other => Err(EngineError::Parse(format!("--dep-mode expects \"serial\" or \"parallel\", got \"{other}\""))),
    }
}

/// Parses a `<duration><unit>,<multiplier>` backoff spec, e.g. `10ms,2` or
/// `1s,1.5`. Supported units: `ms`, `s`.
fn parse_backoff(value: &str) -> Result<Backoff, EngineError> {
    let (duration_part, multiplier_part) = value
        .split_once(',')
        .ok_or_else(|| EngineError::Parse(format!("--backoff expects \"<duration>,<multiplier>\", got \"{value}\"")))?;

    let duration = parse_duration(duration_part)
        .ok_or_else(|| EngineError::Parse(format!("--backoff: invalid duration \"{duration_part}\"")))?;
    let multiplier: f64 = multiplier_part
        .parse()
        .map_err(|_| EngineError::Parse(format!("--backoff: invalid multiplier \"{multiplier_part}\"")))?;

    Ok(Backoff::new(duration, multiplier))
}

fn parse_duration(text: &str) -> Option<std::time::Duration> {
    if let Some(ms) = text.strip_suffix("ms") {
        let millis: f64 = ms.parse().ok()?;
        return Some(std::time::Duration::from_secs_f64(millis / 1000.0));
    }
    if let Some(s) = text.strip_suffix('s') {
        let secs: f64 = s.parse().ok()?;
        return Some(std::time::Duration::from_secs_f64(secs));
    }
    None
}

/// Checks `overrides` against a target's compile-time configuration,
/// failing before the body ever runs if they collide: a CLI override and a
/// target-defined value for the same concern are both present, and the
/// target hasn't opted out of its own value via `*_disabled`.
pub fn check_conflict(overrides: &RuntimeOverrides, config: &TargetConfig) -> Result<(), EngineError> {
    if !overrides.watch.is_empty() && !config.watch_patterns.is_empty() && !config.watch_disabled {
        return Err(EngineError::Conflict(
            "--watch conflicts with target-defined watch patterns; disable them on the target or drop --watch"
                .to_string(),
        ));
    }
    if !overrides.cache.is_empty() && !config.cache_patterns.is_empty() && !config.cache_disabled {
        return Err(EngineError::Conflict(
            "--cache conflicts with target-defined cache patterns; disable them on the target or drop --cache"
                .to_string(),
        ));
    }
    if !overrides.deps.is_empty() && config.has_deps {
        return Err(EngineError::Conflict(
            "--deps conflicts with target-defined dependencies; define dependencies in one place".to_string(),
        ));
    }
    Ok(())
}
