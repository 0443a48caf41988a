//! `rec`, `play`, and `proxy`: drive a session from stdin.
//!
//! The caller's terminal is bridged line-wise: wait for the prompt, print
//! the output, forward the next stdin line. EOF on stdin closes the
//! session (and, live, lets the child exit within the grace period).

use std::io::{BufRead, Write};
use std::time::Duration;

use claudecontrol_core::child::ProcessSpawner;
use claudecontrol_core::error::{Error, Result};
use claudecontrol_core::keys::{IgnoreArg, KeyPolicy};
use claudecontrol_core::policy::{ErrorPolicy, FallbackMode, LatencyPolicy, RecordMode};
use claudecontrol_core::session::{Session, SessionConfig};
use claudecontrol_core::transport::{Pattern, PatternSet};

use crate::cli::RunArgs;

/// Which driving subcommand was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Rec,
    Play,
    Proxy,
}

fn parse_latency(value: &str) -> Result<LatencyPolicy> {
    let invalid = |reason: String| Error::Config {
        field: "latency",
        reason,
    };
    if let Some((lo, hi)) = value.split_once(',') {
        let lo = lo
            .trim()
            .parse::<u64>()
            .map_err(|err| invalid(err.to_string()))?;
        let hi = hi
            .trim()
            .parse::<u64>()
            .map_err(|err| invalid(err.to_string()))?;
        return Ok(LatencyPolicy::Range(lo, hi));
    }
    let ms = value
        .trim()
        .parse::<u64>()
        .map_err(|err| invalid(err.to_string()))?;
    Ok(LatencyPolicy::Const(ms))
}

fn session_config(mode: RunMode, args: &RunArgs) -> Result<SessionConfig> {
    let (record, fallback) = match mode {
        RunMode::Rec => (
            args.record.unwrap_or(RecordMode::New),
            args.fallback.unwrap_or(FallbackMode::Proxy),
        ),
        RunMode::Play => (
            RecordMode::Disabled,
            args.fallback.unwrap_or(FallbackMode::NotFound),
        ),
        RunMode::Proxy => (RecordMode::New, FallbackMode::Proxy),
    };

    let mut config = SessionConfig::new(&args.program);
    config.args = args.args.clone();
    config.env = std::env::vars().collect();
    config.tapes_root = args.tapes.clone();
    config.record = record;
    config.fallback = fallback;
    if let Some(latency) = &args.latency {
        config.latency = parse_latency(latency)?;
    }
    if let Some(rate) = args.error_rate {
        config.error_rate = ErrorPolicy::Const(rate);
    }
    config.seed = args.seed;
    config.summary = args.summary.unwrap_or(true);
    config.tape_name = args.name.clone();
    config.default_timeout = Duration::from_secs(args.timeout);
    // Env keys are noisy across shells, so by default none of them enter
    // the match key. `--allow-env` opts keys in; `--ignore-env` switches to
    // the everything-except mode.
    let allow_env = if !args.allow_env.is_empty() {
        Some(args.allow_env.iter().cloned().collect())
    } else if !args.ignore_env.is_empty() {
        None
    } else {
        Some(Default::default())
    };
    config.key_policy = KeyPolicy {
        allow_env,
        ignore_env: args.ignore_env.iter().cloned().collect(),
        ignore_args: args
            .ignore_args
            .iter()
            .map(|arg| {
                arg.parse::<IgnoreArg>()
                    .unwrap_or_else(|_| IgnoreArg::Value(arg.clone()))
            })
            .collect(),
        ignore_stdin: args.ignore_stdin,
        command_matcher: None,
        stdin_matcher: None,
    };
    Ok(config)
}

fn prompt_patterns(args: &RunArgs) -> Result<PatternSet> {
    match &args.expect {
        Some(pattern) => Ok(PatternSet(vec![
            Pattern::regex(pattern)?,
            Pattern::Eof,
        ])),
        None => Ok(PatternSet(vec![Pattern::Eof, Pattern::Timeout])),
    }
}

/// Run one driving subcommand to completion.
pub async fn run(mode: RunMode, args: &RunArgs) -> Result<()> {
    let config = session_config(mode, args)?;
    let patterns = prompt_patterns(args)?;
    let mut session = Session::start(config, ProcessSpawner)?;

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    let mut stdout = std::io::stdout();

    let result = loop {
        match session.expect(&patterns, None).await {
            Ok(index) => {
                stdout.write_all(session.before())?;
                stdout.write_all(session.last_match())?;
                stdout.flush()?;
                if matches!(patterns.0.get(index), Some(Pattern::Eof)) {
                    break Ok(());
                }
            }
            Err(err) => break Err(err),
        }

        match lines.next() {
            Some(line) => {
                let line = line?;
                if let Err(err) = session.sendline(&line).await {
                    break Err(err);
                }
            }
            None => break Ok(()),
        }
    };

    let close_result = session.close().await;
    result.and(close_result)
}
