//! claudecontrol: record and replay interactive terminal sessions.

mod cli;
mod commands;

use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use claudecontrol_core::error::Error;

use crate::cli::{Cli, Command};
use crate::commands::run::RunMode;

/// Exit code for CLI misuse.
const EXIT_USAGE: i32 = 64;

fn exit_code_for(err: &Error) -> i32 {
    match err {
        Error::TapeMiss(_) => 2,
        Error::Schema(_) | Error::Redaction { .. } => 3,
        Error::TapeIo { .. } | Error::TapeLock { .. } | Error::Io(_) => 4,
        Error::Config { .. } => EXIT_USAGE,
        _ => 1,
    }
}

fn init_logging(debug: bool, silent: bool) {
    let default = if silent {
        "error"
    } else if debug {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    init_logging(cli.debug, cli.silent);

    let outcome = match &cli.command {
        Command::Rec(args) => commands::run::run(RunMode::Rec, args).await.map(|()| 0),
        Command::Play(args) => commands::run::run(RunMode::Play, args).await.map(|()| 0),
        Command::Proxy(args) => commands::run::run(RunMode::Proxy, args).await.map(|()| 0),
        Command::Tapes(args) => commands::tapes::run(args),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(exit_code_for(&err));
        }
    }
}
