//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use claudecontrol_core::policy::{FallbackMode, RecordMode};

/// Record and replay interactive terminal sessions.
#[derive(Parser, Debug)]
#[command(name = "claudecontrol", version, about)]
pub struct Cli {
    /// Verbose debug logging.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Suppress everything except errors.
    #[arg(long, global = true)]
    pub silent: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record a live session (defaults: --record new, --fallback proxy).
    Rec(RunArgs),
    /// Replay from tapes without spawning the program (--record disabled).
    Play(RunArgs),
    /// Replay on hit, run and record live on miss (forces new/proxy).
    Proxy(RunArgs),
    /// Tape maintenance tools.
    Tapes(TapesArgs),
}

/// Shared flags for the session-driving subcommands.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Target program.
    pub program: String,

    /// Program arguments (use `--` before flags meant for the program).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Tapes directory.
    #[arg(long, default_value = "./tapes")]
    pub tapes: PathBuf,

    /// Record mode override: new|overwrite|disabled.
    #[arg(long)]
    pub record: Option<RecordMode>,

    /// Fallback mode override: not_found|proxy.
    #[arg(long)]
    pub fallback: Option<FallbackMode>,

    /// Prompt pattern (regex) bounding exchanges.
    #[arg(long)]
    pub expect: Option<String>,

    /// Replay latency: a constant (`50`) or a range (`10,80`) in ms.
    #[arg(long)]
    pub latency: Option<String>,

    /// Probability (0-100) of injecting a synthetic failure per chunk.
    #[arg(long = "error-rate", value_parser = clap::value_parser!(u8).range(0..=100))]
    pub error_rate: Option<u8>,

    /// Replay RNG seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print the new/unused tape summary on exit.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub summary: Option<bool>,

    /// Env keys admitted into match keys (comma separated).
    #[arg(long = "allow-env", value_delimiter = ',')]
    pub allow_env: Vec<String>,

    /// Env keys excluded from match keys (comma separated).
    #[arg(long = "ignore-env", value_delimiter = ',')]
    pub ignore_env: Vec<String>,

    /// Arguments excluded from match keys, by index or literal value;
    /// the sentinel `cwd` excludes the working directory.
    #[arg(long = "ignore-args", value_delimiter = ',')]
    pub ignore_args: Vec<String>,

    /// Ignore stdin when matching exchanges.
    #[arg(long = "ignore-stdin")]
    pub ignore_stdin: bool,

    /// Fixed tape name instead of the generated one.
    #[arg(long)]
    pub name: Option<String>,

    /// Expect timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,
}

#[derive(Args, Debug)]
pub struct TapesArgs {
    /// Tapes directory.
    #[arg(long, default_value = "./tapes")]
    pub tapes: PathBuf,

    #[command(subcommand)]
    pub command: TapesCommand,
}

#[derive(Subcommand, Debug)]
pub enum TapesCommand {
    /// List loaded tapes with program and exchange counts.
    List,
    /// Validate every tape against the schema.
    Validate {
        /// Also reject unknown top-level keys.
        #[arg(long)]
        strict: bool,
    },
    /// Apply secret redaction to stored tapes.
    Redact {
        /// Rewrite modified tapes in place (dry run otherwise).
        #[arg(long)]
        inplace: bool,
    },
    /// Structurally compare two tape files (exit 1 when they differ).
    Diff {
        a: PathBuf,
        b: PathBuf,
    },
}
