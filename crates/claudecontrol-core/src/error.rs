//! Error types for the record/replay engine.
//!
//! One variant per failure kind the engine can surface. Normalization and
//! policy resolution are infallible by design; decorator failures are
//! downgraded to warnings at the call site and never reach callers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::keys::KeyComponents;

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// No recorded exchange matches the current input.
    #[error("{0}")]
    TapeMiss(Box<TapeMissReport>),

    /// An I/O operation on a tape file failed.
    #[error("tape {op} failed for {}", path.display())]
    TapeIo {
        /// Tape file the operation targeted.
        path: PathBuf,
        /// Short operation name ("read", "write", "rename", ...).
        op: &'static str,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The per-path advisory lock could not be acquired within the retry budget.
    #[error("could not lock tape {} for writing", path.display())]
    TapeLock {
        /// Tape file whose lock acquisition failed.
        path: PathBuf,
    },

    /// A tape failed schema validation.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Secret redaction could not be applied safely; the write was aborted.
    #[error("redaction failed for {}: {reason}", path.display())]
    Redaction {
        /// Tape file whose write was aborted.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },

    /// An `expect` call ran out of time before any pattern matched.
    #[error("timed out waiting for expected output")]
    ExpectTimeout {
        /// Snapshot of the most recent output lines (at most 50).
        recent_output: String,
    },

    /// A synthetic fault was injected into an in-flight replay.
    #[error("injected fault while replaying exchange {at_exchange}")]
    Injected {
        /// Zero-based ordinal of the exchange within the session.
        at_exchange: usize,
    },

    /// A decorator hook failed. Non-fatal; callers downgrade to a warning.
    #[error("decorator {name} failed: {reason}")]
    Decorator {
        /// Decorator stage name ("input", "output", "tape").
        name: &'static str,
        /// Human-readable cause.
        reason: String,
    },

    /// The session was closed while an operation was in flight.
    #[error("operation cancelled by session close")]
    Cancelled,

    /// A configuration field failed validation.
    #[error("invalid configuration for `{field}`: {reason}")]
    Config {
        /// Offending field name.
        field: &'static str,
        /// Human-readable cause.
        reason: String,
    },

    /// The live child process is gone or was never spawned.
    #[error("child process is not running")]
    ChildGone,

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A schema violation found while decoding or validating a tape.
///
/// `path` is a JSON-ish pointer into the document (`exchanges[2].input`),
/// not a filesystem path; store-level APIs pair it with the file it came
/// from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {reason}")]
pub struct SchemaError {
    /// Location within the tape document.
    pub path: String,
    /// What was wrong there.
    pub reason: String,
}

impl SchemaError {
    /// Build a schema error for a document location.
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Diagnostic payload carried by [`Error::TapeMiss`].
///
/// Shows the key components the caller presented next to the closest stored
/// candidates so a user can see which field diverged.
#[derive(Debug, Clone)]
pub struct TapeMissReport {
    /// Components of the key built from the live context.
    pub wanted: KeyComponents,
    /// Closest stored keys by Hamming distance in hash space (at most 3).
    pub nearest: Vec<NearMiss>,
}

/// One close-but-not-matching stored exchange.
#[derive(Debug, Clone)]
pub struct NearMiss {
    /// Components of the stored key.
    pub components: KeyComponents,
    /// Hamming distance between the stored and wanted 128-bit keys.
    pub distance: u32,
    /// Tape file the candidate lives in.
    pub path: PathBuf,
    /// Exchange index within that tape.
    pub exchange: usize,
}

impl std::fmt::Display for TapeMissReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no tape matches {}", self.wanted)?;
        if self.nearest.is_empty() {
            return write!(f, " (no stored exchanges to compare against)");
        }
        for near in &self.nearest {
            write!(
                f,
                "\n  nearest (distance {}): {} [{}#{}]",
                near.distance,
                near.components,
                near.path.display(),
                near.exchange,
            )?;
            for line in self.wanted.diff(&near.components) {
                write!(f, "\n    {line}")?;
            }
        }
        Ok(())
    }
}

impl Error {
    /// True when this error came from a tape miss.
    #[must_use]
    pub fn is_tape_miss(&self) -> bool {
        matches!(self, Self::TapeMiss(_))
    }
}
