//! claudecontrol-core: deterministic record/replay for terminal sessions.
//!
//! This crate captures "tapes" of interactive command-line sessions and
//! replays them against callers that expect to drive a live program.
//!
//! # Architecture
//!
//! ```text
//! Session Facade ─┬─ Live child ── Recorder ── ChunkSink ─┐
//!                 │                                       ├── Tape Store ── *.json5
//!                 └─ Replay Transport ── latency/faults ──┘
//! ```
//!
//! # Modules
//!
//! - `normalize`: ANSI stripping, whitespace collapse, volatile-token scrub
//! - `redact`: secret masking applied before persistence and logging
//! - `tape`: in-memory tape/exchange/chunk model
//! - `codec`: JSON5 encode/decode and schema validation
//! - `keys`: normalized lookup keys under allow/ignore policies
//! - `store`: tape loading, indexing, and atomic locked writes
//! - `lock`: per-tape advisory file locks
//! - `record`: live-output segmentation into exchanges
//! - `replay`: surrogate child that streams recorded chunks
//! - `transport`: the pexpect-shaped transport contract
//! - `policy`: latency, error-injection, seed, and mode policies
//! - `summary`: end-of-session new/unused tape report
//! - `session`: facade wiring transports, recorder, and store
//! - `child`: default live collaborator over `tokio::process`
//! - `namegen`: pluggable tape naming
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod child;
pub mod codec;
pub mod error;
pub mod keys;
pub mod lock;
pub mod namegen;
pub mod normalize;
pub mod policy;
pub mod record;
pub mod redact;
pub mod replay;
pub mod session;
pub mod store;
pub mod summary;
pub mod tape;
pub mod transport;

pub use error::{Error, Result, SchemaError};
pub use policy::{ErrorPolicy, FallbackMode, InjectMode, LatencyPolicy, RecordMode};
pub use session::{Session, SessionConfig};
pub use store::TapeStore;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
