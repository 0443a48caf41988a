//! In-memory tape model.
//!
//! A tape is one recorded invocation of a target program: metadata, session
//! info, and an ordered list of exchanges. Chunk payloads are raw bytes
//! here; base64 only exists at the codec boundary.

use std::collections::BTreeMap;

use serde_json::Value;

/// A unit of recorded output with inter-chunk timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Milliseconds since the previous chunk in the same exchange (0 first).
    pub delay_ms: u64,
    /// Raw output bytes.
    pub data: Vec<u8>,
    /// Pretty-printing hint; recomputed on encode.
    pub is_utf8: bool,
}

impl Chunk {
    /// Build a chunk, computing the UTF-8 hint from the payload.
    #[must_use]
    pub fn new(delay_ms: u64, data: Vec<u8>) -> Self {
        let is_utf8 = std::str::from_utf8(&data).is_ok();
        Self {
            delay_ms,
            data,
            is_utf8,
        }
    }
}

/// The input that initiated an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A newline-terminated line; matched after stripping one trailing `\r?\n`.
    Line(String),
    /// Arbitrary bytes.
    Raw(Vec<u8>),
}

impl Input {
    /// Bytes used for key building: `Line` loses one trailing `\r?\n`.
    #[must_use]
    pub fn match_bytes(&self) -> &[u8] {
        match self {
            Self::Line(text) => {
                let bytes = text.as_bytes();
                let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
                bytes.strip_suffix(b"\r").unwrap_or(bytes)
            }
            Self::Raw(bytes) => bytes,
        }
    }

    /// The exact bytes that were (or would be) written to the child.
    #[must_use]
    pub fn wire_bytes(&self) -> Vec<u8> {
        match self {
            Self::Line(text) => {
                let mut bytes = text.as_bytes().to_vec();
                if !bytes.ends_with(b"\n") {
                    bytes.push(b'\n');
                }
                bytes
            }
            Self::Raw(bytes) => bytes.clone(),
        }
    }

    /// An empty raw input; the implicit startup exchange uses this.
    #[must_use]
    pub fn empty() -> Self {
        Self::Raw(Vec::new())
    }
}

/// Pre-exchange context captured when the input was sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreContext {
    /// Normalized prompt signature in effect before the input.
    pub prompt: String,
    /// Optional caller-supplied state disambiguator.
    pub state_hash: Option<String>,
}

/// Exit metadata; present on the last exchange of a tape at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Process exit code.
    pub code: i32,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
}

/// One input-plus-response segment of a tape.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    /// Context snapshot taken when the input was sent.
    pub pre: PreContext,
    /// The input that initiated the exchange.
    pub input: Input,
    /// Chunked output; concatenated data reconstructs the byte stream.
    pub output: Vec<Chunk>,
    /// Exit status when the child terminated during this exchange.
    pub exit: Option<ExitInfo>,
    /// Wall-clock duration; always `>= sum(delay_ms)`.
    pub dur_ms: u64,
    /// Free-form key -> scalar annotations.
    pub annotations: BTreeMap<String, Value>,
}

impl Exchange {
    /// Concatenate chunk payloads into the full output byte stream.
    #[must_use]
    pub fn output_bytes(&self) -> Vec<u8> {
        let total = self.output.iter().map(|c| c.data.len()).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in &self.output {
            out.extend_from_slice(&chunk.data);
        }
        out
    }
}

/// Latency recorded in tape metadata, overriding the session default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencySpec {
    /// Fixed per-chunk delay in milliseconds.
    Const(u64),
    /// Uniformly sampled per-chunk delay.
    Range(u64, u64),
}

/// PTY dimensions the recording ran under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Metadata describing the invocation a tape was captured from.
#[derive(Debug, Clone, PartialEq)]
pub struct TapeMeta {
    /// RFC3339 capture timestamp.
    pub created_at: String,
    /// Program as invoked.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Environment, already filtered by the record-time key policy.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub cwd: String,
    /// PTY dimensions.
    pub pty: PtySize,
    /// Optional human tag.
    pub tag: Option<String>,
    /// Per-tape latency override.
    pub latency: Option<LatencySpec>,
    /// Per-tape error-rate override (0-100).
    pub error_rate: Option<u8>,
    /// Per-tape RNG seed override.
    pub seed: Option<u64>,
}

/// Host/session info captured alongside the tape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionInfo {
    /// Platform string (`linux`, `macos`, ...).
    pub platform: String,
    /// Tool version that produced the tape.
    pub version: String,
    /// Free-form flags.
    pub flags: BTreeMap<String, Value>,
}

/// A complete recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Tape {
    pub meta: TapeMeta,
    pub session: SessionInfo,
    /// Never empty in a valid tape.
    pub exchanges: Vec<Exchange>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_computes_utf8_hint() {
        assert!(Chunk::new(0, b"text".to_vec()).is_utf8);
        assert!(!Chunk::new(0, vec![0xff, 0xfe]).is_utf8);
    }

    #[test]
    fn line_input_strips_one_trailing_newline() {
        assert_eq!(Input::Line("select 1;\n".into()).match_bytes(), b"select 1;");
        assert_eq!(
            Input::Line("select 1;\r\n".into()).match_bytes(),
            b"select 1;"
        );
        assert_eq!(Input::Line("select 1;".into()).match_bytes(), b"select 1;");
    }

    #[test]
    fn line_input_wire_bytes_end_with_newline() {
        assert_eq!(Input::Line("ls".into()).wire_bytes(), b"ls\n");
        assert_eq!(Input::Line("ls\n".into()).wire_bytes(), b"ls\n");
    }

    #[test]
    fn exchange_output_bytes_concatenates_chunks() {
        let exchange = Exchange {
            pre: PreContext::default(),
            input: Input::empty(),
            output: vec![Chunk::new(0, b"1\n".to_vec()), Chunk::new(3, b"> ".to_vec())],
            exit: None,
            dur_ms: 10,
            annotations: BTreeMap::new(),
        };
        assert_eq!(exchange.output_bytes(), b"1\n> ");
    }
}
