//! Live-output segmentation into exchanges.
//!
//! The recorder tees the child's read stream into a [`ChunkSink`] and
//! assembles complete exchanges at prompt/timeout/exit boundaries signalled
//! by the session facade. Redaction happens at capture time so unredacted
//! bytes never sit in the pending buffer.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use crate::error::Result;
use crate::keys::MatchingContext;
use crate::namegen::{NameContext, TapeNameGenerator};
use crate::normalize::prompt_signature;
use crate::policy::RecordMode;
use crate::redact::redact_secrets;
use crate::store::TapeStore;
use crate::tape::{
    Chunk, Exchange, ExitInfo, Input, LatencySpec, PreContext, PtySize, SessionInfo, Tape, TapeMeta,
};
use crate::transport::ByteSink;

// ---------------------------------------------------------------------------
// Chunk sink
// ---------------------------------------------------------------------------

/// Append-only sink capturing raw output bytes with per-chunk delays.
#[derive(Debug, Default)]
pub struct ChunkSink {
    chunks: Vec<Chunk>,
    last: Option<Instant>,
}

impl ChunkSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture one write. The first write since reset records `delay_ms = 0`.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let now = Instant::now();
        let delay_ms = self
            .last
            .map_or(0, |last| now.duration_since(last).as_millis() as u64);
        self.last = Some(now);
        let redacted = redact_secrets(data);
        self.chunks.push(Chunk::new(delay_ms, redacted));
    }

    /// Clear captured chunks and the delay clock.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.last = None;
    }

    /// Take the captured chunks, leaving the sink empty.
    pub fn drain(&mut self) -> Vec<Chunk> {
        self.last = None;
        std::mem::take(&mut self.chunks)
    }

    /// Number of captured chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Cloneable handle sharing one [`ChunkSink`] between the recorder and the
/// transport's read tee.
#[derive(Debug, Clone, Default)]
pub struct SharedChunkSink(Arc<StdMutex<ChunkSink>>);

impl SharedChunkSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn drain(&self) -> Vec<Chunk> {
        self.lock().drain()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChunkSink> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ByteSink for SharedChunkSink {
    fn write(&mut self, bytes: &[u8]) {
        self.lock().write(bytes);
    }
}

// ---------------------------------------------------------------------------
// Decorators
// ---------------------------------------------------------------------------

/// Pure hook over input bytes; errors are downgraded to warnings.
pub type InputDecorator =
    Arc<dyn Fn(&MatchingContext, &[u8]) -> std::result::Result<Vec<u8>, String> + Send + Sync>;

/// Pure hook over each output chunk's bytes.
pub type OutputDecorator =
    Arc<dyn Fn(&MatchingContext, &[u8]) -> std::result::Result<Vec<u8>, String> + Send + Sync>;

/// Pure hook over the assembled tape before persistence.
pub type TapeDecorator =
    Arc<dyn Fn(&MatchingContext, Tape) -> std::result::Result<Tape, String> + Send + Sync>;

/// Optional decorator pipeline stages.
#[derive(Clone, Default)]
pub struct Decorators {
    pub input: Option<InputDecorator>,
    pub output: Option<OutputDecorator>,
    pub tape: Option<TapeDecorator>,
}

impl std::fmt::Debug for Decorators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decorators")
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .field("tape", &self.tape.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Why an exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The session's expect resolved against a prompt.
    PromptMatched,
    /// The configured timeout elapsed with no further output.
    Timeout,
    /// The child exited.
    ChildExited(ExitInfo),
}

/// Invocation metadata captured at session start.
#[derive(Debug, Clone)]
pub struct RecorderMeta {
    pub program: String,
    pub args: Vec<String>,
    /// Environment already filtered by the record-time key policy.
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub pty: PtySize,
    pub tag: Option<String>,
    pub latency: Option<LatencySpec>,
    pub error_rate: Option<u8>,
    pub seed: Option<u64>,
    pub platform: String,
    pub version: String,
}

#[derive(Debug)]
struct PendingExchange {
    pre: PreContext,
    input: Input,
    started: Instant,
}

/// Assembles exchanges from the live read stream and persists them.
pub struct Recorder {
    meta: RecorderMeta,
    created_at: String,
    sink: SharedChunkSink,
    decorators: Decorators,
    pending: Vec<Exchange>,
    current: Option<PendingExchange>,
    last_preview: String,
}

impl Recorder {
    #[must_use]
    pub fn new(meta: RecorderMeta, decorators: Decorators) -> Self {
        Self {
            meta,
            created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            sink: SharedChunkSink::new(),
            decorators,
            pending: Vec::new(),
            current: None,
            last_preview: String::new(),
        }
    }

    /// The sink to attach as the transport's `logfile_read` tee.
    #[must_use]
    pub fn sink(&self) -> SharedChunkSink {
        self.sink.clone()
    }

    /// Open the implicit startup exchange that captures the banner.
    pub fn begin_startup(&mut self, ctx: &MatchingContext) {
        self.sink.reset();
        self.current = Some(PendingExchange {
            pre: PreContext {
                prompt: String::new(),
                state_hash: ctx.state_hash.clone(),
            },
            input: Input::empty(),
            started: Instant::now(),
        });
    }

    /// Snapshot the pre-context and store the (decorated) input; resets the
    /// chunk sink. Closes any exchange still open.
    pub fn on_send(&mut self, ctx: &MatchingContext, input: Input) {
        if self.current.is_some() {
            self.on_exchange_end(ctx, EndReason::PromptMatched);
        }
        let decorated = self.decorate_input(ctx, input);
        self.last_preview = String::from_utf8_lossy(decorated.match_bytes())
            .chars()
            .take(64)
            .collect();
        self.sink.reset();
        self.current = Some(PendingExchange {
            pre: PreContext {
                prompt: prompt_signature(ctx.prompt.as_deref().unwrap_or("")),
                state_hash: ctx.state_hash.clone(),
            },
            input: decorated,
            started: Instant::now(),
        });
    }

    /// Close the open exchange, draining the sink into its output.
    pub fn on_exchange_end(&mut self, ctx: &MatchingContext, reason: EndReason) {
        let Some(pending) = self.current.take() else {
            return;
        };
        let mut output = self.sink.drain();
        if let Some(decorator) = &self.decorators.output {
            for chunk in &mut output {
                match decorator(ctx, &chunk.data) {
                    Ok(data) => {
                        chunk.is_utf8 = std::str::from_utf8(&data).is_ok();
                        chunk.data = data;
                    }
                    Err(reason) => {
                        tracing::warn!(error = %reason, "output decorator failed; keeping undecorated chunk");
                    }
                }
            }
        }

        // An empty startup exchange carries no information; skip it.
        let is_empty_startup =
            pending.input == Input::empty() && output.is_empty() && self.pending.is_empty();
        if is_empty_startup && !matches!(reason, EndReason::ChildExited(_)) {
            return;
        }

        let exit = match reason {
            EndReason::ChildExited(exit) => Some(exit),
            EndReason::PromptMatched | EndReason::Timeout => None,
        };
        let dur_ms = pending.started.elapsed().as_millis() as u64;
        let delay_total: u64 = output.iter().map(|chunk| chunk.delay_ms).sum();
        self.pending.push(Exchange {
            pre: pending.pre,
            input: pending.input,
            output,
            exit,
            dur_ms: dur_ms.max(delay_total),
            annotations: BTreeMap::new(),
        });
    }

    /// Number of completed exchanges waiting for persistence.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Assemble the tape and persist it via the store.
    ///
    /// Returns the tape path (relative to the store root) when something
    /// was written.
    pub fn finalize(
        &mut self,
        store: &TapeStore,
        namegen: &dyn TapeNameGenerator,
        ctx: &MatchingContext,
        mode: RecordMode,
    ) -> Result<Option<PathBuf>> {
        if self.current.is_some() {
            self.on_exchange_end(ctx, EndReason::PromptMatched);
        }
        if mode == RecordMode::Disabled || self.pending.is_empty() {
            return Ok(None);
        }

        let mut tape = Tape {
            meta: TapeMeta {
                created_at: self.created_at.clone(),
                program: self.meta.program.clone(),
                args: self.meta.args.clone(),
                env: self.meta.env.clone(),
                cwd: self.meta.cwd.clone(),
                pty: self.meta.pty,
                tag: self.meta.tag.clone(),
                latency: self.meta.latency,
                error_rate: self.meta.error_rate,
                seed: self.meta.seed,
            },
            session: SessionInfo {
                platform: self.meta.platform.clone(),
                version: self.meta.version.clone(),
                flags: BTreeMap::new(),
            },
            exchanges: std::mem::take(&mut self.pending),
        };

        if let Some(decorator) = &self.decorators.tape {
            match decorator(ctx, tape.clone()) {
                Ok(decorated) => tape = decorated,
                Err(reason) => {
                    tracing::warn!(error = %reason, "tape decorator failed; persisting undecorated tape");
                }
            }
        }

        let rel_path = namegen.generate(&NameContext {
            program: self.meta.program.clone(),
            input_preview: self.last_preview.clone(),
        });
        store.write_tape(&rel_path, &tape, mode)?;
        Ok(Some(rel_path))
    }

    fn decorate_input(&self, ctx: &MatchingContext, input: Input) -> Input {
        let bytes = match &self.decorators.input {
            Some(decorator) => match decorator(ctx, input.match_bytes()) {
                Ok(bytes) => bytes,
                Err(reason) => {
                    tracing::warn!(error = %reason, "input decorator failed; keeping undecorated input");
                    input.match_bytes().to_vec()
                }
            },
            None => input.match_bytes().to_vec(),
        };
        let redacted = redact_secrets(&bytes);
        match input {
            Input::Line(_) => match String::from_utf8(redacted) {
                Ok(text) => Input::Line(text),
                Err(err) => Input::Raw(err.into_bytes()),
            },
            Input::Raw(_) => Input::Raw(redacted),
        }
    }
}
