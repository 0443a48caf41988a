//! Surrogate child that replays recorded exchanges.
//!
//! Each send resolves the input against the store; on a hit a streaming
//! task pays the resolved per-chunk latency into the expect buffer, with
//! optional fault injection. On a miss the caller decides between raising
//! and falling back to a live child (proxy mode).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::rngs::StdRng;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::keys::MatchingContext;
use crate::policy::{seeded_rng, ErrorPolicy, InjectMode, LatencyPolicy};
use crate::store::{MatchHit, TapeStore};
use crate::tape::{ExitInfo, Input};
use crate::transport::{ByteSink, ExpectShared, PatternSet, Transport};

/// Replay-side policy bundle, fixed at session construction.
#[derive(Clone)]
pub struct ReplayOptions {
    pub latency: LatencyPolicy,
    pub error: ErrorPolicy,
    pub inject_mode: InjectMode,
    /// Resolved session seed; per-tape seeds override it.
    pub session_seed: u64,
}

impl std::fmt::Debug for ReplayOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayOptions")
            .field("latency", &self.latency)
            .field("error", &self.error)
            .field("inject_mode", &self.inject_mode)
            .field("session_seed", &self.session_seed)
            .finish()
    }
}

/// Transport state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayState {
    Idle,
    Streaming,
    Closed,
}

struct PlanStep {
    delay_ms: u64,
    bytes: Vec<u8>,
}

enum StreamEnd {
    /// All planned chunks emitted; optionally latch an exit.
    Complete(Option<ExitInfo>),
    /// Truncated mid-stream; surface an injected fault on the next expect.
    Injected(usize),
}

type SharedSink = Arc<StdMutex<Option<Box<dyn ByteSink>>>>;

/// Stand-in for a live child during playback.
pub struct ReplayTransport {
    store: Arc<TapeStore>,
    ctx: MatchingContext,
    options: ReplayOptions,
    /// One RNG stream per effective seed, so per-tape seeds stay isolated.
    rngs: HashMap<u64, StdRng>,
    shared: Arc<ExpectShared>,
    logfile: SharedSink,
    state: ReplayState,
    stream_task: Option<JoinHandle<()>>,
    /// Ordinal of the next exchange served by this session.
    exchange_ordinal: usize,
    sent_anything: bool,
    before: Vec<u8>,
    matched: Vec<u8>,
    after: Vec<u8>,
    span: Option<(usize, usize)>,
}

impl ReplayTransport {
    #[must_use]
    pub fn new(store: Arc<TapeStore>, ctx: MatchingContext, options: ReplayOptions) -> Self {
        Self {
            store,
            ctx,
            options,
            rngs: HashMap::new(),
            shared: Arc::new(ExpectShared::new()),
            logfile: Arc::new(StdMutex::new(None)),
            state: ReplayState::Idle,
            stream_task: None,
            exchange_ordinal: 0,
            sent_anything: false,
            before: Vec::new(),
            matched: Vec::new(),
            after: Vec::new(),
            span: None,
        }
    }

    /// Update the prompt used for subsequent lookups.
    pub fn set_prompt(&mut self, prompt: Option<String>) {
        self.ctx.prompt = prompt;
    }

    /// Update the caller-supplied state hash for subsequent lookups.
    pub fn set_state_hash(&mut self, state_hash: Option<String>) {
        self.ctx.state_hash = state_hash;
    }

    /// Stream the recorded startup banner, if one was recorded.
    ///
    /// Called by the facade before the first expect when nothing has been
    /// sent yet; a missing startup exchange is not an error.
    pub fn prime_startup(&mut self) -> bool {
        if self.sent_anything {
            return false;
        }
        let mut ctx = self.ctx.clone();
        ctx.prompt = None;
        let Some(hit) = self.store.lookup(&ctx, &Input::empty()) else {
            return false;
        };
        self.serve_hit(hit);
        true
    }

    /// Resolve an input against the store and start streaming its output.
    fn handle_send(&mut self, input: &Input) -> Result<usize> {
        if self.state == ReplayState::Closed {
            return Err(Error::Cancelled);
        }
        self.sent_anything = true;
        let Some(hit) = self.store.lookup(&self.ctx, input) else {
            return Err(Error::TapeMiss(Box::new(
                self.store.miss_report(&self.ctx, input),
            )));
        };
        let len = input.wire_bytes().len();
        self.serve_hit(hit);
        Ok(len)
    }

    fn serve_hit(&mut self, hit: MatchHit) {
        self.store.mark_used(&hit.rel_path);

        let latency = hit
            .latency
            .map_or_else(|| self.options.latency.clone(), LatencyPolicy::from);
        let error = hit
            .error_rate
            .map_or_else(|| self.options.error.clone(), ErrorPolicy::Const);
        let seed = hit.seed.unwrap_or(self.options.session_seed);
        let rng = self.rngs.entry(seed).or_insert_with(|| seeded_rng(seed));

        // Resolve the full (latency, injection) plan up front so the
        // decision sequence is a pure function of seed and input order.
        let ordinal = self.exchange_ordinal;
        let mut plan = Vec::with_capacity(hit.exchange.output.len());
        let mut end = None;
        for (i, chunk) in hit.exchange.output.iter().enumerate() {
            let delay_ms = latency.resolve(&self.ctx, chunk.delay_ms, rng);
            if i > 0 && error.should_inject(&self.ctx, rng) {
                match self.options.inject_mode {
                    InjectMode::Truncate => end = Some(StreamEnd::Injected(ordinal)),
                    InjectMode::Exit(code) => {
                        end = Some(StreamEnd::Complete(Some(ExitInfo {
                            code,
                            signal: None,
                        })));
                    }
                }
                break;
            }
            plan.push(PlanStep {
                delay_ms,
                bytes: chunk.data.clone(),
            });
        }
        let end = end.unwrap_or(StreamEnd::Complete(hit.exchange.exit));
        self.exchange_ordinal += 1;

        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        self.shared.reset_for_exchange();
        self.state = ReplayState::Streaming;

        let shared = Arc::clone(&self.shared);
        let logfile = Arc::clone(&self.logfile);
        self.stream_task = Some(tokio::spawn(async move {
            for step in plan {
                if step.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
                }
                if let Some(sink) = logfile
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .as_mut()
                {
                    sink.write(&step.bytes);
                }
                shared.push(&step.bytes);
            }
            match end {
                StreamEnd::Complete(exit) => shared.finish(exit),
                StreamEnd::Injected(at_exchange) => shared.mark_injected(at_exchange),
            }
        }));
    }

    fn record_outcome(&mut self, outcome: &crate::transport::ExpectOutcome) {
        self.before = outcome.before.clone();
        self.matched = outcome.matched.clone();
        self.after = outcome.after.clone();
        self.span = Some(outcome.span);
    }
}

impl Transport for ReplayTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        self.handle_send(&Input::Raw(bytes.to_vec()))
    }

    async fn sendline(&mut self, text: &str) -> Result<usize> {
        self.handle_send(&Input::Line(text.to_string()))
    }

    async fn expect(&mut self, patterns: &PatternSet, timeout: Duration) -> Result<usize> {
        let outcome = self.shared.expect(patterns, timeout).await?;
        self.record_outcome(&outcome);
        if self.shared.finished() && self.state == ReplayState::Streaming {
            self.state = ReplayState::Idle;
        }
        Ok(outcome.index)
    }

    async fn expect_exact(&mut self, literals: &[&[u8]], timeout: Duration) -> Result<usize> {
        let set = PatternSet::exacts(literals);
        self.expect(&set, timeout).await
    }

    fn is_alive(&self) -> bool {
        self.state != ReplayState::Closed && self.shared.exit().is_none()
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<Option<ExitInfo>> {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        self.state = ReplayState::Closed;
        Ok(self.shared.exit())
    }

    fn before(&self) -> &[u8] {
        &self.before
    }

    fn last_match(&self) -> &[u8] {
        &self.matched
    }

    fn after(&self) -> &[u8] {
        &self.after
    }

    fn match_span(&self) -> Option<(usize, usize)> {
        self.span
    }

    fn exit_status(&self) -> Option<ExitInfo> {
        self.shared.exit()
    }

    fn set_logfile_read(&mut self, sink: Box<dyn ByteSink>) {
        *self
            .logfile
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink);
    }
}
