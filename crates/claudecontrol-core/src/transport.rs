//! The pexpect-shaped transport contract shared by live and replay paths.
//!
//! A transport is something a caller can `send` bytes to and `expect`
//! patterns from. The replay transport and the live child adapter both
//! implement [`Transport`]; the session facade is polymorphic over the two
//! without dynamic dispatch on hot paths.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use regex::bytes::Regex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::tape::ExitInfo;

/// Byte sink used for `logfile_read`-style tees.
pub trait ByteSink: Send {
    fn write(&mut self, bytes: &[u8]);
    fn flush(&mut self) {}
}

/// One entry of an expect pattern set.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Regular expression over raw bytes.
    Regex(Regex),
    /// Literal byte sequence.
    Exact(Vec<u8>),
    /// Matches when the child reached end-of-stream.
    Eof,
    /// Matches when the timeout elapses instead of raising `ExpectTimeout`.
    Timeout,
}

impl Pattern {
    /// Compile a regex pattern.
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|err| Error::Config {
                field: "pattern",
                reason: err.to_string(),
            })
    }

    /// A literal pattern.
    #[must_use]
    pub fn exact(literal: impl Into<Vec<u8>>) -> Self {
        Self::Exact(literal.into())
    }
}

/// An ordered set of patterns; the match index refers to this order.
#[derive(Debug, Clone, Default)]
pub struct PatternSet(pub Vec<Pattern>);

impl PatternSet {
    /// A single-regex set.
    pub fn single(pattern: &str) -> Result<Self> {
        Ok(Self(vec![Pattern::regex(pattern)?]))
    }

    /// A set of literal patterns.
    #[must_use]
    pub fn exacts(literals: &[&[u8]]) -> Self {
        Self(literals.iter().map(|l| Pattern::exact(*l)).collect())
    }

    /// Index of the `Eof` sentinel, if present.
    #[must_use]
    pub fn eof_index(&self) -> Option<usize> {
        self.0.iter().position(|p| matches!(p, Pattern::Eof))
    }

    /// Index of the `Timeout` sentinel, if present.
    #[must_use]
    pub fn timeout_index(&self) -> Option<usize> {
        self.0.iter().position(|p| matches!(p, Pattern::Timeout))
    }

    /// Scan a buffer, picking the earliest-end match; ties resolve to the
    /// lowest pattern index. Sentinels never match bytes.
    #[must_use]
    pub fn scan(&self, haystack: &[u8]) -> Option<ScanHit> {
        let mut best: Option<ScanHit> = None;
        for (index, pattern) in self.0.iter().enumerate() {
            let hit = match pattern {
                Pattern::Regex(re) => re
                    .find(haystack)
                    .map(|m| ScanHit {
                        index,
                        start: m.start(),
                        end: m.end(),
                    }),
                Pattern::Exact(literal) => {
                    if literal.is_empty() {
                        None
                    } else {
                        find_subslice(haystack, literal).map(|start| ScanHit {
                            index,
                            start,
                            end: start + literal.len(),
                        })
                    }
                }
                Pattern::Eof | Pattern::Timeout => None,
            };
            if let Some(hit) = hit {
                let better = match &best {
                    None => true,
                    Some(current) => hit.end < current.end,
                };
                if better {
                    best = Some(hit);
                }
            }
        }
        best
    }
}

/// A byte-level pattern match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHit {
    /// Pattern index within the set.
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Result of a resolved `expect`.
#[derive(Debug, Clone)]
pub struct ExpectOutcome {
    /// Index of the matched pattern within the set.
    pub index: usize,
    /// Bytes before the match.
    pub before: Vec<u8>,
    /// The matched bytes themselves.
    pub matched: Vec<u8>,
    /// Bytes after the match still buffered.
    pub after: Vec<u8>,
    /// Matched range within the scanned buffer.
    pub span: (usize, usize),
}

/// The capability set both the live child and the replay surrogate expose.
#[allow(async_fn_in_trait)]
pub trait Transport: Send {
    /// Write raw bytes to the child; returns the byte count.
    async fn send(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Write a line (newline appended) to the child.
    async fn sendline(&mut self, text: &str) -> Result<usize>;

    /// Wait for the first pattern match, up to `timeout`.
    async fn expect(&mut self, patterns: &PatternSet, timeout: Duration) -> Result<usize>;

    /// Wait for the first literal match, up to `timeout`.
    async fn expect_exact(&mut self, literals: &[&[u8]], timeout: Duration) -> Result<usize>;

    /// Whether the (real or surrogate) child is still alive.
    fn is_alive(&self) -> bool;

    /// Terminate with a grace period, returning the exit status if known.
    async fn terminate(&mut self, grace: Duration) -> Result<Option<ExitInfo>>;

    /// Bytes before the last match.
    fn before(&self) -> &[u8];

    /// The last matched bytes (pexpect's `match`).
    fn last_match(&self) -> &[u8];

    /// Bytes after the last match.
    fn after(&self) -> &[u8];

    /// Byte range of the last match.
    fn match_span(&self) -> Option<(usize, usize)>;

    /// Exit status, readable after the child exited.
    fn exit_status(&self) -> Option<ExitInfo>;

    /// Attach a tee that observes every byte read from the child.
    fn set_logfile_read(&mut self, sink: Box<dyn ByteSink>);
}

// ---------------------------------------------------------------------------
// Shared expect buffer
// ---------------------------------------------------------------------------

/// Maximum bytes of trailing output retained for timeout snapshots.
const TAIL_CAP: usize = 64 * 1024;

/// Lines included in an `ExpectTimeout` snapshot.
pub const RECENT_LINES: usize = 50;

/// State shared between a producer task and `expect` callers.
#[derive(Debug, Default)]
pub struct ExpectState {
    /// Unconsumed output bytes.
    pub buffer: Vec<u8>,
    /// Producer reached end-of-stream.
    pub eof: bool,
    /// Exit status latched by the producer.
    pub exit: Option<ExitInfo>,
    /// Exchange ordinal at which a synthetic fault was injected.
    pub injected: Option<usize>,
    /// Trailing window of everything produced, for diagnostics.
    tail: VecDeque<u8>,
}

impl ExpectState {
    fn push_tail(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.tail.len() == TAIL_CAP {
                self.tail.pop_front();
            }
            self.tail.push_back(b);
        }
    }

    /// The last `n` lines of everything produced so far.
    #[must_use]
    pub fn recent_lines(&self, n: usize) -> String {
        let tail: Vec<u8> = self.tail.iter().copied().collect();
        let text = String::from_utf8_lossy(&tail);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Notifier-fed buffer connecting a producer task to `expect` callers.
#[derive(Debug, Default)]
pub struct ExpectShared {
    state: StdMutex<ExpectState>,
    notify: Notify,
}

impl ExpectShared {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append produced bytes and wake any waiting `expect`.
    pub fn push(&self, bytes: &[u8]) {
        {
            let mut state = self.lock();
            state.buffer.extend_from_slice(bytes);
            state.push_tail(bytes);
        }
        self.notify.notify_one();
    }

    /// Mark end-of-stream, optionally latching an exit status.
    pub fn finish(&self, exit: Option<ExitInfo>) {
        {
            let mut state = self.lock();
            state.eof = true;
            if exit.is_some() {
                state.exit = exit;
            }
        }
        self.notify.notify_one();
    }

    /// Record an injected fault at the given exchange ordinal.
    pub fn mark_injected(&self, at_exchange: usize) {
        {
            let mut state = self.lock();
            state.injected = Some(at_exchange);
            state.eof = true;
        }
        self.notify.notify_one();
    }

    /// Reset buffer and flags for a new exchange. The diagnostic tail is
    /// preserved across exchanges.
    pub fn reset_for_exchange(&self) {
        let mut state = self.lock();
        state.buffer.clear();
        state.eof = false;
        state.injected = None;
    }

    /// Latched exit status, if any.
    #[must_use]
    pub fn exit(&self) -> Option<ExitInfo> {
        self.lock().exit
    }

    /// Whether the producer finished and the exit was latched.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.lock().eof
    }

    /// Snapshot of the recent output for error messages.
    #[must_use]
    pub fn recent_output(&self) -> String {
        self.lock().recent_lines(RECENT_LINES)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ExpectState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Drive an `expect` against this buffer.
    ///
    /// Scans on every producer wakeup; resolves to a pattern match, an
    /// `Eof`/`Timeout` sentinel, an injected fault, or `ExpectTimeout`.
    pub async fn expect(&self, patterns: &PatternSet, timeout: Duration) -> Result<ExpectOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.lock();
                if let Some(hit) = patterns.scan(&state.buffer) {
                    let before = state.buffer[..hit.start].to_vec();
                    let matched = state.buffer[hit.start..hit.end].to_vec();
                    let after = state.buffer[hit.end..].to_vec();
                    state.buffer.drain(..hit.end);
                    return Ok(ExpectOutcome {
                        index: hit.index,
                        before,
                        matched,
                        after,
                        span: (hit.start, hit.end),
                    });
                }
                if let Some(at_exchange) = state.injected {
                    return Err(Error::Injected { at_exchange });
                }
                if state.eof {
                    if let Some(index) = patterns.eof_index() {
                        let before = std::mem::take(&mut state.buffer);
                        let span = (before.len(), before.len());
                        return Ok(ExpectOutcome {
                            index,
                            before,
                            matched: Vec::new(),
                            after: Vec::new(),
                            span,
                        });
                    }
                    return Err(Error::ExpectTimeout {
                        recent_output: state.recent_lines(RECENT_LINES),
                    });
                }
            }

            let notified = self.notify.notified();
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    let mut state = self.lock();
                    if let Some(index) = patterns.timeout_index() {
                        let before = std::mem::take(&mut state.buffer);
                        let span = (before.len(), before.len());
                        return Ok(ExpectOutcome {
                            index,
                            before,
                            matched: Vec::new(),
                            after: Vec::new(),
                            span,
                        });
                    }
                    return Err(Error::ExpectTimeout {
                        recent_output: state.recent_lines(RECENT_LINES),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn scan_picks_earliest_end() {
        let set = PatternSet(vec![
            Pattern::exact(&b"world"[..]),
            Pattern::exact(&b"hello"[..]),
        ]);
        let hit = set.scan(b"hello world").unwrap();
        assert_eq!(hit.index, 1);
        assert_eq!((hit.start, hit.end), (0, 5));
    }

    #[test]
    fn scan_breaks_ties_by_pattern_index() {
        let set = PatternSet(vec![
            Pattern::exact(&b"ab"[..]),
            Pattern::exact(&b"ab"[..]),
        ]);
        let hit = set.scan(b"xxab").unwrap();
        assert_eq!(hit.index, 0);
    }

    #[test]
    fn scan_regex_and_exact_compete() {
        let set = PatternSet(vec![
            Pattern::regex(r"w\w+d").unwrap(),
            Pattern::exact(&b"hello"[..]),
        ]);
        let hit = set.scan(b"hello world").unwrap();
        assert_eq!(hit.index, 1); // "hello" ends at 5, "world" at 11
    }

    #[test]
    fn sentinels_never_match_bytes() {
        let set = PatternSet(vec![Pattern::Eof, Pattern::Timeout]);
        assert!(set.scan(b"anything").is_none());
        assert_eq!(set.eof_index(), Some(0));
        assert_eq!(set.timeout_index(), Some(1));
    }

    #[tokio::test]
    async fn expect_resolves_when_bytes_arrive() {
        let shared = Arc::new(ExpectShared::new());
        let producer = Arc::clone(&shared);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            producer.push(b"1\nsqlite> ");
        });
        let set = PatternSet::single(r"sqlite> ").unwrap();
        let outcome = shared
            .expect(&set, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.before, b"1\n");
        assert_eq!(outcome.matched, b"sqlite> ");
        assert!(outcome.after.is_empty());
    }

    #[tokio::test]
    async fn expect_consumes_through_match_end() {
        let shared = ExpectShared::new();
        shared.push(b"a> b> ");
        let set = PatternSet::single(r"> ").unwrap();
        let first = shared.expect(&set, Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.before, b"a");
        assert_eq!(first.after, b"b> ");
        let second = shared.expect(&set, Duration::from_millis(50)).await.unwrap();
        assert_eq!(second.before, b"b");
    }

    #[tokio::test]
    async fn expect_times_out_without_sentinel() {
        let shared = ExpectShared::new();
        shared.push(b"no prompt here");
        let set = PatternSet::single(r"\$ ").unwrap();
        let err = shared
            .expect(&set, Duration::from_millis(20))
            .await
            .unwrap_err();
        match err {
            Error::ExpectTimeout { recent_output } => {
                assert!(recent_output.contains("no prompt here"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_sentinel_converts_timeout_to_match() {
        let shared = ExpectShared::new();
        let set = PatternSet(vec![Pattern::regex(r"\$ ").unwrap(), Pattern::Timeout]);
        let outcome = shared
            .expect(&set, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(outcome.index, 1);
    }

    #[tokio::test]
    async fn eof_sentinel_matches_at_stream_end() {
        let shared = ExpectShared::new();
        shared.push(b"tail bytes");
        shared.finish(Some(ExitInfo {
            code: 0,
            signal: None,
        }));
        let set = PatternSet(vec![Pattern::regex(r"never").unwrap(), Pattern::Eof]);
        let outcome = shared
            .expect(&set, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(outcome.index, 1);
        assert_eq!(outcome.before, b"tail bytes");
    }

    #[tokio::test]
    async fn injected_fault_surfaces_on_expect() {
        let shared = ExpectShared::new();
        shared.push(b"partial");
        shared.mark_injected(3);
        let set = PatternSet::single(r"complete").unwrap();
        let err = shared
            .expect(&set, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Injected { at_exchange: 3 }));
    }

    #[test]
    fn recent_lines_caps_the_snapshot() {
        let shared = ExpectShared::new();
        for i in 0..120 {
            shared.push(format!("line {i}\n").as_bytes());
        }
        let snapshot = shared.recent_output();
        let lines: Vec<&str> = snapshot.lines().collect();
        assert_eq!(lines.len(), RECENT_LINES);
        assert_eq!(*lines.last().unwrap(), "line 119");
    }
}
