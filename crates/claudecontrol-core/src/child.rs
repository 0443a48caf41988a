//! Live child collaborators.
//!
//! The engine consumes the pty collaborator through the [`Transport`]
//! contract. [`ProcessTransport`] adapts `tokio::process` for the CLI's
//! record/proxy paths; [`ScriptedChild`] is a deterministic double used by
//! tests that need a "live" child with exactly known behavior.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};

use crate::error::{Error, Result};
use crate::tape::{ExitInfo, PtySize};
use crate::transport::{ByteSink, ExpectOutcome, ExpectShared, PatternSet, Transport};

/// Everything needed to spawn the target program.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub pty: PtySize,
}

/// Factory for live child transports.
pub trait PtySpawner: Send + Sync {
    type Handle: Transport;

    fn spawn(&self, spec: &SpawnSpec) -> Result<Self::Handle>;
}

type SharedSink = Arc<StdMutex<Option<Box<dyn ByteSink>>>>;

fn write_tee(logfile: &SharedSink, bytes: &[u8]) {
    if let Some(sink) = logfile
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .as_mut()
    {
        sink.write(bytes);
    }
}

// ---------------------------------------------------------------------------
// tokio::process adapter
// ---------------------------------------------------------------------------

/// Spawns the target via `tokio::process` with piped stdio.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSpawner;

impl PtySpawner for ProcessSpawner {
    type Handle = ProcessTransport;

    fn spawn(&self, spec: &SpawnSpec) -> Result<Self::Handle> {
        ProcessTransport::spawn(spec)
    }
}

/// Live transport over a piped child process.
///
/// Dedicated read tasks drain stdout and stderr into the shared expect
/// buffer (and through the `logfile_read` tee) without blocking the caller.
pub struct ProcessTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    shared: Arc<ExpectShared>,
    logfile: SharedSink,
    before: Vec<u8>,
    matched: Vec<u8>,
    after: Vec<u8>,
    span: Option<(usize, usize)>,
    closed: bool,
}

impl ProcessTransport {
    /// Spawn the program described by `spec`.
    pub fn spawn(spec: &SpawnSpec) -> Result<Self> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::TapeIo {
                path: PathBuf::from(&spec.program),
                op: "spawn",
                source,
            })?;

        let stdin = child.stdin.take();
        let shared = Arc::new(ExpectShared::new());
        let logfile: SharedSink = Arc::new(StdMutex::new(None));

        // Two readers feed one buffer; the last one to finish marks EOF.
        let live_readers = Arc::new(AtomicUsize::new(0));
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, &shared, &logfile, &live_readers);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, &shared, &logfile, &live_readers);
        }

        Ok(Self {
            child,
            stdin,
            shared,
            logfile,
            before: Vec::new(),
            matched: Vec::new(),
            after: Vec::new(),
            span: None,
            closed: false,
        })
    }

    /// Latch the exit status once the readers drained the streams.
    fn reap(&mut self) {
        if self.shared.exit().is_some() || !self.shared.finished() {
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.shared.finish(Some(exit_info_from(status)));
        }
    }
}

fn spawn_reader(
    mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    shared: &Arc<ExpectShared>,
    logfile: &SharedSink,
    live_readers: &Arc<AtomicUsize>,
) {
    live_readers.fetch_add(1, Ordering::SeqCst);
    let shared = Arc::clone(shared);
    let logfile = Arc::clone(logfile);
    let live_readers = Arc::clone(live_readers);
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    write_tee(&logfile, &buf[..n]);
                    shared.push(&buf[..n]);
                }
            }
        }
        if live_readers.fetch_sub(1, Ordering::SeqCst) == 1 {
            shared.finish(None);
        }
    });
}

fn exit_info_from(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        ExitInfo {
            code: status.code().unwrap_or(-1),
            signal: status.signal(),
        }
    }
    #[cfg(not(unix))]
    {
        ExitInfo {
            code: status.code().unwrap_or(-1),
            signal: None,
        }
    }
}

impl Transport for ProcessTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(Error::ChildGone);
        };
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(bytes.len())
    }

    async fn sendline(&mut self, text: &str) -> Result<usize> {
        let mut line = text.as_bytes().to_vec();
        line.push(b'\n');
        self.send(&line).await
    }

    async fn expect(&mut self, patterns: &PatternSet, timeout: Duration) -> Result<usize> {
        let result = self.shared.expect(patterns, timeout).await;
        self.reap();
        let outcome = result?;
        self.before = outcome.before;
        self.matched = outcome.matched;
        self.after = outcome.after;
        self.span = Some(outcome.span);
        Ok(outcome.index)
    }

    async fn expect_exact(&mut self, literals: &[&[u8]], timeout: Duration) -> Result<usize> {
        let set = PatternSet::exacts(literals);
        self.expect(&set, timeout).await
    }

    fn is_alive(&self) -> bool {
        !self.closed && self.shared.exit().is_none() && !self.shared.finished()
    }

    async fn terminate(&mut self, grace: Duration) -> Result<Option<ExitInfo>> {
        if self.closed {
            return Ok(self.shared.exit());
        }
        self.closed = true;
        // Closing stdin asks well-behaved line programs to exit.
        drop(self.stdin.take());

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_elapsed) => {
                tracing::debug!("child did not exit within grace period; killing");
                self.child.start_kill()?;
                self.child.wait().await?
            }
        };
        let exit = exit_info_from(status);
        self.shared.finish(Some(exit));
        Ok(Some(exit))
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

// ---------------------------------------------------------------------------
// Scripted double
// ---------------------------------------------------------------------------

/// One scripted interaction: expected input and the response to stream.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    /// Input that must arrive (trailing newline ignored for comparison).
    pub input: Vec<u8>,
    /// Output chunks emitted in order.
    pub chunks: Vec<Vec<u8>>,
    /// Exit latched after the last chunk.
    pub exit: Option<ExitInfo>,
}

/// Script for a [`ScriptedChild`]: optional banner plus ordered steps.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Chunks emitted before any input arrives.
    pub banner: Vec<Vec<u8>>,
    pub steps: Vec<ScriptedStep>,
}

/// Spawner producing fresh [`ScriptedChild`]ren from one script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSpawner {
    pub script: Script,
}

impl PtySpawner for ScriptedSpawner {
    type Handle = ScriptedChild;

    fn spawn(&self, _spec: &SpawnSpec) -> Result<Self::Handle> {
        Ok(ScriptedChild::new(self.script.clone()))
    }
}

/// Deterministic in-memory "live" child driven by a [`Script`].
pub struct ScriptedChild {
    script: Script,
    cursor: usize,
    banner_pending: bool,
    shared: Arc<ExpectShared>,
    logfile: SharedSink,
    before: Vec<u8>,
    matched: Vec<u8>,
    after: Vec<u8>,
    span: Option<(usize, usize)>,
    closed: bool,
}

impl ScriptedChild {
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            script,
            cursor: 0,
            banner_pending: true,
            shared: Arc::new(ExpectShared::new()),
            logfile: Arc::new(StdMutex::new(None)),
            before: Vec::new(),
            matched: Vec::new(),
            after: Vec::new(),
            span: None,
            closed: false,
        }
    }

    fn emit_banner(&mut self) {
        if !std::mem::take(&mut self.banner_pending) {
            return;
        }
        let banner = std::mem::take(&mut self.script.banner);
        for chunk in banner {
            write_tee(&self.logfile, &chunk);
            self.shared.push(&chunk);
        }
    }

    fn handle_send(&mut self, payload: &[u8]) -> Result<usize> {
        if self.closed || self.exit_status().is_some() {
            return Err(Error::ChildGone);
        }
        self.emit_banner();
        let Some(step) = self.script.steps.get(self.cursor) else {
            return Err(Error::Config {
                field: "script",
                reason: format!(
                    "unexpected input past end of script: {:?}",
                    String::from_utf8_lossy(payload)
                ),
            });
        };
        let trimmed = trim_newline(payload);
        if trim_newline(&step.input) != trimmed {
            return Err(Error::Config {
                field: "script",
                reason: format!(
                    "script expected {:?}, got {:?}",
                    String::from_utf8_lossy(&step.input),
                    String::from_utf8_lossy(payload)
                ),
            });
        }
        let step = step.clone();
        self.cursor += 1;
        for chunk in &step.chunks {
            write_tee(&self.logfile, chunk);
            self.shared.push(chunk);
        }
        if let Some(exit) = step.exit {
            self.shared.finish(Some(exit));
        }
        Ok(payload.len())
    }
}

fn trim_newline(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

impl Transport for ScriptedChild {
    async fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        self.handle_send(bytes)
    }

    async fn sendline(&mut self, text: &str) -> Result<usize> {
        let mut line = text.as_bytes().to_vec();
        line.push(b'\n');
        self.handle_send(&line)
    }

    async fn expect(&mut self, patterns: &PatternSet, timeout: Duration) -> Result<usize> {
        self.emit_banner();
        let outcome: ExpectOutcome = self.shared.expect(patterns, timeout).await?;
        self.before = outcome.before;
        self.matched = outcome.matched;
        self.after = outcome.after;
        self.span = Some(outcome.span);
        Ok(outcome.index)
    }

    async fn expect_exact(&mut self, literals: &[&[u8]], timeout: Duration) -> Result<usize> {
        let set = PatternSet::exacts(literals);
        self.expect(&set, timeout).await
    }

    fn is_alive(&self) -> bool {
        !self.closed && self.shared.exit().is_none()
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<Option<ExitInfo>> {
        self.closed = true;
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

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> Script {
        Script {
            banner: vec![b"SQLite version 3\nsqlite> ".to_vec()],
            steps: vec![
                ScriptedStep {
                    input: b"select 1;".to_vec(),
                    chunks: vec![b"1\n".to_vec(), b"sqlite> ".to_vec()],
                    exit: None,
                },
                ScriptedStep {
                    input: b".quit".to_vec(),
                    chunks: vec![b"bye\n".to_vec()],
                    exit: Some(ExitInfo {
                        code: 0,
                        signal: None,
                    }),
                },
            ],
        }
    }

    #[tokio::test]
    async fn scripted_child_walks_the_script() {
        let mut child = ScriptedChild::new(script());
        let prompt = PatternSet::single(r"sqlite> ").unwrap();

        child.expect(&prompt, Duration::from_millis(100)).await.unwrap();
        assert_eq!(child.before(), b"SQLite version 3\n");

        child.sendline("select 1;").await.unwrap();
        child.expect(&prompt, Duration::from_millis(100)).await.unwrap();
        assert_eq!(child.before(), b"1\n");

        assert!(child.is_alive());
        child.sendline(".quit").await.unwrap();
        assert!(!child.is_alive());
        assert_eq!(
            child.exit_status(),
            Some(ExitInfo {
                code: 0,
                signal: None
            })
        );
    }

    #[tokio::test]
    async fn scripted_child_rejects_out_of_script_input() {
        let mut child = ScriptedChild::new(script());
        let err = child.sendline("drop table x;").await.unwrap_err();
        assert!(matches!(err, Error::Config { field: "script", .. }));
    }

    #[tokio::test]
    async fn scripted_child_tees_output() {
        struct Collect(Arc<StdMutex<Vec<u8>>>);
        impl ByteSink for Collect {
            fn write(&mut self, bytes: &[u8]) {
                self.0
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .extend_from_slice(bytes);
            }
        }

        let mut child = ScriptedChild::new(script());
        let collected = Arc::new(StdMutex::new(Vec::new()));
        child.set_logfile_read(Box::new(Collect(Arc::clone(&collected))));

        let prompt = PatternSet::single(r"sqlite> ").unwrap();
        child.expect(&prompt, Duration::from_millis(100)).await.unwrap();
        child.sendline("select 1;").await.unwrap();
        child.expect(&prompt, Duration::from_millis(100)).await.unwrap();

        let bytes = collected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(bytes, b"SQLite version 3\nsqlite> 1\nsqlite> ");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_transport_runs_a_real_child() {
        let spec = SpawnSpec {
            program: "cat".into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: std::env::temp_dir(),
            pty: PtySize::default(),
        };
        let mut child = ProcessTransport::spawn(&spec).unwrap();
        child.sendline("hello").await.unwrap();
        let set = PatternSet::single(r"hello").unwrap();
        child.expect(&set, Duration::from_secs(5)).await.unwrap();

        let exit = child.terminate(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.map(|e| e.code), Some(0));
        assert!(!child.is_alive());
    }
}
