//! Session facade: transport selection, recorder wiring, exit summary.
//!
//! A session owns one tape store for its lifetime. Replay is viable when
//! recording is disabled or the fallback is proxy; such sessions start on
//! the replay transport without spawning a child. A miss under proxy
//! fallback swaps in the live collaborator (recorder attached) and the
//! remainder of the session stays live. Pure-record sessions (recording
//! enabled, `not_found` fallback) spawn the child up front.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::child::{PtySpawner, SpawnSpec};
use crate::error::{Error, Result, SchemaError};
use crate::keys::{KeyBuilder, KeyPolicy, MatchingContext};
use crate::namegen::{
    DefaultNameGenerator, ExactPathGenerator, FixedNameGenerator, TapeNameGenerator,
};
use crate::policy::{
    resolve_session_seed, ErrorPolicy, FallbackMode, InjectMode, LatencyPolicy, RecordMode,
};
use crate::record::{Decorators, EndReason, Recorder, RecorderMeta};
use crate::redact::redaction_enabled;
use crate::replay::{ReplayOptions, ReplayTransport};
use crate::store::TapeStore;
use crate::summary::print_summary;
use crate::tape::{ExitInfo, Input, LatencySpec, PtySize};
use crate::transport::{Pattern, PatternSet, Transport};

/// Session construction parameters.
#[derive(Clone)]
pub struct SessionConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub tapes_root: PathBuf,
    pub record: RecordMode,
    pub fallback: FallbackMode,
    pub latency: LatencyPolicy,
    pub error_rate: ErrorPolicy,
    pub inject_mode: InjectMode,
    pub seed: Option<u64>,
    pub key_policy: KeyPolicy,
    pub decorators: Decorators,
    /// Print the exit summary on close.
    pub summary: bool,
    pub pty: PtySize,
    pub tag: Option<String>,
    /// Fixed tape name (`--name`); default naming otherwise.
    pub tape_name: Option<String>,
    /// Default timeout for expect calls.
    pub default_timeout: Duration,
    /// Grace period before a live child is killed on close.
    pub grace: Duration,
    /// Retry budget for tape lock acquisition.
    pub lock_retries: u32,
}

impl SessionConfig {
    /// Defaults for driving `program` against `./tapes`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            tapes_root: PathBuf::from("./tapes"),
            record: RecordMode::New,
            fallback: FallbackMode::Proxy,
            latency: LatencyPolicy::Recorded,
            error_rate: ErrorPolicy::Off,
            inject_mode: InjectMode::Truncate,
            seed: None,
            key_policy: KeyPolicy::default(),
            decorators: Decorators::default(),
            summary: true,
            pty: PtySize::default(),
            tag: None,
            tape_name: None,
            default_timeout: Duration::from_secs(30),
            grace: Duration::from_secs(2),
            lock_retries: 100,
        }
    }
}

enum ActiveTransport<H> {
    Replay(Box<ReplayTransport>),
    Live(H),
}

/// One controlled session over either transport.
pub struct Session<S: PtySpawner> {
    config: SessionConfig,
    spawner: S,
    store: Arc<TapeStore>,
    transport: ActiveTransport<S::Handle>,
    recorder: Option<Recorder>,
    /// Signature of the last matched prompt, used as the next pre-context.
    prompt: Option<String>,
    state_hash: Option<String>,
    session_seed: u64,
    load_diagnostics: Vec<(PathBuf, SchemaError)>,
    primed: bool,
    closed: bool,
}

impl<S: PtySpawner> Session<S> {
    /// Build the store, load and index tapes, and select the transport.
    pub fn start(config: SessionConfig, spawner: S) -> Result<Self> {
        let builder = KeyBuilder::new(config.key_policy.clone());
        let store = Arc::new(TapeStore::new(
            &config.tapes_root,
            builder,
            config.lock_retries,
        ));
        let load_diagnostics = store.load_all();
        for (path, err) in &load_diagnostics {
            tracing::warn!(path = %path.display(), error = %err, "skipping invalid tape");
        }
        store.build_index();

        let session_seed = resolve_session_seed(config.seed, &config.program, &config.args);
        if !redaction_enabled() && config.record != RecordMode::Disabled {
            tracing::warn!("secret redaction is disabled; tapes will store raw bytes");
        }

        // Replay is viable for playback sessions and for appending proxy
        // sessions. Overwrite re-records everything, so it always runs live.
        let replay_viable = config.record == RecordMode::Disabled
            || (config.record == RecordMode::New && config.fallback == FallbackMode::Proxy);

        let base_ctx = MatchingContext {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.to_string_lossy().into_owned(),
            prompt: None,
            state_hash: None,
        };
        let replay = ReplayTransport::new(
            Arc::clone(&store),
            base_ctx,
            ReplayOptions {
                latency: config.latency.clone(),
                error: config.error_rate.clone(),
                inject_mode: config.inject_mode,
                session_seed,
            },
        );

        let mut session = Self {
            config,
            spawner,
            store,
            transport: ActiveTransport::Replay(Box::new(replay)),
            recorder: None,
            prompt: None,
            state_hash: None,
            session_seed,
            load_diagnostics,
            primed: false,
            closed: false,
        };
        if !replay_viable {
            let handle = session.spawn_live()?;
            session.transport = ActiveTransport::Live(handle);
        }
        Ok(session)
    }

    /// Spawn the live collaborator and attach a fresh recorder to its read
    /// stream.
    fn spawn_live(&mut self) -> Result<S::Handle> {
        let spec = SpawnSpec {
            program: self.config.program.clone(),
            args: self.config.args.clone(),
            env: self.config.env.clone(),
            cwd: self.config.cwd.clone(),
            pty: self.config.pty,
        };
        let mut handle = self.spawner.spawn(&spec)?;

        let mut recorder = Recorder::new(self.recorder_meta(), self.config.decorators.clone());
        handle.set_logfile_read(Box::new(recorder.sink()));
        recorder.begin_startup(&self.context());
        self.recorder = Some(recorder);
        Ok(handle)
    }

    fn recorder_meta(&self) -> RecorderMeta {
        let latency = match &self.config.latency {
            LatencyPolicy::Const(ms) => Some(LatencySpec::Const(*ms)),
            LatencyPolicy::Range(lo, hi) => Some(LatencySpec::Range(*lo, *hi)),
            LatencyPolicy::Recorded | LatencyPolicy::Fn(_) => None,
        };
        let error_rate = match &self.config.error_rate {
            ErrorPolicy::Const(rate) if *rate > 0 => Some(*rate),
            _ => None,
        };
        RecorderMeta {
            program: self.config.program.clone(),
            args: self.config.args.clone(),
            env: self.store.builder().filter_env(&self.config.env),
            cwd: self.config.cwd.to_string_lossy().into_owned(),
            pty: self.config.pty,
            tag: self.config.tag.clone(),
            latency,
            error_rate,
            seed: self.config.seed,
            platform: std::env::consts::OS.to_string(),
            version: crate::VERSION.to_string(),
        }
    }

    /// The matching context for the current session state.
    #[must_use]
    pub fn context(&self) -> MatchingContext {
        MatchingContext {
            program: self.config.program.clone(),
            args: self.config.args.clone(),
            env: self.config.env.clone(),
            cwd: self.config.cwd.to_string_lossy().into_owned(),
            prompt: self.prompt.clone(),
            state_hash: self.state_hash.clone(),
        }
    }

    /// The session's tape store.
    #[must_use]
    pub fn store(&self) -> &Arc<TapeStore> {
        &self.store
    }

    /// Schema diagnostics collected while loading the tapes root.
    #[must_use]
    pub fn load_diagnostics(&self) -> &[(PathBuf, SchemaError)] {
        &self.load_diagnostics
    }

    /// Set the opaque state hash appended to subsequent match keys.
    pub fn set_state_hash(&mut self, state_hash: Option<String>) {
        self.state_hash = state_hash;
    }

    /// The resolved session seed driving latency and fault draws.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.session_seed
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Send raw bytes.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        self.dispatch_send(Input::Raw(bytes.to_vec())).await
    }

    /// Send a newline-terminated line.
    pub async fn sendline(&mut self, text: &str) -> Result<usize> {
        self.dispatch_send(Input::Line(text.to_string())).await
    }

    async fn dispatch_send(&mut self, input: Input) -> Result<usize> {
        if self.closed {
            return Err(Error::Cancelled);
        }
        self.primed = true;
        let ctx = self.context();

        enum Route {
            Done(Result<usize>),
            Fallback,
        }

        let route = match &mut self.transport {
            ActiveTransport::Live(handle) => {
                if let Some(recorder) = &mut self.recorder {
                    recorder.on_send(&ctx, input.clone());
                }
                Route::Done(handle.send(&input.wire_bytes()).await)
            }
            ActiveTransport::Replay(replay) => {
                replay.set_prompt(self.prompt.clone());
                replay.set_state_hash(self.state_hash.clone());
                let result = match &input {
                    Input::Line(text) => replay.sendline(text).await,
                    Input::Raw(bytes) => replay.send(bytes).await,
                };
                match result {
                    Err(err @ Error::TapeMiss(_)) => {
                        if self.config.fallback == FallbackMode::Proxy {
                            Route::Fallback
                        } else {
                            Route::Done(Err(err))
                        }
                    }
                    other => Route::Done(other),
                }
            }
        };

        match route {
            Route::Done(result) => result,
            Route::Fallback => {
                tracing::debug!("tape miss; falling back to live child");
                self.switch_to_live(input).await
            }
        }
    }

    /// Proxy fallback: spawn the live child, attach the recorder, and
    /// replay the missed input against it. The session stays live.
    async fn switch_to_live(&mut self, input: Input) -> Result<usize> {
        let mut handle = self.spawn_live()?;
        let ctx = self.context();
        if let Some(recorder) = &mut self.recorder {
            recorder.on_send(&ctx, input.clone());
        }
        let sent = handle.send(&input.wire_bytes()).await?;
        self.transport = ActiveTransport::Live(handle);
        Ok(sent)
    }

    // ------------------------------------------------------------------
    // Expect path
    // ------------------------------------------------------------------

    /// Wait for the first pattern in the set; returns its index.
    pub async fn expect(
        &mut self,
        patterns: &PatternSet,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        if self.closed {
            return Err(Error::Cancelled);
        }

        // Before anything is sent, resolve the startup banner: replay it
        // from the tape when recorded, otherwise (recording enabled, proxy
        // fallback) go live so the real banner flows.
        let mut go_live_for_banner = false;
        if let ActiveTransport::Replay(replay) = &mut self.transport {
            if !self.primed {
                self.primed = true;
                let primed = replay.prime_startup();
                if !primed
                    && self.config.record != RecordMode::Disabled
                    && self.config.fallback == FallbackMode::Proxy
                {
                    go_live_for_banner = true;
                }
            }
        }
        if go_live_for_banner {
            tracing::debug!("no recorded startup exchange; spawning live child");
            let handle = self.spawn_live()?;
            self.transport = ActiveTransport::Live(handle);
        }

        let ctx = self.context();
        match &mut self.transport {
            ActiveTransport::Replay(replay) => {
                let index = replay.expect(patterns, timeout).await?;
                if matches!(
                    patterns.0.get(index),
                    Some(Pattern::Regex(_) | Pattern::Exact(_))
                ) {
                    self.prompt = Some(String::from_utf8_lossy(replay.last_match()).into_owned());
                }
                Ok(index)
            }
            ActiveTransport::Live(handle) => {
                let result = handle.expect(patterns, timeout).await;
                match result {
                    Ok(index) => {
                        let reason = match patterns.0.get(index) {
                            Some(Pattern::Eof) => {
                                EndReason::ChildExited(handle.exit_status().unwrap_or(ExitInfo {
                                    code: -1,
                                    signal: None,
                                }))
                            }
                            Some(Pattern::Timeout) => EndReason::Timeout,
                            _ => EndReason::PromptMatched,
                        };
                        if matches!(reason, EndReason::PromptMatched) {
                            self.prompt =
                                Some(String::from_utf8_lossy(handle.last_match()).into_owned());
                        }
                        if let Some(recorder) = &mut self.recorder {
                            recorder.on_exchange_end(&ctx, reason);
                        }
                        Ok(index)
                    }
                    Err(err @ Error::ExpectTimeout { .. }) => {
                        if let Some(recorder) = &mut self.recorder {
                            recorder.on_exchange_end(&ctx, EndReason::Timeout);
                        }
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Wait for the first literal in the set; returns its index.
    pub async fn expect_exact(
        &mut self,
        literals: &[&[u8]],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let set = PatternSet::exacts(literals);
        self.expect(&set, timeout).await
    }

    // ------------------------------------------------------------------
    // Observables
    // ------------------------------------------------------------------

    #[must_use]
    pub fn before(&self) -> &[u8] {
        match &self.transport {
            ActiveTransport::Replay(replay) => replay.before(),
            ActiveTransport::Live(handle) => handle.before(),
        }
    }

    #[must_use]
    pub fn last_match(&self) -> &[u8] {
        match &self.transport {
            ActiveTransport::Replay(replay) => replay.last_match(),
            ActiveTransport::Live(handle) => handle.last_match(),
        }
    }

    #[must_use]
    pub fn after(&self) -> &[u8] {
        match &self.transport {
            ActiveTransport::Replay(replay) => replay.after(),
            ActiveTransport::Live(handle) => handle.after(),
        }
    }

    #[must_use]
    pub fn match_span(&self) -> Option<(usize, usize)> {
        match &self.transport {
            ActiveTransport::Replay(replay) => replay.match_span(),
            ActiveTransport::Live(handle) => handle.match_span(),
        }
    }

    #[must_use]
    pub fn exit_status(&self) -> Option<ExitInfo> {
        match &self.transport {
            ActiveTransport::Replay(replay) => replay.exit_status(),
            ActiveTransport::Live(handle) => handle.exit_status(),
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        if self.closed {
            return false;
        }
        match &self.transport {
            ActiveTransport::Replay(replay) => replay.is_alive(),
            ActiveTransport::Live(handle) => handle.is_alive(),
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Terminate the child (live), finalize the recorder, and print the
    /// summary. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let grace = self.config.grace;
        let ctx = self.context();
        match &mut self.transport {
            ActiveTransport::Live(handle) => {
                let exit = handle.terminate(grace).await?;
                if let Some(recorder) = &mut self.recorder {
                    let reason = exit.map_or(EndReason::PromptMatched, EndReason::ChildExited);
                    recorder.on_exchange_end(&ctx, reason);
                    let namegen: Box<dyn TapeNameGenerator> = match &self.config.tape_name {
                        Some(name) => Box::new(FixedNameGenerator { name: name.clone() }),
                        None => match self.store.tape_for_invocation(&ctx) {
                            Some(rel_path) => Box::new(ExactPathGenerator { rel_path }),
                            None => Box::new(DefaultNameGenerator),
                        },
                    };
                    recorder.finalize(&self.store, namegen.as_ref(), &ctx, self.config.record)?;
                }
            }
            ActiveTransport::Replay(replay) => {
                replay.terminate(grace).await?;
            }
        }

        if self.config.summary {
            print_summary(&self.store);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    use crate::child::{Script, ScriptedSpawner, ScriptedStep};

    fn sqlite_script() -> Script {
        Script {
            banner: vec![b"sqlite> ".to_vec()],
            steps: vec![ScriptedStep {
                input: b"select 1;".to_vec(),
                chunks: vec![b"1\n".to_vec(), b"sqlite> ".to_vec()],
                exit: None,
            }],
        }
    }

    fn config(dir: &TempDir, record: RecordMode, fallback: FallbackMode) -> SessionConfig {
        let mut config = SessionConfig::new("sqlite3");
        config.args = vec!["-batch".into()];
        config.cwd = PathBuf::from("/tmp");
        config.tapes_root = dir.path().to_path_buf();
        config.record = record;
        config.fallback = fallback;
        config.latency = LatencyPolicy::Const(0);
        config.summary = false;
        config.seed = Some(42);
        config.default_timeout = Duration::from_secs(2);
        config
    }

    async fn record_base_tape(dir: &TempDir) {
        let prompt = PatternSet::single(r"sqlite> ").unwrap();
        let cfg = config(dir, RecordMode::New, FallbackMode::Proxy);
        let spawner = ScriptedSpawner {
            script: sqlite_script(),
        };
        let mut session = Session::start(cfg, spawner).unwrap();
        session.expect(&prompt, None).await.unwrap();
        session.sendline("select 1;").await.unwrap();
        session.expect(&prompt, None).await.unwrap();
        assert_eq!(session.before(), b"1\n");
        session.close().await.unwrap();
        assert_eq!(session.store().new_paths().len(), 1);
    }

    #[tokio::test]
    async fn record_then_replay_round_trip() {
        let dir = TempDir::new().unwrap();
        record_base_tape(&dir).await;

        // Replay the same inputs without any child.
        let prompt = PatternSet::single(r"sqlite> ").unwrap();
        let cfg = config(&dir, RecordMode::Disabled, FallbackMode::NotFound);
        let mut session = Session::start(cfg, ScriptedSpawner::default()).unwrap();
        session.expect(&prompt, None).await.unwrap();
        session.sendline("select 1;").await.unwrap();
        session.expect(&prompt, None).await.unwrap();
        assert_eq!(session.before(), b"1\n");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn strict_miss_raises_tape_miss() {
        let dir = TempDir::new().unwrap();
        record_base_tape(&dir).await;

        let prompt = PatternSet::single(r"sqlite> ").unwrap();
        let cfg = config(&dir, RecordMode::Disabled, FallbackMode::NotFound);
        let mut session = Session::start(cfg, ScriptedSpawner::default()).unwrap();
        session.expect(&prompt, None).await.unwrap();
        let err = session.sendline("select 2;").await.unwrap_err();
        assert!(err.is_tape_miss());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn proxy_fallback_appends_to_the_same_tape() {
        let dir = TempDir::new().unwrap();
        record_base_tape(&dir).await;

        // Proxy session: `select 1;` replays, `select 2;` goes live and is
        // appended to the existing tape on close.
        let script = Script {
            banner: Vec::new(),
            steps: vec![ScriptedStep {
                input: b"select 2;".to_vec(),
                chunks: vec![b"2\n".to_vec(), b"sqlite> ".to_vec()],
                exit: None,
            }],
        };
        let prompt = PatternSet::single(r"sqlite> ").unwrap();
        let cfg = config(&dir, RecordMode::New, FallbackMode::Proxy);
        let mut session = Session::start(cfg, ScriptedSpawner { script }).unwrap();

        session.expect(&prompt, None).await.unwrap();
        session.sendline("select 1;").await.unwrap();
        session.expect(&prompt, None).await.unwrap();
        assert_eq!(session.before(), b"1\n");

        session.sendline("select 2;").await.unwrap();
        session.expect(&prompt, None).await.unwrap();
        assert_eq!(session.before(), b"2\n");
        session.close().await.unwrap();

        // One tape file, exchanges in order: banner, select 1;, select 2;.
        let paths = session.store().all_paths();
        assert_eq!(paths.len(), 1);
        let tape =
            crate::codec::decode(&std::fs::read(dir.path().join(&paths[0])).unwrap()).unwrap();
        let inputs: Vec<&Input> = tape.exchanges.iter().map(|ex| &ex.input).collect();
        assert_eq!(
            inputs,
            vec![
                &Input::empty(),
                &Input::Line("select 1;".into()),
                &Input::Line("select 2;".into()),
            ]
        );
        assert!(session.store().new_paths().contains(&paths[0]));
    }

    #[tokio::test]
    async fn overwrite_replaces_the_tape() {
        let dir = TempDir::new().unwrap();
        record_base_tape(&dir).await;

        let prompt = PatternSet::single(r"sqlite> ").unwrap();
        let cfg = config(&dir, RecordMode::Overwrite, FallbackMode::Proxy);
        let mut session = Session::start(
            cfg,
            ScriptedSpawner {
                script: sqlite_script(),
            },
        )
        .unwrap();
        // Overwrite always runs live; the scripted child answers again.
        session.expect(&prompt, None).await.unwrap();
        session.sendline("select 1;").await.unwrap();
        session.expect(&prompt, None).await.unwrap();
        session.close().await.unwrap();

        // The session's exchanges replaced the existing tape wholesale.
        let paths = session.store().all_paths();
        assert_eq!(paths.len(), 1);
        let tape =
            crate::codec::decode(&std::fs::read(dir.path().join(&paths[0])).unwrap()).unwrap();
        assert_eq!(tape.exchanges.len(), 2); // banner + select 1;
        assert_eq!(tape.exchanges[1].output_bytes(), b"1\nsqlite> ");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, RecordMode::Disabled, FallbackMode::NotFound);
        let mut session = Session::start(cfg, ScriptedSpawner::default()).unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn disabled_record_never_touches_the_tapes_root() {
        let dir = TempDir::new().unwrap();
        record_base_tape(&dir).await;
        let listing_before = walk(dir.path());

        let prompt = PatternSet::single(r"sqlite> ").unwrap();
        let cfg = config(&dir, RecordMode::Disabled, FallbackMode::NotFound);
        let mut session = Session::start(cfg, ScriptedSpawner::default()).unwrap();
        session.expect(&prompt, None).await.unwrap();
        session.sendline("select 1;").await.unwrap();
        session.expect(&prompt, None).await.unwrap();
        session.close().await.unwrap();

        assert_eq!(walk(dir.path()), listing_before);
    }

    fn walk(root: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        fn rec(dir: &Path, out: &mut Vec<PathBuf>) {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        rec(&path, out);
                    } else {
                        out.push(path);
                    }
                }
            }
        }
        rec(root, &mut out);
        out.sort();
        out
    }
}
