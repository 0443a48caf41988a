//! Tape loading, indexing, and atomic locked writes.
//!
//! The store owns every tape loaded for a session plus the normalized-key
//! index used by replay lookups. All paths exposed by the public API are
//! relative to the tapes root; writes go through a per-path advisory lock
//! and a temp-file rename so readers never observe a torn tape.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::codec;
use crate::error::{Error, NearMiss, Result, SchemaError, TapeMissReport};
use crate::keys::{KeyBuilder, KeyComponents, MatchingContext, NormalizedKey};
use crate::lock::TapeLock;
use crate::policy::RecordMode;
use crate::redact;
use crate::tape::{Exchange, Input, LatencySpec, Tape};

/// A tape held in memory together with its location.
#[derive(Debug, Clone)]
pub struct LoadedTape {
    /// Path relative to the tapes root.
    pub rel_path: PathBuf,
    pub tape: Tape,
}

#[derive(Debug, Clone)]
struct IndexedKey {
    key: NormalizedKey,
    components: KeyComponents,
    tape_idx: usize,
    exchange_idx: usize,
}

#[derive(Default)]
struct StoreInner {
    tapes: Vec<LoadedTape>,
    index: HashMap<NormalizedKey, (usize, usize)>,
    entries: Vec<IndexedKey>,
    used: BTreeSet<PathBuf>,
    new: BTreeSet<PathBuf>,
}

/// A successful replay lookup, cloned out of the store.
#[derive(Debug, Clone)]
pub struct MatchHit {
    pub tape_idx: usize,
    pub exchange_idx: usize,
    /// Tape path relative to the root.
    pub rel_path: PathBuf,
    pub exchange: Exchange,
    /// Per-tape policy overrides carried on the tape meta.
    pub latency: Option<LatencySpec>,
    pub error_rate: Option<u8>,
    pub seed: Option<u64>,
}

/// Loads, indexes, and writes tapes for one session.
pub struct TapeStore {
    root: PathBuf,
    builder: KeyBuilder,
    lock_retries: u32,
    inner: RwLock<StoreInner>,
}

impl TapeStore {
    /// Create a store rooted at `root`. Nothing is loaded yet.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, builder: KeyBuilder, lock_retries: u32) -> Self {
        Self {
            root: root.into(),
            builder,
            lock_retries,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// The tapes root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The key builder this store indexes with.
    #[must_use]
    pub fn builder(&self) -> &KeyBuilder {
        &self.builder
    }

    // ------------------------------------------------------------------
    // Loading and indexing
    // ------------------------------------------------------------------

    /// Walk the root recursively and load every `*.json5` tape, in
    /// lexicographic order of relative path. Tapes that fail to decode are
    /// returned as diagnostics; loading continues past them.
    pub fn load_all(&self) -> Vec<(PathBuf, SchemaError)> {
        let mut diagnostics = Vec::new();
        let mut files = Vec::new();
        collect_tape_files(&self.root, &self.root, &mut files);
        files.sort();

        let mut tapes = Vec::with_capacity(files.len());
        for rel_path in files {
            let abs = self.root.join(&rel_path);
            let bytes = match fs::read(&abs) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(path = %abs.display(), error = %err, "failed to read tape");
                    diagnostics.push((
                        rel_path,
                        SchemaError::new("$", format!("read failed: {err}")),
                    ));
                    continue;
                }
            };
            match codec::decode(&bytes) {
                Ok(tape) => tapes.push(LoadedTape { rel_path, tape }),
                Err(err) => {
                    tracing::warn!(path = %abs.display(), error = %err, "tape failed schema validation");
                    diagnostics.push((rel_path, err));
                }
            }
        }

        let mut inner = self.write_inner();
        inner.tapes = tapes;
        inner.index.clear();
        inner.entries.clear();
        diagnostics
    }

    /// Build the lookup index over every loaded exchange. Duplicate keys
    /// are logged; the first entry in load order wins.
    pub fn build_index(&self) {
        let mut inner = self.write_inner();
        let mut index = HashMap::new();
        let mut entries = Vec::new();
        for (tape_idx, loaded) in inner.tapes.iter().enumerate() {
            for (exchange_idx, exchange) in loaded.tape.exchanges.iter().enumerate() {
                let ctx = MatchingContext::for_exchange(&loaded.tape, exchange);
                let (key, components) = self.builder.build_key(&ctx, &exchange.input);
                if let Some((first_tape, first_ex)) = index.get(&key) {
                    tracing::debug!(
                        path = %loaded.rel_path.display(),
                        exchange = exchange_idx,
                        first_tape,
                        first_ex,
                        "duplicate tape key; first wins"
                    );
                } else {
                    index.insert(key, (tape_idx, exchange_idx));
                }
                entries.push(IndexedKey {
                    key,
                    components,
                    tape_idx,
                    exchange_idx,
                });
            }
        }
        inner.index = index;
        inner.entries = entries;
    }

    /// Resolve a runtime context + input to `(tape_idx, exchange_idx)`.
    #[must_use]
    pub fn find_match(&self, ctx: &MatchingContext, input: &Input) -> Option<(usize, usize)> {
        let (key, _) = self.builder.build_key(ctx, input);
        self.read_inner().index.get(&key).copied()
    }

    /// Like [`find_match`](Self::find_match) but clones the matched
    /// exchange and the per-tape policy overrides out of the store.
    #[must_use]
    pub fn lookup(&self, ctx: &MatchingContext, input: &Input) -> Option<MatchHit> {
        let (key, _) = self.builder.build_key(ctx, input);
        let inner = self.read_inner();
        let (tape_idx, exchange_idx) = *inner.index.get(&key)?;
        let loaded = &inner.tapes[tape_idx];
        Some(MatchHit {
            tape_idx,
            exchange_idx,
            rel_path: loaded.rel_path.clone(),
            exchange: loaded.tape.exchanges[exchange_idx].clone(),
            latency: loaded.tape.meta.latency,
            error_rate: loaded.tape.meta.error_rate,
            seed: loaded.tape.meta.seed,
        })
    }

    /// Build the diagnostic payload for a failed lookup: the wanted key
    /// components and the three nearest stored keys in hash space.
    #[must_use]
    pub fn miss_report(&self, ctx: &MatchingContext, input: &Input) -> TapeMissReport {
        let (key, wanted) = self.builder.build_key(ctx, input);
        let inner = self.read_inner();
        let mut ranked: Vec<(u32, &IndexedKey)> = inner
            .entries
            .iter()
            .map(|entry| (key.distance(entry.key), entry))
            .collect();
        ranked.sort_by_key(|(distance, entry)| (*distance, entry.tape_idx, entry.exchange_idx));
        let nearest = ranked
            .into_iter()
            .take(3)
            .map(|(distance, entry)| NearMiss {
                components: entry.components.clone(),
                distance,
                path: inner.tapes[entry.tape_idx].rel_path.clone(),
                exchange: entry.exchange_idx,
            })
            .collect();
        TapeMissReport { wanted, nearest }
    }

    // ------------------------------------------------------------------
    // Usage accounting
    // ------------------------------------------------------------------

    /// Record that a tape satisfied at least one lookup.
    pub fn mark_used(&self, rel_path: &Path) {
        self.write_inner().used.insert(rel_path.to_path_buf());
    }

    /// Record that a tape file was created during this session.
    pub fn mark_new(&self, rel_path: &Path) {
        self.write_inner().new.insert(rel_path.to_path_buf());
    }

    /// Relative paths of every loaded tape, in load order.
    #[must_use]
    pub fn all_paths(&self) -> Vec<PathBuf> {
        self.read_inner()
            .tapes
            .iter()
            .map(|loaded| loaded.rel_path.clone())
            .collect()
    }

    /// Tapes created during this session.
    #[must_use]
    pub fn new_paths(&self) -> BTreeSet<PathBuf> {
        self.read_inner().new.clone()
    }

    /// Tapes that satisfied at least one lookup.
    #[must_use]
    pub fn used_paths(&self) -> BTreeSet<PathBuf> {
        self.read_inner().used.clone()
    }

    /// Number of loaded tapes.
    #[must_use]
    pub fn tape_count(&self) -> usize {
        self.read_inner().tapes.len()
    }

    /// Snapshot of the loaded tapes (for listing tools).
    #[must_use]
    pub fn loaded(&self) -> Vec<LoadedTape> {
        self.read_inner().tapes.clone()
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Persist a tape under the record mode, relative to the root.
    ///
    /// `New` appends the non-duplicate exchanges of `tape` to whatever is
    /// already on disk at `rel_path`; `Overwrite` replaces the file;
    /// `Disabled` is a no-op. The write happens under the per-path lock
    /// via a temp file, fsync, and rename. Every written path is marked
    /// new for the exit summary; maintenance rewrites (`redact_all`) skip
    /// the marking.
    pub fn write_tape(&self, rel_path: &Path, tape: &Tape, mode: RecordMode) -> Result<()> {
        self.write_tape_inner(rel_path, tape, mode, true)
    }

    fn write_tape_inner(
        &self,
        rel_path: &Path,
        tape: &Tape,
        mode: RecordMode,
        mark_new: bool,
    ) -> Result<()> {
        if mode == RecordMode::Disabled {
            tracing::debug!(path = %rel_path.display(), "record disabled; skipping tape write");
            return Ok(());
        }

        let abs = self.root.join(rel_path);
        let _lock = TapeLock::acquire(&abs, self.lock_retries)?;
        let existed = abs.exists();

        let merged = if mode == RecordMode::New && existed {
            let bytes = fs::read(&abs).map_err(|source| Error::TapeIo {
                path: abs.clone(),
                op: "read",
                source,
            })?;
            let mut existing = codec::decode(&bytes)?;
            if existing.exchanges.iter().any(|ex| ex.exit.is_some()) {
                tracing::warn!(
                    path = %abs.display(),
                    "appending exchanges to a tape that already recorded an exit"
                );
            }
            let mut seen: BTreeSet<NormalizedKey> = existing
                .exchanges
                .iter()
                .map(|ex| self.exchange_key(&existing, ex))
                .collect();
            for exchange in &tape.exchanges {
                let key = self.exchange_key(tape, exchange);
                if seen.insert(key) {
                    existing.exchanges.push(exchange.clone());
                }
            }
            existing
        } else {
            tape.clone()
        };

        let encoded = codec::encode(&merged)?;
        write_atomic(&abs, &encoded)?;

        let rel = rel_path.to_path_buf();
        {
            let mut inner = self.write_inner();
            if let Some(loaded) = inner.tapes.iter_mut().find(|t| t.rel_path == rel) {
                loaded.tape = merged;
            } else {
                inner.tapes.push(LoadedTape {
                    rel_path: rel.clone(),
                    tape: merged,
                });
            }
        }
        self.build_index();

        if mark_new {
            self.mark_new(&rel);
        }
        Ok(())
    }

    /// First loaded tape recorded under the same canonical invocation, if
    /// any. Appending sessions target this tape so re-recordings extend the
    /// program's existing tape instead of scattering files.
    #[must_use]
    pub fn tape_for_invocation(&self, ctx: &MatchingContext) -> Option<PathBuf> {
        let wanted_command = self.builder.canonical_command(&ctx.program, &ctx.args);
        let wanted_env = self.builder.filter_env(&ctx.env);
        let inner = self.read_inner();
        inner
            .tapes
            .iter()
            .find(|loaded| {
                let meta = &loaded.tape.meta;
                self.builder.canonical_command(&meta.program, &meta.args) == wanted_command
                    && self.builder.filter_env(&meta.env) == wanted_env
                    && (self.builder.cwd_ignored() || meta.cwd == ctx.cwd)
            })
            .map(|loaded| loaded.rel_path.clone())
    }

    fn exchange_key(&self, tape: &Tape, exchange: &Exchange) -> NormalizedKey {
        let ctx = MatchingContext::for_exchange(tape, exchange);
        self.builder.build_key(&ctx, &exchange.input).0
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Re-validate every tape file on disk, collecting all violations.
    #[must_use]
    pub fn validate(&self, strict: bool) -> Vec<(PathBuf, SchemaError)> {
        let mut files = Vec::new();
        collect_tape_files(&self.root, &self.root, &mut files);
        files.sort();

        let mut failures = Vec::new();
        for rel_path in files {
            let abs = self.root.join(&rel_path);
            match fs::read(&abs) {
                Ok(bytes) => {
                    for err in codec::validate_bytes(&bytes, strict) {
                        failures.push((rel_path.clone(), err));
                    }
                }
                Err(err) => failures.push((
                    rel_path.clone(),
                    SchemaError::new("$", format!("read failed: {err}")),
                )),
            }
        }
        failures
    }

    /// Apply secret redaction to every loaded tape's inputs and outputs.
    ///
    /// Returns `(rel_path, changed)` per tape. With `inplace`, each
    /// modified tape is atomically rewritten.
    pub fn redact_all(&self, inplace: bool) -> Result<Vec<(PathBuf, bool)>> {
        let tapes = self.loaded();
        let mut results = Vec::with_capacity(tapes.len());
        for mut loaded in tapes {
            let changed = redact_tape(&mut loaded.tape)
                .map_err(|reason| Error::Redaction {
                    path: loaded.rel_path.clone(),
                    reason,
                })?;
            if changed && inplace {
                self.write_tape_inner(&loaded.rel_path, &loaded.tape, RecordMode::Overwrite, false)?;
            }
            results.push((loaded.rel_path, changed));
        }
        Ok(results)
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Redact one tape in place; returns whether anything changed.
fn redact_tape(tape: &mut Tape) -> std::result::Result<bool, String> {
    let mut changed = false;
    for exchange in &mut tape.exchanges {
        match &mut exchange.input {
            Input::Line(text) => {
                let redacted = redact::force_redact(text.as_bytes());
                if redacted != text.as_bytes() {
                    *text = String::from_utf8(redacted)
                        .map_err(|err| format!("redacted input is not UTF-8: {err}"))?;
                    changed = true;
                }
            }
            Input::Raw(bytes) => {
                let redacted = redact::force_redact(bytes);
                if redacted != *bytes {
                    *bytes = redacted;
                    changed = true;
                }
            }
        }
        for chunk in &mut exchange.output {
            let redacted = redact::force_redact(&chunk.data);
            if redacted != chunk.data {
                chunk.is_utf8 = std::str::from_utf8(&redacted).is_ok();
                chunk.data = redacted;
                changed = true;
            }
        }
    }
    Ok(changed)
}

/// Recursively collect `*.json5` files as paths relative to `root`.
fn collect_tape_files(dir: &Path, root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_tape_files(&path, root, out);
        } else if path.extension().is_some_and(|ext| ext == "json5") {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
}

/// Write bytes atomically: temp sibling, fsync, rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| Error::TapeIo {
            path: path.to_path_buf(),
            op: "mkdir",
            source,
        })?;
    }
    let tmp = {
        let mut name = path
            .file_name()
            .map_or_else(|| "tape".to_string(), |n| n.to_string_lossy().into_owned());
        name.push_str(".tmp");
        path.with_file_name(name)
    };
    let mut file = fs::File::create(&tmp).map_err(|source| Error::TapeIo {
        path: path.to_path_buf(),
        op: "create temp",
        source,
    })?;
    file.write_all(bytes).map_err(|source| Error::TapeIo {
        path: path.to_path_buf(),
        op: "write",
        source,
    })?;
    file.sync_all().map_err(|source| Error::TapeIo {
        path: path.to_path_buf(),
        op: "fsync",
        source,
    })?;
    drop(file);
    fs::rename(&tmp, path).map_err(|source| Error::TapeIo {
        path: path.to_path_buf(),
        op: "rename",
        source,
    })
}
