//! Normalized lookup keys for exchange matching.
//!
//! A key is a 128-bit fingerprint over the normalized invocation context
//! and input. Two contexts that normalize identically always produce the
//! same key, which is what makes replay lookups deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_128_with_seed;

use crate::normalize::prompt_signature;
use crate::tape::{Exchange, Input, Tape};

/// Fixed seed so keys are stable across processes and runs.
const KEY_SEED: u64 = 0x7461_7065_6465_636b;

/// Field separator inside the hashed material.
const FIELD_SEP: u8 = 0x1f;
/// Element separator inside list-valued fields.
const ITEM_SEP: u8 = 0x1e;

/// Sentinel accepted in `ignore_args` that excludes the cwd from keys.
pub const CWD_SENTINEL: &str = "cwd";

/// An opaque, order-independent exchange fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedKey(pub u128);

impl NormalizedKey {
    /// Hamming distance to another key in hash space.
    #[must_use]
    pub fn distance(self, other: Self) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

/// One `--ignore-args` entry: a positional index or a literal value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreArg {
    /// Remove the argument at this position.
    Index(usize),
    /// Remove every argument equal to this literal.
    Value(String),
}

impl std::str::FromStr for IgnoreArg {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.parse::<usize>().map_or_else(
            |_| Self::Value(s.to_string()),
            Self::Index,
        ))
    }
}

/// Canonicalization hook replacing the default program/args normalization.
pub type CommandMatcher = Arc<dyn Fn(&str, &[String]) -> (String, Vec<String>) + Send + Sync>;

/// Canonicalization hook for input bytes before they enter the key.
pub type StdinMatcher = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Allow/ignore policy governing which context fields enter the key.
#[derive(Clone, Default)]
pub struct KeyPolicy {
    /// When set, only these env keys are admitted.
    pub allow_env: Option<BTreeSet<String>>,
    /// Env keys removed when `allow_env` is unset.
    pub ignore_env: BTreeSet<String>,
    /// Arguments removed by index or literal value; may contain [`CWD_SENTINEL`].
    pub ignore_args: Vec<IgnoreArg>,
    /// Blank the input portion of the key entirely.
    pub ignore_stdin: bool,
    /// Custom command canonicalization.
    pub command_matcher: Option<CommandMatcher>,
    /// Custom stdin canonicalization.
    pub stdin_matcher: Option<StdinMatcher>,
}

impl fmt::Debug for KeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPolicy")
            .field("allow_env", &self.allow_env)
            .field("ignore_env", &self.ignore_env)
            .field("ignore_args", &self.ignore_args)
            .field("ignore_stdin", &self.ignore_stdin)
            .field("command_matcher", &self.command_matcher.is_some())
            .field("stdin_matcher", &self.stdin_matcher.is_some())
            .finish()
    }
}

/// Runtime context a key is built from.
#[derive(Debug, Clone, Default)]
pub struct MatchingContext {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    /// Raw prompt; normalized inside the builder.
    pub prompt: Option<String>,
    /// Caller-supplied opaque state disambiguator.
    pub state_hash: Option<String>,
}

impl MatchingContext {
    /// Build the context a stored exchange was recorded under.
    #[must_use]
    pub fn for_exchange(tape: &Tape, exchange: &Exchange) -> Self {
        Self {
            program: tape.meta.program.clone(),
            args: tape.meta.args.clone(),
            env: tape.meta.env.clone(),
            cwd: tape.meta.cwd.clone(),
            prompt: Some(exchange.pre.prompt.clone()),
            state_hash: exchange.pre.state_hash.clone(),
        }
    }
}

/// Human-inspectable key material, kept for miss diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct KeyComponents {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// `None` when the cwd sentinel excluded it.
    pub cwd: Option<String>,
    pub prompt: String,
    /// Lossy preview of the normalized input bytes (truncated).
    pub input_preview: String,
    pub state_hash: Option<String>,
}

impl fmt::Display for KeyComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "program={} args={:?} prompt={:?} input={:?}",
            self.program, self.args, self.prompt, self.input_preview
        )
    }
}

impl KeyComponents {
    /// Field-by-field differences against another key, for miss messages.
    #[must_use]
    pub fn diff(&self, other: &Self) -> Vec<String> {
        let mut out = Vec::new();
        if self.program != other.program {
            out.push(format!("program: {:?} != {:?}", self.program, other.program));
        }
        if self.args != other.args {
            out.push(format!("args: {:?} != {:?}", self.args, other.args));
        }
        if self.env != other.env {
            out.push(format!("env: {:?} != {:?}", self.env, other.env));
        }
        if self.cwd != other.cwd {
            out.push(format!("cwd: {:?} != {:?}", self.cwd, other.cwd));
        }
        if self.prompt != other.prompt {
            out.push(format!("prompt: {:?} != {:?}", self.prompt, other.prompt));
        }
        if self.input_preview != other.input_preview {
            out.push(format!(
                "input: {:?} != {:?}",
                self.input_preview, other.input_preview
            ));
        }
        if self.state_hash != other.state_hash {
            out.push(format!(
                "stateHash: {:?} != {:?}",
                self.state_hash, other.state_hash
            ));
        }
        out
    }
}

/// Builds normalized keys under a [`KeyPolicy`].
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    policy: KeyPolicy,
}

impl KeyBuilder {
    #[must_use]
    pub fn new(policy: KeyPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// Whether the cwd sentinel excludes the working directory from keys.
    #[must_use]
    pub fn cwd_ignored(&self) -> bool {
        self.policy
            .ignore_args
            .iter()
            .any(|arg| matches!(arg, IgnoreArg::Value(v) if v == CWD_SENTINEL))
    }

    /// Env entries admitted by the allow/ignore policy, sorted by key.
    #[must_use]
    pub fn filter_env(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        env.iter()
            .filter(|(key, _)| match &self.policy.allow_env {
                Some(allow) => allow.contains(*key),
                None => !self.policy.ignore_env.contains(*key),
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Program basename and filtered args (or the custom matcher's output).
    #[must_use]
    pub fn canonical_command(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        if let Some(matcher) = &self.policy.command_matcher {
            return matcher(program, args);
        }
        let basename = Path::new(program)
            .file_name()
            .map_or_else(|| program.to_string(), |name| name.to_string_lossy().into_owned());
        let args = args
            .iter()
            .enumerate()
            .filter(|(index, value)| {
                !self.policy.ignore_args.iter().any(|ignored| match ignored {
                    IgnoreArg::Index(i) => i == index,
                    IgnoreArg::Value(v) => v == *value,
                })
            })
            .map(|(_, value)| value.clone())
            .collect();
        (basename, args)
    }

    fn input_key_bytes(&self, input: &Input) -> Vec<u8> {
        if self.policy.ignore_stdin {
            return Vec::new();
        }
        let bytes = input.match_bytes();
        match &self.policy.stdin_matcher {
            Some(matcher) => matcher(bytes),
            None => bytes.to_vec(),
        }
    }

    /// Build the key and its inspectable components for a context + input.
    #[must_use]
    pub fn build_key(&self, ctx: &MatchingContext, input: &Input) -> (NormalizedKey, KeyComponents) {
        let (program, args) = self.canonical_command(&ctx.program, &ctx.args);
        let env = self.filter_env(&ctx.env);
        let cwd = (!self.cwd_ignored()).then(|| ctx.cwd.clone());
        let prompt = prompt_signature(ctx.prompt.as_deref().unwrap_or(""));
        let input_bytes = self.input_key_bytes(input);

        let mut material = Vec::with_capacity(128);
        material.extend_from_slice(program.as_bytes());
        material.push(FIELD_SEP);
        for arg in &args {
            material.extend_from_slice(arg.as_bytes());
            material.push(ITEM_SEP);
        }
        material.push(FIELD_SEP);
        for (key, value) in &env {
            material.extend_from_slice(key.as_bytes());
            material.push(b'=');
            material.extend_from_slice(value.as_bytes());
            material.push(ITEM_SEP);
        }
        material.push(FIELD_SEP);
        if let Some(cwd) = &cwd {
            material.extend_from_slice(cwd.as_bytes());
        }
        material.push(FIELD_SEP);
        material.extend_from_slice(prompt.as_bytes());
        material.push(FIELD_SEP);
        material.extend_from_slice(&input_bytes);
        material.push(FIELD_SEP);
        if let Some(state) = &ctx.state_hash {
            material.extend_from_slice(state.as_bytes());
        }

        let key = NormalizedKey(xxh3_128_with_seed(&material, KEY_SEED));
        let components = KeyComponents {
            program,
            args,
            env: env.into_iter().collect(),
            cwd,
            prompt,
            input_preview: preview(&input_bytes),
            state_hash: ctx.state_hash.clone(),
        };
        (key, components)
    }
}

fn preview(bytes: &[u8]) -> String {
    const LIMIT: usize = 64;
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= LIMIT {
        text.into_owned()
    } else {
        let mut cut = LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    }
}
