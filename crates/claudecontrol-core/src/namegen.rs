//! Pluggable tape naming.
//!
//! The default layout is `<program_basename>/unnamed-<epoch_ms>-<hash8>.json5`
//! under the tapes root, with the digest derived from the invocation and the
//! last input preview so concurrent recordings do not collide.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Inputs available to a name generator.
#[derive(Debug, Clone)]
pub struct NameContext {
    /// Program as invoked.
    pub program: String,
    /// Preview of the most recent input (may be empty).
    pub input_preview: String,
}

/// Resolves the relative path a new tape is written to.
pub trait TapeNameGenerator: Send + Sync {
    fn generate(&self, ctx: &NameContext) -> PathBuf;
}

/// `<program_basename>/unnamed-<epoch_ms>-<hash8>.json5`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNameGenerator;

impl TapeNameGenerator for DefaultNameGenerator {
    fn generate(&self, ctx: &NameContext) -> PathBuf {
        let epoch_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        let mut hasher = Sha256::new();
        hasher.update(ctx.program.as_bytes());
        hasher.update(b"|");
        hasher.update(ctx.input_preview.as_bytes());
        hasher.update(b"|");
        hasher.update(epoch_ms.to_string().as_bytes());
        let digest = hasher.finalize();
        let hash8: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();

        let basename = program_basename(&ctx.program);
        PathBuf::from(basename).join(format!("unnamed-{epoch_ms}-{hash8}.json5"))
    }
}

/// A fixed tape name under the program's directory (`--name`).
#[derive(Debug, Clone)]
pub struct FixedNameGenerator {
    pub name: String,
}

impl TapeNameGenerator for FixedNameGenerator {
    fn generate(&self, ctx: &NameContext) -> PathBuf {
        let basename = program_basename(&ctx.program);
        let mut file = self.name.clone();
        if !file.ends_with(".json5") {
            file.push_str(".json5");
        }
        PathBuf::from(basename).join(file)
    }
}

/// Reuses an exact relative path; appending sessions target the tape their
/// invocation already matched.
#[derive(Debug, Clone)]
pub struct ExactPathGenerator {
    pub rel_path: PathBuf,
}

impl TapeNameGenerator for ExactPathGenerator {
    fn generate(&self, _ctx: &NameContext) -> PathBuf {
        self.rel_path.clone()
    }
}

fn program_basename(program: &str) -> String {
    let first_word = program.split_whitespace().next().unwrap_or("session");
    Path::new(first_word)
        .file_name()
        .map_or_else(|| "session".to_string(), |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_name_lands_under_program_basename() {
        let path = DefaultNameGenerator.generate(&NameContext {
            program: "/usr/bin/sqlite3".into(),
            input_preview: "select 1;".into(),
        });
        let mut parts = path.components();
        assert_eq!(parts.next().unwrap().as_os_str(), "sqlite3");
        let file = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file.starts_with("unnamed-"));
        assert!(file.ends_with(".json5"));
    }

    #[test]
    fn fixed_name_appends_extension() {
        let namegen = FixedNameGenerator {
            name: "smoke".into(),
        };
        let path = namegen.generate(&NameContext {
            program: "sqlite3".into(),
            input_preview: String::new(),
        });
        assert_eq!(path, PathBuf::from("sqlite3/smoke.json5"));
    }
}
