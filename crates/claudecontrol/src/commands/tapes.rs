//! `tapes {list, validate, redact, diff}` maintenance tools.

use std::path::Path;

use claudecontrol_core::codec;
use claudecontrol_core::error::{Error, Result};
use claudecontrol_core::keys::KeyBuilder;
use claudecontrol_core::store::TapeStore;
use claudecontrol_core::tape::{Exchange, Input, Tape};

use crate::cli::{TapesArgs, TapesCommand};

const LOCK_RETRIES: u32 = 100;

/// Run one `tapes` subcommand; returns the process exit code.
pub fn run(args: &TapesArgs) -> Result<i32> {
    match &args.command {
        TapesCommand::List => list(&args.tapes),
        TapesCommand::Validate { strict } => validate(&args.tapes, *strict),
        TapesCommand::Redact { inplace } => redact(&args.tapes, *inplace),
        TapesCommand::Diff { a, b } => diff(a, b),
    }
}

fn open_store(root: &Path) -> (TapeStore, usize) {
    let store = TapeStore::new(root, KeyBuilder::default(), LOCK_RETRIES);
    let diagnostics = store.load_all();
    for (path, err) in &diagnostics {
        eprintln!("warning: {}: {err}", path.display());
    }
    (store, diagnostics.len())
}

fn list(root: &Path) -> Result<i32> {
    let (store, skipped) = open_store(root);
    for loaded in store.loaded() {
        let meta = &loaded.tape.meta;
        println!(
            "{}  program={} exchanges={} createdAt={}",
            loaded.rel_path.display(),
            meta.program,
            loaded.tape.exchanges.len(),
            if meta.created_at.is_empty() {
                "-"
            } else {
                meta.created_at.as_str()
            },
        );
    }
    if skipped > 0 {
        eprintln!("{skipped} tape(s) skipped; run `tapes validate` for details");
    }
    Ok(0)
}

fn validate(root: &Path, strict: bool) -> Result<i32> {
    let store = TapeStore::new(root, KeyBuilder::default(), LOCK_RETRIES);
    let failures = store.validate(strict);
    if failures.is_empty() {
        println!("all tapes valid");
        return Ok(0);
    }
    for (path, err) in &failures {
        println!("{}: {err}", path.display());
    }
    Ok(3)
}

fn redact(root: &Path, inplace: bool) -> Result<i32> {
    let (store, _) = open_store(root);
    let results = store.redact_all(inplace)?;
    let mut changed = 0usize;
    for (path, did_change) in results {
        if did_change {
            changed += 1;
            let action = if inplace { "redacted" } else { "would redact" };
            println!("{action} {}", path.display());
        }
    }
    println!("{changed} tape(s) with secrets");
    Ok(0)
}

fn load_tape(path: &Path) -> Result<Tape> {
    let bytes = std::fs::read(path).map_err(|source| Error::TapeIo {
        path: path.to_path_buf(),
        op: "read",
        source,
    })?;
    codec::decode(&bytes).map_err(Error::from)
}

fn input_label(input: &Input) -> String {
    match input {
        Input::Line(text) => format!("line {text:?}"),
        Input::Raw(bytes) if bytes.is_empty() => "raw <startup>".to_string(),
        Input::Raw(bytes) => format!("raw {:?}", String::from_utf8_lossy(bytes)),
    }
}

fn diff_exchange(index: usize, a: &Exchange, b: &Exchange, lines: &mut Vec<String>) {
    if a.pre.prompt != b.pre.prompt {
        lines.push(format!(
            "exchanges[{index}].pre.prompt: {:?} != {:?}",
            a.pre.prompt, b.pre.prompt
        ));
    }
    if a.input != b.input {
        lines.push(format!(
            "exchanges[{index}].input: {} != {}",
            input_label(&a.input),
            input_label(&b.input)
        ));
    }
    if a.output_bytes() != b.output_bytes() {
        lines.push(format!(
            "exchanges[{index}].output: {} bytes != {} bytes",
            a.output_bytes().len(),
            b.output_bytes().len()
        ));
    }
    if a.exit != b.exit {
        lines.push(format!(
            "exchanges[{index}].exit: {:?} != {:?}",
            a.exit, b.exit
        ));
    }
}

fn diff(a_path: &Path, b_path: &Path) -> Result<i32> {
    let a = load_tape(a_path)?;
    let b = load_tape(b_path)?;

    let mut lines = Vec::new();
    if a.meta.program != b.meta.program {
        lines.push(format!(
            "meta.program: {:?} != {:?}",
            a.meta.program, b.meta.program
        ));
    }
    if a.meta.args != b.meta.args {
        lines.push(format!("meta.args: {:?} != {:?}", a.meta.args, b.meta.args));
    }
    if a.meta.env != b.meta.env {
        lines.push("meta.env differs".to_string());
    }
    if a.meta.cwd != b.meta.cwd {
        lines.push(format!("meta.cwd: {:?} != {:?}", a.meta.cwd, b.meta.cwd));
    }
    if a.exchanges.len() != b.exchanges.len() {
        lines.push(format!(
            "exchange count: {} != {}",
            a.exchanges.len(),
            b.exchanges.len()
        ));
    }
    for (index, (ex_a, ex_b)) in a.exchanges.iter().zip(&b.exchanges).enumerate() {
        diff_exchange(index, ex_a, ex_b, &mut lines);
    }

    if lines.is_empty() {
        println!("tapes are equivalent");
        return Ok(0);
    }
    for line in lines {
        println!("{line}");
    }
    Ok(1)
}
