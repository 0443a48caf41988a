//! End-to-end scenarios across the recorder, store, and replay transport,
//! driven against the deterministic scripted child.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use claudecontrol_core::child::{Script, ScriptedSpawner, ScriptedStep};
use claudecontrol_core::codec;
use claudecontrol_core::error::Error;
use claudecontrol_core::policy::{ErrorPolicy, FallbackMode, InjectMode, LatencyPolicy, RecordMode};
use claudecontrol_core::session::{Session, SessionConfig};
use claudecontrol_core::summary::render_summary;
use claudecontrol_core::tape::{ExitInfo, Input};
use claudecontrol_core::transport::PatternSet;

fn base_config(dir: &TempDir) -> SessionConfig {
    let mut config = SessionConfig::new("sqlite3");
    config.args = vec!["-batch".into()];
    config.cwd = PathBuf::from("/tmp");
    config.tapes_root = dir.path().to_path_buf();
    config.latency = LatencyPolicy::Const(0);
    config.summary = false;
    config.seed = Some(42);
    config.default_timeout = Duration::from_secs(2);
    config
}

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

async fn record_base_tape(dir: &TempDir) -> PathBuf {
    let prompt = PatternSet::single(r"sqlite> ").unwrap();
    let mut config = base_config(dir);
    config.record = RecordMode::New;
    config.fallback = FallbackMode::Proxy;
    let mut session = Session::start(
        config,
        ScriptedSpawner {
            script: sqlite_script(),
        },
    )
    .unwrap();
    session.expect(&prompt, None).await.unwrap();
    session.sendline("select 1;").await.unwrap();
    session.expect(&prompt, None).await.unwrap();
    session.close().await.unwrap();
    session.store().all_paths()[0].clone()
}

#[tokio::test]
async fn record_then_replay_parity() {
    let dir = TempDir::new().unwrap();
    let rel = record_base_tape(&dir).await;

    // The tape captured the live bytes chunk-for-chunk.
    let tape = codec::decode(&std::fs::read(dir.path().join(&rel)).unwrap()).unwrap();
    let select = tape
        .exchanges
        .iter()
        .find(|ex| ex.input == Input::Line("select 1;".into()))
        .expect("recorded exchange");
    assert_eq!(select.output.len(), 2);
    assert_eq!(select.output_bytes(), b"1\nsqlite> ");

    // Replaying the same input delivers the identical byte stream.
    let prompt = PatternSet::single(r"sqlite> ").unwrap();
    let mut config = base_config(&dir);
    config.record = RecordMode::Disabled;
    config.fallback = FallbackMode::NotFound;
    let mut session = Session::start(config, ScriptedSpawner::default()).unwrap();
    session.expect(&prompt, None).await.unwrap();
    session.sendline("select 1;").await.unwrap();
    session.expect(&prompt, None).await.unwrap();

    let mut delivered = session.before().to_vec();
    delivered.extend_from_slice(session.last_match());
    assert_eq!(delivered, b"1\nsqlite> ");
    session.close().await.unwrap();
}

#[tokio::test]
async fn strict_miss_reports_key_components() {
    let dir = TempDir::new().unwrap();
    record_base_tape(&dir).await;

    let prompt = PatternSet::single(r"sqlite> ").unwrap();
    let mut config = base_config(&dir);
    config.record = RecordMode::Disabled;
    config.fallback = FallbackMode::NotFound;
    let mut session = Session::start(config, ScriptedSpawner::default()).unwrap();
    session.expect(&prompt, None).await.unwrap();

    let err = session.sendline("select 2;").await.unwrap_err();
    let Error::TapeMiss(report) = err else {
        panic!("expected a tape miss");
    };
    assert_eq!(report.wanted.input_preview, "select 2;");
    assert!(!report.nearest.is_empty());
    let rendered = report.to_string();
    assert!(rendered.contains("select 2;"));
    assert!(rendered.contains("input:"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn proxy_fallback_lists_the_tape_as_new() {
    let dir = TempDir::new().unwrap();
    record_base_tape(&dir).await;

    let script = Script {
        banner: Vec::new(),
        steps: vec![ScriptedStep {
            input: b"select 2;".to_vec(),
            chunks: vec![b"2\n".to_vec(), b"sqlite> ".to_vec()],
            exit: None,
        }],
    };
    let prompt = PatternSet::single(r"sqlite> ").unwrap();
    let mut config = base_config(&dir);
    config.record = RecordMode::New;
    config.fallback = FallbackMode::Proxy;
    let mut session = Session::start(config, ScriptedSpawner { script }).unwrap();

    session.expect(&prompt, None).await.unwrap();
    session.sendline("select 1;").await.unwrap();
    session.expect(&prompt, None).await.unwrap();
    session.sendline("select 2;").await.unwrap();
    session.expect(&prompt, None).await.unwrap();
    session.close().await.unwrap();

    let summary = render_summary(session.store()).expect("summary should render");
    assert!(summary.contains("New tapes:"));
    assert_eq!(summary.matches("- ").count(), 1);
}

#[tokio::test]
async fn recorded_secrets_are_redacted_on_disk() {
    let dir = TempDir::new().unwrap();
    let script = Script {
        banner: vec![b"login: ".to_vec()],
        steps: vec![ScriptedStep {
            input: b"show-config".to_vec(),
            chunks: vec![b"password: hunter2\n".to_vec(), b"login: ".to_vec()],
            exit: None,
        }],
    };
    let prompt = PatternSet::single(r"login: ").unwrap();
    let mut config = base_config(&dir);
    config.program = "vault".into();
    config.args = Vec::new();
    config.record = RecordMode::New;
    config.fallback = FallbackMode::Proxy;
    let mut session = Session::start(config, ScriptedSpawner { script }).unwrap();
    session.expect(&prompt, None).await.unwrap();
    session.sendline("show-config").await.unwrap();
    session.expect(&prompt, None).await.unwrap();
    session.close().await.unwrap();

    let rel = session.store().all_paths()[0].clone();
    let tape = codec::decode(&std::fs::read(dir.path().join(rel)).unwrap()).unwrap();
    let exchange = tape
        .exchanges
        .iter()
        .find(|ex| ex.input == Input::Line("show-config".into()))
        .unwrap();
    assert_eq!(exchange.output[0].data, b"password: ***\n");
}

#[tokio::test]
async fn fault_injection_is_reproducible_across_sessions() {
    let dir = TempDir::new().unwrap();

    // Record a three-chunk exchange.
    let script = Script {
        banner: vec![b"> ".to_vec()],
        steps: vec![ScriptedStep {
            input: b"go".to_vec(),
            chunks: vec![b"one ".to_vec(), b"two ".to_vec(), b"> ".to_vec()],
            exit: None,
        }],
    };
    let prompt = PatternSet::single(r"> ").unwrap();
    let mut config = base_config(&dir);
    config.program = "tool".into();
    config.args = Vec::new();
    config.record = RecordMode::New;
    config.fallback = FallbackMode::Proxy;
    let mut session = Session::start(config, ScriptedSpawner { script }).unwrap();
    session.expect(&prompt, None).await.unwrap();
    session.sendline("go").await.unwrap();
    session.expect(&prompt, None).await.unwrap();
    session.close().await.unwrap();

    // Replay twice with the same seed: identical injection outcomes.
    for _run in 0..2 {
        let done = PatternSet::single(r"two ").unwrap();
        let mut config = base_config(&dir);
        config.program = "tool".into();
        config.args = Vec::new();
        config.record = RecordMode::Disabled;
        config.fallback = FallbackMode::NotFound;
        config.error_rate = ErrorPolicy::Const(100);
        config.inject_mode = InjectMode::Truncate;
        config.seed = Some(7);
        let mut session = Session::start(config, ScriptedSpawner::default()).unwrap();
        session.expect(&prompt, None).await.unwrap();
        session.sendline("go").await.unwrap();
        let err = session.expect(&done, None).await.unwrap_err();
        assert!(
            matches!(err, Error::Injected { .. }),
            "expected injected fault, got {err:?}"
        );
        session.close().await.unwrap();
    }
}

#[tokio::test]
async fn recorded_exit_replays_and_kills_liveness() {
    let dir = TempDir::new().unwrap();
    let script = Script {
        banner: vec![b"> ".to_vec()],
        steps: vec![ScriptedStep {
            input: b"quit".to_vec(),
            chunks: vec![b"bye\n".to_vec()],
            exit: Some(ExitInfo {
                code: 0,
                signal: None,
            }),
        }],
    };
    let prompt = PatternSet::single(r"> ").unwrap();
    let eof = PatternSet(vec![claudecontrol_core::transport::Pattern::Eof]);
    let mut config = base_config(&dir);
    config.program = "tool".into();
    config.args = Vec::new();
    config.record = RecordMode::New;
    config.fallback = FallbackMode::Proxy;
    let mut session = Session::start(config, ScriptedSpawner { script }).unwrap();
    session.expect(&prompt, None).await.unwrap();
    session.sendline("quit").await.unwrap();
    session.expect(&eof, None).await.unwrap();
    session.close().await.unwrap();

    // Replay: exit is latched after the final chunk.
    let mut config = base_config(&dir);
    config.program = "tool".into();
    config.args = Vec::new();
    config.record = RecordMode::Disabled;
    config.fallback = FallbackMode::NotFound;
    let mut session = Session::start(config, ScriptedSpawner::default()).unwrap();
    session.expect(&prompt, None).await.unwrap();
    assert!(session.is_alive());
    session.sendline("quit").await.unwrap();
    session.expect(&eof, None).await.unwrap();
    assert_eq!(
        session.exit_status(),
        Some(ExitInfo {
            code: 0,
            signal: None
        })
    );
    assert!(!session.is_alive());
    session.close().await.unwrap();
}

#[tokio::test]
async fn binary_output_round_trips_through_the_tape() {
    let dir = TempDir::new().unwrap();
    let blob: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let mut chunk = blob.clone();
    chunk.extend_from_slice(b"\xff\xfe> ");
    let script = Script {
        banner: Vec::new(),
        steps: vec![ScriptedStep {
            input: b"dump".to_vec(),
            chunks: vec![chunk.clone()],
            exit: None,
        }],
    };
    let prompt = PatternSet::single(r"> ").unwrap();
    let mut config = base_config(&dir);
    config.program = "tool".into();
    config.args = Vec::new();
    config.record = RecordMode::New;
    config.fallback = FallbackMode::Proxy;
    let mut session = Session::start(config, ScriptedSpawner { script }).unwrap();
    session.sendline("dump").await.unwrap();
    session.expect(&prompt, None).await.unwrap();
    session.close().await.unwrap();

    let rel = session.store().all_paths()[0].clone();
    let tape = codec::decode(&std::fs::read(dir.path().join(rel)).unwrap()).unwrap();
    let exchange = tape
        .exchanges
        .iter()
        .find(|ex| ex.input == Input::Line("dump".into()))
        .unwrap();
    assert_eq!(exchange.output_bytes(), chunk);
    assert!(!exchange.output[0].is_utf8);
}
