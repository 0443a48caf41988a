//! JSON5 tape codec and schema validation.
//!
//! Encoding emits strict JSON (a JSON5 subset) with the stable key order
//! that keeps tape diffs reviewable: `meta`, `session`, `exchanges`; chunk
//! payloads as standard padded base64. Decoding accepts camelCase and
//! snake_case key spellings for compatibility with authoring tools.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::SchemaError;
use crate::tape::{
    Chunk, Exchange, ExitInfo, Input, LatencySpec, PreContext, PtySize, SessionInfo, Tape, TapeMeta,
};

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TapeDoc {
    meta: MetaDoc,
    session: SessionDoc,
    exchanges: Vec<ExchangeDoc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaDoc {
    created_at: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: String,
    pty: PtyDoc,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_rate: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Serialize)]
struct PtyDoc {
    rows: u16,
    cols: u16,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionDoc {
    platform: String,
    version: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    flags: BTreeMap<String, Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeDoc {
    pre: PreDoc,
    input: InputDoc,
    output: Vec<ChunkDoc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit: Option<ExitDoc>,
    dur_ms: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PreDoc {
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_hash: Option<String>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum InputDoc {
    Line {
        #[serde(rename = "dataText")]
        data_text: String,
    },
    Raw {
        #[serde(rename = "dataBytesB64")]
        data_bytes_b64: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkDoc {
    delay_ms: u64,
    data_b64: String,
    is_utf8: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExitDoc {
    code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    signal: Option<i32>,
}

fn latency_value(spec: LatencySpec) -> Value {
    match spec {
        LatencySpec::Const(ms) => Value::from(ms),
        LatencySpec::Range(lo, hi) => Value::from(vec![lo, hi]),
    }
}

/// Encode a tape to its JSON5 wire form (strict JSON, stable key order).
pub fn encode(tape: &Tape) -> Result<Vec<u8>, SchemaError> {
    let doc = TapeDoc {
        meta: MetaDoc {
            created_at: tape.meta.created_at.clone(),
            program: tape.meta.program.clone(),
            args: tape.meta.args.clone(),
            env: tape.meta.env.clone(),
            cwd: tape.meta.cwd.clone(),
            pty: PtyDoc {
                rows: tape.meta.pty.rows,
                cols: tape.meta.pty.cols,
            },
            tag: tape.meta.tag.clone(),
            latency: tape.meta.latency.map(latency_value),
            error_rate: tape.meta.error_rate,
            seed: tape.meta.seed,
        },
        session: SessionDoc {
            platform: tape.session.platform.clone(),
            version: tape.session.version.clone(),
            flags: tape.session.flags.clone(),
        },
        exchanges: tape
            .exchanges
            .iter()
            .map(|exchange| ExchangeDoc {
                pre: PreDoc {
                    prompt: exchange.pre.prompt.clone(),
                    state_hash: exchange.pre.state_hash.clone(),
                },
                input: match &exchange.input {
                    Input::Line(text) => InputDoc::Line {
                        data_text: text.clone(),
                    },
                    Input::Raw(bytes) => InputDoc::Raw {
                        data_bytes_b64: BASE64_STANDARD.encode(bytes),
                    },
                },
                output: exchange
                    .output
                    .iter()
                    .map(|chunk| ChunkDoc {
                        delay_ms: chunk.delay_ms,
                        data_b64: BASE64_STANDARD.encode(&chunk.data),
                        is_utf8: std::str::from_utf8(&chunk.data).is_ok(),
                    })
                    .collect(),
                exit: exchange.exit.map(|exit| ExitDoc {
                    code: exit.code,
                    signal: exit.signal,
                }),
                dur_ms: exchange.dur_ms,
                annotations: exchange.annotations.clone(),
            })
            .collect(),
    };

    let mut text = serde_json::to_string_pretty(&doc)
        .map_err(|err| SchemaError::new("$", format!("encode failed: {err}")))?;
    text.push('\n');
    Ok(text.into_bytes())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Parse tape bytes as JSON5 into a generic value.
pub fn parse_value(bytes: &[u8]) -> Result<Value, SchemaError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| SchemaError::new("$", format!("tape is not valid UTF-8: {err}")))?;
    json5::from_str(text).map_err(|err| SchemaError::new("$", format!("invalid JSON5: {err}")))
}

/// Decode tape bytes; the first schema violation fails the decode.
pub fn decode(bytes: &[u8]) -> Result<Tape, SchemaError> {
    let value = parse_value(bytes)?;
    let mut errors = Vec::new();
    match tape_from_value(&value, false, &mut errors) {
        Some(tape) if errors.is_empty() => Ok(tape),
        _ => Err(errors
            .into_iter()
            .next()
            .unwrap_or_else(|| SchemaError::new("$", "tape failed to decode"))),
    }
}

/// Validate tape bytes, collecting every schema violation.
///
/// Strict mode additionally rejects unknown top-level keys.
#[must_use]
pub fn validate_bytes(bytes: &[u8], strict: bool) -> Vec<SchemaError> {
    match parse_value(bytes) {
        Ok(value) => {
            let mut errors = Vec::new();
            tape_from_value(&value, strict, &mut errors);
            errors
        }
        Err(err) => vec![err],
    }
}

const KNOWN_TOP_LEVEL: &[&str] = &["meta", "session", "exchanges"];

fn get2<'v>(map: &'v Map<String, Value>, camel: &str, snake: &str) -> Option<&'v Value> {
    map.get(camel).or_else(|| map.get(snake))
}

fn as_object<'v>(
    value: &'v Value,
    path: &str,
    errors: &mut Vec<SchemaError>,
) -> Option<&'v Map<String, Value>> {
    match value.as_object() {
        Some(map) => Some(map),
        None => {
            errors.push(SchemaError::new(path, "expected an object"));
            None
        }
    }
}

fn req_str(
    map: &Map<String, Value>,
    camel: &str,
    snake: &str,
    path: &str,
    errors: &mut Vec<SchemaError>,
) -> Option<String> {
    match get2(map, camel, snake) {
        Some(Value::String(text)) => Some(text.clone()),
        Some(_) => {
            errors.push(SchemaError::new(
                format!("{path}.{camel}"),
                "expected a string",
            ));
            None
        }
        None => {
            errors.push(SchemaError::new(
                format!("{path}.{camel}"),
                "missing required field",
            ));
            None
        }
    }
}

fn opt_str(
    map: &Map<String, Value>,
    camel: &str,
    snake: &str,
    path: &str,
    errors: &mut Vec<SchemaError>,
) -> Option<String> {
    match get2(map, camel, snake) {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Null) | None => None,
        Some(_) => {
            errors.push(SchemaError::new(
                format!("{path}.{camel}"),
                "expected a string",
            ));
            None
        }
    }
}

fn non_negative_int(value: &Value, path: &str, errors: &mut Vec<SchemaError>) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    if value.as_i64().is_some() {
        errors.push(SchemaError::new(path, "must not be negative"));
    } else {
        errors.push(SchemaError::new(path, "expected an integer"));
    }
    None
}

fn b64_field(value: &Value, path: &str, errors: &mut Vec<SchemaError>) -> Option<Vec<u8>> {
    let Value::String(text) = value else {
        errors.push(SchemaError::new(path, "expected a base64 string"));
        return None;
    };
    match BASE64_STANDARD.decode(text) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            errors.push(SchemaError::new(path, format!("malformed base64: {err}")));
            None
        }
    }
}

fn meta_from_value(value: &Value, errors: &mut Vec<SchemaError>) -> Option<TapeMeta> {
    let map = as_object(value, "meta", errors)?;
    let program = req_str(map, "program", "program", "meta", errors);
    let cwd = req_str(map, "cwd", "cwd", "meta", errors);
    let created_at = opt_str(map, "createdAt", "created_at", "meta", errors).unwrap_or_default();

    let args = match get2(map, "args", "args") {
        Some(Value::Array(items)) => {
            let mut args = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(text) => args.push(text.to_string()),
                    None => errors.push(SchemaError::new(
                        format!("meta.args[{i}]"),
                        "expected a string",
                    )),
                }
            }
            args
        }
        Some(_) => {
            errors.push(SchemaError::new("meta.args", "expected an array"));
            Vec::new()
        }
        None => {
            errors.push(SchemaError::new("meta.args", "missing required field"));
            Vec::new()
        }
    };

    let env = match get2(map, "env", "env") {
        Some(Value::Object(entries)) => {
            let mut env = BTreeMap::new();
            for (key, val) in entries {
                match val.as_str() {
                    Some(text) => {
                        env.insert(key.clone(), text.to_string());
                    }
                    None => errors.push(SchemaError::new(
                        format!("meta.env.{key}"),
                        "expected a string",
                    )),
                }
            }
            env
        }
        Some(_) => {
            errors.push(SchemaError::new("meta.env", "expected an object"));
            BTreeMap::new()
        }
        None => {
            errors.push(SchemaError::new("meta.env", "missing required field"));
            BTreeMap::new()
        }
    };

    let pty = match get2(map, "pty", "pty") {
        Some(Value::Object(dims)) => {
            let rows = dims
                .get("rows")
                .and_then(|v| non_negative_int(v, "meta.pty.rows", errors));
            let cols = dims
                .get("cols")
                .and_then(|v| non_negative_int(v, "meta.pty.cols", errors));
            PtySize {
                rows: rows.map_or(24, |n| u16::try_from(n).unwrap_or(u16::MAX)),
                cols: cols.map_or(80, |n| u16::try_from(n).unwrap_or(u16::MAX)),
            }
        }
        Some(Value::Null) | None => PtySize::default(),
        Some(_) => {
            errors.push(SchemaError::new("meta.pty", "expected an object"));
            PtySize::default()
        }
    };

    let latency = match get2(map, "latency", "latency") {
        Some(Value::Null) | None => None,
        Some(value) => latency_from_value(value, "meta.latency", errors),
    };

    let error_rate = match get2(map, "errorRate", "error_rate") {
        Some(Value::Null) | None => None,
        Some(value) => non_negative_int(value, "meta.errorRate", errors).and_then(|n| {
            if n > 100 {
                errors.push(SchemaError::new("meta.errorRate", "must be within 0-100"));
                None
            } else {
                Some(n as u8)
            }
        }),
    };

    let seed = match get2(map, "seed", "seed") {
        Some(Value::Null) | None => None,
        Some(value) => non_negative_int(value, "meta.seed", errors),
    };

    Some(TapeMeta {
        created_at,
        program: program?,
        args,
        env,
        cwd: cwd?,
        pty,
        tag: opt_str(map, "tag", "tag", "meta", errors),
        latency,
        error_rate,
        seed,
    })
}

fn latency_from_value(
    value: &Value,
    path: &str,
    errors: &mut Vec<SchemaError>,
) -> Option<LatencySpec> {
    match value {
        Value::Number(_) => non_negative_int(value, path, errors).map(LatencySpec::Const),
        Value::Array(items) if items.len() == 2 => {
            let lo = non_negative_int(&items[0], &format!("{path}[0]"), errors)?;
            let hi = non_negative_int(&items[1], &format!("{path}[1]"), errors)?;
            Some(LatencySpec::Range(lo, hi))
        }
        _ => {
            errors.push(SchemaError::new(
                path,
                "expected a number or a [min, max] pair",
            ));
            None
        }
    }
}

fn session_from_value(value: &Value, errors: &mut Vec<SchemaError>) -> SessionInfo {
    let Some(map) = as_object(value, "session", errors) else {
        return SessionInfo::default();
    };
    let flags = match get2(map, "flags", "flags") {
        Some(Value::Object(entries)) => entries.clone().into_iter().collect(),
        _ => BTreeMap::new(),
    };
    SessionInfo {
        platform: opt_str(map, "platform", "platform", "session", errors).unwrap_or_default(),
        version: opt_str(map, "version", "version", "session", errors).unwrap_or_default(),
        flags,
    }
}

fn input_from_value(value: &Value, path: &str, errors: &mut Vec<SchemaError>) -> Option<Input> {
    let map = as_object(value, path, errors)?;
    let kind = req_str(map, "type", "kind", path, errors)?;
    match kind.as_str() {
        "line" => match get2(map, "dataText", "data_text") {
            Some(Value::String(text)) => Some(Input::Line(text.clone())),
            _ => {
                errors.push(SchemaError::new(
                    format!("{path}.dataText"),
                    "line input requires dataText",
                ));
                None
            }
        },
        "raw" => {
            let field = get2(map, "dataBytesB64", "data_bytes_b64")
                .or_else(|| get2(map, "dataB64", "data_b64"));
            match field {
                Some(value) => {
                    b64_field(value, &format!("{path}.dataBytesB64"), errors).map(Input::Raw)
                }
                None => {
                    errors.push(SchemaError::new(
                        format!("{path}.dataBytesB64"),
                        "raw input requires dataBytesB64",
                    ));
                    None
                }
            }
        }
        other => {
            errors.push(SchemaError::new(
                format!("{path}.type"),
                format!("unknown input type `{other}`"),
            ));
            None
        }
    }
}

fn chunk_from_value(value: &Value, path: &str, errors: &mut Vec<SchemaError>) -> Option<Chunk> {
    let map = as_object(value, path, errors)?;
    let delay_ms = match get2(map, "delayMs", "delay_ms") {
        Some(value) => non_negative_int(value, &format!("{path}.delayMs"), errors),
        None => {
            errors.push(SchemaError::new(
                format!("{path}.delayMs"),
                "missing required field",
            ));
            None
        }
    };
    let data = match get2(map, "dataB64", "data_b64") {
        Some(value) => b64_field(value, &format!("{path}.dataB64"), errors),
        None => {
            errors.push(SchemaError::new(
                format!("{path}.dataB64"),
                "missing required field",
            ));
            None
        }
    };
    let data = data?;
    let is_utf8 = match get2(map, "isUtf8", "is_utf8") {
        Some(Value::Bool(flag)) => *flag,
        _ => std::str::from_utf8(&data).is_ok(),
    };
    Some(Chunk {
        delay_ms: delay_ms?,
        data,
        is_utf8,
    })
}

fn exit_from_value(value: &Value, path: &str, errors: &mut Vec<SchemaError>) -> Option<ExitInfo> {
    let map = as_object(value, path, errors)?;
    let code = match get2(map, "code", "code") {
        Some(value) => match value.as_i64() {
            Some(code) => Some(code as i32),
            None => {
                errors.push(SchemaError::new(
                    format!("{path}.code"),
                    "expected an integer",
                ));
                None
            }
        },
        None => {
            errors.push(SchemaError::new(
                format!("{path}.code"),
                "missing required field",
            ));
            None
        }
    };
    let signal = get2(map, "signal", "signal")
        .and_then(Value::as_i64)
        .map(|s| s as i32);
    Some(ExitInfo {
        code: code?,
        signal,
    })
}

fn exchange_from_value(
    value: &Value,
    index: usize,
    last_index: usize,
    errors: &mut Vec<SchemaError>,
) -> Option<Exchange> {
    let path = format!("exchanges[{index}]");
    let map = as_object(value, &path, errors)?;

    let pre = match get2(map, "pre", "pre") {
        Some(value) => {
            let pre_path = format!("{path}.pre");
            as_object(value, &pre_path, errors).map(|pre_map| PreContext {
                prompt: opt_str(pre_map, "prompt", "prompt", &pre_path, errors).unwrap_or_default(),
                state_hash: opt_str(pre_map, "stateHash", "state_hash", &pre_path, errors),
            })
        }
        None => {
            errors.push(SchemaError::new(
                format!("{path}.pre"),
                "missing required field",
            ));
            None
        }
    };

    let input = match get2(map, "input", "input") {
        Some(value) => input_from_value(value, &format!("{path}.input"), errors),
        None => {
            errors.push(SchemaError::new(
                format!("{path}.input"),
                "missing required field",
            ));
            None
        }
    };

    let output = match get2(map, "output", "output") {
        Some(Value::Array(items)) => {
            let mut chunks = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                if let Some(chunk) = chunk_from_value(item, &format!("{path}.output[{i}]"), errors)
                {
                    chunks.push(chunk);
                }
            }
            Some(chunks)
        }
        Some(_) => {
            errors.push(SchemaError::new(
                format!("{path}.output"),
                "expected an array of chunks",
            ));
            None
        }
        None => {
            errors.push(SchemaError::new(
                format!("{path}.output"),
                "missing required field",
            ));
            None
        }
    };

    let exit = match get2(map, "exit", "exit") {
        Some(Value::Null) | None => None,
        Some(value) => {
            let exit = exit_from_value(value, &format!("{path}.exit"), errors);
            if exit.is_some() && index != last_index {
                errors.push(SchemaError::new(
                    format!("{path}.exit"),
                    "exit is only allowed on the last exchange",
                ));
            }
            exit
        }
    };

    let output = output?;
    let delay_total: u64 = output.iter().map(|chunk| chunk.delay_ms).sum();
    let dur_ms = match get2(map, "durMs", "dur_ms") {
        Some(Value::Null) | None => delay_total,
        Some(value) => {
            let dur = non_negative_int(value, &format!("{path}.durMs"), errors)?;
            if dur < delay_total {
                errors.push(SchemaError::new(
                    format!("{path}.durMs"),
                    "must be at least the sum of chunk delays",
                ));
            }
            dur
        }
    };

    let annotations = match get2(map, "annotations", "annotations") {
        Some(Value::Object(entries)) => {
            for (key, val) in entries {
                if val.is_object() || val.is_array() {
                    errors.push(SchemaError::new(
                        format!("{path}.annotations.{key}"),
                        "annotation values must be scalars",
                    ));
                }
            }
            entries.clone().into_iter().collect()
        }
        _ => BTreeMap::new(),
    };

    Some(Exchange {
        pre: pre?,
        input: input?,
        output,
        exit,
        dur_ms,
        annotations,
    })
}

fn tape_from_value(root: &Value, strict: bool, errors: &mut Vec<SchemaError>) -> Option<Tape> {
    let map = as_object(root, "$", errors)?;

    if strict {
        for key in map.keys() {
            if !KNOWN_TOP_LEVEL.contains(&key.as_str()) {
                errors.push(SchemaError::new(
                    format!("$.{key}"),
                    "unknown top-level key",
                ));
            }
        }
    }

    let meta = match map.get("meta") {
        Some(value) => meta_from_value(value, errors),
        None => {
            errors.push(SchemaError::new("meta", "missing required field"));
            None
        }
    };

    let session = match map.get("session") {
        Some(value) => session_from_value(value, errors),
        None => {
            errors.push(SchemaError::new("session", "missing required field"));
            SessionInfo::default()
        }
    };

    let exchanges = match map.get("exchanges") {
        Some(Value::Array(items)) => {
            if items.is_empty() {
                errors.push(SchemaError::new("exchanges", "must not be empty"));
            }
            let last = items.len().saturating_sub(1);
            let mut exchanges = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                if let Some(exchange) = exchange_from_value(item, i, last, errors) {
                    exchanges.push(exchange);
                }
            }
            Some(exchanges)
        }
        Some(_) => {
            errors.push(SchemaError::new("exchanges", "expected an array"));
            None
        }
        None => {
            errors.push(SchemaError::new("exchanges", "missing required field"));
            None
        }
    };

    Some(Tape {
        meta: meta?,
        session,
        exchanges: exchanges?,
    })
}
