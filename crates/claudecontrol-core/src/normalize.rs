//! Byte-in/byte-out normalization used for matching and diffing.
//!
//! All transformers are pure and infallible. The patterns are ASCII-safe,
//! so they run byte-wise and never need the payload to be valid UTF-8.

use std::sync::OnceLock;

use regex::bytes::Regex;

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // CSI: ESC [ param* intermediate* final. OSC: ESC ] ... BEL | ESC \.
    RE.get_or_init(|| {
        Regex::new(r"(?s-u)\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")
            .unwrap_or_else(|_| unreachable!("ansi pattern is valid"))
    })
}

fn ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[\t\n\x0b\x0c\r ]+").unwrap_or_else(|_| unreachable!("ws pattern is valid"))
    })
}

/// Ordered volatile-token patterns, applied left-to-right, non-overlapping.
fn volatile_res() -> &'static [(Regex, &'static [u8])] {
    static RES: OnceLock<Vec<(Regex, &'static [u8])>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            (
                r"\b\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?\b",
                b"<TS>" as &[u8],
            ),
            (r"\b0x[0-9a-fA-F]+\b", b"<HEX>"),
            (r"\b[0-9a-f]{7,40}\b", b"<ID>"),
        ]
        .into_iter()
        .map(|(pat, repl)| {
            (
                Regex::new(pat).unwrap_or_else(|_| unreachable!("volatile pattern is valid")),
                repl,
            )
        })
        .collect()
    })
}

/// Remove CSI and OSC escape sequences; all other bytes are preserved.
#[must_use]
pub fn strip_ansi(input: &[u8]) -> Vec<u8> {
    ansi_re().replace_all(input, &b""[..]).into_owned()
}

/// Collapse every run of ASCII whitespace to a single space and trim.
#[must_use]
pub fn collapse_ws(input: &[u8]) -> Vec<u8> {
    let collapsed = ws_re().replace_all(input, &b" "[..]);
    let mut slice: &[u8] = &collapsed;
    if let Some(rest) = slice.strip_prefix(b" ") {
        slice = rest;
    }
    if let Some(rest) = slice.strip_suffix(b" ") {
        slice = rest;
    }
    slice.to_vec()
}

/// Replace volatile substrings (timestamps, hex ids) with stable sentinels.
#[must_use]
pub fn scrub_volatile(input: &[u8]) -> Vec<u8> {
    let mut out = input.to_vec();
    for (re, repl) in volatile_res() {
        out = re.replace_all(&out, *repl).into_owned();
    }
    out
}

/// `collapse_ws(strip_ansi(...))` on a string; the prompt-signature shape.
#[must_use]
pub fn prompt_signature(prompt: &str) -> String {
    String::from_utf8_lossy(&collapse_ws(&strip_ansi(prompt.as_bytes()))).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_sequences() {
        let input = b"\x1b[1;32mgreen\x1b[0m plain";
        assert_eq!(strip_ansi(input), b"green plain");
    }

    #[test]
    fn strips_osc_sequences() {
        let bel = b"\x1b]0;window title\x07rest";
        assert_eq!(strip_ansi(bel), b"rest");
        let st = b"\x1b]8;;http://x\x1b\\link";
        assert_eq!(strip_ansi(st), b"link");
    }

    #[test]
    fn strip_ansi_preserves_non_escape_bytes() {
        let input = b"\xffbinary\x00ok";
        assert_eq!(strip_ansi(input), input.to_vec());
    }

    #[test]
    fn strip_ansi_is_idempotent() {
        let input = b"\x1b[2Jcleared \x1b]0;t\x07screen";
        let once = strip_ansi(input);
        assert_eq!(strip_ansi(&once), once);
    }

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(collapse_ws(b"  a \t\n b\r\n  "), b"a b");
        assert_eq!(collapse_ws(b"one"), b"one");
        assert_eq!(collapse_ws(b"   "), b"");
    }

    #[test]
    fn collapse_ws_is_idempotent() {
        let once = collapse_ws(b" x  y\tz ");
        assert_eq!(collapse_ws(&once), once);
    }

    #[test]
    fn scrubs_timestamps_before_ids() {
        let input = b"at 2024-03-01T12:30:45.123Z commit deadbeefcafe";
        assert_eq!(scrub_volatile(input), b"at <TS> commit <ID>");
    }

    #[test]
    fn scrubs_hex_addresses() {
        assert_eq!(scrub_volatile(b"ptr=0xDEADBEEF"), b"ptr=<HEX>");
    }

    #[test]
    fn scrub_leaves_short_hex_words_alone() {
        assert_eq!(scrub_volatile(b"cafe 12ab"), b"cafe 12ab");
    }

    #[test]
    fn prompt_signature_normalizes_ansi_and_spacing() {
        assert_eq!(prompt_signature("\x1b[1m sqlite> \x1b[0m"), "sqlite>");
    }
}
