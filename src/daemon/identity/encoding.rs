//! Recovers readable text from window/process names that arrive in unknown
//! or mismatched encodings. Legacy applications still report their window
//! class in the system code page, and a name that went through a wrong
//! single-byte decode once ("ä¸­æ–‡") can be recovered by re-reading its
//! underlying bytes. Decoding is best-effort and total: whatever happens,
//! the caller gets a string back.

use encoding_rs::{Encoding, BIG5, EUC_KR, GB18030, SHIFT_JIS, UTF_16LE, UTF_8, WINDOWS_1252};

use crate::system_api::RawText;

/// Legacy candidates tried when a byte sequence is not valid UTF-8. Order
/// matters only for deterministic tie-breaking; selection is score-based.
const LEGACY_CANDIDATES: [&Encoding; 5] = [GB18030, BIG5, SHIFT_JIS, EUC_KR, WINDOWS_1252];

/// A reinterpretation must beat the baseline by this much before it wins.
/// Short ambiguous strings score close together and must not flap.
const OVERRIDE_MARGIN: i32 = 2;

/// Byte-pair artifacts of UTF-8 read as a single-byte code page.
const MOJIBAKE_MARKERS: [char; 3] = ['Ã', 'Â', 'â'];

/// Decodes a raw platform string. Never fails; identical input always
/// produces identical output.
pub fn decode(raw: &RawText) -> String {
    match raw {
        RawText::Bytes(bytes) => decode_bytes(bytes),
        RawText::Text(text) => decode_text(text),
    }
}

fn decode_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    if looks_utf16_le(bytes) {
        let (text, _, _) = UTF_16LE.decode(bytes);
        return text.trim_start_matches('\u{FEFF}').to_string();
    }

    let (utf8_text, _, utf8_malformed) = UTF_8.decode(bytes);
    if !utf8_malformed {
        // Valid UTF-8 is UTF-8. Legacy text virtually never round-trips
        // through the UTF-8 grammar, so no other candidate is consulted.
        return utf8_text.into_owned();
    }
    choose_best(bytes, &utf8_text)
}

fn decode_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    match text_to_suspect_bytes(text) {
        Some(bytes) => choose_best(&bytes, text),
        // Contains characters no single-byte decode could have produced;
        // nothing to recover.
        None => text.to_string(),
    }
}

/// Scores every candidate decoding of `bytes` against `baseline` and keeps
/// the baseline unless a candidate wins by [OVERRIDE_MARGIN].
fn choose_best(bytes: &[u8], baseline: &str) -> String {
    let baseline_score = score(baseline);

    let (utf8_text, _, utf8_malformed) = UTF_8.decode(bytes);
    let mut best: Option<(String, i32)> = None;

    if !utf8_malformed {
        // Same rule as decode_bytes: a valid UTF-8 reading preempts the
        // legacy candidates entirely.
        best = Some((utf8_text.clone().into_owned(), score(&utf8_text)));
    } else {
        for encoding in LEGACY_CANDIDATES {
            let (candidate, _, _) = encoding.decode(bytes);
            let candidate_score = score(&candidate);
            let improves = match &best {
                Some((_, best_score)) => candidate_score > *best_score,
                None => true,
            };
            if improves {
                best = Some((candidate.into_owned(), candidate_score));
            }
        }
    }

    match best {
        Some((candidate, candidate_score))
            if candidate_score > baseline_score + OVERRIDE_MARGIN =>
        {
            candidate
        }
        _ => baseline.to_string(),
    }
}

/// Maps a possibly-misdecoded string back to the bytes a single-byte read
/// would have produced. Returns `None` when a character can't have come
/// from one, in which case recovery is impossible.
fn text_to_suspect_bytes(text: &str) -> Option<Vec<u8>> {
    let mut bytes = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let code = ch as u32;
        if code <= 0xFF {
            bytes.push(code as u8);
        } else {
            bytes.push(windows_1252_byte(ch)?);
        }
    }
    Some(bytes)
}

/// The windows-1252 byte for characters the code page maps into the
/// 0x80..0x9F gap (en dash, smart quotes, and friends).
fn windows_1252_byte(ch: char) -> Option<u8> {
    let mut buffer = [0u8; 4];
    let encoded = ch.encode_utf8(&mut buffer);
    let (bytes, _, had_unmappable) = WINDOWS_1252.encode(encoded);
    if had_unmappable || bytes.len() != 1 {
        return None;
    }
    Some(bytes[0])
}

fn looks_utf16_le(bytes: &[u8]) -> bool {
    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xFE {
        return true;
    }
    let mut even_zeros = 0u32;
    let mut odd_zeros = 0u32;
    for (index, byte) in bytes.iter().take(64).enumerate() {
        if *byte == 0 {
            if index % 2 == 0 {
                even_zeros += 1;
            } else {
                odd_zeros += 1;
            }
        }
    }
    odd_zeros > even_zeros * 2 && odd_zeros > 2
}

fn score(text: &str) -> i32 {
    let mut score = 0i32;
    for ch in text.chars() {
        if ch == '\u{FFFD}' {
            score -= 3;
        } else if is_cjk(ch) {
            score += 2;
        } else if ch.is_ascii_alphanumeric() {
            score += 1;
        } else if ch == ' ' || ch.is_ascii_punctuation() {
            score += 1;
        } else if ch.is_control() && !matches!(ch, '\t' | '\n' | '\r') {
            score -= 1;
        }
    }
    for marker in MOJIBAKE_MARKERS {
        score -= 2 * text.matches(marker).count() as i32;
    }
    score
}

fn is_cjk(ch: char) -> bool {
    // Half-width katakana (U+FF61..U+FF9F) is deliberately left out: any
    // run of 0xA1..0xDF bytes decodes to it under Shift_JIS, which makes it
    // the classic false positive of encoding sniffers.
    matches!(ch as u32,
        0x3040..=0x30FF      // hiragana, katakana
        | 0x3400..=0x4DBF    // CJK extension A
        | 0x4E00..=0x9FFF    // CJK unified
        | 0xAC00..=0xD7AF    // hangul syllables
        | 0xFF01..=0xFF60    // fullwidth ASCII variants
        | 0xFFA0..=0xFFEF    // halfwidth hangul variants
    )
}
