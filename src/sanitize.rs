//! Payload normalization.
//!
//! Upstream hands over raw feed text that may carry markup, HTML entities,
//! and source boilerplate. [`sanitize`] produces the deliverable form;
//! [`canonicalize`] flattens it further into the comparison form used by
//! the duplicate-suppression check.

use std::sync::LazyLock;

use regex::Regex;

static P_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<p[^>]*>(.*?)</p>").unwrap());
static LINE_BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</p>\s*<p[^>]*>|<br\s*/?>").unwrap());
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static SPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());
static WS_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Feed boilerplate stripped from line starts. A separator is required so
/// ordinary words ("Flash loan exploit ...") survive.
static BOILERPLATE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*(?:news\s*flash|newsflash|breaking|flash|bulletin)[ \t]*[:\-–—][ \t]*")
        .unwrap()
});

/// Clean raw upstream text into the form handed to the delivery driver.
///
/// When the input is paragraph-structured (`<p>…</p>`), paragraphs become
/// newline-separated lines; otherwise the whole input goes through the same
/// pipeline. Returns an empty string when nothing survives.
pub fn sanitize(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let paragraphs: Vec<String> = P_BLOCK
        .captures_iter(raw)
        .map(|c| clean_fragment(&c[1]))
        .filter(|p| !p.is_empty())
        .collect();

    let text = if paragraphs.is_empty() {
        clean_fragment(raw)
    } else {
        paragraphs.join("\n")
    };

    BOILERPLATE_PREFIX.replace_all(&text, "").trim().to_string()
}

/// Canonical comparison form: sanitized text with every whitespace run
/// collapsed to a single space. Used only for duplicate detection.
pub fn canonicalize(raw: &str) -> String {
    let clean = sanitize(raw);
    WS_RUN.replace_all(&clean, " ").trim().to_string()
}

fn clean_fragment(fragment: &str) -> String {
    let broken = LINE_BREAKS.replace_all(fragment, "\n");
    let stripped = TAG.replace_all(&broken, "");
    let decoded = decode_entities(&stripped);
    let collapsed = SPACE_RUN.replace_all(&decoded, " ");
    collapsed.trim().to_string()
}

/// Decode the common HTML entities plus numeric forms. Unrecognized
/// sequences pass through untouched.
fn decode_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match rest.find(';') {
            // Entities are short; anything longer is treated as literal text.
            Some(end) if end <= 10 => {
                let entity = &rest[1..end];
                match decode_entity(entity) {
                    Some(decoded) => {
                        out.push_str(&decoded);
                        rest = &rest[end + 1..];
                    }
                    None => {
                        out.push('&');
                        rest = &rest[1..];
                    }
                }
            }
            _ => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<String> {
    let decoded = match entity {
        "amp" => "&",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        "nbsp" => " ",
        "mdash" => "—",
        "ndash" => "–",
        "hellip" => "…",
        _ => {
            let code = if let Some(hex) = entity.strip_prefix("#x").or(entity.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse::<u32>().ok()?
            } else {
                return None;
            };
            return char::from_u32(code).map(String::from);
        }
    };
    Some(decoded.to_string())
}
