//! Lossy text normalization for content headed to ASCII-only consumers.
//!
//! Commit messages and diffs arrive as arbitrary bytes; the review service and
//! the archive branches want predictable text. The conversions here are lossy
//! on purpose: unconvertible characters degrade to `?` rather than erroring.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Substitutions for Unicode punctuation that has an obvious ASCII rendering.
/// Anything not in this table and not ASCII becomes `?`.
static ASCII_SUBSTITUTIONS: Lazy<HashMap<char, &'static str>> = Lazy::new(|| {
    HashMap::from([
        // dashes
        ('\u{2010}', "-"),
        ('\u{2011}', "-"),
        ('\u{2012}', "-"),
        ('\u{2013}', "-"),
        ('\u{2014}', "-"),
        ('\u{2015}', "-"),
        ('\u{2212}', "-"),
        // quotes
        ('\u{00b4}', "'"),
        ('\u{2018}', "'"),
        ('\u{2019}', "'"),
        ('\u{201c}', "\""),
        ('\u{201d}', "\""),
        // bullets
        ('\u{00b7}', "*"),
        ('\u{2022}', "*"),
        ('\u{2023}', ">"),
        ('\u{2024}', "*"),
        ('\u{2043}', "-"),
        ('\u{25b8}', ">"),
        ('\u{25e6}', "o"),
        // ellipsis
        ('\u{2026}', "..."),
    ])
});

/// Convert text to ASCII, substituting common punctuation and degrading
/// everything else that is out of range to `?`.
pub fn lossy_unicode_to_ascii(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii() {
            out.push(c);
        } else if let Some(substitute) = ASCII_SUBSTITUTIONS.get(&c) {
            out.push_str(substitute);
        } else {
            out.push('?');
        }
    }
    out
}

/// Decode bytes as UTF-8, replacing invalid sequences with the Unicode
/// replacement character. Never fails; diffs and commit messages pass through
/// here before being rendered anywhere.
pub fn to_unicode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Force bytes into the ASCII range, replacing every out-of-range byte with `?`.
pub fn ensure_ascii(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b } else { b'?' })
        .collect()
}
