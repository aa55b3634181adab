use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Dash and hyphen glyphs that survive NFKC folding
static DASH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\u{2010}\u{2011}\u{2012}\u{2013}\u{2014}\u{2015}\u{2212}\u{FF0D}]")
        .expect("Invalid dash regex pattern")
});

/// Wave dash variants: ASCII tilde, WAVE DASH, FULLWIDTH TILDE
static WAVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[~\u{301C}\u{FF5E}]").expect("Invalid wave dash regex pattern")
});

/// Month counter spellings (か月, カ月, ヵ月, ケ月)
static MONTH_COUNTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[かカヵケ]月").expect("Invalid month counter regex pattern")
});

static HORIZONTAL_WS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^\S\n]+").expect("Invalid whitespace regex pattern")
});

static LINE_BREAK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r" ?\n\s*").expect("Invalid line break regex pattern")
});

/// Canonical wave dash used in ranges such as `1.5%〜3.0%`
pub const WAVE_DASH: &str = "〜";

/// Canonical month counter
pub const MONTH_COUNTER: &str = "ヶ月";

/// Canonicalize text before pattern matching.
///
/// Folds full-width characters with NFKC, unifies dash, wave dash and month
/// counter spellings, collapses horizontal whitespace to one space and blank
/// line runs to a single newline. Idempotent.
pub fn normalize(text: &str) -> String {
    let folded: String = text.nfkc().collect();
    let dashes = DASH_RE.replace_all(&folded, "-");
    let waves = WAVE_RE.replace_all(&dashes, WAVE_DASH);
    let months = MONTH_COUNTER_RE.replace_all(&waves, MONTH_COUNTER);
    let spaced = HORIZONTAL_WS_RE.replace_all(&months, " ");
    let lines = LINE_BREAK_RE.replace_all(&spaced, "\n");
    lines.trim().to_string()
}

/// Compute SHA-256 hash of raw bytes as lowercase hex
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
