//! Pattern-based field extraction over normalized text
//!
//! Every extractor expects text that already went through
//! [`crate::normalize::normalize`]: half-width digits, `〜` as the only wave
//! dash, `-` as the only dash and `ヶ月` as the only month counter.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fields::{Channel, FieldGroup, FieldMiss, FieldSet, MissReason};

/// Plausible interest rate band (fraction of 1)
pub const RATE_BAND: (f64, f64) = (0.001, 0.2);

/// Plausible loan term window in months
pub const TERM_WINDOW: (u32, u32) = (6, 480);

/// Smallest amount in yen treated as a loan amount
pub const MIN_AMOUNT_YEN: i64 = 10_000;

/// Characters on each side of a percentage checked for exclusion keywords
pub const DEFAULT_EXCLUSION_WINDOW: usize = 20;

/// Integer with optional thousands separators, or a decimal
const NUM: &str = r"(\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)";

/// Percentage number; comma is accepted as a decimal separator
const PCT: &str = r"(\d+(?:[.,]\d+)?)";

static RATE_RANGE_TEMPLATES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // 年1.5%〜年3.0%
        format!(r"年\s*{PCT}\s*%\s*〜\s*年\s*{PCT}\s*%"),
        // 年1.5〜3.0%
        format!(r"年\s*{PCT}\s*〜\s*{PCT}\s*%"),
        // 1.5%〜3.0%
        format!(r"{PCT}\s*%\s*[〜-]\s*(?:年\s*)?{PCT}\s*%"),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid rate template"))
    .collect()
});

static PERCENT_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"{PCT}\s*%")).expect("Invalid percent token regex")
});

/// Amount range templates: (num, unit, 円, num, unit, 円)
static AMOUNT_RANGE_TEMPLATES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // 10万円以上1,000万円以内
        format!(r"{NUM}\s*(億|万)?(円)?\s*以上\s*{NUM}\s*(億|万)?(円)?\s*(?:以内|以下|まで)"),
        // 10万円〜500万円
        format!(r"{NUM}\s*(億|万)?(円)?\s*[〜-]\s*{NUM}\s*(億|万)?(円)?"),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid amount template"))
    .collect()
});

/// Max-only amount templates: (num, unit)
static AMOUNT_MAX_TEMPLATES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // 500万円以内 / 500万円まで
        format!(r"{NUM}\s*(億|万)円?\s*(?:以内|まで|以下)"),
        // 最高500万円 / 限度額 1,000万円
        format!(r"(?:最高|限度額|上限|最大|極度額)[^\d\n]{{0,8}}{NUM}\s*(億|万)?円"),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid amount template"))
    .collect()
});

static TERM_RANGE_TEMPLATES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // 6ヶ月以上15年以内
        r"(\d+)\s*(年|ヶ?月)\s*以上\s*(\d+)\s*(年|ヶ?月)\s*(?:以内|以下|まで)",
        // 1年〜10年 (a bare 月 here would read 10月〜12月 as a term)
        r"(\d+)\s*(年|ヶ月)\s*[〜-]\s*(\d+)\s*(年|ヶ月)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid term template"))
    .collect()
});

static TERM_COMPOSITE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s*年\s*(\d+)\s*ヶ月").expect("Invalid composite term regex")
});

static TERM_MONTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s*ヶ月").expect("Invalid month token regex")
});

static TERM_YEAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s*年").expect("Invalid year token regex")
});

static DATE_MONTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\d{1,2}\s*月").expect("Invalid date month regex")
});

static AGE_BOTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,2})\s*歳\s*以上.*?(\d{1,2})\s*歳\s*(以下|未満|まで|以内)")
        .expect("Invalid age regex")
});

static AGE_TILDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,2})\s*歳\s*[〜-]\s*(?:満\s*)?(\d{1,2})\s*歳").expect("Invalid age regex")
});

static AGE_MIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,2})\s*歳\s*(?:以上|超)").expect("Invalid age regex")
});

static AGE_MAX_AT_COMPLETION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"完済時.*?(\d{1,2})\s*歳\s*(以下|未満|まで)").expect("Invalid age regex")
});

static AGE_MAX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,2})\s*歳\s*(以下|未満|まで|以内)").expect("Invalid age regex")
});

static REPAYMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:元利均等|元金均等)[^\n。]*?返済").expect("Invalid repayment regex")
});

/// Common product features recognized in any source text
static FEATURE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)WEB[^\n]{0,10}?(?:申込|完結)", "WEB申込対応"),
        (r"来店不要", "来店不要"),
        (r"担保[^\n]{0,4}?不要", "担保不要"),
        (r"保証人[^\n]{0,4}?不要", "保証人不要"),
        (r"随時返済", "随時返済可能"),
        (r"繰上返済[^\n]{0,10}?手数料[^\n]{0,6}?無料", "繰上返済手数料無料"),
    ]
    .iter()
    .map(|(p, label)| (Regex::new(p).expect("Invalid feature regex"), *label))
    .collect()
});

fn default_rate_exclusions() -> Vec<String> {
    ["引下げ", "引き下げ", "▲", "最大", "割引"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_rate_context() -> Vec<String> {
    ["金利", "利率", "実質年率"].iter().map(|s| s.to_string()).collect()
}

fn default_exclusion_window() -> usize {
    DEFAULT_EXCLUSION_WINDOW
}

/// Keyword tables used by the extractors, loaded once per run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSettings {
    /// Words marking promotional or discounted rates
    #[serde(default = "default_rate_exclusions")]
    pub rate_exclusions: Vec<String>,
    /// Words marking lines that talk about the rate
    #[serde(default = "default_rate_context")]
    pub rate_context: Vec<String>,
    /// Characters on each side of a percentage checked for exclusions
    #[serde(default = "default_exclusion_window")]
    pub exclusion_window: usize,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            rate_exclusions: default_rate_exclusions(),
            rate_context: default_rate_context(),
            exclusion_window: default_exclusion_window(),
        }
    }
}

/// Result of one extraction pass over a document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub fields: FieldSet,
    /// Field groups that came back empty, with the reason
    pub misses: Vec<FieldMiss>,
}

impl Extraction {
    /// An extraction over a document with no usable text
    pub fn empty() -> Self {
        Self {
            fields: FieldSet::default(),
            misses: [FieldGroup::Rate, FieldGroup::Amount, FieldGroup::Term, FieldGroup::Age]
                .into_iter()
                .map(|group| FieldMiss::new(group, MissReason::NoText))
                .collect(),
        }
    }

    pub fn missed(&self, group: FieldGroup) -> bool {
        self.misses.iter().any(|m| m.group == group)
    }
}

/// Run every extractor over normalized text.
///
/// With a channel, the rate is read from the section labelled for that
/// channel when the text has one.
pub fn extract_fields(
    text: &str,
    settings: &ExtractionSettings,
    channel: Option<Channel>,
) -> Extraction {
    if text.trim().is_empty() {
        return Extraction::empty();
    }

    let mut fields = FieldSet::default();
    let mut misses = Vec::new();

    let rate = match channel {
        Some(channel) => channel_rate(text, channel, settings),
        None => context_rate(text, settings),
    };
    match rate {
        Ok((min, max)) => {
            fields.interest_rate_min = Some(min);
            fields.interest_rate_max = Some(max);
        }
        Err(reason) => misses.push(FieldMiss::new(FieldGroup::Rate, reason)),
    }

    match amount_range(text) {
        Ok((min, max)) => {
            fields.loan_amount_min = min;
            fields.loan_amount_max = max;
        }
        Err(reason) => misses.push(FieldMiss::new(FieldGroup::Amount, reason)),
    }

    match term_range(text) {
        Ok((min, max)) => {
            fields.loan_term_min = Some(min);
            fields.loan_term_max = Some(max);
        }
        Err(reason) => misses.push(FieldMiss::new(FieldGroup::Term, reason)),
    }

    let (age_min, age_max) = extract_age(text);
    if age_min.is_none() && age_max.is_none() {
        misses.push(FieldMiss::new(FieldGroup::Age, MissReason::NoMatch));
    }
    fields.age_min = age_min;
    fields.age_max = age_max;

    fields.repayment_method = extract_repayment(text);
    fields.special_features = extract_features(text);

    Extraction { fields, misses }
}

// ========== Rate ==========

/// Extract the published base rate range as fractions of 1.
///
/// Range templates are tried from most to least specific. Without a range,
/// every percentage not next to an exclusion keyword is collected; two or more
/// survivors give (min, max), a lone survivor gives (v, v).
pub fn extract_rate(text: &str, exclusion_keywords: &[&str]) -> (Option<f64>, Option<f64>) {
    let keywords: Vec<String> = exclusion_keywords.iter().map(|s| s.to_string()).collect();
    match rate_range(text, &keywords, DEFAULT_EXCLUSION_WINDOW) {
        Ok((min, max)) => (Some(min), Some(max)),
        Err(_) => (None, None),
    }
}

/// Extract a rate from lines mentioning the rate first, then from the whole text
pub fn extract_rate_in_context(
    text: &str,
    settings: &ExtractionSettings,
) -> (Option<f64>, Option<f64>) {
    match context_rate(text, settings) {
        Ok((min, max)) => (Some(min), Some(max)),
        Err(_) => (None, None),
    }
}

/// Extract the rate from the section labelled for `channel`.
///
/// The section runs from a line carrying the channel label up to the next line
/// carrying the other channel's label. Falls back to the whole text.
pub fn extract_rate_for_channel(
    text: &str,
    channel: Channel,
    settings: &ExtractionSettings,
) -> (Option<f64>, Option<f64>) {
    match channel_rate(text, channel, settings) {
        Ok((min, max)) => (Some(min), Some(max)),
        Err(_) => (None, None),
    }
}

fn context_rate(
    text: &str,
    settings: &ExtractionSettings,
) -> std::result::Result<(f64, f64), MissReason> {
    let rate_lines = text.lines().filter(|line| {
        settings.rate_context.iter().any(|k| line.contains(k.as_str()))
            && !settings.rate_exclusions.iter().any(|k| line.contains(k.as_str()))
    });
    for line in rate_lines {
        if let Ok(range) = rate_range(line, &settings.rate_exclusions, settings.exclusion_window) {
            return Ok(range);
        }
    }
    rate_range(text, &settings.rate_exclusions, settings.exclusion_window)
}

fn channel_rate(
    text: &str,
    channel: Channel,
    settings: &ExtractionSettings,
) -> std::result::Result<(f64, f64), MissReason> {
    let lines: Vec<&str> = text.lines().collect();
    let label = channel.label();
    let other_label = channel.other().label();

    for (i, line) in lines.iter().enumerate() {
        if !line.contains(label) {
            continue;
        }
        let end = lines[i + 1..]
            .iter()
            .position(|l| l.contains(other_label))
            .map(|offset| i + 1 + offset)
            .unwrap_or(lines.len());
        let section = lines[i..end].join("\n");
        if let Ok(range) =
            rate_range(&section, &settings.rate_exclusions, settings.exclusion_window)
        {
            debug!(channel = label, "rate taken from channel section");
            return Ok(range);
        }
    }
    context_rate(text, settings)
}

fn rate_range(
    text: &str,
    exclusions: &[String],
    window: usize,
) -> std::result::Result<(f64, f64), MissReason> {
    let mut out_of_band = false;

    for template in RATE_RANGE_TEMPLATES.iter() {
        for caps in template.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let context = range_context(text, whole.start(), whole.end(), window);
            if exclusions.iter().any(|k| context.contains(k.as_str())) {
                debug!(range = whole.as_str(), "discount range skipped");
                continue;
            }
            let (Some(a), Some(b)) = (percent_to_fraction(&caps[1]), percent_to_fraction(&caps[2]))
            else {
                continue;
            };
            if in_rate_band(a) && in_rate_band(b) {
                return Ok((a.min(b), a.max(b)));
            }
            out_of_band = true;
        }
    }

    let mut saw_token = false;
    let mut survivors = Vec::new();
    for caps in PERCENT_TOKEN_RE.captures_iter(text) {
        saw_token = true;
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let context = context_around(text, whole.start(), whole.end(), window);
        if exclusions.iter().any(|k| context.contains(k.as_str())) {
            continue;
        }
        match percent_to_fraction(&caps[1]) {
            Some(v) if in_rate_band(v) => survivors.push(v),
            Some(_) => out_of_band = true,
            None => {}
        }
    }

    match survivors.len() {
        0 if out_of_band => Err(MissReason::OutOfBand),
        0 if saw_token => Err(MissReason::Excluded),
        0 => Err(MissReason::NoMatch),
        1 => Ok((survivors[0], survivors[0])),
        _ => {
            let min = survivors.iter().copied().fold(f64::INFINITY, f64::min);
            let max = survivors.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            Ok((min, max))
        }
    }
}

/// Parse a percentage number into a fraction of 1, rounded to 6 places
fn percent_to_fraction(raw: &str) -> Option<f64> {
    let value: f64 = raw.replace(',', ".").parse().ok()?;
    Some(((value / 100.0) * 1_000_000.0).round() / 1_000_000.0)
}

fn in_rate_band(v: f64) -> bool {
    v >= RATE_BAND.0 && v <= RATE_BAND.1
}

/// Text within `window` characters on each side of a byte span
fn context_around(text: &str, start: usize, end: usize, window: usize) -> String {
    let before: Vec<char> = text[..start].chars().rev().take(window).collect();
    let mut context: String = before.into_iter().rev().collect();
    context.push_str(&text[start..end]);
    context.extend(text[end..].chars().take(window));
    context
}

/// Context of a range match: the clause leading up to it, then `window` characters after.
///
/// A keyword in an earlier clause qualifies that clause, not this range.
fn range_context(text: &str, start: usize, end: usize, window: usize) -> String {
    let before: Vec<char> = text[..start]
        .chars()
        .rev()
        .take(window)
        .take_while(|c| !c.is_whitespace() && !matches!(c, '。' | '、'))
        .collect();
    let mut context: String = before.into_iter().rev().collect();
    context.push_str(&text[start..end]);
    context.extend(text[end..].chars().take(window));
    context
}

// ========== Amount ==========

/// Extract the loan amount range in yen.
///
/// Max-only phrasings (`500万円以内`, `最高500万円`) leave the minimum unset.
pub fn extract_amount(text: &str) -> (Option<i64>, Option<i64>) {
    amount_range(text).unwrap_or((None, None))
}

fn amount_range(
    text: &str,
) -> std::result::Result<(Option<i64>, Option<i64>), MissReason> {
    let mut too_small = false;

    for template in AMOUNT_RANGE_TEMPLATES.iter() {
        for caps in template.captures_iter(text) {
            let unit_max = caps.get(5).map(|m| m.as_str());
            let yen_max = caps.get(6).is_some();
            if unit_max.is_none() && !yen_max {
                continue;
            }
            // 10〜500万円: a bare lower bound borrows the upper bound's unit
            let unit_min = match (caps.get(2), caps.get(3)) {
                (Some(unit), _) => Some(unit.as_str()),
                (None, Some(_)) => None,
                (None, None) => unit_max,
            };
            let (Some(min), Some(max)) = (to_yen(&caps[1], unit_min), to_yen(&caps[4], unit_max))
            else {
                continue;
            };
            if min < MIN_AMOUNT_YEN || max < MIN_AMOUNT_YEN {
                too_small = true;
                continue;
            }
            return Ok((Some(min), Some(max)));
        }
    }

    for template in AMOUNT_MAX_TEMPLATES.iter() {
        for caps in template.captures_iter(text) {
            let unit = caps.get(2).map(|m| m.as_str());
            let Some(max) = to_yen(&caps[1], unit) else {
                continue;
            };
            if max < MIN_AMOUNT_YEN {
                too_small = true;
                continue;
            }
            return Ok((None, Some(max)));
        }
    }

    if too_small {
        Err(MissReason::OutOfBand)
    } else {
        Err(MissReason::NoMatch)
    }
}

fn to_yen(number: &str, unit: Option<&str>) -> Option<i64> {
    let value: f64 = number.replace(',', "").parse().ok()?;
    let multiplier = match unit {
        Some("億") => 100_000_000.0,
        Some("万") => 10_000.0,
        _ => 1.0,
    };
    let yen = (value * multiplier).round();
    if !yen.is_finite() || yen >= i64::MAX as f64 {
        return None;
    }
    Some(yen as i64)
}

// ========== Term ==========

/// Extract the loan term range in months.
///
/// Years are converted to months before any comparison. Explicit range
/// templates win when both ends are plausible; otherwise every month and year
/// token is a candidate, filtered by the 6–480 month window unless that leaves
/// nothing.
pub fn extract_term(text: &str) -> (Option<u32>, Option<u32>) {
    match term_range(text) {
        Ok((min, max)) => (Some(min), Some(max)),
        Err(_) => (None, None),
    }
}

fn term_range(text: &str) -> std::result::Result<(u32, u32), MissReason> {
    for template in TERM_RANGE_TEMPLATES.iter() {
        for caps in template.captures_iter(text) {
            let (Some(a), Some(b)) = (
                to_months(&caps[1], &caps[2]),
                to_months(&caps[3], &caps[4]),
            ) else {
                continue;
            };
            if in_term_window(a) && in_term_window(b) {
                debug!(template = template.as_str(), "term range template matched");
                return Ok((a.min(b), a.max(b)));
            }
        }
    }

    let candidates = term_candidates(text);
    if candidates.is_empty() {
        return Err(MissReason::NoMatch);
    }
    let plausible: Vec<u32> = candidates.iter().copied().filter(|m| in_term_window(*m)).collect();
    let pool = if plausible.is_empty() { &candidates } else { &plausible };
    let min = pool.iter().copied().min().unwrap_or_default();
    let max = pool.iter().copied().max().unwrap_or_default();
    Ok((min, max))
}

fn to_months(value: &str, unit: &str) -> Option<u32> {
    let n: u32 = value.parse().ok()?;
    if unit == "年" {
        n.checked_mul(12)
    } else {
        Some(n)
    }
}

fn in_term_window(months: u32) -> bool {
    months >= TERM_WINDOW.0 && months <= TERM_WINDOW.1
}

/// Every month-denominated candidate: `N年Mヶ月`, `Nヶ月` and `N年` tokens
fn term_candidates(text: &str) -> Vec<u32> {
    let mut candidates = Vec::new();
    let mut taken: Vec<(usize, usize)> = Vec::new();

    for caps in TERM_COMPOSITE_RE.captures_iter(text) {
        let (Ok(years), Ok(months)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
            continue;
        };
        if (1..=40).contains(&years) && months < 12 {
            candidates.push(years * 12 + months);
            if let Some(m) = caps.get(0) {
                taken.push((m.start(), m.end()));
            }
        }
    }
    let overlaps = |start: usize, end: usize| taken.iter().any(|(s, e)| start < *e && end > *s);

    for caps in TERM_MONTH_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if overlaps(whole.start(), whole.end()) {
            continue;
        }
        if let Ok(months) = caps[1].parse::<u32>() {
            if (1..=480).contains(&months) {
                candidates.push(months);
            }
        }
    }

    for caps in TERM_YEAR_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if overlaps(whole.start(), whole.end()) || is_calendar_year(text, whole.start(), whole.end()) {
            continue;
        }
        if let Ok(years) = caps[1].parse::<u32>() {
            if (1..=40).contains(&years) {
                candidates.push(years * 12);
            }
        }
    }

    candidates
}

/// `2024年4月`, `令和6年`, `6年度` and decimals like `2.5年` are not terms
fn is_calendar_year(text: &str, start: usize, end: usize) -> bool {
    let after = &text[end..];
    if DATE_MONTH_RE.is_match(after) || after.starts_with('度') || after.starts_with('齢') {
        return true;
    }
    let before = &text[..start];
    if before.ends_with('.') || before.ends_with(',') {
        return true;
    }
    ["令和", "平成", "昭和", "西暦"]
        .iter()
        .any(|era| before.trim_end().ends_with(era))
}

// ========== Age ==========

/// Extract the eligible age range. `未満` bounds are converted to inclusive.
pub fn extract_age(text: &str) -> (Option<u32>, Option<u32>) {
    if let Some(caps) = AGE_BOTH_RE.captures(text) {
        let min = caps[1].parse().ok();
        let max = caps[2].parse().ok().map(|v| inclusive_max(v, &caps[3]));
        return (min, max);
    }
    if let Some(caps) = AGE_TILDE_RE.captures(text) {
        return (caps[1].parse().ok(), caps[2].parse().ok());
    }

    let min = AGE_MIN_RE.captures(text).and_then(|caps| caps[1].parse().ok());
    let max = AGE_MAX_AT_COMPLETION_RE
        .captures(text)
        .or_else(|| AGE_MAX_RE.captures(text))
        .and_then(|caps| caps[1].parse().ok().map(|v| inclusive_max(v, &caps[2])));
    (min, max)
}

fn inclusive_max(value: u32, qualifier: &str) -> u32 {
    if qualifier == "未満" {
        value.saturating_sub(1)
    } else {
        value
    }
}

// ========== Misc ==========

/// Repayment method phrase such as `元利均等毎月返済`
pub fn extract_repayment(text: &str) -> Option<String> {
    REPAYMENT_RE.find(text).map(|m| m.as_str().to_string())
}

/// Common features (no collateral, no guarantor, web application...) found in text
pub fn extract_features(text: &str) -> BTreeSet<String> {
    FEATURE_PATTERNS
        .iter()
        .filter(|(re, _)| re.is_match(text))
        .map(|(_, label)| label.to_string())
        .collect()
}
