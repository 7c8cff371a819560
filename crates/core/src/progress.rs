//! Best-effort progress extraction from external process output.
//!
//! Parsers are pure functions from one output line to an optional
//! percentage. A line that does not parse is plain log output; it is never
//! an error.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::JobKind;

/// Lowest progress value a job can report.
pub const MIN_PROGRESS: f64 = 0.0;

/// Highest progress value a job can report.
pub const MAX_PROGRESS: f64 = 100.0;

/// A per-kind line parser.
pub type ProgressParser = fn(&str) -> Option<f64>;

/// Matches the last `NN%` or `NN.N%` token in a line.
static PERCENT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("valid percent regex"));

/// Return the parser registered for a job kind.
pub fn parser_for(kind: JobKind) -> ProgressParser {
    match kind {
        JobKind::Prep => parse_prep_line,
        JobKind::Train => parse_train_line,
    }
}

/// Training output: a JSON object with a numeric `percent` (or `progress`)
/// field, falling back to a `NN%` token.
pub fn parse_train_line(line: &str) -> Option<f64> {
    parse_json_percent(line).or_else(|| parse_percent_token(line))
}

/// Preparation output: a bare number (`"42"`), falling back to a `NN%`
/// token and then to the JSON form.
pub fn parse_prep_line(line: &str) -> Option<f64> {
    parse_bare_number(line)
        .or_else(|| parse_percent_token(line))
        .or_else(|| parse_json_percent(line))
}

/// Parse `{"percent": 12.5}` or `{"progress": 12.5}`.
pub fn parse_json_percent(line: &str) -> Option<f64> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    value
        .get("percent")
        .or_else(|| value.get("progress"))
        .and_then(serde_json::Value::as_f64)
        .filter(|p| p.is_finite())
}

/// Parse a line that consists solely of a number.
pub fn parse_bare_number(line: &str) -> Option<f64> {
    line.trim().parse::<f64>().ok().filter(|p| p.is_finite())
}

/// Parse the last `NN%` token in a line, e.g. `"epoch 3: 45.5% done"`.
pub fn parse_percent_token(line: &str) -> Option<f64> {
    PERCENT_TOKEN
        .captures_iter(line)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Decide whether a reported value advances a job's progress.
///
/// The value is clamped into `MIN_PROGRESS..=MAX_PROGRESS`. Returns the
/// clamped value when it is strictly greater than `current` (or when no
/// progress has been recorded yet), otherwise `None`. Non-finite values are
/// ignored.
pub fn next_progress(current: Option<f64>, reported: f64) -> Option<f64> {
    if !reported.is_finite() {
        return None;
    }
    let clamped = reported.clamp(MIN_PROGRESS, MAX_PROGRESS);
    match current {
        Some(cur) if clamped <= cur => None,
        _ => Some(clamped),
    }
}
