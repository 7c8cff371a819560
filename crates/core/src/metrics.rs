//! Training metrics scraped from the tail of a training log.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// How many trailing bytes of a log are scanned for metrics.
pub const METRICS_TAIL_BYTES: u64 = 2000;

static STEP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Step:\s*(\d+)").expect("valid step regex"));
static TRAIN_LOSS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Train Loss:\s*([0-9.]+)").expect("valid train loss regex"));
static VAL_LOSS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Val Loss:\s*([0-9.]+)").expect("valid val loss regex"));

/// Most recent training step and loss values found in a log excerpt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingMetrics {
    pub steps: Option<u64>,
    pub train_loss: Option<f64>,
    pub val_loss: Option<f64>,
}

/// Extract the latest `Step:`, `Train Loss:` and `Val Loss:` values.
pub fn parse_training_metrics(log: &str) -> TrainingMetrics {
    TrainingMetrics {
        steps: last_capture(&STEP, log),
        train_loss: last_capture(&TRAIN_LOSS, log),
        val_loss: last_capture(&VAL_LOSS, log),
    }
}

fn last_capture<T: std::str::FromStr>(re: &Regex, text: &str) -> Option<T> {
    re.captures_iter(text)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
        .last()
}
