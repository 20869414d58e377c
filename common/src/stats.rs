use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

static RUN_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Run Time \(s\): real ([\d.]+)").unwrap());

/// Returns the second `Run Time` figure of a run, the first one being the
/// warm-up pass.
pub fn extract_sample(output: &str) -> Option<f64> {
    let mut times = RUN_TIME
        .captures_iter(output)
        .filter_map(|cap| cap.get(1).and_then(|m| m.as_str().parse::<f64>().ok()));
    let warmup = times.next()?;
    let sample = times.next();
    debug!("warm-up={warmup} sample={sample:?}");
    sample
}

/// Samples of one benchmark identity
#[derive(Debug, Default, Clone, Serialize)]
pub struct AggregateResult {
    pub samples: Vec<f64>,
}

impl AggregateResult {
    pub fn push(&mut self, sample: f64) {
        self.samples.push(sample);
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Sample standard deviation, 0 below two samples
    pub fn stddev(&self) -> f64 {
        let n = self.samples.len();
        let Some(mean) = self.mean().filter(|_| n > 1) else {
            return 0.0;
        };
        let variance = self
            .samples
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        variance.sqrt()
    }
}
