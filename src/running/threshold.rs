//! Per-animal movement threshold from the quietest stretches of the trace.

use serde::Serialize;

use crate::stats::{mean, percentile, std_dev};

/// Sliding-window scan settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuietScan {
    /// Window length as a fraction of the trace length.
    pub window_fraction: f64,
    /// Shorter windows are not scanned at all.
    pub min_window: usize,
    /// Windows whose std is at or below this percentile are "quiet".
    pub percentile: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdEstimate {
    pub threshold: f64,
    /// True when the quiet-window estimate replaced the fixed threshold.
    pub adaptive: bool,
    pub quiet_mean: Option<f64>,
    pub quiet_std: Option<f64>,
    pub quiet_windows: usize,
}

impl ThresholdEstimate {
    pub fn fixed(threshold: f64) -> Self {
        Self {
            threshold,
            adaptive: false,
            quiet_mean: None,
            quiet_std: None,
            quiet_windows: 0,
        }
    }
}

/// `(start, end_exclusive)` of every window at or below the std percentile.
pub fn quiet_windows(trace: &[f64], scan: &QuietScan) -> Vec<(usize, usize)> {
    let window = (trace.len() as f64 * scan.window_fraction) as usize;
    if window < scan.min_window || window == 0 || window > trace.len() {
        return Vec::new();
    }
    let step = (window / 4).max(1);

    let windows: Vec<(usize, f64)> = (0..=trace.len() - window)
        .step_by(step)
        .map(|start| (start, std_dev(&trace[start..start + window])))
        .collect();
    let stds: Vec<f64> = windows.iter().map(|w| w.1).collect();
    let cutoff = percentile(&stds, scan.percentile);

    windows
        .into_iter()
        .filter(|(_, s)| *s <= cutoff)
        .map(|(start, _)| (start, start + window))
        .collect()
}

/// Keep `fixed` if it already exceeds the quiet mean, else `|mean| + 3·std` of the quiet samples.
pub fn estimate_threshold(trace: &[f64], fixed: f64, scan: &QuietScan) -> ThresholdEstimate {
    let windows = quiet_windows(trace, scan);
    if windows.is_empty() {
        log::info!(
            "Trace of {} samples too short for a quiet-window scan, using fixed threshold {fixed}",
            trace.len()
        );
        return ThresholdEstimate::fixed(fixed);
    }

    // Union of window samples; overlapping windows contribute each sample once.
    let mut in_quiet = vec![false; trace.len()];
    for &(start, end) in &windows {
        in_quiet[start..end].iter_mut().for_each(|q| *q = true);
    }
    let samples: Vec<f64> = trace
        .iter()
        .zip(&in_quiet)
        .filter(|(_, q)| **q)
        .map(|(v, _)| *v)
        .collect();

    let quiet_mean = mean(&samples);
    let quiet_std = std_dev(&samples);
    let adaptive_value = quiet_mean.abs() + 3.0 * quiet_std;
    let keep_fixed = fixed > quiet_mean.abs();

    log::debug!(
        "Quiet baseline from {} windows: mean {:.4}, std {:.4}; adaptive candidate {:.4}",
        windows.len(),
        quiet_mean,
        quiet_std,
        adaptive_value
    );

    ThresholdEstimate {
        threshold: if keep_fixed { fixed } else { adaptive_value },
        adaptive: !keep_fixed,
        quiet_mean: Some(quiet_mean),
        quiet_std: Some(quiet_std),
        quiet_windows: windows.len(),
    }
}
