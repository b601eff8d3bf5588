//! ΔF/F formulas and baseline-window z-scoring.

use serde::Serialize;

use super::SignalError;
use crate::stats::{mean, median, std_dev};

/// Which ΔF/F formula produced a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DffFormula {
    /// `motion_corrected / median(raw_target)`
    MotionCorrected,
    /// `(raw_target − fitted_reference) / fitted_reference`
    FittedReference,
    /// `(raw_target − baseline_fit) / median(raw_target[window])`
    BaselineFit,
    /// `(raw_target − median(window)) / median(window)`
    BaselineMedian,
}

/// Zero denominators become machine epsilon.
pub fn nonzero(v: f64) -> f64 {
    if v == 0.0 { f64::EPSILON } else { v }
}

/// Indices with `start ≤ time ≤ end`.
pub fn window_indices(time: &[f64], (start, end): (f64, f64)) -> Vec<usize> {
    time.iter()
        .enumerate()
        .filter(|(_, t)| **t >= start && **t <= end)
        .map(|(i, _)| i)
        .collect()
}

fn select(values: &[f64], idx: &[usize]) -> Vec<f64> {
    idx.iter().map(|&i| values[i]).collect()
}

pub fn dff_motion_corrected(motion_corrected: &[f64], raw_target: &[f64]) -> Vec<f64> {
    let denom = nonzero(median(raw_target));
    motion_corrected.iter().map(|v| v / denom).collect()
}

pub fn dff_fitted_reference(raw_target: &[f64], fitted: &[f64]) -> Vec<f64> {
    raw_target
        .iter()
        .zip(fitted)
        .map(|(x, f)| (x - f) / nonzero(*f))
        .collect()
}

pub fn dff_baseline_fit(raw_target: &[f64], baseline_fit: &[f64], window: &[usize]) -> Vec<f64> {
    let denom = nonzero(median(&select(raw_target, window)));
    raw_target
        .iter()
        .zip(baseline_fit)
        .map(|(x, b)| (x - b) / denom)
        .collect()
}

pub fn dff_baseline_median(raw_target: &[f64], window: &[usize]) -> Vec<f64> {
    let denom = nonzero(median(&select(raw_target, window)));
    raw_target.iter().map(|x| (x - denom) / denom).collect()
}

/// `(dff − mean(window)) / std(window)`; an exactly flat window gives zeros.
pub fn zscore(dff: &[f64], window: &[usize]) -> Result<Vec<f64>, SignalError> {
    if window.is_empty() {
        return Err(SignalError::NoBaselineSamples);
    }
    if window.len() < 2 {
        return Err(SignalError::InsufficientBaseline(window.len()));
    }
    let baseline = select(dff, window);
    let mu = mean(&baseline);
    let sigma = std_dev(&baseline);
    if sigma == 0.0 {
        return Ok(vec![0.0; dff.len()]);
    }
    Ok(dff.iter().map(|v| (v - mu) / sigma).collect())
}
