//! Running-speed post-processing: optional filter chain, then bout detection.

pub mod bouts;
pub mod filters;
pub mod threshold;

use serde::{Deserialize, Serialize};

use crate::encoder::{DecodeOptions, RunningTrace};
use bouts::{BoutParams, BoutSet, detect_bouts};
use filters::{FilterError, RunningFilter};

/// `[running]` section of the config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunningOptions {
    pub diameter_cm: f64,
    pub invert: bool,
    /// Zero-based encoder channel carrying the wheel signal.
    pub channel: usize,
    pub voltage_range: Option<(f64, f64)>,
    pub allow_partial_segment: bool,
    pub filters: Vec<RunningFilter>,
}

impl Default for RunningOptions {
    fn default() -> Self {
        let decode = DecodeOptions::default();
        Self {
            diameter_cm: decode.diameter_cm,
            invert: decode.invert,
            channel: decode.channel,
            voltage_range: decode.voltage_range,
            allow_partial_segment: decode.allow_partial_segment,
            filters: Vec::new(),
        }
    }
}

impl RunningOptions {
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            diameter_cm: self.diameter_cm,
            invert: self.invert,
            channel: self.channel,
            voltage_range: self.voltage_range,
            allow_partial_segment: self.allow_partial_segment,
        }
    }
}

/// The aligned trace plus its filtered copy, if any filter ran.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredRunning {
    pub original: RunningTrace,
    pub filtered: Option<Vec<f64>>,
    /// Labels of the filters applied, in order.
    pub applied: Vec<String>,
}

impl FilteredRunning {
    /// The speed trace bouts are detected on.
    pub fn speed(&self) -> &[f64] {
        self.filtered.as_deref().unwrap_or(&self.original.speed)
    }

    pub fn detect_bouts(&self, params: &BoutParams) -> Result<BoutSet, FilterError> {
        if self.filtered.is_some() {
            log::info!("Detecting bouts on filtered speed ({})", self.applied.join(" → "));
        } else {
            log::info!("Detecting bouts on unfiltered speed");
        }
        detect_bouts(self.speed(), &self.original.timestamps, params)
    }
}

pub fn apply_filters(trace: &RunningTrace, chain: &[RunningFilter]) -> Result<FilteredRunning, FilterError> {
    if chain.is_empty() {
        return Ok(FilteredRunning {
            original: trace.clone(),
            filtered: None,
            applied: Vec::new(),
        });
    }

    let mut speed = trace.speed.clone();
    let mut applied = Vec::with_capacity(chain.len());
    for filter in chain {
        speed = filter.apply(&speed)?;
        log::debug!("Applied {} to {} speed samples", filter.label(), speed.len());
        applied.push(filter.label());
    }

    Ok(FilteredRunning {
        original: trace.clone(),
        filtered: Some(speed),
        applied,
    })
}
