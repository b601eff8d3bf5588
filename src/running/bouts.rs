//! Locomotion bout detection and classification over a running-speed trace.
//!
//! Detection works on `|speed|` smoothed by a short moving average. General
//! bouts are supra-threshold runs that survive the duration and peak filters,
//! get merged across short or mostly-active gaps, and are extended down their
//! onset/offset ramps. Each general bout that does not touch a trace edge is
//! then relabeled as exactly one of jerk, locomotion, reset or other. Rest
//! bouts are found independently.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::filters::{FilterError, moving_average};
use super::threshold::{QuietScan, ThresholdEstimate, estimate_threshold};
use crate::align::FALLBACK_RUNNING_RATE;
use crate::stats::mean;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoutCategory {
    General,
    Locomotion,
    Reset,
    Jerk,
    Other,
    Rest,
}

impl BoutCategory {
    pub const ALL: [BoutCategory; 6] = [
        Self::General,
        Self::Locomotion,
        Self::Reset,
        Self::Jerk,
        Self::Other,
        Self::Rest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Locomotion => "locomotion",
            Self::Reset => "reset",
            Self::Jerk => "jerk",
            Self::Other => "other",
            Self::Rest => "rest",
        }
    }
}

impl fmt::Display for BoutCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive index range `[start, end]` into the aligned running trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bout {
    pub start: usize,
    pub end: usize,
    pub category: BoutCategory,
}

impl Bout {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn contains(&self, other: &Bout) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &Bout) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// `(onset, offset)` in seconds; `None` if the indices fall outside `timestamps`.
    pub fn time_range(&self, timestamps: &[f64]) -> Option<(f64, f64)> {
        Some((*timestamps.get(self.start)?, *timestamps.get(self.end)?))
    }

    fn relabel(self, category: BoutCategory) -> Self {
        Self { category, ..self }
    }
}

/// `[bouts]` section of the config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoutParams {
    /// Moving-average window over `|speed|` before detection; 1 or less disables it.
    pub smooth_window: usize,
    /// Fixed threshold in cm/s.
    pub threshold: f64,
    pub adaptive_threshold: bool,
    /// Seconds.
    pub min_duration: f64,
    pub rest_min_duration: f64,
    pub pre_buffer: f64,
    pub post_buffer: f64,
    /// Shorter quiet-flanked bouts are jerks, longer ones locomotion.
    pub locomotion_duration: f64,
    pub merge_gap_samples: usize,
    pub merge_gap_fraction: f64,
    pub quiet_window_fraction: f64,
    pub min_quiet_window: usize,
    pub quiet_percentile: f64,
}

impl Default for BoutParams {
    fn default() -> Self {
        Self {
            smooth_window: 5,
            threshold: 0.5,
            adaptive_threshold: true,
            min_duration: 0.5,
            rest_min_duration: 4.0,
            pre_buffer: 5.0,
            post_buffer: 5.0,
            locomotion_duration: 2.0,
            merge_gap_samples: 5,
            merge_gap_fraction: 0.5,
            quiet_window_fraction: 0.01,
            min_quiet_window: 10,
            quiet_percentile: 10.0,
        }
    }
}

impl BoutParams {
    pub fn quiet_scan(&self) -> QuietScan {
        QuietScan {
            window_fraction: self.quiet_window_fraction,
            min_window: self.min_quiet_window,
            percentile: self.quiet_percentile,
        }
    }
}

/// Classified bouts for one trace. Every bucket is ordered by start index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoutSet {
    pub general: Vec<Bout>,
    pub locomotion: Vec<Bout>,
    pub reset: Vec<Bout>,
    pub jerk: Vec<Bout>,
    pub other: Vec<Bout>,
    pub rest: Vec<Bout>,
    pub threshold: ThresholdEstimate,
    pub sample_rate: f64,
    /// The trace the thresholds were applied to.
    #[serde(skip)]
    pub detection: Vec<f64>,
}

impl BoutSet {
    pub fn of(&self, category: BoutCategory) -> &[Bout] {
        match category {
            BoutCategory::General => &self.general,
            BoutCategory::Locomotion => &self.locomotion,
            BoutCategory::Reset => &self.reset,
            BoutCategory::Jerk => &self.jerk,
            BoutCategory::Other => &self.other,
            BoutCategory::Rest => &self.rest,
        }
    }

    pub fn count(&self, category: BoutCategory) -> usize {
        self.of(category).len()
    }

    /// Seconds spent in bouts of `category`.
    pub fn total_duration(&self, category: BoutCategory) -> f64 {
        self.of(category).iter().map(|b| b.len() as f64).sum::<f64>() / self.sample_rate
    }
}

/// `1 / mean(diff(timestamps))`, falling back for degenerate inputs.
pub fn sample_rate(timestamps: &[f64]) -> f64 {
    if timestamps.len() < 2 {
        return FALLBACK_RUNNING_RATE;
    }
    let diffs: Vec<f64> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();
    let step = mean(&diffs);
    if step > 0.0 && step.is_finite() {
        1.0 / step
    } else {
        FALLBACK_RUNNING_RATE
    }
}

pub fn detect_bouts(speed: &[f64], timestamps: &[f64], params: &BoutParams) -> Result<BoutSet, FilterError> {
    let rate = sample_rate(timestamps);
    let abs_speed: Vec<f64> = speed.iter().map(|v| v.abs()).collect();
    let detection = if params.smooth_window > 1 {
        moving_average(&abs_speed, params.smooth_window)?
    } else {
        abs_speed
    };

    let estimate = if params.adaptive_threshold {
        estimate_threshold(&detection, params.threshold, &params.quiet_scan())
    } else {
        ThresholdEstimate::fixed(params.threshold)
    };
    let thr = estimate.threshold;
    let floor = estimate.quiet_mean.map(f64::abs).unwrap_or(0.0);
    let n = detection.len();

    let min_len = params.min_duration * rate;
    let candidates: Vec<Bout> = runs(&detection, |v| v >= thr)
        .into_iter()
        .filter(|b| b.len() as f64 >= min_len)
        .filter(|b| detection[b.start..=b.end].iter().any(|v| *v >= 2.0 * thr))
        .collect();
    log::debug!("{} supra-threshold runs pass duration and peak filters", candidates.len());

    let combined = combine(candidates, &detection, thr, params);
    let extended: Vec<Bout> = combined.into_iter().map(|b| extend(b, &detection, floor)).collect();
    let general: Vec<Bout> = remerge(extended)
        .into_iter()
        .filter(|b| !touches_edge(b, n))
        .collect();

    let rest_len = params.rest_min_duration * rate;
    let rest: Vec<Bout> = runs(&detection, |v| v < thr)
        .into_iter()
        .filter(|b| b.len() as f64 >= rest_len && !touches_edge(b, n))
        .map(|b| b.relabel(BoutCategory::Rest))
        .collect();

    let mut set = BoutSet {
        general: Vec::with_capacity(general.len()),
        locomotion: Vec::new(),
        reset: Vec::new(),
        jerk: Vec::new(),
        other: Vec::new(),
        rest,
        threshold: estimate,
        sample_rate: rate,
        detection,
    };

    let pre = (params.pre_buffer * rate) as usize;
    let post = (params.post_buffer * rate) as usize;
    for bout in general {
        // Buffers are judged on the same trace the threshold was applied to.
        let pre_mean = window_mean(&set.detection, bout.start.saturating_sub(pre), bout.start);
        let post_mean = window_mean(&set.detection, bout.end + 1, (bout.end + 1 + post).min(n));
        let duration = bout.len() as f64 / rate;

        let pre_quiet = pre_mean < thr;
        let post_quiet = post_mean < thr;
        let category = if pre_quiet && post_quiet && duration < params.locomotion_duration {
            BoutCategory::Jerk
        } else if pre_quiet && post_quiet {
            BoutCategory::Locomotion
        } else if !pre_quiet {
            BoutCategory::Reset
        } else {
            BoutCategory::Other
        };

        let labeled = bout.relabel(category);
        match category {
            BoutCategory::Jerk => set.jerk.push(labeled),
            BoutCategory::Locomotion => set.locomotion.push(labeled),
            BoutCategory::Reset => set.reset.push(labeled),
            _ => set.other.push(labeled),
        }
        set.general.push(bout);
    }

    log::info!(
        "Bouts at threshold {:.3} cm/s ({}): {} general, {} locomotion, {} reset, {} jerk, {} other, {} rest",
        thr,
        if set.threshold.adaptive { "adaptive" } else { "fixed" },
        set.general.len(),
        set.locomotion.len(),
        set.reset.len(),
        set.jerk.len(),
        set.other.len(),
        set.rest.len()
    );
    Ok(set)
}

/// Maximal runs of samples satisfying `pred`, as general bouts.
fn runs(trace: &[f64], pred: impl Fn(f64) -> bool) -> Vec<Bout> {
    let mut out = Vec::new();
    let mut open: Option<usize> = None;
    for (i, &v) in trace.iter().enumerate() {
        match (pred(v), open) {
            (true, None) => open = Some(i),
            (false, Some(start)) => {
                out.push(general(start, i - 1));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        out.push(general(start, trace.len() - 1));
    }
    out
}

fn general(start: usize, end: usize) -> Bout {
    Bout {
        start,
        end,
        category: BoutCategory::General,
    }
}

fn combine(bouts: Vec<Bout>, trace: &[f64], thr: f64, params: &BoutParams) -> Vec<Bout> {
    let mut out: Vec<Bout> = Vec::with_capacity(bouts.len());
    for bout in bouts {
        if let Some(last) = out.last_mut() {
            let gap = &trace[last.end + 1..bout.start];
            let active = gap.iter().filter(|v| **v >= thr).count();
            let mostly_active = !gap.is_empty() && active as f64 / gap.len() as f64 > params.merge_gap_fraction;
            if gap.len() <= params.merge_gap_samples || mostly_active {
                last.end = bout.end;
                continue;
            }
        }
        out.push(bout);
    }
    out
}

/// Walk each edge outward down a strictly decreasing ramp that stays above `floor`.
fn extend(mut bout: Bout, trace: &[f64], floor: f64) -> Bout {
    while bout.start > 0 {
        let next = trace[bout.start - 1];
        if next < trace[bout.start] && next > floor {
            bout.start -= 1;
        } else {
            break;
        }
    }
    while bout.end + 1 < trace.len() {
        let next = trace[bout.end + 1];
        if next < trace[bout.end] && next > floor {
            bout.end += 1;
        } else {
            break;
        }
    }
    bout
}

/// Merge overlapping or adjacent bouts.
fn remerge(mut bouts: Vec<Bout>) -> Vec<Bout> {
    bouts.sort_by_key(|b| b.start);
    let mut out: Vec<Bout> = Vec::with_capacity(bouts.len());
    for bout in bouts {
        match out.last_mut() {
            Some(last) if bout.start <= last.end + 1 => last.end = last.end.max(bout.end),
            _ => out.push(bout),
        }
    }
    out
}

fn touches_edge(bout: &Bout, n: usize) -> bool {
    bout.start == 0 || bout.end + 1 >= n
}

/// Mean over `[lo, hi)`; an empty window counts as quiet.
fn window_mean(values: &[f64], lo: usize, hi: usize) -> f64 {
    if lo >= hi { 0.0 } else { mean(&values[lo..hi]) }
}
