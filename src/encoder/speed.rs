//! Rotary-encoder voltage → wheel speed.
//!
//! The encoder emits a sawtooth voltage: one full sweep of the calibrated
//! range per wheel revolution. Each output sample is computed from one
//! segment of `saveEvery` raw samples.

use serde::Serialize;

use crate::stats::mean;

/// Sample-to-sample jump (raw units) that marks a sawtooth transition.
pub const TRANSITION_JUMP: f64 = 2.0;
/// Samples ignored at each end of the trace, and half-width of the peak window.
pub const PEAK_HALF_WINDOW: usize = 50;
/// Transitions must peak above `mean + PEAK_FRACTION·(max − mean)`.
pub const PEAK_FRACTION: f64 = 0.8;
/// A calibrated range spanning this many raw units or less is rejected.
pub const MIN_RANGE_SPAN: f64 = 3.0;
pub const DEFAULT_VOLTAGE_RANGE: (f64, f64) = (0.0, 5.0);
/// Intra-segment jump, relative to the range span, treated as a wrap-around.
pub const WRAP_FRACTION: f64 = 0.6;
/// Samples averaged at each end of a segment.
pub const EDGE_SAMPLES: usize = 11;
/// Displacements beyond ±this many degrees are corrected by a full turn.
pub const WRAP_DEGREES: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoltageCalibration {
    /// `(low, high)` voltage of one encoder sweep.
    pub range: (f64, f64),
    /// False when the default range was substituted.
    pub calibrated: bool,
    pub peaks: usize,
    pub valleys: usize,
}

impl VoltageCalibration {
    pub fn supplied(range: (f64, f64)) -> Self {
        Self {
            range,
            calibrated: true,
            peaks: 0,
            valleys: 0,
        }
    }

    pub fn span(&self) -> f64 {
        self.range.1 - self.range.0
    }
}

/// Local maxima around strong transitions, filtered to the top of the trace.
pub fn find_transition_peaks(data: &[f64]) -> Vec<f64> {
    if data.len() <= 2 * PEAK_HALF_WINDOW + 1 {
        return Vec::new();
    }

    let upper = data.len() - PEAK_HALF_WINDOW;
    let peaks: Vec<f64> = data
        .windows(2)
        .enumerate()
        .filter(|(pos, w)| {
            *pos > PEAK_HALF_WINDOW && *pos < upper && (w[1] - w[0]).abs() > TRANSITION_JUMP
        })
        .map(|(pos, _)| {
            data[pos - PEAK_HALF_WINDOW..=pos + PEAK_HALF_WINDOW]
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max)
        })
        .collect();

    if peaks.is_empty() {
        return peaks;
    }

    let avg = mean(data);
    let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let thresh = avg + PEAK_FRACTION * (max - avg);
    peaks.into_iter().filter(|&p| p > thresh).collect()
}

/// Estimate the sweep range from the trace itself.
///
/// Falls back to [`DEFAULT_VOLTAGE_RANGE`] when no transitions are found or
/// the range is implausibly narrow; the fallback is logged and flagged.
pub fn calibrate_voltage_range(data: &[f64]) -> VoltageCalibration {
    let peaks = find_transition_peaks(data);
    let negated: Vec<f64> = data.iter().map(|v| -v).collect();
    let valleys: Vec<f64> = find_transition_peaks(&negated).into_iter().map(|v| -v).collect();

    let fallback = VoltageCalibration {
        range: DEFAULT_VOLTAGE_RANGE,
        calibrated: false,
        peaks: peaks.len(),
        valleys: valleys.len(),
    };

    if peaks.is_empty() || valleys.is_empty() {
        log::warn!(
            "Voltage calibration failed ({} peaks, {} valleys), using default {:?}",
            peaks.len(),
            valleys.len(),
            DEFAULT_VOLTAGE_RANGE
        );
        return fallback;
    }

    let range = (mean(&valleys), mean(&peaks));
    if range.1 - range.0 > MIN_RANGE_SPAN {
        log::info!("Calibrated voltage range is [{:.3}, {:.3}]", range.0, range.1);
        VoltageCalibration {
            range,
            calibrated: true,
            peaks: peaks.len(),
            valleys: valleys.len(),
        }
    } else {
        log::warn!(
            "Calibrated voltage range [{:.3}, {:.3}] too small, using default {:?}",
            range.0,
            range.1,
            DEFAULT_VOLTAGE_RANGE
        );
        fallback
    }
}

/// Linear wheel speed (cm/s) for one segment of raw samples.
///
/// `times` holds the within-segment sample times and must match `segment` in length.
pub fn segment_speed(segment: &[f64], times: &[f64], range: (f64, f64), diameter_cm: f64) -> f64 {
    let delta_voltage = range.1 - range.0;
    let wrap_thresh = WRAP_FRACTION * delta_voltage;

    // Undo sawtooth resets: every later sample shifts by one sweep.
    let mut unwrapped = segment.to_vec();
    for i in 0..segment.len().saturating_sub(1) {
        let jump = segment[i + 1] - segment[i];
        if jump.abs() <= wrap_thresh {
            continue;
        }
        let shift = if jump < 0.0 { delta_voltage } else { -delta_voltage };
        for v in &mut unwrapped[i + 1..] {
            *v += shift;
        }
    }

    let degrees: Vec<f64> = unwrapped.iter().map(|v| v / delta_voltage * 360.0).collect();
    let k = EDGE_SAMPLES.min(degrees.len());
    let mut displacement = mean(&degrees[degrees.len() - k..]) - mean(&degrees[..k]);
    if displacement > WRAP_DEGREES {
        displacement -= 360.0;
    } else if displacement < -WRAP_DEGREES {
        displacement += 360.0;
    }

    let duration = mean(&times[times.len() - k..]) - mean(&times[..k]);
    let angular_speed = displacement / duration;
    angular_speed / 360.0 * diameter_cm * std::f64::consts::PI
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sawtooth sweeping [low, high] with `period` samples per revolution.
    fn sawtooth(len: usize, period: usize, low: f64, high: f64) -> Vec<f64> {
        (0..len)
            .map(|i| low + (high - low) * (i % period) as f64 / period as f64)
            .collect()
    }

    #[test]
    fn calibrates_from_sawtooth() {
        let data = sawtooth(2000, 200, 0.5, 9.5);
        let cal = calibrate_voltage_range(&data);
        assert!(cal.calibrated);
        assert!(cal.peaks > 0 && cal.valleys > 0);
        assert!((cal.range.0 - 0.5).abs() < 0.1, "low={}", cal.range.0);
        assert!((cal.range.1 - 9.5).abs() < 0.1, "high={}", cal.range.1);
    }

    #[test]
    fn flat_trace_falls_back_to_default() {
        let cal = calibrate_voltage_range(&vec![1.0; 500]);
        assert!(!cal.calibrated);
        assert_eq!(cal.range, DEFAULT_VOLTAGE_RANGE);
    }

    #[test]
    fn narrow_range_falls_back_to_default() {
        // Transitions of 2.5 units exceed the jump threshold but span < 3.
        let data = sawtooth(2000, 100, 0.0, 2.6);
        let cal = calibrate_voltage_range(&data);
        assert!(!cal.calibrated);
        assert_eq!(cal.range, DEFAULT_VOLTAGE_RANGE);
    }

    #[test]
    fn constant_rotation_speed() {
        // 11 samples at 0.1 s spacing; voltage rises 0.1 per sample on a 0..10 range.
        let segment: Vec<f64> = (0..22).map(|i| i as f64 * 0.1).collect();
        let times: Vec<f64> = (1..=22).map(|i| i as f64 * 0.1).collect();
        let speed = segment_speed(&segment, &times, (0.0, 10.0), 20.0);
        // 3.6 degrees per 0.1 s = 36 deg/s.
        let expected = 36.0 / 360.0 * 20.0 * std::f64::consts::PI;
        assert!((speed - expected).abs() < 1e-9, "speed={speed}");
    }

    #[test]
    fn wrap_inside_segment_is_removed() {
        // Voltage climbs past the top of the range and resets to the bottom.
        let segment: Vec<f64> = (0..22).map(|i| (8.0 + i as f64 * 0.2) % 10.0).collect();
        let times: Vec<f64> = (1..=22).map(|i| i as f64 * 0.01).collect();
        let speed = segment_speed(&segment, &times, (0.0, 10.0), 10.0);
        // Unwrapped: 0.2 V per sample = 7.2 degrees per 0.01 s.
        let expected = 720.0 / 360.0 * 10.0 * std::f64::consts::PI;
        assert!((speed - expected).abs() < 1e-6, "speed={speed}");
    }

    #[test]
    fn displacement_beyond_half_turn_wraps() {
        // 20 degrees per sample: the 220 degree edge-mean displacement maps to -140.
        let segment: Vec<f64> = (0..22).map(|i| i as f64 * 20.0 / 36.0).collect();
        let times: Vec<f64> = (1..=22).map(|i| i as f64).collect();
        let speed = segment_speed(&segment, &times, (0.0, 10.0), 1.0);
        let raw_degrees = mean(&segment[11..].iter().map(|v| v * 36.0).collect::<Vec<_>>())
            - mean(&segment[..11].iter().map(|v| v * 36.0).collect::<Vec<_>>());
        let duration = mean(&times[11..]) - mean(&times[..11]);
        let expected = (raw_degrees - 360.0) / duration / 360.0 * std::f64::consts::PI;
        assert!((speed - expected).abs() < 1e-9, "speed={speed} expected={expected}");
    }
}
