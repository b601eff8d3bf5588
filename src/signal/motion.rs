use crate::stats::linear_fit;

/// Regression of a target trace onto its same-channel reference trace.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionFit {
    pub slope: f64,
    pub intercept: f64,
    /// Reference scaled into target units.
    pub fitted: Vec<f64>,
    /// `target − fitted`
    pub corrected: Vec<f64>,
}

pub fn regress_reference(target: &[f64], reference: &[f64]) -> MotionFit {
    let (slope, intercept) = linear_fit(reference, target);
    let fitted: Vec<f64> = reference.iter().map(|r| slope * r + intercept).collect();
    let corrected = target.iter().zip(&fitted).map(|(t, f)| t - f).collect();
    MotionFit {
        slope,
        intercept,
        fitted,
        corrected,
    }
}
