//! Savitzky–Golay smoothing.

use super::SignalError;
use crate::stats::{polyfit, polyval, solve};

/// Round an even window up to the next odd size.
pub fn odd_window(window: usize) -> usize {
    if window % 2 == 0 { window + 1 } else { window }
}

/// Convolution weights that evaluate a least-squares polynomial of
/// `order` at the centre of a `window`-sample neighbourhood.
fn savgol_coefficients(window: usize, order: usize) -> Option<Vec<f64>> {
    let half = (window / 2) as i64;
    let terms = order + 1;

    // Normal matrix AᵀA with A[j][k] = j^k over j in [-half, half].
    let mut ata = vec![vec![0.0; terms]; terms];
    for j in -half..=half {
        let x = j as f64;
        for r in 0..terms {
            for c in 0..terms {
                ata[r][c] += x.powi((r + c) as i32);
            }
        }
    }
    let mut e0 = vec![0.0; terms];
    e0[0] = 1.0;
    let w = solve(ata, e0)?;

    Some(
        (-half..=half)
            .map(|j| {
                let x = j as f64;
                (0..terms).map(|k| w[k] * x.powi(k as i32)).sum()
            })
            .collect(),
    )
}

/// Smooth `data` with a Savitzky–Golay filter.
///
/// The first and last half-window are taken from a polynomial fitted to the
/// first and last full window respectively.
pub fn savgol_filter(data: &[f64], window: usize, order: usize) -> Result<Vec<f64>, SignalError> {
    let window = odd_window(window);
    if order >= window {
        return Err(SignalError::InvalidSmoothing(format!(
            "polynomial order {order} must be less than window {window}"
        )));
    }
    if window > data.len() {
        return Err(SignalError::InvalidSmoothing(format!(
            "window {window} exceeds trace length {}",
            data.len()
        )));
    }

    let coeffs = savgol_coefficients(window, order)
        .ok_or_else(|| SignalError::InvalidSmoothing("singular smoothing design".to_string()))?;
    let half = window / 2;
    let n = data.len();

    let mut out = vec![0.0; n];
    for i in half..n - half {
        out[i] = data[i - half..=i + half]
            .iter()
            .zip(&coeffs)
            .map(|(v, c)| v * c)
            .sum();
    }

    let xs: Vec<f64> = (0..window).map(|i| i as f64).collect();
    let head = polyfit(&xs, &data[..window], order)
        .ok_or_else(|| SignalError::InvalidSmoothing("edge fit failed".to_string()))?;
    let tail = polyfit(&xs, &data[n - window..], order)
        .ok_or_else(|| SignalError::InvalidSmoothing("edge fit failed".to_string()))?;
    for i in 0..half {
        out[i] = polyval(&head, i as f64);
        let offset = window - half + i;
        out[n - half + i] = polyval(&tail, offset as f64);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_polynomials_up_to_order() {
        let data: Vec<f64> = (0..50).map(|i| 2.0 + 0.3 * i as f64 - 0.01 * (i * i) as f64).collect();
        let smoothed = savgol_filter(&data, 11, 2).unwrap();
        for (i, (a, b)) in data.iter().zip(&smoothed).enumerate() {
            assert!((a - b).abs() < 1e-8, "i={i} raw={a} smoothed={b}");
        }
    }

    #[test]
    fn reduces_alternating_noise() {
        let data: Vec<f64> = (0..200).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let smoothed = savgol_filter(&data, 11, 3).unwrap();
        let interior_peak = smoothed[20..180].iter().map(|v| v.abs()).fold(0.0, f64::max);
        assert!(interior_peak < 0.5, "peak={interior_peak}");
    }

    #[test]
    fn known_five_point_weights() {
        // Classic quadratic 5-point weights: (-3, 12, 17, 12, -3) / 35.
        let c = savgol_coefficients(5, 2).unwrap();
        let expected = [-3.0, 12.0, 17.0, 12.0, -3.0].map(|v| v / 35.0);
        for (a, b) in c.iter().zip(expected) {
            assert!((a - b).abs() < 1e-12, "{a} vs {b}");
        }
    }

    #[test]
    fn even_window_rounds_up() {
        assert_eq!(odd_window(10), 11);
        assert_eq!(odd_window(11), 11);
        let data: Vec<f64> = (0..11).map(|i| i as f64).collect();
        assert_eq!(savgol_filter(&data, 10, 1).unwrap().len(), 11);
    }

    #[test]
    fn rejects_bad_parameters() {
        let data = vec![1.0; 20];
        assert!(savgol_filter(&data, 5, 5).is_err());
        assert!(savgol_filter(&data, 31, 3).is_err());
    }
}
