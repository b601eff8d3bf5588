//! Slow-trend (photobleaching) fits over the pre-drug baseline region.

use serde::{Deserialize, Serialize};

use crate::stats::{linear_fit, solve};

/// Model evaluation budget for the exponential fit.
pub const MAX_EXP_EVALUATIONS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BaselineModel {
    /// First-order least-squares line.
    #[default]
    Polynomial,
    /// `a·e^(−b·t) + c`
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum FitParams {
    Linear { slope: f64, intercept: f64 },
    Exponential { a: f64, b: f64, c: f64 },
}

impl FitParams {
    pub fn eval(&self, t: f64) -> f64 {
        match *self {
            Self::Linear { slope, intercept } => slope * t + intercept,
            Self::Exponential { a, b, c } => a * (-b * t).exp() + c,
        }
    }
}

/// Outcome of fitting a baseline model.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineFit {
    pub params: FitParams,
    /// The fitted curve over the whole trace.
    pub curve: Vec<f64>,
    /// Set when the requested model could not be used.
    pub fallback: Option<String>,
}

fn fit_linear(time: &[f64], signal: &[f64]) -> FitParams {
    let (slope, intercept) = linear_fit(time, signal);
    FitParams::Linear { slope, intercept }
}

/// Fit `model` on `(time[i], signal[i])` for the indices in `region`, then
/// evaluate it over every sample.
pub fn fit_baseline(time: &[f64], signal: &[f64], region: &[usize], model: BaselineModel) -> BaselineFit {
    let t: Vec<f64> = region.iter().map(|&i| time[i]).collect();
    let y: Vec<f64> = region.iter().map(|&i| signal[i]).collect();

    let (params, fallback) = match model {
        BaselineModel::Polynomial => (fit_linear(&t, &y), None),
        BaselineModel::Exponential => match fit_exponential(&t, &y, seed(signal)) {
            Ok(p) => (p, None),
            Err(reason) => (
                fit_linear(&t, &y),
                Some(format!("exponential baseline fit failed ({reason}), using linear")),
            ),
        },
    };

    BaselineFit {
        params,
        curve: time.iter().map(|&ti| params.eval(ti)).collect(),
        fallback,
    }
}

/// `(max − min, 0.01, min)` of the whole signal.
fn seed(signal: &[f64]) -> [f64; 3] {
    let min = signal.iter().copied().fold(f64::INFINITY, f64::min);
    let max = signal.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    [max - min, 0.01, min]
}

fn sum_squares(t: &[f64], y: &[f64], p: &[f64; 3]) -> f64 {
    t.iter()
        .zip(y)
        .map(|(&ti, &yi)| {
            let r = yi - (p[0] * (-p[1] * ti).exp() + p[2]);
            r * r
        })
        .sum()
}

/// Levenberg–Marquardt fit of `a·e^(−b·t) + c`.
pub fn fit_exponential(t: &[f64], y: &[f64], p0: [f64; 3]) -> Result<FitParams, String> {
    if t.len() < 3 {
        return Err(format!("{} points for 3 parameters", t.len()));
    }
    if !p0.iter().all(|v| v.is_finite()) {
        return Err("non-finite initial guess".to_string());
    }

    let mut p = p0;
    let mut cost = sum_squares(t, y, &p);
    let mut evaluations = 1;
    let mut lambda = 1e-3;
    let mut converged = false;

    'outer: while evaluations < MAX_EXP_EVALUATIONS {
        let mut jtj = [[0.0; 3]; 3];
        let mut jtr = [0.0; 3];
        for (&ti, &yi) in t.iter().zip(y) {
            let e = (-p[1] * ti).exp();
            let jac = [e, -p[0] * ti * e, 1.0];
            let r = yi - (p[0] * e + p[2]);
            for i in 0..3 {
                jtr[i] += jac[i] * r;
                for j in 0..3 {
                    jtj[i][j] += jac[i] * jac[j];
                }
            }
        }

        loop {
            let damped: Vec<Vec<f64>> = (0..3)
                .map(|i| {
                    (0..3)
                        .map(|j| {
                            if i == j {
                                jtj[i][j] + lambda * jtj[i][i].max(1e-12)
                            } else {
                                jtj[i][j]
                            }
                        })
                        .collect()
                })
                .collect();
            let Some(delta) = solve(damped, jtr.to_vec()) else {
                lambda *= 10.0;
                if lambda > 1e16 {
                    break 'outer;
                }
                continue;
            };

            let candidate = [p[0] + delta[0], p[1] + delta[1], p[2] + delta[2]];
            let new_cost = sum_squares(t, y, &candidate);
            evaluations += 1;

            if new_cost.is_finite() && new_cost < cost {
                let step: f64 = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
                let size: f64 = p.iter().map(|v| v * v).sum::<f64>().sqrt();
                let improvement = cost - new_cost;
                p = candidate;
                cost = new_cost;
                lambda = (lambda / 10.0).max(1e-12);
                if step <= 1e-10 * (size + 1e-10) || improvement <= 1e-14 * cost {
                    converged = true;
                    break 'outer;
                }
                break;
            }

            lambda *= 10.0;
            if lambda > 1e16 {
                // No step reduces the cost: at a minimum.
                converged = true;
                break 'outer;
            }
            if evaluations >= MAX_EXP_EVALUATIONS {
                break 'outer;
            }
        }
    }

    if !converged {
        return Err(format!("no convergence after {evaluations} evaluations"));
    }
    if !p.iter().all(|v| v.is_finite()) {
        return Err("non-finite parameters".to_string());
    }
    log::debug!(
        "Exponential baseline a={:.4} b={:.6} c={:.4} after {} evaluations",
        p[0],
        p[1],
        p[2],
        evaluations
    );
    Ok(FitParams::Exponential {
        a: p[0],
        b: p[1],
        c: p[2],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(n: usize) -> Vec<usize> {
        (0..n).collect()
    }

    #[test]
    fn linear_fit_extends_over_whole_trace() {
        let time: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let signal: Vec<f64> = time.iter().map(|t| 10.0 - 0.05 * t).collect();
        // Fit only the first half; the line still covers every sample.
        let fit = fit_baseline(&time, &signal, &all(50), BaselineModel::Polynomial);
        assert!(fit.fallback.is_none());
        for (a, b) in fit.curve.iter().zip(&signal) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn exponential_recovers_decay() {
        let time: Vec<f64> = (0..600).map(|i| i as f64 * 0.5).collect();
        let signal: Vec<f64> = time.iter().map(|t| 5.0 * (-0.02 * t).exp() + 100.0).collect();
        let fit = fit_baseline(&time, &signal, &all(600), BaselineModel::Exponential);
        assert!(fit.fallback.is_none(), "{:?}", fit.fallback);
        match fit.params {
            FitParams::Exponential { a, b, c } => {
                assert!((a - 5.0).abs() < 1e-3, "a={a}");
                assert!((b - 0.02).abs() < 1e-5, "b={b}");
                assert!((c - 100.0).abs() < 1e-3, "c={c}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn too_few_points_falls_back_to_linear() {
        let time = vec![0.0, 1.0, 2.0, 3.0];
        let signal = vec![4.0, 3.0, 2.0, 1.0];
        let fit = fit_baseline(&time, &signal, &[0, 1], BaselineModel::Exponential);
        assert!(fit.fallback.is_some());
        assert!(matches!(fit.params, FitParams::Linear { .. }));
        assert!((fit.curve[3] - 1.0).abs() < 1e-12);
    }
}
