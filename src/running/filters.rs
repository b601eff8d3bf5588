//! Smoothing filters for the running-speed trace.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Sub};
use thiserror::Error;

use crate::signal::SignalError;
use crate::signal::smooth::{odd_window, savgol_filter};
use crate::stats::{median, solve};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Smoothing failed: {0}")]
    Smoothing(#[from] SignalError),
    #[error("Trace of {len} samples is too short for {padding} samples of padding")]
    TraceTooShort { len: usize, padding: usize },
    #[error("Cutoff {cutoff} Hz must lie strictly between 0 and the Nyquist frequency {nyquist} Hz")]
    InvalidCutoff { cutoff: f64, nyquist: f64 },
    #[error("Filter order must be at least 1")]
    InvalidOrder,
    #[error("Window size must be at least 1")]
    InvalidWindow,
}

/// One step of the running-speed filter chain (`[[running.filters]]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunningFilter {
    MovingAverage {
        window_size: usize,
    },
    Median {
        window_size: usize,
    },
    SavitzkyGolay {
        window_size: usize,
        poly_order: usize,
    },
    Butterworth {
        sampling_rate: f64,
        cutoff_freq: f64,
        filter_order: usize,
    },
}

impl RunningFilter {
    pub fn apply(&self, data: &[f64]) -> Result<Vec<f64>, FilterError> {
        match *self {
            Self::MovingAverage { window_size } => moving_average(data, window_size),
            Self::Median { window_size } => median_filter(data, window_size),
            Self::SavitzkyGolay {
                window_size,
                poly_order,
            } => Ok(savgol_filter(data, window_size, poly_order)?),
            Self::Butterworth {
                sampling_rate,
                cutoff_freq,
                filter_order,
            } => {
                let (b, a) = butter_lowpass(filter_order, cutoff_freq, sampling_rate)?;
                filtfilt(&b, &a, data)
            }
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::MovingAverage { window_size } => format!("moving_average({window_size})"),
            Self::Median { window_size } => format!("median({window_size})"),
            Self::SavitzkyGolay {
                window_size,
                poly_order,
            } => format!("savitzky_golay({window_size}, {poly_order})"),
            Self::Butterworth {
                cutoff_freq,
                filter_order,
                ..
            } => format!("butterworth({cutoff_freq} Hz, order {filter_order})"),
        }
    }
}

/// Centered mean over an odd window; samples beyond the edges count as zero.
pub fn moving_average(data: &[f64], window: usize) -> Result<Vec<f64>, FilterError> {
    if window == 0 {
        return Err(FilterError::InvalidWindow);
    }
    let window = odd_window(window);
    let half = window / 2;
    let n = data.len();
    Ok((0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(n.saturating_sub(1));
            data[lo..=hi].iter().sum::<f64>() / window as f64
        })
        .collect())
}

/// Centered median over an odd window that shrinks at the edges.
pub fn median_filter(data: &[f64], window: usize) -> Result<Vec<f64>, FilterError> {
    if window == 0 {
        return Err(FilterError::InvalidWindow);
    }
    let half = odd_window(window) / 2;
    let n = data.len();
    Ok((0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(n.saturating_sub(1));
            median(&data[lo..=hi])
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Complex {
    re: f64,
    im: f64,
}

impl Complex {
    fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    fn real(re: f64) -> Self {
        Self { re, im: 0.0 }
    }
}

impl Add for Complex {
    type Output = Self;
    fn add(self, o: Self) -> Self {
        Self::new(self.re + o.re, self.im + o.im)
    }
}

impl Sub for Complex {
    type Output = Self;
    fn sub(self, o: Self) -> Self {
        Self::new(self.re - o.re, self.im - o.im)
    }
}

impl Mul for Complex {
    type Output = Self;
    fn mul(self, o: Self) -> Self {
        Self::new(self.re * o.re - self.im * o.im, self.re * o.im + self.im * o.re)
    }
}

impl Div for Complex {
    type Output = Self;
    fn div(self, o: Self) -> Self {
        let d = o.re * o.re + o.im * o.im;
        Self::new(
            (self.re * o.re + self.im * o.im) / d,
            (self.im * o.re - self.re * o.im) / d,
        )
    }
}

/// Monic polynomial coefficients (highest power first) with the given roots.
fn poly_from_roots(roots: &[Complex]) -> Vec<f64> {
    let mut coeffs = vec![Complex::real(1.0)];
    for &r in roots {
        let mut next = vec![Complex::real(0.0); coeffs.len() + 1];
        for (i, &c) in coeffs.iter().enumerate() {
            next[i] = next[i] + c;
            next[i + 1] = next[i + 1] - c * r;
        }
        coeffs = next;
    }
    coeffs.into_iter().map(|c| c.re).collect()
}

/// Digital Butterworth low-pass `(b, a)` designed by bilinear transform.
pub fn butter_lowpass(order: usize, cutoff: f64, sampling_rate: f64) -> Result<(Vec<f64>, Vec<f64>), FilterError> {
    if order == 0 {
        return Err(FilterError::InvalidOrder);
    }
    let nyquist = sampling_rate / 2.0;
    if !(cutoff > 0.0 && cutoff < nyquist) {
        return Err(FilterError::InvalidCutoff { cutoff, nyquist });
    }

    // Normalized design at fs = 2, so the bilinear constant is 2·fs = 4.
    let wn = cutoff / nyquist;
    let fs2 = 4.0;
    let warped = fs2 * (std::f64::consts::PI * wn / 2.0).tan();

    let n = order as f64;
    let analog_poles: Vec<Complex> = (0..order)
        .map(|k| {
            let theta = std::f64::consts::PI * (2.0 * k as f64 + n + 1.0) / (2.0 * n);
            Complex::new(warped * theta.cos(), warped * theta.sin())
        })
        .collect();
    let gain = warped.powi(order as i32);

    let fs2c = Complex::real(fs2);
    let digital_poles: Vec<Complex> = analog_poles.iter().map(|&p| (fs2c + p) / (fs2c - p)).collect();
    let denom = analog_poles
        .iter()
        .fold(Complex::real(1.0), |acc, &p| acc * (fs2c - p));
    let digital_gain = gain * (Complex::real(1.0) / denom).re;

    let zeros = vec![Complex::real(-1.0); order];
    let b: Vec<f64> = poly_from_roots(&zeros).into_iter().map(|c| c * digital_gain).collect();
    let a = poly_from_roots(&digital_poles);
    Ok((b, a))
}

/// Direct-form II transposed IIR filter with initial state `zi`.
fn lfilter(b: &[f64], a: &[f64], x: &[f64], zi: &[f64]) -> Vec<f64> {
    let m = b.len().max(a.len());
    let coef = |v: &[f64], i: usize| v.get(i).copied().unwrap_or(0.0) / a[0];
    let mut z = zi.to_vec();
    z.resize(m - 1, 0.0);

    x.iter()
        .map(|&xn| {
            let yn = coef(b, 0) * xn + z.first().copied().unwrap_or(0.0);
            for i in 0..m - 1 {
                let next = if i + 1 < m - 1 { z[i + 1] } else { 0.0 };
                z[i] = coef(b, i + 1) * xn + next - coef(a, i + 1) * yn;
            }
            yn
        })
        .collect()
}

/// Steady-state initial conditions for a unit step input.
fn lfilter_zi(b: &[f64], a: &[f64]) -> Option<Vec<f64>> {
    let m = b.len().max(a.len());
    if m < 2 {
        return Some(Vec::new());
    }
    let norm = |v: &[f64], i: usize| v.get(i).copied().unwrap_or(0.0) / a[0];
    let k = m - 1;

    let mut i_minus_a = vec![vec![0.0; k]; k];
    for (i, row) in i_minus_a.iter_mut().enumerate() {
        row[i] = 1.0;
        row[0] += norm(a, i + 1);
        if i + 1 < k {
            row[i + 1] -= 1.0;
        }
    }
    let rhs: Vec<f64> = (1..m).map(|i| norm(b, i) - norm(a, i) * norm(b, 0)).collect();
    solve(i_minus_a, rhs)
}

/// Zero-phase forward-backward filtering with odd-extension padding.
pub fn filtfilt(b: &[f64], a: &[f64], data: &[f64]) -> Result<Vec<f64>, FilterError> {
    let padding = 3 * b.len().max(a.len());
    let n = data.len();
    if n <= padding {
        return Err(FilterError::TraceTooShort { len: n, padding });
    }

    let first = data[0];
    let last = data[n - 1];
    let mut ext = Vec::with_capacity(n + 2 * padding);
    ext.extend((1..=padding).rev().map(|i| 2.0 * first - data[i]));
    ext.extend_from_slice(data);
    ext.extend((n - padding - 1..n - 1).rev().map(|i| 2.0 * last - data[i]));

    let zi = lfilter_zi(b, a).ok_or(FilterError::InvalidOrder)?;
    let scaled = |x0: f64| zi.iter().map(|z| z * x0).collect::<Vec<_>>();

    let forward = lfilter(b, a, &ext, &scaled(ext[0]));
    let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
    let start = reversed[0];
    reversed = lfilter(b, a, &reversed, &scaled(start));
    reversed.reverse();

    Ok(reversed[padding..padding + n].to_vec())
}
