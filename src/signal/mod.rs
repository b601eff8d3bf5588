//! Photometry correction chain: smoothing → baseline → motion → ΔF/F → z-score.
//!
//! A [`SignalStore`] holds one subject's raw traces and caches every derived
//! stage under `(channel, wavelength, stage, parameter hash)`. The hash
//! covers every option upstream of the stage, so changing a parameter can
//! never return a trace computed under the old one.

pub mod baseline;
pub mod motion;
pub mod normalize;
pub mod smooth;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use thiserror::Error;

use crate::align::AlignmentResult;
use crate::diagnostic::Diagnostic;
use crate::ingest::ChannelKey;
use baseline::BaselineModel;
use normalize::DffFormula;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("No trace for {0}")]
    MissingTrace(ChannelKey),
    #[error("Motion correction needs a wavelength reference, not 'baseline'")]
    MotionNeedsWavelengthReference,
    #[error("{0} is the reference wavelength and cannot be motion-corrected against itself")]
    ReferenceIsTarget(ChannelKey),
    #[error("{key}: {stage} must be computed first")]
    MissingStage { key: ChannelKey, stage: Stage },
    #[error("No samples in the baseline window")]
    NoBaselineSamples,
    #[error("Baseline window has {0} sample(s), at least 2 needed")]
    InsufficientBaseline(usize),
    #[error("Invalid smoothing parameters: {0}")]
    InvalidSmoothing(String),
    #[error("Invalid signal label '{0}'")]
    InvalidLabel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Raw,
    Smoothed,
    BaselineCorrected,
    MotionCorrected,
    Dff,
    Zscore,
    /// Baseline curve subtracted by `BaselineCorrected`.
    BaselineFit,
    /// Reference regressed into target units by `MotionCorrected`.
    FittedReference,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Smoothed => "smoothed",
            Self::BaselineCorrected => "baseline_corrected",
            Self::MotionCorrected => "motion_corrected",
            Self::Dff => "dff",
            Self::Zscore => "zscore",
            Self::BaselineFit => "baseline_fit",
            Self::FittedReference => "fitted_reference",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference for ΔF/F and motion correction: a wavelength, or the baseline itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Reference {
    Wavelength(String),
    Baseline,
}

impl TryFrom<String> for Reference {
    type Error = SignalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let label = value.trim();
        if label.eq_ignore_ascii_case("baseline") {
            Ok(Self::Baseline)
        } else if label.is_empty() || label.contains('+') {
            Err(SignalError::InvalidLabel(value))
        } else {
            Ok(Self::Wavelength(label.to_string()))
        }
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        match reference {
            Reference::Wavelength(label) => label,
            Reference::Baseline => "baseline".to_string(),
        }
    }
}

/// One or more target wavelengths, written `470` or `470+560`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetSignal(Vec<String>);

impl TargetSignal {
    pub fn wavelengths(&self) -> &[String] {
        &self.0
    }
}

impl TryFrom<String> for TargetSignal {
    type Error = SignalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let labels: Vec<String> = value.split('+').map(|s| s.trim().to_string()).collect();
        if labels.iter().any(|l| l.is_empty()) {
            return Err(SignalError::InvalidLabel(value));
        }
        Ok(Self(labels))
    }
}

impl From<TargetSignal> for String {
    fn from(target: TargetSignal) -> Self {
        target.0.join("+")
    }
}

/// Photometry preprocessing options (`[signal]` in the config file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalOptions {
    pub target_signal: TargetSignal,
    pub reference_signal: Reference,
    /// Seconds after running start used for ΔF/F and z-score baselines.
    pub baseline_period: (f64, f64),
    pub apply_smooth: bool,
    pub window_size: usize,
    pub poly_order: usize,
    pub apply_baseline: bool,
    pub baseline_model: BaselineModel,
    pub apply_motion: bool,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            target_signal: TargetSignal(vec!["470".to_string()]),
            reference_signal: Reference::Wavelength("410".to_string()),
            baseline_period: (0.0, 60.0),
            apply_smooth: false,
            window_size: 11,
            poly_order: 5,
            apply_baseline: false,
            baseline_model: BaselineModel::Polynomial,
            apply_motion: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageKey {
    pub channel: ChannelKey,
    pub stage: Stage,
    pub params: u64,
}

/// Result of running the chain for one channel/wavelength.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelOutcome {
    pub signal: String,
    pub formula: Option<DffFormula>,
    pub stages: Vec<Stage>,
    pub error: Option<String>,
}

/// One subject's fluorescence traces and every stage derived from them.
#[derive(Debug, Clone, Default)]
pub struct SignalStore {
    time: Vec<f64>,
    raw: BTreeMap<ChannelKey, Vec<f64>>,
    /// Rebased time of the first drug onset; bounds the baseline-fit region.
    drug_onset: Option<f64>,
    cache: HashMap<StageKey, Vec<f64>>,
    formulas: HashMap<StageKey, DffFormula>,
    diagnostics: Vec<Diagnostic>,
}

impl SignalStore {
    pub fn new(time: Vec<f64>, raw: BTreeMap<ChannelKey, Vec<f64>>, drug_onset: Option<f64>) -> Self {
        Self {
            time,
            raw,
            drug_onset,
            ..Self::default()
        }
    }

    pub fn from_alignment(alignment: &AlignmentResult) -> Self {
        Self::new(
            alignment.fluorescence.time.clone(),
            alignment.fluorescence.signals.clone(),
            alignment.first_drug_onset(),
        )
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn keys(&self) -> impl Iterator<Item = &ChannelKey> {
        self.raw.keys()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Drop every cached stage.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.formulas.clear();
    }

    /// Drop cached stages for one fiber channel.
    pub fn invalidate(&mut self, channel: u32) {
        self.cache.retain(|k, _| k.channel.channel != channel);
        self.formulas.retain(|k, _| k.channel.channel != channel);
    }

    pub fn raw(&self, key: &ChannelKey) -> Result<&[f64], SignalError> {
        self.raw
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| SignalError::MissingTrace(key.clone()))
    }

    /// A previously computed stage under the current options.
    pub fn get(&self, key: &ChannelKey, stage: Stage, opts: &SignalOptions) -> Option<&[f64]> {
        if stage == Stage::Raw {
            return self.raw.get(key).map(Vec::as_slice);
        }
        self.cache
            .get(&self.stage_key(key, stage, opts))
            .map(Vec::as_slice)
    }

    /// ΔF/F formula used for `key` under the current options.
    pub fn dff_formula(&self, key: &ChannelKey, opts: &SignalOptions) -> Option<DffFormula> {
        self.formulas
            .get(&self.stage_key(key, Stage::Dff, opts))
            .copied()
    }

    pub fn available_stages(&self, key: &ChannelKey, opts: &SignalOptions) -> Vec<Stage> {
        [
            Stage::Raw,
            Stage::Smoothed,
            Stage::BaselineCorrected,
            Stage::MotionCorrected,
            Stage::Dff,
            Stage::Zscore,
            Stage::BaselineFit,
            Stage::FittedReference,
        ]
        .into_iter()
        .filter(|&s| self.get(key, s, opts).is_some())
        .collect()
    }

    pub fn stage_key(&self, key: &ChannelKey, stage: Stage, opts: &SignalOptions) -> StageKey {
        let mut hasher = DefaultHasher::new();
        stage.hash(&mut hasher);
        self.hash_upstream(stage, opts, &mut hasher);
        StageKey {
            channel: key.clone(),
            stage,
            params: hasher.finish(),
        }
    }

    fn hash_upstream(&self, stage: Stage, opts: &SignalOptions, h: &mut DefaultHasher) {
        match stage {
            Stage::Raw => {}
            Stage::Smoothed => {
                opts.window_size.hash(h);
                opts.poly_order.hash(h);
            }
            Stage::BaselineFit | Stage::BaselineCorrected => {
                opts.apply_smooth.hash(h);
                if opts.apply_smooth {
                    self.hash_upstream(Stage::Smoothed, opts, h);
                }
                opts.baseline_model.hash(h);
                self.drug_onset.map(f64::to_bits).hash(h);
            }
            Stage::FittedReference | Stage::MotionCorrected => {
                opts.reference_signal.hash(h);
                opts.apply_baseline.hash(h);
                if opts.apply_baseline {
                    self.hash_upstream(Stage::BaselineCorrected, opts, h);
                } else {
                    opts.apply_smooth.hash(h);
                    if opts.apply_smooth {
                        self.hash_upstream(Stage::Smoothed, opts, h);
                    }
                }
            }
            Stage::Dff | Stage::Zscore => {
                opts.apply_motion.hash(h);
                self.hash_upstream(Stage::MotionCorrected, opts, h);
                self.hash_upstream(Stage::BaselineCorrected, opts, h);
                opts.baseline_period.0.to_bits().hash(h);
                opts.baseline_period.1.to_bits().hash(h);
            }
        }
    }

    fn cached(&self, key: &StageKey) -> Option<Vec<f64>> {
        self.cache.get(key).cloned()
    }

    fn store(&mut self, key: StageKey, trace: Vec<f64>) -> Vec<f64> {
        self.cache.insert(key, trace.clone());
        trace
    }

    pub fn smoothed(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<Vec<f64>, SignalError> {
        let sk = self.stage_key(key, Stage::Smoothed, opts);
        if let Some(trace) = self.cached(&sk) {
            return Ok(trace);
        }
        let out = smooth::savgol_filter(self.raw(key)?, opts.window_size, opts.poly_order)?;
        Ok(self.store(sk, out))
    }

    /// Raw, or smoothed when smoothing is enabled.
    fn raw_target(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<Vec<f64>, SignalError> {
        if opts.apply_smooth {
            self.smoothed(key, opts)
        } else {
            Ok(self.raw(key)?.to_vec())
        }
    }

    pub fn baseline_fit(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<Vec<f64>, SignalError> {
        self.ensure_baseline(key, opts)?;
        self.cached(&self.stage_key(key, Stage::BaselineFit, opts))
            .ok_or(SignalError::MissingStage {
                key: key.clone(),
                stage: Stage::BaselineFit,
            })
    }

    pub fn baseline_corrected(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<Vec<f64>, SignalError> {
        self.ensure_baseline(key, opts)?;
        self.cached(&self.stage_key(key, Stage::BaselineCorrected, opts))
            .ok_or(SignalError::MissingStage {
                key: key.clone(),
                stage: Stage::BaselineCorrected,
            })
    }

    fn ensure_baseline(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<(), SignalError> {
        let fit_key = self.stage_key(key, Stage::BaselineFit, opts);
        let corrected_key = self.stage_key(key, Stage::BaselineCorrected, opts);
        if self.cache.contains_key(&fit_key) && self.cache.contains_key(&corrected_key) {
            return Ok(());
        }

        let input = self.raw_target(key, opts)?;
        let mut region: Vec<usize> = match self.drug_onset {
            Some(onset) => (0..self.time.len()).filter(|&i| self.time[i] < onset).collect(),
            None => (0..self.time.len()).collect(),
        };
        if region.len() < 2 {
            self.diagnostics.push(Diagnostic::warn(
                key.to_string(),
                format!(
                    "pre-drug baseline region has {} sample(s), fitting the whole trace",
                    region.len()
                ),
            ));
            region = (0..self.time.len()).collect();
        }

        let fit = baseline::fit_baseline(&self.time, &input, &region, opts.baseline_model);
        if let Some(reason) = fit.fallback {
            self.diagnostics.push(Diagnostic::warn(key.to_string(), reason));
        }
        let corrected: Vec<f64> = input.iter().zip(&fit.curve).map(|(x, b)| x - b).collect();
        self.store(fit_key, fit.curve);
        self.store(corrected_key, corrected);
        Ok(())
    }

    /// Input to motion correction: the most processed enabled stage.
    fn motion_input(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<Vec<f64>, SignalError> {
        if opts.apply_baseline {
            self.baseline_corrected(key, opts)
        } else {
            self.raw_target(key, opts)
        }
    }

    pub fn motion_corrected(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<Vec<f64>, SignalError> {
        self.ensure_motion(key, opts)?;
        self.cached(&self.stage_key(key, Stage::MotionCorrected, opts))
            .ok_or(SignalError::MissingStage {
                key: key.clone(),
                stage: Stage::MotionCorrected,
            })
    }

    pub fn fitted_reference(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<Vec<f64>, SignalError> {
        self.ensure_motion(key, opts)?;
        self.cached(&self.stage_key(key, Stage::FittedReference, opts))
            .ok_or(SignalError::MissingStage {
                key: key.clone(),
                stage: Stage::FittedReference,
            })
    }

    fn ensure_motion(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<(), SignalError> {
        let Reference::Wavelength(reference) = &opts.reference_signal else {
            return Err(SignalError::MotionNeedsWavelengthReference);
        };
        if *reference == key.wavelength {
            return Err(SignalError::ReferenceIsTarget(key.clone()));
        }
        let fitted_key = self.stage_key(key, Stage::FittedReference, opts);
        let corrected_key = self.stage_key(key, Stage::MotionCorrected, opts);
        if self.cache.contains_key(&fitted_key) && self.cache.contains_key(&corrected_key) {
            return Ok(());
        }

        let ref_key = ChannelKey::new(key.channel, reference.as_str());
        let reference_trace = self.motion_input(&ref_key, opts)?;
        let target = self.motion_input(key, opts)?;
        let fit = motion::regress_reference(&target, &reference_trace);
        log::debug!(
            "{key}: regressed onto {ref_key}, slope {:.4}, intercept {:.4}",
            fit.slope,
            fit.intercept
        );
        self.store(fitted_key, fit.fitted);
        self.store(corrected_key, fit.corrected);
        Ok(())
    }

    /// The wavelength reference on `key`'s channel, when one is configured and recorded.
    fn reference_key(&self, key: &ChannelKey, opts: &SignalOptions) -> Option<ChannelKey> {
        match &opts.reference_signal {
            Reference::Wavelength(label) => {
                Some(ChannelKey::new(key.channel, label.as_str())).filter(|r| self.raw.contains_key(r))
            }
            Reference::Baseline => None,
        }
    }

    /// ΔF/F with the formula chosen by `(reference, apply_baseline)`.
    ///
    /// When the stage a formula needs is not enabled, or the channel has no
    /// trace at the reference wavelength, a baseline-only formula is used
    /// instead and a diagnostic recorded.
    pub fn dff(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<Vec<f64>, SignalError> {
        let sk = self.stage_key(key, Stage::Dff, opts);
        if let Some(trace) = self.cached(&sk) {
            return Ok(trace);
        }

        let window = normalize::window_indices(&self.time, opts.baseline_period);
        if window.is_empty() {
            return Err(SignalError::NoBaselineSamples);
        }
        let raw_target = self.raw_target(key, opts)?;
        let motion_ready = opts.apply_motion && self.reference_key(key, opts).is_some();

        let (formula, dff) = match (&opts.reference_signal, opts.apply_baseline) {
            (Reference::Wavelength(_), true) if motion_ready => {
                let corrected = self.motion_corrected(key, opts)?;
                (
                    DffFormula::MotionCorrected,
                    normalize::dff_motion_corrected(&corrected, &raw_target),
                )
            }
            (Reference::Wavelength(_), false) if motion_ready => {
                let fitted = self.fitted_reference(key, opts)?;
                (
                    DffFormula::FittedReference,
                    normalize::dff_fitted_reference(&raw_target, &fitted),
                )
            }
            (Reference::Wavelength(label), _) if opts.apply_motion => {
                self.diagnostics.push(Diagnostic::warn(
                    key.to_string(),
                    format!(
                        "motion correction skipped: no {} trace on channel {}, using baseline-only ΔF/F",
                        label.as_str(),
                        key.channel
                    ),
                ));
                self.baseline_dff(key, opts, &raw_target, &window)?
            }
            (Reference::Wavelength(_), _) => {
                self.diagnostics.push(Diagnostic::warn(
                    key.to_string(),
                    "motion correction not applied, using baseline-median ΔF/F",
                ));
                (
                    DffFormula::BaselineMedian,
                    normalize::dff_baseline_median(&raw_target, &window),
                )
            }
            (Reference::Baseline, _) => self.baseline_dff(key, opts, &raw_target, &window)?,
        };

        self.formulas.insert(sk.clone(), formula);
        Ok(self.store(sk, dff))
    }

    /// Baseline-fit ΔF/F when baseline correction is on, baseline-median otherwise.
    fn baseline_dff(
        &mut self,
        key: &ChannelKey,
        opts: &SignalOptions,
        raw_target: &[f64],
        window: &[usize],
    ) -> Result<(DffFormula, Vec<f64>), SignalError> {
        if opts.apply_baseline {
            let fit = self.baseline_fit(key, opts)?;
            Ok((
                DffFormula::BaselineFit,
                normalize::dff_baseline_fit(raw_target, &fit, window),
            ))
        } else {
            Ok((
                DffFormula::BaselineMedian,
                normalize::dff_baseline_median(raw_target, window),
            ))
        }
    }

    /// Z-score of a ΔF/F trace already computed under the same options.
    pub fn zscore(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<Vec<f64>, SignalError> {
        let sk = self.stage_key(key, Stage::Zscore, opts);
        if let Some(trace) = self.cached(&sk) {
            return Ok(trace);
        }
        let dff = self
            .get(key, Stage::Dff, opts)
            .ok_or(SignalError::MissingStage {
                key: key.clone(),
                stage: Stage::Dff,
            })?
            .to_vec();
        let window = normalize::window_indices(&self.time, opts.baseline_period);
        let z = normalize::zscore(&dff, &window)?;
        Ok(self.store(sk, z))
    }

    fn run_chain(&mut self, key: &ChannelKey, opts: &SignalOptions) -> Result<DffFormula, SignalError> {
        let reference = self.reference_key(key, opts);

        if opts.apply_smooth {
            self.smoothed(key, opts)?;
            if let Some(r) = &reference {
                self.smoothed(r, opts)?;
            }
        }
        if opts.apply_baseline {
            self.baseline_corrected(key, opts)?;
            if let Some(r) = &reference {
                self.baseline_corrected(r, opts)?;
            }
        }
        if opts.apply_motion {
            match (&opts.reference_signal, &reference) {
                (Reference::Baseline, _) => self.diagnostics.push(Diagnostic::warn(
                    key.to_string(),
                    "motion correction skipped: reference is 'baseline'",
                )),
                (Reference::Wavelength(_), Some(_)) => {
                    self.motion_corrected(key, opts)?;
                }
                // No reference trace on this channel; dff records the fallback.
                (Reference::Wavelength(_), None) => {}
            }
        }

        self.dff(key, opts)?;
        self.zscore(key, opts)?;
        self.dff_formula(key, opts).ok_or(SignalError::MissingStage {
            key: key.clone(),
            stage: Stage::Dff,
        })
    }

    /// Run the enabled chain for every channel × target wavelength.
    ///
    /// A failing signal is recorded and skipped; the others still run.
    pub fn preprocess(&mut self, opts: &SignalOptions) -> Vec<ChannelOutcome> {
        let mut channels: Vec<u32> = self.raw.keys().map(|k| k.channel).collect();
        channels.dedup();

        let mut outcomes = Vec::new();
        for channel in channels {
            for wavelength in opts.target_signal.wavelengths() {
                let key = ChannelKey::new(channel, wavelength.as_str());
                let result = self.run_chain(&key, opts);
                if let Err(e) = &result {
                    log::warn!("{key}: skipped ({e})");
                }
                outcomes.push(ChannelOutcome {
                    signal: key.to_string(),
                    formula: result.as_ref().ok().copied(),
                    stages: self.available_stages(&key, opts),
                    error: result.err().map(|e| e.to_string()),
                });
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: usize = 400;

    /// 10 Hz, 40 s. Target = 2·reference + 50 + a transient at 30 s; slow drift on both.
    fn store(drug_onset: Option<f64>) -> SignalStore {
        let time: Vec<f64> = (0..N).map(|i| i as f64 * 0.1).collect();
        let reference: Vec<f64> = time
            .iter()
            .map(|t| 100.0 + (t * 1.7).sin() - 0.05 * t)
            .collect();
        let target: Vec<f64> = time
            .iter()
            .zip(&reference)
            .map(|(t, r)| 2.0 * r + 50.0 + if (30.0..32.0).contains(t) { 5.0 } else { 0.0 })
            .collect();
        let raw = [
            (ChannelKey::new(1, "410"), reference),
            (ChannelKey::new(1, "470"), target),
        ]
        .into_iter()
        .collect();
        SignalStore::new(time, raw, drug_onset)
    }

    fn opts(reference: Reference, apply_baseline: bool, apply_motion: bool) -> SignalOptions {
        SignalOptions {
            reference_signal: reference,
            baseline_period: (0.0, 10.0),
            apply_baseline,
            apply_motion,
            ..SignalOptions::default()
        }
    }

    fn key() -> ChannelKey {
        ChannelKey::new(1, "470")
    }

    #[test]
    fn parses_reference_and_targets() {
        assert_eq!(Reference::try_from("baseline".to_string()).unwrap(), Reference::Baseline);
        assert_eq!(
            Reference::try_from(" 410 ".to_string()).unwrap(),
            Reference::Wavelength("410".into())
        );
        assert!(Reference::try_from("".to_string()).is_err());
        let target = TargetSignal::try_from("470+560".to_string()).unwrap();
        assert_eq!(target.wavelengths(), &["470".to_string(), "560".to_string()]);
        assert!(TargetSignal::try_from("470+".to_string()).is_err());
    }

    #[test]
    fn dff_baseline_reference_without_correction() {
        let mut s = store(None);
        let o = opts(Reference::Baseline, false, false);
        let dff = s.dff(&key(), &o).unwrap();
        let raw = s.raw(&key()).unwrap().to_vec();
        let window = normalize::window_indices(s.time(), (0.0, 10.0));
        let m = crate::stats::median(&window.iter().map(|&i| raw[i]).collect::<Vec<_>>());
        for (d, x) in dff.iter().zip(&raw) {
            assert_eq!(*d, (x - m) / m);
        }
        assert_eq!(s.dff_formula(&key(), &o), Some(DffFormula::BaselineMedian));
    }

    #[test]
    fn dff_baseline_reference_with_correction() {
        let mut s = store(None);
        let o = opts(Reference::Baseline, true, false);
        let dff = s.dff(&key(), &o).unwrap();
        let fit = s.get(&key(), Stage::BaselineFit, &o).unwrap().to_vec();
        let raw = s.raw(&key()).unwrap().to_vec();
        let window = normalize::window_indices(s.time(), (0.0, 10.0));
        let m = crate::stats::median(&window.iter().map(|&i| raw[i]).collect::<Vec<_>>());
        for i in 0..N {
            assert_eq!(dff[i], (raw[i] - fit[i]) / m);
        }
        assert_eq!(s.dff_formula(&key(), &o), Some(DffFormula::BaselineFit));
    }

    #[test]
    fn dff_wavelength_reference_with_correction() {
        let mut s = store(None);
        let o = opts(Reference::Wavelength("410".into()), true, true);
        let dff = s.dff(&key(), &o).unwrap();
        let corrected = s.get(&key(), Stage::MotionCorrected, &o).unwrap().to_vec();
        let m = crate::stats::median(s.raw(&key()).unwrap());
        for i in 0..N {
            assert_eq!(dff[i], corrected[i] / m);
        }
        // The reference artifact is gone; the transient remains.
        let peak = dff.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let quiet = dff[..250].iter().map(|v| v.abs()).fold(0.0, f64::max);
        assert!(peak > 5.0 * quiet, "peak={peak} quiet={quiet}");
    }

    #[test]
    fn dff_wavelength_reference_without_correction() {
        let mut s = store(None);
        let o = opts(Reference::Wavelength("410".into()), false, true);
        let dff = s.dff(&key(), &o).unwrap();
        let fitted = s.get(&key(), Stage::FittedReference, &o).unwrap().to_vec();
        let raw = s.raw(&key()).unwrap().to_vec();
        for i in 0..N {
            assert_eq!(dff[i], (raw[i] - fitted[i]) / fitted[i]);
        }
        assert_eq!(s.dff_formula(&key(), &o), Some(DffFormula::FittedReference));
    }

    #[test]
    fn dff_falls_back_without_motion_stage() {
        let mut s = store(None);
        let o = opts(Reference::Wavelength("410".into()), true, false);
        s.dff(&key(), &o).unwrap();
        assert_eq!(s.dff_formula(&key(), &o), Some(DffFormula::BaselineMedian));
        assert_eq!(s.diagnostics().len(), 1);
    }

    /// The fixture plus a second channel recorded at the target wavelength only.
    fn store_with_lone_target() -> SignalStore {
        let base = store(None);
        let mut raw: BTreeMap<ChannelKey, Vec<f64>> = base
            .keys()
            .map(|k| (k.clone(), base.raw(k).unwrap().to_vec()))
            .collect();
        raw.insert(ChannelKey::new(2, "470"), base.raw(&key()).unwrap().to_vec());
        SignalStore::new(base.time().to_vec(), raw, None)
    }

    #[test]
    fn channel_without_reference_falls_back_to_baseline_formula() {
        let lone = ChannelKey::new(2, "470");
        for (apply_baseline, paired, fallback) in [
            (true, DffFormula::MotionCorrected, DffFormula::BaselineFit),
            (false, DffFormula::FittedReference, DffFormula::BaselineMedian),
        ] {
            let mut s = store_with_lone_target();
            let o = opts(Reference::Wavelength("410".into()), apply_baseline, true);
            let outcomes = s.preprocess(&o);

            assert_eq!(outcomes.len(), 2);
            assert_eq!(outcomes[0].signal, "CH1-470");
            assert_eq!(outcomes[0].formula, Some(paired));
            assert_eq!(outcomes[1].signal, "CH2-470");
            assert_eq!(outcomes[1].formula, Some(fallback));
            assert!(outcomes[1].error.is_none());
            assert!(outcomes[1].stages.contains(&Stage::Zscore));
            assert!(!outcomes[1].stages.contains(&Stage::MotionCorrected));

            let notes: Vec<&Diagnostic> = s.diagnostics().iter().filter(|d| d.scope == "CH2-470").collect();
            assert_eq!(notes.len(), 1);
            assert!(notes[0].message.contains("no 410 trace on channel 2"), "{}", notes[0].message);
            assert!(s.diagnostics().iter().all(|d| d.scope != "CH1-470"));

            // The direct stage call still reports the missing trace.
            assert!(matches!(
                s.motion_corrected(&lone, &o),
                Err(SignalError::MissingTrace(k)) if k == ChannelKey::new(2, "410")
            ));
        }
    }

    #[test]
    fn lone_channel_matches_baseline_reference_result() {
        let lone = ChannelKey::new(2, "470");
        let mut s = store_with_lone_target();
        let o = opts(Reference::Wavelength("410".into()), true, true);
        let fallback = s.dff(&lone, &o).unwrap();

        let mut plain = store(None);
        let expected = plain.dff(&key(), &opts(Reference::Baseline, true, false)).unwrap();
        assert_eq!(fallback, expected);
    }

    #[test]
    fn reference_is_smoothed_and_baseline_corrected_before_regression() {
        let reference = ChannelKey::new(1, "410");
        let o = SignalOptions {
            apply_smooth: true,
            ..opts(Reference::Wavelength("410".into()), true, true)
        };
        let mut s = store(Some(20.0));
        let outcomes = s.preprocess(&o);
        assert_eq!(outcomes[0].formula, Some(DffFormula::MotionCorrected));

        let smoothed = s.get(&reference, Stage::Smoothed, &o).unwrap().to_vec();
        let fit = s.get(&reference, Stage::BaselineFit, &o).unwrap().to_vec();
        let reference_input = s.get(&reference, Stage::BaselineCorrected, &o).unwrap().to_vec();
        for i in 0..N {
            assert_eq!(reference_input[i], smoothed[i] - fit[i]);
        }
        assert_ne!(smoothed, s.raw(&reference).unwrap().to_vec());

        let target_input = s.get(&key(), Stage::BaselineCorrected, &o).unwrap().to_vec();
        let expected = motion::regress_reference(&target_input, &reference_input);
        assert_eq!(s.get(&key(), Stage::FittedReference, &o).unwrap(), expected.fitted.as_slice());
        assert_eq!(s.get(&key(), Stage::MotionCorrected, &o).unwrap(), expected.corrected.as_slice());

        // Regressing onto the untouched reference gives a different fit.
        let from_raw = motion::regress_reference(&target_input, s.raw(&reference).unwrap());
        assert_ne!(from_raw.fitted, expected.fitted);
    }

    #[test]
    fn motion_requires_wavelength_reference() {
        let mut s = store(None);
        let o = opts(Reference::Baseline, false, true);
        assert!(matches!(
            s.motion_corrected(&key(), &o),
            Err(SignalError::MotionNeedsWavelengthReference)
        ));
    }

    #[test]
    fn zscore_requires_dff() {
        let mut s = store(None);
        let o = opts(Reference::Baseline, false, false);
        assert!(matches!(
            s.zscore(&key(), &o),
            Err(SignalError::MissingStage { stage: Stage::Dff, .. })
        ));
        s.dff(&key(), &o).unwrap();
        let z = s.zscore(&key(), &o).unwrap();
        assert_eq!(z.len(), N);
    }

    #[test]
    fn recomputation_is_bit_identical() {
        let o = SignalOptions {
            apply_smooth: true,
            apply_baseline: true,
            apply_motion: true,
            baseline_model: BaselineModel::Exponential,
            ..opts(Reference::Wavelength("410".into()), true, true)
        };
        let mut s = store(Some(20.0));
        s.preprocess(&o);
        let first = s.get(&key(), Stage::Zscore, &o).unwrap().to_vec();
        s.clear();
        assert!(s.get(&key(), Stage::Zscore, &o).is_none());
        s.preprocess(&o);
        let second = s.get(&key(), Stage::Zscore, &o).unwrap().to_vec();
        assert_eq!(
            first.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            second.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn parameter_change_misses_cache() {
        let mut s = store(None);
        let mut o = opts(Reference::Baseline, false, false);
        o.apply_smooth = true;
        s.smoothed(&key(), &o).unwrap();
        assert!(s.get(&key(), Stage::Smoothed, &o).is_some());
        o.window_size = 21;
        assert!(s.get(&key(), Stage::Smoothed, &o).is_none());
    }

    #[test]
    fn invalidate_drops_one_channel() {
        let mut s = store(None);
        let o = opts(Reference::Baseline, false, false);
        s.dff(&key(), &o).unwrap();
        s.invalidate(2);
        assert!(s.get(&key(), Stage::Dff, &o).is_some());
        s.invalidate(1);
        assert!(s.get(&key(), Stage::Dff, &o).is_none());
    }

    #[test]
    fn early_drug_onset_uses_whole_trace() {
        let mut s = store(Some(0.05));
        let o = opts(Reference::Baseline, true, false);
        s.baseline_corrected(&key(), &o).unwrap();
        assert_eq!(s.diagnostics().len(), 1);
        assert!(s.diagnostics()[0].message.contains("whole trace"));
    }

    #[test]
    fn preprocess_records_missing_channel() {
        let mut s = store(None);
        let o = SignalOptions {
            target_signal: TargetSignal::try_from("470+560".to_string()).unwrap(),
            ..opts(Reference::Baseline, false, false)
        };
        let outcomes = s.preprocess(&o);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].formula, Some(DffFormula::BaselineMedian));
        assert!(outcomes[0].stages.contains(&Stage::Zscore));
        assert!(outcomes[1].error.as_deref().unwrap().contains("CH1-560"));
    }
}
