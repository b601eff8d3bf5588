//! Per-subject pipeline and the parallel batch over many subjects.

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::align::{AlignError, AlignmentResult, VideoInput, align};
use crate::config::AppConfig;
use crate::diagnostic::Diagnostic;
use crate::encoder::speed::VoltageCalibration;
use crate::encoder::{self, EncoderError};
use crate::events::{DrugSession, OptoSession, drug_sessions, optogenetic_sessions};
use crate::ingest::{IngestError, SubjectFiles, load_event_log, load_fluorescence};
use crate::report::SubjectReport;
use crate::running::bouts::BoutSet;
use crate::running::filters::FilterError;
use crate::running::{FilteredRunning, apply_filters};
use crate::signal::{ChannelOutcome, SignalError, SignalStore};

#[derive(Error, Debug)]
pub enum SubjectError {
    #[error("Encoder log: {0}")]
    Encoder(#[from] EncoderError),
    #[error("Ingest: {0}")]
    Ingest(#[from] IngestError),
    #[error("Alignment: {0}")]
    Align(#[from] AlignError),
    #[error("Signal: {0}")]
    Signal(#[from] SignalError),
    #[error("Running filter: {0}")]
    Filter(#[from] FilterError),
    #[error("No channel produced ΔF/F ({0} attempted)")]
    NoChannelSucceeded(usize),
}

/// Everything computed for one subject.
#[derive(Debug)]
pub struct SubjectAnalysis {
    pub id: String,
    pub calibration: VoltageCalibration,
    pub alignment: AlignmentResult,
    pub running: FilteredRunning,
    pub signals: SignalStore,
    pub channels: Vec<ChannelOutcome>,
    pub bouts: BoutSet,
    pub opto_sessions: Vec<OptoSession>,
    pub drug_sessions: Vec<DrugSession>,
    /// Subject-level fallbacks; per-channel ones live in `signals`.
    pub diagnostics: Vec<Diagnostic>,
}

impl SubjectAnalysis {
    /// Subject-level and signal diagnostics together.
    pub fn all_diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .iter()
            .chain(self.signals.diagnostics())
            .cloned()
            .collect()
    }
}

/// decode → align → preprocess → ΔF/F → z-score → bouts → sessions.
pub fn analyze_subject(files: &SubjectFiles, config: &AppConfig) -> Result<SubjectAnalysis, SubjectError> {
    analyze_subject_with_video(files, config, None)
}

/// Like [`analyze_subject`], also aligning `video_frames` behavior-camera frames at `[video] fps`.
pub fn analyze_subject_with_video(
    files: &SubjectFiles,
    config: &AppConfig,
    video_frames: Option<usize>,
) -> Result<SubjectAnalysis, SubjectError> {
    log::debug!("Analyzing subject {} in {}", files.id, files.dir.display());
    let mut diagnostics = Vec::new();

    let log = encoder::load_encoder_log(&files.encoder)?;
    let decoded = encoder::decode(&log, &config.running.decode_options())?;
    if !decoded.calibration.calibrated {
        diagnostics.push(Diagnostic::warn(
            "running",
            format!(
                "voltage auto-calibration failed, using default range {:?}",
                decoded.calibration.range
            ),
        ));
    }
    if decoded.truncated_samples > 0 {
        diagnostics.push(Diagnostic::warn(
            "running",
            format!("dropped {} samples of a partial final segment", decoded.truncated_samples),
        ));
    }

    let table = load_fluorescence(&files.fluorescence, &config.table)?;
    let extra_events = files
        .events
        .as_deref()
        .map(|path| load_event_log(path, &config.events))
        .transpose()?;
    let video = video_frames.map(|frame_count| VideoInput {
        frame_count,
        fps: config.video.fps,
    });
    let alignment = align(&decoded.trace, &table, &config.events, extra_events.as_ref(), video)?;

    let mut signals = SignalStore::from_alignment(&alignment);
    let channels = signals.preprocess(&config.signal);
    if !channels.iter().any(|c| c.formula.is_some()) {
        return Err(SubjectError::NoChannelSucceeded(channels.len()));
    }

    let running = apply_filters(&alignment.running, &config.running.filters)?;
    let bouts = running.detect_bouts(&config.bouts)?;
    if bouts.general.is_empty() {
        diagnostics.push(Diagnostic::warn("running", "no locomotion bouts detected"));
    }

    let opto_sessions = optogenetic_sessions(&alignment.events, alignment.running_start_time);
    let drug_sessions = drug_sessions(&alignment.events, alignment.running_start_time);

    Ok(SubjectAnalysis {
        id: files.id.clone(),
        calibration: decoded.calibration,
        alignment,
        running,
        signals,
        channels,
        bouts,
        opto_sessions,
        drug_sessions,
        diagnostics,
    })
}

pub struct BatchResult {
    pub processed: u64,
    pub failed: u64,
    /// `(subject id, reason)`
    pub failures: Vec<(String, String)>,
    pub reports: Vec<SubjectReport>,
}

/// Analyze subjects in parallel. A failing subject is counted and named, never propagated.
pub fn run_batch(subjects: &[SubjectFiles], config: &AppConfig, jobs: usize) -> BatchResult {
    let mut result = BatchResult {
        processed: 0,
        failed: 0,
        failures: Vec::new(),
        reports: Vec::new(),
    };
    if subjects.is_empty() {
        log::info!("No subjects to process");
        return result;
    }

    log::info!("Processing {} subjects with {} workers", subjects.len(), jobs);

    let pb = ProgressBar::new(subjects.len() as u64);
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}") {
        pb.set_style(style.progress_chars("#>-"));
    }

    let outcomes: Vec<(String, Result<SubjectReport, SubjectError>)> =
        match rayon::ThreadPoolBuilder::new().num_threads(jobs.max(1)).build() {
            Ok(pool) => pool.install(|| {
                use rayon::prelude::*;
                subjects
                    .par_iter()
                    .map(|files| {
                        let outcome = process_one(files, config);
                        pb.inc(1);
                        (files.id.clone(), outcome)
                    })
                    .collect()
            }),
            Err(e) => {
                log::warn!("Failed to build thread pool ({e}), processing sequentially");
                subjects
                    .iter()
                    .map(|files| {
                        let outcome = process_one(files, config);
                        pb.inc(1);
                        (files.id.clone(), outcome)
                    })
                    .collect()
            }
        };

    for (id, outcome) in outcomes {
        match outcome {
            Ok(report) => {
                result.processed += 1;
                result.reports.push(report);
            }
            Err(e) => {
                log::warn!("Subject {} failed: {}", id, e);
                result.failed += 1;
                result.failures.push((id, e.to_string()));
            }
        }
    }

    pb.finish_with_message(format!("Done: {} processed, {} failed", result.processed, result.failed));
    result
}

fn process_one(files: &SubjectFiles, config: &AppConfig) -> Result<SubjectReport, SubjectError> {
    analyze_subject(files, config).map(|analysis| SubjectReport::from_analysis(&analysis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::discover_subjects;
    use crate::signal::normalize::DffFormula;
    use std::path::Path;

    fn encoder_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        for line in [
            "header.activeChIDs = [1];",
            "header.scale = 1;",
            "header.inputRate = 100;",
            "header.saveEvery = 20;",
            "header_end",
        ] {
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
        }
        for _ in 0..600 {
            bytes.extend_from_slice(&1i16.to_le_bytes());
        }
        bytes
    }

    /// 20 Hz for 5 s; running starts at 1 s.
    fn fluorescence_csv(with_events: bool) -> String {
        let mut text = String::from("preamble\n");
        text.push_str(if with_events {
            "TimeStamp,Events,CH1-410,CH1-470\n"
        } else {
            "TimeStamp,CH1-410,CH1-470\n"
        });
        for i in 0..100 {
            let ms = i * 50;
            let reference = 100.0 + (i % 5) as f64;
            let target = 200.0 + (i % 7) as f64;
            if with_events {
                let event = match ms {
                    1000 => "Input2",
                    1500 => "Input4",
                    _ => "",
                };
                text.push_str(&format!("{ms},{event},{reference},{target}\n"));
            } else {
                text.push_str(&format!("{ms},{reference},{target}\n"));
            }
        }
        text
    }

    fn write_subject(root: &Path, name: &str, with_events: bool) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("fluorescence.csv"), fluorescence_csv(with_events)).unwrap();
        std::fs::write(dir.join("wheel.ast2"), encoder_bytes()).unwrap();
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.running.channel = 0;
        config.running.voltage_range = Some((0.0, 5.0));
        config
    }

    #[test]
    fn analyzes_one_subject() {
        let dir = tempfile::tempdir().unwrap();
        write_subject(dir.path(), "mouse1", true);
        let subjects = discover_subjects(&[dir.path().to_path_buf()]);
        assert_eq!(subjects.len(), 1);

        let analysis = analyze_subject(&subjects[0], &config()).unwrap();
        assert_eq!(analysis.id, "mouse1");
        assert_eq!(analysis.alignment.running_start_time, 1.0);
        assert_eq!(analysis.channels.len(), 1);
        assert_eq!(analysis.channels[0].formula, Some(DffFormula::BaselineMedian));
        assert!(analysis.bouts.general.is_empty());
        // Constant wheel voltage: no bouts, reported as a diagnostic.
        assert!(analysis.all_diagnostics().iter().any(|d| d.scope == "running"));
    }

    #[test]
    fn video_frames_use_configured_fps() {
        let dir = tempfile::tempdir().unwrap();
        write_subject(dir.path(), "mouse1", true);
        let subjects = discover_subjects(&[dir.path().to_path_buf()]);
        let mut config = config();
        config.video.fps = 10.0;

        let analysis = analyze_subject_with_video(&subjects[0], &config, Some(100)).unwrap();
        let video = analysis.alignment.video.unwrap();
        assert_eq!(analysis.alignment.video_time_offset, Some(0.5));
        assert_eq!(video.frame_indices[0], 0);
        assert!((video.frame_times[1] - 0.6).abs() < 1e-9);
        assert!(analysis.alignment.markers.video);
    }

    #[test]
    fn report_keeps_alignment_summary_only() {
        let dir = tempfile::tempdir().unwrap();
        write_subject(dir.path(), "mouse1", true);
        let subjects = discover_subjects(&[dir.path().to_path_buf()]);
        let mut config = config();
        config.video.fps = 10.0;
        let analysis = analyze_subject_with_video(&subjects[0], &config, Some(100)).unwrap();

        let report = SubjectReport::from_analysis(&analysis);
        let frames = analysis.alignment.video.as_ref().map(|v| v.frame_indices.len());
        assert!(frames.is_some_and(|n| n > 0));
        assert_eq!(report.alignment.video_frames, frames);
        assert_eq!(report.alignment.running_start_time, 1.0);
        assert_eq!(report.alignment.video_time_offset, Some(0.5));
        assert_eq!(report.alignment.markers, analysis.alignment.markers);

        let json = serde_json::to_value(&report).unwrap();
        let alignment = json["alignment"].as_object().unwrap();
        let mut fields: Vec<&str> = alignment.keys().map(String::as_str).collect();
        fields.sort_unstable();
        assert_eq!(
            fields,
            vec![
                "fiber_time_offset",
                "markers",
                "running_duration",
                "running_end_time",
                "running_sample_rate",
                "running_start_time",
                "video_frames",
                "video_time_offset",
            ]
        );
    }

    #[test]
    fn batch_continues_past_failing_subject() {
        let dir = tempfile::tempdir().unwrap();
        write_subject(dir.path(), "mouse1", true);
        write_subject(dir.path(), "mouse2", false);
        write_subject(dir.path(), "mouse3", true);
        let subjects = discover_subjects(&[dir.path().to_path_buf()]);
        assert_eq!(subjects.len(), 3);

        let result = run_batch(&subjects, &config(), 2);
        assert_eq!(result.processed, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failures[0].0, "mouse2");
        assert!(result.failures[0].1.contains("events column"), "{}", result.failures[0].1);
        let ids: Vec<&str> = result.reports.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["mouse1", "mouse3"]);
    }

    #[test]
    fn missing_target_wavelength_fails_subject() {
        let dir = tempfile::tempdir().unwrap();
        write_subject(dir.path(), "mouse1", true);
        let subjects = discover_subjects(&[dir.path().to_path_buf()]);
        let mut config = config();
        config.signal.target_signal = "560".to_string().try_into().unwrap();
        assert!(matches!(
            analyze_subject(&subjects[0], &config),
            Err(SubjectError::NoChannelSucceeded(1))
        ));
    }

    #[test]
    fn empty_batch_is_not_an_error() {
        let result = run_batch(&[], &AppConfig::default(), 1);
        assert_eq!((result.processed, result.failed), (0, 0));
    }
}
