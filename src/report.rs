//! Serializable per-subject summaries.

use serde::Serialize;
use std::io::Write;
use std::path::Path;

use crate::align::{AlignmentResult, MarkerPresence};
use crate::batch::SubjectAnalysis;
use crate::diagnostic::Diagnostic;
use crate::encoder::speed::VoltageCalibration;
use crate::events::{DrugSession, OptoSession};
use crate::running::bouts::{BoutCategory, BoutSet};
use crate::running::threshold::ThresholdEstimate;
use crate::signal::ChannelOutcome;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectReport {
    pub id: String,
    pub calibration: VoltageCalibration,
    pub alignment: AlignmentSummary,
    pub channels: Vec<ChannelOutcome>,
    pub running_filters: Vec<String>,
    pub bouts: BoutReport,
    pub opto_sessions: Vec<OptoSession>,
    pub drug_sessions: Vec<DrugSession>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Alignment offsets and marker flags, without the aligned traces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignmentSummary {
    pub running_start_time: f64,
    pub running_duration: f64,
    pub running_end_time: f64,
    pub fiber_time_offset: f64,
    pub video_time_offset: Option<f64>,
    pub running_sample_rate: f64,
    pub markers: MarkerPresence,
    /// Frames kept inside the running window.
    pub video_frames: Option<usize>,
}

impl From<&AlignmentResult> for AlignmentSummary {
    fn from(alignment: &AlignmentResult) -> Self {
        Self {
            running_start_time: alignment.running_start_time,
            running_duration: alignment.running_duration,
            running_end_time: alignment.running_end_time,
            fiber_time_offset: alignment.fiber_time_offset,
            video_time_offset: alignment.video_time_offset,
            running_sample_rate: alignment.running_sample_rate,
            markers: alignment.markers,
            video_frames: alignment.video.as_ref().map(|v| v.frame_indices.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoutReport {
    pub threshold: ThresholdEstimate,
    pub sample_rate: f64,
    pub categories: Vec<CategorySummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySummary {
    pub category: BoutCategory,
    pub count: usize,
    /// Seconds.
    pub total_duration: f64,
    /// `(onset, offset)` in seconds after running start.
    pub ranges: Vec<(f64, f64)>,
}

impl BoutReport {
    pub fn new(bouts: &BoutSet, timestamps: &[f64]) -> Self {
        let categories = BoutCategory::ALL
            .iter()
            .map(|&category| CategorySummary {
                category,
                count: bouts.count(category),
                total_duration: bouts.total_duration(category),
                ranges: bouts
                    .of(category)
                    .iter()
                    .filter_map(|b| b.time_range(timestamps))
                    .collect(),
            })
            .collect();
        Self {
            threshold: bouts.threshold.clone(),
            sample_rate: bouts.sample_rate,
            categories,
        }
    }

    pub fn count(&self, category: BoutCategory) -> usize {
        self.categories
            .iter()
            .find(|c| c.category == category)
            .map_or(0, |c| c.count)
    }
}

impl SubjectReport {
    pub fn from_analysis(analysis: &SubjectAnalysis) -> Self {
        Self {
            id: analysis.id.clone(),
            calibration: analysis.calibration,
            alignment: AlignmentSummary::from(&analysis.alignment),
            channels: analysis.channels.clone(),
            running_filters: analysis.running.applied.clone(),
            bouts: BoutReport::new(&analysis.bouts, &analysis.running.original.timestamps),
            opto_sessions: analysis.opto_sessions.clone(),
            drug_sessions: analysis.drug_sessions.clone(),
            diagnostics: analysis.all_diagnostics(),
        }
    }
}

/// Write reports as a pretty-printed JSON array.
pub fn write_json(path: &Path, reports: &[SubjectReport]) -> std::io::Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    serde_json::to_writer_pretty(&mut file, reports)?;
    file.write_all(b"\n")?;
    file.flush()
}
