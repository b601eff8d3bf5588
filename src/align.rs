//! Common time origin across running wheel, fluorescence, and video.
//!
//! The first running-start marker becomes t = 0. Every stream is rebased to
//! that origin and trimmed to `[0, running_duration]`.

use serde::Serialize;
use thiserror::Error;

use crate::encoder::RunningTrace;
use crate::events::{EventKind, EventNameTable, EventStream};
use crate::ingest::FluorescenceTable;

/// Sampling rate assumed for running traces too short to measure one.
pub const FALLBACK_RUNNING_RATE: f64 = 10.0;

#[derive(Error, Debug)]
pub enum AlignError {
    #[error("Fluorescence table has no events column")]
    MissingEventsColumn,
    #[error("No running-start marker '{0}' in the event stream")]
    NoRunningStart(String),
    #[error("Running trace is empty")]
    EmptyRunningTrace,
    #[error("No fluorescence samples within [0, {duration:.3}] s of running start")]
    EmptyAfterTrim { duration: f64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MarkerPresence {
    pub optogenetic: bool,
    pub drug: bool,
    pub video: bool,
}

/// Video frames that fall inside the running window.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoAlignment {
    pub time_offset: f64,
    pub frame_indices: Vec<usize>,
    pub frame_times: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentResult {
    /// Acquisition-clock time of the running-start marker.
    pub running_start_time: f64,
    pub running_duration: f64,
    pub running_end_time: f64,
    /// Rebased time of the first raw fluorescence sample.
    pub fiber_time_offset: f64,
    pub video_time_offset: Option<f64>,
    pub running_sample_rate: f64,
    pub markers: MarkerPresence,
    pub running: RunningTrace,
    pub fluorescence: FluorescenceTable,
    /// Acquisition-clock events; subtract `running_start_time` to rebase.
    pub events: EventStream,
    pub video: Option<VideoAlignment>,
}

impl AlignmentResult {
    pub fn rebase(&self, acquisition_time: f64) -> f64 {
        acquisition_time - self.running_start_time
    }

    /// Rebased onset of the first drug marker, if any.
    pub fn first_drug_onset(&self) -> Option<f64> {
        self.events
            .first_onset(EventKind::Drug)
            .map(|t| self.rebase(t))
    }
}

/// Optional behavior-video input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInput {
    pub frame_count: usize,
    pub fps: f64,
}

/// Align one subject's streams onto the running-start origin.
///
/// Markers come from the fluorescence table's events column; `extra_events`
/// (a separate event log, when present) is merged in for session analyses.
pub fn align(
    running: &RunningTrace,
    table: &FluorescenceTable,
    names: &EventNameTable,
    extra_events: Option<&EventStream>,
    video: Option<VideoInput>,
) -> Result<AlignmentResult, AlignError> {
    let column_events = table
        .event_stream(names)
        .ok_or(AlignError::MissingEventsColumn)?;
    let running_start_time = column_events
        .first_onset(EventKind::RunningStart)
        .ok_or_else(|| AlignError::NoRunningStart(names.running_start.clone()))?;

    let (Some(&run_first), Some(&run_last)) = (running.timestamps.first(), running.timestamps.last())
    else {
        return Err(AlignError::EmptyRunningTrace);
    };
    let running_duration = run_last - run_first;
    let running_end_time = running_start_time + running_duration;

    let events = match extra_events {
        Some(extra) if !extra.is_empty() => {
            let mut merged = column_events.records().to_vec();
            merged.extend(extra.records().iter().cloned());
            EventStream::new(merged)
        }
        _ => column_events,
    };

    let fiber_time_offset = table.time.first().map_or(0.0, |t| t - running_start_time);
    let fluorescence = trim_fluorescence(table, running_start_time, running_duration);
    if fluorescence.is_empty() {
        return Err(AlignError::EmptyAfterTrim {
            duration: running_duration,
        });
    }

    let running = RunningTrace::new(
        running.timestamps.iter().map(|t| t - run_first).collect(),
        running.speed.clone(),
    );
    let running_sample_rate = running.sample_rate().unwrap_or(FALLBACK_RUNNING_RATE);

    let video_start = events.first_onset(EventKind::VideoStart);
    let video_time_offset = video_start.map(|t| t - running_start_time);
    let video = match (video_time_offset, video) {
        (Some(offset), Some(input)) => Some(trim_video(offset, input, running_duration)),
        (None, Some(_)) => {
            log::warn!("Video supplied but no video-start marker; video alignment unavailable");
            None
        }
        _ => None,
    };

    let markers = MarkerPresence {
        optogenetic: events.has(EventKind::Optogenetic),
        drug: events.has(EventKind::Drug),
        video: video_start.is_some(),
    };
    if !markers.optogenetic {
        log::info!("No optogenetic markers; optogenetic analyses disabled");
    }
    if !markers.drug {
        log::info!("No drug markers; drug analyses disabled");
    }

    log::info!(
        "Running start {:.2}s, duration {:.2}s, fiber offset {:.2}s, {} of {} fluorescence samples kept",
        running_start_time,
        running_duration,
        fiber_time_offset,
        fluorescence.len(),
        table.len()
    );

    Ok(AlignmentResult {
        running_start_time,
        running_duration,
        running_end_time,
        fiber_time_offset,
        video_time_offset,
        running_sample_rate,
        markers,
        running,
        fluorescence,
        events,
        video,
    })
}

fn trim_fluorescence(table: &FluorescenceTable, origin: f64, duration: f64) -> FluorescenceTable {
    let in_window = |t: f64| (0.0..=duration).contains(&t);
    let keep: Vec<usize> = table
        .time
        .iter()
        .enumerate()
        .filter(|(_, t)| in_window(**t - origin))
        .map(|(i, _)| i)
        .collect();

    FluorescenceTable {
        time: keep.iter().map(|&i| table.time[i] - origin).collect(),
        signals: table
            .signals
            .iter()
            .map(|(key, trace)| (key.clone(), keep.iter().map(|&i| trace[i]).collect()))
            .collect(),
        event_cells: table.event_cells.as_ref().map(|cells| {
            cells
                .iter()
                .map(|(t, name)| (t - origin, name.clone()))
                .filter(|(t, _)| in_window(*t))
                .collect()
        }),
    }
}

fn trim_video(offset: f64, input: VideoInput, duration: f64) -> VideoAlignment {
    let (frame_indices, frame_times): (Vec<usize>, Vec<f64>) = (0..input.frame_count)
        .map(|i| (i, offset + i as f64 / input.fps))
        .filter(|(_, t)| (0.0..=duration).contains(t))
        .unzip();
    VideoAlignment {
        time_offset: offset,
        frame_indices,
        frame_times,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ChannelKey;

    fn table(events: Option<Vec<(f64, &str)>>) -> FluorescenceTable {
        // 0.1 s sampling from t = 5 s to t = 25 s.
        let time: Vec<f64> = (0..=200).map(|i| 5.0 + i as f64 * 0.1).collect();
        let trace: Vec<f64> = time.iter().map(|t| 100.0 + t).collect();
        FluorescenceTable {
            signals: [(ChannelKey::new(1, "470"), trace)].into_iter().collect(),
            time,
            event_cells: events.map(|e| e.into_iter().map(|(t, n)| (t, n.to_string())).collect()),
        }
    }

    fn running(duration: f64) -> RunningTrace {
        let timestamps: Vec<f64> = (0..=(duration * 10.0) as usize)
            .map(|i| 0.1 + i as f64 * 0.1)
            .collect();
        let speed = vec![1.0; timestamps.len()];
        RunningTrace::new(timestamps, speed)
    }

    #[test]
    fn rebases_and_trims_to_running_window() {
        let t = table(Some(vec![(10.0, "Input2"), (12.0, "Event1")]));
        let result = align(&running(8.0), &t, &EventNameTable::default(), None, None).unwrap();

        assert_eq!(result.running_start_time, 10.0);
        assert!((result.running_duration - 8.0).abs() < 1e-9);
        assert!((result.fiber_time_offset + 5.0).abs() < 1e-9);
        assert_eq!(result.running.timestamps[0], 0.0);
        for &time in &result.fluorescence.time {
            assert!(time >= 0.0 && time <= result.running_duration, "t={time}");
        }
        assert!(result.markers.drug);
        assert!(!result.markers.optogenetic);
        assert!((result.first_drug_onset().unwrap() - 2.0).abs() < 1e-12);
        assert_eq!(
            result.fluorescence.signals[&ChannelKey::new(1, "470")].len(),
            result.fluorescence.len()
        );
    }

    #[test]
    fn missing_events_column_fails() {
        let t = table(None);
        let err = align(&running(5.0), &t, &EventNameTable::default(), None, None).unwrap_err();
        assert!(matches!(err, AlignError::MissingEventsColumn));
    }

    #[test]
    fn missing_running_start_fails() {
        let t = table(Some(vec![(8.0, "Input3")]));
        let err = align(&running(5.0), &t, &EventNameTable::default(), None, None).unwrap_err();
        assert!(matches!(err, AlignError::NoRunningStart(ref n) if n == "Input2"));
    }

    #[test]
    fn window_past_fluorescence_is_empty() {
        let t = table(Some(vec![(100.0, "Input2")]));
        let err = align(&running(5.0), &t, &EventNameTable::default(), None, None).unwrap_err();
        assert!(matches!(err, AlignError::EmptyAfterTrim { .. }));
    }

    #[test]
    fn video_frames_trimmed_to_running_window() {
        let t = table(Some(vec![(10.0, "Input2"), (9.0, "Input4")]));
        let video = VideoInput {
            frame_count: 600,
            fps: 30.0,
        };
        let result = align(&running(5.0), &t, &EventNameTable::default(), None, Some(video)).unwrap();
        let aligned = result.video.unwrap();
        assert_eq!(result.video_time_offset, Some(-1.0));
        // Frame 30 is at rebased t = 0; the window ends 5 s later.
        assert_eq!(aligned.frame_indices.first(), Some(&30));
        assert!(aligned.frame_times.iter().all(|&t| (0.0..=5.0 + 1e-9).contains(&t)));
        assert!(result.markers.video);
    }

    #[test]
    fn missing_video_marker_is_not_fatal() {
        let t = table(Some(vec![(10.0, "Input2")]));
        let video = VideoInput {
            frame_count: 10,
            fps: 30.0,
        };
        let result = align(&running(5.0), &t, &EventNameTable::default(), None, Some(video)).unwrap();
        assert!(result.video.is_none());
        assert!(result.video_time_offset.is_none());
    }

    #[test]
    fn realignment_is_idempotent() {
        let t = table(Some(vec![(10.0, "Input2"), (11.0, "Input3")]));
        let a = align(&running(6.0), &t, &EventNameTable::default(), None, None).unwrap();
        let b = align(&running(6.0), &t, &EventNameTable::default(), None, None).unwrap();
        assert_eq!(a, b);
    }
}
