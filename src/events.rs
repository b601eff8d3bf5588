//! Marker events: name → kind resolution, queries, and stimulation sessions.

use serde::{Deserialize, Serialize};

/// Marker categories the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunningStart,
    VideoStart,
    Optogenetic,
    Drug,
}

/// `State` column of an event log: 0 = onset, 1 = offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Onset,
    Offset,
}

impl EventState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Onset),
            1 => Some(Self::Offset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// Seconds since the start of the acquisition log.
    pub time: f64,
    pub name: String,
    pub state: EventState,
    /// Resolved once at ingestion; `None` for names no table entry matches.
    pub kind: Option<EventKind>,
}

/// Configured marker names. A record matches a kind when its name contains the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventNameTable {
    pub running_start: String,
    pub video_start: String,
    pub optogenetic: String,
    pub drug: Vec<String>,
}

impl Default for EventNameTable {
    fn default() -> Self {
        Self {
            running_start: "Input2".to_string(),
            video_start: "Input4".to_string(),
            optogenetic: "Input3".to_string(),
            drug: vec!["Event1".to_string()],
        }
    }
}

impl EventNameTable {
    /// Resolve a raw marker name to its kind.
    pub fn resolve(&self, name: &str) -> Option<EventKind> {
        let matches = |pattern: &str| !pattern.is_empty() && name.contains(pattern);
        if matches(&self.running_start) {
            Some(EventKind::RunningStart)
        } else if matches(&self.video_start) {
            Some(EventKind::VideoStart)
        } else if matches(&self.optogenetic) {
            Some(EventKind::Optogenetic)
        } else if self.drug.iter().any(|d| matches(d)) {
            Some(EventKind::Drug)
        } else {
            None
        }
    }

    pub fn record(&self, time: f64, name: &str, state: EventState) -> EventRecord {
        EventRecord {
            time,
            name: name.to_string(),
            state,
            kind: self.resolve(name),
        }
    }
}

/// Ordered event records for one subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStream {
    records: Vec<EventRecord>,
}

impl EventStream {
    pub fn new(mut records: Vec<EventRecord>) -> Self {
        records.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self { records }
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn of_kind(&self, kind: EventKind) -> impl Iterator<Item = &EventRecord> {
        self.records.iter().filter(move |r| r.kind == Some(kind))
    }

    pub fn onsets(&self, kind: EventKind) -> Vec<f64> {
        self.of_kind(kind)
            .filter(|r| r.state == EventState::Onset)
            .map(|r| r.time)
            .collect()
    }

    pub fn first_onset(&self, kind: EventKind) -> Option<f64> {
        self.of_kind(kind)
            .find(|r| r.state == EventState::Onset)
            .map(|r| r.time)
    }

    pub fn has(&self, kind: EventKind) -> bool {
        self.of_kind(kind).next().is_some()
    }
}

/// Consecutive optogenetic events further apart than this start a new session.
pub const OPTO_SESSION_GAP_SECS: f64 = 20.0;

/// One block of optogenetic pulses, times relative to running start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptoSession {
    pub starts: Vec<f64>,
    pub ends: Vec<f64>,
    /// Hz
    pub frequency: f64,
    /// Seconds
    pub pulse_width: f64,
    /// Seconds
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrugSession {
    pub time: f64,
    pub name: String,
}

/// Group optogenetic onsets/offsets into sessions; `origin` is subtracted from every time.
pub fn optogenetic_sessions(events: &EventStream, origin: f64) -> Vec<OptoSession> {
    let mut marks: Vec<(f64, EventState)> = events
        .of_kind(EventKind::Optogenetic)
        .map(|r| (r.time - origin, r.state))
        .collect();
    marks.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut groups: Vec<Vec<(f64, EventState)>> = Vec::new();
    let mut current: Vec<(f64, EventState)> = Vec::new();
    for mark in marks {
        if let Some(&(last, _)) = current.last() {
            if mark.0 - last > OPTO_SESSION_GAP_SECS {
                groups.push(std::mem::take(&mut current));
            }
        }
        current.push(mark);
    }
    groups.push(current);

    groups
        .into_iter()
        .filter(|g| g.len() >= 2)
        .map(|g| summarize_session(&g))
        .collect()
}

fn summarize_session(marks: &[(f64, EventState)]) -> OptoSession {
    let pick = |state| {
        marks
            .iter()
            .filter(|m| m.1 == state)
            .map(|m| m.0)
            .collect::<Vec<_>>()
    };
    let starts = pick(EventState::Onset);
    let ends = pick(EventState::Offset);

    if starts.is_empty() || ends.is_empty() {
        return OptoSession {
            starts,
            ends,
            frequency: 0.0,
            pulse_width: 0.0,
            duration: 0.0,
        };
    }

    let widths: Vec<f64> = starts
        .iter()
        .zip(&ends)
        .map(|(s, e)| e - s)
        .filter(|w| *w > 0.0)
        .collect();
    let pulse_width = crate::stats::mean(&widths);

    let frequency = if starts.len() > 1 {
        let intervals: Vec<f64> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        let mean_interval = crate::stats::mean(&intervals);
        if mean_interval > 0.0 { 1.0 / mean_interval } else { 0.0 }
    } else {
        0.0
    };

    let (lo, hi) = marks
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), m| (lo.min(m.0), hi.max(m.0)));

    OptoSession {
        starts,
        ends,
        frequency,
        pulse_width,
        duration: hi - lo,
    }
}

/// Every drug-marker onset relative to `origin`, sorted by time.
pub fn drug_sessions(events: &EventStream, origin: f64) -> Vec<DrugSession> {
    let mut sessions: Vec<DrugSession> = events
        .of_kind(EventKind::Drug)
        .filter(|r| r.state == EventState::Onset)
        .map(|r| DrugSession {
            time: r.time - origin,
            name: r.name.clone(),
        })
        .collect();
    sessions.sort_by(|a, b| a.time.total_cmp(&b.time));
    sessions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(items: &[(f64, &str, EventState)]) -> EventStream {
        let table = EventNameTable::default();
        EventStream::new(
            items
                .iter()
                .map(|(t, name, state)| table.record(*t, name, *state))
                .collect(),
        )
    }

    #[test]
    fn resolves_by_substring() {
        let table = EventNameTable::default();
        assert_eq!(table.resolve("Input2 rising"), Some(EventKind::RunningStart));
        assert_eq!(table.resolve("Input3"), Some(EventKind::Optogenetic));
        assert_eq!(table.resolve("Event1"), Some(EventKind::Drug));
        assert_eq!(table.resolve("Input4"), Some(EventKind::VideoStart));
        assert_eq!(table.resolve("Input7"), None);
    }

    #[test]
    fn empty_patterns_never_match() {
        let table = EventNameTable {
            video_start: String::new(),
            ..EventNameTable::default()
        };
        assert_eq!(table.resolve("anything"), None);
    }

    #[test]
    fn first_onset_skips_offsets() {
        let events = stream(&[
            (3.0, "Input2", EventState::Onset),
            (1.0, "Input2", EventState::Offset),
            (5.0, "Input2", EventState::Onset),
        ]);
        assert_eq!(events.first_onset(EventKind::RunningStart), Some(3.0));
        assert_eq!(events.onsets(EventKind::RunningStart), vec![3.0, 5.0]);
        assert!(!events.has(EventKind::Drug));
    }

    #[test]
    fn opto_sessions_split_on_long_gaps() {
        let mut items = Vec::new();
        // Session one: 10 Hz-ish pulses, 20 ms wide.
        for i in 0..5 {
            let t = 100.0 + i as f64 * 0.1;
            items.push((t, "Input3", EventState::Onset));
            items.push((t + 0.02, "Input3", EventState::Offset));
        }
        // Lone pulse onset 60 s later: dropped (single event).
        items.push((160.0, "Input3", EventState::Onset));
        items.push((10.0, "Input2", EventState::Onset));

        let events = stream(&items);
        let sessions = optogenetic_sessions(&events, 10.0);
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.starts.len(), 5);
        assert!((s.frequency - 10.0).abs() < 1e-6, "freq={}", s.frequency);
        assert!((s.pulse_width - 0.02).abs() < 1e-9, "width={}", s.pulse_width);
        assert!((s.duration - 0.42).abs() < 1e-9, "duration={}", s.duration);
        assert!((s.starts[0] - 90.0).abs() < 1e-9);
    }

    #[test]
    fn onset_only_session_reports_zeros() {
        let events = stream(&[
            (1.0, "Input3", EventState::Onset),
            (2.0, "Input3", EventState::Onset),
        ]);
        let sessions = optogenetic_sessions(&events, 0.0);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].frequency, 0.0);
        assert_eq!(sessions[0].duration, 0.0);
    }

    #[test]
    fn drug_sessions_are_rebased_and_sorted() {
        let table = EventNameTable {
            drug: vec!["Event1".into(), "Event2".into()],
            ..EventNameTable::default()
        };
        let events = EventStream::new(vec![
            table.record(50.0, "Event2", EventState::Onset),
            table.record(20.0, "Event1", EventState::Onset),
            table.record(25.0, "Event1", EventState::Offset),
        ]);
        let sessions = drug_sessions(&events, 10.0);
        assert_eq!(
            sessions,
            vec![
                DrugSession { time: 10.0, name: "Event1".into() },
                DrugSession { time: 40.0, name: "Event2".into() },
            ]
        );
    }
}
