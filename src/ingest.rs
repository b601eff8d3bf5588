//! Reading subject data from disk: fluorescence tables, event logs, and subject discovery.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use walkdir::WalkDir;

use crate::events::{EventNameTable, EventState, EventStream};

pub const FLUORESCENCE_FILE: &str = "fluorescence.csv";
pub const EVENT_LOG_FILE: &str = "Events.csv";
pub const ENCODER_EXTENSION: &str = "ast2";

static CHANNEL_COLUMN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^CH(\d+)-(\w+)$").unwrap());

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Table has no header row after {0} preamble lines")]
    MissingHeader(usize),
    #[error("Missing column '{0}'")]
    MissingColumn(String),
    #[error("No CH<n>-<wavelength> signal columns")]
    NoSignalColumns,
    #[error("Line {line}: column '{column}' has non-numeric value '{value}'")]
    BadCell {
        line: usize,
        column: String,
        value: String,
    },
    #[error("Line {line}: time goes backwards")]
    TimeNotMonotonic { line: usize },
    #[error("Table has no data rows")]
    Empty,
}

/// Identity of one fluorescence trace: fiber channel plus excitation wavelength label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChannelKey {
    pub channel: u32,
    pub wavelength: String,
}

impl ChannelKey {
    pub fn new(channel: u32, wavelength: impl Into<String>) -> Self {
        Self {
            channel,
            wavelength: wavelength.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{}-{}", self.channel, self.wavelength)
    }
}

/// Column layout of the fluorescence table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableLayout {
    /// Preamble lines before the header row.
    pub skip_rows: usize,
    pub time_column: String,
    pub events_column: String,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            skip_rows: 1,
            time_column: "TimeStamp".to_string(),
            events_column: "Events".to_string(),
        }
    }
}

/// Raw fluorescence recording, time in seconds on the acquisition clock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FluorescenceTable {
    pub time: Vec<f64>,
    pub signals: BTreeMap<ChannelKey, Vec<f64>>,
    /// `(time, cell text)` for every non-empty events cell; `None` when the column is absent.
    pub event_cells: Option<Vec<(f64, String)>>,
}

impl FluorescenceTable {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Fiber channels present, ascending.
    pub fn channels(&self) -> Vec<u32> {
        let mut channels: Vec<u32> = self.signals.keys().map(|k| k.channel).collect();
        channels.dedup();
        channels
    }

    pub fn trace(&self, key: &ChannelKey) -> Option<&[f64]> {
        self.signals.get(key).map(Vec::as_slice)
    }

    /// Resolve events-column cells into onset records, if the column exists.
    pub fn event_stream(&self, names: &EventNameTable) -> Option<EventStream> {
        self.event_cells.as_ref().map(|cells| {
            EventStream::new(
                cells
                    .iter()
                    .map(|(t, name)| names.record(*t, name, EventState::Onset))
                    .collect(),
            )
        })
    }
}

pub fn load_fluorescence(path: &Path, layout: &TableLayout) -> Result<FluorescenceTable, IngestError> {
    let text = read_text(path)?;
    parse_fluorescence(&text, layout)
}

/// Parse a comma-separated fluorescence export. Time values are milliseconds.
pub fn parse_fluorescence(text: &str, layout: &TableLayout) -> Result<FluorescenceTable, IngestError> {
    let mut lines = text
        .lines()
        .enumerate()
        .skip(layout.skip_rows)
        .filter(|(_, l)| !l.trim().is_empty());
    let (_, header_line) = lines.next().ok_or(IngestError::MissingHeader(layout.skip_rows))?;
    let header = split_row(header_line);

    let time_idx = header
        .iter()
        .position(|h| h.eq_ignore_ascii_case(&layout.time_column))
        .or_else(|| (!header.is_empty()).then_some(0))
        .ok_or_else(|| IngestError::MissingColumn(layout.time_column.clone()))?;
    let events_idx = header
        .iter()
        .position(|h| h.eq_ignore_ascii_case(&layout.events_column));

    let signal_cols: Vec<(usize, ChannelKey)> = header
        .iter()
        .enumerate()
        .filter(|(_, h)| !h.is_empty() && !h.starts_with("Unnamed"))
        .filter_map(|(i, h)| {
            let caps = CHANNEL_COLUMN_RE.captures(h)?;
            let channel = caps[1].parse().ok()?;
            Some((i, ChannelKey::new(channel, &caps[2])))
        })
        .collect();
    if signal_cols.is_empty() {
        return Err(IngestError::NoSignalColumns);
    }

    let mut table = FluorescenceTable {
        event_cells: events_idx.map(|_| Vec::new()),
        ..FluorescenceTable::default()
    };
    for (_, key) in &signal_cols {
        table.signals.insert(key.clone(), Vec::new());
    }

    for (line_no, line) in lines {
        let line_no = line_no + 1;
        let cells = split_row(line);
        let cell = |idx: usize| cells.get(idx).map(String::as_str).unwrap_or("");

        let time_ms = parse_number(cell(time_idx), line_no, &header[time_idx])?;
        let time = time_ms / 1000.0;
        if table.time.last().is_some_and(|&prev| time < prev) {
            return Err(IngestError::TimeNotMonotonic { line: line_no });
        }
        table.time.push(time);

        for (idx, key) in &signal_cols {
            let value = parse_number(cell(*idx), line_no, &header[*idx])?;
            if let Some(trace) = table.signals.get_mut(key) {
                trace.push(value);
            }
        }

        if let (Some(idx), Some(events)) = (events_idx, table.event_cells.as_mut()) {
            let name = cell(idx);
            if !name.is_empty() {
                events.push((time, name.to_string()));
            }
        }
    }

    if table.is_empty() {
        return Err(IngestError::Empty);
    }
    log::debug!(
        "Fluorescence table: {} rows, signals [{}], events column {}",
        table.len(),
        table.signals.keys().map(ToString::to_string).collect::<Vec<_>>().join(", "),
        if events_idx.is_some() { "present" } else { "absent" }
    );
    Ok(table)
}

pub fn load_event_log(path: &Path, names: &EventNameTable) -> Result<EventStream, IngestError> {
    let text = read_text(path)?;
    parse_event_log(&text, names)
}

/// Parse an `Events.csv` log with `TimeStamp` (ms), `Name` and `State` columns.
pub fn parse_event_log(text: &str, names: &EventNameTable) -> Result<EventStream, IngestError> {
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let (_, header_line) = lines.next().ok_or(IngestError::MissingHeader(0))?;
    let header = split_row(header_line);
    let column = |name: &str| {
        header
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| IngestError::MissingColumn(name.to_string()))
    };
    let time_idx = column("TimeStamp")?;
    let name_idx = column("Name")?;
    let state_idx = column("State")?;

    let mut records = Vec::new();
    for (line_no, line) in lines {
        let line_no = line_no + 1;
        let cells = split_row(line);
        let cell = |idx: usize| cells.get(idx).map(String::as_str).unwrap_or("");

        let time = parse_number(cell(time_idx), line_no, "TimeStamp")? / 1000.0;
        let code = parse_number(cell(state_idx), line_no, "State")?;
        let Some(state) = EventState::from_code(code as i64) else {
            log::warn!("Events line {line_no}: unknown state {code}, skipping");
            continue;
        };
        records.push(names.record(time, cell(name_idx), state));
    }
    Ok(EventStream::new(records))
}

/// Files making up one subject's recording.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectFiles {
    pub id: String,
    pub dir: PathBuf,
    pub fluorescence: PathBuf,
    pub encoder: PathBuf,
    pub events: Option<PathBuf>,
}

/// Find subject directories under each root: any directory holding both a
/// fluorescence table and an encoder log.
pub fn discover_subjects(roots: &[PathBuf]) -> Vec<SubjectFiles> {
    let mut subjects = Vec::new();
    for root in roots {
        for entry in WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            if let Some(subject) = subject_in_dir(root, entry.path()) {
                log::debug!("Found subject {} in {}", subject.id, subject.dir.display());
                subjects.push(subject);
            }
        }
    }
    log::info!("Discovered {} subjects", subjects.len());
    subjects
}

fn subject_in_dir(root: &Path, dir: &Path) -> Option<SubjectFiles> {
    let mut fluorescence = None;
    let mut encoder = None;
    let mut events = None;

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    for path in entries {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.eq_ignore_ascii_case(FLUORESCENCE_FILE) {
            fluorescence = Some(path.clone());
        } else if name.eq_ignore_ascii_case(EVENT_LOG_FILE) {
            events = Some(path.clone());
        } else if encoder.is_none()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(ENCODER_EXTENSION))
        {
            encoder = Some(path.clone());
        }
    }

    Some(SubjectFiles {
        id: subject_id(root, dir),
        dir: dir.to_path_buf(),
        fluorescence: fluorescence?,
        encoder: encoder?,
        events,
    })
}

fn subject_id(root: &Path, dir: &Path) -> String {
    let relative = dir.strip_prefix(root).unwrap_or(dir);
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        dir.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string())
    } else {
        parts.join("-")
    }
}

fn read_text(path: &Path) -> Result<String, IngestError> {
    std::fs::read_to_string(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn split_row(line: &str) -> Vec<String> {
    line.split(',')
        .map(|c| c.trim().trim_matches('"').trim().to_string())
        .collect()
}

fn parse_number(raw: &str, line: usize, column: &str) -> Result<f64, IngestError> {
    raw.parse::<f64>().map_err(|_| IngestError::BadCell {
        line,
        column: column.to_string(),
        value: raw.to_string(),
    })
}
