pub mod header;
pub mod speed;

use header::{Header, HEADER_SENTINEL};
use serde::Serialize;
use speed::{EDGE_SAMPLES, VoltageCalibration};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Header sentinel 'header_end' not found")]
    MissingSentinel,
    #[error("Header line is not valid UTF-8")]
    InvalidHeaderEncoding,
    #[error("Header is missing '{0}'")]
    MissingHeaderField(&'static str),
    #[error("Header field '{field}' is invalid: {message}")]
    InvalidHeaderField { field: &'static str, message: String },
    #[error("Sample block of {bytes} bytes is not a whole number of 16-bit samples")]
    OddByteCount { bytes: usize },
    #[error("{samples} samples is not a multiple of the block size {block}")]
    RaggedSamples { samples: usize, block: usize },
    #[error("Running channel {channel} out of range ({available} channels)")]
    ChannelOutOfRange { channel: usize, available: usize },
    #[error("Segments of {0} samples are too short to measure displacement")]
    SegmentTooShort(usize),
    #[error("No complete segments in {0} raw samples")]
    NoSamples(usize),
}

/// An encoder log as read from disk: header plus scaled per-channel samples.
#[derive(Debug, Clone)]
pub struct RawEncoderLog {
    pub header: Header,
    pub channels: Vec<Vec<f64>>,
}

/// Speed over time, one sample per decoded segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunningTrace {
    /// Seconds, strictly increasing.
    pub timestamps: Vec<f64>,
    /// cm/s
    pub speed: Vec<f64>,
}

impl RunningTrace {
    pub fn new(timestamps: Vec<f64>, speed: Vec<f64>) -> Self {
        debug_assert_eq!(timestamps.len(), speed.len());
        Self { timestamps, speed }
    }

    pub fn len(&self) -> usize {
        self.speed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speed.is_empty()
    }

    /// `last − first` timestamp; zero for fewer than two samples.
    pub fn duration(&self) -> f64 {
        match (self.timestamps.first(), self.timestamps.last()) {
            (Some(first), Some(last)) if self.timestamps.len() > 1 => last - first,
            _ => 0.0,
        }
    }

    /// Mean sampling rate in Hz, if at least two samples exist.
    pub fn sample_rate(&self) -> Option<f64> {
        let n = self.timestamps.len();
        if n < 2 {
            return None;
        }
        let mean_interval = self.duration() / (n - 1) as f64;
        (mean_interval > 0.0).then(|| 1.0 / mean_interval)
    }
}

/// Calibration and layout options for turning raw samples into speed.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOptions {
    pub diameter_cm: f64,
    pub invert: bool,
    pub channel: usize,
    /// Skip auto-calibration and use this sweep range.
    pub voltage_range: Option<(f64, f64)>,
    /// Truncate a trailing partial segment instead of rejecting the log.
    pub allow_partial_segment: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            diameter_cm: 22.0,
            invert: false,
            channel: 2,
            voltage_range: None,
            allow_partial_segment: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodedRunning {
    pub trace: RunningTrace,
    pub calibration: VoltageCalibration,
    /// Raw samples dropped from an incomplete final segment.
    pub truncated_samples: usize,
}

/// Read an encoder log from disk.
pub fn load_encoder_log(path: &Path) -> Result<RawEncoderLog, EncoderError> {
    let bytes = std::fs::read(path)?;
    log::debug!("Read {} bytes from {}", bytes.len(), path.display());
    read_encoder_log(&bytes)
}

/// Split a log into header text and the interleaved `i16` sample block.
pub fn read_encoder_log(bytes: &[u8]) -> Result<RawEncoderLog, EncoderError> {
    let mut header_lines = Vec::new();
    let mut cursor = 0;
    let data_start = loop {
        if cursor >= bytes.len() {
            return Err(EncoderError::MissingSentinel);
        }
        let line_end = bytes[cursor..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(bytes.len(), |p| cursor + p);
        let line = std::str::from_utf8(&bytes[cursor..line_end])
            .map_err(|_| EncoderError::InvalidHeaderEncoding)?
            .trim();
        cursor = (line_end + 1).min(bytes.len());
        if line == HEADER_SENTINEL {
            break cursor;
        }
        header_lines.push(line);
    };

    let header = header::parse_header(header_lines.iter().copied());
    let n_channels = header.channel_count()?;
    let scale = header.scale()?;

    let block = &bytes[data_start..];
    if block.len() % 2 != 0 {
        return Err(EncoderError::OddByteCount { bytes: block.len() });
    }
    let samples: Vec<i16> = block
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    if samples.len() % n_channels != 0 {
        return Err(EncoderError::RaggedSamples {
            samples: samples.len(),
            block: n_channels,
        });
    }

    let per_channel = samples.len() / n_channels;
    let mut channels = vec![Vec::with_capacity(per_channel); n_channels];
    for frame in samples.chunks_exact(n_channels) {
        for (channel, &raw) in channels.iter_mut().zip(frame) {
            channel.push(raw as f64 / scale);
        }
    }

    log::debug!(
        "Encoder log: {} channels x {} samples, header keys: {}",
        n_channels,
        per_channel,
        header.keys().collect::<Vec<_>>().join(", ")
    );
    Ok(RawEncoderLog { header, channels })
}

/// Decode the configured channel of a log into a running trace.
pub fn decode(log: &RawEncoderLog, opts: &DecodeOptions) -> Result<DecodedRunning, EncoderError> {
    let raw = log
        .channels
        .get(opts.channel)
        .ok_or(EncoderError::ChannelOutOfRange {
            channel: opts.channel,
            available: log.channels.len(),
        })?;
    let input_rate = log.header.input_rate()?;
    let save_every = log.header.save_every()?;
    raw_to_speed(raw, input_rate, save_every, opts)
}

/// Segment a raw channel into blocks of `save_every` samples and compute one speed per block.
pub fn raw_to_speed(
    raw: &[f64],
    input_rate: f64,
    save_every: usize,
    opts: &DecodeOptions,
) -> Result<DecodedRunning, EncoderError> {
    // Edge windows of a shorter segment overlap completely and measure zero time.
    if save_every <= EDGE_SAMPLES {
        return Err(EncoderError::SegmentTooShort(save_every));
    }

    let n_segments = raw.len() / save_every;
    let remainder = raw.len() % save_every;
    if remainder != 0 {
        log::warn!(
            "{} raw samples is not a multiple of saveEvery = {}; {} trailing samples dropped",
            raw.len(),
            save_every,
            remainder
        );
        if !opts.allow_partial_segment {
            return Err(EncoderError::RaggedSamples {
                samples: raw.len(),
                block: save_every,
            });
        }
    }
    if n_segments == 0 {
        return Err(EncoderError::NoSamples(raw.len()));
    }

    let usable = &raw[..n_segments * save_every];
    let calibration = match opts.voltage_range {
        Some(range) => VoltageCalibration::supplied(range),
        None => speed::calibrate_voltage_range(usable),
    };

    let segment_times: Vec<f64> = (1..=save_every).map(|i| i as f64 / input_rate).collect();
    let sign = if opts.invert { -1.0 } else { 1.0 };

    let speed: Vec<f64> = usable
        .chunks_exact(save_every)
        .map(|segment| {
            sign * speed::segment_speed(segment, &segment_times, calibration.range, opts.diameter_cm)
        })
        .collect();
    let timestamps: Vec<f64> = (1..=n_segments)
        .map(|k| (k * save_every) as f64 / input_rate)
        .collect();

    log::info!(
        "Decoded {} speed samples at {:.2} Hz",
        speed.len(),
        input_rate / save_every as f64
    );

    Ok(DecodedRunning {
        trace: RunningTrace::new(timestamps, speed),
        calibration,
        truncated_samples: remainder,
    })
}
