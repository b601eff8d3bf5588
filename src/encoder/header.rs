use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::EncoderError;

/// Line that terminates the text header of an encoder log.
pub const HEADER_SENTINEL: &str = "header_end";

// e.g. header.inputRate = 10000;  header.activeChIDs = [1 2 3];
static ASSIGNMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^header\.(\w+)\s*=\s*(.*);$").unwrap());

/// A single header value: scalar, quoted text, vector, or `;`-separated matrix.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Float(f64),
    Text(String),
    Vector(Vec<HeaderValue>),
    Matrix(Vec<Vec<HeaderValue>>),
}

impl HeaderValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Vector(items) if items.len() == 1 => items[0].as_f64(),
            _ => None,
        }
    }

    /// Number of elements: vectors count their items, scalars count as one.
    pub fn element_count(&self) -> usize {
        match self {
            Self::Vector(items) => items.len(),
            Self::Matrix(rows) => rows.iter().map(Vec::len).sum(),
            _ => 1,
        }
    }
}

/// Parsed `key = value;` assignments from the log header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    fields: BTreeMap<String, HeaderValue>,
}

impl Header {
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: &str, value: HeaderValue) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Raw-sample rate in Hz (`inputRate`).
    pub fn input_rate(&self) -> Result<f64, EncoderError> {
        let rate = self.number("inputRate")?;
        if rate <= 0.0 {
            return Err(EncoderError::InvalidHeaderField {
                field: "inputRate",
                message: format!("must be positive, got {rate}"),
            });
        }
        Ok(rate)
    }

    /// Raw samples per output speed sample (`saveEvery`).
    pub fn save_every(&self) -> Result<usize, EncoderError> {
        let value = self.number("saveEvery")?;
        if value < 1.0 || value.fract() != 0.0 {
            return Err(EncoderError::InvalidHeaderField {
                field: "saveEvery",
                message: format!("must be a positive integer, got {value}"),
            });
        }
        Ok(value as usize)
    }

    /// Number of interleaved channels in the sample block (`activeChIDs`).
    pub fn channel_count(&self) -> Result<usize, EncoderError> {
        let ids = self
            .get("activeChIDs")
            .ok_or(EncoderError::MissingHeaderField("activeChIDs"))?;
        match ids.element_count() {
            0 => Err(EncoderError::InvalidHeaderField {
                field: "activeChIDs",
                message: "no active channels".to_string(),
            }),
            n => Ok(n),
        }
    }

    /// Divisor applied to raw integer samples (`scale`).
    pub fn scale(&self) -> Result<f64, EncoderError> {
        let scale = self.number("scale")?;
        if scale == 0.0 {
            return Err(EncoderError::InvalidHeaderField {
                field: "scale",
                message: "must be non-zero".to_string(),
            });
        }
        Ok(scale)
    }

    fn number(&self, key: &'static str) -> Result<f64, EncoderError> {
        let value = self.get(key).ok_or(EncoderError::MissingHeaderField(key))?;
        value.as_f64().ok_or_else(|| EncoderError::InvalidHeaderField {
            field: key,
            message: format!("expected a number, got {value:?}"),
        })
    }
}

/// Parse header lines (without the sentinel). Lines that are not assignments are skipped.
pub fn parse_header<'a>(lines: impl IntoIterator<Item = &'a str>) -> Header {
    let mut header = Header::default();
    for line in lines {
        let line = line.trim();
        let Some(caps) = ASSIGNMENT_RE.captures(line) else {
            if !line.is_empty() {
                log::trace!("Skipping header line: {line}");
            }
            continue;
        };
        let key = &caps[1];
        let value = parse_value(caps[2].trim());
        header.fields.insert(key.to_string(), value);
    }
    header
}

fn parse_value(raw: &str) -> HeaderValue {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return HeaderValue::Text(raw[1..raw.len() - 1].to_string());
    }

    if raw.len() >= 2 && raw.starts_with('[') && raw.ends_with(']') {
        let inner = raw[1..raw.len() - 1].trim();
        if inner.contains(';') {
            let rows = inner
                .split(';')
                .map(str::trim)
                .filter(|row| !row.is_empty())
                .map(|row| row.split_whitespace().map(convert_number).collect())
                .collect();
            return HeaderValue::Matrix(rows);
        }
        return HeaderValue::Vector(inner.split_whitespace().map(convert_number).collect());
    }

    convert_number(raw)
}

fn convert_number(token: &str) -> HeaderValue {
    let token = token.trim();
    let looks_float = token.contains(&['.', 'e', 'E'][..]);
    if looks_float {
        if let Ok(v) = token.parse::<f64>() {
            return HeaderValue::Float(v);
        }
    } else if let Ok(v) = token.parse::<i64>() {
        return HeaderValue::Int(v);
    }
    HeaderValue::Text(token.to_string())
}
