//! Minute/tick aggregate samples as delivered by an ingestion feed.
//!
//! Input records look like
//! `{"c":75.09,"h":75.15,"l":73.80,"n":1,"o":74.06,"t":1577941200000,"v":135647456,"vw":74.61}`.
//! Every field is required; `n`, `t` and `v` must be integers.
//!
//! A batch is either one JSON value (an array of records, a feed response
//! with a `results` array, or a single record) or newline-delimited records.

use crate::domain::document::{Number, Row};
use crate::domain::error::StoreError;
use serde_json::{Map, Value as Json};

/// Column positions of a stored day row.
pub mod columns {
    pub const CLOSE: usize = 0;
    pub const HIGH: usize = 1;
    pub const LOW: usize = 2;
    pub const TRADE_COUNT: usize = 3;
    pub const OPEN: usize = 4;
    pub const TIMESTAMP: usize = 5;
    pub const VOLUME: usize = 6;
    pub const VWAP: usize = 7;
    pub const WIDTH: usize = 8;

    pub const NAMES: [&str; WIDTH] = [
        "close",
        "high",
        "low",
        "trade_count",
        "open",
        "timestamp_millis",
        "volume",
        "vwap",
    ];
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateSample {
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub trade_count: i64,
    pub open: f64,
    pub timestamp_millis: i64,
    pub volume: i64,
    pub volume_weighted_price: f64,
}

impl AggregateSample {
    /// Parse one JSON-encoded record.
    pub fn parse_line(line: &str) -> Result<Self, StoreError> {
        let json: Json = serde_json::from_str(line)
            .map_err(|e| StoreError::invalid_sample(format!("malformed JSON: {e}")))?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &Json) -> Result<Self, StoreError> {
        let obj = json
            .as_object()
            .ok_or_else(|| StoreError::invalid_sample("record is not a JSON object"))?;

        Ok(AggregateSample {
            close: float_field(obj, "c")?,
            high: float_field(obj, "h")?,
            low: float_field(obj, "l")?,
            trade_count: int_field(obj, "n")?,
            open: float_field(obj, "o")?,
            timestamp_millis: int_field(obj, "t")?,
            volume: int_field(obj, "v")?,
            volume_weighted_price: float_field(obj, "vw")?,
        })
    }

    /// The stored tuple, in [`columns`] order.
    pub fn to_row(&self) -> Row {
        vec![
            Number::Float(self.close),
            Number::Float(self.high),
            Number::Float(self.low),
            Number::Int(self.trade_count),
            Number::Float(self.open),
            Number::Int(self.timestamp_millis),
            Number::Int(self.volume),
            Number::Float(self.volume_weighted_price),
        ]
    }

    pub fn from_row(row: &[Number]) -> Option<Self> {
        if row.len() < columns::WIDTH {
            return None;
        }
        Some(AggregateSample {
            close: row[columns::CLOSE].as_f64(),
            high: row[columns::HIGH].as_f64(),
            low: row[columns::LOW].as_f64(),
            trade_count: row[columns::TRADE_COUNT].as_i64(),
            open: row[columns::OPEN].as_f64(),
            timestamp_millis: row[columns::TIMESTAMP].as_i64(),
            volume: row[columns::VOLUME].as_i64(),
            volume_weighted_price: row[columns::VWAP].as_f64(),
        })
    }
}

/// Parse a whole input batch. Blank lines in line-delimited input are skipped.
pub fn parse_batch(text: &str) -> Result<Vec<AggregateSample>, StoreError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if let Ok(json) = serde_json::from_str::<Json>(trimmed) {
        return batch_from_json(&json);
    }

    let mut samples = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let sample = AggregateSample::parse_line(line).map_err(|e| match e {
            StoreError::InvalidSample { reason } => {
                StoreError::invalid_sample(format!("line {}: {reason}", index + 1))
            }
            other => other,
        })?;
        samples.push(sample);
    }
    Ok(samples)
}

fn batch_from_json(json: &Json) -> Result<Vec<AggregateSample>, StoreError> {
    let records = match json {
        Json::Array(items) => items,
        Json::Object(obj) => match obj.get("results") {
            Some(Json::Array(items)) => items,
            Some(_) => return Err(StoreError::invalid_sample("'results' is not an array")),
            None => return AggregateSample::from_json(json).map(|s| vec![s]),
        },
        _ => return Err(StoreError::invalid_sample("batch is not an array or object")),
    };
    records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            AggregateSample::from_json(record).map_err(|e| match e {
                StoreError::InvalidSample { reason } => {
                    StoreError::invalid_sample(format!("record {index}: {reason}"))
                }
                other => other,
            })
        })
        .collect()
}

fn field<'a>(obj: &'a Map<String, Json>, key: &str) -> Result<&'a Json, StoreError> {
    obj.get(key)
        .ok_or_else(|| StoreError::invalid_sample(format!("missing field '{key}'")))
}

fn float_field(obj: &Map<String, Json>, key: &str) -> Result<f64, StoreError> {
    let value = field(obj, key)?;
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| StoreError::invalid_sample(format!("field '{key}' is not a number: {value}")))
}

fn int_field(obj: &Map<String, Json>, key: &str) -> Result<i64, StoreError> {
    let value = field(obj, key)?;
    value.as_i64().ok_or_else(|| {
        StoreError::invalid_sample(format!("field '{key}' is not an integer: {value}"))
    })
}
