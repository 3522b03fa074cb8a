//! Calendar used to bucket samples into years and days.
//!
//! Buckets are computed at a fixed UTC offset chosen by configuration, never
//! the host's local timezone, so the same sample always lands in the same day.

use crate::domain::error::StoreError;
use chrono::{DateTime, Datelike, FixedOffset, Offset, Utc};

const MAX_OFFSET_MINUTES: i32 = 23 * 60 + 59;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calendar {
    offset: FixedOffset,
}

/// Year / day-of-year bucket for one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DayKey {
    pub year: i32,
    /// 1-based day of year (1..=366).
    pub day_of_year: u32,
}

impl DayKey {
    pub fn year_key(&self) -> String {
        format!("{:04}", self.year)
    }

    pub fn day_key(&self) -> String {
        self.day_of_year.to_string()
    }
}

impl Default for Calendar {
    fn default() -> Self {
        Calendar::utc()
    }
}

impl Calendar {
    pub fn utc() -> Self {
        Calendar {
            offset: Utc.fix(),
        }
    }

    /// Offset east of UTC, in minutes (negative for west).
    pub fn with_offset_minutes(minutes: i32) -> Result<Self, StoreError> {
        if !(-MAX_OFFSET_MINUTES..=MAX_OFFSET_MINUTES).contains(&minutes) {
            return Err(StoreError::ConfigInvalid {
                section: "calendar".into(),
                key: "utc_offset_minutes".into(),
                reason: format!("offset {minutes} outside ±{MAX_OFFSET_MINUTES} minutes"),
            });
        }
        let offset =
            FixedOffset::east_opt(minutes * 60).ok_or_else(|| StoreError::ConfigInvalid {
                section: "calendar".into(),
                key: "utc_offset_minutes".into(),
                reason: format!("offset {minutes} is not representable"),
            })?;
        Ok(Calendar { offset })
    }

    pub fn offset_minutes(&self) -> i32 {
        self.offset.local_minus_utc() / 60
    }

    pub fn day_key(&self, timestamp_millis: i64) -> Result<DayKey, StoreError> {
        let utc = DateTime::from_timestamp_millis(timestamp_millis).ok_or_else(|| {
            StoreError::invalid_sample(format!("timestamp {timestamp_millis} out of range"))
        })?;
        let local = utc.with_timezone(&self.offset);
        Ok(DayKey {
            year: local.year(),
            day_of_year: local.ordinal(),
        })
    }
}
