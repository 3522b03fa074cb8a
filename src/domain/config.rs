//! Store configuration.
//!
//! Read from the `[store]` and `[calendar]` sections of a [`ConfigPort`].
//! Only `[store] path` is required.

use crate::domain::calendar::Calendar;
use crate::domain::error::StoreError;
use crate::ports::config_port::ConfigPort;
use std::path::PathBuf;
use std::time::Duration;

pub const SNAPSHOT_FILE_NAME: &str = "documents.snapshot.json";

pub const DEFAULT_CAPACITY_HINT: usize = 1024;
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;
pub const DEFAULT_LOCK_LEASE_MS: u64 = 60_000;
pub const DEFAULT_FLUSH_RETRIES: u32 = 3;
pub const DEFAULT_FLUSH_BACKOFF_MS: u64 = 50;

const MAX_FLUSH_RETRIES: i64 = 10;
const MAX_CAPACITY_HINT: i64 = 1 << 24;
const MAX_SEGMENT_SIZE: i64 = 64 * 1024 * 1024;
const MAX_LOCK_LEASE_MS: i64 = 24 * 60 * 60 * 1000;
const MAX_FLUSH_BACKOFF_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Base directory holding the snapshot file.
    pub path: PathBuf,
    /// Expected number of documents, used to presize the working set.
    pub capacity_hint: usize,
    /// Buffer size for snapshot reads and writes, in bytes.
    pub segment_size: usize,
    pub lock_lease: Duration,
    /// Extra attempts after a failed snapshot write.
    pub flush_retries: u32,
    /// Delay before the first retry; grows linearly per attempt.
    pub flush_backoff: Duration,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            path: path.into(),
            capacity_hint: DEFAULT_CAPACITY_HINT,
            segment_size: DEFAULT_SEGMENT_SIZE,
            lock_lease: Duration::from_millis(DEFAULT_LOCK_LEASE_MS),
            flush_retries: DEFAULT_FLUSH_RETRIES,
            flush_backoff: Duration::from_millis(DEFAULT_FLUSH_BACKOFF_MS),
        }
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_flush_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.flush_retries = retries;
        self.flush_backoff = backoff;
        self
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE_NAME)
    }

    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, StoreError> {
        let path = config.require_string("store", "path")?;

        let capacity_hint = bounded(
            config.get_int("store", "capacity_hint", DEFAULT_CAPACITY_HINT as i64),
            "capacity_hint",
            0,
            MAX_CAPACITY_HINT,
        )?;
        let segment_size = bounded(
            config.get_int("store", "segment_size", DEFAULT_SEGMENT_SIZE as i64),
            "segment_size",
            1,
            MAX_SEGMENT_SIZE,
        )?;
        let lock_lease_ms = bounded(
            config.get_int("store", "lock_lease_ms", DEFAULT_LOCK_LEASE_MS as i64),
            "lock_lease_ms",
            1,
            MAX_LOCK_LEASE_MS,
        )?;
        let flush_retries = bounded(
            config.get_int("store", "flush_retries", DEFAULT_FLUSH_RETRIES as i64),
            "flush_retries",
            0,
            MAX_FLUSH_RETRIES,
        )?;
        let flush_backoff_ms = bounded(
            config.get_int("store", "flush_backoff_ms", DEFAULT_FLUSH_BACKOFF_MS as i64),
            "flush_backoff_ms",
            0,
            MAX_FLUSH_BACKOFF_MS,
        )?;

        Ok(StoreConfig {
            path: PathBuf::from(path),
            capacity_hint,
            segment_size,
            lock_lease: Duration::from_millis(lock_lease_ms as u64),
            flush_retries: flush_retries as u32,
            flush_backoff: Duration::from_millis(flush_backoff_ms as u64),
        })
    }
}

/// The bucketing calendar from `[calendar] utc_offset_minutes` (default UTC).
pub fn calendar_from_config(config: &dyn ConfigPort) -> Result<Calendar, StoreError> {
    let minutes = config.get_int("calendar", "utc_offset_minutes", 0);
    let minutes = i32::try_from(minutes).map_err(|_| StoreError::ConfigInvalid {
        section: "calendar".into(),
        key: "utc_offset_minutes".into(),
        reason: format!("offset {minutes} is out of range"),
    })?;
    Calendar::with_offset_minutes(minutes)
}

fn invalid(key: &str, reason: String) -> StoreError {
    StoreError::ConfigInvalid {
        section: "store".into(),
        key: key.into(),
        reason,
    }
}

fn bounded(value: i64, key: &str, min: i64, max: i64) -> Result<usize, StoreError> {
    if !(min..=max).contains(&value) {
        return Err(invalid(
            key,
            format!("{key} must be between {min} and {max}, got {value}"),
        ));
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapConfig(HashMap<(String, String), String>);

    impl MapConfig {
        fn new(entries: &[(&str, &str, &str)]) -> Self {
            MapConfig(
                entries
                    .iter()
                    .map(|(s, k, v)| ((s.to_string(), k.to_string()), v.to_string()))
                    .collect(),
            )
        }
    }

    impl ConfigPort for MapConfig {
        fn get_string(&self, section: &str, key: &str) -> Option<String> {
            self.0.get(&(section.to_string(), key.to_string())).cloned()
        }
        fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
            self.get_string(section, key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
    }

    #[test]
    fn defaults_apply_when_only_path_given() {
        let config = StoreConfig::from_config(&MapConfig::new(&[("store", "path", "/data/ticks")]))
            .unwrap();
        assert_eq!(config, StoreConfig::new("/data/ticks"));
        assert_eq!(
            config.snapshot_path(),
            PathBuf::from("/data/ticks").join(SNAPSHOT_FILE_NAME)
        );
    }

    #[test]
    fn missing_path_is_reported() {
        let result = StoreConfig::from_config(&MapConfig::new(&[]));
        match result {
            Err(StoreError::ConfigMissing { section, key }) => {
                assert_eq!(section, "store");
                assert_eq!(key, "path");
            }
            other => panic!("expected ConfigMissing, got {other:?}"),
        }
    }

    #[test]
    fn blank_path_is_missing() {
        let result = StoreConfig::from_config(&MapConfig::new(&[("store", "path", "   ")]));
        assert!(matches!(result, Err(StoreError::ConfigMissing { .. })));
    }

    #[test]
    fn tuning_knobs_are_read() {
        let config = StoreConfig::from_config(&MapConfig::new(&[
            ("store", "path", "/data"),
            ("store", "capacity_hint", "10"),
            ("store", "segment_size", "4096"),
            ("store", "lock_lease_ms", "500"),
            ("store", "flush_retries", "0"),
            ("store", "flush_backoff_ms", "0"),
        ]))
        .unwrap();
        assert_eq!(config.capacity_hint, 10);
        assert_eq!(config.segment_size, 4096);
        assert_eq!(config.lock_lease, Duration::from_millis(500));
        assert_eq!(config.flush_retries, 0);
        assert_eq!(config.flush_backoff, Duration::ZERO);
    }

    #[test]
    fn rejects_non_positive_segment_size() {
        let result = StoreConfig::from_config(&MapConfig::new(&[
            ("store", "path", "/data"),
            ("store", "segment_size", "0"),
        ]));
        assert!(matches!(
            result,
            Err(StoreError::ConfigInvalid { key, .. }) if key == "segment_size"
        ));
    }

    #[test]
    fn rejects_excessive_retries() {
        let result = StoreConfig::from_config(&MapConfig::new(&[
            ("store", "path", "/data"),
            ("store", "flush_retries", "11"),
        ]));
        assert!(matches!(
            result,
            Err(StoreError::ConfigInvalid { key, .. }) if key == "flush_retries"
        ));
    }

    #[test]
    fn rejects_oversized_buffers_and_leases() {
        for (key, value) in [
            ("capacity_hint", "9223372036854775807"),
            ("segment_size", "1099511627776"),
            ("lock_lease_ms", "9223372036854775807"),
            ("flush_backoff_ms", "3600000"),
        ] {
            let result = StoreConfig::from_config(&MapConfig::new(&[
                ("store", "path", "/data"),
                ("store", key, value),
            ]));
            assert!(
                matches!(&result, Err(StoreError::ConfigInvalid { key: k, .. }) if k == key),
                "{key} = {value} gave {result:?}"
            );
        }
    }

    #[test]
    fn calendar_offset_at_i32_min_is_rejected() {
        let result = calendar_from_config(&MapConfig::new(&[(
            "calendar",
            "utc_offset_minutes",
            "-2147483648",
        )]));
        assert!(matches!(result, Err(StoreError::ConfigInvalid { .. })));
    }

    #[test]
    fn calendar_defaults_to_utc() {
        let calendar = calendar_from_config(&MapConfig::new(&[])).unwrap();
        assert_eq!(calendar, Calendar::utc());
    }

    #[test]
    fn calendar_offset_is_read() {
        let calendar =
            calendar_from_config(&MapConfig::new(&[("calendar", "utc_offset_minutes", "-300")]))
                .unwrap();
        assert_eq!(calendar.offset_minutes(), -300);
    }

    #[test]
    fn calendar_offset_out_of_range() {
        let result =
            calendar_from_config(&MapConfig::new(&[("calendar", "utc_offset_minutes", "5000")]));
        assert!(matches!(result, Err(StoreError::ConfigInvalid { .. })));
    }
}
