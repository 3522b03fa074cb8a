//! Whole-store snapshot file.
//!
//! One JSON document holding every stored record. Writes go to a sibling
//! temporary file which is synced and then renamed over the previous
//! snapshot, so a reader sees either the old or the new checkpoint.

use crate::domain::document::{DocumentId, Fields, StoreId};
use crate::domain::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const FORMAT: &str = "tickstore-snapshot";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub id: DocumentId,
    pub kind: String,
    pub version: u64,
    pub fields: Fields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    format: String,
    format_version: u32,
    pub store_id: StoreId,
    pub written_at: DateTime<Utc>,
    pub documents: Vec<SnapshotDocument>,
}

impl Snapshot {
    pub fn new(store_id: StoreId, documents: Vec<SnapshotDocument>) -> Self {
        Snapshot {
            format: FORMAT.to_string(),
            format_version: FORMAT_VERSION,
            store_id,
            written_at: Utc::now(),
            documents,
        }
    }

    pub fn read(path: &Path, buffer_size: usize) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        let reader = BufReader::with_capacity(buffer_size, file);
        let snapshot: Snapshot =
            serde_json::from_reader(reader).map_err(|e| corrupt(path, e.to_string()))?;

        if snapshot.format != FORMAT {
            return Err(corrupt(
                path,
                format!("unexpected format tag '{}'", snapshot.format),
            ));
        }
        if snapshot.format_version != FORMAT_VERSION {
            return Err(corrupt(
                path,
                format!("unsupported format version {}", snapshot.format_version),
            ));
        }
        let mut seen = HashSet::with_capacity(snapshot.documents.len());
        for doc in &snapshot.documents {
            if !seen.insert(&doc.id) {
                return Err(corrupt(path, format!("duplicate document id {}", doc.id)));
            }
        }
        Ok(snapshot)
    }

    pub fn write(&self, path: &Path, buffer_size: usize) -> Result<(), StoreError> {
        let tmp = temp_path(path);
        let result = self.write_to(&tmp, buffer_size).and_then(|()| {
            fs::rename(&tmp, path)?;
            Ok(())
        });
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
            return result;
        }
        if let Some(parent) = path.parent() {
            // directory fsync makes the rename durable; not supported everywhere
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn write_to(&self, tmp: &Path, buffer_size: usize) -> Result<(), StoreError> {
        let file = File::create(tmp)?;
        let mut writer = BufWriter::with_capacity(buffer_size, file);
        serde_json::to_writer(&mut writer, self).map_err(std::io::Error::from)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn corrupt(path: &Path, reason: String) -> StoreError {
    StoreError::CorruptSnapshot {
        path: path.display().to_string(),
        reason,
    }
}
