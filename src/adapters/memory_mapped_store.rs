//! In-process document store with whole-store snapshot persistence.
//!
//! All reads and writes hit the working set held in memory; nothing touches
//! disk until [`MemoryMappedDocumentStore::checkpoint`] or
//! [`MemoryMappedDocumentStore::close`]. Writes since the last checkpoint are
//! lost if the process dies.

use crate::adapters::snapshot::{Snapshot, SnapshotDocument};
use crate::domain::config::StoreConfig;
use crate::domain::document::{Document, DocumentId, Fields, LockToken, StoreId};
use crate::domain::error::StoreError;
use crate::ports::document_store::{ChangeKind, DocumentStore};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Instant;

/// Kind given to placeholder records created by locking an absent id.
const PLACEHOLDER_KIND: &str = "document";

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: LockToken,
    until: Instant,
}

impl Lease {
    fn is_live(&self) -> bool {
        Instant::now() < self.until
    }
}

#[derive(Debug)]
struct Record {
    kind: String,
    /// 0 for a placeholder that was locked but never put.
    version: u64,
    fields: Fields,
    lease: Option<Lease>,
}

impl Record {
    fn live_lease(&self) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| l.is_live())
    }

    fn is_stored(&self) -> bool {
        self.version > 0
    }

    fn blocks(&self, token: Option<LockToken>) -> bool {
        self.live_lease().is_some_and(|l| Some(l.token) != token)
    }
}

#[derive(Debug)]
struct WorkingSet {
    records: HashMap<DocumentId, Record>,
    dirty: bool,
    closed: bool,
}

impl WorkingSet {
    fn stored(&self) -> impl Iterator<Item = (&DocumentId, &Record)> {
        self.records.iter().filter(|(_, r)| r.is_stored())
    }

    fn stored_record(&self, id: &DocumentId) -> Option<&Record> {
        self.records.get(id).filter(|r| r.is_stored())
    }
}

pub struct MemoryMappedDocumentStore {
    id: StoreId,
    config: StoreConfig,
    state: RwLock<WorkingSet>,
}

fn closed_error() -> StoreError {
    StoreError::Io(std::io::Error::other("document store is closed"))
}

impl MemoryMappedDocumentStore {
    /// Load the snapshot under `config.path`, or start empty when there is none.
    ///
    /// A snapshot that exists but cannot be read or parsed is an error; the
    /// store is never opened in a partial state.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.path)?;
        let snapshot_path = config.snapshot_path();

        let (id, records) = if snapshot_path.exists() {
            let snapshot = Snapshot::read(&snapshot_path, config.segment_size)?;
            let mut records =
                HashMap::with_capacity(config.capacity_hint.max(snapshot.documents.len()));
            for doc in snapshot.documents {
                records.insert(
                    doc.id,
                    Record {
                        kind: doc.kind,
                        version: doc.version,
                        fields: doc.fields,
                        lease: None,
                    },
                );
            }
            log::info!(
                "opened document store {} with {} documents from {}",
                snapshot.store_id,
                records.len(),
                snapshot_path.display()
            );
            (snapshot.store_id, records)
        } else {
            let id = StoreId::generate();
            log::info!(
                "initialized empty document store {} at {}",
                id,
                config.path.display()
            );
            (id, HashMap::with_capacity(config.capacity_hint))
        };

        Ok(MemoryMappedDocumentStore {
            id,
            config,
            state: RwLock::new(WorkingSet {
                records,
                dirty: false,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of stored documents. Lock placeholders are not counted.
    pub fn len(&self) -> usize {
        let state = self.state.read();
        if state.closed {
            return 0;
        }
        state.stored().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when there are writes not yet captured by a checkpoint.
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Write the whole working set to the snapshot file and keep the store open.
    ///
    /// Concurrent readers proceed; writers wait until the snapshot is on disk.
    /// Transient I/O failures are retried `flush_retries` times with a
    /// linearly growing backoff.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let state = self.state.upgradable_read();
        if state.closed {
            return Err(closed_error());
        }
        self.write_snapshot(&state)?;
        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.dirty = false;
        Ok(())
    }

    /// Checkpoint, then refuse all further operations.
    pub fn close(&self) -> Result<(), StoreError> {
        let state = self.state.upgradable_read();
        if state.closed {
            return Ok(());
        }
        self.write_snapshot(&state)?;
        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.dirty = false;
        state.closed = true;
        log::info!("closed document store {}", self.id);
        Ok(())
    }

    fn write_snapshot(&self, state: &WorkingSet) -> Result<(), StoreError> {
        let mut documents: Vec<SnapshotDocument> = state
            .stored()
            .map(|(id, r)| SnapshotDocument {
                id: id.clone(),
                kind: r.kind.clone(),
                version: r.version,
                fields: r.fields.clone(),
            })
            .collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        let count = documents.len();
        let snapshot = Snapshot::new(self.id, documents);
        let path = self.config.snapshot_path();

        let mut attempt = 0;
        loop {
            match snapshot.write(&path, self.config.segment_size) {
                Ok(()) => {
                    log::info!("checkpointed {} documents to {}", count, path.display());
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.config.flush_retries => {
                    attempt += 1;
                    let delay = self.config.flush_backoff * attempt;
                    log::warn!(
                        "snapshot write to {} failed ({}), retry {}/{} in {:?}",
                        path.display(),
                        e,
                        attempt,
                        self.config.flush_retries,
                        delay
                    );
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl DocumentStore for MemoryMappedDocumentStore {
    fn store_id(&self) -> StoreId {
        self.id
    }

    fn new_instance(&self, kind: &str) -> Document {
        Document::new(DocumentId::generate(), self.id, kind)
    }

    fn new_instance_with_id(&self, id: DocumentId, kind: &str) -> Document {
        Document::new(id, self.id, kind)
    }

    fn get(&self, id: &DocumentId) -> Result<Document, StoreError> {
        let state = self.state.read();
        if state.closed {
            return Err(closed_error());
        }
        let record = state
            .stored_record(id)
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
        Ok(Document::restore(
            id.clone(),
            self.id,
            record.kind.clone(),
            record.version,
            record.fields.clone(),
        ))
    }

    fn contains(&self, id: &DocumentId) -> bool {
        let state = self.state.read();
        !state.closed && state.stored_record(id).is_some()
    }

    fn put(&self, document: &mut Document) -> Result<ChangeKind, StoreError> {
        if document.store_id() != self.id {
            return Err(StoreError::IdentityConflict {
                id: document.id().clone(),
                reason: format!("document is bound to store {}", document.store_id()),
            });
        }
        StoreError::check_finite(document)?;

        let mut state = self.state.write();
        if state.closed {
            return Err(closed_error());
        }
        let id = document.id().clone();

        let (kind, version) = match state.records.get_mut(&id) {
            None => {
                if document.version() != 0 {
                    return Err(StoreError::VersionConflict {
                        id,
                        expected: 0,
                        found: document.version(),
                    });
                }
                state.records.insert(
                    id.clone(),
                    Record {
                        kind: document.kind().to_string(),
                        version: 1,
                        fields: document.fields().clone(),
                        lease: None,
                    },
                );
                (ChangeKind::Created, 1)
            }
            Some(record) => {
                if record.blocks(document.lock_token()) {
                    return Err(StoreError::Locked { id });
                }
                if document.version() != record.version {
                    if document.version() == 0 {
                        return Err(StoreError::IdentityConflict {
                            id,
                            reason: "a different document with this id is already stored"
                                .into(),
                        });
                    }
                    return Err(StoreError::VersionConflict {
                        id,
                        expected: record.version,
                        found: document.version(),
                    });
                }
                let kind = if record.version == 0 {
                    record.kind = document.kind().to_string();
                    ChangeKind::Created
                } else {
                    ChangeKind::Updated
                };
                record.version += 1;
                record.fields = document.fields().clone();
                // a put by the holder ends the lease
                record.lease = None;
                (kind, record.version)
            }
        };

        state.dirty = true;
        drop(state);

        document.set_version(version);
        document.set_lock(None);
        log::debug!("put {} ({:?}) at version {}", id, kind, version);
        Ok(kind)
    }

    fn remove(&self, id: &DocumentId) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(closed_error());
        }
        match state.records.get(id) {
            None => return Err(StoreError::NotFound { id: id.clone() }),
            Some(record) if !record.is_stored() => {
                return Err(StoreError::NotFound { id: id.clone() });
            }
            Some(record) if record.blocks(None) => {
                return Err(StoreError::Locked { id: id.clone() });
            }
            Some(_) => {}
        }
        state.records.remove(id);
        state.dirty = true;
        log::debug!("removed {}", id);
        Ok(())
    }

    fn lock(&self, id: &DocumentId) -> Result<Document, StoreError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(closed_error());
        }
        let record = state.records.entry(id.clone()).or_insert_with(|| Record {
            kind: PLACEHOLDER_KIND.to_string(),
            version: 0,
            fields: Fields::new(),
            lease: None,
        });
        if record.live_lease().is_some() {
            return Err(StoreError::Locked { id: id.clone() });
        }
        let token = LockToken::generate();
        record.lease = Some(Lease {
            token,
            until: Instant::now() + self.config.lock_lease,
        });
        let mut doc = Document::restore(
            id.clone(),
            self.id,
            record.kind.clone(),
            record.version,
            record.fields.clone(),
        );
        doc.set_lock(Some(token));
        log::debug!("locked {} for {:?}", id, self.config.lock_lease);
        Ok(doc)
    }

    fn release(&self, document: &mut Document) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(closed_error());
        }
        let id = document.id();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
        if record.blocks(document.lock_token()) {
            return Err(StoreError::Locked { id: id.clone() });
        }
        record.lease = None;
        document.set_lock(None);
        Ok(())
    }

    fn ids(&self) -> Vec<DocumentId> {
        let state = self.state.read();
        if state.closed {
            return Vec::new();
        }
        let mut ids: Vec<DocumentId> = state.stored().map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids
    }
}

impl Drop for MemoryMappedDocumentStore {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.dirty && !state.closed {
            log::warn!(
                "document store {} dropped with unsaved changes at {}",
                self.id,
                self.config.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::document::Value;
    use std::time::Duration;

    fn open(dir: &Path) -> MemoryMappedDocumentStore {
        MemoryMappedDocumentStore::open(StoreConfig::new(dir)).unwrap()
    }

    #[test]
    fn put_assigns_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut doc = store.new_instance("equity");
        assert_eq!(store.put(&mut doc).unwrap(), ChangeKind::Created);
        assert_eq!(doc.version(), 1);
        doc.set("symbol", Value::Text("AAPL".into()));
        assert_eq!(store.put(&mut doc).unwrap(), ChangeKind::Updated);
        assert_eq!(doc.version(), 2);

        let fetched = store.get(doc.id()).unwrap();
        assert_eq!(fetched.version(), 2);
        assert_eq!(fetched.get("symbol").and_then(Value::as_str), Some("AAPL"));
        assert_eq!(fetched.kind(), "equity");
        assert!(store.is_dirty());
    }

    #[test]
    fn get_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        assert!(matches!(
            store.get(&DocumentId::from("nope")),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn fresh_instance_with_taken_id_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut first = store.new_instance_with_id(DocumentId::from("AAPL"), "equity");
        store.put(&mut first).unwrap();
        let mut second = store.new_instance_with_id(DocumentId::from("AAPL"), "equity");
        assert!(matches!(
            store.put(&mut second),
            Err(StoreError::IdentityConflict { .. })
        ));
    }

    #[test]
    fn foreign_document_conflicts() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let store_a = open(a.path());
        let store_b = open(b.path());
        let mut doc = store_a.new_instance("equity");
        assert!(matches!(
            store_b.put(&mut doc),
            Err(StoreError::IdentityConflict { .. })
        ));
    }

    #[test]
    fn stale_version_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut doc = store.new_instance("equity");
        store.put(&mut doc).unwrap();
        let mut stale = store.get(doc.id()).unwrap();
        store.put(&mut doc).unwrap();
        match store.put(&mut stale) {
            Err(StoreError::VersionConflict {
                expected, found, ..
            }) => {
                assert_eq!(expected, 2);
                assert_eq!(found, 1);
            }
            other => panic!("expected VersionConflict, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_float_is_rejected_and_store_reopens() {
        use crate::domain::document::Number;

        let dir = tempfile::tempdir().unwrap();
        let doc_id = {
            let store = open(dir.path());
            let mut doc = store.new_instance("equity");
            doc.set("ratio", Value::Float(0.5));
            store.put(&mut doc).unwrap();

            doc.set("ratio", Value::Float(f64::NAN));
            assert!(matches!(
                store.put(&mut doc),
                Err(StoreError::InvalidValue { .. })
            ));
            doc.set("ratio", Value::Float(0.5));
            doc.fields_mut()
                .rows_mut("values")
                .push(vec![Number::Float(f64::NEG_INFINITY)]);
            assert!(matches!(
                store.put(&mut doc),
                Err(StoreError::InvalidValue { .. })
            ));
            assert_eq!(doc.version(), 1);
            store.close().unwrap();
            doc.id().clone()
        };

        let reopened = open(dir.path());
        let doc = reopened.get(&doc_id).unwrap();
        assert_eq!(doc.version(), 1);
        assert_eq!(doc.get("ratio"), Some(&Value::Float(0.5)));
        assert!(doc.get("values").is_none());
    }

    #[test]
    fn remove_then_get_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut doc = store.new_instance("equity");
        store.put(&mut doc).unwrap();
        store.remove(doc.id()).unwrap();
        assert!(!store.contains(doc.id()));
        assert!(matches!(
            store.remove(doc.id()),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn lease_blocks_other_writers() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut doc = store.new_instance("equity");
        store.put(&mut doc).unwrap();

        let mut held = store.lock(doc.id()).unwrap();
        assert!(held.lock_token().is_some());
        assert!(matches!(store.put(&mut doc), Err(StoreError::Locked { .. })));
        assert!(matches!(store.remove(doc.id()), Err(StoreError::Locked { .. })));
        assert!(matches!(store.lock(doc.id()), Err(StoreError::Locked { .. })));

        store.put(&mut held).unwrap();
        assert!(held.lock_token().is_none());
        // lease ended by the holder's put; the caller's copy is now stale
        assert!(matches!(
            store.put(&mut doc),
            Err(StoreError::VersionConflict { .. })
        ));
    }

    #[test]
    fn release_ends_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut doc = store.new_instance("equity");
        store.put(&mut doc).unwrap();
        let mut held = store.lock(doc.id()).unwrap();
        store.release(&mut held).unwrap();
        store.put(&mut doc).unwrap();
    }

    #[test]
    fn expired_lease_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path()).with_lock_lease(Duration::from_millis(1));
        let store = MemoryMappedDocumentStore::open(config).unwrap();
        let mut doc = store.new_instance("equity");
        store.put(&mut doc).unwrap();
        let _held = store.lock(doc.id()).unwrap();
        thread::sleep(Duration::from_millis(10));
        store.put(&mut doc).unwrap();
    }

    #[test]
    fn lock_on_absent_id_creates_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let id = DocumentId::from("AAPL");
        let mut held = store.lock(&id).unwrap();
        assert_eq!(held.version(), 0);
        held.set("symbol", Value::Text("AAPL".into()));
        assert_eq!(store.put(&mut held).unwrap(), ChangeKind::Created);
        assert_eq!(held.version(), 1);
    }

    #[test]
    fn placeholders_are_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut doc = store.new_instance("equity");
        store.put(&mut doc).unwrap();
        let ghost = DocumentId::from("ghost");
        let _held = store.lock(&ghost).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.ids(), vec![doc.id().clone()]);
        assert!(!store.contains(&ghost));
        assert!(matches!(store.get(&ghost), Err(StoreError::NotFound { .. })));
        assert!(matches!(store.remove(&ghost), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn closed_store_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut doc = store.new_instance("equity");
        store.put(&mut doc).unwrap();
        store.close().unwrap();
        assert!(store.is_empty());
        assert!(store.ids().is_empty());
        assert!(!store.contains(doc.id()));
    }

    #[test]
    fn checkpoint_and_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (store_id, doc_id) = {
            let store = open(dir.path());
            let mut doc = store.new_instance("equity");
            doc.set("symbol", Value::Text("AAPL".into()));
            store.put(&mut doc).unwrap();
            store.checkpoint().unwrap();
            assert!(!store.is_dirty());
            (store.store_id(), doc.id().clone())
        };

        let reopened = open(dir.path());
        assert_eq!(reopened.store_id(), store_id);
        let doc = reopened.get(&doc_id).unwrap();
        assert_eq!(doc.version(), 1);
        assert_eq!(doc.get("symbol").and_then(Value::as_str), Some("AAPL"));
    }

    #[test]
    fn placeholders_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.lock(&DocumentId::from("ghost")).unwrap();
            store.close().unwrap();
        }
        assert!(open(dir.path()).is_empty());
    }

    #[test]
    fn closed_store_refuses_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let mut doc = store.new_instance("equity");
        store.put(&mut doc).unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.get(doc.id()), Err(StoreError::Io(_))));
        assert!(matches!(store.put(&mut doc), Err(StoreError::Io(_))));
        assert!(matches!(store.checkpoint(), Err(StoreError::Io(_))));
        store.close().unwrap();
    }

    #[test]
    fn corrupt_snapshot_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path());
        fs::write(config.snapshot_path(), b"garbage").unwrap();
        assert!(matches!(
            MemoryMappedDocumentStore::open(config),
            Err(StoreError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn checkpoint_failure_is_reported_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path()).with_flush_retries(2, Duration::ZERO);
        let store = MemoryMappedDocumentStore::open(config).unwrap();
        let mut doc = store.new_instance("equity");
        store.put(&mut doc).unwrap();
        // replace the directory with a file so every write attempt fails
        fs::remove_dir_all(dir.path()).unwrap();
        fs::write(dir.path(), b"").unwrap();
        assert!(matches!(store.checkpoint(), Err(StoreError::Io(_))));
        assert!(store.is_dirty());
        fs::remove_file(dir.path()).unwrap();
    }
}
