//! Document store port.

use crate::domain::document::{Document, DocumentId, StoreId};
use crate::domain::error::StoreError;
use crate::domain::views::DocumentView;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

/// What a successful write did to the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
}

/// Identity-keyed collection of documents.
///
/// Outside a [`Transaction`], every `put` and `remove` is applied before it
/// returns. `remove` does not cascade: documents that still reference the
/// removed id are left dangling.
pub trait DocumentStore {
    fn store_id(&self) -> StoreId;

    /// A fresh, unstored document with a generated id, bound to this store.
    fn new_instance(&self, kind: &str) -> Document;

    /// A fresh, unstored document with a caller-chosen id.
    fn new_instance_with_id(&self, id: DocumentId, kind: &str) -> Document;

    fn get(&self, id: &DocumentId) -> Result<Document, StoreError>;

    fn contains(&self, id: &DocumentId) -> bool;

    /// Store `document` and write its new version back into it.
    ///
    /// Fails with `IdentityConflict` for a fresh instance whose id is already
    /// stored (or one bound to another store), `VersionConflict` for a stale
    /// version and `Locked` while another holder's lease is live.
    fn put(&self, document: &mut Document) -> Result<ChangeKind, StoreError>;

    fn remove(&self, id: &DocumentId) -> Result<(), StoreError>;

    /// Take a lease lock on `id`, creating an empty record when absent. The
    /// returned document carries the lock token.
    fn lock(&self, id: &DocumentId) -> Result<Document, StoreError>;

    fn release(&self, document: &mut Document) -> Result<(), StoreError>;

    /// Ids of all stored documents, sorted.
    fn ids(&self) -> Vec<DocumentId>;
}

impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    fn store_id(&self) -> StoreId {
        (**self).store_id()
    }

    fn new_instance(&self, kind: &str) -> Document {
        (**self).new_instance(kind)
    }

    fn new_instance_with_id(&self, id: DocumentId, kind: &str) -> Document {
        (**self).new_instance_with_id(id, kind)
    }

    fn get(&self, id: &DocumentId) -> Result<Document, StoreError> {
        (**self).get(id)
    }

    fn contains(&self, id: &DocumentId) -> bool {
        (**self).contains(id)
    }

    fn put(&self, document: &mut Document) -> Result<ChangeKind, StoreError> {
        (**self).put(document)
    }

    fn remove(&self, id: &DocumentId) -> Result<(), StoreError> {
        (**self).remove(id)
    }

    fn lock(&self, id: &DocumentId) -> Result<Document, StoreError> {
        (**self).lock(id)
    }

    fn release(&self, document: &mut Document) -> Result<(), StoreError> {
        (**self).release(document)
    }

    fn ids(&self) -> Vec<DocumentId> {
        (**self).ids()
    }
}

/// Typed instantiation on top of any store.
pub trait DocumentStoreExt: DocumentStore {
    /// A fresh, default-populated document projected as `V`.
    fn new_view<V: DocumentView<Document>>(&self) -> V {
        let mut doc = self.new_instance(V::kind());
        V::populate(doc.fields_mut());
        V::project(doc)
    }

    fn new_view_with_id<V: DocumentView<Document>>(&self, id: DocumentId) -> V {
        let mut doc = self.new_instance_with_id(id, V::kind());
        V::populate(doc.fields_mut());
        V::project(doc)
    }

    fn get_view<V: DocumentView<Document>>(&self, id: &DocumentId) -> Result<V, StoreError> {
        self.get(id).map(V::project)
    }
}

impl<T: DocumentStore + ?Sized> DocumentStoreExt for T {}

#[derive(Debug)]
enum Pending {
    Put(Document),
    Remove,
}

/// Write buffer over a store.
///
/// Repeated puts of one document inside the transaction collapse into a single
/// put on commit. Reads see the buffered state. Commit applies the buffered
/// writes in first-touch order, except that a buffered document is put only
/// after the buffered documents its fields reference. Commit stops at the
/// first failure; writes applied before the failure stay applied. Dropping
/// without commit discards the buffer.
pub struct Transaction<'a> {
    store: &'a dyn DocumentStore,
    pending: RefCell<Vec<(DocumentId, Pending)>>,
}

impl<'a> Transaction<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Transaction {
            store,
            pending: RefCell::new(Vec::new()),
        }
    }

    /// Number of distinct documents with buffered writes.
    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    fn buffer(&self, id: DocumentId, op: Pending) {
        let mut pending = self.pending.borrow_mut();
        match pending.iter_mut().find(|(pending_id, _)| *pending_id == id) {
            Some(slot) => slot.1 = op,
            None => pending.push((id, op)),
        }
    }

    pub fn commit(self) -> Result<Vec<(DocumentId, ChangeKind)>, StoreError> {
        let pending = self.pending.into_inner();
        log::debug!("committing transaction with {} buffered writes", pending.len());
        let order = commit_order(&pending);
        let mut slots: Vec<Option<(DocumentId, Pending)>> =
            pending.into_iter().map(Some).collect();
        let mut applied = Vec::with_capacity(slots.len());
        for index in order {
            let Some((id, op)) = slots[index].take() else {
                continue;
            };
            let kind = match op {
                Pending::Put(mut doc) => self.store.put(&mut doc)?,
                Pending::Remove => {
                    self.store.remove(&id)?;
                    ChangeKind::Removed
                }
            };
            applied.push((id, kind));
        }
        Ok(applied)
    }

    pub fn rollback(self) {
        log::debug!(
            "rolling back transaction with {} buffered writes",
            self.pending.borrow().len()
        );
    }
}

/// Indices of `pending` with every buffered put placed after the buffered puts
/// it references. Reference cycles fall back to first-touch order.
fn commit_order(pending: &[(DocumentId, Pending)]) -> Vec<usize> {
    fn visit(
        index: usize,
        pending: &[(DocumentId, Pending)],
        positions: &HashMap<&DocumentId, usize>,
        state: &mut [Visit],
        order: &mut Vec<usize>,
    ) {
        if state[index] != Visit::New {
            return;
        }
        state[index] = Visit::Active;
        if let Pending::Put(doc) = &pending[index].1 {
            for referenced in doc.fields().references() {
                if let Some(&child) = positions.get(referenced) {
                    visit(child, pending, positions, state, order);
                }
            }
        }
        state[index] = Visit::Done;
        order.push(index);
    }

    let positions: HashMap<&DocumentId, usize> = pending
        .iter()
        .enumerate()
        .filter(|(_, (_, op))| matches!(op, Pending::Put(_)))
        .map(|(index, (id, _))| (id, index))
        .collect();
    let mut state = vec![Visit::New; pending.len()];
    let mut order = Vec::with_capacity(pending.len());
    for index in 0..pending.len() {
        visit(index, pending, &positions, &mut state, &mut order);
    }
    order
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    Active,
    Done,
}

impl DocumentStore for Transaction<'_> {
    fn store_id(&self) -> StoreId {
        self.store.store_id()
    }

    fn new_instance(&self, kind: &str) -> Document {
        self.store.new_instance(kind)
    }

    fn new_instance_with_id(&self, id: DocumentId, kind: &str) -> Document {
        self.store.new_instance_with_id(id, kind)
    }

    fn get(&self, id: &DocumentId) -> Result<Document, StoreError> {
        match self.pending.borrow().iter().find(|(pending_id, _)| pending_id == id) {
            Some((_, Pending::Put(doc))) => Ok(doc.clone()),
            Some((_, Pending::Remove)) => Err(StoreError::NotFound { id: id.clone() }),
            None => self.store.get(id),
        }
    }

    fn contains(&self, id: &DocumentId) -> bool {
        match self.pending.borrow().iter().find(|(pending_id, _)| pending_id == id) {
            Some((_, Pending::Put(_))) => true,
            Some((_, Pending::Remove)) => false,
            None => self.store.contains(id),
        }
    }

    /// Buffers the write. The document's version is left unchanged until commit.
    fn put(&self, document: &mut Document) -> Result<ChangeKind, StoreError> {
        if document.store_id() != self.store.store_id() {
            return Err(StoreError::IdentityConflict {
                id: document.id().clone(),
                reason: format!("document is bound to store {}", document.store_id()),
            });
        }
        StoreError::check_finite(document)?;
        let kind = if document.is_stored() || self.store.contains(document.id()) {
            ChangeKind::Updated
        } else {
            ChangeKind::Created
        };
        self.buffer(document.id().clone(), Pending::Put(document.clone()));
        Ok(kind)
    }

    fn remove(&self, id: &DocumentId) -> Result<(), StoreError> {
        if !self.contains(id) {
            return Err(StoreError::NotFound { id: id.clone() });
        }
        if !self.store.contains(id) {
            // only ever buffered here; nothing to remove underneath
            self.pending.borrow_mut().retain(|(pending_id, _)| pending_id != id);
            return Ok(());
        }
        self.buffer(id.clone(), Pending::Remove);
        Ok(())
    }

    fn lock(&self, id: &DocumentId) -> Result<Document, StoreError> {
        self.store.lock(id)
    }

    fn release(&self, document: &mut Document) -> Result<(), StoreError> {
        self.store.release(document)
    }

    fn ids(&self) -> Vec<DocumentId> {
        let mut ids = self.store.ids();
        for (id, op) in self.pending.borrow().iter() {
            match op {
                Pending::Put(_) => ids.push(id.clone()),
                Pending::Remove => ids.retain(|existing| existing != id),
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }
}
