//! Change notification over any [`DocumentStore`].
//!
//! Listeners run synchronously on the writer's thread, after the wrapped
//! store has applied the write. Notifications for one store are delivered in
//! write order. A listener that fails or panics is reported to the
//! [`FaultSink`] and never fails the write that triggered it.

use crate::domain::document::{Document, DocumentId, StoreId};
use crate::domain::error::StoreError;
use crate::ports::document_store::{ChangeKind, DocumentStore};
use parking_lot::{ReentrantMutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub store_id: StoreId,
    pub document_id: DocumentId,
    pub kind: ChangeKind,
}

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

pub trait DocumentListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError>;
}

impl<F> DocumentListener for F
where
    F: Fn(&ChangeEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Handle returned on registration, used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerScope {
    AllDocuments,
    Document(DocumentId),
}

impl ListenerScope {
    fn matches(&self, id: &DocumentId) -> bool {
        match self {
            ListenerScope::AllDocuments => true,
            ListenerScope::Document(scoped) => scoped == id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerFault {
    pub listener: ListenerHandle,
    pub event: ChangeEvent,
    pub message: String,
}

/// Destination for listener failures.
pub trait FaultSink: Send + Sync {
    fn report(&self, fault: ListenerFault);
}

/// Reports listener faults through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFaultSink;

impl FaultSink for LogFaultSink {
    fn report(&self, fault: ListenerFault) {
        log::error!(
            "listener {:?} failed on {:?} of {}: {}",
            fault.listener,
            fault.event.kind,
            fault.event.document_id,
            fault.message
        );
    }
}

struct Registration {
    handle: ListenerHandle,
    scope: ListenerScope,
    listener: Arc<dyn DocumentListener>,
}

pub struct ObservableDocumentStore<S> {
    inner: S,
    listeners: RwLock<Vec<Registration>>,
    next_handle: AtomicU64,
    faults: Arc<dyn FaultSink>,
    // held across write + dispatch; reentrant so listeners may write back
    write_order: ReentrantMutex<()>,
}

impl<S: DocumentStore> ObservableDocumentStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_fault_sink(inner, Arc::new(LogFaultSink))
    }

    pub fn with_fault_sink(inner: S, faults: Arc<dyn FaultSink>) -> Self {
        ObservableDocumentStore {
            inner,
            listeners: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            faults,
            write_order: ReentrantMutex::new(()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn add_listener(&self, listener: impl DocumentListener + 'static) -> ListenerHandle {
        self.register(ListenerScope::AllDocuments, Arc::new(listener))
    }

    pub fn add_document_listener(
        &self,
        id: DocumentId,
        listener: impl DocumentListener + 'static,
    ) -> ListenerHandle {
        self.register(ListenerScope::Document(id), Arc::new(listener))
    }

    pub fn register(
        &self,
        scope: ListenerScope,
        listener: Arc<dyn DocumentListener>,
    ) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registration {
            handle,
            scope,
            listener,
        });
        handle
    }

    /// Returns false when the handle was not registered.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.handle != handle);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn dispatch(&self, document_id: &DocumentId, kind: ChangeKind) {
        // registry lock is released before callbacks run so they can (un)register
        let targets: Vec<(ListenerHandle, Arc<dyn DocumentListener>)> = self
            .listeners
            .read()
            .iter()
            .filter(|r| r.scope.matches(document_id))
            .map(|r| (r.handle, Arc::clone(&r.listener)))
            .collect();
        if targets.is_empty() {
            return;
        }

        let event = ChangeEvent {
            store_id: self.inner.store_id(),
            document_id: document_id.clone(),
            kind,
        };
        for (handle, listener) in targets {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_change(&event)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            self.faults.report(ListenerFault {
                listener: handle,
                event: event.clone(),
                message,
            });
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

impl<S: DocumentStore> DocumentStore for ObservableDocumentStore<S> {
    fn store_id(&self) -> StoreId {
        self.inner.store_id()
    }

    fn new_instance(&self, kind: &str) -> Document {
        self.inner.new_instance(kind)
    }

    fn new_instance_with_id(&self, id: DocumentId, kind: &str) -> Document {
        self.inner.new_instance_with_id(id, kind)
    }

    fn get(&self, id: &DocumentId) -> Result<Document, StoreError> {
        self.inner.get(id)
    }

    fn contains(&self, id: &DocumentId) -> bool {
        self.inner.contains(id)
    }

    fn put(&self, document: &mut Document) -> Result<ChangeKind, StoreError> {
        let _order = self.write_order.lock();
        let kind = self.inner.put(document)?;
        self.dispatch(document.id(), kind);
        Ok(kind)
    }

    fn remove(&self, id: &DocumentId) -> Result<(), StoreError> {
        let _order = self.write_order.lock();
        self.inner.remove(id)?;
        self.dispatch(id, ChangeKind::Removed);
        Ok(())
    }

    fn lock(&self, id: &DocumentId) -> Result<Document, StoreError> {
        self.inner.lock(id)
    }

    fn release(&self, document: &mut Document) -> Result<(), StoreError> {
        self.inner.release(document)
    }

    fn ids(&self) -> Vec<DocumentId> {
        self.inner.ids()
    }
}
