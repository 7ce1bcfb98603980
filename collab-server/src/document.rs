//! Replicated document of one room, backed by a Yrs `Doc`.
//!
//! This is an adapter, not a CRDT: merging is done by Yrs. The adapter adds
//! what the room layer needs on top of it:
//!
//! - validation before integration (an undecodable update never touches the doc)
//! - a version counter bumped on every successful apply
//! - an explicit observer list, invoked synchronously after each apply
//! - `reset`, used when a room's document has to be recreated
//!
//! All transactions go through one mutex, so observers see versions in order
//! and no transaction is ever held across an `.await`.
//!
//! Payloads from peers are checked by [`crate::validate`] before yrs decodes
//! them, and a panic inside yrs is turned into an error for the caller.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

use crate::validate;

/// Name of the shared text edited by the clients.
pub const TEXT_NAME: &str = "codemirror";

/// Errors from the document adapter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocumentError {
    /// Payload is not a valid Yrs v1 update; nothing was applied.
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),
    /// Payload is not a valid Yrs v1 state vector.
    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),
    /// The update decoded but Yrs refused to integrate it.
    #[error("Update could not be integrated: {0}")]
    Integration(String),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::MalformedUpdate(e.to_string())
    }
}

/// Handle returned by [`RoomDocument::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// What an observer is told after a successful apply.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// Version reached by this apply.
    pub version: u64,
    /// Materialized text after the apply.
    pub content: String,
}

type Observer = Arc<dyn Fn(&DocumentChange) + Send + Sync>;

struct Inner {
    doc: Doc,
    version: u64,
}

/// Mergeable content of one room.
pub struct RoomDocument {
    inner: Mutex<Inner>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer: Mutex<u64>,
}

impl Default for RoomDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                doc: Self::empty_doc(),
                version: 0,
            }),
            observers: Mutex::new(Vec::new()),
            next_observer: Mutex::new(0),
        }
    }

    fn empty_doc() -> Doc {
        let doc = Doc::new();
        // Register the root type up front so reads never need a write txn.
        doc.get_or_insert_text(TEXT_NAME);
        doc
    }

    /// Merge a Yrs v1 update into the document.
    ///
    /// Re-applying an already integrated update is a no-op for the content.
    /// An undecodable payload is rejected before any transaction is opened.
    pub fn apply_update(&self, update: &[u8]) -> Result<u64, DocumentError> {
        validate::check_update_v1(update)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let update = match panic::catch_unwind(|| Update::decode_v1(update)) {
            Ok(decoded) => decoded?,
            Err(payload) => return Err(DocumentError::MalformedUpdate(panic_message(payload))),
        };

        let (version, change) = {
            let mut inner = self.inner.lock();
            let applied = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut txn = inner.doc.transact_mut();
                txn.apply_update(update)
            }));
            match applied {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(DocumentError::Integration(e.to_string())),
                Err(payload) => return Err(DocumentError::Integration(panic_message(payload))),
            }
            inner.version += 1;
            (inner.version, self.change(&inner))
        };
        self.notify(change);
        Ok(version)
    }

    /// Insert text at `index` as a locally originated edit.
    ///
    /// Returns the Yrs update describing the edit, ready to be sent to peers.
    pub fn insert_text(&self, index: u32, chunk: &str) -> Vec<u8> {
        let (update, change) = {
            let mut inner = self.inner.lock();
            let update = {
                let text = inner.doc.get_or_insert_text(TEXT_NAME);
                let mut txn = inner.doc.transact_mut();
                let len = text.len(&txn);
                text.insert(&mut txn, index.min(len), chunk);
                txn.encode_update_v1()
            };
            inner.version += 1;
            (update, self.change(&inner))
        };
        self.notify(change);
        update
    }

    /// Full state as a single update, for a peer that has nothing.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// State vector, for diff negotiation.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the holder of `state_vector` is missing.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        validate::check_state_vector_v1(state_vector)
            .map_err(|e| DocumentError::MalformedStateVector(e.to_string()))?;
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::MalformedStateVector(e.to_string()))?;
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Register a change observer. It runs synchronously after every
    /// successful apply, on the applying task.
    pub fn observe<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_observer.lock();
            *next += 1;
            ObserverId(*next)
        };
        self.observers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Deregister an observer. Returns false if it was not registered.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Drop every observer (document disposal).
    pub fn clear_observers(&self) {
        self.observers.lock().clear();
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Number of successful applies so far.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Materialized text of the document.
    pub fn content(&self) -> String {
        Self::read_text(&self.inner.lock().doc)
    }

    /// Replace the content with an empty document.
    ///
    /// Every edit made so far is lost. Peers still holding the old state
    /// keep it locally; it is not re-integrated unless they send it again.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.doc = Self::empty_doc();
        inner.version += 1;
    }

    fn read_text(doc: &Doc) -> String {
        let txn = doc.transact();
        txn.get_text(TEXT_NAME)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// The change to report, materialized only when someone is listening.
    fn change(&self, inner: &Inner) -> Option<DocumentChange> {
        if self.observers.lock().is_empty() {
            return None;
        }
        Some(DocumentChange {
            version: inner.version,
            content: Self::read_text(&inner.doc),
        })
    }

    fn notify(&self, change: Option<DocumentChange>) {
        let Some(change) = change else { return };
        // Clone out of the lock so an observer may register or deregister.
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for observer in observers {
            observer(&change);
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("yrs panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("yrs panicked: {s}")
    } else {
        "yrs panicked".to_string()
    }
}

impl std::fmt::Display for RoomDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.content())
    }
}
