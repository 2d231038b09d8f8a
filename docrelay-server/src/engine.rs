//! CRDT engine seam.
//!
//! The relay never interprets delta bytes. It hands them to a [`CrdtEngine`],
//! which integrates them and reports the delta it emits for the change (the
//! "merge event"). [`YrsEngine`] is the default engine, backed by a `yrs::Doc`.

use std::sync::{Arc, Mutex};
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::update_check::check_update_v1;

/// v1 encoding of an update carrying no structs and no deletions.
const EMPTY_UPDATE_V1: &[u8] = &[0, 0];

/// Engine errors. Always recoverable: the offending delta is dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to decode delta: {0}")]
    Decode(String),
    #[error("failed to apply delta: {0}")]
    Apply(String),
}

/// A conflict-free replicated document that speaks in binary deltas.
pub trait CrdtEngine: Send + 'static {
    /// Integrate `delta`.
    ///
    /// Returns `Ok(Some(update))` when the document changed, where `update` is
    /// the delta emitted for that change. `Ok(None)` means nothing changed,
    /// e.g. the delta was already applied.
    fn merge(&mut self, delta: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;

    /// Full document state relative to an empty document.
    ///
    /// Empty when the engine holds no state yet.
    fn state_as_delta(&self) -> Vec<u8>;
}

/// Yrs-backed engine.
///
/// Merge events come from the document's v1 update observer, so the emitted
/// delta is exactly what yrs committed for the transaction.
pub struct YrsEngine {
    doc: Doc,
    emitted: Arc<Mutex<Option<Vec<u8>>>>,
    _updates: Option<Subscription>,
}

impl YrsEngine {
    pub fn new() -> Self {
        let doc = Doc::new();
        let emitted = Arc::new(Mutex::new(None));

        let sink = Arc::clone(&emitted);
        let subscription = doc
            .observe_update_v1(move |_, event| {
                if let Ok(mut slot) = sink.lock() {
                    *slot = Some(event.update.clone());
                }
            })
            .map_err(|e| log::error!("Failed to observe document updates: {e:?}"))
            .ok();

        Self {
            doc,
            emitted,
            _updates: subscription,
        }
    }

    fn take_emitted(&self) -> Option<Vec<u8>> {
        self.emitted.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl Default for YrsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtEngine for YrsEngine {
    fn merge(&mut self, delta: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        // yrs trusts string payloads to be UTF-8.
        check_update_v1(delta).map_err(|e| EngineError::Decode(e.to_string()))?;
        let update = Update::decode_v1(delta).map_err(|e| EngineError::Decode(e.to_string()))?;

        // Stale output from an earlier failed merge must not leak into this one.
        self.take_emitted();

        let applied = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
        };
        // The observer runs when the transaction above is dropped.
        let emitted = self.take_emitted();

        match applied {
            Ok(()) => Ok(emitted),
            Err(e) => Err(EngineError::Apply(e.to_string())),
        }
    }

    fn state_as_delta(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        let state = txn.encode_state_as_update_v1(&StateVector::default());
        if state == EMPTY_UPDATE_V1 {
            Vec::new()
        } else {
            state
        }
    }
}
