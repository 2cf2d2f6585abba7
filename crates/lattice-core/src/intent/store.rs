//! The intent store contract.

use std::sync::Arc;

use super::data::{IntentData, IntentState};
use super::error::IntentError;
use super::event::IntentEvent;
use super::key::Key;
use super::types::Intent;

/// Callbacks the store drives into the manager.
pub trait IntentStoreDelegate: Send + Sync {
    /// A new pending request landed and awaits batching.
    fn process(&self, data: IntentData);

    /// A lifecycle transition became durable.
    fn notify(&self, event: IntentEvent);

    /// Tracking hook invoked for every written datum.
    fn on_update(&self, data: IntentData);
}

/// Replicated, partitioned map of intent keys to (current, pending) data.
///
/// The store is the sole owner of durable intent state: every mutation flows
/// through [`add_pending`](IntentStore::add_pending) or
/// [`batch_write`](IntentStore::batch_write). Each key has a single master
/// node; non-masters skip processing silently.
pub trait IntentStore: Send + Sync {
    /// Installs the delegate receiving store callbacks.
    fn set_delegate(&self, delegate: Arc<dyn IntentStoreDelegate>);

    /// Enqueues a request. The store stamps the data's version, emits the
    /// request event, and hands the data to the delegate for batching.
    /// Requests older than the already-pending data are dropped.
    fn add_pending(&self, data: IntentData);

    /// The intent currently stored under `key`.
    fn get_intent(&self, key: &Key) -> Option<Intent>;

    /// The current data for `key`.
    fn get_intent_data(&self, key: &Key) -> Option<IntentData>;

    /// The pending data for `key`.
    fn get_pending_data(&self, key: &Key) -> Option<IntentData>;

    /// Every current intent.
    fn get_intents(&self) -> Vec<Intent>;

    /// Every current data envelope.
    fn intent_data(&self) -> Vec<IntentData>;

    /// Every pending intent.
    fn pending(&self) -> Vec<Intent>;

    /// The current state of `key`.
    fn get_intent_state(&self, key: &Key) -> Option<IntentState>;

    /// The installables compiled for `key`.
    fn get_installable_intents(&self, key: &Key) -> Vec<Intent>;

    /// Number of current intents.
    fn intent_count(&self) -> usize;

    /// `true` iff this node owns processing for `key`.
    fn is_master(&self, key: &Key) -> bool;

    /// Atomically persists a batch of updated data. Writes are applied in
    /// list order; per datum the delegate observes `on_update` and the
    /// resulting event. A datum in `PURGE_REQ` state removes its key.
    ///
    /// # Errors
    ///
    /// Fails the whole batch when the backing map rejects the write.
    fn batch_write(&self, batch: Vec<IntentData>) -> Result<(), IntentError>;
}
