//! Single-node intent store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::trace;

use super::data::{IntentData, IntentRequest, IntentState, Version};
use super::error::IntentError;
use super::event::{IntentEvent, IntentEventKind};
use super::key::Key;
use super::store::{IntentStore, IntentStoreDelegate};
use super::types::Intent;

/// In-memory [`IntentStore`] for a node that masters every key.
///
/// Honors the full store contract (version stamping, pending/current slots,
/// ordered batch writes, request and transition events) without any
/// replication, which makes it the store of choice for single-instance
/// deployments and tests.
#[derive(Default)]
pub struct SimpleIntentStore {
    current: Mutex<HashMap<Key, IntentData>>,
    pending: Mutex<HashMap<Key, IntentData>>,
    delegate: Mutex<Option<Arc<dyn IntentStoreDelegate>>>,
    sequence: AtomicU64,
}

impl SimpleIntentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn delegate(&self) -> Option<Arc<dyn IntentStoreDelegate>> {
        self.delegate.lock().expect("delegate lock poisoned").clone()
    }

    fn stamp(&self) -> Version {
        Version::new(
            Utc::now().timestamp_millis(),
            self.sequence.fetch_add(1, Ordering::Relaxed),
        )
    }

    fn request_event(data: &IntentData) -> Option<IntentEvent> {
        let kind = match data.request() {
            IntentRequest::Submit => IntentEventKind::InstallReq,
            IntentRequest::Withdraw => IntentEventKind::WithdrawReq,
            // Purge acceptance is not a lifecycle transition; the PURGED
            // event fires when the key actually disappears.
            IntentRequest::Purge => return None,
        };
        Some(IntentEvent::new(kind, data.intent().clone()))
    }
}

impl IntentStore for SimpleIntentStore {
    fn set_delegate(&self, delegate: Arc<dyn IntentStoreDelegate>) {
        *self.delegate.lock().expect("delegate lock poisoned") = Some(delegate);
    }

    fn add_pending(&self, mut data: IntentData) {
        if data.version().is_none() {
            data.set_version(self.stamp());
        }
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            if let Some(existing) = pending.get(data.key()) {
                if existing.version() >= data.version() {
                    trace!(key = %data.key(), "dropping request older than pending");
                    return;
                }
            }
            pending.insert(data.key().clone(), data.clone());
        }
        if let Some(delegate) = self.delegate() {
            if let Some(event) = Self::request_event(&data) {
                delegate.notify(event);
            }
            delegate.process(data);
        }
    }

    fn get_intent(&self, key: &Key) -> Option<Intent> {
        self.current
            .lock()
            .expect("current lock poisoned")
            .get(key)
            .map(|data| data.intent().clone())
    }

    fn get_intent_data(&self, key: &Key) -> Option<IntentData> {
        self.current
            .lock()
            .expect("current lock poisoned")
            .get(key)
            .cloned()
    }

    fn get_pending_data(&self, key: &Key) -> Option<IntentData> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .get(key)
            .cloned()
    }

    fn get_intents(&self) -> Vec<Intent> {
        self.current
            .lock()
            .expect("current lock poisoned")
            .values()
            .map(|data| data.intent().clone())
            .collect()
    }

    fn intent_data(&self) -> Vec<IntentData> {
        self.current
            .lock()
            .expect("current lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn pending(&self) -> Vec<Intent> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .values()
            .map(|data| data.intent().clone())
            .collect()
    }

    fn get_intent_state(&self, key: &Key) -> Option<IntentState> {
        self.current
            .lock()
            .expect("current lock poisoned")
            .get(key)
            .map(IntentData::state)
    }

    fn get_installable_intents(&self, key: &Key) -> Vec<Intent> {
        self.current
            .lock()
            .expect("current lock poisoned")
            .get(key)
            .map(|data| data.installables().to_vec())
            .unwrap_or_default()
    }

    fn intent_count(&self) -> usize {
        self.current.lock().expect("current lock poisoned").len()
    }

    fn is_master(&self, _key: &Key) -> bool {
        true
    }

    fn batch_write(&self, batch: Vec<IntentData>) -> Result<(), IntentError> {
        let delegate = self.delegate();
        for data in batch {
            let key = data.key().clone();
            if data.state() == IntentState::PurgeReq {
                self.current
                    .lock()
                    .expect("current lock poisoned")
                    .remove(&key);
                let mut pending = self.pending.lock().expect("pending lock poisoned");
                if pending
                    .get(&key)
                    .is_some_and(|p| p.version() <= data.version())
                {
                    pending.remove(&key);
                }
                drop(pending);
                if let Some(delegate) = &delegate {
                    delegate
                        .notify(IntentEvent::new(IntentEventKind::Purged, data.intent().clone()));
                }
                continue;
            }

            self.current
                .lock()
                .expect("current lock poisoned")
                .insert(key.clone(), data.clone());
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            if pending
                .get(&key)
                .is_some_and(|p| p.version() <= data.version())
            {
                pending.remove(&key);
            }
            drop(pending);

            if let Some(delegate) = &delegate {
                delegate.on_update(data.clone());
                if let Some(kind) = IntentEventKind::from_state(data.state()) {
                    delegate.notify(IntentEvent::new(kind, data.intent().clone()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::app::AppId;

    struct RecordingDelegate {
        processed: StdMutex<Vec<Key>>,
        events: StdMutex<Vec<IntentEventKind>>,
    }

    impl RecordingDelegate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                processed: StdMutex::new(Vec::new()),
                events: StdMutex::new(Vec::new()),
            })
        }
    }

    impl IntentStoreDelegate for RecordingDelegate {
        fn process(&self, data: IntentData) {
            self.processed.lock().unwrap().push(data.key().clone());
        }

        fn notify(&self, event: IntentEvent) {
            self.events.lock().unwrap().push(event.kind());
        }

        fn on_update(&self, _data: IntentData) {}
    }

    fn intent(name: &str) -> Intent {
        let app = AppId::new(1, "lattice.test");
        Intent::builder(Key::of(name, app.clone()), app).build()
    }

    #[test]
    fn add_pending_stamps_and_processes() {
        let store = SimpleIntentStore::new();
        let delegate = RecordingDelegate::new();
        store.set_delegate(delegate.clone());

        store.add_pending(IntentData::submit(intent("a")));

        let pending = store.get_pending_data(&intent("a").key().clone()).unwrap();
        assert!(pending.version().is_some());
        assert_eq!(delegate.processed.lock().unwrap().len(), 1);
        assert_eq!(
            *delegate.events.lock().unwrap(),
            vec![IntentEventKind::InstallReq]
        );
    }

    #[test]
    fn older_pending_requests_are_dropped() {
        let store = SimpleIntentStore::new();
        let delegate = RecordingDelegate::new();
        store.set_delegate(delegate.clone());

        let mut newer = IntentData::withdraw(intent("a"));
        newer.set_version(Version::new(i64::MAX, 0));
        store.add_pending(newer);
        store.add_pending(IntentData::submit(intent("a")));

        assert_eq!(delegate.processed.lock().unwrap().len(), 1);
        let pending = store.get_pending_data(&intent("a").key().clone()).unwrap();
        assert_eq!(pending.request(), IntentRequest::Withdraw);
    }

    #[test]
    fn batch_write_moves_data_to_current_and_clears_pending() {
        let store = SimpleIntentStore::new();
        let delegate = RecordingDelegate::new();
        store.set_delegate(delegate.clone());

        store.add_pending(IntentData::submit(intent("a")));
        let pending = store.get_pending_data(&intent("a").key().clone()).unwrap();
        let written = pending.advance(IntentState::Installed);
        store.batch_write(vec![written]).unwrap();

        assert_eq!(
            store.get_intent_state(&intent("a").key().clone()),
            Some(IntentState::Installed)
        );
        assert!(store.get_pending_data(&intent("a").key().clone()).is_none());
        assert_eq!(
            *delegate.events.lock().unwrap(),
            vec![IntentEventKind::InstallReq, IntentEventKind::Installed]
        );
    }

    #[test]
    fn purge_write_removes_the_key() {
        let store = SimpleIntentStore::new();
        let delegate = RecordingDelegate::new();
        store.set_delegate(delegate.clone());

        store.add_pending(IntentData::submit(intent("a")));
        let pending = store.get_pending_data(&intent("a").key().clone()).unwrap();
        store
            .batch_write(vec![pending.clone().advance(IntentState::Installed)])
            .unwrap();

        store.add_pending(IntentData::purge(intent("a")));
        let purge = store.get_pending_data(&intent("a").key().clone()).unwrap();
        store.batch_write(vec![purge]).unwrap();

        assert!(store.get_intent(&intent("a").key().clone()).is_none());
        assert_eq!(store.intent_count(), 0);
        assert!(delegate
            .events
            .lock()
            .unwrap()
            .contains(&IntentEventKind::Purged));
    }
}
