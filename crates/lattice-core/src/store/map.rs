//! Consistent map handle.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// A value together with the map-assigned revision that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<V> {
    value: V,
    version: u64,
}

impl<V> Versioned<V> {
    /// Returns the wrapped value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consumes the wrapper, returning the value.
    pub fn into_value(self) -> V {
        self.value
    }

    /// Returns the revision at which the value was written.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// A change observed on a consistent map.
#[derive(Debug, Clone)]
pub enum MapEvent<K, V> {
    /// A key was inserted.
    Insert {
        /// The inserted key.
        key: K,
        /// The new versioned value.
        new: Versioned<V>,
    },
    /// An existing key was overwritten.
    Update {
        /// The updated key.
        key: K,
        /// The replaced versioned value.
        old: Versioned<V>,
        /// The new versioned value.
        new: Versioned<V>,
    },
    /// A key was removed.
    Remove {
        /// The removed key.
        key: K,
        /// The removed versioned value.
        old: Versioned<V>,
    },
}

impl<K, V> MapEvent<K, V> {
    /// The key the event concerns.
    pub fn key(&self) -> &K {
        match self {
            Self::Insert { key, .. } | Self::Update { key, .. } | Self::Remove { key, .. } => key,
        }
    }
}

pub(super) struct MapShared<K, V> {
    #[allow(dead_code)]
    name: String,
    entries: Mutex<HashMap<K, Versioned<V>>>,
    next_version: AtomicU64,
    listeners: Mutex<Vec<mpsc::UnboundedSender<MapEvent<K, V>>>>,
}

impl<K, V> MapShared<K, V> {
    pub(super) fn new(name: String) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

/// Handle onto a named consistent map.
///
/// Handles cloned from, or built against, the same backing map observe the
/// same entries; every handle's listeners see every mutation. Listener
/// callbacks run on a dedicated dispatch task per subscription, never on the
/// mutating thread.
pub struct ConsistentMap<K, V> {
    shared: Arc<MapShared<K, V>>,
}

impl<K, V> Clone for ConsistentMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> ConsistentMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(super) fn from_shared(shared: Arc<MapShared<K, V>>) -> Self {
        Self { shared }
    }

    /// Returns the versioned value stored under `key`.
    pub fn get(&self, key: &K) -> Option<Versioned<V>> {
        self.entries().get(key).cloned()
    }

    /// Returns `true` when `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries().contains_key(key)
    }

    /// Stores `value` under `key`, returning the replaced versioned value.
    pub fn put(&self, key: K, value: V) -> Option<Versioned<V>> {
        let mut entries = self.entries();
        let new = self.versioned(value);
        let old = entries.insert(key.clone(), new.clone());
        let event = match old.clone() {
            None => MapEvent::Insert { key, new },
            Some(old) => MapEvent::Update { key, old, new },
        };
        drop(entries);
        self.emit(event);
        old
    }

    /// Stores `value` under `key` only when absent; returns the existing
    /// versioned value otherwise.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<Versioned<V>> {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(&key) {
            return Some(existing.clone());
        }
        let new = self.versioned(value);
        entries.insert(key.clone(), new.clone());
        drop(entries);
        self.emit(MapEvent::Insert { key, new });
        None
    }

    /// Replaces the value under `key` when `condition` holds for the current
    /// value. Returns the new versioned value when the replacement was made.
    pub fn compute_if(
        &self,
        key: &K,
        condition: impl FnOnce(&V) -> bool,
        remap: impl FnOnce(&K, &V) -> V,
    ) -> Option<Versioned<V>> {
        let mut entries = self.entries();
        let old = entries.get(key)?.clone();
        if !condition(old.value()) {
            return None;
        }
        let new = self.versioned(remap(key, old.value()));
        entries.insert(key.clone(), new.clone());
        drop(entries);
        self.emit(MapEvent::Update {
            key: key.clone(),
            old,
            new: new.clone(),
        });
        Some(new)
    }

    /// Removes `key`, returning the removed versioned value.
    pub fn remove(&self, key: &K) -> Option<Versioned<V>> {
        let mut entries = self.entries();
        let old = entries.remove(key)?;
        drop(entries);
        self.emit(MapEvent::Remove {
            key: key.clone(),
            old: old.clone(),
        });
        Some(old)
    }

    /// Returns every key.
    pub fn keys(&self) -> Vec<K> {
        self.entries().keys().cloned().collect()
    }

    /// Returns every versioned value.
    pub fn values(&self) -> Vec<Versioned<V>> {
        self.entries().values().cloned().collect()
    }

    /// Returns every entry.
    pub fn iter_entries(&self) -> Vec<(K, Versioned<V>)> {
        self.entries()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Registers a change listener. Events are delivered in mutation order on
    /// a dispatch task owned by this subscription.
    pub fn subscribe(&self, handler: impl Fn(MapEvent<K, V>) + Send + 'static) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        });
        self.shared
            .listeners
            .lock()
            .expect("map listener lock poisoned")
            .push(tx);
    }

    /// Offers every stored value to `convert`; `Some` returns replace the
    /// stored value in place. Used by the builder's compatibility function.
    pub(super) fn reconcile(&self, convert: &(dyn Fn(V) -> Option<V> + Send + Sync)) {
        let keys = self.keys();
        for key in keys {
            let current = {
                let entries = self.entries();
                entries.get(&key).map(|v| v.value().clone())
            };
            if let Some(rewritten) = current.and_then(|value| convert(value)) {
                self.put(key, rewritten);
            }
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<K, Versioned<V>>> {
        self.shared.entries.lock().expect("map entry lock poisoned")
    }

    fn versioned(&self, value: V) -> Versioned<V> {
        Versioned {
            value,
            version: self.shared.next_version.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn emit(&self, event: MapEvent<K, V>) {
        let mut listeners = self
            .shared
            .listeners
            .lock()
            .expect("map listener lock poisoned");
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
