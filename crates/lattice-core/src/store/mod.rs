//! Replicated storage primitives.
//!
//! The core consumes two primitives from its storage layer: a consistent
//! key/value map with versioned values and change listeners, and a
//! fire-and-forget topic. Both are built through [`LocalStorageFabric`],
//! the in-process backend: handles built from the same fabric under the same
//! name share state, which is exactly how replicas of one distributed
//! primitive behave from the perspective of the code in this crate. A real
//! deployment substitutes a clustered backend behind the same handle API.

pub mod map;
pub mod topic;

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

pub use map::{ConsistentMap, MapEvent, Versioned};
pub use topic::Topic;

/// Readiness of the storage fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The fabric is serving reads and writes.
    Active,
    /// The fabric is not currently available.
    Inactive,
}

#[derive(Default)]
struct FabricInner {
    maps: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    topics: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

/// In-process storage fabric handing out map and topic handles.
#[derive(Clone, Default)]
pub struct LocalStorageFabric {
    inner: Arc<FabricInner>,
}

impl LocalStorageFabric {
    /// Creates an empty fabric.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts building a consistent map handle.
    #[must_use]
    pub fn consistent_map_builder<K, V>(&self) -> ConsistentMapBuilder<K, V>
    where
        K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        ConsistentMapBuilder {
            fabric: self.clone(),
            name: None,
            version: None,
            compatibility: None,
            _key: PhantomData,
        }
    }

    /// Starts building a topic handle.
    #[must_use]
    pub fn topic_builder<T>(&self) -> TopicBuilder<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        TopicBuilder {
            fabric: self.clone(),
            name: None,
            _payload: PhantomData,
        }
    }

    /// Current fabric status. The local fabric is active from construction.
    #[must_use]
    pub fn status(&self) -> Status {
        Status::Active
    }

    /// Registers a status listener. The current status is delivered
    /// immediately so late subscribers observe readiness they missed.
    pub fn subscribe_status(&self, handler: impl Fn(Status) + Send + 'static) {
        handler(self.status());
    }
}

/// Builder for [`ConsistentMap`] handles.
pub struct ConsistentMapBuilder<K, V> {
    fabric: LocalStorageFabric,
    name: Option<String>,
    version: Option<String>,
    compatibility: Option<Arc<dyn Fn(V) -> Option<V> + Send + Sync>>,
    _key: PhantomData<fn() -> K>,
}

impl<K, V> ConsistentMapBuilder<K, V>
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Names the map. Handles built under one name share state.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Records the local software version the handle was built under.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Installs a compatibility function. At build time every stored value is
    /// offered to the function; a `Some` return replaces the stored value.
    /// This is the rolling-upgrade hook: values written by another software
    /// version are rewritten into the local shape.
    #[must_use]
    pub fn with_compatibility_function(
        mut self,
        f: impl Fn(V) -> Option<V> + Send + Sync + 'static,
    ) -> Self {
        self.compatibility = Some(Arc::new(f));
        self
    }

    /// Builds the handle.
    ///
    /// # Panics
    ///
    /// Panics if a map with the same name was built with different key or
    /// value types.
    #[must_use]
    pub fn build(self) -> ConsistentMap<K, V> {
        let name = self.name.unwrap_or_else(|| "anonymous-map".to_string());
        if let Some(version) = &self.version {
            tracing::trace!(map = %name, %version, "building consistent map handle");
        }
        let mut maps = self
            .fabric
            .inner
            .maps
            .lock()
            .expect("fabric map registry lock poisoned");
        let shared = maps
            .entry(name.clone())
            .or_insert_with(|| Arc::new(map::MapShared::<K, V>::new(name.clone())) as _)
            .clone();
        drop(maps);
        let shared = shared
            .downcast::<map::MapShared<K, V>>()
            .unwrap_or_else(|_| panic!("map {name} already built with different types"));
        let handle = ConsistentMap::from_shared(shared);
        if let Some(convert) = self.compatibility {
            handle.reconcile(convert.as_ref());
        }
        handle
    }
}

/// Builder for [`Topic`] handles.
pub struct TopicBuilder<T> {
    fabric: LocalStorageFabric,
    name: Option<String>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> TopicBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Names the topic. Handles built under one name share subscribers.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builds the handle.
    ///
    /// # Panics
    ///
    /// Panics if a topic with the same name was built with a different
    /// payload type.
    #[must_use]
    pub fn build(self) -> Topic<T> {
        let name = self.name.unwrap_or_else(|| "anonymous-topic".to_string());
        let mut topics = self
            .fabric
            .inner
            .topics
            .lock()
            .expect("fabric topic registry lock poisoned");
        let shared = topics
            .entry(name.clone())
            .or_insert_with(|| Arc::new(topic::TopicShared::<T>::new(name.clone())) as _)
            .clone();
        drop(topics);
        let shared = shared
            .downcast::<topic::TopicShared<T>>()
            .unwrap_or_else(|_| panic!("topic {name} already built with a different type"));
        Topic::from_shared(shared)
    }
}
