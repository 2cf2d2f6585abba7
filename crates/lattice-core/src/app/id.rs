//! Application id registration.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{AppId, CORE_APP_NAME};

/// Cluster-wide application id registry.
pub trait ApplicationIdStore: Send + Sync {
    /// Registers `name`, returning its id. Registration is idempotent: a
    /// known name returns its existing id.
    fn register_application(&self, name: &str) -> AppId;

    /// The id registered for `name`, if any.
    fn get_app_id(&self, name: &str) -> Option<AppId>;

    /// The id registered under short id `id`, if any.
    fn get_app_id_by_short(&self, id: u32) -> Option<AppId>;
}

struct Registry {
    by_name: HashMap<String, AppId>,
    by_short: HashMap<u32, AppId>,
    next: u32,
}

/// In-memory id registry. The core application is registered at
/// construction, so id 1 is always [`CORE_APP_NAME`].
pub struct InMemoryAppIdStore {
    registry: Mutex<Registry>,
}

impl InMemoryAppIdStore {
    /// Creates a registry with the core application pre-registered.
    #[must_use]
    pub fn new() -> Self {
        let store = Self {
            registry: Mutex::new(Registry {
                by_name: HashMap::new(),
                by_short: HashMap::new(),
                next: 1,
            }),
        };
        store.register_application(CORE_APP_NAME);
        store
    }
}

impl Default for InMemoryAppIdStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationIdStore for InMemoryAppIdStore {
    fn register_application(&self, name: &str) -> AppId {
        let mut registry = self.registry.lock().expect("id registry lock poisoned");
        if let Some(existing) = registry.by_name.get(name) {
            return existing.clone();
        }
        let id = AppId::new(registry.next, name);
        registry.next += 1;
        registry.by_name.insert(name.to_string(), id.clone());
        registry.by_short.insert(id.id(), id.clone());
        id
    }

    fn get_app_id(&self, name: &str) -> Option<AppId> {
        self.registry
            .lock()
            .expect("id registry lock poisoned")
            .by_name
            .get(name)
            .cloned()
    }

    fn get_app_id_by_short(&self, id: u32) -> Option<AppId> {
        self.registry
            .lock()
            .expect("id registry lock poisoned")
            .by_short
            .get(&id)
            .cloned()
    }
}
