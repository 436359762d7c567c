//! Per-instance registry of singleton resources.
//!
//! Each storage instance owns exactly one registry mapping string keys to
//! shared resources (connection pool, recorder, config snapshots). The
//! registry never removes entries; it is dropped wholesale with its
//! owning instance.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A resource owned by one storage instance for its whole lifetime.
pub type SingletonResource = dyn Any + Send + Sync;

/// Key → singleton map with create-if-absent semantics.
#[derive(Default)]
pub struct ResourceRegistry {
    entries: Mutex<HashMap<String, Arc<SingletonResource>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a resource by key.
    pub fn get(&self, key: &str) -> Option<Arc<SingletonResource>> {
        self.lock().get(key).cloned()
    }

    /// Look up a resource by key, downcast to its concrete type.
    pub fn get_as<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key).and_then(|resource| resource.downcast::<T>().ok())
    }

    /// Store `resource` under `key` unless one already exists; either way,
    /// return the resource that survives.
    ///
    /// Under N concurrent calls with the same key, every caller observes
    /// the same single instance.
    pub fn set_if_absent(
        &self,
        key: impl Into<String>,
        resource: Arc<SingletonResource>,
    ) -> Arc<SingletonResource> {
        let mut entries = self.lock();
        entries.entry(key.into()).or_insert(resource).clone()
    }

    /// Typed variant of [`set_if_absent`](Self::set_if_absent): builds the
    /// resource only if the key is vacant.
    ///
    /// Returns `None` when the key is already bound to a resource of a
    /// different concrete type; the existing entry is kept untouched.
    pub fn get_or_create<T, F>(&self, key: &str, create: F) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Arc<T>,
    {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(existing) => existing.clone().downcast::<T>().ok(),
            None => {
                let created = create();
                entries.insert(key.to_string(), created.clone());
                Some(created)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SingletonResource>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.lock().keys().cloned().collect();
        f.debug_struct("ResourceRegistry").field("keys", &keys).finish()
    }
}
