//! Trackable registry (C11): named-singleton factory
//!
//! `add_trackable`/`get_or_insert` guarantee at most one live instance per
//! key. The server keys this by file path to give every connection that
//! opens the same path the same `ServeFile`, sharing its cached blocks and
//! in-flight fetches instead of racing two independent instances.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

type AnyInstance = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct TrackableRegistry {
    instances: Mutex<HashMap<String, AnyInstance>>,
}

impl TrackableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing instance for `name`, or build one with `factory`
    /// under the registry lock and publish it. `factory` runs at most once
    /// per name, even under concurrent callers.
    pub fn add_trackable<T, F>(&self, name: &str, factory: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let mut instances = self.instances.lock();
        if let Some(existing) = instances.get(name) {
            if let Ok(typed) = existing.clone().downcast::<T>() {
                return typed;
            }
            tracing::warn!(name, "trackable type mismatch on lookup, replacing");
        }
        let created: Arc<T> = Arc::new(factory());
        instances.insert(name.to_string(), created.clone());
        created
    }

    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.instances.lock().get(name)?.clone().downcast::<T>().ok()
    }

    /// Like `add_trackable`, but for constructors that can't run inside a
    /// synchronous `FnOnce` (e.g. `ServeFile::open`, which stats the file and
    /// is itself `async`). The caller builds `instance` speculatively outside
    /// the lock; if another caller already published one under `name` first,
    /// that earlier instance wins and `instance` is dropped.
    pub fn get_or_insert<T: Send + Sync + 'static>(&self, name: &str, instance: Arc<T>) -> Arc<T> {
        let mut instances = self.instances.lock();
        if let Some(existing) = instances.get(name) {
            if let Ok(typed) = existing.clone().downcast::<T>() {
                return typed;
            }
        }
        instances.insert(name.to_string(), instance.clone());
        instance
    }

    /// Destroy the tracked instance for `name`. Any `Arc` clones already
    /// held by callers remain valid until they are dropped.
    pub fn remove_trackable(&self, name: &str) -> bool {
        self.instances.lock().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instances.lock().contains_key(name)
    }
}
