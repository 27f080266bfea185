//! Per-fetch key/value cache.
//!
//! Fetch functions share intermediate listings through it (the bucket list is
//! needed both for buckets and for their objects), and the engine stores every
//! type's raw objects under `<type>_objects` for the parent builders. Each key
//! is initialised at most once per fetch; [`FetchCache::reset`] starts over.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as Json;
use tokio::sync::OnceCell;

use super::FetchError;

/// Key under which the raw objects of `kind` are stored.
pub fn objects_key(kind: &str) -> String {
    format!("{}_objects", kind)
}

/// Shared cache, one cell per key.
#[derive(Debug, Default)]
pub struct FetchCache {
    cells: Mutex<HashMap<String, Arc<OnceCell<Json>>>>,
}

impl FetchCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<Json>> {
        self.cells
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Value stored under `key`, if initialised.
    pub fn get(&self, key: &str) -> Option<Json> {
        self.cells.lock().get(key).and_then(|c| c.get().cloned())
    }

    /// Store `value` under `key`, replacing any previous cell.
    pub fn store(&self, key: impl Into<String>, value: Json) {
        self.cells
            .lock()
            .insert(key.into(), Arc::new(OnceCell::new_with(Some(value))));
    }

    /// Value under `key`, computed by `init` on first access.
    ///
    /// Concurrent callers wait for the first initialisation; a failed `init`
    /// leaves the cell empty so a later caller may retry.
    pub async fn get_or_init<F, Fut>(&self, key: &str, init: F) -> Result<Json, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Json, FetchError>>,
    {
        let cell = self.cell(key);
        cell.get_or_try_init(init).await.cloned()
    }

    /// Raw objects captured for `kind`, empty when none were stored.
    pub fn objects(&self, kind: &str) -> Vec<Json> {
        match self.get(&objects_key(kind)) {
            Some(Json::Array(items)) => items,
            _ => Vec::new(),
        }
    }

    /// Whether raw objects were stored for `kind`.
    pub fn has_objects(&self, kind: &str) -> bool {
        self.get(&objects_key(kind)).is_some()
    }

    /// Drop every entry.
    pub fn reset(&self) {
        self.cells.lock().clear();
    }
}
