//! Keyed state storage behind every stateful service
//!
//! Services never own their maps directly; they hold an `Arc<dyn StateStore<V>>` so a
//! shared backend can replace the in-process default without touching call sites.
//! `update` is the only read-modify-write primitive and must be atomic per key.

use crate::error::{AccessGuardError, AccessGuardResult};
use dashmap::DashMap;
use std::sync::Arc;

/// Keyed store with per-key atomic updates.
pub trait StateStore<V>: Send + Sync
where
    V: Clone + Send + Sync,
{
    /// Store name used in logs and errors.
    fn name(&self) -> &str;

    /// Read a snapshot of the value at `key`.
    fn get(&self, key: &str) -> AccessGuardResult<Option<V>>;

    /// Replace the value at `key`.
    fn put(&self, key: &str, value: V) -> AccessGuardResult<()>;

    /// Remove and return the value at `key`.
    fn remove(&self, key: &str) -> AccessGuardResult<Option<V>>;

    /// Atomically apply `apply` to the value at `key`, inserting `init()` first when
    /// the key is absent. Returns a snapshot of the updated value.
    ///
    /// `apply` runs while the key is locked and must not call back into this store.
    fn update(
        &self,
        key: &str,
        init: &dyn Fn() -> V,
        apply: &mut dyn FnMut(&mut V),
    ) -> AccessGuardResult<V>;

    /// All keys currently held.
    fn keys(&self) -> AccessGuardResult<Vec<String>>;
}

/// Run `f` atomically against the value at `key` and return what it produced.
pub fn mutate<V, R, F>(
    store: &dyn StateStore<V>,
    key: &str,
    init: impl Fn() -> V,
    f: F,
) -> AccessGuardResult<R>
where
    V: Clone + Send + Sync,
    F: FnOnce(&mut V) -> R,
{
    let mut f = Some(f);
    let mut out = None;
    store.update(key, &init, &mut |value| {
        if let Some(f) = f.take() {
            out = Some(f(value));
        }
    })?;
    out.ok_or_else(|| AccessGuardError::StoreFailure {
        store: store.name().to_string(),
        reason: format!("update for key {key} was not applied"),
    })
}

/// Process-local store on a sharded concurrent map.
#[derive(Debug)]
pub struct InMemoryStore<V> {
    name: String,
    entries: DashMap<String, V>,
}

impl<V> InMemoryStore<V> {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
        }
    }

    /// Create an empty store already wrapped for injection.
    pub fn shared(name: impl Into<String>) -> Arc<dyn StateStore<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        Arc::new(Self::new(name))
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> StateStore<V> for InMemoryStore<V>
where
    V: Clone + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> AccessGuardResult<Option<V>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn put(&self, key: &str, value: V) -> AccessGuardResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> AccessGuardResult<Option<V>> {
        Ok(self.entries.remove(key).map(|(_, value)| value))
    }

    fn update(
        &self,
        key: &str,
        init: &dyn Fn() -> V,
        apply: &mut dyn FnMut(&mut V),
    ) -> AccessGuardResult<V> {
        // The entry guard holds the shard write lock for the whole closure.
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| init());
        apply(entry.value_mut());
        Ok(entry.value().clone())
    }

    fn keys(&self) -> AccessGuardResult<Vec<String>> {
        Ok(self.entries.iter().map(|entry| entry.key().clone()).collect())
    }
}
