//! Ordered string key-value facets over the `kvStore` table.

use crate::{HOST_KEY_PREFIX, LOCAL_KEY_PREFIX, Shared, StoreError, StoreResult};

/// Ordered string map with lexicographic successor lookup.
///
/// Absence of a key is distinct from an empty value. Ordering is by raw
/// UTF-8 bytes.
pub trait KvStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn has(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Smallest existing key strictly greater than `previous_key`.
    fn get_next_key(&self, previous_key: &str) -> StoreResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    fn delete(&self, key: &str) -> StoreResult<()>;
}

/// The kernel's KV facet. Every consensus mutation feeds the crank hash;
/// `local.` keys bypass it and `host.` keys are refused.
#[derive(Clone)]
pub struct KernelKvStore {
    shared: Shared,
}

impl KernelKvStore {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    fn check_writable(key: &str) -> StoreResult<()> {
        if key.starts_with(HOST_KEY_PREFIX) {
            return Err(StoreError::ReservedKey(key.to_string()));
        }
        Ok(())
    }
}

fn is_consensus_key(key: &str) -> bool {
    !key.starts_with(LOCAL_KEY_PREFIX)
}

impl KvStore for KernelKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.shared.lock().db.kv_get(key)
    }

    fn get_next_key(&self, previous_key: &str) -> StoreResult<Option<String>> {
        self.shared.lock().db.kv_next_key(previous_key)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        Self::check_writable(key)?;
        let mut inner = self.shared.lock();
        inner.db.kv_set(key, value)?;
        if is_consensus_key(key) {
            inner.crank.record_set(key, value);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        Self::check_writable(key)?;
        let mut inner = self.shared.lock();
        inner.db.kv_delete(key)?;
        if is_consensus_key(key) {
            inner.crank.record_delete(key);
        }
        Ok(())
    }
}

/// The host's KV facet: confined to `host.` keys, never hashed.
#[derive(Clone)]
pub struct HostKvStore {
    shared: Shared,
}

impl HostKvStore {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    fn check_host_key(key: &str) -> StoreResult<()> {
        if !key.starts_with(HOST_KEY_PREFIX) {
            return Err(StoreError::NotHostKey(key.to_string()));
        }
        Ok(())
    }
}

impl KvStore for HostKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Self::check_host_key(key)?;
        self.shared.lock().db.kv_get(key)
    }

    fn get_next_key(&self, previous_key: &str) -> StoreResult<Option<String>> {
        Self::check_host_key(previous_key)?;
        let next = self.shared.lock().db.kv_next_key(previous_key)?;
        Ok(next.filter(|key| key.starts_with(HOST_KEY_PREFIX)))
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        Self::check_host_key(key)?;
        self.shared.lock().db.kv_set(key, value)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        Self::check_host_key(key)?;
        self.shared.lock().db.kv_delete(key)
    }
}
