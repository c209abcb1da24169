//! Range helpers layered on [`KvStore::get_next_key`] and counted key families.

use crate::{KvStore, StoreResult};

/// Keys strictly after `prefix` that still start with it, in order.
///
/// Stops at the first key without the prefix, or at the first key that is
/// `>= exclusive_end` when a bound is given.
pub fn enumerate_prefixed_keys<K: KvStore + ?Sized>(
    kv: &K,
    prefix: &str,
    exclusive_end: Option<&str>,
) -> StoreResult<Vec<String>> {
    let mut keys = Vec::new();
    let mut cursor = prefix.to_string();
    while let Some(key) = kv.get_next_key(&cursor)? {
        if !key.starts_with(prefix) {
            break;
        }
        if exclusive_end.is_some_and(|end| key.as_str() >= end) {
            break;
        }
        keys.push(key.clone());
        cursor = key;
    }
    Ok(keys)
}

/// Values of `prefix0`, `prefix1`, ... up to the first missing index.
pub fn get_prefixed_values<K: KvStore + ?Sized>(kv: &K, prefix: &str) -> StoreResult<Vec<String>> {
    let mut values = Vec::new();
    for idx in 0u64.. {
        match kv.get(&format!("{prefix}{idx}"))? {
            Some(value) => values.push(value),
            None => break,
        }
    }
    Ok(values)
}

/// Delete `prefix0`, `prefix1`, ... up to the first missing index. Returns how many went.
pub fn delete_prefixed_keys<K: KvStore + ?Sized>(kv: &K, prefix: &str) -> StoreResult<usize> {
    let mut deleted = 0;
    for idx in 0u64.. {
        let key = format!("{prefix}{idx}");
        if !kv.has(&key)? {
            break;
        }
        kv.delete(&key)?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Fetch a key that the caller's invariants say must exist.
pub fn get_required<K: KvStore + ?Sized>(kv: &K, key: &str) -> StoreResult<String> {
    kv.get(key)?
        .ok_or_else(|| crate::StoreError::Corrupt(format!("missing required key '{key}'")))
}
