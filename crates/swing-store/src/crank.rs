use swing_cbor::Hasher;

use crate::{StoreError, StoreInner, StoreResult};

pub(crate) const ACTIVITYHASH_KEY: &str = "activityhash";

/// Result of closing out a crank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrankHashes {
    pub crankhash: String,
    pub activityhash: String,
}

/// In-memory crank bookkeeping. None of this is persisted: after a crash the
/// uncommitted crank is gone anyway, and the activity hash lives in the KV table.
#[derive(Debug, Default)]
pub(crate) struct CrankState {
    hasher: Hasher,
    in_crank: bool,
    savepoints: Vec<(String, Hasher)>,
}

impl CrankState {
    pub(crate) fn in_crank(&self) -> bool {
        self.in_crank
    }

    pub(crate) fn record_set(&mut self, key: &str, value: &str) {
        self.hasher.update("add\n");
        self.hasher.update(key);
        self.hasher.update("\n");
        self.hasher.update(value);
        self.hasher.update("\n");
    }

    pub(crate) fn record_delete(&mut self, key: &str) {
        self.hasher.update("delete\n");
        self.hasher.update(key);
        self.hasher.update("\n");
    }

    fn take_crankhash(&mut self) -> String {
        std::mem::take(&mut self.hasher).finish().to_hex()
    }
}

fn valid_savepoint_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl StoreInner {
    pub(crate) fn start_crank(&mut self) -> StoreResult<()> {
        if self.crank.in_crank {
            return Err(StoreError::CrankInProgress);
        }
        self.crank.in_crank = true;
        self.crank.savepoints.clear();
        Ok(())
    }

    pub(crate) fn establish_crank_savepoint(&mut self, name: &str) -> StoreResult<()> {
        if !self.crank.in_crank {
            return Err(StoreError::NoCrankInProgress);
        }
        if !valid_savepoint_name(name) {
            return Err(StoreError::InvalidSavepoint(name.to_string()));
        }
        self.db.savepoint(name)?;
        self.crank
            .savepoints
            .push((name.to_string(), self.crank.hasher.clone()));
        Ok(())
    }

    pub(crate) fn rollback_crank(&mut self, name: &str) -> StoreResult<()> {
        if !self.crank.in_crank {
            return Err(StoreError::NoCrankInProgress);
        }
        let idx = self
            .crank
            .savepoints
            .iter()
            .position(|(sp, _)| sp == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;
        self.db.rollback_to_savepoint(name)?;
        let (_, hasher) = self.crank.savepoints.swap_remove(idx);
        self.crank.savepoints.truncate(idx);
        self.crank.hasher = hasher;
        log::debug!("crank rolled back to savepoint {name}");
        Ok(())
    }

    pub(crate) fn end_crank(&mut self) -> StoreResult<()> {
        if !self.crank.in_crank {
            return Err(StoreError::NoCrankInProgress);
        }
        if let Some((outermost, _)) = self.crank.savepoints.first() {
            let outermost = outermost.clone();
            self.db.release_savepoint(&outermost)?;
        }
        self.crank.savepoints.clear();
        self.crank.in_crank = false;
        Ok(())
    }

    pub(crate) fn activityhash(&self) -> StoreResult<String> {
        Ok(self.db.kv_get(ACTIVITYHASH_KEY)?.unwrap_or_default())
    }

    /// Finalize the crank hash, fold it into the activity hash, and reset.
    /// The activity hash is written around the crank hasher so it never
    /// feeds back into itself.
    pub(crate) fn emit_crank_hashes(&mut self) -> StoreResult<CrankHashes> {
        let crankhash = self.crank.take_crankhash();
        let previous = self.activityhash()?;
        let mut hasher = Hasher::new();
        hasher.update("activityhash\n");
        hasher.update(&previous);
        hasher.update("\n");
        hasher.update(&crankhash);
        hasher.update("\n");
        let activityhash = hasher.finish().to_hex();
        self.db.kv_set(ACTIVITYHASH_KEY, &activityhash)?;
        Ok(CrankHashes {
            crankhash,
            activityhash,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{KvStore, StoreOptions, SwingStore};
    use swing_cbor::Hash;

    fn store() -> SwingStore {
        SwingStore::open_in_memory(StoreOptions::default()).expect("open")
    }

    #[test]
    fn empty_crank_hashes_nothing() {
        let kernel = store().kernel_storage();
        let hashes = kernel.emit_crank_hashes().expect("emit");
        assert_eq!(hashes.crankhash, Hash::of_bytes(b"").to_hex());
        let expected = Hash::of_str(&format!("activityhash\n\n{}\n", hashes.crankhash));
        assert_eq!(hashes.activityhash, expected.to_hex());
        assert_eq!(kernel.get_activityhash().expect("get"), hashes.activityhash);
    }

    #[test]
    fn mutations_hash_in_call_order() {
        let kernel = store().kernel_storage();
        kernel.kv().set("one", "1").expect("set");
        let first = kernel.emit_crank_hashes().expect("emit");
        assert_eq!(first.crankhash, Hash::of_str("add\none\n1\n").to_hex());

        kernel.kv().set("one", "1").expect("set");
        kernel.kv().delete("one").expect("delete");
        let second = kernel.emit_crank_hashes().expect("emit");
        assert_eq!(
            second.crankhash,
            Hash::of_str("add\none\n1\ndelete\none\n").to_hex()
        );
        let chained = Hash::of_str(&format!(
            "activityhash\n{}\n{}\n",
            first.activityhash, second.crankhash
        ));
        assert_eq!(second.activityhash, chained.to_hex());
    }

    #[test]
    fn local_keys_do_not_affect_crankhash() {
        let kernel = store().kernel_storage();
        kernel.kv().set("local.noise", "whatever").expect("set");
        kernel.kv().delete("local.noise").expect("delete");
        let hashes = kernel.emit_crank_hashes().expect("emit");
        assert_eq!(hashes.crankhash, Hash::of_bytes(b"").to_hex());
    }

    #[test]
    fn rollback_restores_state_and_hash() {
        let kernel = store().kernel_storage();
        kernel.start_crank().expect("start");
        kernel.kv().set("kept", "yes").expect("set");
        kernel.establish_crank_savepoint("deliver").expect("savepoint");
        kernel.kv().set("dropped", "no").expect("set");
        kernel.transcripts().init_transcript("v1").expect("init");
        kernel.rollback_crank("deliver").expect("rollback");
        kernel.end_crank().expect("end");

        assert!(kernel.kv().has("kept").expect("has"));
        assert!(!kernel.kv().has("dropped").expect("has"));
        assert!(kernel.transcripts().get_current_span_bounds("v1").is_err());
        let hashes = kernel.emit_crank_hashes().expect("emit");
        assert_eq!(hashes.crankhash, Hash::of_str("add\nkept\nyes\n").to_hex());
    }

    #[test]
    fn savepoints_require_a_crank() {
        let kernel = store().kernel_storage();
        assert!(kernel.establish_crank_savepoint("x").is_err());
        kernel.start_crank().expect("start");
        assert!(kernel.start_crank().is_err());
        assert!(kernel.establish_crank_savepoint("bad name").is_err());
        assert!(kernel.rollback_crank("missing").is_err());
        kernel.end_crank().expect("end");
    }
}
