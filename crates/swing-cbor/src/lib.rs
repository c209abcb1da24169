//! SHA-256 digests in the kernel's hex form, and the canonical CBOR encoding
//! used for store snapshots.

use std::fmt;

use serde::Serialize;
use serde_cbor::value::Value as CborValue;
use sha2::{Digest, Sha256};

/// Encode `value` as self-described CBOR with map keys in canonical order, so
/// equal contents always produce equal bytes.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let canonical: CborValue = serde_cbor::value::to_value(value)?;
    let mut buf = Vec::with_capacity(256);
    let mut serializer = serde_cbor::ser::Serializer::new(&mut buf);
    serializer.self_describe()?;
    canonical.serialize(&mut serializer)?;
    Ok(buf)
}

/// A finished SHA-256 digest. Crank, activity and span hashes are all
/// recorded as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(bytes);
        hasher.finish()
    }

    pub fn of_str(text: &str) -> Self {
        Self::of_bytes(text.as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_hex()).finish()
    }
}

/// Incremental SHA-256. Cloning captures the running state, which is how
/// crank savepoints remember where the crank hash stood.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: impl AsRef<[u8]>) {
        self.inner.update(bytes.as_ref());
    }

    pub fn finish(self) -> Hash {
        Hash(self.inner.finalize().into())
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn empty_digest_matches_sha256() {
        assert_eq!(
            Hash::of_bytes(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn incremental_hasher_matches_one_shot() {
        let mut hasher = Hasher::new();
        hasher.update("add\n");
        hasher.update("one\n");
        hasher.update("1\n");
        let forked = hasher.clone();
        assert_eq!(hasher.finish(), Hash::of_str("add\none\n1\n"));
        assert_eq!(forked.finish(), Hash::of_str("add\none\n1\n"));
    }

    #[test]
    fn canonical_encoding_ignores_insertion_order() {
        let a: BTreeMap<String, u32> = [("zeta".to_string(), 1), ("alpha".to_string(), 2)]
            .into_iter()
            .collect();
        let b: BTreeMap<String, u32> = [("alpha".to_string(), 2), ("zeta".to_string(), 1)]
            .into_iter()
            .collect();
        let bytes = to_canonical_cbor(&a).expect("encode");
        assert_eq!(bytes, to_canonical_cbor(&b).expect("encode"));
        let decoded: BTreeMap<String, u32> = serde_cbor::from_slice(&bytes).expect("decode");
        assert_eq!(decoded, a);
    }
}
