//! Durable, hash-tracked storage for the kernel: an ordered string KV table, a
//! per-crank consensus hash chain, and per-vat delivery transcripts, all
//! backed by a single SQLite database and committed atomically.

mod compression;
mod crank;
mod db;
pub mod debug;
pub mod helpers;
pub mod kv;
pub mod transcript;

pub use crank::CrankHashes;
pub use debug::{StoreDebug, StoreDump};
pub use kv::{HostKvStore, KernelKvStore, KvStore};
pub use transcript::{CompressedSpan, SpanBounds, TranscriptItem, TranscriptSpan, TranscriptStore};

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crank::CrankState;
use db::Db;

pub type StoreResult<T> = Result<T, StoreError>;

/// File name of the database inside a store directory.
pub const DB_FILE_NAME: &str = "swingstore.sqlite";

/// Prefix of keys owned by the host application; kernel code may not write them.
pub const HOST_KEY_PREFIX: &str = "host.";

/// Prefix of node-private keys; written normally but excluded from the crank hash.
pub const LOCAL_KEY_PREFIX: &str = "local.";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("key '{0}' is reserved for the host")]
    ReservedKey(String),
    #[error("host key '{0}' must start with '{HOST_KEY_PREFIX}'")]
    NotHostKey(String),
    #[error("transcript for vat {0} is already initialized")]
    TranscriptAlreadyInitialized(String),
    #[error("vat {0} has no current transcript span")]
    NoCurrentSpan(String),
    #[error("vat {vat_id} has no transcript span starting at {start_pos}")]
    UnknownSpan { vat_id: String, start_pos: u64 },
    #[error(
        "span {vat_id}@{start_pos} is [{actual_end},inc {actual_incarnation}], not [{end_pos},inc {incarnation}]"
    )]
    SpanMismatch {
        vat_id: String,
        start_pos: u64,
        end_pos: u64,
        incarnation: u64,
        actual_end: u64,
        actual_incarnation: u64,
    },
    #[error("span {vat_id}@{start_pos} is current and cannot be compressed")]
    CurrentSpanNotCompressible { vat_id: String, start_pos: u64 },
    #[error("span {vat_id}@{start_pos} is already compressed")]
    SpanAlreadyCompressed { vat_id: String, start_pos: u64 },
    #[error("span {vat_id}@{start_pos} expected {expected} items, found {found}")]
    MissingTranscriptItems {
        vat_id: String,
        start_pos: u64,
        expected: u64,
        found: u64,
    },
    #[error("current span of vat {0} is empty and cannot be rolled over")]
    EmptySpan(String),
    #[error("transcript item for vat {0} contains a newline")]
    InvalidTranscriptItem(String),
    #[error("compression failure: {0}")]
    Compression(#[source] io::Error),
    #[error("decompressed transcript is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("a crank is already in progress")]
    CrankInProgress,
    #[error("no crank is in progress")]
    NoCrankInProgress,
    #[error("invalid savepoint name '{0}'")]
    InvalidSavepoint(String),
    #[error("unknown savepoint '{0}'")]
    UnknownSavepoint(String),
    #[error("cannot commit while a crank is in progress")]
    CommitDuringCrank,
    #[error("corrupt store entry: {0}")]
    Corrupt(String),
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

/// Store-level switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Retain retired transcript spans. When false, their items are dropped on rollover.
    pub keep_transcripts: bool,
    /// Compress retired spans as part of rollover (only when transcripts are kept).
    pub compress_on_rollover: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            keep_transcripts: true,
            compress_on_rollover: true,
        }
    }
}

pub(crate) struct StoreInner {
    pub(crate) db: Db,
    pub(crate) crank: CrankState,
    pub(crate) options: StoreOptions,
}

/// Handle shared by every storage facet. Clones refer to the same database.
#[derive(Clone)]
pub(crate) struct Shared(Arc<Mutex<StoreInner>>);

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Entry point: owns the database and hands out the kernel, host, and debug facets.
#[derive(Clone)]
pub struct SwingStore {
    shared: Shared,
}

impl std::fmt::Debug for SwingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("SwingStore")
            .field("path", &inner.db.path())
            .field("options", &inner.options)
            .finish()
    }
}

impl SwingStore {
    /// Open (or create) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> StoreResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        let db = Db::open(Some(&dir.join(DB_FILE_NAME)))?;
        Ok(Self::from_db(db, options))
    }

    /// Ephemeral store; everything is lost when the last handle is dropped.
    pub fn open_in_memory(options: StoreOptions) -> StoreResult<Self> {
        Ok(Self::from_db(Db::open(None)?, options))
    }

    /// Build an in-memory store from bytes produced by [`StoreDebug::serialize`].
    pub fn open_serialized(bytes: &[u8], options: StoreOptions) -> StoreResult<Self> {
        let dump: StoreDump = serde_cbor::from_slice(bytes)?;
        let mut db = Db::open(None)?;
        db.load_dump(&dump)?;
        Ok(Self::from_db(db, options))
    }

    fn from_db(db: Db, options: StoreOptions) -> Self {
        Self {
            shared: Shared(Arc::new(Mutex::new(StoreInner {
                db,
                crank: CrankState::default(),
                options,
            }))),
        }
    }

    pub fn kernel_storage(&self) -> KernelStorage {
        KernelStorage {
            kv: KernelKvStore::new(self.shared.clone()),
            transcripts: TranscriptStore::new(self.shared.clone()),
            shared: self.shared.clone(),
        }
    }

    pub fn host_storage(&self) -> HostStorage {
        HostStorage {
            kv: HostKvStore::new(self.shared.clone()),
            shared: self.shared.clone(),
        }
    }

    pub fn debug(&self) -> StoreDebug {
        StoreDebug::new(self.shared.clone())
    }
}

/// The kernel's view of the store: hashed KV, transcripts, and crank control.
#[derive(Clone)]
pub struct KernelStorage {
    kv: KernelKvStore,
    transcripts: TranscriptStore,
    shared: Shared,
}

impl KernelStorage {
    pub fn kv(&self) -> &KernelKvStore {
        &self.kv
    }

    pub fn transcripts(&self) -> &TranscriptStore {
        &self.transcripts
    }

    pub fn start_crank(&self) -> StoreResult<()> {
        self.shared.lock().start_crank()
    }

    pub fn establish_crank_savepoint(&self, name: &str) -> StoreResult<()> {
        self.shared.lock().establish_crank_savepoint(name)
    }

    /// Undo every write made since `name` was established, including the
    /// crank hash contributions of those writes.
    pub fn rollback_crank(&self, name: &str) -> StoreResult<()> {
        self.shared.lock().rollback_crank(name)
    }

    pub fn end_crank(&self) -> StoreResult<()> {
        self.shared.lock().end_crank()
    }

    pub fn emit_crank_hashes(&self) -> StoreResult<CrankHashes> {
        self.shared.lock().emit_crank_hashes()
    }

    pub fn get_activityhash(&self) -> StoreResult<String> {
        self.shared.lock().activityhash()
    }
}

/// The host application's view: its own `host.` key space and durability control.
#[derive(Clone)]
pub struct HostStorage {
    kv: HostKvStore,
    shared: Shared,
}

impl HostStorage {
    pub fn kv(&self) -> &HostKvStore {
        &self.kv
    }

    /// Atomically persist everything written since the previous commit.
    pub fn commit(&self) -> StoreResult<()> {
        let mut inner = self.shared.lock();
        if inner.crank.in_crank() {
            return Err(StoreError::CommitDuringCrank);
        }
        inner.db.commit()
    }

    /// Discard uncommitted work, as if the process had crashed before commit.
    pub fn abort(&self) -> StoreResult<()> {
        let mut inner = self.shared.lock();
        inner.db.rollback()?;
        inner.crank = CrankState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn uncommitted_writes_vanish_on_reopen() {
        let dir = TempDir::new().expect("tmp");
        {
            let store = SwingStore::open(dir.path(), StoreOptions::default()).expect("open");
            let kernel = store.kernel_storage();
            kernel.kv().set("kept", "1").expect("set");
            store.host_storage().commit().expect("commit");
            kernel.kv().set("lost", "2").expect("set");
            kernel.emit_crank_hashes().expect("emit");
        }
        let store = SwingStore::open(dir.path(), StoreOptions::default()).expect("reopen");
        let kv = store.kernel_storage().kv().clone();
        assert_eq!(kv.get("kept").expect("get"), Some("1".to_string()));
        assert_eq!(kv.get("lost").expect("get"), None);
        assert_eq!(kv.get("activityhash").expect("get"), None);
    }

    #[test]
    fn abort_discards_pending_work() {
        let store = SwingStore::open_in_memory(StoreOptions::default()).expect("open");
        let kernel = store.kernel_storage();
        let host = store.host_storage();
        kernel.kv().set("a", "1").expect("set");
        host.commit().expect("commit");
        kernel.kv().set("b", "2").expect("set");
        host.abort().expect("abort");
        assert!(kernel.kv().has("a").expect("has"));
        assert!(!kernel.kv().has("b").expect("has"));
    }

    #[test]
    fn commit_refused_inside_crank() {
        let store = SwingStore::open_in_memory(StoreOptions::default()).expect("open");
        let kernel = store.kernel_storage();
        kernel.start_crank().expect("start");
        let err = store.host_storage().commit().expect_err("in crank");
        assert!(matches!(err, StoreError::CommitDuringCrank));
        kernel.end_crank().expect("end");
        store.host_storage().commit().expect("commit");
    }
}
