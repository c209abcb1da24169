//! Introspection and test-support hooks. Nothing here feeds the crank hash.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::transcript::{
    CompressedSpan, TranscriptItem, TranscriptSpan, all_compressed_spans, all_items, all_spans,
};
use crate::{Shared, StoreResult};

/// Full logical content of a store, including uncommitted writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDump {
    pub kv_entries: BTreeMap<String, String>,
    pub transcript_spans: Vec<TranscriptSpan>,
    pub transcript_items: Vec<TranscriptItem>,
    pub compressed_spans: Vec<CompressedSpan>,
}

#[derive(Clone)]
pub struct StoreDebug {
    shared: Shared,
}

impl StoreDebug {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub fn dump(&self) -> StoreResult<StoreDump> {
        let inner = self.shared.lock();
        let conn = inner.db.conn();
        let mut stmt = conn.prepare_cached("SELECT key, value FROM kvStore ORDER BY key")?;
        let kv_entries = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<BTreeMap<String, String>, _>>()?;
        Ok(StoreDump {
            kv_entries,
            transcript_spans: all_spans(conn)?,
            transcript_items: all_items(conn)?,
            compressed_spans: all_compressed_spans(conn)?,
        })
    }

    /// Canonical CBOR snapshot of [`dump`](Self::dump), loadable with
    /// [`SwingStore::open_serialized`](crate::SwingStore::open_serialized).
    pub fn serialize(&self) -> StoreResult<Vec<u8>> {
        let dump = self.dump()?;
        Ok(swing_cbor::to_canonical_cbor(&dump)?)
    }

    /// Compress one retired span explicitly.
    pub fn compress_span(
        &self,
        vat_id: &str,
        start_pos: u64,
        end_pos: u64,
        incarnation: u64,
    ) -> StoreResult<()> {
        self.shared
            .lock()
            .compress_span(vat_id, start_pos, end_pos, incarnation)
    }

    pub fn set_enable_transcript_rollover_compression(&self, enabled: bool) {
        self.shared.lock().options.compress_on_rollover = enabled;
    }
}
