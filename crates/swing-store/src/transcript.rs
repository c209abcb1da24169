//! Per-vat delivery transcripts, organized as contiguous incarnation-tagged spans.
//!
//! Each vat has exactly one current span that items are appended to. Rolling
//! over closes it and opens a new span at the old end position; retired spans
//! are either compressed into `transcriptCompressedSpans`, left as raw items,
//! or dropped, depending on [`StoreOptions`](crate::StoreOptions).

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use swing_cbor::Hash;

use crate::compression::{gunzip, gzip};
use crate::db::Db;
use crate::{Shared, StoreError, StoreInner, StoreResult};

/// Bounds of a span: items occupy positions `[start_pos, end_pos)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanBounds {
    pub start_pos: u64,
    pub end_pos: u64,
    pub hash: String,
    pub incarnation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSpan {
    pub vat_id: String,
    pub start_pos: u64,
    pub end_pos: u64,
    pub hash: String,
    pub is_current: bool,
    pub incarnation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptItem {
    pub vat_id: String,
    pub position: u64,
    pub item: String,
    pub incarnation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedSpan {
    pub vat_id: String,
    pub start_pos: u64,
    pub end_pos: u64,
    pub incarnation: u64,
    #[serde(with = "serde_bytes")]
    pub blob: Vec<u8>,
}

fn initial_span_hash() -> String {
    Hash::of_bytes(b"").to_hex()
}

fn update_span_hash(prior: &str, item: &str) -> String {
    let item_hash = Hash::of_str(item).to_hex();
    Hash::of_str(&format!("{prior}{item_hash}")).to_hex()
}

fn span_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TranscriptSpan> {
    Ok(TranscriptSpan {
        vat_id: row.get(0)?,
        start_pos: row.get::<_, i64>(1)? as u64,
        end_pos: row.get::<_, i64>(2)? as u64,
        hash: row.get(3)?,
        is_current: row.get::<_, Option<i64>>(4)?.is_some(),
        incarnation: row.get::<_, i64>(5)? as u64,
    })
}

const SPAN_COLUMNS: &str = "vatID, startPos, endPos, hash, isCurrent, incarnation";

fn current_span(conn: &Connection, vat_id: &str) -> StoreResult<Option<TranscriptSpan>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SPAN_COLUMNS} FROM transcriptSpans WHERE vatID = ?1 AND isCurrent = 1"
    ))?;
    let span = stmt.query_row([vat_id], span_from_row).optional()?;
    Ok(span)
}

fn span_at(conn: &Connection, vat_id: &str, start_pos: u64) -> StoreResult<Option<TranscriptSpan>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SPAN_COLUMNS} FROM transcriptSpans WHERE vatID = ?1 AND startPos = ?2"
    ))?;
    let span = stmt
        .query_row(params![vat_id, start_pos as i64], span_from_row)
        .optional()?;
    Ok(span)
}

fn has_spans(conn: &Connection, vat_id: &str) -> StoreResult<bool> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM transcriptSpans WHERE vatID = ?1 LIMIT 1")?;
    Ok(stmt.exists([vat_id])?)
}

fn require_current(conn: &Connection, vat_id: &str) -> StoreResult<TranscriptSpan> {
    current_span(conn, vat_id)?.ok_or_else(|| StoreError::NoCurrentSpan(vat_id.to_string()))
}

fn read_items(conn: &Connection, vat_id: &str, start_pos: u64, end_pos: u64) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT item FROM transcriptItems
         WHERE vatID = ?1 AND position >= ?2 AND position < ?3
         ORDER BY position",
    )?;
    let rows = stmt.query_map(params![vat_id, start_pos as i64, end_pos as i64], |row| {
        row.get::<_, String>(0)
    })?;
    let items = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

fn compressed_blob(conn: &Connection, vat_id: &str, start_pos: u64) -> StoreResult<Option<Vec<u8>>> {
    let mut stmt = conn.prepare_cached(
        "SELECT items FROM transcriptCompressedSpans WHERE vatID = ?1 AND startPos = ?2",
    )?;
    let blob = stmt
        .query_row(params![vat_id, start_pos as i64], |row| row.get(0))
        .optional()?;
    Ok(blob)
}

fn delete_items(db: &mut Db, vat_id: &str, start_pos: u64, end_pos: u64) -> StoreResult<()> {
    db.ensure_txn()?
        .prepare_cached(
            "DELETE FROM transcriptItems WHERE vatID = ?1 AND position >= ?2 AND position < ?3",
        )?
        .execute(params![vat_id, start_pos as i64, end_pos as i64])?;
    Ok(())
}

fn read_checked_items(conn: &Connection, span: &TranscriptSpan) -> StoreResult<Vec<String>> {
    let items = read_items(conn, &span.vat_id, span.start_pos, span.end_pos)?;
    let expected = span.end_pos - span.start_pos;
    if items.len() as u64 != expected {
        return Err(StoreError::MissingTranscriptItems {
            vat_id: span.vat_id.clone(),
            start_pos: span.start_pos,
            expected,
            found: items.len() as u64,
        });
    }
    Ok(items)
}

fn compress_span_inner(
    db: &mut Db,
    vat_id: &str,
    start_pos: u64,
    end_pos: u64,
    incarnation: u64,
) -> StoreResult<()> {
    let span = span_at(db.conn(), vat_id, start_pos)?.ok_or_else(|| StoreError::UnknownSpan {
        vat_id: vat_id.to_string(),
        start_pos,
    })?;
    if span.is_current {
        return Err(StoreError::CurrentSpanNotCompressible {
            vat_id: vat_id.to_string(),
            start_pos,
        });
    }
    if span.end_pos != end_pos || span.incarnation != incarnation {
        return Err(StoreError::SpanMismatch {
            vat_id: vat_id.to_string(),
            start_pos,
            end_pos,
            incarnation,
            actual_end: span.end_pos,
            actual_incarnation: span.incarnation,
        });
    }
    if compressed_blob(db.conn(), vat_id, start_pos)?.is_some() {
        return Err(StoreError::SpanAlreadyCompressed {
            vat_id: vat_id.to_string(),
            start_pos,
        });
    }

    let items = read_checked_items(db.conn(), &span)?;
    let mut text = String::new();
    for item in &items {
        text.push_str(item);
        text.push('\n');
    }
    let blob = gzip(text.as_bytes())?;

    db.ensure_txn()?
        .prepare_cached(
            "INSERT INTO transcriptCompressedSpans (vatID, startPos, endPos, incarnation, items)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?
        .execute(params![
            vat_id,
            start_pos as i64,
            end_pos as i64,
            incarnation as i64,
            blob
        ])?;
    delete_items(db, vat_id, start_pos, end_pos)?;
    log::debug!(
        "compressed transcript span {vat_id}[{start_pos},{end_pos}) inc {incarnation}: {} items, {} bytes",
        items.len(),
        blob.len()
    );
    Ok(())
}

impl StoreInner {
    /// Close the vat's current span and apply the retirement policy to it.
    fn retire_current_span(&mut self, vat_id: &str) -> StoreResult<TranscriptSpan> {
        let old = require_current(self.db.conn(), vat_id)?;
        self.db
            .ensure_txn()?
            .prepare_cached(
                "UPDATE transcriptSpans SET isCurrent = NULL WHERE vatID = ?1 AND isCurrent = 1",
            )?
            .execute([vat_id])?;
        if !self.options.keep_transcripts {
            delete_items(&mut self.db, vat_id, old.start_pos, old.end_pos)?;
        }
        Ok(old)
    }

    fn rollover(&mut self, vat_id: &str, new_incarnation: bool) -> StoreResult<SpanBounds> {
        // the next span would start where this one does
        let current = require_current(self.db.conn(), vat_id)?;
        if current.start_pos == current.end_pos {
            return Err(StoreError::EmptySpan(vat_id.to_string()));
        }
        let old = self.retire_current_span(vat_id)?;
        let incarnation = if new_incarnation {
            old.incarnation + 1
        } else {
            old.incarnation
        };
        let bounds = SpanBounds {
            start_pos: old.end_pos,
            end_pos: old.end_pos,
            hash: initial_span_hash(),
            incarnation,
        };
        self.db
            .ensure_txn()?
            .prepare_cached(
                "INSERT INTO transcriptSpans (vatID, startPos, endPos, hash, isCurrent, incarnation)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            )?
            .execute(params![
                vat_id,
                bounds.start_pos as i64,
                bounds.end_pos as i64,
                bounds.hash,
                incarnation as i64
            ])?;
        if self.options.keep_transcripts && self.options.compress_on_rollover {
            compress_span_inner(
                &mut self.db,
                vat_id,
                old.start_pos,
                old.end_pos,
                old.incarnation,
            )?;
        }
        log::debug!(
            "transcript rollover for {vat_id}: closed [{},{}) inc {}, opened at {} inc {incarnation}",
            old.start_pos,
            old.end_pos,
            old.incarnation,
            bounds.start_pos
        );
        Ok(bounds)
    }
}

/// Transcript facet of the store.
#[derive(Clone)]
pub struct TranscriptStore {
    shared: Shared,
}

impl TranscriptStore {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    /// Open the vat's first span, empty, at position 0, incarnation 0.
    pub fn init_transcript(&self, vat_id: &str) -> StoreResult<()> {
        let mut inner = self.shared.lock();
        // a stopped transcript still owns its spans until deleted
        if has_spans(inner.db.conn(), vat_id)? {
            return Err(StoreError::TranscriptAlreadyInitialized(vat_id.to_string()));
        }
        inner
            .db
            .ensure_txn()?
            .prepare_cached(
                "INSERT INTO transcriptSpans (vatID, startPos, endPos, hash, isCurrent, incarnation)
                 VALUES (?1, 0, 0, ?2, 1, 0)",
            )?
            .execute(params![vat_id, initial_span_hash()])?;
        Ok(())
    }

    pub fn get_current_span_bounds(&self, vat_id: &str) -> StoreResult<SpanBounds> {
        let inner = self.shared.lock();
        let span = require_current(inner.db.conn(), vat_id)?;
        Ok(SpanBounds {
            start_pos: span.start_pos,
            end_pos: span.end_pos,
            hash: span.hash,
            incarnation: span.incarnation,
        })
    }

    /// Append an item at the current span's end position. Returns that position.
    pub fn add_item(&self, vat_id: &str, item: &str) -> StoreResult<u64> {
        if item.contains('\n') {
            return Err(StoreError::InvalidTranscriptItem(vat_id.to_string()));
        }
        let mut inner = self.shared.lock();
        let span = require_current(inner.db.conn(), vat_id)?;
        let position = span.end_pos;
        let hash = update_span_hash(&span.hash, item);
        let conn = inner.db.ensure_txn()?;
        conn.prepare_cached(
            "INSERT INTO transcriptItems (vatID, position, item, incarnation) VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![vat_id, position as i64, item, span.incarnation as i64])?;
        conn.prepare_cached(
            "UPDATE transcriptSpans SET endPos = ?1, hash = ?2 WHERE vatID = ?3 AND isCurrent = 1",
        )?
        .execute(params![(position + 1) as i64, hash, vat_id])?;
        Ok(position)
    }

    /// Close the current span and open the next one in the same incarnation.
    pub fn rollover_span(&self, vat_id: &str) -> StoreResult<SpanBounds> {
        self.shared.lock().rollover(vat_id, false)
    }

    /// Close the current span and open the next one in a new incarnation
    /// (the vat's worker was replaced).
    pub fn rollover_incarnation(&self, vat_id: &str) -> StoreResult<SpanBounds> {
        self.shared.lock().rollover(vat_id, true)
    }

    /// Close the current span without opening another, e.g. when the vat is terminated.
    pub fn stop_using_transcript(&self, vat_id: &str) -> StoreResult<()> {
        let mut inner = self.shared.lock();
        let old = inner.retire_current_span(vat_id)?;
        if inner.options.keep_transcripts && inner.options.compress_on_rollover {
            compress_span_inner(
                &mut inner.db,
                vat_id,
                old.start_pos,
                old.end_pos,
                old.incarnation,
            )?;
        }
        Ok(())
    }

    /// Forget everything ever recorded for the vat.
    pub fn delete_vat_transcripts(&self, vat_id: &str) -> StoreResult<()> {
        let mut inner = self.shared.lock();
        let conn = inner.db.ensure_txn()?;
        for table in [
            "transcriptItems",
            "transcriptSpans",
            "transcriptCompressedSpans",
        ] {
            conn.prepare_cached(&format!("DELETE FROM {table} WHERE vatID = ?1"))?
                .execute([vat_id])?;
        }
        Ok(())
    }

    /// Items of the span starting at `start_pos` (the current span if `None`),
    /// inflating it transparently if it was compressed.
    pub fn read_span(&self, vat_id: &str, start_pos: Option<u64>) -> StoreResult<Vec<String>> {
        let inner = self.shared.lock();
        let conn = inner.db.conn();
        let span = match start_pos {
            None => require_current(conn, vat_id)?,
            Some(start_pos) => span_at(conn, vat_id, start_pos)?.ok_or_else(|| {
                StoreError::UnknownSpan {
                    vat_id: vat_id.to_string(),
                    start_pos,
                }
            })?,
        };
        if let Some(blob) = compressed_blob(conn, vat_id, span.start_pos)? {
            let text = String::from_utf8(gunzip(&blob)?)?;
            return Ok(text.split_terminator('\n').map(str::to_string).collect());
        }
        read_checked_items(conn, &span)
    }

    /// Every span of the vat, ordered by start position.
    pub fn list_spans(&self, vat_id: &str) -> StoreResult<Vec<TranscriptSpan>> {
        let inner = self.shared.lock();
        let mut stmt = inner.db.conn().prepare_cached(&format!(
            "SELECT {SPAN_COLUMNS} FROM transcriptSpans WHERE vatID = ?1 ORDER BY startPos"
        ))?;
        let spans = stmt
            .query_map([vat_id], span_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(spans)
    }
}

impl StoreInner {
    pub(crate) fn compress_span(
        &mut self,
        vat_id: &str,
        start_pos: u64,
        end_pos: u64,
        incarnation: u64,
    ) -> StoreResult<()> {
        compress_span_inner(&mut self.db, vat_id, start_pos, end_pos, incarnation)
    }
}

pub(crate) fn all_spans(conn: &Connection) -> StoreResult<Vec<TranscriptSpan>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SPAN_COLUMNS} FROM transcriptSpans ORDER BY vatID, startPos"
    ))?;
    let spans = stmt
        .query_map([], span_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(spans)
}

pub(crate) fn all_items(conn: &Connection) -> StoreResult<Vec<TranscriptItem>> {
    let mut stmt = conn.prepare_cached(
        "SELECT vatID, position, item, incarnation FROM transcriptItems ORDER BY vatID, position",
    )?;
    let items = stmt
        .query_map([], |row| {
            Ok(TranscriptItem {
                vat_id: row.get(0)?,
                position: row.get::<_, i64>(1)? as u64,
                item: row.get(2)?,
                incarnation: row.get::<_, i64>(3)? as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub(crate) fn all_compressed_spans(conn: &Connection) -> StoreResult<Vec<CompressedSpan>> {
    let mut stmt = conn.prepare_cached(
        "SELECT vatID, startPos, endPos, incarnation, items FROM transcriptCompressedSpans
         ORDER BY vatID, startPos",
    )?;
    let spans = stmt
        .query_map([], |row| {
            Ok(CompressedSpan {
                vat_id: row.get(0)?,
                start_pos: row.get::<_, i64>(1)? as u64,
                end_pos: row.get::<_, i64>(2)? as u64,
                incarnation: row.get::<_, i64>(3)? as u64,
                blob: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StoreOptions, SwingStore};

    fn store_with(options: StoreOptions) -> (SwingStore, TranscriptStore) {
        let store = SwingStore::open_in_memory(options).unwrap();
        let ts = store.kernel_storage().transcripts().clone();
        (store, ts)
    }

    #[test]
    fn init_and_append() {
        let (_store, ts) = store_with(StoreOptions::default());
        ts.init_transcript("v1").unwrap();
        let bounds = ts.get_current_span_bounds("v1").unwrap();
        assert_eq!((bounds.start_pos, bounds.end_pos, bounds.incarnation), (0, 0, 0));
        assert_eq!(bounds.hash, initial_span_hash());

        assert_eq!(ts.add_item("v1", "start-worker").unwrap(), 0);
        assert_eq!(ts.add_item("v1", "shutdown-worker").unwrap(), 1);
        let bounds = ts.get_current_span_bounds("v1").unwrap();
        assert_eq!((bounds.start_pos, bounds.end_pos), (0, 2));
        let expected = update_span_hash(
            &update_span_hash(&initial_span_hash(), "start-worker"),
            "shutdown-worker",
        );
        assert_eq!(bounds.hash, expected);
        assert_eq!(ts.read_span("v1", None).unwrap(), ["start-worker", "shutdown-worker"]);
    }

    #[test]
    fn double_init_is_rejected() {
        let (_store, ts) = store_with(StoreOptions::default());
        ts.init_transcript("v1").unwrap();
        assert!(matches!(
            ts.init_transcript("v1").unwrap_err(),
            StoreError::TranscriptAlreadyInitialized(_)
        ));

        ts.add_item("v1", "x").unwrap();
        ts.stop_using_transcript("v1").unwrap();
        assert!(matches!(
            ts.init_transcript("v1").unwrap_err(),
            StoreError::TranscriptAlreadyInitialized(_)
        ));
        ts.delete_vat_transcripts("v1").unwrap();
        ts.init_transcript("v1").unwrap();
        assert_eq!(ts.get_current_span_bounds("v1").unwrap().end_pos, 0);
    }

    #[test]
    fn items_need_a_current_span_and_no_newlines() {
        let (_store, ts) = store_with(StoreOptions::default());
        assert!(matches!(
            ts.add_item("v9", "x").unwrap_err(),
            StoreError::NoCurrentSpan(_)
        ));
        ts.init_transcript("v9").unwrap();
        assert!(matches!(
            ts.add_item("v9", "two\nlines").unwrap_err(),
            StoreError::InvalidTranscriptItem(_)
        ));
        assert!(matches!(
            ts.rollover_span("v9").unwrap_err(),
            StoreError::EmptySpan(_)
        ));
    }

    #[test]
    fn read_span_inflates_compressed_spans() {
        let (_store, ts) = store_with(StoreOptions::default());
        ts.init_transcript("v1").unwrap();
        ts.add_item("v1", "a").unwrap();
        ts.add_item("v1", "b").unwrap();
        ts.rollover_span("v1").unwrap();
        ts.add_item("v1", "c").unwrap();
        assert_eq!(ts.read_span("v1", Some(0)).unwrap(), ["a", "b"]);
        assert_eq!(ts.read_span("v1", Some(2)).unwrap(), ["c"]);
        assert_eq!(ts.read_span("v1", None).unwrap(), ["c"]);
        assert!(ts.read_span("v1", Some(1)).is_err());
    }

    #[test]
    fn dropped_transcripts_lose_retired_items() {
        let options = StoreOptions {
            keep_transcripts: false,
            ..StoreOptions::default()
        };
        let (store, ts) = store_with(options);
        ts.init_transcript("v1").unwrap();
        ts.add_item("v1", "a").unwrap();
        ts.rollover_span("v1").unwrap();
        let dump = store.debug().dump().unwrap();
        assert!(dump.transcript_items.is_empty());
        assert!(dump.compressed_spans.is_empty());
        assert!(matches!(
            ts.read_span("v1", Some(0)).unwrap_err(),
            StoreError::MissingTranscriptItems { .. }
        ));
    }

    #[test]
    fn stop_and_delete() {
        let (store, ts) = store_with(StoreOptions::default());
        ts.init_transcript("v1").unwrap();
        ts.add_item("v1", "a").unwrap();
        ts.stop_using_transcript("v1").unwrap();
        assert!(ts.get_current_span_bounds("v1").is_err());
        assert_eq!(ts.list_spans("v1").unwrap().len(), 1);
        assert_eq!(ts.read_span("v1", Some(0)).unwrap(), ["a"]);

        ts.delete_vat_transcripts("v1").unwrap();
        let dump = store.debug().dump().unwrap();
        assert!(dump.transcript_spans.is_empty());
        assert!(dump.compressed_spans.is_empty());
        ts.init_transcript("v1").unwrap();
    }

    #[test]
    fn compressing_current_or_mismatched_spans_fails() {
        let (store, ts) = store_with(StoreOptions {
            compress_on_rollover: false,
            ..StoreOptions::default()
        });
        let debug = store.debug();
        ts.init_transcript("v1").unwrap();
        ts.add_item("v1", "a").unwrap();
        assert!(matches!(
            debug.compress_span("v1", 0, 1, 0).unwrap_err(),
            StoreError::CurrentSpanNotCompressible { .. }
        ));
        ts.rollover_span("v1").unwrap();
        assert!(matches!(
            debug.compress_span("v1", 0, 2, 0).unwrap_err(),
            StoreError::SpanMismatch { .. }
        ));
        debug.compress_span("v1", 0, 1, 0).unwrap();
        assert!(matches!(
            debug.compress_span("v1", 0, 1, 0).unwrap_err(),
            StoreError::SpanAlreadyCompressed { .. }
        ));
    }
}
