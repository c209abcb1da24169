use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};

use crate::debug::StoreDump;
use crate::StoreResult;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kvStore (
    key TEXT PRIMARY KEY,
    value TEXT
);
CREATE TABLE IF NOT EXISTS transcriptSpans (
    vatID TEXT,
    startPos INTEGER,
    endPos INTEGER,
    hash TEXT,
    isCurrent INTEGER CHECK (isCurrent = 1),
    incarnation INTEGER,
    PRIMARY KEY (vatID, startPos),
    UNIQUE (vatID, isCurrent)
);
CREATE TABLE IF NOT EXISTS transcriptItems (
    vatID TEXT,
    position INTEGER,
    item TEXT,
    incarnation INTEGER,
    PRIMARY KEY (vatID, position)
);
CREATE TABLE IF NOT EXISTS transcriptCompressedSpans (
    vatID TEXT,
    startPos INTEGER,
    endPos INTEGER,
    incarnation INTEGER,
    items BLOB,
    PRIMARY KEY (vatID, startPos)
);
";

/// SQLite connection plus the lazily-opened write transaction that spans
/// everything between two commits.
pub(crate) struct Db {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Db {
    pub(crate) fn open(path: Option<&Path>) -> StoreResult<Self> {
        let conn = match path {
            Some(path) => {
                let conn = Connection::open(path)?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.pragma_update(None, "synchronous", "FULL")?;
                conn
            }
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            path: path.map(Path::to_path_buf),
        })
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Every mutation goes through here first so writes accumulate in one transaction.
    pub(crate) fn ensure_txn(&mut self) -> StoreResult<&Connection> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")?;
        }
        Ok(&self.conn)
    }

    pub(crate) fn commit(&mut self) -> StoreResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
            log::debug!("swing-store committed");
        }
        Ok(())
    }

    pub(crate) fn rollback(&mut self) -> StoreResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
            log::debug!("swing-store rolled back uncommitted work");
        }
        Ok(())
    }

    pub(crate) fn kv_get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM kvStore WHERE key = ?1")?;
        Ok(stmt.query_row([key], |row| row.get(0)).optional()?)
    }

    pub(crate) fn kv_next_key(&self, previous_key: &str) -> StoreResult<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key FROM kvStore WHERE key > ?1 ORDER BY key LIMIT 1")?;
        Ok(stmt.query_row([previous_key], |row| row.get(0)).optional()?)
    }

    pub(crate) fn kv_set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.ensure_txn()?;
        conn.prepare_cached("INSERT OR REPLACE INTO kvStore (key, value) VALUES (?1, ?2)")?
            .execute(params![key, value])?;
        Ok(())
    }

    pub(crate) fn kv_delete(&mut self, key: &str) -> StoreResult<()> {
        let conn = self.ensure_txn()?;
        conn.prepare_cached("DELETE FROM kvStore WHERE key = ?1")?
            .execute([key])?;
        Ok(())
    }

    pub(crate) fn savepoint(&mut self, name: &str) -> StoreResult<()> {
        self.ensure_txn()?
            .execute_batch(&format!("SAVEPOINT \"{name}\""))?;
        Ok(())
    }

    pub(crate) fn rollback_to_savepoint(&mut self, name: &str) -> StoreResult<()> {
        self.conn.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT \"{name}\"; RELEASE SAVEPOINT \"{name}\""
        ))?;
        Ok(())
    }

    pub(crate) fn release_savepoint(&mut self, name: &str) -> StoreResult<()> {
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT \"{name}\""))?;
        Ok(())
    }

    /// Populate an empty database from a dump and commit it as the baseline.
    pub(crate) fn load_dump(&mut self, dump: &StoreDump) -> StoreResult<()> {
        let conn = self.ensure_txn()?;
        {
            let mut kv = conn.prepare_cached("INSERT INTO kvStore (key, value) VALUES (?1, ?2)")?;
            for (key, value) in &dump.kv_entries {
                kv.execute(params![key, value])?;
            }
            let mut spans = conn.prepare_cached(
                "INSERT INTO transcriptSpans (vatID, startPos, endPos, hash, isCurrent, incarnation)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for span in &dump.transcript_spans {
                spans.execute(params![
                    span.vat_id,
                    span.start_pos as i64,
                    span.end_pos as i64,
                    span.hash,
                    span.is_current.then_some(1i64),
                    span.incarnation as i64,
                ])?;
            }
            let mut items = conn.prepare_cached(
                "INSERT INTO transcriptItems (vatID, position, item, incarnation) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for item in &dump.transcript_items {
                items.execute(params![
                    item.vat_id,
                    item.position as i64,
                    item.item,
                    item.incarnation as i64,
                ])?;
            }
            let mut compressed = conn.prepare_cached(
                "INSERT INTO transcriptCompressedSpans (vatID, startPos, endPos, incarnation, items)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for span in &dump.compressed_spans {
                compressed.execute(params![
                    span.vat_id,
                    span.start_pos as i64,
                    span.end_pos as i64,
                    span.incarnation as i64,
                    span.blob,
                ])?;
            }
        }
        self.commit()
    }
}
