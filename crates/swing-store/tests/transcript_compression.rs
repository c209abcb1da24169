use std::io::Read;

use anyhow::Result;
use flate2::read::GzDecoder;
use rusqlite::Connection;
use swing_store::{DB_FILE_NAME, StoreOptions, SwingStore};
use tempfile::TempDir;

const VAT: &str = "v1";

type SpanRow = (String, u64, u64, u64, Option<i64>);
type ItemRow = (String, u64, String, u64);
type CompressedRow = (String, u64, u64, u64);

struct Observer {
    conn: Connection,
}

impl Observer {
    fn open(dir: &TempDir) -> Result<Self> {
        Ok(Self {
            conn: Connection::open(dir.path().join(DB_FILE_NAME))?,
        })
    }

    fn spans(&self) -> Result<Vec<SpanRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT vatID, startPos, endPos, incarnation, isCurrent FROM transcriptSpans ORDER BY startPos",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                    row.get::<_, i64>(3)? as u64,
                    row.get(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn items(&self) -> Result<Vec<ItemRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT vatID, position, item, incarnation FROM transcriptItems ORDER BY position",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get(2)?,
                    row.get::<_, i64>(3)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn compressed(&self) -> Result<Vec<CompressedRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT vatID, startPos, endPos, incarnation FROM transcriptCompressedSpans ORDER BY startPos",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                    row.get::<_, i64>(3)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn compressed_blobs(&self) -> Result<Vec<Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT items FROM transcriptCompressedSpans ORDER BY startPos")?;
        let blobs = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blobs)
    }

    fn compressed_texts(&self) -> Result<Vec<String>> {
        let mut texts = Vec::new();
        for blob in self.compressed_blobs()? {
            let mut text = String::new();
            GzDecoder::new(blob.as_slice()).read_to_string(&mut text)?;
            texts.push(text);
        }
        Ok(texts)
    }
}

fn span(start: u64, end: u64, incarnation: u64, current: bool) -> SpanRow {
    (VAT.to_string(), start, end, incarnation, current.then_some(1))
}

fn item(position: u64, text: &str, incarnation: u64) -> ItemRow {
    (VAT.to_string(), position, text.to_string(), incarnation)
}

fn compressed(start: u64, end: u64, incarnation: u64) -> CompressedRow {
    (VAT.to_string(), start, end, incarnation)
}

/// Four spans: one in incarnation 0, two retired in incarnation 1, one current.
fn build_history(store: &SwingStore, on_step: &mut dyn FnMut(u32) -> Result<()>) -> Result<()> {
    let kernel = store.kernel_storage();
    let ts = kernel.transcripts();
    let host = store.host_storage();

    ts.init_transcript(VAT)?;
    host.commit()?;
    on_step(0)?;

    ts.add_item(VAT, "start-worker")?;
    ts.add_item(VAT, "shutdown-worker")?;
    host.commit()?;
    on_step(1)?;

    ts.rollover_incarnation(VAT)?;
    host.commit()?;
    on_step(2)?;

    ts.add_item(VAT, "start-worker")?;
    ts.add_item(VAT, "delivery1")?;
    ts.add_item(VAT, "save-snapshot")?;
    host.commit()?;
    on_step(3)?;

    ts.rollover_span(VAT)?;
    host.commit()?;
    on_step(4)?;

    ts.add_item(VAT, "load-snapshot")?;
    ts.add_item(VAT, "delivery2")?;
    ts.add_item(VAT, "save-snapshot")?;
    host.commit()?;
    on_step(5)?;

    ts.rollover_span(VAT)?;
    host.commit()?;
    on_step(6)?;

    ts.add_item(VAT, "load-snapshot")?;
    ts.add_item(VAT, "delivery3")?;
    host.commit()?;
    on_step(7)
}

fn all_items() -> Vec<ItemRow> {
    vec![
        item(0, "start-worker", 0),
        item(1, "shutdown-worker", 0),
        item(2, "start-worker", 1),
        item(3, "delivery1", 1),
        item(4, "save-snapshot", 1),
        item(5, "load-snapshot", 1),
        item(6, "delivery2", 1),
        item(7, "save-snapshot", 1),
        item(8, "load-snapshot", 1),
        item(9, "delivery3", 1),
    ]
}

fn expected_spans(step: u32) -> Vec<SpanRow> {
    match step {
        0 => vec![span(0, 0, 0, true)],
        1 => vec![span(0, 2, 0, true)],
        2 => vec![span(0, 2, 0, false), span(2, 2, 1, true)],
        3 => vec![span(0, 2, 0, false), span(2, 5, 1, true)],
        4 => vec![span(0, 2, 0, false), span(2, 5, 1, false), span(5, 5, 1, true)],
        5 => vec![span(0, 2, 0, false), span(2, 5, 1, false), span(5, 8, 1, true)],
        6 => vec![
            span(0, 2, 0, false),
            span(2, 5, 1, false),
            span(5, 8, 1, false),
            span(8, 8, 1, true),
        ],
        _ => vec![
            span(0, 2, 0, false),
            span(2, 5, 1, false),
            span(5, 8, 1, false),
            span(8, 10, 1, true),
        ],
    }
}

#[test]
fn spans_left_uncompressed_on_rollover() -> Result<()> {
    let dir = TempDir::new()?;
    let store = SwingStore::open(dir.path(), StoreOptions::default())?;
    store.debug().set_enable_transcript_rollover_compression(false);
    let observer = Observer::open(&dir)?;

    let items_after = [0usize, 2, 2, 5, 5, 8, 8, 10];
    build_history(&store, &mut |step: u32| {
        assert_eq!(observer.spans()?, expected_spans(step), "spans at step {step}");
        let expected: Vec<ItemRow> = all_items()
            .into_iter()
            .take(items_after[step as usize])
            .collect();
        assert_eq!(observer.items()?, expected, "items at step {step}");
        assert!(observer.compressed()?.is_empty());
        Ok(())
    })?;

    let debug = store.debug();
    for (_, start, end, incarnation, current) in observer.spans()? {
        if current.is_none() {
            debug.compress_span(VAT, start, end, incarnation)?;
        }
    }
    store.host_storage().commit()?;

    assert_eq!(
        observer.items()?,
        vec![item(8, "load-snapshot", 1), item(9, "delivery3", 1)]
    );
    assert_eq!(
        observer.compressed()?,
        vec![compressed(0, 2, 0), compressed(2, 5, 1), compressed(5, 8, 1)]
    );

    // compressing later yields the same bytes as compressing on rollover
    let eager_dir = TempDir::new()?;
    let eager = SwingStore::open(eager_dir.path(), StoreOptions::default())?;
    build_history(&eager, &mut |_| Ok(()))?;
    let eager_observer = Observer::open(&eager_dir)?;
    assert_eq!(observer.compressed_blobs()?, eager_observer.compressed_blobs()?);
    assert_eq!(observer.compressed_texts()?, eager_observer.compressed_texts()?);

    let ts = store.kernel_storage().transcripts().clone();
    assert_eq!(ts.read_span(VAT, Some(5))?, ["load-snapshot", "delivery2", "save-snapshot"]);
    Ok(())
}

#[test]
fn spans_compressed_on_rollover() -> Result<()> {
    let dir = TempDir::new()?;
    let store = SwingStore::open(dir.path(), StoreOptions::default())?;
    let observer = Observer::open(&dir)?;

    build_history(&store, &mut |step: u32| {
        assert_eq!(observer.spans()?, expected_spans(step), "spans at step {step}");
        let (items, spans): (Vec<ItemRow>, Vec<CompressedRow>) = match step {
            0 => (vec![], vec![]),
            1 => (all_items()[0..2].to_vec(), vec![]),
            2 => (vec![], vec![compressed(0, 2, 0)]),
            3 => (all_items()[2..5].to_vec(), vec![compressed(0, 2, 0)]),
            4 => (vec![], vec![compressed(0, 2, 0), compressed(2, 5, 1)]),
            5 => (
                all_items()[5..8].to_vec(),
                vec![compressed(0, 2, 0), compressed(2, 5, 1)],
            ),
            6 => (
                vec![],
                vec![compressed(0, 2, 0), compressed(2, 5, 1), compressed(5, 8, 1)],
            ),
            _ => (
                all_items()[8..10].to_vec(),
                vec![compressed(0, 2, 0), compressed(2, 5, 1), compressed(5, 8, 1)],
            ),
        };
        assert_eq!(observer.items()?, items, "items at step {step}");
        assert_eq!(observer.compressed()?, spans, "compressed spans at step {step}");
        Ok(())
    })?;

    assert_eq!(
        observer.compressed_texts()?,
        [
            "start-worker\nshutdown-worker\n",
            "start-worker\ndelivery1\nsave-snapshot\n",
            "load-snapshot\ndelivery2\nsave-snapshot\n",
        ]
    );

    let ts = store.kernel_storage().transcripts().clone();
    assert_eq!(ts.read_span(VAT, Some(2))?, ["start-worker", "delivery1", "save-snapshot"]);
    assert_eq!(ts.read_span(VAT, None)?, ["load-snapshot", "delivery3"]);
    Ok(())
}

#[test]
fn committed_transcripts_survive_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let store = SwingStore::open(dir.path(), StoreOptions::default())?;
        let ts = store.kernel_storage().transcripts().clone();
        ts.init_transcript(VAT)?;
        ts.add_item(VAT, "a")?;
        ts.rollover_span(VAT)?;
        ts.add_item(VAT, "b")?;
        store.host_storage().commit()?;
        ts.add_item(VAT, "uncommitted")?;
    }
    let store = SwingStore::open(dir.path(), StoreOptions::default())?;
    let ts = store.kernel_storage().transcripts().clone();
    let bounds = ts.get_current_span_bounds(VAT)?;
    assert_eq!((bounds.start_pos, bounds.end_pos), (1, 2));
    assert_eq!(ts.read_span(VAT, Some(0))?, ["a"]);
    assert_eq!(ts.read_span(VAT, None)?, ["b"]);
    Ok(())
}
