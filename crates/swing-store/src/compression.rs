use std::io::{Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};

use crate::{StoreError, StoreResult};

/// Gzip with a fixed header (no mtime, no file name) so identical input
/// always yields identical bytes, whenever compression happens.
pub(crate) fn gzip(data: &[u8]) -> StoreResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(StoreError::Compression)?;
    encoder.finish().map_err(StoreError::Compression)
}

pub(crate) fn gunzip(data: &[u8]) -> StoreResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(StoreError::Compression)?;
    Ok(out)
}
