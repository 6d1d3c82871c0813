use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::SyncError;

/// Gzip-compress a serialized blob before it is handed to the blob store.
/// Blobs are deliberately unencrypted so peers without pointer ACL can still
/// read changesets; integrity comes from the signature.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, SyncError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, SyncError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
