use sha2::{Digest, Sha256};

const SEPARATOR: u8 = 0x1f;

/// Deterministic index key for the `chunk_index`-th chunk of a document.
///
/// Re-ingesting the same document identity always yields the same keys, which is
/// what turns a repeated upload into an in-place overwrite.
pub fn record_id(document_identity: &str, chunk_index: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_identity.as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(chunk_index.to_be_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn content_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
