//! SHA helpers.
//!
//! Streaming digests are taken by the checksum reader/writer tees in
//! the storage layer; this module only covers one-shot digests of
//! in-memory data, which is how chunk fingerprints are formed.

/// Hex encoded SHA-256, the form chunk fingerprints and manifest
/// checksums are stored in.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(openssl::sha::sha256(data))
}
