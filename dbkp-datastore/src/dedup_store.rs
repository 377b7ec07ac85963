//! Content addressed deduplicating store.
//!
//! [`DedupStore`] wraps any [`ObjectStore`] and is itself one. Saves are
//! split into content defined chunks stored once under
//! `chunks/<sha256-hex>`; the logical object is reassembled from the
//! chunk list recorded in its manifest. Chunk insertion is idempotent,
//! so parallel saves against the same backend are safe.

use std::collections::HashSet;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use dbkp_tools::error::{Error, Result};
use dbkp_tools::sha::sha256_hex;

use crate::chunker::ChunkSplitter;
use crate::manifest::{self, Manifest};
use crate::object_store::ObjectStore;

/// Name space for content addressed chunks.
pub const CHUNK_PREFIX: &str = "chunks/";
/// Name space for parity objects, below the chunk prefix so plain
/// listings never see it.
pub const PARITY_PREFIX: &str = "chunks/parity/";

pub fn chunk_object_name(digest_hex: &str) -> String {
    format!("{CHUNK_PREFIX}{digest_hex}")
}

/// Result counters of one garbage collection run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcStatus {
    pub examined_chunks: u64,
    pub removed_chunks: u64,
    /// Unreferenced chunks skipped because they are newer than the
    /// live-set snapshot (their manifest may not be committed yet).
    pub pending_chunks: u64,
}

pub struct DedupStore {
    inner: Arc<dyn ObjectStore>,
    last_chunks: Mutex<Vec<String>>,
    /// Chunks per parity stripe; 0 disables parity.
    parity_stripe: usize,
    cancel: CancellationToken,
}

impl DedupStore {
    pub fn new(inner: Arc<dyn ObjectStore>, cancel: CancellationToken) -> Self {
        Self {
            inner,
            last_chunks: Mutex::new(Vec::new()),
            parity_stripe: 0,
            cancel,
        }
    }

    /// Enable XOR parity: one recovery object per `stripe` consecutive
    /// chunks, letting a single missing chunk per stripe be rebuilt.
    pub fn with_parity(inner: Arc<dyn ObjectStore>, stripe: usize, cancel: CancellationToken) -> Self {
        Self {
            inner,
            last_chunks: Mutex::new(Vec::new()),
            parity_stripe: stripe,
            cancel,
        }
    }

    /// Ordered chunk fingerprints recorded by the most recent save, for
    /// embedding into the backup manifest.
    pub fn last_chunks(&self) -> Vec<String> {
        self.last_chunks.lock().unwrap().clone()
    }

    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }

    fn load_manifest(&self, name: &str) -> Result<Manifest> {
        let data = self.inner.get_meta(&manifest::manifest_name(name))?;
        Manifest::from_json(&data)
    }

    /// All committed manifests, excluding the `latest` pointer (it
    /// references, but does not own, chunks).
    fn list_manifests(&self) -> Result<Vec<(String, Manifest)>> {
        let mut manifests = Vec::new();
        for name in self.inner.list_meta("")? {
            if !manifest::is_manifest_name(&name) {
                continue;
            }
            let manifest = Manifest::from_json(&self.inner.get_meta(&name)?)?;
            manifests.push((name, manifest));
        }
        Ok(manifests)
    }

    /// Two phase garbage collection: snapshot the live set from all
    /// committed manifests first, then sweep unreferenced chunks that
    /// were uploaded before the snapshot. Manifests are always written
    /// after their data, so a chunk both older than the snapshot and
    /// unreferenced cannot belong to a committed backup.
    pub fn garbage_collect(&self) -> Result<GcStatus> {
        let snapshot = SystemTime::now();

        let mut live: HashSet<String> = HashSet::new();
        for (_, manifest) in self.list_manifests()? {
            for digest in &manifest.chunks {
                live.insert(chunk_object_name(digest));
            }
            if self.parity_stripe > 0 {
                for stripe in manifest.chunks.chunks(self.parity_stripe) {
                    live.insert(parity_object_name(stripe));
                }
            }
        }

        let mut status = GcStatus::default();
        for name in self.inner.list_meta(CHUNK_PREFIX)? {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            status.examined_chunks += 1;
            if live.contains(&name) {
                continue;
            }
            if let Some(modified) = self.inner.modified(&name)? {
                if modified > snapshot {
                    status.pending_chunks += 1;
                    continue;
                }
            }
            log::debug!("gc: removing unreferenced chunk {name}");
            self.inner.delete(&name)?;
            status.removed_chunks += 1;
        }

        log::info!(
            "gc on {}: {} chunks examined, {} removed, {} pending",
            self.inner.location(),
            status.examined_chunks,
            status.removed_chunks,
            status.pending_chunks
        );
        Ok(status)
    }

    /// Read-only check that every chunk referenced by a committed
    /// manifest exists. Returns the missing `(manifest, chunk)` pairs.
    pub fn verify(&self) -> Result<Vec<(String, String)>> {
        let mut missing = Vec::new();
        for (manifest_file, manifest) in self.list_manifests()? {
            for digest in &manifest.chunks {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                if !self.inner.exists(&chunk_object_name(digest))? {
                    missing.push((manifest_file.clone(), digest.clone()));
                }
            }
        }
        Ok(missing)
    }

    fn store_parity(&self, stripe: &[ParityMember]) -> Result<()> {
        let digests: Vec<String> = stripe.iter().map(|member| member.digest.clone()).collect();
        let name = parity_object_name(&digests);
        if self.inner.exists(&name)? {
            return Ok(());
        }
        let encoded = encode_parity(stripe);
        self.inner.save(&name, &mut &encoded[..])?;
        Ok(())
    }
}

impl ObjectStore for DedupStore {
    /// Split `data` into chunks, upload the ones not yet present and
    /// record the ordered fingerprint list. The logical object under
    /// `name` is implied by the manifest referencing those chunks; no
    /// single blob is stored.
    fn save(&self, name: &str, data: &mut dyn Read) -> Result<String> {
        let mut fingerprints = Vec::new();
        let mut stripe: Vec<ParityMember> = Vec::new();

        for chunk in ChunkSplitter::new(data) {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let chunk = chunk.map_err(Error::from_io)?;
            let digest = sha256_hex(&chunk);
            let object_name = chunk_object_name(&digest);

            if !self.inner.exists(&object_name)? {
                self.inner.save(&object_name, &mut &chunk[..])?;
            }

            if self.parity_stripe > 0 {
                stripe.push(ParityMember {
                    digest: digest.clone(),
                    data: chunk,
                });
                if stripe.len() == self.parity_stripe {
                    self.store_parity(&stripe)?;
                    stripe.clear();
                }
            }
            fingerprints.push(digest);
        }

        if !stripe.is_empty() {
            self.store_parity(&stripe)?;
        }

        log::debug!(
            "deduplicated '{name}' into {} chunks",
            fingerprints.len()
        );
        *self.last_chunks.lock().unwrap() = fingerprints;
        Ok(format!("{}/{name}", self.inner.location()))
    }

    /// Reassemble `name` from its manifest's chunk list; objects without
    /// a (deduplicated) manifest pass through to the wrapped store.
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        match self.load_manifest(name) {
            Ok(manifest) if manifest.is_deduplicated() => Ok(Box::new(ChunkConcatReader {
                store: ChunkSource {
                    inner: self.inner.clone(),
                    parity_stripe: self.parity_stripe,
                },
                chunks: manifest.chunks,
                next: 0,
                current: Vec::new(),
                pos: 0,
            })),
            Ok(_) => self.inner.open(name),
            Err(err) if err.is_not_found() => self.inner.open(name),
            Err(err) => Err(err),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        if self.inner.exists(name)? {
            return Ok(true);
        }
        match self.load_manifest(name) {
            Ok(manifest) => Ok(manifest.is_deduplicated()),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        // chunks are shared; they are reclaimed by garbage collection
        self.inner.delete(name)
    }

    fn put_meta(&self, name: &str, data: &[u8]) -> Result<()> {
        self.inner.put_meta(name, data)
    }

    fn get_meta(&self, name: &str) -> Result<Vec<u8>> {
        self.inner.get_meta(name)
    }

    fn list_meta(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_meta(prefix)
    }

    fn modified(&self, name: &str) -> Result<Option<SystemTime>> {
        self.inner.modified(name)
    }

    fn location(&self) -> String {
        self.inner.location()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

struct ParityMember {
    digest: String,
    data: Vec<u8>,
}

/// `sha256(concatenated fingerprints)` keys one stripe's parity object.
fn parity_object_name(stripe: &[String]) -> String {
    let mut hasher = openssl::sha::Sha256::new();
    for digest in stripe {
        hasher.update(digest.as_bytes());
    }
    format!("{PARITY_PREFIX}{}", hex::encode(hasher.finish()))
}

/// Parity layout: member count (u32 be), member lengths (u32 be each),
/// then the XOR of all members padded to the longest one.
fn encode_parity(stripe: &[ParityMember]) -> Vec<u8> {
    let longest = stripe.iter().map(|m| m.data.len()).max().unwrap_or(0);

    let mut out = Vec::with_capacity(4 + stripe.len() * 4 + longest);
    out.extend_from_slice(&(stripe.len() as u32).to_be_bytes());
    for member in stripe {
        out.extend_from_slice(&(member.data.len() as u32).to_be_bytes());
    }

    let mut xor = vec![0u8; longest];
    for member in stripe {
        for (target, byte) in xor.iter_mut().zip(member.data.iter()) {
            *target ^= byte;
        }
    }
    out.extend_from_slice(&xor);
    out
}

fn decode_parity(raw: &[u8], expected_members: usize) -> Result<(Vec<usize>, Vec<u8>)> {
    let bad = || Error::Integrity("corrupt parity object".into());

    if raw.len() < 4 {
        return Err(bad());
    }
    let count = u32::from_be_bytes(raw[0..4].try_into().unwrap()) as usize;
    if count != expected_members || raw.len() < 4 + count * 4 {
        return Err(bad());
    }

    let mut lengths = Vec::with_capacity(count);
    for i in 0..count {
        let start = 4 + i * 4;
        lengths.push(u32::from_be_bytes(raw[start..start + 4].try_into().unwrap()) as usize);
    }

    let xor = raw[4 + count * 4..].to_vec();
    if xor.len() != lengths.iter().copied().max().unwrap_or(0) {
        return Err(bad());
    }
    Ok((lengths, xor))
}

struct ChunkSource {
    inner: Arc<dyn ObjectStore>,
    parity_stripe: usize,
}

impl ChunkSource {
    fn read_chunk(&self, chunks: &[String], index: usize) -> Result<Vec<u8>> {
        let digest = &chunks[index];
        match self.inner.open(&chunk_object_name(digest)) {
            Ok(mut reader) => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;
                Ok(data)
            }
            Err(err) if err.is_not_found() && self.parity_stripe > 0 => {
                log::warn!("chunk {digest} missing, attempting parity recovery");
                self.recover_chunk(chunks, index)
            }
            Err(err) => Err(err),
        }
    }

    /// Rebuild a single missing chunk from its parity stripe.
    fn recover_chunk(&self, chunks: &[String], index: usize) -> Result<Vec<u8>> {
        let stripe_start = (index / self.parity_stripe) * self.parity_stripe;
        let stripe_end = (stripe_start + self.parity_stripe).min(chunks.len());
        let stripe = &chunks[stripe_start..stripe_end];
        let missing = index - stripe_start;

        let parity_name = parity_object_name(stripe);
        let mut parity_raw = Vec::new();
        self.inner
            .open(&parity_name)?
            .read_to_end(&mut parity_raw)?;
        let (lengths, mut data) = decode_parity(&parity_raw, stripe.len())?;

        for (offset, digest) in stripe.iter().enumerate() {
            if offset == missing {
                continue;
            }
            let mut sibling = Vec::new();
            self.inner
                .open(&chunk_object_name(digest))?
                .read_to_end(&mut sibling)?;
            for (target, byte) in data.iter_mut().zip(sibling.iter()) {
                *target ^= byte;
            }
        }

        data.truncate(lengths[missing]);
        if sha256_hex(&data) != chunks[index] {
            return Err(Error::Integrity(format!(
                "parity recovery of chunk {} produced wrong content",
                chunks[index]
            )));
        }
        Ok(data)
    }
}

/// Sequentially concatenates the referenced chunks into one stream.
struct ChunkConcatReader {
    store: ChunkSource,
    chunks: Vec<String>,
    next: usize,
    current: Vec<u8>,
    pos: usize,
}

impl Read for ChunkConcatReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.next >= self.chunks.len() {
                return Ok(0);
            }
            self.current = self
                .store
                .read_chunk(&self.chunks, self.next)
                .map_err(std::io::Error::from)?;
            self.pos = 0;
            self.next += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parity_encoding_round_trip() -> Result<()> {
        let stripe = vec![
            ParityMember {
                digest: "a".repeat(64),
                data: vec![1, 2, 3, 4],
            },
            ParityMember {
                digest: "b".repeat(64),
                data: vec![9, 9],
            },
        ];
        let encoded = encode_parity(&stripe);
        let (lengths, xor) = decode_parity(&encoded, 2)?;
        assert_eq!(lengths, vec![4, 2]);
        assert_eq!(xor, vec![1 ^ 9, 2 ^ 9, 3, 4]);
        Ok(())
    }

    #[test]
    fn truncated_parity_is_rejected() {
        assert!(decode_parity(&[0, 0], 1).is_err());
        assert!(decode_parity(&[0, 0, 0, 2, 0, 0, 0, 1], 1).is_err());
    }
}
