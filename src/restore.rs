//! The restore pipeline: download → verify → decrypt → decompress → adapter.
//!
//! The object is first downloaded to a scratch file while its SHA-256 is
//! compared against the manifest; only a verified stream is fed to the
//! database. Whether to decrypt is decided by sniffing the stream magic,
//! which wins over whatever the manifest claims.

use std::io::{Read, Seek, Write};
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use dbkp_datastore::manifest::manifest_name;
use dbkp_datastore::{ChecksumReader, CryptReader, Manifest};
use dbkp_datastore::crypt_writer::CRYPT_MAGIC;
use dbkp_tools::compression::{decompress_reader, Compression};
use dbkp_tools::crypt_config::KeySource;
use dbkp_tools::error::{Error, Result};

use crate::adapters::{ConnectionInfo, DatabaseAdapter, DryRunRunner, Runner};
use crate::storage::build_storage;

#[derive(Clone, Default)]
pub struct RestoreOptions {
    /// Object name of the backup to restore.
    pub name: String,
    /// Key for encrypted backups.
    pub decrypt_key: Option<KeySource>,
    /// Restores overwrite the target database and must be confirmed.
    pub confirm_restore: bool,
    /// Log the engine commands instead of executing them.
    pub dry_run: bool,
    pub allow_insecure: bool,
    /// Chunks per parity stripe of the source store; 0 disables
    /// recovery of missing chunks.
    pub parity_stripe: usize,
}

/// Restore one backup into the target database.
pub fn run_restore(
    adapter: &dyn DatabaseAdapter,
    conn: &ConnectionInfo,
    runner: &dyn Runner,
    storage_uri: &str,
    options: &RestoreOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    if !options.confirm_restore {
        return Err(Error::Security(
            "destructive operation requires confirmation (set confirm_restore)".into(),
        ));
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let dry_runner = DryRunRunner::new();
    let runner: &dyn Runner = if options.dry_run { &dry_runner } else { runner };

    // the dedup layer is read-transparent: plain objects pass through,
    // chunked objects reassemble via their manifest
    let stack = build_storage(
        storage_uri,
        true,
        options.parity_stripe,
        false,
        options.allow_insecure,
        cancel,
    )?;
    let store = &stack.store;

    let manifest = match store.get_meta(&manifest_name(&options.name)) {
        Ok(data) => Some(Manifest::from_json(&data)?),
        Err(err) if err.is_not_found() => {
            log::warn!(
                "no manifest for '{}', restoring without checksum verification",
                options.name
            );
            None
        }
        Err(err) => return Err(err),
    };

    log::info!(
        "restoring {}/{} into {}{}",
        store.location(),
        options.name,
        conn.scrubbed(),
        if options.dry_run { " (dry-run)" } else { "" }
    );

    let scratch = ScratchFile::create(&options.name)?;
    let mut tee = ChecksumReader::new(store.open(&options.name)?);
    {
        let mut file = std::fs::File::create(&scratch.path)?;
        copy_cancellable(&mut tee, &mut file, cancel)?;
        file.flush()?;
    }
    let (_, digest, size) = tee.finish()?;

    if let Some(manifest) = &manifest {
        let downloaded = hex::encode(digest);
        if downloaded != manifest.checksum {
            return Err(Error::Integrity(format!(
                "checksum mismatch for '{}' - manifest {}, stored {downloaded}",
                options.name, manifest.checksum
            )));
        }
    }
    log::debug!("downloaded {size} bytes, checksum verified");

    let mut file = std::fs::File::open(&scratch.path)?;
    let mut magic = [0u8; 4];
    let got = file.read(&mut magic)?;
    file.rewind()?;
    let encrypted = got == 4 && magic == CRYPT_MAGIC;

    if let Some(manifest) = &manifest {
        if encrypted != manifest.is_encrypted() {
            log::warn!(
                "manifest encryption marker disagrees with the stream header; trusting the stream"
            );
        }
    }

    let decrypted: Box<dyn Read + Send> = if encrypted {
        let key = options.decrypt_key.as_ref().ok_or_else(|| {
            Error::Security("backup is encrypted - a decryption key is required".into())
        })?;
        Box::new(CryptReader::new(std::io::BufReader::new(file), key)?)
    } else {
        Box::new(std::io::BufReader::new(file))
    };

    let compression = manifest
        .as_ref()
        .map(|manifest| manifest.compression)
        .or_else(|| Compression::from_file_name(&options.name))
        .unwrap_or(Compression::None);
    let mut plain = decompress_reader(compression, decrypted)?;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    adapter.run_restore(conn, runner, &mut plain)?;

    store.close()?;
    log::info!("restore of '{}' complete", options.name);
    Ok(())
}

fn copy_cancellable(
    source: &mut dyn Read,
    target: &mut dyn Write,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut buffer = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let count = match source.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(count) => count,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::from_io(err)),
        };
        target.write_all(&buffer[..count])?;
        total += count as u64;
    }
}

/// Temporary download target, removed again on drop.
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn create(name_hint: &str) -> Result<Self> {
        let mut tag = [0u8; 8];
        openssl::rand::rand_bytes(&mut tag)?;
        let file_name = format!(
            "dbkp-restore-{}-{}-{}",
            std::process::id(),
            hex::encode(tag),
            name_hint.replace('/', "_")
        );
        Ok(Self {
            path: std::env::temp_dir().join(file_name),
        })
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("unable to remove scratch file {:?} - {err}", self.path);
            }
        }
    }
}
