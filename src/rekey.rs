//! Re-encrypt every encrypted backup with a new key.
//!
//! Each backup is streamed through decrypt-with-old, encrypt-with-new
//! into a fresh data object; the rewritten manifest is committed before
//! the old object disappears, so a crash leaves at worst an orphaned
//! new object for garbage collection.

use tokio_util::sync::CancellationToken;

use dbkp_datastore::manifest::{manifest_name, LATEST_MANIFEST_NAME};
use dbkp_datastore::{ChecksumReader, CryptReader, CryptWriter, Manifest};
use dbkp_tools::byte_pipe::byte_pipe;
use dbkp_tools::compression::FinishWrite;
use dbkp_tools::crypt_config::KeySource;
use dbkp_tools::error::{Error, Result};

use crate::storage::build_storage;

const PIPE_DEPTH: usize = 16;

#[derive(Clone)]
pub struct RekeyOptions {
    pub old_key: KeySource,
    pub new_key: KeySource,
    pub allow_insecure: bool,
    /// Chain store mutations into the audit log.
    pub audit: bool,
    /// Parity stripe of the store, matching the backup configuration.
    pub parity_stripe: usize,
}

#[derive(Debug, Default)]
pub struct RekeySummary {
    /// Old object names that were re-encrypted.
    pub rekeyed: Vec<String>,
    /// Manifests skipped because they are not encrypted.
    pub skipped: usize,
}

/// Re-encrypt all encrypted backups in the given store.
pub fn run_rekey(
    storage_uri: &str,
    options: &RekeyOptions,
    cancel: &CancellationToken,
) -> Result<RekeySummary> {
    let stack = build_storage(
        storage_uri,
        true,
        options.parity_stripe,
        options.audit,
        options.allow_insecure,
        cancel,
    )?;
    let store = &stack.store;

    let mut summary = RekeySummary::default();

    for sidecar in store.list_meta("")? {
        if !dbkp_datastore::manifest::is_manifest_name(&sidecar) {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let manifest = Manifest::from_json(&store.get_meta(&sidecar)?)?;
        if !manifest.is_encrypted() {
            summary.skipped += 1;
            continue;
        }

        let old_name = manifest.filename.clone();
        let new_name = format!("{old_name}_rekeyed");
        log::info!("re-encrypting {old_name} -> {new_name}");

        // the dedup layer reassembles chunked objects transparently
        let source = CryptReader::new(store.open(&old_name)?, &options.old_key)?;

        let deduplicated = manifest.is_deduplicated();
        let (writer, reader) = byte_pipe(PIPE_DEPTH);
        let fail = writer.fail_handle();

        let (producer_result, save_result, tee_result) = std::thread::scope(|scope| {
            let new_key = options.new_key.clone();
            let producer = scope.spawn(move || -> Result<()> {
                let mut source = source;
                let result = (|| -> Result<()> {
                    let pipe_sink: Box<dyn FinishWrite> = Box::new(writer);
                    let mut sink = CryptWriter::new(pipe_sink, &new_key)?;
                    std::io::copy(&mut source, &mut sink).map_err(Error::from_io)?;
                    sink.finish()?;
                    Ok(())
                })();
                if let Err(err) = &result {
                    fail.fail(format!("{err}"));
                }
                result
            });

            let dedup = stack.dedup.as_ref().expect("dedup layer present");
            // a plain backup stays a plain blob: bypass the chunking
            // layer and save through the wrapped store directly
            let target: &dyn dbkp_datastore::ObjectStore = if deduplicated {
                dedup.as_ref()
            } else {
                dedup.inner().as_ref()
            };
            let mut tee = ChecksumReader::new(reader);
            let save_result = target.save(&new_name, &mut tee);
            let tee_result = tee.finish();
            let producer_result = producer.join().expect("rekey producer panicked");
            (producer_result, save_result, tee_result)
        });

        if producer_result.is_err() || save_result.is_err() {
            let _ = store.delete(&new_name);
            return Err(crate::backup::pick_root_cause(
                producer_result.err(),
                save_result.err(),
            ));
        }
        let (_, digest, size) = tee_result?;

        let mut next = manifest.successor(&new_name);
        next.size = size;
        next.checksum = hex::encode(digest);
        if deduplicated {
            next.chunks = stack
                .dedup
                .as_ref()
                .expect("dedup layer present")
                .last_chunks();
        }

        // commit the new manifest before touching the old object
        store.put_meta(&manifest_name(&new_name), &next.to_json()?)?;

        refresh_latest_pointer(store.as_ref(), &manifest, &next)?;

        if !deduplicated {
            store.delete(&old_name)?;
        }
        store.delete(&sidecar)?;

        summary.rekeyed.push(old_name);
    }

    store.close()?;
    log::info!(
        "rekey complete: {} re-encrypted, {} skipped",
        summary.rekeyed.len(),
        summary.skipped
    );
    Ok(summary)
}

fn refresh_latest_pointer(
    store: &dyn dbkp_datastore::ObjectStore,
    old: &Manifest,
    next: &Manifest,
) -> Result<()> {
    match store.get_meta(LATEST_MANIFEST_NAME) {
        Ok(data) => {
            let latest = Manifest::from_json(&data)?;
            if latest.id == old.id {
                store.put_meta(LATEST_MANIFEST_NAME, &next.to_json()?)?;
            }
            Ok(())
        }
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err),
    }
}
