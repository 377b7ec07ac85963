//! The backup pipeline: adapter → compress → encrypt → store → manifest.
//!
//! The adapter produces the dump on its own thread, layered writers
//! transform it, and the consumer side fingerprints the exact bytes
//! going into storage. The manifest is only written once the data
//! object is fully committed; on any failure the partial object is
//! deleted and no manifest appears.

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use dbkp_datastore::manifest::{manifest_name, LATEST_MANIFEST_NAME};
use dbkp_datastore::prune::{compute_prune_list, KeepOptions, PruneMark};
use dbkp_datastore::{ChecksumReader, CryptWriter, Encryption, Manifest, ObjectStore};
use dbkp_tools::byte_pipe::{byte_pipe, is_pipe_disconnect};
use dbkp_tools::compression::{compress_writer, Compression, FinishWrite};
use dbkp_tools::crypt_config::KeySource;
use dbkp_tools::error::{Error, Result};
use dbkp_tools::uri::scrub_uri;

use crate::adapters::{adapter_for, ConnectionInfo, DatabaseAdapter, Runner};
use crate::storage::build_storage;

/// Buffered pipe blocks between producer and consumer.
const PIPE_DEPTH: usize = 16;

#[derive(Clone, Default)]
pub struct BackupOptions {
    /// Final object name; derived from engine, database and timestamp
    /// when not given.
    pub name: Option<String>,
    pub compression: Compression,
    /// Encrypt with this key; `None` stores plaintext.
    pub encryption: Option<KeySource>,
    /// Split the stream into content defined chunks and deduplicate.
    pub dedup: bool,
    /// Chunks per parity stripe when deduplicating; 0 disables parity.
    pub parity_stripe: usize,
    /// Chain all store mutations into the audit log.
    pub audit: bool,
    pub allow_insecure: bool,
    pub keep: KeepOptions,
}

/// One backup target for batch runs.
pub struct BackupTarget {
    pub database_uri: String,
    pub storage_uri: String,
    pub options: BackupOptions,
}

/// Run one backup and return its committed manifest.
pub fn run_backup(
    adapter: &dyn DatabaseAdapter,
    conn: &ConnectionInfo,
    runner: &dyn Runner,
    storage_uri: &str,
    options: &BackupOptions,
    cancel: &CancellationToken,
) -> Result<Manifest> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let stack = build_storage(
        storage_uri,
        options.dedup,
        options.parity_stripe,
        options.audit,
        options.allow_insecure,
        cancel,
    )?;
    let store = &stack.store;

    adapter.test_connection(conn, runner)?;

    let created_at = Utc::now();
    let final_name = match &options.name {
        Some(name) => name.clone(),
        None => derive_backup_name(adapter.name(), &conn.dbname, options.compression, created_at),
    };

    log::info!(
        "backing up {} to {}/{final_name}",
        conn.scrubbed(),
        store.location()
    );

    let (writer, reader) = byte_pipe(PIPE_DEPTH);
    let fail = writer.fail_handle();

    let (producer_result, save_result, tee_result) = std::thread::scope(|scope| {
        let producer = scope.spawn(move || -> Result<()> {
            let result = (|| -> Result<()> {
                let pipe_sink: Box<dyn FinishWrite> = Box::new(writer);
                let encrypt_sink: Box<dyn FinishWrite> = match &options.encryption {
                    Some(key) => Box::new(CryptWriter::new(pipe_sink, key)?),
                    None => pipe_sink,
                };
                let mut sink = compress_writer(options.compression, encrypt_sink)?;
                adapter.run_backup(conn, runner, &mut sink)?;
                sink.finish()
            })();

            if let Err(err) = &result {
                // mark first so the consumer cannot mistake the torn
                // stream for a clean end
                fail.fail(format!("{err}"));
            }
            result
        });

        let mut tee = ChecksumReader::new(reader);
        let save_result = store.save(&final_name, &mut tee);
        let tee_result = tee.finish();
        let producer_result = producer.join().expect("backup producer panicked");
        (producer_result, save_result, tee_result)
    });

    let location = match (producer_result, save_result) {
        (Ok(()), Ok(location)) => location,
        (producer_result, save_result) => {
            if let Err(err) = store.delete(&final_name) {
                log::warn!("cleanup of partial backup '{final_name}' failed - {err}");
            }
            return Err(pick_root_cause(producer_result.err(), save_result.err()));
        }
    };

    let (_, digest, size) = tee_result?;

    if cancel.is_cancelled() {
        let _ = store.delete(&final_name);
        return Err(Error::Cancelled);
    }

    let mut manifest = Manifest::new(adapter.name(), &conn.dbname, &final_name);
    manifest.version = env!("CARGO_PKG_VERSION").to_string();
    manifest.created_at = created_at;
    manifest.size = size;
    manifest.compression = options.compression;
    manifest.encryption = match options.encryption {
        Some(_) => Encryption::Aes256Gcm,
        None => Encryption::None,
    };
    manifest.checksum = hex::encode(digest);
    if let Some(dedup) = &stack.dedup {
        manifest.chunks = dedup.last_chunks();
    }

    let manifest_json = manifest.to_json()?;
    store.put_meta(&manifest_name(&final_name), &manifest_json)?;
    store.put_meta(LATEST_MANIFEST_NAME, &manifest_json)?;

    log::info!(
        "backup complete: {location} ({size} bytes, checksum {})",
        manifest.checksum
    );

    if options.keep.keeps_anything() {
        let summary = prune_backups(store.as_ref(), adapter.name(), &conn.dbname, &options.keep)?;
        if !summary.removed.is_empty() {
            log::info!(
                "pruned {} old backups ({} kept)",
                summary.removed.len(),
                summary.kept
            );
        }
    }

    store.close()?;
    Ok(manifest)
}

/// Backup every target, collecting per-target failures into one
/// aggregate error while successful targets still commit.
pub fn run_backup_batch(
    targets: &[BackupTarget],
    runner: &dyn Runner,
    cancel: &CancellationToken,
) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    let mut failures = Vec::new();

    for target in targets {
        let result = (|| -> Result<Manifest> {
            let conn = ConnectionInfo::from_uri(&target.database_uri)?;
            let adapter = adapter_for(&conn.engine)?;
            run_backup(
                adapter.as_ref(),
                &conn,
                runner,
                &target.storage_uri,
                &target.options,
                cancel,
            )
        })();

        match result {
            Ok(manifest) => manifests.push(manifest),
            Err(err) => {
                log::error!(
                    "backup of {} failed - {err}",
                    scrub_uri(&target.database_uri)
                );
                failures.push(format!("{}: {err}", scrub_uri(&target.database_uri)));
            }
        }
    }

    if failures.is_empty() {
        Ok(manifests)
    } else {
        Err(Error::Internal(anyhow::anyhow!(
            "{} of {} backups failed:\n{}",
            failures.len(),
            targets.len(),
            failures.join("\n")
        )))
    }
}

/// Outcome of one retention pass.
#[derive(Debug, Default)]
pub struct PruneSummary {
    pub removed: Vec<String>,
    pub kept: usize,
}

/// Apply the retention rules to all backups of one (engine, dbname)
/// pair. Deduplicated backups lose only their manifest; their chunks
/// are reclaimed by a later garbage collection.
pub fn prune_backups(
    store: &dyn ObjectStore,
    engine: &str,
    dbname: &str,
    options: &KeepOptions,
) -> Result<PruneSummary> {
    let mut manifests = Vec::new();
    for name in store.list_meta("")? {
        if !dbkp_datastore::manifest::is_manifest_name(&name) {
            continue;
        }
        let manifest = Manifest::from_json(&store.get_meta(&name)?)?;
        if manifest.engine == engine && manifest.dbname == dbname {
            manifests.push(manifest);
        }
    }

    let decisions = compute_prune_list(manifests, Utc::now(), options)?;
    let mut summary = PruneSummary::default();
    let mut removed_ids = Vec::new();

    for (manifest, mark) in &decisions {
        if mark.keep() {
            summary.kept += 1;
            continue;
        }
        log::info!("pruning backup {}", manifest.filename);
        if !manifest.is_deduplicated() {
            store.delete(&manifest.filename)?;
        }
        store.delete(&manifest_name(&manifest.filename))?;
        removed_ids.push(manifest.id.clone());
        summary.removed.push(manifest.filename.clone());
    }

    // keep the latest pointer off pruned backups
    if !removed_ids.is_empty() {
        refresh_latest_pointer(store, &decisions, &removed_ids)?;
    }

    Ok(summary)
}

fn refresh_latest_pointer(
    store: &dyn ObjectStore,
    decisions: &[(Manifest, PruneMark)],
    removed_ids: &[String],
) -> Result<()> {
    let latest = match store.get_meta(LATEST_MANIFEST_NAME) {
        Ok(data) => Manifest::from_json(&data)?,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err),
    };
    if !removed_ids.contains(&latest.id) {
        return Ok(());
    }

    // decisions are ordered newest first
    match decisions.iter().find(|(_, mark)| mark.keep()) {
        Some((newest_kept, _)) => {
            store.put_meta(LATEST_MANIFEST_NAME, &newest_kept.to_json()?)?;
        }
        None => store.delete(LATEST_MANIFEST_NAME)?,
    }
    Ok(())
}

fn derive_backup_name(
    engine: &str,
    dbname: &str,
    compression: Compression,
    created_at: chrono::DateTime<Utc>,
) -> String {
    let timestamp = created_at.format("%Y%m%d%H%M%S");
    let base = format!("{engine}-{}-{timestamp}", sanitize_name_part(dbname));
    match compression {
        Compression::Tar => format!("{base}.tar"),
        Compression::None => format!("{base}.sql"),
        other => format!(
            "{base}.sql.{}",
            other.extension().expect("non-trivial compression")
        ),
    }
}

/// Database names can be filesystem paths (sqlite); keep object names
/// flat and portable.
fn sanitize_name_part(part: &str) -> String {
    part.trim_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Of two concurrent failures, return the one that is not just "the
/// other side of the pipe went away".
pub(crate) fn pick_root_cause(producer: Option<Error>, consumer: Option<Error>) -> Error {
    match (producer, consumer) {
        (Some(producer), Some(consumer)) => {
            if is_pipe_disconnect(&producer.to_string())
                && !is_pipe_disconnect(&consumer.to_string())
            {
                consumer
            } else {
                producer
            }
        }
        (Some(producer), None) => producer,
        (None, Some(consumer)) => consumer,
        (None, None) => Error::Internal(anyhow::anyhow!("backup failed without an error")),
    }
}
