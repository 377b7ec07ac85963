//! Deduplication, garbage collection and parity recovery.

mod util;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use dbkp::adapters::LocalRunner;
use dbkp::datastore::manifest::manifest_name;
use dbkp::datastore::{DedupStore, LocalStore, Manifest, ObjectStore};
use dbkp::tools::crypt_config::KeySource;
use dbkp::{run_backup, run_restore, BackupOptions, Error, RestoreOptions, Result};

use util::{chunk_count, mock_connection, storage_uri, test_root, MockAdapter};

fn dedup_options(name: &str) -> BackupOptions {
    BackupOptions {
        name: Some(name.to_string()),
        dedup: true,
        ..Default::default()
    }
}

fn dedup_view(root: &std::path::Path) -> Result<DedupStore> {
    let inner = LocalStore::open(root, CancellationToken::new())?;
    Ok(DedupStore::new(Arc::new(inner), CancellationToken::new()))
}

#[test]
fn identical_saves_share_all_chunks() -> Result<()> {
    let root = test_root("dedup-idempotent");
    let uri = storage_uri(&root);
    let cancel = CancellationToken::new();
    let runner = LocalRunner::new();

    // 400 KiB of repeating pattern
    let dump = util::repeating_pattern(400 * 1024);
    let adapter = MockAdapter::new(dump.clone());

    let first = run_backup(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &dedup_options("a.sql"),
        &cancel,
    )?;
    assert!(!first.chunks.is_empty());
    let chunks_after_first = chunk_count(&root);

    let second = run_backup(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &dedup_options("b.sql"),
        &cancel,
    )?;

    assert_eq!(first.chunks, second.chunks);
    assert_eq!(chunk_count(&root), chunks_after_first);

    // no standalone blob exists; the object reassembles from chunks
    assert!(!root.join("a.sql").exists());
    let restore = RestoreOptions {
        name: "a.sql".to_string(),
        confirm_restore: true,
        ..Default::default()
    };
    run_restore(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &restore,
        &cancel,
    )?;
    assert_eq!(adapter.restored(), dump);

    std::fs::remove_dir_all(&root).unwrap();
    Ok(())
}

#[test]
fn gc_reclaims_only_unreferenced_chunks() -> Result<()> {
    let root = test_root("dedup-gc");
    let uri = storage_uri(&root);
    let cancel = CancellationToken::new();
    let runner = LocalRunner::new();

    // two backups sharing a prefix, diverging afterwards
    let mut common = util::random_bytes(1024 * 1024, 11);
    let adapter_a = MockAdapter::new(common.clone());
    let manifest_a = run_backup(
        &adapter_a,
        &mock_connection(),
        &runner,
        &uri,
        &dedup_options("a.sql"),
        &cancel,
    )?;

    common.extend_from_slice(&util::random_bytes(1024 * 1024, 23));
    let adapter_b = MockAdapter::new(common);
    let manifest_b = run_backup(
        &adapter_b,
        &mock_connection(),
        &runner,
        &uri,
        &dedup_options("b.sql"),
        &cancel,
    )?;

    let unique_to_a: Vec<&String> = manifest_a
        .chunks
        .iter()
        .filter(|digest| !manifest_b.chunks.contains(digest))
        .collect();
    assert!(!unique_to_a.is_empty());

    // drop a's manifest; its exclusive chunks become garbage
    let store = dedup_view(&root)?;
    store.delete(&manifest_name("a.sql"))?;

    let status = store.garbage_collect()?;
    assert_eq!(status.removed_chunks as usize, unique_to_a.len());

    for digest in &manifest_b.chunks {
        assert!(root.join("chunks").join(digest).exists());
    }
    for digest in unique_to_a {
        assert!(!root.join("chunks").join(digest).exists());
    }

    assert!(store.verify()?.is_empty());

    std::fs::remove_dir_all(&root).unwrap();
    Ok(())
}

#[test]
fn verify_reports_missing_chunks() -> Result<()> {
    let root = test_root("dedup-verify");
    let uri = storage_uri(&root);
    let cancel = CancellationToken::new();
    let runner = LocalRunner::new();

    let adapter = MockAdapter::new(util::random_bytes(600_000, 5));
    let manifest = run_backup(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &dedup_options("a.sql"),
        &cancel,
    )?;

    let victim = &manifest.chunks[1];
    std::fs::remove_file(root.join("chunks").join(victim))?;

    let store = dedup_view(&root)?;
    let missing = store.verify()?;
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].0, manifest_name("a.sql"));
    assert_eq!(&missing[0].1, victim);

    std::fs::remove_dir_all(&root).unwrap();
    Ok(())
}

#[test]
fn parity_recovers_a_single_missing_chunk() -> Result<()> {
    let root = test_root("dedup-parity");
    let uri = storage_uri(&root);
    let cancel = CancellationToken::new();
    let runner = LocalRunner::new();

    let dump = util::random_bytes(900_000, 99);
    let adapter = MockAdapter::new(dump.clone());

    let options = BackupOptions {
        parity_stripe: 4,
        ..dedup_options("a.sql")
    };
    let manifest = run_backup(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &options,
        &cancel,
    )?;
    assert!(manifest.chunks.len() >= 2);

    std::fs::remove_file(root.join("chunks").join(&manifest.chunks[0]))?;

    // without parity the reassembly fails
    let restore_plain = RestoreOptions {
        name: "a.sql".to_string(),
        confirm_restore: true,
        ..Default::default()
    };
    match run_restore(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &restore_plain,
        &cancel,
    ) {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected not_found, got {other:?}"),
    }

    // with the deployment's stripe size the chunk is rebuilt
    let restore = RestoreOptions {
        parity_stripe: 4,
        ..restore_plain
    };
    run_restore(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &restore,
        &cancel,
    )?;
    assert_eq!(adapter.restored(), dump);

    std::fs::remove_dir_all(&root).unwrap();
    Ok(())
}

#[test]
fn rekey_preserves_deduplicated_backups() -> Result<()> {
    let root = test_root("dedup-rekey");
    let uri = storage_uri(&root);
    let cancel = CancellationToken::new();
    let runner = LocalRunner::new();

    let dump = util::repeating_pattern(500_000);
    let adapter = MockAdapter::new(dump.clone());

    let options = BackupOptions {
        encryption: Some(KeySource::Passphrase("old".to_string())),
        ..dedup_options("enc.sql")
    };
    let old_manifest = run_backup(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &options,
        &cancel,
    )?;
    assert!(!old_manifest.chunks.is_empty());

    dbkp::run_rekey(
        &uri,
        &dbkp::RekeyOptions {
            old_key: KeySource::Passphrase("old".to_string()),
            new_key: KeySource::Passphrase("new".to_string()),
            allow_insecure: false,
            audit: false,
            parity_stripe: 0,
        },
        &cancel,
    )?;

    let rewritten =
        Manifest::from_json(&std::fs::read(root.join(manifest_name("enc.sql_rekeyed")))?)?;
    assert!(!rewritten.chunks.is_empty());
    // fresh salt and nonces: the ciphertext chunks cannot coincide
    assert_ne!(rewritten.chunks, old_manifest.chunks);

    let restore = RestoreOptions {
        name: "enc.sql_rekeyed".to_string(),
        decrypt_key: Some(KeySource::Passphrase("new".to_string())),
        confirm_restore: true,
        ..Default::default()
    };
    run_restore(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &restore,
        &cancel,
    )?;
    assert_eq!(adapter.restored(), dump);

    // the old manifest is gone; its chunks are garbage now
    assert!(!root.join(manifest_name("enc.sql")).exists());
    let store = dedup_view(&root)?;
    let status = store.garbage_collect()?;
    assert!(status.removed_chunks > 0);
    assert!(store.verify()?.is_empty());

    std::fs::remove_dir_all(&root).unwrap();
    Ok(())
}
