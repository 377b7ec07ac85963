//! End to end pipeline tests on local storage with a mock adapter.

mod util;

use tokio_util::sync::CancellationToken;

use dbkp::adapters::LocalRunner;
use dbkp::datastore::manifest::{manifest_name, LATEST_MANIFEST_NAME};
use dbkp::datastore::prune::KeepOptions;
use dbkp::datastore::{verify_audit, Encryption, LocalStore, Manifest};
use dbkp::tools::compression::Compression;
use dbkp::tools::crypt_config::KeySource;
use dbkp::{run_backup, run_restore, BackupOptions, Error, RestoreOptions, Result};

use util::{mock_connection, storage_uri, test_root, MockAdapter};

fn backup_options() -> BackupOptions {
    BackupOptions::default()
}

#[test]
fn lz4_encrypted_backup_round_trips() -> Result<()> {
    let root = test_root("roundtrip");
    let uri = storage_uri(&root);
    let cancel = CancellationToken::new();
    let runner = LocalRunner::new();

    let dump = util::repeating_pattern(300_000);
    let adapter = MockAdapter::new(dump.clone());

    let options = BackupOptions {
        compression: Compression::Lz4,
        encryption: Some(KeySource::Passphrase("pw".to_string())),
        ..backup_options()
    };
    let manifest = run_backup(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &options,
        &cancel,
    )?;

    assert_eq!(manifest.engine, "mock");
    assert_eq!(manifest.dbname, "testdb");
    assert_eq!(manifest.compression, Compression::Lz4);
    assert_eq!(manifest.encryption, Encryption::Aes256Gcm);
    assert_eq!(manifest.checksum.len(), 64);
    assert!(manifest.size > 0);
    assert!(manifest.chunks.is_empty());
    assert!(manifest.filename.ends_with(".sql.lz4"));

    // the stored object is ciphertext with the stream magic up front
    let stored = std::fs::read(root.join(&manifest.filename))?;
    assert_eq!(&stored[..4], b"DBKP");
    assert_eq!(stored.len() as u64, manifest.size);

    // sidecar and latest pointer agree
    let sidecar = Manifest::from_json(&std::fs::read(
        root.join(manifest_name(&manifest.filename)),
    )?)?;
    assert_eq!(sidecar.id, manifest.id);
    let latest = Manifest::from_json(&std::fs::read(root.join(LATEST_MANIFEST_NAME))?)?;
    assert_eq!(latest.id, manifest.id);

    let restore = RestoreOptions {
        name: manifest.filename.clone(),
        decrypt_key: Some(KeySource::Passphrase("pw".to_string())),
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
fn restore_refuses_without_confirmation() -> Result<()> {
    let root = test_root("confirm-gate");
    let uri = storage_uri(&root);
    let cancel = CancellationToken::new();
    let runner = LocalRunner::new();

    let adapter = MockAdapter::new(b"dump".to_vec());
    let manifest = run_backup(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &backup_options(),
        &cancel,
    )?;

    let restore = RestoreOptions {
        name: manifest.filename.clone(),
        confirm_restore: false,
        ..Default::default()
    };
    match run_restore(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &restore,
        &cancel,
    ) {
        Err(Error::Security(msg)) => assert!(msg.contains("confirm")),
        other => panic!("expected security error, got {other:?}"),
    }
    assert!(adapter.restored().is_empty());

    std::fs::remove_dir_all(&root).unwrap();
    Ok(())
}

#[test]
fn flipped_byte_is_detected_as_integrity_failure() -> Result<()> {
    let root = test_root("integrity");
    let uri = storage_uri(&root);
    let cancel = CancellationToken::new();
    let runner = LocalRunner::new();

    let adapter = MockAdapter::new(util::random_bytes(100_000, 7));
    let manifest = run_backup(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &backup_options(),
        &cancel,
    )?;

    // flip one byte in the stored object
    let object_path = root.join(&manifest.filename);
    let mut stored = std::fs::read(&object_path)?;
    let middle = stored.len() / 2;
    stored[middle] ^= 0x01;
    std::fs::write(&object_path, &stored)?;

    let restore = RestoreOptions {
        name: manifest.filename.clone(),
        confirm_restore: true,
        ..Default::default()
    };
    match run_restore(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &restore,
        &cancel,
    ) {
        Err(Error::Integrity(msg)) => assert!(msg.contains("checksum mismatch")),
        other => panic!("expected integrity error, got {other:?}"),
    }

    std::fs::remove_dir_all(&root).unwrap();
    Ok(())
}

#[test]
fn rekey_rotates_the_encryption_key() -> Result<()> {
    let root = test_root("rekey");
    let uri = storage_uri(&root);
    let cancel = CancellationToken::new();
    let runner = LocalRunner::new();

    let dump = util::repeating_pattern(150_000);
    let adapter = MockAdapter::new(dump.clone());

    let options = BackupOptions {
        compression: Compression::Gzip,
        encryption: Some(KeySource::Passphrase("old".to_string())),
        ..backup_options()
    };
    let manifest = run_backup(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &options,
        &cancel,
    )?;
    let old_name = manifest.filename.clone();
    let new_name = format!("{old_name}_rekeyed");

    let summary = dbkp::run_rekey(
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
    assert_eq!(summary.rekeyed, vec![old_name.clone()]);

    // old object and sidecar gone, new pair present
    assert!(!root.join(&old_name).exists());
    assert!(!root.join(manifest_name(&old_name)).exists());
    assert!(root.join(&new_name).exists());
    let rewritten = Manifest::from_json(&std::fs::read(root.join(manifest_name(&new_name)))?)?;
    assert_eq!(rewritten.parent_id.as_deref(), Some(manifest.id.as_str()));
    assert_eq!(rewritten.encryption, Encryption::Aes256Gcm);
    assert_eq!(rewritten.created_at, manifest.created_at);

    // the latest pointer follows the rekeyed manifest
    let latest = Manifest::from_json(&std::fs::read(root.join(LATEST_MANIFEST_NAME))?)?;
    assert_eq!(latest.id, rewritten.id);

    let mut restore = RestoreOptions {
        name: new_name.clone(),
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

    restore.decrypt_key = Some(KeySource::Passphrase("old".to_string()));
    match run_restore(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &restore,
        &cancel,
    ) {
        Err(Error::Security(_)) => {}
        other => panic!("expected security error, got {other:?}"),
    }

    std::fs::remove_dir_all(&root).unwrap();
    Ok(())
}

#[test]
fn audit_log_covers_pipeline_mutations() -> Result<()> {
    let root = test_root("audit-pipeline");
    let uri = storage_uri(&root);
    let cancel = CancellationToken::new();
    let runner = LocalRunner::new();

    let adapter = MockAdapter::new(b"audited dump".to_vec());
    let options = BackupOptions {
        audit: true,
        ..backup_options()
    };
    let manifest = run_backup(
        &adapter,
        &mock_connection(),
        &runner,
        &uri,
        &options,
        &cancel,
    )?;

    let store = LocalStore::open(&root, CancellationToken::new())?;
    let entries = verify_audit(&store)?;
    // data object save + manifest + latest pointer
    assert!(entries >= 3, "expected at least 3 audit entries, got {entries}");

    let audit_text = std::fs::read_to_string(root.join("audit.jsonl"))?;
    assert!(audit_text.contains(&manifest_name(&manifest.filename)));

    std::fs::remove_dir_all(&root).unwrap();
    Ok(())
}

#[test]
fn retention_prunes_superseded_backups() -> Result<()> {
    let root = test_root("retention");
    let uri = storage_uri(&root);
    let cancel = CancellationToken::new();
    let runner = LocalRunner::new();

    let adapter = MockAdapter::new(util::repeating_pattern(10_000));

    let mut names = Vec::new();
    for index in 0..4 {
        let keep = if index == 3 {
            KeepOptions {
                keep: 2,
                ..Default::default()
            }
        } else {
            KeepOptions::default()
        };
        let options = BackupOptions {
            name: Some(format!("mock-testdb-{index}.sql")),
            keep,
            ..backup_options()
        };
        let manifest = run_backup(
            &adapter,
            &mock_connection(),
            &runner,
            &uri,
            &options,
            &cancel,
        )?;
        names.push(manifest.filename);
        // created_at must strictly increase for a deterministic order
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    // the prune pass after the fourth backup keeps only the newest two
    assert!(!root.join(&names[0]).exists());
    assert!(!root.join(&names[1]).exists());
    assert!(root.join(&names[2]).exists());
    assert!(root.join(&names[3]).exists());
    assert!(!root.join(manifest_name(&names[0])).exists());
    assert!(root.join(manifest_name(&names[3])).exists());

    // latest still points at a surviving backup
    let latest = Manifest::from_json(&std::fs::read(root.join(LATEST_MANIFEST_NAME))?)?;
    assert_eq!(latest.filename, names[3]);

    std::fs::remove_dir_all(&root).unwrap();
    Ok(())
}
