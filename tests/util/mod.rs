//! Shared helpers for the integration tests.
// each test binary uses a different subset of these
#![allow(dead_code)]

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dbkp::adapters::{ConnectionInfo, DatabaseAdapter, Runner};
use dbkp::tools::error::Result;

/// Fresh storage root under the crate directory.
pub fn test_root(name: &str) -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = std::env::current_dir()
        .expect("cwd")
        .join(format!(".testdir-{name}"));
    if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }
    std::fs::create_dir_all(&path).expect("create test dir");
    path
}

pub fn storage_uri(path: &std::path::Path) -> String {
    format!("local://{}", path.display())
}

/// Deterministic pseudo random bytes (xorshift).
pub fn random_bytes(len: usize, mut seed: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(len + 8);
    while data.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        data.extend_from_slice(&seed.to_le_bytes());
    }
    data.truncate(len);
    data
}

/// `len` bytes of a short repeating pattern; chunks identically on
/// every save.
pub fn repeating_pattern(len: usize) -> Vec<u8> {
    b"INSERT INTO t (id, payload) VALUES (42, 'abcdefghijklmnop');\n"
        .iter()
        .cycle()
        .take(len)
        .copied()
        .collect()
}

/// Number of chunk objects on disk, parity objects not counted.
pub fn chunk_count(root: &std::path::Path) -> usize {
    let chunk_dir = root.join("chunks");
    if !chunk_dir.exists() {
        return 0;
    }
    walk_files(&chunk_dir)
        .into_iter()
        .filter(|path| !path.starts_with(chunk_dir.join("parity")))
        .count()
}

fn walk_files(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return files,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(walk_files(&path));
        } else {
            files.push(path);
        }
    }
    files
}

/// Adapter producing a fixed dump and capturing what gets restored.
pub struct MockAdapter {
    pub dump: Vec<u8>,
    pub restored: Arc<Mutex<Vec<u8>>>,
}

impl MockAdapter {
    pub fn new(dump: Vec<u8>) -> Self {
        Self {
            dump,
            restored: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn restored(&self) -> Vec<u8> {
        self.restored.lock().unwrap().clone()
    }
}

impl DatabaseAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn test_connection(&self, _conn: &ConnectionInfo, _runner: &dyn Runner) -> Result<()> {
        Ok(())
    }

    fn run_backup(
        &self,
        _conn: &ConnectionInfo,
        _runner: &dyn Runner,
        sink: &mut dyn Write,
    ) -> Result<()> {
        sink.write_all(&self.dump)?;
        Ok(())
    }

    fn run_restore(
        &self,
        _conn: &ConnectionInfo,
        _runner: &dyn Runner,
        source: &mut (dyn Read + Send),
    ) -> Result<()> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        *self.restored.lock().unwrap() = data;
        Ok(())
    }
}

pub fn mock_connection() -> ConnectionInfo {
    ConnectionInfo {
        engine: "mock".to_string(),
        dbname: "testdb".to_string(),
        ..Default::default()
    }
}
