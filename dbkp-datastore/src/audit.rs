//! Hash chained audit log for store mutations.
//!
//! [`AuditStore`] decorates any [`ObjectStore`] and appends one entry to
//! `audit.jsonl` for every mutating call. Each entry carries the hash of
//! its predecessor, so any later modification of the file breaks the
//! chain and is caught by [`verify_audit`].
//!
//! Appending is a read-modify-write of the whole file and therefore only
//! safe with a single writer per storage namespace.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use dbkp_tools::error::{Error, Result};
use dbkp_tools::sha::sha256_hex;

use crate::object_store::ObjectStore;

pub const AUDIT_LOG_NAME: &str = "audit.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub op: String,
    pub path: String,
    pub status: String,
    #[serde(default)]
    pub extra: String,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Hash of the concatenated fields, chaining in the predecessor.
    fn compute_hash(&self) -> String {
        let input = format!(
            "{}{}{}{}{}{}",
            self.timestamp, self.op, self.path, self.status, self.extra, self.prev_hash
        );
        sha256_hex(input.as_bytes())
    }
}

pub struct AuditStore {
    inner: Arc<dyn ObjectStore>,
    // serializes read-modify-write appends within this process
    append_lock: Mutex<()>,
}

impl AuditStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            append_lock: Mutex::new(()),
        }
    }

    fn append(&self, op: &str, path: &str, status: &str, extra: &str) -> Result<()> {
        let _guard = self.append_lock.lock().unwrap();

        let mut log_data = match self.inner.open(AUDIT_LOG_NAME) {
            Ok(mut reader) => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;
                data
            }
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err),
        };

        let prev_hash = match last_entry(&log_data)? {
            Some(entry) => entry.hash,
            None => String::new(),
        };

        let mut entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            op: op.to_string(),
            path: path.to_string(),
            status: status.to_string(),
            extra: extra.to_string(),
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();

        let line = serde_json::to_string(&entry)
            .map_err(|err| Error::Internal(anyhow::anyhow!("audit encoding failed - {err}")))?;
        log_data.extend_from_slice(line.as_bytes());
        log_data.push(b'\n');

        self.inner.save(AUDIT_LOG_NAME, &mut &log_data[..])?;
        Ok(())
    }

    fn record<T>(&self, op: &str, path: &str, result: &Result<T>, extra: &str) {
        let status = match result {
            Ok(_) => "ok".to_string(),
            Err(err) => format!("error: {err}"),
        };
        if let Err(err) = self.append(op, path, &status, extra) {
            log::warn!("audit append for {op} {path} failed - {err}");
        }
    }
}

impl ObjectStore for AuditStore {
    fn save(&self, name: &str, data: &mut dyn Read) -> Result<String> {
        let result = self.inner.save(name, data);
        self.record("save", name, &result, "");
        result
    }

    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        self.inner.open(name)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.inner.exists(name)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let result = self.inner.delete(name);
        self.record("delete", name, &result, "");
        result
    }

    fn put_meta(&self, name: &str, data: &[u8]) -> Result<()> {
        let result = self.inner.put_meta(name, data);
        if name != AUDIT_LOG_NAME {
            let extra = format!("{} bytes", data.len());
            self.record("put_meta", name, &result, &extra);
        }
        result
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

fn last_entry(log_data: &[u8]) -> Result<Option<AuditEntry>> {
    let text = std::str::from_utf8(log_data)
        .map_err(|_| Error::Integrity("audit log is not valid utf-8".into()))?;
    match text.lines().filter(|line| !line.trim().is_empty()).last() {
        None => Ok(None),
        Some(line) => {
            let entry: AuditEntry = serde_json::from_str(line)
                .map_err(|err| Error::Integrity(format!("invalid audit entry - {err}")))?;
            Ok(Some(entry))
        }
    }
}

/// Scan the audit log and recompute the hash chain.
///
/// Returns the number of verified entries; the first mismatch is
/// reported with its line number.
pub fn verify_audit(store: &dyn ObjectStore) -> Result<usize> {
    let mut data = Vec::new();
    match store.open(AUDIT_LOG_NAME) {
        Ok(mut reader) => {
            reader.read_to_end(&mut data)?;
        }
        Err(err) if err.is_not_found() => return Ok(0),
        Err(err) => return Err(err),
    }

    let text = std::str::from_utf8(&data)
        .map_err(|_| Error::Integrity("audit log is not valid utf-8".into()))?;

    let mut prev_hash = String::new();
    let mut verified = 0;
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_number = index + 1;
        let entry: AuditEntry = serde_json::from_str(line).map_err(|err| {
            Error::Integrity(format!(
                "audit chain broken at line {line_number} - unparsable entry ({err})"
            ))
        })?;

        if entry.prev_hash != prev_hash {
            return Err(Error::Integrity(format!(
                "audit chain broken at line {line_number} - predecessor hash mismatch"
            )));
        }
        if entry.compute_hash() != entry.hash {
            return Err(Error::Integrity(format!(
                "audit chain broken at line {line_number} - entry hash mismatch"
            )));
        }
        prev_hash = entry.hash.clone();
        verified += 1;
    }

    Ok(verified)
}
