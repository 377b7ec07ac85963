//! The abstract object store every storage backend satisfies.

use std::io::Read;
use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use dbkp_tools::error::{Error, Result};
use dbkp_tools::uri::{Scheme, StorageUri};

use crate::local_store::LocalStore;

/// Upper bound for metadata objects (manifests, pointers).
pub const META_SIZE_MAX: usize = 1024 * 1024;

/// Byte level storage under a flat name space.
///
/// `save` must be crash atomic at the name level: after a crash either
/// the complete stream is visible under the name or nothing is.
pub trait ObjectStore: Send + Sync {
    /// Stream `data` under `name` and return a human readable location.
    fn save(&self, name: &str, data: &mut dyn Read) -> Result<String>;

    /// Sequential byte source for `name`.
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    fn exists(&self, name: &str) -> Result<bool>;

    /// Idempotent on missing objects.
    fn delete(&self, name: &str) -> Result<()>;

    /// Store a small metadata object; overwrites atomically.
    fn put_meta(&self, name: &str, data: &[u8]) -> Result<()>;

    fn get_meta(&self, name: &str) -> Result<Vec<u8>>;

    /// Recursive listing of names under `prefix`, in no particular order.
    ///
    /// Everything below `chunks/` is filtered out unless the prefix
    /// itself points into `chunks/`.
    fn list_meta(&self, prefix: &str) -> Result<Vec<String>>;

    /// Last modification time, if the backend can report one.
    fn modified(&self, _name: &str) -> Result<Option<SystemTime>> {
        Ok(None)
    }

    /// Human readable location, scrubbed of secrets.
    fn location(&self) -> String;

    /// Release connections.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Default bound for connect/handshake of remote transports.
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Options applied when a store is constructed from a URI.
#[derive(Clone)]
pub struct StoreOptions {
    /// Permit transports without encryption (plain FTP).
    pub allow_insecure: bool,
    /// Ambient cancellation; long running transfers stop at the next
    /// block boundary once cancelled.
    pub cancel: CancellationToken,
    /// Remote transports must give up connecting after this long; the
    /// local backend has no connection to bound.
    pub connect_timeout: std::time::Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            allow_insecure: false,
            cancel: CancellationToken::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Construct a store from a storage URI, dispatching on the scheme.
pub fn make_store(uri: &str, options: &StoreOptions) -> Result<Arc<dyn ObjectStore>> {
    let parsed = StorageUri::parse(uri)?;

    if parsed.scheme.is_insecure() && !options.allow_insecure {
        return Err(Error::Security(format!(
            "insecure transport '{}' requires allow_insecure",
            parsed.scheme.as_str()
        )));
    }

    match parsed.scheme {
        Scheme::Local => Ok(Arc::new(LocalStore::open(
            parsed.local_path(),
            options.cancel.clone(),
        )?)),
        other => Err(Error::Config(format!(
            "storage scheme '{}' requires an external transport build",
            other.as_str()
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ftp_requires_allow_insecure() {
        let options = StoreOptions::default();
        match make_store("ftp://user:pw@host/backups", &options) {
            Err(Error::Security(msg)) => assert!(!msg.contains("pw")),
            other => panic!("expected security error, got {:?}", other.err()),
        }
    }
}
