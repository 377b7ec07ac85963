//! Backup manifests.
//!
//! A manifest is the JSON sidecar committed after its data object and
//! records everything needed to verify and reassemble one backup. It is
//! immutable once written; re-encryption produces a new manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dbkp_tools::compression::Compression;
use dbkp_tools::error::{Error, Result};

/// Sidecar suffix: the manifest of `<name>` lives at `<name>.manifest`.
pub const MANIFEST_EXT: &str = ".manifest";
/// Pointer to the newest manifest of a storage namespace.
pub const LATEST_MANIFEST_NAME: &str = "latest.manifest";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encryption {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl std::fmt::Display for Encryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Encryption::None => "none",
            Encryption::Aes256Gcm => "aes-256-gcm",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub engine: String,
    pub dbname: String,
    /// Producer version that wrote this backup.
    pub version: String,
    pub created_at: DateTime<Utc>,
    /// Bytes of stored ciphertext, exactly as written.
    pub size: u64,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub encryption: Encryption,
    /// Hex SHA-256 of the stored byte stream.
    pub checksum: String,
    /// Ordered chunk fingerprints; empty when not deduplicated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<String>,
    /// Object name of the stored blob, or the logical backup name when
    /// deduplicated.
    pub filename: String,
}

impl Manifest {
    pub fn new(engine: &str, dbname: &str, filename: &str) -> Self {
        Self {
            id: new_manifest_id(),
            parent_id: None,
            engine: engine.to_string(),
            dbname: dbname.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
            size: 0,
            compression: Compression::None,
            encryption: Encryption::None,
            checksum: String::new(),
            chunks: Vec::new(),
            filename: filename.to_string(),
        }
    }

    /// A fresh manifest replacing this one (re-encryption): new id,
    /// linked via `parent_id`, original creation time retained so
    /// retention bucketing is unaffected.
    pub fn successor(&self, filename: &str) -> Self {
        let mut next = self.clone();
        next.parent_id = Some(self.id.clone());
        next.id = new_manifest_id();
        next.filename = filename.to_string();
        next.chunks = Vec::new();
        next
    }

    pub fn is_deduplicated(&self) -> bool {
        !self.chunks.is_empty()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption != Encryption::None
    }

    /// Pretty printed JSON, the on-disk representation.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut data = serde_json::to_vec_pretty(self)
            .map_err(|err| Error::Internal(anyhow::anyhow!("manifest encoding failed - {err}")))?;
        data.push(b'\n');
        Ok(data)
    }

    /// Strict on field types, tolerant of unknown fields.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|err| Error::Integrity(format!("invalid manifest - {err}")))
    }
}

/// `<name>.manifest`
pub fn manifest_name(name: &str) -> String {
    format!("{name}{MANIFEST_EXT}")
}

/// True for manifest sidecars, excluding the `latest` pointer.
pub fn is_manifest_name(name: &str) -> bool {
    name.ends_with(MANIFEST_EXT) && name != LATEST_MANIFEST_NAME
}

/// Strip the sidecar suffix.
pub fn data_name(manifest_name: &str) -> &str {
    manifest_name
        .strip_suffix(MANIFEST_EXT)
        .unwrap_or(manifest_name)
}

fn new_manifest_id() -> String {
    let mut raw = [0u8; 16];
    openssl::rand::rand_bytes(&mut raw).expect("random source unavailable");
    hex::encode(raw)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_preserves_fields() -> Result<()> {
        let mut manifest = Manifest::new("postgres", "shop", "postgres-shop-20260801.sql.lz4");
        manifest.size = 12345;
        manifest.compression = Compression::Lz4;
        manifest.encryption = Encryption::Aes256Gcm;
        manifest.checksum = "ab".repeat(32);
        manifest.chunks = vec!["cd".repeat(32), "ef".repeat(32)];

        let encoded = manifest.to_json()?;
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(text.contains("\"aes-256-gcm\""));
        assert!(text.contains("\"lz4\""));

        let decoded = Manifest::from_json(&encoded)?;
        assert_eq!(decoded.id, manifest.id);
        assert_eq!(decoded.created_at, manifest.created_at);
        assert_eq!(decoded.chunks, manifest.chunks);
        assert!(decoded.is_deduplicated());
        assert!(decoded.is_encrypted());
        Ok(())
    }

    #[test]
    fn unknown_fields_are_tolerated() -> Result<()> {
        let encoded = Manifest::new("sqlite", "app", "a.sql").to_json()?;
        let mut value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        value["later_extension"] = serde_json::json!({"nested": true});
        let decoded = Manifest::from_json(&serde_json::to_vec(&value).unwrap())?;
        assert_eq!(decoded.engine, "sqlite");
        Ok(())
    }

    #[test]
    fn wrong_field_types_are_rejected() {
        let raw = br#"{"id":"x","engine":"pg","dbname":"d","version":"1",
            "created_at":"2026-08-01T00:00:00Z","size":"not a number",
            "compression":"none","encryption":"none","checksum":"","filename":"f"}"#;
        assert!(matches!(Manifest::from_json(raw), Err(Error::Integrity(_))));
    }

    #[test]
    fn sidecar_naming() {
        assert_eq!(manifest_name("a.sql"), "a.sql.manifest");
        assert!(is_manifest_name("a.sql.manifest"));
        assert!(!is_manifest_name("latest.manifest"));
        assert!(!is_manifest_name("a.sql"));
        assert_eq!(data_name("a.sql.manifest"), "a.sql");
    }
}
