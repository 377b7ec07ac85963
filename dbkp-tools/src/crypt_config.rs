//! Key handling for the AES-256-GCM backup stream cipher.
//!
//! We use this to encrypt and decrypt backup streams. Cipher is
//! AES_256_GCM, which is fast and provides authenticated encryption.
//!
//! A [`CryptConfig`] is always derived for one stream: the stream header
//! carries a fresh random salt, so two backups made with the same
//! passphrase never share a key schedule.

use std::path::PathBuf;

use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::symm::Cipher;

use crate::error::{Error, Result};

/// AES-256 key length in bytes.
pub const KEY_SIZE: usize = 32;
/// Salt length carried in the stream header.
pub const SALT_SIZE: usize = 32;
/// PBKDF2-HMAC-SHA256 iteration count for passphrase derivation.
pub const PBKDF2_ITERATIONS: usize = 4096;
/// GCM nonce length.
pub const NONCE_SIZE: usize = 12;
/// GCM authentication tag length.
pub const TAG_SIZE: usize = 16;

/// Where the encryption key comes from.
#[derive(Clone)]
pub enum KeySource {
    /// A raw 32 byte key.
    RawKey([u8; KEY_SIZE]),
    /// A key file: used verbatim if it contains exactly 32 bytes,
    /// otherwise the SHA-256 of its contents becomes the key.
    KeyFile(PathBuf),
    /// A passphrase, stretched with PBKDF2-HMAC-SHA256 and the
    /// per-stream salt.
    Passphrase(String),
}

impl KeySource {
    /// Derive the encryption configuration for one stream.
    pub fn derive(&self, salt: &[u8; SALT_SIZE]) -> Result<CryptConfig> {
        let key = match self {
            KeySource::RawKey(key) => *key,
            KeySource::KeyFile(path) => {
                let contents = std::fs::read(path).map_err(|err| {
                    Error::Config(format!("unable to read key file {path:?} - {err}"))
                })?;
                if contents.len() == KEY_SIZE {
                    let mut key = [0u8; KEY_SIZE];
                    key.copy_from_slice(&contents);
                    key
                } else {
                    openssl::sha::sha256(&contents)
                }
            }
            KeySource::Passphrase(passphrase) => {
                let mut key = [0u8; KEY_SIZE];
                pbkdf2_hmac(
                    passphrase.as_bytes(),
                    salt,
                    PBKDF2_ITERATIONS,
                    MessageDigest::sha256(),
                    &mut key,
                )?;
                key
            }
        };
        CryptConfig::new(key)
    }
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::RawKey(_) => write!(f, "KeySource::RawKey(..)"),
            KeySource::KeyFile(path) => write!(f, "KeySource::KeyFile({path:?})"),
            KeySource::Passphrase(_) => write!(f, "KeySource::Passphrase(..)"),
        }
    }
}

/// Encryption configuration with secret key.
///
/// Stores the stream key and provides the frame level authenticated
/// encryption primitives.
pub struct CryptConfig {
    cipher: Cipher,
    enc_key: [u8; KEY_SIZE],
}

impl CryptConfig {
    pub fn new(enc_key: [u8; KEY_SIZE]) -> Result<Self> {
        Ok(Self {
            cipher: Cipher::aes_256_gcm(),
            enc_key,
        })
    }

    /// Encrypt one frame, returning ciphertext and authentication tag.
    pub fn encrypt_frame(
        &self,
        nonce: &[u8; NONCE_SIZE],
        data: &[u8],
    ) -> Result<(Vec<u8>, [u8; TAG_SIZE])> {
        let mut tag = [0u8; TAG_SIZE];
        let ciphertext = openssl::symm::encrypt_aead(
            self.cipher,
            &self.enc_key,
            Some(nonce),
            b"",
            data,
            &mut tag,
        )?;
        Ok((ciphertext, tag))
    }

    /// Verify and decrypt one frame.
    ///
    /// A failed tag check is indistinguishable from a wrong key and is
    /// reported as a security error either way.
    pub fn decrypt_frame(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        tag: &[u8; TAG_SIZE],
    ) -> Result<Vec<u8>> {
        openssl::symm::decrypt_aead(
            self.cipher,
            &self.enc_key,
            Some(nonce),
            b"",
            ciphertext,
            tag,
        )
        .map_err(|_| {
            Error::Security("unable to decrypt backup frame (wrong key or tampered data)".into())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_round_trip() -> Result<()> {
        let salt = [7u8; SALT_SIZE];
        let config = KeySource::Passphrase("correct horse".into()).derive(&salt)?;
        let nonce = [3u8; NONCE_SIZE];

        let (ciphertext, tag) = config.encrypt_frame(&nonce, b"some database dump")?;
        assert_ne!(&ciphertext[..], b"some database dump");

        let plaintext = config.decrypt_frame(&nonce, &ciphertext, &tag)?;
        assert_eq!(plaintext, b"some database dump");
        Ok(())
    }

    #[test]
    fn wrong_key_is_a_security_error() -> Result<()> {
        let salt = [7u8; SALT_SIZE];
        let config = KeySource::Passphrase("right".into()).derive(&salt)?;
        let other = KeySource::Passphrase("wrong".into()).derive(&salt)?;
        let nonce = [3u8; NONCE_SIZE];

        let (ciphertext, tag) = config.encrypt_frame(&nonce, b"payload")?;
        match other.decrypt_frame(&nonce, &ciphertext, &tag) {
            Err(Error::Security(_)) => Ok(()),
            other => panic!("expected security error, got {other:?}"),
        }
    }

    #[test]
    fn passphrase_derivation_depends_on_salt() -> Result<()> {
        let source = KeySource::Passphrase("pw".into());
        let a = source.derive(&[0u8; SALT_SIZE])?;
        let b = source.derive(&[1u8; SALT_SIZE])?;
        assert_ne!(a.enc_key, b.enc_key);
        Ok(())
    }
}
