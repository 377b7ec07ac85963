use std::io::Write;

use dbkp_tools::compression::FinishWrite;
use dbkp_tools::crypt_config::{CryptConfig, KeySource, NONCE_SIZE, SALT_SIZE, TAG_SIZE};
use dbkp_tools::error::Result;

/// Stream magic; also used by restore to sniff encrypted objects.
pub const CRYPT_MAGIC: [u8; 4] = *b"DBKP";
/// On-disk format version.
pub const CRYPT_VERSION: u8 = 0x01;
/// Plaintext bytes per frame; the final frame may be shorter.
pub const FRAME_SIZE: usize = 64 * 1024;

/// Encrypting writer producing the framed AES-256-GCM stream format.
///
/// Layout: `"DBKP"` ‖ version ‖ salt[32], then per frame a random
/// 12 byte nonce, a 4 byte big endian ciphertext length and the
/// ciphertext including the 16 byte GCM tag.
pub struct CryptWriter<W> {
    writer: W,
    config: CryptConfig,
    buffer: Vec<u8>,
}

impl<W: Write> CryptWriter<W> {
    pub fn new(mut writer: W, key: &KeySource) -> Result<Self> {
        let mut salt = [0u8; SALT_SIZE];
        openssl::rand::rand_bytes(&mut salt)?;
        let config = key.derive(&salt)?;

        writer.write_all(&CRYPT_MAGIC)?;
        writer.write_all(&[CRYPT_VERSION])?;
        writer.write_all(&salt)?;

        Ok(Self {
            writer,
            config,
            buffer: Vec::with_capacity(FRAME_SIZE),
        })
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let mut nonce = [0u8; NONCE_SIZE];
        openssl::rand::rand_bytes(&mut nonce)?;
        let (ciphertext, tag) = self.config.encrypt_frame(&nonce, data)?;

        let frame_len = (ciphertext.len() + TAG_SIZE) as u32;
        self.writer.write_all(&nonce)?;
        self.writer.write_all(&frame_len.to_be_bytes())?;
        self.writer.write_all(&ciphertext)?;
        self.writer.write_all(&tag)?;
        Ok(())
    }

    /// Encrypt and emit the final partial frame, then return the inner
    /// writer.
    pub fn finish(mut self) -> Result<W> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.write_frame(&rest)?;
        }
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> Write for CryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let take = (FRAME_SIZE - self.buffer.len()).min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.buffer.len() == FRAME_SIZE {
                let block = std::mem::replace(&mut self.buffer, Vec::with_capacity(FRAME_SIZE));
                self.write_frame(&block)
                    .map_err(std::io::Error::from)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // buffered plaintext stays until a full frame or finish(); only
        // pass the flush downstream
        self.writer.flush()
    }
}

impl<W: FinishWrite> FinishWrite for CryptWriter<Box<W>>
where
    W: ?Sized,
{
    fn finish(self: Box<Self>) -> Result<()> {
        let inner = (*self).finish()?;
        inner.finish()
    }
}

