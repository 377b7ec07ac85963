use std::io::Read;

use dbkp_tools::crypt_config::{CryptConfig, KeySource, NONCE_SIZE, SALT_SIZE, TAG_SIZE};
use dbkp_tools::error::{Error, Result};

use crate::crypt_writer::{CRYPT_MAGIC, CRYPT_VERSION, FRAME_SIZE};

/// Decrypting reader for the framed AES-256-GCM stream format.
///
/// Verifies the stream header, derives the key from the embedded salt
/// and decrypts frame by frame. Any authentication failure aborts the
/// stream with a security error.
pub struct CryptReader<R> {
    reader: R,
    config: CryptConfig,
    buffer: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> CryptReader<R> {
    pub fn new(mut reader: R, key: &KeySource) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(|err| {
            Error::Integrity(format!("unable to read encryption header - {err}"))
        })?;
        if magic != CRYPT_MAGIC {
            return Err(Error::Integrity(
                "bad magic number - not an encrypted backup stream".into(),
            ));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != CRYPT_VERSION {
            return Err(Error::Integrity(format!(
                "unsupported encryption format version {}",
                version[0]
            )));
        }

        let mut salt = [0u8; SALT_SIZE];
        reader.read_exact(&mut salt)?;
        let config = key.derive(&salt)?;

        Ok(Self {
            reader,
            config,
            buffer: Vec::new(),
            pos: 0,
            eof: false,
        })
    }

    /// Read and decrypt the next frame; false on clean end of stream.
    fn fill_buffer(&mut self) -> Result<bool> {
        let mut nonce = [0u8; NONCE_SIZE];
        if !read_exact_or_eof(&mut self.reader, &mut nonce)? {
            return Ok(false);
        }

        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes).map_err(|err| {
            Error::Integrity(format!("truncated encryption frame header - {err}"))
        })?;
        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len < TAG_SIZE || frame_len > FRAME_SIZE + TAG_SIZE {
            return Err(Error::Integrity(format!(
                "invalid encryption frame length {frame_len}"
            )));
        }

        let mut frame = vec![0u8; frame_len];
        self.reader.read_exact(&mut frame).map_err(|err| {
            Error::Integrity(format!("truncated encryption frame - {err}"))
        })?;

        let (ciphertext, tag) = frame.split_at(frame_len - TAG_SIZE);
        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(tag);

        self.buffer = self.config.decrypt_frame(&nonce, ciphertext, &tag_bytes)?;
        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for CryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.buffer.len() {
                let n = (self.buffer.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            match self.fill_buffer() {
                Ok(true) => {}
                Ok(false) => self.eof = true,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Like `read_exact`, but a clean end of stream before the first byte
/// returns false instead of an error.
fn read_exact_or_eof(reader: &mut dyn Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(Error::Integrity(
                    "truncated encryption frame nonce".into(),
                ))
            }
            Ok(count) => filled += count,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}
