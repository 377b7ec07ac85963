use std::io::Write;

use dbkp_tools::error::Result;

/// Tees all written data through a SHA-256 hasher.
pub struct ChecksumWriter<W> {
    writer: W,
    hasher: openssl::sha::Sha256,
    size: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: openssl::sha::Sha256::new(),
            size: 0,
        }
    }

    pub fn finish(self) -> Result<(W, [u8; 32], u64)> {
        Ok((self.writer, self.hasher.finish(), self.size))
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let count = self.writer.write(buf)?;
        self.hasher.update(&buf[..count]);
        self.size += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
