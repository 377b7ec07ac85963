use std::io::Read;

use dbkp_tools::error::Result;

/// Tees all read data through a SHA-256 hasher.
pub struct ChecksumReader<R> {
    reader: R,
    hasher: openssl::sha::Sha256,
    size: u64,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: openssl::sha::Sha256::new(),
            size: 0,
        }
    }

    pub fn finish(self) -> Result<(R, [u8; 32], u64)> {
        Ok((self.reader, self.hasher.finish(), self.size))
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let count = self.reader.read(buf)?;
        self.hasher.update(&buf[..count]);
        self.size += count as u64;
        Ok(count)
    }
}
