//! Streaming compression codecs for backup streams.
//!
//! All codecs operate on `std::io` readers/writers so they can be layered
//! freely with the encryption and pipe adapters. Writers implement
//! [`FinishWrite`] because every codec needs an explicit finalization step
//! to emit its trailer before the downstream sink is finished.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stream transform applied between the database dump and encryption.
///
/// `Tar` marks adapter output that already is a tar archive; the stream
/// itself passes through unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Lz4,
    Zstd,
    Tar,
}

impl Compression {
    /// File name extension recorded for this transform.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("gz"),
            Compression::Lz4 => Some("lz4"),
            Compression::Zstd => Some("zst"),
            Compression::Tar => Some("tar"),
        }
    }

    /// Guess the transform from a backup file name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let name = name.strip_suffix("_rekeyed").unwrap_or(name);
        if name.ends_with(".gz") || name.ends_with(".gzip") {
            Some(Compression::Gzip)
        } else if name.ends_with(".lz4") {
            Some(Compression::Lz4)
        } else if name.ends_with(".zst") || name.ends_with(".zstd") {
            Some(Compression::Zstd)
        } else if name.ends_with(".tar") {
            Some(Compression::Tar)
        } else {
            None
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            "tar" => Ok(Compression::Tar),
            other => Err(Error::Config(format!(
                "unknown compression algorithm '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
            Compression::Tar => "tar",
        })
    }
}

/// A write sink that needs explicit finalization.
///
/// `finish` flushes buffered data and trailers, then finishes the wrapped
/// sink, so finalization cascades through a whole writer chain.
pub trait FinishWrite: Write + Send {
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Terminal passthrough so a plain writer can close a chain.
pub struct Passthrough<W>(pub W);

impl<W: Write + Send> Write for Passthrough<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> FinishWrite for Passthrough<W> {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.0.flush()?;
        Ok(())
    }
}

struct GzipWriter {
    encoder: Option<flate2::write::GzEncoder<Box<dyn FinishWrite>>>,
}

impl Write for GzipWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.encoder.as_mut().expect("finished").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.encoder.as_mut().expect("finished").flush()
    }
}

impl FinishWrite for GzipWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        let inner = self.encoder.take().expect("finished").finish()?;
        inner.finish()
    }
}

struct Lz4Writer {
    encoder: Option<lz4_flex::frame::FrameEncoder<Box<dyn FinishWrite>>>,
}

impl Write for Lz4Writer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.encoder.as_mut().expect("finished").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.encoder.as_mut().expect("finished").flush()
    }
}

impl FinishWrite for Lz4Writer {
    fn finish(mut self: Box<Self>) -> Result<()> {
        let inner = self
            .encoder
            .take()
            .expect("finished")
            .finish()
            .map_err(|err| Error::Integrity(format!("lz4 stream finalization failed - {err}")))?;
        inner.finish()
    }
}

struct ZstdWriter {
    encoder: Option<zstd::stream::write::Encoder<'static, Box<dyn FinishWrite>>>,
}

impl Write for ZstdWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.encoder.as_mut().expect("finished").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.encoder.as_mut().expect("finished").flush()
    }
}

impl FinishWrite for ZstdWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        let inner = self.encoder.take().expect("finished").finish()?;
        inner.finish()
    }
}

/// Layer the compressing side of `algorithm` over `sink`.
pub fn compress_writer(
    algorithm: Compression,
    sink: Box<dyn FinishWrite>,
) -> Result<Box<dyn FinishWrite>> {
    Ok(match algorithm {
        Compression::None | Compression::Tar => sink,
        Compression::Gzip => Box::new(GzipWriter {
            encoder: Some(flate2::write::GzEncoder::new(
                sink,
                flate2::Compression::default(),
            )),
        }),
        Compression::Lz4 => Box::new(Lz4Writer {
            encoder: Some(lz4_flex::frame::FrameEncoder::new(sink)),
        }),
        Compression::Zstd => Box::new(ZstdWriter {
            encoder: Some(zstd::stream::write::Encoder::new(sink, 0)?),
        }),
    })
}

/// Layer the decompressing side of `algorithm` over `source`.
pub fn decompress_reader<'a, R: Read + Send + 'a>(
    algorithm: Compression,
    source: R,
) -> Result<Box<dyn Read + Send + 'a>> {
    Ok(match algorithm {
        Compression::None | Compression::Tar => Box::new(source),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(source)),
        Compression::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(source)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(source)?),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(algorithm: Compression, data: &[u8]) -> Result<Vec<u8>> {
        let buffer: Vec<u8> = Vec::new();
        let shared = std::sync::Arc::new(std::sync::Mutex::new(buffer));

        struct SharedSink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let sink: Box<dyn FinishWrite> = Box::new(Passthrough(SharedSink(shared.clone())));
        let mut writer = compress_writer(algorithm, sink)?;
        writer.write_all(data)?;
        writer.finish()?;

        let compressed = shared.lock().unwrap().clone();
        let mut reader = decompress_reader(algorithm, &compressed[..])?;
        let mut output = Vec::new();
        reader.read_to_end(&mut output)?;
        Ok(output)
    }

    #[test]
    fn all_algorithms_round_trip() -> Result<()> {
        let mut data = Vec::new();
        for i in 0..20_000u32 {
            data.extend_from_slice(&(i % 251).to_le_bytes());
        }
        for algorithm in [
            Compression::None,
            Compression::Gzip,
            Compression::Lz4,
            Compression::Zstd,
            Compression::Tar,
        ] {
            assert_eq!(round_trip(algorithm, &data)?, data, "{algorithm}");
            assert_eq!(round_trip(algorithm, b"")?, b"", "{algorithm} empty");
        }
        Ok(())
    }

    #[test]
    fn extension_guess_matches_extension() {
        for algorithm in [Compression::Gzip, Compression::Lz4, Compression::Zstd] {
            let name = format!("backup.sql.{}", algorithm.extension().unwrap());
            assert_eq!(Compression::from_file_name(&name), Some(algorithm));
        }
        assert_eq!(Compression::from_file_name("backup.sql"), None);
        assert_eq!(
            Compression::from_file_name("backup.sql.lz4_rekeyed"),
            Some(Compression::Lz4)
        );
    }
}
