//! Blocking bounded byte pipe between a producer and a consumer thread.
//!
//! Both halves speak `std::io`. End of stream is an explicit marker sent
//! by [`PipeWriter::finish`]; a writer that goes away without finishing
//! surfaces an error on the reader, so a torn producer can never be
//! mistaken for a complete stream. Dropping the reader makes further
//! writes fail so the producer terminates as well.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::compression::FinishWrite;
use crate::error::Result;

const CLOSED_BY_READER: &str = "byte pipe closed by reader";
const FAILED_BY_WRITER: &str = "byte pipe producer failed";

enum Item {
    Data(Vec<u8>),
    Eof,
}

/// Create a pipe buffering at most `depth` blocks.
pub fn byte_pipe(depth: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = crossbeam_channel::bounded(depth);
    let failure = Arc::new(Mutex::new(None));
    (
        PipeWriter {
            tx: Some(tx),
            failure: failure.clone(),
        },
        PipeReader {
            rx,
            failure,
            current: Vec::new(),
            pos: 0,
            eof: false,
            failed: false,
        },
    )
}

/// Returns true when `message` only reports that the other pipe half
/// went away, i.e. the root cause lives on the other side.
pub fn is_pipe_disconnect(message: &str) -> bool {
    message.contains(CLOSED_BY_READER) || message.contains(FAILED_BY_WRITER)
}

pub struct PipeWriter {
    tx: Option<Sender<Item>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl PipeWriter {
    /// Detachable handle used to fail the pipe after the writer itself
    /// has been moved into a writer chain.
    pub fn fail_handle(&self) -> PipeFailHandle {
        PipeFailHandle {
            failure: self.failure.clone(),
        }
    }

    /// Mark the stream as complete. Without this the reader reports the
    /// stream as torn.
    pub fn finish(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Item::Eof);
        }
    }

    /// Close the pipe, reporting `message` to the reader.
    pub fn close_with_error(mut self, message: String) {
        *self.failure.lock().unwrap() = Some(message);
        self.tx.take();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self.tx.as_ref().expect("write after close");
        tx.send(Item::Data(buf.to_vec()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, CLOSED_BY_READER))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl FinishWrite for PipeWriter {
    fn finish(self: Box<Self>) -> Result<()> {
        (*self).finish();
        Ok(())
    }
}

/// Marks the pipe as failed. The reader observes the failure before it
/// consumes any further queued data.
pub struct PipeFailHandle {
    failure: Arc<Mutex<Option<String>>>,
}

impl PipeFailHandle {
    pub fn fail(&self, message: String) {
        let mut slot = self.failure.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message);
        }
    }
}

pub struct PipeReader {
    rx: Receiver<Item>,
    failure: Arc<Mutex<Option<String>>>,
    current: Vec<u8>,
    pos: usize,
    eof: bool,
    failed: bool,
}

impl PipeReader {
    fn failure_error(&mut self) -> std::io::Error {
        self.failed = true;
        let detail = self
            .failure
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "stream ended before completion".to_string());
        std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("{FAILED_BY_WRITER} - {detail}"),
        )
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            if self.eof || self.failed {
                return Ok(0);
            }
            if self.failure.lock().unwrap().is_some() {
                return Err(self.failure_error());
            }

            match self.rx.recv() {
                Ok(Item::Data(block)) => {
                    self.current = block;
                    self.pos = 0;
                }
                Ok(Item::Eof) => {
                    self.eof = true;
                    return Ok(0);
                }
                // writer gone without finishing: the stream is torn
                Err(_) => return Err(self.failure_error()),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let (mut writer, mut reader) = byte_pipe(4);
        let handle = std::thread::spawn(move || {
            for block in [&b"hello "[..], &b"pipe"[..]] {
                writer.write_all(block).unwrap();
            }
            writer.finish();
        });
        let mut output = String::new();
        reader.read_to_string(&mut output).unwrap();
        handle.join().unwrap();
        assert_eq!(output, "hello pipe");
    }

    #[test]
    fn writer_failure_reaches_reader() {
        let (mut writer, mut reader) = byte_pipe(4);
        writer.write_all(b"partial").unwrap();
        writer.close_with_error("dump command failed".to_string());

        let mut output = Vec::new();
        let err = reader.read_to_end(&mut output).unwrap_err();
        assert!(err.to_string().contains("dump command failed"));
        assert!(is_pipe_disconnect(&err.to_string()));
    }

    #[test]
    fn dropped_writer_is_a_torn_stream() {
        let (mut writer, mut reader) = byte_pipe(4);
        writer.write_all(b"partial").unwrap();
        drop(writer);

        let mut output = Vec::new();
        let err = reader.read_to_end(&mut output).unwrap_err();
        assert!(err.to_string().contains("ended before completion"));
    }

    #[test]
    fn dropped_reader_breaks_writer() {
        let (mut writer, reader) = byte_pipe(1);
        drop(reader);
        let err = writer.write_all(b"block").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
