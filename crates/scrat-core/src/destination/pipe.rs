//! In-process byte pipe bridging a push-style producer onto the pull-style
//! `put_stream`/`get_stream` destination interface. A bounded channel of
//! small buffers gives backpressure, so peak memory stays a few buffers.

use std::io::{Read, Write};

use crossbeam_channel::{Receiver, Sender};

const PIPE_BUF_SIZE: usize = 64 * 1024;
const PIPE_DEPTH: usize = 16;

pub(crate) struct PipeWriter {
    tx: Option<Sender<Vec<u8>>>,
}

pub(crate) struct PipeReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

pub(crate) fn byte_pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = crossbeam_channel::bounded(PIPE_DEPTH);
    (
        PipeWriter { tx: Some(tx) },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
        },
    )
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let Some(tx) = &self.tx else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "pipe closed",
            ));
        };
        for chunk in data.chunks(PIPE_BUF_SIZE) {
            if tx.send(chunk.to_vec()).is_err() {
                // Receiver dropped mid-stream; the consumer already failed.
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe reader went away",
                ));
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl PipeWriter {
    /// Signal end-of-stream to the reader.
    pub(crate) fn close(&mut self) {
        self.tx = None;
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(buf) => {
                    self.current = buf;
                    self.pos = 0;
                }
                Err(_) => return Ok(0), // writer dropped: EOF
            }
        }
        let n = out.len().min(self.current.len() - self.pos);
        out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_carries_bytes_across_threads() {
        let (mut writer, mut reader) = byte_pipe();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 255) as u8).collect();
        let expected = payload.clone();

        let producer = std::thread::spawn(move || {
            writer.write_all(&payload).unwrap();
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        producer.join().unwrap();
        assert_eq!(received, expected);
    }

    #[test]
    fn writer_fails_when_reader_dropped() {
        let (mut writer, reader) = byte_pipe();
        drop(reader);
        let err = writer.write_all(&[0u8; 10]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn reader_sees_eof_after_writer_drop() {
        let (writer, mut reader) = byte_pipe();
        drop(writer);
        let mut out = Vec::new();
        assert_eq!(reader.read_to_end(&mut out).unwrap(), 0);
    }
}
