//! Byte sources fed from another thread.
use std::io::{self, Read};

use crossbeam::channel::{bounded, Receiver, Sender};

/// A [Read] over byte chunks received from a channel.
///
/// Reads block until a chunk arrives and report end of stream once every sender is
/// dropped and the buffered chunks are consumed.
pub struct ChunkReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl ChunkReader {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        ChunkReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
        }
    }
}

/// A bounded chunk channel holding at most `cap` chunks in flight.
pub fn channel(cap: usize) -> (Sender<Vec<u8>>, ChunkReader) {
    let (tx, rx) = bounded(cap);
    (tx, ChunkReader::new(rx))
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
