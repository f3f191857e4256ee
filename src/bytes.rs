use std::io::{self, ErrorKind, Read};

/// Bytes reads whole frames or single bytes from a reader while tracking the absolute
/// stream offset, which is what the resync window needs to slide one byte at a time.
///
/// A short read at the end of the stream is reported as EOF and the partial frame is
/// dropped.
pub struct Bytes<R>
where
    R: Read,
{
    reader: R,
    num_read: u64,
    buf: [u8; 1],
}

impl<R> Bytes<R>
where
    R: Read,
{
    pub fn new(reader: R) -> Self {
        Bytes {
            reader,
            num_read: 0,
            buf: [0u8; 1],
        }
    }

    /// Read the next byte, or `None` at EOF.
    pub fn next(&mut self) -> Result<Option<u8>, io::Error> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.num_read += 1;
                    return Ok(Some(self.buf[0]));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Fill `buf` completely. Returns `false` if the stream ended first.
    pub fn fill(&mut self, buf: &mut [u8]) -> Result<bool, io::Error> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.num_read += filled as u64;
                    return Ok(false);
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        self.num_read += filled as u64;
        Ok(true)
    }

    /// Number of bytes consumed from the reader so far.
    pub fn offset(&self) -> u64 {
        self.num_read
    }
}
