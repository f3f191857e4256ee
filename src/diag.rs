use std::io::{self, BufWriter, Write};

use tracing::warn;

/// Plain-text dump of every frame the resync layer handles: stream offset, hex bytes and
/// classification, one per line.
///
/// Write failures disable the dump with a warning instead of interrupting decoding.
pub struct FrameDump {
    writer: BufWriter<Box<dyn Write + Send>>,
    failed: bool,
}

impl FrameDump {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        FrameDump {
            writer: BufWriter::new(Box::new(writer)),
            failed: false,
        }
    }

    pub fn line(&mut self, offset: u64, bytes: &[u8], label: &str) {
        if self.failed {
            return;
        }
        if let Err(err) = writeln!(self.writer, "{offset:>12} {} {label}", hex::encode(bytes)) {
            warn!("frame dump disabled: {err}");
            self.failed = true;
        }
    }

    /// # Errors
    /// If the underlying writer fails to flush.
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
