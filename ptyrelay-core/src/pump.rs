//! One-directional byte movement between two streams

use std::os::fd::RawFd;

use tracing::{debug, trace};

use ptyrelay_utils::Result;

use crate::stream::{ByteStream, Chunk};

/// Outcome of [`Pump::flush`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flushed {
    /// Bytes accepted by the destination; 0 when the source had nothing ready
    Bytes(usize),
    /// The source has ended
    Eof,
}

/// Moves bytes from a source stream to a destination stream
pub struct Pump {
    name: String,
    source: Box<dyn ByteStream>,
    dest: Box<dyn ByteStream>,
    wait_for_output: bool,
    propagate_close: bool,
    eof: bool,
}

impl Pump {
    pub fn new(
        name: impl Into<String>,
        source: impl ByteStream + 'static,
        dest: impl ByteStream + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            source: Box::new(source),
            dest: Box::new(dest),
            wait_for_output: false,
            propagate_close: false,
            eof: false,
        }
    }

    /// Only report done once the destination has written everything queued
    pub fn wait_for_output(mut self, wait: bool) -> Self {
        self.wait_for_output = wait;
        self
    }

    /// Close the destination when the source ends
    pub fn propagate_close(mut self, propagate: bool) -> Self {
        self.propagate_close = propagate;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn waits_for_output(&self) -> bool {
        self.wait_for_output
    }

    pub fn source_fd(&self) -> RawFd {
        self.source.raw_fd()
    }

    pub fn dest_fd(&self) -> RawFd {
        self.dest.raw_fd()
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Whether the destination has queued bytes
    pub fn needs_write(&self) -> bool {
        self.dest.needs_write()
    }

    /// Read up to `max` bytes from the source and hand them to the destination
    pub fn flush(&mut self, max: usize) -> Result<Flushed> {
        if self.eof {
            return Ok(Flushed::Eof);
        }
        match self.source.read(max)? {
            Chunk::Data(data) => {
                let written = self.dest.write(&data)?;
                trace!(pump = %self.name, read = data.len(), written, "flushed");
                Ok(Flushed::Bytes(written))
            }
            Chunk::Pending => Ok(Flushed::Bytes(0)),
            Chunk::Eof => {
                debug!(pump = %self.name, "source ended");
                self.eof = true;
                if self.propagate_close {
                    self.dest.close()?;
                }
                Ok(Flushed::Eof)
            }
        }
    }

    /// Push the destination's queued bytes
    pub fn drain(&mut self) -> Result<usize> {
        self.dest.drain_pending()
    }

    pub fn is_done(&self) -> bool {
        self.eof && (!self.wait_for_output || !self.dest.needs_write())
    }
}

impl std::fmt::Debug for Pump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pump")
            .field("name", &self.name)
            .field("wait_for_output", &self.wait_for_output)
            .field("propagate_close", &self.propagate_close)
            .field("eof", &self.eof)
            .finish()
    }
}
