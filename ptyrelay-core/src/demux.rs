//! Frame demultiplexing decorator
//!
//! When the remote side has no tty it interleaves stdout and stderr on one
//! connection using the framing in [`ptyrelay_protocol`]. [`Demuxer`] strips
//! the headers and exposes the payload as a plain [`ByteStream`], so a pump
//! does not need to know whether its source is framed.

use std::os::fd::{AsRawFd, RawFd};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use ptyrelay_protocol::{Channel, FrameHeader, HEADER_LEN};
use ptyrelay_utils::Result;

use crate::stream::{ByteStream, Chunk};

/// Reads framed payload from an inner stream; writes pass through unframed
pub struct Demuxer<S> {
    inner: S,
    /// Payload bytes still owed by the current frame; 0 = expect a header
    remaining: usize,
    /// Header bytes collected so far
    header: BytesMut,
    tag: Option<u8>,
    max_frame_len: Option<u32>,
    finished: bool,
}

impl<S: ByteStream> Demuxer<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            remaining: 0,
            header: BytesMut::with_capacity(HEADER_LEN),
            tag: None,
            max_frame_len: None,
            finished: false,
        }
    }

    /// Treat frames declaring more than `max` payload bytes as end-of-stream
    pub fn with_max_frame_len(mut self, max: Option<u32>) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Payload bytes left in the frame being consumed
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Channel of the frame being consumed (or the last one seen)
    pub fn channel(&self) -> Option<Channel> {
        self.tag.and_then(Channel::from_tag)
    }

    /// Whether the framed flow has ended
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self, reason: &'static str) -> Chunk {
        if !self.finished {
            debug!(reason, remaining = self.remaining, "demuxed stream ended");
            self.finished = true;
            self.remaining = 0;
            self.header.clear();
        }
        Chunk::Eof
    }

    /// Collect header bytes; `Some` once a frame has been entered or the flow ended
    fn read_header(&mut self) -> Result<Option<Chunk>> {
        let want = HEADER_LEN - self.header.len();
        match self.inner.read(want)? {
            Chunk::Data(bytes) => self.header.extend_from_slice(&bytes),
            Chunk::Pending => return Ok(Some(Chunk::Pending)),
            Chunk::Eof if self.header.is_empty() => return Ok(Some(self.finish("stream closed"))),
            Chunk::Eof => return Ok(Some(self.finish("truncated header"))),
        }
        if self.header.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&self.header);
        self.header.clear();
        let header = FrameHeader::decode(&raw);

        if header.is_end_of_stream() {
            return Ok(Some(self.finish("zero-length frame")));
        }
        if let Some(max) = self.max_frame_len {
            if header.length > max {
                warn!(length = header.length, max, "frame exceeds limit, ending stream");
                return Ok(Some(self.finish("oversized frame")));
            }
        }

        trace!(tag = header.tag, length = header.length, "frame header");
        self.tag = Some(header.tag);
        self.remaining = header.length as usize;
        Ok(None)
    }
}

impl<S: ByteStream> ByteStream for Demuxer<S> {
    /// Read at most `n` payload bytes from the current frame
    ///
    /// Never crosses a frame boundary within one call.
    fn read(&mut self, n: usize) -> Result<Chunk> {
        if self.finished {
            return Ok(Chunk::Eof);
        }
        if n == 0 {
            return Ok(Chunk::Pending);
        }

        while self.remaining == 0 {
            if let Some(chunk) = self.read_header()? {
                return Ok(chunk);
            }
        }

        match self.inner.read(n.min(self.remaining))? {
            Chunk::Data(bytes) => {
                self.remaining -= bytes.len();
                Ok(Chunk::Data(bytes))
            }
            Chunk::Pending => Ok(Chunk::Pending),
            Chunk::Eof => Ok(self.finish("truncated payload")),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.inner.write(data)
    }

    fn needs_write(&self) -> bool {
        self.inner.needs_write()
    }

    fn drain_pending(&mut self) -> Result<usize> {
        self.inner.drain_pending()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        !self.finished && self.inner.is_open()
    }

    fn raw_fd(&self) -> RawFd {
        self.inner.raw_fd()
    }
}

impl<S: ByteStream> AsRawFd for Demuxer<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw_fd()
    }
}
