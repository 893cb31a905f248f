//! Non-blocking byte streams
//!
//! A [`Stream`] wraps one readable/writable handle, switches it to
//! non-blocking mode for its lifetime and queues whatever a write could not
//! hand to the kernel. Reads and writes never block: "nothing yet" and
//! "queued for later" are ordinary outcomes, not errors.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use ptyrelay_utils::{RelayError, Result};

use crate::select;

/// Default number of bytes moved per read
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Outcome of a non-blocking read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Between one and the requested number of bytes
    Data(Bytes),
    /// Nothing available right now
    Pending,
    /// The stream has ended; every later read reports this too
    Eof,
}

impl Chunk {
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    /// Number of payload bytes carried
    pub fn len(&self) -> usize {
        match self {
            Self::Data(data) => data.len(),
            _ => 0,
        }
    }
}

/// Capability set shared by raw streams and the framing decorator
pub trait ByteStream {
    /// Read up to `max` bytes without blocking
    fn read(&mut self, max: usize) -> Result<Chunk>;

    /// Accept `data` for writing, queueing what the handle cannot take now
    ///
    /// Returns the number of bytes accepted. Zero means the stream is closed
    /// or its peer went away.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Whether queued bytes are waiting for the handle to become writable
    fn needs_write(&self) -> bool;

    /// Push queued bytes to the handle, returning how many were written
    fn drain_pending(&mut self) -> Result<usize>;

    /// Stop accepting writes; the handle is released once the queue drains
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Descriptor used for readiness polling
    fn raw_fd(&self) -> RawFd;
}

impl<S: ByteStream + ?Sized> ByteStream for Box<S> {
    fn read(&mut self, max: usize) -> Result<Chunk> {
        (**self).read(max)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write(data)
    }

    fn needs_write(&self) -> bool {
        (**self).needs_write()
    }

    fn drain_pending(&mut self) -> Result<usize> {
        (**self).drain_pending()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn raw_fd(&self) -> RawFd {
        (**self).raw_fd()
    }
}

/// A handle a [`Stream`] can own
pub trait Handle: Read + Write + AsRawFd {
    /// Signal end-of-stream to the peer, where the handle supports it
    fn shutdown_write(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Handle for File {}

impl Handle for UnixStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

impl Handle for TcpStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

/// Result of pushing bytes at a non-blocking handle
enum Progress {
    /// This many bytes went out before the handle would block
    Written(usize),
    /// The peer is gone
    PeerGone,
}

/// Non-blocking stream over a single handle
pub struct Stream<H: Handle> {
    handle: H,
    label: String,
    pending: BytesMut,
    pending_limit: Option<usize>,
    /// Intent to close: no further reads, no new writes
    closing: bool,
    released: bool,
    /// Original `O_NONBLOCK` state, when this stream changed it
    restore_nonblocking: Option<bool>,
}

impl<H: Handle> Stream<H> {
    /// Wrap `handle`, switching it to non-blocking mode until the stream is dropped
    pub fn new(handle: H, label: impl Into<String>) -> Result<Self> {
        let was_nonblocking = select::set_nonblocking(handle.as_raw_fd(), true)?;
        let mut stream = Self::assume_nonblocking(handle, label);
        if !was_nonblocking {
            stream.restore_nonblocking = Some(false);
        }
        Ok(stream)
    }

    /// Wrap a handle that is already non-blocking, leaving its flags alone
    pub fn assume_nonblocking(handle: H, label: impl Into<String>) -> Self {
        Self {
            handle,
            label: label.into(),
            pending: BytesMut::new(),
            pending_limit: None,
            closing: false,
            released: false,
            restore_nonblocking: None,
        }
    }

    /// Cap the pending-write queue; exceeding it is a fatal stream error
    pub fn with_pending_limit(mut self, limit: Option<usize>) -> Self {
        self.pending_limit = limit;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of queued bytes not yet written
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn get_ref(&self) -> &H {
        &self.handle
    }

    /// Whether the handle has been released to the peer
    pub fn is_released(&self) -> bool {
        self.released
    }

    fn queue(&mut self, data: &[u8]) -> Result<()> {
        if let Some(limit) = self.pending_limit {
            let pending = self.pending.len() + data.len();
            if pending > limit {
                return Err(RelayError::PendingOverflow {
                    stream: self.label.clone(),
                    pending,
                    limit,
                });
            }
        }
        self.pending.extend_from_slice(data);
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match self.handle.shutdown_write() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotConnected => {}
            Err(e) => debug!(stream = %self.label, error = %e, "shutdown on release failed"),
        }
        debug!(stream = %self.label, "stream released");
    }

    /// The peer stopped accepting data; drop what is queued and end the stream
    fn end_broken(&mut self) {
        debug!(
            stream = %self.label,
            dropped = self.pending.len(),
            "peer closed, ending stream"
        );
        self.pending.clear();
        self.closing = true;
        self.release();
    }
}

impl Stream<File> {
    /// Stream over a duplicate of `fd`, e.g. one of the process stdio handles
    pub fn from_fd(fd: BorrowedFd<'_>, label: impl Into<String>) -> Result<Self> {
        let owned = fd.try_clone_to_owned()?;
        Self::new(File::from(owned), label)
    }

    pub fn stdin() -> Result<Self> {
        Self::from_fd(io::stdin().as_fd(), "stdin")
    }

    pub fn stdout() -> Result<Self> {
        Self::from_fd(io::stdout().as_fd(), "stdout")
    }

    pub fn stderr() -> Result<Self> {
        Self::from_fd(io::stderr().as_fd(), "stderr")
    }
}

impl<H: Handle> ByteStream for Stream<H> {
    fn read(&mut self, max: usize) -> Result<Chunk> {
        if self.closing {
            return Ok(Chunk::Eof);
        }
        if max == 0 {
            return Ok(Chunk::Pending);
        }

        let mut buf = BytesMut::zeroed(max);
        let read = loop {
            match self.handle.read(&mut buf) {
                Ok(n) => break Some(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Chunk::Pending),
                Err(e) if is_end_of_input(&e) => break None,
                Err(e) => return Err(e.into()),
            }
        };

        match read {
            Some(n) if n > 0 => {
                buf.truncate(n);
                trace!(stream = %self.label, bytes = n, "read");
                Ok(Chunk::Data(buf.freeze()))
            }
            _ => {
                debug!(stream = %self.label, "end of stream");
                self.close()?;
                Ok(Chunk::Eof)
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closing {
            trace!(stream = %self.label, bytes = data.len(), "write after close dropped");
            return Ok(0);
        }
        if data.is_empty() {
            return Ok(0);
        }

        // Queued bytes go first
        if !self.pending.is_empty() {
            self.queue(data)?;
            self.drain_pending()?;
            return Ok(if self.released { 0 } else { data.len() });
        }

        match write_available(&mut self.handle, data)? {
            Progress::Written(n) => {
                if n < data.len() {
                    self.queue(&data[n..])?;
                    trace!(
                        stream = %self.label,
                        written = n,
                        queued = data.len() - n,
                        "partial write"
                    );
                }
                Ok(data.len())
            }
            Progress::PeerGone => {
                self.end_broken();
                Ok(0)
            }
        }
    }

    fn needs_write(&self) -> bool {
        !self.pending.is_empty()
    }

    fn drain_pending(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            if self.closing {
                self.release();
            }
            return Ok(0);
        }
        if self.released {
            self.pending.clear();
            return Ok(0);
        }

        match write_available(&mut self.handle, &self.pending)? {
            Progress::Written(n) => {
                self.pending.advance(n);
                trace!(stream = %self.label, written = n, left = self.pending.len(), "drained");
                if self.pending.is_empty() && self.closing {
                    self.release();
                }
                Ok(n)
            }
            Progress::PeerGone => {
                self.end_broken();
                Ok(0)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if !self.closing {
            debug!(stream = %self.label, pending = self.pending.len(), "closing");
        }
        self.closing = true;
        if self.pending.is_empty() {
            self.release();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closing
    }

    fn raw_fd(&self) -> RawFd {
        self.handle.as_raw_fd()
    }
}

impl<H: Handle> AsRawFd for Stream<H> {
    fn as_raw_fd(&self) -> RawFd {
        self.handle.as_raw_fd()
    }
}

impl<H: Handle> Drop for Stream<H> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(stream = %self.label, dropped = self.pending.len(), "dropping unwritten output");
        }
        if let Some(nonblocking) = self.restore_nonblocking.take() {
            if let Err(e) = select::set_nonblocking(self.handle.as_raw_fd(), nonblocking) {
                warn!(stream = %self.label, error = %e, "failed to restore blocking mode");
            }
        }
    }
}

/// Write as much of `data` as the handle takes without blocking
fn write_available<W: Write>(handle: &mut W, data: &[u8]) -> Result<Progress> {
    let mut written = 0;
    while written < data.len() {
        match handle.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if is_peer_gone(&e) => return Ok(Progress::PeerGone),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Progress::Written(written))
}

fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

/// Errors a read reports once the other end has gone away
///
/// A pty master reads `EIO` after the last slave descriptor closes.
fn is_end_of_input(e: &io::Error) -> bool {
    e.kind() == ErrorKind::ConnectionReset || e.raw_os_error() == Some(libc::EIO)
}
