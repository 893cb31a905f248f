//! Test doubles shared by the unit tests

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use bytes::Bytes;

use ptyrelay_utils::Result;

use crate::stream::{ByteStream, Chunk, Handle};

enum Step {
    Accept(usize),
    Block,
    Interrupt,
}

enum ReadStep {
    Data(Vec<u8>),
    Interrupt,
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    reads: VecDeque<ReadStep>,
    accept_all: bool,
    written: Vec<u8>,
    shut_down: bool,
}

/// Handle whose writes follow a script, then block (or accept everything)
///
/// Reads replay queued steps and block once they run out.
pub struct ScriptedHandle {
    script: RefCell<Script>,
}

impl ScriptedHandle {
    /// `Some(n)` accepts up to `n` bytes for one write call, `None` blocks
    pub fn accepting(steps: &[Option<usize>]) -> Self {
        let steps = steps
            .iter()
            .map(|s| match s {
                Some(n) => Step::Accept(*n),
                None => Step::Block,
            })
            .collect();
        Self {
            script: RefCell::new(Script {
                steps,
                ..Script::default()
            }),
        }
    }

    /// First write is interrupted by a signal, later writes succeed
    pub fn interrupting_once() -> Self {
        Self {
            script: RefCell::new(Script {
                steps: VecDeque::from([Step::Interrupt]),
                accept_all: true,
                ..Script::default()
            }),
        }
    }

    pub fn queue_read(&self, data: &[u8]) {
        self.script.borrow_mut().reads.push_back(ReadStep::Data(data.to_vec()));
    }

    /// Next read is interrupted by a signal
    pub fn queue_read_interrupt(&self) {
        self.script.borrow_mut().reads.push_back(ReadStep::Interrupt);
    }

    pub fn accept_all(&self) {
        let mut script = self.script.borrow_mut();
        script.steps.clear();
        script.accept_all = true;
    }

    pub fn written(&self) -> Vec<u8> {
        self.script.borrow().written.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.script.borrow().shut_down
    }
}

impl Read for ScriptedHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.script.get_mut().reads.pop_front() {
            Some(ReadStep::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(ReadStep::Interrupt) => Err(ErrorKind::Interrupted.into()),
            None => Err(ErrorKind::WouldBlock.into()),
        }
    }
}

impl Write for ScriptedHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let script = self.script.get_mut();
        let step = match script.steps.pop_front() {
            Some(step) => step,
            None if script.accept_all => Step::Accept(buf.len()),
            None => Step::Block,
        };
        match step {
            Step::Accept(n) => {
                let n = n.min(buf.len());
                script.written.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            Step::Block => Err(ErrorKind::WouldBlock.into()),
            Step::Interrupt => Err(ErrorKind::Interrupted.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for ScriptedHandle {
    fn as_raw_fd(&self) -> RawFd {
        -1
    }
}

impl Handle for ScriptedHandle {
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.script.get_mut().shut_down = true;
        Ok(())
    }
}

#[derive(Default)]
struct MemState {
    reads: VecDeque<Chunk>,
    written: Vec<u8>,
    pending: Vec<u8>,
    /// Bytes the destination takes per write or drain call; `None` = unlimited
    budget: Option<usize>,
    closed: bool,
}

/// In-memory [`ByteStream`] with a shared view for assertions
///
/// Reads replay queued chunks, splitting them to honour `max`; an empty
/// queue reads as `Pending`.
#[derive(Clone, Default)]
pub struct MemStream {
    state: Rc<RefCell<MemState>>,
}

impl MemStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, data: &[u8]) {
        self.state
            .borrow_mut()
            .reads
            .push_back(Chunk::Data(Bytes::copy_from_slice(data)));
    }

    pub fn push_eof(&self) {
        self.state.borrow_mut().reads.push_back(Chunk::Eof);
    }

    pub fn set_budget(&self, budget: Option<usize>) {
        self.state.borrow_mut().budget = budget;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.state.borrow().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    fn flush_pending(state: &mut MemState) -> usize {
        let n = state.budget.unwrap_or(usize::MAX).min(state.pending.len());
        let out: Vec<u8> = state.pending.drain(..n).collect();
        state.written.extend_from_slice(&out);
        n
    }
}

impl ByteStream for MemStream {
    fn read(&mut self, max: usize) -> Result<Chunk> {
        let mut state = self.state.borrow_mut();
        match state.reads.pop_front() {
            Some(Chunk::Data(mut data)) => {
                if data.len() > max {
                    let rest = data.split_off(max);
                    state.reads.push_front(Chunk::Data(rest));
                }
                Ok(Chunk::Data(data))
            }
            Some(Chunk::Eof) => {
                // End-of-stream is sticky
                state.reads.push_front(Chunk::Eof);
                Ok(Chunk::Eof)
            }
            Some(Chunk::Pending) | None => Ok(Chunk::Pending),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Ok(0);
        }
        state.pending.extend_from_slice(data);
        Self::flush_pending(&mut state);
        Ok(data.len())
    }

    fn needs_write(&self) -> bool {
        !self.state.borrow().pending.is_empty()
    }

    fn drain_pending(&mut self) -> Result<usize> {
        Ok(Self::flush_pending(&mut self.state.borrow_mut()))
    }

    fn close(&mut self) -> Result<()> {
        self.state.borrow_mut().closed = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.state.borrow().closed
    }

    fn raw_fd(&self) -> RawFd {
        -1
    }
}

/// Open a pseudo-terminal pair, returning `(master, slave)`
pub fn openpty() -> (OwnedFd, OwnedFd) {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    // SAFETY: both out-pointers are valid; the optional arguments are null
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    assert_eq!(rc, 0, "openpty failed: {}", io::Error::last_os_error());
    // SAFETY: openpty returned two fresh descriptors we now own
    unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) }
}
