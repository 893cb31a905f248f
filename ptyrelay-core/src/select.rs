//! Readiness polling over raw descriptors

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Descriptors found ready by [`wait`], as indices into the input slices
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: Vec<usize>,
    pub writable: Vec<usize>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }
}

const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
const WRITE_EVENTS: libc::c_short = libc::POLLOUT | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

/// Wait until any of `read` is readable or any of `write` is writable
///
/// Hang-ups and errors count as ready so the following read or write can
/// observe them. `None` waits indefinitely, a zero duration returns
/// immediately. A wait interrupted by a signal reports nothing ready.
pub fn wait(read: &[RawFd], write: &[RawFd], timeout: Option<Duration>) -> io::Result<Readiness> {
    let mut fds: Vec<libc::pollfd> = read
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .chain(write.iter().map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        }))
        .collect();

    // SAFETY: `fds` is a live, initialized buffer of exactly `fds.len()` entries
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms(timeout)) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::default());
        }
        return Err(err);
    }

    let mut ready = Readiness::default();
    if ret == 0 {
        return Ok(ready);
    }

    let (read_fds, write_fds) = fds.split_at(read.len());
    ready.readable = read_fds
        .iter()
        .enumerate()
        .filter(|(_, p)| p.revents & READ_EVENTS != 0)
        .map(|(i, _)| i)
        .collect();
    ready.writable = write_fds
        .iter()
        .enumerate()
        .filter(|(_, p)| p.revents & WRITE_EVENTS != 0)
        .map(|(i, _)| i)
        .collect();

    Ok(ready)
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        // Round sub-millisecond waits up so they do not become busy polls
        Some(d) => d.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int,
    }
}

/// Set or clear `O_NONBLOCK` on `fd`, returning whether it was set before
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<bool> {
    // SAFETY: F_GETFL takes no pointer argument; a bad fd only yields EBADF
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let was_nonblocking = flags & libc::O_NONBLOCK != 0;
    let new_flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };

    if new_flags != flags {
        // SAFETY: F_SETFL takes an integer flag word, no memory is shared
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(was_nonblocking)
}

/// Whether `O_NONBLOCK` is set on `fd`
pub fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    // SAFETY: F_GETFL takes no pointer argument; a bad fd only yields EBADF
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}
