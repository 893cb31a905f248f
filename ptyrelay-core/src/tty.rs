//! Local terminal control
//!
//! [`Terminal`] switches the local terminal into raw mode for the duration of
//! a session and puts the original attributes back afterwards. Handles that
//! are not terminals are left alone.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, RawFd};

use tracing::{debug, error};

use ptyrelay_utils::{RelayError, Result};

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

/// Whether `fd` refers to a terminal
pub fn is_tty(fd: &impl AsRawFd) -> bool {
    // SAFETY: isatty only inspects the descriptor
    unsafe { libc::isatty(fd.as_raw_fd()) == 1 }
}

/// Current window size of the terminal behind `fd`, `None` for non-terminals
pub fn size(fd: &impl AsRawFd) -> Option<WindowSize> {
    if !is_tty(fd) {
        return None;
    }
    let mut ws = MaybeUninit::<libc::winsize>::zeroed();
    // SAFETY: TIOCGWINSZ writes a winsize into the buffer we own
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, ws.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: initialized above (zeroed, then filled by the kernel)
    let ws = unsafe { ws.assume_init() };
    Some(WindowSize::new(ws.ws_row, ws.ws_col))
}

/// Set the window size of the terminal behind `fd`
pub fn set_size(fd: &impl AsRawFd, size: WindowSize) -> Result<()> {
    let ws = libc::winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ reads the winsize we pass by pointer
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
    if rc != 0 {
        return Err(RelayError::terminal(format!(
            "set window size: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn get_attrs(fd: RawFd) -> io::Result<libc::termios> {
    let mut attrs = MaybeUninit::<libc::termios>::zeroed();
    // SAFETY: tcgetattr fills the termios we own
    if unsafe { libc::tcgetattr(fd, attrs.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: filled by tcgetattr
    Ok(unsafe { attrs.assume_init() })
}

fn set_attrs(fd: RawFd, attrs: &libc::termios) -> io::Result<()> {
    // SAFETY: attrs is a valid termios
    if unsafe { libc::tcsetattr(fd, libc::TCSADRAIN, attrs) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Mode the controller has put the terminal in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    Inactive,
    Raw,
}

/// Raw-mode controller for one terminal handle
///
/// Attributes are captured on the first [`start`](Self::start) and restored
/// by [`stop`](Self::stop) or on drop.
pub struct Terminal<F: AsRawFd> {
    fd: F,
    raw: bool,
    original: Option<libc::termios>,
}

impl<F: AsRawFd> Terminal<F> {
    /// A controller that only changes the terminal when `raw` is set
    pub fn new(fd: F, raw: bool) -> Self {
        Self {
            fd,
            raw,
            original: None,
        }
    }

    pub fn fd(&self) -> &F {
        &self.fd
    }

    pub fn mode(&self) -> TerminalMode {
        if self.original.is_some() {
            TerminalMode::Raw
        } else {
            TerminalMode::Inactive
        }
    }

    pub fn is_tty(&self) -> bool {
        is_tty(&self.fd)
    }

    pub fn size(&self) -> Option<WindowSize> {
        size(&self.fd)
    }

    /// Enter raw mode
    pub fn start(&mut self) -> Result<()> {
        if !self.raw || self.original.is_some() || !self.is_tty() {
            return Ok(());
        }

        let fd = self.fd.as_raw_fd();
        let original =
            get_attrs(fd).map_err(|e| RelayError::terminal(format!("read attributes: {}", e)))?;

        let mut raw = original;
        // SAFETY: raw is a valid termios copy
        unsafe { libc::cfmakeraw(&mut raw) };
        set_attrs(fd, &raw).map_err(|e| RelayError::terminal(format!("enter raw mode: {}", e)))?;

        debug!(fd, "terminal in raw mode");
        self.original = Some(original);
        Ok(())
    }

    /// Restore the attributes captured by `start`
    pub fn stop(&mut self) -> Result<()> {
        let Some(original) = self.original.take() else {
            return Ok(());
        };
        let fd = self.fd.as_raw_fd();
        set_attrs(fd, &original)
            .map_err(|e| RelayError::terminal(format!("restore attributes: {}", e)))?;
        debug!(fd, "terminal restored");
        Ok(())
    }
}

impl<F: AsRawFd> Drop for Terminal<F> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Failed to restore terminal: {}", e);
        }
    }
}
