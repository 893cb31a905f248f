//! Socket connections to the remote side

use std::io::Write;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use ptyrelay_core::{
    ByteStream, Connector, Handle, RemoteStreams, ResizeSink, SessionParams, Stream, WindowSize,
};
use ptyrelay_utils::{RelayError, Result};

/// Where a remote endpoint listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl Address {
    /// Parse `tcp://host:port`, `unix:///path` or a bare socket path
    pub fn parse(addr: &str) -> Result<Self> {
        if addr.starts_with("tcp://") {
            let url = Url::parse(addr)
                .map_err(|e| RelayError::connection(format!("Invalid TCP URL '{}': {}", addr, e)))?;
            let host = url
                .host_str()
                .ok_or_else(|| RelayError::connection("Missing host in TCP URL"))?;
            let port = url
                .port()
                .ok_or_else(|| RelayError::connection("Missing port in TCP URL"))?;
            Ok(Self::Tcp(format!("{}:{}", host, port)))
        } else if addr.starts_with("unix://") {
            let url = Url::parse(addr)
                .map_err(|e| RelayError::connection(format!("Invalid Unix URL: {}", e)))?;
            Ok(Self::Unix(PathBuf::from(url.path())))
        } else if addr.is_empty() {
            Err(RelayError::connection("Empty address"))
        } else {
            Ok(Self::Unix(PathBuf::from(addr)))
        }
    }

    fn connect(&self) -> Result<Socket> {
        match self {
            Self::Unix(path) => UnixStream::connect(path).map(Socket::Unix).map_err(|e| {
                RelayError::connection(format!("Failed to connect to {}: {}", path.display(), e))
            }),
            Self::Tcp(addr) => TcpStream::connect(addr).map(Socket::Tcp).map_err(|e| {
                RelayError::connection(format!("Failed to connect to {}: {}", addr, e))
            }),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

enum Socket {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Socket {
    /// Split into independent input and output streams over one connection
    fn into_duplex(
        self,
        label: &str,
        pending_limit: Option<usize>,
    ) -> Result<(Box<dyn ByteStream>, Box<dyn ByteStream>)> {
        match self {
            Self::Unix(sock) => {
                sock.set_nonblocking(true)?;
                let reader = sock.try_clone()?;
                Ok(duplex(sock, reader, label, pending_limit))
            }
            Self::Tcp(sock) => {
                sock.set_nonblocking(true)?;
                sock.set_nodelay(true)?;
                let reader = sock.try_clone()?;
                Ok(duplex(sock, reader, label, pending_limit))
            }
        }
    }

    fn into_reader(self, label: &str) -> Result<Box<dyn ByteStream>> {
        Ok(match self {
            Self::Unix(sock) => {
                sock.set_nonblocking(true)?;
                Box::new(Stream::assume_nonblocking(sock, label))
            }
            Self::Tcp(sock) => {
                sock.set_nonblocking(true)?;
                Box::new(Stream::assume_nonblocking(sock, label))
            }
        })
    }

    fn into_writer(self) -> Box<dyn Write> {
        match self {
            Self::Unix(sock) => Box::new(sock),
            Self::Tcp(sock) => Box::new(sock),
        }
    }
}

fn duplex<H: Handle + 'static>(
    writer: H,
    reader: H,
    label: &str,
    pending_limit: Option<usize>,
) -> (Box<dyn ByteStream>, Box<dyn ByteStream>) {
    let input = Stream::assume_nonblocking(writer, format!("{} input", label))
        .with_pending_limit(pending_limit);
    let output = Stream::assume_nonblocking(reader, format!("{} output", label));
    (Box::new(input), Box::new(output))
}

/// Resize message sent on the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeMessage {
    pub rows: u16,
    pub cols: u16,
}

impl From<WindowSize> for ResizeMessage {
    fn from(size: WindowSize) -> Self {
        Self {
            rows: size.rows,
            cols: size.cols,
        }
    }
}

/// Writes each size change as one JSON line
pub struct JsonResizeSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonResizeSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> ResizeSink for JsonResizeSink<W> {
    fn resize(&mut self, size: WindowSize) -> Result<()> {
        let mut line = serde_json::to_vec(&ResizeMessage::from(size))
            .map_err(|e| RelayError::protocol(format!("encode resize: {}", e)))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .and_then(|()| self.writer.flush())
            .map_err(|e| match RelayError::from(e) {
                err if err.is_peer_closed() => RelayError::ConnectionClosed,
                err => err,
            })
    }
}

/// Connects to the remote side over Unix or TCP sockets
#[derive(Debug, Clone)]
pub struct SocketConnector {
    primary: Address,
    stderr: Option<Address>,
    control: Option<Address>,
    multiplexed: bool,
    pending_limit: Option<usize>,
}

impl SocketConnector {
    pub fn new(primary: Address) -> Self {
        Self {
            primary,
            stderr: None,
            control: None,
            multiplexed: false,
            pending_limit: None,
        }
    }

    pub fn with_stderr(mut self, addr: Option<Address>) -> Self {
        self.stderr = addr;
        self
    }

    pub fn with_control(mut self, addr: Option<Address>) -> Self {
        self.control = addr;
        self
    }

    pub fn multiplexed(mut self, multiplexed: bool) -> Self {
        self.multiplexed = multiplexed;
        self
    }

    /// Cap on bytes queued for the remote input
    pub fn with_pending_limit(mut self, limit: Option<usize>) -> Self {
        self.pending_limit = limit;
        self
    }
}

impl Connector for SocketConnector {
    fn connect(&mut self, params: &SessionParams) -> Result<RemoteStreams> {
        debug!(addr = %self.primary, "connecting");
        let (input, output) = self
            .primary
            .connect()?
            .into_duplex("remote", self.pending_limit)?;

        let error = match &self.stderr {
            Some(addr) => {
                debug!(%addr, "connecting stderr");
                Some(addr.connect()?.into_reader("remote stderr")?)
            }
            None => None,
        };

        let resizer = match &self.control {
            Some(addr) => {
                debug!(%addr, "connecting control");
                let sink = JsonResizeSink::new(addr.connect()?.into_writer());
                Some(Box::new(sink) as Box<dyn ResizeSink>)
            }
            None => None,
        };

        Ok(RemoteStreams {
            input: params.stdin_open.then_some(input),
            output,
            error,
            multiplexed: self.multiplexed,
            resizer,
        })
    }
}
