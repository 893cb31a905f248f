//! ptyrelay-core: relays a local terminal to a remote pseudo-terminal
//!
//! The pieces, leaves first:
//! - [`Stream`]: non-blocking handle wrapper with a pending-write buffer
//! - [`Demuxer`]: unwraps framed remote output into a flat byte stream
//! - [`Pump`]: moves bytes from one stream to another and tracks completion
//! - [`Terminal`]: raw-mode controller for the local terminal
//! - [`Session`]: readiness loop driving all pumps to completion

pub mod config;
pub mod demux;
pub mod pump;
pub mod select;
pub mod session;
pub mod stream;
pub mod tty;

#[cfg(test)]
pub(crate) mod testing;

pub use config::RelayConfig;
pub use demux::Demuxer;
pub use pump::{Flushed, Pump};
pub use session::{
    Connector, LocalStreams, RemoteStreams, ResizeSink, Session, SessionParams,
};
pub use stream::{ByteStream, Chunk, Handle, Stream, DEFAULT_CHUNK_SIZE};
pub use tty::{Terminal, TerminalMode, WindowSize};
