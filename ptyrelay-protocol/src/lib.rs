//! ptyrelay-protocol: framing used by a remote peer to interleave output
//! channels on one connection
//!
//! Each frame is an 8-byte header (channel tag, three reserved bytes and a
//! big-endian payload length) followed by the payload. A zero-length frame
//! ends the flow.

pub mod codec;
pub mod frame;

pub use codec::{CodecError, FrameCodec, MAX_FRAME_SIZE};
pub use frame::{Channel, Frame, FrameHeader, HEADER_LEN};
