//! Frame header layout and channel tags

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of a frame header in bytes
pub const HEADER_LEN: usize = 8;

/// Channel a frame belongs to
///
/// The tag is carried on the wire but payload demultiplexing does not
/// depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl Channel {
    /// Map a wire tag to a known channel
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw channel tag
    pub tag: u8,
    /// Payload length in bytes
    pub length: u32,
}

impl FrameHeader {
    pub fn new(channel: Channel, length: u32) -> Self {
        Self {
            tag: channel.tag(),
            length,
        }
    }

    /// Decode a header; the reserved bytes are ignored
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut buf = &bytes[..];
        let tag = buf.get_u8();
        buf.advance(3);
        let length = buf.get_u32();
        Self { tag, length }
    }

    /// Encode the header with zeroed reserved bytes
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.tag;
        out[4..].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Append the encoded header to `dst`
    pub fn put(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u8(self.tag);
        dst.put_bytes(0, 3);
        dst.put_u32(self.length);
    }

    pub fn channel(&self) -> Option<Channel> {
        Channel::from_tag(self.tag)
    }

    /// A zero-length frame ends the flow
    pub fn is_end_of_stream(&self) -> bool {
        self.length == 0
    }
}

/// A complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel: Channel, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: channel.tag(),
            payload: payload.into(),
        }
    }

    /// The zero-length frame marking end-of-stream on `channel`
    pub fn end_of_stream(channel: Channel) -> Self {
        Self::new(channel, Bytes::new())
    }

    pub fn channel(&self) -> Option<Channel> {
        Channel::from_tag(self.tag)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.payload.is_empty()
    }

    /// Header describing this frame
    ///
    /// Payloads above `u32::MAX` cannot be framed; [`crate::FrameCodec`]
    /// rejects them long before that.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            tag: self.tag,
            length: self.payload.len() as u32,
        }
    }

    /// Serialize header and payload into a contiguous buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header().put(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
