//! Wire framing for byte-stream transports.
//!
//! Every message on a stream transport is one frame: a fixed 16-byte
//! header in network byte order followed by `payload_len` opaque payload
//! bytes. There is no trailer and no checksum; stream transports rely on
//! the underlying transport's integrity.
//!
//! The header is deliberately size-prefixed (`header_len`) so small
//! capability additions can extend it without a protocol-version bump.

use std::io::{self, Read, Write};

use sluice_types::{Message, Result, Status};

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Single-frame payload ceiling. Larger messages are refused on send and
/// rejected on decode; fragmentation is reserved (`flags::FRAG`).
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Frame magic: the ASCII bytes "DUCT".
pub const PROTOCOL_MAGIC: u32 = 0x4455_4354;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Frame flag bits. All bits are reserved until the corresponding feature
/// is implemented; encoders currently always write zero.
pub mod flags {
    /// At-least-once delivery enabled for this pipe (reserved).
    pub const RELIABLE: u32 = 1 << 0;
    /// Payload is one fragment of a larger message (reserved).
    pub const FRAG: u32 = 1 << 4;
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub header_len: u16,
    pub payload_len: u32,
    pub flags: u32,
}

impl FrameHeader {
    /// Header for a payload of `payload_len` bytes with the given flags.
    pub fn for_payload(payload_len: u32, flags: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            header_len: HEADER_LEN as u16,
            payload_len,
            flags,
        }
    }

    /// Encode into the fixed wire layout (network byte order).
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&self.header_len.to_be_bytes());
        out[8..12].copy_from_slice(&self.payload_len.to_be_bytes());
        out[12..16].copy_from_slice(&self.flags.to_be_bytes());
        out
    }

    /// Decode and validate a header.
    ///
    /// Returns `ProtocolError` when the magic, version, header length, or
    /// payload ceiling invariants fail.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let header = Self {
            magic: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            version: u16::from_be_bytes([buf[4], buf[5]]),
            header_len: u16::from_be_bytes([buf[6], buf[7]]),
            payload_len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        };

        if header.magic != PROTOCOL_MAGIC {
            return Err(Status::protocol_error("bad frame magic"));
        }
        if header.version != PROTOCOL_VERSION {
            return Err(Status::protocol_error(format!(
                "unsupported frame version {}",
                header.version
            )));
        }
        if header.header_len != HEADER_LEN as u16 {
            return Err(Status::protocol_error(format!(
                "bad header_len {}",
                header.header_len
            )));
        }
        if header.payload_len as usize > MAX_FRAME_PAYLOAD {
            return Err(Status::protocol_error(format!(
                "frame payload too large ({} bytes)",
                header.payload_len
            )));
        }
        Ok(header)
    }
}

/// Write one frame: header then payload.
///
/// Fails with `InvalidArgument` when the payload exceeds
/// [`MAX_FRAME_PAYLOAD`]. Interrupted writes retry transparently.
pub fn write_frame<W: Write>(w: &mut W, msg: &Message, flags: u32) -> Result<()> {
    if msg.len() > MAX_FRAME_PAYLOAD {
        return Err(Status::invalid_argument(format!(
            "message of {} bytes exceeds the {} byte frame ceiling",
            msg.len(),
            MAX_FRAME_PAYLOAD
        )));
    }

    let header = FrameHeader::for_payload(msg.len() as u32, flags);
    w.write_all(&header.encode())
        .map_err(|e| map_write_err("write_frame header", e))?;
    if !msg.is_empty() {
        w.write_all(msg.as_slice())
            .map_err(|e| map_write_err("write_frame payload", e))?;
    }
    w.flush().map_err(|e| map_write_err("write_frame flush", e))
}

/// Read one frame and return a freshly allocated message.
///
/// End-of-stream is `Closed`; a malformed header is `ProtocolError`;
/// other I/O failures are `IoError`. Interrupted reads retry
/// transparently.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Message> {
    let mut header_buf = [0u8; HEADER_LEN];
    r.read_exact(&mut header_buf)
        .map_err(|e| map_read_err("read_frame header", e))?;
    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        r.read_exact(&mut payload)
            .map_err(|e| map_read_err("read_frame payload", e))?;
    }
    Ok(Message::from_vec(payload))
}

fn map_read_err(context: &str, err: io::Error) -> Status {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return Status::closed("peer closed");
    }
    Status::from_io(context, err)
}

fn map_write_err(context: &str, err: io::Error) -> Status {
    if err.kind() == io::ErrorKind::WriteZero {
        return Status::closed("peer closed");
    }
    Status::from_io(context, err)
}
