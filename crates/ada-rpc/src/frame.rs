//! Wire framing shared by every transport.
//!
//! Each frame is a flags byte, a 4-byte big-endian body length and the body:
//!
//! ```text
//! [u8 flags][u32 BE: len][body of len]
//! ```
//!
//! A multipart message is a run of frames whose `MORE` flag is set, closed by
//! a frame with `MORE` clear. `COMMAND` frames carry the authentication
//! handshake and never reach a codec.

use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// More frames of the same message follow.
pub const FLAG_MORE: u8 = 0b0000_0001;
/// Handshake frame, not application data.
pub const FLAG_COMMAND: u8 = 0b0000_0010;

const KNOWN_FLAGS: u8 = FLAG_MORE | FLAG_COMMAND;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub body: Bytes,
}

impl Frame {
    pub fn data(body: impl Into<Bytes>, more: bool) -> Self {
        Self {
            flags: if more { FLAG_MORE } else { 0 },
            body: body.into(),
        }
    }

    pub fn command(body: impl Into<Bytes>) -> Self {
        Self {
            flags: FLAG_COMMAND,
            body: body.into(),
        }
    }

    pub fn more(&self) -> bool {
        self.flags & FLAG_MORE != 0
    }

    pub fn is_command(&self) -> bool {
        self.flags & FLAG_COMMAND != 0
    }
}

/// Read one frame.
///
/// Returns `None` on clean EOF before the first header byte (peer closed the
/// connection between messages).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; 5];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut header[1..]).await?;

    let flags = header[0];
    if flags & !KNOWN_FLAGS != 0 {
        return Err(RpcError::protocol(format!("unknown frame flags {:#04x}", flags)));
    }

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(RpcError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len,
            TransportConfig::MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(Some(Frame {
        flags,
        body: Bytes::from(body),
    }))
}

/// Write one frame. The caller flushes once the whole message is written.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    if frame.body.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(RpcError::protocol(format!(
            "frame size {} exceeds maximum {}",
            frame.body.len(),
            TransportConfig::MAX_FRAME_SIZE
        )));
    }
    let len = frame.body.len() as u32;
    writer.write_u8(frame.flags).await?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&frame.body).await?;
    Ok(())
}
