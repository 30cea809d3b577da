//! Frame codec for the node's wire protocol.
//!
//! Every message travels as one self-delimiting frame:
//!
//! ```text
//! +----------+----------+----------------+---------+------+
//! | cmd_len  | body_len | correlation_id | command | body |
//! | u32 BE   | u32 BE   | u64 BE         |         |      |
//! +----------+----------+----------------+---------+------+
//! ```
//!
//! A correlation id of zero marks an uncorrelated message. Replies built
//! with [`Message::reply`] carry the id of the request they answer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FrameError, NodeError, Result};

/// Fixed header size: two length fields plus the correlation id.
pub const HEADER_SIZE: usize = 4 + 4 + 8;

/// Longest accepted command name.
pub const MAX_COMMAND_LEN: usize = 1024;

/// Largest accepted body (16 MiB).
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// One command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Command name used for routing.
    pub command: Bytes,
    /// Opaque payload.
    pub body: Bytes,
    /// Request/reply correlation id (0 = none).
    pub correlation_id: u64,
}

impl Message {
    /// Create an uncorrelated message.
    pub fn new(command: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            body: body.into(),
            correlation_id: 0,
        }
    }

    /// Set the correlation id.
    pub fn with_correlation(mut self, id: u64) -> Self {
        self.correlation_id = id;
        self
    }

    /// Command name as text, for table lookups and logging.
    pub fn command_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.command)
    }

    /// Replace the body in place.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Build a reply under the same command and correlation id.
    pub fn reply(&self, body: impl Into<Bytes>) -> Message {
        Message {
            command: self.command.clone(),
            body: body.into(),
            correlation_id: self.correlation_id,
        }
    }

    /// Size of this message once framed.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.command.len() + self.body.len()
    }
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// A full frame was decoded; carries the number of bytes consumed.
    Complete(Message, usize),
    /// Need more data.
    Incomplete,
    /// The header violates the framing rules.
    Error(FrameError),
}

/// Parse one frame from the front of `input`.
pub fn parse(input: &[u8]) -> ParseResult {
    if input.len() < HEADER_SIZE {
        return ParseResult::Incomplete;
    }

    let mut header = &input[..HEADER_SIZE];
    let cmd_len = header.get_u32() as usize;
    let body_len = header.get_u32() as usize;
    let correlation_id = header.get_u64();

    if let Err(e) = check_lengths(cmd_len, body_len) {
        return ParseResult::Error(e);
    }

    let total = HEADER_SIZE + cmd_len + body_len;
    if input.len() < total {
        return ParseResult::Incomplete;
    }

    let cmd_end = HEADER_SIZE + cmd_len;
    let message = Message {
        command: Bytes::copy_from_slice(&input[HEADER_SIZE..cmd_end]),
        body: Bytes::copy_from_slice(&input[cmd_end..total]),
        correlation_id,
    };
    ParseResult::Complete(message, total)
}

fn check_lengths(cmd_len: usize, body_len: usize) -> std::result::Result<(), FrameError> {
    if cmd_len == 0 {
        return Err(FrameError::EmptyCommand);
    }
    if cmd_len > MAX_COMMAND_LEN {
        return Err(FrameError::CommandTooLong(cmd_len));
    }
    if body_len > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge(body_len));
    }
    Ok(())
}

/// Append the framed form of `message` to `output`.
///
/// Refuses messages that [`parse`] would reject, leaving `output`
/// untouched.
pub fn encode(message: &Message, output: &mut BytesMut) -> std::result::Result<(), FrameError> {
    check_lengths(message.command.len(), message.body.len())?;
    output.reserve(message.encoded_len());
    output.put_u32(message.command.len() as u32);
    output.put_u32(message.body.len() as u32);
    output.put_u64(message.correlation_id);
    output.extend_from_slice(&message.command);
    output.extend_from_slice(&message.body);
    Ok(())
}

/// Reading half of the codec.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Wait for the next complete frame.
    ///
    /// A clean end of stream between frames yields
    /// [`NodeError::ConnectionClosed`]; an end of stream inside a frame is
    /// reported as [`FrameError::Truncated`].
    pub async fn read_message(&mut self) -> Result<Message> {
        loop {
            match parse(&self.buffer) {
                ParseResult::Complete(message, consumed) => {
                    self.buffer.advance(consumed);
                    return Ok(message);
                }
                ParseResult::Error(e) => return Err(e.into()),
                ParseResult::Incomplete => {}
            }

            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Err(NodeError::ConnectionClosed);
                }
                return Err(FrameError::Truncated.into());
            }
        }
    }
}

/// Writing half of the codec.
pub struct FrameWriter<W> {
    inner: W,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Write one whole frame and flush it.
    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        self.buffer.clear();
        encode(message, &mut self.buffer)?;
        self.inner.write_all(&self.buffer).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Close the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
