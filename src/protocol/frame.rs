//! Length prefixed framing over a byte stream
//!
//! Every frame is a 4 byte big endian length followed by that many bytes of
//! JSON. TCP gives no message boundaries, so reads loop until a frame is
//! complete no matter how the bytes were chunked.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::{Message, decode, encode};
use crate::error::{ConnectionError, ProtocolError};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Read one frame
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
/// Not cancel safe: dropping the future mid-frame loses the partial frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let read = reader.read(&mut header[filled..]).await?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ConnectionError::Truncated {
                expected: HEADER_LEN,
                received: filled,
            });
        }
        filled += read;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ConnectionError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    let mut received = 0;
    while received < len {
        let read = reader.read(&mut body[received..]).await?;
        if read == 0 {
            return Err(ConnectionError::Truncated {
                expected: len,
                received,
            });
        }
        received += read;
    }

    trace!("read frame of {len} bytes");
    Ok(Some(body))
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(ConnectionError::FrameTooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// What arrived on a [`MessageReader`]
#[derive(Debug)]
pub enum Received {
    Message(Message),
    /// A complete frame that did not decode; the stream itself is still usable
    Invalid(ProtocolError),
    Closed,
}

/// Reads whole messages from a stream
///
/// Unlike [`read_frame`], `recv` is cancel safe: bytes are buffered inside the
/// reader, so it can sit in a `select!` next to other branches.
#[derive(Debug)]
pub struct MessageReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    pub async fn recv(&mut self) -> Result<Received, ConnectionError> {
        let mut chunk = [0u8; 8 * 1024];

        loop {
            if let Some(frame) = take_frame(&mut self.buf)? {
                return match decode(&frame) {
                    Ok(message) => Ok(Received::Message(message)),
                    Err(e) => Ok(Received::Invalid(e)),
                };
            }

            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(Received::Closed);
                }
                return Err(truncated(&self.buf));
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Split one complete frame off the front of `buf`, if there is one
fn take_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, ConnectionError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let len = frame_len(buf);
    if len > MAX_FRAME_LEN {
        return Err(ConnectionError::FrameTooLarge(len));
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    let frame = buf[HEADER_LEN..HEADER_LEN + len].to_vec();
    buf.drain(..HEADER_LEN + len);
    trace!("read frame of {len} bytes");
    Ok(Some(frame))
}

fn frame_len(buf: &[u8]) -> usize {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
}

fn truncated(buf: &[u8]) -> ConnectionError {
    if buf.len() < HEADER_LEN {
        ConnectionError::Truncated {
            expected: HEADER_LEN,
            received: buf.len(),
        }
    } else {
        ConnectionError::Truncated {
            expected: frame_len(buf),
            received: buf.len() - HEADER_LEN,
        }
    }
}

#[derive(Debug)]
pub struct MessageWriter<W> {
    inner: W,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), ConnectionError> {
        let body = encode(message)?;
        write_frame(&mut self.inner, &body).await
    }

    /// Like [`send`](Self::send) but gives up after `limit`
    ///
    /// A peer that stops reading fills the socket buffer and would block the
    /// write forever. After a timeout part of the frame may have been written,
    /// so the stream must not be used for further messages.
    pub async fn send_within(
        &mut self,
        message: &Message,
        limit: Duration,
    ) -> Result<(), ConnectionError> {
        tokio::time::timeout(limit, self.send(message))
            .await
            .map_err(|_| ConnectionError::Timeout(limit))?
    }

    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
