//! Multipart framing over byte streams.
//!
//! Each multipart message is prefixed with a 4-byte big-endian length header.
//! The body holds a 2-byte frame count followed by, per frame, a 1-byte kind
//! tag, a 4-byte big-endian length and the payload.

use crate::error::WireError;
use crate::frame::{Frame, FrameKind};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single multipart message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum number of frames in one multipart message.
pub const MAX_FRAMES: usize = u16::MAX as usize;

/// A duplex channel that moves whole multipart messages.
#[async_trait]
pub trait MultipartChannel: Send {
    async fn send_multipart(&mut self, frames: Vec<Frame>) -> Result<(), WireError>;
    async fn recv_multipart(&mut self) -> Result<Vec<Frame>, WireError>;
}

/// Encode a multipart message to bytes (length header + body).
pub fn encode_multipart(frames: &[Frame]) -> Result<Vec<u8>, WireError> {
    if frames.len() > MAX_FRAMES {
        return Err(WireError::Malformed(format!(
            "too many frames: {}",
            frames.len()
        )));
    }
    let body_len: usize = 2 + frames.iter().map(|f| 5 + f.len()).sum::<usize>();
    if body_len > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: body_len.min(u32::MAX as usize) as u32,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut bytes = Vec::with_capacity(4 + body_len);
    bytes.extend_from_slice(&(body_len as u32).to_be_bytes());
    bytes.extend_from_slice(&(frames.len() as u16).to_be_bytes());
    for frame in frames {
        bytes.push(frame.kind().tag());
        bytes.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        bytes.extend_from_slice(frame.as_bytes());
    }
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a message body into frames.
pub fn decode_multipart(body: &[u8]) -> Result<Vec<Frame>, WireError> {
    let mut cursor = Cursor { buf: body, pos: 0 };
    let count = u16::from_be_bytes(cursor.take_array::<2>()?) as usize;
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let [tag] = cursor.take_array::<1>()?;
        let kind = FrameKind::from_tag(tag)
            .ok_or_else(|| WireError::Malformed(format!("unknown frame tag {tag}")))?;
        let len = u32::from_be_bytes(cursor.take_array::<4>()?) as usize;
        let data = cursor.take(len)?;
        frames.push(Frame::new(kind, Bytes::copy_from_slice(data)));
    }
    if cursor.pos != body.len() {
        return Err(WireError::Malformed(format!(
            "{} trailing bytes",
            body.len() - cursor.pos
        )));
    }
    Ok(frames)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| WireError::Malformed("truncated frame".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// Write a multipart message to a stream.
pub async fn write_multipart<W>(writer: &mut W, frames: &[Frame]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_multipart(frames)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a multipart message from a stream.
pub async fn read_multipart<R>(reader: &mut R) -> Result<Vec<Frame>, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode_multipart(&body)
}

/// A byte stream speaking multipart framing.
#[derive(Debug)]
pub struct FramedStream<S> {
    inner: S,
}

impl<S> FramedStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S> MultipartChannel for FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_multipart(&mut self, frames: Vec<Frame>) -> Result<(), WireError> {
        write_multipart(&mut self.inner, &frames).await
    }

    async fn recv_multipart(&mut self) -> Result<Vec<Frame>, WireError> {
        read_multipart(&mut self.inner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frames;

    #[test]
    fn test_encode_decode() {
        let msg = vec![
            Frame::text("peer"),
            Frame::empty(),
            Frame::new(FrameKind::Int, vec![0u8; 8]),
            Frame::raw(vec![0xff, 0x01]),
        ];
        let bytes = encode_multipart(&msg).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        assert_eq!(decode_multipart(&bytes[4..]).unwrap(), msg);
    }

    #[test]
    fn test_truncated_body_rejected() {
        let bytes = encode_multipart(&frames(&["abc", "def"])).unwrap();
        let body = &bytes[4..bytes.len() - 1];
        assert!(matches!(
            decode_multipart(body),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut bytes = encode_multipart(&frames(&["x"])).unwrap();
        bytes[6] = 42;
        assert!(matches!(
            decode_multipart(&bytes[4..]),
            Err(WireError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_roundtrip_and_close() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = FramedStream::new(a);
        let mut right = FramedStream::new(b);
        left.send_multipart(frames(&["", "VIP1", "x"])).await.unwrap();
        assert_eq!(
            right.recv_multipart().await.unwrap(),
            frames(&["", "VIP1", "x"])
        );
        drop(left);
        assert!(matches!(
            right.recv_multipart().await,
            Err(WireError::ConnectionClosed)
        ));
    }
}
