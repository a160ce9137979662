//! Length-prefixed frame codec.
//!
//! Wire format, all integers big-endian:
//! ```text
//! frame:  [len: u32][id: i32][payload: len - 4 bytes]
//! string: [n: u32][n bytes of UTF-8]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Frame id that opens a new request.
pub const SENTINEL_ID: i32 = i32::MAX;

/// Frame id of the request envelope that follows a sentinel.
pub const ENVELOPE_ID: i32 = 0;

/// Frame id of the status frame that closes out a request.
pub const RESPONSE_ID: i32 = 0;

/// Frame id of payload frames a handler sends before the status.
pub const DATA_ID: i32 = 1;

/// Default upper bound on a single frame, id included.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const ID_LEN: usize = 4;

/// One discrete unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: i32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// The empty frame that marks the start of a request.
    pub fn sentinel() -> Self {
        Self::new(SENTINEL_ID, Bytes::new())
    }

    pub fn is_sentinel(&self) -> bool {
        self.id == SENTINEL_ID
    }

    /// A reader over this frame's payload fields.
    pub fn reader(&self) -> PayloadReader {
        PayloadReader::new(self.payload.clone())
    }
}

/// The request envelope: which route the peer wants to call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub verb: String,
    pub path: String,
}

impl Envelope {
    pub fn new(verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            path: path.into(),
        }
    }

    /// Decode the verb and path from an envelope frame payload.
    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        let mut reader = frame.reader();
        let verb = reader.read_string()?;
        let path = reader.read_string()?;
        Ok(Self { verb, path })
    }

    pub fn to_frame(&self) -> Frame {
        let payload = PayloadBuilder::new()
            .put_string(&self.verb)
            .put_string(&self.path)
            .finish();
        Frame::new(ENVELOPE_ID, payload)
    }
}

/// Sequential reader over the fields of a frame payload.
#[derive(Debug, Clone)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), FrameError> {
        if self.buf.remaining() < needed {
            return Err(FrameError::PayloadUnderrun {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_i32(&mut self) -> Result<i32, FrameError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    /// Read a `u32` length prefix followed by that many raw bytes.
    pub fn read_bytes(&mut self) -> Result<Bytes, FrameError> {
        let len = self.read_u32()? as usize;
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_string(&mut self) -> Result<String, FrameError> {
        let raw = self.read_bytes()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

/// Builds a frame payload field by field.
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    buf: BytesMut,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_i32(mut self, value: i32) -> Self {
        self.buf.put_i32(value);
        self
    }

    pub fn put_u32(mut self, value: u32) -> Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_bytes(mut self, value: &[u8]) -> Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    pub fn put_string(self, value: &str) -> Self {
        self.put_bytes(value.as_bytes())
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads frames from an async byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_len(reader, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(reader: R, max_frame_len: usize) -> Self {
        Self {
            reader,
            max_frame_len,
        }
    }

    /// Read the next frame.
    ///
    /// Returns [`FrameError::Closed`] if the stream ends cleanly before a frame
    /// starts, and [`FrameError::Truncated`] if it ends inside one.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        let mut len_buf = [0u8; 4];
        let first = self.reader.read(&mut len_buf).await?;
        if first == 0 {
            return Err(FrameError::Closed);
        }
        self.read_exact(&mut len_buf[first..]).await?;

        let len = u32::from_be_bytes(len_buf);
        if (len as usize) < ID_LEN {
            return Err(FrameError::InvalidLength(len));
        }
        if len as usize > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len: len as usize,
                max: self.max_frame_len,
            });
        }

        let mut body = vec![0u8; len as usize];
        self.read_exact(&mut body).await?;

        let mut body = Bytes::from(body);
        let id = body.get_i32();
        Ok(Frame { id, payload: body })
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
            Err(e) => Err(FrameError::Io(e)),
        }
    }
}

/// Writes frames to an async byte stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: W,
    max_frame_len: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self::with_max_frame_len(writer, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(writer: W, max_frame_len: usize) -> Self {
        Self {
            writer,
            max_frame_len,
        }
    }

    /// Write one frame and flush it.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        let len = ID_LEN + frame.payload.len();
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_u32(len as u32);
        buf.put_i32(frame.id);
        buf.put_slice(&frame.payload);

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Flush and half-close the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_frame(&Frame::sentinel()).await.unwrap();
        writer
            .write_frame(&Envelope::new("post", "/ping").to_frame())
            .await
            .unwrap();

        let marker = reader.read_frame().await.unwrap();
        assert!(marker.is_sentinel());
        assert!(marker.payload.is_empty());

        let envelope = reader.read_frame().await.unwrap();
        assert_eq!(envelope.id, ENVELOPE_ID);
        assert_eq!(
            Envelope::decode(&envelope).unwrap(),
            Envelope::new("post", "/ping")
        );
    }

    #[tokio::test]
    async fn test_clean_eof_is_closed() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(matches!(reader.read_frame().await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_truncated() {
        let (mut client, server) = tokio::io::duplex(64);
        // header promises 8 bytes, only the id arrives
        client.write_all(&[0, 0, 0, 8, 0, 0, 0, 1]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&1024u32.to_be_bytes()).await.unwrap();

        let mut reader = FrameReader::with_max_frame_len(server, 64);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::TooLarge { len: 1024, max: 64 })
        ));
    }

    #[tokio::test]
    async fn test_length_shorter_than_id_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&2u32.to_be_bytes()).await.unwrap();

        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::InvalidLength(2))
        ));
    }

    #[test]
    fn test_payload_fields_in_order() {
        let payload = PayloadBuilder::new()
            .put_i32(-7)
            .put_string("hello")
            .put_u32(9)
            .finish();
        let mut reader = PayloadReader::new(payload);

        assert_eq!(reader.read_i32().unwrap(), -7);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_u32().unwrap(), 9);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_envelope_missing_path() {
        let payload = PayloadBuilder::new().put_string("post").finish();
        let frame = Frame::new(ENVELOPE_ID, payload);
        assert!(matches!(
            Envelope::decode(&frame),
            Err(FrameError::PayloadUnderrun { .. })
        ));
    }

    #[test]
    fn test_string_length_past_end() {
        let payload = PayloadBuilder::new().put_u32(10).put_i32(0).finish();
        let mut reader = PayloadReader::new(payload);
        assert!(matches!(
            reader.read_string(),
            Err(FrameError::PayloadUnderrun {
                needed: 10,
                available: 4
            })
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let payload = PayloadBuilder::new().put_bytes(&[0xff, 0xfe]).finish();
        let mut reader = PayloadReader::new(payload);
        assert!(matches!(
            reader.read_string(),
            Err(FrameError::InvalidUtf8(_))
        ));
    }
}
