use bytes::Bytes;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::error::{FrameError, WireStatus};
use crate::frame::{DATA_ID, Frame, FrameReader, FrameWriter, PayloadBuilder, RESPONSE_ID};

/// Read side of a device connection.
///
/// Clones share the same underlying stream. The session never reads while a
/// handler holds the stream, so the lock is only there to hand out owned values.
#[derive(Debug, Clone)]
pub struct Inbound {
    reader: Arc<Mutex<FrameReader<OwnedReadHalf>>>,
}

impl Inbound {
    pub fn new(reader: FrameReader<OwnedReadHalf>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
        }
    }

    /// Read the next frame from the peer.
    pub async fn read_frame(&self) -> Result<Frame, FrameError> {
        self.reader.lock().await.read_frame().await
    }
}

/// Write side of a device connection.
#[derive(Debug, Clone)]
pub struct Outbound {
    writer: Arc<Mutex<FrameWriter<OwnedWriteHalf>>>,
}

impl Outbound {
    pub fn new(writer: FrameWriter<OwnedWriteHalf>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Send a payload as a data frame.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), FrameError> {
        self.send_frame(&Frame::new(DATA_ID, payload)).await
    }

    /// Send a frame with an explicit id.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), FrameError> {
        self.writer.lock().await.write_frame(frame).await
    }

    /// Send the 4-byte status code that closes out a request.
    pub async fn send_status(&self, status: WireStatus) -> Result<(), FrameError> {
        let payload = PayloadBuilder::new().put_i32(status.to_code()).finish();
        self.send_frame(&Frame::new(RESPONSE_ID, payload)).await
    }

    /// Half-close the connection so the peer sees end-of-stream.
    pub async fn shutdown(&self) -> Result<(), FrameError> {
        self.writer.lock().await.shutdown().await
    }
}
