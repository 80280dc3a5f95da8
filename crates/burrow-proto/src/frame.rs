//! Multiplexing frames for the control channel
//!
//! Every WebSocket binary message on a control connection carries exactly
//! one frame. Frames on stream 0 are control events; all other stream IDs
//! are per-request byte streams opened by the tunnel client.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Frame types carried on a control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Named control event (stream 0 only)
    Event = 0,
    /// Opens a new stream; payload is the UTF-8 ticket the stream answers
    Open = 1,
    /// Stream data
    Data = 2,
    /// Graceful end of stream from the sending side
    Fin = 3,
    /// Abortive close; the stream is dead in both directions
    Reset = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Event),
            1 => Ok(FrameType::Open),
            2 => Ok(FrameType::Data),
            3 => Ok(FrameType::Fin),
            4 => Ok(FrameType::Reset),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) = 5 bytes.
    /// No length field; WebSocket messages are already delimited.
    pub const HEADER_SIZE: usize = 5;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            payload,
        }
    }

    pub fn event(payload: Bytes) -> Self {
        Self::new(crate::CONTROL_STREAM_ID, FrameType::Event, payload)
    }

    pub fn open(stream_id: StreamId, ticket: &str) -> Self {
        Self::new(
            stream_id,
            FrameType::Open,
            Bytes::copy_from_slice(ticket.as_bytes()),
        )
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn fin(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Fin, Bytes::new())
    }

    pub fn reset(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Reset, Bytes::new())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        if self.payload.len() > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode a frame from one WebSocket message payload
    pub fn decode(mut buf: Bytes) -> Result<Self, MuxError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(MuxError::IncompleteFrame);
        }

        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;

        if buf.len() > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(buf.len()));
        }

        Ok(Self {
            stream_id,
            frame_type,
            payload: buf,
        })
    }

    /// Interpret the payload of an `Open` frame as the stream's ticket
    pub fn open_ticket(&self) -> Result<&str, MuxError> {
        std::str::from_utf8(&self.payload).map_err(|_| MuxError::BadStreamTag)
    }
}

/// Mux-level protocol errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("incomplete frame")]
    IncompleteFrame,

    #[error("malformed control event: {0}")]
    BadEvent(#[from] serde_json::Error),

    #[error("stream tag is not valid UTF-8")]
    BadStreamTag,

    #[error("control connection closed")]
    ConnectionClosed,
}
