//! Control-channel protocol definitions
//!
//! This crate defines the wire format spoken between the relay and its
//! tunnel clients: the multiplexing frames carried over the WebSocket
//! control connection, the named control events, and request tickets.

pub mod events;
pub mod frame;
pub mod ticket;

pub use events::ControlEvent;
pub use frame::{Frame, FrameType, MuxError};
pub use ticket::RequestTicket;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reserved stream ID for control events
pub const CONTROL_STREAM_ID: u32 = 0;

/// Well-known HTTP path for the control-channel WebSocket handshake.
///
/// Requests to this path on the public listener belong to the control
/// stack, never to the forwarding path.
pub const CONTROL_PATH: &str = "/__burrow";
