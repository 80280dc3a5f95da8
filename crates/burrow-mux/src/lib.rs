//! Server side of the control channel
//!
//! One tunnel client holds one persistent WebSocket connection to the
//! relay. This crate multiplexes that connection into named control
//! events plus any number of per-request byte streams, and is the only
//! code that touches the control channel's wire format.

pub mod connection;
pub mod stream;

pub use connection::{ControlConnection, WsStream};
pub use stream::{StreamError, TunnelStream, TunnelStreamReader, TunnelStreamWriter};
