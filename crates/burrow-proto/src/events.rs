//! Named control events
//!
//! Events are JSON objects of the shape `{"event": "...", "data": ...}`
//! so that payloads stay JSON-serializable for any client implementation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::frame::MuxError;

/// Control events exchanged on stream 0.
///
/// `CreateTunnel` flows client -> server, `IncomingClient` server -> client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ControlEvent {
    /// Request to claim a subdomain name for this connection
    CreateTunnel(String),
    /// A public request is waiting; the payload is the ticket the client
    /// must answer with an `Open` frame
    IncomingClient(String),
}

impl ControlEvent {
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let raw = serde_json::to_vec(self)?;
        Ok(Bytes::from(raw))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MuxError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
