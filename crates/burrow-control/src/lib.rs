//! Subdomain registry and control-connection lifecycle
//!
//! Tracks which tunnel client owns which name, and runs the per-connection
//! event loop that processes claims and releases them on disconnect.

pub mod handler;
pub mod registry;

pub use handler::serve_control_connection;
pub use registry::{ClaimError, ClientName, ClientRegistry, RegisteredClient};
