//! Public-facing HTTP listener
//!
//! One TCP port serves three kinds of traffic: the control-channel
//! WebSocket handshake on its well-known path, plain HTTP requests
//! forwarded to tunnel clients, and HTTP upgrades bridged byte-for-byte.

pub mod http;
pub mod server;

pub use server::{BoundHttpServer, HttpServer, HttpServerConfig, IngressError};
