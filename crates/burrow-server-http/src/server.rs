//! Relay HTTP server
//!
//! Accepts public connections, reads one request head, and dispatches:
//! the control path joins the control channel, upgrades get bridged
//! byte-for-byte, everything else is forwarded as one serialized request
//! with the response pumped back from the tunnel stream.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

use burrow_control::{serve_control_connection, ClientRegistry};
use burrow_mux::ControlConnection;
use burrow_proto::{ControlEvent, RequestTicket, CONTROL_PATH};
use burrow_router::resolve_name;

use crate::http::{chunked_body_complete, find_head_end, RequestHead};

/// Upper bound on a request head.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound on a collected request body.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request head")]
    MalformedHead,

    #[error("request head too large")]
    HeadTooLarge,

    #[error("request body too large")]
    BodyTooLarge,

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
    /// Base subdomain the relay itself runs under; empty means none.
    pub base_subdomain: String,
}

pub struct HttpServer {
    config: HttpServerConfig,
    registry: Arc<ClientRegistry>,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, registry: Arc<ClientRegistry>) -> Self {
        Self { config, registry }
    }

    /// Bind the public listener.
    ///
    /// SO_REUSEADDR lets a restarted relay reclaim a port still in
    /// TIME_WAIT.
    pub async fn bind(self) -> Result<BoundHttpServer, IngressError> {
        let domain = match self.config.bind_addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;

        socket.bind(&self.config.bind_addr.into()).map_err(|e| {
            IngressError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;

        info!("relay listening on {}", listener.local_addr()?);

        Ok(BoundHttpServer {
            listener,
            base_subdomain: self.config.base_subdomain,
            registry: self.registry,
        })
    }

    pub async fn start(self) -> Result<(), IngressError> {
        self.bind().await?.serve().await
    }
}

/// A bound relay listener, ready to serve.
pub struct BoundHttpServer {
    listener: TcpListener,
    base_subdomain: String,
    registry: Arc<ClientRegistry>,
}

impl BoundHttpServer {
    pub fn local_addr(&self) -> Result<SocketAddr, IngressError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<(), IngressError> {
        let base_subdomain: Arc<str> = self.base_subdomain.into();

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let registry = self.registry.clone();
                    let base = base_subdomain.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, registry, base).await {
                            debug!("connection from {} ended with error: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    base_subdomain: Arc<str>,
) -> Result<(), IngressError> {
    let (head_bytes, leftover) = read_head(&mut stream).await?;
    let head = RequestHead::parse(&head_bytes)?;

    // The control stack owns its path; nothing there is ever forwarded
    if head.path() == CONTROL_PATH && head.is_upgrade() {
        return accept_control(stream, head, peer_addr, registry).await;
    }

    let name = match resolve_name(head.host(), &base_subdomain) {
        Ok(name) => name,
        Err(e) => {
            debug!("unroutable request from {}: {}", peer_addr, e);
            // Resolver failures on an upgrade close the handshake socket
            // without a response; a registry miss below still gets its 502
            if !head.is_upgrade() {
                write_bad_gateway(&mut stream, &e.to_string()).await;
            }
            return Ok(());
        }
    };

    let Some(connection) = registry.lookup(&name) else {
        let message = format!("{name} is currently unregistered or offline.");
        debug!("request from {} for unknown name {}", peer_addr, name);
        write_bad_gateway(&mut stream, &message).await;
        return Ok(());
    };

    if head.is_upgrade() {
        handle_upgrade(stream, head, leftover, connection).await
    } else {
        handle_request(stream, head, leftover, connection).await
    }
}

/// Complete the WebSocket handshake for a tunnel client and run its
/// control loop. The head was already consumed, so the 101 is written by
/// hand before the socket joins the mux.
async fn accept_control(
    mut stream: TcpStream,
    head: RequestHead,
    peer_addr: SocketAddr,
    registry: Arc<ClientRegistry>,
) -> Result<(), IngressError> {
    let key = head
        .header("sec-websocket-key")
        .ok_or(IngressError::MalformedHead)?;
    let accept = derive_accept_key(key.as_bytes());

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;

    let ws_stream = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    let connection = Arc::new(ControlConnection::new(ws_stream, peer_addr));
    serve_control_connection(connection, registry).await;
    Ok(())
}

/// Forward one plain HTTP request (C4).
async fn handle_request(
    mut stream: TcpStream,
    head: RequestHead,
    leftover: Vec<u8>,
    connection: Arc<ControlConnection>,
) -> Result<(), IngressError> {
    let body = read_body(&mut stream, leftover, &head).await?;

    let ticket = RequestTicket::new();
    let mut acceptor = connection.expect_stream(ticket.as_str());
    if connection
        .emit(&ControlEvent::IncomingClient(ticket.to_string()))
        .await
        .is_err()
    {
        connection.abandon_stream(ticket.as_str());
        return Ok(());
    }

    // Wait for the reply stream, racing the caller hanging up. There is
    // no timeout here; a dead caller cancels the rendezvous instead.
    let mut probe = [0u8; 512];
    let mut tunnel = loop {
        tokio::select! {
            arrived = &mut acceptor => match arrived {
                Ok(tunnel) => break tunnel,
                Err(_) => {
                    // Control connection died before the stream opened
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            },
            read = stream.read(&mut probe) => match read {
                Ok(0) | Err(_) => {
                    connection.abandon_stream(ticket.as_str());
                    return Ok(());
                }
                // This relay serves one exchange per connection; bytes
                // past the collected body belong to no request
                Ok(_) => continue,
            },
        }
    };

    // Head, body, then the terminator; the stream stays open for the
    // response.
    let mut request = head.serialize();
    request.extend_from_slice(&body);
    request.extend_from_slice(b"\r\n");
    if tunnel.send(&request).await.is_err() {
        let _ = stream.shutdown().await;
        return Ok(());
    }

    let (mut writer, mut reader) = tunnel.split();
    loop {
        tokio::select! {
            chunk = reader.recv() => match chunk {
                Ok(Some(data)) => {
                    if stream.write_all(&data).await.is_err() {
                        writer.reset().await;
                        break;
                    }
                }
                Ok(None) => {
                    let _ = writer.finish().await;
                    break;
                }
                Err(_) => break,
            },
            read = stream.read(&mut probe) => match read {
                Ok(0) | Err(_) => {
                    writer.reset().await;
                    break;
                }
                Ok(_) => {}
            },
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

/// Bridge an HTTP upgrade (C5).
async fn handle_upgrade(
    mut stream: TcpStream,
    head: RequestHead,
    leftover: Vec<u8>,
    connection: Arc<ControlConnection>,
) -> Result<(), IngressError> {
    let ticket = RequestTicket::new();
    let mut acceptor = connection.expect_stream(ticket.as_str());
    if connection
        .emit(&ControlEvent::IncomingClient(ticket.to_string()))
        .await
        .is_err()
    {
        connection.abandon_stream(ticket.as_str());
        return Ok(());
    }

    // Bytes the caller sends before the reply stream exists are held
    // back so nothing precedes the head on the tunnel stream
    let mut early = leftover;
    let mut buf = [0u8; 8192];
    let mut tunnel = loop {
        tokio::select! {
            arrived = &mut acceptor => match arrived {
                Ok(tunnel) => break tunnel,
                Err(_) => {
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            },
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    connection.abandon_stream(ticket.as_str());
                    return Ok(());
                }
                Ok(n) => early.extend_from_slice(&buf[..n]),
            },
        }
    };

    // Head block only: no body, no extra terminator
    let head_block = head.serialize();
    if tunnel.send(&head_block).await.is_err() {
        let _ = stream.shutdown().await;
        return Ok(());
    }
    if !early.is_empty() && tunnel.send(&early).await.is_err() {
        let _ = stream.shutdown().await;
        return Ok(());
    }

    let (mut writer, mut reader) = tunnel.split();
    loop {
        tokio::select! {
            chunk = reader.recv() => match chunk {
                Ok(Some(data)) => {
                    if stream.write_all(&data).await.is_err() {
                        writer.reset().await;
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            },
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = writer.finish().await;
                    break;
                }
                Err(_) => {
                    writer.reset().await;
                    break;
                }
                Ok(n) => {
                    if writer.send(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

/// Read until the head terminator; returns the head bytes (terminator
/// included) and whatever followed them in the same reads.
async fn read_head(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<(Vec<u8>, Vec<u8>), IngressError> {
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8 * 1024];

    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(IngressError::HeadTooLarge);
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(IngressError::MalformedHead);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Collect the request body into one contiguous buffer.
///
/// `Content-Length` is honored exactly; chunked bodies are passed through
/// verbatim up to the terminal zero-chunk; with neither, the body is
/// empty.
async fn read_body(
    stream: &mut (impl AsyncRead + Unpin),
    leftover: Vec<u8>,
    head: &RequestHead,
) -> Result<Vec<u8>, IngressError> {
    let mut body = leftover;
    let mut chunk = [0u8; 8 * 1024];

    if let Some(length) = head.content_length() {
        if length > MAX_BODY_SIZE {
            return Err(IngressError::BodyTooLarge);
        }
        while body.len() < length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(length);
        return Ok(body);
    }

    if head.is_chunked() {
        while !chunked_body_complete(&body) {
            if body.len() > MAX_BODY_SIZE {
                return Err(IngressError::BodyTooLarge);
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        return Ok(body);
    }

    body.clear();
    Ok(body)
}

async fn write_bad_gateway(stream: &mut TcpStream, message: &str) {
    let response = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Length: {}\r\n\r\n{}",
        message.len(),
        message
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
