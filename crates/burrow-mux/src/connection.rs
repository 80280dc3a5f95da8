//! Control connection management
//!
//! Wraps one tunnel client's WebSocket in a pair of reader/writer tasks
//! and exposes the two operations the rest of the relay needs: emitting
//! named events to the client, and waiting for the client to open a
//! stream tagged with a specific ticket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use burrow_proto::frame::StreamId;
use burrow_proto::{ControlEvent, Frame, FrameType, MuxError, CONTROL_STREAM_ID};

use crate::stream::{StreamEvent, TunnelStream};

pub type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

/// Channel depth for frames awaiting the WebSocket writer.
const FRAME_QUEUE: usize = 256;

/// Channel depth for buffered data per tunnel stream.
const STREAM_QUEUE: usize = 256;

/// One tunnel client's persistent control connection.
pub struct ControlConnection {
    connection_id: String,
    remote_addr: SocketAddr,
    /// Frames bound for the WebSocket writer task
    frame_tx: mpsc::Sender<Frame>,
    /// Live streams, keyed by client-chosen stream ID
    streams: Arc<RwLock<HashMap<StreamId, mpsc::Sender<StreamEvent>>>>,
    /// One-shot acceptors waiting for the client to open a tagged stream
    pending: Arc<DashMap<String, oneshot::Sender<TunnelStream>>>,
    /// Control events received from the client, consumed by one task
    event_rx: Mutex<mpsc::Receiver<ControlEvent>>,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlConnection")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl ControlConnection {
    /// Take ownership of an established WebSocket and start its
    /// reader/writer tasks.
    pub fn new(ws_stream: WsStream, remote_addr: SocketAddr) -> Self {
        let connection_id = format!("ctl-{}", uuid::Uuid::new_v4());

        let (ws_sink, ws_source) = ws_stream.split();

        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE);
        let (event_tx, event_rx) = mpsc::channel::<ControlEvent>(64);

        let streams: Arc<RwLock<HashMap<StreamId, mpsc::Sender<StreamEvent>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let pending: Arc<DashMap<String, oneshot::Sender<TunnelStream>>> =
            Arc::new(DashMap::new());
        let shutdown = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(Self::writer_task(
            ws_sink,
            frame_rx,
            shutdown.clone(),
            closed.clone(),
            connection_id.clone(),
        ));

        tokio::spawn(Self::reader_task(
            ws_source,
            streams.clone(),
            pending.clone(),
            event_tx,
            frame_tx.clone(),
            closed.clone(),
            connection_id.clone(),
        ));

        Self {
            connection_id,
            remote_addr,
            frame_tx,
            streams,
            pending,
            event_rx: Mutex::new(event_rx),
            shutdown,
            closed,
        }
    }

    /// Emit a named event to the tunnel client.
    pub async fn emit(&self, event: &ControlEvent) -> Result<(), MuxError> {
        let frame = Frame::event(event.encode()?);
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| MuxError::ConnectionClosed)
    }

    /// Register a one-shot acceptor for the stream the client will open
    /// in answer to `ticket`.
    ///
    /// The receiver resolves when the stream arrives and errors if the
    /// connection dies first. Call [`abandon_stream`](Self::abandon_stream)
    /// when the waiting request goes away so the acceptor cannot leak.
    pub fn expect_stream(&self, ticket: &str) -> oneshot::Receiver<TunnelStream> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(ticket.to_string(), tx);
        trace!(
            "[{}] waiting for stream tagged {}",
            self.connection_id,
            ticket
        );
        rx
    }

    /// Drop the acceptor for `ticket`. Idempotent.
    pub fn abandon_stream(&self, ticket: &str) {
        if self.pending.remove(ticket).is_some() {
            trace!("[{}] abandoned stream tag {}", self.connection_id, ticket);
        }
    }

    /// Next control event from the client. `None` once the connection
    /// is gone and the event queue has drained.
    pub async fn next_event(&self) -> Option<ControlEvent> {
        self.event_rx.lock().await.recv().await
    }

    /// Close the connection. The writer task sends the WebSocket close
    /// frame; stream teardown happens when the reader task ends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Writer task: frames from the relay onto the WebSocket.
    async fn writer_task(
        mut sink: SplitSink<WsStream, Message>,
        mut rx: mpsc::Receiver<Frame>,
        shutdown: Arc<Notify>,
        closed: Arc<AtomicBool>,
        conn_id: String,
    ) {
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let encoded = match frame.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("[{}] refusing to send frame: {}", conn_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Binary(encoded.to_vec())).await {
                        debug!("[{}] websocket send error: {}", conn_id, e);
                        break;
                    }
                }
                _ = shutdown.notified() => break,
            }
        }

        closed.store(true, Ordering::SeqCst);
        let _ = sink.close().await;
        debug!("[{}] writer task ended", conn_id);
    }

    /// Reader task: frames from the WebSocket, dispatched to streams,
    /// pending acceptors, and the event queue.
    async fn reader_task(
        mut source: SplitStream<WsStream>,
        streams: Arc<RwLock<HashMap<StreamId, mpsc::Sender<StreamEvent>>>>,
        pending: Arc<DashMap<String, oneshot::Sender<TunnelStream>>>,
        event_tx: mpsc::Sender<ControlEvent>,
        frame_tx: mpsc::Sender<Frame>,
        closed: Arc<AtomicBool>,
        conn_id: String,
    ) {
        while let Some(result) = source.next().await {
            let message = match result {
                Ok(message) => message,
                Err(e) => {
                    debug!("[{}] websocket read error: {}", conn_id, e);
                    break;
                }
            };

            match message {
                Message::Binary(data) => {
                    let frame = match Frame::decode(Bytes::from(data)) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("[{}] dropping malformed frame: {}", conn_id, e);
                            continue;
                        }
                    };

                    Self::dispatch_frame(frame, &streams, &pending, &event_tx, &frame_tx, &conn_id)
                        .await;
                }
                Message::Close(_) => {
                    debug!("[{}] websocket close received", conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
                _ => {}
            }
        }

        closed.store(true, Ordering::SeqCst);

        // Transport gone: every open stream dies with an error and every
        // pending rendezvous is cancelled.
        let mut guard = streams.write().await;
        for (_, tx) in guard.drain() {
            let _ = tx.try_send(StreamEvent::Reset);
        }
        drop(guard);
        pending.clear();

        debug!("[{}] reader task ended", conn_id);
    }

    async fn dispatch_frame(
        frame: Frame,
        streams: &Arc<RwLock<HashMap<StreamId, mpsc::Sender<StreamEvent>>>>,
        pending: &Arc<DashMap<String, oneshot::Sender<TunnelStream>>>,
        event_tx: &mpsc::Sender<ControlEvent>,
        frame_tx: &mpsc::Sender<Frame>,
        conn_id: &str,
    ) {
        match frame.frame_type {
            FrameType::Event => {
                if frame.stream_id != CONTROL_STREAM_ID {
                    warn!(
                        "[{}] event frame on stream {}, dropping",
                        conn_id, frame.stream_id
                    );
                    return;
                }
                match ControlEvent::decode(&frame.payload) {
                    Ok(event) => {
                        // A full queue backpressures the client's events
                        let _ = event_tx.send(event).await;
                    }
                    Err(e) => warn!("[{}] bad control event: {}", conn_id, e),
                }
            }
            FrameType::Open => {
                let ticket = match frame.open_ticket() {
                    Ok(ticket) => ticket.to_string(),
                    Err(e) => {
                        warn!("[{}] bad stream tag: {}", conn_id, e);
                        let _ = frame_tx.send(Frame::reset(frame.stream_id)).await;
                        return;
                    }
                };

                let Some((_, acceptor)) = pending.remove(&ticket) else {
                    // The public caller gave up before the stream arrived
                    debug!("[{}] no acceptor for stream tag {}", conn_id, ticket);
                    let _ = frame_tx.send(Frame::reset(frame.stream_id)).await;
                    return;
                };

                let (tx, rx) = mpsc::channel(STREAM_QUEUE);
                streams.write().await.insert(frame.stream_id, tx);
                trace!(
                    "[{}] stream {} opened for tag {}",
                    conn_id,
                    frame.stream_id,
                    ticket
                );

                let stream = TunnelStream::new(frame.stream_id, rx, frame_tx.clone());
                if acceptor.send(stream).is_err() {
                    streams.write().await.remove(&frame.stream_id);
                    let _ = frame_tx.send(Frame::reset(frame.stream_id)).await;
                }
            }
            FrameType::Data => {
                let tx = streams.read().await.get(&frame.stream_id).cloned();
                match tx {
                    Some(tx) => {
                        if tx.send(StreamEvent::Data(frame.payload)).await.is_err() {
                            // Receiver dropped mid-stream; tell the client
                            streams.write().await.remove(&frame.stream_id);
                            let _ = frame_tx.send(Frame::reset(frame.stream_id)).await;
                        }
                    }
                    None => {
                        let _ = frame_tx.send(Frame::reset(frame.stream_id)).await;
                    }
                }
            }
            FrameType::Fin => {
                if let Some(tx) = streams.write().await.remove(&frame.stream_id) {
                    let _ = tx.send(StreamEvent::Fin).await;
                }
            }
            FrameType::Reset => {
                if let Some(tx) = streams.write().await.remove(&frame.stream_id) {
                    let _ = tx.send(StreamEvent::Reset).await;
                }
            }
        }
    }
}
