//! Per-request tunnel streams
//!
//! A `TunnelStream` is one bidirectional, ordered byte stream carried
//! over a control connection, correlated with exactly one public
//! request. Receiving is fed by the connection's reader task through a
//! bounded channel; sending frames the bytes onto the shared writer
//! channel, so a slow WebSocket peer backpressures every sender.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use burrow_proto::frame::StreamId;
use burrow_proto::Frame;

/// Largest payload written into a single data frame.
pub(crate) const DATA_CHUNK: usize = 64 * 1024;

/// What the reader task delivers to a stream's receive channel.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Fin,
    Reset,
}

/// Stream-level errors
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream reset by peer")]
    Reset,

    #[error("control connection lost")]
    ConnectionLost,

    #[error("stream already closed")]
    Closed,
}

/// One bidirectional byte stream over a control connection.
#[derive(Debug)]
pub struct TunnelStream {
    reader: TunnelStreamReader,
    writer: TunnelStreamWriter,
}

impl TunnelStream {
    pub(crate) fn new(
        stream_id: StreamId,
        rx: mpsc::Receiver<StreamEvent>,
        frame_tx: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            reader: TunnelStreamReader {
                stream_id,
                rx,
                done: false,
            },
            writer: TunnelStreamWriter {
                stream_id,
                frame_tx,
                finished: false,
            },
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.reader.stream_id
    }

    /// Split into independently owned halves for bidirectional bridging.
    pub fn split(self) -> (TunnelStreamWriter, TunnelStreamReader) {
        (self.writer, self.reader)
    }

    pub async fn recv(&mut self) -> Result<Option<Bytes>, StreamError> {
        self.reader.recv().await
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.writer.send(data).await
    }

    pub async fn finish(&mut self) -> Result<(), StreamError> {
        self.writer.finish().await
    }

    pub async fn reset(&mut self) {
        self.writer.reset().await;
    }
}

/// Receiving half of a tunnel stream.
#[derive(Debug)]
pub struct TunnelStreamReader {
    stream_id: StreamId,
    rx: mpsc::Receiver<StreamEvent>,
    done: bool,
}

impl TunnelStreamReader {
    /// Receive the next chunk of bytes.
    ///
    /// `Ok(None)` is a graceful end of stream. `Err(Reset)` means the
    /// peer aborted the stream; `Err(ConnectionLost)` means the whole
    /// control connection went away.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, StreamError> {
        if self.done {
            return Ok(None);
        }

        match self.rx.recv().await {
            Some(StreamEvent::Data(data)) => Ok(Some(data)),
            Some(StreamEvent::Fin) => {
                self.done = true;
                Ok(None)
            }
            Some(StreamEvent::Reset) => {
                self.done = true;
                Err(StreamError::Reset)
            }
            None => {
                self.done = true;
                Err(StreamError::ConnectionLost)
            }
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

/// Sending half of a tunnel stream.
#[derive(Debug)]
pub struct TunnelStreamWriter {
    stream_id: StreamId,
    frame_tx: mpsc::Sender<Frame>,
    finished: bool,
}

impl TunnelStreamWriter {
    pub async fn send(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.finished {
            return Err(StreamError::Closed);
        }

        for chunk in data.chunks(DATA_CHUNK) {
            let frame = Frame::data(self.stream_id, Bytes::copy_from_slice(chunk));
            self.frame_tx
                .send(frame)
                .await
                .map_err(|_| StreamError::ConnectionLost)?;
        }

        Ok(())
    }

    /// Signal graceful end of stream. Idempotent.
    pub async fn finish(&mut self) -> Result<(), StreamError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        self.frame_tx
            .send(Frame::fin(self.stream_id))
            .await
            .map_err(|_| StreamError::ConnectionLost)
    }

    /// Abort the stream in both directions. Best effort.
    pub async fn reset(&mut self) {
        self.finished = true;
        let _ = self.frame_tx.send(Frame::reset(self.stream_id)).await;
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::FrameType;

    fn make_stream(capacity: usize) -> (TunnelStream, mpsc::Sender<StreamEvent>, mpsc::Receiver<Frame>) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        (TunnelStream::new(9, event_rx, frame_tx), event_tx, frame_rx)
    }

    #[tokio::test]
    async fn test_recv_data_then_fin() {
        let (mut stream, event_tx, _frames) = make_stream(8);

        event_tx
            .send(StreamEvent::Data(Bytes::from("hello")))
            .await
            .unwrap();
        event_tx.send(StreamEvent::Fin).await.unwrap();

        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from("hello")));
        assert_eq!(stream.recv().await.unwrap(), None);
        // Further reads stay at end of stream
        assert_eq!(stream.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recv_reset_is_an_error() {
        let (mut stream, event_tx, _frames) = make_stream(8);

        event_tx.send(StreamEvent::Reset).await.unwrap();
        assert!(matches!(stream.recv().await, Err(StreamError::Reset)));
    }

    #[tokio::test]
    async fn test_dropped_channel_is_connection_lost() {
        let (mut stream, event_tx, _frames) = make_stream(8);
        drop(event_tx);
        assert!(matches!(
            stream.recv().await,
            Err(StreamError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_send_chunks_large_payloads() {
        let (mut stream, _event_tx, mut frames) = make_stream(8);

        let payload = vec![7u8; DATA_CHUNK + 100];
        stream.send(&payload).await.unwrap();

        let first = frames.recv().await.unwrap();
        let second = frames.recv().await.unwrap();
        assert_eq!(first.payload.len(), DATA_CHUNK);
        assert_eq!(second.payload.len(), 100);
        assert_eq!(first.stream_id, 9);
    }

    #[tokio::test]
    async fn test_finish_emits_single_fin() {
        let (mut stream, _event_tx, mut frames) = make_stream(8);

        stream.finish().await.unwrap();
        stream.finish().await.unwrap();

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Fin);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_finish_fails() {
        let (mut stream, _event_tx, _frames) = make_stream(8);

        stream.finish().await.unwrap();
        assert!(matches!(
            stream.send(b"late").await,
            Err(StreamError::Closed)
        ));
    }
}
