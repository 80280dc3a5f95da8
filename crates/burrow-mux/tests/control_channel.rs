//! Control-channel tests over a real WebSocket pair.
//!
//! The client side speaks the wire protocol directly with tungstenite so
//! these tests exercise the exact bytes a tunnel client would produce.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use burrow_mux::ControlConnection;
use burrow_proto::{ControlEvent, Frame, FrameType};

type ClientWs = tokio_tungstenite::WebSocketStream<TcpStream>;

async fn ws_pair() -> (ControlConnection, ClientWs) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ControlConnection::new(ws, peer)
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let (client, _) = tokio_tungstenite::client_async(format!("ws://{addr}/__burrow"), stream)
        .await
        .unwrap();

    (server.await.unwrap(), client)
}

async fn send_frame(client: &mut ClientWs, frame: Frame) {
    client
        .send(Message::Binary(frame.encode().unwrap().to_vec()))
        .await
        .unwrap();
}

async fn recv_frame(client: &mut ClientWs) -> Frame {
    loop {
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => return Frame::decode(Bytes::from(data)).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected websocket message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_emit_reaches_client_as_event_frame() {
    let (conn, mut client) = ws_pair().await;

    conn.emit(&ControlEvent::IncomingClient("ticket-1".to_string()))
        .await
        .unwrap();

    let frame = recv_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Event);
    assert_eq!(frame.stream_id, burrow_proto::CONTROL_STREAM_ID);
    assert_eq!(
        ControlEvent::decode(&frame.payload).unwrap(),
        ControlEvent::IncomingClient("ticket-1".to_string())
    );
}

#[tokio::test]
async fn test_client_events_arrive_in_order() {
    let (conn, mut client) = ws_pair().await;

    for name in ["alpha", "beta"] {
        let event = ControlEvent::CreateTunnel(name.to_string());
        send_frame(&mut client, Frame::event(event.encode().unwrap())).await;
    }

    assert_eq!(
        conn.next_event().await,
        Some(ControlEvent::CreateTunnel("alpha".to_string()))
    );
    assert_eq!(
        conn.next_event().await,
        Some(ControlEvent::CreateTunnel("beta".to_string()))
    );
}

#[tokio::test]
async fn test_stream_rendezvous_and_round_trip() {
    let (conn, mut client) = ws_pair().await;

    let rx = conn.expect_stream("t-42");
    send_frame(&mut client, Frame::open(1, "t-42")).await;

    let mut stream = rx.await.expect("stream should arrive");
    assert_eq!(stream.stream_id(), 1);

    // Client -> server data
    send_frame(&mut client, Frame::data(1, Bytes::from("request bytes"))).await;
    assert_eq!(
        stream.recv().await.unwrap(),
        Some(Bytes::from("request bytes"))
    );

    // Server -> client data
    stream.send(b"response bytes").await.unwrap();
    let frame = recv_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Data);
    assert_eq!(frame.stream_id, 1);
    assert_eq!(frame.payload, Bytes::from("response bytes"));

    // Graceful end from the client
    send_frame(&mut client, Frame::fin(1)).await;
    assert_eq!(stream.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_open_without_acceptor_is_reset() {
    let (_conn, mut client) = ws_pair().await;

    send_frame(&mut client, Frame::open(3, "nobody-waiting")).await;

    let frame = recv_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Reset);
    assert_eq!(frame.stream_id, 3);
}

#[tokio::test]
async fn test_abandoned_acceptor_resets_late_stream() {
    let (conn, mut client) = ws_pair().await;

    let rx = conn.expect_stream("t-late");
    conn.abandon_stream("t-late");
    drop(rx);

    send_frame(&mut client, Frame::open(5, "t-late")).await;
    let frame = recv_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Reset);
    assert_eq!(frame.stream_id, 5);
}

#[tokio::test]
async fn test_connection_loss_destroys_streams_and_rendezvous() {
    let (conn, mut client) = ws_pair().await;

    let rx = conn.expect_stream("t-open");
    send_frame(&mut client, Frame::open(1, "t-open")).await;
    let mut stream = rx.await.unwrap();

    let pending = conn.expect_stream("t-never");

    client.close(None).await.unwrap();
    // Drain the close handshake so the socket actually closes
    while client.next().await.is_some() {}

    assert!(stream.recv().await.is_err());
    assert!(pending.await.is_err());
    assert_eq!(conn.next_event().await, None);
}

#[tokio::test]
async fn test_server_close_disconnects_client() {
    let (conn, mut client) = ws_pair().await;

    conn.close();

    // Client observes the close handshake and then end of stream
    loop {
        match client.next().await {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        }
    }
    assert!(conn.is_closed());
}
