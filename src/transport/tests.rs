//! Socket session tests over an in-memory duplex pipe

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::io::DuplexStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use super::*;
use crate::error::BridgeError;
use crate::topic::{resolve_request, ResolvedTopic};

fn peer() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

async fn handshake(
    url: &str,
) -> (
    Result<(SocketSession<DuplexStream>, ResolvedTopic), BridgeError>,
    Result<WebSocketStream<DuplexStream>, tungstenite::Error>,
) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let config = TransportConfig::default().websocket_config();

    let server = accept(server_io, peer(), config, resolve_request);
    let client = async {
        tokio_tungstenite::client_async(url, client_io)
            .await
            .map(|(ws, _)| ws)
    };

    tokio::join!(server, client)
}

#[tokio::test]
async fn test_accept_resolves_topic() {
    let (server, client) = handshake("ws://localhost/sensors%2F1?clientId=abc").await;
    let (session, resolved) = server.unwrap();
    assert!(client.is_ok());

    assert_eq!(session.peer(), peer());
    assert_eq!(resolved.topic, "sensors/1");
    assert_eq!(resolved.options.get("clientId"), Some("abc"));
}

#[tokio::test]
async fn test_empty_path_answers_400() {
    let (server, client) = handshake("ws://localhost/").await;

    assert!(matches!(server, Err(BridgeError::MalformedRequest(_))));
    match client {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_overloaded_answers_503() {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let config = TransportConfig::default().websocket_config();

    let server = accept(server_io, peer(), config, |_: &_| -> Result<(), BridgeError> {
        Err(BridgeError::Overloaded("full".to_string()))
    });
    let client = tokio_tungstenite::client_async("ws://localhost/t", client_io);
    let (server, client) = tokio::join!(server, client);

    assert!(matches!(server, Err(BridgeError::Overloaded(_))));
    match client {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 503),
        other => panic!("expected HTTP error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_frames_in_both_directions() {
    let (server, client) = handshake("ws://localhost/t").await;
    let (session, _) = server.unwrap();
    let mut client = client.unwrap();
    let (mut reader, mut writer) = session.split();

    client.send(Message::Text("t|hello".to_string())).await.unwrap();
    client
        .send(Message::Binary(vec![b't', b'|', 0xff, 0x00]))
        .await
        .unwrap();
    client.send(Message::Ping(vec![1])).await.unwrap();
    client.send(Message::Text("t|after ping".to_string())).await.unwrap();

    assert_eq!(reader.recv().await.unwrap().unwrap(), Bytes::from_static(b"t|hello"));
    assert_eq!(
        reader.recv().await.unwrap().unwrap(),
        Bytes::from_static(&[b't', b'|', 0xff, 0x00])
    );
    assert_eq!(
        reader.recv().await.unwrap().unwrap(),
        Bytes::from_static(b"t|after ping")
    );

    writer.send(Bytes::from_static(b"t|text")).await.unwrap();
    writer
        .send(Bytes::from_static(&[b't', b'|', 0x80]))
        .await
        .unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        match client.next().await.unwrap().unwrap() {
            Message::Pong(_) => continue,
            message => received.push(message),
        }
    }
    assert_eq!(received[0], Message::Text("t|text".to_string()));
    assert_eq!(received[1], Message::Binary(vec![b't', b'|', 0x80]));
}

#[tokio::test]
async fn test_peer_close_ends_reader() {
    let (server, client) = handshake("ws://localhost/t").await;
    let (session, _) = server.unwrap();
    let mut client = client.unwrap();
    let (mut reader, _writer) = session.split();

    client.close(None).await.unwrap();

    assert!(reader.recv().await.is_none());
    assert!(reader.is_closed());
    assert!(reader.recv().await.is_none());
}

#[tokio::test]
async fn test_writer_close_is_idempotent() {
    let (server, client) = handshake("ws://localhost/t").await;
    let (session, _) = server.unwrap();
    let mut client = client.unwrap();
    let (_reader, mut writer) = session.split();

    writer.close(CloseCode::Normal, "broker closed").await.unwrap();
    writer.close(CloseCode::Normal, "again").await.unwrap();
    assert!(writer.is_closed());
    assert!(writer.send(Bytes::from_static(b"t|late")).await.is_err());

    match client.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Normal);
            assert_eq!(frame.reason, "broker closed");
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}
