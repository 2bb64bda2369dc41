//! WebSocket relay against a local axum echo server

mod common;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use common::{assert_silent, eventually, next_delivery, self_signed_acceptor, serve};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tunnelbus_bus::{MemoryBus, MessageBus, OutboundMessage};
use tunnelbus_proto::headers::{DESTINATION_HOST, INTERNAL_TARGET_URI};
use tunnelbus_proto::topology::{websocket_server_queue, WEBSOCKET_CLIENT_QUEUE};
use tunnelbus_proto::{MessageKind, WebSocketFrame};
use tunnelbus_registry::SessionRegistry;
use tunnelbus_relay::{Registry, WebSocketRelay};
use url::Url;

async fn echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        while let Some(Ok(message)) = socket.recv().await {
            match message {
                Message::Text(_) | Message::Binary(_) => {
                    if socket.send(message).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    })
}

async fn hang_up(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        let _ = socket.send(Message::Close(None)).await;
    })
}

async fn local_app() -> Url {
    let app = Router::new()
        .route("/echo", get(echo))
        .route("/hang-up", get(hang_up));
    let addr = serve(app).await;
    Url::parse(&format!("http://{}", addr)).unwrap()
}

/// Echo server behind TLS with a self-signed certificate
async fn secure_echo() -> Url {
    let acceptor = self_signed_acceptor();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(tls).await.unwrap();

        while let Some(Ok(message)) = socket.next().await {
            if message.is_close() {
                break;
            }
            if (message.is_text() || message.is_binary()) && socket.send(message).await.is_err() {
                break;
            }
        }
    });

    Url::parse(&format!("https://{}/", addr)).unwrap()
}

fn relay_with(bus: &MemoryBus) -> (Arc<WebSocketRelay>, Arc<Registry>, CancellationToken) {
    let registry: Arc<Registry> = Arc::new(SessionRegistry::new());
    let cancel = CancellationToken::new();
    let relay = Arc::new(
        WebSocketRelay::new(Arc::new(bus.clone()), registry.clone(), cancel.clone()).unwrap(),
    );
    (relay, registry, cancel)
}

fn frame_message(frame: &WebSocketFrame, target: &Url, host: &str) -> OutboundMessage {
    OutboundMessage::new(tunnelbus_proto::encode(frame).unwrap())
        .with_header(INTERNAL_TARGET_URI, target.as_str())
        .with_header(DESTINATION_HOST, host)
}

#[tokio::test]
async fn test_concurrent_initialization_shares_one_socket() {
    let base = local_app().await;
    let target = base.join("/echo").unwrap();
    let (relay, registry, cancel) = relay_with(&MemoryBus::new());

    let (first, second) = tokio::join!(
        relay.initialize_websocket("pub.example", &target),
        relay.initialize_websocket("pub.example", &target),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.websockets().len(), 1);
    assert_eq!(first.target(), &target);

    let again = relay.initialize_websocket("pub.example", &target).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    cancel.cancel();
}

#[tokio::test]
async fn test_unreachable_target_leaves_no_entry() {
    let target = Url::parse(&format!("http://127.0.0.1:{}/", common::free_port())).unwrap();
    let (relay, registry, cancel) = relay_with(&MemoryBus::new());

    assert!(relay.initialize_websocket("pub.example", &target).await.is_err());
    assert!(!registry.websockets().contains(&"pub.example".to_string()));
    cancel.cancel();
}

#[tokio::test]
async fn test_frame_is_relayed_and_reply_published() {
    let base = local_app().await;
    let target = base.join("/echo").unwrap();
    let bus = MemoryBus::new();
    let (relay, _registry, cancel) = relay_with(&bus);

    relay.start_for_user("alice").await.unwrap();
    let mut replies = bus.consume(WEBSOCKET_CLIENT_QUEUE).await.unwrap();

    let frame = WebSocketFrame::new(MessageKind::Text, b"hello".to_vec(), true);
    bus.publish(
        "",
        &websocket_server_queue("alice"),
        frame_message(&frame, &target, "pub.example"),
    )
    .await
    .unwrap();

    let delivery = next_delivery(&mut replies).await;
    assert_eq!(delivery.headers.get(INTERNAL_TARGET_URI), Some(target.as_str()));
    assert_eq!(delivery.headers.get(DESTINATION_HOST), Some("pub.example"));

    let reply: WebSocketFrame = tunnelbus_proto::decode(&delivery.body).unwrap();
    assert_eq!(reply.kind, MessageKind::Text);
    assert_eq!(reply.data(), b"hello");
    assert!(reply.end_of_message);
    cancel.cancel();
}

#[tokio::test]
async fn test_frame_is_relayed_to_self_signed_wss_target() {
    let target = secure_echo().await;
    let bus = MemoryBus::new();
    let (relay, _registry, cancel) = relay_with(&bus);

    relay.start_for_user("alice").await.unwrap();
    let mut replies = bus.consume(WEBSOCKET_CLIENT_QUEUE).await.unwrap();

    let frame = WebSocketFrame::new(MessageKind::Binary, vec![9, 8, 7], true);
    bus.publish(
        "",
        &websocket_server_queue("alice"),
        frame_message(&frame, &target, "secure.example"),
    )
    .await
    .unwrap();

    let delivery = next_delivery(&mut replies).await;
    assert_eq!(delivery.headers.get(DESTINATION_HOST), Some("secure.example"));

    let reply: WebSocketFrame = tunnelbus_proto::decode(&delivery.body).unwrap();
    assert_eq!(reply.kind, MessageKind::Binary);
    assert_eq!(reply.data(), &[9, 8, 7]);
    cancel.cancel();
}

#[tokio::test]
async fn test_fragments_are_sent_as_one_message() {
    let base = local_app().await;
    let target = base.join("/echo").unwrap();
    let bus = MemoryBus::new();
    let (relay, _registry, cancel) = relay_with(&bus);

    relay.start_for_user("alice").await.unwrap();
    let mut replies = bus.consume(WEBSOCKET_CLIENT_QUEUE).await.unwrap();
    let queue = websocket_server_queue("alice");

    for (chunk, last) in [(&b"\x01\x02"[..], false), (&b"\x03"[..], true)] {
        let frame = WebSocketFrame::new(MessageKind::Binary, chunk.to_vec(), last);
        bus.publish("", &queue, frame_message(&frame, &target, "pub.example"))
            .await
            .unwrap();
    }

    let reply: WebSocketFrame = tunnelbus_proto::decode(&next_delivery(&mut replies).await.body).unwrap();
    assert_eq!(reply.kind, MessageKind::Binary);
    assert_eq!(reply.data(), &[1, 2, 3]);
    assert_silent(&mut replies).await;
    cancel.cancel();
}

#[tokio::test]
async fn test_local_close_evicts_host() {
    let base = local_app().await;
    let target = base.join("/hang-up").unwrap();
    let (relay, registry, cancel) = relay_with(&MemoryBus::new());
    let host = "pub.example".to_string();

    let first = relay.initialize_websocket(&host, &target).await.unwrap();
    eventually(|| !registry.websockets().contains(&host)).await;

    let second = relay.initialize_websocket(&host, &target).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    cancel.cancel();
}

#[tokio::test]
async fn test_missing_destination_host_is_dropped() {
    let base = local_app().await;
    let target = base.join("/echo").unwrap();
    let bus = MemoryBus::new();
    let (relay, registry, cancel) = relay_with(&bus);

    relay.start_for_user("alice").await.unwrap();
    let mut replies = bus.consume(WEBSOCKET_CLIENT_QUEUE).await.unwrap();

    let frame = WebSocketFrame::new(MessageKind::Text, b"lost".to_vec(), true);
    bus.publish(
        "",
        &websocket_server_queue("alice"),
        OutboundMessage::new(tunnelbus_proto::encode(&frame).unwrap())
            .with_header(INTERNAL_TARGET_URI, target.as_str()),
    )
    .await
    .unwrap();

    assert_silent(&mut replies).await;
    assert!(registry.websockets().is_empty());
    assert_eq!(bus.acked(), 1);
    cancel.cancel();
}
