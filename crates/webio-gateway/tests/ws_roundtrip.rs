//! End-to-end tests over a real socket: a tungstenite client talks to a
//! gateway bound on an ephemeral port.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use webio_gateway::{Gateway, GatewayConfig, MountDescriptor, ServiceConfig};
use webio_types::{BINARY_PROTOCOL, ChannelKind, ConnectionState, TEXT_PROTOCOL};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

fn gateway() -> Gateway {
    let mut gateway = Gateway::with_config(GatewayConfig {
        service: ServiceConfig {
            interval: Duration::from_millis(2),
            ..ServiceConfig::default()
        },
        ..GatewayConfig::default()
    });
    gateway
        .initialize("webio-it", 0, 0, MountDescriptor::default())
        .expect("gateway starts");
    gateway
}

fn port(gateway: &Gateway) -> u16 {
    gateway.local_addr().expect("bound").port()
}

async fn connect(port: u16, protocol: &'static str) -> (Client, Option<String>) {
    let mut req = format!("ws://127.0.0.1:{port}/").into_client_request().unwrap();
    req.headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(protocol));
    let (ws, resp) = connect_async(req).await.expect("handshake");
    let negotiated = resp
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (ws, negotiated)
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

async fn next_data(ws: &mut Client) -> Message {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => return msg,
                Some(Ok(_)) => continue,
                other => panic!("stream ended: {other:?}"),
            }
        }
    })
    .await
    .expect("frame in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn text_channel_dispatches_commands_and_pushes_status() {
    let gateway = gateway();
    let (tx, mut rx) = mpsc::unbounded_channel();
    gateway.register_command_handler("pwm-control", move |payload| {
        let _ = tx.send(payload.field::<usize>("index")?);
        Ok(())
    });

    let (mut ws, negotiated) = connect(port(&gateway), TEXT_PROTOCOL).await;
    assert_eq!(negotiated.as_deref(), Some(TEXT_PROTOCOL));
    wait_for(|| gateway.is_connected(ChannelKind::Text)).await;

    ws.send(Message::Text(r#"{"command":"pwm-control","index":1}"#.into()))
        .await
        .unwrap();
    let index = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
    assert_eq!(index, Some(1));

    gateway.send_text(r#"{"status":"ok"}"#).unwrap();
    match next_data(&mut ws).await {
        Message::Text(text) => assert_eq!(text.as_str(), r#"{"status":"ok"}"#),
        other => panic!("expected text, got {other:?}"),
    }

    ws.close(None).await.unwrap();
    wait_for(|| gateway.connection_state(ChannelKind::Text) == ConnectionState::Disconnected).await;
    assert!(gateway.send_text("late").is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binary_channel_carries_raw_bytes_both_ways() {
    let gateway = gateway();
    let (mut ws, negotiated) = connect(port(&gateway), BINARY_PROTOCOL).await;
    assert_eq!(negotiated.as_deref(), Some(BINARY_PROTOCOL));
    wait_for(|| gateway.is_connected(ChannelKind::Binary)).await;
    assert_eq!(gateway.connection_state(ChannelKind::Text), ConnectionState::Uninitialized);

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    let mut received = Vec::new();
    wait_for(|| {
        received.extend_from_slice(gateway.drain_binary_data().bytes());
        received.len() >= 3
    })
    .await;
    assert_eq!(received, vec![1, 2, 3]);

    gateway.send_samples(&[1u16, 0x0203]).unwrap();
    match next_data(&mut ws).await {
        Message::Binary(bytes) => assert_eq!(&bytes[..], &[1u8, 0, 3, 2]),
        other => panic!("expected binary, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_http_is_answered_with_not_found() {
    let gateway = gateway();
    let mut stream = TcpStream::connect(("127.0.0.1", port(&gateway))).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got {response:?}");
    assert!(response.contains("Server: webio-it"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_subprotocol_never_establishes_a_channel() {
    let gateway = gateway();
    let mut req = format!("ws://127.0.0.1:{}/", port(&gateway))
        .into_client_request()
        .unwrap();
    req.headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("chat"));

    // The client may reject the handshake itself or be closed by the server.
    if let Ok((mut ws, _)) = connect_async(req).await {
        let _ = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for channel in ChannelKind::ALL {
        assert_eq!(gateway.connection_state(channel), ConnectionState::Uninitialized);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_one_of_two_text_clients_keeps_the_channel_open() {
    let gateway = gateway();
    let (mut first, _) = connect(port(&gateway), TEXT_PROTOCOL).await;
    let (mut second, _) = connect(port(&gateway), TEXT_PROTOCOL).await;
    wait_for(|| gateway.is_connected(ChannelKind::Text)).await;

    // Both clients see the broadcast once registered.
    gateway.send_text("ready").unwrap();
    for ws in [&mut first, &mut second] {
        match next_data(ws).await {
            Message::Text(text) => assert_eq!(text.as_str(), "ready"),
            other => panic!("expected text, got {other:?}"),
        }
    }

    first.close(None).await.unwrap();
    let _ = tokio::time::timeout(WAIT, async { while first.next().await.is_some() {} }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.connection_state(ChannelKind::Text), ConnectionState::Established);

    gateway.send_text("hello").unwrap();
    match next_data(&mut second).await {
        Message::Text(text) => assert_eq!(text.as_str(), "hello"),
        other => panic!("expected text, got {other:?}"),
    }
}
