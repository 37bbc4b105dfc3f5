//! Websocket feed against a local tungstenite server

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use trade_guard::audit::RecordingSink;
use trade_guard::feed::{PolygonWebSocketFeed, WebSocketError, WebSocketOptions};
use trade_guard::types::Bar;
use trade_guard::{AuditEventKind, StreamCallbacks};

fn batch(start_ms: i64) -> String {
    json!([
        {"ev": "AM", "sym": "AAPL", "o": 1.0, "h": 2.0, "l": 0.5, "c": 1.5, "v": 100.0, "s": start_ms},
        {"ev": "AM", "sym": "MSFT", "o": 3.0, "h": 4.0, "l": 2.5, "c": 3.5, "v": 200.0, "s": start_ms},
        {"ev": "AM", "sym": "TSLA", "o": 5.0, "h": 6.0, "l": 4.5, "c": 5.5, "v": 300.0, "s": start_ms}
    ])
    .to_string()
}

/// Each connection: status, read auth + subscribe, reply, one bar batch, one
/// malformed frame, then close.
async fn spawn_server(auth_ok: bool) -> (SocketAddr, Arc<Mutex<Vec<Value>>>, JoinHandle<()>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();

    let handle = tokio::spawn(async move {
        let mut connection: i64 = 0;
        while let Ok((stream, _)) = listener.accept().await {
            connection += 1;
            let log = log.clone();
            tokio::spawn(async move {
                let mut ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let _ = ws
                    .send(Message::Text(json!([{"ev": "status", "status": "connected"}]).to_string()))
                    .await;
                for _ in 0..2 {
                    if let Some(Ok(Message::Text(text))) = ws.next().await {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            log.lock().unwrap().push(value);
                        }
                    }
                }
                let status = if auth_ok { "auth_success" } else { "auth_failed" };
                let _ = ws
                    .send(Message::Text(
                        json!([{"ev": "status", "status": status, "message": "checked"}]).to_string(),
                    ))
                    .await;
                let _ = ws
                    .send(Message::Text(batch(1_700_000_000_000 + connection * 60_000)))
                    .await;
                let _ = ws.send(Message::Text("{not json".to_string())).await;
                let _ = ws.close(None).await;
            });
        }
    });

    (addr, received, handle)
}

/// Each connection: a `connected` status, read the handshake, then either one
/// `frame` or nothing before closing
async fn spawn_scripted_server(frame: Option<String>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let frame = frame.clone();
            tokio::spawn(async move {
                let mut ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let _ = ws
                    .send(Message::Text(json!([{"ev": "status", "status": "connected"}]).to_string()))
                    .await;
                for _ in 0..2 {
                    let _ = ws.next().await;
                }
                if let Some(frame) = frame {
                    let _ = ws.send(Message::Text(frame)).await;
                }
                let _ = ws.close(None).await;
            });
        }
    });

    (addr, handle)
}

fn options(url: String) -> WebSocketOptions {
    WebSocketOptions {
        url,
        event_type: "AM".to_string(),
        reconnect_base: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        max_reconnect_attempts: 3,
        max_messages: None,
    }
}

#[tokio::test]
async fn test_streams_bars_and_reconnects_after_close() {
    let (addr, received, server) = spawn_server(true).await;
    let sink = Arc::new(RecordingSink::default());
    let mut opts = options(format!("ws://{}", addr));
    // conn 1: connected, auth, batch, garbage; conn 2: connected, auth, batch
    opts.max_messages = Some(7);
    let mut feed = PolygonWebSocketFeed::new("secret", opts).with_sink(sink.clone());

    let bars = Arc::new(Mutex::new(Vec::<Bar>::new()));
    let out = bars.clone();
    let mut callbacks = StreamCallbacks::new(move |bar: &Bar| out.lock().unwrap().push(bar.clone()));

    let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
    let summary = feed.run(&symbols, &mut callbacks).await.unwrap();
    server.abort();

    assert_eq!(summary.connections, 2);
    assert_eq!(summary.messages, 7);
    assert_eq!(summary.bars, 4);
    assert_eq!(summary.skipped_messages, 1);
    assert_eq!(sink.count(AuditEventKind::Heartbeat), 2);
    assert_eq!(sink.count(AuditEventKind::WsReconnect), 1);

    let bars = bars.lock().unwrap();
    assert!(bars.iter().all(|b| b.symbol == "AAPL" || b.symbol == "MSFT"));
    assert_eq!(bars[0].timestamp_millis(), 1_700_000_060_000);

    let received = received.lock().unwrap();
    assert_eq!(received[0], json!({"action": "auth", "params": "secret"}));
    assert_eq!(received[1]["action"], "subscribe");
    let mut channels: Vec<&str> = received[1]["params"].as_str().unwrap().split(',').collect();
    channels.sort();
    assert_eq!(channels, vec!["AM.AAPL", "AM.MSFT"]);
}

#[tokio::test]
async fn test_rejected_auth_is_fatal() {
    let (addr, _, server) = spawn_server(false).await;
    let mut feed = PolygonWebSocketFeed::new("wrong", options(format!("ws://{}", addr)));
    let mut callbacks = StreamCallbacks::new(|_: &Bar| {});

    let err = feed.run(&["AAPL".to_string()], &mut callbacks).await.unwrap_err();
    server.abort();
    assert!(matches!(err, WebSocketError::AuthFailed(ref reason) if reason == "checked"));
}

#[tokio::test]
async fn test_unreachable_server_exhausts_reconnects() {
    let addr = {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap()
    };
    let sink = Arc::new(RecordingSink::default());
    let mut opts = options(format!("ws://{}", addr));
    opts.max_reconnect_attempts = 2;
    let mut feed = PolygonWebSocketFeed::new("secret", opts).with_sink(sink.clone());
    let mut callbacks = StreamCallbacks::new(|_: &Bar| {});

    let err = feed.run(&["AAPL".to_string()], &mut callbacks).await.unwrap_err();
    match err {
        WebSocketError::ReconnectsExhausted { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(sink.count(AuditEventKind::WsReconnect), 2);
    assert_eq!(sink.count(AuditEventKind::WsReconnectsExhausted), 1);
}

#[tokio::test]
async fn test_requires_symbols() {
    let mut feed = PolygonWebSocketFeed::new("secret", options("ws://127.0.0.1:1".to_string()));
    let mut callbacks = StreamCallbacks::new(|_: &Bar| {});
    assert!(matches!(
        feed.run(&[], &mut callbacks).await,
        Err(WebSocketError::NoSymbols)
    ));
}

#[tokio::test]
async fn test_server_that_never_accepts_still_exhausts_reconnects() {
    let (addr, server) = spawn_scripted_server(None).await;
    let sink = Arc::new(RecordingSink::default());
    let mut opts = options(format!("ws://{}", addr));
    opts.max_reconnect_attempts = 2;
    let mut feed = PolygonWebSocketFeed::new("secret", opts).with_sink(sink.clone());
    let mut callbacks = StreamCallbacks::new(|_: &Bar| {});

    let err = feed.run(&["AAPL".to_string()], &mut callbacks).await.unwrap_err();
    server.abort();
    match err {
        WebSocketError::ReconnectsExhausted { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(sink.count(AuditEventKind::WsReconnect), 2);
    assert_eq!(sink.count(AuditEventKind::WsReconnectsExhausted), 1);
}

#[tokio::test]
async fn test_mixed_frame_delivers_matching_bars() {
    let frame = json!([
        {"ev": "T", "sym": "AAPL", "p": 10.0, "s": 5, "c": [12, 37]},
        {"ev": "AM", "sym": "AAPL", "o": 1.0, "h": 2.0, "l": 0.5, "c": 1.5, "v": 100.0},
        {"ev": "AM", "sym": "AAPL", "o": 1.0, "h": 2.0, "l": 0.5, "c": 1.5, "v": 100.0, "s": 1_700_000_000_000i64}
    ])
    .to_string();
    let (addr, server) = spawn_scripted_server(Some(frame)).await;
    let mut opts = options(format!("ws://{}", addr));
    opts.max_messages = Some(2);
    let mut feed = PolygonWebSocketFeed::new("secret", opts);

    let bars = Arc::new(Mutex::new(Vec::<Bar>::new()));
    let out = bars.clone();
    let mut callbacks = StreamCallbacks::new(move |bar: &Bar| out.lock().unwrap().push(bar.clone()));

    let summary = feed.run(&["AAPL".to_string()], &mut callbacks).await.unwrap();
    server.abort();

    assert_eq!(summary.bars, 1);
    assert_eq!(summary.skipped_messages, 1);
    let bars = bars.lock().unwrap();
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].timestamp_millis(), 1_700_000_000_000);
}
