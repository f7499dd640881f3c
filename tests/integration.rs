//! Integration Tests for the Matchfeed server
//!
//! These tests start a real server and drive it with WebSocket clients,
//! checking the connection lifecycle, subscriptions, broadcasts, admission
//! control and liveness eviction end to end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use matchfeed::admission::{AdmissionConfig, AdmissionGate, RateLimitPolicy, SlidingWindowConfig};
use matchfeed::hub::Hub;
use matchfeed::model::{Commentary, Match};
use matchfeed::protocol::MatchId;
use matchfeed::server::{Server, ServerConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const BROWSER: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) AppleWebKit/605.1.15";

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19500);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Test configuration helper
fn test_config(port: u16) -> ServerConfig {
    ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        ws_path: "/ws".to_string(),
        max_connections: 100,
        max_message_size: 64 * 1024,
        outbound_queue_capacity: 64,
        ping_interval: Duration::from_secs(30),
    }
}

async fn start_server(config: ServerConfig, gate: AdmissionGate) -> (Arc<Server>, SocketAddr) {
    let addr = config.bind_addr;
    let server = Arc::new(Server::with_gate(config, gate, None));
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    (server, addr)
}

async fn connect(addr: SocketAddr) -> Result<Client, WsError> {
    let mut request = format!("ws://{}/ws", addr).into_client_request()?;
    request
        .headers_mut()
        .insert(USER_AGENT, HeaderValue::from_static(BROWSER));
    let (ws, _) = connect_async(request).await?;
    Ok(ws)
}

/// Connect and consume the welcome message
async fn connect_welcomed(addr: SocketAddr) -> Client {
    let mut client = connect(addr).await.expect("Failed to connect");
    assert_eq!(recv_json(&mut client).await["type"], "welcome");
    client
}

/// Next text frame as JSON, skipping control frames
async fn recv_json(client: &mut Client) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timed out waiting for message")
            .expect("Connection ended")
            .expect("Read failed");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("Invalid JSON from server");
        }
    }
}

/// Assert that no text frame arrives within a short window
async fn assert_silent(client: &mut Client) {
    let result = timeout(Duration::from_millis(200), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("Connection failed: {:?}", other),
            }
        }
    })
    .await;
    assert!(result.is_err(), "Unexpected message: {:?}", result);
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .expect("Failed to send");
}

async fn subscribe(client: &mut Client, match_id: u64) {
    send_json(client, json!({"type": "subscribe", "matchId": match_id})).await;
    let ack = recv_json(client).await;
    assert_eq!(ack, json!({"type": "subscribed", "matchId": match_id}));
}

async fn wait_for(hub: &Hub, predicate: impl Fn(&Hub) -> bool) {
    timeout(Duration::from_secs(5), async {
        while !predicate(hub) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("Failed to connect");
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .expect("Timed out reading response")
        .expect("Failed to read response");
    response
}

fn sample_match(id: u64) -> Match {
    serde_json::from_value(json!({
        "id": id,
        "sport": "football",
        "homeTeam": "Arsenal",
        "awayTeam": "Chelsea",
        "status": "live",
        "startTime": "2025-06-01T12:00:00Z",
        "endTime": "2025-06-01T14:00:00Z",
        "homeScore": 0,
        "awayScore": 0,
        "createdAt": "2025-06-01T11:00:00Z"
    }))
    .unwrap()
}

fn sample_commentary(id: u64, match_id: u64, message: &str) -> Commentary {
    serde_json::from_value(json!({
        "id": id,
        "matchId": match_id,
        "minute": 12,
        "sequence": 1,
        "period": "1H",
        "eventType": "goal",
        "actor": "Saka",
        "team": "Arsenal",
        "message": message,
        "metadata": null,
        "tags": ["goal"],
        "createdAt": "2025-06-01T12:12:00Z"
    }))
    .unwrap()
}

#[tokio::test]
async fn test_welcome_on_connect() {
    let (server, addr) = start_server(test_config(next_port()), AdmissionGate::allow_all()).await;

    let mut client = connect(addr).await.unwrap();
    let welcome = recv_json(&mut client).await;
    assert_eq!(welcome, json!({"type": "welcome"}));

    wait_for(&server.hub(), |hub| hub.connection_count() == 1).await;
    server.shutdown();
}

#[tokio::test]
async fn test_commentary_reaches_subscribers_only() {
    let (server, addr) = start_server(test_config(next_port()), AdmissionGate::allow_all()).await;
    let hub = server.hub();

    let mut a = connect_welcomed(addr).await;
    let mut b = connect_welcomed(addr).await;
    subscribe(&mut a, 7).await;

    let line = sample_commentary(1, 7, "Goal!");
    assert_eq!(hub.broadcast_commentary(&line), 1);

    let event = recv_json(&mut a).await;
    assert_eq!(event["type"], "commentary");
    assert_eq!(event["data"]["matchId"], 7);
    assert_eq!(event["data"]["message"], "Goal!");
    assert_silent(&mut b).await;

    // Commentary for a match nobody follows goes nowhere
    assert_eq!(hub.broadcast_commentary(&sample_commentary(2, 8, "Kick-off")), 0);
    assert_silent(&mut a).await;

    server.shutdown();
}

#[tokio::test]
async fn test_match_created_reaches_everyone() {
    let (server, addr) = start_server(test_config(next_port()), AdmissionGate::allow_all()).await;
    let hub = server.hub();

    let mut a = connect_welcomed(addr).await;
    let mut b = connect_welcomed(addr).await;
    subscribe(&mut a, 1).await;

    assert_eq!(hub.broadcast_match_created(&sample_match(42)), 2);
    for client in [&mut a, &mut b] {
        let event = recv_json(client).await;
        assert_eq!(event["type"], "match_created");
        assert_eq!(event["data"]["id"], 42);
        assert_eq!(event["data"]["homeTeam"], "Arsenal");
    }

    server.shutdown();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (server, addr) = start_server(test_config(next_port()), AdmissionGate::allow_all()).await;
    let hub = server.hub();

    let mut client = connect_welcomed(addr).await;
    subscribe(&mut client, 3).await;
    // Subscribing twice is acknowledged again
    subscribe(&mut client, 3).await;
    assert_eq!(hub.topic_count(), 1);

    send_json(&mut client, json!({"type": "unsubscribe", "matchId": 3})).await;
    assert_eq!(
        recv_json(&mut client).await,
        json!({"type": "unsubscribed", "matchId": 3})
    );
    assert!(!hub.has_topic(MatchId::new(3).unwrap()));

    assert_eq!(hub.broadcast_commentary(&sample_commentary(1, 3, "Corner")), 0);
    assert_silent(&mut client).await;

    server.shutdown();
}

#[tokio::test]
async fn test_malformed_messages_get_error_replies() {
    let (server, addr) = start_server(test_config(next_port()), AdmissionGate::allow_all()).await;

    let mut client = connect_welcomed(addr).await;

    client
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    assert_eq!(
        recv_json(&mut client).await,
        json!({"type": "error", "error": "Invalid JSON"})
    );

    send_json(&mut client, json!({"type": "subscribe", "matchId": 0})).await;
    assert_eq!(recv_json(&mut client).await["type"], "error");

    send_json(&mut client, json!({"type": "dance"})).await;
    assert_eq!(recv_json(&mut client).await["type"], "error");

    // The connection is still usable
    subscribe(&mut client, 5).await;
    assert_eq!(server.hub().subscriber_count(MatchId::new(5).unwrap()), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_disconnect_releases_subscriptions() {
    let (server, addr) = start_server(test_config(next_port()), AdmissionGate::allow_all()).await;
    let hub = server.hub();

    let mut client = connect_welcomed(addr).await;
    subscribe(&mut client, 9).await;
    subscribe(&mut client, 10).await;
    assert_eq!(hub.topic_count(), 2);

    client.close(None).await.unwrap();
    wait_for(&hub, |hub| hub.connection_count() == 0).await;
    assert_eq!(hub.topic_count(), 0);

    // Abrupt drop without a close frame
    let mut client = connect_welcomed(addr).await;
    subscribe(&mut client, 9).await;
    drop(client);
    wait_for(&hub, |hub| hub.connection_count() == 0 && hub.topic_count() == 0).await;

    server.shutdown();
}

fn rate_limited_gate(max: u32) -> AdmissionGate {
    let policy = RateLimitPolicy::new(&AdmissionConfig {
        window: SlidingWindowConfig {
            max,
            interval: Duration::from_secs(60),
        },
        ..Default::default()
    })
    .unwrap();
    AdmissionGate::new(Arc::new(policy), true)
}

#[tokio::test]
async fn test_rate_limited_upgrade_is_refused() {
    // Upgrade and re-check each take a slot
    let (server, addr) = start_server(test_config(next_port()), rate_limited_gate(4)).await;
    let hub = server.hub();

    let _a = connect_welcomed(addr).await;
    let _b = connect_welcomed(addr).await;

    match connect(addr).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 429),
        other => panic!("Expected HTTP 429, got {:?}", other.map(|_| ())),
    }
    assert_eq!(hub.connection_count(), 2);

    server.shutdown();
}

#[tokio::test]
async fn test_rate_limited_after_handshake_is_closed() {
    let (server, addr) = start_server(test_config(next_port()), rate_limited_gate(3)).await;
    let _a = connect_welcomed(addr).await;

    // The upgrade takes the last slot, the re-check finds none
    let mut b = connect(addr).await.expect("Upgrade should be accepted");
    let frame = loop {
        match timeout(Duration::from_secs(5), b.next()).await.unwrap() {
            Some(Ok(Message::Close(frame))) => break frame,
            Some(Ok(Message::Text(text))) => panic!("Unexpected message: {}", text),
            Some(Ok(_)) => continue,
            other => panic!("Expected close frame, got {:?}", other),
        }
    };
    assert_eq!(frame.map(|f| u16::from(f.code)), Some(1013));
    assert_eq!(server.hub().connection_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_bot_upgrade_is_denied() {
    let policy = RateLimitPolicy::new(&AdmissionConfig::default()).unwrap();
    let gate = AdmissionGate::new(Arc::new(policy), true);
    let (server, addr) = start_server(test_config(next_port()), gate).await;

    // No user agent at all
    match connect_async(format!("ws://{}/ws", addr)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("Expected HTTP 401, got {:?}", other.map(|_| ())),
    }

    let _client = connect_welcomed(addr).await;
    assert_eq!(server.hub().connection_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_connection_limit() {
    let mut config = test_config(next_port());
    config.max_connections = 1;
    let (server, addr) = start_server(config, AdmissionGate::allow_all()).await;

    let _first = connect_welcomed(addr).await;
    match connect(addr).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 503),
        other => panic!("Expected HTTP 503, got {:?}", other.map(|_| ())),
    }

    server.shutdown();
}

#[tokio::test]
async fn test_unresponsive_client_is_evicted() {
    let mut config = test_config(next_port());
    config.ping_interval = Duration::from_millis(100);
    let (server, addr) = start_server(config, AdmissionGate::allow_all()).await;
    let hub = server.hub();

    // Never reads again, so pings go unanswered
    let mut silent = connect_welcomed(addr).await;
    subscribe(&mut silent, 4).await;
    wait_for(&hub, |hub| hub.connection_count() == 1).await;

    wait_for(&hub, |hub| hub.connection_count() == 0).await;
    assert!(!hub.has_topic(MatchId::new(4).unwrap()));

    server.shutdown();
}

#[tokio::test]
async fn test_responsive_client_survives_probes() {
    let mut config = test_config(next_port());
    config.ping_interval = Duration::from_millis(100);
    let (server, addr) = start_server(config, AdmissionGate::allow_all()).await;

    let mut client = connect_welcomed(addr).await;

    // Reading answers pings; several sweeps pass meanwhile
    assert_silent(&mut client).await;
    assert_silent(&mut client).await;
    assert_silent(&mut client).await;
    assert_eq!(server.hub().connection_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let (server, addr) = start_server(test_config(next_port()), AdmissionGate::allow_all()).await;
    let mut client = connect_welcomed(addr).await;

    server.shutdown();

    let frame = loop {
        match timeout(Duration::from_secs(5), client.next()).await.unwrap() {
            Some(Ok(Message::Close(frame))) => break frame,
            Some(Ok(_)) => continue,
            other => panic!("Expected close frame, got {:?}", other),
        }
    };
    assert_eq!(frame.map(|f| u16::from(f.code)), Some(1001));
    wait_for(&server.hub(), |hub| hub.connection_count() == 0).await;
}

#[tokio::test]
async fn test_http_routes() {
    let (server, addr) = start_server(test_config(next_port()), AdmissionGate::allow_all()).await;

    let response = http_get(addr, "/ping").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains(r#"{"message":"pong"}"#));

    let response = http_get(addr, "/ws").await;
    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);

    let response = http_get(addr, "/matches").await;
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);

    server.shutdown();
}
