//! Integration tests for Confer server
//!
//! Each test starts a real server on an ephemeral port and talks to it over
//! HTTP and the signaling WebSocket.
//!
//! Run with: cargo test -p confer-server --test integration_tests

use confer_protocol::{
    ClientId, ClientMessage, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, Reply, Request,
    RtpCapabilities, RtpCodecParameters, RtpEncodingParameters, RtpParameters, ServerMessage,
};
use confer_server::state::{Config, MediaSettings};
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Test helper to start a test server
async fn start_test_server() -> TestServer {
    TestServer::start().await.expect("Failed to start test server")
}

/// Test server wrapper
struct TestServer {
    addr: std::net::SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            default_room: "defaultRoom".to_string(),
            media: MediaSettings::default(),
        };

        let (router, _state) = confer_server::create_app(config).await?;

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        // Spawn server
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A signaling client: the socket, its server-assigned id and every push
/// received while waiting for responses
struct SignalingClient {
    ws: WsStream,
    socket_id: ClientId,
    pushes: Vec<ServerMessage>,
    next_request_id: u64,
}

impl SignalingClient {
    /// Connect and wait for the `connected` greeting
    async fn connect(ws_url: &str) -> anyhow::Result<Self> {
        let (mut ws, _) = connect_async(ws_url).await?;

        let socket_id = match read_frame(&mut ws).await? {
            ServerMessage::Connected { socket_id } => socket_id,
            other => return Err(anyhow::anyhow!("Unexpected greeting: {:?}", other)),
        };

        Ok(Self {
            ws,
            socket_id,
            pushes: Vec::new(),
            next_request_id: 1,
        })
    }

    async fn send(&mut self, message: &ClientMessage) -> anyhow::Result<()> {
        self.ws
            .send(Message::Text(serde_json::to_string(message)?.into()))
            .await?;
        Ok(())
    }

    async fn join(&mut self, room: &str) -> anyhow::Result<()> {
        self.send(&ClientMessage::JoinRoom {
            room_id: room.to_string(),
            room_name: room.to_string(),
            room_description: None,
        })
        .await
    }

    /// Send a request and wait for its response; pushes seen meanwhile are kept
    async fn request(&mut self, request: Request) -> anyhow::Result<Reply> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.send(&ClientMessage::Request { request_id, request })
            .await?;

        loop {
            match read_frame(&mut self.ws).await? {
                ServerMessage::Response {
                    request_id: id,
                    reply,
                } if id == request_id => return Ok(reply),
                other => self.pushes.push(other),
            }
        }
    }

    /// Wait for the next push that is not a response
    async fn next_push(&mut self) -> anyhow::Result<ServerMessage> {
        if !self.pushes.is_empty() {
            return Ok(self.pushes.remove(0));
        }
        read_frame(&mut self.ws).await
    }
}

async fn read_frame(ws: &mut WsStream) -> anyhow::Result<ServerMessage> {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("Connection closed"))??;

        if let Message::Text(text) = frame {
            return Ok(serde_json::from_str(&text)?);
        }
    }
}

fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "0F:1E:2D:3C:4B:5A:69:78:87:96:A5:B4:C3:D2:E1:F0:0F:1E:2D:3C:4B:5A:69:78:87:96:A5:B4:C3:D2:E1:F0".to_string(),
        }],
    }
}

fn vp8_parameters() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: Default::default(),
            rtcp_feedback: vec![],
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(424242),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Join `room` and start producing video; returns the producer id
async fn start_publishing(client: &mut SignalingClient, room: &str) -> anyhow::Result<uuid::Uuid> {
    client.join(room).await?;

    let reply = client
        .request(Request::CreateProducerTransport {
            rtp_capabilities: None,
        })
        .await?;
    assert!(matches!(reply, Reply::TransportCreated(_)), "{:?}", reply);

    let reply = client
        .request(Request::ConnectProducerTransport {
            dtls_parameters: client_dtls(),
        })
        .await?;
    assert_eq!(reply, Reply::Connected);

    match client
        .request(Request::Produce {
            kind: MediaKind::Video,
            rtp_parameters: vp8_parameters(),
        })
        .await?
    {
        Reply::Produced { id } => Ok(id),
        other => Err(anyhow::anyhow!("Produce failed: {:?}", other)),
    }
}

async fn room_summary(client: &Client, http_url: &str, name: &str) -> serde_json::Value {
    client
        .get(format!("{}/api/rooms/{}", http_url, name))
        .send()
        .await
        .expect("Room request failed")
        .json()
        .await
        .expect("Invalid room summary")
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_health_and_default_room() {
    let server = start_test_server().await;
    let client = Client::new();

    let health = client
        .get(format!("{}/health", server.http_url()))
        .send()
        .await
        .expect("Health request failed");
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "OK");

    let rooms: Vec<serde_json::Value> = client
        .get(format!("{}/api/rooms", server.http_url()))
        .send()
        .await
        .expect("Rooms request failed")
        .json()
        .await
        .unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0]["name"], "defaultRoom");
    assert_eq!(rooms[0]["description"], "No description");
    assert!(rooms[0]["createdAt"].is_string());

    let missing = client
        .get(format!("{}/api/rooms/nope", server.http_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = missing.json().await.unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_websocket_greeting_and_ping() {
    let server = start_test_server().await;

    let mut a = SignalingClient::connect(&server.ws_url())
        .await
        .expect("Failed to connect WebSocket");
    assert!(!a.socket_id.is_nil());

    a.send(&ClientMessage::Ping).await.unwrap();
    assert!(matches!(a.next_push().await.unwrap(), ServerMessage::Pong));
}

#[tokio::test]
async fn test_malformed_frames_do_not_close_connection() {
    let server = start_test_server().await;
    let mut a = SignalingClient::connect(&server.ws_url()).await.unwrap();

    a.ws.send(Message::Text("{not json".into())).await.unwrap();
    assert!(matches!(
        a.next_push().await.unwrap(),
        ServerMessage::Error { .. }
    ));

    // Requests before joining fail with a reply, not a disconnect
    let reply = a.request(Request::CreateConsumerTransport).await.unwrap();
    assert!(reply.is_error());

    let frame = json!({ "type": "fetchRooms" }).to_string();
    a.ws.send(Message::Text(frame.into())).await.unwrap();
    match a.next_push().await.unwrap() {
        ServerMessage::RoomsFetched { available_rooms } => {
            assert_eq!(available_rooms, vec!["defaultRoom".to_string()]);
        }
        other => panic!("Unexpected push: {:?}", other),
    }
}

#[tokio::test]
async fn test_lobby_over_websocket() {
    let server = start_test_server().await;
    let http = Client::new();

    let mut b = SignalingClient::connect(&server.ws_url()).await.unwrap();
    b.join("lobby").await.unwrap();
    // Round trip so the join is processed before A produces
    let caps = match b.request(Request::GetRouterRtpCapabilities).await.unwrap() {
        Reply::RouterRtpCapabilities(caps) => caps,
        other => panic!("Unexpected reply: {:?}", other),
    };

    let mut a = SignalingClient::connect(&server.ws_url()).await.unwrap();
    let producer_id = start_publishing(&mut a, "lobby").await.unwrap();

    match b.next_push().await.unwrap() {
        ServerMessage::NewProducer {
            socket_id,
            producer_id: announced,
            kind,
        } => {
            assert_eq!(socket_id, a.socket_id);
            assert_eq!(announced, producer_id);
            assert_eq!(kind, MediaKind::Video);
        }
        other => panic!("Unexpected push: {:?}", other),
    }

    let reply = b
        .request(Request::GetRoomProducers { socket_id: None })
        .await
        .unwrap();
    assert_eq!(reply, Reply::RoomProducers(vec![a.socket_id]));

    let reply = b.request(Request::CreateConsumerTransport).await.unwrap();
    assert!(matches!(reply, Reply::TransportCreated(_)));
    let reply = b
        .request(Request::ConnectConsumerTransport {
            dtls_parameters: client_dtls(),
        })
        .await
        .unwrap();
    assert_eq!(reply, Reply::Connected);

    let consumed = match b
        .request(Request::Consume {
            producer_id: a.socket_id,
            rtp_capabilities: caps,
        })
        .await
        .unwrap()
    {
        Reply::Consumed(params) => params,
        other => panic!("Unexpected reply: {:?}", other),
    };
    assert_eq!(consumed.producer_id, producer_id);
    assert_eq!(consumed.kind, MediaKind::Video);
    assert!(consumed.producer_paused);

    for _ in 0..2 {
        let reply = b
            .request(Request::Resume {
                producer_id: a.socket_id,
            })
            .await
            .unwrap();
        assert_eq!(reply, Reply::Resumed);
    }

    let summary = room_summary(&http, &server.http_url(), "lobby").await;
    assert_eq!(summary["participants"], 2);
    assert_eq!(summary["producers"], 1);
}

#[tokio::test]
async fn test_incompatible_consume_over_websocket() {
    let server = start_test_server().await;

    let mut a = SignalingClient::connect(&server.ws_url()).await.unwrap();
    start_publishing(&mut a, "lobby").await.unwrap();

    let mut b = SignalingClient::connect(&server.ws_url()).await.unwrap();
    b.join("lobby").await.unwrap();
    b.request(Request::CreateConsumerTransport).await.unwrap();

    let reply = b
        .request(Request::Consume {
            producer_id: a.socket_id,
            rtp_capabilities: RtpCapabilities::default(),
        })
        .await
        .unwrap();

    match reply {
        Reply::Error(e) => assert_eq!(e.kind, confer_protocol::ErrorKind::Validation),
        other => panic!("Unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_releases_room_resources() {
    let server = start_test_server().await;
    let http = Client::new();

    let mut a = SignalingClient::connect(&server.ws_url()).await.unwrap();
    start_publishing(&mut a, "lobby").await.unwrap();

    let summary = room_summary(&http, &server.http_url(), "lobby").await;
    assert_eq!(summary["producers"], 1);

    a.ws.close(None).await.unwrap();
    drop(a);

    // Cleanup runs once the server sees the close frame
    let mut producers = serde_json::Value::Null;
    for _ in 0..50 {
        let summary = room_summary(&http, &server.http_url(), "lobby").await;
        producers = summary["producers"].clone();
        if producers == 0 && summary["participants"] == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(producers, 0);
}
