//! Signaling protocol handler
//!
//! Drives the per-client state machine: join a room, create and connect a
//! producer and a consumer transport, produce, consume and resume. Each
//! operation returns an explicit `Result`; `handle_message` is the error
//! boundary that turns failures into error replies.

mod error;

pub use error::{Result, SignalingError};

use crate::engine::{MediaEngineAdapter, WebRtcTransport};
use crate::session::{Room, SessionRegistry};
use crate::ws::connections::ConnectionManager;
use confer_protocol::{
    ClientId, ClientMessage, ConsumerParams, DtlsParameters, MediaKind, ProducerId, Reply, Request,
    RoomSummary, RtpCapabilities, RtpParameters, ServerMessage, TransportParams,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Signaling state of one connected client
#[derive(Debug, Clone, Default)]
struct ClientSession {
    room: Option<String>,
}

pub struct SignalingServer {
    registry: Arc<SessionRegistry>,
    engine: Arc<MediaEngineAdapter>,
    connections: Arc<ConnectionManager>,
    sessions: RwLock<HashMap<ClientId, ClientSession>>,
}

#[derive(Clone, Copy)]
enum Direction {
    Producer,
    Consumer,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Producer => "producer",
            Direction::Consumer => "consumer",
        }
    }
}

impl SignalingServer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        engine: Arc<MediaEngineAdapter>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            registry,
            engine,
            connections,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create `name` on the shared router unless it already exists
    pub async fn create_room(&self, name: &str, description: Option<String>) -> Arc<Room> {
        let (room, _) = self
            .registry
            .get_or_create_room(name, description, self.engine.router())
            .await;
        room
    }

    /// Register a new client and greet it with its id
    pub async fn connect(&self, client_id: ClientId, sender: mpsc::UnboundedSender<String>) {
        self.sessions
            .write()
            .await
            .insert(client_id, ClientSession::default());
        self.connections.add_connection(client_id, sender).await;
        self.connections
            .send_to_connection(client_id, &ServerMessage::Connected { socket_id: client_id })
            .await;

        tracing::info!("Client {} connected", client_id);
    }

    /// Tear down everything the client owns and forget it
    pub async fn disconnect(&self, client_id: ClientId) {
        let session = self.sessions.write().await.remove(&client_id);

        if let Some(room_name) = session.and_then(|s| s.room) {
            if let Some(room) = self.registry.get_room(&room_name).await {
                room.remove_participant(client_id).await;
            }
        }
        self.connections.remove_connection(client_id).await;

        tracing::info!("Client {} disconnected", client_id);
    }

    /// Room the client is currently in
    pub async fn room_of(&self, client_id: ClientId) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(&client_id)
            .and_then(|s| s.room.clone())
    }

    async fn is_in_room(&self, client_id: ClientId, room_name: &str) -> bool {
        self.room_of(client_id).await.as_deref() == Some(room_name)
    }

    async fn current_room(&self, client_id: ClientId) -> Result<Arc<Room>> {
        let room_name = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&client_id)
                .ok_or_else(|| SignalingError::NotFound(format!("unknown client {}", client_id)))?;
            session.room.clone().ok_or_else(|| {
                SignalingError::ProtocolViolation("join a room first".to_string())
            })?
        };

        self.registry
            .get_room(&room_name)
            .await
            .ok_or_else(|| SignalingError::NotFound(format!("room {} not found", room_name)))
    }

    fn orphaned(client_id: ClientId, room: &Room, what: &str) -> SignalingError {
        tracing::warn!(
            "Client {} left room {} while its {} was being created, closed it",
            client_id,
            room.name(),
            what
        );
        SignalingError::ProtocolViolation(format!("client left room {} during {}", room.name(), what))
    }

    // Operations

    pub async fn join_room(
        &self,
        client_id: ClientId,
        room_id: &str,
        room_name: &str,
        description: Option<String>,
    ) -> Result<()> {
        if room_name.trim().is_empty() {
            return Err(SignalingError::Validation("room name must not be empty".to_string()));
        }

        let previous = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&client_id)
                .ok_or_else(|| SignalingError::NotFound(format!("unknown client {}", client_id)))?;
            session.room.clone()
        };

        if previous.as_deref() == Some(room_name) {
            tracing::debug!("Client {} is already in room {}", client_id, room_name);
            return Ok(());
        }

        if let Some(previous) = previous {
            if let Some(room) = self.registry.get_room(&previous).await {
                room.remove_participant(client_id).await;
            }
            self.connections.leave_room(client_id).await;
            tracing::info!("Client {} left room {}", client_id, previous);
        }

        let (room, created) = self
            .registry
            .get_or_create_room(room_name, description, self.engine.router())
            .await;

        if let Some(session) = self.sessions.write().await.get_mut(&client_id) {
            session.room = Some(room.name().to_string());
        } else {
            // Disconnected while the room was being looked up
            return Err(SignalingError::NotFound(format!("unknown client {}", client_id)));
        }
        self.connections.join_room(client_id, room.name()).await;

        tracing::info!(
            "Client {} joined {} room {} ({})",
            client_id,
            if created { "new" } else { "existing" },
            room_name,
            room_id
        );

        Ok(())
    }

    /// Push the current room names to the caller
    pub async fn fetch_rooms(&self, client_id: ClientId) {
        let available_rooms = self.registry.list_room_names().await;
        self.connections
            .send_to_connection(client_id, &ServerMessage::RoomsFetched { available_rooms })
            .await;
    }

    /// Capabilities of the router shared by every room; no room needed
    pub async fn router_rtp_capabilities(&self, client_id: ClientId) -> Result<RtpCapabilities> {
        if !self.sessions.read().await.contains_key(&client_id) {
            return Err(SignalingError::NotFound(format!("unknown client {}", client_id)));
        }
        Ok(self.engine.rtp_capabilities())
    }

    pub async fn create_producer_transport(&self, client_id: ClientId) -> Result<TransportParams> {
        self.create_transport(client_id, Direction::Producer).await
    }

    pub async fn create_consumer_transport(&self, client_id: ClientId) -> Result<TransportParams> {
        self.create_transport(client_id, Direction::Consumer).await
    }

    async fn create_transport(&self, client_id: ClientId, direction: Direction) -> Result<TransportParams> {
        let room = self.current_room(client_id).await?;
        let transport = self.engine.create_webrtc_transport().await?;

        if !self.is_in_room(client_id, room.name()).await {
            transport.close().await;
            return Err(Self::orphaned(client_id, &room, "transport creation"));
        }

        match direction {
            Direction::Producer => {
                if let Some(old) = room.add_producer_transport(client_id, transport.clone()).await {
                    room.remove_producer(client_id).await;
                    old.close().await;
                }
            }
            Direction::Consumer => {
                if let Some(old) = room.add_consumer_transport(client_id, transport.clone()).await {
                    room.delete_consumer_set(client_id).await;
                    old.close().await;
                }
            }
        }

        tracing::info!(
            "Created {} transport {} for client {} in room {}",
            direction.as_str(),
            transport.id(),
            client_id,
            room.name()
        );

        Ok(transport.params())
    }

    /// Producer ids in the caller's room, excluding `exclude` (the caller by default)
    pub async fn room_producers(&self, client_id: ClientId, exclude: Option<ClientId>) -> Result<Vec<ClientId>> {
        let room = self.current_room(client_id).await?;
        Ok(room.get_remote_producer_ids(exclude.unwrap_or(client_id)).await)
    }

    pub async fn connect_producer_transport(
        &self,
        client_id: ClientId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        self.connect_transport(client_id, Direction::Producer, dtls_parameters)
            .await
    }

    pub async fn connect_consumer_transport(
        &self,
        client_id: ClientId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        self.connect_transport(client_id, Direction::Consumer, dtls_parameters)
            .await
    }

    async fn transport_of(
        &self,
        room: &Room,
        client_id: ClientId,
        direction: Direction,
    ) -> Result<Arc<dyn WebRtcTransport>> {
        let transport = match direction {
            Direction::Producer => room.get_producer_transport(client_id).await,
            Direction::Consumer => room.get_consumer_transport(client_id).await,
        };

        transport.ok_or_else(|| {
            SignalingError::NotFound(format!("no {} transport for this client", direction.as_str()))
        })
    }

    async fn connect_transport(
        &self,
        client_id: ClientId,
        direction: Direction,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let room = self.current_room(client_id).await?;
        let transport = self.transport_of(&room, client_id, direction).await?;

        transport.connect(dtls_parameters).await?;

        tracing::info!(
            "Connected {} transport {} of client {}",
            direction.as_str(),
            transport.id(),
            client_id
        );

        Ok(())
    }

    /// Start sending `kind` media and tell the rest of the room about it
    pub async fn produce(
        &self,
        client_id: ClientId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let room = self.current_room(client_id).await?;
        let transport = self.transport_of(&room, client_id, Direction::Producer).await?;

        if !transport.is_connected() {
            return Err(SignalingError::ProtocolViolation(
                "producer transport is not connected".to_string(),
            ));
        }

        let producer = transport.produce(kind, rtp_parameters).await?;

        if !self.is_in_room(client_id, room.name()).await {
            producer.close().await;
            return Err(Self::orphaned(client_id, &room, "produce"));
        }

        let producer_id = producer.id();
        room.add_producer(client_id, producer).await;

        tracing::info!(
            "Client {} is producing {} ({}) in room {}",
            client_id,
            kind,
            producer_id,
            room.name()
        );

        self.connections
            .broadcast_to_room_except(
                room.name(),
                client_id,
                &ServerMessage::NewProducer {
                    socket_id: client_id,
                    producer_id,
                    kind,
                },
            )
            .await;

        Ok(producer_id)
    }

    /// Receive the media of participant `remote_id`. Video starts paused until
    /// the caller resumes it.
    pub async fn consume(
        &self,
        client_id: ClientId,
        remote_id: ClientId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams> {
        let room = self.current_room(client_id).await?;

        let producer = room.get_producer(remote_id).await.ok_or_else(|| {
            SignalingError::NotFound(format!("participant {} has no producer", remote_id))
        })?;
        let transport = self.transport_of(&room, client_id, Direction::Consumer).await?;

        if !self.engine.can_consume(producer.id(), &rtp_capabilities) {
            return Err(SignalingError::Validation(format!(
                "cannot consume producer of {} with the given RTP capabilities",
                remote_id
            )));
        }

        let paused = producer.kind() == MediaKind::Video;
        let consumer = transport
            .consume(producer.id(), rtp_capabilities, paused)
            .await?;

        if !self.is_in_room(client_id, room.name()).await {
            consumer.close().await;
            return Err(Self::orphaned(client_id, &room, "consume"));
        }

        let params = ConsumerParams {
            producer_id: consumer.producer_id(),
            id: consumer.id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            // Paused on either end; true for every fresh video consumer
            producer_paused: consumer.paused() || consumer.producer_paused(),
        };

        // The publisher may have replaced or dropped its producer meanwhile
        if !room.add_consumer(client_id, remote_id, consumer).await {
            return Err(SignalingError::NotFound(format!(
                "producer of {} went away while consuming",
                remote_id
            )));
        }

        tracing::info!(
            "Client {} consuming {} from {} (paused: {})",
            client_id,
            params.kind,
            remote_id,
            paused
        );

        Ok(params)
    }

    pub async fn resume(&self, client_id: ClientId, remote_id: ClientId) -> Result<()> {
        let room = self.current_room(client_id).await?;
        let consumer = room.get_consumer(client_id, remote_id).await.ok_or_else(|| {
            SignalingError::NotFound(format!("no consumer for participant {}", remote_id))
        })?;

        consumer.resume().await?;
        tracing::debug!("Client {} resumed consumer {}", client_id, consumer.id());

        Ok(())
    }

    // HTTP views

    pub async fn room_summaries(&self) -> Vec<RoomSummary> {
        let mut summaries = Vec::new();
        for room in self.registry.list_rooms().await {
            summaries.push(self.summarize(&room).await);
        }
        summaries
    }

    pub async fn room_summary(&self, name: &str) -> Option<RoomSummary> {
        let room = self.registry.get_room(name).await?;
        Some(self.summarize(&room).await)
    }

    async fn summarize(&self, room: &Room) -> RoomSummary {
        let participants = self.connections.room_member_count(room.name()).await;
        room.summary(participants).await
    }

    // Dispatch

    /// Handle one client frame. Failures are reported to the client and never
    /// propagate to the connection.
    pub async fn handle_message(&self, client_id: ClientId, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom {
                room_id,
                room_name,
                room_description,
            } => {
                if let Err(e) = self
                    .join_room(client_id, &room_id, &room_name, room_description)
                    .await
                {
                    tracing::warn!("joinRoom from {} failed: {}", client_id, e);
                    self.connections
                        .send_to_connection(client_id, &ServerMessage::Error { message: e.to_string() })
                        .await;
                }
            }
            ClientMessage::FetchRooms => self.fetch_rooms(client_id).await,
            ClientMessage::Request { request_id, request } => {
                let reply = self.handle_request(client_id, request).await;
                self.connections
                    .send_to_connection(client_id, &ServerMessage::Response { request_id, reply })
                    .await;
            }
            ClientMessage::Ping => {
                self.connections
                    .send_to_connection(client_id, &ServerMessage::Pong)
                    .await;
            }
        }
    }

    /// Run one request, converting any failure into an error reply
    pub async fn handle_request(&self, client_id: ClientId, request: Request) -> Reply {
        let method = request.method();

        let result = match request {
            Request::GetRouterRtpCapabilities => self
                .router_rtp_capabilities(client_id)
                .await
                .map(Reply::RouterRtpCapabilities),
            // Client capabilities are only needed once it consumes
            Request::CreateProducerTransport { .. } => self
                .create_producer_transport(client_id)
                .await
                .map(Reply::TransportCreated),
            Request::CreateConsumerTransport => self
                .create_consumer_transport(client_id)
                .await
                .map(Reply::TransportCreated),
            Request::GetRoomProducers { socket_id } => self
                .room_producers(client_id, socket_id)
                .await
                .map(Reply::RoomProducers),
            Request::ConnectProducerTransport { dtls_parameters } => self
                .connect_producer_transport(client_id, dtls_parameters)
                .await
                .map(|_| Reply::Connected),
            Request::ConnectConsumerTransport { dtls_parameters } => self
                .connect_consumer_transport(client_id, dtls_parameters)
                .await
                .map(|_| Reply::Connected),
            Request::Produce { kind, rtp_parameters } => self
                .produce(client_id, kind, rtp_parameters)
                .await
                .map(|id| Reply::Produced { id }),
            Request::Consume {
                producer_id,
                rtp_capabilities,
            } => self
                .consume(client_id, producer_id, rtp_capabilities)
                .await
                .map(Reply::Consumed),
            Request::Resume { producer_id } => self
                .resume(client_id, producer_id)
                .await
                .map(|_| Reply::Resumed),
        };

        result.unwrap_or_else(|e| {
            tracing::warn!("{} from {} failed: {}", method, client_id, e);
            Reply::Error(e.to_reply())
        })
    }
}
