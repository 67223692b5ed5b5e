//! Per-room session state
//!
//! A room owns the engine handles of its participants, keyed by client id:
//! one producer transport, one consumer transport and one producer per client,
//! plus every consumer a client holds on another client's producer. Consumers
//! live in an arena keyed by consumer id with a `(local, remote)` index on top.
//!
//! Engine handles are closed only after the state lock is released.

use crate::engine::{Consumer, Producer, Router, WebRtcTransport};
use chrono::{DateTime, Utc};
use confer_protocol::{ClientId, ConsumerId, RoomSummary};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_DESCRIPTION: &str = "No description";

/// Consumers held by one participant, keyed by the remote producer's client id
pub type ConsumerSet = HashMap<ClientId, Arc<dyn Consumer>>;

struct ConsumerRecord {
    local: ClientId,
    remote: ClientId,
    consumer: Arc<dyn Consumer>,
}

#[derive(Default)]
struct RoomState {
    description: String,
    producer_transports: HashMap<ClientId, Arc<dyn WebRtcTransport>>,
    consumer_transports: HashMap<ClientId, Arc<dyn WebRtcTransport>>,
    producers: HashMap<ClientId, Arc<dyn Producer>>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    consumer_index: HashMap<(ClientId, ClientId), ConsumerId>,
}

impl RoomState {
    fn insert_consumer(
        &mut self,
        local: ClientId,
        remote: ClientId,
        consumer: Arc<dyn Consumer>,
    ) -> Option<Arc<dyn Consumer>> {
        let displaced = self
            .consumer_index
            .insert((local, remote), consumer.id())
            .and_then(|old_id| self.consumers.remove(&old_id))
            .map(|record| record.consumer);

        self.consumers.insert(
            consumer.id(),
            ConsumerRecord {
                local,
                remote,
                consumer,
            },
        );

        displaced
    }

    /// Detach every record matching `predicate` from the arena and the index
    fn take_consumers<F>(&mut self, predicate: F) -> Vec<Arc<dyn Consumer>>
    where
        F: Fn(&ConsumerRecord) -> bool,
    {
        let ids: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, record)| predicate(record))
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.consumers.remove(&id))
            .map(|record| {
                self.consumer_index.remove(&(record.local, record.remote));
                record.consumer
            })
            .collect()
    }
}

/// What `Room::remove_participant` tore down
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParticipantTeardown {
    pub producer: bool,
    pub dependent_consumers: usize,
    pub producer_transport: bool,
    pub consumers: usize,
    pub consumer_transport: bool,
}

pub struct Room {
    name: String,
    created_at: DateTime<Utc>,
    router: Arc<dyn Router>,
    state: RwLock<RoomState>,
}

impl Room {
    pub fn new(name: impl Into<String>, description: Option<String>, router: Arc<dyn Router>) -> Self {
        Self {
            name: name.into(),
            created_at: Utc::now(),
            router,
            state: RwLock::new(RoomState {
                description: description.unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
                ..Default::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Router shared with every other room; the room never closes it
    pub fn router(&self) -> Arc<dyn Router> {
        self.router.clone()
    }

    pub async fn description(&self) -> String {
        self.state.read().await.description.clone()
    }

    pub async fn set_description(&self, description: impl Into<String>) {
        self.state.write().await.description = description.into();
    }

    // Producer transports

    pub async fn get_producer_transport(&self, id: ClientId) -> Option<Arc<dyn WebRtcTransport>> {
        self.state.read().await.producer_transports.get(&id).cloned()
    }

    /// Register `transport` for `id`, returning the transport it replaced
    pub async fn add_producer_transport(
        &self,
        id: ClientId,
        transport: Arc<dyn WebRtcTransport>,
    ) -> Option<Arc<dyn WebRtcTransport>> {
        let displaced = self
            .state
            .write()
            .await
            .producer_transports
            .insert(id, transport);
        tracing::debug!("Room {}: added producer transport for {}", self.name, id);
        displaced
    }

    pub async fn delete_producer_transport(&self, id: ClientId) -> Option<Arc<dyn WebRtcTransport>> {
        let removed = self.state.write().await.producer_transports.remove(&id);
        if removed.is_some() {
            tracing::debug!("Room {}: deleted producer transport for {}", self.name, id);
        }
        removed
    }

    // Consumer transports

    pub async fn get_consumer_transport(&self, id: ClientId) -> Option<Arc<dyn WebRtcTransport>> {
        self.state.read().await.consumer_transports.get(&id).cloned()
    }

    /// Register `transport` for `id`, returning the transport it replaced
    pub async fn add_consumer_transport(
        &self,
        id: ClientId,
        transport: Arc<dyn WebRtcTransport>,
    ) -> Option<Arc<dyn WebRtcTransport>> {
        let displaced = self
            .state
            .write()
            .await
            .consumer_transports
            .insert(id, transport);
        tracing::debug!("Room {}: added consumer transport for {}", self.name, id);
        displaced
    }

    pub async fn delete_consumer_transport(&self, id: ClientId) -> Option<Arc<dyn WebRtcTransport>> {
        let removed = self.state.write().await.consumer_transports.remove(&id);
        if removed.is_some() {
            tracing::debug!("Room {}: deleted consumer transport for {}", self.name, id);
        }
        removed
    }

    // Producers

    pub async fn get_producer(&self, id: ClientId) -> Option<Arc<dyn Producer>> {
        self.state.read().await.producers.get(&id).cloned()
    }

    /// Register `producer` as the only producer of `id`.
    ///
    /// A previously registered producer is closed, together with every consumer
    /// that was receiving it.
    pub async fn add_producer(&self, id: ClientId, producer: Arc<dyn Producer>) {
        let (displaced, dependents) = {
            let mut state = self.state.write().await;
            match state.producers.insert(id, producer) {
                Some(old) => {
                    let old_id = old.id();
                    let dependents = state.take_consumers(|r| {
                        r.remote == id && r.consumer.producer_id() == old_id
                    });
                    (Some(old), dependents)
                }
                None => (None, Vec::new()),
            }
        };

        if let Some(old) = displaced {
            tracing::info!(
                "Room {}: producer {} of {} replaced, closing {} consumers",
                self.name,
                old.id(),
                id,
                dependents.len()
            );
            old.close().await;
            for consumer in dependents {
                consumer.close().await;
            }
        }

        tracing::debug!("Room {}: added producer for {}", self.name, id);
    }

    /// Deregister the producer of `id` without closing it
    pub async fn delete_producer(&self, id: ClientId) -> Option<Arc<dyn Producer>> {
        let removed = self.state.write().await.producers.remove(&id);
        if removed.is_some() {
            tracing::debug!("Room {}: deleted producer for {}", self.name, id);
        }
        removed
    }

    /// Close and deregister the producer of `id` and every consumer of it.
    /// Returns the number of dependent consumers closed, or `None` if `id` had
    /// no producer.
    pub async fn remove_producer(&self, id: ClientId) -> Option<usize> {
        let (producer, dependents) = {
            let mut state = self.state.write().await;
            let producer = state.producers.remove(&id)?;
            let dependents = state.take_consumers(|r| r.remote == id);
            (producer, dependents)
        };

        let count = dependents.len();
        producer.close().await;
        for consumer in dependents {
            // Subscribers are not told; their consumer just goes away
            consumer.close().await;
        }

        tracing::debug!(
            "Room {}: removed producer of {} and {} dependent consumers",
            self.name,
            id,
            count
        );

        Some(count)
    }

    /// Client ids owning a producer in this room, except `local_id`
    pub async fn get_remote_producer_ids(&self, local_id: ClientId) -> Vec<ClientId> {
        self.state
            .read()
            .await
            .producers
            .keys()
            .filter(|id| **id != local_id)
            .copied()
            .collect()
    }

    pub async fn producer_count(&self) -> usize {
        self.state.read().await.producers.len()
    }

    // Consumers

    pub async fn get_consumer_set(&self, local_id: ClientId) -> ConsumerSet {
        self.state
            .read()
            .await
            .consumers
            .values()
            .filter(|r| r.local == local_id)
            .map(|r| (r.remote, r.consumer.clone()))
            .collect()
    }

    /// Merge `consumers` into the set of `local_id`; replaced consumers are closed
    pub async fn add_consumer_set(&self, local_id: ClientId, consumers: ConsumerSet) {
        let displaced: Vec<Arc<dyn Consumer>> = {
            let mut state = self.state.write().await;
            consumers
                .into_iter()
                .filter_map(|(remote, consumer)| state.insert_consumer(local_id, remote, consumer))
                .collect()
        };

        for consumer in displaced {
            consumer.close().await;
        }
    }

    /// Close and remove every consumer held by `local_id`. A no-op when the
    /// participant holds none.
    pub async fn delete_consumer_set(&self, local_id: ClientId) -> usize {
        let consumers = self
            .state
            .write()
            .await
            .take_consumers(|r| r.local == local_id);

        let count = consumers.len();
        for consumer in consumers {
            consumer.close().await;
        }

        if count > 0 {
            tracing::debug!(
                "Room {}: deleted consumer set of {} ({} consumers)",
                self.name,
                local_id,
                count
            );
        }
        count
    }

    pub async fn get_consumer(&self, local_id: ClientId, remote_id: ClientId) -> Option<Arc<dyn Consumer>> {
        let state = self.state.read().await;
        state
            .consumer_index
            .get(&(local_id, remote_id))
            .and_then(|id| state.consumers.get(id))
            .map(|r| r.consumer.clone())
    }

    /// Insert or overwrite the `(local_id, remote_id)` slot; a replaced
    /// consumer is closed.
    ///
    /// The consumer is only registered while it is open and `remote_id`'s
    /// current producer is the one it consumes. Otherwise it is closed and
    /// `false` is returned.
    pub async fn add_consumer(&self, local_id: ClientId, remote_id: ClientId, consumer: Arc<dyn Consumer>) -> bool {
        let displaced = {
            let mut state = self.state.write().await;
            let current = state.producers.get(&remote_id).map(|p| p.id());

            if consumer.closed() || current != Some(consumer.producer_id()) {
                drop(state);
                tracing::warn!(
                    "Room {}: producer {} of {} went away before consumer {} was registered",
                    self.name,
                    consumer.producer_id(),
                    remote_id,
                    consumer.id()
                );
                consumer.close().await;
                return false;
            }

            state.insert_consumer(local_id, remote_id, consumer)
        };

        if let Some(old) = displaced {
            old.close().await;
        }

        tracing::debug!(
            "Room {}: added consumer {} <- {}",
            self.name,
            local_id,
            remote_id
        );

        true
    }

    /// Deregister the `(local_id, remote_id)` consumer without closing it
    pub async fn delete_consumer(&self, local_id: ClientId, remote_id: ClientId) -> Option<Arc<dyn Consumer>> {
        let mut state = self.state.write().await;
        let id = state.consumer_index.remove(&(local_id, remote_id))?;
        state.consumers.remove(&id).map(|r| r.consumer)
    }

    /// Tear down everything `id` owns in this room, in order: its producer and
    /// the consumers receiving it, its producer transport, its own consumers,
    /// its consumer transport.
    pub async fn remove_participant(&self, id: ClientId) -> ParticipantTeardown {
        let mut teardown = ParticipantTeardown::default();

        if let Some(dependents) = self.remove_producer(id).await {
            teardown.producer = true;
            teardown.dependent_consumers = dependents;
        }

        if let Some(transport) = self.delete_producer_transport(id).await {
            transport.close().await;
            teardown.producer_transport = true;
        }

        teardown.consumers = self.delete_consumer_set(id).await;

        if let Some(transport) = self.delete_consumer_transport(id).await {
            transport.close().await;
            teardown.consumer_transport = true;
        }

        tracing::info!("Room {}: removed participant {}: {:?}", self.name, id, teardown);

        teardown
    }

    pub async fn summary(&self, participants: usize) -> RoomSummary {
        let state = self.state.read().await;
        RoomSummary {
            name: self.name.clone(),
            description: state.description.clone(),
            participants,
            producers: state.producers.len(),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::local::{LocalWorker, WorkerSettings};
    use crate::engine::{ortc, ListenIp, WebRtcTransportOptions};
    use confer_protocol::{MediaKind, RtpCodecParameters, RtpEncodingParameters, RtpParameters};
    use uuid::Uuid;

    fn test_router() -> Arc<dyn Router> {
        let worker = LocalWorker::new(&WorkerSettings {
            rtc_min_port: 20000,
            rtc_max_port: 29999,
        })
        .unwrap();
        worker.create_router(&ortc::default_media_codecs()).unwrap()
    }

    async fn transport(router: &Arc<dyn Router>) -> Arc<dyn WebRtcTransport> {
        router
            .create_webrtc_transport(WebRtcTransportOptions {
                listen_ips: vec![ListenIp {
                    ip: "127.0.0.1".parse().unwrap(),
                    announced_ip: None,
                }],
                enable_udp: true,
                enable_tcp: false,
                prefer_udp: true,
                initial_available_outgoing_bitrate: 600_000,
            })
            .await
            .unwrap()
    }

    fn opus() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: Default::default(),
                rtcp_feedback: vec![],
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(2222),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// A producer for `owner` and a consumer of it held by `viewer`
    async fn publish_and_subscribe(
        room: &Room,
        owner: ClientId,
        viewer: ClientId,
    ) -> (Arc<dyn Producer>, Arc<dyn Consumer>) {
        let router = room.router();
        let send = transport(&router).await;
        let recv = transport(&router).await;
        room.add_producer_transport(owner, send.clone()).await;
        room.add_consumer_transport(viewer, recv.clone()).await;

        let producer = send.produce(MediaKind::Audio, opus()).await.unwrap();
        room.add_producer(owner, producer.clone()).await;

        let consumer = recv
            .consume(producer.id(), router.rtp_capabilities(), false)
            .await
            .unwrap();
        assert!(room.add_consumer(viewer, owner, consumer.clone()).await);

        (producer, consumer)
    }

    #[tokio::test]
    async fn test_new_room_defaults() {
        let room = Room::new("lobby", None, test_router());
        assert_eq!(room.name(), "lobby");
        assert_eq!(room.description().await, DEFAULT_DESCRIPTION);

        room.set_description("Weekly sync").await;
        assert_eq!(room.summary(0).await.description, "Weekly sync");
    }

    #[tokio::test]
    async fn test_add_transport_last_write_wins() {
        let router = test_router();
        let room = Room::new("lobby", None, router.clone());
        let client = Uuid::new_v4();
        let first = transport(&router).await;
        let second = transport(&router).await;

        assert!(room.add_producer_transport(client, first.clone()).await.is_none());
        let displaced = room.add_producer_transport(client, second.clone()).await;

        assert_eq!(displaced.map(|t| t.id()), Some(first.id()));
        assert_eq!(
            room.get_producer_transport(client).await.map(|t| t.id()),
            Some(second.id())
        );
    }

    #[tokio::test]
    async fn test_remote_producer_ids_exclude_local() {
        let room = Room::new("lobby", None, test_router());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        publish_and_subscribe(&room, a, c).await;
        publish_and_subscribe(&room, b, c).await;

        let mut remote = room.get_remote_producer_ids(a).await;
        remote.sort();
        assert_eq!(remote, vec![b]);

        let mut all = room.get_remote_producer_ids(c).await;
        all.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn test_delete_consumer_set_closes_and_is_idempotent() {
        let room = Room::new("lobby", None, test_router());
        let (a, b, viewer) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (_, first) = publish_and_subscribe(&room, a, viewer).await;
        let (_, second) = publish_and_subscribe(&room, b, viewer).await;

        assert_eq!(room.get_consumer_set(viewer).await.len(), 2);
        assert_eq!(room.delete_consumer_set(viewer).await, 2);

        assert!(first.closed());
        assert!(second.closed());
        assert!(room.get_consumer_set(viewer).await.is_empty());
        assert!(room.get_consumer(viewer, a).await.is_none());
        assert_eq!(room.delete_consumer_set(viewer).await, 0);
        assert_eq!(room.delete_consumer_set(Uuid::new_v4()).await, 0);
    }

    #[tokio::test]
    async fn test_add_consumer_overwrites_slot() {
        let room = Room::new("lobby", None, test_router());
        let (owner, viewer) = (Uuid::new_v4(), Uuid::new_v4());
        let (producer, first) = publish_and_subscribe(&room, owner, viewer).await;

        let recv = room.get_consumer_transport(viewer).await.unwrap();
        let second = recv
            .consume(producer.id(), room.router().rtp_capabilities(), false)
            .await
            .unwrap();
        assert!(room.add_consumer(viewer, owner, second.clone()).await);

        assert!(first.closed());
        assert_eq!(
            room.get_consumer(viewer, owner).await.map(|c| c.id()),
            Some(second.id())
        );
        assert_eq!(room.get_consumer_set(viewer).await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_consumer_set_and_delete_consumer() {
        let room = Room::new("lobby", None, test_router());
        let (owner, viewer) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, consumer) = publish_and_subscribe(&room, owner, viewer).await;

        let taken = room.delete_consumer(viewer, owner).await;
        assert_eq!(taken.as_ref().map(|c| c.id()), Some(consumer.id()));
        assert!(!consumer.closed());
        assert!(room.get_consumer(viewer, owner).await.is_none());

        let mut set = ConsumerSet::new();
        set.insert(owner, consumer.clone());
        room.add_consumer_set(viewer, set).await;
        assert!(room.get_consumer(viewer, owner).await.is_some());
    }

    #[tokio::test]
    async fn test_replacing_producer_closes_its_consumers() {
        let room = Room::new("lobby", None, test_router());
        let (owner, viewer) = (Uuid::new_v4(), Uuid::new_v4());
        let (first, consumer) = publish_and_subscribe(&room, owner, viewer).await;

        let send = room.get_producer_transport(owner).await.unwrap();
        let second = send.produce(MediaKind::Audio, opus()).await.unwrap();
        room.add_producer(owner, second.clone()).await;

        assert!(first.closed());
        assert!(consumer.closed());
        assert!(room.get_consumer(viewer, owner).await.is_none());
        assert_eq!(room.get_producer(owner).await.map(|p| p.id()), Some(second.id()));
        assert_eq!(room.producer_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_participant_order_and_cascade() {
        let room = Room::new("lobby", None, test_router());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (a_producer, b_consumes_a) = publish_and_subscribe(&room, a, b).await;
        let (_, a_consumes_b) = publish_and_subscribe(&room, b, a).await;

        let teardown = room.remove_participant(a).await;

        assert_eq!(
            teardown,
            ParticipantTeardown {
                producer: true,
                dependent_consumers: 1,
                producer_transport: true,
                consumers: 1,
                consumer_transport: true,
            }
        );
        assert!(a_producer.closed());
        assert!(b_consumes_a.closed());
        assert!(a_consumes_b.closed());
        assert!(room.get_producer_transport(a).await.is_none());
        assert!(room.get_consumer_transport(a).await.is_none());
        assert!(room.get_consumer(b, a).await.is_none());

        // b keeps its own resources
        assert!(room.get_producer(b).await.is_some());
        assert!(room.get_consumer_transport(b).await.is_some());

        assert_eq!(room.remove_participant(a).await, ParticipantTeardown::default());
    }

    #[tokio::test]
    async fn test_add_consumer_of_replaced_producer_is_rejected() {
        let room = Room::new("lobby", None, test_router());
        let (owner, viewer) = (Uuid::new_v4(), Uuid::new_v4());
        let (first, _) = publish_and_subscribe(&room, owner, viewer).await;

        // Created against the first producer, registered after it was replaced
        let recv = room.get_consumer_transport(viewer).await.unwrap();
        let stale = recv
            .consume(first.id(), room.router().rtp_capabilities(), false)
            .await
            .unwrap();
        let send = room.get_producer_transport(owner).await.unwrap();
        let second = send.produce(MediaKind::Audio, opus()).await.unwrap();
        room.add_producer(owner, second).await;

        assert!(!room.add_consumer(viewer, owner, stale.clone()).await);
        assert!(stale.closed());
        assert!(room.get_consumer(viewer, owner).await.is_none());

        // Same for a producer that is gone entirely
        let open = recv
            .consume(room.get_producer(owner).await.unwrap().id(), room.router().rtp_capabilities(), false)
            .await
            .unwrap();
        room.remove_producer(owner).await;
        assert!(!room.add_consumer(viewer, owner, open.clone()).await);
        assert!(open.closed());
        assert!(room.get_consumer_set(viewer).await.is_empty());
    }
}
