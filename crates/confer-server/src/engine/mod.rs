//! Media engine seam
//!
//! The signaling layer never forwards media itself. It drives an engine through
//! the traits below: a router created once at startup hands out WebRTC
//! transports, and transports create producers (outbound tracks) and consumers
//! (inbound tracks). `local` is the bundled in-process engine; `adapter` wraps
//! whichever router is in use with the configured transport options.

mod adapter;
pub mod local;
pub mod ortc;

pub use adapter::MediaEngineAdapter;

use async_trait::async_trait;
use confer_protocol::{
    ConsumerId, ConsumerType, DtlsParameters, IceCandidate, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, TransportId, TransportParams,
};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("transport {0} is closed")]
    TransportClosed(TransportId),

    #[error("transport {0} is already connected")]
    AlreadyConnected(TransportId),

    #[error("invalid DTLS parameters: {0}")]
    InvalidDtlsParameters(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("invalid RTP parameters: {0}")]
    InvalidRtpParameters(String),

    #[error("producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("cannot consume producer {0} with the given RTP capabilities")]
    CannotConsume(ProducerId),

    #[error("consumer {0} is closed")]
    ConsumerClosed(ConsumerId),

    #[error("no free RTC port between {0} and {1}")]
    PortsExhausted(u16, u16),

    #[error("worker error: {0}")]
    Worker(String),
}

/// Local address a transport listens on, with an optional public address
/// advertised in ICE candidates instead
#[derive(Debug, Clone)]
pub struct ListenIp {
    pub ip: IpAddr,
    pub announced_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> Uuid;

    /// Static capability descriptor, identical for every room sharing the router
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>, EngineError>;

    /// Whether an endpoint with `rtp_capabilities` can receive the producer
    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;
}

#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> TransportId;
    fn ice_parameters(&self) -> IceParameters;
    fn ice_candidates(&self) -> Vec<IceCandidate>;
    fn dtls_parameters(&self) -> DtlsParameters;
    fn is_connected(&self) -> bool;
    fn closed(&self) -> bool;

    /// Connection parameters handed to the client
    fn params(&self) -> TransportParams {
        TransportParams {
            id: self.id(),
            ice_parameters: self.ice_parameters(),
            ice_candidates: self.ice_candidates(),
            dtls_parameters: self.dtls_parameters(),
        }
    }

    /// Complete the DTLS handshake with the remote fingerprints
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    /// Inbound bitrate cap, if one was set
    fn max_incoming_bitrate(&self) -> Option<u32>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError>;

    /// Close the transport together with every producer and consumer on it
    async fn close(&self);
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn paused(&self) -> bool;
    fn closed(&self) -> bool;

    /// Close the producer; its consumers are closed with it
    async fn close(&self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn consumer_type(&self) -> ConsumerType;
    fn paused(&self) -> bool;
    fn producer_paused(&self) -> bool;
    fn closed(&self) -> bool;

    /// Un-pause; resuming an active consumer is a no-op
    async fn resume(&self) -> Result<(), EngineError>;

    async fn close(&self);
}
