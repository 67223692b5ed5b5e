//! In-process media engine
//!
//! Implements the engine traits without a separate worker process. It owns the
//! control-plane side of a router: id and ICE credential allocation, RTC port
//! bookkeeping, DTLS role resolution, codec validation and the close cascade
//! transport -> producer -> consumer. Packet forwarding is not performed here.

use super::{
    ortc, Consumer, EngineError, Producer, Router, WebRtcTransport, WebRtcTransportOptions,
};
use async_trait::async_trait;
use confer_protocol::{
    ConsumerId, ConsumerType, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate,
    IceParameters, MediaKind, ProducerId, Protocol, RtpCapabilities, RtpCodecCapability,
    RtpParameters, TransportId,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};
use uuid::Uuid;
use webrtc::dtls::crypto::Certificate;
use webrtc::peer_connection::certificate::RTCCertificate;

const UDP_PRIORITY: u32 = 1_076_302_079;
const TCP_PRIORITY: u32 = 1_076_276_479;
const CERTIFICATE_LIFETIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Fingerprints of a fresh self-signed DTLS certificate, shared by every
/// transport of a worker
fn generate_fingerprints() -> Result<Vec<DtlsFingerprint>, EngineError> {
    let certificate = Certificate::generate_self_signed(vec!["confer".to_string()])
        .map_err(|e| EngineError::Worker(format!("failed to generate DTLS certificate: {}", e)))?;
    let certificate = RTCCertificate::from_existing(certificate, SystemTime::now() + CERTIFICATE_LIFETIME);

    Ok(certificate
        .get_fingerprints()
        .into_iter()
        .map(|f| DtlsFingerprint {
            algorithm: f.algorithm,
            value: f.value.to_uppercase(),
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

struct PortPool {
    min: u16,
    max: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    fn allocate(&self) -> Result<u16, EngineError> {
        let mut in_use = lock(&self.in_use);
        let span = u32::from(self.max - self.min) + 1;
        let start = rand::thread_rng().gen_range(0..span);

        for offset in 0..span {
            let port = self.min + ((start + offset) % span) as u16;
            if in_use.insert(port) {
                return Ok(port);
            }
        }

        Err(EngineError::PortsExhausted(self.min, self.max))
    }

    fn release(&self, ports: &[u16]) {
        let mut in_use = lock(&self.in_use);
        for port in ports {
            in_use.remove(port);
        }
    }
}

/// Owner of the RTC port range; routers are created from it
pub struct LocalWorker {
    id: Uuid,
    ports: Arc<PortPool>,
    fingerprints: Vec<DtlsFingerprint>,
}

impl LocalWorker {
    pub fn new(settings: &WorkerSettings) -> Result<Self, EngineError> {
        if settings.rtc_min_port == 0 || settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::Worker(format!(
                "invalid RTC port range {}-{}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let worker = Self {
            id: Uuid::new_v4(),
            ports: Arc::new(PortPool {
                min: settings.rtc_min_port,
                max: settings.rtc_max_port,
                in_use: Mutex::new(BTreeSet::new()),
            }),
            fingerprints: generate_fingerprints()?,
        };

        tracing::info!(
            "Started local media worker {} (RTC ports {}-{})",
            worker.id,
            settings.rtc_min_port,
            settings.rtc_max_port
        );

        Ok(worker)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fingerprints of the worker's DTLS certificate
    pub fn fingerprints(&self) -> &[DtlsFingerprint] {
        &self.fingerprints
    }

    pub fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<LocalRouter>, EngineError> {
        let rtp_capabilities = ortc::generate_router_rtp_capabilities(media_codecs)?;
        let router = LocalRouter {
            id: Uuid::new_v4(),
            shared: Arc::new(RouterShared {
                rtp_capabilities,
                ports: self.ports.clone(),
                fingerprints: self.fingerprints.clone(),
                producers: Mutex::new(HashMap::new()),
            }),
        };

        tracing::info!(
            "Created router {} with {} media codecs",
            router.id,
            router.shared.rtp_capabilities.codecs.len()
        );

        Ok(Arc::new(router))
    }
}

struct RouterShared {
    rtp_capabilities: RtpCapabilities,
    ports: Arc<PortPool>,
    fingerprints: Vec<DtlsFingerprint>,
    producers: Mutex<HashMap<ProducerId, Weak<LocalProducer>>>,
}

impl RouterShared {
    fn producer(&self, producer_id: ProducerId) -> Option<Arc<LocalProducer>> {
        lock(&self.producers)
            .get(&producer_id)
            .and_then(Weak::upgrade)
            .filter(|p| !p.closed())
    }
}

pub struct LocalRouter {
    id: Uuid,
    shared: Arc<RouterShared>,
}

impl LocalRouter {
    fn build_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<LocalTransport>, EngineError> {
        if options.listen_ips.is_empty() {
            return Err(EngineError::Worker("no listen IPs given".to_string()));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::Worker(
                "at least one of UDP or TCP must be enabled".to_string(),
            ));
        }

        let mut protocols = Vec::with_capacity(2);
        if options.enable_udp {
            protocols.push(Protocol::Udp);
        }
        if options.enable_tcp {
            protocols.push(Protocol::Tcp);
        }
        if !options.prefer_udp {
            protocols.reverse();
        }

        let mut ports = Vec::new();
        let mut ice_candidates = Vec::new();

        for (index, listen_ip) in options.listen_ips.iter().enumerate() {
            let ip = listen_ip
                .announced_ip
                .clone()
                .unwrap_or_else(|| listen_ip.ip.to_string());

            for protocol in &protocols {
                let port = match self.shared.ports.allocate() {
                    Ok(port) => port,
                    Err(e) => {
                        self.shared.ports.release(&ports);
                        return Err(e);
                    }
                };
                ports.push(port);

                let (foundation, base, tcp_type) = match protocol {
                    Protocol::Udp => ("udpcandidate", UDP_PRIORITY, None),
                    Protocol::Tcp => ("tcpcandidate", TCP_PRIORITY, Some("passive".to_string())),
                };
                let preference_penalty = if options.prefer_udp == (*protocol == Protocol::Udp) {
                    0
                } else {
                    100_000
                };

                ice_candidates.push(IceCandidate {
                    foundation: foundation.to_string(),
                    priority: base - preference_penalty - index as u32,
                    ip: ip.clone(),
                    protocol: *protocol,
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type,
                });
            }
        }

        let transport = LocalTransport {
            id: Uuid::new_v4(),
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates,
            fingerprints: self.shared.fingerprints.clone(),
            dtls_role: Mutex::new(DtlsRole::Auto),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            available_outgoing_bitrate: options.initial_available_outgoing_bitrate,
            max_incoming_bitrate: AtomicU32::new(0),
            next_mid: AtomicU32::new(0),
            ports,
            router: self.shared.clone(),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        };

        tracing::debug!(
            "Router {} created transport {} with {} ICE candidates (outgoing bitrate {})",
            self.id,
            transport.id,
            transport.ice_candidates.len(),
            transport.available_outgoing_bitrate
        );

        Ok(Arc::new(transport))
    }
}

#[async_trait]
impl Router for LocalRouter {
    fn id(&self) -> Uuid {
        self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.shared.rtp_capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>, EngineError> {
        let transport: Arc<dyn WebRtcTransport> = self.build_transport(options)?;
        Ok(transport)
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        match self.shared.producer(producer_id) {
            Some(producer) => ortc::can_consume(&producer.rtp_parameters, rtp_capabilities),
            None => {
                tracing::warn!("can_consume: producer {} not found", producer_id);
                false
            }
        }
    }
}

pub struct LocalTransport {
    id: TransportId,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    fingerprints: Vec<DtlsFingerprint>,
    dtls_role: Mutex<DtlsRole>,
    connected: AtomicBool,
    closed: AtomicBool,
    available_outgoing_bitrate: u32,
    max_incoming_bitrate: AtomicU32,
    next_mid: AtomicU32,
    ports: Vec<u16>,
    router: Arc<RouterShared>,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
}

impl LocalTransport {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::TransportClosed(self.id));
        }
        Ok(())
    }
}

#[async_trait]
impl WebRtcTransport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        DtlsParameters {
            role: *lock(&self.dtls_role),
            fingerprints: self.fingerprints.clone(),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        self.ensure_open()?;

        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidDtlsParameters(
                "no fingerprints given".to_string(),
            ));
        }

        if self
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyConnected(self.id));
        }

        let local_role = match dtls_parameters.role {
            DtlsRole::Client => DtlsRole::Server,
            DtlsRole::Server | DtlsRole::Auto => DtlsRole::Client,
        };
        *lock(&self.dtls_role) = local_role;

        tracing::debug!("Transport {} connected as DTLS {:?}", self.id, local_role);
        Ok(())
    }

    fn max_incoming_bitrate(&self) -> Option<u32> {
        match self.max_incoming_bitrate.load(Ordering::SeqCst) {
            0 => None,
            bitrate => Some(bitrate),
        }
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.max_incoming_bitrate.store(bitrate, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError> {
        self.ensure_open()?;
        ortc::validate_rtp_parameters(kind, &rtp_parameters, &self.router.rtp_capabilities)?;

        let producer = Arc::new(LocalProducer {
            id: Uuid::new_v4(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            router: Arc::downgrade(&self.router),
        });

        lock(&self.router.producers).insert(producer.id, Arc::downgrade(&producer));
        {
            let mut producers = lock(&self.producers);
            producers.retain(|p| !p.closed());
            producers.push(producer.clone());
        }

        tracing::debug!(
            "Transport {} created {} producer {}",
            self.id,
            kind,
            producer.id
        );

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>, EngineError> {
        self.ensure_open()?;

        let producer = self
            .router
            .producer(producer_id)
            .ok_or(EngineError::ProducerNotFound(producer_id))?;

        if !ortc::can_consume(&producer.rtp_parameters, &rtp_capabilities) {
            return Err(EngineError::CannotConsume(producer_id));
        }

        let ssrc = rand::thread_rng().gen_range(100_000_000..900_000_000);
        let mut rtp_parameters = ortc::consumer_rtp_parameters(
            &producer.rtp_parameters,
            &self.router.rtp_capabilities,
            &rtp_capabilities,
            ssrc,
        )?;
        rtp_parameters.mid = Some(self.next_mid.fetch_add(1, Ordering::SeqCst).to_string());

        let encodings = &producer.rtp_parameters.encodings;
        let consumer_type = if encodings.len() > 1 {
            ConsumerType::Simulcast
        } else if encodings.iter().any(|e| e.scalability_mode.is_some()) {
            ConsumerType::Svc
        } else {
            ConsumerType::Simple
        };

        let consumer = Arc::new(LocalConsumer {
            id: Uuid::new_v4(),
            producer_id,
            kind: producer.kind,
            rtp_parameters,
            consumer_type,
            paused: AtomicBool::new(paused),
            producer_paused: producer.paused(),
            closed: AtomicBool::new(false),
        });

        if !producer.attach(&consumer) {
            return Err(EngineError::ProducerNotFound(producer_id));
        }
        {
            let mut consumers = lock(&self.consumers);
            consumers.retain(|c| !c.closed());
            consumers.push(consumer.clone());
        }

        tracing::debug!(
            "Transport {} created consumer {} for producer {} (paused: {})",
            self.id,
            consumer.id,
            producer_id,
            paused
        );

        Ok(consumer)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let producers = std::mem::take(&mut *lock(&self.producers));
        let consumers = std::mem::take(&mut *lock(&self.consumers));

        for producer in &producers {
            producer.close_now();
        }
        for consumer in &consumers {
            consumer.close_now();
        }

        self.router.ports.release(&self.ports);

        tracing::debug!(
            "Transport {} closed ({} producers, {} consumers)",
            self.id,
            producers.len(),
            consumers.len()
        );
    }
}

pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    consumers: Mutex<Vec<Weak<LocalConsumer>>>,
    router: Weak<RouterShared>,
}

impl LocalProducer {
    /// Register a consumer of this producer; fails once the producer is closed
    fn attach(&self, consumer: &Arc<LocalConsumer>) -> bool {
        let mut consumers = lock(&self.consumers);
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        consumers.push(Arc::downgrade(consumer));
        true
    }

    fn close_now(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(router) = self.router.upgrade() {
            lock(&router.producers).remove(&self.id);
        }

        let consumers = std::mem::take(&mut *lock(&self.consumers));
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.close_now();
        }

        tracing::debug!("Producer {} closed", self.id);
    }
}

#[async_trait]
impl Producer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.close_now();
    }
}

pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer_type: ConsumerType,
    paused: AtomicBool,
    producer_paused: bool,
    closed: AtomicBool,
}

impl LocalConsumer {
    fn close_now(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Consumer {} closed", self.id);
        }
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> ConsumerType {
        self.consumer_type
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::ConsumerClosed(self.id));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.close_now();
    }
}
