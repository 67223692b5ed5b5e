use crate::engine::{ortc, ListenIp, MediaEngineAdapter};
use crate::session::SessionRegistry;
use crate::signaling::SignalingServer;
use crate::ws::connections::ConnectionManager;
use anyhow::anyhow;
use confer_protocol::RtpCodecCapability;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    /// Room created at startup, before any client joins
    pub default_room: String,
    pub media: MediaSettings,
}

#[derive(Clone, Debug)]
pub struct MediaSettings {
    pub listen_ips: Vec<ListenIp>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: IpAddr::from([127, 0, 0, 1]),
                announced_ip: None,
            }],
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: Some(1_500_000),
            media_codecs: ortc::default_media_codecs(),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid value for {}: {} ({})", key, raw, e)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // Load from environment variables (a .env file is read by main)
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let default_room =
            std::env::var("DEFAULT_ROOM").unwrap_or_else(|_| "defaultRoom".to_string());

        let defaults = MediaSettings::default();

        let listen_ip: IpAddr = env_or("MEDIA_LISTEN_IP", defaults.listen_ips[0].ip)?;
        let announced_ip = std::env::var("MEDIA_ANNOUNCED_IP").ok().filter(|s| !s.is_empty());
        if announced_ip.is_none() && listen_ip.is_unspecified() {
            tracing::warn!(
                "MEDIA_LISTEN_IP is {} but MEDIA_ANNOUNCED_IP is not set; clients will get an unusable candidate",
                listen_ip
            );
        }

        let max_incoming_bitrate: u32 = env_or("MAX_INCOMING_BITRATE", 1_500_000)?;

        let media = MediaSettings {
            listen_ips: vec![ListenIp {
                ip: listen_ip,
                announced_ip,
            }],
            rtc_min_port: env_or("RTC_MIN_PORT", defaults.rtc_min_port)?,
            rtc_max_port: env_or("RTC_MAX_PORT", defaults.rtc_max_port)?,
            enable_udp: env_or("ENABLE_UDP", defaults.enable_udp)?,
            enable_tcp: env_or("ENABLE_TCP", defaults.enable_tcp)?,
            prefer_udp: env_or("PREFER_UDP", defaults.prefer_udp)?,
            initial_available_outgoing_bitrate: env_or(
                "INITIAL_OUTGOING_BITRATE",
                defaults.initial_available_outgoing_bitrate,
            )?,
            // 0 disables the cap
            max_incoming_bitrate: Some(max_incoming_bitrate).filter(|b| *b > 0),
            media_codecs: defaults.media_codecs,
        };

        Ok(Config {
            bind_address,
            default_room,
            media,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub signaling: Arc<SignalingServer>,
}

impl AppState {
    pub fn new(config: Config, engine: Arc<MediaEngineAdapter>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let connections = Arc::new(ConnectionManager::new());
        let signaling = Arc::new(SignalingServer::new(
            registry.clone(),
            engine,
            connections.clone(),
        ));

        Self {
            config,
            registry,
            connections,
            signaling,
        }
    }
}
