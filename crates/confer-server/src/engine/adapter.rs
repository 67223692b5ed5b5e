use super::local::{LocalWorker, WorkerSettings};
use super::{EngineError, Router, WebRtcTransport, WebRtcTransportOptions};
use crate::state::MediaSettings;
use confer_protocol::{ProducerId, RtpCapabilities};
use std::sync::Arc;

/// Thin façade the signaling layer talks to: one router shared by all rooms
/// plus the transport options every new transport is created with
pub struct MediaEngineAdapter {
    router: Arc<dyn Router>,
    transport_options: WebRtcTransportOptions,
    max_incoming_bitrate: Option<u32>,
}

impl MediaEngineAdapter {
    /// Start the bundled in-process worker and create the shared router
    pub fn start(settings: &MediaSettings) -> Result<Self, EngineError> {
        let worker = LocalWorker::new(&WorkerSettings {
            rtc_min_port: settings.rtc_min_port,
            rtc_max_port: settings.rtc_max_port,
        })?;
        let router = worker.create_router(&settings.media_codecs)?;

        Ok(Self::new(router, settings))
    }

    /// Wrap an already created router
    pub fn new(router: Arc<dyn Router>, settings: &MediaSettings) -> Self {
        Self {
            router,
            transport_options: WebRtcTransportOptions {
                listen_ips: settings.listen_ips.clone(),
                enable_udp: settings.enable_udp,
                enable_tcp: settings.enable_tcp,
                prefer_udp: settings.prefer_udp,
                initial_available_outgoing_bitrate: settings.initial_available_outgoing_bitrate,
            },
            max_incoming_bitrate: settings.max_incoming_bitrate,
        }
    }

    pub fn router(&self) -> Arc<dyn Router> {
        self.router.clone()
    }

    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        self.router.rtp_capabilities()
    }

    pub fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.router.can_consume(producer_id, rtp_capabilities)
    }

    pub async fn create_webrtc_transport(&self) -> Result<Arc<dyn WebRtcTransport>, EngineError> {
        let transport = self
            .router
            .create_webrtc_transport(self.transport_options.clone())
            .await?;

        if let Some(bitrate) = self.max_incoming_bitrate {
            // Best effort: the transport is usable without the cap
            if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                tracing::warn!(
                    "Failed to set max incoming bitrate on transport {}: {}",
                    transport.id(),
                    e
                );
            }
        }

        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_uses_configured_options() {
        let settings = MediaSettings {
            rtc_min_port: 46000,
            rtc_max_port: 46010,
            enable_tcp: false,
            ..MediaSettings::default()
        };
        let adapter = MediaEngineAdapter::start(&settings).unwrap();

        let transport = adapter.create_webrtc_transport().await.unwrap();
        let candidates = transport.ice_candidates();

        assert_eq!(candidates.len(), settings.listen_ips.len());
        assert!(candidates.iter().all(|c| (46000..=46010).contains(&c.port)));
        assert_eq!(transport.max_incoming_bitrate(), settings.max_incoming_bitrate);
        assert_eq!(adapter.rtp_capabilities(), adapter.router().rtp_capabilities());
    }

    #[tokio::test]
    async fn test_can_consume_unknown_producer() {
        let adapter = MediaEngineAdapter::start(&MediaSettings::default()).unwrap();

        assert!(!adapter.can_consume(uuid::Uuid::new_v4(), &adapter.rtp_capabilities()));
    }
}
