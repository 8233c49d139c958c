//! In-process loopback engine.
//!
//! Implements the full engine contract without moving any packets: ids are
//! generated locally, ICE candidates are synthesized from the configured
//! listen range, and consume compatibility is decided by codec mime-type
//! intersection. The broker's orchestration logic, and its tests, run
//! unchanged against this engine; a real relay binding plugs in behind the
//! same traits.

use super::{
    ConsumerHandle, EngineError, ListenConfig, MediaEngine, ProducerHandle, RouterHandle,
    TransportHandle,
};
use crate::ids;
use async_trait::async_trait;
use signal_protocol::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportDescriptor,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// One loopback engine instance.
pub struct LoopbackEngine {
    worker_index: usize,
    /// Port cursor shared by every router this instance creates.
    port_cursor: Arc<AtomicU32>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(worker_index: usize) -> Self {
        Self {
            worker_index,
            port_cursor: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn worker_index(&self) -> usize {
        self.worker_index
    }

    async fn create_router(
        &self,
        codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn RouterHandle>, EngineError> {
        let router = LoopbackRouter {
            id: ids::new_id(),
            shared: Arc::new(RouterShared {
                codecs,
                producers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
            port_cursor: Arc::clone(&self.port_cursor),
        };

        debug!(
            target: "broker.engine",
            worker_index = self.worker_index,
            router_id = %router.id,
            "Router created"
        );

        Ok(Arc::new(router))
    }
}

/// What a router remembers about a live producer.
struct ProducerRecord {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

/// State shared between a router and the handles hanging off it.
struct RouterShared {
    codecs: Vec<RtpCodecCapability>,
    producers: Mutex<HashMap<String, ProducerRecord>>,
    closed: AtomicBool,
}

impl RouterShared {
    fn producer_codecs_supported(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool {
        let Ok(producers) = self.producers.lock() else {
            return false;
        };
        let Some(record) = producers.get(producer_id) else {
            return false;
        };
        record
            .rtp_parameters
            .codecs
            .iter()
            .any(|codec| capabilities.supports_mime_type(&codec.mime_type))
    }
}

struct LoopbackRouter {
    id: String,
    shared: Arc<RouterShared>,
    port_cursor: Arc<AtomicU32>,
}

impl LoopbackRouter {
    fn allocate_port(&self, listen: &ListenConfig) -> u16 {
        let span = u32::from(listen.max_port - listen.min_port) + 1;
        let offset = self.port_cursor.fetch_add(1, Ordering::Relaxed) % span;
        let port = u32::from(listen.min_port) + offset;
        u16::try_from(port).unwrap_or(listen.min_port)
    }
}

fn short_token() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    raw.get(..8).unwrap_or("00000000").to_string()
}

fn fingerprint_value() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    let pairs: Vec<String> = bytes.iter().map(|b| format!("{b:02X}")).collect();
    pairs.join(":")
}

#[async_trait]
impl RouterHandle for LoopbackRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.shared.codecs.clone(),
            header_extensions: vec![],
        }
    }

    async fn create_transport(
        &self,
        listen: &ListenConfig,
    ) -> Result<Arc<dyn TransportHandle>, EngineError> {
        if self.closed() {
            return Err(EngineError::Closed);
        }

        let id = ids::new_id();
        let descriptor = TransportDescriptor {
            id: id.clone(),
            ice_parameters: IceParameters {
                username_fragment: short_token(),
                password: Uuid::new_v4().simple().to_string(),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: listen.announced_ip.clone(),
                protocol: "udp".to_string(),
                port: self.allocate_port(listen),
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: fingerprint_value(),
                }],
            },
        };

        Ok(Arc::new(LoopbackTransport {
            id,
            descriptor,
            shared: Arc::clone(&self.shared),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn can_consume(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool {
        if self.closed() {
            return false;
        }
        self.shared
            .producer_codecs_supported(producer_id, capabilities)
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            if let Ok(mut producers) = self.shared.producers.lock() {
                producers.clear();
            }
            debug!(target: "broker.engine", router_id = %self.id, "Router closed");
        }
    }

    fn closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

struct LoopbackTransport {
    id: String,
    descriptor: TransportDescriptor,
    shared: Arc<RouterShared>,
    connected: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl TransportHandle for LoopbackTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn descriptor(&self) -> TransportDescriptor {
        self.descriptor.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::Closed);
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Failure(
                "DTLS parameters carry no fingerprints".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyConnected);
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn ProducerHandle>, EngineError> {
        if self.closed() || self.shared.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }

        let id = ids::new_id();
        let mut producers = self
            .shared
            .producers
            .lock()
            .map_err(|_| EngineError::Failure("producer registry poisoned".to_string()))?;
        producers.insert(
            id.clone(),
            ProducerRecord {
                kind,
                rtp_parameters,
            },
        );
        drop(producers);

        Ok(Arc::new(LoopbackProducer {
            id,
            kind,
            shared: Arc::clone(&self.shared),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn ConsumerHandle>, EngineError> {
        if self.closed() || self.shared.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }

        let producers = self
            .shared
            .producers
            .lock()
            .map_err(|_| EngineError::Failure("producer registry poisoned".to_string()))?;
        let record = producers
            .get(producer_id)
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.to_string()))?;

        let codecs: Vec<_> = record
            .rtp_parameters
            .codecs
            .iter()
            .filter(|codec| capabilities.supports_mime_type(&codec.mime_type))
            .cloned()
            .collect();
        if codecs.is_empty() {
            return Err(EngineError::Incompatible(producer_id.to_string()));
        }

        let rtp_parameters = RtpParameters {
            mid: None,
            codecs,
            header_extensions: record.rtp_parameters.header_extensions.clone(),
            encodings: record.rtp_parameters.encodings.clone(),
            rtcp: record.rtp_parameters.rtcp.clone(),
        };
        let kind = record.kind;
        drop(producers);

        Ok(Arc::new(LoopbackConsumer {
            id: ids::new_id(),
            kind,
            producer_id: producer_id.to_string(),
            rtp_parameters,
            closed: AtomicBool::new(false),
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    shared: Arc<RouterShared>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerHandle for LoopbackProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::Closed);
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::Closed);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Ok(mut producers) = self.shared.producers.lock() {
                producers.remove(&self.id);
            }
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct LoopbackConsumer {
    id: String,
    kind: MediaKind,
    producer_id: String,
    rtp_parameters: RtpParameters,
    closed: AtomicBool,
}

impl ConsumerHandle for LoopbackConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use signal_protocol::codecs;
    use signal_protocol::RtpCodecParameters;

    fn listen() -> ListenConfig {
        ListenConfig {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: "127.0.0.1".to_string(),
            min_port: 40_000,
            max_port: 40_009,
        }
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90_000,
                channels: None,
                parameters: serde_json::Map::new(),
                rtcp_feedback: vec![],
            }],
            ..RtpParameters::default()
        }
    }

    fn vp8_capabilities() -> RtpCapabilities {
        RtpCapabilities {
            codecs: codecs::minimal(),
            header_extensions: vec![],
        }
    }

    fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: Some(DtlsRole::Client),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "00:11:22".to_string(),
            }],
        }
    }

    async fn router() -> Arc<dyn RouterHandle> {
        LoopbackEngine::new(0)
            .create_router(codecs::balanced())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_router_capabilities_reflect_codec_table() {
        let router = router().await;
        let caps = router.rtp_capabilities();
        assert!(caps.supports_mime_type("video/VP8"));
        assert!(caps.supports_mime_type("audio/opus"));
    }

    #[tokio::test]
    async fn test_transport_descriptor_uses_listen_config() {
        let router = router().await;
        let listen = listen();
        let transport = router.create_transport(&listen).await.unwrap();
        let descriptor = transport.descriptor();

        assert_eq!(descriptor.id, transport.id());
        let candidate = descriptor.ice_candidates.first().unwrap();
        assert_eq!(candidate.ip, "127.0.0.1");
        assert!((40_000..=40_009).contains(&candidate.port));
        assert!(!descriptor.dtls_parameters.fingerprints.is_empty());
    }

    #[tokio::test]
    async fn test_transport_ports_cycle_within_range() {
        let router = router().await;
        let listen = listen();
        for _ in 0..25 {
            let transport = router.create_transport(&listen).await.unwrap();
            let port = transport.descriptor().ice_candidates.first().unwrap().port;
            assert!((listen.min_port..=listen.max_port).contains(&port));
        }
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let router = router().await;
        let transport = router.create_transport(&listen()).await.unwrap();

        transport.connect(client_dtls()).await.unwrap();
        let second = transport.connect(client_dtls()).await;
        assert!(matches!(second, Err(EngineError::AlreadyConnected)));
    }

    #[tokio::test]
    async fn test_connect_requires_fingerprints() {
        let router = router().await;
        let transport = router.create_transport(&listen()).await.unwrap();

        let result = transport
            .connect(DtlsParameters {
                role: Some(DtlsRole::Client),
                fingerprints: vec![],
            })
            .await;
        assert!(matches!(result, Err(EngineError::Failure(_))));
    }

    #[tokio::test]
    async fn test_produce_then_consume_flow() {
        let router = router().await;
        let send = router.create_transport(&listen()).await.unwrap();
        let recv = router.create_transport(&listen()).await.unwrap();

        let producer = send
            .produce(MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        assert!(router.can_consume(producer.id(), &vp8_capabilities()));

        let consumer = recv
            .consume(producer.id(), &vp8_capabilities())
            .await
            .unwrap();
        assert_eq!(consumer.producer_id(), producer.id());
        assert_eq!(consumer.kind(), MediaKind::Video);
        assert_eq!(consumer.rtp_parameters().codecs.len(), 1);
    }

    #[tokio::test]
    async fn test_can_consume_false_for_incompatible_capabilities() {
        let router = router().await;
        let send = router.create_transport(&listen()).await.unwrap();
        let producer = send
            .produce(MediaKind::Video, vp8_parameters())
            .await
            .unwrap();

        let audio_only = RtpCapabilities {
            codecs: codecs::minimal()
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
            header_extensions: vec![],
        };
        assert!(!router.can_consume(producer.id(), &audio_only));

        let recv = router.create_transport(&listen()).await.unwrap();
        let result = recv.consume(producer.id(), &audio_only).await;
        assert!(matches!(result, Err(EngineError::Incompatible(_))));
    }

    #[tokio::test]
    async fn test_closed_producer_leaves_router_registry() {
        let router = router().await;
        let send = router.create_transport(&listen()).await.unwrap();
        let producer = send
            .produce(MediaKind::Video, vp8_parameters())
            .await
            .unwrap();

        producer.close();
        assert!(producer.closed());
        // Close is idempotent.
        producer.close();

        assert!(!router.can_consume(producer.id(), &vp8_capabilities()));
    }

    #[tokio::test]
    async fn test_pause_and_resume_toggle_state() {
        let router = router().await;
        let send = router.create_transport(&listen()).await.unwrap();
        let producer = send
            .produce(MediaKind::Audio, vp8_parameters())
            .await
            .unwrap();

        assert!(!producer.paused());
        producer.pause().await.unwrap();
        assert!(producer.paused());
        producer.resume().await.unwrap();
        assert!(!producer.paused());

        producer.close();
        assert!(matches!(producer.pause().await, Err(EngineError::Closed)));
    }

    #[tokio::test]
    async fn test_closed_router_rejects_new_transports() {
        let router = router().await;
        router.close();
        assert!(router.closed());

        let result = router.create_transport(&listen()).await;
        assert!(matches!(result, Err(EngineError::Closed)));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_produce() {
        let router = router().await;
        let transport = router.create_transport(&listen()).await.unwrap();
        transport.close();

        let result = transport.produce(MediaKind::Video, vp8_parameters()).await;
        assert!(matches!(result, Err(EngineError::Closed)));
    }
}
