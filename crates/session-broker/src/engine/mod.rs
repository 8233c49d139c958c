//! Media engine capability contract.
//!
//! The broker never touches RTP itself: all relay work happens behind these
//! object-safe traits. A router belongs to one room, transports to one peer,
//! and producers/consumers to one transport. Every handle exposes `close()`
//! and `closed()`; `close()` is synchronous and idempotent so teardown can
//! never fail partway through.

use async_trait::async_trait;
use signal_protocol::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters,
    TransportDescriptor,
};
use std::sync::Arc;
use thiserror::Error;

pub mod loopback;
pub mod pool;

pub use pool::EnginePool;

/// Listen configuration the engine uses when allocating transports.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    /// Local address the relay binds.
    pub listen_ip: String,
    /// Address advertised to clients in ICE candidates.
    pub announced_ip: String,
    /// Lower bound of the relay port range.
    pub min_port: u16,
    /// Upper bound of the relay port range.
    pub max_port: u16,
}

/// Errors surfaced by a media engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The handle (or its parent) has been closed.
    #[error("handle is closed")]
    Closed,

    /// The transport has already completed its DTLS handshake.
    #[error("transport already connected")]
    AlreadyConnected,

    /// No producer with the given id exists on this router.
    #[error("unknown producer: {0}")]
    UnknownProducer(String),

    /// The consumer's capabilities cannot decode the producer's encoding.
    #[error("incompatible capabilities for producer {0}")]
    Incompatible(String),

    /// Any other engine-level failure.
    #[error("engine failure: {0}")]
    Failure(String),
}

/// One media engine instance (a relay process shard). Rooms are spread
/// across instances by the [`EnginePool`].
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Index of this instance within the pool, for logging.
    fn worker_index(&self) -> usize;

    /// Create a routing context for one room.
    async fn create_router(
        &self,
        codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn RouterHandle>, EngineError>;
}

/// Per-room routing context.
#[async_trait]
pub trait RouterHandle: Send + Sync {
    fn id(&self) -> &str;

    /// The codec capabilities clients must load to talk to this router.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Allocate a transport for one direction of one peer.
    async fn create_transport(
        &self,
        listen: &ListenConfig,
    ) -> Result<Arc<dyn TransportHandle>, EngineError>;

    /// Whether a peer with the given capabilities can decode the producer.
    fn can_consume(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool;

    fn close(&self);
    fn closed(&self) -> bool;
}

/// A negotiated network path between one peer and the relay.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Connection material the client needs: id, ICE and DTLS parameters.
    fn descriptor(&self) -> TransportDescriptor;

    /// Complete the DTLS handshake with the client's parameters.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    /// Publish an outbound stream on this transport.
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn ProducerHandle>, EngineError>;

    /// Attach an inbound stream sourced from a producer on the same router.
    async fn consume(
        &self,
        producer_id: &str,
        capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn ConsumerHandle>, EngineError>;

    fn close(&self);
    fn closed(&self) -> bool;
}

/// An outbound stream published by a peer.
#[async_trait]
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;

    /// Stop relay delivery without tearing the producer down.
    async fn pause(&self) -> Result<(), EngineError>;

    /// Resume relay delivery.
    async fn resume(&self) -> Result<(), EngineError>;

    fn paused(&self) -> bool;
    fn close(&self);
    fn closed(&self) -> bool;
}

/// An inbound stream delivered to a peer, sourced from one remote producer.
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn producer_id(&self) -> &str;

    /// Parameters the consuming client needs to receive the stream.
    fn rtp_parameters(&self) -> RtpParameters;

    fn close(&self);
    fn closed(&self) -> bool;
}
