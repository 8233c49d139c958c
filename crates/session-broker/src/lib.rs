//! Huddlecast Session Broker Library
//!
//! This library provides the core functionality for the Huddlecast session
//! broker - a stateful WebSocket signaling server responsible for:
//!
//! - Room and peer lifecycle management
//! - Transport/producer/consumer negotiation against a media engine
//! - The message-driven signaling protocol connecting participants
//! - Idle-room reaping and deterministic resource cleanup
//!
//! # Architecture
//!
//! The broker uses an actor model hierarchy:
//!
//! ```text
//! BrokerActor (singleton per process)
//! ├── owns the room and peer registries
//! ├── runs the idle-room reaper
//! └── supervises N RoomActors
//!     └── RoomActor (one per active room)
//!         └── owns member peers and their media handles
//! ```
//!
//! # Key Design Decisions
//!
//! - **Per-room serialization**: all mutation of a room's membership and of
//!   its members' media handles happens inside that room's actor, so
//!   concurrent signaling from different peers cannot corrupt shared state.
//! - **Capability-typed engine**: the media relay is consumed through the
//!   [`engine`] traits; a loopback implementation keeps the orchestration
//!   core fully exercisable in-process.
//! - **Single cleanup policy**: empty rooms are removed only by the broker's
//!   periodic sweep once they have been empty past the idle threshold.
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation (broker + rooms)
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media engine capability contract, pool and loopback engine
//! - [`errors`] - Error types mapped to wire error kinds
//! - [`server`] - WebSocket endpoint and per-connection message loop

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ids;
pub mod observability;
pub mod server;
