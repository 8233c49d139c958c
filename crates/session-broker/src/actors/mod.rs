//! Actor model implementation.
//!
//! One `BrokerActor` per process supervises one `RoomActor` per active
//! room. All inter-actor communication is typed message passing; handles
//! wrap an mpsc sender plus a cancellation token.

pub mod broker;
pub mod messages;
pub mod room;

pub use broker::BrokerActorHandle;
pub use messages::{
    BrokerStatus, JoinOutcome, PeerIdentity, RoomPeerState, RoomState, TransportPair,
};
pub use room::RoomActorHandle;
