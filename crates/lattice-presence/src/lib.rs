//! Remote child presence coordination for lattice region processes.
//!
//! While an avatar is the root presence on a region, it also holds
//! lightweight "child" presences on the neighboring regions the viewer
//! can see into, so adjacent territory renders before the avatar ever
//! crosses a boundary. This crate owns that per-avatar presence set: the
//! asynchronous handshake that establishes a presence on one neighbor,
//! and the resync algorithm that reconciles the whole set when topology,
//! draw distance or position changes.

mod avatar;
mod record;
mod set;
pub mod testing;

pub use avatar::AvatarIdentity;
pub use record::{
    DropOutcome, EstablishOutcome, EstablishResult, PresenceSnapshot, RemotePresenceInfo,
    RemotePresenceState,
};
pub use set::RemotePresences;
