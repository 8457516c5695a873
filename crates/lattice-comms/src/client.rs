//! Routing pushes to the locally connected viewer.

use std::net::SocketAddr;

use lattice_grid::RegionHandle;
use uuid::Uuid;

/// The event queue of the viewer's client stack.
///
/// Both pushes return `false` when the message could not be enqueued
/// (client disconnecting, queue torn down); callers treat that as a
/// signalling failure and unwind.
pub trait ClientEventQueue: Send + Sync + 'static {
    /// Tell the viewer a new simulator is available at `endpoint`.
    fn enable_simulator(&self, handle: RegionHandle, endpoint: SocketAddr, avatar_id: Uuid)
    -> bool;

    /// Tell the viewer which capability seed to use for the new
    /// simulator.
    fn establish_agent_communication(
        &self,
        avatar_id: Uuid,
        endpoint: SocketAddr,
        caps_seed: &str,
    ) -> bool;
}
