//! One connected avatar's server-side session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lattice_comms::{ClientEventQueue, HttpInterregionChannel};
use lattice_grid::{LocalPosition, NeighborTopology, RegionHandle};
use lattice_presence::{AvatarIdentity, RemotePresences};
use lattice_transit::SeatedAvatar;
use tracing::info;
use uuid::Uuid;

/// Event-queue sink for a demo session with no real viewer attached.
/// Logs each push and reports it delivered.
pub struct LoggingEventQueue;

impl ClientEventQueue for LoggingEventQueue {
    fn enable_simulator(
        &self,
        handle: RegionHandle,
        endpoint: SocketAddr,
        avatar_id: Uuid,
    ) -> bool {
        info!(%avatar_id, neighbor = %handle, %endpoint, "EnableSimulator -> viewer");
        true
    }

    fn establish_agent_communication(
        &self,
        avatar_id: Uuid,
        endpoint: SocketAddr,
        caps_seed: &str,
    ) -> bool {
        info!(%avatar_id, %endpoint, caps_seed, "EstablishAgentCommunication -> viewer");
        true
    }
}

/// An avatar rooted on this region: its identity, its remote presence
/// set and the flags the crossing gate consults.
pub struct AvatarSession {
    presences: Arc<RemotePresences<HttpInterregionChannel, LoggingEventQueue>>,
    fully_entered: AtomicBool,
}

impl AvatarSession {
    pub fn new(
        avatar: AvatarIdentity,
        topology: Arc<NeighborTopology>,
        channel: Arc<HttpInterregionChannel>,
        draw_distance: u32,
    ) -> Arc<Self> {
        let presences = RemotePresences::new(
            avatar,
            topology,
            channel,
            Arc::new(LoggingEventQueue),
            draw_distance,
        );
        Arc::new(Self {
            presences,
            fully_entered: AtomicBool::new(false),
        })
    }

    pub fn presences(&self) -> &Arc<RemotePresences<HttpInterregionChannel, LoggingEventQueue>> {
        &self.presences
    }

    /// The avatar became the root presence here: start managing
    /// neighbors and mark it free to leave again.
    pub fn on_became_root(&self, draw_distance: u32, max_range: u32, position: LocalPosition) {
        self.presences.update_position(position);
        self.presences.on_became_root(draw_distance, max_range);
        self.fully_entered.store(true, Ordering::Release);
    }

    /// The avatar was demoted to a child presence (it rooted elsewhere).
    pub fn on_became_child(&self) {
        self.fully_entered.store(false, Ordering::Release);
        self.presences.on_became_child();
    }

    /// Session is over; tear down every neighbor's child agent.
    pub fn logout(&self) {
        self.fully_entered.store(false, Ordering::Release);
        self.presences.terminate_all_neighbors();
        self.presences.stop_managing();
    }
}

impl SeatedAvatar for AvatarSession {
    fn can_exit_region(&self) -> bool {
        self.fully_entered.load(Ordering::Acquire)
    }

    fn has_establishing_presences(&self) -> bool {
        self.presences.has_any_establishing()
    }
}
