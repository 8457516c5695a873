//! The outbound contract to peer region processes.

use std::future::Future;

use lattice_grid::{LocalPosition, RegionHandle, RegionInfo};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Failure talking to a peer region.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer answered and said no.
    #[error("peer rejected the request: {0}")]
    Rejected(String),

    /// The peer never answered within the deadline.
    #[error("request to peer timed out")]
    Timeout,

    /// Transport-level failure (connect, read, write).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer answered with something we could not parse.
    #[error("malformed peer response: {0}")]
    MalformedResponse(String),
}

/// Everything a destination region needs to set up a child presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub avatar_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    /// Capability path token routing this avatar's requests on the
    /// destination. Freshly generated per establishment attempt.
    pub caps_path: String,
    /// Child presences always spawn at a fixed placeholder position.
    pub start_position: LocalPosition,
    /// True for child (non-authoritative) presences.
    pub child: bool,
}

/// Position and view state pushed to neighbors holding a child presence,
/// so they can cull and prioritize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildAgentUpdate {
    pub avatar_id: Uuid,
    pub position: LocalPosition,
    pub draw_distance: u32,
}

/// Outbound calls to a peer region process.
///
/// All async methods suspend only for network I/O; implementations must
/// bound every wait internally. Errors are returned, never panicked, and
/// callers translate them into their own outcome taxonomies.
pub trait InterregionChannel: Send + Sync + 'static {
    /// Ask `region` to create a child presence for `agent`.
    fn create_remote_child(
        &self,
        region: &RegionInfo,
        agent: &AgentDescriptor,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Ask the region holding a child presence for `avatar_id` to tear it
    /// down. Best-effort.
    fn close_remote_child(
        &self,
        region: &RegionInfo,
        avatar_id: Uuid,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Blocking variant of [`Self::close_remote_child`], for teardown
    /// paths with no async context (session logout).
    fn close_remote_child_blocking(&self, region: &RegionInfo, avatar_id: Uuid);

    /// Push serialized entity state to `destination` and wait for it to
    /// acknowledge ownership.
    fn transfer_entity(
        &self,
        destination: &RegionInfo,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Bounded wait for the viewer to show up at `region`.
    ///
    /// Resolves `Ok(())` once the destination reports the viewer
    /// connected there, `Err` on timeout or transport failure. The
    /// ceiling must be strictly longer than the peer's own internal wait
    /// so the peer's timeout fires first in the common case.
    fn wait_for_viewer_connection(
        &self,
        region: &RegionInfo,
        avatar_id: Uuid,
        handle: RegionHandle,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Push a child position/view update to a neighbor. Best-effort.
    fn send_child_update(
        &self,
        region: &RegionInfo,
        update: &ChildAgentUpdate,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;
}
