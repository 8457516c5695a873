//! One avatar's presence on one neighboring region.

use lattice_grid::RegionInfo;
use tokio::sync::watch;

/// How far along a remote presence is.
///
/// There is no "absent" state; absence is the lack of a record in the
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePresenceState {
    /// We are telling the destination region to expect the avatar.
    Establishing,
    /// The destination accepted; waiting for the viewer to connect there.
    AwaitingViewer,
    /// The viewer connected; the presence is fully usable.
    Established,
}

/// Result of one establishment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishOutcome {
    /// The presence is established (or already was).
    Success,
    /// The destination region rejected the create or was unreachable.
    ErrorInformingRegion,
    /// The local client event queue refused one of the routing pushes.
    ClientSignallingFailed,
    /// The viewer never connected to the destination within the bound.
    ClientWaitTimeout,
    /// The record vanished mid-handshake. Indicates the single-flight
    /// invariant was violated somewhere; always logged as an anomaly.
    ConnectionAborted,
}

/// Outcome plus a human-readable detail message for logs.
pub type EstablishResult = (EstablishOutcome, String);

/// Addressing info for a remote presence: where the region is and the
/// capability path token routing the avatar's requests there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePresenceInfo {
    pub region: RegionInfo,
    pub caps_path: String,
}

/// A single (avatar, neighbor region) presence record.
///
/// Lives inside the set's map, only ever touched under the map lock. The
/// attempt id is unique per handshake; stage transitions and removals
/// compare it so a stale handshake can never touch a newer record for
/// the same region.
#[derive(Debug, Clone)]
pub(crate) struct RemotePresence {
    pub info: RemotePresenceInfo,
    pub state: RemotePresenceState,
    pub is_far_presence: bool,
    pub attempt: u64,
    /// Joiners await the establishment result here instead of racing a
    /// second handshake.
    pub result_rx: watch::Receiver<Option<EstablishResult>>,
}

/// Copy-out view of a record, handed to callers so they never iterate
/// under the set's lock.
#[derive(Debug, Clone)]
pub struct PresenceSnapshot {
    pub info: RemotePresenceInfo,
    pub state: RemotePresenceState,
    pub is_far_presence: bool,
}

/// What `drop_presence` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    /// The record was removed and a remote close was issued.
    Dropped,
    /// No record existed for the region.
    NotFound,
    /// The record was kept because it is a near presence and the caller
    /// asked to drop far presences only.
    KeptNearPresence,
}
