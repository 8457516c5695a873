//! Live view of the regions surrounding this one.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::{LocalPosition, RegionHandle, RegionInfo, VisibilityRect};

/// What happened to a neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborChangeKind {
    /// The neighbor came up or was newly registered with the grid.
    Up,
    /// The neighbor declared itself down or stopped answering pings.
    Down,
}

/// A neighbor state transition, broadcast to topology subscribers.
#[derive(Debug, Clone)]
pub struct NeighborChange {
    pub kind: NeighborChangeKind,
    pub region: RegionInfo,
}

/// A live subscription to neighbor state changes.
///
/// Dropping the subscription detaches it; each avatar session holds
/// exactly one while it is the root presence here.
pub struct TopologySubscription {
    receiver: broadcast::Receiver<NeighborChange>,
}

impl TopologySubscription {
    /// Wait for the next neighbor change.
    ///
    /// Returns `None` when the topology itself has shut down or this
    /// subscriber fell too far behind and missed messages; a lagging
    /// subscriber must do a full resync anyway, which the caller's next
    /// change-driven resync accomplishes.
    pub async fn changed(&mut self) -> Option<NeighborChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Registry of the regions reachable from this one.
///
/// The map is only ever touched under its own lock, never across an
/// `.await`. Queries hand out cloned snapshots.
pub struct NeighborTopology {
    local: RegionInfo,
    known: Mutex<HashMap<RegionHandle, RegionInfo>>,
    changes: broadcast::Sender<NeighborChange>,
}

impl NeighborTopology {
    #[must_use]
    pub fn new(local: RegionInfo) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            local,
            known: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// The region this topology is centered on.
    #[must_use]
    pub fn local_region(&self) -> &RegionInfo {
        &self.local
    }

    /// Record a neighbor as up and notify subscribers.
    ///
    /// The local region never registers itself.
    pub fn neighbor_up(&self, region: RegionInfo) {
        if region.handle() == self.local.handle() {
            return;
        }

        info!(neighbor = %region.handle(), "neighbor up");
        self.known.lock().insert(region.handle(), region.clone());
        let _ = self.changes.send(NeighborChange {
            kind: NeighborChangeKind::Up,
            region,
        });
    }

    /// Record a neighbor as down and notify subscribers.
    pub fn neighbor_down(&self, handle: RegionHandle) {
        let removed = self.known.lock().remove(&handle);
        if let Some(region) = removed {
            info!(neighbor = %handle, "neighbor down");
            let _ = self.changes.send(NeighborChange {
                kind: NeighborChangeKind::Down,
                region,
            });
        }
    }

    /// Point-in-time snapshot of the known neighbors visible at the given
    /// draw distance and range.
    #[must_use]
    pub fn neighbors_within(&self, draw_distance: u32, max_range: u32) -> Vec<RegionInfo> {
        let rect = VisibilityRect::from_draw_distance(
            draw_distance,
            max_range,
            self.local.loc_x,
            self.local.loc_y,
        );

        self.known
            .lock()
            .values()
            .filter(|r| rect.contains(r.loc_x, r.loc_y))
            .cloned()
            .collect()
    }

    /// Look up a known neighbor by handle.
    #[must_use]
    pub fn get(&self, handle: RegionHandle) -> Option<RegionInfo> {
        self.known.lock().get(&handle).cloned()
    }

    /// The known region a region-local position actually falls in, for
    /// positions outside the local bounds.
    ///
    /// Returns `None` if the position maps to an unknown region or walks
    /// off the grid entirely.
    #[must_use]
    pub fn neighbor_at(&self, position: &LocalPosition) -> Option<RegionInfo> {
        let (x, y) = position.destination_location(self.local.loc_x, self.local.loc_y)?;
        self.get(RegionHandle::from_location(x, y))
    }

    /// Subscribe to neighbor up/down changes.
    #[must_use]
    pub fn subscribe(&self) -> TopologySubscription {
        TopologySubscription {
            receiver: self.changes.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use pretty_assertions::assert_eq;

    use super::*;

    fn region(x: u32, y: u32) -> RegionInfo {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        RegionInfo {
            loc_x: x,
            loc_y: y,
            endpoint: addr,
            http_uri: format!("http://127.0.0.1:90{:02}", x % 100),
        }
    }

    #[test]
    fn test_neighbor_up_down_tracks_membership() {
        let topo = NeighborTopology::new(region(1000, 1000));
        let east = region(1001, 1000);

        topo.neighbor_up(east.clone());
        assert_eq!(topo.neighbors_within(256, 0), vec![east.clone()]);

        topo.neighbor_down(east.handle());
        assert!(topo.neighbors_within(256, 0).is_empty());
    }

    #[test]
    fn test_local_region_is_never_a_neighbor() {
        let topo = NeighborTopology::new(region(1000, 1000));
        topo.neighbor_up(region(1000, 1000));
        assert!(topo.neighbors_within(256, 0).is_empty());
    }

    #[test]
    fn test_far_region_outside_draw_distance() {
        let topo = NeighborTopology::new(region(1000, 1000));
        topo.neighbor_up(region(997, 1000));

        assert!(topo.neighbors_within(256, 0).is_empty());
        assert_eq!(topo.neighbors_within(1024, 0).len(), 1);
    }

    #[test]
    fn test_neighbor_at_position() {
        let topo = NeighborTopology::new(region(1000, 1000));
        let east = region(1001, 1000);
        topo.neighbor_up(east.clone());

        let crossing = LocalPosition::new(260.0, 10.0, 21.0);
        assert_eq!(topo.neighbor_at(&crossing), Some(east));

        let west = LocalPosition::new(-5.0, 10.0, 21.0);
        assert_eq!(topo.neighbor_at(&west), None);
    }

    #[tokio::test]
    async fn test_subscription_sees_changes() {
        let topo = NeighborTopology::new(region(1000, 1000));
        let mut sub = topo.subscribe();

        topo.neighbor_up(region(1001, 1000));
        let change = sub.changed().await.unwrap();
        assert_eq!(change.kind, NeighborChangeKind::Up);
        assert_eq!(change.region.loc_x, 1001);
    }
}
