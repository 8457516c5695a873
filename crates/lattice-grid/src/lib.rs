//! Region identity and neighbor topology for the lattice world grid.
//!
//! The world is a sparse 2D grid of square regions, each owned by one
//! server process. This crate defines how regions are identified
//! ([`RegionHandle`]), how region-local positions map onto the grid, which
//! neighbors fall inside an avatar's draw distance ([`VisibilityRect`]),
//! and the live view of reachable neighbors ([`NeighborTopology`]).

mod region;
mod topology;
mod visibility;

pub use region::{LocalPosition, REGION_SIZE, RegionHandle, RegionInfo};
pub use topology::{NeighborChange, NeighborChangeKind, NeighborTopology, TopologySubscription};
pub use visibility::{VisibilityRect, region_units_from_draw_distance};
