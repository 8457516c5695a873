//! Region identity and region-local coordinates.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Width and depth of every region in world units.
pub const REGION_SIZE: u32 = 256;

/// Globally unique identifier for one region tile.
///
/// The handle packs the region's world coordinates (in world units, not
/// grid units) into a single `u64`, so two processes that agree on grid
/// placement derive identical handles without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionHandle(u64);

impl RegionHandle {
    /// Build a handle from grid coordinates.
    #[must_use]
    pub fn from_location(x: u32, y: u32) -> Self {
        let wx = u64::from(x) * u64::from(REGION_SIZE);
        let wy = u64::from(y) * u64::from(REGION_SIZE);
        Self((wx << 32) | wy)
    }

    /// Grid coordinates this handle was built from.
    #[must_use]
    pub fn location(self) -> (u32, u32) {
        let x = (self.0 >> 32) as u32 / REGION_SIZE;
        let y = (self.0 & 0xffff_ffff) as u32 / REGION_SIZE;
        (x, y)
    }

    /// Raw packed value, for wire formats and URLs.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, y) = self.location();
        write!(f, "{}/{}", x, y)
    }
}

/// Everything a peer needs to know to reach a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    /// Grid x coordinate.
    pub loc_x: u32,
    /// Grid y coordinate.
    pub loc_y: u32,
    /// UDP endpoint the viewer connects to.
    pub endpoint: SocketAddr,
    /// Base URI of the region's public HTTP server (viewer-wait endpoint,
    /// capability seeds).
    pub http_uri: String,
}

impl RegionInfo {
    #[must_use]
    pub fn handle(&self) -> RegionHandle {
        RegionHandle::from_location(self.loc_x, self.loc_y)
    }
}

/// A position expressed in region-local world units.
///
/// Coordinates outside `[0, REGION_SIZE)` on either horizontal axis mean
/// the position falls in a neighboring region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalPosition {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl LocalPosition {
    #[must_use]
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Whether the horizontal coordinates fall inside the owning region.
    #[must_use]
    pub fn is_inside_region(&self) -> bool {
        let max = REGION_SIZE as f32;
        self.x >= 0.0 && self.x < max && self.y >= 0.0 && self.y < max
    }

    /// Snap the horizontal coordinates back inside the region.
    ///
    /// Used to restore a sane position after a refused or failed crossing.
    #[must_use]
    pub fn clamped_to_region(&self) -> Self {
        let max = (REGION_SIZE - 1) as f32;
        Self {
            x: self.x.clamp(0.0, max),
            y: self.y.clamp(0.0, max),
            z: self.z,
        }
    }

    /// Grid coordinates of the region this position actually falls in,
    /// given the grid location of the region it is relative to.
    ///
    /// Returns `None` when the offset would walk off the west or south
    /// edge of the grid.
    #[must_use]
    pub fn destination_location(&self, loc_x: u32, loc_y: u32) -> Option<(u32, u32)> {
        let size = REGION_SIZE as f32;
        let dx = (self.x / size).floor() as i64;
        let dy = (self.y / size).floor() as i64;

        let x = i64::from(loc_x) + dx;
        let y = i64::from(loc_y) + dy;
        if x < 0 || y < 0 {
            return None;
        }

        Some((x as u32, y as u32))
    }
}
