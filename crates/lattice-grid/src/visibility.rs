//! Draw-distance to region-rectangle math.

use crate::REGION_SIZE;

/// Smallest draw distance we will compute visibility for. Viewers
/// sometimes report 0 while still loading.
const MIN_DRAW_DISTANCE: u32 = 64;

/// Largest draw distance the rectangle math will honor.
const MAX_DRAW_DISTANCE: u32 = 1024;

/// Number of region units a given draw distance can see into.
#[must_use]
pub fn region_units_from_draw_distance(draw_distance: u32) -> u32 {
    draw_distance.div_ceil(REGION_SIZE)
}

/// Inclusive rectangle of grid locations visible from a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityRect {
    pub x_min: u32,
    pub x_max: u32,
    pub y_min: u32,
    pub y_max: u32,
}

impl VisibilityRect {
    /// Rectangle of grid locations within `draw_distance` of the region at
    /// (`loc_x`, `loc_y`), clamped to `max_range` regions per axis when
    /// `max_range` is nonzero.
    #[must_use]
    pub fn from_draw_distance(draw_distance: u32, max_range: u32, loc_x: u32, loc_y: u32) -> Self {
        let dd = draw_distance.clamp(MIN_DRAW_DISTANCE, MAX_DRAW_DISTANCE);
        let units = region_units_from_draw_distance(dd);

        let mut rect = Self {
            x_min: loc_x.saturating_sub(units),
            x_max: loc_x + units,
            y_min: loc_y.saturating_sub(units),
            y_max: loc_y + units,
        };

        if max_range > 0 {
            if loc_x - rect.x_min > max_range {
                rect.x_min = loc_x - max_range;
            }
            if loc_y - rect.y_min > max_range {
                rect.y_min = loc_y - max_range;
            }
            if rect.x_max - loc_x > max_range {
                rect.x_max = loc_x + max_range;
            }
            if rect.y_max - loc_y > max_range {
                rect.y_max = loc_y + max_range;
            }
        }

        rect
    }

    /// Whether a grid location falls inside this rectangle (edges
    /// inclusive).
    #[must_use]
    pub fn contains(&self, loc_x: u32, loc_y: u32) -> bool {
        loc_x >= self.x_min && loc_x <= self.x_max && loc_y >= self.y_min && loc_y <= self.y_max
    }
}
