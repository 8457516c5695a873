//! A movable entity and its crossing-related state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use lattice_grid::LocalPosition;
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::events::{TransitEvent, TransitEventBus, TransitEventKind};
use crate::flag::TransitFlag;

/// Consecutive crossing failures after which the entity is returned
/// rather than retried.
pub const MAX_FAILURES_BEFORE_RETURN: u32 = 100;

/// Minimum time after arriving here (with riders still expected) before
/// the entity may cross again. Prevents thrashing at a boundary.
pub const MINIMUM_RECROSSING_WAIT: Duration = Duration::from_secs(3);

/// The physics actor backing an entity. Suspended for the duration of a
/// crossing so no further local integration moves the entity.
pub trait PhysicsHandle: Send + Sync {
    fn suspend(&self);
    fn resume(&self);
}

/// A crossing-relevant view of an avatar seated on an entity.
///
/// The entity must not cross while any passenger is still entering this
/// region or still has remote presences establishing.
pub trait SeatedAvatar: Send + Sync {
    fn can_exit_region(&self) -> bool;
    fn has_establishing_presences(&self) -> bool;
}

/// A movable entity (avatar or physical object group) that can be handed
/// off to a neighboring region.
pub struct CrossableEntity {
    id: Uuid,
    position: Mutex<LocalPosition>,
    flag: TransitFlag,
    failures: AtomicU32,
    riders_expected: AtomicU32,
    arrived_at: Mutex<Option<Instant>>,
    needs_full_update: AtomicBool,
    physics: Arc<dyn PhysicsHandle>,
    events: TransitEventBus,
}

impl CrossableEntity {
    #[must_use]
    pub fn new(
        id: Uuid,
        position: LocalPosition,
        physics: Arc<dyn PhysicsHandle>,
        events: TransitEventBus,
    ) -> Self {
        Self {
            id,
            position: Mutex::new(position),
            flag: TransitFlag::new(),
            failures: AtomicU32::new(0),
            riders_expected: AtomicU32::new(0),
            arrived_at: Mutex::new(None),
            needs_full_update: AtomicBool::new(false),
            physics,
            events,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn position(&self) -> LocalPosition {
        *self.position.lock()
    }

    #[must_use]
    pub fn in_transit(&self) -> bool {
        self.flag.in_transit()
    }

    /// Apply a position update. Updates are discarded while the entity is
    /// in transit; the authoritative position is about to live elsewhere.
    pub fn set_position(&self, position: LocalPosition) -> bool {
        if self.flag.in_transit() {
            return false;
        }
        *self.position.lock() = position;
        true
    }

    /// Snap the position back inside the region after a refused or failed
    /// crossing. Bypasses the in-transit rejection: this is the
    /// restoration path itself.
    pub fn force_position_in_region(&self) {
        let mut position = self.position.lock();
        *position = position.clamped_to_region();
    }

    /// Enter transit: suspend physics and notify the scene. Returns false
    /// if a crossing is already in progress (physics stays untouched).
    pub fn start_transit(&self) -> bool {
        if !self.flag.start() {
            return false;
        }

        self.physics.suspend();
        self.events.publish(TransitEvent {
            entity: self.id,
            kind: TransitEventKind::Begin,
        });
        true
    }

    /// Leave transit. Clears the flag exactly once per crossing attempt.
    ///
    /// On failure the physics actor is resumed and a full state broadcast
    /// is flagged, since position corrections made while in transit never
    /// reached clients. On success the caller tears the local copy down.
    pub fn end_transit(&self, success: bool) -> bool {
        if !self.flag.end() {
            return false;
        }

        if !success {
            self.physics.resume();
            self.needs_full_update.store(true, Ordering::Release);
        }

        self.events.publish(TransitEvent {
            entity: self.id,
            kind: TransitEventKind::End { success },
        });
        true
    }

    /// Whether a full state broadcast is owed after a failed crossing.
    /// Reading clears the flag.
    pub fn take_pending_full_update(&self) -> bool {
        self.needs_full_update.swap(false, Ordering::AcqRel)
    }

    // ---- rider arrival accounting ------------------------------------

    /// Record that this entity just arrived from another region with
    /// `riders` seated avatars expected to follow it over.
    pub fn arrived_from_crossing(&self, riders: u32) {
        self.riders_expected.store(riders, Ordering::Release);
        *self.arrived_at.lock() = Some(Instant::now());
    }

    /// A seated avatar arrived from the previous region. Returns the
    /// number still expected.
    pub fn rider_arrived(&self) -> u32 {
        let previous = self.riders_expected.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            warn!(entity = %self.id, "rider arrival with none expected");
            self.riders_expected.store(0, Ordering::Release);
            return 0;
        }
        previous - 1
    }

    #[must_use]
    pub fn riders_expected(&self) -> u32 {
        self.riders_expected.load(Ordering::Acquire)
    }

    /// True while the entity arrived so recently (with riders still
    /// expected) that another crossing would thrash the boundary.
    #[must_use]
    pub fn in_recrossing_cooldown(&self) -> bool {
        if self.riders_expected.load(Ordering::Acquire) == 0 {
            return false;
        }
        self.arrived_at
            .lock()
            .is_some_and(|at| at.elapsed() < MINIMUM_RECROSSING_WAIT)
    }

    // ---- failure accounting ------------------------------------------

    /// Count one more consecutive crossing failure. Returns true when the
    /// threshold is reached and the entity should be administratively
    /// returned instead of retried.
    pub fn record_crossing_failure(&self) -> bool {
        self.failures.fetch_add(1, Ordering::AcqRel) + 1 == MAX_FAILURES_BEFORE_RETURN
    }

    pub fn reset_crossing_failures(&self) {
        self.failures.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::MockPhysics;

    fn entity(physics: &Arc<MockPhysics>) -> CrossableEntity {
        CrossableEntity::new(
            Uuid::new_v4(),
            LocalPosition::new(128.0, 128.0, 21.0),
            Arc::clone(physics) as Arc<dyn PhysicsHandle>,
            TransitEventBus::new(),
        )
    }

    #[test]
    fn test_position_updates_rejected_in_transit() {
        let physics = Arc::new(MockPhysics::default());
        let entity = entity(&physics);

        assert!(entity.start_transit());
        assert!(!entity.set_position(LocalPosition::new(1.0, 1.0, 1.0)));
        assert_eq!(entity.position(), LocalPosition::new(128.0, 128.0, 21.0));

        entity.end_transit(false);
        assert!(entity.set_position(LocalPosition::new(1.0, 1.0, 1.0)));
    }

    #[test]
    fn test_transit_suspends_and_resumes_physics_once() {
        let physics = Arc::new(MockPhysics::default());
        let entity = entity(&physics);

        assert!(entity.start_transit());
        assert!(!entity.start_transit());
        assert_eq!(physics.suspend_count(), 1);

        assert!(entity.end_transit(false));
        assert!(!entity.end_transit(false));
        assert_eq!(physics.resume_count(), 1);
        assert!(entity.take_pending_full_update());
        assert!(!entity.take_pending_full_update());
    }

    #[test]
    fn test_successful_transit_does_not_resume() {
        let physics = Arc::new(MockPhysics::default());
        let entity = entity(&physics);

        entity.start_transit();
        entity.end_transit(true);
        assert_eq!(physics.resume_count(), 0);
        assert!(!entity.take_pending_full_update());
    }

    #[test]
    fn test_force_position_restores_bounds() {
        let physics = Arc::new(MockPhysics::default());
        let entity = entity(&physics);

        entity.set_position(LocalPosition::new(260.0, -3.0, 21.0));
        entity.force_position_in_region();
        assert!(entity.position().is_inside_region());
    }

    #[test]
    fn test_recrossing_cooldown_requires_pending_riders() {
        let physics = Arc::new(MockPhysics::default());
        let entity = entity(&physics);

        assert!(!entity.in_recrossing_cooldown());

        entity.arrived_from_crossing(2);
        assert!(entity.in_recrossing_cooldown());

        entity.rider_arrived();
        assert_eq!(entity.rider_arrived(), 0);
        assert!(!entity.in_recrossing_cooldown());
    }

    #[test]
    fn test_failure_threshold_fires_once() {
        let physics = Arc::new(MockPhysics::default());
        let entity = entity(&physics);

        for _ in 0..MAX_FAILURES_BEFORE_RETURN - 1 {
            assert!(!entity.record_crossing_failure());
        }
        assert!(entity.record_crossing_failure());
        assert!(!entity.record_crossing_failure());

        entity.reset_crossing_failures();
        assert!(!entity.record_crossing_failure());
    }
}
