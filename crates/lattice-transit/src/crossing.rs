//! Driving one entity's hand-off to a neighboring region.

use std::sync::Arc;

use lattice_comms::InterregionChannel;
use lattice_grid::{LocalPosition, NeighborTopology, RegionInfo};
use tracing::{debug, info, warn};

use crate::entity::{CrossableEntity, SeatedAvatar};

/// Why a crossing was not attempted. In every refusal the entity's
/// position has already been snapped back inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingRefusal {
    /// The target coordinates map to no known region. The caller may
    /// treat the entity as having left the world (die-at-edge).
    NoDestination,
    /// A seated avatar has not finished entering this region.
    RiderStillEntering,
    /// A seated avatar still has remote presences establishing; crossing
    /// now would hand off an inconsistent neighbor view.
    RiderPresencesEstablishing,
    /// The entity arrived here too recently with riders still expected.
    RecrossedTooSoon,
    /// Another crossing attempt is already in flight for this entity.
    AlreadyInTransit,
}

/// Result of one crossing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingOutcome {
    /// The destination owns the entity now; the caller must tear down
    /// the local copy.
    Crossed,
    /// Not attempted; see the refusal reason.
    Refused(CrossingRefusal),
    /// Attempted and failed; the entity is back in place with physics
    /// resumed. When `administrative_return` is set the failure count hit
    /// its threshold and the entity should be returned, not retried.
    Failed { administrative_return: bool },
}

/// Gates, executes and unwinds entity crossings for one scene.
pub struct CrossingCoordinator<C: InterregionChannel> {
    topology: Arc<NeighborTopology>,
    channel: Arc<C>,
}

impl<C: InterregionChannel> CrossingCoordinator<C> {
    #[must_use]
    pub fn new(topology: Arc<NeighborTopology>, channel: Arc<C>) -> Self {
        Self { topology, channel }
    }

    /// Attempt to hand `entity` off to the region owning `target`.
    ///
    /// The transfer itself is delegated to the interregion channel; this
    /// routine's job is the entry gate, physics suspension and the
    /// exactly-once end transition.
    pub async fn try_cross(
        &self,
        entity: &CrossableEntity,
        riders: &[Arc<dyn SeatedAvatar>],
        target: LocalPosition,
        payload: &[u8],
    ) -> CrossingOutcome {
        let Some(destination) = self.guard(entity, riders, &target) else {
            return CrossingOutcome::Refused(self.refusal_for(entity, riders, &target));
        };

        if !entity.start_transit() {
            return CrossingOutcome::Refused(CrossingRefusal::AlreadyInTransit);
        }

        debug!(
            entity = %entity.id(),
            destination = %destination.handle(),
            "crossing started"
        );

        let success = match self.channel.transfer_entity(&destination, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    entity = %entity.id(),
                    destination = %destination.handle(),
                    error = %e,
                    "entity transfer failed"
                );
                false
            }
        };

        if success {
            entity.end_transit(true);
            entity.reset_crossing_failures();
            info!(
                entity = %entity.id(),
                destination = %destination.handle(),
                "crossing complete"
            );
            return CrossingOutcome::Crossed;
        }

        // Restore position while the update suppression is still in
        // effect, then clear the flag; end_transit flags the full
        // broadcast that carries the correction to clients.
        entity.force_position_in_region();
        entity.end_transit(false);

        let administrative_return = entity.record_crossing_failure();
        if administrative_return {
            warn!(entity = %entity.id(), "crossing failed too many times, returning entity");
        }
        CrossingOutcome::Failed {
            administrative_return,
        }
    }

    /// All pre-crossing checks. Returns the destination when the crossing
    /// may proceed; on refusal the position has been snapped back.
    fn guard(
        &self,
        entity: &CrossableEntity,
        riders: &[Arc<dyn SeatedAvatar>],
        target: &LocalPosition,
    ) -> Option<RegionInfo> {
        let destination = self.topology.neighbor_at(target);

        let refused = destination.is_none()
            || riders
                .iter()
                .any(|r| !r.can_exit_region() || r.has_establishing_presences())
            || entity.in_recrossing_cooldown();

        if refused {
            entity.force_position_in_region();
            return None;
        }

        destination
    }

    fn refusal_for(
        &self,
        entity: &CrossableEntity,
        riders: &[Arc<dyn SeatedAvatar>],
        target: &LocalPosition,
    ) -> CrossingRefusal {
        if self.topology.neighbor_at(target).is_none() {
            return CrossingRefusal::NoDestination;
        }
        if riders.iter().any(|r| !r.can_exit_region()) {
            return CrossingRefusal::RiderStillEntering;
        }
        if riders.iter().any(|r| r.has_establishing_presences()) {
            return CrossingRefusal::RiderPresencesEstablishing;
        }
        if entity.in_recrossing_cooldown() {
            return CrossingRefusal::RecrossedTooSoon;
        }
        CrossingRefusal::AlreadyInTransit
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lattice_presence::testing::{MockChannel, region_at};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;
    use crate::entity::PhysicsHandle;
    use crate::events::TransitEventBus;
    use crate::testing::{FixedRider, MockPhysics};

    fn setup() -> (
        CrossingCoordinator<MockChannel>,
        Arc<MockChannel>,
        Arc<MockPhysics>,
        CrossableEntity,
    ) {
        let topology = Arc::new(lattice_grid::NeighborTopology::new(region_at(1000, 1000)));
        topology.neighbor_up(region_at(1001, 1000));

        let channel = Arc::new(MockChannel::new());
        let physics = Arc::new(MockPhysics::default());
        let entity = CrossableEntity::new(
            Uuid::new_v4(),
            LocalPosition::new(255.0, 100.0, 21.0),
            Arc::clone(&physics) as Arc<dyn PhysicsHandle>,
            TransitEventBus::new(),
        );
        let coordinator = CrossingCoordinator::new(topology, Arc::clone(&channel));
        (coordinator, channel, physics, entity)
    }

    fn east_target() -> LocalPosition {
        LocalPosition::new(258.0, 100.0, 21.0)
    }

    #[tokio::test]
    async fn test_successful_crossing() {
        let (coordinator, channel, physics, entity) = setup();

        let outcome = coordinator.try_cross(&entity, &[], east_target(), b"state").await;
        assert_eq!(outcome, CrossingOutcome::Crossed);
        assert_eq!(channel.transfer_calls(), 1);
        assert_eq!(physics.suspend_count(), 1);
        // Success: local copy is torn down by the caller, physics stays
        // suspended.
        assert_eq!(physics.resume_count(), 0);
        assert!(!entity.in_transit());
    }

    #[tokio::test]
    async fn test_no_destination_snaps_back() {
        let (coordinator, channel, _, entity) = setup();
        entity.set_position(LocalPosition::new(-2.0, 100.0, 21.0));

        let west = LocalPosition::new(-2.0, 100.0, 21.0);
        let outcome = coordinator.try_cross(&entity, &[], west, b"state").await;
        assert_eq!(
            outcome,
            CrossingOutcome::Refused(CrossingRefusal::NoDestination)
        );
        assert!(entity.position().is_inside_region());
        assert_eq!(channel.transfer_calls(), 0);
    }

    #[tokio::test]
    async fn test_rider_establishing_defers_crossing() {
        let (coordinator, channel, _, entity) = setup();

        let riders: Vec<Arc<dyn SeatedAvatar>> = vec![Arc::new(FixedRider::new(true, true))];

        let outcome = coordinator
            .try_cross(&entity, &riders, east_target(), b"state")
            .await;
        assert_eq!(
            outcome,
            CrossingOutcome::Refused(CrossingRefusal::RiderPresencesEstablishing)
        );
        assert_eq!(channel.transfer_calls(), 0);
    }

    #[tokio::test]
    async fn test_rider_still_entering_defers_crossing() {
        let (coordinator, channel, _, entity) = setup();

        let riders: Vec<Arc<dyn SeatedAvatar>> = vec![Arc::new(FixedRider::new(false, false))];

        let outcome = coordinator
            .try_cross(&entity, &riders, east_target(), b"state")
            .await;
        assert_eq!(
            outcome,
            CrossingOutcome::Refused(CrossingRefusal::RiderStillEntering)
        );
        assert_eq!(channel.transfer_calls(), 0);
    }

    #[tokio::test]
    async fn test_recrossing_cooldown_defers() {
        let (coordinator, channel, _, entity) = setup();
        entity.arrived_from_crossing(1);

        let outcome = coordinator.try_cross(&entity, &[], east_target(), b"state").await;
        assert_eq!(
            outcome,
            CrossingOutcome::Refused(CrossingRefusal::RecrossedTooSoon)
        );
        assert_eq!(channel.transfer_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_transfer_rolls_back() {
        let (coordinator, channel, physics, entity) = setup();
        channel.set_fail_transfer(true);
        entity.set_position(LocalPosition::new(258.0, 100.0, 21.0));

        let outcome = coordinator.try_cross(&entity, &[], east_target(), b"state").await;
        assert_eq!(
            outcome,
            CrossingOutcome::Failed {
                administrative_return: false
            }
        );
        assert!(entity.position().is_inside_region());
        assert_eq!(physics.resume_count(), 1);
        assert!(entity.take_pending_full_update());
        assert!(!entity.in_transit());
    }

    #[tokio::test]
    async fn test_concurrent_crossing_attempts_one_wins() {
        let (coordinator, channel, physics, entity) = setup();
        channel.set_transfer_delay(std::time::Duration::from_millis(50));

        let coordinator = Arc::new(coordinator);
        let entity = Arc::new(entity);

        let a = {
            let coordinator = Arc::clone(&coordinator);
            let entity = Arc::clone(&entity);
            tokio::spawn(
                async move { coordinator.try_cross(&entity, &[], east_target(), b"s").await },
            )
        };
        let b = {
            let coordinator = Arc::clone(&coordinator);
            let entity = Arc::clone(&entity);
            tokio::spawn(
                async move { coordinator.try_cross(&entity, &[], east_target(), b"s").await },
            )
        };

        let outcomes = [a.await.unwrap(), b.await.unwrap()];
        assert!(outcomes.contains(&CrossingOutcome::Crossed));
        assert!(
            outcomes.contains(&CrossingOutcome::Refused(CrossingRefusal::AlreadyInTransit))
        );
        assert_eq!(channel.transfer_calls(), 1);
        assert_eq!(physics.suspend_count(), 1);
    }
}
