//! Entity crossing for lattice regions.
//!
//! An entity leaving its region passes through a short state machine:
//! a compare-and-set transit flag keeps concurrent attempts from
//! double-sending, physics is suspended for the duration, and on
//! failure the entity is restored in place with a forced full update.
//! The [`CrossingCoordinator`] runs the gate checks (known destination,
//! settled riders, recrossing cooldown) before anything leaves the
//! region.

mod crossing;
mod entity;
mod events;
mod flag;
pub mod testing;

pub use crossing::{CrossingCoordinator, CrossingOutcome, CrossingRefusal};
pub use entity::{
    CrossableEntity, MAX_FAILURES_BEFORE_RETURN, MINIMUM_RECROSSING_WAIT, PhysicsHandle,
    SeatedAvatar,
};
pub use events::{TransitEvent, TransitEventBus, TransitEventKind};
pub use flag::TransitFlag;
