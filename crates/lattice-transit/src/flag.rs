//! The in-transit flag.

use std::sync::atomic::{AtomicBool, Ordering};

/// Whether an entity is currently being handed off to another region.
///
/// Both transitions are compare-and-set, never read-then-write, so the
/// flag stays correct when physics and network callers race: exactly one
/// `start` wins per crossing attempt, and exactly one `end` clears it.
#[derive(Debug, Default)]
pub struct TransitFlag(AtomicBool);

impl TransitFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter transit. Returns false if a crossing is already in
    /// progress.
    pub fn start(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Leave transit. Returns false if no crossing was in progress.
    pub fn end(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn in_transit(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
