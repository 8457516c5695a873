//! Test doubles for crossing tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::entity::{PhysicsHandle, SeatedAvatar};

/// Physics actor that only counts suspend and resume calls.
#[derive(Debug, Default)]
pub struct MockPhysics {
    suspends: AtomicUsize,
    resumes: AtomicUsize,
}

impl MockPhysics {
    #[must_use]
    pub fn suspend_count(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }
}

impl PhysicsHandle for MockPhysics {
    fn suspend(&self) {
        self.suspends.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Rider whose gate answers can be flipped from the test body.
#[derive(Debug)]
pub struct FixedRider {
    can_exit: AtomicBool,
    establishing: AtomicBool,
}

impl FixedRider {
    #[must_use]
    pub fn new(can_exit: bool, establishing: bool) -> Self {
        Self {
            can_exit: AtomicBool::new(can_exit),
            establishing: AtomicBool::new(establishing),
        }
    }

    pub fn set_can_exit(&self, value: bool) {
        self.can_exit.store(value, Ordering::SeqCst);
    }

    pub fn set_establishing(&self, value: bool) {
        self.establishing.store(value, Ordering::SeqCst);
    }
}

impl SeatedAvatar for FixedRider {
    fn can_exit_region(&self) -> bool {
        self.can_exit.load(Ordering::SeqCst)
    }

    fn has_establishing_presences(&self) -> bool {
        self.establishing.load(Ordering::SeqCst)
    }
}
