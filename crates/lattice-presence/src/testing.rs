//! Mock collaborators for presence and crossing tests.
//!
//! The mock channel records call counts and can be told to fail or delay
//! individual stages, which is all the tests need to exercise the
//! establishment and crossing protocols without a peer process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use lattice_comms::{
    AgentDescriptor, ChannelError, ChildAgentUpdate, ClientEventQueue, InterregionChannel,
};
use lattice_grid::{NeighborTopology, RegionHandle, RegionInfo};
use parking_lot::Mutex;
use uuid::Uuid;

/// A region at the given grid location with throwaway endpoints.
#[must_use]
pub fn region_at(x: u32, y: u32) -> RegionInfo {
    let endpoint: SocketAddr = "127.0.0.1:9000".parse().expect("valid addr");
    RegionInfo {
        loc_x: x,
        loc_y: y,
        endpoint,
        http_uri: format!("http://127.0.0.1:9000/{x}/{y}"),
    }
}

/// A topology centered on the given grid location.
#[must_use]
pub fn topology_at(x: u32, y: u32) -> Arc<NeighborTopology> {
    Arc::new(NeighborTopology::new(region_at(x, y)))
}

/// In-memory [`InterregionChannel`] that counts calls.
#[derive(Default)]
pub struct MockChannel {
    create: AtomicUsize,
    close: AtomicUsize,
    blocking_close: AtomicUsize,
    transfer: AtomicUsize,
    update: AtomicUsize,
    wait: AtomicUsize,
    fail_create: AtomicBool,
    fail_viewer_wait: AtomicBool,
    fail_transfer: AtomicBool,
    create_delay: Mutex<Duration>,
    transfer_delay: Mutex<Duration>,
}

impl MockChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_viewer_wait(&self, fail: bool) {
        self.fail_viewer_wait.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_transfer(&self, fail: bool) {
        self.fail_transfer.store(fail, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    pub fn set_transfer_delay(&self, delay: Duration) {
        *self.transfer_delay.lock() = delay;
    }

    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn blocking_close_calls(&self) -> usize {
        self.blocking_close.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn transfer_calls(&self) -> usize {
        self.transfer.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn update_calls(&self) -> usize {
        self.update.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn wait_calls(&self) -> usize {
        self.wait.load(Ordering::SeqCst)
    }
}

impl InterregionChannel for MockChannel {
    async fn create_remote_child(
        &self,
        _region: &RegionInfo,
        _agent: &AgentDescriptor,
    ) -> Result<(), ChannelError> {
        let delay = *self.create_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        self.create.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ChannelError::Rejected("mock create failure".into()));
        }
        Ok(())
    }

    async fn close_remote_child(
        &self,
        _region: &RegionInfo,
        _avatar_id: Uuid,
    ) -> Result<(), ChannelError> {
        self.close.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close_remote_child_blocking(&self, _region: &RegionInfo, _avatar_id: Uuid) {
        self.blocking_close.fetch_add(1, Ordering::SeqCst);
    }

    async fn transfer_entity(
        &self,
        _destination: &RegionInfo,
        _payload: &[u8],
    ) -> Result<(), ChannelError> {
        let delay = *self.transfer_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        self.transfer.fetch_add(1, Ordering::SeqCst);
        if self.fail_transfer.load(Ordering::SeqCst) {
            return Err(ChannelError::Rejected("mock transfer failure".into()));
        }
        Ok(())
    }

    async fn wait_for_viewer_connection(
        &self,
        _region: &RegionInfo,
        _avatar_id: Uuid,
        _handle: RegionHandle,
    ) -> Result<(), ChannelError> {
        self.wait.fetch_add(1, Ordering::SeqCst);
        if self.fail_viewer_wait.load(Ordering::SeqCst) {
            return Err(ChannelError::Timeout);
        }
        Ok(())
    }

    async fn send_child_update(
        &self,
        _region: &RegionInfo,
        _update: &ChildAgentUpdate,
    ) -> Result<(), ChannelError> {
        self.update.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// [`ClientEventQueue`] that accepts or refuses every push.
#[derive(Default)]
pub struct MockEventQueue {
    enable: AtomicUsize,
    establish: AtomicUsize,
    fail: AtomicBool,
}

impl MockEventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn enable_calls(&self) -> usize {
        self.enable.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn establish_calls(&self) -> usize {
        self.establish.load(Ordering::SeqCst)
    }
}

impl ClientEventQueue for MockEventQueue {
    fn enable_simulator(
        &self,
        _handle: RegionHandle,
        _endpoint: SocketAddr,
        _avatar_id: Uuid,
    ) -> bool {
        self.enable.fetch_add(1, Ordering::SeqCst);
        !self.fail.load(Ordering::SeqCst)
    }

    fn establish_agent_communication(
        &self,
        _avatar_id: Uuid,
        _endpoint: SocketAddr,
        _caps_seed: &str,
    ) -> bool {
        self.establish.fetch_add(1, Ordering::SeqCst);
        !self.fail.load(Ordering::SeqCst)
    }
}
