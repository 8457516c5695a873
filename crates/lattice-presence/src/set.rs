//! Per-avatar registry of remote child presences.
//!
//! One [`RemotePresences`] exists per avatar while that avatar is the
//! root (authoritative) presence on this region. It owns the record map,
//! drives the establishment handshake against neighboring regions, and
//! reconciles the set of presences whenever topology or draw distance
//! changes.
//!
//! Two synchronization primitives with deliberately different scopes:
//!
//! - the record map sits behind a [`parking_lot::Mutex`] held only for
//!   map access, never across an `.await`;
//! - the operation gate is a one-permit [`Semaphore`] serializing large
//!   multi-step sequences (resync, locked establish/drop) per avatar, and
//!   it *is* held across suspension points by design.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use lattice_comms::{
    AgentDescriptor, ChildAgentUpdate, ClientEventQueue, InterregionChannel, full_caps_seed_url,
    generate_caps_path,
};
use lattice_grid::{
    LocalPosition, NeighborTopology, RegionHandle, RegionInfo, TopologySubscription,
    region_units_from_draw_distance,
};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::avatar::AvatarIdentity;
use crate::record::{
    DropOutcome, EstablishOutcome, EstablishResult, PresenceSnapshot, RemotePresence,
    RemotePresenceInfo, RemotePresenceState,
};

/// Delay before the first resync after becoming root. The viewer
/// sometimes stalls freeing memory right after a crossing; give it a
/// moment before the burst of new handshakes.
const CROSSING_RESYNC_DELAY: Duration = Duration::from_millis(500);

/// Placeholder position child presences spawn at on the destination.
const DEFAULT_CHILD_POSITION: LocalPosition = LocalPosition {
    x: 128.0,
    y: 128.0,
    z: 70.0,
};

/// Tracks the presences an avatar has on our known neighbor regions.
pub struct RemotePresences<C: InterregionChannel, Q: ClientEventQueue> {
    avatar: AvatarIdentity,
    topology: Arc<NeighborTopology>,
    channel: Arc<C>,
    client_events: Arc<Q>,

    records: Mutex<HashMap<RegionHandle, RemotePresence>>,

    /// One-permit gate for large operations. See module docs.
    gate: Semaphore,

    /// Live view state of the avatar, fed by movement and view handlers.
    draw_distance: AtomicU32,
    neighbors_range: AtomicU32,
    position: Mutex<LocalPosition>,

    /// Last draw-distance region factor and range we resynced for, to
    /// detect no-op changes.
    last_dd_factor: AtomicU32,
    last_range: AtomicU32,

    /// Monotonically increasing establishment attempt id, so joins and
    /// removals can never latch onto a different handshake for the same
    /// region handle.
    next_attempt: AtomicU64,

    /// Topology-change watcher, alive exactly while we are root here.
    topology_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: InterregionChannel, Q: ClientEventQueue> RemotePresences<C, Q> {
    #[must_use]
    pub fn new(
        avatar: AvatarIdentity,
        topology: Arc<NeighborTopology>,
        channel: Arc<C>,
        client_events: Arc<Q>,
        draw_distance: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            avatar,
            topology,
            channel,
            client_events,
            records: Mutex::new(HashMap::new()),
            gate: Semaphore::new(1),
            draw_distance: AtomicU32::new(draw_distance),
            neighbors_range: AtomicU32::new(0),
            position: Mutex::new(DEFAULT_CHILD_POSITION),
            last_dd_factor: AtomicU32::new(region_units_from_draw_distance(draw_distance)),
            last_range: AtomicU32::new(0),
            next_attempt: AtomicU64::new(1),
            topology_task: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn avatar(&self) -> &AvatarIdentity {
        &self.avatar
    }

    // ---- seeding and lifecycle --------------------------------------

    /// Bulk-seed the set from the presences a previous region was
    /// holding for this avatar, after it crossed into us and became root
    /// here.
    pub fn set_initial(&self, presences: Vec<RemotePresenceInfo>) {
        if self.avatar.synthetic {
            return;
        }

        let local = self.topology.local_region().handle();
        let mut records = self.records.lock();
        for info in presences {
            // The previous region may have had us in its list; we never
            // hold a presence on ourselves.
            let handle = info.region.handle();
            if handle == local {
                continue;
            }

            records.insert(handle, settled_record(info, self.bump_attempt()));
        }
    }

    /// This avatar just became the root presence on our region: watch
    /// topology changes and populate the neighbor set.
    pub fn on_became_root(self: &Arc<Self>, draw_distance: u32, max_range: u32) {
        if self.avatar.synthetic {
            return;
        }

        self.draw_distance.store(draw_distance, Ordering::Relaxed);
        self.neighbors_range.store(max_range, Ordering::Relaxed);
        self.last_dd_factor.store(
            region_units_from_draw_distance(draw_distance),
            Ordering::Relaxed,
        );
        self.last_range.store(max_range, Ordering::Relaxed);

        {
            let mut task = self.topology_task.lock();
            if task.is_none() {
                let sub = self.topology.subscribe();
                *task = Some(tokio::spawn(Arc::clone(self).watch_topology(sub)));
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.resync_neighbors(draw_distance, max_range, CROSSING_RESYNC_DELAY)
                .await;
        });
    }

    /// This avatar was demoted to a child presence here; the new root
    /// region owns the remote presence data now.
    pub fn on_became_child(&self) {
        if self.avatar.synthetic {
            return;
        }
        self.stop_managing();
    }

    /// Unsubscribe from topology changes and clear all records without
    /// notifying peers.
    pub fn stop_managing(&self) {
        if let Some(task) = self.topology_task.lock().take() {
            task.abort();
        }
        self.records.lock().clear();
    }

    /// Ask every region we hold a non-far presence on to tear down its
    /// child agent. Used at session logout, where there is no next region
    /// to take over the close.
    pub fn terminate_all_neighbors(&self) {
        if self.avatar.synthetic {
            return;
        }

        for snapshot in self.all() {
            if !snapshot.is_far_presence {
                self.channel
                    .close_remote_child_blocking(&snapshot.info.region, self.avatar.id);
            }
        }
    }

    async fn watch_topology(self: Arc<Self>, mut sub: TopologySubscription) {
        while let Some(change) = sub.changed().await {
            // Any neighbor change can alter visibility of more than one
            // region, so always recompute the full set.
            debug!(
                avatar = %self.avatar.id,
                kind = ?change.kind,
                region = %change.region.handle(),
                "neighbor changed, resyncing"
            );

            let dd = self.draw_distance.load(Ordering::Relaxed);
            let range = self.neighbors_range.load(Ordering::Relaxed);
            self.resync_neighbors(dd, range, Duration::ZERO).await;
        }
    }

    // ---- view state --------------------------------------------------

    /// Record the avatar's current region-local position, used when
    /// pushing child updates to neighbors.
    pub fn update_position(&self, position: LocalPosition) {
        *self.position.lock() = position;
    }

    /// The avatar's draw distance changed. Resyncs only when the change
    /// actually alters the visible region rectangle.
    pub async fn handle_draw_distance_change(self: &Arc<Self>, draw_distance: u32, max_range: u32) {
        if self.avatar.synthetic {
            return;
        }

        let factor = region_units_from_draw_distance(draw_distance);
        if self.last_dd_factor.load(Ordering::Relaxed) == factor
            && self.last_range.load(Ordering::Relaxed) == max_range
        {
            return;
        }

        self.last_dd_factor.store(factor, Ordering::Relaxed);
        self.last_range.store(max_range, Ordering::Relaxed);
        self.draw_distance.store(draw_distance, Ordering::Relaxed);
        self.neighbors_range.store(max_range, Ordering::Relaxed);

        self.resync_neighbors(draw_distance, max_range, Duration::ZERO)
            .await;
    }

    // ---- queries -----------------------------------------------------

    /// Whether any record exists for the region, in any state.
    #[must_use]
    pub fn has_presence(&self, handle: RegionHandle) -> bool {
        self.records.lock().contains_key(&handle)
    }

    /// Whether an established presence exists for the region.
    #[must_use]
    pub fn has_established(&self, handle: RegionHandle) -> bool {
        self.records
            .lock()
            .get(&handle)
            .is_some_and(|r| r.state == RemotePresenceState::Established)
    }

    /// True while a large operation is running or any record is not yet
    /// established. The crossing state machine refuses to hand the avatar
    /// off while this holds.
    #[must_use]
    pub fn has_any_establishing(&self) -> bool {
        if self.gate.available_permits() == 0 {
            return true;
        }

        self.records
            .lock()
            .values()
            .any(|r| r.state != RemotePresenceState::Established)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.records.lock().len()
    }

    /// Copy-out snapshot of every record, establishing ones included.
    #[must_use]
    pub fn all(&self) -> Vec<PresenceSnapshot> {
        self.records.lock().values().map(snapshot_of).collect()
    }

    /// Copy-out snapshot of established records only.
    #[must_use]
    pub fn established_only(&self) -> Vec<PresenceSnapshot> {
        self.records
            .lock()
            .values()
            .filter(|r| r.state == RemotePresenceState::Established)
            .map(snapshot_of)
            .collect()
    }

    /// Snapshot of a single record, if present.
    #[must_use]
    pub fn snapshot(&self, handle: RegionHandle) -> Option<PresenceSnapshot> {
        self.records.lock().get(&handle).map(snapshot_of)
    }

    /// Run `visitor` against the record for `handle` (or `None`) while
    /// the map lock is held, so read-then-decide sequences see one
    /// consistent state. `visitor` must not block.
    pub fn try_get<R>(
        &self,
        handle: RegionHandle,
        visitor: impl FnOnce(Option<&PresenceSnapshot>) -> R,
    ) -> R {
        let records = self.records.lock();
        visitor(records.get(&handle).map(snapshot_of).as_ref())
    }

    // ---- establishment -----------------------------------------------

    /// Establish a presence on `region`, serialized behind the operation
    /// gate.
    ///
    /// Idempotent: an already-established presence returns `Success`
    /// without touching the network, and a handshake already in flight is
    /// joined rather than raced.
    pub async fn establish_presence(
        self: &Arc<Self>,
        region: &RegionInfo,
        force_reestablish: bool,
        is_far: bool,
    ) -> EstablishResult {
        let Ok(_permit) = self.gate.acquire().await else {
            return aborted("operation gate closed");
        };
        self.establish_inner(region, force_reestablish, is_far).await
    }

    /// Establishment without the gate; resync calls this while already
    /// holding it.
    async fn establish_inner(
        self: &Arc<Self>,
        region: &RegionInfo,
        force_reestablish: bool,
        is_far: bool,
    ) -> EstablishResult {
        let handle = region.handle();
        let mut join_rx = None;
        let mut already_established = false;

        {
            let mut records = self.records.lock();
            match records.get(&handle) {
                Some(existing) if !force_reestablish => {
                    if existing.state == RemotePresenceState::Established {
                        already_established = true;
                    } else {
                        // A handshake is in flight; await its result
                        // instead of starting a second one.
                        join_rx = Some(existing.result_rx.clone());
                    }
                }
                _ => {
                    let attempt = self.bump_attempt();
                    let caps_path = generate_caps_path();
                    let (tx, rx) = watch::channel(None);

                    records.insert(
                        handle,
                        RemotePresence {
                            info: RemotePresenceInfo {
                                region: region.clone(),
                                caps_path: caps_path.clone(),
                            },
                            state: RemotePresenceState::Establishing,
                            is_far_presence: is_far,
                            attempt,
                            result_rx: rx.clone(),
                        },
                    );

                    tokio::spawn(Arc::clone(self).run_establishment(
                        region.clone(),
                        attempt,
                        caps_path,
                        tx,
                    ));
                    join_rx = Some(rx);
                }
            }
        }

        if already_established {
            return (EstablishOutcome::Success, String::new());
        }

        match join_rx {
            Some(rx) => join_result(rx).await,
            None => aborted("no establishment to join"),
        }
    }

    /// The three-stage handshake. Runs as its own task; every caller of
    /// the same attempt awaits the published result.
    async fn run_establishment(
        self: Arc<Self>,
        region: RegionInfo,
        attempt: u64,
        caps_path: String,
        tx: watch::Sender<Option<EstablishResult>>,
    ) {
        let result = self.run_handshake(&region, attempt, &caps_path).await;

        if result.0 == EstablishOutcome::Success {
            debug!(
                avatar = %self.avatar.id,
                neighbor = %region.handle(),
                "remote presence established"
            );
        } else {
            info!(
                avatar = %self.avatar.id,
                neighbor = %region.handle(),
                outcome = ?result.0,
                detail = %result.1,
                "remote presence establishment failed"
            );
        }

        let _ = tx.send(Some(result));
    }

    async fn run_handshake(
        &self,
        region: &RegionInfo,
        attempt: u64,
        caps_path: &str,
    ) -> EstablishResult {
        let handle = region.handle();

        // Stage 1: tell the destination to expect the avatar. Channel
        // errors stop here; they never propagate past this protocol.
        let agent = self.agent_descriptor(caps_path);
        if let Err(e) = self.channel.create_remote_child(region, &agent).await {
            self.remove_if_attempt(handle, attempt);
            return (EstablishOutcome::ErrorInformingRegion, e.to_string());
        }

        if !self.advance_state(handle, attempt, RemotePresenceState::AwaitingViewer) {
            return self.record_vanished(handle);
        }

        // Stage 2: route the viewer at the new endpoint.
        if !self
            .client_events
            .enable_simulator(handle, region.endpoint, self.avatar.id)
        {
            self.remove_if_attempt(handle, attempt);
            return (
                EstablishOutcome::ClientSignallingFailed,
                "could not enqueue enable-simulator".into(),
            );
        }

        let seed = full_caps_seed_url(&region.http_uri, caps_path);
        if !self
            .client_events
            .establish_agent_communication(self.avatar.id, region.endpoint, &seed)
        {
            self.remove_if_attempt(handle, attempt);
            return (
                EstablishOutcome::ClientSignallingFailed,
                "could not enqueue establish-agent-communication".into(),
            );
        }

        // Stage 3: bounded wait for the viewer to actually show up there.
        match self
            .channel
            .wait_for_viewer_connection(region, self.avatar.id, handle)
            .await
        {
            Ok(()) => {
                if self.advance_state(handle, attempt, RemotePresenceState::Established) {
                    (EstablishOutcome::Success, String::new())
                } else {
                    self.record_vanished(handle)
                }
            }
            Err(e) => {
                warn!(
                    avatar = %self.avatar.id,
                    neighbor = %handle,
                    error = %e,
                    "viewer never connected at destination"
                );
                self.remove_if_attempt(handle, attempt);
                (
                    EstablishOutcome::ClientWaitTimeout,
                    "destination region never received a connection from the viewer".into(),
                )
            }
        }
    }

    fn agent_descriptor(&self, caps_path: &str) -> AgentDescriptor {
        AgentDescriptor {
            avatar_id: self.avatar.id,
            first_name: self.avatar.first_name.clone(),
            last_name: self.avatar.last_name.clone(),
            caps_path: caps_path.to_string(),
            start_position: DEFAULT_CHILD_POSITION,
            child: true,
        }
    }

    /// Move the record for `handle` to `state`, provided it still belongs
    /// to this attempt. Returns false when the record is gone or was
    /// replaced.
    fn advance_state(&self, handle: RegionHandle, attempt: u64, state: RemotePresenceState) -> bool {
        let mut records = self.records.lock();
        match records.get_mut(&handle) {
            Some(record) if record.attempt == attempt => {
                record.state = state;
                true
            }
            _ => false,
        }
    }

    fn remove_if_attempt(&self, handle: RegionHandle, attempt: u64) {
        let mut records = self.records.lock();
        if records.get(&handle).is_some_and(|r| r.attempt == attempt) {
            records.remove(&handle);
        }
    }

    /// A handshake checkpoint found its record missing. Another operation
    /// removed it concurrently, which the single-flight gate should have
    /// prevented.
    fn record_vanished(&self, handle: RegionHandle) -> EstablishResult {
        error!(
            avatar = %self.avatar.id,
            neighbor = %handle,
            "presence record vanished mid-handshake"
        );
        aborted("connection was aborted")
    }

    fn bump_attempt(&self) -> u64 {
        self.next_attempt.fetch_add(1, Ordering::Relaxed)
    }

    // ---- teardown ----------------------------------------------------

    /// Drop the presence on `region`, serialized behind the operation
    /// gate.
    pub async fn drop_presence(self: &Arc<Self>, region: &RegionInfo, only_if_far: bool) -> DropOutcome {
        let Ok(_permit) = self.gate.acquire().await else {
            return DropOutcome::NotFound;
        };
        self.drop_inner(region, only_if_far).await
    }

    /// Removal without the gate; resync calls this while already holding
    /// it.
    ///
    /// The local record is removed first and unconditionally; the remote
    /// close is best-effort and never rolls the removal back. Once the
    /// record is gone the viewer stops requesting updates from that
    /// region, so a failed close only leaves garbage on the peer.
    async fn drop_inner(&self, region: &RegionInfo, only_if_far: bool) -> DropOutcome {
        let handle = region.handle();

        {
            let mut records = self.records.lock();
            match records.get(&handle) {
                None => return DropOutcome::NotFound,
                Some(record) if only_if_far && !record.is_far_presence => {
                    return DropOutcome::KeptNearPresence;
                }
                Some(_) => {
                    // The viewer treats a disable-simulator from us as
                    // being about *this* region, so we cannot signal it
                    // about the neighbor; we remove our record and ask
                    // the far side to tear down its end.
                    records.remove(&handle);
                }
            }
        }

        if let Err(e) = self.channel.close_remote_child(region, self.avatar.id).await {
            warn!(
                avatar = %self.avatar.id,
                neighbor = %handle,
                error = %e,
                "remote close failed"
            );
        }

        DropOutcome::Dropped
    }

    // ---- resync ------------------------------------------------------

    /// Reconcile held presences against the regions visible at the given
    /// draw distance and range.
    ///
    /// Far presences are exempt from the diff: they are managed by
    /// whatever created them (e.g. an in-progress teleport) and must not
    /// be dropped by ordinary distance changes.
    pub async fn resync_neighbors(
        self: &Arc<Self>,
        draw_distance: u32,
        max_range: u32,
        delay: Duration,
    ) {
        let desired_list = self.topology.neighbors_within(draw_distance, max_range);

        let mut directory: HashMap<RegionHandle, RegionInfo> = desired_list
            .iter()
            .map(|r| (r.handle(), r.clone()))
            .collect();
        let desired: HashSet<RegionHandle> = directory.keys().copied().collect();

        let held: HashSet<RegionHandle> = {
            let records = self.records.lock();
            records
                .values()
                .inspect(|record| {
                    directory
                        .entry(record.info.region.handle())
                        .or_insert_with(|| record.info.region.clone());
                })
                .filter(|record| !record.is_far_presence)
                .map(|record| record.info.region.handle())
                .collect()
        };

        let dead: Vec<RegionHandle> = held.difference(&desired).copied().collect();
        let new: Vec<RegionHandle> = desired.difference(&held).copied().collect();

        let Ok(_permit) = self.gate.acquire().await else {
            return;
        };

        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        debug!(
            avatar = %self.avatar.id,
            dropping = dead.len(),
            creating = new.len(),
            "resyncing neighbor presences"
        );

        let drop_tasks: Vec<JoinHandle<DropOutcome>> = dead
            .iter()
            .filter_map(|handle| directory.get(handle).cloned())
            .map(|region| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.drop_inner(&region, false).await })
            })
            .collect();

        let establish_tasks: Vec<JoinHandle<EstablishResult>> = new
            .iter()
            .filter_map(|handle| directory.get(handle).cloned())
            .map(|region| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.establish_inner(&region, false, false).await })
            })
            .collect();

        // New connections first: the viewer should gain visibility before
        // losing it elsewhere.
        let created = establish_tasks.len();
        for task in establish_tasks {
            let _ = task.await;
        }
        for task in drop_tasks {
            let _ = task.await;
        }

        if created > 0 {
            // Give the now-visible neighbors our position so they can
            // cull and prioritize immediately.
            self.push_child_update_to_neighbors().await;
        }
    }

    /// Push the avatar's position and view state to every established
    /// neighbor presence. Best-effort.
    pub async fn push_child_update_to_neighbors(&self) {
        let update = ChildAgentUpdate {
            avatar_id: self.avatar.id,
            position: *self.position.lock(),
            draw_distance: self.draw_distance.load(Ordering::Relaxed),
        };

        for snapshot in self.established_only() {
            if let Err(e) = self
                .channel
                .send_child_update(&snapshot.info.region, &update)
                .await
            {
                warn!(
                    avatar = %self.avatar.id,
                    neighbor = %snapshot.info.region.handle(),
                    error = %e,
                    "child update failed"
                );
            }
        }
    }
}

impl<C: InterregionChannel, Q: ClientEventQueue> Drop for RemotePresences<C, Q> {
    fn drop(&mut self) {
        if let Some(task) = self.topology_task.lock().take() {
            task.abort();
        }
    }
}

fn snapshot_of(record: &RemotePresence) -> PresenceSnapshot {
    PresenceSnapshot {
        info: record.info.clone(),
        state: record.state,
        is_far_presence: record.is_far_presence,
    }
}

/// A record seeded directly into the established state (initial copy
/// from a previous region).
fn settled_record(info: RemotePresenceInfo, attempt: u64) -> RemotePresence {
    let (_tx, rx) = watch::channel(Some((EstablishOutcome::Success, String::new())));
    RemotePresence {
        info,
        state: RemotePresenceState::Established,
        is_far_presence: false,
        attempt,
        result_rx: rx,
    }
}

fn aborted(message: &str) -> EstablishResult {
    (EstablishOutcome::ConnectionAborted, message.to_string())
}

/// Await an in-flight establishment's published result.
async fn join_result(mut rx: watch::Receiver<Option<EstablishResult>>) -> EstablishResult {
    loop {
        {
            let value = rx.borrow_and_update();
            if let Some(result) = value.as_ref() {
                return result.clone();
            }
        }
        if rx.changed().await.is_err() {
            // The handshake task went away without publishing.
            return aborted("establish task dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;
    use crate::testing::{MockChannel, MockEventQueue, region_at, topology_at};

    type TestSet = Arc<RemotePresences<MockChannel, MockEventQueue>>;

    fn presences(topology: Arc<NeighborTopology>) -> (TestSet, Arc<MockChannel>, Arc<MockEventQueue>) {
        let channel = Arc::new(MockChannel::new());
        let queue = Arc::new(MockEventQueue::new());
        let avatar = AvatarIdentity::new(Uuid::new_v4(), "Test", "Avatar");
        let set = RemotePresences::new(
            avatar,
            topology,
            Arc::clone(&channel),
            Arc::clone(&queue),
            256,
        );
        (set, channel, queue)
    }

    #[tokio::test]
    async fn test_establish_is_idempotent() {
        let topo = topology_at(1000, 1000);
        let (set, channel, _) = presences(topo);
        let east = region_at(1001, 1000);

        let (outcome, _) = set.establish_presence(&east, false, false).await;
        assert_eq!(outcome, EstablishOutcome::Success);
        let (outcome, _) = set.establish_presence(&east, false, false).await;
        assert_eq!(outcome, EstablishOutcome::Success);

        assert_eq!(channel.create_calls(), 1);
        assert!(set.has_established(east.handle()));
        assert_eq!(set.count(), 1);
    }

    #[tokio::test]
    async fn test_try_get_sees_record_under_lock() {
        let topo = topology_at(1000, 1000);
        let (set, _, _) = presences(topo);
        let east = region_at(1001, 1000);

        assert!(set.try_get(east.handle(), |record| record.is_none()));

        set.establish_presence(&east, false, false).await;
        let state = set.try_get(east.handle(), |record| {
            record.map(|r| (r.state, r.is_far_presence))
        });
        assert_eq!(state, Some((RemotePresenceState::Established, false)));
    }

    #[tokio::test]
    async fn test_concurrent_establish_single_flight() {
        let topo = topology_at(1000, 1000);
        let (set, channel, _) = presences(topo);
        let east = region_at(1001, 1000);
        channel.set_create_delay(Duration::from_millis(50));

        // Drive the inner path directly so both calls race the same
        // record rather than serializing on the gate.
        let a = {
            let set = Arc::clone(&set);
            let east = east.clone();
            tokio::spawn(async move { set.establish_inner(&east, false, false).await })
        };
        let b = {
            let set = Arc::clone(&set);
            let east = east.clone();
            tokio::spawn(async move { set.establish_inner(&east, false, false).await })
        };

        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(ra.0, EstablishOutcome::Success);
        assert_eq!(rb.0, EstablishOutcome::Success);
        assert_eq!(channel.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_removes_record() {
        let topo = topology_at(1000, 1000);
        let (set, channel, _) = presences(topo);
        channel.set_fail_create(true);
        let east = region_at(1001, 1000);

        let (outcome, _) = set.establish_presence(&east, false, false).await;
        assert_eq!(outcome, EstablishOutcome::ErrorInformingRegion);
        assert!(!set.has_presence(east.handle()));
        assert_eq!(set.count(), 0);
    }

    #[tokio::test]
    async fn test_signalling_failure_removes_record() {
        let topo = topology_at(1000, 1000);
        let (set, channel, queue) = presences(topo);
        queue.set_fail(true);
        let east = region_at(1001, 1000);

        let (outcome, _) = set.establish_presence(&east, false, false).await;
        assert_eq!(outcome, EstablishOutcome::ClientSignallingFailed);
        assert!(!set.has_presence(east.handle()));
        // The sequence aborted before the viewer wait.
        assert_eq!(channel.wait_calls(), 0);
    }

    #[tokio::test]
    async fn test_viewer_timeout_removes_record() {
        let topo = topology_at(1000, 1000);
        let (set, channel, _) = presences(topo);
        channel.set_fail_viewer_wait(true);
        let east = region_at(1001, 1000);

        let (outcome, _) = set.establish_presence(&east, false, false).await;
        assert_eq!(outcome, EstablishOutcome::ClientWaitTimeout);
        assert!(set.all().is_empty());
    }

    #[tokio::test]
    async fn test_force_reestablish_runs_new_handshake() {
        let topo = topology_at(1000, 1000);
        let (set, channel, _) = presences(topo);
        let east = region_at(1001, 1000);

        set.establish_presence(&east, false, false).await;
        let (outcome, _) = set.establish_presence(&east, true, false).await;
        assert_eq!(outcome, EstablishOutcome::Success);
        assert_eq!(channel.create_calls(), 2);
    }

    // Far/near is orthogonal to established/not: the flag always follows
    // what the caller passed, including on forced reestablish.
    #[tokio::test]
    async fn test_far_near_matrix() {
        let topo = topology_at(1000, 1000);
        let (set, _, _) = presences(topo);
        let east = region_at(1001, 1000);
        let handle = east.handle();

        set.establish_presence(&east, false, false).await;
        assert!(!set.snapshot(handle).unwrap().is_far_presence);

        set.establish_presence(&east, true, true).await;
        assert!(set.snapshot(handle).unwrap().is_far_presence);

        set.establish_presence(&east, true, false).await;
        assert!(!set.snapshot(handle).unwrap().is_far_presence);

        set.establish_presence(&east, true, true).await;
        assert!(set.snapshot(handle).unwrap().is_far_presence);
        assert!(set.has_established(handle));
    }

    #[tokio::test]
    async fn test_has_any_establishing_during_handshake() {
        let topo = topology_at(1000, 1000);
        let (set, channel, _) = presences(topo);
        channel.set_create_delay(Duration::from_millis(100));
        let east = region_at(1001, 1000);

        let task = {
            let set = Arc::clone(&set);
            let east = east.clone();
            tokio::spawn(async move { set.establish_presence(&east, false, false).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(set.has_any_establishing());

        task.await.unwrap();
        assert!(!set.has_any_establishing());
    }

    #[tokio::test]
    async fn test_resync_convergence() {
        let topo = topology_at(1000, 1000);
        let a = region_at(999, 1000);
        let b = region_at(1001, 1000);
        let c = region_at(1000, 1001);
        topo.neighbor_up(a.clone());
        topo.neighbor_up(b.clone());

        let (set, channel, _) = presences(Arc::clone(&topo));
        set.resync_neighbors(256, 0, Duration::ZERO).await;
        assert_eq!(set.count(), 2);
        assert_eq!(channel.create_calls(), 2);

        // A goes away, C appears.
        topo.neighbor_down(a.handle());
        topo.neighbor_up(c.clone());
        set.resync_neighbors(256, 0, Duration::ZERO).await;

        assert!(!set.has_presence(a.handle()));
        assert!(set.has_established(b.handle()));
        assert!(set.has_established(c.handle()));
        assert_eq!(channel.create_calls(), 3);
        assert_eq!(channel.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_far_presence_survives_resync() {
        let topo = topology_at(1000, 1000);
        let far = region_at(1200, 1200);

        let (set, channel, _) = presences(Arc::clone(&topo));
        set.establish_presence(&far, false, true).await;
        assert!(set.has_established(far.handle()));

        set.resync_neighbors(256, 0, Duration::ZERO).await;
        assert!(set.has_established(far.handle()));
        assert_eq!(channel.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_drop_only_if_far_keeps_near() {
        let topo = topology_at(1000, 1000);
        let east = region_at(1001, 1000);

        let (set, channel, _) = presences(topo);
        set.establish_presence(&east, false, false).await;

        let outcome = set.drop_presence(&east, true).await;
        assert_eq!(outcome, DropOutcome::KeptNearPresence);
        assert!(set.has_established(east.handle()));

        let outcome = set.drop_presence(&east, false).await;
        assert_eq!(outcome, DropOutcome::Dropped);
        assert_eq!(channel.close_calls(), 1);
        assert_eq!(set.count(), 0);
    }

    #[tokio::test]
    async fn test_set_initial_skips_local_region() {
        let topo = topology_at(1000, 1000);
        let (set, _, _) = presences(topo);

        set.set_initial(vec![
            RemotePresenceInfo {
                region: region_at(1000, 1000),
                caps_path: "local".into(),
            },
            RemotePresenceInfo {
                region: region_at(1001, 1000),
                caps_path: "east".into(),
            },
        ]);

        assert_eq!(set.count(), 1);
        assert!(set.has_established(region_at(1001, 1000).handle()));
    }

    #[tokio::test]
    async fn test_synthetic_avatar_holds_nothing() {
        let topo = topology_at(1000, 1000);
        topo.neighbor_up(region_at(1001, 1000));

        let channel = Arc::new(MockChannel::new());
        let queue = Arc::new(MockEventQueue::new());
        let avatar = AvatarIdentity::synthetic(Uuid::new_v4(), "Bot", "Avatar");
        let set = RemotePresences::new(avatar, topo, Arc::clone(&channel), queue, 256);

        set.set_initial(vec![RemotePresenceInfo {
            region: region_at(1001, 1000),
            caps_path: "east".into(),
        }]);
        set.on_became_root(256, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(set.count(), 0);
        assert_eq!(channel.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_draw_distance_noop_change_skips_resync() {
        let topo = topology_at(1000, 1000);
        topo.neighbor_up(region_at(1001, 1000));
        let (set, channel, _) = presences(Arc::clone(&topo));

        // Same region factor (ceil(200/256) == ceil(256/256)), same range.
        set.handle_draw_distance_change(200, 0).await;
        assert_eq!(channel.create_calls(), 0);

        // Crossing a region boundary in draw distance does resync.
        set.handle_draw_distance_change(300, 0).await;
        assert_eq!(channel.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_managing_clears_without_closing() {
        let topo = topology_at(1000, 1000);
        let east = region_at(1001, 1000);
        let (set, channel, _) = presences(topo);

        set.establish_presence(&east, false, false).await;
        set.stop_managing();

        assert_eq!(set.count(), 0);
        // The next region is authoritative for the close.
        assert_eq!(channel.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_terminate_all_skips_far_presences() {
        let topo = topology_at(1000, 1000);
        let (set, channel, _) = presences(topo);

        set.establish_presence(&region_at(1001, 1000), false, false).await;
        set.establish_presence(&region_at(999, 1000), false, false).await;
        set.establish_presence(&region_at(1200, 1200), false, true).await;

        set.terminate_all_neighbors();
        assert_eq!(channel.blocking_close_calls(), 2);
    }
}
