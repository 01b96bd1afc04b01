//! In-memory headset and shared-anchor cloud.
//!
//! Every headset has a private tracking space related to the shared physical
//! space by a transform it never exposes; shared anchors are stored in physical
//! space so two headsets only agree on world coordinates once they align to a
//! common anchor. Used by tests and the `simulate` CLI command.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    adapter::{AnchorStore, TrackingRig, UnboundAnchor},
    types::{AnchorId, LocalAnchorHandle, Pose},
    XrError, XrResult,
};

/// Platform operations that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Localize,
    Share,
    Download,
    Bind,
}

#[derive(Debug, Default)]
struct WorldState {
    shared: HashMap<AnchorId, Pose>,
    failures: HashMap<SimOp, u32>,
    calls: HashMap<SimOp, u32>,
    latency: Duration,
}

/// Shared-anchor cloud plus fault injection.
#[derive(Debug, Default)]
pub struct SimWorld {
    state: Mutex<WorldState>,
}

impl SimWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Makes the next `count` calls of `op` fail.
    pub fn fail_next(&self, op: SimOp, count: u32) {
        *self.lock().failures.entry(op).or_default() += count;
    }

    pub fn calls(&self, op: SimOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Delay applied to every async platform call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn shared_anchor(&self, id: AnchorId) -> Option<Pose> {
        self.lock().shared.get(&id).copied()
    }

    pub fn shared_count(&self) -> usize {
        self.lock().shared.len()
    }

    async fn suspend(&self) {
        let latency = self.lock().latency;
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
    }

    /// Counts the call; `false` when an injected failure consumed it.
    fn record(&self, op: SimOp) -> bool {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                debug!(?op, "injected failure");
                false
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
struct SimLocalAnchor {
    uuid: AnchorId,
    /// Pose in tracking space.
    local: Pose,
    tracking: bool,
    localized: bool,
}

#[derive(Debug)]
struct HeadsetState {
    tracking_from_physical: Pose,
    rig: Pose,
    head_local: Pose,
    anchors: BTreeMap<u64, SimLocalAnchor>,
    next_handle: u64,
}

impl HeadsetState {
    fn to_world(&self, physical: &Pose) -> Pose {
        self.rig * self.tracking_from_physical * *physical
    }

    fn to_physical(&self, world: &Pose) -> Pose {
        self.tracking_from_physical.inverse() * self.rig.inverse() * *world
    }
}

type SharedHeadset = Arc<Mutex<HeadsetState>>;

fn lock_headset(state: &SharedHeadset) -> MutexGuard<'_, HeadsetState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A simulated headset: anchor store and tracking rig in one.
pub struct SimHeadset {
    world: Arc<SimWorld>,
    state: SharedHeadset,
    recentered: broadcast::Sender<()>,
}

impl SimHeadset {
    /// `tracking_from_physical` is where this headset's tracking origin happens to sit.
    pub fn new(world: Arc<SimWorld>, tracking_from_physical: Pose) -> Arc<Self> {
        let (recentered, _) = broadcast::channel(16);
        Arc::new(Self {
            world,
            state: Arc::new(Mutex::new(HeadsetState {
                tracking_from_physical,
                rig: Pose::IDENTITY,
                head_local: tracking_from_physical,
                anchors: BTreeMap::new(),
                next_handle: 1,
            })),
            recentered,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HeadsetState> {
        lock_headset(&self.state)
    }

    /// Places the user's head at a physical pose.
    pub fn move_head_physical(&self, physical: Pose) {
        let mut state = self.lock();
        state.head_local = state.tracking_from_physical * physical;
    }

    pub fn physical_to_world(&self, physical: &Pose) -> Pose {
        self.lock().to_world(physical)
    }

    pub fn world_to_physical(&self, world: &Pose) -> Pose {
        self.lock().to_physical(world)
    }

    /// Redefines the tracking space by `delta` and fires the recentered event.
    pub fn recenter(&self, delta: Pose) {
        {
            let mut state = self.lock();
            state.tracking_from_physical = delta * state.tracking_from_physical;
            state.head_local = delta * state.head_local;
            for anchor in state.anchors.values_mut() {
                anchor.local = delta * anchor.local;
            }
        }
        let _ = self.recentered.send(());
    }

    pub fn anchor_count(&self) -> usize {
        self.lock().anchors.len()
    }
}

#[async_trait]
impl AnchorStore for SimHeadset {
    fn create_local(&self, pose: Pose) -> LocalAnchorHandle {
        let mut state = self.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        let local = state.rig.inverse() * pose;
        state.anchors.insert(
            handle,
            SimLocalAnchor {
                uuid: AnchorId::new_v4(),
                local,
                tracking: false,
                localized: false,
            },
        );
        LocalAnchorHandle(handle)
    }

    fn anchor_uuid(&self, handle: LocalAnchorHandle) -> AnchorId {
        self.lock()
            .anchors
            .get(&handle.0)
            .map(|anchor| anchor.uuid)
            .unwrap_or(AnchorId::NIL)
    }

    fn set_tracking_enabled(&self, handle: LocalAnchorHandle, enabled: bool) {
        if let Some(anchor) = self.lock().anchors.get_mut(&handle.0) {
            anchor.tracking = enabled;
        }
    }

    fn tracked_pose(&self, handle: LocalAnchorHandle) -> Option<Pose> {
        let state = self.lock();
        state
            .anchors
            .get(&handle.0)
            .map(|anchor| state.rig * anchor.local)
    }

    fn set_pose(&self, handle: LocalAnchorHandle, pose: Pose) {
        let mut state = self.lock();
        let local = state.rig.inverse() * pose;
        if let Some(anchor) = state.anchors.get_mut(&handle.0) {
            anchor.local = local;
        }
    }

    async fn localize(&self, handle: LocalAnchorHandle) -> bool {
        self.world.suspend().await;
        let tracking = self
            .lock()
            .anchors
            .get(&handle.0)
            .map(|anchor| anchor.tracking)
            .unwrap_or(false);
        if !tracking || !self.world.record(SimOp::Localize) {
            return false;
        }
        if let Some(anchor) = self.lock().anchors.get_mut(&handle.0) {
            anchor.localized = true;
        }
        true
    }

    async fn share(&self, handle: LocalAnchorHandle) -> XrResult<AnchorId> {
        self.world.suspend().await;
        if !self.world.record(SimOp::Share) {
            return Err(XrError::Share("injected failure".into()));
        }
        let (uuid, physical) = {
            let state = self.lock();
            let anchor = state
                .anchors
                .get(&handle.0)
                .ok_or_else(|| XrError::Share(format!("unknown anchor {handle}")))?;
            if !anchor.localized {
                return Err(XrError::Share(format!("anchor {} not localized", anchor.uuid)));
            }
            (
                anchor.uuid,
                state.tracking_from_physical.inverse() * anchor.local,
            )
        };
        self.world.lock().shared.insert(uuid, physical);
        Ok(uuid)
    }

    async fn download(&self, id: AnchorId) -> XrResult<Vec<Box<dyn UnboundAnchor>>> {
        self.world.suspend().await;
        if !self.world.record(SimOp::Download) {
            return Err(XrError::Download("injected failure".into()));
        }
        let physical = self
            .world
            .shared_anchor(id)
            .ok_or_else(|| XrError::Download(format!("anchor {id} was never shared")))?;
        Ok(vec![Box::new(SimUnboundAnchor {
            world: self.world.clone(),
            headset: self.state.clone(),
            uuid: id,
            physical,
            localized: false,
        })])
    }
}

impl TrackingRig for SimHeadset {
    fn head_pose(&self) -> Pose {
        let state = self.lock();
        state.rig * state.head_local
    }

    fn rig_pose(&self) -> Pose {
        self.lock().rig
    }

    fn set_rig_pose(&self, pose: Pose) {
        self.lock().rig = pose;
    }

    fn subscribe_recentered(&self) -> broadcast::Receiver<()> {
        self.recentered.subscribe()
    }
}

struct SimUnboundAnchor {
    world: Arc<SimWorld>,
    headset: SharedHeadset,
    uuid: AnchorId,
    physical: Pose,
    localized: bool,
}

#[async_trait]
impl UnboundAnchor for SimUnboundAnchor {
    fn uuid(&self) -> AnchorId {
        self.uuid
    }

    async fn localize(&mut self) -> bool {
        self.world.suspend().await;
        self.localized = self.world.record(SimOp::Localize);
        self.localized
    }

    fn pose(&self) -> Option<Pose> {
        if !self.localized {
            return None;
        }
        Some(lock_headset(&self.headset).to_world(&self.physical))
    }

    fn bind_to(self: Box<Self>, handle: LocalAnchorHandle) -> XrResult<()> {
        if !self.world.record(SimOp::Bind) {
            return Err(XrError::Bind("injected failure".into()));
        }
        let mut state = lock_headset(&self.headset);
        let local = state.tracking_from_physical * self.physical;
        let anchor = state
            .anchors
            .get_mut(&handle.0)
            .ok_or_else(|| XrError::Bind(format!("unknown anchor {handle}")))?;
        anchor.uuid = self.uuid;
        anchor.local = local;
        anchor.localized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[tokio::test]
    async fn test_shared_anchor_lands_on_same_physical_spot() {
        let world = SimWorld::new();
        let alice = SimHeadset::new(world.clone(), Pose::IDENTITY);
        let bob = SimHeadset::new(
            world.clone(),
            Pose::new(Vec3::new(3.0, 0.0, -2.0), Quat::from_rotation_y(1.0)),
        );

        let spawn = Pose::from_position(Vec3::new(1.0, 0.0, 1.0));
        let handle = alice.create_local(spawn);
        alice.set_tracking_enabled(handle, true);
        assert!(alice.localize(handle).await);
        let id = alice.share(handle).await.unwrap();

        let mut unbound = bob.download(id).await.unwrap().remove(0);
        assert!(unbound.localize().await);
        let pose = unbound.pose().unwrap();
        assert!(bob.world_to_physical(&pose).abs_diff_eq(&spawn, 1e-4));

        let local = bob.create_local(Pose::IDENTITY);
        unbound.bind_to(local).unwrap();
        assert_eq!(bob.anchor_uuid(local), id);
        assert!(bob.tracked_pose(local).unwrap().abs_diff_eq(&pose, 1e-4));
    }

    #[tokio::test]
    async fn test_localize_requires_tracking() {
        let world = SimWorld::new();
        let headset = SimHeadset::new(world.clone(), Pose::IDENTITY);
        let handle = headset.create_local(Pose::IDENTITY);
        assert!(!headset.localize(handle).await);
        headset.set_tracking_enabled(handle, true);
        assert!(headset.localize(handle).await);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let world = SimWorld::new();
        let headset = SimHeadset::new(world.clone(), Pose::IDENTITY);
        let handle = headset.create_local(Pose::IDENTITY);
        headset.set_tracking_enabled(handle, true);
        world.fail_next(SimOp::Localize, 2);

        assert!(!headset.localize(handle).await);
        assert!(!headset.localize(handle).await);
        assert!(headset.localize(handle).await);
        assert_eq!(world.calls(SimOp::Localize), 3);
    }

    #[test]
    fn test_recenter_moves_world_poses_and_notifies() {
        let world = SimWorld::new();
        let headset = SimHeadset::new(world, Pose::IDENTITY);
        let mut recentered = headset.subscribe_recentered();
        let handle = headset.create_local(Pose::from_position(Vec3::X));

        headset.recenter(Pose::from_position(Vec3::new(0.0, 0.0, 2.0)));

        let pose = headset.tracked_pose(handle).unwrap();
        assert!(pose.position.abs_diff_eq(Vec3::new(1.0, 0.0, 2.0), 1e-5));
        assert!(recentered.try_recv().is_ok());
    }
}
