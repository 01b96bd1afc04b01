//! Keeps a single-user play space fixed in the physical room across recenters.

use std::sync::Arc;

use anaglyph_xr::{align_tracking_space, AnchorStore, LocalAnchorHandle, Pose, TrackingRig};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct WorldLockAnchor {
    store: Arc<dyn AnchorStore>,
    rig: Arc<dyn TrackingRig>,
    local: LocalAnchorHandle,
    target: Pose,
}

impl WorldLockAnchor {
    /// Places a tracked anchor at `target`, the world pose it should keep.
    pub fn new(store: Arc<dyn AnchorStore>, rig: Arc<dyn TrackingRig>, target: Pose) -> Self {
        let local = store.create_local(target);
        store.set_tracking_enabled(local, true);
        Self {
            store,
            rig,
            local,
            target,
        }
    }

    pub fn target(&self) -> Pose {
        self.target
    }

    /// Moves the rig so the anchor sits on its target again. Returns `false`
    /// when the anchor could not be localized and nothing changed.
    pub async fn realign(&self) -> bool {
        if !self.store.localize(self.local).await {
            debug!(anchor = %self.local, "world lock anchor not localized; skipping");
            return false;
        }
        let Some(observed) = self.store.tracked_pose(self.local) else {
            return false;
        };
        let rig = align_tracking_space(&self.rig.rig_pose(), &observed, &self.target);
        self.rig.set_rig_pose(rig);
        info!(anchor = %self.local, "world lock realigned");
        true
    }

    /// Realigns after every recenter until `shutdown`.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut recentered = self.rig.subscribe_recentered();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = recentered.recv() => match event {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        self.realign().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anaglyph_xr::sim::{SimHeadset, SimOp, SimWorld};
    use glam::{Quat, Vec3};

    #[tokio::test]
    async fn test_realign_undoes_recenter() {
        let world = SimWorld::new();
        let headset = SimHeadset::new(world, Pose::IDENTITY);
        let target = Pose::new(Vec3::new(1.0, 0.0, 2.0), Quat::from_rotation_y(0.3));
        let lock = WorldLockAnchor::new(headset.clone(), headset.clone(), target);
        let physical = headset.world_to_physical(&target);

        headset.recenter(Pose::new(Vec3::new(-0.5, 0.0, 0.7), Quat::from_rotation_y(1.1)));
        assert!(!headset.physical_to_world(&physical).abs_diff_eq(&target, 1e-3));

        assert!(lock.realign().await);
        assert!(headset.physical_to_world(&physical).abs_diff_eq(&target, 1e-4));
    }

    #[tokio::test]
    async fn test_unlocalized_anchor_leaves_rig_alone() {
        let world = SimWorld::new();
        let headset = SimHeadset::new(world.clone(), Pose::IDENTITY);
        let lock = WorldLockAnchor::new(headset.clone(), headset.clone(), Pose::IDENTITY);
        headset.recenter(Pose::from_position(Vec3::X));
        world.fail_next(SimOp::Localize, 1);

        assert!(!lock.realign().await);
        assert_eq!(headset.rig_pose(), Pose::IDENTITY);
    }
}
