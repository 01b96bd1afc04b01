//! Networked anchor entity.
//!
//! The owning peer shares its local anchor and publishes the identifier; every
//! other peer downloads the shared anchor once the identifier shows up and
//! binds it to a local anchor of its own. Both flows retry until they succeed
//! or the entity is disabled. A replica that inherits ownership of an entity
//! nobody has shared yet takes over the share.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anaglyph_xr::{AnchorId, AnchorStore, LocalAnchorHandle, Pose};
use tracing::{debug, info};

use crate::config::AnchorConfig;
use crate::error::{AnchorError, Interrupted, ReplicationError};
use crate::guard::{retry_until_success, Attempt, Liveness};
use crate::replication::{EntityId, ReplicaLink};

pub struct NetworkedAnchor {
    link: Arc<dyn ReplicaLink>,
    store: Arc<dyn AnchorStore>,
    local: LocalAnchorHandle,
    config: AnchorConfig,
    anchored: AtomicBool,
    /// Set while this replica publishes the identifier, so it never
    /// reconciles its own write.
    published: AtomicBool,
    spawned: AtomicBool,
    liveness: Mutex<Liveness>,
}

fn replication_failure(err: ReplicationError) -> Attempt<AnchorError> {
    match err {
        ReplicationError::NotOwner { .. } => Attempt::Interrupted(Interrupted::OwnershipLost),
        other => Attempt::Failed(AnchorError::Replication(other)),
    }
}

impl NetworkedAnchor {
    /// Creates the local anchor for this replica, with tracking disabled.
    pub fn new(
        link: Arc<dyn ReplicaLink>,
        store: Arc<dyn AnchorStore>,
        config: AnchorConfig,
    ) -> Self {
        let local = store.create_local(link.spawn_pose());
        debug!(entity = %link.entity(), %local, "local anchor created");
        Self {
            link,
            store,
            local,
            config,
            anchored: AtomicBool::new(false),
            published: AtomicBool::new(false),
            spawned: AtomicBool::new(false),
            liveness: Mutex::new(Liveness::new()),
        }
    }

    pub fn entity(&self) -> EntityId {
        self.link.entity()
    }

    pub fn local_handle(&self) -> LocalAnchorHandle {
        self.local
    }

    pub fn is_owner(&self) -> bool {
        self.link.has_owner_write_access()
    }

    pub fn is_anchored(&self) -> bool {
        self.anchored.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.liveness().is_alive()
    }

    pub fn identifier(&self) -> AnchorId {
        *self.link.watch_identifier().borrow()
    }

    pub fn original_pose(&self) -> Option<Pose> {
        *self.link.watch_original_pose().borrow()
    }

    /// World pose under the current rig.
    pub fn tracked_pose(&self) -> Pose {
        self.store
            .tracked_pose(self.local)
            .or_else(|| self.original_pose())
            .unwrap_or_else(|| self.link.spawn_pose())
    }

    fn liveness(&self) -> MutexGuard<'_, Liveness> {
        match self.liveness.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn current_liveness(&self) -> Liveness {
        self.liveness().clone()
    }

    /// Disabling interrupts in-flight work at its next suspension point.
    /// Re-enabling resumes reconciliation for a spawned replica.
    pub fn set_enabled(self: &Arc<Self>, enabled: bool) {
        {
            let mut liveness = self.liveness();
            if enabled == liveness.is_alive() {
                return;
            }
            if enabled {
                *liveness = Liveness::new();
            } else {
                liveness.cancel();
            }
        }
        debug!(entity = %self.entity(), enabled, "anchor enabled changed");
        if enabled && self.spawned.load(Ordering::Acquire) {
            self.follow_identifier();
        }
    }

    /// Shares the local anchor and publishes it. Owner only.
    ///
    /// Once an identifier is published the entity is never re-shared; later
    /// calls return it unchanged.
    pub async fn share(&self) -> Result<AnchorId, Interrupted> {
        let liveness = self.current_liveness();
        self.share_with(&liveness).await
    }

    async fn share_with(&self, liveness: &Liveness) -> Result<AnchorId, Interrupted> {
        let existing = self.identifier();
        if !existing.is_nil() {
            return Ok(existing);
        }
        retry_until_success(liveness, self.config.retry_delay(), "share anchor", move || {
            self.try_share(liveness)
        })
        .await
    }

    async fn try_share(&self, liveness: &Liveness) -> Result<AnchorId, Attempt<AnchorError>> {
        if !self.link.has_owner_write_access() {
            return Err(Interrupted::OwnershipLost.into());
        }
        let existing = self.identifier();
        if !existing.is_nil() {
            return Ok(existing);
        }

        let pose = self.tracked_pose();
        let uuid = self.store.anchor_uuid(self.local);
        self.store.set_tracking_enabled(self.local, true);

        if !liveness.settle(self.store.localize(self.local)).await? {
            return Err(Attempt::Failed(AnchorError::LocalizationFailed(uuid)));
        }

        let id = liveness
            .settle(self.store.share(self.local))
            .await?
            .map_err(|err| {
                Attempt::Failed(AnchorError::ShareFailed {
                    id: uuid,
                    reason: err.to_string(),
                })
            })?;

        self.link
            .publish_original_pose(pose)
            .map_err(replication_failure)?;
        self.published.store(true, Ordering::Release);
        if let Err(err) = self.link.publish_identifier(id) {
            self.published.store(false, Ordering::Release);
            return Err(replication_failure(err));
        }
        self.anchored.store(true, Ordering::Release);
        info!(entity = %self.entity(), anchor = %id, "anchor shared");
        Ok(id)
    }

    /// Called once the entity exists on the network. Non-owners start
    /// reconciling as soon as an identifier is published.
    pub fn on_network_spawn(self: &Arc<Self>) {
        if self.spawned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.follow_identifier();
    }

    fn follow_identifier(self: &Arc<Self>) {
        let anchor = self.clone();
        let liveness = self.current_liveness();
        tokio::spawn(async move {
            if let Err(reason) = anchor.await_identifier(&liveness).await {
                debug!(entity = %anchor.entity(), %reason, "reconcile abandoned");
            }
        });
    }

    async fn await_identifier(&self, liveness: &Liveness) -> Result<(), Interrupted> {
        let mut identifier = self.link.watch_identifier();
        let mut owner = self.link.watch_owner();
        loop {
            liveness.check()?;
            let id = *identifier.borrow_and_update();
            if !id.is_nil() {
                if self.is_anchored() || self.published.load(Ordering::Acquire) {
                    return Ok(());
                }
                return self.reconcile(liveness, id).await;
            }
            tokio::select! {
                _ = liveness.cancelled() => return Err(Interrupted::Canceled),
                changed = identifier.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                changed = owner.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let peer = *owner.borrow_and_update();
                    debug!(entity = %self.entity(), owner = %peer, "anchor ownership changed");
                    if peer == self.link.local_peer() && self.identifier().is_nil() {
                        info!(entity = %self.entity(), "inherited unshared anchor; sharing it");
                        self.share_with(liveness).await?;
                    }
                }
            }
        }
    }

    async fn reconcile(&self, liveness: &Liveness, id: AnchorId) -> Result<(), Interrupted> {
        retry_until_success(liveness, self.config.retry_delay(), "bind shared anchor", move || {
            self.try_reconcile(liveness, id)
        })
        .await?;
        info!(entity = %self.entity(), anchor = %id, "shared anchor bound");
        Ok(())
    }

    async fn try_reconcile(
        &self,
        liveness: &Liveness,
        id: AnchorId,
    ) -> Result<(), Attempt<AnchorError>> {
        let mut downloaded = liveness
            .settle(self.store.download(id))
            .await?
            .map_err(|err| {
                Attempt::Failed(AnchorError::DownloadFailed {
                    id,
                    reason: err.to_string(),
                })
            })?;
        if downloaded.is_empty() {
            return Err(Attempt::Failed(AnchorError::DownloadFailed {
                id,
                reason: "no anchor data".into(),
            }));
        }
        let mut unbound = downloaded.swap_remove(0);

        if !liveness.settle(unbound.localize()).await? {
            return Err(Attempt::Failed(AnchorError::LocalizationFailed(id)));
        }
        let pose = unbound
            .pose()
            .ok_or(Attempt::Failed(AnchorError::LocalizationFailed(id)))?;

        self.store.set_pose(self.local, pose);
        unbound.bind_to(self.local).map_err(|err| {
            Attempt::Failed(AnchorError::BindFailed {
                id,
                reason: err.to_string(),
            })
        })?;
        self.store.set_tracking_enabled(self.local, true);
        self.anchored.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops all work for an entity that left the network.
    pub fn despawn(&self) {
        self.liveness().cancel();
        self.store.set_tracking_enabled(self.local, false);
        debug!(entity = %self.entity(), "anchor despawned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{LoopbackNetwork, PeerId, Replication};
    use anaglyph_xr::sim::{SimHeadset, SimOp, SimWorld};
    use glam::Vec3;

    #[tokio::test]
    async fn test_owner_shares_and_publishes() {
        let world = SimWorld::new();
        let headset = SimHeadset::new(world.clone(), Pose::IDENTITY);
        let network = LoopbackNetwork::new();
        let alice = network.join(PeerId(1));
        let spawn = Pose::from_position(Vec3::new(0.0, 0.0, 1.0));

        let anchor = NetworkedAnchor::new(alice.spawn_anchor(spawn), headset, AnchorConfig::default());
        assert!(!anchor.is_anchored());

        let id = anchor.share().await.unwrap();
        assert!(anchor.is_anchored());
        assert_eq!(anchor.identifier(), id);
        assert!(anchor.original_pose().unwrap().abs_diff_eq(&spawn, 1e-5));
        assert_eq!(world.calls(SimOp::Share), 1);
    }

    #[tokio::test]
    async fn test_non_owner_share_reports_ownership_lost() {
        let world = SimWorld::new();
        let headset = SimHeadset::new(world.clone(), Pose::IDENTITY);
        let network = LoopbackNetwork::new();
        let alice = network.join(PeerId(1));
        let bob = network.join(PeerId(2));
        let entity = alice.spawn_anchor(Pose::IDENTITY).entity();

        let anchor = NetworkedAnchor::new(
            bob.link(entity).unwrap(),
            headset,
            AnchorConfig::default(),
        );
        assert_eq!(anchor.share().await, Err(Interrupted::OwnershipLost));
        assert_eq!(world.calls(SimOp::Localize), 0);
    }

    #[tokio::test]
    async fn test_disabled_anchor_does_not_share() {
        let world = SimWorld::new();
        let headset = SimHeadset::new(world.clone(), Pose::IDENTITY);
        let network = LoopbackNetwork::new();
        let alice = network.join(PeerId(1));

        let anchor = Arc::new(NetworkedAnchor::new(
            alice.spawn_anchor(Pose::IDENTITY),
            headset,
            AnchorConfig::default(),
        ));
        anchor.set_enabled(false);
        assert!(!anchor.is_enabled());
        assert_eq!(anchor.share().await, Err(Interrupted::Canceled));
        assert_eq!(world.calls(SimOp::Share), 0);
    }
}
