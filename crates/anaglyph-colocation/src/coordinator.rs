//! Colocation coordinator.
//!
//! Decides whether this peer seeds the first shared anchor or waits to bind
//! someone else's, then keeps the tracking space aligned to the nearest
//! anchored entity every frame. Once colocated, walking too far from every
//! anchor seeds another one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anaglyph_xr::{align_tracking_space, seed_pose, Pose, TrackingRig};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::anchor::NetworkedAnchor;
use crate::config::CoordinatorConfig;
use crate::registry::AnchorRegistry;
use crate::replication::{EntityId, Replication};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// No anchor existed; this peer spawned the first one.
    Seeded(EntityId),
    /// Anchors exist; the rig waits at the sentinel until one is bound.
    Joining,
    /// Colocation was already running; nothing changed.
    AlreadyActive,
}

pub struct ColocationCoordinator {
    registry: Arc<AnchorRegistry>,
    replication: Arc<dyn Replication>,
    rig: Arc<dyn TrackingRig>,
    config: CoordinatorConfig,
    active: AtomicBool,
    target: Mutex<Option<EntityId>>,
    colocated: watch::Sender<bool>,
}

impl ColocationCoordinator {
    pub fn new(
        registry: Arc<AnchorRegistry>,
        replication: Arc<dyn Replication>,
        rig: Arc<dyn TrackingRig>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            replication,
            rig,
            config,
            active: AtomicBool::new(false),
            target: Mutex::new(None),
            colocated: watch::channel(false).0,
        }
    }

    fn target(&self) -> MutexGuard<'_, Option<EntityId>> {
        match self.target.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_colocated(&self) -> bool {
        *self.colocated.borrow()
    }

    pub fn subscribe_colocated(&self) -> watch::Receiver<bool> {
        self.colocated.subscribe()
    }

    /// Entity the rig is currently aligned to.
    pub fn alignment_target(&self) -> Option<EntityId> {
        *self.target()
    }

    /// Decides from the live entities on the network, not the registry,
    /// which may not have caught up yet. Must be called from within a tokio
    /// runtime.
    pub fn start_colocation(&self) -> StartOutcome {
        if self.active.swap(true, Ordering::AcqRel) {
            debug!("colocation already active");
            return StartOutcome::AlreadyActive;
        }
        let live = self.replication.live_anchors();
        if live.is_empty() {
            let entity = self.seed_anchor();
            info!(%entity, "no shared anchors yet; seeded the first one");
            return StartOutcome::Seeded(entity);
        }

        let anchors = live.len();
        for link in live {
            self.registry.adopt(link);
        }
        self.rig
            .set_rig_pose(Pose::from_position(self.config.sentinel_position));
        info!(anchors, "joining existing anchors");
        StartOutcome::Joining
    }

    pub fn stop_colocation(&self) {
        self.active.store(false, Ordering::Release);
        *self.target() = None;
        self.colocated.send_if_modified(|colocated| std::mem::replace(colocated, false));
        debug!("colocation stopped");
    }

    fn seed_anchor(&self) -> EntityId {
        let pose = seed_pose(
            &self.rig.head_pose(),
            self.config.seed_forward_m,
            self.config.seed_below_m,
        );
        let anchor = self.registry.materialize(self.replication.spawn_anchor(pose));
        let entity = anchor.entity();
        tokio::spawn(async move {
            if let Err(reason) = anchor.share().await {
                debug!(entity = %anchor.entity(), %reason, "share abandoned");
            }
        });
        entity
    }

    /// One frame of alignment and coverage growth.
    pub fn update(&self) {
        if !self.is_active() {
            return;
        }

        let head = self.rig.head_pose().position;
        let instances = self.registry.all_instances();
        let mut nearest_distance = f32::INFINITY;
        let mut nearest_anchored: Option<(f32, &Arc<NetworkedAnchor>)> = None;

        for anchor in &instances {
            let distance = anchor.tracked_pose().position.distance(head);
            nearest_distance = nearest_distance.min(distance);
            if anchor.is_anchored()
                && nearest_anchored.map_or(true, |(best, _)| distance < best)
            {
                nearest_anchored = Some((distance, anchor));
            }
        }

        let target = match nearest_anchored {
            Some((_, anchor)) => {
                *self.target() = Some(anchor.entity());
                Some(anchor.clone())
            }
            None => self
                .alignment_target()
                .and_then(|entity| self.registry.get(entity))
                .filter(|anchor| anchor.is_anchored()),
        };

        if let Some(anchor) = target {
            self.align_to(&anchor);
        }

        if self.is_colocated()
            && !instances.is_empty()
            && nearest_distance > self.config.spawn_distance_m
        {
            let entity = self.seed_anchor();
            info!(%entity, distance = nearest_distance, "extending anchor coverage");
        }
    }

    fn align_to(&self, anchor: &NetworkedAnchor) {
        let Some(desired) = anchor.original_pose() else {
            return;
        };
        let observed = anchor.tracked_pose();
        let rig = align_tracking_space(&self.rig.rig_pose(), &observed, &desired);
        self.rig.set_rig_pose(rig);

        let became_colocated = self.colocated.send_if_modified(|colocated| {
            let changed = !*colocated;
            *colocated = true;
            changed
        });
        if became_colocated {
            info!(entity = %anchor.entity(), "colocated");
        }
    }

    /// Ticks [`update`](Self::update) until `shutdown`.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.update(),
            }
        }
    }
}
