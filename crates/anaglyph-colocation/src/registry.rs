//! Working set of networked anchors known to this peer.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anaglyph_xr::AnchorStore;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::anchor::NetworkedAnchor;
use crate::config::AnchorConfig;
use crate::replication::{EntityId, LifecycleEvent, ReplicaLink, Replication};

pub struct AnchorRegistry {
    store: Arc<dyn AnchorStore>,
    config: AnchorConfig,
    anchors: RwLock<BTreeMap<EntityId, Arc<NetworkedAnchor>>>,
}

impl AnchorRegistry {
    pub fn new(store: Arc<dyn AnchorStore>, config: AnchorConfig) -> Self {
        Self {
            store,
            config,
            anchors: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<EntityId, Arc<NetworkedAnchor>>> {
        match self.anchors.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<EntityId, Arc<NetworkedAnchor>>> {
        match self.anchors.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the anchor for `link`'s entity, creating it on first sight.
    pub fn materialize(&self, link: Arc<dyn ReplicaLink>) -> Arc<NetworkedAnchor> {
        self.get_or_create(link).0
    }

    fn get_or_create(&self, link: Arc<dyn ReplicaLink>) -> (Arc<NetworkedAnchor>, bool) {
        let entity = link.entity();
        if let Some(existing) = self.get(entity) {
            return (existing, false);
        }
        let mut anchors = self.write();
        if let Some(existing) = anchors.get(&entity) {
            return (existing.clone(), false);
        }
        let anchor = Arc::new(NetworkedAnchor::new(
            link,
            self.store.clone(),
            self.config.clone(),
        ));
        anchors.insert(entity, anchor.clone());
        (anchor, true)
    }

    pub fn get(&self, entity: EntityId) -> Option<Arc<NetworkedAnchor>> {
        self.read().get(&entity).cloned()
    }

    pub fn remove(&self, entity: EntityId) -> Option<Arc<NetworkedAnchor>> {
        self.write().remove(&entity)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn all_instances(&self) -> Vec<Arc<NetworkedAnchor>> {
        self.read().values().cloned().collect()
    }

    pub fn all_anchored(&self) -> Vec<Arc<NetworkedAnchor>> {
        self.read()
            .values()
            .filter(|anchor| anchor.is_anchored())
            .cloned()
            .collect()
    }

    /// Materializes `link` and starts following its identifier.
    pub(crate) fn adopt(&self, link: Arc<dyn ReplicaLink>) {
        let (anchor, created) = self.get_or_create(link);
        if created {
            debug!(entity = %anchor.entity(), "anchor adopted");
        }
        anchor.on_network_spawn();
    }

    fn drop_entity(&self, entity: EntityId) {
        if let Some(anchor) = self.remove(entity) {
            anchor.despawn();
        }
    }

    fn resync(&self, replication: &dyn Replication) {
        let live = replication.live_anchors();
        let known: Vec<EntityId> = self.read().keys().copied().collect();
        for entity in known {
            if !live.iter().any(|link| link.entity() == entity) {
                self.drop_entity(entity);
            }
        }
        for link in live {
            self.adopt(link);
        }
    }

    /// Mirrors the replication layer's anchor entities until `shutdown`.
    pub async fn track_lifecycle(
        &self,
        replication: Arc<dyn Replication>,
        shutdown: CancellationToken,
    ) {
        let mut events = replication.subscribe_lifecycle();
        self.resync(replication.as_ref());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(LifecycleEvent::Spawned(entity)) => {
                        if let Some(link) = replication.link(entity) {
                            self.adopt(link);
                        }
                    }
                    Ok(LifecycleEvent::Despawned(entity)) => self.drop_entity(entity),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "lifecycle events lagged; resyncing");
                        self.resync(replication.as_ref());
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }
}
