//! Replicated entity state.
//!
//! A networked anchor entity carries two replicated fields, its original pose
//! and its shared anchor identifier. Only the owning peer may write them; every
//! peer observes them through `watch` channels. The identifier is written at
//! most once.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use anaglyph_xr::{AnchorId, Pose};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::error::ReplicationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Spawned(EntityId),
    Despawned(EntityId),
}

/// One peer's view of a replicated anchor entity.
pub trait ReplicaLink: Send + Sync {
    fn entity(&self) -> EntityId;
    fn local_peer(&self) -> PeerId;
    fn owner(&self) -> PeerId;

    fn has_owner_write_access(&self) -> bool {
        self.owner() == self.local_peer()
    }

    fn watch_owner(&self) -> watch::Receiver<PeerId>;
    fn watch_original_pose(&self) -> watch::Receiver<Option<Pose>>;
    fn watch_identifier(&self) -> watch::Receiver<AnchorId>;

    /// Pose the entity was spawned at, in the spawning peer's world space.
    fn spawn_pose(&self) -> Pose;

    /// Rejected once the identifier is published.
    fn publish_original_pose(&self, pose: Pose) -> Result<(), ReplicationError>;

    /// Accepted once per entity. Re-publishing the current value is a no-op.
    fn publish_identifier(&self, id: AnchorId) -> Result<(), ReplicationError>;
}

/// Entity spawning and ownership for one peer.
pub trait Replication: Send + Sync {
    fn local_peer(&self) -> PeerId;
    /// Spawns an anchor entity owned by this peer.
    fn spawn_anchor(&self, pose: Pose) -> Arc<dyn ReplicaLink>;
    fn link(&self, entity: EntityId) -> Option<Arc<dyn ReplicaLink>>;
    fn live_anchors(&self) -> Vec<Arc<dyn ReplicaLink>>;
    fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent>;
    fn despawn(&self, entity: EntityId) -> Result<(), ReplicationError>;
    fn transfer_ownership(&self, entity: EntityId, to: PeerId) -> Result<(), ReplicationError>;
}

#[derive(Debug)]
struct EntityRecord {
    spawn_pose: Pose,
    owner: watch::Sender<PeerId>,
    original_pose: watch::Sender<Option<Pose>>,
    identifier: watch::Sender<AnchorId>,
}

#[derive(Debug, Default)]
struct NetworkState {
    next_entity: u64,
    entities: BTreeMap<EntityId, Arc<EntityRecord>>,
}

/// In-process replication: every joined peer shares one authoritative record
/// per entity.
#[derive(Debug)]
pub struct LoopbackNetwork {
    state: Mutex<NetworkState>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        let (lifecycle, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(NetworkState {
                next_entity: 1,
                entities: BTreeMap::new(),
            }),
            lifecycle,
        })
    }

    pub fn join(self: &Arc<Self>, peer: PeerId) -> Arc<LoopbackReplication> {
        debug!(%peer, "peer joined loopback network");
        Arc::new(LoopbackReplication {
            network: self.clone(),
            peer,
        })
    }

    pub fn entity_count(&self) -> usize {
        self.lock().entities.len()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, entity: EntityId) -> Option<Arc<EntityRecord>> {
        self.lock().entities.get(&entity).cloned()
    }
}

#[derive(Debug)]
pub struct LoopbackReplication {
    network: Arc<LoopbackNetwork>,
    peer: PeerId,
}

impl LoopbackReplication {
    fn link_for(&self, entity: EntityId, record: Arc<EntityRecord>) -> Arc<dyn ReplicaLink> {
        Arc::new(LoopbackLink {
            network: self.network.clone(),
            entity,
            peer: self.peer,
            record,
        })
    }
}

impl Replication for LoopbackReplication {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn spawn_anchor(&self, pose: Pose) -> Arc<dyn ReplicaLink> {
        let (entity, record) = {
            let mut state = self.network.lock();
            let entity = EntityId(state.next_entity);
            state.next_entity += 1;
            let record = Arc::new(EntityRecord {
                spawn_pose: pose,
                owner: watch::channel(self.peer).0,
                original_pose: watch::channel(None).0,
                identifier: watch::channel(AnchorId::NIL).0,
            });
            state.entities.insert(entity, record.clone());
            (entity, record)
        };
        info!(%entity, owner = %self.peer, "anchor entity spawned");
        let _ = self.network.lifecycle.send(LifecycleEvent::Spawned(entity));
        self.link_for(entity, record)
    }

    fn link(&self, entity: EntityId) -> Option<Arc<dyn ReplicaLink>> {
        self.network
            .record(entity)
            .map(|record| self.link_for(entity, record))
    }

    fn live_anchors(&self) -> Vec<Arc<dyn ReplicaLink>> {
        let records: Vec<_> = self
            .network
            .lock()
            .entities
            .iter()
            .map(|(entity, record)| (*entity, record.clone()))
            .collect();
        records
            .into_iter()
            .map(|(entity, record)| self.link_for(entity, record))
            .collect()
    }

    fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.network.lifecycle.subscribe()
    }

    fn despawn(&self, entity: EntityId) -> Result<(), ReplicationError> {
        let removed = self.network.lock().entities.remove(&entity);
        if removed.is_none() {
            return Err(ReplicationError::UnknownEntity(entity.0));
        }
        info!(%entity, "anchor entity despawned");
        let _ = self.network.lifecycle.send(LifecycleEvent::Despawned(entity));
        Ok(())
    }

    fn transfer_ownership(&self, entity: EntityId, to: PeerId) -> Result<(), ReplicationError> {
        let record = self
            .network
            .record(entity)
            .ok_or(ReplicationError::UnknownEntity(entity.0))?;
        record.owner.send_if_modified(|owner| {
            let changed = *owner != to;
            *owner = to;
            changed
        });
        info!(%entity, owner = %to, "ownership transferred");
        Ok(())
    }
}

#[derive(Debug)]
struct LoopbackLink {
    network: Arc<LoopbackNetwork>,
    entity: EntityId,
    peer: PeerId,
    record: Arc<EntityRecord>,
}

impl LoopbackLink {
    fn ensure_writable(&self) -> Result<(), ReplicationError> {
        if self.network.record(self.entity).is_none() {
            return Err(ReplicationError::UnknownEntity(self.entity.0));
        }
        if !self.has_owner_write_access() {
            return Err(ReplicationError::NotOwner {
                entity: self.entity.0,
                peer: self.peer.0,
            });
        }
        Ok(())
    }
}

impl ReplicaLink for LoopbackLink {
    fn entity(&self) -> EntityId {
        self.entity
    }

    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn owner(&self) -> PeerId {
        *self.record.owner.borrow()
    }

    fn watch_owner(&self) -> watch::Receiver<PeerId> {
        self.record.owner.subscribe()
    }

    fn watch_original_pose(&self) -> watch::Receiver<Option<Pose>> {
        self.record.original_pose.subscribe()
    }

    fn watch_identifier(&self) -> watch::Receiver<AnchorId> {
        self.record.identifier.subscribe()
    }

    fn spawn_pose(&self) -> Pose {
        self.record.spawn_pose
    }

    fn publish_original_pose(&self, pose: Pose) -> Result<(), ReplicationError> {
        self.ensure_writable()?;
        if !self.record.identifier.borrow().is_nil() {
            return Err(ReplicationError::PoseAlreadyPublished(self.entity.0));
        }
        self.record.original_pose.send_replace(Some(pose));
        Ok(())
    }

    fn publish_identifier(&self, id: AnchorId) -> Result<(), ReplicationError> {
        if id.is_nil() {
            return Err(ReplicationError::NilIdentifier);
        }
        self.ensure_writable()?;

        let mut outcome = Ok(());
        self.record.identifier.send_if_modified(|current| {
            if current.is_nil() {
                *current = id;
                return true;
            }
            if *current != id {
                outcome = Err(ReplicationError::IdentifierAlreadyAssigned {
                    entity: self.entity.0,
                    existing: *current,
                });
            }
            false
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_only_owner_writes() {
        let network = LoopbackNetwork::new();
        let alice = network.join(PeerId(1));
        let bob = network.join(PeerId(2));

        let link = alice.spawn_anchor(Pose::IDENTITY);
        let remote = bob.link(link.entity()).unwrap();
        assert!(link.has_owner_write_access());
        assert!(!remote.has_owner_write_access());

        let err = remote.publish_identifier(AnchorId::new_v4()).unwrap_err();
        assert_eq!(
            err,
            ReplicationError::NotOwner {
                entity: link.entity().0,
                peer: 2
            }
        );
        assert!(remote
            .publish_original_pose(Pose::from_position(Vec3::X))
            .is_err());
        assert_eq!(*remote.watch_original_pose().borrow(), None);
    }

    #[test]
    fn test_identifier_is_set_once() {
        let network = LoopbackNetwork::new();
        let alice = network.join(PeerId(1));
        let link = alice.spawn_anchor(Pose::IDENTITY);
        let first = AnchorId::new_v4();

        assert_eq!(
            link.publish_identifier(AnchorId::NIL),
            Err(ReplicationError::NilIdentifier)
        );
        link.publish_identifier(first).unwrap();
        link.publish_identifier(first).unwrap();
        assert!(matches!(
            link.publish_identifier(AnchorId::new_v4()),
            Err(ReplicationError::IdentifierAlreadyAssigned { existing, .. }) if existing == first
        ));
        assert_eq!(*link.watch_identifier().borrow(), first);
    }

    #[test]
    fn test_original_pose_is_fixed_once_shared() {
        let network = LoopbackNetwork::new();
        let alice = network.join(PeerId(1));
        let link = alice.spawn_anchor(Pose::IDENTITY);
        let first = Pose::from_position(Vec3::Z);

        link.publish_original_pose(Pose::from_position(Vec3::X)).unwrap();
        link.publish_original_pose(first).unwrap();
        link.publish_identifier(AnchorId::new_v4()).unwrap();

        assert_eq!(
            link.publish_original_pose(Pose::from_position(Vec3::Y)),
            Err(ReplicationError::PoseAlreadyPublished(link.entity().0))
        );
        assert_eq!(*link.watch_original_pose().borrow(), Some(first));
    }

    #[test]
    fn test_writes_are_visible_to_every_peer() {
        let network = LoopbackNetwork::new();
        let alice = network.join(PeerId(1));
        let bob = network.join(PeerId(2));
        let link = alice.spawn_anchor(Pose::IDENTITY);
        let mut identifier = bob.link(link.entity()).unwrap().watch_identifier();

        let id = AnchorId::new_v4();
        link.publish_identifier(id).unwrap();
        assert!(identifier.has_changed().unwrap());
        assert_eq!(*identifier.borrow_and_update(), id);
    }

    #[test]
    fn test_transfer_moves_write_access() {
        let network = LoopbackNetwork::new();
        let alice = network.join(PeerId(1));
        let bob = network.join(PeerId(2));
        let link = alice.spawn_anchor(Pose::IDENTITY);
        let remote = bob.link(link.entity()).unwrap();

        bob.transfer_ownership(link.entity(), PeerId(2)).unwrap();
        assert!(!link.has_owner_write_access());
        assert!(remote.has_owner_write_access());
        assert!(remote.publish_original_pose(Pose::IDENTITY).is_ok());
    }

    #[test]
    fn test_despawn_broadcasts_and_blocks_writes() {
        let network = LoopbackNetwork::new();
        let alice = network.join(PeerId(1));
        let mut events = alice.subscribe_lifecycle();
        let link = alice.spawn_anchor(Pose::IDENTITY);

        alice.despawn(link.entity()).unwrap();
        assert_eq!(events.try_recv().unwrap(), LifecycleEvent::Spawned(link.entity()));
        assert_eq!(events.try_recv().unwrap(), LifecycleEvent::Despawned(link.entity()));
        assert_eq!(network.entity_count(), 0);
        assert_eq!(
            link.publish_identifier(AnchorId::new_v4()),
            Err(ReplicationError::UnknownEntity(link.entity().0))
        );
        assert!(alice.despawn(link.entity()).is_err());
    }
}
