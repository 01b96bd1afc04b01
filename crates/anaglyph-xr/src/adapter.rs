use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
    types::{AnchorId, LocalAnchorHandle, Pose},
    XrResult,
};

/// Platform anchor-tracking API.
///
/// Poses are world poses under the headset's current rig; they move when the
/// rig moves. Every async method is a suspension point for callers.
#[async_trait]
pub trait AnchorStore: Send + Sync {
    /// Creates an anchor at `pose` with spatial tracking disabled.
    fn create_local(&self, pose: Pose) -> LocalAnchorHandle;
    fn anchor_uuid(&self, handle: LocalAnchorHandle) -> AnchorId;
    fn set_tracking_enabled(&self, handle: LocalAnchorHandle, enabled: bool);
    fn tracked_pose(&self, handle: LocalAnchorHandle) -> Option<Pose>;
    fn set_pose(&self, handle: LocalAnchorHandle, pose: Pose);

    /// Resolves once the platform has localized the anchor (or given up).
    async fn localize(&self, handle: LocalAnchorHandle) -> bool;
    /// Uploads the anchor to the shared-anchor store.
    async fn share(&self, handle: LocalAnchorHandle) -> XrResult<AnchorId>;
    /// Fetches anchor data previously shared under `id`.
    async fn download(&self, id: AnchorId) -> XrResult<Vec<Box<dyn UnboundAnchor>>>;
}

/// Downloaded anchor data not yet attached to a local anchor.
#[async_trait]
pub trait UnboundAnchor: Send + Sync {
    fn uuid(&self) -> AnchorId;
    async fn localize(&mut self) -> bool;
    fn pose(&self) -> Option<Pose>;
    /// Attaches the data to `handle` so it localizes from the shared map from now on.
    fn bind_to(self: Box<Self>, handle: LocalAnchorHandle) -> XrResult<()>;
}

/// The headset's tracking space (the rig) and head tracking.
pub trait TrackingRig: Send + Sync {
    /// Head pose in world space.
    fn head_pose(&self) -> Pose;
    /// Pose of the tracking space in world space.
    fn rig_pose(&self) -> Pose;
    fn set_rig_pose(&self, pose: Pose);
    /// Fires whenever the user recenters tracking.
    fn subscribe_recentered(&self) -> broadcast::Receiver<()>;
}
