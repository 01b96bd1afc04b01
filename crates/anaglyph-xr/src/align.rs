//! Tracking-space alignment.
//!
//! Anchors report their pose with some pitch/roll noise; moving the rig by
//! that noise would tilt the whole play space. Every alignment therefore
//! keeps the exact position but only the yaw of the rotation.

use glam::{Quat, Vec3};

use crate::types::Pose;

const MIN_HEADING_LENGTH_SQ: f32 = 1e-6;

/// Yaw-only rotation facing `rotation`'s forward projected onto the ground plane.
///
/// A forward pointing straight up or down has no heading; identity is returned.
pub fn flatten_yaw(rotation: Quat) -> Quat {
    let mut forward = rotation * Vec3::Z;
    forward.y = 0.0;
    if forward.length_squared() < MIN_HEADING_LENGTH_SQ {
        return Quat::IDENTITY;
    }
    Quat::from_rotation_y(forward.x.atan2(forward.z))
}

/// New rig pose that moves an anchor currently seen at `observed` onto `desired`.
///
/// `rig` is the current tracking-space pose in world space and `observed` is
/// the anchor's world pose under that rig.
pub fn align_tracking_space(rig: &Pose, observed: &Pose, desired: &Pose) -> Pose {
    let rig_relative_to_anchor = observed.inverse() * *rig;
    let target = *desired * rig_relative_to_anchor;
    Pose::new(target.position, flatten_yaw(target.orientation))
}

/// Spawn pose for a new shared anchor, `below_m` under and `forward_m` ahead of the head.
pub fn seed_pose(head: &Pose, forward_m: f32, below_m: f32) -> Pose {
    let yaw = flatten_yaw(head.orientation);
    let position = head.position + yaw * Vec3::Z * forward_m - Vec3::Y * below_m;
    Pose::new(position, yaw)
}
