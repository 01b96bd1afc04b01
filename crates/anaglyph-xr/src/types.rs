use std::fmt;
use std::ops::Mul;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a platform-tracked spatial anchor. Nil means unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct AnchorId(pub Uuid);

impl AnchorId {
    pub const NIL: AnchorId = AnchorId(Uuid::nil());

    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for AnchorId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Rigid transform: +Y is up, +Z is forward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        orientation: Quat::IDENTITY,
    };

    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self::new(position, Quat::IDENTITY)
    }

    /// `self * child`: expresses `child` (relative to `self`) in `self`'s parent space.
    pub fn compose(&self, child: &Pose) -> Pose {
        Pose {
            position: self.position + self.orientation * child.position,
            orientation: (self.orientation * child.orientation).normalize(),
        }
    }

    pub fn inverse(&self) -> Pose {
        let inv = self.orientation.inverse();
        Pose {
            position: inv * -self.position,
            orientation: inv,
        }
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.position + self.orientation * point
    }

    pub fn forward(&self) -> Vec3 {
        self.orientation * Vec3::Z
    }

    pub fn distance(&self, other: &Pose) -> f32 {
        self.position.distance(other.position)
    }

    pub fn abs_diff_eq(&self, other: &Pose, max_abs_diff: f32) -> bool {
        self.position.abs_diff_eq(other.position, max_abs_diff)
            && (self.orientation.abs_diff_eq(other.orientation, max_abs_diff)
                || self.orientation.abs_diff_eq(-other.orientation, max_abs_diff))
    }
}

impl Mul for Pose {
    type Output = Pose;

    fn mul(self, rhs: Pose) -> Pose {
        self.compose(&rhs)
    }
}

/// Opaque handle to an anchor created by the local anchor store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalAnchorHandle(pub u64);

impl fmt::Display for LocalAnchorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_inverse_cancels() {
        let pose = Pose::new(
            Vec3::new(1.0, 2.0, -3.0),
            Quat::from_euler(glam::EulerRot::YXZ, 0.7, 0.2, -0.1),
        );
        assert!((pose * pose.inverse()).abs_diff_eq(&Pose::IDENTITY, 1e-5));
        assert!((pose.inverse() * pose).abs_diff_eq(&Pose::IDENTITY, 1e-5));
    }

    #[test]
    fn test_compose_applies_parent_rotation() {
        let parent = Pose::new(Vec3::new(0.0, 0.0, 1.0), Quat::from_rotation_y(FRAC_PI_2));
        let child = Pose::from_position(Vec3::Z);
        let world = parent * child;
        assert!(world.position.abs_diff_eq(Vec3::new(1.0, 0.0, 1.0), 1e-5));
    }

    #[test]
    fn test_nil_anchor_id() {
        assert!(AnchorId::NIL.is_nil());
        assert!(AnchorId::default().is_nil());
        assert!(!AnchorId::new_v4().is_nil());
    }
}
