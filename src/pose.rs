use glam::f32::{Mat4, Quat, Vec3};
use std::ops::Mul;

/// A rigid transform: rotation followed by translation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Self = Self {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };

    #[inline]
    pub fn new(orientation: Quat, position: Vec3) -> Self {
        Self {
            orientation,
            position,
        }
    }

    #[inline]
    pub fn from_position(position: Vec3) -> Self {
        Self::new(Quat::IDENTITY, position)
    }

    #[inline]
    pub fn inverse(&self) -> Self {
        let orientation = self.orientation.inverse();
        Self {
            orientation,
            position: orientation * -self.position,
        }
    }

    #[inline]
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.orientation * point + self.position
    }

    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.orientation, self.position)
    }

    /// Scales the translation only, used when converting between world units and meters.
    #[inline]
    pub fn scale_position(&self, scale: f32) -> Self {
        Self::new(self.orientation, self.position * scale)
    }

    pub fn approx_eq(&self, other: &Pose, epsilon: f32) -> bool {
        self.position.abs_diff_eq(other.position, epsilon)
            && (self.orientation.abs_diff_eq(other.orientation, epsilon)
                || self.orientation.abs_diff_eq(-other.orientation, epsilon))
    }
}

/// `a * b` expresses `b` (given relative to `a`) in the frame `a` is relative to.
impl Mul for Pose {
    type Output = Pose;

    #[inline]
    fn mul(self, rhs: Pose) -> Pose {
        Pose {
            orientation: (self.orientation * rhs.orientation).normalize(),
            position: self.orientation * rhs.position + self.position,
        }
    }
}

/// Per-view field of view, angles in radians (left/down are negative).
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fov {
    pub fn symmetric(horizontal: f32, vertical: f32) -> Self {
        Self {
            angle_left: -horizontal / 2.0,
            angle_right: horizontal / 2.0,
            angle_up: vertical / 2.0,
            angle_down: -vertical / 2.0,
        }
    }

    pub fn horizontal(&self) -> f32 {
        self.angle_right - self.angle_left
    }

    pub fn vertical(&self) -> f32 {
        self.angle_up - self.angle_down
    }
}

/// Keeps only the rotation around the vertical (+Y) axis.
pub fn yaw_only(rotation: Quat) -> Quat {
    swing_twist_decomposition(rotation, Vec3::Y)
        .map(|(twist, _)| twist)
        .unwrap_or_else(|| {
            log::warn!("Couldn't decompose rotation - using identity");
            Quat::IDENTITY
        })
}

/// Decompose the rotation on to 2 parts.
///
/// 1. Twist - rotation around the "direction" vector
/// 2. Swing - rotation around axis that is perpendicular to "direction" vector
///
/// The rotation can be composed back by
/// `rotation = swing * twist`.
/// Order matters!
///
/// has singularity in case of swing_rotation close to 180 degrees rotation.
/// if the input quaternion is of non-unit length, the outputs are non-unit as well
/// otherwise, outputs are both unit
pub(crate) fn swing_twist_decomposition(rotation: Quat, axis: Vec3) -> Option<(Quat, Quat)> {
    let rotation_axis = rotation.xyz();
    let projection = rotation_axis.project_onto(axis);

    let twist = {
        let maybe_flipped_twist = Quat::from_vec4(projection.extend(rotation.w));
        if rotation_axis.dot(projection) < 0.0 {
            -maybe_flipped_twist
        } else {
            maybe_flipped_twist
        }
    };

    if twist.length_squared() != 0.0 {
        let swing = rotation * twist.conjugate();
        Some((twist.normalize(), swing))
    } else {
        None
    }
}
