//! Math primitives shared by the world, model and draw subsystems.
//!
//! Vectors and matrices come from `glam`; this module adds the spatial types
//! the BSP pipeline needs on top of them: axis-aligned [`Bounds`], [`Plane`]
//! with precomputed sign bits for fast box tests, a camera [`Frustum`], and
//! the rotation+position [`Transform`] used for tags and portal cameras.

mod bounds;
mod frustum;
mod plane;
mod transform;

pub use bounds::Bounds;
pub use frustum::{ClipResult, Frustum};
pub use plane::{Plane, PlaneSide};
pub use transform::{mirrored_point, mirrored_vector, model_matrix, Transform};

use glam::Vec3;

/// An arbitrary vector perpendicular to `v`.
///
/// `v` does not need to be normalized; the result is.
#[must_use]
pub fn perpendicular(v: Vec3) -> Vec3 {
    // Pick the smallest magnitude component and cross against that axis.
    let a = v.abs();
    let axis = if a.x <= a.y && a.x <= a.z {
        Vec3::X
    } else if a.y <= a.z {
        Vec3::Y
    } else {
        Vec3::Z
    };
    v.cross(axis).normalize_or_zero()
}

/// Closest point to `point` on the segment `a`-`b`.
#[must_use]
pub fn closest_point_on_line_segment(a: Vec3, b: Vec3, point: Vec3) -> Vec3 {
    let ab = b - a;
    let len_sq = ab.length_squared();

    if len_sq == 0.0 {
        return a;
    }

    let t = ((point - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    a + ab * t
}

/// Rotate `v` around `axis` (unit length) by `degrees`.
#[must_use]
pub fn rotated_around_direction(v: Vec3, axis: Vec3, degrees: f32) -> Vec3 {
    glam::Quat::from_axis_angle(axis, degrees.to_radians()) * v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perpendicular_is_orthogonal() {
        for v in [Vec3::X, Vec3::new(1.0, 2.0, 3.0), Vec3::new(-4.0, 0.1, 0.0)] {
            let p = perpendicular(v);
            assert!(v.dot(p).abs() < 1e-5);
            assert!((p.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn closest_point_clamps_to_endpoints() {
        let a = Vec3::ZERO;
        let b = Vec3::new(10.0, 0.0, 0.0);
        assert_eq!(closest_point_on_line_segment(a, b, Vec3::new(-5.0, 1.0, 0.0)), a);
        assert_eq!(closest_point_on_line_segment(a, b, Vec3::new(15.0, 1.0, 0.0)), b);
        assert_eq!(
            closest_point_on_line_segment(a, b, Vec3::new(5.0, 3.0, 0.0)),
            Vec3::new(5.0, 0.0, 0.0)
        );
    }
}
