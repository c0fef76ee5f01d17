use glam::Vec3;

use crate::math::Bounds;

/// Which side(s) of a plane a box lies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneSide {
    Front,
    Back,
    /// The plane crosses the box.
    Both,
}

/// A plane in `normal · p = distance` form.
///
/// [`Plane::setup_fast_bounds_test`] precomputes the normal's sign bits so
/// box-vs-plane tests only touch the two relevant corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
    sign_bits: u8,
}

impl Plane {
    #[must_use]
    pub fn new(normal: Vec3, distance: f32) -> Plane {
        let mut plane = Plane {
            normal,
            distance,
            sign_bits: 0,
        };
        plane.setup_fast_bounds_test();
        plane
    }

    /// Plane through three points, winding `v3 - v1` × `v2 - v1`.
    #[must_use]
    pub fn from_points(v1: Vec3, v2: Vec3, v3: Vec3) -> Plane {
        let normal = (v3 - v1).cross(v2 - v1).normalize_or(Vec3::X);
        Plane::new(normal, v1.dot(normal))
    }

    pub fn setup_fast_bounds_test(&mut self) {
        let mut bits = 0u8;

        for i in 0..3 {
            if self.normal[i] < 0.0 {
                bits |= 1 << i;
            }
        }

        self.sign_bits = bits;
    }

    /// Signed distance from `point` to the plane.
    #[must_use]
    pub fn side(&self, point: Vec3) -> f32 {
        self.normal.dot(point) - self.distance
    }

    /// Fast box-on-plane-side test using the precomputed sign bits.
    #[must_use]
    pub fn test_bounds(&self, bounds: Bounds) -> PlaneSide {
        // The near and far corners along the plane normal.
        let mut near = Vec3::ZERO;
        let mut far = Vec3::ZERO;

        for i in 0..3 {
            if self.sign_bits & (1 << i) != 0 {
                near[i] = bounds.max[i];
                far[i] = bounds.min[i];
            } else {
                near[i] = bounds.min[i];
                far[i] = bounds.max[i];
            }
        }

        let d_near = self.normal.dot(near) - self.distance;
        let d_far = self.normal.dot(far) - self.distance;

        if d_near > 0.0 {
            PlaneSide::Front
        } else if d_far < 0.0 {
            PlaneSide::Back
        } else {
            PlaneSide::Both
        }
    }

    /// Flip the plane to face the other way.
    #[must_use]
    pub fn inverse(&self) -> Plane {
        Plane::new(-self.normal, -self.distance)
    }
}

impl Default for Plane {
    fn default() -> Self {
        Plane::new(Vec3::X, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_sides() {
        let plane = Plane::new(Vec3::X, 0.0);
        let front = Bounds::new(Vec3::new(1.0, -1.0, -1.0), Vec3::new(2.0, 1.0, 1.0));
        let back = Bounds::new(Vec3::new(-2.0, -1.0, -1.0), Vec3::new(-1.0, 1.0, 1.0));
        let both = Bounds::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        assert_eq!(plane.test_bounds(front), PlaneSide::Front);
        assert_eq!(plane.test_bounds(back), PlaneSide::Back);
        assert_eq!(plane.test_bounds(both), PlaneSide::Both);
    }

    #[test]
    fn negative_normal_sides() {
        let plane = Plane::new(-Vec3::Y, 5.0); // y = -5 facing -y
        let front = Bounds::new(Vec3::new(-1.0, -8.0, -1.0), Vec3::new(1.0, -7.0, 1.0));
        assert_eq!(plane.test_bounds(front), PlaneSide::Front);
    }
}
