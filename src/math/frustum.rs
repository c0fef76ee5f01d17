use glam::{Mat4, Vec3};

use crate::math::{Bounds, Plane, Transform};

/// Result of clipping a volume against the frustum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipResult {
    Inside,
    Outside,
    Partial,
}

/// Camera frustum: four side planes through the camera origin.
///
/// The near/far planes are intentionally omitted; BSP worlds rely on PVS for
/// depth rejection and sky geometry sits at arbitrary distance.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    planes: [Plane; 4],
}

impl Frustum {
    /// Build from a camera transform and half-angle fields of view in degrees.
    #[must_use]
    pub fn from_camera(camera: &Transform, fov_x_degrees: f32, fov_y_degrees: f32) -> Frustum {
        let forward = camera.axis(0);
        let left = camera.axis(1);
        let up = camera.axis(2);

        let mut planes = [Plane::default(); 4];

        // Left/right planes rotate forward toward the left axis.
        let angle_x = (fov_x_degrees * 0.5).to_radians();
        let (sin_x, cos_x) = angle_x.sin_cos();
        planes[0] = plane_through(camera.position, forward * sin_x + left * cos_x);
        planes[1] = plane_through(camera.position, forward * sin_x - left * cos_x);

        // Top/bottom planes rotate forward toward the up axis.
        let angle_y = (fov_y_degrees * 0.5).to_radians();
        let (sin_y, cos_y) = angle_y.sin_cos();
        planes[2] = plane_through(camera.position, forward * sin_y + up * cos_y);
        planes[3] = plane_through(camera.position, forward * sin_y - up * cos_y);

        Frustum { planes }
    }

    #[must_use]
    pub fn clip_sphere(&self, center: Vec3, radius: f32) -> ClipResult {
        let mut partial = false;

        for plane in &self.planes {
            let d = plane.side(center);

            if d < -radius {
                return ClipResult::Outside;
            }

            if d < radius {
                partial = true;
            }
        }

        if partial {
            ClipResult::Partial
        } else {
            ClipResult::Inside
        }
    }

    /// Clip a local-space box transformed by `model_matrix`.
    #[must_use]
    pub fn clip_bounds(&self, bounds: Bounds, model_matrix: &Mat4) -> ClipResult {
        let corners = bounds.corners().map(|c| model_matrix.transform_point3(c));
        let mut all_inside = true;

        for plane in &self.planes {
            let mut any_front = false;
            let mut all_front = true;

            for corner in &corners {
                if plane.side(*corner) >= 0.0 {
                    any_front = true;
                } else {
                    all_front = false;
                }
            }

            if !any_front {
                return ClipResult::Outside;
            }

            if !all_front {
                all_inside = false;
            }
        }

        if all_inside {
            ClipResult::Inside
        } else {
            ClipResult::Partial
        }
    }
}

fn plane_through(point: Vec3, normal: Vec3) -> Plane {
    let n = normal.normalize_or(Vec3::X);
    Plane::new(n, n.dot(point))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_in_front_is_inside() {
        let frustum = Frustum::from_camera(&Transform::IDENTITY, 90.0, 90.0);
        assert_eq!(
            frustum.clip_sphere(Vec3::new(100.0, 0.0, 0.0), 1.0),
            ClipResult::Inside
        );
        assert_eq!(
            frustum.clip_sphere(Vec3::new(-100.0, 0.0, 0.0), 1.0),
            ClipResult::Outside
        );
    }

    #[test]
    fn bounds_behind_camera_are_outside() {
        let frustum = Frustum::from_camera(&Transform::IDENTITY, 90.0, 90.0);
        let bounds = Bounds::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let behind = Mat4::from_translation(Vec3::new(-50.0, 0.0, 0.0));
        assert_eq!(frustum.clip_bounds(bounds, &behind), ClipResult::Outside);
    }
}
