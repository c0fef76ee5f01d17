use glam::{Mat3, Mat4, Vec3};

/// A rigid transform: orthonormal rotation axes plus a position.
///
/// `rotation.x_axis` is forward, `y_axis` left, `z_axis` up, matching the
/// axis convention of model tags and portal cameras.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub rotation: Mat3,
    pub position: Vec3,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        rotation: Mat3::IDENTITY,
        position: Vec3::ZERO,
    };

    #[must_use]
    pub fn new(rotation: Mat3, position: Vec3) -> Transform {
        Transform { rotation, position }
    }

    /// Rotation axis by index: 0 = forward, 1 = left, 2 = up.
    #[must_use]
    pub fn axis(&self, index: usize) -> Vec3 {
        self.rotation.col(index)
    }

    pub fn set_axis(&mut self, index: usize, v: Vec3) {
        *self.rotation.col_mut(index) = v;
    }

    /// Model matrix combining the rotation and position.
    #[must_use]
    pub fn model_matrix(&self) -> Mat4 {
        model_matrix(self.rotation, self.position)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Transform::IDENTITY
    }
}

/// Build a model matrix from entity rotation axes and a position.
#[must_use]
pub fn model_matrix(rotation: Mat3, position: Vec3) -> Mat4 {
    let mut m = Mat4::from_mat3(rotation);
    m.w_axis = position.extend(1.0);
    m
}

/// Mirror `point` from surface space into camera space.
///
/// Used to derive portal and reflection cameras: the point is expressed in
/// the surface frame, then rebuilt in the (flipped) camera frame.
#[must_use]
pub fn mirrored_point(point: Vec3, surface: &Transform, camera: &Transform) -> Vec3 {
    let local = point - surface.position;
    let mut transformed = Vec3::ZERO;

    for i in 0..3 {
        transformed += camera.axis(i) * local.dot(surface.axis(i));
    }

    transformed + camera.position
}

/// Mirror a direction vector from surface space into camera space.
#[must_use]
pub fn mirrored_vector(v: Vec3, surface: &Transform, camera: &Transform) -> Vec3 {
    let mut transformed = Vec3::ZERO;

    for i in 0..3 {
        transformed += camera.axis(i) * v.dot(surface.axis(i));
    }

    transformed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_matrix_transforms_points() {
        let m = model_matrix(Mat3::IDENTITY, Vec3::new(1.0, 2.0, 3.0));
        let p = m.transform_point3(Vec3::new(1.0, 0.0, 0.0));
        assert!((p - Vec3::new(2.0, 2.0, 3.0)).length() < 1e-5);
    }

    #[test]
    fn mirror_identity_roundtrip() {
        let surface = Transform::IDENTITY;
        let camera = Transform::IDENTITY;
        let p = Vec3::new(3.0, -2.0, 7.0);
        assert!((mirrored_point(p, &surface, &camera) - p).length() < 1e-5);
    }
}
