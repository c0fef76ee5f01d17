use glam::{Mat4, Vec3};

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    /// An inverted box ready to accumulate points with [`Bounds::add_point`].
    pub const EMPTY: Bounds = Bounds {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Bounds {
        Bounds { min, max }
    }

    /// A box centered on `origin` extending `radius` on every axis.
    #[must_use]
    pub fn from_origin_radius(origin: Vec3, radius: f32) -> Bounds {
        Bounds {
            min: origin - Vec3::splat(radius),
            max: origin + Vec3::splat(radius),
        }
    }

    pub fn add_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn add_bounds(&mut self, other: Bounds) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    #[must_use]
    pub fn merge(a: Bounds, b: Bounds) -> Bounds {
        Bounds {
            min: a.min.min(b.min),
            max: a.max.max(b.max),
        }
    }

    #[must_use]
    pub fn intersects(a: Bounds, b: Bounds) -> bool {
        a.min.x <= b.max.x
            && a.max.x >= b.min.x
            && a.min.y <= b.max.y
            && a.max.y >= b.min.y
            && a.min.z <= b.max.z
            && a.max.z >= b.min.z
    }

    #[must_use]
    pub fn midpoint(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[must_use]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// The 8 corner vertices.
    #[must_use]
    pub fn corners(&self) -> [Vec3; 8] {
        let (lo, hi) = (self.min, self.max);
        [
            Vec3::new(lo.x, lo.y, lo.z),
            Vec3::new(hi.x, lo.y, lo.z),
            Vec3::new(lo.x, hi.y, lo.z),
            Vec3::new(hi.x, hi.y, lo.z),
            Vec3::new(lo.x, lo.y, hi.z),
            Vec3::new(hi.x, lo.y, hi.z),
            Vec3::new(lo.x, hi.y, hi.z),
            Vec3::new(hi.x, hi.y, hi.z),
        ]
    }

    /// Bounds of the 8 corners pushed through `matrix`.
    #[must_use]
    pub fn transform(&self, matrix: &Mat4) -> Bounds {
        let mut out = Bounds::EMPTY;

        for corner in self.corners() {
            out.add_point(matrix.transform_point3(corner));
        }

        out
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds::new(Vec3::ZERO, Vec3::ZERO)
    }
}
