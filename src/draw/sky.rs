//! Sky box and cloud layer rendering.
//!
//! Visible sky polygons are clipped against the six diagonal planes of the
//! sky cube to find per-side coverage; only the covered region of each face
//! is tessellated (an 8x8 subdivision grid) into transient geometry. Cloud
//! layer texture coordinates are precomputed per cloud height by projecting
//! each sky vector onto a cloud sphere.

use glam::Vec3;

use crate::draw::{DrawCall, DrawCallFlags, DrawCallList, IndexBufferRange, IndexBufferSource, VertexBufferRange};
use crate::gpu::GraphicsDevice;
use crate::material::MaterialCache;
use crate::texture::TextureId;
use crate::vertex::Vertex;
use crate::world::SkySurface;

const SKY_SUBDIVISIONS: usize = 8;
const HALF_SKY_SUBDIVISIONS: i32 = (SKY_SUBDIVISIONS / 2) as i32;
const ON_EPSILON: f32 = 0.1;
const MAX_CLIP_VERTS: usize = 64;

/// Radius of the world for the cloud sphere intersection.
const CLOUD_SPHERE_RADIUS: f32 = 4096.0;

const SKY_CLIP: [Vec3; 6] = [
    Vec3::new(1.0, 1.0, 0.0),
    Vec3::new(1.0, -1.0, 0.0),
    Vec3::new(0.0, -1.0, 1.0),
    Vec3::new(0.0, 1.0, 1.0),
    Vec3::new(1.0, 0.0, 1.0),
    Vec3::new(-1.0, 0.0, 1.0),
];

// s = [0]/[2], t = [1]/[2]
const VEC_TO_ST: [[i32; 3]; 6] = [
    [-2, 3, 1],
    [2, 3, -1],
    [1, 3, 2],
    [-1, 3, -2],
    [-2, -1, 3],
    [-2, 1, -3],
];

// 1 = s, 2 = t, 3 = sky distance
const ST_TO_VEC: [[i32; 3]; 6] = [
    [3, -1, 2],
    [-3, 1, 2],
    [1, 3, 2],
    [-1, -3, 2],
    [-2, -1, 3], // 0 degrees yaw, look straight up
    [2, -1, -3], // look straight down
];

/// Per-side s/t coverage of the sky cube.
struct SkyBounds {
    mins: [[f32; 6]; 2],
    maxs: [[f32; 6]; 2],
}

impl SkyBounds {
    fn cleared() -> SkyBounds {
        SkyBounds {
            mins: [[9999.0; 6]; 2],
            maxs: [[-9999.0; 6]; 2],
        }
    }

    /// Project a fully clipped polygon onto its dominant axis and grow that
    /// side's coverage.
    fn add_polygon(&mut self, vecs: &[Vec3]) {
        // Decide which face it maps to.
        let mut v = Vec3::ZERO;

        for vec in vecs {
            v += *vec;
        }

        let av = v.abs();

        let axis = if av.x > av.y && av.x > av.z {
            usize::from(v.x < 0.0)
        } else if av.y > av.z && av.y > av.x {
            2 + usize::from(v.y < 0.0)
        } else {
            4 + usize::from(v.z < 0.0)
        };

        // Project new texture coords.
        for vec in vecs {
            let j = VEC_TO_ST[axis][2];
            let dv = if j > 0 {
                vec[(j - 1) as usize]
            } else {
                -vec[(-j - 1) as usize]
            };

            if dv < 0.001 {
                continue; // don't divide by zero
            }

            let j = VEC_TO_ST[axis][0];
            let s = if j < 0 {
                -vec[(-j - 1) as usize] / dv
            } else {
                vec[(j - 1) as usize] / dv
            };

            let j = VEC_TO_ST[axis][1];
            let t = if j < 0 {
                -vec[(-j - 1) as usize] / dv
            } else {
                vec[(j - 1) as usize] / dv
            };

            self.mins[0][axis] = self.mins[0][axis].min(s);
            self.mins[1][axis] = self.mins[1][axis].min(t);
            self.maxs[0][axis] = self.maxs[0][axis].max(s);
            self.maxs[1][axis] = self.maxs[1][axis].max(t);
        }
    }

    fn clip_polygon(&mut self, vecs: &[Vec3], stage: usize) {
        if vecs.len() > MAX_CLIP_VERTS - 2 {
            // Give up on degenerate input rather than overflow.
            return;
        }

        if stage == 6 {
            // Fully clipped, so project it.
            self.add_polygon(vecs);
            return;
        }

        let mut front = false;
        let mut back = false;
        let mut dists = [0.0f32; MAX_CLIP_VERTS];
        let mut sides = [0u8; MAX_CLIP_VERTS];

        for (i, vec) in vecs.iter().enumerate() {
            let d = vec.dot(SKY_CLIP[stage]);
            dists[i] = d;
            sides[i] = if d > ON_EPSILON {
                front = true;
                0
            } else if d < -ON_EPSILON {
                back = true;
                1
            } else {
                2
            };
        }

        if !front || !back {
            // Not clipped by this plane.
            self.clip_polygon(vecs, stage + 1);
            return;
        }

        // Clip it.
        sides[vecs.len()] = sides[0];
        dists[vecs.len()] = dists[0];
        let mut new_front: Vec<Vec3> = Vec::with_capacity(vecs.len() + 1);
        let mut new_back: Vec<Vec3> = Vec::with_capacity(vecs.len() + 1);

        for (i, vec) in vecs.iter().enumerate() {
            match sides[i] {
                0 => new_front.push(*vec),
                1 => new_back.push(*vec),
                _ => {
                    new_front.push(*vec);
                    new_back.push(*vec);
                }
            }

            if sides[i] == 2 || sides[i + 1] == 2 || sides[i + 1] == sides[i] {
                continue;
            }

            let d = dists[i] / (dists[i] - dists[i + 1]);
            let next = vecs[(i + 1) % vecs.len()];
            let split = *vec + (next - *vec) * d;
            new_front.push(split);
            new_back.push(split);
        }

        self.clip_polygon(&new_front, stage + 1);
        self.clip_polygon(&new_back, stage + 1);
    }

    /// Snap a side's coverage to the subdivision grid. `None` when the side
    /// has no coverage.
    fn side_coverage(&mut self, side: usize, min_t: i32) -> Option<([i32; 2], [i32; 2])> {
        let half = HALF_SKY_SUBDIVISIONS as f32;
        self.mins[0][side] = (self.mins[0][side] * half).floor() / half;
        self.mins[1][side] = (self.mins[1][side] * half).floor() / half;
        self.maxs[0][side] = (self.maxs[0][side] * half).ceil() / half;
        self.maxs[1][side] = (self.maxs[1][side] * half).ceil() / half;

        if self.mins[0][side] >= self.maxs[0][side] || self.mins[1][side] >= self.maxs[1][side] {
            return None;
        }

        let clamp_s =
            |v: f32| ((v * half) as i32).clamp(-HALF_SKY_SUBDIVISIONS, HALF_SKY_SUBDIVISIONS);
        let clamp_t = |v: f32| ((v * half) as i32).clamp(min_t, HALF_SKY_SUBDIVISIONS);

        Some((
            [clamp_s(self.mins[0][side]), clamp_t(self.mins[1][side])],
            [clamp_s(self.maxs[0][side]), clamp_t(self.maxs[1][side])],
        ))
    }
}

/// Sky vector for parametric (s, t) in [-1, 1] on a cube side, plus the
/// seam-avoiding texture coordinate.
fn make_sky_vec(z_max: f32, s: f32, t: f32, axis: usize, sky_min: f32, sky_max: f32) -> (Vec3, (f32, f32)) {
    let box_size = z_max / 1.75; // div sqrt(3)
    let b = [s * box_size, t * box_size, box_size];
    let mut position = Vec3::ZERO;

    for j in 0..3 {
        let k = ST_TO_VEC[axis][j];

        if k < 0 {
            position[j] = -b[(-k - 1) as usize];
        } else {
            position[j] = b[(k - 1) as usize];
        }
    }

    // Avoid bilerp seams.
    let s = ((s + 1.0) * 0.5).clamp(sky_min, sky_max);
    let t = 1.0 - ((t + 1.0) * 0.5).clamp(sky_min, sky_max);
    (position, (s, t))
}

/// Cloud layer uv tables, recomputed when a material's cloud height changes.
pub struct SkyRenderer {
    cloud_height: f32,
    cloud_tex_coords: Vec<[[(f32, f32); SKY_SUBDIVISIONS + 1]; SKY_SUBDIVISIONS + 1]>,
}

impl Default for SkyRenderer {
    fn default() -> Self {
        SkyRenderer::new()
    }
}

impl SkyRenderer {
    #[must_use]
    pub fn new() -> SkyRenderer {
        SkyRenderer {
            cloud_height: 0.0,
            cloud_tex_coords: vec![[[(0.0, 0.0); SKY_SUBDIVISIONS + 1]; SKY_SUBDIVISIONS + 1]; 6],
        }
    }

    /// Precompute per-side, per-subdivision cloud uvs by intersecting each
    /// sky vector with a cloud sphere at `cloud_height`.
    pub fn initialize_tex_coords(&mut self, cloud_height: f32) {
        self.cloud_height = cloud_height;
        let radius = CLOUD_SPHERE_RADIUS;

        for side in 0..6 {
            for t in 0..=SKY_SUBDIVISIONS {
                for s in 0..=SKY_SUBDIVISIONS {
                    let (sky_vec, _) = make_sky_vec(
                        1024.0,
                        (s as i32 - HALF_SKY_SUBDIVISIONS) as f32 / HALF_SKY_SUBDIVISIONS as f32,
                        (t as i32 - HALF_SKY_SUBDIVISIONS) as f32 / HALF_SKY_SUBDIVISIONS as f32,
                        side,
                        0.0,
                        1.0,
                    );

                    // Parametric value where the ray intersects the cloud
                    // layer.
                    let sq = |v: f32| v * v;
                    let p = (1.0 / (2.0 * sky_vec.dot(sky_vec)))
                        * (-2.0 * sky_vec.z * radius
                            + 2.0
                                * (sq(sky_vec.z) * sq(radius)
                                    + 2.0 * sq(sky_vec.x) * radius * cloud_height
                                    + sq(sky_vec.x) * sq(cloud_height)
                                    + 2.0 * sq(sky_vec.y) * radius * cloud_height
                                    + sq(sky_vec.y) * sq(cloud_height)
                                    + 2.0 * sq(sky_vec.z) * radius * cloud_height
                                    + sq(sky_vec.z) * sq(cloud_height))
                                .sqrt());

                    // Intersection point relative to the world origin.
                    let mut v = sky_vec * p;
                    v.z += radius;
                    let v = v.normalize_or(Vec3::Z);

                    self.cloud_tex_coords[side][t][s] = (v.x.acos(), v.y.acos());
                }
            }
        }
    }

    /// Emit sky box sides and the cloud layer for one visible sky surface.
    pub fn render(
        &mut self,
        draw_list: &mut DrawCallList,
        device: &mut dyn GraphicsDevice,
        materials: &MaterialCache,
        default_texture: TextureId,
        camera_position: Vec3,
        z_max: f32,
        surface: &SkySurface,
    ) {
        let material = materials.material(surface.material);

        let should_draw_sky_box = material
            .sky
            .outer_box[0]
            .is_some_and(|texture| texture != default_texture);
        let should_draw_cloud_box = material.sky.cloud_height > 0.0 && material.stages[0].active;

        if !should_draw_sky_box && !should_draw_cloud_box {
            return;
        }

        if should_draw_cloud_box && self.cloud_height != material.sky.cloud_height {
            self.initialize_tex_coords(material.sky.cloud_height);
        }

        // Clip the visible sky polygons to find the cube coverage.
        let mut bounds = SkyBounds::cleared();

        for triangle in surface.vertices.chunks_exact(3) {
            let p = [
                triangle[0].pos() - camera_position,
                triangle[1].pos() - camera_position,
                triangle[2].pos() - camera_position,
            ];
            bounds.clip_polygon(&p, 0);
        }

        if should_draw_sky_box {
            for side in 0..6 {
                let Some((mins, maxs)) = bounds.side_coverage(side, -HALF_SKY_SUBDIVISIONS) else {
                    continue;
                };

                let (vertices, indices) =
                    tessellate_side(side, mins, maxs, camera_position, z_max, 0.0, 1.0, None);

                let Some(handle) = device.alloc_transient(&vertices, &indices) else {
                    crate::engine::warn_once_transient_buffer();
                    return;
                };

                let mut dc = DrawCall::new(
                    surface.material,
                    VertexBufferRange::transient(handle, vertices.len() as u32),
                    IndexBufferRange {
                        source: IndexBufferSource::Transient(handle),
                        first_index: 0,
                        n_indices: indices.len() as u32,
                    },
                );
                dc.flags = DrawCallFlags::SKY | DrawCallFlags::SKYBOX;
                dc.material_sort = material.sort;
                dc.material_sorted_index = material.sorted_index;
                dc.skybox_side = side as i32;

                // Write depth as one.
                dc.z_offset = 1.0;
                dc.z_scale = 0.0;
                draw_list.push(dc);
            }
        }

        if should_draw_cloud_box {
            let mut vertices = Vec::new();
            let mut indices = Vec::new();

            for side in 0..6 {
                // Don't draw clouds beneath you.
                if side == 5 {
                    continue;
                }

                let Some((mins, maxs)) = bounds.side_coverage(side, -HALF_SKY_SUBDIVISIONS) else {
                    continue;
                };

                let sky_min = 1.0 / 256.0;
                let sky_max = 255.0 / 256.0;
                let (side_vertices, side_indices) = tessellate_side(
                    side,
                    mins,
                    maxs,
                    camera_position,
                    z_max,
                    sky_min,
                    sky_max,
                    Some(&self.cloud_tex_coords[side]),
                );

                let base = vertices.len() as u16;
                vertices.extend_from_slice(&side_vertices);
                indices.extend(side_indices.iter().map(|&i| i + base));
            }

            if !indices.is_empty() {
                let Some(handle) = device.alloc_transient(&vertices, &indices) else {
                    crate::engine::warn_once_transient_buffer();
                    return;
                };

                let mut dc = DrawCall::new(
                    surface.material,
                    VertexBufferRange::transient(handle, vertices.len() as u32),
                    IndexBufferRange {
                        source: IndexBufferSource::Transient(handle),
                        first_index: 0,
                        n_indices: indices.len() as u32,
                    },
                );
                dc.flags = DrawCallFlags::SKY;
                dc.material_sort = material.sort;
                dc.material_sorted_index = material.sorted_index;

                // Render after the sky box.
                dc.sort = 1;
                dc.z_offset = 1.0;
                dc.z_scale = 0.0;
                draw_list.push(dc);
            }
        }
    }
}

/// Tessellate the covered region of one cube side.
fn tessellate_side(
    side: usize,
    mins: [i32; 2],
    maxs: [i32; 2],
    camera_position: Vec3,
    z_max: f32,
    sky_min: f32,
    sky_max: f32,
    cloud_tex_coords: Option<&[[(f32, f32); SKY_SUBDIVISIONS + 1]; SKY_SUBDIVISIONS + 1]>,
) -> (Vec<Vertex>, Vec<u16>) {
    let s_width = (maxs[0] - mins[0] + 1) as usize;
    let t_height = (maxs[1] - mins[1] + 1) as usize;
    let mut vertices = Vec::with_capacity(s_width * t_height);

    for t in mins[1]..=maxs[1] {
        for s in mins[0]..=maxs[0] {
            let (position, st) = make_sky_vec(
                z_max,
                s as f32 / HALF_SKY_SUBDIVISIONS as f32,
                t as f32 / HALF_SKY_SUBDIVISIONS as f32,
                side,
                sky_min,
                sky_max,
            );

            let st = if let Some(cloud) = cloud_tex_coords {
                let ct = (t + HALF_SKY_SUBDIVISIONS) as usize;
                let cs = (s + HALF_SKY_SUBDIVISIONS) as usize;
                cloud[ct][cs]
            } else {
                st
            };

            let mut v = Vertex::default();
            v.set_pos(position + camera_position);
            v.set_tex_coord(st.0, st.1, 0.0, 0.0);
            v.color = [255, 255, 255, 255];
            vertices.push(v);
        }
    }

    let mut indices = Vec::with_capacity((t_height - 1) * (s_width - 1) * 6);

    for t in 0..t_height - 1 {
        for s in 0..s_width - 1 {
            let base = (s + t * s_width) as u16;
            let width = s_width as u16;
            indices.extend_from_slice(&[
                base,
                base + width,
                base + 1,
                base + width,
                base + width + 1,
                base + 1,
            ]);
        }
    }

    (vertices, indices)
}
