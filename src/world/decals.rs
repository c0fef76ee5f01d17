//! Decal marking: clip a projected polygon against world geometry.
//!
//! The projection polygon's edges plus two end caps form a set of bounding
//! planes; candidate surfaces are gathered by descending the BSP with the
//! projection's AABB, and each candidate triangle is Sutherland–Hodgman
//! clipped against every plane in turn.

use glam::Vec3;

use crate::material::{ContentFlags, SurfaceFlags};
use crate::math::{Bounds, PlaneSide};
use crate::scene::MarkFragment;
use crate::world::{SurfaceType, World};

/// Maximum points in a projection polygon.
pub const MAX_VERTS_ON_POLY: usize = 64;

/// Offset along the surface normal applied to clipped fragments. Zero
/// matches current behavior; a unit or two would reduce z-fighting against
/// LOD'd patches. Exposed for tuning.
pub const MARKER_OFFSET: f32 = 0.0;

const SIDE_FRONT: u8 = 0;
const SIDE_BACK: u8 = 1;
const SIDE_ON: u8 = 2;

/// Chop a winding by a plane, keeping the front side.
///
/// The output can hold two more vertices than the input.
fn chop_poly_behind_plane(
    in_points: &[Vec3],
    out_points: &mut Vec<Vec3>,
    normal: Vec3,
    dist: f32,
    epsilon: f32,
) {
    out_points.clear();

    // Don't clip if it might overflow.
    if in_points.len() >= MAX_VERTS_ON_POLY - 2 {
        return;
    }

    let mut dists = [0.0f32; MAX_VERTS_ON_POLY + 4];
    let mut sides = [0u8; MAX_VERTS_ON_POLY + 4];
    let mut counts = [0usize; 3];

    for (i, point) in in_points.iter().enumerate() {
        let dot = point.dot(normal) - dist;
        dists[i] = dot;
        sides[i] = if dot > epsilon {
            SIDE_FRONT
        } else if dot < -epsilon {
            SIDE_BACK
        } else {
            SIDE_ON
        };
        counts[sides[i] as usize] += 1;
    }

    sides[in_points.len()] = sides[0];
    dists[in_points.len()] = dists[0];

    if counts[SIDE_FRONT as usize] == 0 {
        return;
    }

    if counts[SIDE_BACK as usize] == 0 {
        out_points.extend_from_slice(in_points);
        return;
    }

    for (i, point) in in_points.iter().enumerate() {
        let p1 = *point;

        if sides[i] == SIDE_ON {
            out_points.push(p1);
            continue;
        }

        if sides[i] == SIDE_FRONT {
            out_points.push(p1);
        }

        if sides[i + 1] == SIDE_ON || sides[i + 1] == sides[i] {
            continue;
        }

        // Generate a split point.
        let p2 = in_points[(i + 1) % in_points.len()];
        let d = dists[i] - dists[i + 1];
        let dot = if d == 0.0 { 0.0 } else { dists[i] / d };
        out_points.push(p1 + (p2 - p1) * dot);
    }
}

/// Clip one candidate triangle (or winding) by all the bounding planes and
/// append the survivor to the output.
fn add_mark_fragments(
    clip_points: &[Vec3],
    planes: &[(Vec3, f32)],
    max_points: usize,
    point_buffer: &mut Vec<Vec3>,
    max_fragments: usize,
    fragment_buffer: &mut Vec<MarkFragment>,
) -> bool {
    let mut ping = clip_points.to_vec();
    let mut pong = Vec::with_capacity(MAX_VERTS_ON_POLY);

    for (normal, dist) in planes {
        chop_poly_behind_plane(&ping, &mut pong, *normal, *dist, 0.5);
        std::mem::swap(&mut ping, &mut pong);

        if ping.is_empty() {
            break;
        }
    }

    // Completely clipped away?
    if ping.is_empty() {
        return fragment_buffer.len() < max_fragments;
    }

    // Not enough space for this polygon?
    if ping.len() + point_buffer.len() > max_points {
        return fragment_buffer.len() < max_fragments;
    }

    fragment_buffer.push(MarkFragment {
        first_point: point_buffer.len() as i32,
        num_points: ping.len() as i32,
    });
    point_buffer.extend_from_slice(&ping);
    fragment_buffer.len() < max_fragments
}

impl World {
    /// Gather surfaces whose leaves intersect `bounds`, marking rejects so
    /// surfaces spanning multiple leaves are processed once.
    fn box_surfaces(&mut self, bounds: Bounds, list_size: usize, direction: Vec3) -> Vec<usize> {
        self.decal_duplicate_surface_id += 1;
        let decal_id = self.decal_duplicate_surface_id;
        let mut list = Vec::with_capacity(list_size);
        let mut stack = vec![0usize];

        while let Some(mut node_index) = stack.pop() {
            // Walk down until a leaf, splitting at crossed planes.
            loop {
                let node = &self.nodes[node_index];

                if node.leaf {
                    break;
                }

                match self.planes[node.plane].test_bounds(bounds) {
                    PlaneSide::Front => node_index = node.children[0],
                    PlaneSide::Back => node_index = node.children[1],
                    PlaneSide::Both => {
                        stack.push(node.children[1]);
                        node_index = node.children[0];
                    }
                }
            }

            let leaf = &self.nodes[node_index];
            let first = leaf.first_leaf_surface;
            let count = leaf.n_surfaces;

            for j in 0..count {
                if list.len() >= list_size {
                    break;
                }

                let Some(&surface_index) = self.leaf_surfaces.get(first + j) else {
                    continue;
                };

                if surface_index < 0 || surface_index as usize >= self.surfaces.len() {
                    continue;
                }

                let surface_index = surface_index as usize;
                let (material_flags, material_contents) = {
                    let surface = &self.surfaces[surface_index];
                    (surface.flags, surface.content_flags)
                };
                let surface = &mut self.surfaces[surface_index];

                // Skip surfaces that never take marks.
                if material_flags.intersects(SurfaceFlags::NOIMPACT | SurfaceFlags::NOMARKS)
                    || material_contents.contains(ContentFlags::FOG)
                {
                    surface.decal_duplicate_id = decal_id;
                } else if surface.surface_type == SurfaceType::Face {
                    // The face plane should go through the box, and not make
                    // a sharp angle with the projection direction.
                    let plane = surface.cull_plane.unwrap_or_default();

                    if plane.test_bounds(bounds) != PlaneSide::Both {
                        surface.decal_duplicate_id = decal_id;
                    } else if plane.normal.dot(direction) > -0.5 {
                        surface.decal_duplicate_id = decal_id;
                    }
                } else if surface.surface_type != SurfaceType::Patch
                    && surface.surface_type != SurfaceType::Mesh
                {
                    surface.decal_duplicate_id = decal_id;
                }

                // The surface may have already been added if it spans
                // multiple leaves.
                let surface = &mut self.surfaces[surface_index];

                if surface.decal_duplicate_id != decal_id {
                    surface.decal_duplicate_id = decal_id;
                    list.push(surface_index);
                }
            }
        }

        list
    }

    /// Project a polygon along `projection` into the world and return the
    /// clipped fragments plus their points.
    ///
    /// An empty input polygon, or one with more than [`MAX_VERTS_ON_POLY`]
    /// points, produces no fragments.
    pub fn mark_fragments(
        &mut self,
        points: &[Vec3],
        projection: Vec3,
        max_points: usize,
        max_fragments: usize,
    ) -> (Vec<Vec3>, Vec<MarkFragment>) {
        let mut point_buffer = Vec::new();
        let mut fragment_buffer = Vec::new();

        if points.is_empty() || points.len() > MAX_VERTS_ON_POLY {
            return (point_buffer, fragment_buffer);
        }

        let projection_dir = projection.normalize_or(Vec3::Z);

        // The AABB of the projection, padded so all the relevant leaves are
        // found, including the one(s) in front of the hit surface.
        let mut bounds = Bounds::EMPTY;

        for point in points {
            bounds.add_point(*point);
            bounds.add_point(*point + projection);
            bounds.add_point(*point + projection_dir * -20.0);
        }

        // Bounding planes: one per polygon edge plus near and far caps.
        let mut planes: Vec<(Vec3, f32)> = Vec::with_capacity(points.len() + 2);

        for i in 0..points.len() {
            let v1 = points[(i + 1) % points.len()] - points[i];
            let v2 = points[i] - (points[i] + projection);
            let normal = v1.cross(v2).normalize_or(Vec3::Z);
            planes.push((normal, normal.dot(points[i])));
        }

        planes.push((projection_dir, projection_dir.dot(points[0]) - 32.0));
        planes.push((-projection_dir, (-projection_dir).dot(points[0]) - 20.0));

        let surfaces = self.box_surfaces(bounds, 64, projection_dir);

        for surface_index in surfaces {
            let surface = &self.surfaces[surface_index];

            match surface.surface_type {
                SurfaceType::Patch => {
                    let Some(patch) = surface.patch.as_deref() else {
                        continue;
                    };

                    // Triangulate the grid and chop every triangle within
                    // the bounding planes. LOD is not applied; the marker
                    // offset keeps fragments above the true curve.
                    for m in 0..patch.height - 1 {
                        for n in 0..patch.width - 1 {
                            let corner = |row: usize, column: usize| {
                                let v = &patch.vertices[row * patch.width + column];
                                v.pos() + v.normal() * MARKER_OFFSET
                            };

                            let triangles = [
                                (
                                    [corner(m, n), corner(m + 1, n), corner(m, n + 1)],
                                    -0.1f32,
                                ),
                                (
                                    [corner(m, n + 1), corner(m + 1, n), corner(m + 1, n + 1)],
                                    -0.05f32,
                                ),
                            ];

                            for (triangle, normal_limit) in triangles {
                                let v1 = triangle[0] - triangle[1];
                                let v2 = triangle[2] - triangle[1];
                                let normal = v1.cross(v2).normalize_or(Vec3::Z);

                                if normal.dot(projection_dir) >= normal_limit {
                                    continue;
                                }

                                if !add_mark_fragments(
                                    &triangle,
                                    &planes,
                                    max_points,
                                    &mut point_buffer,
                                    max_fragments,
                                    &mut fragment_buffer,
                                ) {
                                    return (point_buffer, fragment_buffer);
                                }
                            }
                        }
                    }
                }
                SurfaceType::Face => {
                    // Check the face normal.
                    let plane = surface.cull_plane.unwrap_or_default();

                    if plane.normal.dot(projection_dir) > -0.5 {
                        continue;
                    }

                    let vertices = &self.vertices[surface.buffer_index];

                    for triangle in surface.indices.chunks_exact(3) {
                        let points: Vec<Vec3> = triangle
                            .iter()
                            .map(|&index| {
                                vertices[index as usize].pos() + plane.normal * MARKER_OFFSET
                            })
                            .collect();

                        if !add_mark_fragments(
                            &points,
                            &planes,
                            max_points,
                            &mut point_buffer,
                            max_fragments,
                            &mut fragment_buffer,
                        ) {
                            return (point_buffer, fragment_buffer);
                        }
                    }
                }
                SurfaceType::Mesh => {
                    let vertices = &self.vertices[surface.buffer_index];

                    for triangle in surface.indices.chunks_exact(3) {
                        let points: Vec<Vec3> = triangle
                            .iter()
                            .map(|&index| {
                                let v = &vertices[index as usize];
                                v.pos() + v.normal() * MARKER_OFFSET
                            })
                            .collect();

                        if !add_mark_fragments(
                            &points,
                            &planes,
                            max_points,
                            &mut point_buffer,
                            max_fragments,
                            &mut fragment_buffer,
                        ) {
                            return (point_buffer, fragment_buffer);
                        }
                    }
                }
                SurfaceType::Ignore | SurfaceType::Flare => {}
            }
        }

        (point_buffer, fragment_buffer)
    }
}
