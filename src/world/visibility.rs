//! PVS visibility, surface batching and portal/reflection discovery.
//!
//! Each visibility id owns a [`Visibility`] record. Updates walk the leaves
//! whose cluster is in the camera cluster's PVS and whose area isn't masked
//! off, bucket the visible surfaces (general, sky, portal, reflective) and
//! rebuild batches — skipped entirely when neither the camera cluster nor
//! the area mask changed since the last call.

use glam::{Mat3, Mat4, Vec3};

use crate::draw::{
    DrawCall, DrawCallFlags, DrawCallList, IndexBufferRange, IndexBufferSource, VertexBufferRange,
};
use crate::gpu::{DynamicIndexBufferHandle, GraphicsDevice};
use crate::material::{MaterialCache, MaterialIndex, Reflective};
use crate::math::{self, mirrored_point, mirrored_vector, Bounds, Plane, Transform};
use crate::scene::{RenderEntity, RenderEntityType, MAX_MAP_AREA_BYTES};
use crate::vertex::Vertex;
use crate::world::load::{append_sky_surface, sort_surfaces};
use crate::world::{
    BatchedSurface, SkySurface, Surface, SurfaceType, VisibilityId, World,
    MAX_WORLD_GEOMETRY_BUFFERS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisibilityMethod {
    #[default]
    Pvs,
    /// No PVS walk: the full world batch, culled downstream by the camera
    /// frustum.
    CameraFrustum,
}

/// A portal surface visible to the camera.
#[derive(Debug, Clone, Copy)]
pub struct PortalSurface {
    /// Index of the portal entity in the frame entity list.
    pub entity_index: usize,
    pub is_mirror: bool,
    pub plane: Plane,
    pub surface_index: usize,
}

/// A reflective surface visible to the camera.
#[derive(Debug, Clone, Copy)]
pub struct ReflectiveSurface {
    pub plane: Plane,
    pub surface_index: usize,
}

/// Per-visibility-id state.
#[derive(Debug, Default)]
pub struct Visibility {
    pub method: VisibilityMethod,

    /// Visible surfaces batched by material.
    pub batched_surfaces: Vec<BatchedSurface>,

    /// The merged bounds of all visible leaves.
    pub bounds: Bounds,

    /// Portal surfaces visible to the camera (subset of `portal_surfaces`).
    pub camera_portal_surfaces: Vec<PortalSurface>,

    /// Reflective surfaces visible to the camera.
    pub camera_reflective_surfaces: Vec<ReflectiveSurface>,

    pub cpu_deform_vertices: Vec<Vertex>,
    pub cpu_deform_indices: Vec<u16>,

    pub index_buffers: Vec<DynamicIndexBufferHandle>,

    /// Index data rebuilt when surface visibility changes.
    pub indices: Vec<Vec<u16>>,

    /// The camera leaf from the last update. Visibility is only rebuilt when
    /// the leaf cluster or area mask changes. Nodes live in a load-time
    /// arena, so the index is stable.
    pub last_camera_leaf: Option<usize>,
    pub last_area_mask: [u8; MAX_MAP_AREA_BYTES],

    /// Portal surfaces visible to the PVS.
    pub portal_surfaces: Vec<usize>,

    /// Reflective surfaces visible to the PVS.
    pub reflective_surfaces: Vec<usize>,

    pub sky_surfaces: Vec<SkySurface>,

    /// Surfaces visible from the camera leaf cluster.
    pub surfaces: Vec<usize>,
}

/// Output of [`create_batched_surfaces`].
pub(crate) struct BatchResult {
    pub batches: Vec<BatchedSurface>,
    /// Per-geometry-buffer index streams.
    pub indices: Vec<Vec<u16>>,
    pub cpu_deform_vertices: Vec<Vertex>,
    pub cpu_deform_indices: Vec<u16>,
}

/// Merge a sorted surface list into batches. Adjacent surfaces with the same
/// material, fog and geometry buffer share a batch. Materials with CPU
/// deforms get their geometry copied into the transient pools instead of
/// referencing the world vertex buffers.
pub(crate) fn create_batched_surfaces(
    surfaces: &[Surface],
    sorted: &[usize],
    current_geometry_buffer: usize,
    has_cpu_deforms: impl Fn(MaterialIndex) -> bool,
    vertices: &[Vec<Vertex>],
) -> BatchResult {
    let mut result = BatchResult {
        batches: Vec::new(),
        indices: vec![Vec::new(); current_geometry_buffer + 1],
        cpu_deform_vertices: Vec::new(),
        cpu_deform_indices: Vec::new(),
    };

    let mut first_surface = 0usize;

    for i in 0..sorted.len() {
        let surface = &surfaces[sorted[i]];
        let next_surface = sorted.get(i + 1).map(|&j| &surfaces[j]);

        // Close the batch on any surface state change.
        let close = match next_surface {
            None => true,
            Some(next) => {
                next.material != surface.material
                    || next.fog_index != surface.fog_index
                    || next.buffer_index != surface.buffer_index
            }
        };

        if !close {
            continue;
        }

        if matches!(surface.surface_type, SurfaceType::Ignore | SurfaceType::Flare) {
            first_surface = i + 1;
            continue;
        }

        let mut batch = BatchedSurface {
            bounds: Bounds::EMPTY,
            material: surface.material,
            fog_index: surface.fog_index,
            surface_flags: surface.flags,
            content_flags: surface.content_flags,
            buffer_index: surface.buffer_index,
            first_index: 0,
            n_indices: 0,
            first_vertex: 0,
            n_vertices: 0,
        };

        for &j in &sorted[first_surface..=i] {
            batch.bounds.add_bounds(surfaces[j].cull_bounds);
        }

        if has_cpu_deforms(surface.material) {
            // The geometry will be copied into a transient buffer and
            // deformed every render call.
            batch.first_index = result.cpu_deform_indices.len() as u32;
            batch.first_vertex = result.cpu_deform_vertices.len() as u32;

            for &j in &sorted[first_surface..=i] {
                let s = &surfaces[j];
                let buffer = &vertices[s.buffer_index];

                for k in 0..s.n_vertices {
                    result
                        .cpu_deform_vertices
                        .push(buffer[(s.first_vertex + k) as usize]);
                }

                for &index in &s.indices {
                    // Make indices relative to the batch.
                    result
                        .cpu_deform_indices
                        .push((u32::from(index) - s.first_vertex + batch.n_vertices) as u16);
                }

                batch.n_vertices += s.n_vertices;
                batch.n_indices += s.indices.len() as u32;
            }
        } else {
            // The indices feed a dynamic index buffer directly.
            let indices = &mut result.indices[batch.buffer_index];
            batch.first_index = indices.len() as u32;

            for &j in &sorted[first_surface..=i] {
                indices.extend_from_slice(&surfaces[j].indices);
                batch.n_indices += surfaces[j].indices.len() as u32;
            }
        }

        result.batches.push(batch);
        first_surface = i + 1;
    }

    result
}

// ============================================================================
// Geometry rejection helpers
// ============================================================================

/// Clip-space trivial rejection: true when every vertex is outside the same
/// frustum plane.
pub(crate) fn is_geometry_offscreen(mvp: &Mat4, indices: &[u16], vertices: &[Vertex]) -> bool {
    let mut point_and = !0u32;

    for &index in indices {
        let clip = *mvp * vertices[index as usize].pos().extend(1.0);
        let mut point_flags = 0u32;

        for k in 0..3 {
            if clip[k] >= clip.w {
                point_flags |= 1 << (k * 2);
            } else if clip[k] <= -clip.w {
                point_flags |= 1 << (k * 2 + 1);
            }
        }

        point_and &= point_flags;
    }

    point_and != 0
}

/// True when every triangle faces away from the camera. Also reports the
/// squared distance to the nearest vertex for portal range culling.
pub(crate) fn is_geometry_backfacing(
    camera_position: Vec3,
    indices: &[u16],
    vertices: &[Vertex],
) -> (bool, f32) {
    let mut n_triangles = indices.len() / 3;
    let mut shortest = f32::MAX;

    for triangle in indices.chunks_exact(3) {
        let vertex = &vertices[triangle[0] as usize];
        let normal = vertex.pos() - camera_position;
        shortest = shortest.min(normal.length_squared());

        if normal.dot(vertex.normal()) >= 0.0 {
            n_triangles -= 1;
        }
    }

    (n_triangles == 0, shortest)
}

/// A derived portal camera.
pub struct PortalCamera {
    /// PVS position from the portal entity.
    pub pvs_position: Vec3,
    pub camera: Transform,
    pub is_mirror: bool,
    /// Near clip plane so portal rendering clips geometry behind the
    /// surface.
    pub plane: Plane,
}

impl World {
    /// Update visibility for the given id. Probe ids skip the PVS walk and
    /// use the full world batch.
    pub fn update_visibility(
        &mut self,
        vis_id: VisibilityId,
        camera_position: Vec3,
        area_mask: &[u8; MAX_MAP_AREA_BYTES],
        device: &mut dyn GraphicsDevice,
        materials: &MaterialCache,
    ) {
        if vis_id == VisibilityId::Probe {
            let vis = &mut self.visibility[vis_id as usize];
            vis.method = VisibilityMethod::CameraFrustum;
            vis.bounds = Bounds::EMPTY;

            for batch in &self.batched_surfaces {
                vis.bounds.add_bounds(batch.bounds);
            }

            return;
        }

        self.update_pvs_visibility(vis_id, camera_position, area_mask, device, materials);
    }

    fn update_pvs_visibility(
        &mut self,
        vis_id: VisibilityId,
        camera_position: Vec3,
        area_mask: &[u8; MAX_MAP_AREA_BYTES],
        device: &mut dyn GraphicsDevice,
        materials: &MaterialCache,
    ) {
        let camera_leaf = self.leaf_from_position(camera_position);
        let camera_cluster = self.nodes[camera_leaf].cluster;

        {
            let vis = &mut self.visibility[vis_id as usize];
            vis.method = VisibilityMethod::Pvs;

            // No need to refresh visible surfaces if neither the camera
            // cluster nor the area bitmask changed.
            if let Some(last_leaf) = vis.last_camera_leaf {
                if self.nodes[last_leaf].cluster == camera_cluster
                    && vis.last_area_mask == *area_mask
                {
                    return;
                }
            }
        }

        // Clear data that will be recalculated.
        let mut portal_surfaces = Vec::new();
        let mut reflective_surfaces = Vec::new();
        let mut sky_surfaces: Vec<SkySurface> = Vec::new();
        let mut visible_surfaces = Vec::new();
        let mut bounds = Bounds::EMPTY;

        // A cluster of -1 means the camera is outside the PVS; draw
        // everything.
        let pvs_row = if camera_cluster == -1 {
            None
        } else {
            let start = camera_cluster as usize * self.cluster_bytes as usize;
            self.vis_data.get(start..start + self.cluster_bytes as usize)
        };

        let world_surface_count = self.model_defs[0].n_surfaces;

        for leaf_index in self.first_leaf..self.nodes.len() {
            let leaf = &self.nodes[leaf_index];

            if let Some(pvs) = pvs_row {
                // Check the PVS.
                if leaf.cluster < 0 {
                    continue;
                }

                let cluster = leaf.cluster as usize;

                if pvs.get(cluster >> 3).is_none_or(|byte| byte & (1 << (cluster & 7)) == 0) {
                    continue;
                }

                // Check for door connection.
                if area_mask[(leaf.area >> 3) as usize] & (1 << (leaf.area & 7)) != 0 {
                    continue;
                }
            }

            bounds.add_bounds(leaf.bounds);

            for j in 0..leaf.n_surfaces {
                let Some(&surface_index) = self.leaf_surfaces.get(leaf.first_leaf_surface + j)
                else {
                    continue;
                };

                // Ignore surfaces in brush models.
                if surface_index < 0 || surface_index as usize >= world_surface_count {
                    continue;
                }

                let surface_index = surface_index as usize;
                let surface = &mut self.surfaces[surface_index];

                // Don't add duplicates.
                if surface.duplicate_id == self.duplicate_surface_id {
                    continue;
                }

                if matches!(surface.surface_type, SurfaceType::Ignore | SurfaceType::Flare) {
                    continue;
                }

                surface.duplicate_id = self.duplicate_surface_id;
                let material = materials.material(surface.material);

                if material.is_sky {
                    append_sky_surface(&mut sky_surfaces, &self.surfaces[surface_index], &self.vertices);
                } else {
                    if material.reflective == Reflective::BackSide {
                        reflective_surfaces.push(surface_index);
                    }

                    if material.is_portal {
                        portal_surfaces.push(surface_index);
                    }

                    visible_surfaces.push(surface_index);
                }
            }
        }

        sort_surfaces(&self.surfaces, &mut visible_surfaces);

        let batch = create_batched_surfaces(
            &self.surfaces,
            &visible_surfaces,
            self.current_geometry_buffer,
            |m| materials.material(m).has_cpu_deforms(),
            &self.vertices,
        );

        let vis = &mut self.visibility[vis_id as usize];
        vis.portal_surfaces = portal_surfaces;
        vis.reflective_surfaces = reflective_surfaces;
        vis.sky_surfaces = sky_surfaces;
        vis.surfaces = visible_surfaces;
        vis.bounds = bounds;
        vis.batched_surfaces = batch.batches;
        vis.cpu_deform_vertices = batch.cpu_deform_vertices;
        vis.cpu_deform_indices = batch.cpu_deform_indices;
        vis.indices = batch.indices;

        // Update the dynamic index buffers; created on first use.
        if vis.index_buffers.len() < vis.indices.len() {
            vis.index_buffers
                .resize(vis.indices.len(), DynamicIndexBufferHandle::INVALID);
        }

        for (i, indices) in vis.indices.iter().enumerate() {
            if indices.is_empty() {
                continue;
            }

            if vis.index_buffers[i].is_valid() {
                device.update_dynamic_index_buffer(vis.index_buffers[i], indices);
            } else {
                vis.index_buffers[i] = device.create_dynamic_index_buffer(indices);
            }
        }

        self.duplicate_surface_id += 1;
        vis.last_camera_leaf = Some(camera_leaf);
        vis.last_area_mask = *area_mask;
    }

    /// Emit draw calls for the visible world batches.
    pub fn render(
        &self,
        vis_id: VisibilityId,
        draw_list: &mut DrawCallList,
        device: &mut dyn GraphicsDevice,
        materials: &MaterialCache,
        scene_rotation: &Mat3,
        camera_mirrored: bool,
        water_reflections_enabled: bool,
    ) {
        let vis = &self.visibility[vis_id as usize];

        let (batches, cpu_deform_vertices, cpu_deform_indices) =
            if vis.method == VisibilityMethod::Pvs {
                (&vis.batched_surfaces, &vis.cpu_deform_vertices, &vis.cpu_deform_indices)
            } else {
                (&self.batched_surfaces, &self.cpu_deform_vertices, &self.cpu_deform_indices)
            };

        for batch in batches {
            let mut flags = DrawCallFlags::empty();

            if batch
                .surface_flags
                .contains(crate::material::SurfaceFlags::SKY)
            {
                flags |= DrawCallFlags::SKY;
            }

            let mut material_index = materials.resolve(batch.material);
            let mut material = materials.material(material_index);

            // A back-side reflective material swaps to its front side when
            // any reflective surface is visible to the camera.
            if water_reflections_enabled
                && material.reflective == Reflective::BackSide
                && !vis.camera_reflective_surfaces.is_empty()
            {
                if let Some(front) = material.reflective_front_side_material {
                    material_index = front;
                    material = materials.material(material_index);
                }
            }

            if material.has_auto_sprite_deform() {
                debug_assert!(!cpu_deform_vertices.is_empty());
                debug_assert!(batch.n_vertices > 0 && batch.n_indices > 0);

                // Copy the CPU deform geometry and deform it in place.
                let first_vertex = batch.first_vertex as usize;
                let first_index = batch.first_index as usize;
                let mut vertices = cpu_deform_vertices
                    [first_vertex..first_vertex + batch.n_vertices as usize]
                    .to_vec();
                let mut indices = cpu_deform_indices
                    [first_index..first_index + batch.n_indices as usize]
                    .to_vec();

                let soft_sprite_depth = material.do_autosprite_deform(
                    scene_rotation,
                    &mut vertices,
                    &mut indices,
                    None,
                    camera_mirrored,
                );

                let Some(handle) = device.alloc_transient(&vertices, &indices) else {
                    crate::engine::warn_once_transient_buffer();
                    continue;
                };

                let mut dc = DrawCall::new(
                    material_index,
                    VertexBufferRange::transient(handle, batch.n_vertices),
                    IndexBufferRange {
                        source: IndexBufferSource::Transient(handle),
                        first_index: 0,
                        n_indices: batch.n_indices,
                    },
                );
                dc.flags = flags;
                dc.fog_index = batch.fog_index;
                dc.material_sort = material.sort;
                dc.material_sorted_index = material.sorted_index;
                dc.soft_sprite_depth = soft_sprite_depth;
                draw_list.push(dc);
                continue;
            }

            let ib_source = if vis.method == VisibilityMethod::Pvs {
                IndexBufferSource::Dynamic(vis.index_buffers[batch.buffer_index])
            } else {
                IndexBufferSource::Static(self.index_buffers[batch.buffer_index])
            };

            let mut dc = DrawCall::new(
                material_index,
                VertexBufferRange::static_buffer(
                    self.vertex_buffers[batch.buffer_index],
                    self.vertices[batch.buffer_index].len() as u32,
                ),
                IndexBufferRange {
                    source: ib_source,
                    first_index: batch.first_index,
                    n_indices: batch.n_indices,
                },
            );
            dc.flags = flags;
            dc.fog_index = batch.fog_index;
            dc.material_sort = material.sort;
            dc.material_sorted_index = material.sorted_index;
            draw_list.push(dc);
        }
    }

    // ========================================================================
    // Portal and reflection cameras
    // ========================================================================

    /// Find the portal surfaces visible to the camera and derive the portal
    /// camera from the first one. Returns `None` when no portal is visible.
    pub fn calculate_portal_camera(
        &mut self,
        vis_id: VisibilityId,
        main_camera_position: Vec3,
        main_camera_rotation: &Mat3,
        mvp: &Mat4,
        entities: &[RenderEntity],
        materials: &MaterialCache,
        time_seconds: f32,
    ) -> Option<PortalCamera> {
        // Calculate which portal surfaces in the PVS are visible.
        let mut camera_portal_surfaces = Vec::new();

        for &surface_index in &self.visibility[vis_id as usize].portal_surfaces {
            let surface = &self.surfaces[surface_index];
            let vertices = &self.vertices[surface.buffer_index];

            // Trivially reject.
            if is_geometry_offscreen(mvp, &surface.indices, vertices) {
                continue;
            }

            // Backface rejection also finds the nearest vertex distance so
            // portals can be culled by range. Checking vertex distance isn't
            // exactly range-to-surface, but it's good enough for the portals
            // in real content.
            let (backfacing, shortest) =
                is_geometry_backfacing(main_camera_position, &surface.indices, vertices);

            if backfacing {
                continue;
            }

            // The portal plane comes from the first three vertices.
            let plane = if surface.indices.len() >= 3 {
                Plane::from_points(
                    vertices[surface.indices[0] as usize].pos(),
                    vertices[surface.indices[1] as usize].pos(),
                    vertices[surface.indices[2] as usize].pos(),
                )
            } else {
                Plane::new(Vec3::X, 0.0)
            };

            // Locate the portal entity closest to this plane. Its origin is
            // the portal origin; its old origin is the camera origin.
            let entity_index = entities.iter().position(|entity| {
                entity.entity_type == RenderEntityType::Portal
                    && plane.side(entity.position).abs() <= 64.0
            });

            // Without a portal entity, render nothing: the server hasn't
            // communicated the matching entity yet, which is easily possible
            // with local movement prediction.
            let Some(entity_index) = entity_index else {
                continue;
            };

            let entity = &entities[entity_index];
            let is_mirror = entity.position == entity.old_position;

            // Mirrors don't fade over distance.
            let portal_range = materials.material(surface.material).portal_range;

            if !is_mirror && shortest > portal_range * portal_range {
                continue;
            }

            camera_portal_surfaces.push(PortalSurface {
                entity_index,
                is_mirror,
                plane,
                surface_index,
            });
        }

        self.visibility[vis_id as usize].camera_portal_surfaces = camera_portal_surfaces;
        let vis = &self.visibility[vis_id as usize];
        let portal = vis.camera_portal_surfaces.first()?;

        // All visible portal surfaces are needed for the stencil pass, but
        // only the first determines the camera transform.
        let mut surface_transform = Transform::IDENTITY;
        surface_transform.set_axis(0, portal.plane.normal);
        surface_transform.set_axis(1, math::perpendicular(surface_transform.axis(0)));
        surface_transform.set_axis(
            2,
            surface_transform.axis(0).cross(surface_transform.axis(1)),
        );

        let entity = &entities[portal.entity_index];
        let mut camera_transform = Transform::IDENTITY;

        if portal.is_mirror {
            surface_transform.position = portal.plane.normal * portal.plane.distance;
            camera_transform.position = surface_transform.position;
            camera_transform.set_axis(0, -surface_transform.axis(0));
            camera_transform.set_axis(1, surface_transform.axis(1));
            camera_transform.set_axis(2, surface_transform.axis(2));
        } else {
            // Project the entity origin onto the surface plane to get an
            // origin point to rotate around.
            let d = portal.plane.side(entity.position);
            surface_transform.position = entity.position + surface_transform.axis(0) * -d;

            camera_transform.position = entity.old_position;
            camera_transform.set_axis(0, -entity.rotation.x_axis);
            camera_transform.set_axis(1, -entity.rotation.y_axis);
            camera_transform.set_axis(2, entity.rotation.z_axis);

            // Optionally rotate.
            if entity.old_frame != 0 || entity.skin_num != 0 {
                let degrees = if entity.old_frame != 0 {
                    if entity.frame != 0 {
                        // Continuous rotation, speed from the frame field.
                        time_seconds * entity.frame as f32
                    } else {
                        // Bobbing rotation with skinNum as the phase offset.
                        entity.skin_num as f32 + time_seconds.sin() * 4.0
                    }
                } else {
                    // Constant yaw offset.
                    entity.skin_num as f32
                };

                let axis0 = camera_transform.axis(0);
                let rotated =
                    math::rotated_around_direction(camera_transform.axis(1), axis0, degrees);
                camera_transform.set_axis(1, rotated);
                camera_transform.set_axis(2, axis0.cross(rotated));
            }
        }

        let mut camera = Transform::IDENTITY;
        camera.position = mirrored_point(main_camera_position, &surface_transform, &camera_transform);

        for i in 0..3 {
            camera.set_axis(
                i,
                mirrored_vector(main_camera_rotation.col(i), &surface_transform, &camera_transform),
            );
        }

        let forward = camera_transform.axis(0);
        let clip_plane = Plane::new(-forward, camera_transform.position.dot(-forward));

        Some(PortalCamera {
            pvs_position: entity.old_position,
            camera,
            is_mirror: portal.is_mirror,
            plane: clip_plane,
        })
    }

    /// Find the reflective surfaces visible to the camera and derive the
    /// mirrored camera from the first one.
    pub fn calculate_reflection_camera(
        &mut self,
        vis_id: VisibilityId,
        main_camera_position: Vec3,
        main_camera_rotation: &Mat3,
        mvp: &Mat4,
    ) -> Option<(Transform, Plane)> {
        let mut camera_reflective_surfaces = Vec::new();

        for &surface_index in &self.visibility[vis_id as usize].reflective_surfaces {
            let surface = &self.surfaces[surface_index];
            let vertices = &self.vertices[surface.buffer_index];

            if is_geometry_offscreen(mvp, &surface.indices, vertices) {
                continue;
            }

            let (backfacing, _) =
                is_geometry_backfacing(main_camera_position, &surface.indices, vertices);

            if backfacing {
                continue;
            }

            let plane = if surface.indices.len() >= 3 {
                Plane::from_points(
                    vertices[surface.indices[0] as usize].pos(),
                    vertices[surface.indices[1] as usize].pos(),
                    vertices[surface.indices[2] as usize].pos(),
                )
            } else {
                Plane::new(Vec3::X, 0.0)
            };

            camera_reflective_surfaces.push(ReflectiveSurface {
                plane,
                surface_index,
            });
        }

        self.visibility[vis_id as usize].camera_reflective_surfaces = camera_reflective_surfaces;
        let reflective = self.visibility[vis_id as usize]
            .camera_reflective_surfaces
            .first()?;

        let mut surface_transform = Transform::IDENTITY;
        surface_transform.set_axis(0, reflective.plane.normal);
        surface_transform.set_axis(1, math::perpendicular(surface_transform.axis(0)));
        surface_transform.set_axis(
            2,
            surface_transform.axis(0).cross(surface_transform.axis(1)),
        );
        surface_transform.position = reflective.plane.normal * reflective.plane.distance;

        let mut camera_transform = Transform::IDENTITY;
        camera_transform.position = surface_transform.position;
        camera_transform.set_axis(0, -surface_transform.axis(0));
        camera_transform.set_axis(1, surface_transform.axis(1));
        camera_transform.set_axis(2, surface_transform.axis(2));

        let mut camera = Transform::IDENTITY;
        camera.position = mirrored_point(main_camera_position, &surface_transform, &camera_transform);

        for i in 0..3 {
            camera.set_axis(
                i,
                mirrored_vector(main_camera_rotation.col(i), &surface_transform, &camera_transform),
            );
        }

        let forward = camera_transform.axis(0);
        let plane = Plane::new(-forward, camera_transform.position.dot(-forward));
        Some((camera, plane))
    }

    /// Emit the visible portal surface polygons, e.g. for the stencil pass.
    pub fn render_portal(
        &self,
        vis_id: VisibilityId,
        draw_list: &mut DrawCallList,
        device: &mut dyn GraphicsDevice,
        materials: &MaterialCache,
    ) {
        let vis = &self.visibility[vis_id as usize];

        for portal in &vis.camera_portal_surfaces {
            let surface = &self.surfaces[portal.surface_index];

            let Some(handle) = device.alloc_transient(&[], &surface.indices) else {
                crate::engine::warn_once_transient_buffer();
                return;
            };

            let material = materials.material(surface.material);
            let mut dc = DrawCall::new(
                surface.material,
                VertexBufferRange::static_buffer(
                    self.vertex_buffers[surface.buffer_index],
                    self.vertices[surface.buffer_index].len() as u32,
                ),
                IndexBufferRange {
                    source: IndexBufferSource::Transient(handle),
                    first_index: 0,
                    n_indices: surface.indices.len() as u32,
                },
            );
            dc.material_sort = material.sort;
            dc.material_sorted_index = material.sorted_index;
            draw_list.push(dc);
        }
    }

    /// Emit the visible reflective surface polygons using their front-side
    /// materials.
    pub fn render_reflective(
        &self,
        vis_id: VisibilityId,
        draw_list: &mut DrawCallList,
        device: &mut dyn GraphicsDevice,
        materials: &MaterialCache,
    ) {
        let vis = &self.visibility[vis_id as usize];

        for reflective in &vis.camera_reflective_surfaces {
            let surface = &self.surfaces[reflective.surface_index];
            let material_index = materials
                .material(surface.material)
                .reflective_front_side_material
                .unwrap_or(surface.material);
            let material = materials.material(material_index);

            let Some(handle) = device.alloc_transient(&[], &surface.indices) else {
                crate::engine::warn_once_transient_buffer();
                return;
            };

            let mut dc = DrawCall::new(
                material_index,
                VertexBufferRange::static_buffer(
                    self.vertex_buffers[surface.buffer_index],
                    self.vertices[surface.buffer_index].len() as u32,
                ),
                IndexBufferRange {
                    source: IndexBufferSource::Transient(handle),
                    first_index: 0,
                    n_indices: surface.indices.len() as u32,
                },
            );
            dc.material_sort = material.sort;
            dc.material_sorted_index = material.sorted_index;
            draw_list.push(dc);
        }
    }
}
