//! MD3 and MDC (compressed MD3) triangle model decoding.
//!
//! Static models (one frame) bake their surfaces into a single static
//! vertex buffer; animated models keep per-frame vertex arrays in system
//! memory and lerp into a transient buffer at render time. MDC stores most
//! frames as byte deltas against a base frame.

use glam::{Mat3, Vec3};
use log::warn;

use crate::bytes::ByteReader;
use crate::draw::{DrawCall, DrawCallList, IndexBufferRange, IndexBufferSource, VertexBufferRange};
use crate::gpu::{IndexBufferHandle, VertexBufferHandle};
use crate::material::calculate::{sin_table, FUNC_TABLE_MASK, FUNC_TABLE_SIZE};
use crate::material::parse::ParseContext;
use crate::material::{MaterialCache, MaterialIndex, MaterialLightmapId};
use crate::math::{Bounds, ClipResult, Frustum, Transform};
use crate::model::ModelRenderContext;
use crate::scene::{RenderEntity, RenderEntityFlags};
use crate::vertex::Vertex;

const MD3_MAGIC: u32 = u32::from_le_bytes(*b"IDP3");
const MD3_VERSION: i32 = 15;
const MDC_MAGIC: u32 = u32::from_le_bytes(*b"IDPC");
const MDC_VERSION: i32 = 2;

const XYZ_SCALE: f32 = 1.0 / 64.0;
const MDC_TAG_ANGLE_SCALE: f32 = 360.0 / 32700.0;
const MDC_MAX_OFS: f32 = 127.0;
const MDC_DIST_SCALE: f32 = 0.05;

struct Frame {
    bounds: Bounds,
    position: Vec3,
    radius: f32,
    tags: Vec<Transform>,
    /// Merged surface vertices for this frame. Animated models only keep
    /// these in system memory.
    vertices: Vec<Vertex>,
}

struct Surface {
    /// Polyset name, lowercased for skin compares.
    name: String,
    materials: Vec<MaterialIndex>,
    start_index: u32,
    n_indices: u32,
}

/// A decoded MD3 or MDC model.
pub struct Md3Model {
    pub name: String,
    compressed: bool,
    frames: Vec<Frame>,
    tag_names: Vec<String>,
    surfaces: Vec<Surface>,
    /// System-memory copy for CPU deforms.
    indices: Vec<u16>,
    index_buffer: IndexBufferHandle,
    /// Static (single-frame) models only.
    vertex_buffer: VertexBufferHandle,
    /// Vertices in all surfaces of a single frame.
    n_vertices: u32,
}

/// Decode the 16-bit lat/long packed normal through the sin table.
fn decode_normal(normal: i16) -> Vec3 {
    let lat = (((normal >> 8) & 0xff) as usize) * (FUNC_TABLE_SIZE / 256);
    let lng = ((normal & 0xff) as usize) * (FUNC_TABLE_SIZE / 256);
    Vec3::new(
        sin_table(lat + FUNC_TABLE_SIZE / 4) * sin_table(lng),
        sin_table(lat) * sin_table(lng),
        sin_table((lng + FUNC_TABLE_SIZE / 4) & FUNC_TABLE_MASK),
    )
}

/// The 256-entry anormals table used by MDC compressed normals, generated
/// procedurally: rings of constant z, matching the table the exporter used.
fn mdc_anormal(index: u8) -> Vec3 {
    const RING_COUNTS: [usize; 16] = [32, 32, 24, 20, 16, 12, 8, 4, 32, 24, 20, 16, 12, 8, 4, 4];
    const RING_Z: [f32; 16] = [
        0.0, -0.19509, -0.382683, -0.55557, -0.707107, -0.83147, -0.92388, -0.980785, 0.19509,
        0.382683, 0.55557, 0.707107, 0.83147, 0.92388, 0.980785, 0.980785,
    ];

    let mut i = index as usize;

    for (ring, &count) in RING_COUNTS.iter().enumerate() {
        if i < count {
            let z = RING_Z[ring];
            let r = (1.0 - z * z).max(0.0).sqrt();
            let angle = i as f32 / count as f32 * std::f32::consts::TAU;
            return Vec3::new(r * angle.cos(), r * angle.sin(), z);
        }

        i -= count;
    }

    Vec3::Z
}

/// Rotation axes from (pitch, yaw, roll) degrees, id convention:
/// axis 0 forward, axis 1 left, axis 2 up.
fn mat3_from_angles(angles: Vec3) -> Mat3 {
    let (sp, cp) = angles.x.to_radians().sin_cos();
    let (sy, cy) = angles.y.to_radians().sin_cos();
    let (sr, cr) = angles.z.to_radians().sin_cos();

    let forward = Vec3::new(cp * cy, cp * sy, -sp);
    let right = Vec3::new(-sr * sp * cy + cr * sy, -sr * sp * sy - cr * cy, -sr * cp);
    let up = Vec3::new(cr * sp * cy + sr * sy, cr * sp * sy - sr * cy, cr * cp);

    Mat3::from_cols(forward, -right, up)
}

struct FileSurface {
    offset: usize,
    name: String,
    n_shaders: usize,
    n_vertices: usize,
    n_triangles: usize,
    triangles_offset: usize,
    shaders_offset: usize,
    uvs_offset: usize,
    position_normal_offset: usize,
    // MDC only.
    position_normal_compressed_offset: usize,
    base_frames_offset: usize,
    compressed_frames_offset: usize,
}

impl Md3Model {
    /// Load from the virtual filesystem. `None` on failure (a warning has
    /// been logged); the caller maps this to handle 0.
    pub fn load(
        name: &str,
        compressed: bool,
        materials: &mut MaterialCache,
        ctx: &mut ParseContext,
    ) -> Option<Md3Model> {
        let Some(data) = ctx.host.read_file(name) else {
            warn!("model {name}: file not found");
            return None;
        };

        let mut reader = ByteReader::new(&data);
        let ident = reader.u32();
        let version = reader.i32();
        let _model_name = reader.fixed_str(64);
        let _flags = reader.i32();
        let n_frames = reader.i32() as usize;
        let n_tags = reader.i32() as usize;
        let n_surfaces = reader.i32() as usize;
        let _n_skins = reader.i32();
        let frames_offset = reader.i32() as usize;
        let tag_names_offset = if compressed { reader.i32() as usize } else { 0 };
        let tags_offset = reader.i32() as usize;
        let surfaces_offset = reader.i32() as usize;
        let _end_offset = reader.i32();

        let (valid_ident, valid_version) = if compressed {
            (MDC_MAGIC, MDC_VERSION)
        } else {
            (MD3_MAGIC, MD3_VERSION)
        };

        if ident != valid_ident {
            warn!("model {name}: wrong ident ({ident:#x} should be {valid_ident:#x})");
            return None;
        }

        if version != valid_version {
            warn!("model {name}: wrong version ({version} should be {valid_version})");
            return None;
        }

        if n_frames < 1 {
            warn!("model {name}: no frames");
            return None;
        }

        let mut model = Md3Model {
            name: name.to_string(),
            compressed,
            frames: Vec::with_capacity(n_frames),
            tag_names: Vec::with_capacity(n_tags),
            surfaces: Vec::new(),
            indices: Vec::new(),
            index_buffer: IndexBufferHandle::INVALID,
            vertex_buffer: VertexBufferHandle::INVALID,
            n_vertices: 0,
        };

        // Frames, with their per-frame tag transforms.
        let mut frame_reader = reader.at(frames_offset);

        for i in 0..n_frames {
            let min = frame_reader.vec3();
            let max = frame_reader.vec3();
            let position = frame_reader.vec3();
            let radius = frame_reader.f32();
            let _frame_name = frame_reader.fixed_str(16);

            let mut tags = Vec::with_capacity(n_tags);

            for j in 0..n_tags {
                if compressed {
                    let mut tag_reader = reader.at(tags_offset + (j + i * n_tags) * 12);
                    let mut position = Vec3::ZERO;
                    let mut angles = Vec3::ZERO;

                    for k in 0..3 {
                        position[k] = f32::from(tag_reader.i16()) * XYZ_SCALE;
                    }

                    for k in 0..3 {
                        angles[k] = f32::from(tag_reader.i16()) * MDC_TAG_ANGLE_SCALE;
                    }

                    tags.push(Transform::new(mat3_from_angles(angles), position));
                } else {
                    let mut tag_reader = reader.at(tags_offset + (j + i * n_tags) * 112);
                    let _tag_name = tag_reader.fixed_str(64);
                    let position = tag_reader.vec3();
                    let rotation =
                        Mat3::from_cols(tag_reader.vec3(), tag_reader.vec3(), tag_reader.vec3());
                    tags.push(Transform::new(rotation, position));
                }
            }

            model.frames.push(Frame {
                bounds: Bounds::new(min, max),
                position,
                radius,
                tags,
                vertices: Vec::new(),
            });
        }

        // Tag names.
        if compressed {
            let mut name_reader = reader.at(tag_names_offset);

            for _ in 0..n_tags {
                model.tag_names.push(name_reader.fixed_str(64));
            }
        } else {
            for i in 0..n_tags {
                let mut tag_reader = reader.at(tags_offset + i * 112);
                model.tag_names.push(tag_reader.fixed_str(64));
            }
        }

        // Surface headers, common between the two formats.
        let mut file_surfaces = Vec::with_capacity(n_surfaces);
        let mut surface_offset = surfaces_offset;

        for _ in 0..n_surfaces {
            let mut s = reader.at(surface_offset);
            let _ident = s.i32();
            let surface_name = s.fixed_str(64);
            let _flags = s.i32();

            let fs = if compressed {
                let n_compressed_frames = s.i32() as usize;
                let _n_base_frames = s.i32();
                let n_shaders = s.i32() as usize;
                let n_vertices = s.i32() as usize;
                let n_triangles = s.i32() as usize;
                let triangles_offset = s.i32() as usize;
                let shaders_offset = s.i32() as usize;
                let uvs_offset = s.i32() as usize;
                let position_normal_offset = s.i32() as usize;
                let position_normal_compressed_offset = s.i32() as usize;
                let base_frames_offset = s.i32() as usize;
                let compressed_frames_offset = s.i32() as usize;
                let end = s.i32() as usize;
                let _ = n_compressed_frames;
                let fs = FileSurface {
                    offset: surface_offset,
                    name: surface_name,
                    n_shaders,
                    n_vertices,
                    n_triangles,
                    triangles_offset,
                    shaders_offset,
                    uvs_offset,
                    position_normal_offset,
                    position_normal_compressed_offset,
                    base_frames_offset,
                    compressed_frames_offset,
                };
                surface_offset += end;
                fs
            } else {
                let _n_frames = s.i32();
                let n_shaders = s.i32() as usize;
                let n_vertices = s.i32() as usize;
                let n_triangles = s.i32() as usize;
                let triangles_offset = s.i32() as usize;
                let shaders_offset = s.i32() as usize;
                let uvs_offset = s.i32() as usize;
                let position_normal_offset = s.i32() as usize;
                let end = s.i32() as usize;
                let fs = FileSurface {
                    offset: surface_offset,
                    name: surface_name,
                    n_shaders,
                    n_vertices,
                    n_triangles,
                    triangles_offset,
                    shaders_offset,
                    uvs_offset,
                    position_normal_offset,
                    position_normal_compressed_offset: 0,
                    base_frames_offset: 0,
                    compressed_frames_offset: 0,
                };
                surface_offset += end;
                fs
            };

            if !s.ok() {
                warn!("model {name}: truncated surface data");
                return None;
            }

            file_surfaces.push(fs);
        }

        // Surfaces: names, materials, index/vertex totals.
        let mut n_indices = 0usize;

        for fs in &file_surfaces {
            let mut surface_name = fs.name.to_ascii_lowercase();

            // Strip a trailing _1 or _2; q3data leaves these behind.
            if surface_name.len() > 2
                && surface_name.as_bytes()[surface_name.len() - 2] == b'_'
            {
                surface_name.truncate(surface_name.len() - 2);
            }

            let mut surface_materials = Vec::with_capacity(fs.n_shaders);
            let mut shader_reader = reader.at(fs.offset + fs.shaders_offset);

            for _ in 0..fs.n_shaders {
                let shader_name = shader_reader.fixed_str(64);
                let _shader_index = shader_reader.i32();
                let material = materials
                    .find_material(&shader_name, MaterialLightmapId::NONE, true, ctx)
                    .unwrap_or_else(|| materials.default_material());
                surface_materials.push(material);
            }

            model.surfaces.push(Surface {
                name: surface_name,
                materials: surface_materials,
                start_index: n_indices as u32,
                n_indices: (fs.n_triangles * 3) as u32,
            });

            n_indices += fs.n_triangles * 3;
            model.n_vertices += fs.n_vertices as u32;
        }

        // Models with no geometry (e.g. weapon hand models) stop here.
        if n_indices == 0 {
            return Some(model);
        }

        // Merge all surface indices into one buffer.
        let mut indices = vec![0u16; n_indices];
        let mut start_index = 0usize;
        let mut start_vertex = 0usize;

        for fs in &file_surfaces {
            let mut triangle_reader = reader.at(fs.offset + fs.triangles_offset);

            for j in 0..fs.n_triangles * 3 {
                indices[start_index + j] = (start_vertex as i32 + triangle_reader.i32()) as u16;
            }

            start_index += fs.n_triangles * 3;
            start_vertex += fs.n_vertices;
        }

        model.index_buffer = ctx.device.create_index_buffer(&indices);

        let is_animated = model.frames.len() > 1;

        if is_animated {
            // Keep a copy in system memory for CPU deforms.
            model.indices = indices;
        }

        // Vertices. Texture coords are shared across frames; positions and
        // normals are per frame.
        for frame in &mut model.frames {
            frame.vertices = vec![Vertex::default(); model.n_vertices as usize];
        }

        let mut start_vertex = 0usize;

        for fs in &file_surfaces {
            for frame_index in 0..n_frames {
                let position_normal_frame = if compressed {
                    let mut base_reader =
                        reader.at(fs.offset + fs.base_frames_offset + frame_index * 2);
                    base_reader.i16() as usize
                } else {
                    frame_index
                };

                let mut uv_reader = reader.at(fs.offset + fs.uvs_offset);
                let mut xyz_reader = reader.at(
                    fs.offset + fs.position_normal_offset
                        + position_normal_frame * 8 * fs.n_vertices,
                );

                for k in 0..fs.n_vertices {
                    let x = f32::from(xyz_reader.i16()) * XYZ_SCALE;
                    let y = f32::from(xyz_reader.i16()) * XYZ_SCALE;
                    let z = f32::from(xyz_reader.i16()) * XYZ_SCALE;
                    let normal = xyz_reader.i16();

                    let mut uvs = reader.at(uv_reader.offset() + k * 8);
                    let s = uvs.f32();
                    let t = uvs.f32();

                    let v = &mut model.frames[frame_index].vertices[start_vertex + k];
                    v.set_pos(Vec3::new(x, y, z));
                    v.set_normal(decode_normal(normal));
                    v.set_tex_coord(s, t, 0.0, 0.0);
                    v.color = [255, 255, 255, 255];

                    if compressed {
                        // A non -1 compressed frame index is a delta against
                        // the base frame.
                        let mut comp_reader = reader
                            .at(fs.offset + fs.compressed_frames_offset + frame_index * 2);
                        let compressed_frame = comp_reader.i16();

                        if compressed_frame != -1 {
                            let mut delta_reader = reader.at(
                                fs.offset
                                    + fs.position_normal_compressed_offset
                                    + compressed_frame as usize * 4 * fs.n_vertices
                                    + k * 4,
                            );
                            let ofs_vec = delta_reader.u32();
                            let delta = Vec3::new(
                                ((ofs_vec & 255) as f32 - MDC_MAX_OFS) * MDC_DIST_SCALE,
                                (((ofs_vec >> 8) & 255) as f32 - MDC_MAX_OFS) * MDC_DIST_SCALE,
                                (((ofs_vec >> 16) & 255) as f32 - MDC_MAX_OFS) * MDC_DIST_SCALE,
                            );
                            v.set_pos(v.pos() + delta);
                            v.set_normal(mdc_anormal((ofs_vec >> 24) as u8));
                        }
                    }
                }
            }

            start_vertex += fs.n_vertices;
        }

        if !is_animated {
            model.vertex_buffer = ctx.device.create_vertex_buffer(&model.frames[0].vertices);
        }

        Some(model)
    }

    #[must_use]
    pub fn bounds(&self) -> Bounds {
        self.frames[0].bounds
    }

    fn clamp_frame(&self, frame: i32) -> usize {
        (frame.max(0) as usize).min(self.frames.len() - 1)
    }

    /// Sphere cull against both the old and new frame, falling back to the
    /// merged frame bounds.
    #[must_use]
    pub fn is_culled(&self, entity: &RenderEntity, frustum: &Frustum) -> bool {
        // It is possible to have a bad frame while changing models.
        let frame_index = self.clamp_frame(entity.frame);
        let old_frame_index = self.clamp_frame(entity.old_frame);
        let frame = &self.frames[frame_index];
        let old_frame = &self.frames[old_frame_index];
        let matrix = crate::math::model_matrix(entity.rotation, entity.position);

        // Cull the bounding sphere only if this is not a scaled entity.
        if !entity.non_normalized_axes {
            if frame_index == old_frame_index {
                match frustum.clip_sphere(matrix.transform_point3(frame.position), frame.radius) {
                    ClipResult::Outside => return true,
                    ClipResult::Inside => return false,
                    ClipResult::Partial => {}
                }
            } else {
                let cr1 =
                    frustum.clip_sphere(matrix.transform_point3(frame.position), frame.radius);
                let cr2 = frustum
                    .clip_sphere(matrix.transform_point3(old_frame.position), old_frame.radius);

                if cr1 == cr2 {
                    match cr1 {
                        ClipResult::Outside => return true,
                        ClipResult::Inside => return false,
                        ClipResult::Partial => {}
                    }
                }
            }
        }

        frustum.clip_bounds(Bounds::merge(frame.bounds, old_frame.bounds), &matrix)
            == ClipResult::Outside
    }

    fn tag(&self, name: &str, frame: i32, start_index: usize) -> Option<(usize, Transform)> {
        let frame = self.clamp_frame(frame);

        for (i, tag_name) in self.tag_names.iter().enumerate() {
            if i >= start_index && tag_name == name {
                return Some((i, self.frames[frame].tags[i]));
            }
        }

        None
    }

    #[must_use]
    pub fn lerp_tag(
        &self,
        name: &str,
        entity: &RenderEntity,
        start_index: usize,
    ) -> Option<(usize, Transform)> {
        let (tag_index, from) = self.tag(name, entity.old_frame, start_index)?;
        let (_, to) = self.tag(name, entity.frame, start_index)?;

        let mut transform = Transform::IDENTITY;
        transform.position = from.position.lerp(to.position, entity.lerp);

        for i in 0..3 {
            transform.set_axis(
                i,
                from.axis(i).lerp(to.axis(i), entity.lerp).normalize_or(Vec3::X),
            );
        }

        Some((tag_index, transform))
    }

    pub fn render(
        &self,
        ctx: &mut ModelRenderContext,
        draw_list: &mut DrawCallList,
        entity: &RenderEntity,
    ) {
        // Can't render models with no geometry.
        if !self.index_buffer.is_valid() {
            return;
        }

        let frame_index = self.clamp_frame(entity.frame);
        let old_frame_index = self.clamp_frame(entity.old_frame);
        let model_matrix = crate::math::model_matrix(entity.rotation, entity.position);
        let is_animated = self.frames.len() > 1;

        // Animated models lerp their vertices into transient geometry.
        let mut lerped: Vec<Vertex> = Vec::new();

        if is_animated {
            let from = &self.frames[old_frame_index].vertices;
            let to = &self.frames[frame_index].vertices;
            lerped.reserve(self.n_vertices as usize);

            for (from_vertex, to_vertex) in from.iter().zip(to) {
                let mut v = Vertex::default();
                v.set_pos(from_vertex.pos().lerp(to_vertex.pos(), entity.lerp));
                v.set_normal(
                    from_vertex
                        .normal()
                        .lerp(to_vertex.normal(), entity.lerp)
                        .normalize_or(Vec3::Z),
                );
                v.tex_coord = to_vertex.tex_coord;
                v.color = to_vertex.color;
                lerped.push(v);
            }
        }

        let fog_index = ctx.world.map_or(-1, |world| {
            if is_animated {
                let frame = &self.frames[old_frame_index];
                world.find_fog_index_sphere(entity.position + frame.position, frame.radius)
            } else {
                world.find_fog_index_sphere(entity.position, self.frames[0].radius)
            }
        });

        // Shared transient buffer for all surfaces of an animated model.
        let transient = if is_animated {
            let Some(handle) = ctx.device.alloc_transient(&lerped, &[]) else {
                crate::engine::warn_once_transient_buffer();
                return;
            };
            Some(handle)
        } else {
            None
        };

        for surface in &self.surfaces {
            let mut material = surface.materials[0];

            if entity.custom_material > 0 && (entity.custom_material as usize) < ctx.materials.len() {
                material = MaterialIndex(entity.custom_material as usize);
            } else if entity.custom_skin > 0 {
                if let Some(skin) = ctx.materials.skin(entity.custom_skin) {
                    if let Some(custom) = skin.find_material(&surface.name) {
                        material = custom;
                    }
                }
            }

            material = ctx.materials.resolve(material);
            let material_data = ctx.materials.material(material);

            let vb = if let Some(handle) = transient {
                VertexBufferRange::transient(handle, self.n_vertices)
            } else {
                VertexBufferRange::static_buffer(self.vertex_buffer, self.n_vertices)
            };

            let ib;

            if is_animated && material_data.has_auto_sprite_deform() {
                // CPU deform path: copy the surface indices and deform the
                // transient contents.
                let first = surface.start_index as usize;
                let mut deform_indices =
                    self.indices[first..first + surface.n_indices as usize].to_vec();
                let mut deform_vertices = lerped.clone();
                material_data.do_autosprite_deform(
                    &ctx.scene_rotation,
                    &mut deform_vertices,
                    &mut deform_indices,
                    Some(entity),
                    ctx.camera_mirrored,
                );

                let Some(handle) = ctx.device.alloc_transient(&deform_vertices, &deform_indices)
                else {
                    crate::engine::warn_once_transient_buffer();
                    continue;
                };

                let mut dc = DrawCall::new(
                    material,
                    VertexBufferRange::transient(handle, self.n_vertices),
                    IndexBufferRange {
                        source: IndexBufferSource::Transient(handle),
                        first_index: 0,
                        n_indices: surface.n_indices,
                    },
                );
                dc.entity = Some(ctx.entity_index);
                dc.fog_index = fog_index;
                dc.material_sort = material_data.sort;
                dc.material_sorted_index = material_data.sorted_index;
                dc.model_matrix = model_matrix;
                apply_depth_hack(&mut dc, entity);
                draw_list.push(dc);
                continue;
            }

            ib = IndexBufferRange {
                source: IndexBufferSource::Static(self.index_buffer),
                first_index: surface.start_index,
                n_indices: surface.n_indices,
            };

            let mut dc = DrawCall::new(material, vb, ib);
            dc.entity = Some(ctx.entity_index);
            dc.fog_index = fog_index;
            dc.material_sort = material_data.sort;
            dc.material_sorted_index = material_data.sorted_index;
            dc.model_matrix = model_matrix;
            apply_depth_hack(&mut dc, entity);
            draw_list.push(dc);
        }
    }
}

fn apply_depth_hack(dc: &mut DrawCall, entity: &RenderEntity) {
    if entity.flags.contains(RenderEntityFlags::DEPTH_HACK) {
        dc.z_scale = 0.3;
    }
}

