//! MDS (Wolfenstein skeletal format) decoding and CPU skinning.
//!
//! Bone orientations are stored per frame as compressed shorts; translations
//! chain through the parent hierarchy via a pitch/yaw offset direction and a
//! fixed parent distance. Vertices carry bone weights and are skinned on the
//! CPU into transient geometry each frame. Bones with a torso weight blend
//! between the leg and torso animation frames.

use glam::{Mat3, Vec2, Vec3};
use log::warn;

use crate::bytes::ByteReader;
use crate::draw::{DrawCall, DrawCallList, IndexBufferRange, IndexBufferSource, VertexBufferRange};
use crate::material::parse::ParseContext;
use crate::material::{MaterialCache, MaterialIndex, MaterialLightmapId};
use crate::math::{Bounds, ClipResult, Frustum, Transform};
use crate::model::ModelRenderContext;
use crate::scene::{RenderEntity, RenderEntityFlags};
use crate::vertex::Vertex;

const MDS_MAGIC: u32 = u32::from_le_bytes(*b"MDSW");
const MDS_VERSION: i32 = 4;

const ANGLE_SCALE: f32 = 360.0 / 65536.0;

struct BoneInfo {
    name: String,
    parent: i32,
    /// Scale torso rotation about the torso parent by this.
    torso_weight: f32,
    parent_dist: f32,
    flags: i32,
}

#[derive(Clone, Copy)]
struct CompressedBone {
    /// Absolute orientation angles, compressed to shorts.
    angles: [i16; 4],
    /// Pitch/yaw direction from the parent to this bone's position.
    offset_angles: [i16; 2],
}

struct MdsFrame {
    bounds: Bounds,
    local_origin: Vec3,
    radius: f32,
    parent_offset: Vec3,
    bones: Vec<CompressedBone>,
}

struct Weight {
    bone_index: usize,
    bone_weight: f32,
    offset: Vec3,
}

struct MdsVertex {
    normal: Vec3,
    tex_coords: Vec2,
    weights: Vec<Weight>,
}

struct MdsSurface {
    name: String,
    material: MaterialIndex,
    vertices: Vec<MdsVertex>,
    indices: Vec<u16>,
}

struct Tag {
    name: String,
    bone_index: usize,
}

/// A decoded skeletal model.
pub struct MdsModel {
    pub name: String,
    frames: Vec<MdsFrame>,
    bone_info: Vec<BoneInfo>,
    torso_parent: usize,
    surfaces: Vec<MdsSurface>,
    tags: Vec<Tag>,
    n_vertices: u32,
}

/// An evaluated bone: absolute rotation plus world translation.
#[derive(Clone, Copy, Default)]
struct Bone {
    rotation: Mat3,
    translation: Vec3,
}

fn angles_to_axis(angles: Vec3) -> Mat3 {
    let (sp, cp) = angles.x.to_radians().sin_cos();
    let (sy, cy) = angles.y.to_radians().sin_cos();
    let (sr, cr) = angles.z.to_radians().sin_cos();

    let forward = Vec3::new(cp * cy, cp * sy, -sp);
    let right = Vec3::new(-sr * sp * cy + cr * sy, -sr * sp * sy - cr * cy, -sr * cp);
    let up = Vec3::new(cr * sp * cy + sr * sy, cr * sp * sy - sr * cy, cr * cp);
    Mat3::from_cols(forward, -right, up)
}

/// Lerp two angles along the shortest path, in degrees.
fn lerp_angle(from: f32, to: f32, fraction: f32) -> f32 {
    let mut delta = to - from;

    if delta > 180.0 {
        delta -= 360.0;
    } else if delta < -180.0 {
        delta += 360.0;
    }

    from + delta * fraction
}

impl MdsModel {
    pub fn load(
        name: &str,
        materials: &mut MaterialCache,
        ctx: &mut ParseContext,
    ) -> Option<MdsModel> {
        let Some(data) = ctx.host.read_file(name) else {
            warn!("model {name}: file not found");
            return None;
        };

        let reader = ByteReader::new(&data);
        let mut header = reader.at(0);
        let ident = header.u32();
        let version = header.i32();
        let _model_name = header.fixed_str(64);
        let _lod_scale = header.f32();
        let _lod_bias = header.f32();
        let n_frames = header.i32() as usize;
        let n_bones = header.i32() as usize;
        let frames_offset = header.i32() as usize;
        let bones_offset = header.i32() as usize;
        let torso_parent = header.i32().max(0) as usize;
        let n_surfaces = header.i32() as usize;
        let surfaces_offset = header.i32() as usize;
        let n_tags = header.i32() as usize;
        let tags_offset = header.i32() as usize;
        let _end_offset = header.i32();

        if ident != MDS_MAGIC {
            warn!("model {name}: wrong ident ({ident:#x} should be {MDS_MAGIC:#x})");
            return None;
        }

        if version != MDS_VERSION {
            warn!("model {name}: wrong version ({version} should be {MDS_VERSION})");
            return None;
        }

        if n_frames < 1 {
            warn!("model {name}: no frames");
            return None;
        }

        // Bone info.
        let mut bone_info = Vec::with_capacity(n_bones);
        let mut bone_reader = reader.at(bones_offset);

        for _ in 0..n_bones {
            bone_info.push(BoneInfo {
                name: bone_reader.fixed_str(64),
                parent: bone_reader.i32(),
                torso_weight: bone_reader.f32(),
                parent_dist: bone_reader.f32(),
                flags: bone_reader.i32(),
            });
        }

        // Frames. Each is a fixed header plus compressed bones.
        let frame_size = 52 + n_bones * 12;
        let mut frames = Vec::with_capacity(n_frames);

        for i in 0..n_frames {
            let mut frame_reader = reader.at(frames_offset + i * frame_size);
            let min = frame_reader.vec3();
            let max = frame_reader.vec3();
            let local_origin = frame_reader.vec3();
            let radius = frame_reader.f32();
            let parent_offset = frame_reader.vec3();

            let mut bones = Vec::with_capacity(n_bones);

            for _ in 0..n_bones {
                let angles = [
                    frame_reader.i16(),
                    frame_reader.i16(),
                    frame_reader.i16(),
                    frame_reader.i16(),
                ];
                let offset_angles = [frame_reader.i16(), frame_reader.i16()];
                bones.push(CompressedBone {
                    angles,
                    offset_angles,
                });
            }

            if !frame_reader.ok() {
                warn!("model {name}: truncated frame data");
                return None;
            }

            frames.push(MdsFrame {
                bounds: Bounds::new(min, max),
                local_origin,
                radius,
                parent_offset,
                bones,
            });
        }

        // Tags.
        let mut tags = Vec::with_capacity(n_tags);
        let mut tag_reader = reader.at(tags_offset);

        for _ in 0..n_tags {
            let tag_name = tag_reader.fixed_str(64);
            let _torso_weight = tag_reader.f32();
            let bone_index = tag_reader.i32().max(0) as usize;
            tags.push(Tag {
                name: tag_name,
                bone_index,
            });
        }

        // Surfaces.
        let mut surfaces = Vec::with_capacity(n_surfaces);
        let mut surface_offset = surfaces_offset;
        let mut n_vertices_total = 0u32;

        for _ in 0..n_surfaces {
            let mut s = reader.at(surface_offset);
            let _ident = s.i32();
            let surface_name = s.fixed_str(64).to_ascii_lowercase();
            let shader_name = s.fixed_str(64);
            let _shader_index = s.i32();
            let _min_lod = s.i32();
            let _header_offset = s.i32();
            let n_vertices = s.i32() as usize;
            let vertices_offset = s.i32() as usize;
            let n_triangles = s.i32() as usize;
            let triangles_offset = s.i32() as usize;
            let _collapse_map_offset = s.i32();
            let _n_bone_references = s.i32();
            let _bone_references_offset = s.i32();
            let end = s.i32() as usize;

            if !s.ok() {
                warn!("model {name}: truncated surface data");
                return None;
            }

            let material = materials
                .find_material(&shader_name, MaterialLightmapId::NONE, true, ctx)
                .unwrap_or_else(|| materials.default_material());

            // Vertices are variable sized: weights follow each header.
            let mut vertices = Vec::with_capacity(n_vertices);
            let mut v = reader.at(surface_offset + vertices_offset);

            for _ in 0..n_vertices {
                let normal = v.vec3();
                let tex_coords = Vec2::new(v.f32(), v.f32());
                let n_weights = v.i32().max(0) as usize;
                let _fixed_parent = v.i32();
                let _fixed_dist = v.f32();

                let mut weights = Vec::with_capacity(n_weights);

                for _ in 0..n_weights {
                    let bone_index = v.i32().max(0) as usize;
                    let bone_weight = v.f32();
                    let offset = v.vec3();
                    weights.push(Weight {
                        bone_index: bone_index.min(n_bones.saturating_sub(1)),
                        bone_weight,
                        offset,
                    });
                }

                vertices.push(MdsVertex {
                    normal,
                    tex_coords,
                    weights,
                });
            }

            let mut indices = Vec::with_capacity(n_triangles * 3);
            let mut t = reader.at(surface_offset + triangles_offset);

            for _ in 0..n_triangles * 3 {
                indices.push(t.i32() as u16);
            }

            if !v.ok() || !t.ok() {
                warn!("model {name}: truncated surface geometry");
                return None;
            }

            n_vertices_total += n_vertices as u32;
            surfaces.push(MdsSurface {
                name: surface_name,
                material,
                vertices,
                indices,
            });
            surface_offset += end;
        }

        Some(MdsModel {
            name: name.to_string(),
            frames,
            bone_info,
            torso_parent: torso_parent.min(n_bones.saturating_sub(1)),
            surfaces,
            tags,
            n_vertices: n_vertices_total,
        })
    }

    #[must_use]
    pub fn bounds(&self) -> Bounds {
        self.frames[0].bounds
    }

    fn clamp_frame(&self, frame: i32) -> usize {
        (frame.max(0) as usize).min(self.frames.len() - 1)
    }

    #[must_use]
    pub fn is_culled(&self, entity: &RenderEntity, frustum: &Frustum) -> bool {
        let frame = &self.frames[self.clamp_frame(entity.frame)];
        let old_frame = &self.frames[self.clamp_frame(entity.old_frame)];
        let matrix = crate::math::model_matrix(entity.rotation, entity.position);

        let cr1 = frustum.clip_sphere(matrix.transform_point3(frame.local_origin), frame.radius);
        let cr2 =
            frustum.clip_sphere(matrix.transform_point3(old_frame.local_origin), old_frame.radius);

        if cr1 == ClipResult::Outside && cr2 == ClipResult::Outside {
            return frustum
                .clip_bounds(Bounds::merge(frame.bounds, old_frame.bounds), &matrix)
                == ClipResult::Outside;
        }

        false
    }

    /// Evaluate the bone hierarchy for a blended (leg, torso) frame pair.
    fn calculate_bones(&self, entity: &RenderEntity) -> Vec<Bone> {
        let frame = &self.frames[self.clamp_frame(entity.frame)];
        let old_frame = &self.frames[self.clamp_frame(entity.old_frame)];
        let torso_frame = &self.frames[self.clamp_frame(entity.torso_frame)];
        let old_torso_frame = &self.frames[self.clamp_frame(entity.old_torso_frame)];

        let mut bones = vec![Bone::default(); self.bone_info.len()];

        for (i, info) in self.bone_info.iter().enumerate() {
            // Frame-lerped angles, torso-blended by the bone's torso weight.
            let angle = |slot: usize| {
                let leg = lerp_angle(
                    f32::from(old_frame.bones[i].angles[slot]) * ANGLE_SCALE,
                    f32::from(frame.bones[i].angles[slot]) * ANGLE_SCALE,
                    entity.lerp,
                );

                if info.torso_weight <= 0.0 {
                    return leg;
                }

                let torso = lerp_angle(
                    f32::from(old_torso_frame.bones[i].angles[slot]) * ANGLE_SCALE,
                    f32::from(torso_frame.bones[i].angles[slot]) * ANGLE_SCALE,
                    entity.torso_lerp,
                );

                lerp_angle(leg, torso, info.torso_weight)
            };

            let rotation = angles_to_axis(Vec3::new(angle(0), angle(1), angle(2)));

            let translation = if info.parent < 0 {
                let from = old_frame.parent_offset;
                let to = frame.parent_offset;
                from.lerp(to, entity.lerp)
            } else {
                let parent = &bones[info.parent as usize];

                // The offset direction is stored as pitch/yaw only.
                let dir_angle = |slot: usize| {
                    let leg = lerp_angle(
                        f32::from(old_frame.bones[i].offset_angles[slot]) * ANGLE_SCALE,
                        f32::from(frame.bones[i].offset_angles[slot]) * ANGLE_SCALE,
                        entity.lerp,
                    );

                    if info.torso_weight <= 0.0 {
                        return leg;
                    }

                    let torso = lerp_angle(
                        f32::from(old_torso_frame.bones[i].offset_angles[slot]) * ANGLE_SCALE,
                        f32::from(torso_frame.bones[i].offset_angles[slot]) * ANGLE_SCALE,
                        entity.torso_lerp,
                    );

                    lerp_angle(leg, torso, info.torso_weight)
                };

                let angles = Vec3::new(dir_angle(0), dir_angle(1), 0.0);
                let direction = angles_to_axis(angles).x_axis;
                parent.translation + direction * info.parent_dist
            };

            bones[i] = Bone {
                rotation,
                translation,
            };
        }

        bones
    }

    #[must_use]
    pub fn lerp_tag(
        &self,
        name: &str,
        entity: &RenderEntity,
        start_index: usize,
    ) -> Option<(usize, Transform)> {
        let (tag_index, tag) = self
            .tags
            .iter()
            .enumerate()
            .find(|(i, tag)| *i >= start_index && tag.name == name)?;

        let bones = self.calculate_bones(entity);
        let bone = bones.get(tag.bone_index)?;
        Some((tag_index, Transform::new(bone.rotation, bone.translation)))
    }

    pub fn render(
        &self,
        ctx: &mut ModelRenderContext,
        draw_list: &mut DrawCallList,
        entity: &RenderEntity,
    ) {
        if self.n_vertices == 0 {
            return;
        }

        let bones = self.calculate_bones(entity);
        let model_matrix = crate::math::model_matrix(entity.rotation, entity.position);

        let fog_index = ctx.world.map_or(-1, |world| {
            let frame = &self.frames[self.clamp_frame(entity.frame)];
            world.find_fog_index_sphere(entity.position + frame.local_origin, frame.radius)
        });

        for surface in &self.surfaces {
            // Skin the surface on the CPU.
            let mut vertices = Vec::with_capacity(surface.vertices.len());

            for v in &surface.vertices {
                let mut position = Vec3::ZERO;
                let mut normal = Vec3::ZERO;

                for weight in &v.weights {
                    let bone = &bones[weight.bone_index];
                    position += (bone.rotation * weight.offset + bone.translation)
                        * weight.bone_weight;
                    normal += (bone.rotation * v.normal) * weight.bone_weight;
                }

                let mut vertex = Vertex::default();
                vertex.set_pos(position);
                vertex.set_normal(normal.normalize_or(Vec3::Z));
                vertex.set_tex_coord(v.tex_coords.x, v.tex_coords.y, 0.0, 0.0);
                vertex.color = [255, 255, 255, 255];
                vertices.push(vertex);
            }

            let Some(handle) = ctx.device.alloc_transient(&vertices, &surface.indices) else {
                crate::engine::warn_once_transient_buffer();
                return;
            };

            let mut material = surface.material;

            if entity.custom_material > 0 && (entity.custom_material as usize) < ctx.materials.len()
            {
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

            let mut dc = DrawCall::new(
                material,
                VertexBufferRange::transient(handle, vertices.len() as u32),
                IndexBufferRange {
                    source: IndexBufferSource::Transient(handle),
                    first_index: 0,
                    n_indices: surface.indices.len() as u32,
                },
            );
            dc.entity = Some(ctx.entity_index);
            dc.fog_index = fog_index;
            dc.material_sort = material_data.sort;
            dc.material_sorted_index = material_data.sorted_index;
            dc.model_matrix = model_matrix;

            if entity.flags.contains(RenderEntityFlags::DEPTH_HACK) {
                dc.z_scale = 0.3;
            }

            draw_list.push(dc);
        }
    }
}
