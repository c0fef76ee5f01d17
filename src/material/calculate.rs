//! Per-frame material evaluation.
//!
//! Waveforms are sampled from precomputed 1024-entry function tables so
//! texture animations line up exactly with waveforms of the same frequency.
//! Texture-coordinate mods compose into a 2x2 matrix plus offset/turbulence
//! vector; color generators produce base + vertex color pairs; autosprite
//! deforms rebuild quads on the CPU.

use glam::{Mat3, Vec2, Vec3, Vec4};
use log::warn;
use once_cell::sync::Lazy;

use crate::material::{
    AdjustColorsForFog, AlphaGen, ColorGen, Deform, DeformStage, Material, MaterialStage, TexMod,
    TextureBundle, TextureBundleIndex, WaveFunc, Waveform, MAX_DEFORMS,
};
use crate::scene::RenderEntity;
use crate::texture::TextureId;
use crate::vertex::Vertex;

pub const FUNC_TABLE_SIZE: usize = 1024;
pub const FUNC_TABLE_SIZE_LOG2: usize = 10;
pub const FUNC_TABLE_MASK: usize = FUNC_TABLE_SIZE - 1;

static SIN_TABLE: Lazy<[f32; FUNC_TABLE_SIZE]> = Lazy::new(|| {
    std::array::from_fn(|i| (i as f32 * 360.0 / (FUNC_TABLE_SIZE - 1) as f32).to_radians().sin())
});

static SQUARE_TABLE: Lazy<[f32; FUNC_TABLE_SIZE]> =
    Lazy::new(|| std::array::from_fn(|i| if i < FUNC_TABLE_SIZE / 2 { 1.0 } else { -1.0 }));

static SAWTOOTH_TABLE: Lazy<[f32; FUNC_TABLE_SIZE]> =
    Lazy::new(|| std::array::from_fn(|i| i as f32 / FUNC_TABLE_SIZE as f32));

static INVERSE_SAWTOOTH_TABLE: Lazy<[f32; FUNC_TABLE_SIZE]> =
    Lazy::new(|| std::array::from_fn(|i| 1.0 - i as f32 / FUNC_TABLE_SIZE as f32));

static TRIANGLE_TABLE: Lazy<[f32; FUNC_TABLE_SIZE]> = Lazy::new(|| {
    let mut table = [0.0f32; FUNC_TABLE_SIZE];
    let quarter = FUNC_TABLE_SIZE / 4;

    for i in 0..FUNC_TABLE_SIZE {
        table[i] = if i < FUNC_TABLE_SIZE / 2 {
            if i < quarter {
                i as f32 / quarter as f32
            } else {
                1.0 - table[i - quarter]
            }
        } else {
            -table[i - FUNC_TABLE_SIZE / 2]
        };
    }

    table
});

/// Table lookup for the sin table; shared with the lat/long normal decode.
#[must_use]
pub fn sin_table(index: usize) -> f32 {
    SIN_TABLE[index & FUNC_TABLE_MASK]
}

fn table_for_func(func: WaveFunc) -> &'static [f32; FUNC_TABLE_SIZE] {
    match func {
        WaveFunc::Sin | WaveFunc::None | WaveFunc::Noise => &SIN_TABLE,
        WaveFunc::Square => &SQUARE_TABLE,
        WaveFunc::Triangle => &TRIANGLE_TABLE,
        WaveFunc::Sawtooth => &SAWTOOTH_TABLE,
        WaveFunc::InverseSawtooth => &INVERSE_SAWTOOTH_TABLE,
    }
}

/// `base + table[(phase + time * frequency) * tableSize & mask] * amplitude`
#[must_use]
pub fn evaluate_waveform(wave: &Waveform, time: f32) -> f32 {
    let table = table_for_func(wave.func);
    let index =
        ((wave.phase + time * wave.frequency) * FUNC_TABLE_SIZE as f32).round() as i64 as usize;
    wave.base + table[index & FUNC_TABLE_MASK] * wave.amplitude
}

#[must_use]
pub fn evaluate_waveform_clamped(wave: &Waveform, time: f32) -> f32 {
    evaluate_waveform(wave, time).clamp(0.0, 1.0)
}

// ============================================================================
// Noise
// ============================================================================

const NOISE_SIZE: usize = 256;
const NOISE_MASK: usize = NOISE_SIZE - 1;

struct NoiseTables {
    values: [f32; NOISE_SIZE],
    permute: [usize; NOISE_SIZE],
}

static NOISE: Lazy<NoiseTables> = Lazy::new(|| {
    // Deterministic LCG so noise is identical across runs.
    let mut state = 0x0001_2fd3u32;
    let mut next = || {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        state
    };

    let mut values = [0.0f32; NOISE_SIZE];
    let mut permute = [0usize; NOISE_SIZE];

    for i in 0..NOISE_SIZE {
        values[i] = 2.0 * (next() as f32 / u32::MAX as f32) - 1.0;
        permute[i] = (next() as usize) & NOISE_MASK;
    }

    NoiseTables { values, permute }
});

fn noise_perm(i: i64) -> usize {
    NOISE.permute[(i as usize) & NOISE_MASK]
}

fn noise_index(x: i64, y: i64, z: i64, t: i64) -> usize {
    noise_perm(x + noise_perm(y + noise_perm(z + noise_perm(t) as i64) as i64) as i64)
}

/// 4D value noise in [-1, 1], used by the Noise waveform.
#[must_use]
pub fn calculate_noise(x: f32, y: f32, z: f32, t: f32) -> f32 {
    let (ix, fx) = (x.floor() as i64, x - x.floor());
    let (iy, fy) = (y.floor() as i64, y - y.floor());
    let (iz, fz) = (z.floor() as i64, z - z.floor());
    let (it, ft) = (t.floor() as i64, t - t.floor());

    let lerp = |a: f32, b: f32, w: f32| a + (b - a) * w;
    let mut value = [0.0f32; 2];

    for (i, slot) in value.iter_mut().enumerate() {
        let ti = it + i as i64;
        let front = [
            NOISE.values[noise_index(ix, iy, iz, ti)],
            NOISE.values[noise_index(ix + 1, iy, iz, ti)],
            NOISE.values[noise_index(ix, iy + 1, iz, ti)],
            NOISE.values[noise_index(ix + 1, iy + 1, iz, ti)],
        ];
        let back = [
            NOISE.values[noise_index(ix, iy, iz - 1, ti)],
            NOISE.values[noise_index(ix + 1, iy, iz - 1, ti)],
            NOISE.values[noise_index(ix, iy + 1, iz - 1, ti)],
            NOISE.values[noise_index(ix + 1, iy + 1, iz - 1, ti)],
        ];

        let fvalue = lerp(lerp(front[0], front[1], fx), lerp(front[2], front[3], fx), fy);
        let bvalue = lerp(lerp(back[0], back[1], fx), lerp(back[2], back[3], fx), fy);
        *slot = lerp(fvalue, bvalue, fz);
    }

    lerp(value[0], value[1], ft)
}

// ============================================================================
// Evaluation environment and uniform blocks
// ============================================================================

/// Global lighting parameters threaded into color generation.
#[derive(Debug, Clone, Copy)]
pub struct ColorEnv {
    /// `1 / 2^overBrightBits`
    pub identity_light: f32,
    /// `2^overBrightBits`
    pub overbright_factor: f32,
    /// Overbright is folded into hardware gamma instead of vertex colors.
    pub hardware_gamma: bool,
    /// The cache's white texture, for the lightmap-only carve-out.
    pub white_texture: TextureId,
}

/// rgbGen/alphaGen output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorGenUniforms {
    /// Linear space.
    pub base_color: Vec4,
    /// Linear space.
    pub vertex_color: Vec4,
    /// Set when alphaGen is Portal.
    pub portal_range: Option<f32>,
}

/// tcGen/tcMod output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexGenUniforms {
    /// Column-major 2x2 texture matrix.
    pub matrix: Vec4,
    /// xy offset, zw turbulence amplitude and phase.
    pub off_turb: Vec4,
    pub tc_gen_vectors: [Vec3; 2],
}

/// Texture animation frame selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureAnimation {
    pub frame: usize,
    pub next_frame: usize,
    pub fraction: f32,
    pub lerp_enabled: bool,
}

fn to_linear(color: Vec4) -> Vec4 {
    const GAMMA: f32 = 2.2;
    Vec4::new(
        color.x.powf(GAMMA),
        color.y.powf(GAMMA),
        color.z.powf(GAMMA),
        color.w,
    )
}

impl Material {
    /// The material clock for this draw: frame time minus the material's
    /// remap offset and the entity's material time, clamped when the
    /// material requests it.
    #[must_use]
    pub fn adjusted_time(&self, time: f32, entity: Option<&RenderEntity>) -> f32 {
        let mut t = time - self.time_offset;

        if let Some(entity) = entity {
            t -= entity.material_time;
        }

        if self.clamp_time > 0.0 && t > self.clamp_time {
            t = self.clamp_time;
        }

        t
    }

    /// Evaluate a stage's color generators.
    ///
    /// The overbright factor is applied outside of blended stages, except
    /// for materials whose first stage is lightmap-only (white diffuse *
    /// lightmap): those get overbright on the second stage instead, to avoid
    /// clamping artifacts.
    #[must_use]
    pub fn stage_colors(
        &self,
        stage_index: usize,
        time: f32,
        entity: Option<&RenderEntity>,
        env: &ColorEnv,
    ) -> ColorGenUniforms {
        let stage = &self.stages[stage_index];
        let mut base_color = Vec4::ONE;
        let mut vertex_color = Vec4::ZERO;
        let identity = env.identity_light;

        match stage.rgb_gen {
            ColorGen::IdentityLighting => {
                base_color = Vec4::new(identity, identity, identity, base_color.w);
            }
            ColorGen::ExactVertex | ColorGen::ExactVertexLit => {
                base_color = Vec4::new(0.0, 0.0, 0.0, 1.0);
                vertex_color = Vec4::ONE;
            }
            ColorGen::Const => {
                base_color = stage.constant_color;
            }
            ColorGen::Vertex => {
                base_color = Vec4::new(0.0, 0.0, 0.0, 1.0);
                vertex_color = Vec4::new(identity, identity, identity, 1.0);
            }
            ColorGen::VertexLit => {
                base_color = Vec4::new(0.0, 0.0, 0.0, 1.0);
                vertex_color = Vec4::splat(identity);
            }
            ColorGen::OneMinusVertex => {
                base_color = Vec4::new(identity, identity, identity, base_color.w);
                vertex_color = Vec4::new(-identity, -identity, -identity, vertex_color.w);
            }
            ColorGen::Waveform => {
                let glow = self.wave_color_single(&stage.rgb_wave, time, env);
                base_color = Vec4::new(glow, glow, glow, base_color.w);
            }
            ColorGen::Entity => {
                if let Some(entity) = entity {
                    base_color = entity.material_color;
                }
            }
            ColorGen::OneMinusEntity => {
                if let Some(entity) = entity {
                    base_color = Vec4::ONE - entity.material_color;
                }
            }
            ColorGen::Identity
            | ColorGen::LightingDiffuse
            | ColorGen::Fog
            | ColorGen::Bad => {}
        }

        match stage.alpha_gen {
            AlphaGen::Skip => {}
            AlphaGen::Const => {
                base_color.w = stage.constant_color.w;
                vertex_color.w = 0.0;
            }
            AlphaGen::Waveform => {
                base_color.w = evaluate_waveform_clamped(&stage.alpha_wave, time);
                vertex_color.w = 0.0;
            }
            AlphaGen::Entity => {
                if let Some(entity) = entity {
                    base_color.w = entity.material_color.w;
                }

                vertex_color.w = 0.0;
            }
            AlphaGen::OneMinusEntity => {
                if let Some(entity) = entity {
                    base_color.w = 1.0 - entity.material_color.w;
                }

                vertex_color.w = 0.0;
            }
            AlphaGen::NormalZFade => {
                base_color.w = stage.constant_color.w;
                vertex_color.w = 0.0;
            }
            AlphaGen::Vertex => {
                base_color.w = 0.0;
                vertex_color.w = 1.0;
            }
            AlphaGen::OneMinusVertex => {
                base_color.w = 1.0;
                vertex_color.w = -1.0;
            }
            AlphaGen::Identity | AlphaGen::LightingSpecular | AlphaGen::Portal | AlphaGen::Water => {
                // Handled entirely in the vertex program.
                base_color.w = 1.0;
                vertex_color.w = 0.0;
            }
        }

        // Multiply by the overbright factor, mirroring what the legacy
        // renderer bakes into texture data at load time.
        if !env.hardware_gamma && env.overbright_factor > 1.0 {
            use wgpu::BlendFactor as BF;

            let is_blend = matches!(
                stage.blend,
                Some((BF::Dst, _)) | Some((BF::OneMinusDst, _)) | Some((_, BF::Src))
                    | Some((_, BF::OneMinusSrc))
            );

            let first_stage = &self.stages[0];
            let first_stage_lightmap_only = first_stage.bundles[TextureBundleIndex::DIFFUSE]
                .textures[0]
                == Some(env.white_texture)
                && first_stage.bundles[TextureBundleIndex::LIGHTMAP].is_lightmap;

            let skip = if first_stage_lightmap_only {
                // Materials like a lightmap-only first stage with a multiply
                // blend second stage get the overbright multiply on the
                // second stage instead.
                stage_index == 0
            } else {
                is_blend
            };

            if !skip {
                let factor = env.overbright_factor;
                base_color = Vec4::new(
                    base_color.x * factor,
                    base_color.y * factor,
                    base_color.z * factor,
                    base_color.w,
                );
                vertex_color = Vec4::new(
                    vertex_color.x * factor,
                    vertex_color.y * factor,
                    vertex_color.z * factor,
                    vertex_color.w,
                );
            }
        }

        ColorGenUniforms {
            base_color: to_linear(base_color),
            vertex_color: to_linear(vertex_color),
            portal_range: (stage.alpha_gen == AlphaGen::Portal).then_some(self.portal_range),
        }
    }

    fn wave_color_single(&self, wave: &Waveform, time: f32, env: &ColorEnv) -> f32 {
        let glow = if wave.func == WaveFunc::Noise {
            wave.base + calculate_noise(0.0, 0.0, 0.0, (time + wave.phase) * wave.frequency)
                * wave.amplitude
        } else {
            evaluate_waveform(wave, time) * env.identity_light
        };

        glow.clamp(0.0, 1.0)
    }

    /// Evaluate a stage's texture coordinate mods in declaration order.
    #[must_use]
    pub fn stage_tex_gen(
        &self,
        stage_index: usize,
        time: f32,
        entity: Option<&RenderEntity>,
    ) -> TexGenUniforms {
        let bundle = &self.stages[stage_index].bundles[TextureBundleIndex::DIFFUSE];
        let (matrix, off_turb) = calculate_tex_mods(bundle, time, entity);

        TexGenUniforms {
            matrix,
            off_turb,
            tc_gen_vectors: bundle.tc_gen_vectors,
        }
    }

    /// Texture animation frame selection for a stage's diffuse bundle.
    ///
    /// Returns `None` when the bundle isn't animated.
    #[must_use]
    pub fn stage_texture_animation(
        &self,
        stage_index: usize,
        time: f32,
        lerp_enabled: bool,
    ) -> Option<TextureAnimation> {
        let stage = &self.stages[stage_index];
        let bundle = &stage.bundles[TextureBundleIndex::DIFFUSE];

        if bundle.n_image_animations <= 1 {
            return None;
        }

        // This messy calc makes sure animations line up exactly with
        // waveforms of the same frequency.
        let mut frame =
            (time * bundle.image_animation_speed * FUNC_TABLE_SIZE as f32).round() as i64;
        frame >>= FUNC_TABLE_SIZE_LOG2;
        frame = frame.max(0); // May go negative with shader time offsets.
        let frame = (frame as usize) % bundle.n_image_animations;

        let should_lerp =
            lerp_enabled && stage.texture_animation_lerp != super::AnimationLerp::Disabled;

        let next_frame = match stage.texture_animation_lerp {
            super::AnimationLerp::Clamp => (frame + 1).min(bundle.n_image_animations - 1),
            _ => (frame + 1) % bundle.n_image_animations,
        };

        let fraction = (time * bundle.image_animation_speed).fract();

        Some(TextureAnimation {
            frame,
            next_frame,
            fraction,
            lerp_enabled: should_lerp,
        })
    }

    /// GPU deform uniforms for the wave/bulge/move deforms.
    #[must_use]
    pub fn deform_uniforms(&self) -> DeformUniforms {
        let mut uniforms = DeformUniforms::default();

        for ds in &self.deforms[..self.n_deforms] {
            let i = uniforms.n_deforms;

            match ds.deform {
                Deform::Wave => {
                    uniforms.gen_wave_base_amplitude[i] = Vec4::new(
                        deform_gen_value(ds.deform),
                        wave_func_value(ds.wave.func),
                        ds.wave.base,
                        ds.wave.amplitude,
                    );
                    uniforms.frequency_phase_spread[i] =
                        Vec4::new(ds.wave.frequency, ds.wave.phase, ds.spread, 0.0);
                    uniforms.n_deforms += 1;
                }
                Deform::Bulge => {
                    uniforms.gen_wave_base_amplitude[i] = Vec4::new(
                        deform_gen_value(ds.deform),
                        wave_func_value(ds.wave.func),
                        0.0,
                        ds.bulge_height,
                    );
                    uniforms.frequency_phase_spread[i] =
                        Vec4::new(ds.bulge_speed, ds.bulge_width, 0.0, 0.0);
                    uniforms.n_deforms += 1;
                }
                Deform::Move => {
                    uniforms.gen_wave_base_amplitude[i] = Vec4::new(
                        deform_gen_value(ds.deform),
                        wave_func_value(ds.wave.func),
                        ds.wave.base,
                        ds.wave.amplitude,
                    );
                    uniforms.frequency_phase_spread[i] =
                        Vec4::new(ds.wave.frequency, ds.wave.phase, 0.0, 0.0);
                    uniforms.move_dirs[i] = ds.move_vector.extend(0.0);
                    uniforms.n_deforms += 1;
                }
                _ => {}
            }
        }

        uniforms
    }

    /// Rebuild triangulated quads so they face the camera (autosprite) or
    /// pivot along their long axis (autosprite2). Returns the soft sprite
    /// depth.
    pub fn do_autosprite_deform(
        &self,
        scene_rotation: &Mat3,
        vertices: &mut [Vertex],
        indices: &mut [u16],
        entity: Option<&RenderEntity>,
        camera_mirrored: bool,
    ) -> f32 {
        let deform = self.deforms[..self.n_deforms]
            .iter()
            .map(|d| d.deform)
            .find(|d| matches!(d, Deform::Autosprite | Deform::Autosprite2));

        let Some(deform) = deform else {
            return 0.0;
        };

        if indices.len() % 6 != 0 {
            warn!(
                "Autosprite material {} had odd index count {}",
                self.name,
                indices.len()
            );
        }

        // The scene axes, rotated into entity space when drawing an entity.
        let (forward, left_dir, up_dir) = if let Some(entity) = entity {
            let rotate = |axis: Vec3| {
                Vec3::new(
                    axis.dot(entity.rotation.x_axis),
                    axis.dot(entity.rotation.y_axis),
                    axis.dot(entity.rotation.z_axis),
                )
            };
            (
                rotate(scene_rotation.x_axis),
                rotate(scene_rotation.y_axis),
                rotate(scene_rotation.z_axis),
            )
        } else {
            (
                scene_rotation.x_axis,
                scene_rotation.y_axis,
                scene_rotation.z_axis,
            )
        };

        let mut soft_sprite_depth = 0.0;

        for quad_index in 0..indices.len() / 6 {
            let first_index = quad_index * 6;
            let Some(vi) = extract_quad_corners(&indices[first_index..first_index + 6]) else {
                continue;
            };

            let corner = |i: usize| vertices[vi[i] as usize].pos();
            let midpoint = (corner(0) + corner(1) + corner(2) + corner(3)) * 0.25;
            let radius = (corner(0) - midpoint).length() * 0.707; // 1/sqrt(2)

            soft_sprite_depth = radius / 2.0;

            match deform {
                Deform::Autosprite => {
                    let mut left = left_dir * radius;
                    let up = up_dir * radius;

                    if camera_mirrored {
                        left = -left;
                    }

                    // Compensate for scale in the axes if necessary.
                    let (mut left, mut up) = (left, up);

                    if let Some(entity) = entity {
                        if entity.non_normalized_axes {
                            let axis_length = entity.rotation.x_axis.length();
                            let scale = if axis_length == 0.0 { 0.0 } else { 1.0 / axis_length };
                            left *= scale;
                            up *= scale;
                        }
                    }

                    // Rebuild the quad facing the main camera.
                    let positions = [
                        midpoint + left + up,
                        midpoint - left + up,
                        midpoint - left - up,
                        midpoint + left - up,
                    ];
                    let tex_coords = [
                        (0.0, 0.0),
                        (1.0, 0.0),
                        (1.0, 1.0),
                        (0.0, 1.0),
                    ];

                    for i in 0..4 {
                        let v = &mut vertices[vi[i] as usize];
                        v.set_pos(positions[i]);
                        v.set_normal(-scene_rotation.x_axis);
                        let (s, t) = tex_coords[i];
                        v.set_tex_coord(s, t, s, t);
                    }

                    indices[first_index] = vi[0];
                    indices[first_index + 1] = vi[1];
                    indices[first_index + 2] = vi[3];
                    indices[first_index + 3] = vi[3];
                    indices[first_index + 4] = vi[1];
                    indices[first_index + 5] = vi[2];
                }
                Deform::Autosprite2 => {
                    const EDGE_VERTS: [(usize, usize); 6] =
                        [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

                    let smallest_index = *vi.iter().min().unwrap();

                    // Identify the two shortest edges.
                    let mut nums = [0usize; 2];
                    let mut lengths = [f32::MAX; 2];

                    for (i, (a, b)) in EDGE_VERTS.iter().enumerate() {
                        let l = (corner(*a) - corner(*b)).length_squared();

                        if l < lengths[0] {
                            nums[1] = nums[0];
                            lengths[1] = lengths[0];
                            nums[0] = i;
                            lengths[0] = l;
                        } else if l < lengths[1] {
                            nums[1] = i;
                            lengths[1] = l;
                        }
                    }

                    // Midpoints of the short edges define the major axis.
                    let midpoints = [
                        (corner(EDGE_VERTS[nums[0]].0) + corner(EDGE_VERTS[nums[0]].1)) * 0.5,
                        (corner(EDGE_VERTS[nums[1]].0) + corner(EDGE_VERTS[nums[1]].1)) * 0.5,
                    ];
                    let major = midpoints[1] - midpoints[0];
                    let minor = major.cross(forward).normalize_or_zero();

                    // Re-project the short edge endpoints along the minor axis.
                    for i in 0..2 {
                        let (ev0, ev1) = EDGE_VERTS[nums[i]];
                        let l = 0.5 * lengths[i].sqrt();

                        // The direction this edge is wound in determines the
                        // direction of projection.
                        let mut j = 0;

                        while j < 5 {
                            if indices[first_index + j] == smallest_index + ev0 as u16
                                && indices[first_index + j + 1] == smallest_index + ev1 as u16
                            {
                                break;
                            }

                            j += 1;
                        }

                        let (p0, p1) = if j == 5 {
                            (midpoints[i] + minor * l, midpoints[i] - minor * l)
                        } else {
                            (midpoints[i] - minor * l, midpoints[i] + minor * l)
                        };

                        vertices[vi[ev0] as usize].set_pos(p0);
                        vertices[vi[ev1] as usize].set_pos(p1);
                    }
                }
                _ => unreachable!(),
            }
        }

        soft_sprite_depth
    }
}

/// GPU deform uniform block.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeformUniforms {
    pub n_deforms: usize,
    pub move_dirs: [Vec4; MAX_DEFORMS],
    pub gen_wave_base_amplitude: [Vec4; MAX_DEFORMS],
    pub frequency_phase_spread: [Vec4; MAX_DEFORMS],
}

fn deform_gen_value(deform: Deform) -> f32 {
    match deform {
        Deform::None => 0.0,
        Deform::Bulge => 1.0,
        Deform::Move => 2.0,
        Deform::Wave => 3.0,
        _ => 0.0,
    }
}

fn wave_func_value(func: WaveFunc) -> f32 {
    match func {
        WaveFunc::None => 0.0,
        WaveFunc::Sin => 1.0,
        WaveFunc::Square => 2.0,
        WaveFunc::Triangle => 3.0,
        WaveFunc::Sawtooth => 4.0,
        WaveFunc::InverseSawtooth => 5.0,
        WaveFunc::Noise => 6.0,
    }
}

/// Given six indices of a triangulated quad, the four unique corner indices
/// in ascending order. `None` when the triangles don't share four corners.
#[must_use]
pub fn extract_quad_corners(indices: &[u16]) -> Option<[u16; 4]> {
    let mut sorted = [0u16; 6];
    sorted.copy_from_slice(&indices[..6]);
    sorted.sort_unstable();

    let mut corners = [0u16; 4];
    let mut corner_index = 0;

    for i in 0..6 {
        if i == 0 || sorted[i] != sorted[i - 1] {
            if corner_index == 4 {
                return None;
            }

            corners[corner_index] = sorted[i];
            corner_index += 1;
        }
    }

    (corner_index == 4).then_some(corners)
}

// ============================================================================
// Texture coordinate mods
// ============================================================================

/// Compose a bundle's tcMods into a 2x2 matrix and offset/turbulence vector.
#[must_use]
pub fn calculate_tex_mods(
    bundle: &TextureBundle,
    time: f32,
    entity: Option<&RenderEntity>,
) -> (Vec4, Vec4) {
    let mut out_matrix = Vec4::new(1.0, 0.0, 0.0, 1.0);
    let mut out_off_turb = Vec4::ZERO;
    let mut current = [1.0f32, 0.0, 0.0, 1.0, 0.0, 0.0];

    for tex_mod in &bundle.tex_mods {
        let matrix = match tex_mod {
            TexMod::Turbulent(wave) => {
                out_off_turb.z = wave.amplitude;
                out_off_turb.w = wave.phase + time * wave.frequency;
                continue;
            }
            TexMod::EntityTranslate => {
                let tex_coord = entity.map_or(Vec2::ZERO, |e| e.material_tex_coord);
                scroll_matrix(tex_coord, time)
            }
            TexMod::Scroll(speed) => scroll_matrix(*speed, time),
            TexMod::Scale(scale) => [scale.x, 0.0, 0.0, scale.y, 0.0, 0.0],
            TexMod::Stretch(wave) => {
                let p = 1.0 / evaluate_waveform(wave, time);
                [p, 0.0, 0.0, p, 0.5 - 0.5 * p, 0.5 - 0.5 * p]
            }
            TexMod::Transform { matrix, translate } => [
                matrix[0][0],
                matrix[0][1],
                matrix[1][0],
                matrix[1][1],
                translate[0],
                translate[1],
            ],
            TexMod::Rotate(degrees_per_second) => {
                let degrees = -degrees_per_second * time;
                let index = (degrees * (FUNC_TABLE_SIZE as f32 / 360.0)) as i64 as usize;
                let sin_value = SIN_TABLE[index & FUNC_TABLE_MASK];
                let cos_value = SIN_TABLE[(index.wrapping_add(FUNC_TABLE_SIZE / 4)) & FUNC_TABLE_MASK];
                [
                    cos_value,
                    sin_value,
                    -sin_value,
                    cos_value,
                    0.5 - 0.5 * cos_value + 0.5 * sin_value,
                    0.5 - 0.5 * sin_value - 0.5 * cos_value,
                ]
            }
        };

        out_matrix.x = matrix[0] * current[0] + matrix[2] * current[1];
        out_matrix.y = matrix[1] * current[0] + matrix[3] * current[1];
        out_matrix.z = matrix[0] * current[2] + matrix[2] * current[3];
        out_matrix.w = matrix[1] * current[2] + matrix[3] * current[3];
        out_off_turb.x = matrix[0] * current[4] + matrix[2] * current[5] + matrix[4];
        out_off_turb.y = matrix[1] * current[4] + matrix[3] * current[5] + matrix[5];

        current = [
            out_matrix.x,
            out_matrix.y,
            out_matrix.z,
            out_matrix.w,
            out_off_turb.x,
            out_off_turb.y,
        ];
    }

    (out_matrix, out_off_turb)
}

fn scroll_matrix(speed: Vec2, time: f32) -> [f32; 6] {
    // Floor so coordinates don't continuously grow and hit precision limits.
    let s = speed.x * time;
    let t = speed.y * time;
    [1.0, 0.0, 0.0, 1.0, s - s.floor(), t - t.floor()]
}

// ============================================================================
// Stage render state
// ============================================================================

impl MaterialStage {
    /// Fixed-function state for this stage, folding in the material's cull
    /// mode (flipped when the camera is mirrored).
    #[must_use]
    pub fn render_state(&self, material: &Material, camera_mirrored: bool) -> crate::draw::RenderState {
        use crate::draw::StateFlags;
        use crate::material::CullType;

        let mut flags = StateFlags::RGB_WRITE | StateFlags::ALPHA_WRITE;

        if self.depth_write {
            flags |= StateFlags::DEPTH_WRITE;
        }

        if material.cull_type != CullType::TwoSided {
            let mut cull_back = material.cull_type == CullType::FrontSided;

            if camera_mirrored {
                cull_back = !cull_back;
            }

            flags |= if cull_back {
                StateFlags::CULL_CCW
            } else {
                StateFlags::CULL_CW
            };
        }

        crate::draw::RenderState {
            flags,
            depth_test: Some(self.depth_test),
            blend: self.blend,
        }
    }

    /// Which fog color channels this stage's blend can adjust.
    #[must_use]
    pub fn fog_adjust(&self) -> AdjustColorsForFog {
        self.adjust_colors_for_fog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sin_table_quarter_points() {
        assert!(sin_table(0).abs() < 1e-3);
        assert!((sin_table(FUNC_TABLE_SIZE / 4) - 1.0).abs() < 1e-2);
    }

    #[test]
    fn square_wave_flips_sign() {
        let wave = Waveform {
            func: WaveFunc::Square,
            base: 0.0,
            amplitude: 1.0,
            phase: 0.0,
            frequency: 1.0,
        };
        assert!((evaluate_waveform(&wave, 0.1) - 1.0).abs() < 1e-6);
        assert!((evaluate_waveform(&wave, 0.6) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn noise_is_deterministic_and_bounded() {
        for i in 0..32 {
            let t = i as f32 * 0.37;
            let a = calculate_noise(0.0, 0.0, 0.0, t);
            let b = calculate_noise(0.0, 0.0, 0.0, t);
            assert_eq!(a, b);
            assert!((-1.0..=1.0).contains(&a));
        }
    }

    #[test]
    fn quad_corner_extraction() {
        assert_eq!(extract_quad_corners(&[0, 1, 3, 3, 1, 2]), Some([0, 1, 2, 3]));
        assert_eq!(extract_quad_corners(&[4, 5, 7, 7, 5, 6]), Some([4, 5, 6, 7]));
        assert_eq!(extract_quad_corners(&[0, 1, 2, 3, 4, 5]), None);
    }
}
