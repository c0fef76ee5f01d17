//! Material system.
//!
//! A material is a named bundle of render state and up to 8 stages parsed
//! from the text shader language. [`cache`] owns parsing and interning,
//! [`parse`] the grammar, [`calculate`] the per-frame evaluation of
//! waveforms, texture-coordinate mods and color generators.

pub mod cache;
pub mod calculate;
pub mod parse;

pub use cache::{MaterialCache, Skin};

use bitflags::bitflags;
use glam::{Vec2, Vec3, Vec4};
use log::{debug, warn};
use smallvec::SmallVec;

use crate::texture::TextureId;

/// Maximum length of a material name, matching the texture limit.
pub const MAX_NAME_LENGTH: usize = 64;

/// Maximum stages in a material.
pub const MAX_STAGES: usize = 8;

/// Maximum vertex deform stages.
pub const MAX_DEFORMS: usize = 3;

/// Maximum animation frames in a texture bundle.
pub const MAX_IMAGE_ANIMATIONS: usize = 8;

/// Maximum texture-coordinate mods per bundle.
pub const MAX_TEX_MODS: usize = 4;

bitflags! {
    /// BSP surface flags (`SURF_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SurfaceFlags: u32 {
        const NODAMAGE = 0x1;
        const SLICK = 0x2;
        const SKY = 0x4;
        const LADDER = 0x8;
        const NOIMPACT = 0x10;
        const NOMARKS = 0x20;
        const FLESH = 0x40;
        const NODRAW = 0x80;
        const HINT = 0x100;
        const SKIP = 0x200;
        const NOLIGHTMAP = 0x400;
        const POINTLIGHT = 0x800;
        const METALSTEPS = 0x1000;
        const NOSTEPS = 0x2000;
        const NONSOLID = 0x4000;
        const LIGHTFILTER = 0x8000;
        const ALPHASHADOW = 0x10000;
        const NODLIGHT = 0x20000;
        const DUST = 0x40000;
    }
}

bitflags! {
    /// BSP content flags (`CONTENTS_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContentFlags: u32 {
        const SOLID = 1;
        const LAVA = 8;
        const SLIME = 16;
        const WATER = 32;
        const FOG = 64;
        const AREAPORTAL = 0x8000;
        const PLAYERCLIP = 0x10000;
        const MONSTERCLIP = 0x20000;
        const CLUSTERPORTAL = 0x0010_0000;
        const DONOTENTER = 0x0020_0000;
        const ORIGIN = 0x0100_0000;
        const DETAIL = 0x0800_0000;
        const STRUCTURAL = 0x1000_0000;
        const TRANSLUCENT = 0x2000_0000;
        const NODROP = 0x8000_0000;
    }
}

/// Dense index of a material in the cache, usable as a shader uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialIndex(pub usize);

/// Special lightmap index sentinels. Values >= 0 are lightmap atlas slots.
pub struct MaterialLightmapId;

impl MaterialLightmapId {
    /// Material is for 2D rendering.
    pub const STRETCH_PIC: i32 = -4;
    /// Pre-lit triangle models.
    pub const VERTEX: i32 = -3;
    /// Fullbright.
    pub const WHITE: i32 = -2;
    pub const NONE: i32 = -1;
}

/// Draw-order classes. Lower sorts draw first. Stored as f32 so explicit
/// `sort <number>` directives can order between classes.
pub mod sort {
    pub const BAD: f32 = 0.0;
    /// Mirrors, portals, viewscreens.
    pub const PORTAL: f32 = 1.0;
    /// Sky box.
    pub const ENVIRONMENT: f32 = 2.0;
    pub const OPAQUE: f32 = 3.0;
    /// Scorch marks, etc.
    pub const DECAL: f32 = 4.0;
    /// Ladders, grates, grills that may have small blended edges.
    pub const SEE_THROUGH: f32 = 5.0;
    pub const BANNER: f32 = 6.0;
    pub const FOG: f32 = 7.0;
    /// Items drawn in front of the water plane.
    pub const UNDERWATER: f32 = 8.0;
    /// Regular transparency and filters.
    pub const BLEND0: f32 = 9.0;
    pub const BLEND1: f32 = 10.0;
    pub const BLEND2: f32 = 11.0;
    pub const BLEND3: f32 = 12.0;
    pub const BLEND6: f32 = 13.0;
    pub const STENCIL_SHADOW: f32 = 14.0;
    /// Gun smoke puffs.
    pub const ALMOST_NEAREST: f32 = 15.0;
    /// Blood blobs.
    pub const NEAREST: f32 = 16.0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullType {
    #[default]
    FrontSided,
    BackSided,
    TwoSided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaveFunc {
    #[default]
    None,
    Sin,
    Square,
    Triangle,
    Sawtooth,
    InverseSawtooth,
    Noise,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Waveform {
    pub func: WaveFunc,
    pub base: f32,
    pub amplitude: f32,
    pub phase: f32,
    pub frequency: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deform {
    #[default]
    None,
    Bulge,
    Move,
    Wave,
    Autosprite,
    Autosprite2,
    Normals,
    ProjectionShadow,
    /// Text glyph deform, index 0..=7.
    Text(u8),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeformStage {
    pub deform: Deform,
    pub move_vector: Vec3,
    pub wave: Waveform,
    pub spread: f32,
    pub bulge_width: f32,
    pub bulge_height: f32,
    pub bulge_speed: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct FogParms {
    pub color: Vec3,
    pub depth_for_opaque: f32,
}

impl Default for FogParms {
    fn default() -> Self {
        FogParms {
            color: Vec3::ZERO,
            depth_for_opaque: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FogPass {
    /// Surface is translucent and will just be adjusted properly.
    #[default]
    None,
    /// Surface is opaque but possibly alpha tested.
    Equal,
    /// Surface is translucent, but still needs a fog pass (fog surface).
    LessOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reflective {
    #[default]
    None,
    FrontSide,
    BackSide,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SkyParms {
    pub cloud_height: f32,
    pub outer_box: [Option<TextureId>; 6],
    pub inner_box: [Option<TextureId>; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorGen {
    #[default]
    Bad,
    /// Always (1,1,1,1).
    Identity,
    LightingDiffuse,
    /// The identity-light fraction.
    IdentityLighting,
    /// The entity's modulate color.
    Entity,
    OneMinusEntity,
    ExactVertex,
    /// Vertex color times identity light.
    Vertex,
    /// Like ExactVertex with a light direction from the light grid.
    ExactVertexLit,
    VertexLit,
    OneMinusVertex,
    Waveform,
    Fog,
    Const,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlphaGen {
    #[default]
    Identity,
    LightingSpecular,
    Portal,
    Water,
    Skip,
    Entity,
    OneMinusEntity,
    NormalZFade,
    Vertex,
    OneMinusVertex,
    Waveform,
    Const,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlphaTest {
    #[default]
    None,
    Gt0,
    Lt128,
    Ge128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TexCoordGen {
    #[default]
    None,
    EnvironmentMapped,
    Fog,
    Fragment,
    Lightmap,
    Texture,
    /// S and T from world coordinates.
    Vector,
    /// Clear to 0,0.
    Identity,
}

/// Texture coordinate modifier, applied in declaration order.
#[derive(Debug, Clone, Copy)]
pub enum TexMod {
    Transform {
        /// s' = s * m[0][0] + t * m[1][0] + translate[0]
        /// t' = s * m[0][1] + t * m[1][1] + translate[1]
        matrix: [[f32; 2]; 2],
        translate: [f32; 2],
    },
    Turbulent(Waveform),
    Scroll(Vec2),
    Scale(Vec2),
    Stretch(Waveform),
    /// Degrees per second, positive is clockwise.
    Rotate(f32),
    EntityTranslate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageType {
    #[default]
    ColorMap,
    NormalMap,
    NormalParallaxMap,
    SpecularMap,
    Glsl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaterialLight {
    #[default]
    None,
    Map,
    Vertex,
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnimationLerp {
    #[default]
    Disabled,
    Clamp,
    Wrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdjustColorsForFog {
    #[default]
    None,
    ModulateRgb,
    ModulateAlpha,
    ModulateRgba,
}

/// Indices into [`MaterialStage::bundles`].
pub struct TextureBundleIndex;

impl TextureBundleIndex {
    pub const DIFFUSE: usize = 0;
    pub const LIGHTMAP: usize = 1;
    pub const NORMAL: usize = 2;
    pub const DELUXE: usize = 3;
    pub const SPECULAR: usize = 4;
    pub const COUNT: usize = 5;
}

/// Up to 8 animation frames plus texture-coordinate generation state.
#[derive(Debug, Clone, Default)]
pub struct TextureBundle {
    pub textures: [Option<TextureId>; MAX_IMAGE_ANIMATIONS],
    pub n_image_animations: usize,
    pub image_animation_speed: f32,
    pub tc_gen: TexCoordGen,
    pub tc_gen_vectors: [Vec3; 2],
    pub tex_mods: SmallVec<[TexMod; MAX_TEX_MODS]>,
    pub video_map_handle: i32,
    pub is_lightmap: bool,
    pub is_video_map: bool,
}

/// One pass within a material.
#[derive(Debug, Clone)]
pub struct MaterialStage {
    pub active: bool,
    pub bundles: [TextureBundle; TextureBundleIndex::COUNT],
    pub rgb_wave: Waveform,
    pub rgb_gen: ColorGen,
    pub alpha_wave: Waveform,
    pub alpha_gen: AlphaGen,
    pub texture_animation_lerp: AnimationLerp,
    /// For `ColorGen::Const` and `AlphaGen::Const`.
    pub constant_color: Vec4,
    pub depth_test: wgpu::CompareFunction,
    pub depth_write: bool,
    pub alpha_test: AlphaTest,
    /// Source and destination blend factors. `None` disables blending.
    pub blend: Option<(wgpu::BlendFactor, wgpu::BlendFactor)>,
    pub adjust_colors_for_fog: AdjustColorsForFog,
    pub is_detail: bool,
    pub stage_type: StageType,
    pub light: MaterialLight,
    pub normal_scale: Vec4,
    pub specular_scale: Vec4,
    /// For `AlphaGen::NormalZFade`.
    pub z_fade_bounds: Vec2,
}

impl Default for MaterialStage {
    fn default() -> Self {
        MaterialStage {
            active: false,
            bundles: Default::default(),
            rgb_wave: Waveform::default(),
            rgb_gen: ColorGen::Bad,
            alpha_wave: Waveform::default(),
            alpha_gen: AlphaGen::Identity,
            texture_animation_lerp: AnimationLerp::Disabled,
            constant_color: Vec4::ONE,
            depth_test: wgpu::CompareFunction::LessEqual,
            depth_write: true,
            alpha_test: AlphaTest::None,
            blend: None,
            adjust_colors_for_fog: AdjustColorsForFog::None,
            is_detail: false,
            stage_type: StageType::ColorMap,
            light: MaterialLight::None,
            normal_scale: Vec4::ZERO,
            specular_scale: Vec4::ZERO,
            z_fade_bounds: Vec2::new(-1.0, 1.0),
        }
    }
}

impl MaterialStage {
    /// The fog color mask selecting which channels a fog pass modulates.
    #[must_use]
    pub fn fog_color_mask(&self) -> Vec4 {
        match self.adjust_colors_for_fog {
            AdjustColorsForFog::ModulateRgb => Vec4::new(1.0, 1.0, 1.0, 0.0),
            AdjustColorsForFog::ModulateAlpha => Vec4::new(0.0, 0.0, 0.0, 1.0),
            AdjustColorsForFog::ModulateRgba => Vec4::ONE,
            AdjustColorsForFog::None => Vec4::ZERO,
        }
    }

    fn is_blended(&self) -> bool {
        self.blend.is_some()
    }
}

/// A named, indexed material.
#[derive(Debug, Clone)]
pub struct Material {
    /// Game path with the extension stripped.
    pub name: String,
    /// For a material to match, both name and lightmap index must match.
    pub lightmap_index: i32,
    pub index: MaterialIndex,
    pub sorted_index: i32,
    /// Lower numbered materials draw first.
    pub sort: f32,
    /// The lookup failed; a stand-in was interned under the name.
    pub default_shader: bool,
    /// Found in a .shader file.
    pub explicitly_defined: bool,
    /// Area light emission, from `q3map_surfacelight`.
    pub surface_light: f32,
    pub surface_flags: SurfaceFlags,
    pub content_flags: ContentFlags,
    /// Sprite surfaces from multiple entities may merge into one batch.
    pub entity_mergable: bool,
    pub is_sky: bool,
    pub sky: SkyParms,
    pub fog_parms: FogParms,
    pub no_fog: bool,
    /// Distance at which an alphaGen portal surface fades out.
    pub portal_range: f32,
    pub is_portal: bool,
    pub reflective: Reflective,
    pub reflective_front_side_material: Option<MaterialIndex>,
    pub cull_type: CullType,
    /// Set for decals and other surfaces that must be depth offset.
    pub polygon_offset: bool,
    pub no_mip_maps: bool,
    pub no_pic_mip: bool,
    pub fog_pass: FogPass,
    pub n_deforms: usize,
    pub deforms: [DeformStage; MAX_DEFORMS],
    pub num_unfogged_passes: usize,
    pub stages: [MaterialStage; MAX_STAGES],
    /// Time this material's clock is clamped to.
    pub clamp_time: f32,
    /// Current time offset, set by remapping.
    pub time_offset: f32,
    /// Forwarding pointer set by `remap_material`.
    pub remapped: Option<MaterialIndex>,
}

impl Material {
    #[must_use]
    pub fn new(name: &str) -> Material {
        Material {
            name: name.to_string(),
            lightmap_index: MaterialLightmapId::NONE,
            index: MaterialIndex(0),
            sorted_index: 0,
            sort: sort::BAD,
            default_shader: false,
            explicitly_defined: false,
            surface_light: 0.0,
            surface_flags: SurfaceFlags::empty(),
            content_flags: ContentFlags::empty(),
            entity_mergable: false,
            is_sky: false,
            sky: SkyParms::default(),
            fog_parms: FogParms::default(),
            no_fog: false,
            portal_range: 256.0,
            is_portal: false,
            reflective: Reflective::None,
            reflective_front_side_material: None,
            cull_type: CullType::FrontSided,
            polygon_offset: false,
            no_mip_maps: false,
            no_pic_mip: false,
            fog_pass: FogPass::None,
            n_deforms: 0,
            deforms: [DeformStage::default(); MAX_DEFORMS],
            num_unfogged_passes: 0,
            stages: Default::default(),
            clamp_time: 0.0,
            time_offset: 0.0,
            remapped: None,
        }
    }

    /// Active stages, i.e. the first `num_unfogged_passes` entries.
    pub fn active_stages(&self) -> impl Iterator<Item = &MaterialStage> {
        self.stages.iter().take_while(|s| s.active)
    }

    #[must_use]
    pub fn has_auto_sprite_deform(&self) -> bool {
        self.deforms[..self.n_deforms]
            .iter()
            .any(|d| matches!(d.deform, Deform::Autosprite | Deform::Autosprite2))
    }

    #[must_use]
    pub fn has_cpu_deforms(&self) -> bool {
        self.has_auto_sprite_deform()
    }

    /// Finalize a parsed material: fix up stage state, derive the sort and
    /// fog pass, collapse lightmap stages into diffuse stages.
    ///
    /// `white_texture` replaces the diffuse bundle of lingering lightmap-only
    /// stages.
    pub fn finish(&mut self, white_texture: TextureId) {
        if self.is_sky {
            self.sort = sort::ENVIRONMENT;
        }

        if self.polygon_offset && self.sort == sort::BAD {
            self.sort = sort::DECAL;
        }

        let mut has_lightmap_stage = false;
        let stage0_blended = self.stages[0].is_blended();

        for stage_index in 0..MAX_STAGES {
            if !self.stages[stage_index].active {
                break;
            }

            // Check for a missing texture.
            if self.stages[stage_index].bundles[0].textures[0].is_none() {
                warn!("material {} has a stage with no image", self.name);
                self.stages[stage_index].active = false;
                continue;
            }

            // Default texture coordinate generation.
            let stage = &mut self.stages[stage_index];

            if stage.bundles[0].is_lightmap {
                if stage.bundles[0].tc_gen == TexCoordGen::None {
                    stage.bundles[0].tc_gen = TexCoordGen::Lightmap;
                }

                has_lightmap_stage = true;
            } else if stage.bundles[0].tc_gen == TexCoordGen::None {
                stage.bundles[0].tc_gen = TexCoordGen::Texture;
            }

            // Determine the sort order and fog color adjustment.
            if stage.is_blended() && stage0_blended {
                use wgpu::BlendFactor as BF;

                // Fog color adjustment only works for blend modes whose
                // contribution approaches zero as the modulate values do.
                stage.adjust_colors_for_fog = match stage.blend {
                    Some((BF::One, BF::One)) | Some((BF::Zero, BF::OneMinusSrc)) => {
                        AdjustColorsForFog::ModulateRgb
                    }
                    Some((BF::SrcAlpha, BF::OneMinusSrcAlpha)) => {
                        AdjustColorsForFog::ModulateAlpha
                    }
                    Some((BF::One, BF::OneMinusSrcAlpha)) => AdjustColorsForFog::ModulateRgba,
                    _ => AdjustColorsForFog::None,
                };

                // Don't touch an explicit sort (portal, environment, ...).
                if self.sort == sort::BAD {
                    self.sort = if stage.depth_write {
                        // See-through item, like a grill or grate.
                        sort::SEE_THROUGH
                    } else {
                        sort::BLEND0
                    };
                }
            }
        }

        // Opaque alpha-tested shaders with later blend passes keep a manual
        // sort; everything else defaults to opaque here.
        if self.sort == sort::BAD {
            self.sort = sort::OPAQUE;
        }

        let n_stages = self.collapse_stages(white_texture);

        if self.lightmap_index >= 0 && !has_lightmap_stage {
            debug!("material '{}' has lightmap but no lightmap stage!", self.name);
        }

        self.num_unfogged_passes = n_stages;

        // Fog-only materials don't have any normal passes.
        if n_stages == 0 && !self.is_sky {
            self.sort = sort::FOG;
        }

        if self.sort <= sort::OPAQUE {
            self.fog_pass = FogPass::Equal;
        } else if self.content_flags.contains(ContentFlags::FOG) {
            self.fog_pass = FogPass::LessOrEqual;
        }
    }

    /// Reorder and merge stages so later passes find the expected
    /// "lightmap then diffuse" layout. Returns the number of active stages.
    fn collapse_stages(&mut self, white_texture: TextureId) -> usize {
        use wgpu::BlendFactor as BF;

        for stage in self.stages.iter_mut().filter(|s| s.active) {
            if stage.rgb_gen == ColorGen::LightingDiffuse {
                stage.light = MaterialLight::Vector;
            } else if matches!(stage.rgb_gen, ColorGen::VertexLit | ColorGen::ExactVertexLit) {
                stage.light = MaterialLight::Vertex;
            }
        }

        // If there are 2+ stages and the first is a lightmap, swap it with a
        // compatible filter-blend stage so later processing sees
        // diffuse-then-lightmap. Blend/depth state stays in place.
        if self.stages[0].active
            && self.stages[0].bundles[0].tc_gen == TexCoordGen::Lightmap
            && self.stages[1].active
            && matches!(
                self.stages[1].blend,
                Some((BF::Zero, BF::Src)) | Some((BF::Dst, BF::Zero))
            )
        {
            let state0 = (
                self.stages[0].depth_test,
                self.stages[0].depth_write,
                self.stages[0].alpha_test,
                self.stages[0].blend,
            );
            let state1 = (
                self.stages[1].depth_test,
                self.stages[1].depth_write,
                self.stages[1].alpha_test,
                self.stages[1].blend,
            );

            self.stages.swap(0, 1);

            let stage0 = &mut self.stages[0];
            (stage0.depth_test, stage0.depth_write, stage0.alpha_test, stage0.blend) = state0;
            let stage1 = &mut self.stages[1];
            (stage1.depth_test, stage1.depth_write, stage1.alpha_test, stage1.blend) = state1;
        }

        // Scan for stage combinations the merge pass doesn't support.
        let mut skip_merge = false;

        for stage in self.stages.iter().filter(|s| s.active) {
            if stage.adjust_colors_for_fog != AdjustColorsForFog::None {
                skip_merge = true;
                break;
            }

            if stage.bundles[0].tc_gen == TexCoordGen::Lightmap
                && !matches!(
                    stage.blend,
                    None | Some((BF::Zero, _))
                        | Some((_, BF::Zero))
                        | Some((BF::Dst, _))
                        | Some((_, BF::Src))
                )
            {
                skip_merge = true;
                break;
            }

            match stage.bundles[0].tc_gen {
                TexCoordGen::Texture
                | TexCoordGen::Lightmap
                | TexCoordGen::EnvironmentMapped
                | TexCoordGen::Vector => {}
                _ => {
                    skip_merge = true;
                    break;
                }
            }

            if matches!(stage.alpha_gen, AlphaGen::LightingSpecular | AlphaGen::Portal) {
                skip_merge = true;
                break;
            }
        }

        if !skip_merge {
            // Diffuse stages absorb a matching lightmap stage into bundle 1.
            for i in 0..MAX_STAGES {
                if !self.stages[i].active
                    || self.stages[i].stage_type != StageType::ColorMap
                    || self.stages[i].bundles[0].tc_gen == TexCoordGen::Lightmap
                {
                    continue;
                }

                let mut lightmap_stage = None;

                for j in (i + 1)..MAX_STAGES {
                    let candidate = &self.stages[j];

                    if !candidate.active {
                        continue;
                    }

                    if candidate.stage_type == StageType::ColorMap
                        && candidate.bundles[0].tc_gen == TexCoordGen::Lightmap
                    {
                        lightmap_stage = Some(j);
                        break;
                    }
                }

                if let Some(j) = lightmap_stage {
                    let bundle = self.stages[j].bundles[0].clone();
                    self.stages[i].bundles[TextureBundleIndex::LIGHTMAP] = bundle;
                    self.stages[i].light = MaterialLight::Map;
                }
            }

            // Deactivate the absorbed lightmap stages.
            for stage in self.stages.iter_mut().filter(|s| s.active) {
                if stage.bundles[0].tc_gen == TexCoordGen::Lightmap {
                    stage.active = false;
                }
            }
        }

        // Normal/specular stages fold into their diffuse stage's bundles in
        // a lit pipeline; this core draws them as collapsed passes only.
        for stage in self.stages.iter_mut().filter(|s| s.active) {
            if matches!(
                stage.stage_type,
                StageType::NormalMap | StageType::NormalParallaxMap | StageType::SpecularMap
            ) {
                stage.active = false;
            }
        }

        // Compact the active stages to the front.
        let mut n_stages = 0;

        for i in 0..MAX_STAGES {
            if !self.stages[i].active {
                continue;
            }

            if i != n_stages {
                self.stages.swap(n_stages, i);
            }

            n_stages += 1;
        }

        if self.n_deforms == 0 {
            // Promote any remaining lightmap-only stage to a lighting pass
            // with a white diffuse texture.
            for stage in self.stages.iter_mut().filter(|s| s.active) {
                if stage.adjust_colors_for_fog != AdjustColorsForFog::None {
                    continue;
                }

                if stage.bundles[TextureBundleIndex::DIFFUSE].tc_gen == TexCoordGen::Lightmap {
                    stage.light = MaterialLight::Map;
                    stage.bundles[TextureBundleIndex::LIGHTMAP] =
                        stage.bundles[TextureBundleIndex::DIFFUSE].clone();
                    let diffuse = &mut stage.bundles[TextureBundleIndex::DIFFUSE];
                    diffuse.textures[0] = Some(white_texture);
                    diffuse.is_lightmap = false;
                    diffuse.tc_gen = TexCoordGen::Texture;
                }
            }

            for stage in self.stages.iter_mut().filter(|s| s.active) {
                if stage.adjust_colors_for_fog == AdjustColorsForFog::None
                    && stage.rgb_gen == ColorGen::LightingDiffuse
                {
                    stage.light = MaterialLight::Vector;
                }
            }
        }

        n_stages
    }
}
