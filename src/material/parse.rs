//! The text shader ("material") grammar.
//!
//! A material block holds general directives plus nested stage blocks; see
//! the stage grammar in [`Material::parse_stage`]. Identifiers are case
//! insensitive. Unknown general directives fail the material (it falls back
//! to the default material); unknown stage keywords likewise.

use glam::{Vec2, Vec3, Vec4};
use log::warn;

use crate::gpu::GraphicsDevice;
use crate::interface::Host;
use crate::material::{
    sort, AlphaGen, AlphaTest, AnimationLerp, ColorGen, ContentFlags, CullType, Deform,
    DeformStage, Material, MaterialStage, StageType, SurfaceFlags, TexCoordGen, TexMod, Waveform,
    WaveFunc, MAX_DEFORMS, MAX_IMAGE_ANIMATIONS, MAX_STAGES, MAX_TEX_MODS,
};
use crate::parser::Lexer;
use crate::scene::SunLight;
use crate::texture::{TextureCache, TextureFlags, TextureId};

/// Everything material parsing needs from the rest of the engine.
pub struct ParseContext<'a> {
    pub device: &'a mut dyn GraphicsDevice,
    pub host: &'a dyn Host,
    pub textures: &'a mut TextureCache,
    /// Lightmap atlas textures of the loaded world, if any.
    pub lightmaps: &'a [TextureId],
    pub sun: &'a mut SunLight,
    /// `2^overBrightBits`, used to scale the parsed sun color.
    pub overbright_factor: f32,
}

/// Surface parameter table, also present in q3map.
const INFO_PARMS: &[(&str, u32, u32)] = &[
    // (name, surface flags, content flags)
    ("water", 0, ContentFlags::WATER.bits()),
    ("slime", 0, ContentFlags::SLIME.bits()),
    ("lava", 0, ContentFlags::LAVA.bits()),
    ("playerclip", 0, ContentFlags::PLAYERCLIP.bits()),
    ("monsterclip", 0, ContentFlags::MONSTERCLIP.bits()),
    ("nodrop", 0, ContentFlags::NODROP.bits()),
    ("nonsolid", SurfaceFlags::NONSOLID.bits(), 0),
    ("origin", 0, ContentFlags::ORIGIN.bits()),
    ("trans", 0, ContentFlags::TRANSLUCENT.bits()),
    ("detail", 0, ContentFlags::DETAIL.bits()),
    ("structural", 0, ContentFlags::STRUCTURAL.bits()),
    ("areaportal", 0, ContentFlags::AREAPORTAL.bits()),
    ("clusterportal", 0, ContentFlags::CLUSTERPORTAL.bits()),
    ("donotenter", 0, ContentFlags::DONOTENTER.bits()),
    ("fog", 0, ContentFlags::FOG.bits()),
    ("sky", SurfaceFlags::SKY.bits(), 0),
    ("lightfilter", SurfaceFlags::LIGHTFILTER.bits(), 0),
    ("alphashadow", SurfaceFlags::ALPHASHADOW.bits(), 0),
    ("hint", SurfaceFlags::HINT.bits(), 0),
    ("slick", SurfaceFlags::SLICK.bits(), 0),
    ("noimpact", SurfaceFlags::NOIMPACT.bits(), 0),
    ("nomarks", SurfaceFlags::NOMARKS.bits(), 0),
    ("ladder", SurfaceFlags::LADDER.bits(), 0),
    ("nodamage", SurfaceFlags::NODAMAGE.bits(), 0),
    ("metalsteps", SurfaceFlags::METALSTEPS.bits(), 0),
    ("flesh", SurfaceFlags::FLESH.bits(), 0),
    ("nosteps", SurfaceFlags::NOSTEPS.bits(), 0),
    ("nodraw", SurfaceFlags::NODRAW.bits(), 0),
    ("pointlight", SurfaceFlags::POINTLIGHT.bits(), 0),
    ("nolightmap", SurfaceFlags::NOLIGHTMAP.bits(), 0),
    ("nodlight", SurfaceFlags::NODLIGHT.bits(), 0),
    ("dust", SurfaceFlags::DUST.bits(), 0),
];

fn parse_f32(token: &str) -> f32 {
    token.parse().unwrap_or(0.0)
}

impl Material {
    /// Parse the body of a shader block. The lexer is positioned at the `{`
    /// following the name. Returns false on errors; the caller falls back to
    /// the default material.
    pub fn parse(&mut self, lexer: &mut Lexer, ctx: &mut ParseContext) -> bool {
        let token = lexer.next();

        if token != "{" {
            warn!("'{}': expecting '{{', found '{token}' instead", self.name);
            return false;
        }

        let mut stage_index = 0;

        loop {
            let token = lexer.next();

            if token.is_empty() {
                warn!("'{}': no concluding '}}'", self.name);
                return false;
            }

            if token == "}" {
                break;
            }

            if token == "{" {
                if stage_index >= MAX_STAGES {
                    warn!("'{}': too many stages (max is {MAX_STAGES})", self.name);
                    return false;
                }

                let mut stage = MaterialStage::default();

                if !self.parse_stage(&mut stage, lexer, ctx) {
                    return false;
                }

                stage.active = true;
                self.stages[stage_index] = stage;
                stage_index += 1;
            } else if token.len() >= 3 && token[..3].eq_ignore_ascii_case("qer") {
                // Radiant-only directives.
                lexer.skip_rest_of_line();
            } else if token.eq_ignore_ascii_case("q3map_sun")
                || token.eq_ignore_ascii_case("q3map_sunExt")
                || token.eq_ignore_ascii_case("q3gl2_sun")
            {
                self.parse_sun(lexer, ctx, token.eq_ignore_ascii_case("q3gl2_sun"));
            } else if token.eq_ignore_ascii_case("q3gl2_tonemap") {
                // Tonemap levels are handled by the backend; skip the values.
                lexer.skip_rest_of_line();
            } else if token.eq_ignore_ascii_case("deformVertexes") {
                if self.n_deforms == MAX_DEFORMS {
                    warn!("'{}': max deforms", self.name);
                    lexer.skip_rest_of_line();
                    continue;
                }

                self.deforms[self.n_deforms] = self.parse_deform(lexer);
                self.n_deforms += 1;
            } else if token.eq_ignore_ascii_case("tesssize") {
                lexer.skip_rest_of_line();
            } else if token.eq_ignore_ascii_case("clampTime") {
                let token = lexer.next_on_line();

                if !token.is_empty() {
                    self.clamp_time = parse_f32(token);
                }
            } else if token.eq_ignore_ascii_case("q3map_surfacelight") {
                self.surface_light = parse_f32(lexer.next_on_line());
            } else if token.len() >= 5 && token[..5].eq_ignore_ascii_case("q3map") {
                // The rest of the q3map_* directives only matter to the compiler.
                lexer.skip_rest_of_line();
            } else if token.eq_ignore_ascii_case("surfaceParm") {
                let token = lexer.next_on_line();

                for (name, surface, contents) in INFO_PARMS {
                    if token.eq_ignore_ascii_case(name) {
                        self.surface_flags |= SurfaceFlags::from_bits_retain(*surface);
                        self.content_flags |= ContentFlags::from_bits_retain(*contents);
                        break;
                    }
                }
            } else if token.eq_ignore_ascii_case("nomipmaps") {
                self.no_mip_maps = true;
                self.no_pic_mip = true;
            } else if token.eq_ignore_ascii_case("nopicmip") {
                self.no_pic_mip = true;
            } else if token.eq_ignore_ascii_case("picmip2") {
                // Character picmip adjustment; ignored.
            } else if token.eq_ignore_ascii_case("polygonOffset") {
                self.polygon_offset = true;
            } else if token.eq_ignore_ascii_case("entityMergable") {
                // Allows sprite surfaces from multiple entities to merge into
                // one batch; used for smoke puffs and blood.
                self.entity_mergable = true;
            } else if token.eq_ignore_ascii_case("fogParms") {
                let Some(color) = self.parse_vector(lexer) else {
                    return false;
                };
                self.fog_parms.color = color;

                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing fogParms 'distance to opaque'", self.name);
                    continue;
                }

                self.fog_parms.depth_for_opaque = parse_f32(token);

                // Skip any old gradient directions.
                lexer.skip_rest_of_line();
            } else if token.eq_ignore_ascii_case("portal") {
                self.sort = sort::PORTAL;
                self.is_portal = true;
            } else if token.eq_ignore_ascii_case("skyparms") {
                self.parse_sky_parms(lexer, ctx);
            } else if token.eq_ignore_ascii_case("skyfogvars") {
                let Some(_color) = self.parse_vector(lexer) else {
                    return false;
                };
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing density value for sky fog", self.name);
                    continue;
                }

                if parse_f32(token) > 1.0 {
                    warn!(
                        "'{}': last value for skyfogvars is 'density' which needs to be 0.0-1.0",
                        self.name
                    );
                }
            } else if token.eq_ignore_ascii_case("sunshader") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing shader name for 'sunshader'", self.name);
                }
            } else if token.eq_ignore_ascii_case("lightgridmulamb")
                || token.eq_ignore_ascii_case("lightgridmuldir")
            {
                if lexer.next_on_line().is_empty() {
                    warn!("'{}': missing value for lightgrid multiplier", self.name);
                }
            } else if token.eq_ignore_ascii_case("waterfogvars") {
                let Some(color) = self.parse_vector(lexer) else {
                    return false;
                };
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing density/distance value for water fog", self.name);
                    continue;
                }

                let fogvar = parse_f32(token);

                // One water color per map. 0 means "use the map values for
                // everything except the fog color".
                let fog_string = if fogvar == 0.0 {
                    continue;
                } else if fogvar > 1.0 {
                    // Distance "linear" fog.
                    format!("0 {} 1.1 {} {} {} 200", fogvar as i32, color.x, color.y, color.z)
                } else {
                    // Density "exp" fog.
                    format!("0 5 {fogvar} {} {} {} 200", color.x, color.y, color.z)
                };

                ctx.host.cvar_set("r_waterFogColor", &fog_string);
            } else if token.eq_ignore_ascii_case("fogvars") {
                let Some(color) = self.parse_vector(lexer) else {
                    return false;
                };
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing density value for the fog", self.name);
                    continue;
                }

                // fogFar > 1 sets the far clip; < 1 sets density.
                let fog_density = parse_f32(token);
                let fog_far = if fog_density >= 1.0 { fog_density as i32 } else { 5 };
                ctx.host.cvar_set(
                    "r_mapFogColor",
                    &format!("0 {fog_far} {fog_density} {} {} {} 0", color.x, color.y, color.z),
                );
            } else if token.eq_ignore_ascii_case("nofog") {
                self.no_fog = true;
            } else if token.eq_ignore_ascii_case("allowcompress")
                || token.eq_ignore_ascii_case("nocompress")
            {
                // Per-shader compression toggles; ignored.
            } else if token.eq_ignore_ascii_case("light") {
                // light <value> determines flaring in q3map.
                lexer.next_on_line();
            } else if token.eq_ignore_ascii_case("cull") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing cull parms", self.name);
                } else if token.eq_ignore_ascii_case("none")
                    || token.eq_ignore_ascii_case("twosided")
                    || token.eq_ignore_ascii_case("disable")
                {
                    self.cull_type = CullType::TwoSided;
                } else if token.eq_ignore_ascii_case("back")
                    || token.eq_ignore_ascii_case("backside")
                    || token.eq_ignore_ascii_case("backsided")
                {
                    self.cull_type = CullType::BackSided;
                } else {
                    warn!("'{}': invalid cull parm '{token}'", self.name);
                }
            } else if token.eq_ignore_ascii_case("sort") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing sort parameter", self.name);
                    continue;
                }

                self.sort = sort_from_name(token);
            } else {
                warn!("'{}': unknown general shader parameter '{token}'", self.name);
                return false;
            }
        }

        // Ignore shaders that don't have any stages, unless sky or fog.
        if stage_index == 0 && !self.is_sky && !self.content_flags.contains(ContentFlags::FOG) {
            return false;
        }

        self.explicitly_defined = true;
        true
    }

    fn parse_vector(&self, lexer: &mut Lexer) -> Option<Vec3> {
        let token = lexer.next_on_line();

        if token != "(" {
            warn!("'{}': missing opening parenthesis", self.name);
            return None;
        }

        let mut v = Vec3::ZERO;

        for i in 0..3 {
            let token = lexer.next_on_line();

            if token.is_empty() {
                warn!("'{}': missing vector element", self.name);
                return None;
            }

            v[i] = parse_f32(token);
        }

        let token = lexer.next_on_line();

        if token != ")" {
            warn!("'{}': missing closing parenthesis", self.name);
            return None;
        }

        Some(v)
    }

    fn parse_sun(&mut self, lexer: &mut Lexer, ctx: &mut ParseContext, extended: bool) {
        let mut sun = SunLight {
            shadows: extended,
            ..SunLight::default()
        };

        let mut light = Vec3::ZERO;

        for i in 0..3 {
            light[i] = parse_f32(lexer.next_on_line());
        }

        let intensity = parse_f32(lexer.next_on_line());
        sun.light = light.normalize_or_zero() * intensity * ctx.overbright_factor / 255.0;

        let a = parse_f32(lexer.next_on_line()).to_radians();
        let b = parse_f32(lexer.next_on_line()).to_radians();
        sun.direction = Vec3::new(a.cos() * b.cos(), a.sin() * b.cos(), b.sin()).normalize();

        if sun.shadows {
            sun.light_scale = parse_f32(lexer.next_on_line());
            sun.shadow_scale = parse_f32(lexer.next_on_line());
        }

        *ctx.sun = sun;
        lexer.skip_rest_of_line();
    }

    /// `skyParms <outerbox> <cloudheight> <innerbox>`
    fn parse_sky_parms(&mut self, lexer: &mut Lexer, ctx: &mut ParseContext) {
        const SUFFIXES: [&str; 6] = ["rt", "bk", "lf", "ft", "up", "dn"];
        let flags = TextureFlags::MIPMAP | TextureFlags::PICMIP;

        // Outer box.
        let token = lexer.next_on_line();

        if token.is_empty() {
            warn!("'{}': 'skyParms' missing parameter", self.name);
            return;
        }

        if token != "-" {
            for (i, suffix) in SUFFIXES.iter().enumerate() {
                let pathname = format!("{token}_{suffix}.tga");
                self.sky.outer_box[i] = Some(
                    ctx.textures
                        .find(
                            ctx.device,
                            ctx.host,
                            &pathname,
                            flags | TextureFlags::CLAMP_TO_EDGE,
                        )
                        .unwrap_or_else(|| ctx.textures.default_texture()),
                );
            }
        }

        // Cloud height.
        let token = lexer.next_on_line();

        if token.is_empty() {
            warn!("'{}': 'skyParms' missing parameter", self.name);
            return;
        }

        self.sky.cloud_height = parse_f32(token);

        if self.sky.cloud_height == 0.0 {
            self.sky.cloud_height = 512.0;
        }

        // Inner box.
        let token = lexer.next_on_line();

        if token.is_empty() {
            warn!("'{}': 'skyParms' missing parameter", self.name);
            return;
        }

        if token != "-" {
            for (i, suffix) in SUFFIXES.iter().enumerate() {
                let pathname = format!("{token}_{suffix}.tga");
                self.sky.inner_box[i] = Some(
                    ctx.textures
                        .find(ctx.device, ctx.host, &pathname, flags)
                        .unwrap_or_else(|| ctx.textures.default_texture()),
                );
            }
        }

        self.is_sky = true;
    }

    fn parse_stage(
        &mut self,
        stage: &mut MaterialStage,
        lexer: &mut Lexer,
        ctx: &mut ParseContext,
    ) -> bool {
        use wgpu::BlendFactor as BF;

        let mut depth_write_explicit = false;
        stage.active = true;

        loop {
            let mut token = lexer.next();

            if token.is_empty() {
                warn!("'{}': no matching '}}' found", self.name);
                return false;
            }

            if token == "}" {
                break;
            }

            // Compression-conditional aliases. Compression is never enabled
            // in this core: map32/mapnocomp select, map16/mapcomp skip.
            if token.eq_ignore_ascii_case("map16") || token.eq_ignore_ascii_case("mapcomp") {
                lexer.next_on_line();
                continue;
            } else if token.eq_ignore_ascii_case("map32")
                || token.eq_ignore_ascii_case("mapnocomp")
            {
                token = "map";
            } else if token.eq_ignore_ascii_case("animmapcomp") {
                while !lexer.next_on_line().is_empty() {}
                continue;
            } else if token.eq_ignore_ascii_case("animmapnocomp") {
                token = "animmap";
            }

            if token.eq_ignore_ascii_case("map") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for 'map' keyword", self.name);
                    return false;
                }

                if token.eq_ignore_ascii_case("$whiteimage") {
                    stage.bundles[0].textures[0] = Some(ctx.textures.white());
                } else if token.eq_ignore_ascii_case("$lightmap") {
                    stage.bundles[0].is_lightmap = true;
                    let lightmap = if self.lightmap_index >= 0 {
                        ctx.lightmaps.get(self.lightmap_index as usize).copied()
                    } else {
                        None
                    };
                    stage.bundles[0].textures[0] =
                        Some(lightmap.unwrap_or_else(|| ctx.textures.white()));
                } else if token.eq_ignore_ascii_case("$deluxemap") {
                    stage.bundles[0].is_lightmap = true;
                    stage.bundles[0].textures[0] = Some(ctx.textures.white());
                } else {
                    let mut flags = TextureFlags::empty();

                    if !self.no_mip_maps {
                        flags |= TextureFlags::MIPMAP;
                    }

                    if !self.no_pic_mip {
                        flags |= TextureFlags::PICMIP;
                    }

                    stage.bundles[0].textures[0] =
                        ctx.textures.find(ctx.device, ctx.host, token, flags);

                    if stage.bundles[0].textures[0].is_none() {
                        warn!("'{}': could not find texture '{token}'", self.name);
                        return false;
                    }
                }
            } else if token.eq_ignore_ascii_case("clampmap") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for 'clampmap' keyword", self.name);
                    return false;
                }

                let mut flags = TextureFlags::CLAMP_TO_EDGE;

                if !self.no_mip_maps {
                    flags |= TextureFlags::MIPMAP;
                }

                if !self.no_pic_mip {
                    flags |= TextureFlags::PICMIP;
                }

                stage.bundles[0].textures[0] = ctx.textures.find(ctx.device, ctx.host, token, flags);

                if stage.bundles[0].textures[0].is_none() {
                    warn!("'{}': could not find texture '{token}'", self.name);
                    return false;
                }
            } else if token.eq_ignore_ascii_case("animMap") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for 'animMap' keyword", self.name);
                    return false;
                }

                stage.bundles[0].image_animation_speed = parse_f32(token);

                loop {
                    let token = lexer.next_on_line();

                    if token.is_empty() {
                        break;
                    }

                    let num = stage.bundles[0].n_image_animations;

                    if num < MAX_IMAGE_ANIMATIONS {
                        let mut flags = TextureFlags::empty();

                        if !self.no_mip_maps {
                            flags |= TextureFlags::MIPMAP;
                        }

                        if !self.no_pic_mip {
                            flags |= TextureFlags::PICMIP;
                        }

                        let texture = ctx.textures.find(ctx.device, ctx.host, token, flags);

                        if texture.is_none() {
                            warn!("'{}': could not find texture '{token}'", self.name);
                            return false;
                        }

                        stage.bundles[0].textures[num] = texture;
                        stage.bundles[0].n_image_animations += 1;
                    }
                }
            } else if token.eq_ignore_ascii_case("videoMap") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for 'videoMap' keyword", self.name);
                    return false;
                }

                stage.bundles[0].video_map_handle = ctx.host.play_cinematic(token, 256, 256);

                if stage.bundles[0].video_map_handle != -1 {
                    stage.bundles[0].is_video_map = true;
                    stage.bundles[0].textures[0] =
                        Some(ctx.textures.scratch(stage.bundles[0].video_map_handle as usize));
                }
            } else if token.eq_ignore_ascii_case("alphaFunc") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for 'alphaFunc' keyword", self.name);
                    return false;
                }

                stage.alpha_test = self.alpha_test_from_name(token);
            } else if token.eq_ignore_ascii_case("depthfunc") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for 'depthfunc' keyword", self.name);
                    return false;
                }

                if token.eq_ignore_ascii_case("lequal") {
                    stage.depth_test = wgpu::CompareFunction::LessEqual;
                } else if token.eq_ignore_ascii_case("equal") {
                    stage.depth_test = wgpu::CompareFunction::Equal;
                } else {
                    warn!("'{}': unknown depthfunc '{token}'", self.name);
                }
            } else if token.eq_ignore_ascii_case("detail") {
                stage.is_detail = true;
            } else if token.eq_ignore_ascii_case("blendfunc") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parm for blendFunc", self.name);
                    continue;
                }

                // Check for "simple" blends first.
                if token.eq_ignore_ascii_case("add") {
                    stage.blend = Some((BF::One, BF::One));
                } else if token.eq_ignore_ascii_case("filter") {
                    stage.blend = Some((BF::Dst, BF::Zero));
                } else if token.eq_ignore_ascii_case("blend") {
                    stage.blend = Some((BF::SrcAlpha, BF::OneMinusSrcAlpha));
                } else {
                    // Complex double blends.
                    let src = self.src_blend_from_name(token);
                    let token = lexer.next_on_line();

                    if token.is_empty() {
                        warn!("'{}': missing parm for blendFunc", self.name);
                        continue;
                    }

                    stage.blend = Some((src, self.dst_blend_from_name(token)));
                }

                // Clear depth write for blended surfaces.
                if !depth_write_explicit {
                    stage.depth_write = false;
                }
            } else if token.eq_ignore_ascii_case("stage") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameters for stage", self.name);
                } else if token.eq_ignore_ascii_case("diffuseMap") {
                    stage.stage_type = StageType::ColorMap;
                } else if token.eq_ignore_ascii_case("normalMap")
                    || token.eq_ignore_ascii_case("bumpMap")
                {
                    stage.stage_type = StageType::NormalMap;
                } else if token.eq_ignore_ascii_case("normalParallaxMap")
                    || token.eq_ignore_ascii_case("bumpParallaxMap")
                {
                    stage.stage_type = StageType::NormalParallaxMap;
                } else if token.eq_ignore_ascii_case("specularMap") {
                    stage.stage_type = StageType::SpecularMap;
                    stage.specular_scale = Vec4::ONE;
                } else {
                    warn!("'{}': unknown stage parameter '{token}'", self.name);
                }
            } else if token.eq_ignore_ascii_case("specularreflectance") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for specular reflectance", self.name);
                    continue;
                }

                stage.specular_scale = Vec4::splat(parse_f32(token));
            } else if token.eq_ignore_ascii_case("specularexponent") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for specular exponent", self.name);
                    continue;
                }

                // Change shininess to gloss, assuming a max exponent of 8192.
                let exponent = parse_f32(token).clamp(1.0, 8192.0);
                stage.specular_scale.w = exponent.ln() / 8192.0f32.ln();
            } else if token.eq_ignore_ascii_case("gloss") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for gloss", self.name);
                    continue;
                }

                stage.specular_scale.w = parse_f32(token);
            } else if token.eq_ignore_ascii_case("parallaxdepth") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for parallaxDepth", self.name);
                    continue;
                }

                stage.normal_scale.w = parse_f32(token);
            } else if token.eq_ignore_ascii_case("normalscale") {
                // normalScale <xy> | <x> <y> | <x> <y> <height>
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for normalScale", self.name);
                    continue;
                }

                stage.normal_scale.x = parse_f32(token);
                let token = lexer.next_on_line();

                if token.is_empty() {
                    // One value applies to X and Y.
                    stage.normal_scale.y = stage.normal_scale.x;
                    continue;
                }

                stage.normal_scale.y = parse_f32(token);
                let token = lexer.next_on_line();

                if token.is_empty() {
                    continue;
                }

                stage.normal_scale.z = parse_f32(token);
            } else if token.eq_ignore_ascii_case("specularscale") {
                // specularScale <rgb> <gloss> | <r> <g> <b> | <r> <g> <b> <gloss>
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for specularScale", self.name);
                    continue;
                }

                stage.specular_scale.x = parse_f32(token);
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameter for specularScale", self.name);
                    continue;
                }

                stage.specular_scale.y = parse_f32(token);
                let token = lexer.next_on_line();

                if token.is_empty() {
                    // Two values: rgb then gloss.
                    stage.specular_scale.w = stage.specular_scale.y;
                    stage.specular_scale.y = stage.specular_scale.x;
                    stage.specular_scale.z = stage.specular_scale.x;
                    continue;
                }

                stage.specular_scale.z = parse_f32(token);
                let token = lexer.next_on_line();

                if token.is_empty() {
                    continue;
                }

                stage.specular_scale.w = parse_f32(token);
            } else if token.eq_ignore_ascii_case("rgbGen") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameters for rgbGen", self.name);
                } else if token.eq_ignore_ascii_case("wave") {
                    stage.rgb_wave = self.parse_waveform(lexer);
                    stage.rgb_gen = ColorGen::Waveform;
                } else if token.eq_ignore_ascii_case("const") {
                    let color = self.parse_vector(lexer).unwrap_or(Vec3::ZERO);
                    stage.constant_color =
                        Vec4::new(color.x, color.y, color.z, stage.constant_color.w);
                    stage.rgb_gen = ColorGen::Const;
                } else if token.eq_ignore_ascii_case("identity") {
                    stage.rgb_gen = ColorGen::Identity;
                } else if token.eq_ignore_ascii_case("identityLighting") {
                    stage.rgb_gen = ColorGen::IdentityLighting;
                } else if token.eq_ignore_ascii_case("entity") {
                    stage.rgb_gen = ColorGen::Entity;
                } else if token.eq_ignore_ascii_case("oneMinusEntity") {
                    stage.rgb_gen = ColorGen::OneMinusEntity;
                } else if token.eq_ignore_ascii_case("vertex") {
                    stage.rgb_gen = ColorGen::Vertex;

                    if stage.alpha_gen == AlphaGen::Identity {
                        stage.alpha_gen = AlphaGen::Vertex;
                    }
                } else if token.eq_ignore_ascii_case("exactVertex") {
                    stage.rgb_gen = ColorGen::ExactVertex;
                } else if token.eq_ignore_ascii_case("vertexLit") {
                    stage.rgb_gen = ColorGen::VertexLit;

                    if stage.alpha_gen == AlphaGen::Identity {
                        stage.alpha_gen = AlphaGen::Vertex;
                    }
                } else if token.eq_ignore_ascii_case("exactVertexLit") {
                    stage.rgb_gen = ColorGen::ExactVertexLit;
                } else if token.eq_ignore_ascii_case("lightingDiffuse") {
                    stage.rgb_gen = ColorGen::LightingDiffuse;
                } else if token.eq_ignore_ascii_case("oneMinusVertex") {
                    stage.rgb_gen = ColorGen::OneMinusVertex;
                } else {
                    warn!("'{}': unknown rgbGen parameter '{token}'", self.name);
                }
            } else if token.eq_ignore_ascii_case("alphaGen") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing parameters for alphaGen", self.name);
                } else if token.eq_ignore_ascii_case("wave") {
                    stage.alpha_wave = self.parse_waveform(lexer);
                    stage.alpha_gen = AlphaGen::Waveform;
                } else if token.eq_ignore_ascii_case("const") {
                    stage.constant_color.w = parse_f32(lexer.next_on_line());
                    stage.alpha_gen = AlphaGen::Const;
                } else if token.eq_ignore_ascii_case("identity") {
                    stage.alpha_gen = AlphaGen::Identity;
                } else if token.eq_ignore_ascii_case("entity") {
                    stage.alpha_gen = AlphaGen::Entity;
                } else if token.eq_ignore_ascii_case("oneMinusEntity") {
                    stage.alpha_gen = AlphaGen::OneMinusEntity;
                } else if token.eq_ignore_ascii_case("normalzfade") {
                    stage.alpha_gen = AlphaGen::NormalZFade;
                    let token = lexer.next_on_line();

                    stage.constant_color.w = if token.is_empty() {
                        1.0
                    } else {
                        parse_f32(token)
                    };

                    let token = lexer.next_on_line();

                    if token.is_empty() {
                        stage.z_fade_bounds = Vec2::new(-1.0, 1.0);
                    } else {
                        stage.z_fade_bounds.x = parse_f32(token);
                        stage.z_fade_bounds.y = parse_f32(lexer.next_on_line());
                    }
                } else if token.eq_ignore_ascii_case("vertex") {
                    stage.alpha_gen = AlphaGen::Vertex;
                } else if token.eq_ignore_ascii_case("lightingSpecular") {
                    stage.alpha_gen = AlphaGen::LightingSpecular;
                } else if token.eq_ignore_ascii_case("oneMinusVertex") {
                    stage.alpha_gen = AlphaGen::OneMinusVertex;
                } else if token.eq_ignore_ascii_case("portal") {
                    stage.alpha_gen = AlphaGen::Portal;
                    let token = lexer.next_on_line();

                    if token.is_empty() {
                        warn!(
                            "'{}': missing range parameter for alphaGen portal, defaulting to {}",
                            self.name, self.portal_range
                        );
                    } else {
                        self.portal_range = parse_f32(token);
                    }
                } else {
                    warn!("'{}': unknown alphaGen parameter '{token}'", self.name);
                }
            } else if token.eq_ignore_ascii_case("texgen") || token.eq_ignore_ascii_case("tcGen") {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing texgen parm", self.name);
                } else if token.eq_ignore_ascii_case("environment") {
                    stage.bundles[0].tc_gen = TexCoordGen::EnvironmentMapped;
                } else if token.eq_ignore_ascii_case("lightmap") {
                    stage.bundles[0].tc_gen = TexCoordGen::Lightmap;
                } else if token.eq_ignore_ascii_case("texture")
                    || token.eq_ignore_ascii_case("base")
                {
                    stage.bundles[0].tc_gen = TexCoordGen::Texture;
                } else if token.eq_ignore_ascii_case("vector") {
                    stage.bundles[0].tc_gen_vectors[0] =
                        self.parse_vector(lexer).unwrap_or(Vec3::ZERO);
                    stage.bundles[0].tc_gen_vectors[1] =
                        self.parse_vector(lexer).unwrap_or(Vec3::ZERO);
                    stage.bundles[0].tc_gen = TexCoordGen::Vector;
                } else {
                    warn!("'{}': unknown texgen parm", self.name);
                }
            } else if token.eq_ignore_ascii_case("tcMod") {
                if stage.bundles[0].tex_mods.len() == MAX_TEX_MODS {
                    warn!("'{}': too many tcMod stages", self.name);
                    lexer.skip_rest_of_line();
                    continue;
                }

                if let Some(tex_mod) = self.parse_tex_mod(lexer) {
                    stage.bundles[0].tex_mods.push(tex_mod);
                }
            } else if token.eq_ignore_ascii_case("depthwrite") {
                stage.depth_write = true;
                depth_write_explicit = true;
            } else {
                warn!("'{}': unknown parameter '{token}'", self.name);
                return false;
            }
        }

        // If rgbGen isn't explicitly specified, use either identity or
        // identity lighting.
        if stage.rgb_gen == ColorGen::Bad {
            stage.rgb_gen = match stage.blend {
                None | Some((BF::One, _)) | Some((BF::SrcAlpha, _)) => ColorGen::IdentityLighting,
                _ => ColorGen::Identity,
            };
        }

        // Implicitly assume that a ONE/ZERO blend mask disables blending.
        if stage.blend == Some((BF::One, BF::Zero)) {
            stage.blend = None;
            stage.depth_write = true;
        }

        // Decide which alpha gens we can skip.
        if stage.alpha_gen == AlphaGen::Identity
            && matches!(stage.rgb_gen, ColorGen::Identity | ColorGen::LightingDiffuse)
        {
            stage.alpha_gen = AlphaGen::Skip;
        }

        true
    }

    fn parse_waveform(&self, lexer: &mut Lexer) -> Waveform {
        let mut wave = Waveform::default();
        let token = lexer.next_on_line();

        if token.is_empty() {
            warn!("'{}': missing waveform parm", self.name);
            return wave;
        }

        wave.func = self.gen_func_from_name(token);

        // base, amplitude, phase, frequency
        let mut missing = false;
        for field in [
            &mut wave.base,
            &mut wave.amplitude,
            &mut wave.phase,
            &mut wave.frequency,
        ] {
            let token = lexer.next_on_line();

            if token.is_empty() {
                warn!("'{}': missing waveform parm", self.name);
                missing = true;
                break;
            }

            *field = parse_f32(token);
        }
        let _ = missing;

        wave
    }

    fn parse_tex_mod(&self, lexer: &mut Lexer) -> Option<TexMod> {
        let token = lexer.next_on_line();

        if token.eq_ignore_ascii_case("turb") {
            let mut wave = Waveform {
                func: WaveFunc::Sin,
                ..Waveform::default()
            };

            for field in [
                &mut wave.base,
                &mut wave.amplitude,
                &mut wave.phase,
                &mut wave.frequency,
            ] {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing tcMod turb parms", self.name);
                    return None;
                }

                *field = parse_f32(token);
            }

            Some(TexMod::Turbulent(wave))
        } else if token.eq_ignore_ascii_case("scale") {
            let s = lexer.next_on_line();
            let t = lexer.next_on_line();

            if s.is_empty() || t.is_empty() {
                warn!("'{}': missing scale parms", self.name);
                return None;
            }

            Some(TexMod::Scale(Vec2::new(parse_f32(s), parse_f32(t))))
        } else if token.eq_ignore_ascii_case("scroll") {
            let s = lexer.next_on_line();
            let t = lexer.next_on_line();

            if s.is_empty() || t.is_empty() {
                warn!("'{}': missing scale scroll parms", self.name);
                return None;
            }

            Some(TexMod::Scroll(Vec2::new(parse_f32(s), parse_f32(t))))
        } else if token.eq_ignore_ascii_case("stretch") {
            let func = lexer.next_on_line();

            if func.is_empty() {
                warn!("'{}': missing stretch parms", self.name);
                return None;
            }

            let mut wave = Waveform {
                func: self.gen_func_from_name(func),
                ..Waveform::default()
            };

            for field in [
                &mut wave.base,
                &mut wave.amplitude,
                &mut wave.phase,
                &mut wave.frequency,
            ] {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing stretch parms", self.name);
                    return None;
                }

                *field = parse_f32(token);
            }

            Some(TexMod::Stretch(wave))
        } else if token.eq_ignore_ascii_case("transform") {
            let mut values = [0.0f32; 6];

            for value in &mut values {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing transform parms", self.name);
                    return None;
                }

                *value = parse_f32(token);
            }

            Some(TexMod::Transform {
                matrix: [[values[0], values[1]], [values[2], values[3]]],
                translate: [values[4], values[5]],
            })
        } else if token.eq_ignore_ascii_case("rotate") {
            let token = lexer.next_on_line();

            if token.is_empty() {
                warn!("'{}': missing tcMod rotate parms", self.name);
                return None;
            }

            Some(TexMod::Rotate(parse_f32(token)))
        } else if token.eq_ignore_ascii_case("entityTranslate") {
            Some(TexMod::EntityTranslate)
        } else {
            warn!("'{}': unknown tcMod '{token}'", self.name);
            None
        }
    }

    /// ```text
    /// deformVertexes wave <spread> <waveform> <base> <amplitude> <phase> <frequency>
    /// deformVertexes normal <amplitude> <frequency>
    /// deformVertexes move <x> <y> <z> <waveform> <base> <amplitude> <phase> <frequency>
    /// deformVertexes bulge <bulgeWidth> <bulgeHeight> <bulgeSpeed>
    /// deformVertexes projectionShadow | autoSprite | autoSprite2 | text[0-7]
    /// ```
    fn parse_deform(&self, lexer: &mut Lexer) -> DeformStage {
        let mut ds = DeformStage::default();
        let token = lexer.next_on_line();

        if token.is_empty() {
            warn!("'{}': missing deform parm", self.name);
        } else if token.eq_ignore_ascii_case("projectionShadow") {
            ds.deform = Deform::ProjectionShadow;
        } else if token.eq_ignore_ascii_case("autosprite") {
            ds.deform = Deform::Autosprite;
        } else if token.eq_ignore_ascii_case("autosprite2") {
            ds.deform = Deform::Autosprite2;
        } else if token.len() >= 4 && token[..4].eq_ignore_ascii_case("text") {
            let n = token.as_bytes().get(4).map_or(0, |c| c.wrapping_sub(b'0'));
            ds.deform = Deform::Text(if n > 7 { 0 } else { n });
        } else if token.eq_ignore_ascii_case("bulge") {
            let mut missing = false;
            for field in [&mut ds.bulge_width, &mut ds.bulge_height, &mut ds.bulge_speed] {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing deformVertexes bulge parm", self.name);
                    missing = true;
                    break;
                }

                *field = parse_f32(token);
            }

            if !missing {
                ds.deform = Deform::Bulge;
            }
        } else if token.eq_ignore_ascii_case("wave") {
            let token = lexer.next_on_line();

            if token.is_empty() {
                warn!("'{}': missing deformVertexes parm", self.name);
                return ds;
            }

            let div = parse_f32(token);

            if div != 0.0 {
                ds.spread = 1.0 / div;
            } else {
                ds.spread = 100.0;
                warn!("'{}': illegal div value of 0 in deformVertexes command", self.name);
            }

            ds.wave = self.parse_waveform(lexer);
            ds.deform = Deform::Wave;
        } else if token.eq_ignore_ascii_case("normal") {
            let amplitude = lexer.next_on_line();

            if amplitude.is_empty() {
                warn!("'{}': missing deformVertexes parm", self.name);
                return ds;
            }

            ds.wave.amplitude = parse_f32(amplitude);
            let frequency = lexer.next_on_line();

            if frequency.is_empty() {
                warn!("'{}': missing deformVertexes parm", self.name);
                return ds;
            }

            ds.wave.frequency = parse_f32(frequency);
            ds.deform = Deform::Normals;
        } else if token.eq_ignore_ascii_case("move") {
            for i in 0..3 {
                let token = lexer.next_on_line();

                if token.is_empty() {
                    warn!("'{}': missing deformVertexes parm", self.name);
                    return ds;
                }

                ds.move_vector[i] = parse_f32(token);
            }

            ds.wave = self.parse_waveform(lexer);
            ds.deform = Deform::Move;
        } else {
            warn!("'{}': unknown deformVertexes subtype '{token}' found", self.name);
        }

        ds
    }

    fn alpha_test_from_name(&self, name: &str) -> AlphaTest {
        if name.eq_ignore_ascii_case("GT0") {
            AlphaTest::Gt0
        } else if name.eq_ignore_ascii_case("LT128") {
            AlphaTest::Lt128
        } else if name.eq_ignore_ascii_case("GE128") {
            AlphaTest::Ge128
        } else {
            warn!("'{}': invalid alphaFunc name '{name}'", self.name);
            AlphaTest::None
        }
    }

    fn src_blend_from_name(&self, name: &str) -> wgpu::BlendFactor {
        use wgpu::BlendFactor as BF;

        let factors = [
            ("GL_ONE", BF::One),
            ("GL_ZERO", BF::Zero),
            ("GL_DST_COLOR", BF::Dst),
            ("GL_ONE_MINUS_DST_COLOR", BF::OneMinusDst),
            ("GL_SRC_ALPHA", BF::SrcAlpha),
            ("GL_ONE_MINUS_SRC_ALPHA", BF::OneMinusSrcAlpha),
            ("GL_DST_ALPHA", BF::DstAlpha),
            ("GL_ONE_MINUS_DST_ALPHA", BF::OneMinusDstAlpha),
            ("GL_SRC_ALPHA_SATURATE", BF::SrcAlphaSaturated),
        ];

        for (factor_name, factor) in factors {
            if name.eq_ignore_ascii_case(factor_name) {
                return factor;
            }
        }

        warn!("'{}': unknown blend mode '{name}', substituting GL_ONE", self.name);
        BF::One
    }

    fn dst_blend_from_name(&self, name: &str) -> wgpu::BlendFactor {
        use wgpu::BlendFactor as BF;

        let factors = [
            ("GL_ONE", BF::One),
            ("GL_ZERO", BF::Zero),
            ("GL_SRC_ALPHA", BF::SrcAlpha),
            ("GL_ONE_MINUS_SRC_ALPHA", BF::OneMinusSrcAlpha),
            ("GL_DST_ALPHA", BF::DstAlpha),
            ("GL_ONE_MINUS_DST_ALPHA", BF::OneMinusDstAlpha),
            ("GL_SRC_COLOR", BF::Src),
            ("GL_ONE_MINUS_SRC_COLOR", BF::OneMinusSrc),
        ];

        for (factor_name, factor) in factors {
            if name.eq_ignore_ascii_case(factor_name) {
                return factor;
            }
        }

        warn!("'{}': unknown blend mode '{name}', substituting GL_ONE", self.name);
        BF::One
    }

    fn gen_func_from_name(&self, name: &str) -> WaveFunc {
        let funcs = [
            ("sin", WaveFunc::Sin),
            ("square", WaveFunc::Square),
            ("triangle", WaveFunc::Triangle),
            ("sawtooth", WaveFunc::Sawtooth),
            ("inversesawtooth", WaveFunc::InverseSawtooth),
            ("noise", WaveFunc::Noise),
        ];

        for (func_name, func) in funcs {
            if name.eq_ignore_ascii_case(func_name) {
                return func;
            }
        }

        warn!("'{}': invalid genfunc name '{name}'", self.name);
        WaveFunc::Sin
    }
}

fn sort_from_name(name: &str) -> f32 {
    let sorts = [
        ("portal", sort::PORTAL),
        ("sky", sort::ENVIRONMENT),
        ("opaque", sort::OPAQUE),
        ("decal", sort::DECAL),
        ("seeThrough", sort::SEE_THROUGH),
        ("banner", sort::BANNER),
        ("additive", sort::BLEND1),
        ("nearest", sort::NEAREST),
        ("underwater", sort::UNDERWATER),
    ];

    for (sort_name, value) in sorts {
        if name.eq_ignore_ascii_case(sort_name) {
            return value;
        }
    }

    name.parse().unwrap_or(0.0)
}
