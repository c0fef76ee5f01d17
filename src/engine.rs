//! The engine front-end.
//!
//! One [`Engine`] value owns every cache and all per-frame state; the host
//! drives it through the registration and scene methods and never retains
//! pointers across frames. Per-frame flow: accumulate scene state, update
//! visibility and the dynamic-light grid, build sorted draw calls, submit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};
use log::warn;
use rustc_hash::FxHashMap;

use crate::bytes::ByteReader;
use crate::draw::{
    sky::SkyRenderer, sort_draw_calls, DrawCall, DrawCallList, IndexBufferRange, IndexBufferSource,
    RenderState, StateFlags, VertexBufferRange,
};
use crate::dynamic_light::{DynamicLight, DynamicLightManager, DynamicLightUniforms};
use crate::errors::Result;
use crate::gpu::{GraphicsDevice, ViewId};
use crate::interface::{CvarFlags, GlConfig, Host};
use crate::material::parse::ParseContext;
use crate::material::{MaterialCache, MaterialIndex, MaterialLightmapId};
use crate::math::{Frustum, Transform};
use crate::model::{Model, ModelCache, ModelRenderContext};
use crate::scene::{
    MarkFragment, PolyVertex, Polygon, Rect, RenderEntity, RenderEntityFlags, RenderEntityType,
    SceneDefinition, SceneFlags, StretchPic, SunLight, MAX_MAP_AREA_BYTES,
};
use crate::texture::TextureCache;
use crate::vertex::Vertex;
use crate::world::{load::WorldLoadContext, VisibilityId, World};

static TRANSIENT_BUFFER_WARNED: AtomicBool = AtomicBool::new(false);

/// Warn once per process when a transient buffer allocation fails; the draw
/// call is dropped.
pub fn warn_once_transient_buffer() {
    if !TRANSIENT_BUFFER_WARNED.swap(true, Ordering::Relaxed) {
        warn!("transient buffer alloc failed");
    }
}

/// A glyph from a q3 .dat font file.
#[derive(Debug, Clone, Default)]
pub struct FontGlyph {
    pub height: i32,
    pub top: i32,
    pub bottom: i32,
    pub pitch: i32,
    pub x_skip: i32,
    pub image_width: i32,
    pub image_height: i32,
    pub s: f32,
    pub t: f32,
    pub s2: f32,
    pub t2: f32,
    pub material: i32,
    pub material_name: String,
}

/// A registered font: 256 glyphs plus a scale.
#[derive(Debug, Clone, Default)]
pub struct FontInfo {
    pub name: String,
    pub glyphs: Vec<FontGlyph>,
    pub glyph_scale: f32,
}

/// Everything a backend binds to draw one pass of a draw call's material.
/// Produced by [`Engine::evaluate_stage`] at submission time.
#[derive(Debug, Clone)]
pub struct StageRenderInput {
    pub state: RenderState,
    pub colors: crate::material::calculate::ColorGenUniforms,
    pub tex_gen: crate::material::calculate::TexGenUniforms,
    pub alpha_test: crate::material::AlphaTest,
    pub fog_color_mask: Vec4,
    /// Set when the diffuse bundle is animated.
    pub animation: Option<crate::material::calculate::TextureAnimation>,
    pub deforms: crate::material::calculate::DeformUniforms,
}

/// Registered console variables.
struct Cvars {
    dynamic_light_scale: f32,
    dynamic_light_intensity: f32,
    rail_width: f32,
    rail_core_width: f32,
    rail_segment_length: f32,
    lerp_texture_animation: bool,
    water_reflections: bool,
}

macro_rules! parse_ctx {
    ($engine:expr, $lightmaps:expr) => {
        ParseContext {
            device: $engine.device.as_mut(),
            host: $engine.host.as_ref(),
            textures: &mut $engine.textures,
            lightmaps: $lightmaps,
            sun: &mut $engine.sun,
            overbright_factor: $engine.overbright_factor,
        }
    };
}

/// The renderer core. See the crate root for the lifecycle.
pub struct Engine {
    host: Box<dyn Host>,
    device: Box<dyn GraphicsDevice>,
    textures: TextureCache,
    materials: MaterialCache,
    models: ModelCache,
    world: Option<World>,
    dynamic_lights: DynamicLightManager,
    sky: SkyRenderer,
    sun: SunLight,
    cvars: Cvars,

    identity_light: f32,
    overbright_factor: f32,

    frame_no: u32,
    frame_start: Option<Instant>,
    /// Scene time in seconds.
    float_time: f32,
    next_view: u16,

    // Per-frame scene state.
    scene_entities: Vec<RenderEntity>,
    scene_polygons: Vec<Polygon>,
    poly_vertices: Vec<Vertex>,
    stretch_pics: Vec<StretchPic>,
    current_color: Vec4,
    camera_mirrored: bool,

    external_vis_data: Option<Vec<u8>>,
    fonts: Vec<FontInfo>,
    scratch_materials: FxHashMap<usize, MaterialIndex>,
    gl_config: GlConfig,
}

impl Engine {
    /// Initialize the engine: register console variables and create the
    /// caches and built-in resources.
    pub fn new(host: Box<dyn Host>, mut device: Box<dyn GraphicsDevice>) -> Result<Engine> {
        let archive_latch = CvarFlags::ARCHIVE | CvarFlags::LATCH;

        let picmip = host.cvar_get("r_picmip", "0", archive_latch).integer.clamp(0, 16) as u32;
        let overbright_bits = host
            .cvar_get("r_overBrightBits", "1", archive_latch)
            .integer
            .clamp(0, 2);
        let dynamic_light_scale = host
            .cvar_get("r_dynamicLightScale", "1", CvarFlags::ARCHIVE)
            .value;
        let dynamic_light_intensity = host
            .cvar_get("r_dynamicLightIntensity", "1", CvarFlags::ARCHIVE)
            .value;
        let rail_width = host.cvar_get("r_railWidth", "16", CvarFlags::ARCHIVE).value;
        let rail_core_width = host.cvar_get("r_railCoreWidth", "6", CvarFlags::ARCHIVE).value;
        let rail_segment_length = host
            .cvar_get("r_railSegmentLength", "32", CvarFlags::ARCHIVE)
            .value;

        // Recognized for ABI fidelity; the values only matter to the host's
        // window and backend layers.
        host.cvar_get("r_msaa", "4", archive_latch);
        host.cvar_get("r_maxAnisotropy", "0", archive_latch);
        host.cvar_get("r_mode", "3", archive_latch);
        host.cvar_get("r_customwidth", "1600", archive_latch);
        host.cvar_get("r_customheight", "1024", archive_latch);
        host.cvar_get("r_customPixelAspect", "1", archive_latch);
        host.cvar_get("r_fullscreen", "1", CvarFlags::ARCHIVE);
        host.cvar_get("r_noborder", "0", archive_latch);
        host.cvar_get("r_centerWindow", "0", archive_latch);
        host.cvar_get("r_allowResize", "0", archive_latch);
        host.cvar_get("r_screenshotJpegQuality", "90", CvarFlags::ARCHIVE);
        host.cvar_get("r_bgfx_stats", "0", CvarFlags::CHEAT);
        host.cvar_get("r_wireframe", "0", CvarFlags::CHEAT);
        host.cvar_get("r_debugText", "0", CvarFlags::CHEAT);

        let cvars = Cvars {
            dynamic_light_scale,
            dynamic_light_intensity,
            rail_width,
            rail_core_width,
            rail_segment_length,
            lerp_texture_animation: true,
            water_reflections: false,
        };

        // Allow two overbright bits.
        let identity_light = 1.0 / f32::from(1u16 << overbright_bits);
        let overbright_factor = f32::from(1u16 << overbright_bits);

        let mut textures = TextureCache::new(device.as_mut(), picmip, identity_light)?;
        let dynamic_lights = DynamicLightManager::new(device.as_mut());
        let mut sun = SunLight::default();

        let materials = {
            let mut ctx = ParseContext {
                device: device.as_mut(),
                host: host.as_ref(),
                textures: &mut textures,
                lightmaps: &[],
                sun: &mut sun,
                overbright_factor,
            };
            MaterialCache::new(&mut ctx)
        };

        Ok(Engine {
            host,
            device,
            textures,
            materials,
            models: ModelCache::new(),
            world: None,
            dynamic_lights,
            sky: SkyRenderer::new(),
            sun,
            cvars,
            identity_light,
            overbright_factor,
            frame_no: 0,
            frame_start: None,
            float_time: 0.0,
            next_view: 1,
            scene_entities: Vec::new(),
            scene_polygons: Vec::new(),
            poly_vertices: Vec::new(),
            stretch_pics: Vec::new(),
            current_color: Vec4::ONE,
            camera_mirrored: false,
            external_vis_data: None,
            fonts: Vec::new(),
            scratch_materials: FxHashMap::default(),
            gl_config: GlConfig::default(),
        })
    }

    /// Shut the renderer down: the world and per-frame state are dropped.
    /// `destroy_window` is the host's concern and only recorded here.
    pub fn shutdown(&mut self, _destroy_window: bool) {
        self.world = None;
        self.models.remove_brush_models();
        self.clear_scene();
        self.external_vis_data = None;
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Start a level load, returning the display capability struct.
    pub fn begin_registration(&mut self, width: i32, height: i32) -> GlConfig {
        self.gl_config = GlConfig {
            vid_width: width,
            vid_height: height,
            window_aspect: if height > 0 {
                width as f32 / height as f32
            } else {
                1.0
            },
            max_texture_size: 4096,
            is_fullscreen: self.host.cvar_integer("r_fullscreen") != 0,
        };
        self.gl_config.clone()
    }

    /// No-op: all registration work happens eagerly.
    pub fn end_registration(&mut self) {}

    /// Register a model. Handle 0 means missing.
    pub fn register_model(&mut self, name: &str) -> i32 {
        let lightmaps = self.world_lightmaps();
        let mut ctx = parse_ctx!(self, &lightmaps);
        self.models.find_model(name, &mut self.materials, &mut ctx)
    }

    /// Register a skin. Handle 0 means missing/default.
    pub fn register_skin(&mut self, name: &str) -> i32 {
        let lightmaps = self.world_lightmaps();
        let mut ctx = parse_ctx!(self, &lightmaps);
        self.materials.find_skin(name, &mut ctx).unwrap_or(0)
    }

    /// Register a 2D material. Handle 0 means missing/default.
    pub fn register_shader(&mut self, name: &str) -> i32 {
        self.register_shader_internal(name, true)
    }

    /// Register a 2D material without mipmaps (console fonts, etc.).
    pub fn register_shader_no_mip(&mut self, name: &str) -> i32 {
        self.register_shader_internal(name, false)
    }

    fn register_shader_internal(&mut self, name: &str, mip: bool) -> i32 {
        let lightmaps = self.world_lightmaps();
        let mut ctx = parse_ctx!(self, &lightmaps);

        match self
            .materials
            .find_material(name, MaterialLightmapId::STRETCH_PIC, mip, &mut ctx)
        {
            Some(index) => {
                if self.materials.material(index).default_shader {
                    0
                } else {
                    index.0 as i32
                }
            }
            None => 0,
        }
    }

    /// Redirect one material name to another, optionally resetting the
    /// target's time offset.
    pub fn remap_shader(&mut self, old_name: &str, new_name: &str, offset_time: Option<&str>) {
        let lightmaps = self.world_lightmaps();
        let mut ctx = parse_ctx!(self, &lightmaps);
        self.materials
            .remap_material(old_name, new_name, offset_time, &mut ctx);
    }

    /// Load a q3 .dat font and register its glyph materials.
    pub fn register_font(&mut self, name: &str, point_size: i32) -> Option<FontInfo> {
        let point_size = if point_size <= 0 { 12 } else { point_size };

        if let Some(existing) = self
            .fonts
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
        {
            return Some(existing.clone());
        }

        let filename = format!("fonts/fontImage_{point_size}.dat");
        let data = self.host.read_file(&filename)?;
        let mut reader = ByteReader::new(&data);
        let mut font = FontInfo {
            name: name.to_string(),
            glyphs: Vec::with_capacity(256),
            glyph_scale: 1.0,
        };

        for _ in 0..256 {
            let mut glyph = FontGlyph {
                height: reader.i32(),
                top: reader.i32(),
                bottom: reader.i32(),
                pitch: reader.i32(),
                x_skip: reader.i32(),
                image_width: reader.i32(),
                image_height: reader.i32(),
                s: reader.f32(),
                t: reader.f32(),
                s2: reader.f32(),
                t2: reader.f32(),
                ..FontGlyph::default()
            };
            let _glyph_handle = reader.i32();
            glyph.material_name = reader.fixed_str(32);
            glyph.material = self.register_shader_no_mip(&glyph.material_name.clone());
            font.glyphs.push(glyph);
        }

        font.glyph_scale = f32::from_bits(reader.u32());
        self.fonts.push(font.clone());
        Some(font)
    }

    /// Load a world. Unloads any previous world first.
    pub fn load_world(&mut self, name: &str) -> Result<()> {
        self.world = None;
        self.models.remove_brush_models();

        let world = {
            let mut ctx = WorldLoadContext {
                device: self.device.as_mut(),
                host: self.host.as_ref(),
                textures: &mut self.textures,
                materials: &mut self.materials,
                sun: &mut self.sun,
                overbright_factor: self.overbright_factor,
                identity_light: self.identity_light,
                external_vis_data: self.external_vis_data.as_deref(),
            };
            World::load(name, &mut ctx)?
        };

        // Register the inline brush models (*1..*N).
        for i in 1..world.n_models() {
            self.models.add_model(Model::Brush(i), &format!("*{i}"));
        }

        self.dynamic_lights
            .initialize_grid(self.device.as_mut(), world.bounds());
        self.world = Some(world);
        Ok(())
    }

    /// Share the collision module's PVS instead of the world's own copy.
    /// Takes effect on the next world load.
    pub fn set_world_vis_data(&mut self, data: Vec<u8>) {
        self.external_vis_data = Some(data);
    }

    #[must_use]
    pub fn world(&self) -> Option<&World> {
        self.world.as_ref()
    }

    fn world_lightmaps(&self) -> Vec<crate::texture::TextureId> {
        self.world
            .as_ref()
            .map(|w| w.lightmap_atlases.clone())
            .unwrap_or_default()
    }

    // ========================================================================
    // Scene accumulation
    // ========================================================================

    /// Clear all per-frame scene state.
    pub fn clear_scene(&mut self) {
        self.scene_entities.clear();
        self.scene_polygons.clear();
        self.poly_vertices.clear();
        self.dynamic_lights.clear(self.frame_no);
    }

    pub fn add_entity_to_scene(&mut self, entity: &RenderEntity) {
        self.scene_entities.push(entity.clone());
    }

    /// Add `n_polys` polygons sharing the given vertices.
    pub fn add_poly_to_scene(&mut self, material: i32, vertices: &[PolyVertex], n_polys: usize) {
        let n_vertices = if n_polys > 0 { vertices.len() / n_polys } else { 0 };

        if n_vertices < 3 {
            return;
        }

        for poly_index in 0..n_polys {
            let first_vertex = self.poly_vertices.len() as u32;
            let mut bounds = crate::math::Bounds::EMPTY;

            for v in &vertices[poly_index * n_vertices..(poly_index + 1) * n_vertices] {
                bounds.add_point(v.position);
                self.poly_vertices.push(v.to_vertex());
            }

            // Fog is resolved at submission time, while the world is known
            // to be loaded.
            let fog_index = self
                .world
                .as_ref()
                .map_or(-1, |world| world.find_fog_index_bounds(&bounds));

            self.scene_polygons.push(Polygon {
                material,
                first_vertex,
                n_vertices: n_vertices as u32,
                fog_index,
            });
        }
    }

    pub fn add_light_to_scene(&mut self, light: DynamicLight) {
        self.dynamic_lights
            .add(self.frame_no, light, self.cvars.dynamic_light_scale);
    }

    /// Additive lights are not supported by this renderer.
    pub fn add_additive_light_to_scene(&mut self, _light: DynamicLight) {}

    /// Sample the baked light grid plus dynamic lights at a point.
    #[must_use]
    pub fn light_for_point(&self, position: Vec3) -> Option<(Vec3, Vec3, Vec3)> {
        let world = self.world.as_ref()?;

        if !world.has_light_grid() {
            return None;
        }

        let (mut ambient, directed, direction) = world.sample_light_grid(position);
        let (dlight_color, _) = self.dynamic_lights.contribute(self.frame_no, position);
        ambient += dlight_color;
        Some((ambient, directed, direction))
    }

    // ========================================================================
    // 2D
    // ========================================================================

    /// Set the color applied to subsequent stretch pics. `None` resets to
    /// white.
    pub fn set_color(&mut self, color: Option<Vec4>) {
        self.current_color = color.unwrap_or(Vec4::ONE);
    }

    pub fn draw_stretch_pic(
        &mut self,
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        s1: f32,
        t1: f32,
        s2: f32,
        t2: f32,
        material: i32,
    ) {
        self.stretch_pics.push(StretchPic {
            x,
            y,
            w,
            h,
            s1,
            t1,
            s2,
            t2,
            material,
            color: self.current_color,
            gradient: None,
        });
    }

    pub fn draw_stretch_pic_gradient(
        &mut self,
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        s1: f32,
        t1: f32,
        s2: f32,
        t2: f32,
        material: i32,
        gradient_color: Vec4,
    ) {
        self.stretch_pics.push(StretchPic {
            x,
            y,
            w,
            h,
            s1,
            t1,
            s2,
            t2,
            material,
            color: self.current_color,
            gradient: Some(gradient_color),
        });
    }

    /// Upload cinematic pixels into a scratch texture and draw them.
    pub fn draw_stretch_raw(
        &mut self,
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        cols: u32,
        rows: u32,
        data: &[u8],
        client: usize,
    ) {
        self.upload_cinematic(cols, rows, data, client);
        let material = self.scratch_material(client);
        self.stretch_pics.push(StretchPic {
            x,
            y,
            w,
            h,
            s1: 0.0,
            t1: 0.0,
            s2: 1.0,
            t2: 1.0,
            material: material.0 as i32,
            color: self.current_color,
            gradient: None,
        });
    }

    /// Upload cinematic pixels without drawing.
    pub fn upload_cinematic(&mut self, cols: u32, rows: u32, data: &[u8], client: usize) {
        self.textures
            .upload_scratch(self.device.as_mut(), client, cols, rows, data);
    }

    fn scratch_material(&mut self, client: usize) -> MaterialIndex {
        if let Some(&index) = self.scratch_materials.get(&client) {
            return index;
        }

        use wgpu::BlendFactor as BF;

        let mut material = crate::material::Material::new(&format!("*scratchMaterial{client}"));
        material.lightmap_index = MaterialLightmapId::STRETCH_PIC;
        material.stages[0].bundles[0].textures[0] = Some(self.textures.scratch(client));
        material.stages[0].active = true;
        material.stages[0].rgb_gen = crate::material::ColorGen::Vertex;
        material.stages[0].alpha_gen = crate::material::AlphaGen::Vertex;
        material.stages[0].blend = Some((BF::SrcAlpha, BF::OneMinusSrcAlpha));

        let lightmaps = self.world_lightmaps();
        let mut ctx = parse_ctx!(self, &lightmaps);
        let index = self.materials.create_material(material, &mut ctx);
        self.scratch_materials.insert(client, index);
        index
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Interpolated tag transform on a model. `None` when the tag (or
    /// model) doesn't exist.
    pub fn lerp_tag(
        &self,
        model_handle: i32,
        entity: &RenderEntity,
        tag_name: &str,
        start_index: usize,
    ) -> Option<(usize, Transform)> {
        self.models
            .model(model_handle)?
            .lerp_tag(tag_name, entity, start_index)
    }

    #[must_use]
    pub fn model_bounds(&self, model_handle: i32) -> Option<crate::math::Bounds> {
        Some(
            self.models
                .model(model_handle)?
                .bounds(self.world.as_ref()),
        )
    }

    /// Walk the entities-lump text for the host.
    pub fn get_entity_token(&mut self) -> Option<String> {
        self.world.as_mut()?.next_entity_token()
    }

    /// Whether two points can see each other through the PVS.
    #[must_use]
    pub fn in_pvs(&self, p1: Vec3, p2: Vec3) -> bool {
        self.world
            .as_ref()
            .is_some_and(|world| world.in_pvs_between(self.host.as_ref(), p1, p2))
    }

    /// Clip a decal projection against world geometry.
    pub fn mark_fragments(
        &mut self,
        points: &[Vec3],
        projection: Vec3,
        max_points: usize,
        max_fragments: usize,
    ) -> (Vec<Vec3>, Vec<MarkFragment>) {
        match self.world.as_mut() {
            Some(world) => world.mark_fragments(points, projection, max_points, max_fragments),
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Mark a material as a reflective water surface.
    pub fn set_water_reflective_material(&mut self, name: &str) {
        let lightmaps = self.world_lightmaps();
        let mut ctx = parse_ctx!(self, &lightmaps);
        self.materials.mark_reflective(name, &mut ctx);
        self.cvars.water_reflections = true;
    }

    /// The dynamic light grid's shader uniform block.
    #[must_use]
    pub fn dynamic_light_uniforms(&self) -> DynamicLightUniforms {
        self.dynamic_lights
            .uniforms(self.frame_no, self.cvars.dynamic_light_intensity)
    }

    #[must_use]
    pub fn materials(&self) -> &MaterialCache {
        &self.materials
    }

    #[must_use]
    pub fn models(&self) -> &ModelCache {
        &self.models
    }

    #[must_use]
    pub fn textures(&self) -> &TextureCache {
        &self.textures
    }

    #[must_use]
    pub fn dynamic_lights(&self) -> &DynamicLightManager {
        &self.dynamic_lights
    }

    #[must_use]
    pub fn sun(&self) -> &SunLight {
        &self.sun
    }

    #[must_use]
    pub fn frame_no(&self) -> u32 {
        self.frame_no
    }

    // ========================================================================
    // Frame flow
    // ========================================================================

    pub fn begin_frame(&mut self) {
        self.frame_start = Some(Instant::now());
        self.next_view = 1;
        self.camera_mirrored = false;
    }

    /// End the frame: flush pending 2D draws, release transient buffers.
    /// Returns (front-end ms, back-end ms).
    pub fn end_frame(&mut self) -> (i32, i32) {
        self.flush_stretch_pics();
        self.device.frame();
        self.frame_no = self.frame_no.wrapping_add(1);

        let front_ms = self
            .frame_start
            .take()
            .map_or(0, |start| start.elapsed().as_millis() as i32);
        (front_ms, 0)
    }

    fn allocate_view(&mut self) -> ViewId {
        let view = ViewId(self.next_view);
        self.next_view += 1;
        view
    }

    /// Render a submitted scene.
    pub fn render_scene(&mut self, scene: &SceneDefinition) {
        self.float_time = scene.time as f32 / 1000.0;

        if !scene.flags.contains(SceneFlags::WORLD) || self.world.is_none() {
            // 2D overlay scenes only flush the accumulated stretch pics.
            self.flush_stretch_pics();
            return;
        }

        // Hyperspace scenes only clear the screen; the host draws the
        // teleport effect itself.
        if scene.flags.contains(SceneFlags::HYPERSPACE) {
            return;
        }

        let entities = self.scene_entities.clone();

        // A scene containing a skybox portal expects the portal scene to
        // have been rendered already under its own visibility id.
        let vis_id = if scene.flags.contains(SceneFlags::SKYBOX_PORTAL) {
            VisibilityId::SkyboxPortal
        } else {
            VisibilityId::Main
        };

        self.render_camera(
            scene.position,
            scene.rotation,
            scene.fov,
            scene.rect,
            &scene.area_mask,
            &entities,
            vis_id,
            0,
            false,
            None,
        );
    }

    fn render_camera(
        &mut self,
        position: Vec3,
        rotation: Mat3,
        fov: Vec2,
        rect: Rect,
        area_mask: &[u8; MAX_MAP_AREA_BYTES],
        entities: &[RenderEntity],
        vis_id: VisibilityId,
        portal_depth: u32,
        mirrored: bool,
        pvs_position: Option<Vec3>,
    ) {
        self.camera_mirrored = mirrored;

        // 1. Visibility, walked from the PVS position when a portal supplies
        // one.
        {
            let world = self.world.as_mut().unwrap();
            world.update_visibility(
                vis_id,
                pvs_position.unwrap_or(position),
                area_mask,
                self.device.as_mut(),
                &self.materials,
            );
        }

        // 2. Entity lighting needs the grid and dlight contributions before
        // the dlight textures update.
        let mut lit_entities = entities.to_vec();

        for entity in &mut lit_entities {
            self.setup_entity_lighting(entity, position);
        }

        // 3. Dynamic light grid textures must be current before any material
        // that reads them is submitted.
        self.dynamic_lights
            .update_textures(self.frame_no, self.device.as_mut());

        let visible_bounds = self.world.as_ref().unwrap().visible_bounds(vis_id);
        let mut z_max: f32 = 2048.0;

        for corner in visible_bounds.corners() {
            z_max = z_max.max(corner.distance(position));
        }

        let camera = Transform::new(rotation, position);
        let frustum = Frustum::from_camera(&camera, fov.x, fov.y);
        let view_matrix = Mat4::look_to_rh(position, rotation.x_axis, rotation.z_axis);
        let aspect = if rect.h > 0 {
            rect.w as f32 / rect.h as f32
        } else {
            1.0
        };
        let projection =
            Mat4::perspective_rh(fov.y.to_radians(), aspect.max(0.1), 4.0, z_max);
        let mvp = projection * view_matrix;

        let mut draw_list: DrawCallList = Vec::new();

        // 4. Sky box and cloud layers for the camera-visible sky surfaces.
        {
            let world = self.world.as_ref().unwrap();
            let sky_surfaces = world.sky_surfaces(vis_id).to_vec();

            for surface in &sky_surfaces {
                self.sky.render(
                    &mut draw_list,
                    self.device.as_mut(),
                    &self.materials,
                    self.textures.default_texture(),
                    position,
                    z_max,
                    surface,
                );
            }
        }

        // 5. World batches.
        {
            let world = self.world.as_ref().unwrap();
            world.render(
                vis_id,
                &mut draw_list,
                self.device.as_mut(),
                &self.materials,
                &rotation,
                mirrored,
                self.cvars.water_reflections,
            );
        }

        // 6. Entities.
        for (entity_index, entity) in lit_entities.iter().enumerate() {
            // First person entities don't show in mirrors and portals;
            // third person entities only show there.
            if mirrored && entity.flags.contains(RenderEntityFlags::FIRST_PERSON) {
                continue;
            }

            if !mirrored && entity.flags.contains(RenderEntityFlags::THIRD_PERSON) {
                continue;
            }

            match entity.entity_type {
                RenderEntityType::Model => {
                    let Some(model) = self.models.model(entity.handle) else {
                        continue;
                    };

                    if model.is_culled(entity, &frustum, self.world.as_ref()) {
                        continue;
                    }

                    let mut ctx = ModelRenderContext {
                        device: self.device.as_mut(),
                        materials: &self.materials,
                        world: self.world.as_ref(),
                        scene_rotation: rotation,
                        camera_mirrored: mirrored,
                        entity_index,
                    };

                    model.render(&mut ctx, &mut draw_list, entity);
                }
                RenderEntityType::Sprite => {
                    self.render_sprite_entity(entity, entity_index, &rotation, &mut draw_list);
                }
                RenderEntityType::Beam | RenderEntityType::Lightning => {
                    let width = self.cvars.rail_width;
                    self.render_ribbon_entity(entity, entity_index, position, width, &mut draw_list);
                }
                RenderEntityType::RailCore => {
                    let width = self.cvars.rail_core_width;
                    self.render_ribbon_entity(entity, entity_index, position, width, &mut draw_list);
                }
                RenderEntityType::RailRings => {
                    self.render_rail_rings_entity(entity, entity_index, position, &mut draw_list);
                }
                RenderEntityType::Poly | RenderEntityType::Portal => {}
            }
        }

        // 7. Portal and mirror frames, depth-capped at one level.
        if portal_depth == 0 {
            self.render_portals(
                position,
                rotation,
                fov,
                rect,
                area_mask,
                &lit_entities,
                vis_id,
                &mvp,
                &mut draw_list,
            );

            // Nested renders clobber the mirrored flag.
            self.camera_mirrored = mirrored;
        }

        // 8. Host-submitted polygons.
        self.render_polygons(&mut draw_list);

        // Sort and submit.
        sort_draw_calls(&mut draw_list);
        let view = self.allocate_view();

        for dc in &draw_list {
            self.device.submit(view, dc);
        }
    }

    fn render_portals(
        &mut self,
        position: Vec3,
        rotation: Mat3,
        fov: Vec2,
        rect: Rect,
        area_mask: &[u8; MAX_MAP_AREA_BYTES],
        entities: &[RenderEntity],
        vis_id: VisibilityId,
        mvp: &Mat4,
        draw_list: &mut DrawCallList,
    ) {
        let portal_camera = {
            let world = self.world.as_mut().unwrap();
            world.calculate_portal_camera(
                vis_id,
                position,
                &rotation,
                mvp,
                entities,
                &self.materials,
                self.float_time,
            )
        };

        if let Some(portal) = portal_camera {
            // (a) Depth-only stencil increment over the visible portal
            // polygons.
            let mut stencil_list: DrawCallList = Vec::new();
            {
                let world = self.world.as_ref().unwrap();
                world.render_portal(
                    vis_id,
                    &mut stencil_list,
                    self.device.as_mut(),
                    &self.materials,
                );
            }

            let stencil_view = self.allocate_view();

            for dc in &mut stencil_list {
                dc.state = RenderState {
                    flags: StateFlags::DEPTH_WRITE | StateFlags::STENCIL_WRITE,
                    depth_test: Some(wgpu::CompareFunction::LessEqual),
                    blend: None,
                };
                self.device.submit(stencil_view, dc);
            }

            // (b) The nested scene through the portal camera.
            self.render_camera(
                portal.camera.position,
                portal.camera.rotation,
                fov,
                rect,
                area_mask,
                entities,
                VisibilityId::Portal,
                1,
                portal.is_mirror,
                Some(portal.pvs_position),
            );

            // (c) Restore the stencil.
            let restore_view = self.allocate_view();

            for dc in &mut stencil_list {
                dc.state = RenderState {
                    flags: StateFlags::STENCIL_CLEAR,
                    depth_test: None,
                    blend: None,
                };
                self.device.submit(restore_view, dc);
            }
        }

        // Water reflections: nested render with the mirrored camera.
        if self.cvars.water_reflections {
            let reflection_camera = {
                let world = self.world.as_mut().unwrap();
                world.calculate_reflection_camera(vis_id, position, &rotation, mvp)
            };

            if let Some((camera, _plane)) = reflection_camera {
                // The PVS position is the reflection of the camera origin.
                self.render_camera(
                    camera.position,
                    camera.rotation,
                    fov,
                    rect,
                    area_mask,
                    entities,
                    VisibilityId::Reflection,
                    1,
                    true,
                    Some(camera.position),
                );

                let world = self.world.as_ref().unwrap();
                world.render_reflective(
                    vis_id,
                    draw_list,
                    self.device.as_mut(),
                    &self.materials,
                );
            }
        }
    }

    // ========================================================================
    // Entity geometry
    // ========================================================================

    fn setup_entity_lighting(&mut self, entity: &mut RenderEntity, camera_position: Vec3) {
        // The view position in entity local space, for environment mapping
        // and the specular/portal alpha generators.
        let delta = camera_position - entity.position;
        entity.local_view_position = Vec3::new(
            delta.dot(entity.rotation.x_axis),
            delta.dot(entity.rotation.y_axis),
            delta.dot(entity.rotation.z_axis),
        );

        let sample_position = if entity.flags.contains(RenderEntityFlags::LIGHTING_POSITION) {
            entity.lighting_position
        } else {
            entity.position
        };

        let grid = self
            .world
            .as_ref()
            .filter(|world| world.has_light_grid())
            .map(|world| world.sample_light_grid(sample_position));

        if let Some((ambient, directed, direction)) = grid {
            entity.ambient_light = ambient;
            entity.directed_light = directed;
            entity.light_dir = direction;
        } else {
            let identity = self.identity_light * 150.0;
            entity.ambient_light = Vec3::splat(identity);
            entity.directed_light = Vec3::splat(identity);
            entity.light_dir = self.sun.direction;
        }

        // Dynamic light contributions.
        let (color, direction) = self
            .dynamic_lights
            .contribute(self.frame_no, sample_position);
        entity.ambient_light += color;

        if direction.length_squared() > 0.0 {
            entity.light_dir = (entity.light_dir + direction).normalize_or(entity.light_dir);
        }
    }

    fn entity_draw_call(
        &mut self,
        material_handle: i32,
        entity_index: Option<usize>,
        fog_index: i32,
        vertices: &[Vertex],
        indices: &[u16],
    ) -> Option<DrawCall> {
        let material = if material_handle > 0 && (material_handle as usize) < self.materials.len() {
            self.materials.resolve(MaterialIndex(material_handle as usize))
        } else {
            self.materials.default_material()
        };

        let handle = self.device.alloc_transient(vertices, indices).or_else(|| {
            warn_once_transient_buffer();
            None
        })?;

        let material_data = self.materials.material(material);
        let mut dc = DrawCall::new(
            material,
            VertexBufferRange::transient(handle, vertices.len() as u32),
            IndexBufferRange {
                source: IndexBufferSource::Transient(handle),
                first_index: 0,
                n_indices: indices.len() as u32,
            },
        );
        dc.entity = entity_index;
        dc.fog_index = fog_index;
        dc.material_sort = material_data.sort;
        dc.material_sorted_index = material_data.sorted_index;
        Some(dc)
    }

    /// A camera-facing quad of `radius`, optionally rotated by the sprite
    /// angle.
    fn render_sprite_entity(
        &mut self,
        entity: &RenderEntity,
        entity_index: usize,
        scene_rotation: &Mat3,
        draw_list: &mut DrawCallList,
    ) {
        let mut left = scene_rotation.y_axis * entity.radius;
        let mut up = scene_rotation.z_axis * entity.radius;

        if entity.angle != 0.0 {
            left = crate::math::rotated_around_direction(left, scene_rotation.x_axis, entity.angle);
            up = crate::math::rotated_around_direction(up, scene_rotation.x_axis, entity.angle);
        }

        if self.camera_mirrored {
            left = -left;
        }

        let origin = entity.position;
        let positions = [
            origin + left + up,
            origin - left + up,
            origin - left - up,
            origin + left - up,
        ];
        let tex_coords = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
        let normal = -scene_rotation.x_axis;

        let mut vertices = Vec::with_capacity(4);

        for i in 0..4 {
            let mut v = Vertex::default();
            v.set_pos(positions[i]);
            v.set_normal(normal);
            v.set_tex_coord(tex_coords[i].0, tex_coords[i].1, 0.0, 0.0);
            v.set_color(entity.material_color);
            vertices.push(v);
        }

        let indices = [0u16, 1, 3, 3, 1, 2];
        let fog_index = self
            .world
            .as_ref()
            .map_or(-1, |world| world.find_fog_index_sphere(origin, entity.radius));

        if let Some(mut dc) = self.entity_draw_call(
            entity.custom_material,
            Some(entity_index),
            fog_index,
            &vertices,
            &indices,
        ) {
            dc.soft_sprite_depth = entity.radius / 2.0;
            draw_list.push(dc);
        }
    }

    /// A camera-facing ribbon between the entity's old and new positions,
    /// used for beams, lightning bolts and the rail core.
    fn render_ribbon_entity(
        &mut self,
        entity: &RenderEntity,
        entity_index: usize,
        camera_position: Vec3,
        width: f32,
        draw_list: &mut DrawCallList,
    ) {
        let start = entity.old_position;
        let end = entity.position;
        let axis = end - start;

        if axis.length_squared() < 1e-6 {
            return;
        }

        // Perpendicular to both the segment and the view direction.
        let view = (start + end) * 0.5 - camera_position;
        let side = axis.cross(view).normalize_or(Vec3::Z) * (width * 0.5);

        let positions = [start + side, start - side, end - side, end + side];
        let length = axis.length() / 32.0;
        let tex_coords = [(0.0, 0.0), (0.0, 1.0), (length, 1.0), (length, 0.0)];

        let mut vertices = Vec::with_capacity(4);

        for i in 0..4 {
            let mut v = Vertex::default();
            v.set_pos(positions[i]);
            v.set_normal(view.normalize_or(Vec3::Z) * -1.0);
            v.set_tex_coord(tex_coords[i].0, tex_coords[i].1, 0.0, 0.0);
            v.set_color(entity.material_color);
            vertices.push(v);
        }

        let indices = [0u16, 1, 2, 0, 2, 3];
        let fog_index = self
            .world
            .as_ref()
            .map_or(-1, |world| world.find_fog_index_sphere(start, width));

        if let Some(dc) = self.entity_draw_call(
            entity.custom_material,
            Some(entity_index),
            fog_index,
            &vertices,
            &indices,
        ) {
            draw_list.push(dc);
        }
    }

    /// Camera-facing quads spaced along the rail segment.
    fn render_rail_rings_entity(
        &mut self,
        entity: &RenderEntity,
        entity_index: usize,
        camera_position: Vec3,
        draw_list: &mut DrawCallList,
    ) {
        let start = entity.old_position;
        let end = entity.position;
        let axis = end - start;
        let length = axis.length();

        if length < 1e-3 {
            return;
        }

        let segment_length = self.cvars.rail_segment_length.max(1.0);
        let n_segments = ((length / segment_length) as usize).max(1);
        let direction = axis / length;
        let radius = self.cvars.rail_width * 0.5;

        let view = (start + end) * 0.5 - camera_position;
        let left = direction.cross(view).normalize_or(Vec3::Z) * radius;
        let up = direction * radius;

        let mut vertices = Vec::with_capacity(n_segments * 4);
        let mut indices = Vec::with_capacity(n_segments * 6);
        let tex_coords = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];

        for segment in 0..n_segments {
            let origin = start + direction * (segment as f32 * segment_length);
            let base = vertices.len() as u16;
            let positions = [
                origin + left + up,
                origin - left + up,
                origin - left - up,
                origin + left - up,
            ];

            for i in 0..4 {
                let mut v = Vertex::default();
                v.set_pos(positions[i]);
                v.set_normal(-direction);
                v.set_tex_coord(tex_coords[i].0, tex_coords[i].1, 0.0, 0.0);
                v.set_color(entity.material_color);
                vertices.push(v);
            }

            indices.extend_from_slice(&[base, base + 1, base + 3, base + 3, base + 1, base + 2]);
        }

        let fog_index = self
            .world
            .as_ref()
            .map_or(-1, |world| world.find_fog_index_sphere(start, radius));

        if let Some(dc) = self.entity_draw_call(
            entity.custom_material,
            Some(entity_index),
            fog_index,
            &vertices,
            &indices,
        ) {
            draw_list.push(dc);
        }
    }

    fn render_polygons(&mut self, draw_list: &mut DrawCallList) {
        let polygons = std::mem::take(&mut self.scene_polygons);
        let poly_vertices = std::mem::take(&mut self.poly_vertices);

        for poly in &polygons {
            let first = poly.first_vertex as usize;
            let vertices = &poly_vertices[first..first + poly.n_vertices as usize];

            // Fan triangulation.
            let mut indices = Vec::with_capacity((poly.n_vertices as usize - 2) * 3);

            for i in 1..poly.n_vertices as usize - 1 {
                indices.extend_from_slice(&[0, i as u16, i as u16 + 1]);
            }

            if let Some(dc) =
                self.entity_draw_call(poly.material, None, poly.fog_index, vertices, &indices)
            {
                draw_list.push(dc);
            }
        }

        self.scene_polygons = polygons;
        self.poly_vertices = poly_vertices;
    }

    /// Build and submit the 2D overlay draw calls.
    fn flush_stretch_pics(&mut self) {
        if self.stretch_pics.is_empty() {
            return;
        }

        let pics = std::mem::take(&mut self.stretch_pics);
        let mut draw_list: DrawCallList = Vec::new();

        for pic in &pics {
            let mut vertices = Vec::with_capacity(4);
            let corners = [
                (pic.x, pic.y, pic.s1, pic.t1, pic.color),
                (pic.x + pic.w, pic.y, pic.s2, pic.t1, pic.color),
                (
                    pic.x + pic.w,
                    pic.y + pic.h,
                    pic.s2,
                    pic.t2,
                    pic.gradient.unwrap_or(pic.color),
                ),
                (
                    pic.x,
                    pic.y + pic.h,
                    pic.s1,
                    pic.t2,
                    pic.gradient.unwrap_or(pic.color),
                ),
            ];

            for (x, y, s, t, color) in corners {
                let mut v = Vertex::default();
                v.set_pos(Vec3::new(x, y, 0.0));
                v.set_tex_coord(s, t, 0.0, 0.0);
                v.set_color(color);
                vertices.push(v);
            }

            let indices = [0u16, 1, 2, 0, 2, 3];

            if let Some(mut dc) =
                self.entity_draw_call(pic.material, None, -1, &vertices, &indices)
            {
                dc.state.depth_test = None;
                draw_list.push(dc);
            }
        }

        // 2D draws keep submission order; view 0 is reserved for them.
        for dc in &draw_list {
            self.device.submit(ViewId(0), dc);
        }
    }

    /// Per-frame material evaluation environment.
    #[must_use]
    pub fn color_env(&self) -> crate::material::calculate::ColorEnv {
        crate::material::calculate::ColorEnv {
            identity_light: self.identity_light,
            overbright_factor: self.overbright_factor,
            hardware_gamma: false,
            white_texture: self.textures.white(),
        }
    }

    /// Evaluate one stage of a draw call's material: the uniform blocks and
    /// render state a backend binds before drawing that pass.
    ///
    /// `None` once `stage_index` reaches the material's pass count.
    #[must_use]
    pub fn evaluate_stage(
        &self,
        draw_call: &DrawCall,
        stage_index: usize,
    ) -> Option<StageRenderInput> {
        let material = self.materials.material(draw_call.material);

        if stage_index >= material.num_unfogged_passes {
            return None;
        }

        let entity = draw_call.entity.and_then(|i| self.scene_entities.get(i));
        let time = material.adjusted_time(self.float_time, entity);
        let stage = &material.stages[stage_index];
        let env = self.color_env();

        Some(StageRenderInput {
            state: stage.render_state(material, self.camera_mirrored),
            colors: material.stage_colors(stage_index, time, entity, &env),
            tex_gen: material.stage_tex_gen(stage_index, time, entity),
            alpha_test: stage.alpha_test,
            fog_color_mask: stage.fog_color_mask(),
            animation: material.stage_texture_animation(
                stage_index,
                time,
                self.cvars.lerp_texture_animation,
            ),
            deforms: material.deform_uniforms(),
        })
    }

    /// Whether texture animation lerp is enabled.
    #[must_use]
    pub fn lerp_texture_animation(&self) -> bool {
        self.cvars.lerp_texture_animation
    }

    /// The scene clock in seconds.
    #[must_use]
    pub fn float_time(&self) -> f32 {
        self.float_time
    }
}
