//! Material cache: shader text scanning, interning, remapping and skins.
//!
//! On initialization all `scripts/*.shader` files (preferring `.mtr`
//! variants) are validated, concatenated and compressed into a single text
//! buffer with a name → offset index. Materials are parsed lazily on first
//! lookup and interned by (name, lightmap index) for the engine's lifetime.

use log::{debug, info, warn};
use rustc_hash::FxHashMap;

use crate::interface::read_text_file;
use crate::material::parse::ParseContext;
use crate::material::{
    AlphaGen, ColorGen, Material, MaterialIndex, MaterialLightmapId, Reflective, MAX_NAME_LENGTH,
    MAX_STAGES,
};
use crate::parser::{self, Lexer};
use crate::texture::TextureFlags;

const MAX_SHADER_FILES: usize = 4096;

/// A model override entry from a .skin file (`md3_lower`, etc.).
#[derive(Debug, Clone, Default)]
pub struct SkinModel {
    pub model_type: String,
    pub name: String,
}

const MAX_SKIN_MODELS: usize = 5;

/// A parsed .skin file: surface name → material mappings plus model
/// overrides. Handle 0 is the default skin.
#[derive(Debug, Clone, Default)]
pub struct Skin {
    pub name: String,
    pub handle: i32,
    pub models: Vec<SkinModel>,
    /// Surface names are stored lowercased.
    surfaces: Vec<(String, MaterialIndex)>,
    pub scale: f32,
}

impl Skin {
    #[must_use]
    pub fn has_surfaces(&self) -> bool {
        !self.surfaces.is_empty()
    }

    /// Material for a (lowercased) model surface name. `None` falls back to
    /// the model's own material.
    #[must_use]
    pub fn find_material(&self, surface_name: &str) -> Option<MaterialIndex> {
        self.surfaces
            .iter()
            .find(|(name, _)| name == surface_name)
            .map(|(_, material)| *material)
    }

    /// Equipment model override by type, e.g. `md3_lower`.
    #[must_use]
    pub fn find_model_name(&self, model_type: &str) -> Option<&str> {
        self.models
            .iter()
            .find(|m| m.model_type.eq_ignore_ascii_case(model_type))
            .map(|m| m.name.as_str())
    }
}

/// Owns all materials and skins for the lifetime of the engine.
pub struct MaterialCache {
    materials: Vec<Material>,
    /// Canonical name → all materials interned under it (different lightmap
    /// indices).
    by_name: FxHashMap<String, Vec<MaterialIndex>>,
    /// Concatenated, compressed shader file text.
    shader_text: String,
    /// Canonical shader name → offset of its block in `shader_text`.
    text_offsets: FxHashMap<String, usize>,
    default_material: MaterialIndex,
    skins: Vec<Skin>,
}

impl MaterialCache {
    /// Initialize the cache: internal materials, shader file scan and the
    /// default skin.
    pub fn new(ctx: &mut ParseContext) -> MaterialCache {
        info!("Initializing Materials");

        let mut cache = MaterialCache {
            materials: Vec::new(),
            by_name: FxHashMap::default(),
            shader_text: String::new(),
            text_offsets: FxHashMap::default(),
            default_material: MaterialIndex(0),
            skins: Vec::new(),
        };

        // The default material: a single stage with the checker box texture.
        let mut default_material = Material::new("<default>");
        default_material.stages[0].bundles[0].textures[0] = Some(ctx.textures.default_texture());
        default_material.stages[0].active = true;
        cache.default_material = cache.create_material(default_material, ctx);

        cache.scan_and_load_shader_files(ctx);

        // The default skin.
        let default_material = cache.default_material;
        cache.skins.push(Skin {
            name: "<default skin>".to_string(),
            handle: 0,
            models: Vec::new(),
            surfaces: vec![(String::new(), default_material)],
            scale: 0.0,
        });

        cache
    }

    #[must_use]
    pub fn material(&self, index: MaterialIndex) -> &Material {
        &self.materials[index.0]
    }

    pub fn material_mut(&mut self, index: MaterialIndex) -> &mut Material {
        &mut self.materials[index.0]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.materials.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    #[must_use]
    pub fn default_material(&self) -> MaterialIndex {
        self.default_material
    }

    /// Follow a remap redirect. Remap depth is 1 by construction.
    #[must_use]
    pub fn resolve(&self, index: MaterialIndex) -> MaterialIndex {
        self.materials[index.0].remapped.unwrap_or(index)
    }

    /// Intern a parsed material: finalize it, assign indices and hash it.
    pub fn create_material(&mut self, mut material: Material, ctx: &mut ParseContext) -> MaterialIndex {
        material.finish(ctx.textures.white());
        let index = MaterialIndex(self.materials.len());
        material.index = index;
        material.sorted_index = index.0 as i32;
        let key = parser::canonical_name(&material.name);
        self.by_name.entry(key).or_default().push(index);
        self.materials.push(material);
        index
    }

    /// Find or create a material.
    ///
    /// An empty name returns the default material; a name at or above the
    /// length limit returns `None`. Missing definitions synthesize a
    /// material from an image file of the same basename, or fall back to the
    /// default material (interned under the name so the miss is not
    /// repeated).
    pub fn find_material(
        &mut self,
        name: &str,
        lightmap_index: i32,
        mip_raw_image: bool,
        ctx: &mut ParseContext,
    ) -> Option<MaterialIndex> {
        if name.is_empty() {
            return Some(self.default_material);
        }

        if name.len() >= MAX_NAME_LENGTH {
            return None;
        }

        let stripped = parser::canonical_name(name);

        // Already interned? A default material matches any lightmap index so
        // every lookup of a missing name doesn't create a new one.
        if let Some(indices) = self.by_name.get(&stripped) {
            for &index in indices {
                let m = &self.materials[index.0];

                if m.lightmap_index == lightmap_index || m.default_shader {
                    return Some(index);
                }
            }
        }

        let mut material = Material::new(&stripped);
        material.lightmap_index = lightmap_index;

        // Attempt to define the material from the shader text.
        if let Some(offset) = self.text_offsets.get(&stripped).copied() {
            let mut lexer = Lexer::at_offset(&self.shader_text, offset);

            if !material.parse(&mut lexer, ctx) {
                // Had errors, so use the default shading.
                material = self.default_stand_in(&stripped, lightmap_index, ctx);
            }

            return Some(self.create_material(material, ctx));
        }

        // Not defined in any shader file; look for a single image file.
        let flags = if mip_raw_image {
            TextureFlags::MIPMAP | TextureFlags::PICMIP
        } else {
            TextureFlags::CLAMP_TO_EDGE
        };

        let Some(texture) = ctx.textures.find(ctx.device, ctx.host, name, flags) else {
            debug!("couldn't find image file for material {name}");
            let stand_in = self.default_stand_in(&stripped, lightmap_index, ctx);
            return Some(self.create_material(stand_in, ctx));
        };

        // Synthesize the default shading by lightmap index.
        use wgpu::BlendFactor as BF;

        if lightmap_index == MaterialLightmapId::NONE {
            // Dynamic colors at vertexes.
            material.stages[0].bundles[0].textures[0] = Some(texture);
            material.stages[0].active = true;
            material.stages[0].rgb_gen = ColorGen::LightingDiffuse;
        } else if lightmap_index == MaterialLightmapId::VERTEX {
            // Explicit colors at vertexes.
            material.stages[0].bundles[0].textures[0] = Some(texture);
            material.stages[0].active = true;
            material.stages[0].rgb_gen = ColorGen::ExactVertex;
            material.stages[0].alpha_gen = AlphaGen::Skip;
        } else if lightmap_index == MaterialLightmapId::STRETCH_PIC {
            // GUI elements.
            material.stages[0].bundles[0].textures[0] = Some(texture);
            material.stages[0].active = true;
            material.stages[0].rgb_gen = ColorGen::Vertex;
            material.stages[0].alpha_gen = AlphaGen::Vertex;
            material.stages[0].blend = Some((BF::SrcAlpha, BF::OneMinusSrcAlpha));
        } else if lightmap_index == MaterialLightmapId::WHITE {
            // Fullbright level.
            material.stages[0].bundles[0].textures[0] = Some(ctx.textures.white());
            material.stages[0].active = true;
            material.stages[0].rgb_gen = ColorGen::IdentityLighting;

            material.stages[1].bundles[0].textures[0] = Some(texture);
            material.stages[1].active = true;
            material.stages[1].rgb_gen = ColorGen::Identity;
            material.stages[1].blend = Some((BF::Dst, BF::Zero));
        } else {
            // Two pass lightmap. Lightmaps are scaled on creation for
            // identity light, so rgbGen identity is correct.
            let lightmap = ctx
                .lightmaps
                .get(lightmap_index as usize)
                .copied()
                .unwrap_or_else(|| ctx.textures.white());
            material.stages[0].bundles[0].textures[0] = Some(lightmap);
            material.stages[0].bundles[0].is_lightmap = true;
            material.stages[0].active = true;
            material.stages[0].rgb_gen = ColorGen::Identity;

            material.stages[1].bundles[0].textures[0] = Some(texture);
            material.stages[1].active = true;
            material.stages[1].rgb_gen = ColorGen::Identity;
            material.stages[1].blend = Some((BF::Dst, BF::Zero));
        }

        Some(self.create_material(material, ctx))
    }

    /// A stand-in for a failed lookup: the default checker-box shading under
    /// the requested name, flagged so handle lookups report the miss without
    /// retrying it.
    fn default_stand_in(&self, name: &str, lightmap_index: i32, ctx: &ParseContext) -> Material {
        let mut material = Material::new(name);
        material.lightmap_index = lightmap_index;
        material.default_shader = true;
        material.stages[0].bundles[0].textures[0] = Some(ctx.textures.default_texture());
        material.stages[0].active = true;
        material
    }

    /// Redirect every material named `old_name` to the material named
    /// `new_name`. A self-remap clears the redirect. When `offset_time` is
    /// supplied the target's time offset is replaced.
    pub fn remap_material(
        &mut self,
        old_name: &str,
        new_name: &str,
        offset_time: Option<&str>,
        ctx: &mut ParseContext,
    ) {
        let mut resolved = [None; 2];

        for (i, name) in [old_name, new_name].iter().enumerate() {
            let mut material = self.find_material(name, MaterialLightmapId::STRETCH_PIC, true, ctx);

            if material.is_none() || material == Some(self.default_material) {
                material = self.find_material(name, 0, true, ctx);

                if material.is_some_and(|m| self.materials[m.0].default_shader) {
                    material = Some(self.default_material);
                }
            }

            if material.is_none() || material == Some(self.default_material) {
                warn!(
                    "remap material: {} material {name} not found",
                    if i == 0 { "old" } else { "new" }
                );
                return;
            }

            resolved[i] = material;
        }

        let target = resolved[1].unwrap();

        // Remap all materials with the old name, even though they might have
        // different lightmaps.
        let stripped = parser::canonical_name(old_name);
        let indices = self.by_name.get(&stripped).cloned().unwrap_or_default();

        for index in indices {
            // A remapped material must never point at itself.
            self.materials[index.0].remapped = if index == target { None } else { Some(target) };
        }

        if let Some(offset_time) = offset_time {
            self.materials[target.0].time_offset = offset_time.parse().unwrap_or(0.0);
        }
    }

    /// Mark a material as the back side of a reflection pair. A front-side
    /// clone is created and linked; reflective surfaces swap to it when a
    /// reflection is visible.
    pub fn mark_reflective(&mut self, name: &str, ctx: &mut ParseContext) -> Option<MaterialIndex> {
        let back = self.find_material(name, MaterialLightmapId::NONE, true, ctx)?;

        if self.materials[back.0].reflective == Reflective::BackSide {
            return Some(back);
        }

        let mut front = self.materials[back.0].clone();
        front.reflective = Reflective::FrontSide;
        let front_index = self.create_material(front, ctx);

        let back_material = &mut self.materials[back.0];
        back_material.reflective = Reflective::BackSide;
        back_material.reflective_front_side_material = Some(front_index);
        Some(back)
    }

    /// Log every material with its stage count, like the `printMaterials`
    /// console command.
    pub fn print_materials(&self) {
        let mut stage_counts = [0usize; MAX_STAGES + 1];

        for (i, material) in self.materials.iter().enumerate() {
            let animated = material
                .active_stages()
                .any(|s| s.bundles[0].n_image_animations > 1);
            info!(
                "{i:4}: [{}] {}",
                if animated { 'a' } else { ' ' },
                material.name
            );
            stage_counts[material.num_unfogged_passes.min(MAX_STAGES)] += 1;
        }

        for (i, count) in stage_counts.iter().enumerate().skip(1) {
            if *count > 0 {
                info!("{count} materials with {i} stage(s)");
            }
        }
    }

    // ========================================================================
    // Shader file scanning
    // ========================================================================

    /// Find and load all .shader files, combining them into one large text
    /// block that can be scanned for shader names.
    fn scan_and_load_shader_files(&mut self, ctx: &mut ParseContext) {
        let mut shader_files = ctx.host.list_files("scripts", ".shader");

        if shader_files.is_empty() {
            warn!("no shader files found");
            return;
        }

        if shader_files.len() > MAX_SHADER_FILES {
            warn!("more than {MAX_SHADER_FILES} shader files, skipping the rest");
            shader_files.truncate(MAX_SHADER_FILES);
        }

        let mut buffers: Vec<String> = Vec::with_capacity(shader_files.len());

        for file in &shader_files {
            // Look for an .mtr variant first.
            let base = parser::strip_extension(file);
            let mut filename = format!("scripts/{base}.mtr");

            if !ctx.host.file_exists(&filename) {
                filename = format!("scripts/{file}");
            }

            debug!("...loading '{filename}'");

            let Some(mut text) = read_text_file(ctx.host, &filename) else {
                warn!("couldn't load {filename}");
                buffers.push(String::new());
                continue;
            };

            // A simple structural check so one bad shader file can't poison
            // the others: every name must be followed by a balanced block.
            let mut truncate_at = None;
            let mut lexer = Lexer::new(&text);

            loop {
                let block_start = lexer.offset();
                let token = lexer.next();

                if token.is_empty() {
                    break;
                }

                let shader_name = token.to_string();
                let shader_line = lexer.line();
                let token = lexer.next();

                if token != "{" {
                    warn!(
                        "shader file {filename}: shader \"{shader_name}\" on line {shader_line} \
                         missing opening brace. Ignoring rest of shader file."
                    );
                    truncate_at = Some(block_start);
                    break;
                }

                if !lexer.skip_braced_section(1) {
                    warn!(
                        "shader file {filename}: shader \"{shader_name}\" on line {shader_line} \
                         missing closing brace. Ignoring rest of shader file."
                    );
                    truncate_at = Some(block_start);
                    break;
                }
            }

            if let Some(at) = truncate_at {
                text.truncate(at);
            }

            buffers.push(text);
        }

        // Build a single large buffer. Later files are prepended so they take
        // precedence on duplicate names.
        let mut combined = String::new();

        for buffer in buffers.iter().rev() {
            combined.push_str(buffer);
            combined.push('\n');
        }

        self.shader_text = parser::compress(&combined);

        // Index every shader name's text offset. The first occurrence wins.
        let mut lexer = Lexer::new(&self.shader_text);

        loop {
            let token = lexer.next();

            if token.is_empty() {
                break;
            }

            let key = parser::canonical_name(token);
            let offset = lexer.offset();
            self.text_offsets.entry(key).or_insert(offset);
            lexer.skip_braced_section(0);
        }
    }

    // ========================================================================
    // Skins
    // ========================================================================

    /// Find or load a skin. `None` means use the default skin.
    pub fn find_skin(&mut self, name: &str, ctx: &mut ParseContext) -> Option<i32> {
        if name.is_empty() {
            debug!("empty skin name");
            return None;
        }

        if name.len() >= MAX_NAME_LENGTH {
            debug!("skin name exceeds maximum length");
            return None;
        }

        // See if the skin is already loaded.
        for skin in &self.skins {
            if skin.name.eq_ignore_ascii_case(name) {
                if !skin.has_surfaces() {
                    return None;
                }

                return Some(skin.handle);
            }
        }

        let handle = self.skins.len() as i32;
        let skin = self.load_skin(name, handle, ctx);

        // Never let a skin have zero surfaces.
        if !skin.has_surfaces() {
            return None;
        }

        self.skins.push(skin);
        Some(handle)
    }

    /// Skins by handle; handle 0 (the default skin) is never returned.
    #[must_use]
    pub fn skin(&self, handle: i32) -> Option<&Skin> {
        if handle < 1 {
            return None;
        }

        self.skins.get(handle as usize)
    }

    fn load_skin(&mut self, name: &str, handle: i32, ctx: &mut ParseContext) -> Skin {
        let mut skin = Skin {
            name: name.to_string(),
            handle,
            ..Skin::default()
        };

        // If not a .skin file, load as a single material.
        if !name.to_ascii_lowercase().ends_with(".skin") {
            let material = self
                .find_material(name, MaterialLightmapId::NONE, true, ctx)
                .unwrap_or(self.default_material);
            skin.surfaces.push((String::new(), material));
            return skin;
        }

        let Some(text) = read_text_file(ctx.host, name) else {
            return skin;
        };

        let mut lexer = Lexer::new(&text);

        loop {
            // Surface name.
            let token = lexer.next_comma_separated();

            if token.is_empty() {
                break;
            }

            if token.contains("tag_") {
                continue;
            }

            if token.contains("md3_") {
                // This entry specifies an equipment model.
                let model_type = token.to_string();
                let model_name = lexer.next_comma_separated().to_string();

                if skin.models.len() >= MAX_SKIN_MODELS {
                    warn!("ignoring models in '{name}', the max is {MAX_SKIN_MODELS}!");
                    break;
                }

                skin.models.push(SkinModel {
                    model_type,
                    name: model_name,
                });
                continue;
            }

            if token.contains("playerscale") {
                skin.scale = lexer.next_comma_separated().parse().unwrap_or(0.0);
                continue;
            }

            // Got this far, it's a surface.
            let surface_name = token.to_ascii_lowercase();
            let material_name = lexer.next_comma_separated().to_string();
            let material = self
                .find_material(&material_name, MaterialLightmapId::NONE, true, ctx)
                .unwrap_or(self.default_material);
            skin.surfaces.push((surface_name, material));
        }

        skin
    }
}
