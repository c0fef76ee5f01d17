//! Model cache and the polymorphic model surface.
//!
//! Models are a tagged variant over MD3/MDC triangle models, MDS skeletal
//! models and world brush models, with a shared capability surface: bounds,
//! frustum culling, material lookup, tag interpolation and draw-call
//! emission.

pub mod md3;
pub mod mds;

use glam::Mat3;
use log::warn;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::draw::DrawCallList;
use crate::gpu::GraphicsDevice;
use crate::material::parse::ParseContext;
use crate::material::MaterialCache;
use crate::math::{Bounds, Frustum, Transform};
use crate::parser;
use crate::scene::RenderEntity;
use crate::world::World;

/// Maximum length of a model name.
pub const MAX_NAME_LENGTH: usize = 64;

/// Everything model rendering needs from the rest of the engine.
pub struct ModelRenderContext<'a> {
    pub device: &'a mut dyn GraphicsDevice,
    pub materials: &'a MaterialCache,
    pub world: Option<&'a World>,
    pub scene_rotation: Mat3,
    pub camera_mirrored: bool,
    /// Index of the entity being rendered in the frame entity list.
    pub entity_index: usize,
}

/// A loaded model.
pub enum Model {
    Md3(md3::Md3Model),
    Mds(mds::MdsModel),
    /// An inline world brush model (`*1..*N`): index into the world's model
    /// definitions.
    Brush(usize),
}

impl Model {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Model::Md3(m) => &m.name,
            Model::Mds(m) => &m.name,
            Model::Brush(_) => "*brush",
        }
    }

    #[must_use]
    pub fn bounds(&self, world: Option<&World>) -> Bounds {
        match self {
            Model::Md3(m) => m.bounds(),
            Model::Mds(m) => m.bounds(),
            Model::Brush(index) => world.map_or_else(Bounds::default, |w| w.model_bounds(*index)),
        }
    }

    #[must_use]
    pub fn is_culled(
        &self,
        entity: &RenderEntity,
        frustum: &Frustum,
        world: Option<&World>,
    ) -> bool {
        match self {
            Model::Md3(m) => m.is_culled(entity, frustum),
            Model::Mds(m) => m.is_culled(entity, frustum),
            Model::Brush(index) => {
                let Some(world) = world else {
                    return true;
                };
                let matrix = crate::math::model_matrix(entity.rotation, entity.position);
                frustum.clip_bounds(world.model_bounds(*index), &matrix)
                    == crate::math::ClipResult::Outside
            }
        }
    }

    /// Interpolated tag transform between the entity's old and new frames.
    /// Returns the tag index, or `None` when the tag doesn't exist.
    #[must_use]
    pub fn lerp_tag(
        &self,
        name: &str,
        entity: &RenderEntity,
        start_index: usize,
    ) -> Option<(usize, Transform)> {
        match self {
            Model::Md3(m) => m.lerp_tag(name, entity, start_index),
            Model::Mds(m) => m.lerp_tag(name, entity, start_index),
            Model::Brush(_) => None,
        }
    }

    pub fn render(
        &self,
        ctx: &mut ModelRenderContext,
        draw_list: &mut DrawCallList,
        entity: &RenderEntity,
    ) {
        match self {
            Model::Md3(m) => m.render(ctx, draw_list, entity),
            Model::Mds(m) => m.render(ctx, draw_list, entity),
            Model::Brush(index) => {
                if let Some(world) = ctx.world {
                    world.render_brush_model(*index, ctx, draw_list, entity);
                }
            }
        }
    }
}

/// Owns every loaded model. Handle 0 is reserved for "missing model /
/// debug axis"; real handles start at 1.
#[derive(Default)]
pub struct ModelCache {
    models: Vec<Model>,
    by_name: FxHashMap<String, i32>,
    /// Names that already failed a load attempt.
    failed: FxHashSet<String>,
}

impl ModelCache {
    #[must_use]
    pub fn new() -> ModelCache {
        ModelCache::default()
    }

    /// Find or load a model by name. Returns the handle, 0 on failure.
    ///
    /// A load is attempted at most once per name: subsequent lookups of a
    /// failed name return 0 without touching the filesystem.
    pub fn find_model(
        &mut self,
        name: &str,
        materials: &mut MaterialCache,
        ctx: &mut ParseContext,
    ) -> i32 {
        if name.is_empty() {
            warn!("find_model: empty name");
            return 0;
        }

        if name.len() >= MAX_NAME_LENGTH {
            warn!("model name exceeds maximum length");
            return 0;
        }

        let key = parser::canonical_name(name);

        if let Some(&handle) = self.by_name.get(&key) {
            return handle;
        }

        if self.failed.contains(&key) {
            return 0;
        }

        let extension = parser::extension(name);

        let model = if extension.eq_ignore_ascii_case("mds") {
            mds::MdsModel::load(name, materials, ctx).map(Model::Mds)
        } else if extension.eq_ignore_ascii_case("mdc") {
            md3::Md3Model::load(name, true, materials, ctx).map(Model::Md3)
        } else {
            md3::Md3Model::load(name, false, materials, ctx).map(Model::Md3)
        };

        match model {
            Some(model) => self.add_model(model, &key),
            None => {
                self.failed.insert(key);
                0
            }
        }
    }

    /// Register an already-built model (world brush models).
    pub fn add_model(&mut self, model: Model, name: &str) -> i32 {
        self.models.push(model);
        let handle = self.models.len() as i32;
        self.by_name.insert(name.to_string(), handle);
        handle
    }

    /// The model for a handle. Handle 0 and out-of-range handles are `None`.
    #[must_use]
    pub fn model(&self, handle: i32) -> Option<&Model> {
        if handle < 1 {
            return None;
        }

        self.models.get(handle as usize - 1)
    }

    /// Remove the brush models of an unloaded world.
    pub fn remove_brush_models(&mut self) {
        let mut keep = Vec::new();
        let mut by_name = FxHashMap::default();

        for model in self.models.drain(..) {
            if matches!(model, Model::Brush(_)) {
                continue;
            }

            keep.push(model);
        }

        for (i, model) in keep.iter().enumerate() {
            by_name.insert(parser::canonical_name(model.name()), (i + 1) as i32);
        }

        self.models = keep;
        self.by_name = by_name;
    }
}
