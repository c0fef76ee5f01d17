#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::too_many_lines)]

mod bytes;

pub mod draw;
pub mod dynamic_light;
pub mod engine;
pub mod errors;
pub mod gpu;
pub mod interface;
pub mod material;
pub mod math;
pub mod model;
pub mod parser;
pub mod scene;
pub mod texture;
pub mod vertex;
pub mod world;

pub use draw::{DrawCall, DrawCallFlags, DrawCallList};
pub use dynamic_light::{DynamicLight, DynamicLightManager, LightType};
pub use engine::Engine;
pub use errors::{ErrorSeverity, Result, StrafeError};
pub use gpu::{GraphicsDevice, NullDevice};
pub use interface::{GlConfig, Host};
pub use material::{Material, MaterialCache, MaterialLightmapId};
pub use math::{Bounds, Frustum, Plane, Transform};
pub use model::{Model, ModelCache};
pub use scene::{MarkFragment, RenderEntity, SceneDefinition};
pub use texture::{Texture, TextureCache, TextureFlags};
pub use vertex::Vertex;
pub use world::World;
