//! Handle-based GPU abstraction.
//!
//! The core owns no device, shaders or pipelines. It creates buffers and
//! textures through [`GraphicsDevice`] and emits sorted [`DrawCall`]s against
//! opaque handles; the backend decides what they mean. Descriptor types use
//! `wgpu` vocabulary so a wgpu-based backend maps 1:1.
//!
//! [`NullDevice`] is a recording backend used by the test suite.

use crate::draw::DrawCall;
use crate::vertex::Vertex;

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u16);

        impl $name {
            pub const INVALID: $name = $name(u16::MAX);

            #[must_use]
            pub fn is_valid(self) -> bool {
                self.0 != u16::MAX
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::INVALID
            }
        }
    };
}

handle_type!(
    /// A GPU texture.
    TextureHandle
);
handle_type!(
    /// A static vertex buffer.
    VertexBufferHandle
);
handle_type!(
    /// A static index buffer.
    IndexBufferHandle
);
handle_type!(
    /// An index buffer updated at runtime.
    DynamicIndexBufferHandle
);
handle_type!(
    /// A one-frame-lifetime vertex+index allocation.
    TransientHandle
);

/// Draw submission target. Nested (portal/reflection) scenes use their own
/// views so the backend can order them before the parent scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(pub u16);

/// Texture creation parameters.
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
    pub format: wgpu::TextureFormat,
    /// Clamp sampling to the texture edge instead of repeating.
    pub clamp_to_edge: bool,
    /// The texture will be updated after creation.
    pub mutable: bool,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        TextureDescriptor {
            label: String::new(),
            width: 0,
            height: 0,
            mip_count: 1,
            format: wgpu::TextureFormat::Rgba8Unorm,
            clamp_to_edge: false,
            mutable: false,
        }
    }
}

/// The backend contract.
///
/// Transient allocations live until [`GraphicsDevice::frame`] and may fail
/// when the per-frame budget is exhausted; callers drop the draw call and
/// warn once.
pub trait GraphicsDevice {
    fn create_texture(&mut self, desc: &TextureDescriptor, data: Option<Vec<u8>>) -> TextureHandle;

    /// Update a region of a mutable texture.
    fn update_texture(
        &mut self,
        handle: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
    );

    fn create_vertex_buffer(&mut self, vertices: &[Vertex]) -> VertexBufferHandle;

    fn create_index_buffer(&mut self, indices: &[u16]) -> IndexBufferHandle;

    fn create_dynamic_index_buffer(&mut self, indices: &[u16]) -> DynamicIndexBufferHandle;

    fn update_dynamic_index_buffer(&mut self, handle: DynamicIndexBufferHandle, indices: &[u16]);

    /// Allocate one-frame geometry. `None` when the transient budget is full.
    fn alloc_transient(&mut self, vertices: &[Vertex], indices: &[u16])
        -> Option<TransientHandle>;

    fn submit(&mut self, view: ViewId, draw_call: &DrawCall);

    /// End the frame: transient allocations are released.
    fn frame(&mut self);
}

// ============================================================================
// Null backend
// ============================================================================

/// Transient geometry retained by [`NullDevice`] for inspection.
#[derive(Debug, Clone, Default)]
pub struct TransientGeometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
}

/// A backend that allocates handles and records submissions without a GPU.
#[derive(Default)]
pub struct NullDevice {
    pub textures: Vec<TextureDescriptor>,
    pub vertex_buffers: Vec<usize>,
    pub index_buffers: Vec<usize>,
    pub dynamic_index_buffers: Vec<Vec<u16>>,
    pub transients: Vec<TransientGeometry>,
    pub submissions: Vec<(ViewId, DrawCall)>,
    /// When set, transient allocation fails after this many allocations.
    pub transient_budget: Option<usize>,
}

impl NullDevice {
    #[must_use]
    pub fn new() -> NullDevice {
        NullDevice::default()
    }
}

impl GraphicsDevice for NullDevice {
    fn create_texture(&mut self, desc: &TextureDescriptor, _data: Option<Vec<u8>>) -> TextureHandle {
        self.textures.push(desc.clone());
        TextureHandle((self.textures.len() - 1) as u16)
    }

    fn update_texture(
        &mut self,
        _handle: TextureHandle,
        _x: u32,
        _y: u32,
        _width: u32,
        _height: u32,
        _data: &[u8],
    ) {
    }

    fn create_vertex_buffer(&mut self, vertices: &[Vertex]) -> VertexBufferHandle {
        self.vertex_buffers.push(vertices.len());
        VertexBufferHandle((self.vertex_buffers.len() - 1) as u16)
    }

    fn create_index_buffer(&mut self, indices: &[u16]) -> IndexBufferHandle {
        self.index_buffers.push(indices.len());
        IndexBufferHandle((self.index_buffers.len() - 1) as u16)
    }

    fn create_dynamic_index_buffer(&mut self, indices: &[u16]) -> DynamicIndexBufferHandle {
        self.dynamic_index_buffers.push(indices.to_vec());
        DynamicIndexBufferHandle((self.dynamic_index_buffers.len() - 1) as u16)
    }

    fn update_dynamic_index_buffer(&mut self, handle: DynamicIndexBufferHandle, indices: &[u16]) {
        if let Some(buffer) = self.dynamic_index_buffers.get_mut(handle.0 as usize) {
            *buffer = indices.to_vec();
        }
    }

    fn alloc_transient(
        &mut self,
        vertices: &[Vertex],
        indices: &[u16],
    ) -> Option<TransientHandle> {
        if let Some(budget) = self.transient_budget {
            if self.transients.len() >= budget {
                return None;
            }
        }

        self.transients.push(TransientGeometry {
            vertices: vertices.to_vec(),
            indices: indices.to_vec(),
        });
        Some(TransientHandle((self.transients.len() - 1) as u16))
    }

    fn submit(&mut self, view: ViewId, draw_call: &DrawCall) {
        self.submissions.push((view, draw_call.clone()));
    }

    fn frame(&mut self) {
        self.transients.clear();
        self.submissions.clear();
    }
}
