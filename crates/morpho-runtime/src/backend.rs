//! The GPU seam.
//!
//! Everything the engine asks of the GPU goes through [`GpuBackend`]. Calls are expected to be
//! *submitted*, not completed: completion is only ever observed through fences.

use std::time::Duration;

use morpho_core::{EngineError, Extent, FenceToken, TextureFormat};

use crate::projection::Ortho;

/// Backend texture name (for GL: the texture object id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// One layer of a texture. Plain 2D textures only have layer 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layer {
    pub tex: TextureId,
    pub layer: u32,
}

impl Layer {
    pub fn base(tex: TextureId) -> Self {
        Self { tex, layer: 0 }
    }

    pub fn of(tex: TextureId, layer: u32) -> Self {
        Self { tex, layer }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Signaled,
    /// The driver refused the wait. Treated as "nothing left to wait for".
    Failed,
}

/// GPU operations required by the texture pool, executor and capture pipeline.
///
/// All textures are immutable-storage, single mip level, nearest-filtered and clamped to edge.
pub trait GpuBackend {
    /// Largest depth a 2D-array texture may have.
    fn max_array_layers(&self) -> u32;

    /// Largest number of inputs the blend program can weigh in one pass.
    fn max_blend_layers(&self) -> u32 {
        self.max_array_layers()
    }

    fn create_texture(
        &mut self,
        extent: Extent,
        format: TextureFormat,
    ) -> Result<TextureId, EngineError>;

    fn create_array_texture(
        &mut self,
        extent: Extent,
        format: TextureFormat,
        layers: u32,
    ) -> Result<TextureId, EngineError>;

    fn delete_texture(&mut self, tex: TextureId);

    /// Clear the first `layers` layers of `tex` to opaque black.
    fn clear(&mut self, tex: TextureId, layers: u32);

    /// Clear a single layer to opaque black.
    fn clear_layer(&mut self, layer: Layer);

    /// Fill layer 0 of `tex` with a solid colour.
    fn fill(&mut self, tex: TextureId, rgba: [f32; 4]);

    /// Verbatim texel copy between equally sized layers.
    fn copy(&mut self, src: Layer, dst: Layer, extent: Extent);

    /// Framebuffer blit of layer 0, scaling and converting format as needed.
    fn blit(
        &mut self,
        src: TextureId,
        src_extent: Extent,
        dst: TextureId,
        dst_extent: Extent,
        filter: Filter,
    );

    /// Upload tightly packed RGBA8 texels into layer 0.
    fn upload_rgba8(&mut self, tex: TextureId, extent: Extent, pixels: &[u8]);

    /// Render `sum(weights[i] * layers[i])` into `dst`. `weights.len()` never exceeds the
    /// array depth.
    fn blend_layers(&mut self, layers: TextureId, weights: &[f32], dst: TextureId, extent: Extent);

    /// New projection after a migration. Backends with their own programs (blender) update them.
    fn set_projection(&mut self, _ortho: &Ortho) {}

    /// Mark "all GPU work submitted so far".
    fn insert_fence(&mut self) -> Result<FenceToken, EngineError>;

    /// Wait at most `timeout` for `fence`.
    fn poll_fence(&mut self, fence: FenceToken, timeout: Duration) -> FenceStatus;

    fn delete_fence(&mut self, fence: FenceToken);

    /// (Re)allocate the CPU readback staging buffer.
    fn resize_staging(&mut self, bytes: usize) -> Result<(), EngineError>;

    /// Enqueue an asynchronous RGBA8 transfer of layer 0 of `src` into the staging buffer.
    fn read_to_staging(&mut self, src: TextureId, extent: Extent);

    /// Map the staging buffer and copy it into `dst`. Returns `false` if the map was refused.
    fn map_staging(&mut self, dst: &mut [u8]) -> bool;
}
