//! Operations and seeds: what the executor runs.
//!
//! The engine never looks inside a transform. It resolves textures, hands them over as a
//! [`PassTargets`], and trusts the transform to write `output`.

use std::fmt;

use image::RgbaImage;
use morpho_core::{DeviceId, EngineError, Extent, OpId, SeedId};

use crate::backend::{GpuBackend, Layer, TextureId};
use crate::pool::{TexHandle, TexturePool};
use crate::projection::Ortho;
use crate::video::{letterbox, VideoInputs};

/// Physical textures bound for one render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassTargets {
    /// The single resolved input (blend buffer when blending, else the first input).
    pub input: Option<TextureId>,
    /// Feedback array and its depth, layer 0 newest.
    pub history: Option<(TextureId, u32)>,
    pub output: TextureId,
    pub extent: Extent,
    pub iteration: u64,
}

/// The per-operation GPU program, opaque to the engine.
pub trait Transform<B: ?Sized> {
    /// Draw a full-viewport pass writing `pass.output`.
    fn render(&mut self, gpu: &mut B, pass: &PassTargets) -> Result<(), EngineError>;

    /// Called at init and after every migration.
    fn adjust_projection(&mut self, _gpu: &mut B, _ortho: &Ortho) {}

    /// `false` while the program is not linked; the operation is then skipped.
    fn is_ready(&self) -> bool {
        true
    }

    /// Release backend objects. Called once when the operation is removed.
    fn release(&mut self, _gpu: &mut B) {}

    fn name(&self) -> &str {
        "transform"
    }
}

/// Everything needed to register an operation.
pub struct OperationSpec<B: ?Sized> {
    pub id: OpId,
    /// Ring-buffer depth; 0 disables feedback.
    pub feedback_depth: u32,
    /// Allocate a blend buffer and start with blending enabled.
    pub blend: bool,
    /// Copy the output into a second buffer before every render (self-read double buffering).
    pub blit: bool,
    pub transform: Box<dyn Transform<B>>,
}

impl<B: ?Sized> OperationSpec<B> {
    pub fn new(id: OpId, transform: impl Transform<B> + 'static) -> Self {
        Self {
            id,
            feedback_depth: 0,
            blend: false,
            blit: false,
            transform: Box::new(transform),
        }
    }

    pub fn with_feedback(mut self, depth: u32) -> Self {
        self.feedback_depth = depth;
        self
    }

    pub fn with_blend(mut self) -> Self {
        self.blend = true;
        self
    }

    pub fn with_blit(mut self) -> Self {
        self.blit = true;
        self
    }
}

impl<B: ?Sized> fmt::Debug for OperationSpec<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSpec")
            .field("id", &self.id)
            .field("feedback_depth", &self.feedback_depth)
            .field("blend", &self.blend)
            .field("blit", &self.blit)
            .field("transform", &self.transform.name())
            .finish()
    }
}

/// A registered operation and the pool textures it owns.
pub struct Operation<B: ?Sized> {
    id: OpId,
    output: TexHandle,
    blit_buffer: Option<TexHandle>,
    blend_buffer: Option<TexHandle>,
    history: Option<(TexHandle, u32)>,
    pub(crate) inputs: Vec<TexHandle>,
    pub(crate) blend_enabled: bool,
    pub(crate) blend_weights: Vec<f32>,
    pub(crate) warned_truncation: bool,
    pub(crate) skipped: bool,
    pub(crate) transform: Box<dyn Transform<B>>,
}

impl<B: ?Sized> fmt::Debug for Operation<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("output", &self.output)
            .field("inputs", &self.inputs)
            .field("history", &self.history)
            .field("blend_enabled", &self.blend_enabled)
            .field("transform", &self.transform.name())
            .finish_non_exhaustive()
    }
}

impl<B: GpuBackend + ?Sized> Operation<B> {
    /// Allocate every texture `spec` asks for. Nothing is leaked if an allocation fails.
    pub(crate) fn allocate(
        spec: OperationSpec<B>,
        gpu: &mut B,
        pool: &mut TexturePool,
    ) -> Result<Self, EngineError> {
        let mut owned: Vec<TexHandle> = Vec::new();
        let result = alloc_textures(&spec, gpu, pool, &mut owned);
        match result {
            Ok(t) => Ok(Self {
                id: spec.id,
                output: t.output,
                blit_buffer: t.blit_buffer,
                blend_buffer: t.blend_buffer,
                history: t.history,
                inputs: Vec::new(),
                blend_enabled: spec.blend,
                blend_weights: Vec::new(),
                warned_truncation: false,
                skipped: false,
                transform: spec.transform,
            }),
            Err(e) => {
                for h in owned {
                    pool.free(gpu, h);
                }
                Err(e)
            }
        }
    }

    pub(crate) fn release(mut self, gpu: &mut B, pool: &mut TexturePool) {
        self.transform.release(gpu);
        for h in self.owned_textures() {
            pool.free(gpu, h);
        }
    }
}

struct OpTextures {
    output: TexHandle,
    blit_buffer: Option<TexHandle>,
    blend_buffer: Option<TexHandle>,
    history: Option<(TexHandle, u32)>,
}

fn alloc_textures<B: GpuBackend + ?Sized>(
    spec: &OperationSpec<B>,
    gpu: &mut B,
    pool: &mut TexturePool,
    owned: &mut Vec<TexHandle>,
) -> Result<OpTextures, EngineError> {
    let mut image = |gpu: &mut B, pool: &mut TexturePool| -> Result<TexHandle, EngineError> {
        let h = pool.alloc_image(gpu)?;
        owned.push(h);
        Ok(h)
    };
    let output = image(gpu, pool)?;
    let blit_buffer = if spec.blit {
        Some(image(gpu, pool)?)
    } else {
        None
    };
    let blend_buffer = if spec.blend {
        Some(image(gpu, pool)?)
    } else {
        None
    };
    let history = if spec.feedback_depth > 0 {
        let h = pool.alloc_history(gpu, spec.feedback_depth)?;
        owned.push(h);
        Some((h, spec.feedback_depth))
    } else {
        None
    };
    Ok(OpTextures {
        output,
        blit_buffer,
        blend_buffer,
        history,
    })
}

impl<B: ?Sized> Operation<B> {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn output(&self) -> TexHandle {
        self.output
    }

    /// Second buffer holding the previous output when blit is enabled.
    pub fn blit_buffer(&self) -> Option<TexHandle> {
        self.blit_buffer
    }

    pub fn blend_buffer(&self) -> Option<TexHandle> {
        self.blend_buffer
    }

    pub fn history(&self) -> Option<(TexHandle, u32)> {
        self.history
    }

    pub fn inputs(&self) -> &[TexHandle] {
        &self.inputs
    }

    pub fn blend_enabled(&self) -> bool {
        self.blend_enabled && self.blend_buffer.is_some()
    }

    pub fn blend_weights(&self) -> &[f32] {
        &self.blend_weights
    }

    pub fn transform(&self) -> &dyn Transform<B> {
        &*self.transform
    }

    /// The texture the transform reads.
    pub fn resolved_input(&self) -> Option<TexHandle> {
        if self.blend_enabled() {
            self.blend_buffer
        } else {
            self.inputs.first().copied()
        }
    }

    /// Every pool texture this operation owns.
    pub fn owned_textures(&self) -> Vec<TexHandle> {
        let mut v = vec![self.output];
        v.extend(self.blit_buffer);
        v.extend(self.blend_buffer);
        v.extend(self.history.map(|(h, _)| h));
        v
    }
}

/// What a seed draws into its output.
#[derive(Debug, Clone, PartialEq)]
pub enum SeedContent {
    Solid([f32; 4]),
    /// Letterboxed into the pool extent.
    Image(RgbaImage),
    /// The current staging texture of a video device (black if the device is gone).
    Video(DeviceId),
}

/// A source node: no inputs, deterministic content redrawn every iteration.
#[derive(Debug)]
pub struct Seed {
    id: SeedId,
    output: TexHandle,
    content: SeedContent,
    prepared: Option<RgbaImage>,
}

impl Seed {
    pub(crate) fn new(id: SeedId, output: TexHandle, content: SeedContent) -> Self {
        Self {
            id,
            output,
            content,
            prepared: None,
        }
    }

    pub fn id(&self) -> SeedId {
        self.id
    }

    pub fn output(&self) -> TexHandle {
        self.output
    }

    pub fn content(&self) -> &SeedContent {
        &self.content
    }

    pub(crate) fn set_content(&mut self, content: SeedContent) {
        self.content = content;
        self.prepared = None;
    }

    /// Drop cached letterboxing (the pool extent changed).
    pub(crate) fn invalidate(&mut self) {
        self.prepared = None;
    }

    pub(crate) fn draw<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
        pool: &TexturePool,
        video: &VideoInputs,
    ) -> Result<(), EngineError> {
        let out = pool.resolve(self.output)?;
        let extent = pool.extent();
        match &self.content {
            SeedContent::Solid(rgba) => gpu.fill(out, *rgba),
            SeedContent::Image(img) => {
                let prepared = self.prepared.get_or_insert_with(|| letterbox(img, extent));
                gpu.upload_rgba8(out, extent, prepared.as_raw());
            }
            SeedContent::Video(dev) => match video.texture(dev).and_then(|h| pool.texture(h)) {
                Some(src) => gpu.copy(Layer::base(src), Layer::base(out), extent),
                None => gpu.clear(out, 1),
            },
        }
        Ok(())
    }
}
