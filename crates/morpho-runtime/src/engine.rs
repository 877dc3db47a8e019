//! The render engine: texture pool, operations, seeds, video staging and capture owned by one
//! render context.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use image::RgbaImage;
use morpho_core::{
    DeviceId, EngineConfig, EngineError, EngineEvent, Extent, FenceToken, OpId, SeedId,
    TextureFormat,
};

use crate::backend::{GpuBackend, TextureId};
use crate::capture::{CapturePipeline, FrameSink};
use crate::executor::Executor;
use crate::operation::{Operation, OperationSpec, Seed, SeedContent};
use crate::pool::{TexHandle, TexturePool};
use crate::projection::Ortho;
use crate::video::VideoInputs;

/// What one submitted iteration produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub fence: FenceToken,
    /// Completed iterations including this one.
    pub iteration: u64,
}

pub struct Engine<B: GpuBackend> {
    gpu: B,
    pool: TexturePool,
    ops: HashMap<OpId, Operation<B>>,
    seeds: BTreeMap<SeedId, Seed>,
    executor: Executor,
    capture: CapturePipeline,
    video: VideoInputs,
    ortho: Ortho,
    active: bool,
    output: Option<TexHandle>,
    events: Vec<EngineEvent>,
}

impl<B: GpuBackend> fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("extent", &self.pool.extent())
            .field("format", &self.pool.format())
            .field("operations", &self.ops.len())
            .field("seeds", &self.seeds.len())
            .field("sorted", &self.executor.sorted())
            .field("iteration", &self.executor.iteration())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl<B: GpuBackend> Engine<B> {
    pub fn new(mut gpu: B, cfg: &EngineConfig) -> Result<Self, EngineError> {
        let extent = cfg.extent();
        let pool = TexturePool::new(&mut gpu, extent, cfg.format, cfg.blend_layers)?;
        let ortho = Ortho::for_extent(extent);
        gpu.set_projection(&ortho);
        tracing::debug!(
            ?extent,
            format = cfg.format.name(),
            blend_layers = pool.blend_layers(),
            "engine ready"
        );
        Ok(Self {
            gpu,
            pool,
            ops: HashMap::new(),
            seeds: BTreeMap::new(),
            executor: Executor::new(),
            capture: CapturePipeline::new(
                extent,
                Duration::from_micros(cfg.fence_poll_timeout_us),
            ),
            video: VideoInputs::new(),
            ortho,
            active: cfg.initially_active,
            output: None,
            events: Vec::new(),
        })
    }

    pub fn gpu(&self) -> &B {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut B {
        &mut self.gpu
    }

    pub fn pool(&self) -> &TexturePool {
        &self.pool
    }

    pub fn extent(&self) -> Extent {
        self.pool.extent()
    }

    pub fn format(&self) -> TextureFormat {
        self.pool.format()
    }

    pub fn ortho(&self) -> Ortho {
        self.ortho
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Events emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    // ---------------------------------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------------------------------

    /// Register an operation; returns its output handle.
    pub fn init_operation(&mut self, spec: OperationSpec<B>) -> Result<TexHandle, EngineError> {
        if self.ops.contains_key(&spec.id) {
            return Err(EngineError::invalid(format!(
                "operation {:?} already registered",
                spec.id
            )));
        }
        let mut op = Operation::allocate(spec, &mut self.gpu, &mut self.pool)?;
        op.transform.adjust_projection(&mut self.gpu, &self.ortho);
        let out = op.output();
        tracing::debug!(
            op = op.id().0,
            transform = op.transform.name(),
            "operation registered"
        );
        self.ops.insert(op.id(), op);
        Ok(out)
    }

    pub fn operation(&self, id: OpId) -> Option<&Operation<B>> {
        self.ops.get(&id)
    }

    fn op_mut(&mut self, id: OpId) -> Result<&mut Operation<B>, EngineError> {
        self.ops.get_mut(&id).ok_or(EngineError::UnknownOperation(id))
    }

    /// Free the operation's textures and drop it from the sorted list and from every input list.
    pub fn remove_operation(&mut self, id: OpId) -> Result<(), EngineError> {
        let op = self.ops.remove(&id).ok_or(EngineError::UnknownOperation(id))?;
        self.executor.forget(id);
        let owned = op.owned_textures();
        for other in self.ops.values_mut() {
            other.inputs.retain(|h| !owned.contains(h));
        }
        if self.output.is_some_and(|h| owned.contains(&h)) {
            self.output = None;
        }
        op.release(&mut self.gpu, &mut self.pool);
        tracing::debug!(op = id.0, "operation removed");
        Ok(())
    }

    pub fn set_operation_inputs(
        &mut self,
        id: OpId,
        inputs: Vec<TexHandle>,
    ) -> Result<(), EngineError> {
        if let Some(h) = inputs.iter().find(|h| !self.pool.contains(**h)) {
            return Err(EngineError::UnknownTexture(h.0));
        }
        let op = self.op_mut(id)?;
        op.inputs = inputs;
        op.warned_truncation = false;
        Ok(())
    }

    pub fn set_blend_weights(&mut self, id: OpId, weights: Vec<f32>) -> Result<(), EngineError> {
        self.op_mut(id)?.blend_weights = weights;
        Ok(())
    }

    pub fn set_blend_enabled(&mut self, id: OpId, enabled: bool) -> Result<(), EngineError> {
        let op = self.op_mut(id)?;
        if enabled && op.blend_buffer().is_none() {
            return Err(EngineError::invalid(format!(
                "operation {id:?} was created without a blend buffer"
            )));
        }
        op.blend_enabled = enabled;
        Ok(())
    }

    /// Replace the evaluation order. Every id must be registered.
    pub fn set_sorted_operations(&mut self, order: Vec<OpId>) -> Result<(), EngineError> {
        if let Some(id) = order.iter().find(|id| !self.ops.contains_key(*id)) {
            return Err(EngineError::UnknownOperation(*id));
        }
        self.executor.set_sorted(order);
        Ok(())
    }

    pub fn sorted_operations(&self) -> &[OpId] {
        self.executor.sorted()
    }

    // ---------------------------------------------------------------------------------------------
    // Seeds
    // ---------------------------------------------------------------------------------------------

    /// Register a seed and draw it once; returns its output handle.
    pub fn init_seed(
        &mut self,
        id: SeedId,
        content: SeedContent,
    ) -> Result<TexHandle, EngineError> {
        if self.seeds.contains_key(&id) {
            return Err(EngineError::invalid(format!("seed {id:?} already registered")));
        }
        let out = self.pool.alloc_image(&mut self.gpu)?;
        let mut seed = Seed::new(id, out, content);
        seed.draw(&mut self.gpu, &self.pool, &self.video)?;
        self.seeds.insert(id, seed);
        Ok(out)
    }

    pub fn set_seed_content(
        &mut self,
        id: SeedId,
        content: SeedContent,
    ) -> Result<(), EngineError> {
        let seed = self.seeds.get_mut(&id).ok_or(EngineError::UnknownSeed(id))?;
        seed.set_content(content);
        seed.draw(&mut self.gpu, &self.pool, &self.video)
    }

    pub fn seed(&self, id: SeedId) -> Option<&Seed> {
        self.seeds.get(&id)
    }

    pub fn remove_seed(&mut self, id: SeedId) -> Result<(), EngineError> {
        let seed = self.seeds.remove(&id).ok_or(EngineError::UnknownSeed(id))?;
        let out = seed.output();
        for op in self.ops.values_mut() {
            op.inputs.retain(|h| *h != out);
        }
        if self.output == Some(out) {
            self.output = None;
        }
        self.pool.free(&mut self.gpu, out);
        Ok(())
    }

    /// Release every operation and seed ("graph cleared").
    pub fn clear(&mut self) {
        self.executor.set_sorted(Vec::new());
        for (_, op) in std::mem::take(&mut self.ops) {
            op.release(&mut self.gpu, &mut self.pool);
        }
        for (_, seed) in std::mem::take(&mut self.seeds) {
            self.pool.free(&mut self.gpu, seed.output());
        }
        self.output = None;
        tracing::debug!("graph cleared");
    }

    // ---------------------------------------------------------------------------------------------
    // Video input staging
    // ---------------------------------------------------------------------------------------------

    pub fn gen_video_texture(&mut self, dev: &DeviceId) -> Result<TexHandle, EngineError> {
        self.video.gen_texture(&mut self.gpu, &mut self.pool, dev)
    }

    pub fn del_video_texture(&mut self, dev: &DeviceId) -> bool {
        if let Some(h) = self.video.texture(dev) {
            for op in self.ops.values_mut() {
                op.inputs.retain(|i| *i != h);
            }
            if self.output == Some(h) {
                self.output = None;
            }
        }
        self.video.del_texture(&mut self.gpu, &mut self.pool, dev)
    }

    pub fn video_texture(&self, dev: &DeviceId) -> Option<TexHandle> {
        self.video.texture(dev)
    }

    /// Latest decoded frame of `dev`; uploaded before the next iteration.
    pub fn set_frame_image(&mut self, dev: &DeviceId, image: RgbaImage) -> bool {
        self.video.set_frame(dev, image)
    }

    // ---------------------------------------------------------------------------------------------
    // Output
    // ---------------------------------------------------------------------------------------------

    /// Choose which pool texture is "the output" (presented and captured).
    pub fn set_output(&mut self, output: Option<TexHandle>) -> Result<(), EngineError> {
        if let Some(h) = output {
            if !self.pool.contains(h) {
                return Err(EngineError::UnknownTexture(h.0));
            }
        }
        self.output = output;
        Ok(())
    }

    pub fn output(&self) -> Option<TexHandle> {
        self.output
    }

    /// Backend texture of the output. Valid until the next migration or deletion.
    pub fn current_output_texture(&self) -> Option<TextureId> {
        self.output.and_then(|h| self.pool.texture(h))
    }

    /// Fence of the most recent iteration.
    pub fn last_fence(&self) -> Option<FenceToken> {
        self.executor.last_fence()
    }

    // ---------------------------------------------------------------------------------------------
    // Resize / format migration
    // ---------------------------------------------------------------------------------------------

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), EngineError> {
        if width == 0 || height == 0 {
            return Err(EngineError::invalid(format!("resize to {width}x{height}")));
        }
        self.migrate(Extent::new(width, height), self.pool.format())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_format(&mut self, format: TextureFormat) -> Result<(), EngineError> {
        self.migrate(self.pool.extent(), format)
    }

    fn migrate(&mut self, extent: Extent, format: TextureFormat) -> Result<(), EngineError> {
        if !self.pool.migrate(&mut self.gpu, extent, format)? {
            return Ok(());
        }
        self.ortho = Ortho::for_extent(extent);
        self.gpu.set_projection(&self.ortho);
        for op in self.ops.values_mut() {
            op.transform.adjust_projection(&mut self.gpu, &self.ortho);
        }
        for seed in self.seeds.values_mut() {
            seed.invalidate();
            seed.draw(&mut self.gpu, &self.pool, &self.video)?;
        }
        self.video.invalidate();
        self.capture.resize(extent);
        self.events.push(EngineEvent::TexturesChanged);
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Reset
    // ---------------------------------------------------------------------------------------------

    /// Clear every operation texture and feedback array, redraw seeds, zero the counter.
    pub fn reset(&mut self) {
        for op in self.ops.values() {
            for h in op.owned_textures() {
                self.pool.clear(&mut self.gpu, h);
            }
        }
        self.executor
            .draw_seeds(&mut self.gpu, &self.pool, &mut self.seeds, &self.video);
        self.executor.reset_iteration();
        tracing::debug!("engine reset");
    }

    pub fn iteration_number(&self) -> u64 {
        self.executor.iteration()
    }

    // ---------------------------------------------------------------------------------------------
    // Capture
    // ---------------------------------------------------------------------------------------------

    pub fn request_capture(&mut self) {
        self.capture.request_capture();
    }

    pub fn take_screenshot(&mut self, path: impl AsRef<Path>) {
        self.capture.request_screenshot(path);
    }

    pub fn start_recording(&mut self, sink: Box<dyn FrameSink>) {
        self.capture.start_stream(sink);
    }

    pub fn stop_recording(&mut self) -> Option<Box<dyn FrameSink>> {
        self.capture.stop_stream()
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_streaming()
    }

    pub fn output_image(&self) -> &RgbaImage {
        self.capture.output_image()
    }

    // ---------------------------------------------------------------------------------------------
    // Iteration
    // ---------------------------------------------------------------------------------------------

    /// Run one iteration. Returns `None` while inactive (seeds are still redrawn).
    ///
    /// Only errors that leave the engine unusable are returned; everything else inside the
    /// iteration degrades locally (skipped operation, black capture).
    pub fn iterate(&mut self) -> Result<Option<FrameInfo>, EngineError> {
        if !self.active {
            self.executor
                .draw_seeds(&mut self.gpu, &self.pool, &mut self.seeds, &self.video);
            return Ok(None);
        }

        self.video.upload_pending(&mut self.gpu, &self.pool);
        if !self.executor.sorted().is_empty() {
            self.executor
                .run_passes(&mut self.gpu, &self.pool, &mut self.ops, &mut self.events);
        }
        self.executor
            .draw_seeds(&mut self.gpu, &self.pool, &mut self.seeds, &self.video);

        let armed = self.capture.is_armed();
        if armed {
            let out = self.output.and_then(|h| self.pool.texture(h));
            self.capture.issue_transfer(&mut self.gpu, &self.pool, out);
        }

        let (fence, iteration) = self.executor.finish(&mut self.gpu)?;
        self.events.push(EngineEvent::FrameReady { fence, iteration });

        if armed {
            let events = self.capture.complete(&mut self.gpu, fence);
            self.events.extend(events);
        }
        Ok(Some(FrameInfo { fence, iteration }))
    }
}

impl<B: GpuBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        self.clear();
        self.video.clear(&mut self.gpu, &mut self.pool);
        self.executor.release_fence(&mut self.gpu);
        self.pool.release_all(&mut self.gpu);
    }
}
