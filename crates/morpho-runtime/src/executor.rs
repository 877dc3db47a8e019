//! One pass of the sorted operation list.
//!
//! Stage order inside an iteration is fixed: blit hand-offs, then feedback shifts, then
//! blend + render in list order, then seeds, then the fence. Later stages read what earlier
//! stages wrote.

use std::collections::{BTreeMap, HashMap};

use morpho_core::{EngineError, EngineEvent, FenceToken, OpId, SeedId};

use crate::backend::{GpuBackend, Layer};
use crate::operation::{Operation, PassTargets, Seed};
use crate::pool::TexturePool;
use crate::video::VideoInputs;

#[derive(Debug, Default)]
pub struct Executor {
    sorted: Vec<OpId>,
    iteration: u64,
    fence: Option<FenceToken>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Externally computed evaluation order. Trusted as-is; no cycle detection.
    pub fn set_sorted(&mut self, order: Vec<OpId>) {
        self.sorted = order;
    }

    pub fn sorted(&self) -> &[OpId] {
        &self.sorted
    }

    pub fn forget(&mut self, id: OpId) {
        self.sorted.retain(|o| *o != id);
    }

    /// Completed iterations since construction or the last reset.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn reset_iteration(&mut self) {
        self.iteration = 0;
    }

    /// Fence of the most recent iteration.
    pub fn last_fence(&self) -> Option<FenceToken> {
        self.fence
    }

    /// Blits, feedback shifts and renders for every operation in the sorted list.
    pub fn run_passes<B: GpuBackend + ?Sized>(
        &self,
        gpu: &mut B,
        pool: &TexturePool,
        ops: &mut HashMap<OpId, Operation<B>>,
        events: &mut Vec<EngineEvent>,
    ) {
        let extent = pool.extent();

        for id in &self.sorted {
            let Some(op) = ops.get(id) else { continue };
            if let Some(buf) = op.blit_buffer() {
                if let (Some(src), Some(dst)) = (pool.texture(op.output()), pool.texture(buf)) {
                    gpu.copy(Layer::base(src), Layer::base(dst), extent);
                }
            }
        }

        for id in &self.sorted {
            let Some(op) = ops.get_mut(id) else { continue };
            let skip = !op.transform.is_ready();
            if skip != op.skipped {
                op.skipped = skip;
                if skip {
                    tracing::warn!(
                        op = id.0,
                        transform = op.transform.name(),
                        "operation not ready, skipping"
                    );
                } else {
                    tracing::debug!(op = id.0, "operation participating again");
                }
                events.push(EngineEvent::OperationSkipped {
                    op: *id,
                    skipped: skip,
                });
            }
        }

        for id in &self.sorted {
            let Some(op) = ops.get(id) else { continue };
            if op.skipped {
                continue;
            }
            let Some((arr, depth)) = op.history() else {
                continue;
            };
            let Some(arr) = pool.texture(arr) else { continue };
            for z in (1..depth).rev() {
                gpu.copy(Layer::of(arr, z - 1), Layer::of(arr, z), extent);
            }
            match op.resolved_input().and_then(|h| pool.texture(h)) {
                Some(input) => gpu.copy(Layer::base(input), Layer::of(arr, 0), extent),
                None => gpu.clear_layer(Layer::of(arr, 0)),
            }
        }

        for id in &self.sorted {
            let Some(op) = ops.get_mut(id) else { continue };
            if op.skipped {
                continue;
            }
            if op.blend_enabled() {
                blend(gpu, pool, op);
            }
            let Some(output) = pool.texture(op.output()) else {
                continue;
            };
            let pass = PassTargets {
                input: op.resolved_input().and_then(|h| pool.texture(h)),
                history: op
                    .history()
                    .and_then(|(h, depth)| pool.texture(h).map(|t| (t, depth))),
                output,
                extent,
                iteration: self.iteration,
            };
            if let Err(e) = op.transform.render(gpu, &pass) {
                tracing::warn!(op = id.0, error = %e, "render failed");
            }
        }
    }

    /// Redraw every seed's initial content, unconditionally.
    pub fn draw_seeds<B: GpuBackend + ?Sized>(
        &self,
        gpu: &mut B,
        pool: &TexturePool,
        seeds: &mut BTreeMap<SeedId, Seed>,
        video: &VideoInputs,
    ) {
        for seed in seeds.values_mut() {
            if let Err(e) = seed.draw(gpu, pool, video) {
                tracing::warn!(seed = seed.id().0, error = %e, "seed draw failed");
            }
        }
    }

    /// Record the iteration fence (releasing the previous one) and advance the counter.
    pub fn finish<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
    ) -> Result<(FenceToken, u64), EngineError> {
        let fence = gpu.insert_fence()?;
        if let Some(old) = self.fence.replace(fence) {
            gpu.delete_fence(old);
        }
        self.iteration = match self.iteration.checked_add(1) {
            Some(n) => n,
            None => {
                tracing::warn!("iteration counter wrapped");
                0
            }
        };
        Ok((fence, self.iteration))
    }

    /// Drop the last fence (engine teardown).
    pub fn release_fence<B: GpuBackend + ?Sized>(&mut self, gpu: &mut B) {
        if let Some(f) = self.fence.take() {
            gpu.delete_fence(f);
        }
    }
}

fn blend<B: GpuBackend + ?Sized>(gpu: &mut B, pool: &TexturePool, op: &mut Operation<B>) {
    let (Some(scratch), Some(dst)) = (
        pool.texture(pool.blend_scratch()),
        op.blend_buffer().and_then(|h| pool.texture(h)),
    ) else {
        return;
    };
    let capacity = pool.blend_layers() as usize;
    if op.inputs.len() > capacity && !op.warned_truncation {
        op.warned_truncation = true;
        tracing::warn!(
            op = op.id().0,
            inputs = op.inputs.len(),
            capacity,
            "blend inputs beyond array capacity are ignored"
        );
    }

    let extent = pool.extent();
    let n = op.inputs.len().min(capacity);
    let mut weights = Vec::with_capacity(n);
    for (i, h) in op.inputs.iter().take(n).enumerate() {
        let w = op.blend_weights.get(i).copied().unwrap_or(0.0);
        match pool.texture(*h) {
            Some(src) => gpu.copy(Layer::base(src), Layer::of(scratch, i as u32), extent),
            None => gpu.clear_layer(Layer::of(scratch, i as u32)),
        }
        weights.push(w);
    }
    gpu.blend_layers(scratch, &weights, dst, extent);
}
