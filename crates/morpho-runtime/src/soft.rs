//! CPU implementation of [`GpuBackend`].
//!
//! Texels are stored as `[f32; 4]` regardless of the nominal format; the format is tracked so
//! pool invariants can be checked. Layers holding a single colour stay a single solid value
//! until something writes per-texel data into them.
//!
//! Fences signal immediately unless stalled on purpose, and a few knobs inject the failures the
//! engine has to survive (allocation failure, refused map).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use morpho_core::{EngineError, Extent, FenceToken, TextureFormat};

use crate::backend::{FenceStatus, Filter, GpuBackend, Layer, TextureId};
use crate::operation::{PassTargets, Transform};
use crate::projection::Ortho;

const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

#[derive(Debug, Clone, PartialEq)]
enum Plane {
    Solid([f32; 4]),
    Pixels(Vec<[f32; 4]>),
}

impl Plane {
    fn at(&self, idx: usize) -> [f32; 4] {
        match self {
            Plane::Solid(c) => *c,
            Plane::Pixels(v) => v.get(idx).copied().unwrap_or(BLACK),
        }
    }

    fn from_texels(texels: Vec<[f32; 4]>) -> Self {
        match texels.first() {
            Some(first) if texels.iter().all(|t| t == first) => Plane::Solid(*first),
            Some(_) => Plane::Pixels(texels),
            None => Plane::Solid(BLACK),
        }
    }
}

#[derive(Debug)]
struct SoftTexture {
    extent: Extent,
    format: TextureFormat,
    planes: Vec<Plane>,
}

/// Counters for submitted work, handy for asserting what an iteration did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SoftStats {
    pub copies: u64,
    pub blits: u64,
    pub blends: u64,
    pub uploads: u64,
    pub transfers: u64,
    pub fences: u64,
    pub passes: u64,
}

#[derive(Debug)]
pub struct SoftBackend {
    textures: HashMap<u32, SoftTexture>,
    next_tex: u32,
    max_layers: u32,
    fences: HashMap<u64, u32>,
    next_fence: u64,
    stall_polls: u32,
    staging: Vec<u8>,
    fail_alloc_after: Option<usize>,
    fail_next_map: bool,
    projection: Option<Ortho>,
    stats: SoftStats,
}

impl Default for SoftBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftBackend {
    pub fn new() -> Self {
        Self {
            textures: HashMap::new(),
            next_tex: 1,
            max_layers: 256,
            fences: HashMap::new(),
            next_fence: 1,
            stall_polls: 0,
            staging: Vec::new(),
            fail_alloc_after: None,
            fail_next_map: false,
            projection: None,
            stats: SoftStats::default(),
        }
    }

    pub fn with_max_array_layers(mut self, layers: u32) -> Self {
        self.max_layers = layers.max(1);
        self
    }

    /// Let `n` more allocations succeed, then fail the next one (once).
    pub fn fail_allocations_after(&mut self, n: usize) {
        self.fail_alloc_after = Some(n);
    }

    /// Refuse the next staging map.
    pub fn fail_next_map(&mut self) {
        self.fail_next_map = true;
    }

    /// Every fence inserted from now on reports `Pending` for `polls` polls before signalling.
    pub fn stall_fences(&mut self, polls: u32) {
        self.stall_polls = polls;
    }

    pub fn stats(&self) -> SoftStats {
        self.stats
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_fences(&self) -> usize {
        self.fences.len()
    }

    pub fn last_projection(&self) -> Option<Ortho> {
        self.projection
    }

    pub fn extent_of(&self, tex: TextureId) -> Option<Extent> {
        self.textures.get(&tex.0).map(|t| t.extent)
    }

    pub fn format_of(&self, tex: TextureId) -> Option<TextureFormat> {
        self.textures.get(&tex.0).map(|t| t.format)
    }

    pub fn layer_count(&self, tex: TextureId) -> Option<u32> {
        self.textures.get(&tex.0).map(|t| t.planes.len() as u32)
    }

    pub fn texel(&self, tex: TextureId, layer: u32, x: u32, y: u32) -> Option<[f32; 4]> {
        let t = self.textures.get(&tex.0)?;
        if x >= t.extent.width || y >= t.extent.height {
            return None;
        }
        let plane = t.planes.get(layer as usize)?;
        Some(plane.at((y * t.extent.width + x) as usize))
    }

    /// The colour of a layer if every texel in it is identical.
    pub fn solid_color(&self, tex: TextureId, layer: u32) -> Option<[f32; 4]> {
        match self.textures.get(&tex.0)?.planes.get(layer as usize)? {
            Plane::Solid(c) => Some(*c),
            Plane::Pixels(v) => match v.first() {
                Some(first) if v.iter().all(|t| t == first) => Some(*first),
                _ => None,
            },
        }
    }

    /// Run `f` once per output texel of `pass`, the way a fragment shader would.
    pub fn shade(&mut self, pass: &PassTargets, f: &mut dyn FnMut(&PixelCtx<'_>) -> [f32; 4]) {
        self.stats.passes += 1;
        let extent = pass.extent;
        let input = pass
            .input
            .and_then(|t| self.textures.get(&t.0))
            .and_then(|t| t.planes.first().cloned());
        let history: Vec<Plane> = pass
            .history
            .and_then(|(t, depth)| {
                self.textures
                    .get(&t.0)
                    .map(|t| t.planes.iter().take(depth as usize).cloned().collect())
            })
            .unwrap_or_default();

        let mut hist = vec![BLACK; history.len()];
        let mut out = Vec::with_capacity(extent.texels());
        for y in 0..extent.height {
            for x in 0..extent.width {
                let idx = (y * extent.width + x) as usize;
                for (slot, plane) in hist.iter_mut().zip(&history) {
                    *slot = plane.at(idx);
                }
                let ctx = PixelCtx {
                    x,
                    y,
                    extent,
                    iteration: pass.iteration,
                    input: input.as_ref().map_or(BLACK, |p| p.at(idx)),
                    history: &hist,
                };
                out.push(f(&ctx));
            }
        }
        if let Some(dst) = self.textures.get_mut(&pass.output.0) {
            if let Some(p) = dst.planes.first_mut() {
                *p = Plane::from_texels(out);
            }
        }
    }

    fn allocate(
        &mut self,
        extent: Extent,
        format: TextureFormat,
        layers: u32,
    ) -> Result<TextureId, EngineError> {
        if let Some(n) = self.fail_alloc_after {
            if n == 0 {
                self.fail_alloc_after = None;
                return Err(EngineError::Allocation(format!(
                    "soft backend refused {}x{} {} x{layers}",
                    extent.width,
                    extent.height,
                    format.name()
                )));
            }
            self.fail_alloc_after = Some(n - 1);
        }
        let id = self.next_tex;
        self.next_tex += 1;
        self.textures.insert(
            id,
            SoftTexture {
                extent,
                format,
                planes: vec![Plane::Solid([0.0; 4]); layers as usize],
            },
        );
        Ok(TextureId(id))
    }

    fn plane(&self, l: Layer) -> Option<(&Plane, Extent)> {
        let t = self.textures.get(&l.tex.0)?;
        Some((t.planes.get(l.layer as usize)?, t.extent))
    }

    fn write_plane(&mut self, l: Layer, plane: Plane) {
        if let Some(p) = self
            .textures
            .get_mut(&l.tex.0)
            .and_then(|t| t.planes.get_mut(l.layer as usize))
        {
            *p = plane;
        }
    }
}

fn resample(src: &Plane, from: Extent, to: Extent, filter: Filter) -> Plane {
    let Plane::Pixels(px) = src else {
        return src.clone();
    };
    if from == to {
        return src.clone();
    }
    let sx = from.width as f32 / to.width as f32;
    let sy = from.height as f32 / to.height as f32;
    let fetch = |x: i64, y: i64| -> [f32; 4] {
        let x = x.clamp(0, from.width as i64 - 1) as usize;
        let y = y.clamp(0, from.height as i64 - 1) as usize;
        px.get(y * from.width as usize + x).copied().unwrap_or(BLACK)
    };
    let mut out = Vec::with_capacity(to.texels());
    for y in 0..to.height {
        for x in 0..to.width {
            let u = (x as f32 + 0.5) * sx;
            let v = (y as f32 + 0.5) * sy;
            let texel = match filter {
                Filter::Nearest => fetch(u.floor() as i64, v.floor() as i64),
                Filter::Linear => {
                    let (u, v) = (u - 0.5, v - 0.5);
                    let (x0, y0) = (u.floor(), v.floor());
                    let (fx, fy) = (u - x0, v - y0);
                    let (x0, y0) = (x0 as i64, y0 as i64);
                    let a = fetch(x0, y0);
                    let b = fetch(x0 + 1, y0);
                    let c = fetch(x0, y0 + 1);
                    let d = fetch(x0 + 1, y0 + 1);
                    let mut t = [0.0; 4];
                    for i in 0..4 {
                        let top = a[i] + (b[i] - a[i]) * fx;
                        let bottom = c[i] + (d[i] - c[i]) * fx;
                        t[i] = top + (bottom - top) * fy;
                    }
                    t
                }
            };
            out.push(texel);
        }
    }
    Plane::from_texels(out)
}

impl GpuBackend for SoftBackend {
    fn max_array_layers(&self) -> u32 {
        self.max_layers
    }

    fn create_texture(
        &mut self,
        extent: Extent,
        format: TextureFormat,
    ) -> Result<TextureId, EngineError> {
        self.allocate(extent, format, 1)
    }

    fn create_array_texture(
        &mut self,
        extent: Extent,
        format: TextureFormat,
        layers: u32,
    ) -> Result<TextureId, EngineError> {
        if layers == 0 || layers > self.max_layers {
            return Err(EngineError::invalid(format!("array depth {layers}")));
        }
        self.allocate(extent, format, layers)
    }

    fn delete_texture(&mut self, tex: TextureId) {
        self.textures.remove(&tex.0);
    }

    fn clear(&mut self, tex: TextureId, layers: u32) {
        if let Some(t) = self.textures.get_mut(&tex.0) {
            for p in t.planes.iter_mut().take(layers as usize) {
                *p = Plane::Solid(BLACK);
            }
        }
    }

    fn clear_layer(&mut self, layer: Layer) {
        self.write_plane(layer, Plane::Solid(BLACK));
    }

    fn fill(&mut self, tex: TextureId, rgba: [f32; 4]) {
        self.write_plane(Layer::base(tex), Plane::Solid(rgba));
    }

    fn copy(&mut self, src: Layer, dst: Layer, extent: Extent) {
        self.stats.copies += 1;
        let Some((plane, from)) = self.plane(src) else {
            return;
        };
        let plane = if from == extent {
            plane.clone()
        } else {
            resample(plane, from, extent, Filter::Nearest)
        };
        self.write_plane(dst, plane);
    }

    fn blit(
        &mut self,
        src: TextureId,
        src_extent: Extent,
        dst: TextureId,
        dst_extent: Extent,
        filter: Filter,
    ) {
        self.stats.blits += 1;
        let Some((plane, _)) = self.plane(Layer::base(src)) else {
            return;
        };
        let plane = resample(plane, src_extent, dst_extent, filter);
        self.write_plane(Layer::base(dst), plane);
    }

    fn upload_rgba8(&mut self, tex: TextureId, extent: Extent, pixels: &[u8]) {
        self.stats.uploads += 1;
        let texels = pixels
            .chunks_exact(4)
            .take(extent.texels())
            .map(|c| {
                [
                    c[0] as f32 / 255.0,
                    c[1] as f32 / 255.0,
                    c[2] as f32 / 255.0,
                    c[3] as f32 / 255.0,
                ]
            })
            .collect();
        self.write_plane(Layer::base(tex), Plane::from_texels(texels));
    }

    fn blend_layers(&mut self, layers: TextureId, weights: &[f32], dst: TextureId, extent: Extent) {
        self.stats.blends += 1;
        let Some(src) = self.textures.get(&layers.0) else {
            return;
        };
        let planes: Vec<(&Plane, f32)> = src.planes.iter().zip(weights.iter().copied()).collect();
        let weigh = |idx: usize| {
            let mut acc = [0.0f32; 4];
            for (p, w) in &planes {
                let t = p.at(idx);
                for i in 0..4 {
                    acc[i] += t[i] * w;
                }
            }
            acc
        };
        let out = if planes.iter().all(|(p, _)| matches!(p, Plane::Solid(_))) {
            Plane::Solid(weigh(0))
        } else {
            Plane::from_texels((0..extent.texels()).map(weigh).collect())
        };
        self.write_plane(Layer::base(dst), out);
    }

    fn set_projection(&mut self, ortho: &Ortho) {
        self.projection = Some(*ortho);
    }

    fn insert_fence(&mut self) -> Result<FenceToken, EngineError> {
        self.stats.fences += 1;
        let id = self.next_fence;
        self.next_fence += 1;
        self.fences.insert(id, self.stall_polls);
        Ok(FenceToken(id))
    }

    fn poll_fence(&mut self, fence: FenceToken, _timeout: Duration) -> FenceStatus {
        match self.fences.get_mut(&fence.0) {
            Some(0) => FenceStatus::Signaled,
            Some(remaining) => {
                *remaining -= 1;
                FenceStatus::Pending
            }
            None => FenceStatus::Failed,
        }
    }

    fn delete_fence(&mut self, fence: FenceToken) {
        self.fences.remove(&fence.0);
    }

    fn resize_staging(&mut self, bytes: usize) -> Result<(), EngineError> {
        self.staging = vec![0; bytes];
        Ok(())
    }

    fn read_to_staging(&mut self, src: TextureId, extent: Extent) {
        self.stats.transfers += 1;
        let Some((plane, _)) = self.plane(Layer::base(src)) else {
            return;
        };
        let plane = plane.clone();
        for (idx, px) in self
            .staging
            .chunks_exact_mut(4)
            .take(extent.texels())
            .enumerate()
        {
            let t = plane.at(idx);
            for i in 0..4 {
                px[i] = (t[i].clamp(0.0, 1.0) * 255.0).round() as u8;
            }
        }
    }

    fn map_staging(&mut self, dst: &mut [u8]) -> bool {
        if std::mem::take(&mut self.fail_next_map) {
            return false;
        }
        let n = dst.len().min(self.staging.len());
        dst[..n].copy_from_slice(&self.staging[..n]);
        true
    }
}

/// Per-texel inputs handed to a [`PixelShader`].
#[derive(Debug)]
pub struct PixelCtx<'a> {
    pub x: u32,
    pub y: u32,
    pub extent: Extent,
    pub iteration: u64,
    /// Texel of the resolved input (black if the operation has none).
    pub input: [f32; 4],
    /// Texels of the feedback array, newest first.
    pub history: &'a [[f32; 4]],
}

type ShadeFn = Box<dyn FnMut(&PixelCtx<'_>) -> [f32; 4]>;

/// A [`Transform`] for [`SoftBackend`] written as a per-texel closure.
pub struct PixelShader {
    name: String,
    f: ShadeFn,
    ready: Arc<AtomicBool>,
    projection: Option<Ortho>,
}

impl fmt::Debug for PixelShader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelShader")
            .field("name", &self.name)
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PixelShader {
    pub fn new(
        name: impl Into<String>,
        f: impl FnMut(&PixelCtx<'_>) -> [f32; 4] + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            f: Box::new(f),
            ready: Arc::new(AtomicBool::new(true)),
            projection: None,
        }
    }

    pub fn passthrough() -> Self {
        Self::new("passthrough", |p| p.input)
    }

    /// A transform whose program never linked.
    pub fn broken(name: impl Into<String>) -> Self {
        let s = Self::new(name, |_| BLACK);
        s.ready.store(false, Ordering::Relaxed);
        s
    }

    /// Shared readiness flag; flipping it simulates a program (re)link.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    pub fn projection(&self) -> Option<Ortho> {
        self.projection
    }
}

impl Transform<SoftBackend> for PixelShader {
    fn render(&mut self, gpu: &mut SoftBackend, pass: &PassTargets) -> Result<(), EngineError> {
        gpu.shade(pass, &mut *self.f);
        Ok(())
    }

    fn adjust_projection(&mut self, _gpu: &mut SoftBackend, ortho: &Ortho) {
        self.projection = Some(*ortho);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
