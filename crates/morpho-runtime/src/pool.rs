//! Texture pool: the single owner of texture extent/format state.
//!
//! Consumers hold [`TexHandle`]s. The pool maps each handle to the backend texture currently
//! backing it; a migration swaps the mapping, never the handles.

use std::collections::HashMap;

use morpho_core::{EngineError, Extent, TextureFormat};

use crate::backend::{Filter, GpuBackend, TextureId};

/// Stable logical handle to a pool texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TexHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// 2D texture in the pool format. Content is blitted forward on migration.
    Image,
    /// 2D-array texture in the pool format. Recreated empty on migration.
    History { layers: u32 },
    /// 2D texture fixed to RGBA8. Used as the capture conversion target.
    Frame,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    tex: TextureId,
    kind: SlotKind,
}

#[derive(Debug)]
pub struct TexturePool {
    extent: Extent,
    format: TextureFormat,
    slots: HashMap<TexHandle, Slot>,
    next: u32,
    blend_scratch: TexHandle,
    blend_layers: u32,
    frame: TexHandle,
}

impl TexturePool {
    /// Allocates the shared utility textures (blend scratch array, RGBA8 frame texture) and the
    /// readback staging buffer.
    pub fn new<B: GpuBackend + ?Sized>(
        gpu: &mut B,
        extent: Extent,
        format: TextureFormat,
        requested_blend_layers: u32,
    ) -> Result<Self, EngineError> {
        let blend_layers = requested_blend_layers
            .min(gpu.max_blend_layers())
            .min(gpu.max_array_layers())
            .max(1);
        if blend_layers < requested_blend_layers {
            tracing::debug!(
                requested = requested_blend_layers,
                granted = blend_layers,
                "blend capacity clamped by backend"
            );
        }

        let mut pool = Self {
            extent,
            format,
            slots: HashMap::new(),
            next: 1,
            blend_scratch: TexHandle(0),
            blend_layers,
            frame: TexHandle(0),
        };
        pool.blend_scratch = pool.alloc_history(gpu, blend_layers)?;
        pool.frame = pool.insert_new(gpu, SlotKind::Frame)?;
        gpu.resize_staging(extent.rgba8_len())?;
        Ok(pool)
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn blend_layers(&self) -> u32 {
        self.blend_layers
    }

    pub fn blend_scratch(&self) -> TexHandle {
        self.blend_scratch
    }

    pub fn frame_texture(&self) -> TexHandle {
        self.frame
    }

    /// Number of live textures, utility textures included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, h: TexHandle) -> bool {
        self.slots.contains_key(&h)
    }

    pub fn kind(&self, h: TexHandle) -> Option<SlotKind> {
        self.slots.get(&h).map(|s| s.kind)
    }

    /// Current backing texture of `h`.
    pub fn texture(&self, h: TexHandle) -> Option<TextureId> {
        self.slots.get(&h).map(|s| s.tex)
    }

    pub fn resolve(&self, h: TexHandle) -> Result<TextureId, EngineError> {
        self.texture(h).ok_or(EngineError::UnknownTexture(h.0))
    }

    /// Layer count of `h` (1 for 2D textures).
    pub fn layers(&self, h: TexHandle) -> u32 {
        match self.kind(h) {
            Some(SlotKind::History { layers }) => layers,
            Some(_) => 1,
            None => 0,
        }
    }

    /// New 2D texture in the pool format, cleared to black.
    pub fn alloc_image<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
    ) -> Result<TexHandle, EngineError> {
        self.insert_new(gpu, SlotKind::Image)
    }

    /// New 2D-array texture of `layers` layers, cleared to black.
    pub fn alloc_history<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
        layers: u32,
    ) -> Result<TexHandle, EngineError> {
        let max = gpu.max_array_layers();
        if layers == 0 || layers > max {
            return Err(EngineError::invalid(format!(
                "array depth {layers} outside 1..={max}"
            )));
        }
        self.insert_new(gpu, SlotKind::History { layers })
    }

    pub fn free<B: GpuBackend + ?Sized>(&mut self, gpu: &mut B, h: TexHandle) {
        if h == self.blend_scratch || h == self.frame {
            tracing::warn!(handle = h.0, "refusing to free a shared utility texture");
            return;
        }
        if let Some(slot) = self.slots.remove(&h) {
            gpu.delete_texture(slot.tex);
        }
    }

    /// Delete every texture, utility textures included. The pool is empty afterwards.
    pub fn release_all<B: GpuBackend + ?Sized>(&mut self, gpu: &mut B) {
        for (_, slot) in self.slots.drain() {
            gpu.delete_texture(slot.tex);
        }
    }

    /// Clear every layer of `h` to opaque black.
    pub fn clear<B: GpuBackend + ?Sized>(&self, gpu: &mut B, h: TexHandle) {
        if let Some(slot) = self.slots.get(&h) {
            gpu.clear(slot.tex, layers_of(slot.kind));
        }
    }

    fn insert_new<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
        kind: SlotKind,
    ) -> Result<TexHandle, EngineError> {
        let tex = create_for(gpu, kind, self.extent, self.format)?;
        gpu.clear(tex, layers_of(kind));
        let h = self.next_handle();
        self.slots.insert(h, Slot { tex, kind });
        Ok(h)
    }

    /// Next free handle. The counter wraps past `u32::MAX` back to 1 and skips live handles;
    /// 0 is never handed out.
    fn next_handle(&mut self) -> TexHandle {
        loop {
            let h = TexHandle(self.next);
            self.next = match self.next.checked_add(1) {
                Some(n) => n,
                None => {
                    tracing::warn!("texture handle counter wrapped");
                    1
                }
            };
            if !self.slots.contains_key(&h) {
                return h;
            }
        }
    }

    /// Reallocate every texture at `extent`/`format`.
    ///
    /// Replacements are all allocated before anything is touched; if any allocation fails the
    /// partial replacements are released and the pool is left exactly as it was. Images are
    /// blitted forward (linear on resize, nearest on a format-only change); arrays come back
    /// empty. Returns `false` if nothing changed.
    #[tracing::instrument(level = "debug", skip(self, gpu))]
    pub fn migrate<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
        extent: Extent,
        format: TextureFormat,
    ) -> Result<bool, EngineError> {
        let resized = extent != self.extent;
        let reformatted = format != self.format;
        if !resized && !reformatted {
            return Ok(false);
        }

        let mut handles: Vec<TexHandle> = self.slots.keys().copied().collect();
        handles.sort();

        let mut fresh: Vec<(TexHandle, TextureId)> = Vec::with_capacity(handles.len());
        for h in &handles {
            let kind = self.slots[h].kind;
            if kind == SlotKind::Frame && !resized {
                continue;
            }
            match create_for(gpu, kind, extent, format) {
                Ok(tex) => fresh.push((*h, tex)),
                Err(e) => {
                    tracing::error!(error = %e, "migration allocation failed; pool unchanged");
                    for (_, tex) in fresh {
                        gpu.delete_texture(tex);
                    }
                    return Err(e);
                }
            }
        }
        if resized {
            if let Err(e) = gpu.resize_staging(extent.rgba8_len()) {
                tracing::error!(error = %e, "staging buffer reallocation failed; pool unchanged");
                for (_, tex) in fresh {
                    gpu.delete_texture(tex);
                }
                return Err(e);
            }
        }

        let filter = if resized {
            Filter::Linear
        } else {
            Filter::Nearest
        };
        for (h, tex) in fresh {
            let Some(slot) = self.slots.get_mut(&h) else {
                continue;
            };
            match slot.kind {
                SlotKind::Image | SlotKind::Frame => {
                    gpu.blit(slot.tex, self.extent, tex, extent, filter);
                }
                SlotKind::History { layers } => gpu.clear(tex, layers),
            }
            gpu.delete_texture(slot.tex);
            slot.tex = tex;
        }

        tracing::debug!(
            from = ?self.extent,
            from_format = ?self.format,
            textures = self.slots.len(),
            "pool migrated"
        );
        self.extent = extent;
        self.format = format;
        Ok(true)
    }
}

fn layers_of(kind: SlotKind) -> u32 {
    match kind {
        SlotKind::History { layers } => layers,
        SlotKind::Image | SlotKind::Frame => 1,
    }
}

fn create_for<B: GpuBackend + ?Sized>(
    gpu: &mut B,
    kind: SlotKind,
    extent: Extent,
    format: TextureFormat,
) -> Result<TextureId, EngineError> {
    match kind {
        SlotKind::Image => gpu.create_texture(extent, format),
        SlotKind::Frame => gpu.create_texture(extent, TextureFormat::Rgba8),
        SlotKind::History { layers } => gpu.create_array_texture(extent, format, layers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftBackend;

    fn pool(gpu: &mut SoftBackend) -> TexturePool {
        TexturePool::new(gpu, Extent::new(8, 4), TextureFormat::Rgba8, 4).unwrap()
    }

    #[test]
    fn new_pool_owns_scratch_and_frame() {
        let mut gpu = SoftBackend::new();
        let p = pool(&mut gpu);
        assert_eq!(p.len(), 2);
        assert_eq!(p.layers(p.blend_scratch()), 4);
        let frame = p.texture(p.frame_texture()).unwrap();
        assert_eq!(gpu.format_of(frame), Some(TextureFormat::Rgba8));
    }

    #[test]
    fn handle_counter_wraps_past_live_handles() {
        let mut gpu = SoftBackend::new();
        let mut p = pool(&mut gpu);
        let scratch = p.blend_scratch();
        let frame = p.frame_texture();
        assert_eq!((scratch, frame), (TexHandle(1), TexHandle(2)));

        p.next = u32::MAX;
        let last = p.alloc_image(&mut gpu).unwrap();
        assert_eq!(last, TexHandle(u32::MAX));
        let wrapped = p.alloc_image(&mut gpu).unwrap();
        assert_eq!(wrapped, TexHandle(3));
        assert_eq!(p.len(), 4);
        assert!(p.texture(scratch).is_some());
        assert!(p.texture(last).is_some());
    }

    #[test]
    fn blend_capacity_clamped_by_backend() {
        let mut gpu = SoftBackend::new().with_max_array_layers(3);
        let p = TexturePool::new(&mut gpu, Extent::new(2, 2), TextureFormat::Rgba8, 32).unwrap();
        assert_eq!(p.blend_layers(), 3);
    }

    #[test]
    fn history_depth_bounds_are_checked() {
        let mut gpu = SoftBackend::new().with_max_array_layers(8);
        let mut p = pool(&mut gpu);
        assert!(matches!(
            p.alloc_history(&mut gpu, 0),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(p.alloc_history(&mut gpu, 9).is_err());
        assert!(p.alloc_history(&mut gpu, 8).is_ok());
    }

    #[test]
    fn handles_survive_migration_with_new_backing() {
        let mut gpu = SoftBackend::new();
        let mut p = pool(&mut gpu);
        let h = p.alloc_image(&mut gpu).unwrap();
        let before = p.texture(h).unwrap();
        gpu.fill(before, [0.0, 1.0, 0.0, 1.0]);

        assert!(p
            .migrate(&mut gpu, Extent::new(16, 8), TextureFormat::Rgba16F)
            .unwrap());
        let after = p.texture(h).unwrap();
        assert_ne!(before, after);
        assert_eq!(gpu.extent_of(after), Some(Extent::new(16, 8)));
        assert_eq!(gpu.format_of(after), Some(TextureFormat::Rgba16F));
        assert_eq!(gpu.texel(after, 0, 15, 7), Some([0.0, 1.0, 0.0, 1.0]));
        assert_eq!(gpu.extent_of(before), None);
    }

    #[test]
    fn format_only_change_keeps_frame_texture() {
        let mut gpu = SoftBackend::new();
        let mut p = pool(&mut gpu);
        let frame = p.texture(p.frame_texture()).unwrap();
        p.migrate(&mut gpu, p.extent(), TextureFormat::Rgba32F)
            .unwrap();
        assert_eq!(p.texture(p.frame_texture()), Some(frame));
        assert_eq!(p.format(), TextureFormat::Rgba32F);
    }

    #[test]
    fn noop_migration_reports_unchanged() {
        let mut gpu = SoftBackend::new();
        let mut p = pool(&mut gpu);
        assert!(!p.migrate(&mut gpu, p.extent(), p.format()).unwrap());
    }

    #[test]
    fn failed_allocation_leaves_pool_untouched() {
        let mut gpu = SoftBackend::new();
        let mut p = pool(&mut gpu);
        let h = p.alloc_image(&mut gpu).unwrap();
        let tex = p.texture(h).unwrap();
        let live = gpu.live_textures();

        gpu.fail_allocations_after(1);
        let err = p
            .migrate(&mut gpu, Extent::new(32, 32), TextureFormat::Rgba8)
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(p.extent(), Extent::new(8, 4));
        assert_eq!(p.texture(h), Some(tex));
        assert_eq!(gpu.live_textures(), live);
    }

    #[test]
    fn utility_textures_cannot_be_freed() {
        let mut gpu = SoftBackend::new();
        let mut p = pool(&mut gpu);
        let scratch = p.blend_scratch();
        p.free(&mut gpu, scratch);
        assert!(p.contains(scratch));
    }
}
