//! morpho runtime (glow/OpenGL backend)
//
// Implements `morpho_runtime::GpuBackend` on a current OpenGL 4.3+ context:
// - immutable-storage textures and 2D arrays
// - layer copies via glCopyImageSubData, scaling via framebuffer blits
// - the weighted layer blender
// - fences and PBO readback
//
// Context creation, windows and swap are the host's job.
#![allow(clippy::missing_safety_doc)]

mod program;
mod quad;

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use glow::HasContext;

use morpho_core::{EngineError, Extent, FenceToken, TextureFormat};
use morpho_runtime::{FenceStatus, Filter, GpuBackend, Layer, Ortho, TextureId};

pub use program::{
    compile_program, ShaderTransform, BLENDER_FRAG, BLEND_CAPACITY, ORTHO_VERT, PASSTHROUGH_FRAG,
};
pub use quad::OrthoQuad;

/// GL internal format for each engine format.
pub fn internal_format(format: TextureFormat) -> u32 {
    match format {
        TextureFormat::Rgba8 => glow::RGBA8,
        TextureFormat::Rgba16 => glow::RGBA16,
        TextureFormat::Rgba16F => glow::RGBA16F,
        TextureFormat::Rgba32F => glow::RGBA32F,
    }
}

/// Largest centred rectangle of `src`'s aspect inside a `dst_w` x `dst_h` window, as
/// `(x0, y0, x1, y1)`.
pub fn fit_rect(src: Extent, dst_w: u32, dst_h: u32) -> (i32, i32, i32, i32) {
    let (dw, dh) = (dst_w.max(1) as f64, dst_h.max(1) as f64);
    let scale = (dw / src.width as f64).min(dh / src.height as f64);
    let w = (src.width as f64 * scale).round();
    let h = (src.height as f64 * scale).round();
    let x0 = ((dw - w) / 2.0).floor();
    let y0 = ((dh - h) / 2.0).floor();
    (x0 as i32, y0 as i32, (x0 + w) as i32, (y0 + h) as i32)
}

#[derive(Debug, Clone, Copy)]
struct GlTexture {
    tex: glow::NativeTexture,
    layers: Option<u32>,
}

impl GlTexture {
    fn target(&self) -> u32 {
        if self.layers.is_some() {
            glow::TEXTURE_2D_ARRAY
        } else {
            glow::TEXTURE_2D
        }
    }
}

/// OpenGL implementation of [`GpuBackend`]. Must only be used on the thread owning the
/// context.
pub struct GlBackend {
    gl: glow::Context,
    read_fbo: glow::NativeFramebuffer,
    draw_fbo: glow::NativeFramebuffer,
    quad: OrthoQuad,
    blender: glow::NativeProgram,
    ortho: Ortho,
    textures: HashMap<TextureId, GlTexture>,
    fences: HashMap<FenceToken, glow::NativeFence>,
    next_fence: u64,
    staging: glow::NativeBuffer,
    staging_len: usize,
    max_layers: u32,
}

impl std::fmt::Debug for GlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlBackend")
            .field("textures", &self.textures.len())
            .field("fences", &self.fences.len())
            .field("staging_len", &self.staging_len)
            .field("max_layers", &self.max_layers)
            .finish_non_exhaustive()
    }
}

impl GlBackend {
    /// Build the backend on a current context. The projection starts as the unit square and
    /// is replaced by the engine on construction.
    pub fn new(gl: glow::Context) -> Result<Self, EngineError> {
        unsafe {
            let max_layers = gl.get_parameter_i32(glow::MAX_ARRAY_TEXTURE_LAYERS).max(1) as u32;
            let ortho = Ortho::for_extent(Extent::new(1, 1));

            let read_fbo = gl
                .create_framebuffer()
                .map_err(|e| EngineError::GlCreate(format!("create_framebuffer(read): {e}")))?;
            let draw_fbo = gl
                .create_framebuffer()
                .map_err(|e| EngineError::GlCreate(format!("create_framebuffer(draw): {e}")))?;
            let quad = OrthoQuad::new(&gl, &ortho)?;
            let blender = compile_program(&gl, ORTHO_VERT, BLENDER_FRAG)?;
            let staging = gl
                .create_buffer()
                .map_err(|e| EngineError::GlCreate(format!("create_buffer(staging): {e}")))?;

            tracing::info!(
                max_layers,
                version = %gl.get_parameter_string(glow::VERSION),
                "gl backend ready"
            );

            let backend = Self {
                gl,
                read_fbo,
                draw_fbo,
                quad,
                blender,
                ortho,
                textures: HashMap::new(),
                fences: HashMap::new(),
                next_fence: 1,
                staging,
                staging_len: 0,
                max_layers,
            };
            backend.upload_blender_projection();
            Ok(backend)
        }
    }

    pub fn gl(&self) -> &glow::Context {
        &self.gl
    }

    /// Projection last passed to [`GpuBackend::set_projection`].
    pub fn ortho(&self) -> &Ortho {
        &self.ortho
    }

    pub fn native_texture(&self, id: TextureId) -> Option<glow::NativeTexture> {
        self.textures.get(&id).map(|t| t.tex)
    }

    /// Bind `output` as the draw target, set the viewport and clear it to opaque black.
    pub fn begin_pass(&mut self, output: TextureId, extent: Extent) -> Result<(), EngineError> {
        let t = *self
            .textures
            .get(&output)
            .ok_or(EngineError::UnknownTexture(output.0))?;
        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.draw_fbo));
            self.attach(glow::FRAMEBUFFER, t, 0);
            self.gl.viewport(0, 0, extent.width as i32, extent.height as i32);
            self.gl.clear_color(0.0, 0.0, 0.0, 1.0);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
        Ok(())
    }

    /// Draw the projection quad with whatever program is bound.
    pub fn draw_quad(&self) {
        unsafe { self.quad.draw(&self.gl) };
    }

    pub fn end_pass(&mut self) {
        unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, None) };
    }

    /// Letterboxed blit of `tex` onto the default framebuffer.
    pub fn present(&mut self, tex: TextureId, extent: Extent, window_w: u32, window_h: u32) {
        let Some(t) = self.textures.get(&tex).copied() else {
            return;
        };
        let (x0, y0, x1, y1) = fit_rect(extent, window_w, window_h);
        unsafe {
            let gl = &self.gl;
            gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, None);
            gl.viewport(0, 0, window_w as i32, window_h as i32);
            gl.clear_color(0.0, 0.0, 0.0, 1.0);
            gl.clear(glow::COLOR_BUFFER_BIT);

            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(self.read_fbo));
            self.attach(glow::READ_FRAMEBUFFER, t, 0);
            gl.blit_framebuffer(
                0,
                0,
                extent.width as i32,
                extent.height as i32,
                x0,
                y0,
                x1,
                y1,
                glow::COLOR_BUFFER_BIT,
                glow::LINEAR,
            );
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
        }
    }

    unsafe fn attach(&self, target: u32, t: GlTexture, layer: u32) {
        match t.layers {
            Some(_) => self.gl.framebuffer_texture_layer(
                target,
                glow::COLOR_ATTACHMENT0,
                Some(t.tex),
                0,
                layer as i32,
            ),
            None => self.gl.framebuffer_texture_2d(
                target,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(t.tex),
                0,
            ),
        }
    }

    unsafe fn upload_blender_projection(&self) {
        let gl = &self.gl;
        gl.use_program(Some(self.blender));
        gl.uniform_matrix_4_f32_slice(
            gl.get_uniform_location(self.blender, "ortho").as_ref(),
            false,
            &self.ortho.matrix(),
        );
        gl.use_program(None);
    }

    fn allocate(
        &mut self,
        extent: Extent,
        format: TextureFormat,
        layers: Option<u32>,
    ) -> Result<TextureId, EngineError> {
        unsafe {
            let gl = &self.gl;
            drain_errors(gl);

            let tex = gl
                .create_texture()
                .map_err(|e| EngineError::Allocation(format!("create_texture: {e}")))?;
            let t = GlTexture { tex, layers };
            let target = t.target();
            gl.bind_texture(target, Some(tex));
            match layers {
                Some(n) => gl.tex_storage_3d(
                    target,
                    1,
                    internal_format(format),
                    extent.width as i32,
                    extent.height as i32,
                    n as i32,
                ),
                None => gl.tex_storage_2d(
                    target,
                    1,
                    internal_format(format),
                    extent.width as i32,
                    extent.height as i32,
                ),
            }
            gl.tex_parameter_i32(target, glow::TEXTURE_MIN_FILTER, glow::NEAREST as i32);
            gl.tex_parameter_i32(target, glow::TEXTURE_MAG_FILTER, glow::NEAREST as i32);
            gl.tex_parameter_i32(target, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            gl.tex_parameter_i32(target, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
            gl.bind_texture(target, None);

            let err = gl.get_error();
            if err != glow::NO_ERROR {
                gl.delete_texture(tex);
                return Err(EngineError::Allocation(format!(
                    "{}x{} {} x{} layers: gl error 0x{err:04x}",
                    extent.width,
                    extent.height,
                    format.name(),
                    layers.unwrap_or(1)
                )));
            }

            let id = TextureId(tex.0.get());
            self.textures.insert(id, t);
            Ok(id)
        }
    }

    fn clear_to(&mut self, tex: TextureId, layer: u32, rgba: [f32; 4]) {
        let Some(t) = self.textures.get(&tex).copied() else {
            return;
        };
        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.draw_fbo));
            self.attach(glow::FRAMEBUFFER, t, layer);
            self.gl.clear_color(rgba[0], rgba[1], rgba[2], rgba[3]);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
    }
}

impl GpuBackend for GlBackend {
    fn max_array_layers(&self) -> u32 {
        self.max_layers
    }

    fn max_blend_layers(&self) -> u32 {
        self.max_layers.min(BLEND_CAPACITY)
    }

    fn create_texture(
        &mut self,
        extent: Extent,
        format: TextureFormat,
    ) -> Result<TextureId, EngineError> {
        self.allocate(extent, format, None)
    }

    fn create_array_texture(
        &mut self,
        extent: Extent,
        format: TextureFormat,
        layers: u32,
    ) -> Result<TextureId, EngineError> {
        if layers == 0 || layers > self.max_layers {
            return Err(EngineError::invalid(format!(
                "array depth {layers} outside 1..={}",
                self.max_layers
            )));
        }
        self.allocate(extent, format, Some(layers))
    }

    fn delete_texture(&mut self, tex: TextureId) {
        if let Some(t) = self.textures.remove(&tex) {
            unsafe { self.gl.delete_texture(t.tex) };
        }
    }

    fn clear(&mut self, tex: TextureId, layers: u32) {
        for layer in 0..layers.max(1) {
            self.clear_to(tex, layer, [0.0, 0.0, 0.0, 1.0]);
        }
    }

    fn clear_layer(&mut self, layer: Layer) {
        self.clear_to(layer.tex, layer.layer, [0.0, 0.0, 0.0, 1.0]);
    }

    fn fill(&mut self, tex: TextureId, rgba: [f32; 4]) {
        self.clear_to(tex, 0, rgba);
    }

    fn copy(&mut self, src: Layer, dst: Layer, extent: Extent) {
        let (Some(s), Some(d)) = (
            self.textures.get(&src.tex).copied(),
            self.textures.get(&dst.tex).copied(),
        ) else {
            return;
        };
        unsafe {
            self.gl.copy_image_sub_data(
                s.tex,
                s.target(),
                0,
                0,
                0,
                src.layer as i32,
                d.tex,
                d.target(),
                0,
                0,
                0,
                dst.layer as i32,
                extent.width as i32,
                extent.height as i32,
                1,
            );
        }
    }

    fn blit(
        &mut self,
        src: TextureId,
        src_extent: Extent,
        dst: TextureId,
        dst_extent: Extent,
        filter: Filter,
    ) {
        let (Some(s), Some(d)) = (
            self.textures.get(&src).copied(),
            self.textures.get(&dst).copied(),
        ) else {
            return;
        };
        let filter = match filter {
            Filter::Nearest => glow::NEAREST,
            Filter::Linear => glow::LINEAR,
        };
        unsafe {
            let gl = &self.gl;
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(self.read_fbo));
            self.attach(glow::READ_FRAMEBUFFER, s, 0);
            gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, Some(self.draw_fbo));
            self.attach(glow::DRAW_FRAMEBUFFER, d, 0);
            gl.blit_framebuffer(
                0,
                0,
                src_extent.width as i32,
                src_extent.height as i32,
                0,
                0,
                dst_extent.width as i32,
                dst_extent.height as i32,
                glow::COLOR_BUFFER_BIT,
                filter,
            );
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
            gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, None);
        }
    }

    fn upload_rgba8(&mut self, tex: TextureId, extent: Extent, pixels: &[u8]) {
        let Some(t) = self.textures.get(&tex).copied() else {
            return;
        };
        if pixels.len() < extent.rgba8_len() {
            tracing::warn!(
                expected = extent.rgba8_len(),
                got = pixels.len(),
                "short upload ignored"
            );
            return;
        }
        unsafe {
            let gl = &self.gl;
            gl.bind_texture(glow::TEXTURE_2D, Some(t.tex));
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            gl.tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                0,
                0,
                extent.width as i32,
                extent.height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(pixels),
            );
            gl.bind_texture(glow::TEXTURE_2D, None);
        }
    }

    fn blend_layers(&mut self, layers: TextureId, weights: &[f32], dst: TextureId, extent: Extent) {
        let Some(arr) = self.textures.get(&layers).copied() else {
            return;
        };
        let mut padded = [0.0f32; BLEND_CAPACITY as usize];
        let n = weights.len().min(padded.len());
        padded[..n].copy_from_slice(&weights[..n]);

        if self.begin_pass(dst, extent).is_err() {
            return;
        }
        unsafe {
            let gl = &self.gl;
            gl.use_program(Some(self.blender));
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(glow::TEXTURE_2D_ARRAY, Some(arr.tex));
            gl.uniform_1_i32(
                gl.get_uniform_location(self.blender, "inArrayTexture").as_ref(),
                0,
            );
            gl.uniform_1_f32_slice(
                gl.get_uniform_location(self.blender, "weights").as_ref(),
                &padded,
            );
            gl.uniform_1_i32(
                gl.get_uniform_location(self.blender, "numLayers").as_ref(),
                n as i32,
            );
            self.quad.draw(gl);
            gl.bind_texture(glow::TEXTURE_2D_ARRAY, None);
            gl.use_program(None);
        }
        self.end_pass();
    }

    fn set_projection(&mut self, ortho: &Ortho) {
        self.ortho = *ortho;
        unsafe {
            self.quad.set_projection(&self.gl, ortho);
            self.upload_blender_projection();
        }
    }

    fn insert_fence(&mut self) -> Result<FenceToken, EngineError> {
        let fence = unsafe { self.gl.fence_sync(glow::SYNC_GPU_COMMANDS_COMPLETE, 0) }
            .map_err(|e| EngineError::GlCreate(format!("fence_sync: {e}")))?;
        let token = FenceToken(self.next_fence);
        self.next_fence += 1;
        self.fences.insert(token, fence);
        Ok(token)
    }

    fn poll_fence(&mut self, fence: FenceToken, timeout: Duration) -> FenceStatus {
        let Some(f) = self.fences.get(&fence).copied() else {
            return FenceStatus::Failed;
        };
        let ns = timeout.as_nanos().min(i32::MAX as u128) as i32;
        match unsafe { self.gl.client_wait_sync(f, glow::SYNC_FLUSH_COMMANDS_BIT, ns) } {
            glow::ALREADY_SIGNALED | glow::CONDITION_SATISFIED => FenceStatus::Signaled,
            glow::TIMEOUT_EXPIRED => FenceStatus::Pending,
            _ => FenceStatus::Failed,
        }
    }

    fn delete_fence(&mut self, fence: FenceToken) {
        if let Some(f) = self.fences.remove(&fence) {
            unsafe { self.gl.delete_sync(f) };
        }
    }

    fn resize_staging(&mut self, bytes: usize) -> Result<(), EngineError> {
        let size = i32::try_from(bytes)
            .map_err(|_| EngineError::Allocation(format!("staging buffer of {bytes} bytes")))?;
        unsafe {
            let gl = &self.gl;
            drain_errors(gl);
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Some(self.staging));
            gl.buffer_data_size(glow::PIXEL_PACK_BUFFER, size, glow::STREAM_READ);
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
            if gl.get_error() == glow::OUT_OF_MEMORY {
                self.staging_len = 0;
                return Err(EngineError::Allocation(format!(
                    "staging buffer of {bytes} bytes"
                )));
            }
        }
        self.staging_len = bytes;
        Ok(())
    }

    fn read_to_staging(&mut self, src: TextureId, extent: Extent) {
        let Some(t) = self.textures.get(&src).copied() else {
            return;
        };
        if extent.rgba8_len() > self.staging_len {
            tracing::warn!(
                needed = extent.rgba8_len(),
                staging = self.staging_len,
                "staging buffer too small"
            );
            return;
        }
        unsafe {
            let gl = &self.gl;
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(self.read_fbo));
            self.attach(glow::READ_FRAMEBUFFER, t, 0);
            gl.read_buffer(glow::COLOR_ATTACHMENT0);
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Some(self.staging));
            gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            gl.read_pixels(
                0,
                0,
                extent.width as i32,
                extent.height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::BufferOffset(0),
            );
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
        }
    }

    fn map_staging(&mut self, dst: &mut [u8]) -> bool {
        let n = dst.len().min(self.staging_len);
        if n == 0 {
            return false;
        }
        unsafe {
            let gl = &self.gl;
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Some(self.staging));
            let ptr = gl.map_buffer_range(glow::PIXEL_PACK_BUFFER, 0, n as i32, glow::MAP_READ_BIT);
            if ptr.is_null() {
                gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
                return false;
            }
            std::ptr::copy_nonoverlapping(ptr as *const u8, dst.as_mut_ptr(), n);
            gl.unmap_buffer(glow::PIXEL_PACK_BUFFER);
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
        }
        true
    }
}

impl Drop for GlBackend {
    fn drop(&mut self) {
        unsafe {
            for (_, f) in self.fences.drain() {
                self.gl.delete_sync(f);
            }
            for (_, t) in self.textures.drain() {
                self.gl.delete_texture(t.tex);
            }
            self.quad.destroy(&self.gl);
            self.gl.delete_program(self.blender);
            self.gl.delete_buffer(self.staging);
            self.gl.delete_framebuffer(self.read_fbo);
            self.gl.delete_framebuffer(self.draw_fbo);
        }
    }
}

unsafe fn drain_errors(gl: &glow::Context) {
    for _ in 0..16 {
        if gl.get_error() == glow::NO_ERROR {
            break;
        }
    }
}

/// Texture id for a raw GL name, for hosts sharing textures with the engine.
pub fn texture_id(tex: glow::NativeTexture) -> TextureId {
    TextureId(tex.0.get())
}

/// Inverse of [`texture_id`].
pub fn native_from_id(id: TextureId) -> Option<glow::NativeTexture> {
    NonZeroU32::new(id.0).map(glow::NativeTexture)
}
