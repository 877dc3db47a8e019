//! Staging of externally decoded video frames.
//!
//! Each device gets one pool texture. The ingestion side hands over still images at its own
//! pace; before an iteration the latest image of every device that changed is letterboxed into
//! the pool extent and uploaded.

use std::collections::BTreeMap;

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use morpho_core::{DeviceId, EngineError, Extent};

use crate::backend::GpuBackend;
use crate::pool::{TexHandle, TexturePool};

const OPAQUE_BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Scale `image` down (never up) to fit `extent`, preserving aspect, centred on opaque black.
pub fn letterbox(image: &RgbaImage, extent: Extent) -> RgbaImage {
    let (w, h) = image.dimensions();
    let mut canvas = RgbaImage::from_pixel(extent.width, extent.height, OPAQUE_BLACK);
    if w == 0 || h == 0 {
        return canvas;
    }
    let scale = (extent.width as f32 / w as f32)
        .min(extent.height as f32 / h as f32)
        .min(1.0);
    let dw = ((w as f32 * scale).round() as u32).clamp(1, extent.width);
    let dh = ((h as f32 * scale).round() as u32).clamp(1, extent.height);
    let x = i64::from((extent.width - dw) / 2);
    let y = i64::from((extent.height - dh) / 2);
    if (dw, dh) == (w, h) {
        imageops::overlay(&mut canvas, image, x, y);
    } else {
        let scaled = imageops::resize(image, dw, dh, FilterType::Triangle);
        imageops::overlay(&mut canvas, &scaled, x, y);
    }
    canvas
}

#[derive(Debug)]
struct Device {
    tex: TexHandle,
    latest: Option<RgbaImage>,
    dirty: bool,
}

#[derive(Debug, Default)]
pub struct VideoInputs {
    devices: BTreeMap<DeviceId, Device>,
}

impl VideoInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate (or return the existing) texture of `dev`.
    pub fn gen_texture<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
        pool: &mut TexturePool,
        dev: &DeviceId,
    ) -> Result<TexHandle, EngineError> {
        if let Some(d) = self.devices.get(dev) {
            return Ok(d.tex);
        }
        let tex = pool.alloc_image(gpu)?;
        tracing::debug!(device = %dev, handle = tex.0, "video texture allocated");
        self.devices.insert(
            dev.clone(),
            Device {
                tex,
                latest: None,
                dirty: false,
            },
        );
        Ok(tex)
    }

    pub fn del_texture<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
        pool: &mut TexturePool,
        dev: &DeviceId,
    ) -> bool {
        match self.devices.remove(dev) {
            Some(d) => {
                pool.free(gpu, d.tex);
                true
            }
            None => false,
        }
    }

    pub fn texture(&self, dev: &DeviceId) -> Option<TexHandle> {
        self.devices.get(dev).map(|d| d.tex)
    }

    /// Replace the pending frame of `dev`. Frames for unknown devices are dropped.
    pub fn set_frame(&mut self, dev: &DeviceId, image: RgbaImage) -> bool {
        match self.devices.get_mut(dev) {
            Some(d) => {
                d.latest = Some(image);
                d.dirty = true;
                true
            }
            None => {
                tracing::debug!(device = %dev, "frame for unknown video device dropped");
                false
            }
        }
    }

    /// Upload every frame that arrived since the last call.
    pub fn upload_pending<B: GpuBackend + ?Sized>(&mut self, gpu: &mut B, pool: &TexturePool) {
        let extent = pool.extent();
        for d in self.devices.values_mut().filter(|d| d.dirty) {
            d.dirty = false;
            let (Some(img), Some(tex)) = (d.latest.as_ref(), pool.texture(d.tex)) else {
                continue;
            };
            let boxed = letterbox(img, extent);
            gpu.upload_rgba8(tex, extent, boxed.as_raw());
        }
    }

    /// Mark every device with a frame for re-upload (after a migration).
    pub fn invalidate(&mut self) {
        for d in self.devices.values_mut() {
            d.dirty = d.latest.is_some();
        }
    }

    pub fn clear<B: GpuBackend + ?Sized>(&mut self, gpu: &mut B, pool: &mut TexturePool) {
        for (_, d) in std::mem::take(&mut self.devices) {
            pool.free(gpu, d.tex);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_centres_wide_image() {
        let img = RgbaImage::from_pixel(4, 2, Rgba([255, 0, 0, 255]));
        let out = letterbox(&img, Extent::new(4, 4));
        assert_eq!(out.dimensions(), (4, 4));
        assert_eq!(*out.get_pixel(0, 0), OPAQUE_BLACK);
        assert_eq!(*out.get_pixel(0, 1), Rgba([255, 0, 0, 255]));
        assert_eq!(*out.get_pixel(3, 2), Rgba([255, 0, 0, 255]));
        assert_eq!(*out.get_pixel(3, 3), OPAQUE_BLACK);
    }

    #[test]
    fn letterbox_never_upscales() {
        let img = RgbaImage::from_pixel(2, 2, Rgba([0, 255, 0, 255]));
        let out = letterbox(&img, Extent::new(6, 6));
        assert_eq!(*out.get_pixel(2, 2), Rgba([0, 255, 0, 255]));
        assert_eq!(*out.get_pixel(1, 1), OPAQUE_BLACK);
        assert_eq!(*out.get_pixel(4, 4), OPAQUE_BLACK);
    }

    #[test]
    fn letterbox_downscales_to_fit() {
        let img = RgbaImage::from_pixel(16, 8, Rgba([9, 9, 9, 255]));
        let out = letterbox(&img, Extent::new(8, 8));
        assert_eq!(*out.get_pixel(4, 4), Rgba([9, 9, 9, 255]));
        assert_eq!(*out.get_pixel(4, 0), OPAQUE_BLACK);
    }
}
