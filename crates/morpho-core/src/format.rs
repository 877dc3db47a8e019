use serde::{Deserialize, Serialize};

/// Pixel formats the texture pool can allocate.
///
/// All formats are four-channel; capture always reads back as RGBA8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextureFormat {
    #[default]
    Rgba8,
    Rgba16,
    #[serde(rename = "rgba16f")]
    Rgba16F,
    #[serde(rename = "rgba32f")]
    Rgba32F,
}

impl TextureFormat {
    pub const ALL: [TextureFormat; 4] = [
        TextureFormat::Rgba8,
        TextureFormat::Rgba16,
        TextureFormat::Rgba16F,
        TextureFormat::Rgba32F,
    ];

    /// True when readback can transfer this format directly as 8-bit RGBA.
    pub fn is_rgba8(self) -> bool {
        matches!(self, TextureFormat::Rgba8)
    }

    pub fn bytes_per_texel(self) -> usize {
        match self {
            TextureFormat::Rgba8 => 4,
            TextureFormat::Rgba16 | TextureFormat::Rgba16F => 8,
            TextureFormat::Rgba32F => 16,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TextureFormat::Rgba8 => "rgba8",
            TextureFormat::Rgba16 => "rgba16",
            TextureFormat::Rgba16F => "rgba16f",
            TextureFormat::Rgba32F => "rgba32f",
        }
    }
}

/// Texture dimensions in texels. Both sides are always >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    pub fn texels(self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of a tightly packed RGBA8 image of this extent.
    pub fn rgba8_len(self) -> usize {
        self.texels() * 4
    }

    pub fn aspect(self) -> f32 {
        self.width as f32 / self.height as f32
    }
}
