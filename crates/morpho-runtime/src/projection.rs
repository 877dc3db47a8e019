use morpho_core::Extent;

/// Aspect-preserving orthographic frame shared by every operation.
///
/// The short side spans `[-1, 1]`; the long side spans `[-ratio, ratio]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ortho {
    pub left: f32,
    pub right: f32,
    pub bottom: f32,
    pub top: f32,
}

impl Ortho {
    pub fn for_extent(extent: Extent) -> Self {
        let ratio = extent.aspect();
        if extent.width > extent.height {
            let top = 1.0;
            let right = top * ratio;
            Self {
                left: -right,
                right,
                bottom: -top,
                top,
            }
        } else {
            let right = 1.0;
            let top = right / ratio;
            Self {
                left: -right,
                right,
                bottom: -top,
                top,
            }
        }
    }

    /// Column-major orthographic matrix with near = -1, far = 1.
    pub fn matrix(&self) -> [f32; 16] {
        let (l, r, b, t) = (self.left, self.right, self.bottom, self.top);
        let (n, f) = (-1.0f32, 1.0f32);
        [
            2.0 / (r - l),
            0.0,
            0.0,
            0.0,
            0.0,
            2.0 / (t - b),
            0.0,
            0.0,
            0.0,
            0.0,
            -2.0 / (f - n),
            0.0,
            -(r + l) / (r - l),
            -(t + b) / (t - b),
            -(f + n) / (f - n),
            1.0,
        ]
    }

    /// Quad corners as a triangle strip: bottom-left, bottom-right, top-left, top-right.
    pub fn quad_positions(&self) -> [f32; 8] {
        [
            self.left,
            self.bottom,
            self.right,
            self.bottom,
            self.left,
            self.top,
            self.right,
            self.top,
        ]
    }
}

/// Texture coordinates matching [`Ortho::quad_positions`].
pub const QUAD_TEX_COORDS: [f32; 8] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
