use glow::HasContext;

use morpho_core::EngineError;
use morpho_runtime::{Ortho, QUAD_TEX_COORDS};

/// Aspect-correct quad drawn as a 4-vertex triangle strip.
///
/// Attribute 0 is the position (rewritten on every projection change), attribute 1 the
/// texture coordinate.
#[derive(Debug)]
pub struct OrthoQuad {
    vao: glow::NativeVertexArray,
    pos_vbo: glow::NativeBuffer,
    uv_vbo: glow::NativeBuffer,
}

impl OrthoQuad {
    pub unsafe fn new(gl: &glow::Context, ortho: &Ortho) -> Result<Self, EngineError> {
        let vao = gl
            .create_vertex_array()
            .map_err(|e| EngineError::GlCreate(format!("create_vertex_array: {e}")))?;
        let pos_vbo = gl
            .create_buffer()
            .map_err(|e| EngineError::GlCreate(format!("create_buffer(pos): {e}")))?;
        let uv_vbo = gl
            .create_buffer()
            .map_err(|e| EngineError::GlCreate(format!("create_buffer(uv): {e}")))?;

        gl.bind_vertex_array(Some(vao));

        gl.bind_buffer(glow::ARRAY_BUFFER, Some(pos_vbo));
        gl.buffer_data_u8_slice(
            glow::ARRAY_BUFFER,
            bytemuck::cast_slice(&ortho.quad_positions()),
            glow::DYNAMIC_DRAW,
        );
        gl.enable_vertex_attrib_array(0);
        gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, 2 * 4, 0);

        gl.bind_buffer(glow::ARRAY_BUFFER, Some(uv_vbo));
        gl.buffer_data_u8_slice(
            glow::ARRAY_BUFFER,
            bytemuck::cast_slice(&QUAD_TEX_COORDS),
            glow::STATIC_DRAW,
        );
        gl.enable_vertex_attrib_array(1);
        gl.vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, 2 * 4, 0);

        gl.bind_buffer(glow::ARRAY_BUFFER, None);
        gl.bind_vertex_array(None);

        Ok(Self {
            vao,
            pos_vbo,
            uv_vbo,
        })
    }

    pub unsafe fn set_projection(&self, gl: &glow::Context, ortho: &Ortho) {
        gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.pos_vbo));
        gl.buffer_sub_data_u8_slice(
            glow::ARRAY_BUFFER,
            0,
            bytemuck::cast_slice(&ortho.quad_positions()),
        );
        gl.bind_buffer(glow::ARRAY_BUFFER, None);
    }

    pub unsafe fn draw(&self, gl: &glow::Context) {
        gl.bind_vertex_array(Some(self.vao));
        gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
        gl.bind_vertex_array(None);
    }

    pub unsafe fn destroy(&mut self, gl: &glow::Context) {
        gl.delete_vertex_array(self.vao);
        gl.delete_buffer(self.pos_vbo);
        gl.delete_buffer(self.uv_vbo);
    }
}
