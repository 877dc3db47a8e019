//! Shader programs and the GLSL-backed [`Transform`].

use std::collections::BTreeMap;

use glow::HasContext;

use morpho_core::EngineError;
use morpho_runtime::{Ortho, PassTargets, Transform};

use crate::GlBackend;

/// Vertex stage shared by every pass: ortho-projected quad, UV passed through.
pub const ORTHO_VERT: &str = r#"#version 330 core
layout (location = 0) in vec2 a_pos;
layout (location = 1) in vec2 a_uv;
uniform mat4 ortho;
out vec2 v_uv;
void main() {
    v_uv = a_uv;
    gl_Position = ortho * vec4(a_pos, 0.0, 1.0);
}
"#;

/// Weighted sum over the layers of a 2D-array texture.
pub const BLENDER_FRAG: &str = r#"#version 330 core
#define MAX_LAYERS 32
in vec2 v_uv;
out vec4 o;
uniform sampler2DArray inArrayTexture;
uniform float weights[MAX_LAYERS];
uniform int numLayers;
void main() {
    vec4 acc = vec4(0.0);
    for (int i = 0; i < numLayers; ++i) {
        acc += weights[i] * texture(inArrayTexture, vec3(v_uv, float(i)));
    }
    o = acc;
}
"#;

/// Copies `inTexture` unchanged.
pub const PASSTHROUGH_FRAG: &str = r#"#version 330 core
in vec2 v_uv;
out vec4 o;
uniform sampler2D inTexture;
void main() { o = texture(inTexture, v_uv); }
"#;

/// Blend program capacity; must match `MAX_LAYERS` in [`BLENDER_FRAG`].
pub const BLEND_CAPACITY: u32 = 32;

/// Compile and link a program. Shaders are detached and deleted on every path.
pub unsafe fn compile_program(
    gl: &glow::Context,
    vert_src: &str,
    frag_src: &str,
) -> Result<glow::NativeProgram, EngineError> {
    let vs = gl
        .create_shader(glow::VERTEX_SHADER)
        .map_err(|e| EngineError::GlCreate(format!("create_shader(VS): {e}")))?;
    gl.shader_source(vs, vert_src);
    gl.compile_shader(vs);
    if !gl.get_shader_compile_status(vs) {
        let log = gl.get_shader_info_log(vs);
        gl.delete_shader(vs);
        return Err(EngineError::VertexCompile(log));
    }

    let fs = match gl.create_shader(glow::FRAGMENT_SHADER) {
        Ok(fs) => fs,
        Err(e) => {
            gl.delete_shader(vs);
            return Err(EngineError::GlCreate(format!("create_shader(FS): {e}")));
        }
    };
    gl.shader_source(fs, frag_src);
    gl.compile_shader(fs);
    if !gl.get_shader_compile_status(fs) {
        let log = gl.get_shader_info_log(fs);
        gl.delete_shader(vs);
        gl.delete_shader(fs);
        return Err(EngineError::FragmentCompile(log));
    }

    let program = match gl.create_program() {
        Ok(p) => p,
        Err(e) => {
            gl.delete_shader(vs);
            gl.delete_shader(fs);
            return Err(EngineError::GlCreate(format!("create_program: {e}")));
        }
    };
    gl.attach_shader(program, vs);
    gl.attach_shader(program, fs);
    gl.link_program(program);

    gl.detach_shader(program, vs);
    gl.detach_shader(program, fs);
    gl.delete_shader(vs);
    gl.delete_shader(fs);

    if !gl.get_program_link_status(program) {
        let log = gl.get_program_info_log(program);
        gl.delete_program(program);
        return Err(EngineError::Link(log));
    }

    Ok(program)
}

/// A fragment shader run as an operation's transform.
///
/// Uniforms set on every pass:
/// - `ortho` (mat4), from the last projection change
/// - `inTexture` (sampler2D, unit 0), when the operation has an input
/// - `inArrayTexture` (sampler2DArray, unit 1) and `arrayDepth` (int), when it keeps history
/// - `iteration` (float) and `resolution` (vec2)
/// - every parameter registered with [`ShaderTransform::set_param`]
///
/// A shader that fails to build leaves the transform not ready; the engine skips it until a
/// successful [`ShaderTransform::reload`].
#[derive(Debug)]
pub struct ShaderTransform {
    name: String,
    program: Option<glow::NativeProgram>,
    error: Option<String>,
    params: BTreeMap<String, Vec<f32>>,
    ortho: [f32; 16],
}

impl ShaderTransform {
    pub fn new(gpu: &GlBackend, name: impl Into<String>, frag_src: &str) -> Self {
        let mut t = Self {
            name: name.into(),
            program: None,
            error: None,
            params: BTreeMap::new(),
            ortho: gpu.ortho().matrix(),
        };
        t.reload(gpu, frag_src);
        t
    }

    /// Rebuild from new source. On failure the previous program is dropped as well.
    pub fn reload(&mut self, gpu: &GlBackend, frag_src: &str) {
        let gl = gpu.gl();
        if let Some(old) = self.program.take() {
            unsafe { gl.delete_program(old) };
        }
        match unsafe { compile_program(gl, ORTHO_VERT, frag_src) } {
            Ok(p) => {
                tracing::debug!(name = %self.name, "shader program linked");
                self.program = Some(p);
                self.error = None;
            }
            Err(e) => {
                tracing::warn!(name = %self.name, error = %e, "shader program unavailable");
                self.error = Some(e.to_string());
            }
        }
    }

    /// Last build error, if the program is not ready.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Register a float uniform (1 to 4 components map to float/vec2/vec3/vec4, longer
    /// values to a float array).
    pub fn set_param(&mut self, name: impl Into<String>, values: &[f32]) {
        self.params.insert(name.into(), values.to_vec());
    }

    pub fn param(&self, name: &str) -> Option<&[f32]> {
        self.params.get(name).map(Vec::as_slice)
    }

    unsafe fn apply_uniforms(
        &self,
        gl: &glow::Context,
        program: glow::NativeProgram,
        pass: &PassTargets,
    ) {
        let loc = |n: &str| gl.get_uniform_location(program, n);

        gl.uniform_matrix_4_f32_slice(loc("ortho").as_ref(), false, &self.ortho);
        gl.uniform_1_f32(loc("iteration").as_ref(), pass.iteration as f32);
        gl.uniform_2_f32(
            loc("resolution").as_ref(),
            pass.extent.width as f32,
            pass.extent.height as f32,
        );

        for (name, v) in &self.params {
            let l = loc(name);
            match v.as_slice() {
                [] => {}
                [x] => gl.uniform_1_f32(l.as_ref(), *x),
                [x, y] => gl.uniform_2_f32(l.as_ref(), *x, *y),
                [x, y, z] => gl.uniform_3_f32(l.as_ref(), *x, *y, *z),
                [x, y, z, w] => gl.uniform_4_f32(l.as_ref(), *x, *y, *z, *w),
                many => gl.uniform_1_f32_slice(l.as_ref(), many),
            }
        }
    }
}

impl Transform<GlBackend> for ShaderTransform {
    fn render(&mut self, gpu: &mut GlBackend, pass: &PassTargets) -> Result<(), EngineError> {
        let Some(program) = self.program else {
            return Ok(());
        };
        let input = pass.input.and_then(|t| gpu.native_texture(t));
        let history = pass
            .history
            .and_then(|(t, depth)| gpu.native_texture(t).map(|n| (n, depth)));

        gpu.begin_pass(pass.output, pass.extent)?;
        {
            let gl = gpu.gl();
            unsafe {
                gl.use_program(Some(program));
                self.apply_uniforms(gl, program, pass);

                if let Some(tex) = input {
                    gl.active_texture(glow::TEXTURE0);
                    gl.bind_texture(glow::TEXTURE_2D, Some(tex));
                    gl.uniform_1_i32(gl.get_uniform_location(program, "inTexture").as_ref(), 0);
                }
                if let Some((arr, depth)) = history {
                    gl.active_texture(glow::TEXTURE1);
                    gl.bind_texture(glow::TEXTURE_2D_ARRAY, Some(arr));
                    gl.uniform_1_i32(
                        gl.get_uniform_location(program, "inArrayTexture").as_ref(),
                        1,
                    );
                    gl.uniform_1_i32(
                        gl.get_uniform_location(program, "arrayDepth").as_ref(),
                        depth as i32,
                    );
                }
            }
        }
        gpu.draw_quad();
        unsafe {
            let gl = gpu.gl();
            gl.active_texture(glow::TEXTURE1);
            gl.bind_texture(glow::TEXTURE_2D_ARRAY, None);
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(glow::TEXTURE_2D, None);
            gl.use_program(None);
        }
        gpu.end_pass();
        Ok(())
    }

    fn adjust_projection(&mut self, _gpu: &mut GlBackend, ortho: &Ortho) {
        self.ortho = ortho.matrix();
    }

    fn is_ready(&self) -> bool {
        self.program.is_some()
    }

    fn release(&mut self, gpu: &mut GlBackend) {
        if let Some(p) = self.program.take() {
            unsafe { gpu.gl().delete_program(p) };
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blender_capacity_matches_shader_define() {
        let define = format!("#define MAX_LAYERS {BLEND_CAPACITY}");
        assert!(BLENDER_FRAG.contains(&define));
    }

    #[test]
    fn vertex_stage_declares_quad_attributes() {
        assert!(ORTHO_VERT.contains("layout (location = 0) in vec2 a_pos"));
        assert!(ORTHO_VERT.contains("layout (location = 1) in vec2 a_uv"));
        assert!(ORTHO_VERT.contains("uniform mat4 ortho"));
    }
}
