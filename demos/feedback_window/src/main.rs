use morpho_core::{load_engine_config_from, EngineConfig, EngineError, EngineEvent, OpId, SeedId};
use morpho_runtime::{Engine, IterationScheduler, OperationSpec, Pacer, SeedContent};
use morpho_runtime_glow::{GlBackend, ShaderTransform};

use std::num::NonZeroU32;
use std::time::Instant;

use winit::event::{ElementState, Event, KeyboardInput, VirtualKeyCode, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::window::WindowBuilder;

use glutin::display::GetGlDisplay;
use glutin::prelude::*;
use raw_window_handle::HasRawWindowHandle;

// Decaying average of the history ring plus a moving orb fed by the seed colour.
const ORB_FRAG: &str = r#"#version 330 core
in vec2 v_uv;
out vec4 o;

uniform sampler2D inTexture;
uniform sampler2DArray inArrayTexture;
uniform int arrayDepth;
uniform float iteration;
uniform vec2 resolution;

uniform float u_decay;
uniform float u_speed;

void main() {
    vec4 acc = vec4(0.0);
    for (int i = 0; i < arrayDepth; ++i) {
        acc += texture(inArrayTexture, vec3(v_uv, float(i)));
    }
    acc /= max(float(arrayDepth), 1.0);

    float t = iteration * u_speed;
    vec2 c = vec2(0.5 + 0.3 * sin(t * 0.7), 0.5 + 0.3 * cos(t * 1.1));
    float dot = smoothstep(0.06, 0.0, length(v_uv - c));
    vec4 tint = texture(inTexture, v_uv);

    o = vec4(max(acc.rgb * u_decay, tint.rgb * dot), 1.0);
}
"#;

const FEEDBACK_DEPTH: u32 = 8;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run() {
        tracing::error!(error = %e, "feedback_window failed");
        std::process::exit(1);
    }
}

fn load_config() -> Result<EngineConfig, EngineError> {
    match std::env::args().nth(1) {
        Some(path) => load_engine_config_from(path),
        None => Ok(EngineConfig {
            width: 1280,
            height: 720,
            target_fps: 60.0,
            initially_active: true,
            ..EngineConfig::default()
        }),
    }
}

fn run() -> Result<(), EngineError> {
    let cfg = load_config()?;
    let event_loop = EventLoop::new();

    let window_builder = WindowBuilder::new()
        .with_title("morpho: feedback window")
        .with_inner_size(winit::dpi::LogicalSize::new(960.0, 540.0));

    let template = glutin::config::ConfigTemplateBuilder::new().with_alpha_size(8);

    let display_builder =
        glutin_winit::DisplayBuilder::new().with_window_builder(Some(window_builder));

    let (window, gl_config) = display_builder
        .build(&event_loop, template, |mut configs| {
            configs.next().expect("at least one GL config")
        })
        .map_err(|e| EngineError::GlCreate(format!("DisplayBuilder.build: {e}")))?;

    let window = window
        .ok_or_else(|| EngineError::GlCreate("DisplayBuilder did not create a window".into()))?;
    let gl_display = gl_config.display();

    let raw_window_handle = window.raw_window_handle();

    let context_attributes = glutin::context::ContextAttributesBuilder::new()
        .with_profile(glutin::context::GlProfile::Core)
        .with_context_api(glutin::context::ContextApi::OpenGl(Some(
            glutin::context::Version::new(4, 3),
        )))
        .build(Some(raw_window_handle));

    let not_current_gl_context = unsafe {
        gl_display
            .create_context(&gl_config, &context_attributes)
            .map_err(|e| EngineError::GlCreate(format!("create_context: {e}")))?
    };

    let size = window.inner_size();
    let (sw, sh) = non_zero(size.width, size.height);
    let attrs = glutin::surface::SurfaceAttributesBuilder::<glutin::surface::WindowSurface>::new()
        .build(raw_window_handle, sw, sh);

    let gl_surface = unsafe {
        gl_display
            .create_window_surface(&gl_config, &attrs)
            .map_err(|e| EngineError::GlCreate(format!("create_window_surface: {e}")))?
    };

    let gl_context = not_current_gl_context
        .make_current(&gl_surface)
        .map_err(|e| EngineError::GlCreate(format!("make_current: {e}")))?;

    let gl = unsafe {
        glow::Context::from_loader_function(|s| match std::ffi::CString::new(s) {
            Ok(name) => gl_display.get_proc_address(name.as_c_str()) as *const _,
            Err(_) => std::ptr::null(),
        })
    };

    let mut engine = Engine::new(GlBackend::new(gl)?, &cfg)?;

    let seed = engine.init_seed(SeedId(1), SeedContent::Solid([1.0, 0.55, 0.2, 1.0]))?;
    let mut orb = ShaderTransform::new(engine.gpu(), "orb", ORB_FRAG);
    orb.set_param("u_decay", &[0.985]);
    orb.set_param("u_speed", &[0.02]);
    let out = engine.init_operation(
        OperationSpec::new(OpId(1), orb)
            .with_feedback(FEEDBACK_DEPTH)
            .with_blend()
            .with_blit(),
    )?;
    let previous = engine
        .operation(OpId(1))
        .and_then(|op| op.blit_buffer())
        .ok_or_else(|| EngineError::other("operation has no blit buffer"))?;
    // Blend the seed with the previous output; the blend result feeds the history ring.
    engine.set_operation_inputs(OpId(1), vec![seed, previous])?;
    engine.set_blend_weights(OpId(1), vec![0.2, 0.8])?;
    engine.set_sorted_operations(vec![OpId(1)])?;
    engine.set_output(Some(out))?;

    let mut pacer = Pacer::new(IterationScheduler::new(cfg.target_fps));
    if engine.is_active() {
        pacer.arm(Instant::now());
    }
    let mut shots = 0u32;

    tracing::info!(
        "keys: space = pause/resume, r = reset, s = screenshot, 1/2 = half/full pool size"
    );

    event_loop.run(move |event, _, control_flow| {
        match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => *control_flow = ControlFlow::Exit,

                WindowEvent::Resized(physical_size) => {
                    let (w, h) = non_zero(physical_size.width, physical_size.height);
                    gl_surface.resize(&gl_context, w, h);
                    window.request_redraw();
                }

                WindowEvent::KeyboardInput {
                    input:
                        KeyboardInput {
                            state: ElementState::Pressed,
                            virtual_keycode: Some(key),
                            ..
                        },
                    ..
                } => {
                    let result = match key {
                        VirtualKeyCode::Space => {
                            let active = !engine.is_active();
                            engine.set_active(active);
                            if active {
                                pacer.arm(Instant::now());
                            } else {
                                pacer.disarm();
                            }
                            Ok(())
                        }
                        VirtualKeyCode::R => {
                            engine.reset();
                            Ok(())
                        }
                        VirtualKeyCode::S => {
                            shots += 1;
                            let path = std::env::temp_dir()
                                .join(format!("morpho_feedback_{shots:03}.png"));
                            engine.take_screenshot(path);
                            Ok(())
                        }
                        VirtualKeyCode::Key1 => engine.resize(cfg.width / 2, cfg.height / 2),
                        VirtualKeyCode::Key2 => engine.resize(cfg.width, cfg.height),
                        _ => Ok(()),
                    };
                    if let Err(e) = result {
                        tracing::error!(error = %e, "command failed");
                        if e.is_fatal() {
                            *control_flow = ControlFlow::Exit;
                        }
                    }
                }

                _ => {}
            },

            Event::MainEventsCleared => {
                let now = Instant::now();
                if pacer.is_due(now) {
                    pacer.step_started(now);
                    match engine.iterate() {
                        Ok(_) => window.request_redraw(),
                        Err(e) => {
                            tracing::error!(error = %e, "iteration failed");
                            *control_flow = ControlFlow::Exit;
                            return;
                        }
                    }
                    pacer.step_finished(Instant::now());
                }

                for ev in engine.drain_events() {
                    match ev {
                        EngineEvent::FrameReady { .. } => {}
                        EngineEvent::ScreenshotSaved { path, ok } => {
                            tracing::info!(path = %path.display(), ok, "screenshot");
                        }
                        other => tracing::debug!(event = ?other, "engine event"),
                    }
                }

                *control_flow = match pacer.time_until_due(Instant::now()) {
                    Some(wait) => ControlFlow::WaitUntil(Instant::now() + wait),
                    None => ControlFlow::Wait,
                };
            }

            Event::RedrawRequested(_) => {
                let s = window.inner_size();
                let extent = engine.extent();
                if let Some(tex) = engine.current_output_texture() {
                    engine
                        .gpu_mut()
                        .present(tex, extent, s.width.max(1), s.height.max(1));
                }
                if let Err(e) = gl_surface.swap_buffers(&gl_context) {
                    tracing::warn!(error = %e, "swap_buffers failed");
                }
            }

            _ => {}
        }
    });
}

fn non_zero(w: u32, h: u32) -> (NonZeroU32, NonZeroU32) {
    (
        NonZeroU32::new(w.max(1)).unwrap_or(NonZeroU32::MIN),
        NonZeroU32::new(h.max(1)).unwrap_or(NonZeroU32::MIN),
    )
}
