//! Determinism contract: the same graph fed the same seeds produces the same frames, and a
//! reset returns the engine to its initial content.

use morpho_core::{EngineConfig, OpId, SeedId};
use morpho_runtime::soft::{PixelShader, SoftBackend};
use morpho_runtime::{Engine, GpuBackend, OperationSpec, SeedContent, TexHandle};

const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
const TEAL: [f32; 4] = [0.0, 0.5, 0.5, 1.0];

fn cfg() -> EngineConfig {
    EngineConfig {
        width: 24,
        height: 12,
        initially_active: true,
        ..EngineConfig::default()
    }
}

/// Seed -> gradient op with feedback -> capture.
fn build(e: &mut Engine<SoftBackend>) -> (TexHandle, TexHandle) {
    let seed = e.init_seed(SeedId(1), SeedContent::Solid(TEAL)).unwrap();
    let out = e
        .init_operation(
            OperationSpec::new(OpId(1), PixelShader::new("gradient", |p| {
                let prev = p.history.get(1).copied().unwrap_or_default();
                let fx = p.x as f32 / p.extent.width as f32;
                [fx, p.input[1], (prev[2] + 0.25).min(1.0), 1.0]
            }))
            .with_feedback(2),
        )
        .unwrap();
    e.set_operation_inputs(OpId(1), vec![seed]).unwrap();
    e.set_sorted_operations(vec![OpId(1)]).unwrap();
    e.set_output(Some(out)).unwrap();
    (seed, out)
}

#[test]
fn identical_graphs_produce_identical_frames() {
    let mut a = Engine::new(SoftBackend::new(), &cfg()).unwrap();
    let mut b = Engine::new(SoftBackend::new(), &cfg()).unwrap();
    build(&mut a);
    build(&mut b);

    for _ in 0..6 {
        a.request_capture();
        b.request_capture();
        a.iterate().unwrap();
        b.iterate().unwrap();
        assert_eq!(a.output_image(), b.output_image());
    }
    assert_eq!(a.iteration_number(), b.iteration_number());
}

#[test]
fn reset_restores_seed_and_clears_operations() {
    let mut e = Engine::new(SoftBackend::new(), &cfg()).unwrap();
    let (seed, out) = build(&mut e);
    for _ in 0..3 {
        e.iterate().unwrap();
    }

    // Corrupt the seed behind the engine's back.
    let seed_tex = e.pool().texture(seed).unwrap();
    e.gpu_mut().fill(seed_tex, [1.0, 1.0, 1.0, 1.0]);

    e.reset();
    assert_eq!(e.iteration_number(), 0);
    assert_eq!(e.gpu().solid_color(seed_tex, 0), Some(TEAL));
    let out_tex = e.pool().texture(out).unwrap();
    assert_eq!(e.gpu().solid_color(out_tex, 0), Some(BLACK));
    let (arr, depth) = e.operation(OpId(1)).unwrap().history().unwrap();
    let arr = e.pool().texture(arr).unwrap();
    for z in 0..depth {
        assert_eq!(e.gpu().solid_color(arr, z), Some(BLACK));
    }
}

#[test]
fn frames_after_reset_repeat_the_first_run() {
    let mut e = Engine::new(SoftBackend::new(), &cfg()).unwrap();
    build(&mut e);

    let mut first = Vec::new();
    for _ in 0..4 {
        e.request_capture();
        e.iterate().unwrap();
        first.push(e.output_image().clone());
    }

    e.reset();
    for (i, expected) in first.iter().enumerate() {
        e.request_capture();
        let info = e.iterate().unwrap().unwrap();
        assert_eq!(info.iteration, i as u64 + 1);
        assert_eq!(e.output_image(), expected, "frame {i}");
    }
}
