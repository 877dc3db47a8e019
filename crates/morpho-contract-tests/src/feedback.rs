//! Feedback contract: the history ring holds the last `depth` inputs, newest at layer 0.

use image::{Rgba, RgbaImage};
use morpho_core::{DeviceId, EngineConfig, OpId, SeedId};
use morpho_runtime::soft::{PixelShader, SoftBackend};
use morpho_runtime::{Engine, OperationSpec, SeedContent};

const W: u32 = 16;
const H: u32 = 8;

fn engine() -> Engine<SoftBackend> {
    let cfg = EngineConfig {
        width: W,
        height: H,
        initially_active: true,
        ..EngineConfig::default()
    };
    Engine::new(SoftBackend::new(), &cfg).unwrap()
}

fn red(v: u8) -> [f32; 4] {
    [v as f32 / 255.0, 0.0, 0.0, 1.0]
}

#[test]
fn history_holds_last_depth_inputs_newest_first() {
    let mut e = engine();
    let dev = DeviceId::new("deck-a");
    let input = e.gen_video_texture(&dev).unwrap();
    e.init_operation(OperationSpec::new(OpId(1), PixelShader::passthrough()).with_feedback(3))
        .unwrap();
    e.set_operation_inputs(OpId(1), vec![input]).unwrap();
    e.set_sorted_operations(vec![OpId(1)]).unwrap();

    let values = [10u8, 20, 30, 40, 50];
    for v in values {
        assert!(e.set_frame_image(&dev, RgbaImage::from_pixel(W, H, Rgba([v, 0, 0, 255]))));
        e.iterate().unwrap();
    }

    let (arr, depth) = e.operation(OpId(1)).unwrap().history().unwrap();
    assert_eq!(depth, 3);
    let arr = e.pool().texture(arr).unwrap();
    let layers: Vec<_> = (0..depth)
        .map(|z| e.gpu().solid_color(arr, z).unwrap())
        .collect();
    assert_eq!(layers, vec![red(50), red(40), red(30)]);
}

#[test]
fn shader_sees_history_written_this_iteration() {
    let mut e = engine();
    let seed = e.init_seed(SeedId(1), SeedContent::Solid([0.0, 0.0, 1.0, 1.0])).unwrap();
    // Output = oldest history layer.
    let out = e
        .init_operation(
            OperationSpec::new(OpId(1), PixelShader::new("oldest", |p| {
                p.history.last().copied().unwrap_or_default()
            }))
            .with_feedback(2),
        )
        .unwrap();
    e.set_operation_inputs(OpId(1), vec![seed]).unwrap();
    e.set_sorted_operations(vec![OpId(1)]).unwrap();

    e.iterate().unwrap();
    let tex = e.pool().texture(out).unwrap();
    assert_eq!(
        e.gpu().solid_color(tex, 0),
        Some([0.0, 0.0, 0.0, 1.0]),
        "layer 1 still cleared after one iteration"
    );
    e.iterate().unwrap();
    assert_eq!(e.gpu().solid_color(tex, 0), Some([0.0, 0.0, 1.0, 1.0]));
}

#[test]
fn self_feedback_through_blit_buffer() {
    let mut e = engine();
    // Each pass adds 0.125 to what it wrote last iteration (read through its own history).
    let out = e
        .init_operation(
            OperationSpec::new(OpId(1), PixelShader::new("accumulate", |p| {
                let prev = p.history.first().copied().unwrap_or_default();
                [prev[0] + 0.125, 0.0, 0.0, 1.0]
            }))
            .with_feedback(1)
            .with_blit(),
        )
        .unwrap();
    let buf = e.operation(OpId(1)).unwrap().blit_buffer().unwrap();
    e.set_operation_inputs(OpId(1), vec![buf]).unwrap();
    e.set_sorted_operations(vec![OpId(1)]).unwrap();

    for _ in 0..4 {
        e.iterate().unwrap();
    }
    let tex = e.pool().texture(out).unwrap();
    assert_eq!(e.gpu().solid_color(tex, 0), Some([0.5, 0.0, 0.0, 1.0]));
}
