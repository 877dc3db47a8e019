//! Migration contract: resize and format changes keep handles valid, reallocate every texture
//! at the new size and leave history arrays cleared.

use image::{Rgba, RgbaImage};
use morpho_core::{DeviceId, EngineConfig, EngineEvent, Extent, OpId, SeedId, TextureFormat};
use morpho_runtime::soft::{PixelShader, SoftBackend};
use morpho_runtime::{Engine, OperationSpec, SeedContent, TexHandle};

const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
const ORANGE: [f32; 4] = [1.0, 0.5, 0.0, 1.0];

fn engine(width: u32, height: u32) -> Engine<SoftBackend> {
    let cfg = EngineConfig {
        width,
        height,
        initially_active: true,
        ..EngineConfig::default()
    };
    Engine::new(SoftBackend::new(), &cfg).unwrap()
}

fn extent_of(e: &Engine<SoftBackend>, h: TexHandle) -> Extent {
    let tex = e.pool().texture(h).unwrap();
    e.gpu().extent_of(tex).unwrap()
}

#[test]
fn resize_with_feedback_clears_history_and_keeps_running() {
    let mut e = engine(512, 512);
    let seed = e.init_seed(SeedId(1), SeedContent::Solid(ORANGE)).unwrap();
    let out = e
        .init_operation(OperationSpec::new(OpId(1), PixelShader::passthrough()).with_feedback(4))
        .unwrap();
    e.set_operation_inputs(OpId(1), vec![seed]).unwrap();
    e.set_sorted_operations(vec![OpId(1)]).unwrap();
    e.set_output(Some(out)).unwrap();
    for _ in 0..5 {
        e.iterate().unwrap();
    }

    e.resize(1024, 768).unwrap();
    assert_eq!(e.extent(), Extent::new(1024, 768));
    assert_eq!(extent_of(&e, out), Extent::new(1024, 768));
    assert!(e.drain_events().contains(&EngineEvent::TexturesChanged));

    let (arr, depth) = e.operation(OpId(1)).unwrap().history().unwrap();
    let arr_tex = e.pool().texture(arr).unwrap();
    assert_eq!(e.gpu().layer_count(arr_tex), Some(4));
    assert_eq!(e.gpu().extent_of(arr_tex), Some(Extent::new(1024, 768)));
    for z in 0..depth {
        assert_eq!(e.gpu().solid_color(arr_tex, z), Some(BLACK), "layer {z}");
    }

    let info = e.iterate().unwrap().unwrap();
    assert_eq!(info.iteration, 6);
    assert_eq!(e.gpu().solid_color(arr_tex, 0), Some(ORANGE));
    assert_eq!(
        e.gpu().solid_color(e.current_output_texture().unwrap(), 0),
        Some(ORANGE)
    );
}

#[test]
fn resize_round_trip_restores_shape() {
    let mut e = engine(64, 32);
    let seed = e.init_seed(SeedId(1), SeedContent::Solid(ORANGE)).unwrap();
    let out = e
        .init_operation(
            OperationSpec::new(OpId(1), PixelShader::passthrough())
                .with_feedback(2)
                .with_blend()
                .with_blit(),
        )
        .unwrap();
    e.set_operation_inputs(OpId(1), vec![seed]).unwrap();
    e.set_sorted_operations(vec![OpId(1)]).unwrap();
    e.iterate().unwrap();

    let textures = e.gpu().live_textures();
    let handles = e.operation(OpId(1)).unwrap().owned_textures();

    e.resize(100, 10).unwrap();
    e.resize(64, 32).unwrap();

    assert_eq!(e.extent(), Extent::new(64, 32));
    assert_eq!(e.format(), TextureFormat::Rgba8);
    assert_eq!(e.gpu().live_textures(), textures, "no texture leaked or lost");
    assert_eq!(e.operation(OpId(1)).unwrap().owned_textures(), handles);
    for h in handles {
        assert_eq!(extent_of(&e, h), Extent::new(64, 32));
    }
    assert_eq!(extent_of(&e, seed), Extent::new(64, 32));
    assert_eq!(e.output_image().dimensions(), (64, 32));
    assert!(e.iterate().unwrap().is_some());
}

#[test]
fn format_change_keeps_image_content() {
    let mut e = engine(32, 32);
    let seed = e.init_seed(SeedId(1), SeedContent::Solid(ORANGE)).unwrap();
    let out = e
        .init_operation(OperationSpec::new(OpId(1), PixelShader::passthrough()))
        .unwrap();
    e.set_operation_inputs(OpId(1), vec![seed]).unwrap();
    e.set_sorted_operations(vec![OpId(1)]).unwrap();
    e.iterate().unwrap();

    e.set_format(TextureFormat::Rgba32F).unwrap();
    let tex = e.pool().texture(out).unwrap();
    assert_eq!(e.gpu().format_of(tex), Some(TextureFormat::Rgba32F));
    assert_eq!(e.gpu().solid_color(tex, 0), Some(ORANGE));

    e.set_format(TextureFormat::Rgba32F).unwrap();
    assert_eq!(
        e.drain_events()
            .iter()
            .filter(|ev| **ev == EngineEvent::TexturesChanged)
            .count(),
        1,
        "repeating the same format is a no-op"
    );
}

#[test]
fn video_frame_is_reuploaded_at_new_size() {
    let mut e = engine(16, 16);
    let dev = DeviceId::new("deck-b");
    let tex = e.gen_video_texture(&dev).unwrap();
    e.set_frame_image(&dev, RgbaImage::from_pixel(16, 16, Rgba([255, 0, 0, 255])));
    e.iterate().unwrap();

    // 16x16 frame into 32x16: letterboxed with black pillars.
    e.resize(32, 16).unwrap();
    e.iterate().unwrap();
    let t = e.pool().texture(tex).unwrap();
    assert_eq!(e.gpu().texel(t, 0, 16, 8), Some([1.0, 0.0, 0.0, 1.0]));
    assert_eq!(e.gpu().texel(t, 0, 0, 8), Some(BLACK));
    assert_eq!(e.gpu().texel(t, 0, 31, 8), Some(BLACK));
}
