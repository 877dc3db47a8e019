//! Capture contract: readback never blocks the cadence and always yields a frame of the pool
//! size, black when the readback could not be mapped.

use std::time::{SystemTime, UNIX_EPOCH};

use image::Rgba;
use morpho_core::{EngineConfig, EngineEvent, OpId, SeedId, TextureFormat};
use morpho_runtime::soft::{PixelShader, SoftBackend};
use morpho_runtime::{ChannelSink, Engine, OperationSpec, SeedContent, FRAME_RECORDED_EVERY};

const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];

fn engine(format: TextureFormat) -> Engine<SoftBackend> {
    let cfg = EngineConfig {
        width: 20,
        height: 10,
        format,
        initially_active: true,
        ..EngineConfig::default()
    };
    let mut e = Engine::new(SoftBackend::new(), &cfg).unwrap();
    let seed = e.init_seed(SeedId(1), SeedContent::Solid(GREEN)).unwrap();
    let out = e
        .init_operation(OperationSpec::new(OpId(1), PixelShader::passthrough()))
        .unwrap();
    e.set_operation_inputs(OpId(1), vec![seed]).unwrap();
    e.set_sorted_operations(vec![OpId(1)]).unwrap();
    e.set_output(Some(out)).unwrap();
    e
}

#[test]
fn capture_reads_back_output() {
    for format in [TextureFormat::Rgba8, TextureFormat::Rgba16F] {
        let mut e = engine(format);
        e.request_capture();
        e.iterate().unwrap();
        assert_eq!(e.output_image().dimensions(), (20, 10));
        assert!(
            e.output_image().pixels().all(|p| *p == Rgba([0, 255, 0, 255])),
            "{format:?}"
        );
    }
}

#[test]
fn refused_map_falls_back_to_black_frame() {
    let mut e = engine(TextureFormat::Rgba8);
    e.gpu_mut().fail_next_map();
    e.request_capture();
    let info = e.iterate().unwrap().unwrap();
    assert_eq!(info.iteration, 1);
    assert_eq!(e.output_image().dimensions(), (20, 10));
    assert!(e.output_image().pixels().all(|p| *p == Rgba([0, 0, 0, 255])));

    e.request_capture();
    e.iterate().unwrap();
    assert_eq!(*e.output_image().get_pixel(0, 0), Rgba([0, 255, 0, 255]));
}

#[test]
fn capture_waits_out_a_slow_fence() {
    let mut e = engine(TextureFormat::Rgba8);
    e.gpu_mut().stall_fences(25);
    e.request_capture();
    assert!(e.iterate().unwrap().is_some());
    assert_eq!(*e.output_image().get_pixel(5, 5), Rgba([0, 255, 0, 255]));
}

#[test]
fn no_readback_without_consumer() {
    let mut e = engine(TextureFormat::Rgba8);
    for _ in 0..3 {
        e.iterate().unwrap();
    }
    assert_eq!(e.gpu().stats().transfers, 0);
}

#[test]
fn screenshot_is_written_and_reported() {
    let mut e = engine(TextureFormat::Rgba8);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let path = std::env::temp_dir().join(format!("morpho_contract_screenshot_{ts}.png"));

    e.take_screenshot(&path);
    e.iterate().unwrap();
    assert!(e.drain_events().contains(&EngineEvent::ScreenshotSaved {
        path: path.clone(),
        ok: true
    }));

    let saved = image::open(&path).unwrap().to_rgba8();
    assert_eq!(saved.dimensions(), (20, 10));
    assert_eq!(*saved.get_pixel(19, 9), Rgba([0, 255, 0, 255]));
    let _ = std::fs::remove_file(path);
}

#[test]
fn recording_streams_every_iteration_and_reports_progress() {
    let mut e = engine(TextureFormat::Rgba8);
    let cap = FRAME_RECORDED_EVERY as usize + 5;
    let (sink, rx) = ChannelSink::bounded(cap);
    e.start_recording(Box::new(sink));
    assert!(e.is_recording());

    let mut recorded = Vec::new();
    for _ in 0..FRAME_RECORDED_EVERY {
        e.iterate().unwrap();
        recorded.extend(e.drain_events().into_iter().filter_map(|ev| match ev {
            EngineEvent::FrameRecorded(n) => Some(n),
            _ => None,
        }));
    }
    assert_eq!(recorded, vec![FRAME_RECORDED_EVERY]);
    let frames = rx.drain();
    assert_eq!(frames.len(), FRAME_RECORDED_EVERY as usize);
    assert!(frames.iter().all(|f| f.dimensions() == (20, 10)));

    assert!(e.stop_recording().is_some());
    assert!(!e.is_recording());
    e.iterate().unwrap();
    assert!(rx.try_recv().is_none());
}

#[test]
fn full_sink_pauses_then_resumes() {
    let mut e = engine(TextureFormat::Rgba8);
    let (sink, rx) = ChannelSink::bounded(2);
    e.start_recording(Box::new(sink));

    for _ in 0..5 {
        e.iterate().unwrap();
    }
    assert_eq!(rx.drain().len(), 2, "frames beyond capacity are dropped, not queued");

    for _ in 0..2 {
        e.iterate().unwrap();
    }
    assert_eq!(rx.drain().len(), 2, "stream resumed after the consumer drained");
}

#[test]
fn departed_consumer_stops_readback() {
    let mut e = engine(TextureFormat::Rgba8);
    let (sink, rx) = ChannelSink::bounded(4);
    e.start_recording(Box::new(sink));
    e.iterate().unwrap();
    assert_eq!(rx.drain().len(), 1);
    drop(rx);

    e.iterate().unwrap();
    assert!(!e.is_recording());
    let transfers = e.gpu().stats().transfers;
    for _ in 0..5 {
        e.iterate().unwrap();
    }
    assert_eq!(e.gpu().stats().transfers, transfers);
}
