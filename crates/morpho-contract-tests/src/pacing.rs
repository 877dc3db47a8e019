//! Pacing contract: proportional drift correction that neither diverges nor compounds.

use std::time::{Duration, Instant};

use morpho_core::EngineConfig;
use morpho_runtime::soft::SoftBackend;
use morpho_runtime::{Engine, IterationScheduler, Pacer};

const FREQUENCIES: [f64; 6] = [1.0, 24.0, 30.0, 60.0, 144.0, 1000.0];

#[test]
fn nominal_measurements_are_a_fixed_point() {
    for f in FREQUENCIES {
        let mut s = IterationScheduler::new(f);
        let t = s.nominal_interval();
        for _ in 0..20 {
            assert_eq!(s.on_step_measured(t), t, "F = {f}");
        }
    }
}

#[test]
fn one_long_step_shortens_exactly_one_interval() {
    for f in FREQUENCIES {
        let mut s = IterationScheduler::new(f);
        let t = s.nominal_interval();
        let late = t / 4;

        let short = s.on_step_measured(t + late);
        assert_eq!(short, t - late, "F = {f}");
        assert_eq!(s.on_step_measured(t), t, "F = {f}: back to nominal");
    }
}

#[test]
fn consecutive_long_steps_do_not_compound() {
    let mut s = IterationScheduler::new(30.0);
    let t = s.nominal_interval();
    let late = Duration::from_millis(5);

    let first = s.on_step_measured(t + late);
    let second = s.on_step_measured(t + late);
    assert_eq!(first, second);
    assert_eq!(second, t - late);
}

#[test]
fn thirty_fps_engine_stays_in_band() {
    let cfg = EngineConfig {
        width: 16,
        height: 16,
        target_fps: 30.0,
        initially_active: true,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(SoftBackend::new(), &cfg).unwrap();
    let mut pacer = Pacer::new(IterationScheduler::new(cfg.target_fps));
    let nominal = pacer.scheduler().nominal_interval();
    let work = Duration::from_millis(2);
    let band = Duration::from_millis(3);

    // Synthetic clock: each step starts exactly when due and takes `work`.
    let mut now = Instant::now();
    pacer.arm(now);
    for i in 0..10 {
        now += pacer.time_until_due(now).unwrap();
        pacer.step_started(now);
        let info = engine.iterate().unwrap().expect("active engine produces a frame");
        assert_eq!(info.iteration, i + 1);
        now += work;
        pacer.step_finished(now);

        let interval = pacer.scheduler().interval();
        assert!(
            interval + band >= nominal && interval <= nominal + band,
            "step {i}: interval {interval:?} left the band around {nominal:?}"
        );
    }
    assert_eq!(engine.iteration_number(), 10);
}
