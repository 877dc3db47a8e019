//! Dedicated render thread.
//!
//! The backend is created *on* the thread (a GL context must stay on the thread that made it
//! current), so [`RenderThread::spawn`] takes a factory. Everything else talks to the engine
//! through [`Command`]s; the target frequency and the active flag live in [`SharedControls`] so
//! they can be flipped without a round trip.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use morpho_core::{EngineConfig, EngineError, EngineEvent, TextureFormat};

use crate::backend::GpuBackend;
use crate::capture::FrameSink;
use crate::engine::Engine;
use crate::scheduler::{IterationScheduler, Pacer};

type EngineFn<B> = Box<dyn FnOnce(&mut Engine<B>) + Send>;

/// Requests executed on the render thread between iterations.
pub enum Command<B: GpuBackend> {
    Resize { width: u32, height: u32 },
    SetFormat(TextureFormat),
    Reset,
    Screenshot(PathBuf),
    StartRecording(Box<dyn FrameSink>),
    StopRecording,
    /// Arbitrary access to the engine (graph edits, seed content, inputs).
    Exec(EngineFn<B>),
    /// Re-read [`SharedControls`].
    Wake,
    Shutdown,
}

impl<B: GpuBackend> fmt::Debug for Command<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Resize { width, height } => write!(f, "Resize({width}x{height})"),
            Command::SetFormat(fmt) => write!(f, "SetFormat({fmt:?})"),
            Command::Reset => f.write_str("Reset"),
            Command::Screenshot(p) => write!(f, "Screenshot({})", p.display()),
            Command::StartRecording(_) => f.write_str("StartRecording"),
            Command::StopRecording => f.write_str("StopRecording"),
            Command::Exec(_) => f.write_str("Exec"),
            Command::Wake => f.write_str("Wake"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// State shared with the render thread without going through the command queue.
#[derive(Debug)]
pub struct SharedControls {
    active: AtomicBool,
    target_fps: Mutex<f64>,
    generation: AtomicU64,
    iterations: AtomicU64,
}

impl SharedControls {
    fn new(cfg: &EngineConfig) -> Self {
        Self {
            active: AtomicBool::new(cfg.initially_active),
            target_fps: Mutex::new(cfg.target_fps),
            generation: AtomicU64::new(0),
            iterations: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn target_fps(&self) -> f64 {
        match self.target_fps.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Iteration counter as last published by the render thread.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Acquire)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn set_target_fps(&self, fps: f64) {
        match self.target_fps.lock() {
            Ok(mut g) => *g = fps,
            Err(poisoned) => *poisoned.into_inner() = fps,
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// Handle to the render thread. Dropping it shuts the thread down.
pub struct RenderThread<B: GpuBackend + 'static> {
    tx: Sender<Command<B>>,
    controls: Arc<SharedControls>,
    events: Receiver<EngineEvent>,
    handle: Option<JoinHandle<()>>,
}

impl<B: GpuBackend + 'static> fmt::Debug for RenderThread<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderThread")
            .field("controls", &self.controls)
            .field("running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: GpuBackend + 'static> RenderThread<B> {
    /// Start the thread, build the backend with `factory` and the engine from `cfg`.
    ///
    /// Returns once the engine exists (or failed to initialise).
    pub fn spawn<F>(cfg: EngineConfig, factory: F) -> Result<Self, EngineError>
    where
        F: FnOnce() -> Result<B, EngineError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Command<B>>();
        let (ev_tx, ev_rx) = mpsc::channel::<EngineEvent>();
        let (init_tx, init_rx) = mpsc::sync_channel::<Result<(), EngineError>>(1);
        let controls = Arc::new(SharedControls::new(&cfg));
        let thread_controls = Arc::clone(&controls);

        let handle = thread::Builder::new()
            .name("morpho-render".into())
            .spawn(move || {
                let engine = factory().and_then(|gpu| Engine::new(gpu, &cfg));
                match engine {
                    Ok(engine) => {
                        let _ = init_tx.send(Ok(()));
                        run(engine, &cfg, rx, ev_tx, thread_controls);
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| EngineError::other(format!("spawn render thread: {e}")))?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                tx,
                controls,
                events: ev_rx,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(EngineError::other("render thread exited during init"))
            }
        }
    }

    pub fn controls(&self) -> &SharedControls {
        &self.controls
    }

    /// Engine notifications (frame ready, textures changed, recording progress, fatal).
    pub fn events(&self) -> &Receiver<EngineEvent> {
        &self.events
    }

    pub fn set_active(&self, active: bool) {
        self.controls.set_active(active);
        self.send(Command::Wake);
    }

    pub fn set_target_fps(&self, fps: f64) {
        self.controls.set_target_fps(fps);
        self.send(Command::Wake);
    }

    /// Queue a command. Returns `false` if the render thread is gone.
    pub fn send(&self, cmd: Command<B>) -> bool {
        self.tx.send(cmd).is_ok()
    }

    /// Run `f` against the engine on the render thread.
    pub fn exec(&self, f: impl FnOnce(&mut Engine<B>) + Send + 'static) -> bool {
        self.send(Command::Exec(Box::new(f)))
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for the thread.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                tracing::error!("render thread panicked");
            }
        }
    }
}

impl<B: GpuBackend + 'static> Drop for RenderThread<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Flow {
    Continue,
    Stop,
}

fn apply<B: GpuBackend>(
    engine: &mut Engine<B>,
    cmd: Command<B>,
    events: &Sender<EngineEvent>,
) -> Flow {
    let result = match cmd {
        Command::Resize { width, height } => engine.resize(width, height),
        Command::SetFormat(format) => engine.set_format(format),
        Command::Reset => {
            engine.reset();
            Ok(())
        }
        Command::Screenshot(path) => {
            engine.take_screenshot(path);
            Ok(())
        }
        Command::StartRecording(sink) => {
            engine.start_recording(sink);
            Ok(())
        }
        Command::StopRecording => {
            engine.stop_recording();
            Ok(())
        }
        Command::Exec(f) => {
            f(engine);
            Ok(())
        }
        Command::Wake => Ok(()),
        Command::Shutdown => return Flow::Stop,
    };
    forward(engine, events);
    match result {
        Ok(()) => Flow::Continue,
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "fatal engine error, stopping render loop");
            let _ = events.send(EngineEvent::Fatal(e.to_string()));
            Flow::Stop
        }
        Err(e) => {
            tracing::warn!(error = %e, "command failed");
            Flow::Continue
        }
    }
}

fn forward<B: GpuBackend>(engine: &mut Engine<B>, events: &Sender<EngineEvent>) {
    for ev in engine.drain_events() {
        // A dropped receiver just means nobody listens.
        let _ = events.send(ev);
    }
}

/// Commands applied back to back before the due check runs again.
const MAX_COMMANDS_PER_TURN: usize = 64;

/// Apply whatever is already queued, up to [`MAX_COMMANDS_PER_TURN`].
fn drain_commands<B: GpuBackend>(
    engine: &mut Engine<B>,
    rx: &Receiver<Command<B>>,
    events: &Sender<EngineEvent>,
) -> Flow {
    for _ in 0..MAX_COMMANDS_PER_TURN {
        match rx.try_recv() {
            Ok(cmd) => {
                if let Flow::Stop = apply(engine, cmd, events) {
                    return Flow::Stop;
                }
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => return Flow::Stop,
        }
    }
    Flow::Continue
}

fn sync_controls<B: GpuBackend>(
    controls: &SharedControls,
    seen_generation: &mut u64,
    pacer: &mut Pacer,
    engine: &mut Engine<B>,
) {
    let generation = controls.generation.load(Ordering::Acquire);
    if generation == *seen_generation {
        return;
    }
    *seen_generation = generation;
    let fps = controls.target_fps();
    if fps != pacer.scheduler().target_frequency() {
        pacer.set_target_frequency(fps);
    }
    let active = controls.is_active();
    engine.set_active(active);
    if active {
        pacer.arm(Instant::now());
    } else {
        pacer.disarm();
    }
}

fn run<B: GpuBackend>(
    mut engine: Engine<B>,
    cfg: &EngineConfig,
    rx: Receiver<Command<B>>,
    events: Sender<EngineEvent>,
    controls: Arc<SharedControls>,
) {
    let mut pacer = Pacer::new(IterationScheduler::new(cfg.target_fps));
    let mut seen_generation = u64::MAX;

    loop {
        sync_controls(&controls, &mut seen_generation, &mut pacer, &mut engine);

        let cmd = match pacer.time_until_due(Instant::now()) {
            None => match rx.recv() {
                Ok(c) => Some(c),
                Err(_) => break,
            },
            Some(wait) if wait.is_zero() => match rx.try_recv() {
                Ok(c) => Some(c),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            },
            Some(wait) => match rx.recv_timeout(wait) {
                Ok(c) => Some(c),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };

        if let Some(cmd) = cmd {
            if let Flow::Stop = apply(&mut engine, cmd, &events) {
                break;
            }
            if let Flow::Stop = drain_commands(&mut engine, &rx, &events) {
                break;
            }
            sync_controls(&controls, &mut seen_generation, &mut pacer, &mut engine);
        }

        if !pacer.is_due(Instant::now()) {
            continue;
        }
        pacer.step_started(Instant::now());
        let result = engine.iterate();
        forward(&mut engine, &events);
        match result {
            Ok(_) => {
                controls
                    .iterations
                    .store(engine.iteration_number(), Ordering::Release);
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "fatal engine error, stopping render loop");
                let _ = events.send(EngineEvent::Fatal(e.to_string()));
                break;
            }
            Err(e) => tracing::warn!(error = %e, "iteration failed"),
        }
        pacer.step_finished(Instant::now());
    }
    tracing::debug!(iterations = engine.iteration_number(), "render loop exited");
}
