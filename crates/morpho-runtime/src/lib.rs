#![forbid(unsafe_code)]

//! Backend-agnostic render engine.
//!
//! The engine evaluates an externally sorted list of operations against a shared texture pool
//! once per iteration, keeps per-operation feedback history, redraws seeds, fences each
//! iteration and optionally reads the output back for screenshots and recording.
//!
//! GPU access is confined to the [`GpuBackend`] trait. `morpho-runtime-glow` implements it on
//! OpenGL; [`soft::SoftBackend`] implements it in plain memory for tests and headless use.
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]

pub mod backend;
pub mod capture;
pub mod engine;
pub mod executor;
pub mod operation;
pub mod pool;
pub mod projection;
pub mod render_loop;
pub mod scheduler;
pub mod soft;
pub mod video;

pub use backend::{FenceStatus, Filter, GpuBackend, Layer, TextureId};
pub use capture::{ChannelSink, ChannelSinkReceiver, FrameSink, FRAME_RECORDED_EVERY};
pub use engine::{Engine, FrameInfo};
pub use operation::{Operation, OperationSpec, PassTargets, Seed, SeedContent, Transform};
pub use pool::{SlotKind, TexHandle, TexturePool};
pub use projection::{Ortho, QUAD_TEX_COORDS};
pub use render_loop::{Command, RenderThread, SharedControls};
pub use scheduler::{IterationScheduler, Pacer, SchedulerState};

pub use morpho_core::{
    DeviceId, EngineConfig, EngineError, EngineEvent, Extent, FenceToken, OpId, SeedId,
    TextureFormat,
};
