#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]

//! morpho shared vocabulary.
//!
//! This crate is **contract-only**: no GPU handles, no threads. It defines the ids,
//! formats, events, errors and configuration that the runtime and its backends agree on.

pub mod config;
pub mod error;
pub mod events;
pub mod format;
pub mod ids;

pub use config::{load_engine_config_from, parse_engine_config, EngineConfig};
pub use error::EngineError;
pub use events::{EngineEvent, FenceToken};
pub use format::{Extent, TextureFormat};
pub use ids::{DeviceId, OpId, SeedId};
