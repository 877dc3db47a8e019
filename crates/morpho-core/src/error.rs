use std::path::PathBuf;

use crate::ids::{OpId, SeedId};

/// Engine-level errors used across morpho crates.
///
/// Contract rule: this type lives in `morpho-core` and is re-exported by runtimes.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ---- Config ----
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("json parse error at {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid config at {}: {msg}", path.display())]
    InvalidConfig { path: PathBuf, msg: String },

    // ---- Shader programs (consumed, never authored here) ----
    #[error("vertex shader compile error: {0}")]
    VertexCompile(String),

    #[error("fragment shader compile error: {0}")]
    FragmentCompile(String),

    #[error("program link error: {0}")]
    Link(String),

    // ---- Backend resources ----
    #[error("backend object creation failed: {0}")]
    GlCreate(String),

    #[error("texture allocation failed: {0}")]
    Allocation(String),

    #[error("unknown texture handle {0}")]
    UnknownTexture(u32),

    // ---- Engine surface ----
    #[error("unknown operation {0:?}")]
    UnknownOperation(OpId),

    #[error("unknown seed {0:?}")]
    UnknownSeed(SeedId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("capture failed: {0}")]
    Capture(String),

    // ---- Fallback ----
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn other<T: Into<String>>(s: T) -> Self {
        EngineError::Other(s.into())
    }

    pub fn invalid<T: Into<String>>(s: T) -> Self {
        EngineError::InvalidArgument(s.into())
    }

    /// Errors that leave the texture pool unusable. The render loop stops on these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Allocation(_) | EngineError::GlCreate(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(EngineError::Link("x".into())
            .to_string()
            .starts_with("program link error:"));
        assert!(EngineError::Allocation("x".into())
            .to_string()
            .starts_with("texture allocation failed:"));
        assert_eq!(EngineError::other("boom").to_string(), "boom");
    }

    #[test]
    fn only_resource_failures_are_fatal() {
        assert!(EngineError::Allocation("oom".into()).is_fatal());
        assert!(EngineError::GlCreate("fbo".into()).is_fatal());
        assert!(!EngineError::Capture("map".into()).is_fatal());
        assert!(!EngineError::UnknownOperation(OpId(3)).is_fatal());
    }

    #[test]
    fn io_error_keeps_source() {
        use std::error::Error as _;
        let err = EngineError::Io {
            path: PathBuf::from("/nope"),
            source: std::io::Error::other("denied"),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("/nope"));
    }
}
