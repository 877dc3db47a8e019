use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::format::{Extent, TextureFormat};

/// Startup configuration for the render engine.
///
/// Every field has a default so a partial (or empty) JSON object is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Texture pool width (texels).
    #[serde(default = "default_width")]
    pub width: u32,

    /// Texture pool height (texels).
    #[serde(default = "default_height")]
    pub height: u32,

    /// Texture pool pixel format.
    #[serde(default)]
    pub format: TextureFormat,

    /// Iterations per second. `0` iterates back-to-back without delay.
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,

    /// Requested capacity of the blend scratch array (clamped by the backend).
    #[serde(default = "default_blend_layers")]
    pub blend_layers: u32,

    /// Per-attempt timeout of the capture fence wait, in microseconds.
    #[serde(default = "default_fence_poll_timeout_us")]
    pub fence_poll_timeout_us: u64,

    /// Whether iterations start immediately.
    #[serde(default)]
    pub initially_active: bool,
}

fn default_width() -> u32 {
    2048
}
fn default_height() -> u32 {
    2048
}
fn default_target_fps() -> f64 {
    60.0
}
fn default_blend_layers() -> u32 {
    32
}
fn default_fence_poll_timeout_us() -> u64 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            format: TextureFormat::default(),
            target_fps: default_target_fps(),
            blend_layers: default_blend_layers(),
            fence_poll_timeout_us: default_fence_poll_timeout_us(),
            initially_active: false,
        }
    }
}

impl EngineConfig {
    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }

    /// Checks value ranges. `path` is only used for error reporting.
    pub fn validate(&self, path: &Path) -> Result<(), EngineError> {
        let invalid = |msg: &str| EngineError::InvalidConfig {
            path: path.to_path_buf(),
            msg: msg.to_string(),
        };
        if self.width == 0 || self.height == 0 {
            return Err(invalid("width/height must be > 0"));
        }
        if !self.target_fps.is_finite() || self.target_fps < 0.0 {
            return Err(invalid("target_fps must be a finite number >= 0"));
        }
        if self.blend_layers == 0 {
            return Err(invalid("blend_layers must be >= 1"));
        }
        Ok(())
    }
}

/// Parse and validate a config from JSON text.
pub fn parse_engine_config(text: &str, path: &Path) -> Result<EngineConfig, EngineError> {
    let cfg: EngineConfig = serde_json::from_str(text).map_err(|source| EngineError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate(path)?;
    Ok(cfg)
}

/// Read, parse and validate an engine config file.
pub fn load_engine_config_from(path: impl AsRef<Path>) -> Result<EngineConfig, EngineError> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let text = std::fs::read_to_string(&path).map_err(|source| EngineError::Io {
        path: path.clone(),
        source,
    })?;
    parse_engine_config(&text, &path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg = parse_engine_config("{}", Path::new("mem")).unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.extent(), Extent::new(2048, 2048));
    }

    #[test]
    fn partial_config_overrides_fields() {
        let cfg = parse_engine_config(
            r#"{ "width": 640, "height": 360, "format": "rgba16f", "target_fps": 0 }"#,
            Path::new("mem"),
        )
        .unwrap();
        assert_eq!(cfg.extent(), Extent::new(640, 360));
        assert_eq!(cfg.format, TextureFormat::Rgba16F);
        assert_eq!(cfg.target_fps, 0.0);
        assert_eq!(cfg.blend_layers, 32);
    }

    #[test]
    fn rejects_negative_fps_and_zero_sizes() {
        let err = parse_engine_config(r#"{ "target_fps": -1 }"#, Path::new("a.json")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
        assert!(err.to_string().contains("a.json"));

        let err = parse_engine_config(r#"{ "width": 0 }"#, Path::new("b.json")).unwrap_err();
        assert!(err.to_string().contains("width/height"));
    }

    #[test]
    fn unknown_format_is_a_json_error() {
        let err =
            parse_engine_config(r#"{ "format": "bgr565" }"#, Path::new("c.json")).unwrap_err();
        assert!(matches!(err, EngineError::Json { .. }));
    }

    #[test]
    fn missing_file_reports_io_with_path() {
        let mut p = std::env::temp_dir();
        p.push("morpho_core_config_does_not_exist.json");
        let err = load_engine_config_from(&p).unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
