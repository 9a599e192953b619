//! Render configuration: pool sizing, thread naming, canvas limits.
//! Defaults cover the common case; `from_env` and `load_from_file` override.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{RenderError, RenderResult};

/// Upper bound on background render queues regardless of processor count.
pub const MAX_QUEUE_COUNT: usize = 16;

pub const ENV_MAX_QUEUES: &str = "ASYNC_LAYER_MAX_QUEUES";
pub const ENV_SCALE: &str = "ASYNC_LAYER_SCALE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Pool size is clamp(available parallelism, 1, max_queue_count).
    pub max_queue_count: usize,
    pub worker_name_prefix: String,
    pub release_queue_name: String,
    /// Canvas requests larger than this many device pixels are refused.
    pub max_canvas_pixels: u64,
    /// Scale used when a layer's own contents scale is not a positive finite number.
    pub default_scale: f64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_queue_count: MAX_QUEUE_COUNT,
            worker_name_prefix: "async-layer.render".into(),
            release_queue_name: "async-layer.release".into(),
            max_canvas_pixels: 8192 * 8192,
            default_scale: 1.0,
        }
    }
}

impl RenderConfig {
    /// Defaults with environment overrides applied. Bad values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(ENV_MAX_QUEUES) {
            match raw.trim().parse::<usize>() {
                Ok(n) if (1..=MAX_QUEUE_COUNT).contains(&n) => config.max_queue_count = n,
                _ => warn!(value = %raw, var = ENV_MAX_QUEUES, "ignoring invalid queue count"),
            }
        }

        if let Ok(raw) = std::env::var(ENV_SCALE) {
            match raw.trim().parse::<f64>() {
                Ok(s) if s.is_finite() && s > 0.0 => config.default_scale = s,
                _ => warn!(value = %raw, var = ENV_SCALE, "ignoring invalid scale"),
            }
        }

        config
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> RenderResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        info!(path = %path.display(), queues = config.max_queue_count, "render config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> RenderResult<()> {
        if self.max_queue_count == 0 || self.max_queue_count > MAX_QUEUE_COUNT {
            return Err(RenderError::invalid_config(format!(
                "max_queue_count must be within 1..={MAX_QUEUE_COUNT}, got {}",
                self.max_queue_count
            )));
        }
        if !(self.default_scale.is_finite() && self.default_scale > 0.0) {
            return Err(RenderError::invalid_config(format!(
                "default_scale must be positive, got {}",
                self.default_scale
            )));
        }
        if self.max_canvas_pixels == 0 {
            return Err(RenderError::invalid_config("max_canvas_pixels must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RenderConfig::default();
        assert_eq!(config.max_queue_count, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: RenderConfig = serde_json::from_str(r#"{ "max_queue_count": 4 }"#).unwrap();
        assert_eq!(config.max_queue_count, 4);
        assert_eq!(config.worker_name_prefix, "async-layer.render");
        assert_eq!(config.default_scale, 1.0);
    }

    #[test]
    fn rejects_out_of_range_queue_count() {
        let config = RenderConfig {
            max_queue_count: 17,
            ..RenderConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RenderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn load_from_file_reads_json() {
        let path = std::env::temp_dir().join(format!(
            "async_layer_config_{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{ "max_queue_count": 2, "default_scale": 2.0 }"#).unwrap();
        let config = RenderConfig::load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(config.max_queue_count, 2);
        assert_eq!(config.default_scale, 2.0);
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let err = RenderConfig::load_from_file(Path::new("/nonexistent/async_layer.json"))
            .unwrap_err();
        assert!(matches!(err, RenderError::ConfigIo(_)));
    }
}
