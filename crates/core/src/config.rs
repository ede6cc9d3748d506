//! Renderer configuration loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Window settings used by the application shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "lumen".to_string(),
        }
    }
}

/// Capacities and behavior of the frame pipeline.
///
/// Every field has a default, so an empty file (or no file) yields a
/// usable configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Number of frames the CPU may run ahead of the GPU.
    pub frames_in_flight: usize,
    /// Indirect command capacity per frame slot, across all passes.
    pub max_draws: u32,
    /// Instance data capacity per frame slot.
    pub max_instances: u32,
    /// Vertices the shared vertex buffer can hold.
    pub vertex_capacity: u32,
    /// Indices the shared index buffer can hold.
    pub index_capacity: u32,
    /// Upper bound on a single fence wait before the GPU is considered hung.
    pub fence_timeout_ms: u64,
    pub vsync: bool,
    /// Enable Vulkan validation layers.
    pub validation: bool,
    /// Directory holding compiled SPIR-V shaders.
    pub shader_dir: PathBuf,
    pub window: WindowConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            max_draws: 4096,
            max_instances: 16384,
            vertex_capacity: 1 << 20,
            index_capacity: 3 << 20,
            fence_timeout_ms: 5_000,
            vsync: true,
            validation: cfg!(debug_assertions),
            shader_dir: PathBuf::from("shaders"),
            window: WindowConfig::default(),
        }
    }
}

impl RendererConfig {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("Loaded renderer config from {}", path.display());
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the frame pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::Config("frames_in_flight must be at least 1".into()));
        }
        if self.max_draws == 0 || self.max_instances == 0 {
            return Err(Error::Config(
                "max_draws and max_instances must be non-zero".into(),
            ));
        }
        if self.vertex_capacity == 0 || self.index_capacity == 0 {
            return Err(Error::Config(
                "vertex_capacity and index_capacity must be non-zero".into(),
            ));
        }
        if self.fence_timeout_ms == 0 {
            return Err(Error::Config("fence_timeout_ms must be non-zero".into()));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(Error::Config("window size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = RendererConfig::from_toml_str("").unwrap();
        assert_eq!(config, RendererConfig::default());
        assert_eq!(config.frames_in_flight, 2);
    }

    #[test]
    fn partial_file_overrides_fields() {
        let config = RendererConfig::from_toml_str(
            r#"
            frames_in_flight = 3
            max_draws = 64
            vsync = false

            [window]
            title = "demo"
            "#,
        )
        .unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.max_draws, 64);
        assert!(!config.vsync);
        assert_eq!(config.window.title, "demo");
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let err = RendererConfig::from_toml_str("frames_in_flight = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = RendererConfig::from_toml_str("max_draws = \"lots\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn fence_timeout_converts_to_duration() {
        let config = RendererConfig {
            fence_timeout_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.fence_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = RendererConfig::load_or_default("/nonexistent/lumen.toml").unwrap();
        assert_eq!(config, RendererConfig::default());
    }
}
