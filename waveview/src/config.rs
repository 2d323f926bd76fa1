// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

use crate::values::{BusFormat, Time};
use crate::{LoadOptions, Result, WaveError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything an [`crate::Engine`] can be tuned with. All sections are optional in TOML.
///
/// ```toml
/// [load]
/// max_warnings = 200
///
/// [viewport]
/// pixel_width = 1600
///
/// [render]
/// default_format = "hex"
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub load: LoadOptions,
    pub viewport: ViewportConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    /// Width of the drawing area in pixels.
    pub pixel_width: f64,
    /// The cursor is rounded to a multiple of this many time units.
    pub snap: Time,
    /// Bounds zoom-in: one time unit never becomes wider than this.
    pub max_pixels_per_unit: f64,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            pixel_width: 1000.0,
            snap: 1,
            max_pixels_per_unit: 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Bus labels are only emitted for runs wider than this.
    pub min_label_px: f64,
    pub default_format: BusFormat,
    pub multi_thread: bool,
    /// Minimum number of signals before rendering is spread over the rayon pool.
    pub parallel_threshold: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            min_label_px: 18.0,
            default_format: BusFormat::Binary,
            multi_thread: true,
            parallel_threshold: 64,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| WaveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content).map_err(|e| match e {
            WaveError::Config(msg) => {
                WaveError::Config(format!("{}: {msg}", path.as_ref().display()))
            }
            other => other,
        })
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| WaveError::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if !(self.viewport.pixel_width.is_finite() && self.viewport.pixel_width > 0.0) {
            return Err(WaveError::Config(format!(
                "viewport.pixel_width must be positive, not {}",
                self.viewport.pixel_width
            )));
        }
        if !(self.viewport.max_pixels_per_unit.is_finite()
            && self.viewport.max_pixels_per_unit > 0.0)
        {
            return Err(WaveError::Config(format!(
                "viewport.max_pixels_per_unit must be positive, not {}",
                self.viewport.max_pixels_per_unit
            )));
        }
        if self.viewport.snap == 0 {
            return Err(WaveError::Config("viewport.snap must be at least 1".to_string()));
        }
        if !(self.render.min_label_px >= 0.0) {
            return Err(WaveError::Config(format!(
                "render.min_label_px must not be negative, not {}",
                self.render.min_label_px
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(EngineConfig::from_toml_str("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_partial_config() {
        let config = EngineConfig::from_toml_str(
            r#"
[load]
max_warnings = 10

[viewport]
pixel_width = 1600.0

[render]
default_format = "hex"
multi_thread = false
"#,
        )
        .unwrap();
        assert_eq!(config.load.max_warnings, 10);
        assert!(!config.load.remove_scopes_with_empty_name);
        assert_eq!(config.viewport.pixel_width, 1600.0);
        assert_eq!(config.viewport.snap, 1);
        assert_eq!(config.render.default_format, BusFormat::Hexadecimal);
        assert!(!config.render.multi_thread);
        assert_eq!(config.render.min_label_px, 18.0);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            EngineConfig::from_toml_str("[viewport]\npixel_width = -3.0\n"),
            Err(WaveError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[viewport]\nsnap = 0\n"),
            Err(WaveError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[render]\ndefault_format = \"roman\"\n"),
            Err(WaveError::Config(_))
        ));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waveview.toml");
        let mut config = EngineConfig::default();
        config.render.default_format = BusFormat::Signed;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.toml")),
            Err(WaveError::Io(_))
        ));
    }
}
