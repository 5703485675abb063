use std::path::PathBuf;

use crate::builder::AnalyzerBuilder;
use crate::error::{AnalyzeError, AnalyzeResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Sky/cloud patch rejection settings
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CloudSettings {
    pub enabled: bool,
    /// Keypoints whose patch scores above this are dropped
    pub threshold: f64,
    /// Patch radius in detection pixels
    pub radius: u32,
    /// JSON model file, built-in model when absent
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub model_path: Option<PathBuf>,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.5,
            radius: 20,
            model_path: None,
        }
    }
}

/// Complete analyzer configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AnalyzerConfig {
    /// Halve images whose larger side exceeds `downscale_limit`
    pub downscale: bool,
    pub downscale_limit: u32,
    /// Remap to stereographic when the horizontal FOV exceeds this many degrees
    pub remap_threshold_deg: f64,
    pub sieve1_width: usize,
    pub sieve1_height: usize,
    pub sieve1_size: usize,
    pub max_octaves: usize,
    pub scales_per_octave: usize,
    pub base_sigma: f32,
    /// Minimum |DoG| of a refined extremum, intensities in [0, 1]
    pub contrast_threshold: f32,
    /// Principal curvature ratio above which an extremum is an edge
    pub edge_threshold: f32,
    pub cloud: CloudSettings,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalyzerConfig {
    pub fn new() -> Self {
        Self {
            downscale: true,
            downscale_limit: 2000,
            remap_threshold_deg: 65.0,
            sieve1_width: 10,
            sieve1_height: 10,
            sieve1_size: 100,
            max_octaves: 5,
            scales_per_octave: 3,
            base_sigma: 1.6,
            contrast_threshold: 0.02,
            edge_threshold: 10.0,
            cloud: CloudSettings::default(),
        }
    }

    /// Fewer octaves and keypoints, for previews and large batches
    pub fn fast_preset() -> Self {
        Self {
            max_octaves: 3,
            sieve1_width: 8,
            sieve1_height: 8,
            sieve1_size: 40,
            contrast_threshold: 0.03,
            ..Self::new()
        }
    }

    pub fn to_builder(self) -> AnalyzerBuilder {
        AnalyzerBuilder::from_config(self)
    }

    /// Upper bound on keypoints kept per image
    pub fn keypoint_budget(&self) -> usize {
        self.sieve1_width * self.sieve1_height * self.sieve1_size
    }

    pub fn summary(&self) -> String {
        format!(
            "AnalyzerConfig: downscale={} (>{}px), remap>{}deg, sieve1={}x{}x{}, octaves<={}, scales={}, cloud={}",
            self.downscale,
            self.downscale_limit,
            self.remap_threshold_deg,
            self.sieve1_width,
            self.sieve1_height,
            self.sieve1_size,
            self.max_octaves,
            self.scales_per_octave,
            self.cloud.enabled
        )
    }

    pub fn validate(&self) -> AnalyzeResult<()> {
        if self.sieve1_width == 0 || self.sieve1_height == 0 || self.sieve1_size == 0 {
            return Err(AnalyzeError::InvalidConfig(format!(
                "sieve1 grid {}x{}x{} must be non-zero",
                self.sieve1_width, self.sieve1_height, self.sieve1_size
            )));
        }
        if self.max_octaves == 0 {
            return Err(AnalyzeError::InvalidConfig("max_octaves must be at least 1".to_string()));
        }
        if !(1..=6).contains(&self.scales_per_octave) {
            return Err(AnalyzeError::InvalidConfig(format!(
                "scales_per_octave {} outside 1..=6",
                self.scales_per_octave
            )));
        }
        if self.base_sigma <= 0.5 {
            return Err(AnalyzeError::InvalidConfig(format!(
                "base_sigma {} must exceed the assumed input blur of 0.5",
                self.base_sigma
            )));
        }
        if !(self.remap_threshold_deg > 0.0 && self.remap_threshold_deg <= 360.0) {
            return Err(AnalyzeError::InvalidConfig(format!(
                "remap threshold {} outside (0, 360]",
                self.remap_threshold_deg
            )));
        }
        if self.downscale_limit < 64 {
            return Err(AnalyzeError::InvalidConfig(format!(
                "downscale limit {} is below 64px",
                self.downscale_limit
            )));
        }
        if self.edge_threshold <= 1.0 || self.contrast_threshold < 0.0 {
            return Err(AnalyzeError::InvalidConfig("edge threshold must exceed 1, contrast must be >= 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.cloud.threshold) || self.cloud.radius == 0 {
            return Err(AnalyzeError::InvalidConfig(format!(
                "cloud threshold {} / radius {} out of range",
                self.cloud.threshold, self.cloud.radius
            )));
        }
        Ok(())
    }

    /// Save configuration to JSON file
    #[cfg(feature = "serde")]
    pub fn save_json<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from JSON file
    #[cfg(feature = "serde")]
    pub fn load_json<P: AsRef<std::path::Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Save configuration to TOML file
    #[cfg(feature = "serde")]
    pub fn save_toml<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let toml = toml::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    /// Load configuration from TOML file
    #[cfg(feature = "serde")]
    pub fn load_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "serde")]
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    #[cfg(feature = "serde")]
    pub fn from_toml(toml_str: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }
}
