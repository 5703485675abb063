use crate::error::{MatchError, MatchResult};
use crate::model::RansacMode;
use crate::ransac::{RansacConfig, DEFAULT_SEED};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Pair matching and verification settings
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MatchConfig {
    /// Ratio test on squared distances: keep when `best < ratio * second`
    pub second_match_distance: f32,
    pub ransac_iterations: usize,
    /// Inlier threshold in pixels of the second image
    pub ransac_threshold: f64,
    pub ransac_mode: RansacMode,
    pub seed: u64,
    /// Pairs with fewer verified matches than this yield nothing
    pub min_matches: usize,
    pub sieve2_width: usize,
    pub sieve2_height: usize,
    pub sieve2_size: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchConfig {
    pub fn new() -> Self {
        Self {
            second_match_distance: 0.25,
            ransac_iterations: 1000,
            ransac_threshold: 50.0,
            ransac_mode: RansacMode::Auto,
            seed: DEFAULT_SEED,
            min_matches: 6,
            sieve2_width: 5,
            sieve2_height: 5,
            sieve2_size: 1,
        }
    }

    pub fn ransac(&self) -> RansacConfig {
        RansacConfig {
            iterations: self.ransac_iterations,
            threshold: self.ransac_threshold,
            seed: self.seed,
        }
    }

    /// Most control points a single pair can contribute
    pub fn max_matches_per_pair(&self) -> usize {
        self.sieve2_width * self.sieve2_height * self.sieve2_size
    }

    pub fn summary(&self) -> String {
        format!(
            "MatchConfig: ratio={}, ransac={} x{} @{}px, min_matches={}, sieve2={}x{}x{}",
            self.second_match_distance,
            self.ransac_mode,
            self.ransac_iterations,
            self.ransac_threshold,
            self.min_matches,
            self.sieve2_width,
            self.sieve2_height,
            self.sieve2_size
        )
    }

    pub fn validate(&self) -> MatchResult<()> {
        if !(self.second_match_distance > 0.0 && self.second_match_distance <= 1.0) {
            return Err(MatchError::InvalidConfig(format!(
                "second match distance {} outside (0, 1]",
                self.second_match_distance
            )));
        }
        if self.ransac_iterations == 0 {
            return Err(MatchError::InvalidConfig("ransac iterations must be at least 1".to_string()));
        }
        if !(self.ransac_threshold > 0.0) {
            return Err(MatchError::InvalidConfig(format!(
                "ransac threshold {} must be positive",
                self.ransac_threshold
            )));
        }
        if self.sieve2_width == 0 || self.sieve2_height == 0 || self.sieve2_size == 0 {
            return Err(MatchError::InvalidConfig(format!(
                "sieve2 grid {}x{}x{} must be non-zero",
                self.sieve2_width, self.sieve2_height, self.sieve2_size
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
