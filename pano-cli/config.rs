use std::path::PathBuf;

use pano_features::AnalyzerConfig;
use pano_match::MatchConfig;
use serde::{Deserialize, Serialize};

use crate::accumulator::ConstraintPolicy;
use crate::error::{ConfigError, DetectorResult};
use crate::strategy::MatchingStrategy;

/// Keypoint cache settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Reuse valid keyfiles and write new ones after analysis
    pub enabled: bool,
    /// Keyfile directory, next to each image when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keypath: Option<PathBuf>,
    /// Only analyze and write keyfiles, no matching
    pub keyfiles_only: bool,
}

/// Complete configuration of one detection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub analyzer: AnalyzerConfig,
    pub matching: MatchConfig,
    pub strategy: MatchingStrategy,
    /// Worker count, hardware concurrency when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    /// Memory in bytes the workers may use, queried from the system when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_budget: Option<u64>,
    /// Overlap tests after rough alignment use the true field of view
    pub exact_overlap: bool,
    /// Field of view factor for overlap tests after rough alignment
    pub overlap_widening: f64,
    pub constraints: ConstraintPolicy,
    /// Vertical offset in pixels under which a stereo match counts as a horizontal line
    pub stereo_tolerance: f64,
    pub cache: CacheConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            analyzer: AnalyzerConfig::default(),
            matching: MatchConfig::default(),
            strategy: MatchingStrategy::AllPairs,
            threads: None,
            memory_budget: None,
            exact_overlap: false,
            overlap_widening: 1.25,
            constraints: ConstraintPolicy::General,
            stereo_tolerance: 2.0,
            cache: CacheConfig::default(),
        }
    }
}

impl DetectorConfig {
    /// Field of view factor actually used by overlap tests
    pub fn overlap_scale(&self) -> f64 {
        if self.exact_overlap {
            1.0
        } else {
            self.overlap_widening
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "strategy={}, threads={}, cache={}\n  {}\n  {}",
            self.strategy,
            self.threads.map_or_else(|| "auto".to_string(), |t| t.to_string()),
            self.cache.enabled,
            self.analyzer.summary(),
            self.matching.summary()
        )
    }

    pub fn validate(&self) -> DetectorResult<()> {
        self.analyzer.validate()?;
        self.matching.validate()?;
        if let MatchingStrategy::Linear { window: 0 } = self.strategy {
            return Err(ConfigError::Invalid("linear match window must be at least 1".to_string()).into());
        }
        if self.threads == Some(0) {
            return Err(ConfigError::Invalid("thread count must be at least 1".to_string()).into());
        }
        if !(self.overlap_widening >= 1.0 && self.overlap_widening <= 3.0) {
            return Err(ConfigError::Invalid(format!(
                "overlap widening {} outside [1, 3]",
                self.overlap_widening
            ))
            .into());
        }
        if self.stereo_tolerance < 0.0 {
            return Err(ConfigError::Invalid("stereo tolerance must be >= 0".to_string()).into());
        }
        Ok(())
    }

    /// Load from a `.toml` or `.json` file, chosen by extension
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_json(json: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DetectorError;

    #[test]
    fn test_defaults_validate() {
        let config = DetectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.overlap_scale(), 1.25);
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = DetectorConfig {
            strategy: MatchingStrategy::Linear { window: 0 },
            ..DetectorConfig::default()
        };
        assert!(matches!(config.validate(), Err(DetectorError::Config(ConfigError::Invalid(_)))));
    }

    #[test]
    fn test_nested_toml() {
        let text = r#"
            exact_overlap = true

            [strategy]
            mode = "linear"
            window = 3

            [matching]
            min_matches = 8

            [analyzer]
            downscale = false
        "#;
        let config = DetectorConfig::from_toml(text).unwrap();
        assert_eq!(config.strategy, MatchingStrategy::Linear { window: 3 });
        assert_eq!(config.matching.min_matches, 8);
        assert!(!config.analyzer.downscale);
        assert_eq!(config.overlap_scale(), 1.0);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = DetectorConfig {
            strategy: MatchingStrategy::MultiRow,
            threads: Some(3),
            ..DetectorConfig::default()
        };
        let back = DetectorConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(back, config);
    }
}
