use std::sync::Arc;

use crate::analyzer::{FileImageSource, ImageAnalyzer, ImageSource};
use crate::cloud::CloudFilter;
use crate::config::AnalyzerConfig;
use crate::error::AnalyzeResult;

/// Builder for creating an `ImageAnalyzer`
#[derive(Clone)]
pub struct AnalyzerBuilder {
    config: AnalyzerConfig,
    source: Option<Arc<dyn ImageSource>>,
    cloud_filter: Option<CloudFilter>,
}

impl Default for AnalyzerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalyzerBuilder {
    pub fn new() -> Self {
        Self::from_config(AnalyzerConfig::default())
    }

    pub fn from_config(config: AnalyzerConfig) -> Self {
        Self {
            config,
            source: None,
            cloud_filter: None,
        }
    }

    /// Enable or disable halving of large images
    pub fn downscale(mut self, enable: bool) -> Self {
        self.config.downscale = enable;
        self
    }

    pub fn downscale_limit(mut self, pixels: u32) -> Self {
        self.config.downscale_limit = pixels;
        self
    }

    /// FOV in degrees above which images are analyzed in stereographic projection
    pub fn remap_threshold(mut self, degrees: f64) -> Self {
        self.config.remap_threshold_deg = degrees;
        self
    }

    /// Keypoint grid: `width x height` cells, at most `size` keypoints per cell
    pub fn sieve1(mut self, width: usize, height: usize, size: usize) -> Self {
        self.config.sieve1_width = width;
        self.config.sieve1_height = height;
        self.config.sieve1_size = size;
        self
    }

    pub fn max_octaves(mut self, octaves: usize) -> Self {
        self.config.max_octaves = octaves;
        self
    }

    pub fn scales_per_octave(mut self, scales: usize) -> Self {
        self.config.scales_per_octave = scales;
        self
    }

    pub fn contrast_threshold(mut self, threshold: f32) -> Self {
        self.config.contrast_threshold = threshold;
        self
    }

    pub fn edge_threshold(mut self, threshold: f32) -> Self {
        self.config.edge_threshold = threshold;
        self
    }

    /// Enable sky filtering with the given score threshold and patch radius
    pub fn cloud(mut self, threshold: f64, radius: u32) -> Self {
        self.config.cloud.enabled = true;
        self.config.cloud.threshold = threshold;
        self.config.cloud.radius = radius;
        self
    }

    /// Use an explicit filter instead of loading one from the configuration
    pub fn cloud_filter(mut self, filter: CloudFilter) -> Self {
        self.config.cloud.enabled = true;
        self.cloud_filter = Some(filter);
        self
    }

    /// Pixel source, defaults to decoding `ImageInfo::filename` from disk
    pub fn source(mut self, source: Arc<dyn ImageSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn build(self) -> AnalyzeResult<ImageAnalyzer> {
        self.config.validate()?;
        let cloud = match (self.config.cloud.enabled, self.cloud_filter) {
            (false, _) => None,
            (true, Some(filter)) => Some(filter),
            (true, None) => Some(CloudFilter::from_settings(&self.config.cloud)?),
        };
        let source = self.source.unwrap_or_else(|| Arc::new(FileImageSource));
        Ok(ImageAnalyzer::from_parts(self.config, source, cloud))
    }
}
