use pano_core::Plane;

use crate::config::CloudSettings;
use crate::error::{AnalyzeError, AnalyzeResult};
use crate::types::Candidate;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Linear logistic classifier over patch statistics.
///
/// Features, in order: mean intensity, intensity standard deviation, mean gradient
/// magnitude, vertical position (0 at the top, 1 at the bottom).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CloudModel {
    pub weights: [f64; 4],
    pub bias: f64,
}

impl Default for CloudModel {
    /// Bright, flat, smooth patches high in the frame look like sky
    fn default() -> Self {
        Self {
            weights: [6.0, -12.0, -20.0, -3.0],
            bias: -2.0,
        }
    }
}

impl CloudModel {
    pub fn score(&self, features: &[f64; 4]) -> f64 {
        let z: f64 = self.weights.iter().zip(features.iter()).map(|(w, f)| w * f).sum::<f64>() + self.bias;
        1.0 / (1.0 + (-z).exp())
    }

    #[cfg(feature = "serde")]
    pub fn load_json<P: AsRef<std::path::Path>>(path: P) -> AnalyzeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| AnalyzeError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| {
            AnalyzeError::InvalidConfig(format!("cloud model {}: {}", path.display(), e))
        })
    }
}

/// Removes keypoints whose surrounding patch classifies as sky or cloud
#[derive(Debug, Clone, PartialEq)]
pub struct CloudFilter {
    model: CloudModel,
    threshold: f64,
    radius: u32,
}

impl CloudFilter {
    pub fn new(model: CloudModel, threshold: f64, radius: u32) -> Self {
        Self {
            model,
            threshold,
            radius: radius.max(1),
        }
    }

    pub fn from_settings(settings: &CloudSettings) -> AnalyzeResult<Self> {
        let model = match &settings.model_path {
            None => CloudModel::default(),
            #[cfg(feature = "serde")]
            Some(path) => CloudModel::load_json(path)?,
            #[cfg(not(feature = "serde"))]
            Some(path) => {
                return Err(AnalyzeError::InvalidConfig(format!(
                    "loading cloud model {} requires the serde feature",
                    path.display()
                )))
            }
        };
        Ok(Self::new(model, settings.threshold, settings.radius))
    }

    /// Patch features around a detection-space position
    pub fn features(&self, image: &Plane, x: f32, y: f32) -> [f64; 4] {
        let r = self.radius as isize;
        let cx = x.round() as isize;
        let cy = y.round() as isize;
        let x0 = (cx - r).max(1) as usize;
        let y0 = (cy - r).max(1) as usize;
        let x1 = ((cx + r) as usize).min(image.width.saturating_sub(2));
        let y1 = ((cy + r) as usize).min(image.height.saturating_sub(2));

        let mut n = 0.0f64;
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut grad = 0.0f64;
        for py in y0..=y1 {
            for px in x0..=x1 {
                let v = image.at(px, py) as f64;
                let gx = (image.at(px + 1, py) - image.at(px - 1, py)) as f64 / 2.0;
                let gy = (image.at(px, py + 1) - image.at(px, py - 1)) as f64 / 2.0;
                sum += v;
                sum_sq += v * v;
                grad += (gx * gx + gy * gy).sqrt();
                n += 1.0;
            }
        }
        if n == 0.0 {
            return [0.0, 0.0, 0.0, y as f64 / image.height.max(1) as f64];
        }
        let mean = sum / n;
        let std = (sum_sq / n - mean * mean).max(0.0).sqrt();
        [mean, std, grad / n, y as f64 / image.height.max(1) as f64]
    }

    pub fn is_sky(&self, image: &Plane, x: f32, y: f32) -> bool {
        self.model.score(&self.features(image, x, y)) > self.threshold
    }

    /// Drop candidates on sky; `image` is the detection image
    pub fn apply(&self, image: &Plane, candidates: Vec<Candidate>) -> Vec<Candidate> {
        if image.width < 3 || image.height < 3 {
            return candidates;
        }
        candidates
            .into_iter()
            .filter(|c| {
                let (x, y) = c.detection_position();
                !self.is_sky(image, x, y)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smooth bright top half, textured dark bottom half
    fn landscape() -> Plane {
        let (w, h) = (200usize, 200usize);
        let mut data = vec![0.0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                data[y * w + x] = if y < h / 2 {
                    0.85
                } else {
                    0.35 + 0.3 * (((x * 7 + y * 13) % 11) as f32 / 10.0 - 0.5)
                };
            }
        }
        Plane::new(w, h, data)
    }

    fn candidate(x: f32, y: f32) -> Candidate {
        Candidate {
            octave: 0,
            layer: 1,
            x,
            y,
            sigma: 2.0,
            response: 0.1,
            orientation: 0.0,
        }
    }

    #[test]
    fn test_default_model_separates_sky() {
        let filter = CloudFilter::new(CloudModel::default(), 0.5, 15);
        let image = landscape();
        assert!(filter.is_sky(&image, 100.0, 30.0));
        assert!(!filter.is_sky(&image, 100.0, 160.0));
    }

    #[test]
    fn test_apply_drops_sky_candidates() {
        let filter = CloudFilter::new(CloudModel::default(), 0.5, 15);
        let kept = filter.apply(&landscape(), vec![candidate(50.0, 20.0), candidate(60.0, 170.0)]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].y, 170.0);
    }

    #[test]
    fn test_threshold_one_keeps_everything() {
        let filter = CloudFilter::new(CloudModel::default(), 1.0, 15);
        let kept = filter.apply(&landscape(), vec![candidate(50.0, 20.0), candidate(60.0, 170.0)]);
        assert_eq!(kept.len(), 2);
    }
}
