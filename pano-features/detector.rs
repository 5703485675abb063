use rayon::prelude::*;

use crate::config::AnalyzerConfig;
use crate::pyramid::{Octave, ScaleSpace};
use crate::refinement::{KeypointRefinement, IMAGE_BORDER};
use crate::types::Candidate;

/// Difference-of-Gaussian extremum detector
#[derive(Debug, Clone)]
pub struct ExtremaDetector {
    contrast_threshold: f32,
    edge_threshold: f32,
}

impl ExtremaDetector {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            contrast_threshold: config.contrast_threshold,
            edge_threshold: config.edge_threshold,
        }
    }

    /// All refined, oriented extrema of the scale space
    pub fn detect(&self, space: &ScaleSpace) -> Vec<Candidate> {
        space
            .octaves
            .iter()
            .flat_map(|octave| self.detect_octave(space, octave))
            .collect()
    }

    fn detect_octave(&self, space: &ScaleSpace, octave: &Octave) -> Vec<Candidate> {
        let s = space.scales_per_octave;
        let (w, h) = (octave.level.width, octave.level.height);
        if w <= 2 * IMAGE_BORDER || h <= 2 * IMAGE_BORDER {
            return Vec::new();
        }
        let prescreen = 0.5 * self.contrast_threshold / s as f32;

        (IMAGE_BORDER..h - IMAGE_BORDER)
            .into_par_iter()
            .flat_map_iter(|y| {
                let mut row = Vec::new();
                for layer in 1..=s {
                    for x in IMAGE_BORDER..w - IMAGE_BORDER {
                        let v = octave.dogs[layer].at(x, y);
                        if v.abs() <= prescreen || !is_local_extremum(&octave.dogs[layer - 1..=layer + 1], x, y, v) {
                            continue;
                        }
                        if let Some(c) = self.refine(space, octave, layer, x, y) {
                            row.push(c);
                        }
                    }
                }
                row
            })
            .collect()
    }

    fn refine(&self, space: &ScaleSpace, octave: &Octave, layer: usize, x: usize, y: usize) -> Option<Candidate> {
        let s = space.scales_per_octave;
        let refined = KeypointRefinement::interpolate(&octave.dogs, layer, x, y)?;
        if refined.value.abs() * (s as f32) < self.contrast_threshold {
            return None;
        }

        let (ix, iy) = (refined.x.round() as usize, refined.y.round() as usize);
        if KeypointRefinement::is_edge(&octave.dogs[refined.layer], ix, iy, self.edge_threshold) {
            return None;
        }

        let sigma = space.layer_sigma(refined.layer as f32 + refined.layer_offset);
        let orientation =
            KeypointRefinement::dominant_orientation(&octave.gaussians[refined.layer], refined.x, refined.y, sigma);

        Some(Candidate {
            octave: octave.level.index,
            layer: refined.layer,
            x: refined.x,
            y: refined.y,
            sigma,
            response: refined.value.abs(),
            orientation,
        })
    }
}

/// Strict maximum or minimum among the 26 neighbours in three adjacent layers
fn is_local_extremum(layers: &[pano_core::Plane], x: usize, y: usize, v: f32) -> bool {
    let is_max = v > 0.0;
    for (l, plane) in layers.iter().enumerate() {
        for ny in y - 1..=y + 1 {
            for nx in x - 1..=x + 1 {
                if l == 1 && nx == x && ny == y {
                    continue;
                }
                let n = plane.at(nx, ny);
                if (is_max && n >= v) || (!is_max && n <= v) {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pano_core::Plane;

    fn blobs(w: usize, h: usize, centres: &[(f32, f32)], sigma: f32) -> Plane {
        let mut data = vec![0.2f32; w * h];
        for y in 0..h {
            for x in 0..w {
                for &(cx, cy) in centres {
                    let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
                    data[y * w + x] += 0.7 * (-d2 / (2.0 * sigma * sigma)).exp();
                }
            }
        }
        Plane::new(w, h, data)
    }

    #[test]
    fn test_finds_isolated_blobs() {
        let centres = [(40.0, 40.0), (110.0, 60.0), (70.0, 100.0)];
        let plane = blobs(160, 140, &centres, 3.0);
        let space = ScaleSpace::build(&plane, 3, 3, 1.6).unwrap();
        let found = ExtremaDetector::new(&AnalyzerConfig::default()).detect(&space);

        for &(cx, cy) in &centres {
            let hit = found.iter().any(|c| {
                let (x, y) = c.detection_position();
                (x - cx).abs() < 2.0 && (y - cy).abs() < 2.0
            });
            assert!(hit, "no keypoint near ({}, {})", cx, cy);
        }
        assert!(found.iter().all(|c| c.response > 0.0 && c.sigma > 0.0));
    }

    #[test]
    fn test_flat_image_has_no_extrema() {
        let plane = Plane::new(96, 96, vec![0.5; 96 * 96]);
        let space = ScaleSpace::build(&plane, 2, 3, 1.6).unwrap();
        assert!(ExtremaDetector::new(&AnalyzerConfig::default()).detect(&space).is_empty());
    }

    #[test]
    fn test_local_extremum_is_strict() {
        let flat = vec![Plane::new(3, 3, vec![0.0; 9]); 3];
        assert!(!is_local_extremum(&flat, 1, 1, 0.0));
        let mut peak = flat.clone();
        peak[1].data[4] = 1.0;
        assert!(is_local_extremum(&peak, 1, 1, 1.0));
    }
}
