//! RANSAC verification of putative correspondences.
//!
//! Samples minimal subsets for the chosen [`ModelKind`](crate::model::ModelKind), keeps the model with the most
//! inliers, then re-fits on all inliers and recounts. A fixed seed makes every run
//! reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::{GeometricModel, ModelFitter};

/// Default seed when the caller does not pin one
pub const DEFAULT_SEED: u64 = 0x5eed_0f_c0de;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RansacConfig {
    pub iterations: usize,
    /// Inlier threshold in pixels of image B
    pub threshold: f64,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            threshold: 50.0,
            seed: DEFAULT_SEED,
        }
    }
}

/// Verified model with the indices of its supporting correspondences
#[derive(Debug, Clone)]
pub struct RansacOutcome {
    pub model: GeometricModel,
    pub inliers: Vec<usize>,
}

/// Robustly fit `fitter`'s model to `a[i] <-> b[i]`.
///
/// Returns `None` when there are fewer correspondences than the minimal sample or when no
/// sample produces a usable model.
pub fn estimate(
    fitter: &ModelFitter,
    a: &[[f64; 2]],
    b: &[[f64; 2]],
    config: &RansacConfig,
) -> Option<RansacOutcome> {
    let n = a.len().min(b.len());
    let k = fitter.sample_size();
    if n < k {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(GeometricModel, Vec<usize>)> = None;

    for _ in 0..config.iterations.max(1) {
        let sample = sample_indices(&mut rng, n, k);
        let sample_a: Vec<[f64; 2]> = sample.iter().map(|&i| a[i]).collect();
        let sample_b: Vec<[f64; 2]> = sample.iter().map(|&i| b[i]).collect();

        let Some(model) = fitter.fit(&sample_a, &sample_b) else {
            continue;
        };
        let inliers = inliers_of(&model, a, b, config.threshold);

        let improved = best
            .as_ref()
            .map_or(true, |(_, best_inliers)| inliers.len() > best_inliers.len());
        if improved {
            let all = inliers.len() == n;
            best = Some((model, inliers));
            if all {
                break;
            }
        }
    }

    let (model, inliers) = best?;
    if inliers.len() < k {
        return None;
    }

    // Re-fit on the consensus set, keep it only if it does not lose support
    let inlier_a: Vec<[f64; 2]> = inliers.iter().map(|&i| a[i]).collect();
    let inlier_b: Vec<[f64; 2]> = inliers.iter().map(|&i| b[i]).collect();
    if let Some(refined) = fitter.fit(&inlier_a, &inlier_b) {
        let refined_inliers = inliers_of(&refined, a, b, config.threshold);
        if refined_inliers.len() >= inliers.len() {
            return Some(RansacOutcome {
                model: refined,
                inliers: refined_inliers,
            });
        }
    }

    Some(RansacOutcome { model, inliers })
}

fn inliers_of(model: &GeometricModel, a: &[[f64; 2]], b: &[[f64; 2]], threshold: f64) -> Vec<usize> {
    a.iter()
        .zip(b.iter())
        .enumerate()
        .filter(|(_, (pa, pb))| model.transfer_error(**pa, **pb) < threshold)
        .map(|(i, _)| i)
        .collect()
}

/// Sample `k` distinct indices from `0..n` with a partial Fisher-Yates shuffle
fn sample_indices(rng: &mut impl Rng, n: usize, k: usize) -> Vec<usize> {
    debug_assert!(k <= n);
    let mut indices: Vec<usize> = (0..n).collect();
    for i in 0..k {
        let j = rng.gen_range(i..n);
        indices.swap(i, j);
    }
    indices.truncate(k);
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{project, ModelKind};
    use nalgebra::Matrix3;
    use pano_core::{CameraModel, Projection};

    fn camera() -> CameraModel {
        CameraModel::from_parts(1000.0, 800.0, 50.0, Projection::Rectilinear, [0.0; 3])
    }

    fn homography_fitter() -> ModelFitter {
        ModelFitter::new(ModelKind::Homography, camera(), camera())
    }

    /// 40 inliers under a translation plus 10 gross outliers
    fn contaminated() -> (Vec<[f64; 2]>, Vec<[f64; 2]>) {
        let h = Matrix3::new(1.0, 0.0, -600.0, 0.0, 1.0, 15.0, 0.0, 0.0, 1.0);
        let mut a = Vec::new();
        let mut b = Vec::new();
        for i in 0..40 {
            let p = [650.0 + (i % 8) as f64 * 40.0, 60.0 + (i / 8) as f64 * 150.0];
            let (x, y) = project(&h, p[0], p[1]).unwrap();
            a.push(p);
            b.push([x, y]);
        }
        for i in 0..10 {
            a.push([700.0 + i as f64 * 25.0, 300.0]);
            b.push([900.0 - i as f64 * 70.0, 750.0 - i as f64 * 60.0]);
        }
        (a, b)
    }

    #[test]
    fn test_sample_indices_distinct() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let mut s = sample_indices(&mut rng, 10, 4);
            s.sort_unstable();
            s.dedup();
            assert_eq!(s.len(), 4);
            assert!(s.iter().all(|&i| i < 10));
        }
    }

    #[test]
    fn test_rejects_outliers() {
        let (a, b) = contaminated();
        let outcome = estimate(&homography_fitter(), &a, &b, &RansacConfig::default()).unwrap();
        assert_eq!(outcome.inliers, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let (a, b) = contaminated();
        let config = RansacConfig {
            iterations: 50,
            threshold: 5.0,
            seed: 42,
        };
        let first = estimate(&homography_fitter(), &a, &b, &config).unwrap();
        let second = estimate(&homography_fitter(), &a, &b, &config).unwrap();
        assert_eq!(first.inliers, second.inliers);
    }

    #[test]
    fn test_too_few_points() {
        let a = vec![[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]];
        assert!(estimate(&homography_fitter(), &a, &a, &RansacConfig::default()).is_none());
    }

    #[test]
    fn test_degenerate_points_give_nothing() {
        // All correspondences collapse onto one point
        let a = vec![[100.0, 100.0]; 10];
        let b = vec![[50.0, 50.0]; 10];
        let outcome = estimate(&homography_fitter(), &a, &b, &RansacConfig::default());
        assert!(outcome.is_none());
    }
}
