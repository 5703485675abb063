use std::sync::Arc;

use pano_core::{CameraModel, GridSieve, ImageInfo, ImagePair, KeypointSet};
use rayon::prelude::*;
use tracing::debug;

use crate::config::MatchConfig;
use crate::error::MatchResult;
use crate::index::SpatialIndex;
use crate::model::{ModelFitter, ModelKind, RansacMode};
use crate::ransac;
use crate::selector::{FovModelSelector, ModelSelector};

/// Putative or verified correspondence between keypoint `index_a` of the first image
/// and keypoint `index_b` of the second
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchCandidate {
    pub index_a: usize,
    pub index_b: usize,
    /// Squared descriptor distance
    pub distance: f32,
}

/// Outcome of matching one image pair
#[derive(Debug, Clone, PartialEq)]
pub struct PairMatch {
    pub pair: ImagePair,
    /// Model RANSAC ran with, `None` when matching stopped before verification
    pub model: Option<ModelKind>,
    /// Candidates that passed the ratio test
    pub putative: usize,
    /// Candidates consistent with the fitted model
    pub inliers: usize,
    /// Final matches, empty when the pair did not reach `min_matches`
    pub matches: Vec<MatchCandidate>,
}

impl PairMatch {
    fn empty(pair: ImagePair, putative: usize) -> Self {
        Self {
            pair,
            model: None,
            putative,
            inliers: 0,
            matches: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Finds and verifies correspondences between two analyzed images.
///
/// Descriptors of the first image query the second image's [`SpatialIndex`]; putative
/// matches pass a nearest/second-nearest ratio test, are verified by RANSAC under a
/// per-pair geometric model, thinned on a grid over the first image and finally dropped
/// altogether when too few remain.
#[derive(Clone)]
pub struct PairMatcher {
    config: MatchConfig,
    selector: Arc<dyn ModelSelector>,
}

impl PairMatcher {
    pub fn new(config: MatchConfig) -> MatchResult<Self> {
        PairMatcherBuilder::from_config(config).build()
    }

    pub fn builder() -> PairMatcherBuilder {
        PairMatcherBuilder::new()
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Model used for a pair: the configured one, or the selector's pick in `auto` mode
    pub fn model_for(&self, info_a: &ImageInfo, info_b: &ImageInfo) -> ModelKind {
        self.config
            .ransac_mode
            .fixed()
            .unwrap_or_else(|| self.selector.select(info_a, info_b))
    }

    /// Match `set_a` against `set_b`, whose descriptors are indexed by `index_b`
    pub fn match_pair(
        &self,
        info_a: &ImageInfo,
        set_a: &KeypointSet,
        info_b: &ImageInfo,
        set_b: &KeypointSet,
        index_b: &SpatialIndex,
    ) -> PairMatch {
        let pair = ImagePair::new(set_a.image, set_b.image);

        let putative = self.ratio_matches(set_a, index_b);
        let kind = self.model_for(info_a, info_b);
        if putative.len() < kind.sample_size() {
            debug!(
                "pair {}: {} putative matches, {} needed for {:?}",
                pair,
                putative.len(),
                kind.sample_size(),
                kind
            );
            return PairMatch::empty(pair, putative.len());
        }

        let pts_a: Vec<[f64; 2]> = putative
            .iter()
            .map(|m| {
                let k = &set_a.keypoints[m.index_a];
                [k.x, k.y]
            })
            .collect();
        let pts_b: Vec<[f64; 2]> = putative
            .iter()
            .map(|m| {
                let k = &set_b.keypoints[m.index_b];
                [k.x, k.y]
            })
            .collect();

        let fitter = ModelFitter::new(kind, camera_for(info_a, set_a), camera_for(info_b, set_b));
        let Some(outcome) = ransac::estimate(&fitter, &pts_a, &pts_b, &self.config.ransac()) else {
            debug!("pair {}: RANSAC ({:?}) found no model in {} candidates", pair, kind, putative.len());
            return PairMatch::empty(pair, putative.len());
        };

        let inliers: Vec<MatchCandidate> = outcome.inliers.iter().map(|&i| putative[i]).collect();
        let inlier_count = inliers.len();

        let sieve = GridSieve::new(
            set_a.width as f64,
            set_a.height as f64,
            self.config.sieve2_width,
            self.config.sieve2_height,
            self.config.sieve2_size,
        );
        let mut matches = sieve.apply(
            inliers,
            |m| {
                let k = &set_a.keypoints[m.index_a];
                (k.x, k.y)
            },
            |a, b| a.distance.total_cmp(&b.distance),
        );

        if matches.len() < self.config.min_matches {
            debug!(
                "pair {}: {} matches after sieve, below minimum {}",
                pair,
                matches.len(),
                self.config.min_matches
            );
            matches.clear();
        } else {
            debug!(
                "pair {}: {} putative, {} inliers, {} kept ({:?})",
                pair,
                putative.len(),
                inlier_count,
                matches.len(),
                kind
            );
        }

        PairMatch {
            pair,
            model: Some(kind),
            putative: putative.len(),
            inliers: inlier_count,
            matches,
        }
    }

    /// Nearest-neighbour matches passing the ratio test, one per keypoint of image B
    fn ratio_matches(&self, set_a: &KeypointSet, index_b: &SpatialIndex) -> Vec<MatchCandidate> {
        let ratio = self.config.second_match_distance;
        let mut best_for_b: Vec<Option<MatchCandidate>> = vec![None; index_b.len()];

        let accepted: Vec<MatchCandidate> = set_a
            .keypoints
            .par_iter()
            .enumerate()
            .filter_map(|(index_a, keypoint)| {
                let hits = index_b.nearest_two(&keypoint.descriptor);
                let hit = match hits.as_slice() {
                    [] => None,
                    [only] => Some(only),
                    [best, second, ..] => (best.distance < ratio * second.distance).then_some(best),
                }?;
                Some(MatchCandidate {
                    index_a,
                    index_b: hit.index,
                    distance: hit.distance,
                })
            })
            .collect();

        // Ties keep the lowest index_a
        for candidate in accepted {
            let slot = &mut best_for_b[candidate.index_b];
            if slot.map_or(true, |existing| candidate.distance < existing.distance) {
                *slot = Some(candidate);
            }
        }

        let mut matches: Vec<MatchCandidate> = best_for_b.into_iter().flatten().collect();
        matches.sort_by_key(|m| m.index_a);
        matches
    }
}

/// Camera of an image in the native pixel space of its keypoints
fn camera_for(info: &ImageInfo, set: &KeypointSet) -> CameraModel {
    CameraModel::from_parts(
        set.width as f64,
        set.height as f64,
        info.hfov,
        info.projection,
        info.distortion,
    )
}

/// Builder for creating a `PairMatcher`
#[derive(Clone)]
pub struct PairMatcherBuilder {
    config: MatchConfig,
    selector: Option<Arc<dyn ModelSelector>>,
}

impl Default for PairMatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PairMatcherBuilder {
    pub fn new() -> Self {
        Self::from_config(MatchConfig::default())
    }

    pub fn from_config(config: MatchConfig) -> Self {
        Self { config, selector: None }
    }

    pub fn second_match_distance(mut self, ratio: f32) -> Self {
        self.config.second_match_distance = ratio;
        self
    }

    pub fn ransac_iterations(mut self, iterations: usize) -> Self {
        self.config.ransac_iterations = iterations;
        self
    }

    pub fn ransac_threshold(mut self, pixels: f64) -> Self {
        self.config.ransac_threshold = pixels;
        self
    }

    pub fn ransac_mode(mut self, mode: RansacMode) -> Self {
        self.config.ransac_mode = mode;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn min_matches(mut self, count: usize) -> Self {
        self.config.min_matches = count;
        self
    }

    /// Match grid over the first image: `width x height` cells, `size` matches per cell
    pub fn sieve2(mut self, width: usize, height: usize, size: usize) -> Self {
        self.config.sieve2_width = width;
        self.config.sieve2_height = height;
        self.config.sieve2_size = size;
        self
    }

    /// Model selection for `auto` mode, defaults to [`FovModelSelector`]
    pub fn selector(mut self, selector: Arc<dyn ModelSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn build(self) -> MatchResult<PairMatcher> {
        self.config.validate()?;
        Ok(PairMatcher {
            config: self.config,
            selector: self
                .selector
                .unwrap_or_else(|| Arc::new(FovModelSelector::default())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pano_core::{Keypoint, DESCRIPTOR_LEN};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_descriptor(rng: &mut StdRng) -> [f32; DESCRIPTOR_LEN] {
        let mut d = [0.0f32; DESCRIPTOR_LEN];
        for v in d.iter_mut() {
            *v = rng.gen_range(-1.0..1.0);
        }
        let norm = d.iter().map(|v| v * v).sum::<f32>().sqrt();
        d.iter_mut().for_each(|v| *v /= norm);
        d
    }

    fn keypoint(x: f64, y: f64, descriptor: [f32; DESCRIPTOR_LEN]) -> Keypoint {
        Keypoint {
            x,
            y,
            scale: 2.0,
            orientation: 0.0,
            response: 1.0,
            descriptor,
        }
    }

    fn info(index: usize) -> ImageInfo {
        ImageInfo::new(index, format!("img{}.jpg", index), 1000, 800, 50.0)
    }

    /// Two 1000x800 images whose shared points are offset by 700 px horizontally,
    /// each padded with unrelated distractors.
    fn overlapping_sets(shared: &[(f64, f64)], seed: u64) -> (KeypointSet, KeypointSet) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut a = Vec::new();
        let mut b = Vec::new();
        for &(x, y) in shared {
            let d = random_descriptor(&mut rng);
            a.push(keypoint(x, y, d));
            b.push(keypoint(x - 700.0, y, d));
        }
        for i in 0..30 {
            let y = 20.0 + i as f64 * 25.0;
            a.push(keypoint(100.0 + (i % 5) as f64 * 90.0, y, random_descriptor(&mut rng)));
            b.push(keypoint(450.0 + (i % 5) as f64 * 90.0, y, random_descriptor(&mut rng)));
        }
        (KeypointSet::new(0, 1000, 800, a), KeypointSet::new(1, 1000, 800, b))
    }

    fn grid_points() -> Vec<(f64, f64)> {
        let mut pts = Vec::new();
        for i in 0..5 {
            for j in 0..10 {
                pts.push((720.0 + 60.0 * i as f64, 40.0 + 80.0 * j as f64));
            }
        }
        pts
    }

    fn run(matcher: &PairMatcher, a: &KeypointSet, b: &KeypointSet) -> PairMatch {
        let index_b = SpatialIndex::build(b);
        matcher.match_pair(&info(0), a, &info(1), b, &index_b)
    }

    /// 50 shared points inside the 300 px strip x in [700, 1000) of image A
    #[test]
    fn test_overlap_strip_with_widened_sieve_keeps_45() {
        let (a, b) = overlapping_sets(&grid_points(), 11);
        // Default ratio, RANSAC and min_matches thresholds; only the sieve 2 capacity is raised
        let matcher = PairMatcher::builder().sieve2(5, 5, 10).build().unwrap();
        let result = run(&matcher, &a, &b);

        assert_eq!(result.model, Some(ModelKind::Homography));
        assert!(result.matches.len() >= 45, "only {} matches", result.matches.len());
        for m in &result.matches {
            let ka = &a.keypoints[m.index_a];
            let kb = &b.keypoints[m.index_b];
            assert!((ka.x - 700.0 - kb.x).abs() < 1e-9);
            assert!((ka.y - kb.y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_disjoint_pair_yields_nothing() {
        let (a, _) = overlapping_sets(&grid_points(), 11);
        let (_, b) = overlapping_sets(&grid_points(), 99);
        let matcher = PairMatcher::builder().sieve2(5, 5, 10).build().unwrap();
        assert!(run(&matcher, &a, &b).is_empty());
    }

    #[test]
    fn test_overlap_strip_with_default_sieve_keeps_one_per_cell() {
        let (a, b) = overlapping_sets(&grid_points(), 5);
        let config = MatchConfig::default();
        assert_eq!((config.sieve2_width, config.sieve2_height, config.sieve2_size), (5, 5, 1));
        let matcher = PairMatcher::new(config).unwrap();
        let result = run(&matcher, &a, &b);
        // All 50 verify, but the strip covers only two 200 px columns of five rows
        assert_eq!(result.inliers, 50);
        assert_eq!(result.matches.len(), 10);
        let cells: std::collections::HashSet<(usize, usize)> = result
            .matches
            .iter()
            .map(|m| {
                let k = &a.keypoints[m.index_a];
                ((k.x / 200.0) as usize, (k.y / 160.0) as usize)
            })
            .collect();
        assert_eq!(cells.len(), 10);
    }

    #[test]
    fn test_min_matches_policy() {
        let points = [
            (720.0, 50.0),
            (900.0, 200.0),
            (760.0, 380.0),
            (950.0, 520.0),
            (810.0, 700.0),
            (880.0, 760.0),
        ];
        let matcher = PairMatcher::builder().sieve2(5, 5, 10).build().unwrap();

        let (a, b) = overlapping_sets(&points[..5], 3);
        assert!(run(&matcher, &a, &b).is_empty());

        let (a, b) = overlapping_sets(&points, 3);
        assert_eq!(run(&matcher, &a, &b).matches.len(), 6);
    }

    #[test]
    fn test_empty_sets() {
        let (a, _) = overlapping_sets(&grid_points(), 1);
        let empty = KeypointSet::new(1, 1000, 800, Vec::new());
        let matcher = PairMatcher::new(MatchConfig::default()).unwrap();
        assert!(run(&matcher, &a, &empty).is_empty());
        assert!(run(&matcher, &empty, &a).is_empty());
    }

    #[test]
    fn test_fixed_mode_overrides_selector() {
        let matcher = PairMatcher::builder().ransac_mode(RansacMode::Rpy).build().unwrap();
        assert_eq!(matcher.model_for(&info(0), &info(1)), ModelKind::Rpy);
        let auto = PairMatcher::new(MatchConfig::default()).unwrap();
        assert_eq!(auto.model_for(&info(0), &info(1)), ModelKind::Homography);
    }

    #[test]
    fn test_builder_validates() {
        assert!(PairMatcher::builder().sieve2(0, 5, 1).build().is_err());
    }
}
