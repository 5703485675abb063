use std::collections::HashSet;
use std::sync::Mutex;

use pano_core::{ConstraintMode, ControlPoint, ImagePair, KeypointSet};
use pano_match::PairMatch;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::project::Project;

/// How verified matches turn into control point constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintPolicy {
    /// Every match constrains both axes
    #[default]
    General,
    /// Stereo window alignment: matches with no vertical offset lie on a common
    /// horizontal line and constrain only that line
    StereoWindow,
}

#[derive(Default)]
struct Collected {
    points: Vec<ControlPoint>,
    pairs: HashSet<ImagePair>,
    pairs_with_points: usize,
}

/// Thread-safe sink for the control points of finished pair jobs
pub struct ResultAccumulator {
    policy: ConstraintPolicy,
    stereo_tolerance: f64,
    inner: Mutex<Collected>,
}

impl ResultAccumulator {
    pub fn new(policy: ConstraintPolicy, stereo_tolerance: f64) -> Self {
        Self {
            policy,
            stereo_tolerance,
            inner: Mutex::new(Collected::default()),
        }
    }

    pub fn policy(&self) -> ConstraintPolicy {
        self.policy
    }

    fn classify(&self, y1: f64, y2: f64) -> ConstraintMode {
        match self.policy {
            ConstraintPolicy::General => ConstraintMode::BothAxes,
            ConstraintPolicy::StereoWindow if (y1 - y2).abs() <= self.stereo_tolerance => {
                ConstraintMode::HorizontalOnly
            }
            ConstraintPolicy::StereoWindow => ConstraintMode::BothAxes,
        }
    }

    /// Convert the matches of one pair into control points, with `set_a`'s image first.
    ///
    /// Returns the number of points added; a pair recorded before is ignored.
    pub fn add_pair(&self, set_a: &KeypointSet, set_b: &KeypointSet, result: &PairMatch) -> usize {
        let points: Vec<ControlPoint> = result
            .matches
            .iter()
            .map(|m| {
                let a = &set_a.keypoints[m.index_a];
                let b = &set_b.keypoints[m.index_b];
                ControlPoint {
                    image1: set_a.image,
                    x1: a.x,
                    y1: a.y,
                    image2: set_b.image,
                    x2: b.x,
                    y2: b.y,
                    mode: self.classify(a.y, b.y),
                }
            })
            .collect();

        let mut inner = self.lock();
        if !inner.pairs.insert(result.pair) {
            warn!("pair {} reported twice, ignoring the second result", result.pair);
            return 0;
        }
        let added = points.len();
        if added > 0 {
            inner.pairs_with_points += 1;
        }
        inner.points.extend(points);
        added
    }

    pub fn pairs_recorded(&self) -> usize {
        self.lock().pairs.len()
    }

    pub fn pairs_with_points(&self) -> usize {
        self.lock().pairs_with_points
    }

    pub fn len(&self) -> usize {
        self.lock().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Points so far, grouped by pair in pair order so results do not depend on job timing
    pub fn control_points(&self) -> Vec<ControlPoint> {
        let mut points = self.lock().points.clone();
        points.sort_by_key(|cp| cp.pair());
        points
    }

    /// Append everything collected to the project; returns the number of points added
    pub fn merge_into(&self, project: &mut Project) -> usize {
        let points = self.control_points();
        let added = points.len();
        project.control_points.extend(points);
        added
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collected> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pano_core::{Keypoint, DESCRIPTOR_LEN};
    use pano_match::MatchCandidate;

    fn set(image: usize, points: &[(f64, f64)]) -> KeypointSet {
        let keypoints = points
            .iter()
            .map(|&(x, y)| Keypoint {
                x,
                y,
                scale: 1.0,
                orientation: 0.0,
                response: 1.0,
                descriptor: [0.0; DESCRIPTOR_LEN],
            })
            .collect();
        KeypointSet::new(image, 100, 100, keypoints)
    }

    fn result(a: usize, b: usize, n: usize) -> PairMatch {
        PairMatch {
            pair: ImagePair::new(a, b),
            model: None,
            putative: n,
            inliers: n,
            matches: (0..n)
                .map(|i| MatchCandidate {
                    index_a: i,
                    index_b: i,
                    distance: 0.0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_points_use_native_coordinates() {
        let acc = ResultAccumulator::new(ConstraintPolicy::General, 2.0);
        let a = set(3, &[(10.0, 20.0), (30.0, 40.0)]);
        let b = set(1, &[(11.5, 21.0), (31.5, 45.0)]);
        assert_eq!(acc.add_pair(&a, &b, &result(3, 1, 2)), 2);

        let points = acc.control_points();
        assert_eq!(points[0].image1, 3);
        assert_eq!(points[0].image2, 1);
        assert_eq!((points[1].x2, points[1].y2), (31.5, 45.0));
        assert!(points.iter().all(|cp| cp.mode == ConstraintMode::BothAxes));
    }

    #[test]
    fn test_duplicate_pair_is_ignored() {
        let acc = ResultAccumulator::new(ConstraintPolicy::General, 2.0);
        let a = set(0, &[(1.0, 1.0)]);
        let b = set(1, &[(2.0, 2.0)]);
        assert_eq!(acc.add_pair(&a, &b, &result(0, 1, 1)), 1);
        assert_eq!(acc.add_pair(&b, &a, &result(1, 0, 1)), 0);
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.pairs_recorded(), 1);
    }

    #[test]
    fn test_stereo_window_marks_level_points() {
        let acc = ResultAccumulator::new(ConstraintPolicy::StereoWindow, 2.0);
        let a = set(0, &[(50.0, 20.0), (50.0, 60.0)]);
        let b = set(1, &[(40.0, 21.0), (40.0, 70.0)]);
        acc.add_pair(&a, &b, &result(0, 1, 2));
        let modes: Vec<_> = acc.control_points().iter().map(|cp| cp.mode).collect();
        assert_eq!(modes, vec![ConstraintMode::HorizontalOnly, ConstraintMode::BothAxes]);
    }

    #[test]
    fn test_merge_appends() {
        let acc = ResultAccumulator::new(ConstraintPolicy::General, 2.0);
        acc.add_pair(&set(0, &[(1.0, 1.0)]), &set(1, &[(2.0, 2.0)]), &result(0, 1, 1));
        let mut project = Project::default();
        project.control_points.push(ControlPoint {
            image1: 0,
            x1: 0.0,
            y1: 0.0,
            image2: 1,
            x2: 0.0,
            y2: 0.0,
            mode: ConstraintMode::BothAxes,
        });
        assert_eq!(acc.merge_into(&mut project), 1);
        assert_eq!(project.control_points.len(), 2);
    }
}
