//! Rough rotation-only alignment and geometric overlap tests.
//!
//! Used between the layer phase and the overlap phase of multi-row matching, and by
//! prealigned matching with the poses stored in the project.

use std::collections::{BTreeMap, HashMap, VecDeque};

use nalgebra::{Matrix3, Rotation3, Vector3};
use pano_core::{CameraModel, ControlPoint, ImageInfo, ImagePair, Pose};
use pano_match::model::kabsch;
use tracing::debug;

use crate::strategy::ConnectivityGraph;

const REFINE_ROUNDS: usize = 5;
const OUTLINE_SAMPLES: usize = 8;

/// Relative rotation taking rays of `pair.first` onto rays of `pair.second`, with the
/// number of control points that support it
#[derive(Debug, Clone)]
pub struct PairRotation {
    pub pair: ImagePair,
    pub rotation: Rotation3<f64>,
    pub weight: usize,
}

/// Estimate one rotation per connected pair from its control points
pub fn pair_rotations(images: &[ImageInfo], control_points: &[ControlPoint]) -> Vec<PairRotation> {
    let mut grouped: BTreeMap<ImagePair, (Vec<Vector3<f64>>, Vec<Vector3<f64>>)> = BTreeMap::new();
    for cp in control_points {
        let pair = cp.pair();
        let (p1, p2) = ((cp.x1, cp.y1), (cp.x2, cp.y2));
        // Orient every point from `pair.first` to `pair.second`
        let (img_a, pa, img_b, pb) = if cp.image1 == pair.first {
            (cp.image1, p1, cp.image2, p2)
        } else {
            (cp.image2, p2, cp.image1, p1)
        };
        let ray_a = images[img_a].camera().pixel_to_ray(pa.0, pa.1);
        let ray_b = images[img_b].camera().pixel_to_ray(pb.0, pb.1);
        if let (Some(ra), Some(rb)) = (ray_a, ray_b) {
            let entry = grouped.entry(pair).or_default();
            entry.0.push(ra);
            entry.1.push(rb);
        }
    }

    grouped
        .into_iter()
        .filter_map(|(pair, (a, b))| {
            let weight = a.len();
            kabsch(&a, &b).map(|rotation| PairRotation { pair, rotation, weight })
        })
        .collect()
}

/// Chordal mean of rotations, projected back onto SO(3)
fn mean_rotation(samples: &[(Rotation3<f64>, f64)]) -> Option<Rotation3<f64>> {
    let total: f64 = samples.iter().map(|(_, w)| w).sum();
    if samples.is_empty() || total <= 0.0 {
        return None;
    }
    let mut sum = Matrix3::zeros();
    for (r, w) in samples {
        sum += r.matrix() * *w;
    }
    Some(Rotation3::from_matrix(&(sum / total)))
}

/// Camera-to-world rotations for the images of `layer` connected to its first image.
///
/// A maximum-weight spanning tree over the pair rotations fixes an initial estimate;
/// a few rounds of neighbour averaging then spread the residual error.
pub fn rough_align(images: &[ImageInfo], layer: &[usize], control_points: &[ControlPoint]) -> HashMap<usize, Pose> {
    let Some(&root) = layer.first() else {
        return HashMap::new();
    };
    let in_layer = |i: usize| layer.contains(&i);
    let mut edges: Vec<PairRotation> = pair_rotations(images, control_points)
        .into_iter()
        .filter(|e| in_layer(e.pair.first) && in_layer(e.pair.second))
        .collect();
    edges.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.pair.cmp(&b.pair)));

    // Kruskal on descending weight
    let mut forest = ConnectivityGraph::new(images.len());
    let mut tree: HashMap<usize, Vec<(usize, Rotation3<f64>)>> = HashMap::new();
    for e in &edges {
        if forest.union(e.pair.first, e.pair.second) {
            // first -> second maps rays of first onto rays of second
            tree.entry(e.pair.first).or_default().push((e.pair.second, e.rotation));
            tree.entry(e.pair.second).or_default().push((e.pair.first, e.rotation.inverse()));
        }
    }

    // R_b = R_a * R_ab^T where R_ab takes rays of a onto rays of b
    let mut global: HashMap<usize, Rotation3<f64>> = HashMap::new();
    global.insert(root, Rotation3::identity());
    let mut queue = VecDeque::from([root]);
    while let Some(a) = queue.pop_front() {
        let r_a = global[&a];
        for &(b, r_ab) in tree.get(&a).map(Vec::as_slice).unwrap_or(&[]) {
            if !global.contains_key(&b) {
                global.insert(b, r_a * r_ab.inverse());
                queue.push_back(b);
            }
        }
    }

    for _ in 0..REFINE_ROUNDS {
        let snapshot = global.clone();
        for (&image, rotation) in global.iter_mut() {
            if image == root {
                continue;
            }
            let estimates: Vec<(Rotation3<f64>, f64)> = edges
                .iter()
                .filter_map(|e| {
                    if e.pair.second == image {
                        snapshot.get(&e.pair.first).map(|r| (r * e.rotation.inverse(), e.weight as f64))
                    } else if e.pair.first == image {
                        snapshot.get(&e.pair.second).map(|r| (r * e.rotation, e.weight as f64))
                    } else {
                        None
                    }
                })
                .collect();
            if let Some(mean) = mean_rotation(&estimates) {
                *rotation = mean;
            }
        }
    }

    debug!("rough alignment placed {} of {} layer images", global.len(), layer.len());
    global
        .into_iter()
        .map(|(image, r)| (image, Pose::from_rotation(&r)))
        .collect()
}

/// Points along the border of an image, in pixels
fn outline(camera: &CameraModel) -> Vec<(f64, f64)> {
    let (w, h) = camera.size();
    let (w, h) = (w - 1.0, h - 1.0);
    let mut pts = vec![(w / 2.0, h / 2.0)];
    for i in 0..=OUTLINE_SAMPLES {
        let t = i as f64 / OUTLINE_SAMPLES as f64;
        pts.extend([(t * w, 0.0), (t * w, h), (0.0, t * h), (w, t * h)]);
    }
    pts
}

fn projects_into(from: &CameraModel, from_pose: &Pose, to: &CameraModel, to_pose: &Pose) -> bool {
    let world_to_to = to_pose.rotation().inverse();
    let from_to_world = from_pose.rotation();
    outline(from).into_iter().any(|(x, y)| {
        from.pixel_to_ray(x, y)
            .and_then(|ray| to.ray_to_pixel(&(world_to_to * (from_to_world * ray))))
            .is_some_and(|(u, v)| to.contains(u, v))
    })
}

/// Whether two posed images overlap, with fields of view widened by `fov_scale`
pub fn images_overlap(a: &ImageInfo, pose_a: &Pose, b: &ImageInfo, pose_b: &Pose, fov_scale: f64) -> bool {
    let cam_a = a.camera().with_hfov_scale(fov_scale);
    let cam_b = b.camera().with_hfov_scale(fov_scale);
    projects_into(&cam_a, pose_a, &cam_b, pose_b) || projects_into(&cam_b, pose_b, &cam_a, pose_a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn info(index: usize) -> ImageInfo {
        ImageInfo::new(index, format!("{}.jpg", index), 1000, 800, 60.0)
    }

    /// Control points between two posed images from a grid of shared world directions
    fn synthetic_points(images: &[ImageInfo], poses: &[Pose], a: usize, b: usize) -> Vec<ControlPoint> {
        let (ca, cb) = (images[a].camera(), images[b].camera());
        let (ra, rb) = (poses[a].rotation(), poses[b].rotation());
        let mut cps = Vec::new();
        for i in 0..10 {
            for j in 0..8 {
                let (x, y) = (50.0 + i as f64 * 100.0, 50.0 + j as f64 * 100.0);
                let Some(ray) = ca.pixel_to_ray(x, y) else { continue };
                let Some((u, v)) = cb.ray_to_pixel(&(rb.inverse() * (ra * ray))) else { continue };
                if cb.contains(u, v) {
                    cps.push(ControlPoint {
                        image1: a,
                        x1: x,
                        y1: y,
                        image2: b,
                        x2: u,
                        y2: v,
                        mode: Default::default(),
                    });
                }
            }
        }
        cps
    }

    #[test]
    fn test_recovers_chain_of_yaws() {
        let images: Vec<ImageInfo> = (0..4).map(info).collect();
        let poses: Vec<Pose> = (0..4).map(|i| Pose::new(i as f64 * 35.0, 2.0, 0.0)).collect();
        let mut cps = Vec::new();
        for i in 0..3 {
            cps.extend(synthetic_points(&images, &poses, i + 1, i));
        }

        let found = rough_align(&images, &[0, 1, 2, 3], &cps);
        assert_eq!(found.len(), 4);
        // Poses are recovered relative to the root image
        let root = poses[0].rotation();
        for i in 0..4 {
            let expected = root.inverse() * poses[i].rotation();
            let got = found[&i].rotation();
            assert_abs_diff_eq!(expected.angle_to(&got), 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_disconnected_images_get_no_pose() {
        let images: Vec<ImageInfo> = (0..3).map(info).collect();
        let poses: Vec<Pose> = (0..3).map(|i| Pose::new(i as f64 * 35.0, 0.0, 0.0)).collect();
        let cps = synthetic_points(&images, &poses, 0, 1);
        let found = rough_align(&images, &[0, 1, 2], &cps);
        assert!(found.contains_key(&1));
        assert!(!found.contains_key(&2));
    }

    #[test]
    fn test_overlap() {
        let (a, b) = (info(0), info(1));
        let origin = Pose::new(0.0, 0.0, 0.0);
        assert!(images_overlap(&a, &origin, &b, &Pose::new(40.0, 0.0, 0.0), 1.0));
        assert!(!images_overlap(&a, &origin, &b, &Pose::new(70.0, 0.0, 0.0), 1.0));
        // Widening tolerates a small gap
        assert!(images_overlap(&a, &origin, &b, &Pose::new(70.0, 0.0, 0.0), 1.25));
        assert!(!images_overlap(&a, &origin, &b, &Pose::new(180.0, 0.0, 0.0), 1.25));
    }
}
