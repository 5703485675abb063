use kd_tree::{KdPoint, KdTree};
use pano_core::{Descriptor, KeypointSet, DESCRIPTOR_LEN};

/// Descriptor tagged with the position of its keypoint in the owning set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedDescriptor {
    pub index: usize,
    pub descriptor: Descriptor,
}

impl KdPoint for IndexedDescriptor {
    type Scalar = f32;
    type Dim = typenum::U64;
    fn at(&self, k: usize) -> f32 {
        self.descriptor[k]
    }
}

/// Borrowed query descriptor
struct Query<'a>(&'a Descriptor);

impl KdPoint for Query<'_> {
    type Scalar = f32;
    type Dim = typenum::U64;
    fn at(&self, k: usize) -> f32 {
        self.0[k]
    }
}

/// One nearest-neighbour hit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
    pub index: usize,
    /// Squared Euclidean descriptor distance
    pub distance: f32,
}

/// Nearest-neighbour structure over one image's descriptors.
///
/// Built once after analysis and shared read-only by every pair job that references
/// the image. The search is exact, which satisfies any approximate-search contract.
pub struct SpatialIndex {
    image: usize,
    tree: KdTree<IndexedDescriptor>,
}

impl SpatialIndex {
    pub fn build(set: &KeypointSet) -> Self {
        debug_assert_eq!(DESCRIPTOR_LEN, 64);
        let points: Vec<IndexedDescriptor> = set
            .keypoints
            .iter()
            .enumerate()
            .map(|(index, k)| IndexedDescriptor {
                index,
                descriptor: k.descriptor,
            })
            .collect();
        Self {
            image: set.image,
            tree: KdTree::build_by_ordered_float(points),
        }
    }

    pub fn image(&self) -> usize {
        self.image
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Closest and second-closest descriptors, nearest first
    pub fn nearest_two(&self, query: &Descriptor) -> Vec<Neighbour> {
        if self.tree.is_empty() {
            return Vec::new();
        }
        self.tree
            .nearests(&Query(query), 2)
            .into_iter()
            .map(|hit| Neighbour {
                index: hit.item.index,
                distance: hit.squared_distance,
            })
            .collect()
    }
}
