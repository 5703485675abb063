//! Correspondence search between pairs of analyzed images.
//!
//! Each image's descriptors go into a [`SpatialIndex`]. A [`PairMatcher`] queries it,
//! verifies the putative matches with RANSAC under a homography or a rotation-based
//! camera model, and spreads the survivors over the first image with a grid sieve.

pub mod config;
pub mod error;
pub mod index;
pub mod matcher;
pub mod model;
pub mod ransac;
pub mod selector;

pub use config::MatchConfig;
pub use error::{MatchError, MatchResult};
pub use index::{Neighbour, SpatialIndex};
pub use matcher::{MatchCandidate, PairMatch, PairMatcher, PairMatcherBuilder};
pub use model::{GeometricModel, ModelFitter, ModelKind, RansacMode};
pub use ransac::{RansacConfig, RansacOutcome};
pub use selector::{FovModelSelector, ModelSelector};
