//! Automatic control-point detection for panorama projects.
//!
//! [`PanoDetector`] analyzes every project image, picks image pairs according to a
//! [`MatchingStrategy`], matches them on a worker pool and appends the verified
//! correspondences to the project as control points.

pub mod accumulator;
pub mod align;
pub mod config;
pub mod context;
pub mod error;
pub mod project;
pub mod scheduler;
pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;

use pano_core::Pose;
use pano_features::{keyfile, ImageSource};
use tracing::{info, warn};

pub use accumulator::{ConstraintPolicy, ResultAccumulator};
pub use config::{CacheConfig, DetectorConfig};
pub use context::RunContext;
pub use error::{ConfigError, DetectorError, DetectorResult, ImageFailure};
pub use project::Project;
pub use scheduler::{Job, JobOutcome, TaskScheduler};
pub use strategy::{MatchingStrategy, MultiRowPlanner, PairLedger, PlanStep};

/// What a run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub images_analyzed: usize,
    pub images_from_cache: usize,
    /// Every scheduled pair, including those in `pairs_failed`
    pub pairs_tested: usize,
    /// Pair jobs that could not run to completion
    pub pairs_failed: usize,
    pub pairs_with_matches: usize,
    pub control_points_added: usize,
}

/// Control-point detection pipeline
pub struct PanoDetector {
    config: DetectorConfig,
    source: Option<Arc<dyn ImageSource>>,
}

impl PanoDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config, source: None }
    }

    /// Decode pixels through `source` instead of reading image files
    pub fn with_source(mut self, source: Arc<dyn ImageSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect control points and append them to `project`
    pub fn run(&self, project: &mut Project) -> DetectorResult<RunReport> {
        self.config.validate()?;
        if self.config.strategy == MatchingStrategy::Prealigned && !self.config.cache.keyfiles_only {
            let missing = project.missing_poses();
            if !missing.is_empty() {
                return Err(ConfigError::MissingPoses(missing).into());
            }
        }
        if project.is_empty() {
            return Ok(RunReport::default());
        }
        info!("{}", self.config.summary());

        let mut ctx = RunContext::new(&self.config, self.source.clone(), project)?;
        let analysis = ctx.run_analysis()?;
        let mut report = RunReport {
            images_analyzed: analysis.analyzed,
            images_from_cache: analysis.from_cache,
            ..RunReport::default()
        };

        for (info, updated) in project.images.iter_mut().zip(ctx.images.iter()) {
            info.width = updated.width;
            info.height = updated.height;
        }
        if self.config.cache.keyfiles_only {
            info!("keyfiles written for {} image(s)", report.images_analyzed);
            return Ok(report);
        }

        self.match_images(&mut ctx, project);

        report.pairs_tested = ctx.pairs_tested();
        report.pairs_failed = ctx.pairs_failed();
        if report.pairs_failed > 0 {
            warn!("{} of {} pair jobs failed", report.pairs_failed, report.pairs_tested);
        }
        report.pairs_with_matches = ctx.accumulator.pairs_with_points();
        report.control_points_added = ctx.accumulator.merge_into(project);
        info!(
            "{} control points from {} of {} pairs",
            report.control_points_added, report.pairs_with_matches, report.pairs_tested
        );
        Ok(report)
    }

    fn match_images(&self, ctx: &mut RunContext<'_>, project: &Project) {
        let n = ctx.images.len();
        match self.config.strategy {
            MatchingStrategy::AllPairs => {
                let all: Vec<usize> = (0..n).collect();
                let pairs = ctx.ledger.claim(strategy::all_pairs(&all));
                ctx.store.set_release_when_done(true);
                ctx.run_pairs(pairs);
            }
            MatchingStrategy::Linear { window } => {
                let pairs = ctx.ledger.claim(strategy::linear_pairs(n, window));
                ctx.store.set_release_when_done(true);
                ctx.run_pairs(pairs);
            }
            MatchingStrategy::Prealigned => {
                let existing = project.connected_pairs();
                let candidates = strategy::prealigned_pairs(&ctx.images, &existing, |a, b| match (&a.pose, &b.pose) {
                    (Some(pa), Some(pb)) => align::images_overlap(a, pa, b, pb, 1.0),
                    _ => false,
                });
                let pairs = ctx.ledger.claim(candidates);
                ctx.store.set_release_when_done(true);
                ctx.run_pairs(pairs);
            }
            MatchingStrategy::MultiRow => self.match_multirow(ctx, project),
        }
    }

    fn match_multirow(&self, ctx: &mut RunContext<'_>, project: &Project) {
        let mut planner = MultiRowPlanner::new(&ctx.images);
        let mut poses: HashMap<usize, Pose> = HashMap::new();
        let scale = self.config.overlap_scale();

        loop {
            let step = {
                let images = &ctx.images;
                let overlaps = |a: usize, b: usize| match (poses.get(&a), poses.get(&b)) {
                    (Some(pa), Some(pb)) => align::images_overlap(&images[a], pa, &images[b], pb, scale),
                    _ => false,
                };
                planner.next_step(&ctx.graph, &mut ctx.ledger, overlaps)
            };
            match step {
                PlanStep::Match(pairs) => {
                    if planner.state() == strategy::MultiRowState::Done {
                        ctx.store.set_release_when_done(true);
                    }
                    ctx.run_pairs(pairs);
                }
                PlanStep::Align(layer) => {
                    let mut control_points = project.control_points.clone();
                    control_points.extend(ctx.accumulator.control_points());
                    let layer_poses = align::rough_align(&ctx.images, &layer, &control_points);
                    if layer_poses.len() < layer.len() {
                        warn!(
                            "rough alignment placed {} of {} layer images, the rest get no overlap pairs",
                            layer_poses.len(),
                            layer.len()
                        );
                    }
                    poses = (0..ctx.images.len())
                        .filter_map(|image| {
                            layer_poses
                                .get(&planner.representative_of(image))
                                .map(|pose| (image, *pose))
                        })
                        .collect();
                }
                PlanStep::Done => break,
            }
        }
    }

    /// Delete the keyfiles of every project image; returns how many existed
    pub fn clean_keyfiles(&self, project: &Project) -> DetectorResult<usize> {
        let mut removed = 0;
        for info in &project.images {
            let path = context::keyfile_location(&self.config, info);
            if keyfile::remove_keyfile(&path)? {
                removed += 1;
            }
        }
        info!("removed {} keyfile(s)", removed);
        Ok(removed)
    }
}
