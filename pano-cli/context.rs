//! State owned by one detection run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pano_core::{ImageInfo, ImagePair};
use pano_features::keyfile;
use pano_features::{AnalyzerBuilder, ImageAnalyzer, ImageSource};
use pano_match::{PairMatcher, PairMatcherBuilder};
use tracing::{debug, info, warn};

use crate::accumulator::ResultAccumulator;
use crate::config::DetectorConfig;
use crate::error::{DetectorError, DetectorResult, ImageFailure};
use crate::project::Project;
use crate::scheduler::{self, FeatureStore, ImageFeatures, Job, JobOutcome, TaskScheduler};
use crate::strategy::{ConnectivityGraph, PairLedger};

/// Counters for one analysis phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisSummary {
    pub analyzed: usize,
    pub from_cache: usize,
}

/// Everything a run needs, created at the start of [`crate::PanoDetector::run`] and
/// dropped at its end
pub struct RunContext<'a> {
    pub config: &'a DetectorConfig,
    pub images: Vec<ImageInfo>,
    pub analyzer: ImageAnalyzer,
    pub matcher: PairMatcher,
    pub scheduler: TaskScheduler,
    pub store: FeatureStore,
    pub accumulator: ResultAccumulator,
    pub ledger: PairLedger,
    pub graph: ConnectivityGraph,
    pairs_tested: usize,
    pairs_failed: usize,
}

impl<'a> RunContext<'a> {
    pub fn new(config: &'a DetectorConfig, source: Option<Arc<dyn ImageSource>>, project: &Project) -> DetectorResult<Self> {
        let mut builder = AnalyzerBuilder::from_config(config.analyzer.clone());
        if let Some(source) = source {
            builder = builder.source(source);
        }
        let analyzer = builder.build()?;
        let matcher = PairMatcherBuilder::from_config(config.matching.clone()).build()?;

        let plans: Vec<_> = project
            .images
            .iter()
            .filter(|info| info.width > 0 && info.height > 0)
            .map(|info| analyzer.plan(info))
            .collect();
        let largest_area = plans.iter().map(|p| p.peak_area()).max().unwrap_or(0);
        let remap = plans.iter().any(|p| p.remap.is_some());
        let requested = config.threads.unwrap_or_else(pano_core::hardware_concurrency);
        let available = config.memory_budget.unwrap_or_else(scheduler::available_memory);
        let workers = scheduler::worker_ceiling(requested, largest_area, remap, available);
        info!("running with {} worker(s)", workers);

        Ok(Self {
            config,
            images: project.images.clone(),
            analyzer,
            matcher,
            scheduler: TaskScheduler::new(workers)?,
            store: FeatureStore::new(),
            accumulator: ResultAccumulator::new(config.constraints, config.stereo_tolerance),
            ledger: PairLedger::new(),
            graph: ConnectivityGraph::from_pairs(project.len(), project.connected_pairs()),
            pairs_tested: 0,
            pairs_failed: 0,
        })
    }

    /// Pairs handed to the scheduler, failed ones included
    pub fn pairs_tested(&self) -> usize {
        self.pairs_tested
    }

    /// Pair jobs that ended in `JobOutcome::Failed` and produced no result
    pub fn pairs_failed(&self) -> usize {
        self.pairs_failed
    }

    fn writes_keyfiles(&self) -> bool {
        self.config.cache.enabled || self.config.cache.keyfiles_only
    }

    /// Keyfile location of an image: the configured directory, else next to the image
    pub fn keyfile_for(&self, info: &ImageInfo) -> PathBuf {
        keyfile_location(self.config, info)
    }

    fn analysis_jobs(&self) -> Vec<Job> {
        self.images
            .iter()
            .map(|info| {
                let path = self.keyfile_for(info);
                if self.config.cache.enabled && !self.config.cache.keyfiles_only && keyfile::is_valid_keyfile(&path, info) {
                    Job::LoadCached { image: info.index, path }
                } else {
                    Job::Analyze { image: info.index }
                }
            })
            .collect()
    }

    fn analyze(&self, info: &ImageInfo) -> JobOutcome {
        let set = match self.analyzer.analyze(info) {
            Ok(set) => set,
            Err(e) => {
                return JobOutcome::Failed {
                    image: info.index,
                    error: e.to_string(),
                }
            }
        };
        if self.writes_keyfiles() {
            let sized = ImageInfo {
                width: set.width,
                height: set.height,
                ..info.clone()
            };
            let path = self.keyfile_for(&sized);
            if let Err(e) = keyfile::write_keyfile(&path, &sized, &set) {
                if self.config.cache.keyfiles_only {
                    return JobOutcome::Failed {
                        image: info.index,
                        error: e.to_string(),
                    };
                }
                warn!("{}: keyfile not written: {}", info.label(), e);
            }
        }
        JobOutcome::Features {
            features: ImageFeatures::new(set),
            from_cache: false,
        }
    }

    fn execute(&self, job: &Job) -> JobOutcome {
        match job {
            Job::Analyze { image } => self.analyze(&self.images[*image]),
            Job::LoadCached { image, path } => {
                let info = &self.images[*image];
                match keyfile::read_keyfile(path, info) {
                    Ok(set) => {
                        debug!("{}: {} keypoints from {}", info.label(), set.len(), path.display());
                        JobOutcome::Features {
                            features: ImageFeatures::new(set),
                            from_cache: true,
                        }
                    }
                    Err(e) => {
                        warn!("{}: cached keypoints unusable ({}), analyzing", info.label(), e);
                        self.analyze(info)
                    }
                }
            }
            Job::Match { pair } => self.match_pair(*pair),
        }
    }

    fn match_pair(&self, pair: ImagePair) -> JobOutcome {
        let (Some(a), Some(b)) = (self.store.get(pair.first), self.store.get(pair.second)) else {
            self.store.finish_pair(pair);
            return JobOutcome::Failed {
                image: pair.first,
                error: format!("features for pair {} are not loaded", pair),
            };
        };
        let result = self.matcher.match_pair(
            &self.images[pair.first],
            &a.keypoints,
            &self.images[pair.second],
            &b.keypoints,
            &b.index,
        );
        self.accumulator.add_pair(&a.keypoints, &b.keypoints, &result);
        self.store.finish_pair(pair);
        JobOutcome::Matched(result)
    }

    /// Analyze or load every image; any failure fails the phase after all jobs ran
    pub fn run_analysis(&mut self) -> DetectorResult<AnalysisSummary> {
        let jobs = self.analysis_jobs();
        info!("analyzing {} image(s)", jobs.len());
        let outcomes = {
            let this = &*self;
            this.scheduler.run_queue(jobs, |job| this.execute(job))
        };

        let mut summary = AnalysisSummary::default();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                JobOutcome::Features { features, from_cache } => {
                    let info = &mut self.images[features.image()];
                    if info.width == 0 || info.height == 0 {
                        info.width = features.keypoints.width;
                        info.height = features.keypoints.height;
                    }
                    if from_cache {
                        summary.from_cache += 1;
                    } else {
                        summary.analyzed += 1;
                    }
                    self.store.insert(features);
                }
                JobOutcome::Failed { image, error } => failures.push(ImageFailure {
                    index: image,
                    filename: self.images[image].filename.clone(),
                    reason: error,
                }),
                JobOutcome::Matched(_) => {}
            }
        }

        if !failures.is_empty() {
            return Err(DetectorError::ImagesFailed(failures));
        }
        Ok(summary)
    }

    /// Match a batch of pairs already claimed in the ledger
    pub fn run_pairs(&mut self, pairs: Vec<ImagePair>) {
        if pairs.is_empty() {
            return;
        }
        info!("matching {} pair(s)", pairs.len());
        self.store.reserve(&pairs);
        self.pairs_tested += pairs.len();
        let jobs: Vec<Job> = pairs.into_iter().map(|pair| Job::Match { pair }).collect();
        let outcomes = {
            let this = &*self;
            this.scheduler.run_queue(jobs, |job| this.execute(job))
        };
        for outcome in outcomes {
            match outcome {
                JobOutcome::Matched(result) if !result.is_empty() => {
                    self.graph.union(result.pair.first, result.pair.second);
                }
                JobOutcome::Failed { .. } => self.pairs_failed += 1,
                _ => {}
            }
        }
    }
}

/// Keyfile location used by both detection and cleanup
pub fn keyfile_location(config: &DetectorConfig, info: &ImageInfo) -> PathBuf {
    let dir = match &config.cache.keypath {
        Some(dir) => dir.clone(),
        None => info
            .filename
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    keyfile::keyfile_path(&dir, info)
}
