//! Batch job execution on a fixed worker pool.
//!
//! Workers pull jobs from a shared channel, so long jobs do not hold up short ones, and
//! push outcomes to a second channel. [`TaskScheduler::run_queue`] returns only after
//! every job of the batch has finished, which separates the analysis phase from the
//! matching phase.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use pano_core::{ImagePair, KeypointSet};
use pano_match::{PairMatch, SpatialIndex};
use sysinfo::System;
use tracing::{debug, warn};

use crate::error::DetectorResult;

/// Peak working memory per detection pixel: scale space, difference images and the
/// decoded source
pub const BYTES_PER_PIXEL: u64 = 64;

/// One unit of work
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Analyze { image: usize },
    LoadCached { image: usize, path: PathBuf },
    Match { pair: ImagePair },
}

impl Job {
    /// Image whose failure this job reports
    pub fn image(&self) -> usize {
        match self {
            Job::Analyze { image } | Job::LoadCached { image, .. } => *image,
            Job::Match { pair } => pair.first,
        }
    }
}

/// Keypoints of one image with the index built over them
pub struct ImageFeatures {
    pub keypoints: KeypointSet,
    pub index: SpatialIndex,
}

impl ImageFeatures {
    pub fn new(keypoints: KeypointSet) -> Self {
        let index = SpatialIndex::build(&keypoints);
        Self { keypoints, index }
    }

    pub fn image(&self) -> usize {
        self.keypoints.image
    }
}

pub enum JobOutcome {
    Features { features: ImageFeatures, from_cache: bool },
    Matched(PairMatch),
    Failed { image: usize, error: String },
}

/// Workers to run: the requested count, lowered until the largest detection buffer
/// fits in `available_bytes` once per worker. Never below one.
pub fn worker_ceiling(requested: usize, largest_area: u64, remap: bool, available_bytes: u64) -> usize {
    let multiplier = if remap { 2 } else { 1 };
    let per_worker = BYTES_PER_PIXEL * largest_area.max(1) * multiplier;
    let memory_limit = usize::try_from(available_bytes / per_worker).unwrap_or(usize::MAX).max(1);
    let requested = requested.max(1);
    if memory_limit < requested {
        warn!(
            "limiting workers from {} to {}: {} MiB available, {} MiB per worker",
            requested,
            memory_limit,
            available_bytes >> 20,
            per_worker >> 20
        );
    }
    requested.min(memory_limit)
}

/// Memory currently available to new allocations, in bytes
pub fn available_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.available_memory()
}

pub struct TaskScheduler {
    workers: usize,
    pool: rayon::ThreadPool,
}

impl TaskScheduler {
    pub fn new(workers: usize) -> DetectorResult<Self> {
        let workers = workers.max(1);
        let pool = pano_core::build_thread_pool(workers)?;
        Ok(Self { workers, pool })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every job exactly once and return the outcomes in job order
    pub fn run_queue<F>(&self, jobs: Vec<Job>, execute: F) -> Vec<JobOutcome>
    where
        F: Fn(&Job) -> JobOutcome + Sync,
    {
        let total = jobs.len();
        if total == 0 {
            return Vec::new();
        }
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, Job)>();
        let (out_tx, out_rx) = crossbeam_channel::unbounded::<(usize, JobOutcome)>();
        for entry in jobs.into_iter().enumerate() {
            // Receiver is alive until the scope below ends
            let _ = job_tx.send(entry);
        }
        drop(job_tx);

        let execute = &execute;
        self.pool.scope(|scope| {
            for _ in 0..self.workers.min(total) {
                let job_rx = job_rx.clone();
                let out_tx = out_tx.clone();
                scope.spawn(move |_| {
                    while let Ok((seq, job)) = job_rx.recv() {
                        let outcome = execute(&job);
                        if let JobOutcome::Failed { image, error } = &outcome {
                            warn!("job {:?} failed on image {}: {}", job, image, error);
                        }
                        if out_tx.send((seq, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(out_tx);

        let mut outcomes: Vec<(usize, JobOutcome)> = out_rx.iter().collect();
        outcomes.sort_by_key(|(seq, _)| *seq);
        debug!("queue of {} jobs drained on {} workers", total, self.workers);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

struct Slot {
    features: Arc<ImageFeatures>,
    pending: usize,
}

#[derive(Default)]
struct StoreState {
    slots: HashMap<usize, Slot>,
    release_when_done: bool,
}

/// Per-run owner of every image's keypoints and index.
///
/// Pair jobs are counted per image; once the last pending pair of an image finishes and
/// release is enabled, the store drops its reference and the index is freed as soon as
/// no running job still holds it.
#[derive(Default)]
pub struct FeatureStore {
    state: Mutex<StoreState>,
}

impl FeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, features: ImageFeatures) {
        let image = features.image();
        self.lock().slots.insert(
            image,
            Slot {
                features: Arc::new(features),
                pending: 0,
            },
        );
    }

    pub fn get(&self, image: usize) -> Option<Arc<ImageFeatures>> {
        self.lock().slots.get(&image).map(|slot| Arc::clone(&slot.features))
    }

    pub fn contains(&self, image: usize) -> bool {
        self.lock().slots.contains_key(&image)
    }

    /// Number of images whose features are still held
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop features once their last pending pair finishes
    pub fn set_release_when_done(&self, release: bool) {
        self.lock().release_when_done = release;
    }

    /// Count the pairs about to run against each of their images
    pub fn reserve(&self, pairs: &[ImagePair]) {
        let mut state = self.lock();
        for pair in pairs {
            for image in [pair.first, pair.second] {
                if let Some(slot) = state.slots.get_mut(&image) {
                    slot.pending += 1;
                }
            }
        }
    }

    /// Mark one pair job as finished
    pub fn finish_pair(&self, pair: ImagePair) {
        let mut state = self.lock();
        let release = state.release_when_done;
        for image in [pair.first, pair.second] {
            let done = match state.slots.get_mut(&image) {
                Some(slot) => {
                    slot.pending = slot.pending.saturating_sub(1);
                    slot.pending == 0
                }
                None => false,
            };
            if done && release {
                state.slots.remove(&image);
                debug!("released features of image {}", image);
            }
        }
    }
}
