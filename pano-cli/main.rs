//! panodetect: find control points between the images of a panorama project.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use pano_cli::{ConstraintPolicy, DetectorConfig, MatchingStrategy, PanoDetector, Project};
use pano_match::RansacMode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "panodetect")]
#[command(about = "Detect control points between overlapping panorama images")]
#[command(version)]
struct Cli {
    /// Project file (JSON)
    input: PathBuf,

    /// Output project file, stdout when absent
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Settings file (TOML or JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads, hardware concurrency by default
    #[arg(short, long)]
    threads: Option<usize>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only analyze images and write keyfiles
    #[arg(long)]
    keyfiles_only: bool,

    /// Reuse and write keyfiles
    #[arg(long)]
    cache: bool,

    /// Keyfile directory, next to each image by default
    #[arg(long)]
    keypath: Option<PathBuf>,

    /// Delete the project's keyfiles and exit
    #[arg(long)]
    clean: bool,

    /// Match only neighbouring images in project order
    #[arg(long)]
    linearmatch: bool,

    /// Number of following images matched in linear mode
    #[arg(long, default_value_t = 1)]
    linearmatchlen: usize,

    /// Multi-row strategy: stacks, layer chain, rough alignment, overlap
    #[arg(long)]
    multirow: bool,

    /// Match only pairs whose stored poses overlap
    #[arg(long)]
    prealigned: bool,

    /// Analyze large images at full resolution
    #[arg(long)]
    fullscale: bool,

    #[arg(long)]
    sieve1width: Option<usize>,
    #[arg(long)]
    sieve1height: Option<usize>,
    #[arg(long)]
    sieve1size: Option<usize>,

    /// Ratio test threshold on squared descriptor distances
    #[arg(long)]
    kdtreeseconddist: Option<f32>,

    #[arg(long)]
    ransaciter: Option<usize>,

    /// RANSAC inlier distance in pixels
    #[arg(long)]
    ransacdist: Option<f64>,

    /// auto, hom, rpy, rpyv or rpyvb
    #[arg(long, value_parser = parse_ransac_mode)]
    ransacmode: Option<RansacMode>,

    /// Pairs with fewer verified matches get no control points
    #[arg(long)]
    minmatches: Option<usize>,

    #[arg(long)]
    sieve2width: Option<usize>,
    #[arg(long)]
    sieve2height: Option<usize>,
    #[arg(long)]
    sieve2size: Option<usize>,

    /// Drop keypoints on clouds and sky
    #[arg(long)]
    celeste: bool,

    #[arg(long)]
    celestethreshold: Option<f64>,

    #[arg(long)]
    celesteradius: Option<u32>,

    /// Cloud model file (JSON)
    #[arg(long)]
    celestemodel: Option<PathBuf>,

    /// Stereo window alignment: level matches constrain only their horizontal line
    #[arg(long)]
    stereo: bool,

    /// RANSAC seed
    #[arg(long)]
    seed: Option<u64>,

    /// Use the true field of view in multi-row overlap tests
    #[arg(long)]
    exact_overlap: bool,
}

fn parse_ransac_mode(s: &str) -> Result<RansacMode, String> {
    s.parse().map_err(|e: pano_match::MatchError| e.to_string())
}

impl Cli {
    fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    fn strategy(&self) -> anyhow::Result<Option<MatchingStrategy>> {
        let chosen = [self.linearmatch, self.multirow, self.prealigned]
            .iter()
            .filter(|&&flag| flag)
            .count();
        if chosen > 1 {
            bail!("--linearmatch, --multirow and --prealigned are mutually exclusive");
        }
        Ok(if self.linearmatch {
            Some(MatchingStrategy::Linear {
                window: self.linearmatchlen,
            })
        } else if self.multirow {
            Some(MatchingStrategy::MultiRow)
        } else if self.prealigned {
            Some(MatchingStrategy::Prealigned)
        } else {
            None
        })
    }

    /// Settings file (or defaults) with the command line applied on top
    fn detector_config(&self) -> anyhow::Result<DetectorConfig> {
        let mut config = match &self.config {
            Some(path) => DetectorConfig::load(path)
                .map_err(|e| anyhow::anyhow!("{}", e))
                .with_context(|| format!("reading settings from {}", path.display()))?,
            None => DetectorConfig::default(),
        };

        if let Some(strategy) = self.strategy()? {
            config.strategy = strategy;
        }
        if self.threads.is_some() {
            config.threads = self.threads;
        }
        config.exact_overlap |= self.exact_overlap;
        if self.stereo {
            config.constraints = ConstraintPolicy::StereoWindow;
        }

        config.cache.enabled |= self.cache;
        config.cache.keyfiles_only |= self.keyfiles_only;
        if self.keypath.is_some() {
            config.cache.keypath = self.keypath.clone();
        }

        let analyzer = &mut config.analyzer;
        if self.fullscale {
            analyzer.downscale = false;
        }
        set(&mut analyzer.sieve1_width, self.sieve1width);
        set(&mut analyzer.sieve1_height, self.sieve1height);
        set(&mut analyzer.sieve1_size, self.sieve1size);
        analyzer.cloud.enabled |= self.celeste;
        set(&mut analyzer.cloud.threshold, self.celestethreshold);
        set(&mut analyzer.cloud.radius, self.celesteradius);
        if self.celestemodel.is_some() {
            analyzer.cloud.model_path = self.celestemodel.clone();
        }

        let matching = &mut config.matching;
        set(&mut matching.second_match_distance, self.kdtreeseconddist);
        set(&mut matching.ransac_iterations, self.ransaciter);
        set(&mut matching.ransac_threshold, self.ransacdist);
        set(&mut matching.ransac_mode, self.ransacmode);
        set(&mut matching.min_matches, self.minmatches);
        set(&mut matching.sieve2_width, self.sieve2width);
        set(&mut matching.sieve2_height, self.sieve2height);
        set(&mut matching.sieve2_size, self.sieve2size);
        set(&mut matching.seed, self.seed);

        config.validate()?;
        Ok(config)
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.detector_config()?;
    let mut project =
        Project::load(&cli.input).with_context(|| format!("loading project {}", cli.input.display()))?;
    let detector = PanoDetector::new(config);

    if cli.clean {
        let removed = detector.clean_keyfiles(&project)?;
        println!("removed {} keyfile(s)", removed);
        return Ok(());
    }

    let report = detector.run(&mut project)?;
    info!(
        "analyzed {} image(s), {} from cache; {} control points from {} of {} pairs ({} failed)",
        report.images_analyzed,
        report.images_from_cache,
        report.control_points_added,
        report.pairs_with_matches,
        report.pairs_tested,
        report.pairs_failed
    );
    if detector.config().cache.keyfiles_only {
        return Ok(());
    }

    match &cli.output {
        Some(path) => project
            .save(path)
            .with_context(|| format!("writing project {}", path.display()))?,
        None => println!("{}", project.to_json()?),
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level())),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("panodetect: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
