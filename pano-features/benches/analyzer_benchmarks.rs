use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{GrayImage, Luma};
use pano_core::{ImageInfo, Plane};
use pano_features::detector::ExtremaDetector;
use pano_features::pyramid::ScaleSpace;
use pano_features::{AnalyzerConfig, ImageAnalyzer, StereographicRemap};

/// Periodic blob texture, dense enough to give every sieve cell candidates
fn create_benchmark_image(width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let fx = x as f32;
        let fy = y as f32;
        let v = 110.0
            + 50.0 * (fx * 0.11).sin() * (fy * 0.07).cos()
            + 40.0 * ((fx * 0.031 + fy * 0.017).sin() * 3.0).tanh();
        Luma([v.clamp(0.0, 255.0) as u8])
    })
}

fn to_plane(img: &GrayImage) -> Plane {
    Plane::new(
        img.width() as usize,
        img.height() as usize,
        img.as_raw().iter().map(|&p| p as f32 / 255.0).collect(),
    )
}

fn bench_full_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_analysis");
    group.sample_size(10);

    for &(width, height) in &[(640u32, 480u32), (1280, 960)] {
        let img = create_benchmark_image(width, height);
        let info = ImageInfo::new(0, "bench.png", width, height, 50.0);
        let analyzer = ImageAnalyzer::new(AnalyzerConfig::default()).expect("valid config");
        group.bench_with_input(
            BenchmarkId::new("analyze_image", format!("{}x{}", width, height)),
            &img,
            |b, img| b.iter(|| analyzer.analyze_image(black_box(&info), black_box(img))),
        );
    }
    group.finish();
}

fn bench_pipeline_stages(c: &mut Criterion) {
    let img = create_benchmark_image(640, 480);
    let plane = to_plane(&img);
    let config = AnalyzerConfig::default();
    let mut group = c.benchmark_group("pipeline_stages");
    group.sample_size(10);

    group.bench_function("build_scale_space", |b| {
        b.iter(|| ScaleSpace::build(black_box(&plane), config.max_octaves, config.scales_per_octave, config.base_sigma))
    });

    let space = ScaleSpace::build(&plane, config.max_octaves, config.scales_per_octave, config.base_sigma)
        .expect("scale space");
    let detector = ExtremaDetector::new(&config);
    group.bench_function("detect_extrema", |b| b.iter(|| detector.detect(black_box(&space))));

    let remap = StereographicRemap::new(ImageInfo::new(0, "wide.png", 640, 480, 110.0).camera())
        .expect("remap for a wide image");
    group.bench_function("stereographic_remap", |b| b.iter(|| remap.apply(black_box(&plane))));
    group.finish();
}

criterion_group!(benches, bench_full_analysis, bench_pipeline_stages);
criterion_main!(benches);
