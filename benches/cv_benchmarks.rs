// benches/cv_benchmarks.rs
use artrack_rs::cv::labeling::{label_components, Connectivity};
use artrack_rs::cv::scalar::ScalarCV;
use artrack_rs::cv::ComputerVision;
use artrack_rs::nft::cluster::{match_features, FeatureIndex, IndexParams, MatchParams};
use artrack_rs::nft::features::{extract, FeatureParams};
use artrack_rs::{
    CameraParams, ImageBuffer, PatternDetectionMode, PixelFormat, Point2f, Tracker, TrackerConfig,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SIZES: [(usize, usize); 3] = [(320, 240), (640, 480), (1280, 720)];

/// Dark rectangles scattered over a light background.
fn textured(width: usize, height: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = vec![230u8; width * height];
    for _ in 0..(width * height / 400) {
        let (bw, bh) = (rng.gen_range(4..16), rng.gen_range(4..16));
        let (x0, y0) = (rng.gen_range(0..width - bw), rng.gen_range(0..height - bh));
        let v: u8 = rng.gen_range(0..160);
        for y in y0..y0 + bh {
            img[y * width + x0..y * width + x0 + bw].fill(v);
        }
    }
    img
}

fn bench_luma(c: &mut Criterion) {
    let mut group = c.benchmark_group("Luma");
    for &(width, height) in SIZES.iter() {
        let num_pixels = width * height;
        let rgba: Vec<u8> = (0..(num_pixels * 4)).map(|i| (i % 256) as u8).collect();
        let rgb: Vec<u8> = (0..(num_pixels * 3)).map(|i| (i % 256) as u8).collect();
        let mut out = vec![0u8; num_pixels];
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("rgba", &size_str), &size_str, |b, _| {
            b.iter(|| ScalarCV::luma(black_box(&rgba), PixelFormat::Rgba, black_box(&mut out)))
        });
        group.bench_with_input(BenchmarkId::new("rgb", &size_str), &size_str, |b, _| {
            b.iter(|| ScalarCV::luma(black_box(&rgb), PixelFormat::Rgb, black_box(&mut out)))
        });
    }
    group.finish();
}

fn bench_threshold(c: &mut Criterion) {
    let mut group = c.benchmark_group("Threshold");
    for &(width, height) in SIZES.iter() {
        let size = width * height;
        let data: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        let mut out = vec![0u8; size];
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("global", &size_str), &size_str, |b, _| {
            b.iter(|| ScalarCV::threshold(black_box(&data), black_box(&mut out), black_box(128)))
        });
        group.bench_with_input(BenchmarkId::new("otsu", &size_str), &size_str, |b, _| {
            b.iter(|| ScalarCV::otsu(black_box(&data)))
        });
        group.bench_with_input(BenchmarkId::new("median", &size_str), &size_str, |b, _| {
            b.iter(|| ScalarCV::median(black_box(&data)))
        });
    }
    group.finish();
}

fn bench_adaptive_threshold(c: &mut Criterion) {
    let mut group = c.benchmark_group("AdaptiveThreshold");
    for &(width, height) in SIZES.iter() {
        let num_pixels = width * height;
        let data: Vec<u8> = (0..num_pixels).map(|i| (i % 256) as u8).collect();
        let buffer = ImageBuffer {
            data: &data,
            width: width as u32,
            height: height as u32,
        };
        let mut out = vec![0u8; num_pixels];
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("box_blur", &size_str), &size_str, |b, _| {
            b.iter(|| ScalarCV::stack_box_blur(black_box(&buffer), black_box(&mut out), black_box(3)))
        });
        group.bench_with_input(BenchmarkId::new("adaptive", &size_str), &size_str, |b, _| {
            b.iter(|| {
                ScalarCV::adaptive_threshold(
                    black_box(&buffer),
                    black_box(&mut out),
                    black_box(3),
                    black_box(7),
                    false,
                )
            })
        });
    }
    group.finish();
}

fn bench_labeling(c: &mut Criterion) {
    let mut group = c.benchmark_group("Labeling");
    for &(width, height) in SIZES.iter() {
        // 10x10 blobs on a grid so there are many components.
        let mut data = vec![0u8; width * height];
        for y in 0..height {
            for x in 0..width {
                if (x / 10) % 2 == 0 && (y / 10) % 2 == 0 {
                    data[y * width + x] = 255;
                }
            }
        }
        let size_str = format!("{}x{}", width, height);

        for (name, connectivity) in [("four", Connectivity::Four), ("eight", Connectivity::Eight)] {
            group.bench_with_input(BenchmarkId::new(name, &size_str), &size_str, |b, _| {
                b.iter(|| {
                    label_components(
                        black_box(&data),
                        width as u32,
                        height as u32,
                        connectivity,
                        black_box(65_535),
                    )
                })
            });
        }
    }
    group.finish();
}

fn bench_warp(c: &mut Criterion) {
    let mut group = c.benchmark_group("PatternWarp");
    for &(width, height) in SIZES.iter() {
        let data: Vec<u8> = (0..width * height).map(|i| (i % 256) as u8).collect();
        let buffer = ImageBuffer {
            data: &data,
            width: width as u32,
            height: height as u32,
        };
        let (w, h) = (width as f32, height as f32);
        let quad = [
            Point2f::new(w * 0.25, h * 0.25),
            Point2f::new(w * 0.75, h * 0.25),
            Point2f::new(w * 0.75, h * 0.75),
            Point2f::new(w * 0.25, h * 0.75),
        ];
        let mut out = vec![0u8; 16 * 16];
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("scalar", &size_str), &size_str, |b, _| {
            b.iter(|| ScalarCV::warp(black_box(&buffer), black_box(&mut out), black_box(&quad), 16))
        });
    }
    group.finish();
}

fn bench_features(c: &mut Criterion) {
    let mut group = c.benchmark_group("NftFeatures");
    group.sample_size(20);
    let params = FeatureParams::default();
    for &(width, height) in SIZES.iter().take(2) {
        let img = textured(width, height, 11);
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("extract", &size_str), &size_str, |b, _| {
            b.iter(|| extract(black_box(&img), width as u32, height as u32, &params))
        });
    }

    let (width, height) = (640, 480);
    let reference = extract(&textured(width, height, 11), width as u32, height as u32, &params)
        .expect("reference features");
    let query = extract(&textured(width, height, 12), width as u32, height as u32, &params)
        .expect("query features");
    let index = FeatureIndex::build(reference.descriptors.clone(), &IndexParams::default());
    let match_params = MatchParams::default();

    group.bench_function("index_build", |b| {
        b.iter(|| FeatureIndex::build(black_box(reference.descriptors.clone()), &IndexParams::default()))
    });
    group.bench_function("match", |b| {
        b.iter(|| match_features(black_box(&query.descriptors), &index, &match_params))
    });
    group.finish();
}

fn bench_tracker_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("TrackerFrame");
    for &(width, height) in SIZES.iter() {
        let mut config = TrackerConfig::default();
        config.square.detector.pattern_detection_mode = PatternDetectionMode::Matrix;
        let fx = width as f64;
        let camera = CameraParams::from_intrinsics(
            width as u32,
            height as u32,
            fx,
            fx,
            width as f64 / 2.0,
            height as f64 / 2.0,
        );
        let mut tracker = Tracker::new(width as u32, height as u32, camera, config).expect("tracker");

        // One black square in the middle of a white frame.
        let mut data = vec![255u8; width * height * 4];
        let (x0, y0) = (width / 2 - 40, height / 2 - 40);
        for y in y0..y0 + 80 {
            for x in x0..x0 + 80 {
                let idx = (y * width + x) * 4;
                data[idx..idx + 3].fill(0);
            }
        }
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("square", &size_str), &size_str, |b, _| {
            b.iter(|| tracker.process(black_box(&data)))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_luma,
    bench_threshold,
    bench_adaptive_threshold,
    bench_labeling,
    bench_warp,
    bench_features,
    bench_tracker_frame
);
criterion_main!(benches);
