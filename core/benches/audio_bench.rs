//! Benchmarks for the audio path: bus distribution, resampling and shaping.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use phosphor_scope::audio::synth::{generate_lissajous, generate_sine, generate_white_noise};
use phosphor_scope::audio::{BusShape, LanczosResampler, PointShaper, SampleBus};

const SAMPLE_RATE: u32 = 48000;

fn bench_bus_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("Sample Bus");

    for consumers in [0, 1, 4, 8] {
        let shape = BusShape::new(2, 256).with_queue_depth(16);
        let (bus, mut publisher) = SampleBus::new(shape);
        // Never read: every publish past the queue depth evicts.
        let _handles: Vec<_> = (0..consumers).map(|_| bus.register_consumer()).collect();
        let block = vec![0.25; shape.block_len()];

        group.throughput(Throughput::Elements(shape.frames as u64));
        group.bench_with_input(
            BenchmarkId::new("publish", consumers),
            &consumers,
            |b, _| {
                b.iter(|| {
                    black_box(publisher.publish(&block));
                });
            },
        );
    }

    group.finish();
}

fn bench_resampler(c: &mut Criterion) {
    let mut group = c.benchmark_group("Lanczos Resampler");

    let input = generate_sine(440.0, SAMPLE_RATE, 1.0, 0.8);
    for out_rate in [96_000.0, 192_000.0] {
        group.throughput(Throughput::Elements(input.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("1s_mono", out_rate as u32),
            &out_rate,
            |b, &rate| {
                let mut resampler = LanczosResampler::new(SAMPLE_RATE as f64, rate);
                let mut out = Vec::with_capacity(input.len() * 4 + 64);
                b.iter(|| {
                    out.clear();
                    resampler.process(black_box(&input), &mut out);
                    black_box(out.len());
                });
            },
        );
    }

    group.finish();
}

fn bench_point_shaping(c: &mut Criterion) {
    let mut group = c.benchmark_group("Point Shaping");

    let audio = generate_lissajous(200.0, 300.0, SAMPLE_RATE, 1.0 / 60.0, 0.8);
    group.throughput(Throughput::Elements(audio.num_frames() as u64));
    group.bench_function("stereo_frame_192k", |b| {
        let mut shaper = PointShaper::new(2, SAMPLE_RATE as f64, 192_000.0);
        let mut points = Vec::new();
        b.iter(|| {
            points.clear();
            shaper.shape_into(black_box(&audio.samples), &mut points);
            black_box(points.len());
        });
    });

    group.finish();
}

fn bench_synth_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Audio Synthesis");

    group.bench_function("lissajous_1s", |b| {
        b.iter(|| {
            black_box(generate_lissajous(200.0, 300.0, SAMPLE_RATE, 1.0, 0.8));
        });
    });

    group.bench_function("white_noise_1s", |b| {
        b.iter(|| {
            black_box(generate_white_noise(SAMPLE_RATE, 1.0, 1.0, 42));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_bus_publish,
    bench_resampler,
    bench_point_shaping,
    bench_synth_generation,
);
criterion_main!(benches);
