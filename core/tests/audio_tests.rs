//! Integration tests for the audio path: bus, decoding and workers.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::bounded;

use phosphor_scope::audio::synth::{generate_lissajous, generate_stereo_sine, write_wav};
use phosphor_scope::audio::{load_audio, BusShape, ReadError, SampleBus};
use phosphor_scope::worker::{BeamShaper, StreamConfig, TaskFactory, WorkerManager, WorkerTask};

const SAMPLE_RATE: u32 = 44100;

/// Read every block until the bus closes, returning the sequence ids seen.
fn drain(mut consumer: phosphor_scope::audio::ConsumerHandle, delay: Duration) -> Vec<u64> {
    let mut seen = Vec::new();
    loop {
        match consumer.read(Duration::from_millis(500)) {
            Ok(block) => seen.push(block.sequence()),
            Err(ReadError::TimedOut) => continue,
            Err(ReadError::Closed) => break,
        }
        consumer.mark_consumed();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
    seen
}

#[test]
fn test_consumers_see_blocks_in_publish_order() {
    let shape = BusShape::new(2, 64).with_queue_depth(4);
    let (bus, mut publisher) = SampleBus::new(shape);

    let fast = bus.register_consumer_with_depth(1024);
    let slow = bus.register_consumer();
    let fast = thread::spawn(move || drain(fast, Duration::ZERO));
    let slow = thread::spawn(move || drain(slow, Duration::from_micros(300)));

    for i in 0..500 {
        publisher.publish(&vec![i as f32; shape.block_len()]);
        if i % 50 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    // Let the readers empty their queues before closing.
    thread::sleep(Duration::from_millis(200));
    bus.close();

    let fast = fast.join().unwrap();
    let slow = slow.join().unwrap();

    assert_eq!(fast, (0..500).collect::<Vec<u64>>());
    assert!(slow.windows(2).all(|w| w[0] < w[1]), "slow consumer out of order");
    assert_eq!(slow.last(), Some(&499));
}

#[test]
fn test_unregistering_one_consumer_leaves_others_intact() {
    let shape = BusShape::new(1, 32).with_queue_depth(64);
    let (bus, mut publisher) = SampleBus::new(shape);

    let mut stays = bus.register_consumer();
    let leaves = bus.register_consumer();

    for _ in 0..10 {
        publisher.publish(&vec![0.5; shape.block_len()]);
    }
    bus.unregister_consumer(leaves);
    let late = bus.register_consumer();
    for _ in 0..10 {
        publisher.publish(&vec![0.5; shape.block_len()]);
    }

    let mut seen = Vec::new();
    while let Some(block) = stays.try_read() {
        seen.push(block.sequence());
    }
    assert_eq!(seen, (0..20).collect::<Vec<u64>>());
    assert_eq!(stays.dropped(), 0);
    assert_eq!(late.pending(), 10);
    assert_eq!(bus.stats().consumers, 2);
}

#[test]
fn test_publish_never_waits_for_a_stalled_consumer() {
    let shape = BusShape::new(2, 128).with_queue_depth(2);
    let (bus, mut publisher) = SampleBus::new(shape);
    let stalled = bus.register_consumer();

    let block = vec![0.1; shape.block_len()];
    let start = std::time::Instant::now();
    for _ in 0..10_000 {
        publisher.publish(&block);
    }
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(stalled.pending(), 2);
    assert_eq!(stalled.dropped(), 9_998);
    assert_eq!(bus.stats().published, 10_000);
}

#[test]
fn test_wav_round_trip_through_loader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("circle.wav");
    let audio = generate_lissajous(220.0, 220.0, SAMPLE_RATE, 0.5, 0.9);
    write_wav(&path, &audio).unwrap();

    let loaded = load_audio(&path).unwrap();
    assert_eq!(loaded.sample_rate, SAMPLE_RATE);
    assert_eq!(loaded.channels, 2);
    assert_eq!(loaded.num_frames(), audio.num_frames());
    assert!((loaded.duration() - 0.5).abs() < 1e-3);
    for (a, b) in loaded.samples.iter().zip(&audio.samples).take(1000) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn test_chunks_cover_audio_with_padded_tail() {
    let audio = generate_stereo_sine(1000.0, SAMPLE_RATE, 0.1, 0.5);
    let mut chunks = audio.chunks(1000);
    assert_eq!(chunks.total(), audio.num_frames().div_ceil(1000));

    let mut count = 0;
    let mut last_len = 0;
    while let Some(chunk) = chunks.next_chunk() {
        count += 1;
        last_len = chunk.len();
    }
    assert_eq!(count, chunks.total());
    assert_eq!(last_len, 2000);
}

#[test]
fn test_workers_turn_bus_audio_into_frames() {
    let shape = BusShape::new(2, 480).with_queue_depth(32);
    let (bus, mut publisher) = SampleBus::new(shape);
    let config = StreamConfig {
        sample_rate: 48_000.0,
        block_frames: 480,
        channels: 2,
    };
    let manager = WorkerManager::new(bus.clone(), config);

    let (frames_tx, frames_rx) = bounded(64);
    let factory: TaskFactory = Arc::new(move || {
        Box::new(BeamShaper::new(frames_tx.clone(), 100.0, 96_000.0)) as Box<dyn WorkerTask>
    });
    manager.add_worker("shaper", factory).unwrap();
    manager.start().unwrap();
    // Let the worker reach its read loop.
    thread::sleep(Duration::from_millis(100));

    let audio = generate_lissajous(100.0, 100.0, 48_000, 0.1, 0.5);
    publisher.write(&audio.samples);

    // 4800 frames at 480 per video frame.
    let mut frames = Vec::new();
    while frames.len() < 10 {
        match frames_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(frame) => frames.push(frame),
            Err(_) => break,
        }
    }
    manager.stop();

    assert_eq!(frames.len(), 10);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.sequence, i as u64);
        assert_eq!(frame.point_rate, 96_000.0);
        assert!(frame
            .points
            .iter()
            .all(|p| p.x.abs() <= 0.6 && p.y.abs() <= 0.6));
    }
    // After the first frame, each one holds 10 ms of points.
    assert!((frames[5].points.len() as i64 - 960).abs() <= 2);
}
