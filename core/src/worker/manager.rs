//! Owns every background worker and keeps them on one stream configuration.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;

use crate::audio::bus::SampleBus;

use super::worker::{BackgroundWorker, StreamConfig, TaskFactory, WorkerStats};
use super::WorkerError;

/// Identifies a worker within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

struct Workers {
    entries: Vec<(WorkerId, BackgroundWorker)>,
    next_id: u64,
    running: bool,
}

/// Coordinates background workers reading one sample bus.
///
/// All workers always run against the same `Arc<StreamConfig>`: a
/// configuration change stops every worker, swaps the config, then starts
/// them again, so no worker ever mixes old and new settings.
pub struct WorkerManager {
    bus: SampleBus,
    config: ArcSwap<StreamConfig>,
    workers: Mutex<Workers>,
}

impl WorkerManager {
    pub fn new(bus: SampleBus, config: StreamConfig) -> Self {
        Self {
            bus,
            config: ArcSwap::from_pointee(config),
            workers: Mutex::new(Workers {
                entries: Vec::new(),
                next_id: 0,
                running: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> Arc<StreamConfig> {
        self.config.load_full()
    }

    /// Add a worker. It starts immediately if the manager is running.
    pub fn add_worker(
        &self,
        name: impl Into<String>,
        factory: TaskFactory,
    ) -> Result<WorkerId, WorkerError> {
        let mut workers = self.lock();
        let id = WorkerId(workers.next_id);
        workers.next_id += 1;

        let mut worker = BackgroundWorker::new(name, factory);
        if workers.running {
            worker.start(&self.bus, self.config.load_full())?;
        }
        log::info!("added worker {}", worker.name());
        workers.entries.push((id, worker));
        Ok(id)
    }

    /// Stop and remove a worker. Returns false if the id is unknown.
    pub fn remove_worker(&self, id: WorkerId) -> bool {
        let mut workers = self.lock();
        let Some(index) = workers.entries.iter().position(|(wid, _)| *wid == id) else {
            return false;
        };
        let (_, mut worker) = workers.entries.remove(index);
        worker.stop();
        log::info!("removed worker {}", worker.name());
        true
    }

    /// Start every worker with the current configuration.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut workers = self.lock();
        workers.running = true;
        let config = self.config.load_full();
        for (_, worker) in workers.entries.iter_mut() {
            worker.start(&self.bus, config.clone())?;
        }
        Ok(())
    }

    /// Stop every worker; they can be started again later.
    pub fn stop(&self) {
        let mut workers = self.lock();
        workers.running = false;
        for (_, worker) in workers.entries.iter_mut() {
            worker.stop();
        }
    }

    /// Apply a new host sample rate and block size to every worker.
    pub fn prepare(&self, sample_rate: f64, block_frames: usize) -> Result<(), WorkerError> {
        let mut workers = self.lock();
        let current = self.config.load_full();
        let next = StreamConfig {
            sample_rate,
            block_frames,
            channels: current.channels,
        };
        if *current == next {
            return Ok(());
        }

        log::info!(
            "re-preparing {} workers: {} Hz / {} frames",
            workers.entries.len(),
            sample_rate,
            block_frames
        );

        for (_, worker) in workers.entries.iter_mut() {
            worker.stop();
        }
        let config = Arc::new(next);
        self.config.store(config.clone());

        if workers.running {
            for (_, worker) in workers.entries.iter_mut() {
                worker.start(&self.bus, config.clone())?;
            }
        }
        Ok(())
    }

    pub fn stats(&self, id: WorkerId) -> Option<WorkerStats> {
        self.lock()
            .entries
            .iter()
            .find(|(wid, _)| *wid == id)
            .map(|(_, worker)| worker.stats())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::bus::{AudioBlock, BusShape};
    use crate::worker::{WorkerState, WorkerTask};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    /// Records the rate it was prepared with and counts prepares in
    /// thousands; panics on a block whose first sample is negative.
    struct Fragile {
        prepared_rate: Arc<AtomicU64>,
        processed: Arc<AtomicU64>,
    }

    impl WorkerTask for Fragile {
        fn prepare(&mut self, config: &StreamConfig) {
            self.prepared_rate
                .store(config.sample_rate as u64, Ordering::Release);
            self.processed.fetch_add(1_000, Ordering::Relaxed);
        }

        fn process(&mut self, block: &AudioBlock) {
            if block.samples()[0] < 0.0 {
                panic!("poisoned block");
            }
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn fragile_factory(rate: &Arc<AtomicU64>, processed: &Arc<AtomicU64>) -> TaskFactory {
        let rate = rate.clone();
        let processed = processed.clone();
        Arc::new(move || {
            Box::new(Fragile {
                prepared_rate: rate.clone(),
                processed: processed.clone(),
            })
        })
    }

    #[test]
    fn test_prepare_reconfigures_every_worker() {
        let (bus, _publisher) = SampleBus::new(BusShape::new(2, 64));
        let manager = WorkerManager::new(bus, StreamConfig::default());

        let rates: Vec<_> = (0..3).map(|_| Arc::new(AtomicU64::new(0))).collect();
        let processed = Arc::new(AtomicU64::new(0));
        let ids: Vec<_> = rates
            .iter()
            .enumerate()
            .map(|(i, rate)| {
                manager
                    .add_worker(format!("w{i}"), fragile_factory(rate, &processed))
                    .unwrap()
            })
            .collect();

        manager.start().unwrap();
        assert!(wait_for(|| rates
            .iter()
            .all(|r| r.load(Ordering::Acquire) == 48_000)));

        manager.prepare(96_000.0, 256).unwrap();
        assert_eq!(manager.config().sample_rate, 96_000.0);
        assert!(wait_for(|| rates
            .iter()
            .all(|r| r.load(Ordering::Acquire) == 96_000)));

        for id in ids {
            assert!(wait_for(|| manager.stats(id).unwrap().state == WorkerState::Running));
        }
    }

    #[test]
    fn test_crashed_worker_is_respawned_with_last_config() {
        let shape = BusShape::new(1, 16).with_queue_depth(32);
        let (bus, mut publisher) = SampleBus::new(shape);
        let manager = WorkerManager::new(bus, StreamConfig::default());

        let rate = Arc::new(AtomicU64::new(0));
        let processed = Arc::new(AtomicU64::new(0));
        let id = manager
            .add_worker("fragile", fragile_factory(&rate, &processed))
            .unwrap();
        manager.start().unwrap();
        manager.prepare(44_100.0, 16).unwrap();
        assert!(wait_for(|| manager.stats(id).unwrap().state == WorkerState::Running));

        // One prepare per start: initial start, then the re-prepare.
        assert_eq!(processed.load(Ordering::Relaxed), 2_000);

        publisher.publish(&[-1.0; 16]);
        assert!(wait_for(|| manager.stats(id).unwrap().respawns == 1));

        // The rebuilt task is prepared again with the last configuration.
        assert!(wait_for(|| processed.load(Ordering::Relaxed) == 3_000));
        assert_eq!(rate.load(Ordering::Acquire), 44_100);

        publisher.publish(&[1.0; 16]);
        assert!(wait_for(|| processed.load(Ordering::Relaxed) == 3_001));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_worker() {
        let (bus, _publisher) = SampleBus::new(BusShape::new(2, 64));
        let manager = WorkerManager::new(bus.clone(), StreamConfig::default());
        let rate = Arc::new(AtomicU64::new(0));
        let processed = Arc::new(AtomicU64::new(0));
        let id = manager
            .add_worker("w", fragile_factory(&rate, &processed))
            .unwrap();
        manager.start().unwrap();
        assert_eq!(bus.stats().consumers, 1);

        assert!(manager.remove_worker(id));
        assert!(!manager.remove_worker(id));
        assert!(manager.is_empty());
        assert_eq!(bus.stats().consumers, 0);
    }
}
