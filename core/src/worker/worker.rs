//! A background thread draining the sample bus through a task.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::bus::{AudioBlock, ConsumerHandle, ReadError, SampleBus};

use super::WorkerError;

/// Longest a worker waits on the bus before re-checking its stop flag.
const POLL: Duration = Duration::from_millis(20);
/// Base delay before a crashed task is rebuilt; grows with each respawn.
const RESPAWN_DELAY: Duration = Duration::from_millis(10);
const MAX_RESPAWN_DELAY: Duration = Duration::from_millis(500);

/// Audio stream shape negotiated with the host.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub sample_rate: f64,
    pub block_frames: usize,
    pub channels: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            block_frames: 512,
            channels: 2,
        }
    }
}

/// Work done on every block a worker reads.
pub trait WorkerTask: Send {
    /// Called before the first block and after every configuration change.
    fn prepare(&mut self, config: &StreamConfig);

    fn process(&mut self, block: &AudioBlock);

    /// Called once when the worker leaves the running state normally.
    fn stop(&mut self) {}
}

/// Builds a fresh task, both at start and after a crash.
pub type TaskFactory = Arc<dyn Fn() -> Box<dyn WorkerTask> + Send + Sync>;

/// Lifecycle of a background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Preparing = 1,
    Running = 2,
    Stopping = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Preparing,
            2 => WorkerState::Running,
            3 => WorkerState::Stopping,
            _ => WorkerState::Idle,
        }
    }
}

struct WorkerShared {
    state: AtomicU8,
    stop: AtomicBool,
    respawns: AtomicU64,
    processed: AtomicU64,
}

impl WorkerShared {
    fn set_state(&self, name: &str, state: WorkerState) {
        let previous = WorkerState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            log::debug!("worker {name}: {previous:?} -> {state:?}");
        }
    }

    /// Move `from -> to` only if no one else changed the state meanwhile.
    fn transition(&self, name: &str, from: WorkerState, to: WorkerState) {
        if self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::debug!("worker {name}: {from:?} -> {to:?}");
        }
    }
}

/// Point-in-time counters for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub state: WorkerState,
    pub respawns: u64,
    pub processed: u64,
}

/// One non-real-time thread that reads the bus at its own pace.
pub struct BackgroundWorker {
    name: String,
    factory: TaskFactory,
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn new(name: impl Into<String>, factory: TaskFactory) -> Self {
        Self {
            name: name.into(),
            factory,
            shared: Arc::new(WorkerShared {
                state: AtomicU8::new(WorkerState::Idle as u8),
                stop: AtomicBool::new(false),
                respawns: AtomicU64::new(0),
                processed: AtomicU64::new(0),
            }),
            thread: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            state: self.state(),
            respawns: self.shared.respawns.load(Ordering::Relaxed),
            processed: self.shared.processed.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Register on the bus and spawn the worker thread.
    ///
    /// Does nothing if the worker is already running.
    pub fn start(&mut self, bus: &SampleBus, config: Arc<StreamConfig>) -> Result<(), WorkerError> {
        if self.thread.is_some() {
            return Ok(());
        }

        self.shared.stop.store(false, Ordering::Release);
        self.shared.set_state(&self.name, WorkerState::Preparing);

        let consumer = bus.register_consumer();
        let name = self.name.clone();
        let factory = self.factory.clone();
        let shared = self.shared.clone();

        let thread = thread::Builder::new()
            .name(format!("worker-{}", self.name))
            .spawn(move || run(&name, &factory, &shared, consumer, &config))
            .map_err(|source| WorkerError::Spawn {
                name: self.name.clone(),
                source,
            })?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Ask the thread to finish, wait for it, and return to idle.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.set_state(&self.name, WorkerState::Stopping);
        self.shared.stop.store(true, Ordering::Release);
        if thread.join().is_err() {
            log::error!("worker {} thread terminated abnormally", self.name);
        }
        self.shared.set_state(&self.name, WorkerState::Idle);
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    name: &str,
    factory: &TaskFactory,
    shared: &WorkerShared,
    mut consumer: ConsumerHandle,
    config: &StreamConfig,
) {
    loop {
        // Building the task is guarded too: a factory that panics is retried
        // like a task that panics.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut task = factory();
            task.prepare(config);
            shared.transition(name, WorkerState::Preparing, WorkerState::Running);
            drain(&mut *task, &mut consumer, shared);
            task.stop();
        }));

        match outcome {
            Ok(()) => return,
            Err(payload) => {
                consumer.mark_consumed();
                let respawns = shared.respawns.fetch_add(1, Ordering::Relaxed) + 1;
                log::error!(
                    "worker {name} crashed: {}; restarting (respawn #{respawns})",
                    panic_message(payload.as_ref())
                );
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                let delay = (RESPAWN_DELAY * respawns.min(50) as u32).min(MAX_RESPAWN_DELAY);
                thread::sleep(delay);
                shared.transition(name, WorkerState::Running, WorkerState::Preparing);
            }
        }
    }
}

fn drain(task: &mut dyn WorkerTask, consumer: &mut ConsumerHandle, shared: &WorkerShared) {
    while !shared.stop.load(Ordering::Acquire) {
        match consumer.read(POLL) {
            Ok(block) => {
                task.process(block);
                shared.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(ReadError::TimedOut) => {}
            Err(ReadError::Closed) => break,
        }
        consumer.mark_consumed();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
