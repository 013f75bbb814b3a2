//! Single-writer, multi-reader distribution of fixed-size audio blocks.
//!
//! The real-time audio callback owns the [`BlockPublisher`]; any number of
//! background threads each own a [`ConsumerHandle`]. Every consumer has a
//! private bounded queue, so a slow reader only ever loses its own history:
//! when its queue is full, publishing evicts that reader's oldest block.
//!
//! Publishing never blocks, never wakes a reader and, once the block pool is
//! warm, never allocates or frees. Readers poll their queue in short park
//! slices instead. Blocks are reference counted; a block returns to the pool
//! when the last reader that received it calls
//! [`ConsumerHandle::mark_consumed`] (or reads the next block).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::sync::{Parker, Unparker};
use crossbeam::utils::Backoff;
use crossbeam_queue::ArrayQueue;

/// Upper bound on a single park. Bounds the latency between a publish and
/// the reader noticing it, since the publisher never unparks readers.
pub const PARK_SLICE: Duration = Duration::from_millis(1);

/// Fixed geometry of every block moving through a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusShape {
    /// Interleaved channels per frame.
    pub channels: usize,
    /// Frames (samples per channel) per block.
    pub frames: usize,
    /// Default per-consumer queue depth, in blocks.
    pub queue_depth: usize,
}

impl BusShape {
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels: channels.max(1),
            frames: frames.max(1),
            queue_depth: 8,
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Number of interleaved samples in one block.
    pub fn block_len(&self) -> usize {
        self.channels * self.frames
    }
}

/// One published block of interleaved samples.
///
/// Immutable once published: the publisher only writes into blocks that no
/// reader holds.
#[derive(Debug)]
pub struct AudioBlock {
    sequence: u64,
    channels: usize,
    samples: Vec<f32>,
}

impl AudioBlock {
    fn empty(shape: &BusShape) -> Self {
        Self {
            sequence: 0,
            channels: shape.channels,
            samples: vec![0.0; shape.block_len()],
        }
    }

    /// Monotonic sequence id assigned at publish time.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    /// Interleaved samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Iterate over frames, each a slice of `channels` samples.
    pub fn frames_iter(&self) -> impl Iterator<Item = &[f32]> {
        self.samples.chunks_exact(self.channels)
    }
}

/// Why a read returned without a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("no block arrived before the timeout")]
    TimedOut,
    #[error("consumer is unregistered or the bus is closed")]
    Closed,
}

struct ConsumerSlot {
    id: u64,
    queue: ArrayQueue<Arc<AudioBlock>>,
    unparker: Unparker,
    dropped: AtomicU64,
    detached: AtomicBool,
}

struct BusShared {
    shape: BusShape,
    consumers: ArcSwap<Vec<Arc<ConsumerSlot>>>,
    next_consumer_id: AtomicU64,
    closed: AtomicBool,
    published: AtomicU64,
    allocations: AtomicU64,
}

impl BusShared {
    fn detach(&self, id: u64) {
        self.consumers.rcu(|current| {
            current
                .iter()
                .filter(|slot| slot.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }
}

/// Counters describing bus activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    /// Blocks allocated after the pool and its spares were exhausted.
    pub allocations: u64,
    pub consumers: usize,
}

/// Registry side of the bus. Cheap to clone and share with background threads.
#[derive(Clone)]
pub struct SampleBus {
    shared: Arc<BusShared>,
}

impl SampleBus {
    /// Create a bus and its single publisher.
    pub fn new(shape: BusShape) -> (Self, BlockPublisher) {
        let shared = Arc::new(BusShared {
            shape,
            consumers: ArcSwap::from_pointee(Vec::new()),
            next_consumer_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        });

        // Enough blocks for every queue slot of a handful of consumers plus
        // the one being written.
        let pool_size = shape.queue_depth * 4 + 2;
        let pool = (0..pool_size)
            .map(|_| Arc::new(AudioBlock::empty(&shape)))
            .collect();

        let publisher = BlockPublisher {
            shared: shared.clone(),
            pool,
            spare: Vec::with_capacity(pool_size),
            next_slot: 0,
            sequence: 0,
            staging: vec![0.0; shape.block_len()],
            staged: 0,
        };

        (Self { shared }, publisher)
    }

    pub fn shape(&self) -> BusShape {
        self.shared.shape
    }

    /// Register a reader using the bus's default queue depth.
    pub fn register_consumer(&self) -> ConsumerHandle {
        self.register_consumer_with_depth(self.shared.shape.queue_depth)
    }

    /// Register a reader with its own lag tolerance.
    pub fn register_consumer_with_depth(&self, depth: usize) -> ConsumerHandle {
        let parker = Parker::new();
        let slot = Arc::new(ConsumerSlot {
            id: self.shared.next_consumer_id.fetch_add(1, Ordering::Relaxed),
            queue: ArrayQueue::new(depth.max(1)),
            unparker: parker.unparker().clone(),
            dropped: AtomicU64::new(0),
            detached: AtomicBool::new(false),
        });

        self.shared.consumers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(slot.clone());
            next
        });
        log::debug!("sample bus: registered consumer {}", slot.id);

        ConsumerHandle {
            shared: self.shared.clone(),
            slot,
            parker,
            current: None,
        }
    }

    /// Remove a reader. Equivalent to dropping the handle.
    pub fn unregister_consumer(&self, handle: ConsumerHandle) {
        drop(handle);
    }

    /// Close the bus: every blocked reader wakes and sees [`ReadError::Closed`]
    /// once its queue is drained.
    ///
    /// Called from control threads only; the publisher never unparks.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        for slot in self.shared.consumers.load().iter() {
            slot.unparker.unpark();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.shared.published.load(Ordering::Relaxed),
            allocations: self.shared.allocations.load(Ordering::Relaxed),
            consumers: self.shared.consumers.load().len(),
        }
    }
}

/// The single writer. Owned by the real-time audio path.
pub struct BlockPublisher {
    shared: Arc<BusShared>,
    pool: Vec<Arc<AudioBlock>>,
    /// Blocks that left the pool and came back through eviction. Capacity is
    /// reserved up front so parking one here never allocates.
    spare: Vec<Arc<AudioBlock>>,
    next_slot: usize,
    sequence: u64,
    staging: Vec<f32>,
    staged: usize,
}

impl BlockPublisher {
    pub fn shape(&self) -> BusShape {
        self.shared.shape
    }

    /// Publish exactly one block of interleaved samples.
    ///
    /// Shorter input is zero-padded and longer input truncated to the bus's
    /// block length. Returns the sequence id given to the block.
    pub fn publish(&mut self, interleaved: &[f32]) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;

        let index = self.writable_slot();
        if let Some(data) = Arc::get_mut(&mut self.pool[index]) {
            let n = interleaved.len().min(data.samples.len());
            data.samples[..n].copy_from_slice(&interleaved[..n]);
            data.samples[n..].fill(0.0);
            data.sequence = sequence;
        }

        let block = self.pool[index].clone();
        self.distribute(&block);
        self.next_slot = (index + 1) % self.pool.len();
        sequence
    }

    /// Accumulate an arbitrary number of interleaved samples, publishing a
    /// block every time one fills up. Host callbacks rarely match the bus's
    /// block size, so this is the usual entry point from an audio callback.
    pub fn write(&mut self, interleaved: &[f32]) {
        let mut rest = interleaved;
        while !rest.is_empty() {
            let room = self.staging.len() - self.staged;
            let n = room.min(rest.len());
            self.staging[self.staged..self.staged + n].copy_from_slice(&rest[..n]);
            self.staged += n;
            rest = &rest[n..];

            if self.staged == self.staging.len() {
                let staging = std::mem::take(&mut self.staging);
                self.publish(&staging);
                self.staging = staging;
                self.staged = 0;
            }
        }
    }

    /// Index of a pooled block no reader holds. When every pooled block is
    /// still in flight, the next slot takes a spare block (or, failing that, a
    /// fresh allocation) and its old block is left to whichever readers still
    /// hold it. The old block is never the last reference, so replacing it
    /// frees nothing here.
    fn writable_slot(&mut self) -> usize {
        let len = self.pool.len();
        for offset in 0..len {
            let index = (self.next_slot + offset) % len;
            if Arc::strong_count(&self.pool[index]) == 1 {
                return index;
            }
        }

        let replacement = match self.spare.pop() {
            Some(block) => block,
            None => {
                self.shared.allocations.fetch_add(1, Ordering::Relaxed);
                Arc::new(AudioBlock::empty(&self.shared.shape))
            }
        };
        self.pool[self.next_slot] = replacement;
        self.next_slot
    }

    /// Queue `block` for every live consumer. Only touches atomics and
    /// lock-free queues.
    fn distribute(&mut self, block: &Arc<AudioBlock>) {
        let consumers = self.shared.consumers.load();
        for slot in consumers.iter() {
            if slot.detached.load(Ordering::Relaxed) {
                continue;
            }
            if let Some(evicted) = slot.queue.force_push(block.clone()) {
                slot.dropped.fetch_add(1, Ordering::Relaxed);
                self.recycle(evicted);
            }
        }
        self.shared.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Keep an evicted block that nobody else holds instead of freeing it.
    fn recycle(&mut self, block: Arc<AudioBlock>) {
        if Arc::strong_count(&block) == 1 && self.spare.len() < self.spare.capacity() {
            self.spare.push(block);
        }
    }
}

/// A registered reader with its own cursor and queue.
pub struct ConsumerHandle {
    shared: Arc<BusShared>,
    slot: Arc<ConsumerSlot>,
    parker: Parker,
    current: Option<Arc<AudioBlock>>,
}

impl ConsumerHandle {
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Blocks evicted from this consumer's queue because it fell behind.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    /// Blocks waiting to be read.
    pub fn pending(&self) -> usize {
        self.slot.queue.len()
    }

    /// Wait up to `timeout` for the next block.
    ///
    /// Blocks only the calling thread, re-checking the queue at least every
    /// [`PARK_SLICE`]. Any block returned by a previous read is released first.
    pub fn read(&mut self, timeout: Duration) -> Result<&AudioBlock, ReadError> {
        self.current = None;
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();

        loop {
            if let Some(block) = self.slot.queue.pop() {
                let block: &AudioBlock = self.current.insert(block);
                return Ok(block);
            }
            if self.slot.detached.load(Ordering::Acquire)
                || self.shared.closed.load(Ordering::Acquire)
            {
                return Err(ReadError::Closed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ReadError::TimedOut);
            }

            if backoff.is_completed() {
                self.parker.park_timeout((deadline - now).min(PARK_SLICE));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Take the next block if one is queued, without waiting.
    pub fn try_read(&mut self) -> Option<&AudioBlock> {
        self.current = None;
        let block = self.slot.queue.pop()?;
        let block: &AudioBlock = self.current.insert(block);
        Some(block)
    }

    /// Release the block returned by the last read.
    pub fn mark_consumed(&mut self) {
        self.current = None;
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.slot.detached.store(true, Ordering::Release);
        self.shared.detach(self.slot.id);
        while self.slot.queue.pop().is_some() {}
        log::debug!("sample bus: unregistered consumer {}", self.slot.id);
    }
}
