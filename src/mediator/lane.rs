use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};

use once_cell::sync::OnceCell;
use tracing::error;

use crate::error::ConfigError;
use crate::metrics::LaneMetrics;
use crate::ring::RingBuffer;

use super::processor::EventProcessor;

/// One ring plus the single consumer thread that drains it.
///
/// Submissions pinned to the same lane are processed strictly in claim order
/// on the same thread.
pub(crate) struct Lane {
    pub(crate) index: usize,
    pub(crate) ring: RingBuffer,
    pub(crate) metrics: LaneMetrics,
    consumer: OnceCell<Thread>,
    parked: AtomicBool,
}

impl Lane {
    pub(crate) fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            ring: RingBuffer::new(capacity),
            metrics: LaneMetrics::new(),
            consumer: OnceCell::new(),
            parked: AtomicBool::new(false),
        }
    }

    /// Start the lane's consumer thread
    pub(crate) fn spawn(
        processor: EventProcessor,
        thread_name: String,
    ) -> Result<JoinHandle<()>, ConfigError> {
        let lane = Arc::clone(processor.lane());
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || processor.run())
            .map_err(|source| {
                error!(lane = lane.index, error = %source, "Failed to spawn consumer thread");
                ConfigError::Spawn {
                    lane: lane.index,
                    source,
                }
            })?;
        lane.consumer.get_or_init(|| handle.thread().clone());
        Ok(handle)
    }

    /// Record the calling thread as the consumer. Runs first thing on the
    /// consumer thread so a publisher can always find a parked consumer.
    pub(crate) fn register_consumer(&self) {
        self.consumer.get_or_init(thread::current);
    }

    /// Whether the calling thread is this lane's consumer
    pub(crate) fn is_consumer_thread(&self) -> bool {
        self.consumer
            .get()
            .is_some_and(|consumer| consumer.id() == thread::current().id())
    }

    /// Consumer side of the park handshake. After announcing `parked`, the
    /// consumer must re-check the ring before parking.
    pub(crate) fn set_parked(&self, parked: bool) {
        self.parked.store(parked, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Unpark the consumer if it is parked waiting for work.
    ///
    /// The fence orders the caller's publish before the `parked` load. Paired
    /// with the fence in [`set_parked`](Self::set_parked), either the consumer
    /// sees the publish on its re-check or this call sees `parked` and unparks.
    pub(crate) fn notify_published(&self) {
        fence(Ordering::SeqCst);
        if self.parked.load(Ordering::SeqCst) {
            self.wake_consumer();
        }
    }

    pub(crate) fn wake_consumer(&self) {
        if let Some(consumer) = self.consumer.get() {
            consumer.unpark();
        }
    }
}
