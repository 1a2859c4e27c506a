use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::MediatorConfig;
use crate::error::{ConfigError, DispatchError};
use crate::ids::DispatchId;
use crate::metrics::MediatorMetrics;
use crate::registry::{AnyPayload, HandlerLookup, HandlerRegistry};
use crate::request::{Event, Request, RequestKey};
use crate::ring::slot::{Completion, Envelope, Outcome, Payload};
use crate::ring::{ClaimPolicy, Idler};

use super::lane::Lane;
use super::pending::{pending, PendingResult};
use super::processor::EventProcessor;
use super::publisher::Publisher;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum WaitBound {
    #[default]
    Configured,
    Bounded(Duration),
    Unbounded,
}

/// Per-call overrides for a dispatch.
///
/// ```rust
/// use std::time::Duration;
/// use brrtmediator::DispatchOptions;
///
/// let options = DispatchOptions::new()
///     .timeout(Duration::from_millis(250))
///     .group(3);
/// # let _ = options;
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    wait: WaitBound,
    group: Option<usize>,
}

impl DispatchOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the blocking wait for the result, overriding `dispatch_timeout`
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.wait = WaitBound::Bounded(timeout);
        self
    }

    /// Wait for the result without a bound
    #[must_use]
    pub fn no_timeout(mut self) -> Self {
        self.wait = WaitBound::Unbounded;
        self
    }

    /// Pin the submission to executor group `group`.
    ///
    /// Submissions with the same group run on the same consumer thread, in
    /// submission order; groups map onto lanes modulo `consumer_threads`.
    #[must_use]
    pub fn group(mut self, group: usize) -> Self {
        self.group = Some(group);
        self
    }

    fn resolve_timeout(&self, configured: Option<Duration>) -> Option<Duration> {
        match self.wait {
            WaitBound::Configured => configured,
            WaitBound::Bounded(timeout) => Some(timeout),
            WaitBound::Unbounded => None,
        }
    }
}

fn downcast_response<R: Request>(payload: AnyPayload, key: &RequestKey) -> Result<R::Response, DispatchError> {
    payload
        .downcast::<R::Response>()
        .map(|response| *response)
        .map_err(|_| DispatchError::HandlerFailure {
            request_type: key.type_name(),
            source: anyhow::anyhow!(
                "handler returned a value that is not {}",
                std::any::type_name::<R::Response>()
            ),
        })
}

struct Inner {
    lanes: Vec<Arc<Lane>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    publisher: Publisher,
    config: MediatorConfig,
}

impl Inner {
    fn lane_for(&self, group: Option<usize>) -> &Arc<Lane> {
        let count = self.lanes.len();
        let index = match group {
            _ if count == 1 => 0,
            Some(group) => group % count,
            None => {
                let mut hasher = DefaultHasher::new();
                thread::current().id().hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
        };
        &self.lanes[index]
    }

    /// Block until `sequence` completes on `lane` or `timeout` elapses
    fn await_outcome(
        &self,
        lane: &Lane,
        sequence: u64,
        id: DispatchId,
        key: &RequestKey,
        timeout: Option<Duration>,
    ) -> Outcome {
        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);
        let idler = Idler::new(self.config.wait_strategy, self.config.park_interval);
        loop {
            if let Some(outcome) = lane.ring.try_take_result(sequence) {
                return outcome;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                lane.ring.abandon(sequence);
                lane.metrics.record_timeout();
                let waited = started.elapsed();
                warn!(
                    dispatch_id = %id,
                    lane = lane.index,
                    sequence,
                    request_type = %key,
                    waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    "Blocking dispatch timed out; request will still be processed"
                );
                return Err(DispatchError::Timeout {
                    request_type: key.type_name(),
                    waited,
                });
            }
            idler.idle();
        }
    }

    fn shutdown(&self) {
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        info!(lanes = self.lanes.len(), "Mediator shutting down");
        for lane in &self.lanes {
            lane.ring.close();
            lane.wake_consumer();
        }
        let current = thread::current().id();
        for worker in workers {
            // Shutdown triggered from a callback on a consumer thread cannot join itself.
            if worker.thread().id() == current {
                continue;
            }
            let name = worker.thread().name().map(str::to_owned);
            if worker.join().is_err() {
                error!(thread = ?name, "Consumer thread panicked");
            }
        }
        debug!("Mediator stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Typed request/response mediator backed by per-lane ring buffers.
///
/// Cloning is cheap and every clone submits to the same lanes; the consumer
/// threads stop when [`shutdown`](Self::shutdown) is called or the last clone
/// is dropped.
///
/// Handlers run on consumer threads. A blocking dispatch from a handler (or
/// callback) onto its own lane fails with
/// [`DispatchError::ReentrantDispatch`]; target another lane with
/// [`DispatchOptions::group`] or use a non-blocking dispatch instead.
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicI64, Ordering};
/// use std::sync::Arc;
/// use brrtmediator::{Mediator, MediatorConfig, RegistryBuilder, Request};
///
/// struct Decrement;
/// impl Request for Decrement {
///     type Response = i64;
/// }
///
/// let counter = Arc::new(AtomicI64::new(5));
/// let registry = RegistryBuilder::new()
///     .register_fn({
///         let counter = counter.clone();
///         move |_: Decrement| Ok(counter.fetch_sub(1, Ordering::SeqCst) - 1)
///     })
///     .build();
///
/// let mediator = Mediator::new(registry, MediatorConfig::default()).unwrap();
/// assert_eq!(mediator.dispatch_blocking(Decrement).unwrap(), 4);
/// assert_eq!(counter.load(Ordering::SeqCst), 4);
/// ```
#[derive(Clone)]
pub struct Mediator {
    inner: Arc<Inner>,
}

impl Mediator {
    /// Start a mediator serving the handlers in `registry`
    pub fn new(registry: HandlerRegistry, config: MediatorConfig) -> Result<Self, ConfigError> {
        Self::with_lookup(Arc::new(registry), config)
    }

    /// Start a mediator over any [`HandlerLookup`] implementation
    pub fn with_lookup(
        lookup: Arc<dyn HandlerLookup>,
        config: MediatorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let lanes: Vec<Arc<Lane>> = (0..config.consumer_threads)
            .map(|index| Arc::new(Lane::new(index, config.capacity)))
            .collect();
        let publisher = Publisher::new(ClaimPolicy {
            backpressure: config.backpressure,
            timeout: config.claim_timeout,
            wait_strategy: config.wait_strategy,
            park_interval: config.park_interval,
        });
        let inner = Inner {
            lanes,
            workers: Mutex::new(Vec::with_capacity(config.consumer_threads)),
            publisher,
            config,
        };

        for lane in &inner.lanes {
            let processor = EventProcessor::new(
                Arc::clone(lane),
                Arc::clone(&lookup),
                inner.config.async_failure_policy,
                inner.config.wait_strategy,
                inner.config.park_interval,
            );
            let name = format!("{}-{}", inner.config.thread_name_prefix, lane.index);
            // On failure `inner` is dropped here, which stops the lanes already started.
            let worker = Lane::spawn(processor, name)?;
            inner.workers.lock().push(worker);
        }

        info!(
            lanes = inner.lanes.len(),
            capacity = inner.config.capacity,
            wait_strategy = inner.config.wait_strategy.as_str(),
            backpressure = ?inner.config.backpressure,
            "Mediator started"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn submit(
        &self,
        lane: &Lane,
        id: DispatchId,
        key: RequestKey,
        payload: Payload,
        completion: Completion,
    ) -> Result<u64, DispatchError> {
        self.inner.publisher.submit(
            lane,
            Envelope {
                id,
                key,
                payload,
                completion,
            },
        )
    }

    /// Dispatch `request` and block until its handler has produced a result.
    ///
    /// Waits at most `dispatch_timeout`; a timed-out request is still processed.
    /// Called from a handler on the lane it targets, fails with
    /// [`DispatchError::ReentrantDispatch`].
    pub fn dispatch_blocking<R: Request>(&self, request: R) -> Result<R::Response, DispatchError> {
        self.dispatch_blocking_with(request, DispatchOptions::default())
    }

    /// [`dispatch_blocking`](Self::dispatch_blocking) with per-call options
    pub fn dispatch_blocking_with<R: Request>(
        &self,
        request: R,
        options: DispatchOptions,
    ) -> Result<R::Response, DispatchError> {
        let key = RequestKey::of::<R>();
        let id = DispatchId::new();
        let lane = self.inner.lane_for(options.group);
        // The caller is the lane's only consumer; the request could never run.
        if lane.is_consumer_thread() {
            warn!(
                dispatch_id = %id,
                lane = lane.index,
                request_type = %key,
                "Rejected blocking dispatch onto the calling handler's own lane"
            );
            return Err(DispatchError::ReentrantDispatch {
                request_type: key.type_name(),
                lane: lane.index,
            });
        }
        let sequence = self.submit(
            lane,
            id,
            key,
            Payload::Request(Box::new(request)),
            Completion::Blocking(thread::current()),
        )?;

        let timeout = options.resolve_timeout(self.inner.config.dispatch_timeout);
        let payload = self
            .inner
            .await_outcome(lane, sequence, id, &key, timeout)?;
        downcast_response::<R>(payload, &key)
    }

    /// Dispatch `request` without waiting for, or observing, its result.
    ///
    /// Only submission failures (`Capacity`, `Shutdown`) are returned; handler
    /// failures follow the configured [`AsyncFailurePolicy`](crate::AsyncFailurePolicy).
    pub fn dispatch_async<R: Request>(&self, request: R) -> Result<(), DispatchError> {
        self.dispatch_async_with(request, DispatchOptions::default())
    }

    /// [`dispatch_async`](Self::dispatch_async) pinned to an executor group
    pub fn dispatch_async_with<R: Request>(
        &self,
        request: R,
        options: DispatchOptions,
    ) -> Result<(), DispatchError> {
        let lane = self.inner.lane_for(options.group);
        self.submit(
            lane,
            DispatchId::new(),
            RequestKey::of::<R>(),
            Payload::Request(Box::new(request)),
            Completion::Detached,
        )
        .map(|_| ())
    }

    /// Dispatch `request` and run `callback` with its outcome on the consumer
    /// thread. The callback must not block on this mediator.
    pub fn dispatch_async_callback<R, F>(&self, request: R, callback: F) -> Result<(), DispatchError>
    where
        R: Request,
        F: FnOnce(Result<R::Response, DispatchError>) + Send + 'static,
    {
        let key = RequestKey::of::<R>();
        let lane = self.inner.lane_for(None);
        self.submit(
            lane,
            DispatchId::new(),
            key,
            Payload::Request(Box::new(request)),
            Completion::Callback(Box::new(move |outcome: Outcome| {
                callback(outcome.and_then(|payload| downcast_response::<R>(payload, &key)));
            })),
        )
        .map(|_| ())
    }

    /// Dispatch `request` and get a handle to its eventual result
    pub fn dispatch_async_pending<R: Request>(
        &self,
        request: R,
    ) -> Result<PendingResult<R::Response>, DispatchError> {
        let (pending, completer) = pending::<R::Response>();
        self.dispatch_async_callback(request, move |outcome| completer.complete(outcome))?;
        Ok(pending)
    }

    /// Deliver `event` to every registered handler of its type, asynchronously.
    ///
    /// An event type without handlers is not an error.
    pub fn publish_event<E: Event>(&self, event: E) -> Result<(), DispatchError> {
        let lane = self.inner.lane_for(None);
        self.submit(
            lane,
            DispatchId::new(),
            RequestKey::of::<E>(),
            Payload::Event(Box::new(event)),
            Completion::Detached,
        )
        .map(|_| ())
    }

    /// Per-lane counters
    pub fn metrics(&self) -> MediatorMetrics {
        MediatorMetrics {
            lanes: self
                .inner
                .lanes
                .iter()
                .map(|lane| lane.metrics.snapshot(lane.index, lane.ring.queue_depth()))
                .collect(),
        }
    }

    /// The configuration this mediator was started with
    pub fn config(&self) -> &MediatorConfig {
        &self.inner.config
    }

    /// Number of lanes (consumer threads)
    pub fn lane_count(&self) -> usize {
        self.inner.lanes.len()
    }

    /// Stop accepting submissions, drain what was already submitted, and join
    /// the consumer threads. Idempotent; later dispatches fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_shut_down(&self) -> bool {
        self.inner.lanes.iter().all(|lane| lane.ring.is_closed())
    }
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("lanes", &self.inner.lanes.len())
            .field("capacity", &self.inner.config.capacity)
            .field("wait_strategy", &self.inner.config.wait_strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_options_resolve_timeout() {
        let configured = Some(Duration::from_secs(30));
        assert_eq!(
            DispatchOptions::new().resolve_timeout(configured),
            configured
        );
        assert_eq!(
            DispatchOptions::new()
                .timeout(Duration::from_millis(5))
                .resolve_timeout(configured),
            Some(Duration::from_millis(5))
        );
        assert_eq!(
            DispatchOptions::new().no_timeout().resolve_timeout(configured),
            None
        );
    }

    #[test]
    fn test_group_selects_lane_modulo_count() {
        let mediator = Mediator::new(
            HandlerRegistry::default(),
            MediatorConfig::default()
                .with_capacity(8)
                .with_consumer_threads(3),
        )
        .unwrap();
        assert_eq!(mediator.inner.lane_for(Some(1)).index, 1);
        assert_eq!(mediator.inner.lane_for(Some(4)).index, 1);
        assert_eq!(mediator.inner.lane_for(Some(3)).index, 0);
        // Ungrouped submissions from one thread always land on the same lane.
        let first = mediator.inner.lane_for(None).index;
        assert_eq!(mediator.inner.lane_for(None).index, first);
    }
}
