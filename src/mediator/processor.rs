//! Consumer side: the loop each lane's thread runs.
//!
//! For every published sequence, in order: resolve the handler, invoke it
//! under `catch_unwind`, deliver the outcome per the slot's completion kind,
//! then advance the lane's consumed counter. No single submission can stop
//! the loop; it exits only when the ring is closed and fully drained.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::AsyncFailurePolicy;
use crate::error::DispatchError;
use crate::ids::DispatchId;
use crate::registry::{AnyPayload, HandlerLookup};
use crate::request::RequestKey;
use crate::ring::slot::{Completion, Envelope, Outcome, Payload};
use crate::ring::{Idler, WaitStrategy};

use super::lane::Lane;

pub(crate) struct EventProcessor {
    lane: Arc<Lane>,
    lookup: Arc<dyn HandlerLookup>,
    failure_policy: AsyncFailurePolicy,
    wait_strategy: WaitStrategy,
    park_interval: Duration,
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl EventProcessor {
    pub(crate) fn new(
        lane: Arc<Lane>,
        lookup: Arc<dyn HandlerLookup>,
        failure_policy: AsyncFailurePolicy,
        wait_strategy: WaitStrategy,
        park_interval: Duration,
    ) -> Self {
        Self {
            lane,
            lookup,
            failure_policy,
            wait_strategy,
            park_interval,
        }
    }

    pub(crate) fn lane(&self) -> &Arc<Lane> {
        &self.lane
    }

    pub(crate) fn run(self) {
        let lane = &self.lane;
        lane.register_consumer();
        info!(
            lane = lane.index,
            capacity = lane.ring.capacity(),
            wait_strategy = self.wait_strategy.as_str(),
            "Event processor started"
        );

        let idler = Idler::new(self.wait_strategy, self.park_interval);
        let mut next = 0u64;
        loop {
            let batch = lane.ring.available_batch(next);
            if batch.is_empty() {
                if lane.ring.is_drained(next) {
                    break;
                }
                if idler.will_park() {
                    lane.set_parked(true);
                    if lane.ring.available_batch(next).is_empty() && !lane.ring.is_closed() {
                        idler.idle();
                    }
                    lane.set_parked(false);
                } else {
                    idler.idle();
                }
                continue;
            }

            idler.reset();
            trace!(
                lane = lane.index,
                start = batch.start,
                end = batch.end,
                "Processing batch"
            );
            for sequence in batch {
                self.process(sequence);
                next = sequence + 1;
                lane.ring.advance_consumed(next);
            }
        }

        info!(lane = lane.index, processed = next, "Event processor stopped");
    }

    fn process(&self, sequence: u64) {
        let lane = &self.lane;
        let Some(mut slot) = lane.ring.begin_processing(sequence) else {
            error!(
                lane = lane.index,
                sequence, "Published sequence could not be taken for processing"
            );
            return;
        };
        let Some(envelope) = slot.take_envelope() else {
            trace!(lane = lane.index, sequence, "Skipping abandoned claim");
            slot.release();
            return;
        };

        let Envelope {
            id,
            key,
            payload,
            completion,
        } = envelope;
        let started = Instant::now();
        let (outcome, is_event) = match payload {
            Payload::Request(request) => (self.invoke(&key, request), false),
            Payload::Event(event) => (self.fan_out(id, &key, event.as_ref()), true),
        };
        let latency_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

        match &outcome {
            Ok(_) => lane.metrics.record_completion(latency_us),
            Err(_) => lane.metrics.record_failure(latency_us),
        }
        debug!(
            dispatch_id = %id,
            lane = lane.index,
            sequence = slot.sequence(),
            request_type = %key,
            completion = completion.kind(),
            latency_us,
            success = outcome.is_ok(),
            "Dispatch processed"
        );

        match completion {
            Completion::Blocking(waiter) => {
                slot.complete(outcome);
                waiter.unpark();
            }
            Completion::Callback(callback) => {
                slot.release();
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || callback(outcome)))
                {
                    error!(
                        dispatch_id = %id,
                        lane = lane.index,
                        request_type = %key,
                        panic_message = %panic_message(panic.as_ref()),
                        "Dispatch callback panicked"
                    );
                }
            }
            Completion::Detached => {
                slot.release();
                if let Err(err) = outcome {
                    // Event handler failures were already reported one by one.
                    if !is_event {
                        self.report_detached_failure(id, &key, None, &err);
                    }
                }
            }
        }
    }

    fn invoke(&self, key: &RequestKey, request: AnyPayload) -> Outcome {
        // Custom lookups are user code too; a panic there must not end the loop.
        let handler = match panic::catch_unwind(AssertUnwindSafe(|| self.lookup.lookup(key))) {
            Ok(found) => found.map_err(|err| err.into_dispatch_error(key))?,
            Err(panic) => return Err(self.lookup_panicked(key, panic.as_ref())),
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle_erased(request))) {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(DispatchError::HandlerFailure {
                request_type: key.type_name(),
                source,
            }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    lane = self.lane.index,
                    request_type = %key,
                    handler = handler.handler_name(),
                    panic_message = %message,
                    "Handler panicked"
                );
                Err(DispatchError::handler_panicked(key.type_name(), &message))
            }
        }
    }

    /// Run every handler of an event type; the outcome fails if any of them did
    fn fan_out(&self, id: DispatchId, key: &RequestKey, event: &(dyn Any + Send)) -> Outcome {
        let handlers =
            match panic::catch_unwind(AssertUnwindSafe(|| self.lookup.event_handlers(key))) {
                Ok(handlers) => handlers,
                Err(panic) => {
                    let err = self.lookup_panicked(key, panic.as_ref());
                    self.report_detached_failure(id, key, None, &err);
                    return Err(err);
                }
            };
        if handlers.is_empty() {
            trace!(dispatch_id = %id, event_type = %key, "Event has no handlers");
        }

        let mut failed = 0usize;
        for handler in handlers {
            let result = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle_erased(event)))
            {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            if let Err(source) = result {
                failed += 1;
                let err = DispatchError::HandlerFailure {
                    request_type: key.type_name(),
                    source,
                };
                self.report_detached_failure(id, key, Some(handler.handler_name()), &err);
            }
        }

        if failed == 0 {
            Ok(Box::new(()))
        } else {
            Err(DispatchError::HandlerFailure {
                request_type: key.type_name(),
                source: anyhow::anyhow!("{failed} of {} event handlers failed", handlers.len()),
            })
        }
    }

    fn lookup_panicked(&self, key: &RequestKey, panic: &(dyn Any + Send)) -> DispatchError {
        let message = panic_message(panic);
        error!(
            lane = self.lane.index,
            request_type = %key,
            panic_message = %message,
            "Handler lookup panicked"
        );
        DispatchError::lookup_panicked(key.type_name(), &message)
    }

    fn report_detached_failure(
        &self,
        id: DispatchId,
        key: &RequestKey,
        handler: Option<&'static str>,
        err: &DispatchError,
    ) {
        match self.failure_policy {
            AsyncFailurePolicy::Log => warn!(
                dispatch_id = %id,
                lane = self.lane.index,
                request_type = %key,
                handler = handler.unwrap_or("-"),
                error = %err,
                "Fire-and-forget dispatch failed"
            ),
            AsyncFailurePolicy::Discard => debug!(
                dispatch_id = %id,
                lane = self.lane.index,
                request_type = %key,
                error = %err,
                "Discarding fire-and-forget failure"
            ),
        }
    }
}
