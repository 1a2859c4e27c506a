//! Fixed-capacity ring of [`EnvelopeSlot`]s shared by the producers and the
//! single event processor of one lane.
//!
//! Two monotonically increasing counters coordinate access:
//!
//! - `claim`: the next sequence to hand out. The top bit marks the ring closed.
//! - `consumed`: the next sequence the processor will handle, i.e. the number
//!   of sequences already released back to capacity accounting.
//!
//! A claim only succeeds while `claim - consumed < capacity` and the target
//! slot is Empty (a blocking waiter may still be reading the previous
//! occupant's result), so a producer that gives up under backpressure has
//! never taken a sequence and the consumer can never stall on a hole.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use tracing::trace;

use crate::config::BackpressureMode;
use crate::error::DispatchError;

use super::slot::{ClaimedSlot, EnvelopeSlot, ProcessingSlot, SlotState};
use super::wait::{Idler, WaitStrategy};

const CLOSED: u64 = 1 << 63;

/// Producer-side waiting rules for [`RingBuffer::claim_next`]
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClaimPolicy {
    pub(crate) backpressure: BackpressureMode,
    pub(crate) timeout: Option<Duration>,
    pub(crate) wait_strategy: WaitStrategy,
    pub(crate) park_interval: Duration,
}

pub(crate) struct RingBuffer {
    slots: Box<[EnvelopeSlot]>,
    capacity: u64,
    mask: Option<u64>,
    claim: CachePadded<AtomicU64>,
    consumed: CachePadded<AtomicU64>,
}

impl RingBuffer {
    /// Allocate a ring of `capacity` empty slots. `capacity` must be positive.
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots: Vec<EnvelopeSlot> = (0..capacity).map(|_| EnvelopeSlot::new()).collect();
        let capacity = capacity as u64;
        Self {
            slots: slots.into_boxed_slice(),
            capacity,
            mask: capacity.is_power_of_two().then(|| capacity - 1),
            claim: CachePadded::new(AtomicU64::new(0)),
            consumed: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, sequence: u64) -> &EnvelopeSlot {
        let index = match self.mask {
            Some(mask) => sequence & mask,
            None => sequence % self.capacity,
        };
        &self.slots[index as usize]
    }

    /// Reserve the next sequence and take ownership of its slot.
    ///
    /// When the ring is full, or the next slot still holds an unread result,
    /// `Shed` fails immediately and `Block` waits until the slot frees or
    /// `timeout` elapses. Either failure is [`DispatchError::Capacity`] and
    /// leaves the counters untouched.
    pub(crate) fn claim_next(&self, policy: &ClaimPolicy) -> Result<ClaimedSlot<'_>, DispatchError> {
        let idler = Idler::new(policy.wait_strategy, policy.park_interval);
        let mut deadline: Option<Instant> = None;

        let sequence = loop {
            let current = self.claim.load(Ordering::Acquire);
            if current & CLOSED != 0 {
                return Err(DispatchError::Shutdown);
            }
            let consumed = self.consumed.load(Ordering::Acquire);
            if current.saturating_sub(consumed) < self.capacity
                && self.slot(current).state() == SlotState::Empty
            {
                if self
                    .claim
                    .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break current;
                }
                continue;
            }

            match policy.backpressure {
                BackpressureMode::Shed => {
                    return Err(DispatchError::Capacity {
                        capacity: self.capacity(),
                    })
                }
                BackpressureMode::Block => {
                    if let Some(timeout) = policy.timeout {
                        let deadline = *deadline.get_or_insert_with(|| Instant::now() + timeout);
                        if Instant::now() >= deadline {
                            return Err(DispatchError::Capacity {
                                capacity: self.capacity(),
                            });
                        }
                    }
                    idler.idle();
                }
            }
        };

        // The slot was Empty before the CAS and only the CAS winner for
        // `sequence` may claim it, so this succeeds on the first pass.
        let slot = self.slot(sequence);
        idler.reset();
        loop {
            if let Some(claimed) = slot.try_claim(sequence) {
                trace!(sequence, "Claimed ring slot");
                return Ok(claimed);
            }
            idler.idle();
        }
    }

    /// Contiguous run of published sequences starting at `next`
    pub(crate) fn available_batch(&self, next: u64) -> Range<u64> {
        let claimed = self.claim.load(Ordering::Acquire) & !CLOSED;
        let limit = claimed.min(next + self.capacity);
        let mut end = next;
        while end < limit && self.slot(end).is_published(end) {
            end += 1;
        }
        next..end
    }

    /// Take a published sequence for processing
    pub(crate) fn begin_processing(&self, sequence: u64) -> Option<ProcessingSlot<'_>> {
        self.slot(sequence).begin_processing(sequence)
    }

    /// Blocking waiter: take the outcome for `sequence` once Completed
    pub(crate) fn try_take_result(&self, sequence: u64) -> Option<super::slot::Outcome> {
        self.slot(sequence).try_take_result(sequence)
    }

    /// Blocking waiter gave up on `sequence`
    pub(crate) fn abandon(&self, sequence: u64) {
        self.slot(sequence).abandon(sequence);
    }

    /// Everything below `next` has been processed
    pub(crate) fn advance_consumed(&self, next: u64) {
        self.consumed.store(next, Ordering::Release);
    }

    /// Refuse further claims; already claimed sequences are still drained
    pub(crate) fn close(&self) {
        self.claim.fetch_or(CLOSED, Ordering::AcqRel);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.claim.load(Ordering::Acquire) & CLOSED != 0
    }

    /// Closed and every claimed sequence below `next` has been processed
    pub(crate) fn is_drained(&self, next: u64) -> bool {
        let claim = self.claim.load(Ordering::Acquire);
        claim & CLOSED != 0 && next >= claim & !CLOSED
    }

    /// Claimed but not yet processed sequences
    pub(crate) fn queue_depth(&self) -> u64 {
        let claimed = self.claim.load(Ordering::Acquire) & !CLOSED;
        claimed.saturating_sub(self.consumed.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DispatchId;
    use crate::request::RequestKey;
    use crate::ring::slot::{Completion, Envelope, Payload, SlotState};

    fn policy(backpressure: BackpressureMode, timeout: Option<Duration>) -> ClaimPolicy {
        ClaimPolicy {
            backpressure,
            timeout,
            wait_strategy: WaitStrategy::Yielding,
            park_interval: Duration::from_micros(50),
        }
    }

    fn envelope(value: u32) -> Envelope {
        Envelope {
            id: DispatchId::new(),
            key: RequestKey::of::<u32>(),
            payload: Payload::Request(Box::new(value)),
            completion: Completion::Detached,
        }
    }

    /// Process and release everything available, returning the payloads
    fn drain(ring: &RingBuffer, next: &mut u64) -> Vec<u32> {
        let mut seen = Vec::new();
        for sequence in ring.available_batch(*next) {
            let mut slot = ring.begin_processing(sequence).unwrap();
            if let Some(Envelope {
                payload: Payload::Request(value),
                ..
            }) = slot.take_envelope()
            {
                seen.push(*value.downcast::<u32>().unwrap());
            }
            slot.release();
            *next = sequence + 1;
            ring.advance_consumed(*next);
        }
        seen
    }

    #[test]
    fn test_claim_publish_consume_in_order() {
        let ring = RingBuffer::new(4);
        let shed = policy(BackpressureMode::Shed, None);
        for value in 0..3 {
            ring.claim_next(&shed).unwrap().publish(envelope(value));
        }
        assert_eq!(ring.queue_depth(), 3);

        let mut next = 0;
        assert_eq!(drain(&ring, &mut next), vec![0, 1, 2]);
        assert_eq!(next, 3);
        assert_eq!(ring.queue_depth(), 0);
    }

    #[test]
    fn test_unpublished_claim_is_not_visible() {
        let ring = RingBuffer::new(4);
        let shed = policy(BackpressureMode::Shed, None);
        let first = ring.claim_next(&shed).unwrap();
        ring.claim_next(&shed).unwrap().publish(envelope(1));

        // Sequence 1 is published but 0 is not; nothing is consumable yet.
        assert!(ring.available_batch(0).is_empty());
        first.publish(envelope(0));
        assert_eq!(ring.available_batch(0), 0..2);
    }

    #[test]
    fn test_shed_when_full_does_not_consume_a_sequence() {
        let ring = RingBuffer::new(2);
        let shed = policy(BackpressureMode::Shed, None);
        ring.claim_next(&shed).unwrap().publish(envelope(0));
        ring.claim_next(&shed).unwrap().publish(envelope(1));

        let err = ring.claim_next(&shed).err().unwrap();
        assert!(matches!(err, DispatchError::Capacity { capacity: 2 }));
        assert_eq!(ring.queue_depth(), 2);

        let mut next = 0;
        assert_eq!(drain(&ring, &mut next), vec![0, 1]);
        ring.claim_next(&shed).unwrap().publish(envelope(2));
        assert_eq!(drain(&ring, &mut next), vec![2]);
    }

    #[test]
    fn test_block_times_out_with_capacity_error() {
        let ring = RingBuffer::new(1);
        let block = policy(BackpressureMode::Block, Some(Duration::from_millis(20)));
        ring.claim_next(&block).unwrap().publish(envelope(0));

        let started = Instant::now();
        let err = ring.claim_next(&block).err().unwrap();
        assert!(matches!(err, DispatchError::Capacity { capacity: 1 }));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_blocked_producer_resumes_when_capacity_frees() {
        let ring = std::sync::Arc::new(RingBuffer::new(1));
        let block = policy(BackpressureMode::Block, Some(Duration::from_secs(5)));
        ring.claim_next(&block).unwrap().publish(envelope(0));

        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || ring.claim_next(&block).map(|slot| slot.publish(envelope(1))))
        };

        std::thread::sleep(Duration::from_millis(10));
        let mut next = 0;
        assert_eq!(drain(&ring, &mut next), vec![0]);
        producer.join().unwrap().unwrap();

        let mut seen = Vec::new();
        while seen.is_empty() {
            seen = drain(&ring, &mut next);
        }
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn test_non_power_of_two_capacity_wraps() {
        let ring = RingBuffer::new(3);
        let shed = policy(BackpressureMode::Shed, None);
        let mut next = 0;
        let mut seen = Vec::new();
        for value in 0..10 {
            ring.claim_next(&shed).unwrap().publish(envelope(value));
            seen.extend(drain(&ring, &mut next));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_close_rejects_claims_and_drains() {
        let ring = RingBuffer::new(4);
        let shed = policy(BackpressureMode::Shed, None);
        ring.claim_next(&shed).unwrap().publish(envelope(0));
        ring.close();
        assert!(ring.is_closed());
        assert!(matches!(
            ring.claim_next(&shed).err().unwrap(),
            DispatchError::Shutdown
        ));

        assert!(!ring.is_drained(0));
        let mut next = 0;
        assert_eq!(drain(&ring, &mut next), vec![0]);
        assert!(ring.is_drained(next));
    }

    /// Leave sequence 0 completed on a one-slot ring with its result unread
    fn ring_with_unread_result() -> RingBuffer {
        let ring = RingBuffer::new(1);
        let shed = policy(BackpressureMode::Shed, None);
        ring.claim_next(&shed).unwrap().publish(Envelope {
            completion: Completion::Blocking(std::thread::current()),
            ..envelope(0)
        });
        ring.begin_processing(0)
            .unwrap()
            .complete(Ok(Box::new(0u32)));
        ring.advance_consumed(1);
        assert_eq!(ring.slot(1).state(), SlotState::Completed);
        ring
    }

    #[test]
    fn test_shed_rejects_slot_with_unread_result() {
        let ring = ring_with_unread_result();
        let shed = policy(BackpressureMode::Shed, None);

        // Capacity accounting has room, but the slot is still occupied.
        let err = ring.claim_next(&shed).err().unwrap();
        assert!(matches!(err, DispatchError::Capacity { capacity: 1 }));
        assert_eq!(ring.queue_depth(), 0);

        assert!(ring.try_take_result(0).is_some());
        let claimed = ring.claim_next(&shed).unwrap();
        assert_eq!(claimed.sequence(), 1);
        claimed.publish(envelope(1));
    }

    #[test]
    fn test_block_times_out_on_slot_with_unread_result() {
        let ring = ring_with_unread_result();
        let block = policy(BackpressureMode::Block, Some(Duration::from_millis(20)));

        let started = Instant::now();
        let err = ring.claim_next(&block).err().unwrap();
        assert!(matches!(err, DispatchError::Capacity { capacity: 1 }));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(ring.queue_depth(), 0);
    }

    #[test]
    fn test_block_resumes_once_result_is_read() {
        let ring = std::sync::Arc::new(ring_with_unread_result());
        let block = policy(BackpressureMode::Block, None);
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let claimed = ring.claim_next(&block).unwrap();
                let sequence = claimed.sequence();
                claimed.publish(envelope(1));
                sequence
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        assert!(!producer.is_finished());
        assert_eq!(ring.queue_depth(), 0);

        assert!(ring.try_take_result(0).is_some());
        assert_eq!(producer.join().unwrap(), 1);
    }
}
