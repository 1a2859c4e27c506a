//! # Envelope Slot
//!
//! One ring position's storage for an in-flight submission and its outcome.
//!
//! ## Stamp
//!
//! A slot's state and the sequence it currently belongs to are packed into a
//! single `AtomicU64` (`sequence << 3 | state`). Every transition is a store or
//! CAS on that word, so a party holding a stale sequence can never move a slot
//! that has since been reused by a later submission.
//!
//! ```text
//! Empty -> Claimed -> Published -> Processing -> Completed -> Releasing -> Empty
//!                                       |                                   ^
//!                                       +------- (no waiter) ---------------+
//! ```
//!
//! ## Ownership
//!
//! The envelope and result cells are only touched by whoever moved the stamp
//! into the state that grants access:
//!
//! | State        | Owner                                   | May touch         |
//! |--------------|-----------------------------------------|-------------------|
//! | `Claimed`    | claiming producer ([`ClaimedSlot`])      | envelope          |
//! | `Processing` | event processor ([`ProcessingSlot`])     | envelope, result  |
//! | `Releasing`  | blocking waiter or abandon handler      | result            |
//!
//! Unsafe code in the ring is confined to this file.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::Thread;

use crate::error::DispatchError;
use crate::ids::DispatchId;
use crate::registry::AnyPayload;
use crate::request::RequestKey;

/// Outcome captured by the event processor for one submission.
pub(crate) type Outcome = Result<AnyPayload, DispatchError>;

/// Invoked on the consumer thread with the outcome of a callback submission.
pub(crate) type Callback = Box<dyn FnOnce(Outcome) + Send>;

/// Lifecycle state of an [`EnvelopeSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SlotState {
    Empty = 0,
    Claimed = 1,
    Published = 2,
    Processing = 3,
    Completed = 4,
    Releasing = 5,
}

const STATE_BITS: u32 = 3;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

impl SlotState {
    fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            0 => Self::Empty,
            1 => Self::Claimed,
            2 => Self::Published,
            3 => Self::Processing,
            4 => Self::Completed,
            _ => Self::Releasing,
        }
    }
}

#[inline]
fn stamp(sequence: u64, state: SlotState) -> u64 {
    (sequence << STATE_BITS) | state as u64
}

#[inline]
fn stamp_sequence(stamp: u64) -> u64 {
    stamp >> STATE_BITS
}

/// What a submission carries.
pub(crate) enum Payload {
    /// Routed to exactly one request handler
    Request(AnyPayload),
    /// Fanned out to every event handler of the type
    Event(AnyPayload),
}

/// How the outcome is delivered back to the submitter.
pub(crate) enum Completion {
    /// A caller is waiting on the slot; unpark this thread once Completed
    Blocking(Thread),
    /// Hand the outcome to a closure on the consumer thread
    Callback(Callback),
    /// Nobody is listening
    Detached,
}

impl Completion {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Completion::Blocking(_) => "blocking",
            Completion::Callback(_) => "callback",
            Completion::Detached => "detached",
        }
    }
}

/// A submission as written into a slot by its producer.
pub(crate) struct Envelope {
    pub(crate) id: DispatchId,
    pub(crate) key: RequestKey,
    pub(crate) payload: Payload,
    pub(crate) completion: Completion,
}

/// One position of the ring.
pub(crate) struct EnvelopeSlot {
    stamp: AtomicU64,
    /// `sequence + 1` of a submission whose blocking waiter gave up, else 0
    abandoned: AtomicU64,
    envelope: UnsafeCell<Option<Envelope>>,
    result: UnsafeCell<Option<Outcome>>,
}

// SAFETY: the cells are only accessed by the single party that owns the slot's
// current state (see the module table); ownership is handed over through
// Acquire/Release transitions of `stamp`.
unsafe impl Sync for EnvelopeSlot {}

impl EnvelopeSlot {
    pub(crate) fn new() -> Self {
        Self {
            stamp: AtomicU64::new(stamp(0, SlotState::Empty)),
            abandoned: AtomicU64::new(0),
            envelope: UnsafeCell::new(None),
            result: UnsafeCell::new(None),
        }
    }

    pub(crate) fn state(&self) -> SlotState {
        SlotState::from_bits(self.stamp.load(Ordering::Acquire))
    }

    /// Whether `sequence` has been published into this slot and not yet taken
    pub(crate) fn is_published(&self, sequence: u64) -> bool {
        self.stamp.load(Ordering::Acquire) == stamp(sequence, SlotState::Published)
    }

    /// Take the slot for `sequence` if it is Empty.
    ///
    /// Fails while the previous occupant is still being processed or its
    /// waiter has not read its result yet.
    pub(crate) fn try_claim(&self, sequence: u64) -> Option<ClaimedSlot<'_>> {
        let current = self.stamp.load(Ordering::Acquire);
        if SlotState::from_bits(current) != SlotState::Empty {
            return None;
        }
        self.stamp
            .compare_exchange(
                current,
                stamp(sequence, SlotState::Claimed),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| ClaimedSlot {
                slot: self,
                sequence,
                published: false,
            })
    }

    /// Move a published `sequence` into Processing for the event processor
    pub(crate) fn begin_processing(&self, sequence: u64) -> Option<ProcessingSlot<'_>> {
        self.stamp
            .compare_exchange(
                stamp(sequence, SlotState::Published),
                stamp(sequence, SlotState::Processing),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| ProcessingSlot {
                slot: self,
                sequence,
                finished: false,
            })
    }

    /// Blocking waiter: take the outcome of `sequence` once it is Completed.
    ///
    /// Returns `None` while the submission is still in flight. Succeeds at most
    /// once per sequence and frees the slot for reuse.
    pub(crate) fn try_take_result(&self, sequence: u64) -> Option<Outcome> {
        self.stamp
            .compare_exchange(
                stamp(sequence, SlotState::Completed),
                stamp(sequence, SlotState::Releasing),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;
        // SAFETY: the CAS above made this thread the sole owner of the cells.
        let outcome = unsafe { (*self.result.get()).take() };
        self.stamp
            .store(stamp(sequence, SlotState::Empty), Ordering::Release);
        outcome
    }

    /// Blocking waiter gave up on `sequence`.
    ///
    /// Whichever of this call and [`ProcessingSlot::complete`] runs second
    /// observes both flags and releases the slot; the CAS in `try_release`
    /// makes sure only one of them does.
    pub(crate) fn abandon(&self, sequence: u64) {
        self.abandoned.store(sequence + 1, Ordering::SeqCst);
        if self.stamp.load(Ordering::SeqCst) == stamp(sequence, SlotState::Completed) {
            self.try_release(sequence);
        }
    }

    fn try_release(&self, sequence: u64) -> bool {
        if self
            .stamp
            .compare_exchange(
                stamp(sequence, SlotState::Completed),
                stamp(sequence, SlotState::Releasing),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return false;
        }
        // SAFETY: the CAS above made this thread the sole owner of the cells.
        unsafe {
            *self.result.get() = None;
        }
        self.abandoned.store(0, Ordering::Relaxed);
        self.stamp
            .store(stamp(sequence, SlotState::Empty), Ordering::Release);
        true
    }

    /// Sequence the slot currently belongs to (diagnostics)
    pub(crate) fn sequence(&self) -> u64 {
        stamp_sequence(self.stamp.load(Ordering::Acquire))
    }
}

impl Default for EnvelopeSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer-side ownership of a slot between claim and publish.
///
/// Dropping it unpublished publishes an empty envelope so the consumer never
/// stalls on a sequence that will not arrive.
pub(crate) struct ClaimedSlot<'a> {
    slot: &'a EnvelopeSlot,
    sequence: u64,
    published: bool,
}

impl ClaimedSlot<'_> {
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Write the envelope and make it visible to the event processor
    pub(crate) fn publish(mut self, envelope: Envelope) {
        self.write(Some(envelope));
    }

    fn write(&mut self, envelope: Option<Envelope>) {
        // SAFETY: the slot is in Claimed for our sequence; only we may write.
        unsafe {
            *self.slot.envelope.get() = envelope;
            *self.slot.result.get() = None;
        }
        self.published = true;
        self.slot
            .stamp
            .store(stamp(self.sequence, SlotState::Published), Ordering::Release);
    }
}

impl Drop for ClaimedSlot<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.write(None);
        }
    }
}

/// Consumer-side ownership of a slot while its submission is processed.
///
/// Dropping it without [`complete`](Self::complete) returns the slot to Empty.
pub(crate) struct ProcessingSlot<'a> {
    slot: &'a EnvelopeSlot,
    sequence: u64,
    finished: bool,
}

impl ProcessingSlot<'_> {
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Take the submission out of the slot; `None` for a dropped claim
    pub(crate) fn take_envelope(&mut self) -> Option<Envelope> {
        // SAFETY: the slot is in Processing for our sequence.
        unsafe { (*self.slot.envelope.get()).take() }
    }

    /// Store the outcome for a blocking waiter and mark the slot Completed.
    ///
    /// The result is written before the state flips, so a waiter that sees
    /// Completed always reads a fully written outcome. If the waiter has
    /// already given up, the slot is released here instead.
    pub(crate) fn complete(mut self, outcome: Outcome) {
        // SAFETY: the slot is in Processing for our sequence.
        unsafe {
            *self.slot.result.get() = Some(outcome);
        }
        self.finished = true;
        self.slot
            .stamp
            .store(stamp(self.sequence, SlotState::Completed), Ordering::SeqCst);
        if self.slot.abandoned.load(Ordering::SeqCst) == self.sequence + 1 {
            self.slot.try_release(self.sequence);
        }
    }

    /// Return the slot to Empty without storing an outcome
    pub(crate) fn release(mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        // SAFETY: the slot is in Processing for our sequence.
        unsafe {
            *self.slot.envelope.get() = None;
            *self.slot.result.get() = None;
        }
        self.finished = true;
        self.slot
            .stamp
            .store(stamp(self.sequence, SlotState::Empty), Ordering::Release);
    }
}

impl Drop for ProcessingSlot<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    fn envelope(completion: Completion) -> Envelope {
        Envelope {
            id: DispatchId::new(),
            key: RequestKey::of::<Probe>(),
            payload: Payload::Request(Box::new(7u32)),
            completion,
        }
    }

    #[test]
    fn test_slot_blocking_lifecycle() {
        let slot = EnvelopeSlot::new();
        assert_eq!(slot.state(), SlotState::Empty);

        let claimed = slot.try_claim(0).unwrap();
        assert_eq!(slot.state(), SlotState::Claimed);
        assert!(!slot.is_published(0));
        // A second claim cannot take an occupied slot.
        assert!(slot.try_claim(0).is_none());

        claimed.publish(envelope(Completion::Blocking(std::thread::current())));
        assert!(slot.is_published(0));
        assert!(!slot.is_published(1));

        let mut processing = slot.begin_processing(0).unwrap();
        assert_eq!(slot.state(), SlotState::Processing);
        let taken = processing.take_envelope().unwrap();
        assert!(matches!(taken.completion, Completion::Blocking(_)));
        assert!(slot.try_take_result(0).is_none());

        processing.complete(Ok(Box::new(42u32)));
        assert_eq!(slot.state(), SlotState::Completed);

        let outcome = slot.try_take_result(0).unwrap().unwrap();
        assert_eq!(*outcome.downcast::<u32>().unwrap(), 42);
        assert_eq!(slot.state(), SlotState::Empty);
        // Delivered exactly once.
        assert!(slot.try_take_result(0).is_none());
    }

    #[test]
    fn test_stale_sequence_cannot_touch_reused_slot() {
        let slot = EnvelopeSlot::new();
        slot.try_claim(0)
            .unwrap()
            .publish(envelope(Completion::Detached));
        slot.begin_processing(0).unwrap().release();

        slot.try_claim(8)
            .unwrap()
            .publish(envelope(Completion::Detached));
        assert!(slot.begin_processing(0).is_none());
        let processing = slot.begin_processing(8).unwrap();
        processing.complete(Ok(Box::new(())));

        assert!(slot.try_take_result(0).is_none());
        slot.abandon(0);
        assert_eq!(slot.state(), SlotState::Completed);
        assert!(slot.try_take_result(8).is_some());
    }

    #[test]
    fn test_abandon_before_completion_is_released_by_processor() {
        let slot = EnvelopeSlot::new();
        slot.try_claim(3)
            .unwrap()
            .publish(envelope(Completion::Blocking(std::thread::current())));
        let mut processing = slot.begin_processing(3).unwrap();
        let _ = processing.take_envelope();

        slot.abandon(3);
        assert_eq!(slot.state(), SlotState::Processing);

        processing.complete(Ok(Box::new(1u8)));
        assert_eq!(slot.state(), SlotState::Empty);
        assert_eq!(slot.sequence(), 3);
        assert!(slot.try_claim(11).is_some());
    }

    #[test]
    fn test_abandon_after_completion_releases_immediately() {
        let slot = EnvelopeSlot::new();
        slot.try_claim(5)
            .unwrap()
            .publish(envelope(Completion::Blocking(std::thread::current())));
        slot.begin_processing(5)
            .unwrap()
            .complete(Err(DispatchError::Shutdown));

        slot.abandon(5);
        assert_eq!(slot.state(), SlotState::Empty);
    }

    #[test]
    fn test_dropped_claim_publishes_empty_envelope() {
        let slot = EnvelopeSlot::new();
        {
            let claimed = slot.try_claim(2).unwrap();
            assert_eq!(claimed.sequence(), 2);
        }
        assert!(slot.is_published(2));
        let mut processing = slot.begin_processing(2).unwrap();
        assert!(processing.take_envelope().is_none());
        drop(processing);
        assert_eq!(slot.state(), SlotState::Empty);
    }
}
