//! # Mediator Module
//!
//! The public dispatch facade and the machinery behind it.
//!
//! ## Overview
//!
//! A [`Mediator`] owns one or more *lanes*. Each lane is a ring buffer with a
//! single dedicated consumer thread running the event processor loop:
//!
//! ```text
//! caller ──► Publisher ──claim/publish──► RingBuffer ──► EventProcessor ──► handler
//!   ▲                                         │                │
//!   └──────────── wake (blocking) ◄───────────┴── result ◄─────┘
//! ```
//!
//! - **Publisher**: claims the next slot of the chosen lane, applying the
//!   backpressure policy when the ring is full, writes the envelope and
//!   publishes its sequence.
//! - **Event processor**: consumes sequences strictly in order, resolves the
//!   handler through the [`HandlerLookup`](crate::registry::HandlerLookup),
//!   runs it under `catch_unwind` and delivers the outcome.
//! - **Completion**: a blocking caller spins/yields/parks on its own slot
//!   until Completed and is unparked exactly once; callbacks and
//!   [`PendingResult`]s are fulfilled on the consumer thread; fire-and-forget
//!   failures follow [`AsyncFailurePolicy`](crate::AsyncFailurePolicy).
//!
//! ## Lanes and executor groups
//!
//! Without options a submission goes to the lane picked by hashing the calling
//! thread, so every producer keeps FIFO order. [`DispatchOptions::group`] pins
//! submissions to lane `group % consumer_threads`: same group, same thread.
//!
//! ## Shutdown
//!
//! [`Mediator::shutdown`] (or dropping the last clone) closes every ring;
//! already claimed sequences are drained before the consumer threads exit.

mod core;
mod lane;
mod pending;
mod processor;
mod publisher;

pub use core::{DispatchOptions, Mediator};
pub use pending::PendingResult;
