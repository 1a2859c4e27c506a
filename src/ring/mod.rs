//! # Ring Module
//!
//! The hand-off substrate between producer threads and a lane's event
//! processor: a fixed array of envelope slots coordinated by sequence
//! counters, with no lock held across claim, write and publish.
//!
//! - [`slot`]: per-position state machine and ownership rules
//! - [`buffer`]: claim / publish / consume over the slot array
//! - [`wait`]: idle strategies used at every suspension point

pub(crate) mod buffer;
pub(crate) mod slot;
mod wait;

pub(crate) use buffer::{ClaimPolicy, RingBuffer};
pub(crate) use wait::Idler;
pub use wait::WaitStrategy;
