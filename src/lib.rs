//! # brrtmediator
//!
//! **brrtmediator** is a typed request/response mediator for Rust, backed by a
//! disruptor-style ring buffer.
//!
//! ## Overview
//!
//! Callers submit a *request* whose type names the result it expects. The
//! mediator routes it to the single handler registered for that type and runs
//! the handler on a dedicated consumer thread, off the caller's thread. The
//! hand-off is a fixed array of slots coordinated by sequence counters rather
//! than a locked queue, so producers never contend on a mutex.
//!
//! Two completion contracts are offered:
//!
//! - **Blocking**: the caller waits on its own slot and is woken exactly once,
//!   after the result has been written.
//! - **Non-blocking**: fire-and-forget, a callback on the consumer thread, or a
//!   [`PendingResult`] handle.
//!
//! ## Architecture
//!
//! - **[`request`]** - `Request`, `Event` and handler traits, `RequestKey` type tags
//! - **[`registry`]** - immutable handler registry and the `HandlerLookup` seam
//! - **[`ring`]** - envelope slots, the ring buffer, wait strategies
//! - **[`mediator`]** - the facade, publisher, event processor and lanes
//! - **[`config`]** - `MediatorConfig` from code, environment or YAML
//! - **[`error`]** - `DispatchError`, `RegistryError`, `ConfigError`
//! - **[`metrics`]** - per-lane counters
//! - **[`logging`]** - `tracing` subscriber setup for binaries
//!
//! ### Blocking Dispatch Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Caller
//!     participant Mediator
//!     participant Ring as RingBuffer
//!     participant Processor as EventProcessor<br/>(lane thread)
//!     participant Registry as HandlerLookup
//!     participant Handler
//!
//!     Caller->>Mediator: dispatch_blocking(request)
//!     Mediator->>Ring: claim_next()
//!     alt Ring full
//!         Ring-->>Caller: Capacity (Shed / Block timeout)
//!     end
//!     Mediator->>Ring: write envelope, publish(sequence)
//!     Ring->>Processor: available_batch(next)
//!     Processor->>Registry: lookup(RequestKey)
//!     alt NotFound / Ambiguous
//!         Processor->>Ring: store HandlerNotFound / AmbiguousHandler
//!     end
//!     Processor->>Handler: handle(request) under catch_unwind
//!     Handler-->>Processor: Ok(response) / Err / panic
//!     Processor->>Ring: store outcome, state = Completed
//!     Processor->>Caller: unpark
//!     Caller->>Ring: take outcome, state = Empty
//!     Ring-->>Caller: Result<Response, DispatchError>
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use brrtmediator::{Mediator, MediatorConfig, RegistryBuilder, Request};
//!
//! struct GetNextNumber(i64);
//! impl Request for GetNextNumber {
//!     type Response = i64;
//! }
//!
//! let registry = RegistryBuilder::new()
//!     .register_fn(|q: GetNextNumber| Ok(q.0 + 1))
//!     .build();
//! let mediator = Mediator::new(registry, MediatorConfig::default()).unwrap();
//!
//! assert_eq!(mediator.dispatch_blocking(GetNextNumber(41)).unwrap(), 42);
//! mediator.shutdown();
//! ```
//!
//! ## Configuration
//!
//! See [`config`] for the `BRRTM_*` environment variables and the YAML format.
//! Logging is configured separately through `BRRTM_LOG_*` (see [`logging`]).

pub mod config;
pub mod error;
pub mod ids;
pub mod logging;
pub mod mediator;
pub mod metrics;
pub mod registry;
pub mod request;
pub mod ring;

pub use config::{AsyncFailurePolicy, BackpressureMode, MediatorConfig};
pub use error::{ConfigError, DispatchError, RegistryError};
pub use ids::DispatchId;
pub use mediator::{DispatchOptions, Mediator, PendingResult};
pub use metrics::{LaneSnapshot, MediatorMetrics};
pub use registry::{HandlerLookup, HandlerRegistry, LookupError, RegistryBuilder};
pub use request::{Event, EventHandler, Request, RequestHandler, RequestKey};
pub use ring::WaitStrategy;
