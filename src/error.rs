//! # Error Module
//!
//! Error taxonomy for dispatch, registry construction, and configuration.
//!
//! ## Propagation
//!
//! - **Producer side** (`Capacity`, `Shutdown`): returned synchronously from the
//!   dispatch call that tried to claim a ring slot.
//! - **Consumer side** (`HandlerNotFound`, `AmbiguousHandler`, `HandlerFailure`):
//!   captured per slot on the consumer thread and only surfaced to a caller that
//!   is waiting on that slot (blocking dispatch, callback, or pending handle).
//! - **Waiter side** (`Timeout`): the caller stopped waiting; the request is still
//!   processed to completion.

use std::time::Duration;

use thiserror::Error;

/// Failure outcome of a dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler is registered for the request type.
    #[error("no handler registered for request type {request_type}")]
    HandlerNotFound {
        /// Rust type name of the request
        request_type: &'static str,
    },

    /// More than one handler is registered for the request type.
    #[error("{count} handlers registered for request type {request_type}; expected exactly one")]
    AmbiguousHandler {
        /// Rust type name of the request
        request_type: &'static str,
        /// Number of handlers found
        count: usize,
    },

    /// The handler returned an error or panicked while producing the result.
    #[error("handler for {request_type} failed: {source}")]
    HandlerFailure {
        /// Rust type name of the request
        request_type: &'static str,
        /// Error raised by the handler
        #[source]
        source: anyhow::Error,
    },

    /// The caller's wait for completion exceeded its bound.
    #[error("timed out after {waited:?} waiting for {request_type}")]
    Timeout {
        /// Rust type name of the request
        request_type: &'static str,
        /// How long the caller waited
        waited: Duration,
    },

    /// No ring slot could be claimed under the configured backpressure policy.
    #[error("ring buffer full (capacity {capacity})")]
    Capacity {
        /// Ring capacity of the lane that rejected the submission
        capacity: usize,
    },

    /// The mediator has been shut down and accepts no new submissions.
    #[error("mediator is shut down")]
    Shutdown,

    /// A blocking dispatch was made from the consumer thread of the lane it
    /// targets. That thread is the only one that could process it.
    #[error("blocking dispatch of {request_type} from lane {lane}'s own consumer thread")]
    ReentrantDispatch {
        /// Rust type name of the request
        request_type: &'static str,
        /// Lane both the caller and the request belong to
        lane: usize,
    },
}

impl DispatchError {
    /// Whether retrying the same dispatch later may succeed.
    ///
    /// `Capacity` resolves once consumers catch up; `Timeout` only means the
    /// caller gave up. Lookup failures are configuration errors.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Capacity { .. } | Self::Timeout { .. })
    }

    pub(crate) fn handler_panicked(request_type: &'static str, message: &str) -> Self {
        Self::HandlerFailure {
            request_type,
            source: anyhow::anyhow!("handler panicked: {message}"),
        }
    }

    pub(crate) fn lookup_panicked(request_type: &'static str, message: &str) -> Self {
        Self::HandlerFailure {
            request_type,
            source: anyhow::anyhow!("handler lookup panicked: {message}"),
        }
    }
}

/// Error returned by [`RegistryBuilder::try_build`](crate::registry::RegistryBuilder::try_build).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A second handler was registered for a request type.
    #[error("{request_type} already has a registered handler; each request type must have a single handler")]
    DuplicateHandler {
        /// Rust type name of the request
        request_type: &'static str,
    },
}

/// Invalid or unreadable mediator configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Ring capacity must be a positive integer.
    #[error("ring capacity must be positive, got {0}")]
    InvalidCapacity(usize),

    /// At least one consumer thread is required.
    #[error("consumer thread count must be positive, got {0}")]
    InvalidConsumerThreads(usize),

    /// A textual option could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Option name
        key: &'static str,
        /// Offending value
        value: String,
    },

    /// Reading a configuration file failed.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration file was not valid YAML for [`MediatorConfig`](crate::config::MediatorConfig).
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A consumer thread could not be spawned.
    #[error("failed to spawn consumer thread for lane {lane}: {source}")]
    Spawn {
        /// Lane index
        lane: usize,
        /// OS error
        #[source]
        source: std::io::Error,
    },
}
