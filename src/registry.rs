//! # Handler Registry Module
//!
//! Maps a request's runtime type to the single handler that serves it, and an
//! event's runtime type to every handler that listens for it.
//!
//! The registry is built once at startup through [`RegistryBuilder`] and is
//! immutable afterwards, so lookups on the consumer threads need no locking.
//! The dispatch engine only sees it through the [`HandlerLookup`] trait.
//!
//! ```rust
//! use brrtmediator::registry::{HandlerLookup, RegistryBuilder};
//! use brrtmediator::request::{Request, RequestKey};
//!
//! struct Double(u32);
//! impl Request for Double {
//!     type Response = u32;
//! }
//!
//! let registry = RegistryBuilder::new()
//!     .register_fn(|d: Double| Ok(d.0 * 2))
//!     .build();
//! assert!(registry.lookup(&RequestKey::of::<Double>()).is_ok());
//! ```

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, RegistryError};
use crate::request::{Event, EventHandler, Request, RequestHandler, RequestKey};

/// Type-erased request payload moved through the ring.
pub type AnyPayload = Box<dyn Any + Send>;

/// Type-erased request handler as stored in the registry.
pub trait ErasedRequestHandler: Send + Sync {
    /// Downcast the payload, run the handler, and box the response
    fn handle_erased(&self, request: AnyPayload) -> anyhow::Result<AnyPayload>;

    /// Concrete handler type name (diagnostics)
    fn handler_name(&self) -> &'static str;
}

/// Type-erased event handler as stored in the registry.
pub trait ErasedEventHandler: Send + Sync {
    /// Downcast the event and run the handler
    fn handle_erased(&self, event: &(dyn Any + Send)) -> anyhow::Result<()>;

    /// Concrete handler type name (diagnostics)
    fn handler_name(&self) -> &'static str;
}

struct TypedRequestHandler<R, H> {
    handler: H,
    _request: PhantomData<fn(R)>,
}

impl<R, H> ErasedRequestHandler for TypedRequestHandler<R, H>
where
    R: Request,
    H: RequestHandler<R>,
{
    fn handle_erased(&self, request: AnyPayload) -> anyhow::Result<AnyPayload> {
        let request = request.downcast::<R>().map_err(|_| {
            anyhow::anyhow!("payload is not a {} request", type_name::<R>())
        })?;
        let response = self.handler.handle(*request)?;
        Ok(Box::new(response))
    }

    fn handler_name(&self) -> &'static str {
        type_name::<H>()
    }
}

struct TypedEventHandler<E, H> {
    handler: H,
    _event: PhantomData<fn(E)>,
}

impl<E, H> ErasedEventHandler for TypedEventHandler<E, H>
where
    E: Event,
    H: EventHandler<E>,
{
    fn handle_erased(&self, event: &(dyn Any + Send)) -> anyhow::Result<()> {
        let event = event
            .downcast_ref::<E>()
            .ok_or_else(|| anyhow::anyhow!("payload is not a {} event", type_name::<E>()))?;
        self.handler.handle(event)
    }

    fn handler_name(&self) -> &'static str {
        type_name::<H>()
    }
}

/// Erase a typed request handler, e.g. for a custom [`HandlerLookup`].
pub fn erase_request_handler<R, H>(handler: H) -> Arc<dyn ErasedRequestHandler>
where
    R: Request,
    H: RequestHandler<R>,
{
    Arc::new(TypedRequestHandler {
        handler,
        _request: PhantomData,
    })
}

/// Erase a typed event handler, e.g. for a custom [`HandlerLookup`].
pub fn erase_event_handler<E, H>(handler: H) -> Arc<dyn ErasedEventHandler>
where
    E: Event,
    H: EventHandler<E>,
{
    Arc::new(TypedEventHandler {
        handler,
        _event: PhantomData,
    })
}

/// Why a request handler lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LookupError {
    /// Nothing registered for the type
    #[error("no handler registered")]
    NotFound,
    /// More than one handler registered for the type
    #[error("{count} handlers registered")]
    Ambiguous {
        /// Number of handlers found
        count: usize,
    },
}

impl LookupError {
    /// Convert into the dispatch outcome reported to the caller
    #[must_use]
    pub fn into_dispatch_error(self, key: &RequestKey) -> DispatchError {
        match self {
            LookupError::NotFound => DispatchError::HandlerNotFound {
                request_type: key.type_name(),
            },
            LookupError::Ambiguous { count } => DispatchError::AmbiguousHandler {
                request_type: key.type_name(),
                count,
            },
        }
    }
}

/// Read-only handler resolution used by the consumer threads.
///
/// Lookups run concurrently from every lane and must be pure functions of the key.
pub trait HandlerLookup: Send + Sync {
    /// Resolve the single handler for a request type
    fn lookup(&self, key: &RequestKey) -> Result<&dyn ErasedRequestHandler, LookupError>;

    /// All handlers for an event type (possibly empty)
    fn event_handlers(&self, key: &RequestKey) -> &[Arc<dyn ErasedEventHandler>];
}

type RequestHandlers = SmallVec<[Arc<dyn ErasedRequestHandler>; 1]>;
type EventHandlers = SmallVec<[Arc<dyn ErasedEventHandler>; 4]>;

/// Immutable mapping from request/event type to handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    requests: HashMap<RequestKey, RequestHandlers>,
    events: HashMap<RequestKey, EventHandlers>,
}

impl HandlerRegistry {
    /// Start building a registry
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Number of request types with at least one handler
    #[must_use]
    pub fn request_type_count(&self) -> usize {
        self.requests.len()
    }

    /// Number of event types with at least one handler
    #[must_use]
    pub fn event_type_count(&self) -> usize {
        self.events.len()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("request_types", &self.requests.keys().collect::<Vec<_>>())
            .field("event_types", &self.events.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerLookup for HandlerRegistry {
    fn lookup(&self, key: &RequestKey) -> Result<&dyn ErasedRequestHandler, LookupError> {
        match self.requests.get(key).map(|handlers| handlers.as_slice()) {
            None | Some([]) => Err(LookupError::NotFound),
            Some([handler]) => Ok(handler.as_ref()),
            Some(handlers) => Err(LookupError::Ambiguous {
                count: handlers.len(),
            }),
        }
    }

    fn event_handlers(&self, key: &RequestKey) -> &[Arc<dyn ErasedEventHandler>] {
        self.events
            .get(key)
            .map(|handlers| handlers.as_slice())
            .unwrap_or(&[])
    }
}

/// Explicit, one-shot registration of handlers.
///
/// # Example
///
/// ```rust
/// use brrtmediator::registry::RegistryBuilder;
/// use brrtmediator::request::{Event, Request};
///
/// struct Increment;
/// impl Request for Increment {
///     type Response = ();
/// }
///
/// struct Incremented;
/// impl Event for Incremented {}
///
/// let registry = RegistryBuilder::new()
///     .register_fn(|_: Increment| Ok(()))
///     .register_event_fn(|_: &Incremented| Ok(()))
///     .register_event_fn(|_: &Incremented| Ok(()))
///     .build();
/// assert_eq!(registry.request_type_count(), 1);
/// ```
#[derive(Default)]
pub struct RegistryBuilder {
    requests: HashMap<RequestKey, RequestHandlers>,
    events: HashMap<RequestKey, EventHandlers>,
    duplicates: Vec<&'static str>,
}

impl RegistryBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for request type `R`
    ///
    /// Registering a second handler for the same type is recorded; [`build`](Self::build)
    /// keeps both so lookups report [`LookupError::Ambiguous`], while
    /// [`try_build`](Self::try_build) rejects the registry.
    #[must_use]
    pub fn register<R, H>(self, handler: H) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        self.register_erased(RequestKey::of::<R>(), erase_request_handler::<R, H>(handler))
    }

    /// Register a closure as the handler for the request type it accepts
    #[must_use]
    pub fn register_fn<R, F>(self, handler: F) -> Self
    where
        R: Request,
        F: Fn(R) -> anyhow::Result<R::Response> + Send + Sync + 'static,
    {
        self.register::<R, F>(handler)
    }

    /// Register an already-erased handler under an explicit key
    #[must_use]
    pub fn register_erased(mut self, key: RequestKey, handler: Arc<dyn ErasedRequestHandler>) -> Self {
        debug!(
            request_type = %key,
            handler = handler.handler_name(),
            "Registering request handler"
        );
        let handlers = self.requests.entry(key).or_default();
        if !handlers.is_empty() {
            warn!(
                request_type = %key,
                handler = handler.handler_name(),
                existing = handlers.len(),
                "Request type already has a registered handler - lookups will be ambiguous"
            );
            self.duplicates.push(key.type_name());
        }
        handlers.push(handler);
        self
    }

    /// Add a listener for event type `E`
    #[must_use]
    pub fn register_event<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        let key = RequestKey::of::<E>();
        let handler = erase_event_handler::<E, H>(handler);
        debug!(
            event_type = %key,
            handler = handler.handler_name(),
            "Registering event handler"
        );
        self.events.entry(key).or_default().push(handler);
        self
    }

    /// Add a closure listener for the event type it accepts
    #[must_use]
    pub fn register_event_fn<E, F>(self, handler: F) -> Self
    where
        E: Event,
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_event::<E, F>(handler)
    }

    /// Freeze the registry, keeping duplicate registrations
    #[must_use]
    pub fn build(self) -> HandlerRegistry {
        info!(
            request_types = self.requests.len(),
            event_types = self.events.len(),
            duplicate_registrations = self.duplicates.len(),
            "Handler registry built"
        );
        HandlerRegistry {
            requests: self.requests,
            events: self.events,
        }
    }

    /// Freeze the registry, failing on the first request type with two handlers
    pub fn try_build(self) -> Result<HandlerRegistry, RegistryError> {
        if let Some(&request_type) = self.duplicates.first() {
            return Err(RegistryError::DuplicateHandler { request_type });
        }
        Ok(self.build())
    }
}
