//! # Request Module
//!
//! Typed message and handler traits.
//!
//! A [`Request`] names the result type it expects through its associated
//! `Response` type. Commands are simply requests whose response is `()`;
//! queries return a value. Exactly one [`RequestHandler`] serves a request type.
//!
//! An [`Event`] is a notification with zero or more [`EventHandler`]s, all of
//! which see the same event by reference.
//!
//! ```rust
//! use brrtmediator::request::Request;
//!
//! struct GetNextNumber(i64);
//!
//! impl Request for GetNextNumber {
//!     type Response = i64;
//! }
//!
//! let handler = |q: GetNextNumber| -> anyhow::Result<i64> { Ok(q.0 + 1) };
//! # let _ = handler;
//! ```

use std::any::{type_name, TypeId};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

/// A message that expects exactly one result of type `Response`.
pub trait Request: Send + 'static {
    /// Result type produced by this request's handler
    type Response: Send + 'static;
}

/// A notification delivered to every registered [`EventHandler`].
pub trait Event: Send + 'static {}

/// Produces the response for one request type.
///
/// Runs on a consumer thread. Returning `Err` (or panicking) is reported to a
/// waiting caller as [`DispatchError::HandlerFailure`](crate::DispatchError::HandlerFailure).
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    /// Handle a request and return its response
    fn handle(&self, request: R) -> anyhow::Result<R::Response>;
}

impl<R, F> RequestHandler<R> for F
where
    R: Request,
    F: Fn(R) -> anyhow::Result<R::Response> + Send + Sync + 'static,
{
    fn handle(&self, request: R) -> anyhow::Result<R::Response> {
        (self)(request)
    }
}

/// Reacts to one event type.
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    /// Handle an event
    fn handle(&self, event: &E) -> anyhow::Result<()>;
}

impl<E, F> EventHandler<E> for F
where
    E: Event,
    F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, event: &E) -> anyhow::Result<()> {
        (self)(event)
    }
}

/// Explicit runtime type tag for a request or event type.
///
/// Equality and hashing use the `TypeId` only; the name is kept for logs and errors.
#[derive(Debug, Clone, Copy)]
pub struct RequestKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl RequestKey {
    /// Key for the type `T`
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    /// Underlying `TypeId`
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Rust type name (diagnostics only, not unique)
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for RequestKey {}

impl Hash for RequestKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl Display for RequestKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Ping;
    impl Request for Ping {
        type Response = ();
    }

    struct Pong;
    impl Request for Pong {
        type Response = u32;
    }

    #[test]
    fn test_request_key_identity() {
        assert_eq!(RequestKey::of::<Ping>(), RequestKey::of::<Ping>());
        assert_ne!(RequestKey::of::<Ping>(), RequestKey::of::<Pong>());

        let mut keys = HashSet::new();
        keys.insert(RequestKey::of::<Ping>());
        keys.insert(RequestKey::of::<Ping>());
        keys.insert(RequestKey::of::<Pong>());
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_request_key_display_uses_type_name() {
        let key = RequestKey::of::<Pong>();
        assert!(key.to_string().ends_with("Pong"));
    }

    #[test]
    fn test_closure_is_request_handler() {
        let handler = |_: Pong| -> anyhow::Result<u32> { Ok(7) };
        assert_eq!(RequestHandler::handle(&handler, Pong).unwrap(), 7);
    }
}
