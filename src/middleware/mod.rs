pub(crate) mod logging;
pub(crate) mod rate_limit;
pub(crate) mod retry;
pub(crate) mod size_limit;

use std::any::Any;
use std::sync::Arc;

use crate::transport::RoundTrip;

/// Registry metadata for a middleware: a name used for lookups plus the
/// opaque options it was constructed with.
#[derive(Clone)]
pub struct MiddlewareIdentifier {
    name: String,
    options: Arc<dyn Any + Send + Sync>,
}

impl MiddlewareIdentifier {
    pub fn new(name: impl Into<String>, options: impl Any + Send + Sync) -> Self {
        Self {
            name: name.into(),
            options: Arc::new(options),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Recovers the options for introspection when the concrete type is
    /// known.
    pub fn options<T: 'static>(&self) -> Option<&T> {
        self.options.downcast_ref()
    }
}

impl std::fmt::Debug for MiddlewareIdentifier {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MiddlewareIdentifier")
            .field("name", &self.name)
            .finish()
    }
}

type Wrapper = Arc<dyn Fn(RoundTrip) -> RoundTrip + Send + Sync>;

/// A round-trip transformer with registry metadata. Given the inner
/// round-trip, [`Middleware::wrap`] yields the outer one.
#[derive(Clone)]
pub struct Middleware {
    identifier: MiddlewareIdentifier,
    wrapper: Wrapper,
}

impl Middleware {
    pub fn identifier(&self) -> &MiddlewareIdentifier {
        &self.identifier
    }

    pub fn name(&self) -> &str {
        self.identifier.name()
    }

    pub fn wrap(&self, next: RoundTrip) -> RoundTrip {
        (self.wrapper)(next)
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Middleware")
            .field("name", &self.identifier.name)
            .finish()
    }
}

/// Builds a middleware from a name, opaque options, and a round-trip
/// transformer.
pub fn create_middleware<F>(
    name: impl Into<String>,
    options: impl Any + Send + Sync,
    wrapper: F,
) -> Middleware
where
    F: Fn(RoundTrip) -> RoundTrip + Send + Sync + 'static,
{
    Middleware {
        identifier: MiddlewareIdentifier::new(name, options),
        wrapper: Arc::new(wrapper),
    }
}

/// Composes an ordered middleware list around a terminal round-trip. The
/// first middleware is outermost: it sees the request first and the response
/// last.
pub fn chain_middlewares(terminal: RoundTrip, middlewares: &[Middleware]) -> RoundTrip {
    let mut wrapped = terminal;
    for middleware in middlewares.iter().rev() {
        wrapped = middleware.wrap(wrapped);
    }
    wrapped
}
