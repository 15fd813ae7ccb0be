//! `fetchx` is a composable HTTP client: a programmable middleware chain
//! around a pluggable round-trip transport, with retry, rate limiting, size
//! enforcement, structured request logging, streaming responses, and
//! cancellation-aware batched execution.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use fetchx::{CancellationToken, Client, Request, simple_retry_middleware};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct CreateItemResponse {
//!     id: String,
//! }
//!
//! # async fn demo() -> fetchx::Result<()> {
//! let client = Client::builder()
//!     .timeout(Duration::from_secs(5))
//!     .build()?;
//! client.use_middleware(simple_retry_middleware(3, Duration::from_millis(200)));
//!
//! let cancel = CancellationToken::new();
//! let request = Request::post("https://api.example.com/v1/items")
//!     .json(&serde_json::json!({ "name": "demo" }));
//! let response = client.execute(&cancel, &request).await?;
//! let created: CreateItemResponse = response.must_success().await?.json().await?;
//!
//! println!("created id={}", created.id);
//! # Ok(())
//! # }
//! ```
//!
//! # Middleware ordering
//!
//! Middlewares compose in registration order: the first registered is
//! outermost, seeing every request first and every response last. Each call
//! snapshots the registry, so mutating it never disturbs in-flight calls.

mod batch;
mod client;
mod core;
mod middleware;

pub(crate) use crate::core::cancel;
pub(crate) use crate::core::error;
pub(crate) use crate::core::request;
pub(crate) use crate::core::response;
pub(crate) use crate::core::transport;
pub(crate) use crate::core::util;
pub(crate) use crate::middleware::logging;
pub(crate) use crate::middleware::rate_limit;
pub(crate) use crate::middleware::retry;
pub(crate) use crate::middleware::size_limit;

pub use tokio_util::sync::CancellationToken;

pub use crate::batch::GroupOptions;
pub use crate::client::{Client, ClientBuilder, ExecuteOptions};
pub use crate::error::{Error, ErrorCode, SizeErrorKind, TransportErrorKind};
pub use crate::logging::{LogFormat, LogLevel, LoggingOptions, logging_middleware};
pub use crate::middleware::{
    Middleware, MiddlewareIdentifier, chain_middlewares, create_middleware,
};
pub use crate::rate_limit::{RateLimitOptions, rate_limit_middleware};
pub use crate::request::{PreparedRequest, Request};
pub use crate::response::{AsyncResult, Response, ResponseBody, drain_and_close};
pub use crate::retry::{
    ConstantDelay, ExponentialBackoff, RETRY_ATTEMPT_HEADER, RetryStrategy,
    exponential_retry_middleware, retry_middleware, simple_retry_middleware,
};
pub use crate::size_limit::{SizeConfig, size_limit_middleware};
pub use crate::transport::{
    HyperTransport, RoundTrip, RoundTripFuture, Transport, TransportConfig, TransportFn,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        AsyncResult, CancellationToken, Client, Error, ErrorCode, ExecuteOptions, GroupOptions,
        Request, Response, Result,
    };
}
