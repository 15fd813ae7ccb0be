use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel::{deadline_token, effective_timeout};
use crate::error::Error;
use crate::middleware::{Middleware, chain_middlewares};
use crate::request::Request;
use crate::response::Response;
use crate::size_limit::SizeConfig;
use crate::transport::{HyperTransport, RoundTrip, Transport, terminal_round_trip};
use crate::util::{read_unpoisoned, write_unpoisoned};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call execution options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecuteOptions {
    pub(crate) stream: bool,
    pub(crate) timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the response with its body un-consumed; the caller owns the
    /// release.
    pub const fn stream(mut self) -> Self {
        self.stream = true;
        self
    }

    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    middlewares: RwLock<Vec<Middleware>>,
    timeout: Duration,
    auto_buffer: bool,
    size_config: SizeConfig,
}

/// Configurable HTTP client: a terminal transport plus an ordered middleware
/// registry composed into a round-trip chain per call.
///
/// Cloning is cheap and shares the registry. Registry mutations apply to
/// subsequent calls only; every call snapshots the chain under a read lock,
/// so in-flight calls are unaffected.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    middlewares: Vec<Middleware>,
    timeout: Duration,
    auto_buffer: bool,
    size_config: SizeConfig,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            transport: None,
            middlewares: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            auto_buffer: true,
            size_config: SizeConfig::default(),
        }
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Client-wide timeout applied to every call; zero disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether non-streaming responses are fully read into memory before
    /// being returned. Enabled by default.
    pub fn auto_buffer(mut self, auto_buffer: bool) -> Self {
        self.auto_buffer = auto_buffer;
        self
    }

    pub fn size_config(mut self, size_config: SizeConfig) -> Self {
        self.size_config = size_config;
        self
    }

    pub fn build(self) -> crate::Result<Client> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new()?),
        };
        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                middlewares: RwLock::new(self.middlewares),
                timeout: self.timeout,
                auto_buffer: self.auto_buffer,
                size_config: self.size_config,
            }),
        })
    }
}

impl Client {
    /// Client over the built-in hyper transport with default settings:
    /// 30-second timeout, auto-buffering enabled.
    pub fn new() -> crate::Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn size_config(&self) -> SizeConfig {
        self.inner.size_config
    }

    /// Appends a middleware to the registry. Returns the client for
    /// chaining.
    pub fn use_middleware(&self, middleware: Middleware) -> &Self {
        write_unpoisoned(&self.inner.middlewares).push(middleware);
        self
    }

    /// Replaces the first middleware with the same name in place, or appends
    /// when no middleware has that name.
    pub fn update_middleware(&self, middleware: Middleware) {
        let mut middlewares = write_unpoisoned(&self.inner.middlewares);
        match middlewares
            .iter()
            .position(|existing| existing.name() == middleware.name())
        {
            Some(index) => middlewares[index] = middleware,
            None => middlewares.push(middleware),
        }
    }

    /// Removes every middleware registered under `name`.
    pub fn remove_middleware(&self, name: &str) {
        write_unpoisoned(&self.inner.middlewares).retain(|middleware| middleware.name() != name);
    }

    /// Independent copy of the registry; mutating it does not affect the
    /// client.
    pub fn middlewares(&self) -> Vec<Middleware> {
        read_unpoisoned(&self.inner.middlewares).clone()
    }

    fn composed_round_trip(&self) -> RoundTrip {
        let middlewares = read_unpoisoned(&self.inner.middlewares).clone();
        chain_middlewares(
            terminal_round_trip(Arc::clone(&self.inner.transport)),
            &middlewares,
        )
    }

    /// Builds and submits `request` through the middleware chain.
    ///
    /// The passed token supersedes any token attached to the request; a
    /// per-call timeout derives a child token with that deadline. Unless
    /// streaming was requested, an auto-buffering client drains the body into
    /// memory and releases the original before returning.
    pub async fn execute_with_options(
        &self,
        cancel: &CancellationToken,
        request: &Request,
        options: ExecuteOptions,
    ) -> crate::Result<Response> {
        let mut prepared = request.build()?;
        debug!(method = %prepared.method(), url = prepared.url(), "executing request");

        let timeout = effective_timeout(self.inner.timeout, options.timeout);
        let call_token = match timeout {
            Some(duration) => deadline_token(cancel, duration),
            None => cancel.clone(),
        };
        prepared.set_cancel_token(call_token.clone());

        let round_trip = self.composed_round_trip();
        let call = round_trip(prepared);
        let outcome = match timeout {
            Some(duration) => match tokio::time::timeout(duration, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    call_token.cancel();
                    Err(Error::DeadlineExceeded {
                        timeout_ms: duration.as_millis(),
                    })
                }
            },
            None => call.await,
        };

        // Reap the deadline watcher; the call is settled either way.
        if timeout.is_some() {
            call_token.cancel();
        }

        let response = match outcome {
            // The deadline watcher fired, not the caller: report the
            // deadline rather than a bare cancellation.
            Err(Error::Cancelled) if timeout.is_some() && !cancel.is_cancelled() => {
                return Err(Error::DeadlineExceeded {
                    timeout_ms: timeout.unwrap_or_default().as_millis(),
                });
            }
            other => other?,
        };

        if options.stream {
            return Ok(response);
        }
        if self.inner.auto_buffer {
            return response.into_buffered().await;
        }
        Ok(response)
    }

    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &Request,
    ) -> crate::Result<Response> {
        self.execute_with_options(cancel, request, ExecuteOptions::default())
            .await
    }

    /// Like `execute` but returns the response with its body un-consumed.
    pub async fn execute_stream(
        &self,
        cancel: &CancellationToken,
        request: &Request,
    ) -> crate::Result<Response> {
        self.execute_with_options(cancel, request, ExecuteOptions::new().stream())
            .await
    }

    pub async fn execute_with_timeout(
        &self,
        cancel: &CancellationToken,
        request: &Request,
        timeout: Duration,
    ) -> crate::Result<Response> {
        self.execute_with_options(cancel, request, ExecuteOptions::new().timeout(timeout))
            .await
    }

    pub async fn get(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: &[(&str, &str)],
    ) -> crate::Result<Response> {
        self.execute(cancel, &Request::get(url).headers(headers.iter().copied()))
            .await
    }

    pub async fn post(
        &self,
        cancel: &CancellationToken,
        url: &str,
        body: impl Into<Bytes>,
        headers: &[(&str, &str)],
    ) -> crate::Result<Response> {
        self.execute(
            cancel,
            &Request::post(url)
                .body(body)
                .headers(headers.iter().copied()),
        )
        .await
    }

    pub async fn put(
        &self,
        cancel: &CancellationToken,
        url: &str,
        body: impl Into<Bytes>,
        headers: &[(&str, &str)],
    ) -> crate::Result<Response> {
        self.execute(
            cancel,
            &Request::put(url)
                .body(body)
                .headers(headers.iter().copied()),
        )
        .await
    }

    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: &[(&str, &str)],
    ) -> crate::Result<Response> {
        self.execute(
            cancel,
            &Request::delete(url).headers(headers.iter().copied()),
        )
        .await
    }

    pub async fn patch(
        &self,
        cancel: &CancellationToken,
        url: &str,
        body: impl Into<Bytes>,
        headers: &[(&str, &str)],
    ) -> crate::Result<Response> {
        self.execute(
            cancel,
            &Request::patch(url)
                .body(body)
                .headers(headers.iter().copied()),
        )
        .await
    }

    pub async fn head(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: &[(&str, &str)],
    ) -> crate::Result<Response> {
        self.execute(cancel, &Request::head(url).headers(headers.iter().copied()))
            .await
    }

    pub async fn options(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: &[(&str, &str)],
    ) -> crate::Result<Response> {
        self.execute(
            cancel,
            &Request::new(http::Method::OPTIONS, url).headers(headers.iter().copied()),
        )
        .await
    }

    pub async fn trace(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: &[(&str, &str)],
    ) -> crate::Result<Response> {
        self.execute(
            cancel,
            &Request::new(http::Method::TRACE, url).headers(headers.iter().copied()),
        )
        .await
    }

    pub async fn post_json<T>(
        &self,
        cancel: &CancellationToken,
        url: &str,
        payload: &T,
        headers: &[(&str, &str)],
    ) -> crate::Result<Response>
    where
        T: Serialize + ?Sized,
    {
        self.execute(
            cancel,
            &Request::post(url)
                .json(payload)
                .headers(headers.iter().copied()),
        )
        .await
    }

    pub async fn put_json<T>(
        &self,
        cancel: &CancellationToken,
        url: &str,
        payload: &T,
        headers: &[(&str, &str)],
    ) -> crate::Result<Response>
    where
        T: Serialize + ?Sized,
    {
        self.execute(
            cancel,
            &Request::put(url)
                .json(payload)
                .headers(headers.iter().copied()),
        )
        .await
    }

    pub async fn patch_json<T>(
        &self,
        cancel: &CancellationToken,
        url: &str,
        payload: &T,
        headers: &[(&str, &str)],
    ) -> crate::Result<Response>
    where
        T: Serialize + ?Sized,
    {
        self.execute(
            cancel,
            &Request::patch(url)
                .json(payload)
                .headers(headers.iter().copied()),
        )
        .await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("timeout", &self.inner.timeout)
            .field("auto_buffer", &self.inner.auto_buffer)
            .field(
                "middlewares",
                &read_unpoisoned(&self.inner.middlewares).len(),
            )
            .finish()
    }
}
