use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyDataStream, BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio_util::io::StreamReader;

use crate::error::{Error, TransportErrorKind};
use crate::request::PreparedRequest;
use crate::response::{Response, ResponseBody};

/// One round-trip in flight: resolves to a response or a transport error.
pub type RoundTripFuture = Pin<Box<dyn Future<Output = crate::Result<Response>> + Send>>;

/// The universal round-trip primitive: send one prepared request, receive
/// response headers plus a streamable body. Every transport, middleware, and
/// composed chain has this shape.
pub type RoundTrip = Arc<dyn Fn(PreparedRequest) -> RoundTripFuture + Send + Sync>;

/// A terminal transport at the bottom of a middleware chain.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: PreparedRequest) -> crate::Result<Response>;
}

/// Adapter to use an ordinary closure as a [`Transport`].
pub struct TransportFn<F>(F);

impl<F> TransportFn<F>
where
    F: Fn(PreparedRequest) -> RoundTripFuture + Send + Sync,
{
    pub fn new(round_trip: F) -> Self {
        Self(round_trip)
    }
}

#[async_trait]
impl<F> Transport for TransportFn<F>
where
    F: Fn(PreparedRequest) -> RoundTripFuture + Send + Sync,
{
    async fn round_trip(&self, request: PreparedRequest) -> crate::Result<Response> {
        (self.0)(request).await
    }
}

pub(crate) fn terminal_round_trip(transport: Arc<dyn Transport>) -> RoundTrip {
    Arc::new(move |request| {
        let transport = Arc::clone(&transport);
        Box::pin(async move { transport.round_trip(request).await })
    })
}

const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Connection-pool knobs for the built-in hyper transport.
#[derive(Clone, Copy, Debug)]
pub struct TransportConfig {
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
}

impl TransportConfig {
    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }
}

type TerminalBody = BoxBody<Bytes, Infallible>;

/// The default terminal transport: pooled hyper client with rustls, HTTP/1.1
/// and HTTP/2 over TLS or plain TCP.
pub struct HyperTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, TerminalBody>,
}

impl HyperTransport {
    pub fn new() -> crate::Result<Self> {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> crate::Result<Self> {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build(connector);
        Ok(Self { client })
    }
}

fn terminal_body(request: &PreparedRequest) -> TerminalBody {
    match request.body() {
        None => Empty::<Bytes>::new().boxed(),
        // An unknown size hint makes hyper emit chunked transfer encoding.
        Some(bytes) if request.is_chunked() => {
            let frames = futures_util::stream::iter(vec![Ok::<_, Infallible>(Frame::data(
                bytes.clone(),
            ))]);
            BodyExt::boxed(StreamBody::new(frames))
        }
        Some(bytes) => Full::new(bytes.clone()).boxed(),
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn round_trip(&self, request: PreparedRequest) -> crate::Result<Response> {
        let method = request.method().clone();
        let url = request.url().to_owned();
        let cancel = request.cancel_token().clone();

        let mut http_request = http::Request::builder()
            .method(method.clone())
            .uri(request.uri().clone())
            .body(terminal_body(&request))
            .map_err(|source| Error::build_with("failed to assemble http request", source))?;
        *http_request.headers_mut() = request.headers().clone();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.client.request(http_request) => result.map_err(|source| {
                let kind = classify_transport_error(&source);
                Error::Transport {
                    kind,
                    message: format!("{method} {url} failed"),
                    source: Box::new(source),
                }
            })?,
        };

        let (parts, incoming) = response.into_parts();
        let data_stream =
            BodyDataStream::new(incoming).map(|item| item.map_err(std::io::Error::other));
        let body = ResponseBody::new(Box::pin(StreamReader::new(data_stream)));
        Ok(Response::new(parts.status, parts.headers, body).with_uri(url))
    }
}

fn classify_transport_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    let mut text = error.to_string().to_ascii_lowercase();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        text.push(' ');
        text.push_str(&cause.to_string().to_ascii_lowercase());
        source = cause.source();
    }
    classify_transport_error_text(&text, error.is_connect())
}

fn classify_transport_error_text(text: &str, is_connect_path: bool) -> TransportErrorKind {
    const DNS_MARKERS: &[&str] = &[
        "name or service not known",
        "failed to lookup address",
        "no such host",
        "temporary failure in name resolution",
        "dns lookup failed",
    ];
    const TLS_MARKERS: &[&str] = &[
        "tls handshake",
        "certificate verify",
        "invalid certificate",
        "self signed certificate",
        "x509",
        "pkix",
        "peer certificate",
    ];
    const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "deadline has elapsed"];
    const CONNECT_MARKERS: &[&str] = &[
        "connection refused",
        "connection aborted",
        "not connected",
        "network unreachable",
        "host unreachable",
        "connect error",
    ];
    const READ_MARKERS: &[&str] = &[
        "connection reset",
        "broken pipe",
        "unexpected eof",
        "incomplete message",
        "connection closed before message completed",
        "body write aborted",
    ];

    if contains_marker(text, DNS_MARKERS) || contains_word(text, "dns") {
        return TransportErrorKind::Dns;
    }
    if contains_marker(text, TLS_MARKERS)
        || contains_word(text, "tls")
        || contains_word(text, "ssl")
        || contains_word(text, "certificate")
    {
        return TransportErrorKind::Tls;
    }
    if contains_marker(text, TIMEOUT_MARKERS) {
        return TransportErrorKind::Timeout;
    }
    if contains_marker(text, CONNECT_MARKERS) {
        return TransportErrorKind::Connect;
    }
    if contains_marker(text, READ_MARKERS) {
        return TransportErrorKind::Read;
    }
    if is_connect_path {
        return TransportErrorKind::Connect;
    }
    TransportErrorKind::Other
}

fn contains_marker(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| text.contains(marker))
}

fn contains_word(text: &str, word: &str) -> bool {
    text.split(|character: char| !character.is_ascii_alphanumeric())
        .any(|token| token == word)
}
