use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::error::{Error, SizeErrorKind};
use crate::middleware::{Middleware, create_middleware};
use crate::response::ResponseBody;
use crate::transport::RoundTrip;

const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

/// Size caps for request bodies, buffered response bodies, and streamed
/// response bodies. A zero value disables that dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeConfig {
    max_request_body: u64,
    max_response_body: u64,
    max_stream: u64,
}

impl SizeConfig {
    /// All dimensions disabled.
    pub const fn unlimited() -> Self {
        Self {
            max_request_body: 0,
            max_response_body: 0,
            max_stream: 0,
        }
    }

    pub const fn with_request_body_size(mut self, max_request_body: u64) -> Self {
        self.max_request_body = max_request_body;
        self
    }

    pub const fn with_response_body_size(mut self, max_response_body: u64) -> Self {
        self.max_response_body = max_response_body;
        self
    }

    pub const fn with_stream_size(mut self, max_stream: u64) -> Self {
        self.max_stream = max_stream;
        self
    }

    pub const fn max_request_body(&self) -> u64 {
        self.max_request_body
    }

    pub const fn max_response_body(&self) -> u64 {
        self.max_response_body
    }

    pub const fn max_stream(&self) -> u64 {
        self.max_stream
    }
}

impl Default for SizeConfig {
    fn default() -> Self {
        Self {
            max_request_body: DEFAULT_MAX_BODY_BYTES,
            max_response_body: DEFAULT_MAX_BODY_BYTES,
            max_stream: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Counts bytes delivered by the wrapped body and fails the read that pushes
/// the total past `max`. The size error travels through the reader as the io
/// error payload and is recovered by the response read paths.
struct SizeLimitedReader {
    inner: ResponseBody,
    max: u64,
    bytes_read: u64,
    kind: SizeErrorKind,
}

impl SizeLimitedReader {
    fn new(inner: ResponseBody, max: u64, kind: SizeErrorKind) -> Self {
        Self {
            inner,
            max,
            bytes_read: 0,
            kind,
        }
    }
}

impl AsyncRead for SizeLimitedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        context: &mut Context<'_>,
        buffer: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buffer.filled().len();
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(context, buffer) {
            Poll::Ready(Ok(())) => {
                let read = buffer.filled().len() - before;
                this.bytes_read += read as u64;
                if this.max > 0 && this.bytes_read > this.max {
                    return Poll::Ready(Err(std::io::Error::other(Error::Size {
                        kind: this.kind,
                        current: this.bytes_read,
                        max: this.max,
                    })));
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Middleware that rejects oversized request and response bodies.
///
/// Requests with a declared content length over the cap short-circuit before
/// the inner round-trip runs. Response bodies are guarded while streaming;
/// the effective response cap is `max_response_body` when set, otherwise
/// `max_stream`, and no cap applies when both are zero.
pub fn size_limit_middleware(config: SizeConfig) -> Middleware {
    create_middleware("size-limit", config, move |next: RoundTrip| {
        Arc::new(move |request| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                if config.max_request_body() > 0
                    && let Some(body) = request.body()
                {
                    let max = config.max_request_body();
                    if let Some(declared) = request.content_length()
                        && declared > max
                    {
                        return Err(Error::Size {
                            kind: SizeErrorKind::Request,
                            current: declared,
                            max,
                        });
                    }
                    let actual = body.len() as u64;
                    if actual > max {
                        return Err(Error::Size {
                            kind: SizeErrorKind::Request,
                            current: actual,
                            max,
                        });
                    }
                }

                let mut response = next(request).await?;

                if response.has_body()
                    && (config.max_response_body() > 0 || config.max_stream() > 0)
                {
                    let max = if config.max_response_body() > 0 {
                        config.max_response_body()
                    } else {
                        config.max_stream()
                    };
                    if let Some(declared) = response.content_length()
                        && declared > max
                    {
                        let _ = response.close();
                        return Err(Error::Size {
                            kind: SizeErrorKind::Response,
                            current: declared,
                            max,
                        });
                    }
                    if let Some(body) = response.take_body() {
                        response.set_body(ResponseBody::new(Box::pin(SizeLimitedReader::new(
                            body,
                            max,
                            SizeErrorKind::Response,
                        ))));
                    }
                }

                Ok(response)
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::{SizeConfig, size_limit_middleware};
    use crate::error::{Error, SizeErrorKind};
    use crate::request::Request;
    use crate::response::Response;
    use crate::transport::RoundTrip;

    fn counting_terminal(
        calls: &Arc<AtomicUsize>,
        body: &'static [u8],
        headers: Vec<(&'static str, &'static str)>,
    ) -> RoundTrip {
        let calls = Arc::clone(calls);
        Arc::new(move |_request| {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut header_map = HeaderMap::new();
            for (name, value) in &headers {
                header_map.insert(
                    http::header::HeaderName::from_static(name),
                    http::header::HeaderValue::from_static(value),
                );
            }
            let body = Bytes::from_static(body);
            Box::pin(async move { Ok(Response::from_bytes(StatusCode::OK, header_map, body)) })
        })
    }

    #[tokio::test]
    async fn oversized_request_short_circuits_before_the_transport() {
        let calls = Arc::new(AtomicUsize::new(0));
        let terminal = counting_terminal(&calls, b"", Vec::new());
        let chain = size_limit_middleware(
            SizeConfig::unlimited().with_request_body_size(10),
        )
        .wrap(terminal);

        let prepared = Request::post("https://api.example.com/upload")
            .body("01234567890123456789")
            .build()
            .expect("request should build");
        let error = chain(prepared).await.expect_err("20-byte body must fail");
        match error {
            Error::Size { kind, current, max } => {
                assert_eq!(kind, SizeErrorKind::Request);
                assert_eq!(current, 20);
                assert_eq!(max, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_under_the_cap_passes_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let terminal = counting_terminal(&calls, b"ok", Vec::new());
        let chain = size_limit_middleware(
            SizeConfig::unlimited().with_request_body_size(100),
        )
        .wrap(terminal);

        let prepared = Request::post("https://api.example.com/upload")
            .body("small")
            .build()
            .expect("request should build");
        let response = chain(prepared).await.expect("round trip should succeed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.bytes().await.expect("read body").as_ref(), b"ok");
    }

    #[tokio::test]
    async fn declared_response_length_over_the_cap_closes_the_body() {
        let calls = Arc::new(AtomicUsize::new(0));
        let terminal = counting_terminal(&calls, b"0123456789", vec![("content-length", "10")]);
        let chain = size_limit_middleware(
            SizeConfig::unlimited().with_response_body_size(5),
        )
        .wrap(terminal);

        let prepared = Request::get("https://api.example.com/data")
            .build()
            .expect("request should build");
        let error = chain(prepared)
            .await
            .expect_err("declared length over cap must fail");
        match error {
            Error::Size { kind, current, max } => {
                assert_eq!(kind, SizeErrorKind::Response);
                assert_eq!(current, 10);
                assert_eq!(max, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn streamed_response_over_the_cap_fails_mid_read() {
        let calls = Arc::new(AtomicUsize::new(0));
        let terminal = counting_terminal(&calls, b"0123456789", Vec::new());
        let chain = size_limit_middleware(
            SizeConfig::unlimited().with_response_body_size(5),
        )
        .wrap(terminal);

        let prepared = Request::get("https://api.example.com/data")
            .build()
            .expect("request should build");
        let response = chain(prepared).await.expect("headers should arrive");
        let error = response.bytes().await.expect_err("guard must trip");
        match error {
            Error::Size { kind, max, .. } => {
                assert_eq!(kind, SizeErrorKind::Response);
                assert_eq!(max, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stream_cap_applies_when_response_cap_is_zero() {
        let calls = Arc::new(AtomicUsize::new(0));
        let terminal = counting_terminal(&calls, b"0123456789", Vec::new());
        let chain =
            size_limit_middleware(SizeConfig::unlimited().with_stream_size(4)).wrap(terminal);

        let prepared = Request::get("https://api.example.com/data")
            .build()
            .expect("request should build");
        let response = chain(prepared).await.expect("headers should arrive");
        let error = response.bytes().await.expect_err("stream cap must trip");
        assert!(matches!(error, Error::Size { max: 4, .. }));
    }

    #[tokio::test]
    async fn all_zero_config_applies_no_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let terminal = counting_terminal(&calls, b"0123456789", Vec::new());
        let chain = size_limit_middleware(SizeConfig::unlimited()).wrap(terminal);

        let prepared = Request::post("https://api.example.com/upload")
            .body(vec![0u8; 1024])
            .build()
            .expect("request should build");
        let response = chain(prepared).await.expect("round trip should succeed");
        assert_eq!(
            response.bytes().await.expect("read body").len(),
            10
        );
    }
}
