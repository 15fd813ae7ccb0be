use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use tracing::debug;

use crate::error::Error;
use crate::middleware::{Middleware, create_middleware};
use crate::request::PreparedRequest;
use crate::response::{Response, drain_and_close};
use crate::transport::RoundTrip;

/// Diagnostic header set on every retried attempt; the value is the retry
/// number, starting at 1.
pub const RETRY_ATTEMPT_HEADER: &str = "x-retry-attempt";

/// Decides whether and when a round-trip is re-executed.
///
/// `attempt` is zero-based for `should_retry` (the attempt that just
/// finished) and one-based for `next_delay` (the attempt about to run).
pub trait RetryStrategy: Send + Sync {
    fn should_retry(&self, attempt: usize, response: Option<&Response>, error: Option<&Error>)
    -> bool;

    fn next_delay(
        &self,
        attempt: usize,
        response: Option<&Response>,
        error: Option<&Error>,
    ) -> Duration;
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408_u16, 429, 500, 502, 503, 504].into_iter().collect()
}

fn is_network_error(error: &Error) -> bool {
    matches!(error, Error::Transport { .. })
}

fn status_is_retryable(retryable_statuses: &BTreeSet<u16>, response: &Response) -> bool {
    retryable_statuses.contains(&response.status().as_u16())
}

/// Constant delay between attempts. Retries network errors and the
/// configured status codes.
#[derive(Clone, Debug)]
pub struct ConstantDelay {
    delay: Duration,
    max_attempts: usize,
    retryable_statuses: BTreeSet<u16>,
}

impl ConstantDelay {
    pub fn new(delay: Duration, max_attempts: usize) -> Self {
        Self {
            delay,
            max_attempts,
            retryable_statuses: default_retryable_status_codes(),
        }
    }

    pub fn retryable_statuses(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = codes.into_iter().collect();
        self
    }
}

impl RetryStrategy for ConstantDelay {
    fn should_retry(
        &self,
        attempt: usize,
        response: Option<&Response>,
        error: Option<&Error>,
    ) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        if let Some(error) = error {
            return is_network_error(error);
        }
        response.is_some_and(|response| status_is_retryable(&self.retryable_statuses, response))
    }

    fn next_delay(
        &self,
        _attempt: usize,
        _response: Option<&Response>,
        _error: Option<&Error>,
    ) -> Duration {
        self.delay
    }
}

/// Exponential backoff: the delay before attempt `n` is
/// `initial · 2^n · factor`, clamped at `max_delay`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
    max_attempts: usize,
    retryable_statuses: BTreeSet<u16>,
}

impl ExponentialBackoff {
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        factor: f64,
        max_attempts: usize,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor,
            max_attempts,
            retryable_statuses: default_retryable_status_codes(),
        }
    }

    pub fn retryable_statuses(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = codes.into_iter().collect();
        self
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn should_retry(
        &self,
        attempt: usize,
        response: Option<&Response>,
        error: Option<&Error>,
    ) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        if let Some(error) = error {
            return is_network_error(error);
        }
        let Some(response) = response else {
            return false;
        };
        if status_is_retryable(&self.retryable_statuses, response) {
            return true;
        }
        // 429 is additionally retryable when the server says when to come back.
        response.status().as_u16() == 429 && response.headers().contains_key(RETRY_AFTER)
    }

    fn next_delay(
        &self,
        attempt: usize,
        _response: Option<&Response>,
        _error: Option<&Error>,
    ) -> Duration {
        let multiplier = ((1_u128 << attempt.min(31)) as f64) * self.factor;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return self.initial_delay.min(self.max_delay);
        }
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

async fn retry_round_trip(
    strategy: Arc<dyn RetryStrategy>,
    next: RoundTrip,
    request: PreparedRequest,
) -> crate::Result<Response> {
    let replay_body = request.body().cloned();
    let cancel = request.cancel_token().clone();
    let mut attempt = 0_usize;
    let mut outcome;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut attempt_request = request.clone();
        attempt_request.set_body(replay_body.clone());
        if attempt > 0 {
            attempt_request.headers_mut().insert(
                HeaderName::from_static(RETRY_ATTEMPT_HEADER),
                HeaderValue::from(attempt),
            );
        }

        outcome = next(attempt_request).await;

        let should_retry = match &outcome {
            Ok(response) => strategy.should_retry(attempt, Some(response), None),
            Err(error) => strategy.should_retry(attempt, None, Some(error)),
        };
        if !should_retry {
            break;
        }

        let delay = match &outcome {
            Ok(response) => strategy.next_delay(attempt + 1, Some(response), None),
            Err(error) => strategy.next_delay(attempt + 1, None, Some(error)),
        };
        if let Ok(response) = outcome {
            drain_and_close(response).await;
        }
        attempt += 1;
        debug!(attempt, delay_ms = delay.as_millis() as u64, url = request.url(), "retrying request");

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    match outcome {
        Ok(response) => Ok(response),
        Err(error) => {
            let error = if error.is_timeout() {
                Error::Timeout {
                    source: Box::new(error),
                }
            } else {
                error
            };
            Err(Error::RetryExhausted {
                attempts: attempt + 1,
                source: Box::new(error),
            })
        }
    }
}

/// Middleware that re-executes the inner round-trip under `strategy`.
///
/// The request body is copied into a replay buffer once per call and rebound
/// for every attempt; intermediate responses are drained so exactly one
/// response object ever reaches the caller.
pub fn retry_middleware(strategy: impl RetryStrategy + 'static) -> Middleware {
    let strategy: Arc<dyn RetryStrategy> = Arc::new(strategy);
    create_middleware("retry", Arc::clone(&strategy), move |next: RoundTrip| {
        let strategy = Arc::clone(&strategy);
        Arc::new(move |request| {
            let strategy = Arc::clone(&strategy);
            let next = Arc::clone(&next);
            Box::pin(async move { retry_round_trip(strategy, next, request).await })
        })
    })
}

/// Retry with a constant delay between attempts.
pub fn simple_retry_middleware(max_attempts: usize, delay: Duration) -> Middleware {
    retry_middleware(ConstantDelay::new(delay, max_attempts))
}

/// Retry with exponential backoff.
pub fn exponential_retry_middleware(
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
) -> Middleware {
    retry_middleware(ExponentialBackoff::new(
        initial_delay,
        max_delay,
        factor,
        max_attempts,
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::{ConstantDelay, ExponentialBackoff, RetryStrategy};
    use crate::error::{Error, TransportErrorKind};
    use crate::response::Response;

    fn response_with_status(status: StatusCode) -> Response {
        Response::from_bytes(status, HeaderMap::new(), Bytes::new())
    }

    fn network_error() -> Error {
        Error::Transport {
            kind: TransportErrorKind::Connect,
            message: "connection refused".to_owned(),
            source: "connection refused".into(),
        }
    }

    #[test]
    fn constant_delay_stops_at_max_attempts() {
        let strategy = ConstantDelay::new(Duration::from_millis(10), 2);
        let error = network_error();
        assert!(strategy.should_retry(0, None, Some(&error)));
        assert!(strategy.should_retry(1, None, Some(&error)));
        assert!(!strategy.should_retry(2, None, Some(&error)));
    }

    #[test]
    fn constant_delay_retries_default_status_codes_only() {
        let strategy = ConstantDelay::new(Duration::from_millis(10), 3);
        let retryable = response_with_status(StatusCode::SERVICE_UNAVAILABLE);
        let terminal = response_with_status(StatusCode::NOT_FOUND);
        assert!(strategy.should_retry(0, Some(&retryable), None));
        assert!(!strategy.should_retry(0, Some(&terminal), None));
    }

    #[test]
    fn non_network_errors_are_not_retried() {
        let strategy = ConstantDelay::new(Duration::from_millis(10), 3);
        let error = Error::Cancelled;
        assert!(!strategy.should_retry(0, None, Some(&error)));
        let error = Error::build("request URL is empty");
        assert!(!strategy.should_retry(0, None, Some(&error)));
    }

    #[test]
    fn exponential_backoff_grows_and_clamps() {
        let strategy = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(450),
            1.0,
            5,
        );
        assert_eq!(
            strategy.next_delay(1, None, None),
            Duration::from_millis(200)
        );
        assert_eq!(
            strategy.next_delay(2, None, None),
            Duration::from_millis(400)
        );
        assert_eq!(
            strategy.next_delay(3, None, None),
            Duration::from_millis(450)
        );
    }

    #[test]
    fn exponential_backoff_retries_429_with_retry_after() {
        let strategy = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            1.0,
            3,
        )
        .retryable_statuses([500, 502]);

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::RETRY_AFTER,
            http::HeaderValue::from_static("1"),
        );
        let with_retry_after =
            Response::from_bytes(StatusCode::TOO_MANY_REQUESTS, headers, Bytes::new());
        let without_retry_after = response_with_status(StatusCode::TOO_MANY_REQUESTS);

        assert!(strategy.should_retry(0, Some(&with_retry_after), None));
        assert!(!strategy.should_retry(0, Some(&without_retry_after), None));
    }
}
