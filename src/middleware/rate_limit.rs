use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::middleware::{Middleware, create_middleware};
use crate::transport::RoundTrip;
use crate::util::lock_unpoisoned;

/// Token-bucket throttle configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimitOptions {
    requests_per_second: f64,
    burst: usize,
    wait_on_limit: bool,
    max_wait: Duration,
}

impl RateLimitOptions {
    pub fn requests_per_second(mut self, requests_per_second: f64) -> Self {
        self.requests_per_second = requests_per_second;
        self
    }

    pub const fn burst(mut self, burst: usize) -> Self {
        self.burst = burst;
        self
    }

    /// Whether a call short of tokens waits for one instead of failing.
    pub const fn wait_on_limit(mut self, wait_on_limit: bool) -> Self {
        self.wait_on_limit = wait_on_limit;
        self
    }

    pub const fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn rate(&self) -> f64 {
        self.requests_per_second
    }

    fn normalize(mut self) -> Self {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            self.requests_per_second = Self::default().requests_per_second;
        }
        self
    }
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 1,
            wait_on_limit: true,
            max_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_timestamp: Instant,
}

/// Middleware that throttles calls through a token bucket.
///
/// Accounting runs in a single critical section; the lock is never held
/// across the inner round-trip or the token wait. A call finding the bucket
/// empty either fails immediately with the computed wait, or sleeps for it,
/// racing cancellation. The wait itself pays for the admitted call, so the
/// post-wait path resets the bucket to zero without consuming a token.
pub fn rate_limit_middleware(options: RateLimitOptions) -> Middleware {
    let options = options.normalize();
    let bucket = Arc::new(Mutex::new(TokenBucket {
        tokens: options.burst as f64,
        last_timestamp: Instant::now(),
    }));

    create_middleware("rate-limit", options, move |next: RoundTrip| {
        let bucket = Arc::clone(&bucket);
        Arc::new(move |request| {
            let bucket = Arc::clone(&bucket);
            let next = Arc::clone(&next);
            Box::pin(async move {
                let cancel = request.cancel_token().clone();
                let rate = options.rate();

                let wait = {
                    let mut state = lock_unpoisoned(&bucket);
                    let now = Instant::now();
                    let elapsed = now.duration_since(state.last_timestamp).as_secs_f64();
                    state.last_timestamp = now;

                    let max_tokens = (options.burst as f64).max(1.0);
                    state.tokens = (state.tokens + elapsed * rate).min(max_tokens);

                    if state.tokens >= 1.0 {
                        state.tokens -= 1.0;
                        None
                    } else {
                        let wait = Duration::from_secs_f64((1.0 - state.tokens) / rate);
                        if !options.wait_on_limit || wait > options.max_wait {
                            return Err(Error::RateLimitExceeded {
                                limit: rate,
                                retry_after: wait,
                            });
                        }
                        Some(wait)
                    }
                };

                if let Some(wait) = wait {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    let mut state = lock_unpoisoned(&bucket);
                    state.last_timestamp = Instant::now();
                    state.tokens = 0.0;
                }

                next(request).await
            })
        })
    })
}
