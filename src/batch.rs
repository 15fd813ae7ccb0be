use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::client::{Client, ExecuteOptions};
use crate::error::Error;
use crate::request::Request;
use crate::response::AsyncResult;

/// Options for batched execution.
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupOptions {
    individual_timeout: Option<Duration>,
    buffer_size: usize,
}

impl GroupOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline applied to each request in the group individually.
    pub const fn individual_timeout(mut self, individual_timeout: Duration) -> Self {
        self.individual_timeout = Some(individual_timeout);
        self
    }

    /// Capacity of the output channel; defaults to 1.
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

impl Client {
    /// Runs `execute` in a spawned task and returns a single-shot channel
    /// yielding exactly one result; the channel closes afterwards. Panics in
    /// the transport or middlewares surface as error results.
    ///
    /// Must be called within a Tokio runtime.
    pub fn execute_async(
        &self,
        cancel: &CancellationToken,
        request: &Request,
    ) -> oneshot::Receiver<AsyncResult> {
        self.execute_async_with_options(cancel, request, ExecuteOptions::default())
    }

    /// Async variant of `execute_stream`: the delivered response still owns
    /// its body.
    pub fn execute_stream_async(
        &self,
        cancel: &CancellationToken,
        request: &Request,
    ) -> oneshot::Receiver<AsyncResult> {
        self.execute_async_with_options(cancel, request, ExecuteOptions::new().stream())
    }

    pub fn execute_async_with_options(
        &self,
        cancel: &CancellationToken,
        request: &Request,
        options: ExecuteOptions,
    ) -> oneshot::Receiver<AsyncResult> {
        let (sender, receiver) = oneshot::channel();
        let client = self.clone();
        let cancel = cancel.clone();
        let request = request.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(client.execute_with_options(&cancel, &request, options))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(Error::TaskPanic {
                        message: panic_message(payload),
                    })
                });
            let _ = sender.send(result);
        });
        receiver
    }

    /// Executes every request concurrently, one task per request, each bound
    /// to its own child token. The returned channel yields one vector with
    /// the same length and order as `requests`, then closes.
    ///
    /// A slot holds the cancellation error when the parent token fired
    /// before that request produced a result. Every child token is released
    /// before the vector is emitted.
    pub fn group_execute(
        &self,
        cancel: &CancellationToken,
        requests: &[Request],
        group_options: GroupOptions,
    ) -> mpsc::Receiver<Vec<AsyncResult>> {
        self.group_execute_with_options(cancel, requests, group_options, ExecuteOptions::default())
    }

    pub fn group_execute_with_options(
        &self,
        cancel: &CancellationToken,
        requests: &[Request],
        group_options: GroupOptions,
        options: ExecuteOptions,
    ) -> mpsc::Receiver<Vec<AsyncResult>> {
        let buffer_size = group_options.buffer_size.max(1);
        let (sender, receiver) = mpsc::channel(buffer_size);
        let parent = cancel.clone();

        let mut children = Vec::with_capacity(requests.len());
        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            let child = parent.child_token();
            children.push(child.clone());

            let request_options = match group_options.individual_timeout {
                Some(individual) => options.timeout(match options.timeout {
                    Some(existing) => existing.min(individual),
                    None => individual,
                }),
                None => options,
            };

            let client = self.clone();
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                AssertUnwindSafe(client.execute_with_options(&child, &request, request_options))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(Error::TaskPanic {
                            message: panic_message(payload),
                        })
                    })
            }));
        }

        tokio::spawn(async move {
            let mut results = Vec::with_capacity(handles.len());
            for mut handle in handles {
                let slot = tokio::select! {
                    joined = &mut handle => match joined {
                        Ok(result) => result,
                        Err(join_error) if join_error.is_panic() => Err(Error::TaskPanic {
                            message: join_error.to_string(),
                        }),
                        Err(_) => Err(Error::Cancelled),
                    },
                    _ = parent.cancelled() => {
                        handle.abort();
                        Err(Error::Cancelled)
                    }
                };
                results.push(slot);
            }
            for child in &children {
                child.cancel();
            }
            let _ = sender.send(results).await;
        });

        receiver
    }
}
