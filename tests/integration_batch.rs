use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use fetchx::{
    CancellationToken, Client, Error, GroupOptions, PreparedRequest, Request, Response,
    RoundTripFuture, TransportFn,
};
use http::{HeaderMap, StatusCode};

fn client_with<F>(transport: F) -> Client
where
    F: Fn(PreparedRequest) -> RoundTripFuture + Send + Sync + 'static,
{
    Client::builder()
        .transport(TransportFn::new(transport))
        .build()
        .expect("client should build")
}

fn ok_response(body: &'static [u8]) -> Response {
    Response::from_bytes(StatusCode::OK, HeaderMap::new(), Bytes::from_static(body))
}

/// Responds after a delay keyed on the request path: `/slow` sleeps 300ms,
/// everything else ~1ms. Honors cancellation while sleeping.
fn path_keyed_transport() -> impl Fn(PreparedRequest) -> RoundTripFuture + Send + Sync {
    |request: PreparedRequest| {
        let cancel = request.cancel_token().clone();
        let delay = if request.uri().path().contains("slow") {
            Duration::from_millis(300)
        } else {
            Duration::from_millis(1)
        };
        Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(ok_response(b"done")),
            }
        })
    }
}

#[tokio::test]
async fn execute_async_yields_exactly_one_result() {
    let client = client_with(|_request| Box::pin(async { Ok(ok_response(b"async body")) }));
    let cancel = CancellationToken::new();
    let receiver = client.execute_async(&cancel, &Request::get("https://api.example.com"));

    let result = receiver.await.expect("channel delivers one result");
    let response = result.expect("call should succeed");
    assert_eq!(
        response.bytes().await.expect("read body").as_ref(),
        b"async body"
    );
}

#[tokio::test]
async fn panicking_transport_becomes_an_error_result() {
    let client = client_with(|_request| Box::pin(async { panic!("transport exploded") }));
    let cancel = CancellationToken::new();
    let receiver = client.execute_async(&cancel, &Request::get("https://api.example.com"));

    let result = receiver.await.expect("channel still delivers a result");
    let error = result.expect_err("panic must surface as an error");
    match &error {
        Error::TaskPanic { message } => assert!(message.contains("transport exploded")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn group_results_match_request_positions() {
    let client = client_with(path_keyed_transport());
    let cancel = CancellationToken::new();
    let requests = vec![
        Request::get("https://api.example.com/fast"),
        Request::get("https://api.example.com/fast"),
        Request::get("https://api.example.com/fast"),
    ];

    let mut receiver = client.group_execute(&cancel, &requests, GroupOptions::new());
    let results = receiver.recv().await.expect("group emits one vector");
    assert_eq!(results.len(), 3);
    for result in results {
        result.expect("every fast request should succeed");
    }
    assert!(receiver.recv().await.is_none());
}

#[tokio::test]
async fn individual_timeout_fails_only_the_slow_slot() {
    let client = client_with(path_keyed_transport());
    let cancel = CancellationToken::new();
    let requests = vec![
        Request::get("https://api.example.com/fast"),
        Request::get("https://api.example.com/slow"),
    ];

    let mut receiver = client.group_execute(
        &cancel,
        &requests,
        GroupOptions::new().individual_timeout(Duration::from_millis(30)),
    );
    let results = receiver.recv().await.expect("group emits one vector");
    assert_eq!(results.len(), 2);

    results[0].as_ref().expect("fast slot should succeed");
    let error = results[1]
        .as_ref()
        .expect_err("slow slot must hit its deadline");
    assert!(error.to_string().contains("deadline"));
}

#[tokio::test]
async fn parent_cancellation_fills_remaining_slots() {
    let client = client_with(path_keyed_transport());
    let cancel = CancellationToken::new();
    let requests = vec![
        Request::get("https://api.example.com/slow"),
        Request::get("https://api.example.com/slow"),
    ];

    let mut receiver = client.group_execute(&cancel, &requests, GroupOptions::new());
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let results = receiver.recv().await.expect("group still emits a vector");
    assert_eq!(results.len(), 2);
    for result in &results {
        let error = result.as_ref().expect_err("cancelled slot must fail");
        assert!(error.is_cancelled());
    }
}

#[tokio::test]
async fn one_panicking_slot_does_not_poison_the_group() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    let client = client_with(move |request| {
        calls_clone.fetch_add(1, Ordering::SeqCst);
        let should_panic = request.uri().path().contains("boom");
        Box::pin(async move {
            if should_panic {
                panic!("slot exploded");
            }
            Ok(ok_response(b"fine"))
        })
    });

    let cancel = CancellationToken::new();
    let requests = vec![
        Request::get("https://api.example.com/ok"),
        Request::get("https://api.example.com/boom"),
        Request::get("https://api.example.com/ok"),
    ];

    let mut receiver = client.group_execute(&cancel, &requests, GroupOptions::new());
    let results = receiver.recv().await.expect("group emits one vector");
    assert_eq!(results.len(), 3);
    results[0].as_ref().expect("first slot should succeed");
    assert!(matches!(
        results[1].as_ref().expect_err("second slot panicked"),
        Error::TaskPanic { .. }
    ));
    results[2].as_ref().expect("third slot should succeed");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn stream_async_returns_an_unconsumed_body() {
    let client = client_with(|_request| Box::pin(async { Ok(ok_response(b"streamed")) }));
    let cancel = CancellationToken::new();
    let receiver = client.execute_stream_async(&cancel, &Request::get("https://api.example.com"));

    let mut response = receiver
        .await
        .expect("channel delivers one result")
        .expect("call should succeed");
    let mut collected = Vec::new();
    response
        .stream_chunks(|chunk| collected.extend_from_slice(chunk), None)
        .await
        .expect("streaming should succeed");
    response.close().expect("close should succeed");
    assert_eq!(collected, b"streamed");
}
