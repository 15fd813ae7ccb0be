use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fetchx::{CancellationToken, Client, Request, simple_retry_middleware};
use http::StatusCode;

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
}

impl MockResponse {
    fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

struct MockServer {
    base_url: String,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = Arc::clone(&captured);

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut response_index = 0;

            while response_index < responses.len() && Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        if let Ok(request) = read_request(&mut stream) {
                            captured_clone
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                        }

                        let response = &responses[response_index];
                        response_index += 1;
                        if !response.delay.is_zero() {
                            thread::sleep(response.delay);
                        }
                        let _ = write_response(&mut stream, response);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            captured,
            join: Some(join),
        }
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut collected = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(position) = collected
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
        {
            break position + 4;
        }
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break collected.len();
        }
        collected.extend_from_slice(&chunk[..read]);
    };

    let header_text = String::from_utf8_lossy(&collected[..header_end]).into_owned();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or_default().to_owned();
    let path = parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    let mut body = collected[header_end..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let mut payload = format!("HTTP/1.1 {} \r\n", response.status).into_bytes();
    for (name, value) in &response.headers {
        payload.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    payload.extend_from_slice(format!("content-length: {}\r\n", response.body.len()).as_bytes());
    payload.extend_from_slice(b"connection: close\r\n\r\n");
    payload.extend_from_slice(&response.body);
    stream.write_all(&payload)?;
    stream.flush()
}

#[tokio::test]
async fn hyper_transport_round_trips_a_get() {
    let server = MockServer::start(vec![
        MockResponse::new(200, "hello from the wire").header("x-served-by", "mock"),
    ]);
    let client = Client::new().expect("client should build");

    let cancel = CancellationToken::new();
    let response = client
        .execute(
            &cancel,
            &Request::get(format!("{}/greeting", server.base_url)).query_param("q", "hi"),
        )
        .await
        .expect("round trip should succeed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-served-by")
            .and_then(|value| value.to_str().ok()),
        Some("mock")
    );
    let body = response.bytes().await.expect("read body");
    assert_eq!(body.as_ref(), b"hello from the wire");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/greeting?q=hi");
}

#[tokio::test]
async fn post_body_and_content_length_reach_the_server() {
    let server = MockServer::start(vec![MockResponse::new(201, "")]);
    let client = Client::new().expect("client should build");

    let cancel = CancellationToken::new();
    let response = client
        .execute(
            &cancel,
            &Request::post(format!("{}/items", server.base_url)).body("test body"),
        )
        .await
        .expect("round trip should succeed");
    assert_eq!(response.status(), StatusCode::CREATED);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].body, b"test body");
    assert_eq!(
        requests[0].headers.get("content-length").map(String::as_str),
        Some("9")
    );
}

#[tokio::test]
async fn slow_server_trips_the_per_call_timeout() {
    let server = MockServer::start(vec![
        MockResponse::new(200, "late").delay(Duration::from_millis(100)),
    ]);
    let client = Client::new().expect("client should build");

    let cancel = CancellationToken::new();
    let error = client
        .execute_with_timeout(
            &cancel,
            &Request::get(format!("{}/slow", server.base_url)),
            Duration::from_millis(50),
        )
        .await
        .expect_err("50ms deadline must beat a 100ms server");
    assert!(error.is_timeout());
    assert!(error.to_string().contains("timed out"));
}

#[tokio::test]
async fn retry_marks_the_second_attempt_on_the_wire() {
    let server = MockServer::start(vec![
        MockResponse::new(500, "boom"),
        MockResponse::new(200, "recovered"),
    ]);
    let client = Client::new().expect("client should build");
    client.use_middleware(simple_retry_middleware(3, Duration::from_millis(20)));

    let cancel = CancellationToken::new();
    let response = client
        .execute(
            &cancel,
            &Request::post(format!("{}/items", server.base_url)).body("test body"),
        )
        .await
        .expect("second attempt should succeed");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.bytes().await.expect("read body").as_ref(),
        b"recovered"
    );

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].headers.get("x-retry-attempt"), None);
    assert_eq!(
        requests[1].headers.get("x-retry-attempt").map(String::as_str),
        Some("1")
    );
    assert_eq!(requests[0].body, b"test body");
    assert_eq!(requests[1].body, b"test body");
}
