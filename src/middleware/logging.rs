use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde_json::json;
use tokio::io::AsyncReadExt;

use crate::error::Error;
use crate::middleware::{Middleware, create_middleware};
use crate::request::PreparedRequest;
use crate::response::{Response, ResponseBody};
use crate::transport::RoundTrip;
use crate::util::lock_unpoisoned;

/// Logging verbosity. `Error` emits only failures, `Info` adds one record
/// per request and response, `Debug` adds headers and bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Error,
    Info,
    Debug,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

type Sink = Arc<Mutex<dyn Write + Send>>;

/// Configuration for the logging middleware. Records go to the injected
/// sink; the default sink is standard error.
#[derive(Clone)]
pub struct LoggingOptions {
    level: LogLevel,
    sink: Sink,
    request_body_max: usize,
    response_body_max: usize,
    headers_to_redact: Vec<String>,
    timestamp_format: String,
    format: LogFormat,
}

impl LoggingOptions {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn sink(mut self, sink: impl Write + Send + 'static) -> Self {
        self.sink = Arc::new(Mutex::new(sink));
        self
    }

    /// Caps on logged body bytes; zero disables body logging for that
    /// direction.
    pub fn body_logging(mut self, request_body_max: usize, response_body_max: usize) -> Self {
        self.request_body_max = request_body_max;
        self.response_body_max = response_body_max;
        self
    }

    pub fn headers_to_redact<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.headers_to_redact = headers.into_iter().map(Into::into).collect();
        self
    }

    /// `chrono` format string for record timestamps; the default is RFC 3339.
    pub fn timestamp_format(mut self, timestamp_format: impl Into<String>) -> Self {
        self.timestamp_format = timestamp_format.into();
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            sink: Arc::new(Mutex::new(std::io::stderr())),
            request_body_max: 0,
            response_body_max: 0,
            headers_to_redact: vec![
                "Authorization".to_owned(),
                "Cookie".to_owned(),
                "Set-Cookie".to_owned(),
            ],
            timestamp_format: "%+".to_owned(),
            format: LogFormat::Text,
        }
    }
}

impl std::fmt::Debug for LoggingOptions {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LoggingOptions")
            .field("level", &self.level)
            .field("request_body_max", &self.request_body_max)
            .field("response_body_max", &self.response_body_max)
            .field("headers_to_redact", &self.headers_to_redact)
            .field("format", &self.format)
            .finish()
    }
}

fn timestamp(options: &LoggingOptions) -> String {
    chrono::Utc::now()
        .format(&options.timestamp_format)
        .to_string()
}

fn is_redacted(name: &str, headers_to_redact: &[String]) -> bool {
    headers_to_redact
        .iter()
        .any(|redacted| redacted.eq_ignore_ascii_case(name))
}

fn write_line(options: &LoggingOptions, line: &str) {
    let mut sink = lock_unpoisoned(&*options.sink);
    if writeln!(sink, "{line}").is_err() {
        eprintln!("failed to write log record: {line}");
    }
}

fn header_lines(options: &LoggingOptions, headers: &HeaderMap, lines: &mut String) {
    lines.push_str("  headers:\n");
    for name in headers.keys() {
        if is_redacted(name.as_str(), &options.headers_to_redact) {
            lines.push_str(&format!("    {name}: [REDACTED]\n"));
            continue;
        }
        for value in headers.get_all(name) {
            let value = value.to_str().unwrap_or("<binary>");
            lines.push_str(&format!("    {name}: {value}\n"));
        }
    }
}

fn header_json(options: &LoggingOptions, headers: &HeaderMap) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for name in headers.keys() {
        if is_redacted(name.as_str(), &options.headers_to_redact) {
            object.insert(name.to_string(), json!("[REDACTED]"));
            continue;
        }
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .map(|value| value.to_str().unwrap_or("<binary>").to_owned())
            .collect();
        let value = if values.len() == 1 {
            json!(values[0])
        } else {
            json!(values)
        };
        object.insert(name.to_string(), value);
    }
    serde_json::Value::Object(object)
}

fn body_json(body: &[u8]) -> serde_json::Value {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(parsed) => parsed,
        Err(_) => json!(String::from_utf8_lossy(body).into_owned()),
    }
}

fn body_lines(body: &[u8], truncated: bool, lines: &mut String) {
    if body.is_empty() {
        return;
    }
    lines.push_str("  body:\n");
    let marker = if truncated { "... [truncated]" } else { "" };
    lines.push_str(&format!("    {}{marker}\n", String::from_utf8_lossy(body)));
}

fn log_request(options: &LoggingOptions, request: &PreparedRequest, body: &[u8], truncated: bool) {
    match options.format {
        LogFormat::Text => {
            let mut lines = format!(
                "[{}] request: {} {}\n",
                timestamp(options),
                request.method(),
                request.url()
            );
            if options.level >= LogLevel::Debug {
                header_lines(options, request.headers(), &mut lines);
                body_lines(body, truncated, &mut lines);
            }
            write_line(options, lines.trim_end_matches('\n'));
        }
        LogFormat::Json => {
            let mut record = json!({
                "timestamp": timestamp(options),
                "type": "request",
                "method": request.method().as_str(),
                "url": request.url(),
            });
            if options.level >= LogLevel::Debug {
                record["headers"] = header_json(options, request.headers());
                if !body.is_empty() {
                    record["body"] = body_json(body);
                    if truncated {
                        record["body_truncated"] = json!(true);
                    }
                }
            }
            write_line(options, &record.to_string());
        }
    }
}

fn log_response(
    options: &LoggingOptions,
    method: &Method,
    url: &str,
    response: &Response,
    body: &[u8],
    truncated: bool,
    elapsed: Duration,
) {
    match options.format {
        LogFormat::Text => {
            let mut lines = format!(
                "[{}] response: {method} {url} -> {} {} ({elapsed:?})\n",
                timestamp(options),
                response.status().as_u16(),
                response.status_text(),
            );
            if options.level >= LogLevel::Debug {
                header_lines(options, response.headers(), &mut lines);
                body_lines(body, truncated, &mut lines);
            }
            write_line(options, lines.trim_end_matches('\n'));
        }
        LogFormat::Json => {
            let mut record = json!({
                "timestamp": timestamp(options),
                "type": "response",
                "method": method.as_str(),
                "url": url,
                "status_code": response.status().as_u16(),
                "status": response.status_text(),
                "duration_ms": elapsed.as_millis() as u64,
            });
            if options.level >= LogLevel::Debug {
                record["headers"] = header_json(options, response.headers());
                if !body.is_empty() {
                    record["body"] = body_json(body);
                    if truncated {
                        record["body_truncated"] = json!(true);
                    }
                }
            }
            write_line(options, &record.to_string());
        }
    }
}

fn log_error(
    options: &LoggingOptions,
    method: &Method,
    url: &str,
    error: &Error,
    elapsed: Duration,
) {
    match options.format {
        LogFormat::Text => {
            write_line(
                options,
                &format!(
                    "[{}] error: {method} {url} -> {error} ({elapsed:?})",
                    timestamp(options)
                ),
            );
        }
        LogFormat::Json => {
            let record = json!({
                "timestamp": timestamp(options),
                "type": "error",
                "method": method.as_str(),
                "url": url,
                "error": error.to_string(),
                "duration_ms": elapsed.as_millis() as u64,
            });
            write_line(options, &record.to_string());
        }
    }
}

/// Drains up to `max + 1` bytes, rebinds the response body to the captured
/// bytes, and returns the display copy plus a truncation flag. Capture
/// failures fall back to stderr and leave an empty body.
async fn capture_response_body(response: &mut Response, max: usize) -> (Vec<u8>, bool) {
    let Some(mut body) = response.take_body() else {
        return (Vec::new(), false);
    };

    let mut captured = Vec::new();
    let mut limited = (&mut body).take((max + 1) as u64);
    if let Err(error) = limited.read_to_end(&mut captured).await {
        eprintln!("failed to read response body for logging: {error}");
        captured.clear();
    }
    if let Err(error) = body.close() {
        eprintln!("failed to close response body for logging: {error}");
    }

    response.set_body(ResponseBody::from_bytes(Bytes::from(captured.clone())));
    let truncated = captured.len() > max;
    if truncated {
        captured.truncate(max);
    }
    (captured, truncated)
}

/// Middleware that emits one structured record per request and response (or
/// error), with header redaction and capped body capture.
pub fn logging_middleware(options: LoggingOptions) -> Middleware {
    create_middleware("logging", options.clone(), move |next: RoundTrip| {
        let options = options.clone();
        Arc::new(move |request| {
            let options = options.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                if options.level == LogLevel::None {
                    return next(request).await;
                }

                let started = Instant::now();

                let mut request_body_peek = Vec::new();
                let mut request_truncated = false;
                if options.request_body_max > 0
                    && let Some(body) = request.body()
                {
                    let take = body.len().min(options.request_body_max + 1);
                    request_body_peek = body[..take].to_vec();
                    if request_body_peek.len() > options.request_body_max {
                        request_body_peek.truncate(options.request_body_max);
                        request_truncated = true;
                    }
                }

                if options.level >= LogLevel::Info {
                    log_request(&options, &request, &request_body_peek, request_truncated);
                }

                let method = request.method().clone();
                let url = request.url().to_owned();
                let outcome = next(request).await;
                let elapsed = started.elapsed();

                match outcome {
                    Err(error) => {
                        if options.level >= LogLevel::Error {
                            log_error(&options, &method, &url, &error, elapsed);
                        }
                        Err(error)
                    }
                    Ok(mut response) => {
                        if options.level >= LogLevel::Info {
                            let (body_peek, truncated) = if options.response_body_max > 0
                                && response.has_body()
                            {
                                capture_response_body(&mut response, options.response_body_max)
                                    .await
                            } else {
                                (Vec::new(), false)
                            };
                            log_response(
                                &options, &method, &url, &response, &body_peek, truncated,
                                elapsed,
                            );
                        }
                        Ok(response)
                    }
                }
            })
        })
    })
}
