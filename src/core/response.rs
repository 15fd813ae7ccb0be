use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, map_read_error};
use crate::util::truncate_body;

const DEFAULT_STREAM_BUFFER_SIZE: usize = 4096;

/// Outcome of an asynchronous execution: exactly one of a response or an
/// error.
pub type AsyncResult = crate::Result<Response>;

type Closer = Box<dyn FnOnce() -> std::io::Result<()> + Send>;

/// Single-reader response body with an idempotent close hook.
///
/// Closing (explicitly or on drop) runs the hook exactly once; reading after
/// close yields end-of-stream.
pub struct ResponseBody {
    reader: Option<Pin<Box<dyn AsyncRead + Send>>>,
    closer: Option<Closer>,
}

impl ResponseBody {
    pub fn new(reader: Pin<Box<dyn AsyncRead + Send>>) -> Self {
        Self {
            reader: Some(reader),
            closer: None,
        }
    }

    /// In-memory body over a byte buffer.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self::new(Box::pin(Cursor::new(bytes)))
    }

    /// Attaches a hook invoked exactly once when the body is released.
    pub fn with_closer(
        reader: Pin<Box<dyn AsyncRead + Send>>,
        closer: impl FnOnce() -> std::io::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            reader: Some(reader),
            closer: Some(Box::new(closer)),
        }
    }

    pub(crate) fn close(&mut self) -> std::io::Result<()> {
        self.reader = None;
        match self.closer.take() {
            Some(closer) => closer(),
            None => Ok(()),
        }
    }
}

impl AsyncRead for ResponseBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        context: &mut Context<'_>,
        buffer: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.reader.as_mut() {
            Some(reader) => reader.as_mut().poll_read(context, buffer),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer();
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseBody")
            .field("open", &self.reader.is_some())
            .finish()
    }
}

/// A received HTTP response.
///
/// The body is single-reader and released exactly once on every exit path:
/// the buffered reads (`bytes`, `text`, `json`, `xml`, `save_to_file`,
/// `process`) close it themselves; streaming callers own the release.
pub struct Response {
    status: StatusCode,
    status_text: String,
    headers: HeaderMap,
    uri: String,
    body: Option<ResponseBody>,
    bytes_read: u64,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers,
            uri: String::new(),
            body: Some(body),
            bytes_read: 0,
        }
    }

    /// Buffered response over in-memory bytes.
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self::new(status, headers, ResponseBody::from_bytes(body))
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Total bytes delivered through the streaming interface so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Declared `Content-Length` of this response, if present and parseable.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }

    /// Removes the body, leaving the response without one. Middlewares use
    /// this to interpose reader guards; the returned body still owns the
    /// release hook.
    pub fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }

    pub fn set_body(&mut self, body: ResponseBody) {
        self.body = Some(body);
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Releases the body. Idempotent; a response without a body succeeds.
    pub fn close(&mut self) -> crate::Result<()> {
        match self.body.take() {
            Some(mut body) => body
                .close()
                .map_err(|source| Error::response_with("failed to close response body", source)),
            None => Ok(()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.as_u16() >= 200 && self.status.as_u16() < 300
    }

    pub fn is_redirect(&self) -> bool {
        self.status.as_u16() >= 300 && self.status.as_u16() < 400
    }

    pub fn is_client_error(&self) -> bool {
        self.status.as_u16() >= 400 && self.status.as_u16() < 500
    }

    pub fn is_server_error(&self) -> bool {
        self.status.as_u16() >= 500 && self.status.as_u16() < 600
    }

    pub fn is_error(&self) -> bool {
        self.status.as_u16() >= 400
    }

    /// Returns the response unchanged when it is successful; otherwise drains
    /// the body and fails with a status error carrying a body snippet.
    pub async fn must_success(self) -> crate::Result<Response> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self.status.as_u16();
        let status_text = self.status_text.clone();
        let uri = self.uri.clone();
        let body = self.bytes().await.unwrap_or_default();
        Err(Error::Status {
            status,
            status_text,
            uri,
            body: truncate_body(&body),
        })
    }

    /// Drains the body into memory and releases it. A close failure surfaces
    /// only when the read itself succeeded.
    pub async fn bytes(mut self) -> crate::Result<Bytes> {
        let mut collected = Vec::new();
        let read_result = match self.body.as_mut() {
            Some(body) => body.read_to_end(&mut collected).await.map(|_| ()),
            None => Ok(()),
        };
        let close_result = self.close();
        if let Err(source) = read_result {
            return Err(map_read_error(source, "failed to read response body"));
        }
        close_result?;
        Ok(Bytes::from(collected))
    }

    pub async fn text(self) -> crate::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Decodes the body as JSON and releases it. A decode failure wins over
    /// a close failure.
    pub async fn json<T>(mut self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        let mut collected = Vec::new();
        let read_result = match self.body.as_mut() {
            Some(body) => body.read_to_end(&mut collected).await.map(|_| ()),
            None => Ok(()),
        };
        let close_result = self.close();
        if let Err(source) = read_result {
            return Err(map_read_error(source, "failed to read response body"));
        }
        match serde_json::from_slice(&collected) {
            Ok(decoded) => {
                close_result?;
                Ok(decoded)
            }
            Err(source) => Err(Error::response_with(
                format!(
                    "failed to decode response json; body={}",
                    truncate_body(&collected)
                ),
                source,
            )),
        }
    }

    /// Decodes the body as XML and releases it.
    pub async fn xml<T>(mut self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        let mut collected = Vec::new();
        let read_result = match self.body.as_mut() {
            Some(body) => body.read_to_end(&mut collected).await.map(|_| ()),
            None => Ok(()),
        };
        let close_result = self.close();
        if let Err(source) = read_result {
            return Err(map_read_error(source, "failed to read response body"));
        }
        let text = String::from_utf8_lossy(&collected);
        match quick_xml::de::from_str(&text) {
            Ok(decoded) => {
                close_result?;
                Ok(decoded)
            }
            Err(source) => Err(Error::response_with(
                format!(
                    "failed to decode response xml; body={}",
                    truncate_body(&collected)
                ),
                source,
            )),
        }
    }

    /// Streams the body into a file at `path`, releasing both on every exit
    /// path. Returns the number of bytes written.
    pub async fn save_to_file(mut self, path: impl AsRef<Path>) -> crate::Result<u64> {
        let path = path.as_ref();
        let mut file = tokio::fs::File::create(path).await.map_err(|source| {
            Error::response_with(format!("failed to create file {}", path.display()), source)
        })?;

        let copy_result = match self.body.as_mut() {
            Some(body) => tokio::io::copy(body, &mut file).await,
            None => Ok(0),
        };
        let flush_result = file.flush().await;
        let close_result = self.close();

        let copied = copy_result.map_err(|source| {
            map_read_error(
                source,
                &format!("failed to save response to file {}", path.display()),
            )
        })?;
        flush_result.map_err(|source| {
            Error::response_with(format!("failed to flush file {}", path.display()), source)
        })?;
        close_result?;
        Ok(copied)
    }

    /// Hands the body reader to `handler` and releases it afterwards. A
    /// handler failure wins over a close failure.
    pub async fn process<T, F>(mut self, handler: F) -> crate::Result<T>
    where
        F: for<'a> FnOnce(&'a mut ResponseBody) -> BoxFuture<'a, crate::Result<T>>,
    {
        let Some(body) = self.body.as_mut() else {
            return Err(Error::response("response body already consumed"));
        };
        let handled = handler(body).await;
        let close_result = self.close();
        let value = handled?;
        close_result?;
        Ok(value)
    }

    /// Reads the body in chunks, invoking `callback` for every non-empty
    /// read and advancing `bytes_read`. `buffer_size` of zero or `None`
    /// selects the 4 KiB default. The body is left for the caller to release.
    pub async fn stream_chunks<F>(
        &mut self,
        mut callback: F,
        buffer_size: Option<usize>,
    ) -> crate::Result<()>
    where
        F: FnMut(&[u8]),
    {
        let buffer_size = effective_buffer_size(buffer_size);
        let Some(body) = self.body.as_mut() else {
            return Ok(());
        };

        let mut buffer = vec![0u8; buffer_size];
        loop {
            let read = body
                .read(&mut buffer)
                .await
                .map_err(|source| map_read_error(source, "error while streaming chunks"))?;
            if read == 0 {
                break;
            }
            self.bytes_read += read as u64;
            callback(&buffer[..read]);
        }
        Ok(())
    }

    /// Like [`Response::stream_chunks`] but polls `token` before each read;
    /// a cancelled token returns the cancellation error without invoking the
    /// callback for that chunk.
    pub async fn stream_chunks_with_cancel<F>(
        &mut self,
        token: &CancellationToken,
        mut callback: F,
        buffer_size: Option<usize>,
    ) -> crate::Result<()>
    where
        F: FnMut(&[u8]),
    {
        let buffer_size = effective_buffer_size(buffer_size);
        let Some(body) = self.body.as_mut() else {
            return Ok(());
        };

        let mut buffer = vec![0u8; buffer_size];
        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let read = tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                read = body.read(&mut buffer) => read
                    .map_err(|source| map_read_error(source, "error while streaming chunks"))?,
            };
            if read == 0 {
                break;
            }
            self.bytes_read += read as u64;
            callback(&buffer[..read]);
        }
        Ok(())
    }

    /// Re-reads the whole body into memory, producing a buffered response
    /// with the original status, headers, and URI.
    pub(crate) async fn into_buffered(mut self) -> crate::Result<Response> {
        let mut collected = Vec::new();
        let read_result = match self.body.as_mut() {
            Some(body) => body.read_to_end(&mut collected).await.map(|_| ()),
            None => Ok(()),
        };
        let close_result = self.close();
        if let Err(source) = read_result {
            return Err(map_read_error(source, "failed to read response body"));
        }
        close_result?;

        let mut buffered =
            Response::from_bytes(self.status, self.headers.clone(), Bytes::from(collected));
        buffered.status_text = self.status_text.clone();
        buffered.uri = self.uri.clone();
        buffered.bytes_read = self.bytes_read;
        Ok(buffered)
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("uri", &self.uri)
            .field("body", &self.body)
            .field("bytes_read", &self.bytes_read)
            .finish()
    }
}

fn effective_buffer_size(buffer_size: Option<usize>) -> usize {
    match buffer_size {
        Some(size) if size > 0 => size,
        _ => DEFAULT_STREAM_BUFFER_SIZE,
    }
}

/// Reads the remaining body to end-of-stream and releases it. Retry uses
/// this between attempts so pooled connections can be reused.
pub async fn drain_and_close(mut response: Response) {
    if let Some(body) = response.body.as_mut() {
        let mut scratch = [0u8; DEFAULT_STREAM_BUFFER_SIZE];
        loop {
            match body.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
    let _ = response.close();
}
