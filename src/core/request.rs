use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::util::{
    encode_multipart_form, merge_query_pairs, multipart_boundary, parse_header_name,
    parse_header_value,
};

/// A builder failure held until `build` so the fluent chain never breaks.
#[derive(Clone, Debug)]
struct DeferredBuildError {
    message: String,
    cause: Option<String>,
}

impl DeferredBuildError {
    fn into_error(self) -> Error {
        match self.cause {
            Some(cause) => Error::build_with(self.message, cause),
            None => Error::build(self.message),
        }
    }
}

/// An HTTP request under construction.
///
/// Every setter returns `self` for chaining; anything that can fail (header
/// parsing, body rules, JSON encoding, multipart file reads) records a
/// deferred error surfaced by [`Request::build`]. `Clone` produces a deep
/// copy: mutating the clone's headers, query, or metadata never affects the
/// source, and both copies build byte-identical bodies.
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: String,
    headers: HeaderMap,
    query_pairs: Vec<(String, String)>,
    body: Option<Bytes>,
    chunked: bool,
    metadata: HashMap<String, Arc<dyn Any + Send + Sync>>,
    cancel: Option<CancellationToken>,
    build_error: Option<DeferredBuildError>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("query_pairs", &self.query_pairs)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .field("chunked", &self.chunked)
            .field("metadata_keys", &self.metadata.keys().collect::<Vec<_>>())
            .field("build_error", &self.build_error)
            .finish()
    }
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        let build_error = if url.is_empty() {
            Some(DeferredBuildError {
                message: "request URL is empty".to_owned(),
                cause: None,
            })
        } else {
            url::Url::parse(&url).err().map(|source| DeferredBuildError {
                message: format!("invalid URL {url}"),
                cause: Some(source.to_string()),
            })
        };

        Self {
            method,
            url,
            headers: HeaderMap::new(),
            query_pairs: Vec::new(),
            body: None,
            chunked: false,
            metadata: HashMap::new(),
            cancel: None,
            build_error,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::HEAD, url)
    }

    /// POST preset for webhook delivery with a signature header.
    pub fn webhook<T>(url: impl Into<String>, payload: &T, signature: &str) -> Self
    where
        T: Serialize + ?Sized,
    {
        Self::post(url)
            .json(payload)
            .header("X-Webhook-Signature", signature)
            .header("User-Agent", "fetchx-webhook-client/1.0")
    }

    fn defer_error(&mut self, error: Error) {
        if self.build_error.is_none() {
            self.build_error = Some(DeferredBuildError {
                message: error.to_string(),
                cause: None,
            });
        }
    }

    /// Sets a header, replacing any previous value under the same name.
    /// Invalid names or values become deferred build errors.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match parse_header_name(name).and_then(|name| {
            parse_header_value(name.as_str(), value).map(|value| (name, value))
        }) {
            Ok((name, value)) => {
                self.headers.insert(name, value);
            }
            Err(error) => self.defer_error(error),
        }
        self
    }

    /// Appends a header value without replacing existing ones under the same
    /// name.
    pub fn append_header(mut self, name: &str, value: &str) -> Self {
        match parse_header_name(name).and_then(|name| {
            parse_header_value(name.as_str(), value).map(|value| (name, value))
        }) {
            Ok((name, value)) => {
                self.headers.append(name, value);
            }
            Err(error) => self.defer_error(error),
        }
        self
    }

    pub fn typed_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers<'a, I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (name, value) in headers {
            self = self.header(name, value);
        }
        self
    }

    /// Appends one query parameter; repeated names are preserved in order.
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_params<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query_pairs.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    fn method_allows_body(&self) -> bool {
        self.method != Method::GET && self.method != Method::HEAD
    }

    /// Sets a raw byte body. GET and HEAD requests must not carry a body;
    /// the violation is deferred to build time.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        if !self.method_allows_body() {
            let method = self.method.clone();
            self.defer_error(Error::build(format!(
                "http method {method} does not allow a body"
            )));
            return self;
        }
        self.body = Some(body.into());
        self
    }

    /// Sets a JSON body and the matching `Content-Type` header.
    pub fn json<T>(mut self, payload: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        if !self.method_allows_body() {
            let method = self.method.clone();
            self.defer_error(Error::build(format!(
                "http method {method} does not allow a body"
            )));
            return self;
        }
        match serde_json::to_vec(payload) {
            Ok(encoded) => {
                self.body = Some(Bytes::from(encoded));
                self.headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            Err(source) => {
                self.defer_error(Error::build_with("failed to encode request json", source));
            }
        }
        self
    }

    /// Builds a `multipart/form-data` body from text fields and file parts.
    /// Files are read immediately; I/O failures are deferred to build time.
    pub fn multipart_form(mut self, fields: &[(&str, &str)], files: &[(&str, &str)]) -> Self {
        if !self.method_allows_body() {
            let method = self.method.clone();
            self.defer_error(Error::build(format!(
                "http method {method} does not allow a body"
            )));
            return self;
        }

        let mut file_parts = Vec::with_capacity(files.len());
        for (name, file_path) in files {
            let contents = match std::fs::read(file_path) {
                Ok(contents) => contents,
                Err(source) => {
                    self.defer_error(Error::build_with(
                        format!("failed to read multipart file {file_path}"),
                        source,
                    ));
                    return self;
                }
            };
            let file_name = Path::new(file_path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| (*file_path).to_owned());
            file_parts.push(((*name).to_owned(), file_name, contents));
        }

        let text_fields: Vec<(String, String)> = fields
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();

        let boundary = multipart_boundary();
        let body = encode_multipart_form(&boundary, &text_fields, &file_parts);
        self.body = Some(Bytes::from(body));
        let content_type = format!("multipart/form-data; boundary={boundary}");
        match HeaderValue::from_str(&content_type) {
            Ok(value) => {
                self.headers.insert(CONTENT_TYPE, value);
            }
            Err(source) => {
                self.defer_error(Error::build_with("invalid multipart content type", source));
            }
        }
        self
    }

    /// Enables chunked transfer encoding; the built request reports an
    /// unknown content length.
    pub fn chunked(mut self) -> Self {
        self.headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        self.chunked = true;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Attaches an opaque metadata value under `key`.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Any + Send + Sync) -> Self {
        self.metadata.insert(key.into(), Arc::new(value));
        self
    }

    pub fn metadata_value<T: 'static>(&self, key: &str) -> Option<&T> {
        self.metadata
            .get(key)
            .and_then(|value| value.downcast_ref())
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn header_map(&self) -> &HeaderMap {
        &self.headers
    }

    /// Parses the URL, merges query parameters, and materializes the
    /// ready-to-send form of this request. Deferred builder failures surface
    /// here.
    pub fn build(&self) -> crate::Result<PreparedRequest> {
        if let Some(deferred) = &self.build_error {
            return Err(deferred.clone().into_error());
        }
        if self.url.is_empty() {
            return Err(Error::build("request URL is empty"));
        }

        let mut url = url::Url::parse(&self.url)
            .map_err(|source| Error::build_with(format!("invalid URL {}", self.url), source))?;
        merge_query_pairs(&mut url, &self.query_pairs);
        let url_text = url.to_string();
        let uri: Uri = url_text
            .parse()
            .map_err(|source| Error::build_with(format!("invalid URL {url_text}"), source))?;

        let content_length = if self.chunked {
            None
        } else {
            Some(self.body.as_ref().map_or(0, |body| body.len() as u64))
        };

        Ok(PreparedRequest {
            method: self.method.clone(),
            uri,
            url: url_text,
            headers: self.headers.clone(),
            body: self.body.clone(),
            chunked: self.chunked,
            content_length,
            metadata: self.metadata.clone(),
            cancel: self.cancel.clone().unwrap_or_default(),
        })
    }
}

/// The materialized, ready-to-send form of a [`Request`]: query merged into
/// the URI, headers final, body replayable from offset zero, cancellation
/// token attached.
#[derive(Clone)]
pub struct PreparedRequest {
    method: Method,
    uri: Uri,
    url: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    chunked: bool,
    content_length: Option<u64>,
    metadata: HashMap<String, Arc<dyn Any + Send + Sync>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PreparedRequest {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PreparedRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .field("content_length", &self.content_length)
            .finish()
    }
}

impl PreparedRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Rebinds the body; retry uses this to hand every attempt a fresh
    /// reader over the replay buffer.
    pub fn set_body(&mut self, body: Option<Bytes>) {
        self.body = body;
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Declared content length; `None` means unknown (chunked encoding).
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_cancel_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn metadata_value<T: 'static>(&self, key: &str) -> Option<&T> {
        self.metadata
            .get(key)
            .and_then(|value| value.downcast_ref())
    }
}
