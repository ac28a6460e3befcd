//! HTTP transport implementation.
//!
//! Maps [`RemoteApi`] onto a PostgREST-style REST interface. The actual
//! HTTP client is abstracted via a trait so the mapping can be tested
//! without a network and so different HTTP libraries can be plugged in.
//! With the `reqwest` feature, [`ReqwestClient`] provides one.

use crate::error::{SyncError, SyncResult};
use crate::remote::{FeedStream, RemoteApi};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use rollcall_sync_protocol::{
    FeedEvent, ProtocolError, RemoteRow, SelectQuery, SubscribeRequest, UpsertRequest,
    UpsertResponse,
};
use url::Url;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET.
    Get,
    /// POST.
    Post,
}

/// An HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Returns the first header named `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A complete HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

/// Lines of a streamed response body.
pub type LineStream = BoxStream<'static, Result<String, String>>;

/// A streamed HTTP response.
pub struct HttpStream {
    /// Status code.
    pub status: u16,
    /// Body, split into lines.
    pub lines: LineStream,
}

/// HTTP client abstraction.
///
/// Errors are transport failures (no response at all), as text.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and reads the whole response body.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Sends a request and streams the response body line by line.
    async fn open_stream(&self, request: HttpRequest) -> Result<HttpStream, String>;
}

/// HTTP-based remote API.
///
/// Uses JSON bodies and PostgREST conventions:
/// - `POST /rest/v1/{table}?on_conflict=global_key` for upserts
/// - `GET /rest/v1/{table}?owner_id=eq.…&updated_at=gt.…` for selects
/// - `GET /feed?owner_id=eq.…&tables=…` for the newline-delimited JSON
///   change feed
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the remote (e.g., "https://db.example.com/"), always
    /// ending in a slash so request paths resolve below it.
    base_url: Url,
    /// Project API key, sent on every request.
    api_key: Option<String>,
    /// Session access token; the API key is used when absent.
    access_token: RwLock<Option<String>>,
    /// HTTP client implementation.
    client: C,
    /// Last error message.
    last_error: Mutex<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    ///
    /// Fails if `base_url` is not an absolute URL.
    pub fn new(base_url: &str, client: C) -> SyncResult<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            api_key: None,
            access_token: RwLock::new(None),
            client,
            last_error: Mutex::new(None),
        })
    }

    /// Sets the project API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Replaces the session access token.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Builds a request for `path`, relative to the base URL.
    fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> SyncResult<HttpRequest> {
        let mut url = self.base_url.join(path)?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(name, value)| (*name, value.as_str())));
        }

        let mut headers = Vec::new();
        if let Some(key) = &self.api_key {
            headers.push(("apikey".to_string(), key.clone()));
        }
        let bearer = self.access_token.read().clone().or_else(|| self.api_key.clone());
        if let Some(token) = bearer {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        Ok(HttpRequest {
            method,
            url: url.into(),
            headers,
            body: None,
        })
    }

    async fn send(&self, table: &str, request: HttpRequest) -> SyncResult<Vec<u8>> {
        let response = self
            .client
            .send(request)
            .await
            .map_err(|e| self.fail(SyncError::network(e)))?;
        check_status(table, response.status, &response.body).map_err(|e| self.fail(e))?;
        self.last_error.lock().take();
        Ok(response.body)
    }

    fn fail(&self, err: SyncError) -> SyncError {
        *self.last_error.lock() = Some(err.to_string());
        err
    }
}

#[async_trait]
impl<C: HttpClient> RemoteApi for HttpTransport<C> {
    async fn upsert(&self, request: UpsertRequest) -> SyncResult<UpsertResponse> {
        if request.is_empty() {
            return Ok(UpsertResponse { accepted: 0 });
        }
        let table = request.table.table_name();
        let mut http = self.request(
            Method::Post,
            &format!("rest/v1/{table}"),
            &[("on_conflict", UpsertRequest::CONFLICT_COLUMN.to_string())],
        )?;
        http.headers.push(("Content-Type".into(), "application/json".into()));
        http.headers.push((
            "Prefer".into(),
            "resolution=merge-duplicates,return=representation".into(),
        ));
        http.body = Some(serde_json::to_vec(&request.rows).map_err(ProtocolError::from)?);

        let body = self.send(table, http).await?;
        let written: Vec<serde_json::Value> =
            serde_json::from_slice(&body).map_err(ProtocolError::from)?;
        Ok(UpsertResponse {
            accepted: written.len(),
        })
    }

    async fn select(&self, query: SelectQuery) -> SyncResult<Vec<RemoteRow>> {
        let table = query.table.table_name();
        let mut params = vec![("select", "*".to_string())];
        params.extend(query.query_pairs());
        let mut http = self.request(Method::Get, &format!("rest/v1/{table}"), &params)?;
        http.headers.push(("Accept".into(), "application/json".into()));

        let body = self.send(table, http).await?;
        Ok(serde_json::from_slice(&body).map_err(ProtocolError::from)?)
    }

    async fn subscribe(&self, request: SubscribeRequest) -> SyncResult<FeedStream> {
        let mut http = self.request(Method::Get, "feed", &request.query_pairs())?;
        http.headers.push(("Accept".into(), "application/x-ndjson".into()));

        let response = self
            .client
            .open_stream(http)
            .await
            .map_err(|e| self.fail(SyncError::network(e)))?;
        check_status("feed", response.status, &[]).map_err(|e| self.fail(e))?;
        self.last_error.lock().take();

        let events = response
            .lines
            .filter(|line| {
                let keep = !matches!(line, Ok(text) if text.trim().is_empty());
                async move { keep }
            })
            .map(|line| match line {
                Ok(text) => FeedEvent::from_json_line(&text).map_err(SyncError::from),
                Err(err) => Err(SyncError::network(err)),
            });
        Ok(Box::pin(events))
    }
}

/// Maps an HTTP status to the error taxonomy.
fn check_status(table: &str, status: u16, body: &[u8]) -> SyncResult<()> {
    let message = || {
        let text = String::from_utf8_lossy(body);
        if text.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {text}")
        }
    };
    match status {
        200..=299 => Ok(()),
        408 | 429 | 500..=599 => Err(SyncError::network(message())),
        400..=499 => Err(SyncError::rejected(table, message())),
        _ => Err(SyncError::network_fatal(message())),
    }
}

/// Splits a chunked body into newline-terminated lines.
///
/// A trailing line without a newline is still yielded. A line that is not
/// valid UTF-8 is yielded as an error and the stream goes on. After a
/// chunk error the partial line is discarded and the stream ends.
pub fn ndjson_lines<S>(chunks: S) -> LineStream
where
    S: Stream<Item = Result<Vec<u8>, String>> + Send + 'static,
{
    let state = (Box::pin(chunks), Vec::<u8>::new(), false);
    stream::unfold(state, |(mut chunks, mut buffer, mut done)| async move {
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let text = decode_line(&line[..pos]);
                return Some((text, (chunks, buffer, done)));
            }
            if done {
                if buffer.is_empty() {
                    return None;
                }
                let text = decode_line(&buffer);
                buffer.clear();
                return Some((text, (chunks, buffer, done)));
            }
            match chunks.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(err)) => return Some((Err(err), (chunks, Vec::new(), true))),
                None => done = true,
            }
        }
    })
    .boxed()
}

fn decode_line(bytes: &[u8]) -> Result<String, String> {
    std::str::from_utf8(bytes)
        .map(|text| text.trim_end_matches('\r').to_string())
        .map_err(|e| format!("invalid UTF-8 in feed line: {e}"))
}

/// [`HttpClient`] backed by reqwest.
#[cfg(feature = "reqwest")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

#[cfg(feature = "reqwest")]
impl ReqwestClient {
    /// Wraps a configured reqwest client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        builder
    }
}

#[cfg(feature = "reqwest")]
#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let response = self
            .build(request)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<HttpStream, String> {
        let response = self
            .build(request)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(|e| e.to_string()));
        Ok(HttpStream {
            status,
            lines: ndjson_lines(chunks),
        })
    }
}
