//! A streaming Swift client on top of the hyper client stack.
//!
//! ```no_run
//! use swftp::swift::SwiftConnection;
//! # async fn doc() -> Result<(), swftp::swift::Error> {
//! let http = SwiftConnection::default_http_client(std::time::Duration::from_secs(240), 10);
//! let conn = SwiftConnection::new(http, "http://127.0.0.1:8080/auth/v1.0", "user", "key");
//! conn.authenticate().await?;
//! let containers = conn.get_account(&Default::default()).await?;
//! # Ok(()) }
//! ```
//!
//! Every data request carries the current `X-Auth-Token`. When the backend
//! answers 401 or 403 the response body is discarded, one re-authentication
//! round-trip refreshes the token, and the original request is resubmitted
//! once. Token refresh is single flight: overlapping expiries converge on
//! one new token.

/// Error types for the Swift client and backend status classification.
pub mod error;
pub mod listing;
pub mod throttle;

pub use error::{check_status, Error, ErrorKind, Result};
pub use listing::{ContainerEntry, ObjectEntry};
pub use throttle::{Throttle, ThrottlePermit};

use crate::USER_AGENT;
use bytes::Bytes;
use futures::stream::Stream;
use hyper::{client::HttpConnector, Body, Client, Method, Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// The hyper client type shared by one authenticated session.
pub type HttpClient = Client<HttpsConnector<HttpConnector>>;

/// Response headers, lower-cased, single valued. When a header repeats the
/// last value wins.
pub type Headers = BTreeMap<String, String>;

// RFC 3986 unreserved characters plus '/', which stays a path separator.
const QUOTE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encodes a path segment or query value: UTF-8 bytes first, then
/// RFC 3986 percent-encoding with '/' treated as safe.
pub fn quote(value: &str) -> String {
    utf8_percent_encode(value, QUOTE_SET).collect()
}

fn lower_headers(response: &Response<Body>) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_lowercase(), value.to_string());
        }
    }
    headers
}

/// Storage URL rewrite applied after every successful authentication. Only
/// the scheme and/or network location are replaced; path, query and fragment
/// are preserved.
#[derive(Debug, Clone, Default)]
pub struct UrlRewrite {
    /// Replacement scheme, e.g. `https`.
    pub scheme: Option<String>,
    /// Replacement network location, e.g. `proxy.example.com:8080`.
    pub netloc: Option<String>,
}

impl UrlRewrite {
    /// Whether this rewrite changes anything at all.
    pub fn is_noop(&self) -> bool {
        self.scheme.is_none() && self.netloc.is_none()
    }

    /// Applies the rewrite to a URL. Unparseable URLs pass through.
    pub fn apply(&self, url: &str) -> String {
        if self.is_noop() {
            return url.to_string();
        }
        let (scheme, rest) = match url.split_once("://") {
            Some(parts) => parts,
            None => return url.to_string(),
        };
        let split_at = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (netloc, tail) = rest.split_at(split_at);
        format!(
            "{}://{}{}",
            self.scheme.as_deref().unwrap_or(scheme),
            self.netloc.as_deref().unwrap_or(netloc),
            tail
        )
    }
}

/// Listing query parameters for account and container GETs. Markers,
/// prefixes and paths are quoted here; `format=json` is always added.
#[derive(Debug, Clone, Default)]
pub struct ListingQuery {
    /// Page size cap requested from the backend.
    pub limit: Option<u64>,
    /// Return entries strictly after this name.
    pub marker: Option<String>,
    /// Return entries strictly before this name.
    pub end_marker: Option<String>,
    /// Only entries starting with this prefix.
    pub prefix: Option<String>,
    /// Swift `path` listing parameter.
    pub path: Option<String>,
    /// Collapse entries on this delimiter.
    pub delimiter: Option<char>,
}

impl ListingQuery {
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("format", "json".to_string())];
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(marker) = &self.marker {
            params.push(("marker", quote(marker)));
        }
        if let Some(end_marker) = &self.end_marker {
            params.push(("end_marker", quote(end_marker)));
        }
        if let Some(prefix) = &self.prefix {
            params.push(("prefix", quote(prefix)));
        }
        if let Some(path) = &self.path {
            params.push(("path", quote(path)));
        }
        if let Some(delimiter) = self.delimiter {
            params.push(("delimiter", quote(&delimiter.to_string())));
        }
        params
    }
}

/// Request body handed to [`SwiftConnection::make_request`].
///
/// Only replayable bodies take part in the 401/403 retry dance; a one-shot
/// stream cannot be resubmitted, so an expired token surfaces to the caller
/// instead.
#[derive(Debug)]
pub enum RequestBody {
    /// No body. Sent with `Content-Length: 0` on PUT.
    Empty,
    /// A fully buffered, replayable body.
    Buffered(Bytes),
    /// A one-shot streaming body of unknown length (chunked transfer).
    Stream(Body),
}

impl RequestBody {
    fn replayable(&self) -> bool {
        !matches!(self, RequestBody::Stream(_))
    }

    fn to_body(&mut self) -> Body {
        match self {
            RequestBody::Empty => Body::empty(),
            RequestBody::Buffered(bytes) => Body::from(bytes.clone()),
            RequestBody::Stream(body) => std::mem::replace(body, Body::empty()),
        }
    }
}

#[derive(Debug, Clone)]
struct AuthState {
    storage_url: String,
    token: String,
    generation: u64,
}

/// A connection to a Swift compatible backend, bound to one authenticated
/// gateway session.
///
/// Holds the mutable authentication state (storage URL and token), the
/// immutable credentials, the per-session hyper pool and the ordered
/// throttle acquired around every request.
#[derive(Debug)]
pub struct SwiftConnection {
    auth_url: String,
    username: String,
    api_key: String,
    extra_headers: Vec<(String, String)>,
    rewrite: UrlRewrite,
    throttle: Throttle,
    http: HttpClient,
    state: RwLock<Option<AuthState>>,
    reauth: Mutex<()>,
}

impl SwiftConnection {
    /// Creates an unauthenticated connection. Call
    /// [`authenticate`](Self::authenticate) before issuing data requests.
    pub fn new(
        http: HttpClient,
        auth_url: impl Into<String>,
        username: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        SwiftConnection {
            auth_url: auth_url.into(),
            username: username.into(),
            api_key: api_key.into(),
            extra_headers: Vec::new(),
            rewrite: UrlRewrite::default(),
            throttle: Throttle::default(),
            http,
            state: RwLock::new(None),
            reauth: Mutex::new(()),
        }
    }

    /// Builds the hyper client for one login. The pool keeps connections
    /// alive for `idle_timeout` and at most `max_idle_per_host` of them;
    /// zero disables reuse entirely.
    pub fn default_http_client(idle_timeout: Duration, max_idle_per_host: usize) -> HttpClient {
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Client::builder()
            .pool_idle_timeout(idle_timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .build(connector)
    }

    /// Sets the ordered throttle acquired around every request.
    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = throttle;
        self
    }

    /// Adds headers injected on every backend request, including auth.
    pub fn with_extra_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.extra_headers = headers;
        self
    }

    /// Sets the storage URL rewrite applied after each authentication.
    pub fn with_rewrite(mut self, rewrite: UrlRewrite) -> Self {
        self.rewrite = rewrite;
        self
    }

    /// The username this connection authenticated as.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The storage URL of the authenticated account, after rewrite.
    pub async fn storage_url(&self) -> Option<String> {
        self.state.read().await.as_ref().map(|s| s.storage_url.clone())
    }

    /// Exchanges the credentials for a fresh storage URL and token.
    #[tracing_attributes::instrument(level = "debug", skip(self), fields(user = %self.username))]
    pub async fn authenticate(&self) -> Result<()> {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(&self.auth_url)
            .header("User-Agent", USER_AGENT.as_str())
            .header("X-Auth-User", &self.username)
            .header("X-Auth-Key", &self.api_key);
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder
            .body(Body::empty())
            .map_err(|e| Error::new(ErrorKind::LocalError, e))?;

        let response = self
            .http
            .request(request)
            .await
            .map_err(|e| Error::new(ErrorKind::ConnectionLost, e))?;
        let status = response.status().as_u16();
        let headers = lower_headers(&response);
        check_status(status).map_err(Error::from)?;

        let storage_url = headers
            .get("x-storage-url")
            .ok_or_else(|| Error::new(ErrorKind::LocalError, "auth response without X-Storage-Url"))?;
        let token = headers
            .get("x-auth-token")
            .ok_or_else(|| Error::new(ErrorKind::LocalError, "auth response without X-Auth-Token"))?;
        let storage_url = self.rewrite.apply(storage_url);

        let mut state = self.state.write().await;
        let generation = state.as_ref().map(|s| s.generation + 1).unwrap_or(0);
        tracing::debug!(generation, storage_url = %storage_url, "authenticated");
        *state = Some(AuthState {
            storage_url,
            token: token.clone(),
            generation,
        });
        Ok(())
    }

    // Refreshes the token at most once for the generation the failing
    // request observed. A caller that lost the race finds a newer generation
    // and skips the redundant round-trip.
    async fn refresh_token(&self, seen_generation: u64) -> Result<()> {
        let _guard = self.reauth.lock().await;
        let current = self.state.read().await.as_ref().map(|s| s.generation);
        if current != Some(seen_generation) {
            return Ok(());
        }
        self.authenticate().await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        token: &str,
        body: Body,
    ) -> Result<Response<Body>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(url)
            .header("User-Agent", USER_AGENT.as_str())
            .header("X-Auth-Token", token);
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder
            .body(body)
            .map_err(|e| Error::new(ErrorKind::LocalError, e))?;
        self.http
            .request(request)
            .await
            .map_err(|e| Error::new(ErrorKind::ConnectionLost, e))
    }

    /// Issues one throttled, authenticated request against the storage URL.
    ///
    /// `path` must already be quoted; `params` values likewise where the API
    /// requires it. On a 401/403 first answer the token is refreshed once
    /// and the request resubmitted; a second 401/403 surfaces.
    pub async fn make_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        headers: &[(String, String)],
        mut body: RequestBody,
    ) -> Result<SwiftResponse> {
        let permit = self.throttle.acquire().await;
        let state = self
            .state
            .read()
            .await
            .clone()
            .ok_or(ErrorKind::UnAuthenticated)?;

        let mut url = format!("{}/{}", state.storage_url, path);
        if !params.is_empty() {
            let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            url = format!("{}?{}", url, query.join("&"));
        }

        let mut response = self
            .send(method.clone(), &url, headers, &state.token, body.to_body())
            .await?;

        let status = response.status().as_u16();
        if (status == 401 || status == 403) && body.replayable() {
            // The stale body is dropped unread; hyper tears the stream down.
            drop(response);
            self.refresh_token(state.generation).await?;
            let fresh = self
                .state
                .read()
                .await
                .clone()
                .ok_or(ErrorKind::UnAuthenticated)?;
            response = self
                .send(method.clone(), &url, headers, &fresh.token, body.to_body())
                .await?;
        }

        let status = response.status().as_u16();
        tracing::debug!(method = %method, url = %url, status, "swift request");
        check_status(status).map_err(Error::from)?;
        Ok(SwiftResponse {
            status,
            headers: lower_headers(&response),
            body: response.into_body(),
            permit,
        })
    }

    /// HEAD the account root; yields the account headers.
    pub async fn head_account(&self) -> Result<Headers> {
        let response = self
            .make_request(Method::HEAD, "", &[], &[], RequestBody::Empty)
            .await?;
        Ok(response.into_headers())
    }

    /// One page of the account listing.
    pub async fn get_account(&self, query: &ListingQuery) -> Result<Vec<ContainerEntry>> {
        let response = self
            .make_request(Method::GET, "", &query.params(), &[], RequestBody::Empty)
            .await?;
        response.json().await
    }

    /// HEAD a container; yields the container headers.
    pub async fn head_container(&self, container: &str) -> Result<Headers> {
        let response = self
            .make_request(Method::HEAD, &quote(container), &[], &[], RequestBody::Empty)
            .await?;
        Ok(response.into_headers())
    }

    /// One page of a container listing.
    pub async fn get_container(
        &self,
        container: &str,
        query: &ListingQuery,
    ) -> Result<Vec<ObjectEntry>> {
        let response = self
            .make_request(
                Method::GET,
                &quote(container),
                &query.params(),
                &[],
                RequestBody::Empty,
            )
            .await?;
        response.json().await
    }

    /// Creates a container.
    pub async fn put_container(&self, container: &str, headers: &[(String, String)]) -> Result<()> {
        self.make_request(
            Method::PUT,
            &quote(container),
            &[],
            headers,
            RequestBody::Empty,
        )
        .await?
        .discard()
        .await
    }

    /// Deletes a container. The backend answers 409 when it is not empty.
    pub async fn delete_container(&self, container: &str) -> Result<()> {
        self.make_request(Method::DELETE, &quote(container), &[], &[], RequestBody::Empty)
            .await?
            .discard()
            .await
    }

    /// HEAD an object; yields the object headers.
    pub async fn head_object(&self, container: &str, path: &str) -> Result<Headers> {
        let full = format!("{}/{}", quote(container), quote(path));
        let response = self
            .make_request(Method::HEAD, &full, &[], &[], RequestBody::Empty)
            .await?;
        Ok(response.into_headers())
    }

    /// GETs an object, streaming. The returned response keeps the throttle
    /// permits alive until its body is fully consumed or dropped.
    pub async fn get_object(
        &self,
        container: &str,
        path: &str,
        headers: &[(String, String)],
    ) -> Result<SwiftResponse> {
        let full = format!("{}/{}", quote(container), quote(path));
        self.make_request(Method::GET, &full, &[], headers, RequestBody::Empty)
            .await
    }

    /// PUTs an object in exactly one request. Without a body the object is
    /// created zero length (`Content-Length: 0`); a streaming body goes out
    /// chunked with no precomputed length.
    pub async fn put_object(
        &self,
        container: &str,
        path: &str,
        headers: &[(String, String)],
        body: RequestBody,
    ) -> Result<Headers> {
        let full = format!("{}/{}", quote(container), quote(path));
        let mut headers = headers.to_vec();
        if matches!(body, RequestBody::Empty) {
            headers.push(("Content-Length".to_string(), "0".to_string()));
        }
        let response = self
            .make_request(Method::PUT, &full, &[], &headers, body)
            .await?;
        let headers = response.headers.clone();
        response.discard().await?;
        Ok(headers)
    }

    /// Deletes an object.
    pub async fn delete_object(&self, container: &str, path: &str) -> Result<()> {
        let full = format!("{}/{}", quote(container), quote(path));
        self.make_request(Method::DELETE, &full, &[], &[], RequestBody::Empty)
            .await?
            .discard()
            .await
    }
}

/// A classified backend response. Dropping it releases the throttle permits;
/// [`into_stream`](Self::into_stream) moves them into the body so streamed
/// downloads keep their slot until the last byte.
#[derive(Debug)]
pub struct SwiftResponse {
    /// HTTP status, already known to be a success.
    pub status: u16,
    /// Lower-cased, single-valued response headers.
    pub headers: Headers,
    body: Body,
    permit: ThrottlePermit,
}

impl SwiftResponse {
    /// Reads the whole body. A 204 short-circuits to empty without touching
    /// the stream.
    pub async fn read_body(self) -> Result<Bytes> {
        if self.status == 204 {
            return Ok(Bytes::new());
        }
        let bytes = hyper::body::to_bytes(self.body)
            .await
            .map_err(|e| Error::new(ErrorKind::ConnectionLost, e))?;
        drop(self.permit);
        Ok(bytes)
    }

    /// Deserializes the body as JSON.
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        let bytes = self.read_body().await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::new(ErrorKind::LocalError, e))
    }

    /// Returns the headers, dropping the body unread.
    pub fn into_headers(self) -> Headers {
        self.headers
    }

    /// Drops the body unread.
    pub async fn discard(self) -> Result<()> {
        Ok(())
    }

    /// Turns the response into a byte stream that owns the throttle permits.
    pub fn into_stream(self) -> SwiftBody {
        SwiftBody {
            inner: self.body,
            _permit: self.permit,
        }
    }
}

/// Streaming response body; hyper transport errors surface as
/// [`ErrorKind::ConnectionLost`].
#[derive(Debug)]
pub struct SwiftBody {
    inner: Body,
    _permit: ThrottlePermit,
}

impl Stream for SwiftBody {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                Poll::Ready(Some(Err(Error::new(ErrorKind::ConnectionLost, e))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
