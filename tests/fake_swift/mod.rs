//! An in-process Swift lookalike for integration tests: v1 auth, account
//! and container listings with limit/marker/prefix/delimiter, object CRUD
//! with ranges and server-side copy, and on-demand token expiry.

use bytes::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use percent_encoding::percent_decode_str;
use serde_json::json;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

#[derive(Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    pub etag: String,
}

#[derive(Default)]
pub struct State {
    pub containers: Mutex<BTreeMap<String, BTreeMap<String, StoredObject>>>,
    pub valid_generation: AtomicU64,
    pub auth_requests: AtomicUsize,
    pub listing_requests: AtomicUsize,
    pub page_size: AtomicUsize,
}

pub struct FakeSwift {
    pub state: Arc<State>,
    pub addr: SocketAddr,
}

impl FakeSwift {
    pub async fn start(page_size: usize) -> FakeSwift {
        let state = Arc::new(State::default());
        state.page_size.store(page_size, Ordering::Relaxed);

        let shared = Arc::clone(&state);
        let make_svc = make_service_fn(move |_conn| {
            let state = Arc::clone(&shared);
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(handle(request, &state).await) }
                }))
            }
        });

        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        FakeSwift { state, addr }
    }

    pub fn auth_url(&self) -> String {
        format!("http://{}/auth/v1.0", self.addr)
    }

    /// Invalidates all outstanding tokens; the next data request with an old
    /// token sees a 401.
    pub fn expire_tokens(&self) {
        self.state.valid_generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn auth_requests(&self) -> usize {
        self.state.auth_requests.load(Ordering::SeqCst)
    }

    pub fn listing_requests(&self) -> usize {
        self.state.listing_requests.load(Ordering::SeqCst)
    }

    pub fn reset_listing_requests(&self) {
        self.state.listing_requests.store(0, Ordering::SeqCst);
    }
}

fn etag_for(data: &[u8]) -> String {
    if data.is_empty() {
        return EMPTY_MD5.to_string();
    }
    // Not a real MD5; stable per content, which is all the tests need.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:032x}", hash)
}

fn decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().to_string()
}

fn query_map(request: &Request<Body>) -> BTreeMap<String, String> {
    request
        .uri()
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), decode(value)),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn respond(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

async fn handle(request: Request<Body>, state: &Arc<State>) -> Response<Body> {
    let path = request.uri().path().to_string();

    if path == "/auth/v1.0" {
        return auth(request, state);
    }

    // Everything else is /v1/AUTH_<user>[/container[/object]]
    let current = format!(
        "token-{}",
        state.valid_generation.load(Ordering::SeqCst)
    );
    let token = request
        .headers()
        .get("x-auth-token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if token != current {
        return respond(StatusCode::UNAUTHORIZED);
    }

    let segments: Vec<String> = path
        .trim_start_matches("/v1/")
        .split('/')
        .map(decode)
        .collect();
    // segments[0] = AUTH_<user>
    let container = segments.get(1).filter(|s| !s.is_empty()).cloned();
    let object = if segments.len() > 2 {
        Some(segments[2..].join("/"))
    } else {
        None
    };

    match (request.method().clone(), container, object) {
        (method, None, None) if method == Method::HEAD => head_account(state),
        (method, None, None) if method == Method::GET => {
            state.listing_requests.fetch_add(1, Ordering::SeqCst);
            get_account(&query_map(&request), state)
        }
        (method, Some(container), None) if method == Method::HEAD => {
            head_container(&container, state)
        }
        (method, Some(container), None) if method == Method::GET => {
            state.listing_requests.fetch_add(1, Ordering::SeqCst);
            get_container(&container, &query_map(&request), state)
        }
        (method, Some(container), None) if method == Method::PUT => {
            state
                .containers
                .lock()
                .unwrap()
                .entry(container)
                .or_default();
            respond(StatusCode::CREATED)
        }
        (method, Some(container), None) if method == Method::DELETE => {
            let mut containers = state.containers.lock().unwrap();
            match containers.get(&container) {
                None => respond(StatusCode::NOT_FOUND),
                Some(objects) if !objects.is_empty() => respond(StatusCode::CONFLICT),
                Some(_) => {
                    containers.remove(&container);
                    respond(StatusCode::NO_CONTENT)
                }
            }
        }
        (method, Some(container), Some(object)) if method == Method::HEAD => {
            head_object(&container, &object, state)
        }
        (method, Some(container), Some(object)) if method == Method::GET => {
            get_object(&request, &container, &object, state)
        }
        (method, Some(container), Some(object)) if method == Method::PUT => {
            put_object(request, &container, &object, state).await
        }
        (method, Some(container), Some(object)) if method == Method::DELETE => {
            let mut containers = state.containers.lock().unwrap();
            match containers.get_mut(&container) {
                Some(objects) => {
                    if objects.remove(&object).is_some() {
                        respond(StatusCode::NO_CONTENT)
                    } else {
                        respond(StatusCode::NOT_FOUND)
                    }
                }
                None => respond(StatusCode::NOT_FOUND),
            }
        }
        _ => respond(StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn auth(request: Request<Body>, state: &Arc<State>) -> Response<Body> {
    state.auth_requests.fetch_add(1, Ordering::SeqCst);
    let user = request
        .headers()
        .get("x-auth-user")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let key = request
        .headers()
        .get("x-auth-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if user.is_empty() || key == "bad" {
        return respond(StatusCode::UNAUTHORIZED);
    }
    let token = format!("token-{}", state.valid_generation.load(Ordering::SeqCst));
    let host = request
        .headers()
        .get("host")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();
    Response::builder()
        .status(StatusCode::OK)
        .header("X-Storage-Url", format!("http://{}/v1/AUTH_{}", host, user))
        .header("X-Auth-Token", token)
        .body(Body::empty())
        .unwrap()
}

fn head_account(state: &Arc<State>) -> Response<Body> {
    let containers = state.containers.lock().unwrap();
    let bytes: usize = containers
        .values()
        .flat_map(|objects| objects.values())
        .map(|object| object.data.len())
        .sum();
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("X-Account-Container-Count", containers.len().to_string())
        .header("X-Account-Bytes-Used", bytes.to_string())
        .body(Body::empty())
        .unwrap()
}

fn get_account(query: &BTreeMap<String, String>, state: &Arc<State>) -> Response<Body> {
    let containers = state.containers.lock().unwrap();
    let marker = query.get("marker").cloned().unwrap_or_default();
    let page_size = effective_page_size(query, state);

    let entries: Vec<_> = containers
        .iter()
        .filter(|(name, _)| name.as_str() > marker.as_str())
        .take(page_size)
        .map(|(name, objects)| {
            let bytes: usize = objects.values().map(|object| object.data.len()).sum();
            json!({ "name": name, "count": objects.len(), "bytes": bytes })
        })
        .collect();
    json_response(&entries)
}

fn head_container(container: &str, state: &Arc<State>) -> Response<Body> {
    let containers = state.containers.lock().unwrap();
    match containers.get(container) {
        Some(objects) => {
            let bytes: usize = objects.values().map(|object| object.data.len()).sum();
            Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header("X-Container-Object-Count", objects.len().to_string())
                .header("X-Container-Bytes-Used", bytes.to_string())
                .body(Body::empty())
                .unwrap()
        }
        None => respond(StatusCode::NOT_FOUND),
    }
}

fn get_container(
    container: &str,
    query: &BTreeMap<String, String>,
    state: &Arc<State>,
) -> Response<Body> {
    let containers = state.containers.lock().unwrap();
    let objects = match containers.get(container) {
        Some(objects) => objects,
        None => return respond(StatusCode::NOT_FOUND),
    };

    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let marker = query.get("marker").cloned().unwrap_or_default();
    let delimiter = query.get("delimiter").and_then(|d| d.chars().next());
    let page_size = effective_page_size(query, state);

    // Collapse into (sorted, unique) entries first, then page.
    let mut collapsed: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for (name, object) in objects.iter() {
        if !name.starts_with(&prefix) {
            continue;
        }
        let remainder = &name[prefix.len()..];
        match delimiter {
            Some(delimiter) if remainder.contains(delimiter) => {
                let head = remainder.split(delimiter).next().unwrap_or("");
                let subdir = format!("{}{}{}", prefix, head, delimiter);
                collapsed
                    .entry(subdir.clone())
                    .or_insert_with(|| json!({ "subdir": subdir }));
            }
            _ => {
                collapsed.insert(
                    name.clone(),
                    json!({
                        "name": name,
                        "bytes": object.data.len(),
                        "content_type": object.content_type,
                        "last_modified": "2014-01-15T16:41:49.000000",
                        "hash": object.etag,
                    }),
                );
            }
        }
    }

    let entries: Vec<_> = collapsed
        .into_iter()
        .filter(|(name, _)| name.as_str() > marker.as_str())
        .take(page_size)
        .map(|(_, entry)| entry)
        .collect();
    json_response(&entries)
}

fn head_object(container: &str, object: &str, state: &Arc<State>) -> Response<Body> {
    let containers = state.containers.lock().unwrap();
    match containers.get(container).and_then(|objects| objects.get(object)) {
        Some(stored) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Length", stored.data.len().to_string())
            .header("Content-Type", stored.content_type.clone())
            .header("Etag", stored.etag.clone())
            .header("Last-Modified", "Wed, 15 Jan 2014 16:41:49 GMT")
            .body(Body::empty())
            .unwrap(),
        None => respond(StatusCode::NOT_FOUND),
    }
}

fn get_object(
    request: &Request<Body>,
    container: &str,
    object: &str,
    state: &Arc<State>,
) -> Response<Body> {
    let containers = state.containers.lock().unwrap();
    let stored = match containers.get(container).and_then(|objects| objects.get(object)) {
        Some(stored) => stored.clone(),
        None => return respond(StatusCode::NOT_FOUND),
    };
    drop(containers);

    let range_start = request
        .headers()
        .get("range")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| value.strip_suffix('-'))
        .and_then(|value| value.parse::<usize>().ok());

    let (status, data) = match range_start {
        Some(start) if start <= stored.data.len() => {
            (StatusCode::PARTIAL_CONTENT, stored.data.slice(start..))
        }
        Some(_) => return respond(StatusCode::RANGE_NOT_SATISFIABLE),
        None => (StatusCode::OK, stored.data.clone()),
    };

    Response::builder()
        .status(status)
        .header("Content-Type", stored.content_type)
        .header("Etag", stored.etag)
        .body(Body::from(data))
        .unwrap()
}

async fn put_object(
    request: Request<Body>,
    container: &str,
    object: &str,
    state: &Arc<State>,
) -> Response<Body> {
    let content_type = request
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let copy_from = request
        .headers()
        .get("x-copy-from")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_start_matches('/').to_string());

    let data = if copy_from.is_some() {
        Bytes::new()
    } else {
        match hyper::body::to_bytes(request.into_body()).await {
            Ok(data) => data,
            Err(_) => return respond(StatusCode::BAD_REQUEST),
        }
    };

    let mut containers = state.containers.lock().unwrap();

    let stored = if let Some(source) = copy_from {
        let (source_container, source_object) = match source.split_once('/') {
            Some(parts) => parts,
            None => return respond(StatusCode::BAD_REQUEST),
        };
        match containers
            .get(source_container)
            .and_then(|objects| objects.get(source_object))
        {
            Some(stored) => stored.clone(),
            None => return respond(StatusCode::NOT_FOUND),
        }
    } else {
        StoredObject {
            etag: etag_for(&data),
            content_type,
            data,
        }
    };

    match containers.get_mut(container) {
        Some(objects) => {
            objects.insert(object.to_string(), stored);
            respond(StatusCode::CREATED)
        }
        // The enclosing container must exist.
        None => respond(StatusCode::NOT_FOUND),
    }
}

fn effective_page_size(query: &BTreeMap<String, String>, state: &Arc<State>) -> usize {
    let configured = state.page_size.load(Ordering::Relaxed);
    let requested = query
        .get("limit")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(usize::MAX);
    configured.min(requested).max(1)
}

fn json_response(entries: &[serde_json::Value]) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(entries).unwrap()))
        .unwrap()
}
