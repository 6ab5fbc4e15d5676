//! The internal JSON stats endpoint: `GET /stats.json` returns counter
//! totals and rolling-window rates.

use crate::auth::SessionTracker;
use crate::metrics;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Failures while running the stats endpoint.
#[derive(Debug, Error)]
pub enum StatsError {
    /// The configured address did not parse.
    #[error("invalid stats address: {0}")]
    Addr(#[from] std::net::AddrParseError),
    /// The HTTP server failed.
    #[error("stats server error: {0}")]
    Http(#[from] hyper::Error),
}

/// Serves the stats endpoint until the process ends.
pub async fn serve(
    host: String,
    port: u16,
    sessions: Arc<SessionTracker>,
) -> Result<(), StatsError> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(address = %addr, "starting stats endpoint");

    let make_svc = make_service_fn(move |_conn| {
        let sessions = Arc::clone(&sessions);
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let sessions = Arc::clone(&sessions);
                async move { Ok::<_, Infallible>(handle(request, &sessions)) }
            }))
        }
    });

    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

fn handle(request: Request<Body>, sessions: &SessionTracker) -> Response<Body> {
    if request.method() == &Method::GET && request.uri().path() == "/stats.json" {
        let stats = json!({
            "totals": metrics::totals(),
            "rates": metrics::rates(),
            "num_clients": sessions.total_active(),
        });
        let mut response = Response::new(Body::from(stats.to_string()));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    } else {
        let mut response = Response::new(Body::from("not found"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
    }
}
