//! Request forwarding with hop-by-hop filtering and single-retry
//! failover.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde_json::json;
use tracing::{debug, warn};

use crate::balancer::Backend;
use crate::ProxyState;

/// Headers that describe one TCP hop and must not be forwarded in
/// either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Catch-all handler: pick a backend round-robin, forward verbatim, and
/// fail over at most once when the connection attempt itself fails. An
/// HTTP error status from a backend is a valid answer and passes
/// through untouched.
pub async fn forward(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    for attempt in 0..2 {
        let Some(backend) = state.backends.pick() else {
            break;
        };

        match send_once(&state, &backend, &method, &path_and_query, &headers, body.clone(), peer)
            .await
        {
            Ok(response) => {
                backend.record_forwarded();
                debug!(
                    backend = %backend.url,
                    method = %method,
                    path = %path_and_query,
                    status = response.status().as_u16(),
                    "forwarded"
                );
                return response;
            }
            Err(e) => {
                backend.record_error();
                backend.mark_unreachable();
                warn!(
                    backend = %backend.url,
                    attempt,
                    error = %e,
                    "backend unreachable, failing over"
                );
            }
        }
    }

    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": "no_backend",
            "detail": "no healthy backend available",
        })),
    )
        .into_response()
}

async fn send_once(
    state: &ProxyState,
    backend: &Backend,
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
    peer: SocketAddr,
) -> Result<Response, reqwest::Error> {
    let url = format!("{}{}", backend.url, path_and_query);
    let mut request = state.client.request(method.clone(), &url);

    for (name, value) in headers {
        if is_hop_by_hop(name) || *name == axum::http::header::HOST {
            continue;
        }
        request = request.header(name, value);
    }
    request = request.header("x-forwarded-for", peer.ip().to_string());

    if !body.is_empty() {
        request = request.body(body);
    }

    let upstream = request.send().await?;
    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let bytes = upstream.bytes().await?;

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        if is_hop_by_hop(name) || *name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header("x-served-by", backend.url.as_str());

    // Infallible: status and headers were valid on the upstream response.
    Ok(builder.body(Body::from(bytes)).unwrap())
}

/// GET /proxy/stats — the proxy's own counters, never forwarded.
pub async fn stats(State(state): State<Arc<ProxyState>>) -> Json<serde_json::Value> {
    Json(json!({
        "healthy_backends": state.backends.healthy_count(),
        "backends": state.backends.stats(),
    }))
}
