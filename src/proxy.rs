//! The reverse-proxy request path: one worker lookup, then either a
//! static file, a branded error page, a FastCGI round-trip, or a
//! dispatch-then-reverse-proxy to a native/script instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request as HyperRequest, StatusCode as HyperStatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use poem::http::StatusCode;
use poem::web::Data;
use poem::{handler, Body, IntoResponse, Request, Response};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{Mode, WorkerKind};
use crate::error::DispatchError;
use crate::error_page;
use crate::fastcgi::{CgiParams, FastCgiClient};
use crate::instance::{InstanceHandle, InstanceState};
use crate::metrics::Metrics;
use crate::registry::WorkerRegistry;
use crate::worker::{BuildState, WorkerHandle};

pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);
const CORRELATION_HEADER: &str = "x-correlation-id";

type ProxyClient = Client<HttpConnector, Full<Bytes>>;

pub struct ProxyState {
    pub registry: Arc<WorkerRegistry>,
    pub metrics: Arc<Metrics>,
    pub mode: Mode,
    pub workers_root: PathBuf,
    pub server_public_root: PathBuf,
    pub fastcgi: Arc<dyn FastCgiClient>,
    http_client: ProxyClient,
}

impl ProxyState {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        metrics: Arc<Metrics>,
        mode: Mode,
        workers_root: PathBuf,
        server_public_root: PathBuf,
        fastcgi: Arc<dyn FastCgiClient>,
    ) -> Self {
        Self {
            registry,
            metrics,
            mode,
            workers_root,
            server_public_root,
            fastcgi,
            http_client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }
}

#[handler]
pub async fn proxy(req: &Request, body: Body, Data(state): Data<&Arc<ProxyState>>) -> Response {
    let correlation_id = req
        .header(CORRELATION_HEADER)
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let accept = req.header("accept").map(|v| v.to_string());
    let path = req.uri().path().to_string();

    async {
        handle(req, body, state, &path, accept.as_deref()).await
    }
    .instrument(info_span!("proxy_request", correlation_id = %correlation_id, path = %path))
    .await
    .with_header(CORRELATION_HEADER, correlation_id)
}

async fn handle(
    req: &Request,
    body: Body,
    state: &Arc<ProxyState>,
    path: &str,
    accept: Option<&str>,
) -> Response {
    let Some(worker) = state.registry.lookup(path).await else {
        return error_page::not_found(accept);
    };

    if let Some(response) = serve_static(state, &worker.name, path).await {
        return response;
    }

    let snapshot = worker.snapshot().await;
    if let BuildState::Error(message) = &snapshot.build_state {
        return match state.mode {
            Mode::Dev => error_page::build_error_dev(&worker.name, message, accept),
            Mode::Prod => error_page::build_error_prod(),
        };
    }

    let start = Instant::now();
    let instance = match obtain_instance(&worker).await {
        Ok(instance) => instance,
        Err(e) => {
            warn!(worker = %worker.name, error = %e, "dispatch failed");
            let page = dispatch_error_page(&worker.name, e, accept);
            record(state, &worker.name, page.status().as_u16(), start);
            return page;
        }
    };

    let response = if worker.kind == WorkerKind::Cgi {
        proxy_cgi(state, &worker.name, instance.port, req, body, path).await
    } else {
        proxy_http(state, instance.port, req, body, &worker.url_prefix, path).await
    };

    let status_class = match response.status().as_u16() {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    state
        .metrics
        .record_request(&worker.name, status_class, start.elapsed().as_secs_f64());
    response
}

/// Dispatches a token, then re-checks the picked instance against the
/// worker's published snapshot before handing it back — closes the race
/// where an instance the monitor just marked unhealthy (or the
/// dispatcher is mid-draining) was already in flight on the queue.
async fn obtain_instance(worker: &WorkerHandle) -> Result<InstanceHandle, DispatchError> {
    let instance = worker.dispatch(DISPATCH_TIMEOUT).await?;
    let snapshot = worker.snapshot().await;
    let still_healthy = snapshot
        .instances
        .iter()
        .any(|i| i.id == instance.id && i.state == InstanceState::Healthy);
    if !still_healthy {
        return Err(DispatchError::InstanceUnhealthy);
    }
    Ok(instance)
}

/// Maps a failed dispatch to the branded error page spec §7 assigns it.
fn dispatch_error_page(worker: &str, err: DispatchError, accept: Option<&str>) -> Response {
    match err {
        DispatchError::Timeout => error_page::gateway_timeout(worker, accept),
        DispatchError::QueueFull => error_page::queue_full(worker, accept),
        DispatchError::NoInstance | DispatchError::InstanceUnhealthy => {
            error_page::no_instance(worker, accept)
        }
    }
}

fn record(state: &Arc<ProxyState>, worker: &str, status: u16, start: Instant) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    state
        .metrics
        .record_request(worker, status_class, start.elapsed().as_secs_f64());
}

/// Tries `workers/<name>/public/<path>`, then `server/public/<path>`.
/// Returns `None` when neither matches a regular file, so the caller can
/// fall through to dispatch.
async fn serve_static(state: &Arc<ProxyState>, worker_name: &str, path: &str) -> Option<Response> {
    let relative = path.trim_start_matches('/');
    let worker_public = state.workers_root.join(worker_name).join("public").join(relative);
    if let Some(response) = try_serve_file(&worker_public).await {
        return Some(response);
    }
    let server_public = state.server_public_root.join(relative);
    try_serve_file(&server_public).await
}

async fn try_serve_file(path: &Path) -> Option<Response> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    let file = tokio::fs::File::open(path).await.ok()?;
    let content_type = content_type_for(path);
    Some(
        Response::builder()
            .content_type(content_type)
            .body(Body::from_async_read(file)),
    )
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

async fn proxy_cgi(
    state: &Arc<ProxyState>,
    worker_name: &str,
    port: u16,
    req: &Request,
    body: Body,
    path: &str,
) -> Response {
    let stdin = body.into_bytes().await.unwrap_or_default();
    let document_root = state.workers_root.join(worker_name).join("public");
    let relative = path.trim_start_matches('/');
    let script_filename = document_root.join(relative);

    let mut params = CgiParams::new();
    params.insert("REQUEST_METHOD".to_string(), req.method().to_string());
    params.insert("REQUEST_URI".to_string(), path.to_string());
    params.insert("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string());
    params.insert("CONTENT_LENGTH".to_string(), stdin.len().to_string());
    params.insert(
        "SCRIPT_FILENAME".to_string(),
        script_filename.display().to_string(),
    );
    params.insert(
        "DOCUMENT_ROOT".to_string(),
        document_root.display().to_string(),
    );
    params.insert("REMOTE_ADDR".to_string(), req.remote_addr().to_string());
    if let Some(content_type) = req.header("content-type") {
        params.insert("CONTENT_TYPE".to_string(), content_type.to_string());
    }
    for (name, value) in req.headers().iter() {
        let lower = name.as_str();
        if lower.eq_ignore_ascii_case("content-type") || lower.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            let key = format!("HTTP_{}", lower.to_uppercase().replace('-', "_"));
            params.insert(key, value.to_string());
        }
    }

    match state
        .fastcgi
        .round_trip(("127.0.0.1", port), params, stdin)
        .await
    {
        Ok(cgi_response) => {
            let mut builder = Response::builder().status(
                StatusCode::from_u16(cgi_response.status).unwrap_or(StatusCode::OK),
            );
            for (name, value) in cgi_response.headers {
                builder = builder.header(name, value);
            }
            builder.body(Body::from(cgi_response.body))
        }
        Err(e) => {
            warn!(worker = %worker_name, error = %e, "fastcgi round trip failed");
            error_page::bad_gateway(req.header("accept"))
        }
    }
}

async fn proxy_http(
    state: &Arc<ProxyState>,
    port: u16,
    req: &Request,
    body: Body,
    url_prefix: &str,
    path: &str,
) -> Response {
    let stripped = path.strip_prefix(url_prefix).unwrap_or(path);
    let stripped = if stripped.is_empty() { "/" } else { stripped };
    let query = req.uri().query().map(|q| format!("?{q}")).unwrap_or_default();
    let target: Uri = match format!("http://127.0.0.1:{port}{stripped}{query}").parse() {
        Ok(uri) => uri,
        Err(_) => return error_page::bad_gateway(req.header("accept")),
    };

    let mut builder = HyperRequest::builder().method(req.method().clone()).uri(target);
    for (name, value) in req.headers().iter() {
        builder = builder.header(name, value);
    }

    let body_bytes = body.into_bytes().await.unwrap_or_default();
    let hyper_request = match builder.body(Full::new(body_bytes)) {
        Ok(r) => r,
        Err(_) => return error_page::bad_gateway(req.header("accept")),
    };

    match state.http_client.request(hyper_request).await {
        Ok(upstream) => {
            let status = upstream.status();
            let headers = upstream.headers().clone();
            let collected = match upstream.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => return error_page::bad_gateway(req.header("accept")),
            };
            let mut builder = Response::builder().status(poem_status(status));
            for (name, value) in headers.iter() {
                builder = builder.header(name, value);
            }
            builder.body(Body::from(collected))
        }
        Err(_) => error_page::bad_gateway(req.header("accept")),
    }
}

fn poem_status(status: HyperStatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_guess_covers_common_extensions() {
        assert_eq!(content_type_for(Path::new("index.html")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("app.js")), "application/javascript; charset=utf-8");
        assert_eq!(content_type_for(Path::new("data.bin")), "application/octet-stream");
    }

    #[test]
    fn dispatch_errors_map_to_the_spec_status_table() {
        assert_eq!(
            dispatch_error_page("api", DispatchError::Timeout, None).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            dispatch_error_page("api", DispatchError::QueueFull, None).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            dispatch_error_page("api", DispatchError::NoInstance, None).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            dispatch_error_page("api", DispatchError::InstanceUnhealthy, None).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
