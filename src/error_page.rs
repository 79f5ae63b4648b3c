//! Renders the branded error responses the proxy handler returns for
//! build failures, dispatch failures, and upstream proxy errors.
//! Content negotiation is deliberately coarse: `Accept: text/html`
//! (or its absence, the documented default) gets the HTML page,
//! anything else gets the plain-text body — both preserve the status
//! code the caller asked for.

use poem::http::StatusCode;
use poem::{Body, IntoResponse, Response};

const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>tqserver: {title}</title></head>
<body>
<h1>{title}</h1>
<p>{message}</p>
</body>
</html>
"#;

/// Renders `message` at `status`, choosing HTML or plain text based on
/// whether the caller's `Accept` header mentions `text/html`. Absence of
/// an `Accept` header is treated as accepting HTML, matching browser
/// navigations without an explicit header.
pub fn render(status: StatusCode, title: &str, message: &str, accept: Option<&str>) -> Response {
    let wants_html = accept.map(|a| a.contains("text/html")).unwrap_or(true);
    if wants_html {
        let body = PAGE_TEMPLATE
            .replace("{title}", title)
            .replace("{message}", message);
        Response::builder()
            .status(status)
            .content_type("text/html; charset=utf-8")
            .body(Body::from_string(body))
    } else {
        Response::builder()
            .status(status)
            .content_type("text/plain; charset=utf-8")
            .body(Body::from_string(format!("{title}: {message}")))
    }
    .into_response()
}

/// The build-error page: rendered with status 200 in dev mode so the
/// browser displays it instead of treating the page load itself as a
/// failure, per the documented dev-mode affordance.
pub fn build_error_dev(worker: &str, message: &str, accept: Option<&str>) -> Response {
    render(
        StatusCode::OK,
        "Build failed",
        &format!("worker \"{worker}\" failed to build: {message}"),
        accept,
    )
}

pub fn build_error_prod() -> Response {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::empty())
}

pub fn not_found(accept: Option<&str>) -> Response {
    render(
        StatusCode::NOT_FOUND,
        "Not found",
        "no worker is registered for this path",
        accept,
    )
}

pub fn queue_full(worker: &str, accept: Option<&str>) -> Response {
    render(
        StatusCode::SERVICE_UNAVAILABLE,
        "Service unavailable",
        &format!("worker \"{worker}\" is at capacity, try again shortly"),
        accept,
    )
}

pub fn no_instance(worker: &str, accept: Option<&str>) -> Response {
    render(
        StatusCode::SERVICE_UNAVAILABLE,
        "Service unavailable",
        &format!("worker \"{worker}\" has no available instance"),
        accept,
    )
}

/// The dispatch-token wait (30 s) elapsed with no instance handed back.
pub fn gateway_timeout(worker: &str, accept: Option<&str>) -> Response {
    render(
        StatusCode::GATEWAY_TIMEOUT,
        "Gateway timeout",
        &format!("worker \"{worker}\" did not respond within the dispatch deadline"),
        accept,
    )
}

pub fn bad_gateway(accept: Option<&str>) -> Response {
    render(
        StatusCode::BAD_GATEWAY,
        "Bad gateway",
        "the upstream worker failed to respond",
        accept,
    )
}
