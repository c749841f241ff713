use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

use super::DispatchInfo;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// Tags the request with an id, reusing a well-formed inbound `x-request-id`,
/// and echoes it on the response.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

struct Served {
    status: StatusCode,
    method: String,
    path: String,
    query: String,
    elapsed_ms: u128,
    request_id: String,
    site: String,
    unit: String,
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_owned();
    let query = request.uri().query().unwrap_or_default().to_owned();
    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let (site, unit) = response
        .extensions()
        .get::<DispatchInfo>()
        .map(|info| (info.site.clone(), info.type_name.clone()))
        .unwrap_or_default();
    let served = Served {
        status: response.status(),
        method,
        path,
        query,
        elapsed_ms: start.elapsed().as_millis(),
        request_id,
        site,
        unit,
    };

    let report = response.extensions_mut().remove::<ErrorReport>();
    record(&served, report);
    response
}

fn record(served: &Served, report: Option<ErrorReport>) {
    let status = served.status;
    if !(status.is_client_error() || status.is_server_error()) {
        info!(
            target = "kiln::http::response",
            status = status.as_u16(),
            method = %served.method,
            path = %served.path,
            elapsed_ms = served.elapsed_ms,
            request_id = %served.request_id,
            site = %served.site,
            unit = %served.unit,
            "request served",
        );
        return;
    }

    let (source, chain) = report
        .map(|report| (report.source, report.messages))
        .unwrap_or(("unknown", Vec::new()));
    let detail = chain
        .first()
        .map(String::as_str)
        .unwrap_or("no diagnostic available");

    macro_rules! failed {
        ($level:ident, $message:literal) => {
            $level!(
                target = "kiln::http::response",
                status = status.as_u16(),
                method = %served.method,
                path = %served.path,
                query = %served.query,
                elapsed_ms = served.elapsed_ms,
                request_id = %served.request_id,
                site = %served.site,
                unit = %served.unit,
                source = source,
                detail = %detail,
                chain = ?chain,
                $message,
            )
        };
    }

    if status.is_server_error() {
        failed!(error, "request failed");
    } else {
        failed!(warn, "client request error");
    }
}
