//! Thin HTTP host: picks a site by `Host`, maps the path to a unit and runs
//! the instance.

mod middleware;

use std::collections::{BTreeMap, HashMap};
use std::future::IntoFuture;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode, Uri,
        header::{CONTENT_TYPE, HOST},
    },
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::application::error::HttpError;
use crate::application::site::SiteRuntime;
use crate::backend::{HandlerRequest, HandlerResponse, Value};
use crate::config::ServerSettings;

use super::error::InfraError;

pub use middleware::{REQUEST_ID_HEADER, RequestContext};
use middleware::{log_responses, set_request_context};

const ACTION_QUERY_KEY: &str = "action";
const DEFAULT_DOCUMENT: &str = "index";

/// Which site and unit served a response, for the response logger.
#[derive(Debug, Clone)]
pub struct DispatchInfo {
    pub site: String,
    pub type_name: String,
}

/// Sites served by this host, in configuration order.
pub struct SiteDirectory {
    sites: Vec<Arc<SiteRuntime>>,
    by_host: HashMap<String, usize>,
}

impl SiteDirectory {
    pub fn new(sites: Vec<SiteRuntime>) -> Self {
        let mut by_host = HashMap::new();
        for (index, site) in sites.iter().enumerate() {
            for host in site.hosts() {
                by_host.entry(host.to_ascii_lowercase()).or_insert(index);
            }
        }
        Self {
            sites: sites.into_iter().map(Arc::new).collect(),
            by_host,
        }
    }

    /// Site for a `Host` header value. Unknown or missing hosts fall back to
    /// the first configured site.
    pub fn pick(&self, host: Option<&str>) -> Option<&Arc<SiteRuntime>> {
        let matched = host
            .map(|host| strip_port(host).to_ascii_lowercase())
            .and_then(|host| self.by_host.get(&host).copied());
        self.sites.get(matched.unwrap_or(0))
    }

    pub fn sites(&self) -> &[Arc<SiteRuntime>] {
        &self.sites
    }
}

#[derive(Clone)]
pub struct HttpState {
    pub sites: Arc<SiteDirectory>,
}

impl HttpState {
    pub fn new(sites: Vec<SiteRuntime>) -> Self {
        Self {
            sites: Arc::new(SiteDirectory::new(sites)),
        }
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/_health", get(health))
        .fallback(dispatch)
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

/// Serve until ctrl-c, then give in-flight requests up to the configured
/// grace period.
pub async fn serve(settings: &ServerSettings, state: HttpState) -> Result<(), InfraError> {
    let listener = tokio::net::TcpListener::bind(settings.addr).await?;
    let addr = listener.local_addr()?;
    info!(
        target = "kiln::http",
        addr = %addr,
        sites = state.sites.sites().len(),
        "listening"
    );

    let stopping = Arc::new(Notify::new());
    let server = axum::serve(listener, build_router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&stopping)));

    let grace = settings.graceful_shutdown;
    let deadline = async move {
        stopping.notified().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server.into_future() => result.map_err(InfraError::from),
        () = deadline => {
            warn!(
                target = "kiln::http",
                grace_seconds = grace.as_secs(),
                "graceful shutdown timed out; dropping in-flight requests"
            );
            Ok(())
        }
    }
}

async fn shutdown_signal(stopping: Arc<Notify>) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(
            target = "kiln::http",
            error = %error,
            "failed to listen for ctrl-c; shutting down"
        );
    }
    info!(target = "kiln::http", "shutdown requested");
    stopping.notify_one();
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn dispatch(
    State(state): State<HttpState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(mut query): Query<BTreeMap<String, String>>,
) -> Result<Response, HttpError> {
    let host = headers.get(HOST).and_then(|value| value.to_str().ok());
    let site = state.sites.pick(host).cloned().ok_or_else(|| {
        HttpError::new(
            "infra::http::dispatch",
            StatusCode::NOT_FOUND,
            "Not found",
            "no site is configured",
        )
    })?;

    let path = match uri.path().trim_start_matches('/') {
        "" => DEFAULT_DOCUMENT,
        path => path,
    };
    let action = query.remove(ACTION_QUERY_KEY);

    let mut handler = site
        .create_instance(path, None, &[Value::from(site.name())])
        .await?;
    let type_name = handler.type_name().to_string();

    let request = HandlerRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query,
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
    };

    let outcome = tokio::task::spawn_blocking(move || match action {
        Some(action) => handler.invoke_action(&action, &request),
        None => handler.process(&request),
    })
    .await
    .map_err(|join_error| {
        HttpError::new(
            "infra::http::dispatch",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            format!("handler `{type_name}` did not complete: {join_error}"),
        )
    })??;

    let mut response = into_http_response(outcome);
    response.extensions_mut().insert(DispatchInfo {
        site: site.name().to_string(),
        type_name,
    });
    Ok(response)
}

fn into_http_response(outcome: HandlerResponse) -> Response {
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, outcome.body).into_response();
    if let Ok(value) = HeaderValue::from_str(&outcome.content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their colons.
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(host, |(addr, _)| addr);
    }
    host.rsplit_once(':').map_or(host, |(name, _)| name)
}
