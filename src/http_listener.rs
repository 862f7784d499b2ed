//! HTTP/HTTPS front end
//!
//! Routes the small set of local endpoints, hands `/{digest}/{url}` paths to
//! [`CamoProxy`], and stamps the configured response headers on everything
//! that leaves the process.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::any,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::proxy::{reject, split_signed_path, CamoProxy};
use crate::stats::ProxyStats;

/// Shared state for the router
#[derive(Clone)]
pub struct AppState {
    proxy: Arc<CamoProxy>,
    stats: Option<Arc<ProxyStats>>,
    expose_metrics: bool,
    headers: Arc<Vec<(HeaderName, HeaderValue)>>,
    close_connections: bool,
}

impl AppState {
    pub fn new(proxy: Arc<CamoProxy>) -> Self {
        Self {
            proxy,
            stats: None,
            expose_metrics: false,
            headers: Arc::new(Vec::new()),
            close_connections: false,
        }
    }

    /// Serve `/status` from these counters
    pub fn with_stats(mut self, stats: Arc<ProxyStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Serve the proxy's metrics at `/metrics`
    pub fn with_metrics_endpoint(mut self, enabled: bool) -> Self {
        self.expose_metrics = enabled;
        self
    }

    /// Headers added to every response that does not already carry them
    pub fn with_headers(mut self, headers: Vec<(HeaderName, HeaderValue)>) -> Self {
        self.headers = Arc::new(headers);
        self
    }

    /// Send `Connection: close` on every response
    pub fn with_connection_close(mut self, close: bool) -> Self {
        self.close_connections = close;
        self
    }
}

enum Route {
    Index,
    Health,
    Status,
    Metrics,
    Proxy,
    NotFound,
}

impl Route {
    fn classify(state: &AppState, path: &str) -> Self {
        match path {
            "/" => Route::Index,
            "/healthcheck" => Route::Health,
            "/status" if state.stats.is_some() => Route::Status,
            "/metrics" if state.expose_metrics => Route::Metrics,
            _ if split_signed_path(path).is_some() => Route::Proxy,
            _ => Route::NotFound,
        }
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .fallback(any(handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            response_headers_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return reject(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }

    match Route::classify(&state, req.uri().path()) {
        Route::Index => {
            let mut name = state.proxy.server_name().as_bytes().to_vec();
            name.push(b'\n');
            text(StatusCode::OK, "text/plain; charset=utf-8", name)
        }
        Route::Health => text(StatusCode::OK, "text/plain; charset=utf-8", "OK\n"),
        Route::Status => {
            let Some(stats) = &state.stats else {
                return reject(StatusCode::NOT_FOUND, "Not Found");
            };
            if wants_json(req.uri().query()) {
                text(StatusCode::OK, "application/json", stats.render_json())
            } else {
                text(StatusCode::OK, "text/plain; charset=utf-8", stats.render_text())
            }
        }
        Route::Metrics => text(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            state.proxy.metrics().export_prometheus(),
        ),
        Route::Proxy => state.proxy.serve(req).await,
        Route::NotFound => reject(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn wants_json(query: Option<&str>) -> bool {
    query.is_some_and(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .any(|(key, value)| key == "format" && value == "json")
    })
}

fn text(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

/// Server name, extra headers and request accounting
async fn response_headers_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let metrics = state.proxy.metrics().clone();
    metrics.request_start();
    let started = Instant::now();

    let mut response = next.run(req).await;

    metrics.request_end(response.status().as_u16(), started.elapsed());

    let headers = response.headers_mut();
    headers.insert(header::SERVER, state.proxy.server_name().clone());
    for (name, value) in state.headers.iter() {
        headers.entry(name).or_insert_with(|| value.clone());
    }
    if state.close_connections {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

/// Run the plain HTTP listener until `shutdown` resolves
pub async fn run_http_listener<F>(addr: SocketAddr, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("🌐 HTTP listener ready on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("HTTP listener on {} stopped", addr);
    Ok(())
}

/// Run the TLS listener until `handle` is told to shut down
pub async fn run_https_listener(
    addr: SocketAddr,
    cert_path: &Path,
    key_path: &Path,
    app: Router,
    handle: Handle,
) -> anyhow::Result<()> {
    if !cert_path.exists() {
        error!("❌ Certificate file not found: {:?}", cert_path);
        anyhow::bail!("certificate file not found: {:?}", cert_path);
    }
    if !key_path.exists() {
        error!("❌ Key file not found: {:?}", key_path);
        anyhow::bail!("key file not found: {:?}", key_path);
    }

    let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .with_context(|| format!("failed to load TLS material from {:?}", cert_path))?;
    info!("🔒 HTTPS listener ready on {}", addr);

    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    info!("HTTPS listener on {} stopped", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::config::DEFAULT_HEADERS;
    use crate::encoding::{encode_url, Codec};
    use crate::filter::FilterChain;
    use crate::proxy::ProxySettings;
    use crate::stats::MetricsCollector;
    use crate::upstream_proxy::UpstreamProxy;

    const KEY: &[u8] = b"router-test-key";

    fn state() -> (AppState, Arc<ProxyStats>) {
        let stats = Arc::new(ProxyStats::new());
        let settings = ProxySettings {
            hmac_key: KEY.to_vec(),
            server_name: "camo-test".to_string(),
            ..ProxySettings::default()
        };
        let proxy = CamoProxy::new(settings, UpstreamProxy::none(), FilterChain::new())
            .unwrap()
            .with_collector(stats.clone() as Arc<dyn MetricsCollector>);
        let headers = DEFAULT_HEADERS
            .iter()
            .map(|&(n, v)| (HeaderName::from_static(n), HeaderValue::from_static(v)))
            .collect();
        let state = AppState::new(Arc::new(proxy))
            .with_stats(stats.clone())
            .with_headers(headers);
        (state, stats)
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_index_and_healthcheck() {
        let (state, _) = state();
        let app = build_router(state);

        let (status, headers, body) = call(app.clone(), Method::GET, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "camo-test\n");
        assert_eq!(headers.get(header::SERVER).unwrap(), "camo-test");
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert!(headers.get(header::CONNECTION).is_none());

        let (status, _, body) = call(app, Method::GET, "/healthcheck").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK\n");
    }

    #[tokio::test]
    async fn test_only_get_and_head_allowed() {
        let (state, _) = state();
        let app = build_router(state);

        let (status, headers, body) = call(app.clone(), Method::POST, "/").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, "Method Not Allowed\n");
        assert_eq!(headers.get(header::SERVER).unwrap(), "camo-test");

        let (status, _, _) = call(app, Method::HEAD, "/healthcheck").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_paths_are_not_found() {
        let (state, _) = state();
        let app = build_router(state);

        for uri in ["/favicon.ico", "/a/b/c", "/metrics"] {
            let (status, _, body) = call(app.clone(), Method::GET, uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
            assert_eq!(body, "Not Found\n");
        }
    }

    #[tokio::test]
    async fn test_status_counts_proxied_requests() {
        let (state, stats) = state();
        let app = build_router(state);

        let (status, _, body) = call(app.clone(), Method::GET, "/abc/def").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Bad Signature\n");

        let path = encode_url(Codec::Hex, KEY, "http://127.0.0.1/a.png").unwrap();
        let (status, _, _) = call(app.clone(), Method::GET, &path).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(stats.snapshot().clients_served, 2);

        let (_, _, body) = call(app.clone(), Method::GET, "/status").await;
        assert_eq!(body, "ClientsServed, BytesServed\n2, 0\n");

        let (_, headers, body) = call(app, Method::GET, "/status?format=json").await;
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(body, "{\"ClientsServed\":2,\"BytesServed\":0}\n");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_and_connection_close() {
        let (state, _) = state();
        let app = build_router(state.with_metrics_endpoint(true).with_connection_close(true));

        let _ = call(app.clone(), Method::GET, "/healthcheck").await;
        let (status, headers, body) = call(app, Method::GET, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(header::CONNECTION).unwrap(), "close");
        assert!(body.contains("camo_http_requests_total 2"), "{}", body);
        assert!(body.contains("camo_http_responses_total{class=\"2xx\"} 1"), "{}", body);
    }

    #[test]
    fn test_wants_json() {
        assert!(wants_json(Some("format=json")));
        assert!(wants_json(Some("x=1&format=json")));
        assert!(!wants_json(Some("format=text")));
        assert!(!wants_json(None));
    }
}
