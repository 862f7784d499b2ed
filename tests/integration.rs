//! Integration tests for camo-proxy
//!
//! These tests drive the full router against a local upstream server:
//! - Signed URL verification and URL policy
//! - Content-type and content-length enforcement
//! - Streaming truncation at the size ceiling
//! - Redirect following and re-validation
//! - Upstream status mapping and timeouts
//! - /status and /metrics accounting

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::Path,
    http::{header, HeaderMap, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::stream;
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tower::ServiceExt;

use camo_proxy::encoding::{encode_url, Codec};
use camo_proxy::filter::FilterChain;
use camo_proxy::http_listener::{build_router, AppState};
use camo_proxy::metrics::ProxyMetrics;
use camo_proxy::proxy::{CamoProxy, ProxySettings};
use camo_proxy::stats::{MetricsCollector, ProxyStats};
use camo_proxy::upstream_proxy::UpstreamProxy;

const KEY: &[u8] = b"integration-test-key";
const MAX_SIZE: u64 = 1024;
const PNG: &[u8] = b"\x89PNG\r\n\x1a\nnot really a png";

fn image(body: impl Into<Body>) -> Response {
    ([(header::CONTENT_TYPE, "image/png")], body.into()).into_response()
}

fn redirect(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/image.png", get(|| async { image(PNG) }))
        .route(
            "/svg",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "image/svg+xml; charset=UTF-8")],
                    "<svg/>",
                )
            }),
        )
        .route(
            "/smuggle",
            get(|| async { ([(header::CONTENT_TYPE, "image/png, text/html")], "<html>") }),
        )
        .route(
            "/html",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html>") }),
        )
        .route("/untyped", get(|| async { Body::from("bytes") }))
        .route("/big", get(|| async { image(vec![b'x'; 4096]) }))
        .route(
            "/stream",
            get(|| async {
                let chunks = (0..4).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![b'y'; 1024])));
                image(Body::from_stream(stream::iter(chunks)))
            }),
        )
        .route(
            "/redirect/:n",
            get(|Path(n): Path<u32>| async move {
                if n <= 1 {
                    redirect("/image.png".to_string())
                } else {
                    redirect(format!("/redirect/{}", n - 1))
                }
            }),
        )
        .route(
            "/to-internal",
            get(|| async { redirect("http://10.0.0.1/x.png".to_string()) }),
        )
        .route(
            "/not-modified",
            get(|| async { (StatusCode::NOT_MODIFIED, [(header::ETAG, "\"v1\"")]) }),
        )
        .route(
            "/broken",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        )
        .route(
            "/teapot",
            get(|| async { StatusCode::IM_A_TEAPOT }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                image(PNG)
            }),
        )
        .route(
            "/auth",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-")
                    .to_string();
                image(auth)
            }),
        )
        .route(
            "/exact",
            get(|| async {
                let chunks = (0..2).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![b'z'; 512])));
                image(Body::from_stream(stream::iter(chunks)))
            }),
        )
        .route(
            "/headers",
            get(|headers: HeaderMap| async move {
                let value = |name: &str| {
                    headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string()
                };
                image(format!(
                    "ua={} via={} accept={} cookie={}",
                    value("user-agent"),
                    value("via"),
                    value("accept"),
                    value("cookie")
                ))
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Harness {
    app: Router,
    upstream: SocketAddr,
    stats: Arc<ProxyStats>,
    metrics: Arc<ProxyMetrics>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_settings(|_| {}).await
    }

    async fn with_settings(adjust: impl FnOnce(&mut ProxySettings)) -> Self {
        let upstream = spawn_upstream().await;
        let mut settings = ProxySettings {
            hmac_key: KEY.to_vec(),
            max_size: MAX_SIZE,
            request_timeout: Duration::from_millis(500),
            server_name: "camo-it".to_string(),
            allowed_networks: vec!["127.0.0.1/32".parse().unwrap()],
            ..ProxySettings::default()
        };
        adjust(&mut settings);

        let stats = Arc::new(ProxyStats::new());
        let metrics = Arc::new(ProxyMetrics::new());
        let proxy = CamoProxy::new(settings, UpstreamProxy::none(), FilterChain::new())
            .unwrap()
            .with_metrics(metrics.clone())
            .with_collector(stats.clone() as Arc<dyn MetricsCollector>);
        let state = AppState::new(Arc::new(proxy))
            .with_stats(stats.clone())
            .with_metrics_endpoint(true);

        Self {
            app: build_router(state),
            upstream,
            stats,
            metrics,
        }
    }

    fn signed(&self, codec: Codec, path: &str) -> String {
        let target = format!("http://{}{}", self.upstream, path);
        encode_url(codec, KEY, &target).unwrap()
    }

    async fn request(&self, method: Method, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::COOKIE, "session=secret")
            .body(Body::empty())
            .unwrap();
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    async fn get(&self, path: &str) -> (StatusCode, HeaderMap, Bytes) {
        let uri = self.signed(Codec::Hex, path);
        self.request(Method::GET, &uri).await
    }
}

#[tokio::test]
async fn test_proxies_image() {
    let h = Harness::new().await;

    for codec in [Codec::Hex, Codec::Base64] {
        let uri = h.signed(codec, "/image.png");
        let (status, headers, body) = h.request(Method::GET, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "image/png");
        assert_eq!(headers.get(header::SERVER).unwrap(), "camo-it");
        assert_eq!(&body[..], PNG);
    }

    assert_eq!(h.stats.snapshot().clients_served, 2);
    assert_eq!(h.stats.snapshot().bytes_served, 2 * PNG.len() as u64);
}

#[tokio::test]
async fn test_head_returns_headers_only() {
    let h = Harness::new().await;
    let uri = h.signed(Codec::Hex, "/image.png");

    let (status, headers, body) = h.request(Method::HEAD, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "image/png");
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_outbound_headers_are_filtered() {
    let h = Harness::new().await;

    let (status, _, body) = h.get("/headers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        std::str::from_utf8(&body).unwrap(),
        "ua=camo-it via=camo-it accept=image/* cookie=-"
    );
}

#[tokio::test]
async fn test_content_type_enforcement() {
    let h = Harness::new().await;

    let (status, headers, body) = h.get("/svg").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "image/svg+xml; charset=UTF-8"
    );
    assert_eq!(&body[..], b"<svg/>");

    let (status, _, body) = h.get("/smuggle").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(&body[..], b"Unsupported content-type returned\n");

    let (status, _, _) = h.get("/html").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = h.get("/untyped").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(&body[..], b"Empty content-type returned\n");
}

#[tokio::test]
async fn test_content_length_exceeded() {
    let h = Harness::new().await;

    let (status, _, body) = h.get("/big").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], b"Content length exceeded\n");
    assert_eq!(h.metrics.snapshot().content_length_exceeded, 1);
}

#[tokio::test]
async fn test_unknown_length_truncated_at_ceiling() {
    let h = Harness::new().await;

    let (status, _, body) = h.get("/stream").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.len() as u64, MAX_SIZE);
    assert_eq!(h.metrics.snapshot().responses_truncated, 1);
    assert_eq!(h.stats.snapshot().bytes_served, MAX_SIZE);
}

#[tokio::test]
async fn test_exact_size_body_not_truncated() {
    let h = Harness::new().await;

    let (status, _, body) = h.get("/exact").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.len() as u64, MAX_SIZE);
    assert_eq!(h.metrics.snapshot().responses_truncated, 0);
    assert_eq!(h.stats.snapshot().bytes_served, MAX_SIZE);
}

#[tokio::test]
async fn test_credential_urls_sent_as_basic_auth() {
    let h = Harness::with_settings(|s| s.allow_credential_urls = true).await;

    let target = format!("http://user:secret@{}/auth", h.upstream);
    let uri = encode_url(Codec::Hex, KEY, &target).unwrap();
    let (status, _, body) = h.request(Method::GET, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"Basic dXNlcjpzZWNyZXQ=");

    let (_, _, body) = h.get("/auth").await;
    assert_eq!(&body[..], b"-");
}

#[tokio::test]
async fn test_redirect_limit() {
    let h = Harness::new().await;

    let (status, _, body) = h.get("/redirect/3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], PNG);

    let (status, _, body) = h.get("/redirect/4").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], b"Error Fetching Resource\n");
}

#[tokio::test]
async fn test_redirect_to_internal_address_refused() {
    let h = Harness::new().await;

    let (status, _, body) = h.get("/to-internal").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], b"Error Fetching Resource\n");
}

#[tokio::test]
async fn test_upstream_status_mapping() {
    let h = Harness::new().await;

    let (status, headers, body) = h.get("/not-modified").await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert_eq!(headers.get(header::ETAG).unwrap(), "\"v1\"");
    assert!(body.is_empty());

    let (status, _, body) = h.get("/broken").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(&body[..], b"Error Fetching Resource\n");

    let (status, _, _) = h.get("/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = h.get("/teapot").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upstream_timeout() {
    let h = Harness::new().await;

    let (status, _, body) = h.get("/slow").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(&body[..], b"Error Fetching Resource\n");
}

#[tokio::test]
async fn test_unreachable_upstream() {
    let h = Harness::new().await;

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let uri = encode_url(Codec::Hex, KEY, &format!("http://{}/image.png", addr)).unwrap();
    let (status, _, body) = h.request(Method::GET, &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], b"Error Fetching Resource\n");
}

#[tokio::test]
async fn test_address_policy_without_exemption() {
    let h = Harness::with_settings(|s| s.allowed_networks.clear()).await;

    let (status, _, body) = h.get("/image.png").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], b"Denylist host failure\n");
}

#[tokio::test]
async fn test_signature_and_url_rejections() {
    let h = Harness::new().await;

    let uri = h.signed(Codec::Hex, "/image.png");
    let tampered = uri.replacen('/', "/00", 1);
    let (status, _, body) = h.request(Method::GET, &tampered).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(&body[..], b"Bad Signature\n");

    let bad = encode_url(Codec::Hex, KEY, "ftp://example.com/a.png").unwrap();
    let (status, _, body) = h.request(Method::GET, &bad).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], b"Bad url scheme\n");

    let creds = encode_url(Codec::Hex, KEY, "http://user:pw@example.com/a.png").unwrap();
    let (status, _, body) = h.request(Method::GET, &creds).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], b"Userinfo URL rejected\n");
}

#[tokio::test]
async fn test_status_and_metrics_endpoints() {
    let h = Harness::new().await;

    let _ = h.get("/image.png").await;
    let _ = h.get("/broken").await;

    let (status, _, body) = h.request(Method::GET, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        std::str::from_utf8(&body).unwrap(),
        format!("ClientsServed, BytesServed\n2, {}\n", PNG.len())
    );

    let (status, _, body) = h.request(Method::GET, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = std::str::from_utf8(&body).unwrap();
    assert!(text.contains("camo_http_responses_total{class=\"2xx\"} 2"), "{}", text);
    assert!(text.contains("camo_http_responses_total{class=\"5xx\"} 1"), "{}", text);
    assert!(
        text.contains(&format!("camo_proxy_bytes_sent_total {}", PNG.len())),
        "{}",
        text
    );
}
