//! Signed-URL fetch pipeline
//!
//! Verifies the signature on an inbound `/{digest}/{payload}` request,
//! validates the decoded target (and every redirect hop), fetches it through
//! the guarded client and streams back responses with an acceptable media
//! type. Every rejection maps to a fixed status and plain-text body here.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use ipnet::IpNet;
use percent_encoding::percent_decode_str;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::body::{limited_body, BufferPool, TransferContext};
use crate::connector::{GuardedConnector, CONNECT_TIMEOUT};
use crate::encoding::UrlSigner;
use crate::error::{CheckError, ConnectError, FetchError, ProxyConfigError};
use crate::filter::FilterChain;
use crate::htrie::{local_hostnames, GlobPathChecker, UrlMatcher};
use crate::media_type::MediaType;
use crate::metrics::ProxyMetrics;
use crate::security::AddressPolicy;
use crate::stats::MetricsCollector;
use crate::upstream_proxy::{ProxyScheme, UpstreamProxy};

/// Idle upstream connections are closed after this long
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Settings the proxy is built from
#[derive(Clone)]
pub struct ProxySettings {
    pub hmac_key: Vec<u8>,
    /// Response size ceiling in bytes, 0 for unlimited
    pub max_size: u64,
    pub max_redirects: usize,
    /// Deadline for the whole upstream exchange, body included
    pub request_timeout: Duration,
    pub allow_video: bool,
    pub allow_audio: bool,
    pub allow_credential_urls: bool,
    pub enable_xfwd_for: bool,
    pub disable_keepalives_be: bool,
    pub server_name: String,
    /// Networks exempted from the address policy
    pub allowed_networks: Vec<IpNet>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            hmac_key: Vec::new(),
            max_size: 5120 * 1024,
            max_redirects: 3,
            request_timeout: Duration::from_secs(4),
            allow_video: false,
            allow_audio: false,
            allow_credential_urls: false,
            enable_xfwd_for: false,
            disable_keepalives_be: false,
            server_name: crate::NAME.to_string(),
            allowed_networks: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySettings")
            .field("hmac_key", &"<redacted>")
            .field("max_size", &self.max_size)
            .field("max_redirects", &self.max_redirects)
            .field("request_timeout", &self.request_timeout)
            .field("allow_video", &self.allow_video)
            .field("allow_audio", &self.allow_audio)
            .field("allow_credential_urls", &self.allow_credential_urls)
            .field("enable_xfwd_for", &self.enable_xfwd_for)
            .field("disable_keepalives_be", &self.disable_keepalives_be)
            .field("server_name", &self.server_name)
            .field("allowed_networks", &self.allowed_networks)
            .finish()
    }
}

/// A fixed set of header names copied between header maps
#[derive(Debug, Clone)]
pub struct HeaderAllowList {
    names: Vec<HeaderName>,
}

impl HeaderAllowList {
    pub fn new(names: impl IntoIterator<Item = HeaderName>) -> Self {
        Self {
            names: names.into_iter().collect(),
        }
    }

    /// Request headers forwarded upstream; `Accept` is always replaced
    pub fn request() -> Self {
        Self::new([
            header::ACCEPT_CHARSET,
            header::ACCEPT_LANGUAGE,
            header::CACHE_CONTROL,
            header::IF_NONE_MATCH,
            header::IF_MODIFIED_SINCE,
            header::RANGE,
        ])
    }

    /// Response headers returned to the client; `Content-Type` is rewritten
    pub fn response() -> Self {
        Self::new([
            header::ACCEPT_RANGES,
            header::CONTENT_LENGTH,
            header::CONTENT_RANGE,
            header::CACHE_CONTROL,
            header::CONTENT_ENCODING,
            header::ETAG,
            header::EXPIRES,
            header::LAST_MODIFIED,
            header::TRANSFER_ENCODING,
        ])
    }

    pub fn copy(&self, src: &HeaderMap, dst: &mut HeaderMap) {
        for name in &self.names {
            for value in src.get_all(name) {
                dst.append(name.clone(), value.clone());
            }
        }
    }
}

type HttpClient = Client<HttpsConnector<GuardedConnector>, Empty<Bytes>>;

/// The camo proxy
pub struct CamoProxy {
    signer: UrlSigner,
    client: HttpClient,
    max_size: u64,
    max_redirects: usize,
    request_timeout: Duration,
    allow_credential_urls: bool,
    enable_xfwd_for: bool,
    server_name: HeaderValue,
    accept_types: GlobPathChecker,
    accept_header: HeaderValue,
    request_headers: HeaderAllowList,
    response_headers: HeaderAllowList,
    local_hosts: UrlMatcher,
    policy: Arc<AddressPolicy>,
    upstream: Arc<UpstreamProxy>,
    filters: FilterChain,
    collector: Option<Arc<dyn MetricsCollector>>,
    metrics: Arc<ProxyMetrics>,
    buffers: Arc<BufferPool>,
}

impl std::fmt::Debug for CamoProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CamoProxy")
            .field("max_size", &self.max_size)
            .field("max_redirects", &self.max_redirects)
            .field("request_timeout", &self.request_timeout)
            .field("server_name", &self.server_name)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

fn tls_client_config() -> Result<rustls::ClientConfig, ProxyConfigError> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!("error loading native root certificate: {}", err);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!("loaded {} root certificates ({} ignored)", added, ignored);
    if roots.is_empty() {
        warn!("no root certificates loaded; https upstreams will fail verification");
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Ok(rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

impl CamoProxy {
    /// Build a proxy; `filters` run in order after the built-in URL checks
    pub fn new(
        settings: ProxySettings,
        upstream: UpstreamProxy,
        filters: FilterChain,
    ) -> Result<Self, ProxyConfigError> {
        if settings.hmac_key.is_empty() {
            return Err(ProxyConfigError::MissingKey);
        }
        let signer = UrlSigner::new(&settings.hmac_key)?;

        let server_name =
            HeaderValue::from_str(&settings.server_name).map_err(|_| ProxyConfigError::Header {
                name: "server name".to_string(),
                value: settings.server_name.clone(),
            })?;

        let mut accept = vec!["image/*"];
        if settings.allow_video {
            accept.push("video/*");
        }
        if settings.allow_audio {
            accept.push("audio/*");
        }
        let mut accept_types = GlobPathChecker::new();
        for media in &accept {
            accept_types.add_rule(&format!("|i|{}", media))?;
        }
        let accept_joined = accept.join(", ");
        let accept_header =
            HeaderValue::from_str(&accept_joined).map_err(|_| ProxyConfigError::Header {
                name: header::ACCEPT.to_string(),
                value: accept_joined.clone(),
            })?;

        let policy = Arc::new(AddressPolicy::new().with_allowed(settings.allowed_networks));
        let upstream = Arc::new(upstream);

        let connector = GuardedConnector::new(policy.clone(), upstream.clone());
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_client_config()?)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);

        let max_idle = if settings.disable_keepalives_be {
            0
        } else {
            POOL_MAX_IDLE_PER_HOST
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(max_idle)
            .build(https);

        Ok(Self {
            signer,
            client,
            max_size: settings.max_size,
            max_redirects: settings.max_redirects,
            request_timeout: settings.request_timeout,
            allow_credential_urls: settings.allow_credential_urls,
            enable_xfwd_for: settings.enable_xfwd_for,
            server_name,
            accept_types,
            accept_header,
            request_headers: HeaderAllowList::request(),
            response_headers: HeaderAllowList::response(),
            local_hosts: local_hostnames(),
            policy,
            upstream,
            filters,
            collector: None,
            metrics: Arc::new(ProxyMetrics::new()),
            buffers: Arc::new(BufferPool::default()),
        })
    }

    pub fn with_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    pub fn server_name(&self) -> &HeaderValue {
        &self.server_name
    }

    /// Handle a `GET|HEAD /{digest}/{payload}` request
    pub async fn serve(&self, req: Request<Body>) -> Response {
        if let Some(collector) = &self.collector {
            collector.add_served();
        }

        if req.headers().get(header::VIA) == Some(&self.server_name) {
            return reject(StatusCode::NOT_FOUND, "Request loop failure");
        }

        let Some((digest, payload)) = split_signed_path(req.uri().path()) else {
            return reject(StatusCode::NOT_FOUND, "Malformed request path");
        };

        let target = match self.signer.decode(digest, payload) {
            Ok(target) => target,
            Err(e) => {
                debug!("bad signature for {}: {}", req.uri().path(), e);
                return reject(StatusCode::FORBIDDEN, "Bad Signature");
            }
        };
        debug!("signed client url: {}", target);

        let url = match Url::parse(&target) {
            Ok(url) => url,
            Err(e) => {
                debug!("url parse error for {:?}: {}", target, e);
                return reject(StatusCode::BAD_REQUEST, "Bad url");
            }
        };

        if let Err(e) = self.check_url(&url).await {
            debug!("rejected {}: {}", url, e);
            return reject(StatusCode::NOT_FOUND, &e.to_string());
        }

        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let outbound = self.outbound_headers(req.headers(), peer);
        let method = req.method().clone();
        let deadline = Instant::now() + self.request_timeout;

        match self.fetch(method.clone(), url, &outbound, deadline).await {
            Ok((url, resp)) => self.adjudicate(&method, url, resp, deadline),
            Err(e) => self.fetch_error(e),
        }
    }

    /// Pre-flight legality check, applied to the signed URL and every redirect
    pub async fn check_url(&self, url: &Url) -> Result<(), CheckError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CheckError::Scheme);
        }

        let (hostname, literal) = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => (d.to_string(), None),
            Some(Host::Ipv4(ip)) => (ip.to_string(), Some(IpAddr::V4(ip))),
            Some(Host::Ipv6(ip)) => (ip.to_string(), Some(IpAddr::V6(ip))),
            _ => return Err(CheckError::Host),
        };
        match self.local_hosts.check_hostname(&hostname) {
            Ok(false) => {}
            Ok(true) | Err(_) => return Err(CheckError::Host),
        }

        if !self.allow_credential_urls && (!url.username().is_empty() || url.password().is_some())
        {
            return Err(CheckError::UserInfo);
        }

        let port = url.port_or_known_default().unwrap_or(80);
        let addresses = match literal {
            Some(ip) => vec![ip],
            None => self.lookup(&hostname, port).await,
        };
        for ip in addresses {
            if self.upstream.matches_ip(ip, port) {
                continue;
            }
            if self.policy.is_rejected(ip) {
                return Err(CheckError::Denylist);
            }
        }

        if !self.filters.allows(url) {
            return Err(CheckError::Filtered);
        }

        if self.upstream.matches_any(&hostname, Some(port)).await {
            debug!("target {} is the upstream proxy", url);
            return Err(CheckError::Denylist);
        }

        Ok(())
    }

    /// Best-effort resolution; failures are left to the dial-time check
    async fn lookup(&self, host: &str, port: u16) -> Vec<IpAddr> {
        match tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::lookup_host((host, port))).await {
            Ok(Ok(addrs)) => addrs.map(|a| a.ip()).collect(),
            Ok(Err(e)) => {
                debug!("pre-flight lookup of {} failed: {}", host, e);
                Vec::new()
            }
            Err(_) => {
                debug!("pre-flight lookup of {} timed out", host);
                Vec::new()
            }
        }
    }

    fn outbound_headers(&self, inbound: &HeaderMap, peer: Option<IpAddr>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.request_headers.copy(inbound, &mut headers);

        if self.enable_xfwd_for {
            match inbound.get("x-forwarded-for").filter(|v| !v.is_empty()) {
                Some(forwarded) => {
                    headers.insert("x-forwarded-for", forwarded.clone());
                }
                None => {
                    if let Some(ip) = peer.filter(|ip| !self.policy.is_rejected(*ip)) {
                        if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
                            headers.insert("x-forwarded-for", value);
                        }
                    }
                }
            }
        }

        headers.insert(header::ACCEPT, self.accept_header.clone());
        headers.insert(header::USER_AGENT, self.server_name.clone());
        headers.insert(header::VIA, self.server_name.clone());
        headers
    }

    fn build_request(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
    ) -> Result<Request<Empty<Bytes>>, FetchError> {
        let (target, credentials) = split_userinfo(url);
        let mut req = Request::builder()
            .method(method.clone())
            .uri(target.as_str())
            .body(Empty::new())?;
        *req.headers_mut() = headers.clone();
        if let Some(auth) = credentials {
            req.headers_mut().insert(header::AUTHORIZATION, auth);
        }

        // absolute-form requests carry the proxy credentials themselves
        if url.scheme() == "http" {
            if let Some(endpoint) = self.upstream.endpoint_for(url) {
                if endpoint.scheme == ProxyScheme::Http {
                    if let Some(auth) = endpoint.authorization() {
                        req.headers_mut().insert(header::PROXY_AUTHORIZATION, auth);
                    }
                }
            }
        }
        Ok(req)
    }

    /// Fetch `url`, following and re-validating redirects
    async fn fetch(
        &self,
        mut method: Method,
        mut url: Url,
        headers: &HeaderMap,
        deadline: Instant,
    ) -> Result<(Url, hyper::Response<Incoming>), FetchError> {
        let mut redirects = 0;
        loop {
            let req = self.build_request(&method, &url, headers)?;
            debug!("fetching {} {}", method, url);

            let resp = tokio::time::timeout_at(deadline, self.client.request(req))
                .await
                .map_err(|_| FetchError::Timeout)??;

            let status = resp.status();
            if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
                return Ok((url, resp));
            }
            let Some(location) = resp.headers().get(header::LOCATION) else {
                return Ok((url, resp));
            };

            if redirects >= self.max_redirects {
                debug!("too many redirects fetching {}", url);
                return Err(FetchError::TooManyRedirects);
            }

            let next = location
                .to_str()
                .ok()
                .and_then(|loc| url.join(loc).ok())
                .ok_or_else(|| FetchError::BadRedirect(format!("{:?}", location)))?;
            self.check_redirect(&url, &next, deadline).await?;

            if matches!(status.as_u16(), 301 | 302 | 303) && method != Method::HEAD {
                method = Method::GET;
            }
            redirects += 1;
            url = next;
        }
    }

    /// Re-validate a redirect hop within the request deadline
    async fn check_redirect(
        &self,
        from: &Url,
        next: &Url,
        deadline: Instant,
    ) -> Result<(), FetchError> {
        match tokio::time::timeout_at(deadline, self.check_url(next)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!("bad redirect from {} to {}: {}", from, next, e);
                Err(FetchError::BadRedirect(e.to_string()))
            }
            Err(_) => Err(FetchError::Timeout),
        }
    }

    fn adjudicate(
        &self,
        method: &Method,
        url: Url,
        resp: hyper::Response<Incoming>,
        deadline: Instant,
    ) -> Response {
        debug!("response from upstream {}: {}", url, resp.status());

        let content_length = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(length) = content_length {
            if self.max_size > 0 && length > self.max_size {
                debug!("content length {} exceeded for {}", length, url);
                self.metrics.content_length_exceeded();
                return reject(StatusCode::NOT_FOUND, "Content length exceeded");
            }
        }

        match resp.status().as_u16() {
            200 | 206 => {}
            300 => return reject(StatusCode::NOT_FOUND, "Multiple choices not supported"),
            301 | 302 | 303 | 307 => return reject(StatusCode::NOT_FOUND, "Not Found"),
            304 => {
                let mut out = Response::new(Body::empty());
                *out.status_mut() = StatusCode::NOT_MODIFIED;
                self.response_headers.copy(resp.headers(), out.headers_mut());
                return out;
            }
            404 => return reject(StatusCode::NOT_FOUND, "Not Found"),
            500 | 502 | 503 | 504 => {
                return reject(StatusCode::BAD_GATEWAY, "Error Fetching Resource")
            }
            _ => return reject(StatusCode::NOT_FOUND, "Not Found"),
        }

        let content_type = match self.content_type(resp.headers()) {
            Ok(ct) => ct,
            Err(msg) => {
                debug!("{} from {}", msg, url);
                return reject(StatusCode::BAD_REQUEST, msg);
            }
        };

        let status = resp.status();
        let (parts, upstream_body) = resp.into_parts();

        let body = if *method == Method::HEAD {
            Body::empty()
        } else {
            let ctx = TransferContext {
                max_size: self.max_size,
                deadline,
                metrics: self.metrics.clone(),
                collector: self.collector.clone(),
                url: url.to_string(),
            };
            limited_body(upstream_body, &self.buffers, ctx)
        };

        let mut out = Response::new(body);
        *out.status_mut() = status;
        self.response_headers.copy(&parts.headers, out.headers_mut());
        out.headers_mut().insert(header::CONTENT_TYPE, content_type);
        out
    }

    /// The canonical Content-Type for an acceptable upstream response
    fn content_type(&self, headers: &HeaderMap) -> Result<HeaderValue, &'static str> {
        const EMPTY: &str = "Empty content-type returned";
        const UNSUPPORTED: &str = "Unsupported content-type returned";

        let mut values = headers.get_all(header::CONTENT_TYPE).iter();
        let first = values.next().ok_or(EMPTY)?;
        if values.next().is_some() {
            return Err(UNSUPPORTED);
        }
        let raw = first.to_str().map_err(|_| UNSUPPORTED)?;
        if raw.trim().is_empty() {
            return Err(EMPTY);
        }

        let media = MediaType::parse(raw).map_err(|_| UNSUPPORTED)?;
        if !self.accept_types.check_path(media.essence()) {
            return Err(UNSUPPORTED);
        }
        HeaderValue::from_str(&media.to_string()).map_err(|_| UNSUPPORTED)
    }

    fn fetch_error(&self, err: FetchError) -> Response {
        match &err {
            FetchError::Timeout => {
                debug!("upstream fetch timed out");
                reject(StatusCode::GATEWAY_TIMEOUT, "Error Fetching Resource")
            }
            FetchError::TooManyRedirects | FetchError::BadRedirect(_) => {
                debug!("bad redirect from server: {}", err);
                reject(StatusCode::NOT_FOUND, "Error Fetching Resource")
            }
            FetchError::Build(e) => {
                warn!("could not build upstream request: {}", e);
                reject(StatusCode::BAD_GATEWAY, "Error Fetching Resource")
            }
            FetchError::Client(e) => {
                debug!("could not connect to endpoint: {}", err);
                if let Some(connect) = find_source::<ConnectError>(e) {
                    return match connect {
                        ConnectError::Timeout => {
                            reject(StatusCode::GATEWAY_TIMEOUT, "Error Fetching Resource")
                        }
                        _ => reject(StatusCode::NOT_FOUND, "Error Fetching Resource"),
                    };
                }
                match find_source::<hyper::Error>(e) {
                    Some(h) if h.is_closed() || h.is_incomplete_message() => {
                        reject(StatusCode::BAD_GATEWAY, "Error Fetching Resource")
                    }
                    Some(h) if h.is_timeout() => {
                        reject(StatusCode::GATEWAY_TIMEOUT, "Error Fetching Resource")
                    }
                    _ => reject(StatusCode::NOT_FOUND, "Error Fetching Resource"),
                }
            }
        }
    }
}

/// Walk an error's source chain looking for a `T`
fn find_source<'a, T: StdError + 'static>(err: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

/// Move `user:pass@` out of `url` into an `Authorization: Basic` value
fn split_userinfo(url: &Url) -> (Cow<'_, Url>, Option<HeaderValue>) {
    if url.username().is_empty() && url.password().is_none() {
        return (Cow::Borrowed(url), None);
    }
    let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
    let token = STANDARD.encode(format!(
        "{}:{}",
        decode(url.username()),
        decode(url.password().unwrap_or_default())
    ));

    let mut bare = url.clone();
    let _ = bare.set_username("");
    let _ = bare.set_password(None);
    (
        Cow::Owned(bare),
        HeaderValue::from_str(&format!("Basic {}", token)).ok(),
    )
}

/// Split `/{digest}/{payload}`; any other shape is malformed
pub fn split_signed_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('/')?;
    let (digest, payload) = rest.split_once('/')?;
    if payload.contains('/') {
        return None;
    }
    Some((digest, payload))
}

/// Plain-text error response
pub fn reject(status: StatusCode, msg: &str) -> Response {
    let mut resp = Response::new(Body::from(format!("{}\n", msg)));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    resp
}
