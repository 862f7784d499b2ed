//! Dial-time connection guard
//!
//! Every outbound TCP connection made by the fetch client goes through
//! [`GuardedConnector`]. It resolves the address about to be dialed and
//! refuses to connect if any resolved IP is rejected by the
//! [`AddressPolicy`], which closes the window between the pre-flight URL check
//! and the actual connect (DNS rebinding). Connections to a configured
//! upstream proxy are exempt, and targets behind the proxy are reached with
//! an HTTP `CONNECT` tunnel or a SOCKS5 handshake.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tower_service::Service;
use tracing::{debug, trace};

use crate::error::ConnectError;
use crate::security::AddressPolicy;
use crate::upstream_proxy::{ProxyEndpoint, ProxyScheme, UpstreamProxy};

/// Connect timeout, separate from the overall request deadline
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Tower connector that enforces the address policy at dial time
#[derive(Debug, Clone)]
pub struct GuardedConnector {
    policy: Arc<AddressPolicy>,
    upstream: Arc<UpstreamProxy>,
    connect_timeout: Duration,
}

impl GuardedConnector {
    pub fn new(policy: Arc<AddressPolicy>, upstream: Arc<UpstreamProxy>) -> Self {
        Self {
            policy,
            upstream,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connect(self, dst: Uri) -> Result<GuardedStream, ConnectError> {
        let scheme = dst.scheme_str().unwrap_or("http").to_string();
        let host = dst
            .host()
            .ok_or(ConnectError::MissingHost)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = dst
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });

        let timeout = self.connect_timeout;
        tokio::time::timeout(timeout, self.establish(&scheme, &host, port))
            .await
            .map_err(|_| ConnectError::Timeout)?
    }

    async fn establish(
        &self,
        scheme: &str,
        host: &str,
        port: u16,
    ) -> Result<GuardedStream, ConnectError> {
        let Some(proxy) = self.upstream.endpoint_for_target(scheme, host) else {
            let addrs = self.resolve_checked(host, port).await?;
            let tcp = dial_any(&addrs).await?;
            return Ok(GuardedStream::new(tcp, false));
        };

        // the target itself must still pass the policy
        let target_addrs = self.resolve_checked(host, port).await?;
        let proxy_addrs = self.resolve_checked(&proxy.host, proxy.port).await?;
        let mut tcp = dial_any(&proxy_addrs).await?;

        match (proxy.scheme, scheme) {
            (ProxyScheme::Http, "http") => Ok(GuardedStream::new(tcp, true)),
            (ProxyScheme::Http, _) => {
                http_connect(&mut tcp, proxy, host, port).await?;
                Ok(GuardedStream::new(tcp, false))
            }
            (ProxyScheme::Socks5, _) => {
                let target = target_addrs[0];
                socks5_connect(&mut tcp, proxy, target).await?;
                Ok(GuardedStream::new(tcp, false))
            }
            (ProxyScheme::Https, _) => Err(ConnectError::ProxyHandshake(
                "tls connections to the upstream proxy are not supported".to_string(),
            )),
        }
    }

    /// Resolve `host` and reject it if any address is forbidden
    async fn resolve_checked(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ConnectError> {
        let addrs: Vec<SocketAddr> = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, port)],
            Err(_) => tokio::net::lookup_host((host, port))
                .await
                .map_err(|source| ConnectError::Resolve {
                    host: host.to_string(),
                    source,
                })?
                .collect(),
        };

        if addrs.is_empty() {
            return Err(ConnectError::NoAddresses(host.to_string()));
        }

        for addr in &addrs {
            if self.upstream.matches_ip(addr.ip(), addr.port()) {
                continue;
            }
            if self.policy.is_rejected(addr.ip()) {
                debug!("dial to {} ({}) denied by address policy", host, addr.ip());
                return Err(ConnectError::Denied(addr.ip()));
            }
        }
        Ok(addrs)
    }
}

async fn dial_any(addrs: &[SocketAddr]) -> Result<TcpStream, ConnectError> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(tcp) => {
                let _ = tcp.set_nodelay(true);
                trace!("connected to {}", addr);
                return Ok(tcp);
            }
            Err(e) => {
                trace!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses"))
        .into())
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Open an HTTP `CONNECT` tunnel to `host:port` through an http proxy
async fn http_connect(
    tcp: &mut TcpStream,
    proxy: &ProxyEndpoint,
    host: &str,
    port: u16,
) -> Result<(), ConnectError> {
    let target = authority(host, port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(auth) = proxy.authorization() {
        if let Ok(auth) = auth.to_str() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
    }
    request.push_str("\r\n");
    tcp.write_all(request.as_bytes()).await?;

    let mut response = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        if response.len() >= MAX_CONNECT_RESPONSE {
            return Err(ConnectError::ProxyHandshake(
                "CONNECT response headers too large".to_string(),
            ));
        }
        let n = tcp.read(&mut chunk).await?;
        if n == 0 {
            return Err(ConnectError::ProxyHandshake(
                "proxy closed connection during CONNECT".to_string(),
            ));
        }
        response.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut res = httparse::Response::new(&mut headers);
        let status = res.parse(&response).map_err(|e| {
            ConnectError::ProxyHandshake(format!("malformed CONNECT response: {}", e))
        })?;
        let httparse::Status::Complete(header_len) = status else {
            continue;
        };

        if res.code != Some(200) {
            return Err(ConnectError::ProxyHandshake(format!(
                "CONNECT to {} refused: {} {}",
                target,
                res.code.unwrap_or_default(),
                res.reason.unwrap_or_default()
            )));
        }
        // the tunnel is silent until the client speaks first
        if header_len != response.len() {
            return Err(ConnectError::ProxyHandshake(
                "unexpected data after CONNECT response".to_string(),
            ));
        }
        return Ok(());
    }
}

/// Run the SOCKS5 CONNECT handshake for `target`
async fn socks5_connect(
    tcp: &mut TcpStream,
    proxy: &ProxyEndpoint,
    target: SocketAddr,
) -> Result<(), ConnectError> {
    let fail = |msg: &str| ConnectError::ProxyHandshake(format!("socks5: {}", msg));

    let credentials = proxy.credentials();
    if credentials.is_some() {
        tcp.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;
    } else {
        tcp.write_all(&[0x05, 0x01, 0x00]).await?;
    }

    let mut choice = [0u8; 2];
    tcp.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        return Err(fail("unexpected protocol version"));
    }
    match (choice[1], credentials) {
        (0x00, _) => {}
        (0x02, Some((user, pass))) => {
            if user.len() > 255 || pass.len() > 255 {
                return Err(fail("credentials too long"));
            }
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            tcp.write_all(&auth).await?;

            let mut status = [0u8; 2];
            tcp.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(fail("authentication rejected"));
            }
        }
        _ => return Err(fail("no acceptable authentication method")),
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match target.ip() {
        IpAddr::V4(v4) => {
            request.push(0x01);
            request.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            request.push(0x04);
            request.extend_from_slice(&v6.octets());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    tcp.write_all(&request).await?;

    let mut reply = [0u8; 4];
    tcp.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(fail(&format!("connect failed with reply code {}", reply[1])));
    }
    let bound_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            tcp.read_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(fail("unknown bound address type")),
    };
    let mut bound = vec![0u8; bound_len + 2];
    tcp.read_exact(&mut bound).await?;
    Ok(())
}

impl Service<Uri> for GuardedConnector {
    type Response = GuardedStream;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<GuardedStream, ConnectError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        Box::pin(self.clone().connect(dst))
    }
}

pin_project! {
    /// TCP stream handed to the HTTP client
    #[derive(Debug)]
    pub struct GuardedStream {
        #[pin]
        inner: TokioIo<TcpStream>,
        // absolute-form requests through a plain http proxy
        proxied: bool,
    }
}

impl GuardedStream {
    fn new(tcp: TcpStream, proxied: bool) -> Self {
        Self {
            inner: TokioIo::new(tcp),
            proxied,
        }
    }
}

impl Connection for GuardedStream {
    fn connected(&self) -> Connected {
        self.inner.inner().connected().proxy(self.proxied)
    }
}

impl hyper::rt::Read for GuardedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl hyper::rt::Write for GuardedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }
}
