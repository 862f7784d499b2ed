//! Served-clients and served-bytes counters behind `/status`

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Receives per-request accounting from the proxy
pub trait MetricsCollector: Send + Sync {
    /// Called once for every proxied request
    fn add_served(&self);
    /// Called once for every completed streamed response
    fn add_bytes(&self, bytes: u64);
}

/// Running totals
#[derive(Debug, Default)]
pub struct ProxyStats {
    clients: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    #[serde(rename = "ClientsServed")]
    pub clients_served: u64,
    #[serde(rename = "BytesServed")]
    pub bytes_served: u64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            clients_served: self.clients.load(Ordering::Relaxed),
            bytes_served: self.bytes.load(Ordering::Relaxed),
        }
    }

    /// `/status` plain text body
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        format!(
            "ClientsServed, BytesServed\n{}, {}\n",
            s.clients_served, s.bytes_served
        )
    }

    /// `/status?format=json` body
    pub fn render_json(&self) -> String {
        let mut body = serde_json::to_string(&self.snapshot()).unwrap_or_default();
        body.push('\n');
        body
    }
}

impl MetricsCollector for ProxyStats {
    fn add_served(&self) {
        self.clients.fetch_add(1, Ordering::Relaxed);
    }

    fn add_bytes(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}
