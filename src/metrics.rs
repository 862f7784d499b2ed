//! Prometheus metrics for the proxy
//!
//! Counters are plain atomics, exported in the Prometheus text format:
//! - request totals and response classes
//! - content-length rejections, truncated and failed responses
//! - response duration histogram

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Proxy metrics registry
pub struct ProxyMetrics {
    /// Total requests handled by the router
    requests_total: AtomicU64,
    /// Requests in progress
    in_progress: AtomicU64,
    responses_2xx: AtomicU64,
    responses_3xx: AtomicU64,
    responses_4xx: AtomicU64,
    responses_5xx: AtomicU64,
    /// Upstream declared a Content-Length over the ceiling
    content_length_exceeded: AtomicU64,
    /// Streamed responses aborted by an upstream or client error
    responses_failed: AtomicU64,
    /// Streamed responses cut off at the size ceiling
    responses_truncated: AtomicU64,
    /// Body bytes streamed to clients
    bytes_sent: AtomicU64,
    response_duration: LatencyHistogram,
    start_time: Instant,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            in_progress: AtomicU64::new(0),
            responses_2xx: AtomicU64::new(0),
            responses_3xx: AtomicU64::new(0),
            responses_4xx: AtomicU64::new(0),
            responses_5xx: AtomicU64::new(0),
            content_length_exceeded: AtomicU64::new(0),
            responses_failed: AtomicU64::new(0),
            responses_truncated: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            response_duration: LatencyHistogram::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Record a request start
    pub fn request_start(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_progress.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the response status and time-to-headers of a request
    pub fn request_end(&self, status_code: u16, latency: Duration) {
        self.in_progress.fetch_sub(1, Ordering::Relaxed);
        self.response_duration.observe(latency);

        let class = match status_code {
            200..=299 => &self.responses_2xx,
            300..=399 => &self.responses_3xx,
            400..=499 => &self.responses_4xx,
            500..=599 => &self.responses_5xx,
            _ => return,
        };
        class.fetch_add(1, Ordering::Relaxed);
    }

    pub fn content_length_exceeded(&self) {
        self.content_length_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_failed(&self) {
        self.responses_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_truncated(&self) {
        self.responses_truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        output.push_str("# HELP camo_uptime_seconds Server uptime in seconds\n");
        output.push_str("# TYPE camo_uptime_seconds gauge\n");
        let _ = writeln!(output, "camo_uptime_seconds {}", self.uptime_secs());

        counter(
            &mut output,
            "camo_http_requests_total",
            "Total requests received",
            &self.requests_total,
        );

        output.push_str("# HELP camo_http_requests_in_progress Current requests in progress\n");
        output.push_str("# TYPE camo_http_requests_in_progress gauge\n");
        let _ = writeln!(
            output,
            "camo_http_requests_in_progress {}",
            self.in_progress.load(Ordering::Relaxed)
        );

        output.push_str("# HELP camo_http_responses_total Responses by status class\n");
        output.push_str("# TYPE camo_http_responses_total counter\n");
        for (class, value) in [
            ("2xx", &self.responses_2xx),
            ("3xx", &self.responses_3xx),
            ("4xx", &self.responses_4xx),
            ("5xx", &self.responses_5xx),
        ] {
            let _ = writeln!(
                output,
                "camo_http_responses_total{{class=\"{}\"}} {}",
                class,
                value.load(Ordering::Relaxed)
            );
        }

        counter(
            &mut output,
            "camo_proxy_content_length_exceeded_total",
            "The number of requests where the content length was exceeded",
            &self.content_length_exceeded,
        );
        counter(
            &mut output,
            "camo_proxy_responses_failed_total",
            "The number of responses that failed to send to the client",
            &self.responses_failed,
        );
        counter(
            &mut output,
            "camo_proxy_responses_truncated_total",
            "The number of responses that were too large to send",
            &self.responses_truncated,
        );
        counter(
            &mut output,
            "camo_proxy_bytes_sent_total",
            "Total body bytes sent to clients",
            &self.bytes_sent,
        );

        self.response_duration
            .export_prometheus(&mut output, "camo_http_response_duration_seconds");

        output
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            in_progress: self.in_progress.load(Ordering::Relaxed),
            content_length_exceeded: self.content_length_exceeded.load(Ordering::Relaxed),
            responses_failed: self.responses_failed.load(Ordering::Relaxed),
            responses_truncated: self.responses_truncated.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProxyMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyMetrics").finish_non_exhaustive()
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: &AtomicU64) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} counter", name);
    let _ = writeln!(output, "{} {}", name, value.load(Ordering::Relaxed));
}

/// Point-in-time counter values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub requests_total: u64,
    pub in_progress: u64,
    pub content_length_exceeded: u64,
    pub responses_failed: u64,
    pub responses_truncated: u64,
    pub bytes_sent: u64,
}

/// Latency histogram with fixed millisecond buckets
struct LatencyHistogram {
    /// Buckets: 1, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000, +Inf
    buckets: [AtomicU64; 13],
    /// Sum of all observations (in microseconds)
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    const BUCKET_BOUNDS_MS: [u64; 12] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let us = duration.as_micros() as u64;

        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let bucket_idx = Self::BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(Self::BUCKET_BOUNDS_MS.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
    }

    fn export_prometheus(&self, output: &mut String, name: &str) {
        let _ = writeln!(output, "# HELP {} Time to response headers", name);
        let _ = writeln!(output, "# TYPE {} histogram", name);

        let mut cumulative = 0u64;
        for (i, bound) in Self::BUCKET_BOUNDS_MS.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "{}_bucket{{le=\"{}\"}} {}",
                name,
                *bound as f64 / 1000.0,
                cumulative
            );
        }

        cumulative += self.buckets[Self::BUCKET_BOUNDS_MS.len()].load(Ordering::Relaxed);
        let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", name, cumulative);

        let sum = self.sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(output, "{}_sum {:.6}", name, sum);
        let _ = writeln!(
            output,
            "{}_count {}",
            name,
            self.count.load(Ordering::Relaxed)
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_latency_histogram() {
        let h = LatencyHistogram::new();

        h.observe(Duration::from_millis(5));
        h.observe(Duration::from_millis(10));
        h.observe(Duration::from_millis(50));
        h.observe(Duration::from_millis(100));
        h.observe(Duration::from_millis(500));

        assert_eq!(h.count.load(Ordering::Relaxed), 5);

        let mut out = String::new();
        h.export_prometheus(&mut out, "d");
        assert!(out.contains("d_bucket{le=\"0.01\"} 2\n"), "{}", out);
        assert!(out.contains("d_bucket{le=\"0.1\"} 4\n"), "{}", out);
        assert!(out.contains("d_bucket{le=\"+Inf\"} 5\n"), "{}", out);
        assert!(out.contains("d_count 5\n"), "{}", out);
    }

    #[test]
    fn test_request_classes() {
        let m = ProxyMetrics::new();

        m.request_start();
        m.request_end(200, Duration::from_millis(50));
        m.request_start();
        m.request_end(404, Duration::from_millis(3));
        m.request_start();

        let snapshot = m.snapshot();
        assert_eq!(snapshot.requests_total, 3);
        assert_eq!(snapshot.in_progress, 1);
        assert_eq!(m.responses_2xx.load(Ordering::Relaxed), 1);
        assert_eq!(m.responses_4xx.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_export() {
        let m = ProxyMetrics::new();
        m.content_length_exceeded();
        m.response_truncated();
        m.response_truncated();
        m.response_failed();
        m.request_start();
        m.request_end(502, Duration::from_millis(20));

        let out = m.export_prometheus();
        assert!(out.contains("# TYPE camo_proxy_content_length_exceeded_total counter\n"));
        assert!(out.contains("camo_proxy_content_length_exceeded_total 1\n"));
        assert!(out.contains("camo_proxy_responses_truncated_total 2\n"));
        assert!(out.contains("camo_proxy_responses_failed_total 1\n"));
        assert!(out.contains("camo_http_requests_total 1\n"));
        assert!(out.contains("camo_http_responses_total{class=\"5xx\"} 1\n"));
        assert!(out.contains("camo_http_response_duration_seconds_bucket{le=\"0.025\"} 1\n"));
        assert!(out.contains("camo_http_response_duration_seconds_count 1\n"));
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        let m = Arc::new(ProxyMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.response_truncated();
                        m.bytes_sent(3);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = m.snapshot();
        assert_eq!(snapshot.responses_truncated, 8000);
        assert_eq!(snapshot.bytes_sent, 24000);
    }
}
