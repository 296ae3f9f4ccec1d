//! Process-wide proxy metrics and their Prometheus text rendering.
//!
//! The metric names are the observability contract: `total_requests`,
//! `request_errors`, `active_connections`, `task_count`,
//! `cpu_usage_percent`, `memory_usage_bytes`, `request_latency_seconds`.
//! All series are label-less.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::debug;

/// Histogram bucket upper bounds, in seconds.
const LATENCY_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// How often the background sampler refreshes task/CPU/memory gauges.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Counters, gauges, and the request latency histogram for one proxy
/// process. Shared across the data plane, control plane, and the metrics
/// endpoint via `Arc`.
pub struct ProxyMetrics {
    total_requests: AtomicU64,
    request_errors: AtomicU64,
    active_connections: AtomicU64,
    task_count: AtomicU64,
    cpu_usage_percent: AtomicU64,
    memory_usage_bytes: AtomicU64,
    latency_buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    latency_count: AtomicU64,
    latency_sum_ns: AtomicU64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            request_errors: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            task_count: AtomicU64::new(0),
            cpu_usage_percent: AtomicU64::new(0f64.to_bits()),
            memory_usage_bytes: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_count: AtomicU64::new(0),
            latency_sum_ns: AtomicU64::new(0),
        }
    }

    /// Count one handled request (or, for the L4 plane, one connection).
    pub fn incr_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one error generated by the proxy itself.
    pub fn incr_errors(&self) {
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// RAII guard for the `active_connections` gauge.
    pub fn connection_guard(self: Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard { metrics: self }
    }

    /// Record one request (or connection) duration.
    pub fn observe_latency(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            if secs <= *bound {
                self.latency_buckets[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn request_errors(&self) -> u64 {
        self.request_errors.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Spawn the background task that keeps the task-count and process
    /// CPU/memory gauges fresh. Runs until the process exits.
    pub fn spawn_sampler(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let metrics = self;
        tokio::spawn(async move {
            let mut system = System::new();
            let pid = Pid::from_u32(std::process::id());
            let refresh = ProcessRefreshKind::new().with_cpu().with_memory();
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);

            loop {
                ticker.tick().await;

                let tasks = tokio::runtime::Handle::current()
                    .metrics()
                    .num_alive_tasks() as u64;
                metrics.task_count.store(tasks, Ordering::Relaxed);

                system.refresh_process_specifics(pid, refresh);
                if let Some(process) = system.process(pid) {
                    metrics.cpu_usage_percent.store(
                        f64::from(process.cpu_usage()).to_bits(),
                        Ordering::Relaxed,
                    );
                    metrics
                        .memory_usage_bytes
                        .store(process.memory(), Ordering::Relaxed);
                }
                debug!(tasks = tasks, "Metrics sampled");
            }
        })
    }

    /// Render all series in Prometheus text format.
    pub fn render(&self) -> String {
        use std::fmt::Write;

        let mut out = String::with_capacity(2048);

        writeln!(out, "# HELP total_requests Total number of requests processed by the proxy.").unwrap();
        writeln!(out, "# TYPE total_requests counter").unwrap();
        writeln!(out, "total_requests {}", self.total_requests()).unwrap();

        writeln!(out, "# HELP request_errors Total number of request errors generated by the proxy.").unwrap();
        writeln!(out, "# TYPE request_errors counter").unwrap();
        writeln!(out, "request_errors {}", self.request_errors()).unwrap();

        writeln!(out, "# HELP active_connections Number of connections currently being handled.").unwrap();
        writeln!(out, "# TYPE active_connections gauge").unwrap();
        writeln!(out, "active_connections {}", self.active_connections()).unwrap();

        writeln!(out, "# HELP task_count Number of live runtime tasks.").unwrap();
        writeln!(out, "# TYPE task_count gauge").unwrap();
        writeln!(out, "task_count {}", self.task_count.load(Ordering::Relaxed)).unwrap();

        writeln!(out, "# HELP cpu_usage_percent Current process CPU usage as a percentage.").unwrap();
        writeln!(out, "# TYPE cpu_usage_percent gauge").unwrap();
        writeln!(
            out,
            "cpu_usage_percent {:.2}",
            f64::from_bits(self.cpu_usage_percent.load(Ordering::Relaxed))
        )
        .unwrap();

        writeln!(out, "# HELP memory_usage_bytes Resident memory of the proxy process in bytes.").unwrap();
        writeln!(out, "# TYPE memory_usage_bytes gauge").unwrap();
        writeln!(
            out,
            "memory_usage_bytes {}",
            self.memory_usage_bytes.load(Ordering::Relaxed)
        )
        .unwrap();

        writeln!(out, "# HELP request_latency_seconds Histogram of request latency in seconds.").unwrap();
        writeln!(out, "# TYPE request_latency_seconds histogram").unwrap();
        let mut cumulative = 0u64;
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            cumulative += self.latency_buckets[i].load(Ordering::Relaxed);
            writeln!(
                out,
                "request_latency_seconds_bucket{{le=\"{bound}\"}} {cumulative}"
            )
            .unwrap();
        }
        let count = self.latency_count.load(Ordering::Relaxed);
        writeln!(out, "request_latency_seconds_bucket{{le=\"+Inf\"}} {count}").unwrap();
        writeln!(
            out,
            "request_latency_seconds_sum {:.6}",
            self.latency_sum_ns.load(Ordering::Relaxed) as f64 / 1e9
        )
        .unwrap();
        writeln!(out, "request_latency_seconds_count {count}").unwrap();

        out
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements `active_connections` when dropped.
pub struct ConnectionGuard {
    metrics: Arc<ProxyMetrics>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}
