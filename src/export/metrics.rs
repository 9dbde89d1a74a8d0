use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "socwatch";

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

/// Prometheus registry for SoC gauges and pipeline health.
///
/// All metrics use the "socwatch" namespace. Created once per process and
/// shared as `Arc`; the HTTP server is optional.
pub struct ExporterMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === SoC gauges ===
    pub cpu_usage_percent: Gauge,
    pub ecore_usage_percent: Gauge,
    pub pcore_usage_percent: Gauge,
    /// Per-core utilization, labelled by index and core type.
    pub core_usage_percent: GaugeVec,
    pub gpu_usage_percent: Gauge,
    pub gpu_freq_mhz: Gauge,
    /// Memory in GiB by type (used, total, swap_used, swap_total).
    pub memory_gb: GaugeVec,
    /// Network throughput in MiB/s by type (in, out).
    pub network_activity_mb: GaugeVec,
    pub network_packets_per_sec: GaugeVec,
    /// Disk throughput in MiB/s by type (read, write).
    pub disk_activity_mb: GaugeVec,
    pub disk_iops: GaugeVec,
    pub power_watts: GaugeVec,
    /// 0 nominal, 1 moderate, 2 heavy, 3 trapping or critical.
    pub thermal_state: Gauge,
    pub system_status: GaugeVec,

    // === Pipeline health ===
    pub samples_decoded: Counter,
    pub decode_errors: Counter,
    /// Framing failures by kind (incomplete, overflow, io).
    pub framing_errors: CounterVec,
    pub malformed_streak_resets: Counter,
    pub cpu_query_errors: Counter,
    pub mailbox_overwrites: CounterVec,
}

impl ExporterMetrics {
    /// Creates the registry with every metric registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let cpu_usage_percent = Gauge::with_opts(opts(
            "cpu_usage_percent",
            "Average utilization across all cores.",
        ))?;
        let ecore_usage_percent = Gauge::with_opts(opts(
            "ecore_usage_percent",
            "Average utilization of efficiency cores.",
        ))?;
        let pcore_usage_percent = Gauge::with_opts(opts(
            "pcore_usage_percent",
            "Average utilization of performance cores.",
        ))?;
        let core_usage_percent = GaugeVec::new(
            opts("core_usage_percent", "Utilization of a single core."),
            &["core", "type"],
        )?;
        let gpu_usage_percent =
            Gauge::with_opts(opts("gpu_usage_percent", "GPU active residency."))?;
        let gpu_freq_mhz = Gauge::with_opts(opts("gpu_freq_mhz", "GPU frequency in MHz."))?;
        let memory_gb = GaugeVec::new(opts("memory_gb", "Memory usage in GiB."), &["type"])?;
        let network_activity_mb = GaugeVec::new(
            opts("network_activity_mb", "Network throughput in MiB/s."),
            &["type"],
        )?;
        let network_packets_per_sec = GaugeVec::new(
            opts("network_packets_per_sec", "Network packets per second."),
            &["direction"],
        )?;
        let disk_activity_mb = GaugeVec::new(
            opts("disk_activity_mb", "Disk throughput in MiB/s."),
            &["type"],
        )?;
        let disk_iops = GaugeVec::new(
            opts("disk_iops", "Disk operations per second."),
            &["operation"],
        )?;
        let power_watts = GaugeVec::new(
            opts("power_watts", "Power draw in watts by component."),
            &["component"],
        )?;
        let thermal_state = Gauge::with_opts(opts(
            "thermal_state",
            "Thermal pressure (0=nominal, 1=moderate, 2=heavy, 3=critical).",
        ))?;
        let system_status = GaugeVec::new(
            opts("system_status", "Chip core counts and throttling flag."),
            &["type"],
        )?;

        let samples_decoded = Counter::with_opts(opts(
            "samples_decoded_total",
            "Total sampler records decoded.",
        ))?;
        let decode_errors = Counter::with_opts(opts(
            "decode_errors_total",
            "Total sampler records that failed to decode.",
        ))?;
        let framing_errors = CounterVec::new(
            opts("framing_errors_total", "Total framing failures by kind."),
            &["kind"],
        )?;
        let malformed_streak_resets = Counter::with_opts(opts(
            "malformed_streak_resets_total",
            "Times the consecutive malformed record limit was reached.",
        ))?;
        let cpu_query_errors = Counter::with_opts(opts(
            "cpu_query_errors_total",
            "Total failed per-core tick queries.",
        ))?;
        let mailbox_overwrites = CounterVec::new(
            opts(
                "mailbox_overwrites_total",
                "Total unread values replaced in a dispatcher mailbox.",
            ),
            &["category"],
        )?;

        registry.register(Box::new(cpu_usage_percent.clone()))?;
        registry.register(Box::new(ecore_usage_percent.clone()))?;
        registry.register(Box::new(pcore_usage_percent.clone()))?;
        registry.register(Box::new(core_usage_percent.clone()))?;
        registry.register(Box::new(gpu_usage_percent.clone()))?;
        registry.register(Box::new(gpu_freq_mhz.clone()))?;
        registry.register(Box::new(memory_gb.clone()))?;
        registry.register(Box::new(network_activity_mb.clone()))?;
        registry.register(Box::new(network_packets_per_sec.clone()))?;
        registry.register(Box::new(disk_activity_mb.clone()))?;
        registry.register(Box::new(disk_iops.clone()))?;
        registry.register(Box::new(power_watts.clone()))?;
        registry.register(Box::new(thermal_state.clone()))?;
        registry.register(Box::new(system_status.clone()))?;

        registry.register(Box::new(samples_decoded.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(framing_errors.clone()))?;
        registry.register(Box::new(malformed_streak_resets.clone()))?;
        registry.register(Box::new(cpu_query_errors.clone()))?;
        registry.register(Box::new(mailbox_overwrites.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cpu_usage_percent,
            ecore_usage_percent,
            pcore_usage_percent,
            core_usage_percent,
            gpu_usage_percent,
            gpu_freq_mhz,
            memory_gb,
            network_activity_mb,
            network_packets_per_sec,
            disk_activity_mb,
            disk_iops,
            power_watts,
            thermal_state,
            system_status,
            samples_decoded,
            decode_errors,
            framing_errors,
            malformed_streak_resets,
            cpu_query_errors,
            mailbox_overwrites,
        })
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // ":port" shorthand binds every interface.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the HTTP server, if running.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered_with_namespace() {
        let m = ExporterMetrics::new(":0").expect("registers");
        m.cpu_usage_percent.set(12.5);
        m.power_watts.with_label_values(&["cpu"]).set(5.0);
        m.framing_errors.with_label_values(&["overflow"]).inc();

        let text = m.render().expect("renders");
        assert!(text.contains("socwatch_cpu_usage_percent 12.5"));
        assert!(text.contains("socwatch_power_watts{component=\"cpu\"} 5"));
        assert!(text.contains("socwatch_framing_errors_total{kind=\"overflow\"} 1"));
    }

    #[tokio::test]
    async fn test_server_serves_metrics_and_healthz() {
        let m = ExporterMetrics::new("127.0.0.1:0").expect("registers");
        m.gpu_freq_mhz.set(1398.0);
        let addr = m.start().await.expect("starts");

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connects");
        let body = http_get(&mut stream, "/healthz").await;
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.ends_with("ok"));

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connects");
        let body = http_get(&mut stream, "/metrics").await;
        assert!(body.contains("socwatch_gpu_freq_mhz 1398"));

        m.stop().await.expect("stops");
    }

    async fn http_get(stream: &mut tokio::net::TcpStream, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("writes");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("reads");
        response
    }
}
