use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio_util::sync::CancellationToken;

use crate::spill::SpillPhase;

const NAMESPACE: &str = "spillmon";

/// Prometheus metrics describing the monitor's own health.
///
/// All metrics use the "spillmon" namespace. The HTTP server is optional;
/// the metrics are updated whether or not anyone scrapes them.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    server: parking_lot::Mutex<Option<JoinHandle<()>>>,

    // === Ingestion ===
    /// Events received from the source.
    pub events_received: Counter,
    /// Events by trigger category.
    pub events_by_trigger: CounterVec,
    /// Hit deltas delivered per channel.
    pub hits_by_channel: CounterVec,
    /// Counters that stepped backwards instead of rolling over.
    pub counter_anomalies: Counter,
    /// Events discarded while skipping the server backlog.
    pub backlog_discarded: Counter,
    /// Current queue length per consumer.
    pub queue_length: GaugeVec,
    /// Queue capacity per consumer.
    pub queue_capacity: GaugeVec,

    // === Spills ===
    /// Current spill phase (0=unknown, 1=in spill, 2=off spill).
    pub spill_phase: Gauge,
    /// Snapshots built at end of spill.
    pub spills_completed: Counter,
    /// End-of-spill triggers whose beginning was never observed.
    pub spills_skipped: Counter,
    /// Observed spill duration in seconds.
    pub spill_duration: Histogram,

    // === Publishing ===
    /// Snapshot deliveries by outcome (delivered/dropped).
    pub deliveries: CounterVec,
    /// Publish calls that failed outright.
    pub publish_errors: Counter,
}

impl HealthMetrics {
    /// Creates the metrics, all registered with a private registry.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new("events_received_total", "Total events received from the source.")
                .namespace(NAMESPACE),
        )?;
        let events_by_trigger = CounterVec::new(
            Opts::new("events_by_trigger_total", "Events by trigger category.")
                .namespace(NAMESPACE),
            &["trigger"],
        )?;
        let hits_by_channel = CounterVec::new(
            Opts::new("hits_total", "Hit intervals delivered per channel.").namespace(NAMESPACE),
            &["channel"],
        )?;
        let counter_anomalies = Counter::with_opts(
            Opts::new(
                "counter_anomalies_total",
                "Hardware counters that stepped backwards instead of rolling over.",
            )
            .namespace(NAMESPACE),
        )?;
        let backlog_discarded = Counter::with_opts(
            Opts::new(
                "backlog_discarded_total",
                "Events discarded while skipping the server backlog.",
            )
            .namespace(NAMESPACE),
        )?;
        let queue_length = GaugeVec::new(
            Opts::new("queue_length", "Events waiting per consumer queue.").namespace(NAMESPACE),
            &["consumer"],
        )?;
        let queue_capacity = GaugeVec::new(
            Opts::new("queue_capacity", "Capacity per consumer queue.").namespace(NAMESPACE),
            &["consumer"],
        )?;

        let spill_phase = Gauge::with_opts(
            Opts::new(
                "spill_phase",
                "Current spill phase (0=unknown, 1=in spill, 2=off spill).",
            )
            .namespace(NAMESPACE),
        )?;
        let spills_completed = Counter::with_opts(
            Opts::new("spills_completed_total", "Spill snapshots built.").namespace(NAMESPACE),
        )?;
        let spills_skipped = Counter::with_opts(
            Opts::new(
                "spills_skipped_total",
                "End-of-spill triggers without an observed beginning.",
            )
            .namespace(NAMESPACE),
        )?;
        let spill_duration = Histogram::with_opts(
            HistogramOpts::new("spill_duration_seconds", "Observed spill duration in seconds.")
                .namespace(NAMESPACE)
                .buckets(vec![0.5, 1.0, 2.0, 4.0, 6.0, 8.0, 10.0, 15.0, 20.0]),
        )?;

        let deliveries = CounterVec::new(
            Opts::new(
                "snapshot_deliveries_total",
                "Snapshot deliveries to subscribers by outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let publish_errors = Counter::with_opts(
            Opts::new("publish_errors_total", "Snapshot publish failures.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_by_trigger.clone()))?;
        registry.register(Box::new(hits_by_channel.clone()))?;
        registry.register(Box::new(counter_anomalies.clone()))?;
        registry.register(Box::new(backlog_discarded.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(queue_capacity.clone()))?;
        registry.register(Box::new(spill_phase.clone()))?;
        registry.register(Box::new(spills_completed.clone()))?;
        registry.register(Box::new(spills_skipped.clone()))?;
        registry.register(Box::new(spill_duration.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(publish_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            server: parking_lot::Mutex::new(None),
            events_received,
            events_by_trigger,
            hits_by_channel,
            counter_anomalies,
            backlog_discarded,
            queue_length,
            queue_capacity,
            spill_phase,
            spills_completed,
            spills_skipped,
            spill_duration,
            deliveries,
            publish_errors,
        })
    }

    pub fn set_phase(&self, phase: SpillPhase) {
        let value = match phase {
            SpillPhase::Unknown => 0.0,
            SpillPhase::InSpill => 1.0,
            SpillPhase::OffSpill => 2.0,
        };
        self.spill_phase.set(value);
    }

    /// Current metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz on its own thread.
    ///
    /// Does nothing when the configured address is empty.
    pub fn start(&self) -> Result<()> {
        if self.addr.is_empty() {
            tracing::info!("health metrics server disabled");
            return Ok(());
        }

        // ":port" shorthand listens on all interfaces.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let listener = std::net::TcpListener::bind(&bind_addr)
            .with_context(|| format!("listening on {bind_addr}"))?;
        listener
            .set_nonblocking(true)
            .context("setting health listener non-blocking")?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::new(AppState {
                registry: self.registry.clone(),
            }));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building health server runtime")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let handle = std::thread::Builder::new()
            .name("health".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            tracing::error!(error = %e, "health metrics listener");
                            return;
                        }
                    };

                    tracing::info!(addr = %local_addr, "health metrics server started");

                    let result = axum::serve(
                        listener,
                        app.into_make_service_with_connect_info::<SocketAddr>(),
                    )
                    .with_graceful_shutdown(async move {
                        cancel.cancelled().await;
                    })
                    .await;

                    if let Err(e) = result {
                        tracing::error!(error = %e, "health metrics server error");
                    }
                });
            })
            .context("spawning health server thread")?;

        *self.server.lock() = Some(handle);

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        if let Some(handle) = self.server.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
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
