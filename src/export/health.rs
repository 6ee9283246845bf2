use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "ssltap";

/// Prometheus metrics for capture health.
///
/// All metrics use the "ssltap" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Source ===
    /// Total events received from the tracer.
    pub events_received: Counter,
    /// Events received by record kind.
    pub events_by_kind: CounterVec,
    /// Total events that could not be delivered to a worker.
    pub events_dropped: Counter,
    /// Total records that failed to decode.
    pub decode_errors: Counter,

    // === Workers ===
    /// Number of live connection workers.
    pub workers_active: Gauge,
    /// Total connection workers created.
    pub workers_created: Counter,
    /// Total connection workers retired after idling out.
    pub workers_evicted: Counter,
    /// Total non-blocking routes rejected by a full worker queue.
    pub queue_full: Counter,

    // === Messages ===
    /// Total messages rendered to the sink.
    pub messages_rendered: Counter,
    /// Completed messages not rendered, by parser type.
    pub messages_suppressed: CounterVec,
    /// Recoverable parse failures, by parser type.
    pub parse_errors: CounterVec,
    /// Total sink write failures.
    pub sink_errors: Counter,
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<CounterVec> {
    Ok(CounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        labels,
    )?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received =
            counter("events_received_total", "Total events received from the tracer.")?;
        let events_by_kind = counter_vec(
            "events_by_kind_total",
            "Total events received by record kind.",
            &["kind"],
        )?;
        let events_dropped = counter(
            "events_dropped_total",
            "Total events that could not be delivered to a connection worker.",
        )?;
        let decode_errors = counter("decode_errors_total", "Total records that failed to decode.")?;

        let workers_active = Gauge::with_opts(
            Opts::new("workers_active", "Number of live connection workers.").namespace(NAMESPACE),
        )?;
        let workers_created =
            counter("workers_created_total", "Total connection workers created.")?;
        let workers_evicted = counter(
            "workers_evicted_total",
            "Total connection workers retired after idling out.",
        )?;
        let queue_full = counter(
            "queue_full_total",
            "Total non-blocking routes rejected by a full worker queue.",
        )?;

        let messages_rendered =
            counter("messages_rendered_total", "Total messages rendered to the sink.")?;
        let messages_suppressed = counter_vec(
            "messages_suppressed_total",
            "Total completed messages not rendered, by parser type.",
            &["parser"],
        )?;
        let parse_errors = counter_vec(
            "parse_errors_total",
            "Total recoverable parse failures, by parser type.",
            &["parser"],
        )?;
        let sink_errors = counter("sink_errors_total", "Total sink write failures.")?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_by_kind.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(workers_active.clone()))?;
        registry.register(Box::new(workers_created.clone()))?;
        registry.register(Box::new(workers_evicted.clone()))?;
        registry.register(Box::new(queue_full.clone()))?;
        registry.register(Box::new(messages_rendered.clone()))?;
        registry.register(Box::new(messages_suppressed.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(sink_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_by_kind,
            events_dropped,
            decode_errors,
            workers_active,
            workers_created,
            workers_evicted,
            queue_full,
            messages_rendered,
            messages_suppressed,
            parse_errors,
            sink_errors,
        })
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
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

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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
