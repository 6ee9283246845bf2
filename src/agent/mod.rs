pub mod conn_table;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::Counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::processor::{AddressResolver, EventProcessor};
use crate::sink::{Sink, StdoutSink};
use crate::tracer::event::{Event, RecordKind, RECORD_KIND_CARDINALITY};
use crate::tracer::parse::DecodeError;
use crate::tracer::replay::ReplayTracer;
use crate::tracer::stats::EventStats;
use crate::tracer::Tracer;

use self::conn_table::ConnTable;

/// Agent wires the tracer, connection table, event processor and sink together.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    sink: Arc<dyn Sink>,
    conn_table: Arc<ConnTable>,
    captured_stats: Arc<EventStats>,
    processor: Option<Arc<EventProcessor>>,
    tracer: Option<ReplayTracer>,
    pipeline: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

fn build_kind_counters(health: &HealthMetrics) -> Vec<Counter> {
    let mut counters = Vec::with_capacity(RECORD_KIND_CARDINALITY);
    for kind in RecordKind::all() {
        counters.push(health.events_by_kind.with_label_values(&[kind.as_str()]));
    }
    counters
}

impl Agent {
    /// Creates a new Agent that renders to stdout.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_sink(cfg, Arc::new(StdoutSink))
    }

    /// Creates a new Agent rendering to `sink`.
    pub fn with_sink(cfg: Config, sink: Arc<dyn Sink>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            sink,
            conn_table: Arc::new(ConnTable::new()),
            captured_stats: Arc::new(EventStats::new()),
            processor: None,
            tracer: None,
            pipeline: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn conn_table(&self) -> &Arc<ConnTable> {
        &self.conn_table
    }

    /// Start all components and begin processing.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health metrics server.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 2. Event processor, resolving peers through the connection table.
        let resolver: Arc<dyn AddressResolver> = self.conn_table.clone();
        let processor = Arc::new(
            EventProcessor::new(self.cfg.processor.clone(), resolver, Arc::clone(&self.sink))
                .with_metrics(Arc::clone(&self.health))
                .with_color(self.cfg.output.color),
        );

        // 3. Tracer.
        let mut tracer = ReplayTracer::from_path(&self.cfg.source.replay_path);

        let health_err = Arc::clone(&self.health);
        let stats_err = Arc::clone(&self.captured_stats);
        tracer.on_error(Box::new(move |err| {
            if err.downcast_ref::<DecodeError>().is_some() {
                stats_err.record_decode_error();
                health_err.decode_errors.inc();
            } else {
                health_err.events_dropped.inc();
                warn!(error = %err, "tracer error");
            }
        }));

        let (tx, rx) = mpsc::channel(self.cfg.source.channel_capacity);
        tracer
            .start(self.cancel.child_token(), tx)
            .await
            .context("starting tracer")?;
        info!(path = %self.cfg.source.replay_path.display(), "tracer started");

        // 4. Dispatch loop.
        self.pipeline = Some(tokio::spawn(dispatch_events(
            rx,
            Arc::clone(&processor),
            Arc::clone(&self.conn_table),
            Arc::clone(&self.captured_stats),
            Arc::clone(&self.health),
            self.cancel.child_token(),
        )));

        self.tracer = Some(tracer);
        self.processor = Some(processor);

        // 5. Background monitors.
        self.spawn_event_stats_reporter();
        tokio::spawn(sweep_conn_table(
            Arc::clone(&self.conn_table),
            self.cfg.source.conn_idle_timeout,
            self.cancel.child_token(),
        ));

        info!("agent fully started");

        Ok(())
    }

    /// Wait until the tracer has delivered its last event and the dispatch
    /// loop has routed it.
    pub async fn wait_for_input_end(&mut self) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            if let Err(e) = pipeline.await {
                error!(error = %e, "dispatch loop failed");
            }
            self.pipeline = None;
        }
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        if let Some(mut tracer) = self.tracer.take() {
            if let Err(e) = tracer.stop().await {
                error!(error = %e, "error stopping tracer");
            }
        }

        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.await {
                error!(error = %e, "dispatch loop failed");
            }
        }

        // Flush and retire every connection worker.
        if let Some(processor) = self.processor.take() {
            if let Err(e) = processor.shutdown(self.cfg.processor.shutdown_timeout).await {
                warn!(error = %e, "event processor shutdown incomplete");
            }
        }

        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }

    /// Spawn background event stats reporter.
    fn spawn_event_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let captured_stats = Arc::clone(&self.captured_stats);
        let processor = self.processor.as_ref().map(Arc::clone);
        let conn_table = Arc::clone(&self.conn_table);
        let interval = self.cfg.stats_report_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = captured_stats.snapshot();
                        let decode_errors = captured_stats.take_decode_errors();
                        let total: u64 = snapshot.iter().map(|(_, n)| n).sum();

                        if total == 0 && decode_errors == 0 {
                            continue;
                        }

                        info!(
                            captured = total,
                            decode_errors,
                            workers = processor.as_ref().map_or(0, |p| p.worker_count()),
                            connections = conn_table.len(),
                            interval = ?interval,
                            "event stats",
                        );

                        for (kind, count) in &snapshot {
                            debug!(kind = %kind, count, "  by kind");
                        }
                    }
                }
            }
        });
    }
}

/// Route every event from the tracer to its connection worker.
///
/// Connect events also feed the connection table so later payload events on
/// the same descriptor resolve to their peer.
async fn dispatch_events(
    mut events: mpsc::Receiver<Event>,
    processor: Arc<EventProcessor>,
    conn_table: Arc<ConnTable>,
    captured_stats: Arc<EventStats>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    let kind_counters = build_kind_counters(&health);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let kind = event.kind();
        health.events_received.inc();
        captured_stats.record(kind);
        if let Some(counter) = kind_counters.get(kind as usize) {
            counter.inc();
        }

        match &event {
            Event::ConnData(conn) => conn_table.insert(conn.pid, conn.fd, conn.addr()),
            Event::SslData(_) => conn_table.touch(event.pid(), event.fd()),
        }

        let (pid, tid) = (event.pid(), event.tid());
        let routed = tokio::select! {
            _ = cancel.cancelled() => break,
            routed = processor.route(event) => routed,
        };

        if let Err(e) = routed {
            health.events_dropped.inc();
            warn!(pid, tid, error = %e, "dropping event");
        }
    }

    debug!("dispatch loop finished");
}

/// Periodically forget peer addresses of connections that went quiet.
async fn sweep_conn_table(
    conn_table: Arc<ConnTable>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(idle_timeout);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let evicted = conn_table.evict_idle(idle_timeout);
                if evicted > 0 {
                    debug!(evicted, remaining = conn_table.len(), "evicted idle connections");
                }
            }
        }
    }
}
