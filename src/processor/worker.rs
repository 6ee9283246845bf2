use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::parser::{Parser, ParserType};
use super::WorkerContext;
use crate::sink::render::render;
use crate::tracer::event::{AttachType, Event, TlsVersion};

/// Message lifecycle of a connection worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// No message started yet.
    Init,
    /// Accumulating a message.
    Receiving,
    /// Last message emitted; the next event starts a new one.
    Done,
}

/// Identity of the event that started the current message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    pub pid: u32,
    pub tid: u32,
    pub fd: u32,
    pub comm: String,
    pub attach_type: AttachType,
    pub tls_version: TlsVersion,
}

impl MessageMeta {
    pub fn from_event(event: &Event) -> Self {
        match event {
            Event::SslData(e) => Self {
                pid: e.pid,
                tid: e.tid,
                fd: e.fd,
                comm: e.comm(),
                attach_type: e.attach_type(),
                tls_version: e.tls_version(),
            },
            // Connect events carry neither a direction nor a protocol version.
            Event::ConnData(e) => Self {
                pid: e.pid,
                tid: e.tid,
                fd: e.fd,
                comm: e.comm(),
                attach_type: AttachType::Unknown(-1),
                tls_version: TlsVersion::Unknown(0),
            },
        }
    }
}

/// Per-worker counters, logged when the worker retires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub events: u64,
    pub messages_rendered: u64,
    pub messages_suppressed: u64,
    pub parse_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retire {
    Idle,
    Shutdown,
    Disconnected,
}

impl Retire {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Shutdown => "shutdown",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Reassembles the messages of a single connection.
///
/// Sole consumer of its queue, so events are fed to the parser in exactly the
/// order they were routed.
pub(crate) struct Worker {
    uuid: String,
    id: u64,
    rx: mpsc::Receiver<Event>,
    ctx: WorkerContext,
    status: WorkerStatus,
    idle_ticks: u32,
    parser: Option<Parser>,
    meta: Option<MessageMeta>,
    stats: WorkerStats,
}

impl Worker {
    pub(crate) fn new(uuid: String, id: u64, rx: mpsc::Receiver<Event>, ctx: WorkerContext) -> Self {
        Self {
            uuid,
            id,
            rx,
            ctx,
            status: WorkerStatus::Init,
            idle_ticks: 0,
            parser: None,
            meta: None,
            stats: WorkerStats::default(),
        }
    }

    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.cfg.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        let reason = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Retire::Shutdown,

                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break Retire::Disconnected,
                },

                _ = ticker.tick() => {
                    if self.idle_ticks > self.ctx.cfg.max_idle_ticks {
                        break Retire::Idle;
                    }
                    self.idle_ticks += 1;
                }
            }
        };

        self.retire(reason);
    }

    /// Feed one event to the current message, starting a new one if needed.
    fn handle_event(&mut self, event: Event) {
        self.idle_ticks = 0;
        self.stats.events += 1;

        let payload = event.payload();

        if self.status != WorkerStatus::Receiving || self.parser.is_none() {
            self.parser = Some(Parser::default());
            self.meta = Some(MessageMeta::from_event(&event));
            self.status = WorkerStatus::Receiving;
        }

        let Some(parser) = self.parser.as_mut() else {
            return;
        };

        if let Err(e) = parser.feed(&payload) {
            let parser_type = parser.parser_type();
            parser.reset();
            self.status = WorkerStatus::Init;
            self.stats.parse_errors += 1;

            if let Some(m) = &self.ctx.metrics {
                m.parse_errors
                    .with_label_values(&[parser_type.as_str()])
                    .inc();
            }
            tracing::warn!(
                uuid = %self.uuid,
                timestamp_ns = event.timestamp_ns(),
                error = %e,
                "discarding unparseable message"
            );
            return;
        }

        if parser.is_done() {
            self.display();
        }
    }

    /// Emit the current message if complete, then reset for the next one.
    ///
    /// Only HTTP requests are rendered; other completed messages are dropped.
    fn display(&mut self) {
        let Some(parser) = self.parser.as_mut() else {
            return;
        };
        if !parser.is_done() {
            return;
        }

        let parser_type = parser.parser_type();

        if parser_type == ParserType::HttpRequest {
            let msg = parser.emit();
            if let Some(meta) = &self.meta {
                let record = render(
                    &self.uuid,
                    meta,
                    &msg,
                    self.ctx.resolver.as_ref(),
                    self.ctx.color,
                );

                match self.ctx.sink.write(&record) {
                    Ok(()) => {
                        self.stats.messages_rendered += 1;
                        if let Some(m) = &self.ctx.metrics {
                            m.messages_rendered.inc();
                        }
                        tracing::debug!(
                            uuid = %self.uuid,
                            summary = %msg.summary,
                            len = msg.bytes.len(),
                            "message rendered"
                        );
                    }
                    Err(e) => {
                        if let Some(m) = &self.ctx.metrics {
                            m.sink_errors.inc();
                        }
                        tracing::warn!(
                            uuid = %self.uuid,
                            sink = self.ctx.sink.name(),
                            error = %e,
                            "sink write failed"
                        );
                    }
                }
            }
        } else {
            self.stats.messages_suppressed += 1;
            if let Some(m) = &self.ctx.metrics {
                m.messages_suppressed
                    .with_label_values(&[parser_type.as_str()])
                    .inc();
            }
        }

        parser.reset();
        self.status = WorkerStatus::Done;
    }

    /// Close the queue, process anything still buffered, flush and leave the map.
    fn retire(mut self, reason: Retire) {
        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            self.handle_event(event);
        }
        self.display();

        self.ctx.registry.remove_if_current(&self.uuid, self.id);

        if let Some(m) = &self.ctx.metrics {
            m.workers_active.dec();
            if reason == Retire::Idle {
                m.workers_evicted.inc();
            }
        }

        tracing::debug!(
            uuid = %self.uuid,
            id = self.id,
            reason = reason.as_str(),
            events = self.stats.events,
            rendered = self.stats.messages_rendered,
            suppressed = self.stats.messages_suppressed,
            parse_errors = self.stats.parse_errors,
            "connection worker retired"
        );
    }
}
