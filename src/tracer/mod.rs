pub mod event;
pub mod parse;
pub mod replay;
pub mod stats;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use self::event::Event;

/// Callback for tracer errors (I/O failures, undecodable records).
pub type ErrorHandler = Box<dyn Fn(anyhow::Error) + Send + Sync>;

/// Tracer produces decoded probe events.
///
/// Probe attachment lives outside this crate; implementations only deliver
/// records that were already captured. Events are sent over a bounded channel
/// so a slow consumer applies backpressure to the reader.
pub trait Tracer: Send {
    /// Start the reader task, delivering decoded events to `events`.
    fn start(
        &mut self,
        ctx: CancellationToken,
        events: mpsc::Sender<Event>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Wait for the reader task to finish.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Register a handler for tracer errors.
    fn on_error(&mut self, handler: ErrorHandler);
}
