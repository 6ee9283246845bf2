//! Replay of recorded probe output.
//!
//! A capture is a sequence of frames: `kind:u8, len:u32 LE, bytes[len]`,
//! where `kind` is a [`RecordKind`] and `bytes` is the raw record exactly as
//! the probe emitted it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event::{Event, RecordKind};
use super::parse::{decode, SSL_DATA_EVENT_SIZE};
use super::{ErrorHandler, Tracer};

/// Upper bound on a single frame; anything larger means the capture is corrupt.
pub const MAX_FRAME_LEN: usize = 4 * SSL_DATA_EVENT_SIZE;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

enum Input {
    Path(PathBuf),
    Reader(BoxedReader),
}

/// Tracer that replays a recorded capture.
pub struct ReplayTracer {
    input: Option<Input>,
    error_handlers: Vec<ErrorHandler>,
    read_task: Option<tokio::task::JoinHandle<()>>,
}

impl ReplayTracer {
    /// Replay frames from a capture file.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::with_input(Input::Path(path.as_ref().to_path_buf()))
    }

    /// Replay frames from any async reader.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::with_input(Input::Reader(Box::new(reader)))
    }

    fn with_input(input: Input) -> Self {
        Self {
            input: Some(input),
            error_handlers: Vec::with_capacity(2),
            read_task: None,
        }
    }
}

impl Tracer for ReplayTracer {
    async fn start(&mut self, ctx: CancellationToken, events: mpsc::Sender<Event>) -> Result<()> {
        let reader: BoxedReader = match self.input.take() {
            Some(Input::Path(path)) => Box::new(
                tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("opening capture {}", path.display()))?,
            ),
            Some(Input::Reader(reader)) => reader,
            None => anyhow::bail!("replay tracer already started"),
        };

        let error_handlers = Arc::new(std::mem::take(&mut self.error_handlers));

        let handle = tokio::spawn(async move {
            read_loop(BufReader::new(reader), events, error_handlers, ctx).await;
        });

        self.read_task = Some(handle);

        tracing::info!("replay tracer started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // The read task exits on EOF or when the CancellationToken is cancelled.
        if let Some(handle) = self.read_task.take() {
            handle.await.context("waiting for read task")?;
        }

        tracing::info!("replay tracer stopped");
        Ok(())
    }

    fn on_error(&mut self, handler: ErrorHandler) {
        self.error_handlers.push(handler);
    }
}

/// Outcome of reading one frame.
enum Frame {
    Record(RecordKind, Vec<u8>),
    UnknownKind(u8),
    Eof,
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Frame> {
    let kind = match reader.read_u8().await {
        Ok(k) => k,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(Frame::Eof),
        Err(e) => return Err(e),
    };

    let len = reader.read_u32_le().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds {MAX_FRAME_LEN}"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    Ok(match RecordKind::from_u8(kind) {
        Some(kind) => Frame::Record(kind, buf),
        None => Frame::UnknownKind(kind),
    })
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    events: mpsc::Sender<Event>,
    error_handlers: Arc<Vec<ErrorHandler>>,
    cancel: CancellationToken,
) {
    let mut frames: u64 = 0;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Frame::Eof) => {
                tracing::info!(frames, "capture replay reached end of input");
                break;
            }
            Ok(Frame::UnknownKind(raw)) => {
                tracing::debug!(raw, "skipping frame with unknown record kind");
                report_error(
                    &error_handlers,
                    anyhow::anyhow!("unknown record kind: {raw}"),
                );
            }
            Ok(Frame::Record(kind, data)) => {
                frames += 1;
                match decode(kind, &data) {
                    Ok(event) => {
                        // Backpressure: wait for room rather than dropping.
                        let sent = tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = events.send(event) => sent,
                        };
                        if sent.is_err() {
                            tracing::debug!("event consumer closed, stopping replay");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, kind = %kind, "record decode error");
                        report_error(&error_handlers, anyhow::Error::new(e));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "capture read error, stopping replay");
                report_error(&error_handlers, anyhow::Error::new(e));
                break;
            }
        }
    }
}

fn report_error(handlers: &[ErrorHandler], err: anyhow::Error) {
    match handlers {
        [] => {}
        [only] => only(err),
        _ => {
            let msg = format!("{err:#}");
            for handler in handlers {
                handler(anyhow::anyhow!("{msg}"));
            }
        }
    }
}

/// Encode one capture frame.
pub fn encode_frame(kind: RecordKind, record: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + record.len());
    out.push(kind as u8);
    out.extend_from_slice(&(record.len() as u32).to_le_bytes());
    out.extend_from_slice(record);
    out
}
