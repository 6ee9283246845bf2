pub mod hexdump;
pub mod render;

use std::io::Write;

use anyhow::{Context, Result};
use parking_lot::Mutex;

/// Sink consumes rendered message records.
pub trait Sink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Write one rendered record.
    fn write(&self, record: &str) -> Result<()>;
}

/// Writes each record to standard output.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl Sink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    fn write(&self, record: &str) -> Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{record}").context("writing record to stdout")?;
        out.flush().context("flushing stdout")
    }
}

/// Keeps records in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record written so far.
    pub fn records(&self) -> Vec<String> {
        self.records.lock().clone()
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write(&self, record: &str) -> Result<()> {
        self.records.lock().push(record.to_string());
        Ok(())
    }
}
