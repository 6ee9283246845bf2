//! Decoding of raw probe records.
//!
//! Records are packed little-endian structs with no padding, read field by
//! field in declaration order. The full layout length is checked once up
//! front, so fixed-offset reads below never run past the buffer.

use thiserror::Error;

use super::event::{
    ConnDataEvent, Event, RecordKind, SslDataEvent, MAX_DATA_SIZE, SA_DATA_LEN, TASK_COMM_LEN,
};

/// Wire size of an SSL data record.
pub const SSL_DATA_EVENT_SIZE: usize = 8 + 8 + 4 + 4 + MAX_DATA_SIZE + 4 + TASK_COMM_LEN + 4 + 4;

/// Wire size of a connect record.
pub const CONN_DATA_EVENT_SIZE: usize = 8 + 4 + 4 + 4 + SA_DATA_LEN + TASK_COMM_LEN;

/// Errors that can occur while decoding a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("reading {event_name}: need {need} bytes, got {got}")]
    Truncated {
        event_name: &'static str,
        need: usize,
        got: usize,
    },
}

/// Decode a record produced by the probe identified by `kind`.
pub fn decode(kind: RecordKind, data: &[u8]) -> Result<Event, DecodeError> {
    match kind {
        RecordKind::SslData => decode_ssl_data_event(data).map(Event::SslData),
        RecordKind::ConnData => decode_conn_data_event(data).map(Event::ConnData),
    }
}

/// SSL data record: 4144 bytes.
pub fn decode_ssl_data_event(data: &[u8]) -> Result<SslDataEvent, DecodeError> {
    let mut r = Reader::new(data, SSL_DATA_EVENT_SIZE, "ssl data event")?;

    let data_type = r.i64_le();
    let timestamp_ns = r.u64_le();
    let pid = r.u32_le();
    let tid = r.u32_le();
    let raw_data = r.slice(MAX_DATA_SIZE);
    let data_len = r.i32_le();
    let comm = r.bytes::<TASK_COMM_LEN>();
    let fd = r.u32_le();
    let version = r.i32_le();

    let valid = usize::try_from(data_len).unwrap_or(0).min(MAX_DATA_SIZE);

    Ok(SslDataEvent {
        data_type,
        timestamp_ns,
        pid,
        tid,
        data: raw_data.get(..valid).unwrap_or(&[]).to_vec(),
        data_len,
        comm,
        fd,
        version,
    })
}

/// Connect record: 50 bytes.
pub fn decode_conn_data_event(data: &[u8]) -> Result<ConnDataEvent, DecodeError> {
    let mut r = Reader::new(data, CONN_DATA_EVENT_SIZE, "conn data event")?;

    Ok(ConnDataEvent {
        timestamp_ns: r.u64_le(),
        pid: r.u32_le(),
        tid: r.u32_le(),
        fd: r.u32_le(),
        sa_data: r.bytes::<SA_DATA_LEN>(),
        comm: r.bytes::<TASK_COMM_LEN>(),
    })
}

// ---------------------------------------------------------------------------
// Sequential fixed-width reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Verifies `data` covers the whole layout before any field is read.
    fn new(data: &'a [u8], need: usize, event_name: &'static str) -> Result<Self, DecodeError> {
        if data.len() < need {
            return Err(DecodeError::Truncated {
                event_name,
                need,
                got: data.len(),
            });
        }
        Ok(Self { data, pos: 0 })
    }

    /// Next `n` bytes. The layout length was checked in `new`.
    #[inline(always)]
    fn slice(&mut self, n: usize) -> &'a [u8] {
        debug_assert!(self.pos + n <= self.data.len());
        let start = self.pos;
        self.pos += n;
        self.data.get(start..start + n).unwrap_or(&[])
    }

    #[inline(always)]
    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        let src = self.slice(N);
        if src.len() == N {
            out.copy_from_slice(src);
        }
        out
    }

    fn u32_le(&mut self) -> u32 {
        u32::from_le_bytes(self.bytes::<4>())
    }

    fn i32_le(&mut self) -> i32 {
        i32::from_le_bytes(self.bytes::<4>())
    }

    fn u64_le(&mut self) -> u64 {
        u64::from_le_bytes(self.bytes::<8>())
    }

    fn i64_le(&mut self) -> i64 {
        i64::from_le_bytes(self.bytes::<8>())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
