use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Maximum captured payload per SSL data event (matches `MAX_DATA_SIZE` in the probe).
pub const MAX_DATA_SIZE: usize = 4096;

/// Width of the `comm` field (matches `TASK_COMM_LEN`).
pub const TASK_COMM_LEN: usize = 16;

/// Width of the raw `sa_data` blob in connect events.
pub const SA_DATA_LEN: usize = 14;

/// RecordKind identifies which probe produced a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    SslData = 0,
    ConnData = 1,
}

/// Number of RecordKind variants, used for array sizing.
pub const RECORD_KIND_CARDINALITY: usize = 2;

impl RecordKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SslData => "ssl_data",
            Self::ConnData => "conn_data",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::SslData),
            1 => Some(Self::ConnData),
            _ => None,
        }
    }

    /// Return all record kinds in numeric order.
    pub fn all() -> &'static [Self] {
        &[Self::SslData, Self::ConnData]
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probe attach point of an SSL data event.
///
/// The entry probe fires on `SSL_read` (data received from the peer), the
/// return probe on `SSL_write` (data sent to the peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachType {
    Entry,
    Return,
    Unknown(i64),
}

impl AttachType {
    pub fn from_raw(v: i64) -> Self {
        match v {
            0 => Self::Entry,
            1 => Self::Return,
            other => Self::Unknown(other),
        }
    }
}

/// Protocol version reported by the instrumented TLS library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    Ssl2,
    Ssl3,
    Tls1,
    Tls1_1,
    Tls1_2,
    Tls1_3,
    Dtls1,
    Dtls1_2,
    Unknown(i32),
}

impl TlsVersion {
    pub fn from_raw(v: i32) -> Self {
        match v {
            0x0002 => Self::Ssl2,
            0x0300 => Self::Ssl3,
            0x0301 => Self::Tls1,
            0x0302 => Self::Tls1_1,
            0x0303 => Self::Tls1_2,
            0x0304 => Self::Tls1_3,
            0xFEFF => Self::Dtls1,
            0xFEFD => Self::Dtls1_2,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssl2 => f.write_str("SSL2_VERSION"),
            Self::Ssl3 => f.write_str("SSL3_VERSION"),
            Self::Tls1 => f.write_str("TLS1_VERSION"),
            Self::Tls1_1 => f.write_str("TLS1_1_VERSION"),
            Self::Tls1_2 => f.write_str("TLS1_2_VERSION"),
            Self::Tls1_3 => f.write_str("TLS1_3_VERSION"),
            Self::Dtls1 => f.write_str("DTLS1_VERSION"),
            Self::Dtls1_2 => f.write_str("DTLS1_2_VERSION"),
            Self::Unknown(raw) => write!(f, "TLS_VERSION_UNKNOWN_{raw}"),
        }
    }
}

/// Decrypted payload captured at an SSL read/write probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslDataEvent {
    /// Attach-point discriminator: 0 = entry (read), 1 = return (write).
    pub data_type: i64,
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    /// Valid payload bytes, `data_len` clamped to `0..=MAX_DATA_SIZE`.
    pub data: Vec<u8>,
    /// Raw length reported by the probe.
    pub data_len: i32,
    pub comm: [u8; TASK_COMM_LEN],
    pub fd: u32,
    pub version: i32,
}

impl SslDataEvent {
    pub fn attach_type(&self) -> AttachType {
        AttachType::from_raw(self.data_type)
    }

    pub fn tls_version(&self) -> TlsVersion {
        TlsVersion::from_raw(self.version)
    }

    pub fn comm(&self) -> String {
        comm_to_string(&self.comm)
    }

    /// Connection identity: `{pid}_{tid}_{comm}_{fd}_{data_type}`.
    pub fn uuid(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.pid,
            self.tid,
            self.comm(),
            self.fd,
            self.data_type
        )
    }
}

/// Socket metadata captured at `connect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnDataEvent {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub fd: u32,
    pub sa_data: [u8; SA_DATA_LEN],
    pub comm: [u8; TASK_COMM_LEN],
}

impl ConnDataEvent {
    /// Peer address from `sa_data`: big-endian port at offset 0, IPv4 octets at 2..6.
    pub fn addr(&self) -> SocketAddrV4 {
        let port = u16::from_be_bytes([self.sa_data[0], self.sa_data[1]]);
        let ip = Ipv4Addr::new(
            self.sa_data[2],
            self.sa_data[3],
            self.sa_data[4],
            self.sa_data[5],
        );
        SocketAddrV4::new(ip, port)
    }

    pub fn comm(&self) -> String {
        comm_to_string(&self.comm)
    }

    /// Connection identity: `{pid}_{tid}_{comm}_{fd}`. Direction-free so it
    /// groups with both halves of the connection.
    pub fn uuid(&self) -> String {
        format!("{}_{}_{}_{}", self.pid, self.tid, self.comm(), self.fd)
    }
}

/// A decoded probe record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SslData(SslDataEvent),
    ConnData(ConnDataEvent),
}

impl Event {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::SslData(_) => RecordKind::SslData,
            Self::ConnData(_) => RecordKind::ConnData,
        }
    }

    pub fn uuid(&self) -> String {
        match self {
            Self::SslData(e) => e.uuid(),
            Self::ConnData(e) => e.uuid(),
        }
    }

    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Self::SslData(e) => e.timestamp_ns,
            Self::ConnData(e) => e.timestamp_ns,
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            Self::SslData(e) => e.pid,
            Self::ConnData(e) => e.pid,
        }
    }

    pub fn tid(&self) -> u32 {
        match self {
            Self::SslData(e) => e.tid,
            Self::ConnData(e) => e.tid,
        }
    }

    pub fn fd(&self) -> u32 {
        match self {
            Self::SslData(e) => e.fd,
            Self::ConnData(e) => e.fd,
        }
    }

    /// Bytes fed to the protocol parser. Connect events carry their address literal.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Self::SslData(e) => e.data.clone(),
            Self::ConnData(e) => e.addr().to_string().into_bytes(),
        }
    }
}

/// Converts a fixed-width, NUL-padded `comm` into a trimmed string.
pub fn comm_to_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let trimmed = raw.get(..end).unwrap_or(&[]);
    String::from_utf8_lossy(trimmed).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comm(name: &str) -> [u8; TASK_COMM_LEN] {
        let mut out = [0u8; TASK_COMM_LEN];
        out[..name.len()].copy_from_slice(name.as_bytes());
        out
    }

    fn ssl_event(data_type: i64) -> SslDataEvent {
        SslDataEvent {
            data_type,
            timestamp_ns: 1,
            pid: 100,
            tid: 200,
            data: Vec::new(),
            data_len: 0,
            comm: comm("curl"),
            fd: 5,
            version: 0x0303,
        }
    }

    #[test]
    fn test_ssl_uuid_format() {
        assert_eq!(ssl_event(0).uuid(), "100_200_curl_5_0");
        assert_eq!(ssl_event(1).uuid(), "100_200_curl_5_1");
    }

    #[test]
    fn test_event_common_fields() {
        let event = Event::SslData(ssl_event(1));
        assert_eq!(event.kind(), RecordKind::SslData);
        assert_eq!(event.timestamp_ns(), 1);
        assert_eq!((event.pid(), event.tid(), event.fd()), (100, 200, 5));
    }

    #[test]
    fn test_conn_uuid_omits_direction() {
        let e = ConnDataEvent {
            timestamp_ns: 1,
            pid: 100,
            tid: 200,
            fd: 5,
            sa_data: [0u8; SA_DATA_LEN],
            comm: comm("curl"),
        };
        assert_eq!(e.uuid(), "100_200_curl_5");
    }

    #[test]
    fn test_conn_addr_mixed_endianness() {
        let mut sa_data = [0u8; SA_DATA_LEN];
        sa_data[..6].copy_from_slice(&[0x1F, 0x90, 127, 0, 0, 1]);
        let e = ConnDataEvent {
            timestamp_ns: 0,
            pid: 1,
            tid: 1,
            fd: 3,
            sa_data,
            comm: comm("wget"),
        };
        assert_eq!(e.addr(), SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8080));
        assert_eq!(Event::ConnData(e).payload(), b"127.0.0.1:8080".to_vec());
    }

    #[test]
    fn test_comm_trimmed_at_nul() {
        let mut raw = [0u8; TASK_COMM_LEN];
        raw[..4].copy_from_slice(b"nginx"[..4].as_ref());
        raw[5] = b'x';
        assert_eq!(comm_to_string(&raw), "ngin");
        assert_eq!(comm_to_string(&[b' '; TASK_COMM_LEN]), "");
        assert_eq!(comm_to_string(b"full-width-comm!"), "full-width-comm!");
    }

    #[test]
    fn test_tls_version_labels() {
        assert_eq!(TlsVersion::from_raw(0x0303).to_string(), "TLS1_2_VERSION");
        assert_eq!(TlsVersion::from_raw(0x0304).to_string(), "TLS1_3_VERSION");
        assert_eq!(TlsVersion::from_raw(0xFEFD).to_string(), "DTLS1_2_VERSION");
        assert_eq!(TlsVersion::from_raw(0x0002), TlsVersion::Ssl2);
    }

    #[test]
    fn test_tls_version_unknown_keeps_raw_value() {
        let v = TlsVersion::from_raw(0x0999);
        assert_eq!(v, TlsVersion::Unknown(0x0999));
        assert_eq!(v.to_string(), "TLS_VERSION_UNKNOWN_2457");
    }

    #[test]
    fn test_attach_type_from_raw() {
        assert_eq!(AttachType::from_raw(0), AttachType::Entry);
        assert_eq!(AttachType::from_raw(1), AttachType::Return);
        assert_eq!(AttachType::from_raw(7), AttachType::Unknown(7));
    }

    #[test]
    fn test_record_kind_roundtrip_labels() {
        for kind in RecordKind::all() {
            assert_eq!(RecordKind::from_u8(*kind as u8), Some(*kind));
        }
        assert_eq!(RecordKind::from_u8(9), None);
        assert_eq!(RecordKind::ConnData.to_string(), "conn_data");
    }
}
