#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use ssltap::agent::Agent;
use ssltap::config::{Config, ProcessorConfig};
use ssltap::processor::{AddressResolver, DispatchError, EventProcessor, NoopResolver};
use ssltap::sink::hexdump::hex_dump;
use ssltap::sink::MemorySink;
use ssltap::tracer::event::{RecordKind, MAX_DATA_SIZE, SA_DATA_LEN, TASK_COMM_LEN};
use ssltap::tracer::parse::{decode, SSL_DATA_EVENT_SIZE};
use ssltap::tracer::replay::encode_frame;

const PID: u32 = 4242;
const TID: u32 = 4243;
const FD: u32 = 7;

fn comm(name: &str) -> [u8; TASK_COMM_LEN] {
    let mut c = [0u8; TASK_COMM_LEN];
    c[..name.len()].copy_from_slice(name.as_bytes());
    c
}

fn ssl_record(data_type: i64, fd: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SSL_DATA_EVENT_SIZE);
    buf.extend_from_slice(&data_type.to_le_bytes());
    buf.extend_from_slice(&1_000u64.to_le_bytes());
    buf.extend_from_slice(&PID.to_le_bytes());
    buf.extend_from_slice(&TID.to_le_bytes());
    let mut data = [0u8; MAX_DATA_SIZE];
    data[..payload.len()].copy_from_slice(payload);
    buf.extend_from_slice(&data);
    buf.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    buf.extend_from_slice(&comm("python3"));
    buf.extend_from_slice(&fd.to_le_bytes());
    buf.extend_from_slice(&0x0304i32.to_le_bytes());
    buf
}

fn conn_record(fd: u32, sa: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&500u64.to_le_bytes());
    buf.extend_from_slice(&PID.to_le_bytes());
    buf.extend_from_slice(&TID.to_le_bytes());
    buf.extend_from_slice(&fd.to_le_bytes());
    let mut sa_data = [0u8; SA_DATA_LEN];
    sa_data[..sa.len()].copy_from_slice(sa);
    buf.extend_from_slice(&sa_data);
    buf.extend_from_slice(&comm("python3"));
    buf
}

fn config(replay_path: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.source.replay_path = replay_path.to_path_buf();
    cfg.processor.tick_interval = Duration::from_millis(20);
    cfg.processor.shutdown_timeout = Duration::from_secs(5);
    cfg
}

const REQUEST: &[u8] =
    b"POST /v1/upload HTTP/1.1\r\nHost: api.example.com\r\nContent-Length: 12\r\n\r\nhello, world";

#[tokio::test]
async fn test_capture_replay_renders_reassembled_request() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.bin");

    let mut capture = encode_frame(
        RecordKind::ConnData,
        &conn_record(FD, &[0x01, 0xBB, 93, 184, 216, 34]),
    );
    // Request written in three fragments.
    let (a, rest) = REQUEST.split_at(10);
    let (b, c) = rest.split_at(40);
    for part in [a, b, c] {
        capture.extend(encode_frame(RecordKind::SslData, &ssl_record(1, FD, part)));
    }
    // Response on the read side: completed but never rendered.
    capture.extend(encode_frame(
        RecordKind::SslData,
        &ssl_record(0, FD, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"),
    ));
    // Truncated record: counted, skipped.
    capture.extend(encode_frame(RecordKind::SslData, &[0u8; 16]));
    std::fs::write(&path, &capture).unwrap();

    let sink = Arc::new(MemorySink::new());
    let mut agent = Agent::with_sink(config(&path), sink.clone()).unwrap();
    agent.start().await.unwrap();
    agent.wait_for_input_end().await;
    agent.stop().await.unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 1, "records: {records:?}");

    let (header, dump) = records[0].split_once('\n').unwrap();
    assert_eq!(
        header,
        format!(
            "UUID:{PID}_{TID}_python3_{FD}_1, Name:HTTPRequest, PID:{PID}, Comm:python3, \
             TID:{TID}, Version:TLS1_3_VERSION, Send {} bytes to 93.184.216.34:443, Payload:",
            REQUEST.len()
        )
    );
    assert_eq!(dump, hex_dump(REQUEST, "\t"));

    let health = agent.health();
    assert_eq!(health.events_received.get(), 5.0);
    assert_eq!(health.decode_errors.get(), 1.0);
    assert_eq!(health.messages_rendered.get(), 1.0);
    assert_eq!(
        health
            .messages_suppressed
            .with_label_values(&["http_response"])
            .get(),
        1.0
    );
    assert_eq!(health.workers_active.get(), 0.0);
    assert_eq!(agent.conn_table().len(), 1);
}

#[tokio::test]
async fn test_unresolved_peer_and_unknown_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.bin");

    let mut record = ssl_record(0, 9, b"GET /health HTTP/1.1\r\n\r\n");
    let version_offset = record.len() - 4;
    record[version_offset..].copy_from_slice(&0x0999i32.to_le_bytes());
    std::fs::write(&path, encode_frame(RecordKind::SslData, &record)).unwrap();

    let sink = Arc::new(MemorySink::new());
    let mut agent = Agent::with_sink(config(&path), sink.clone()).unwrap();
    agent.start().await.unwrap();
    agent.wait_for_input_end().await;
    agent.stop().await.unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].contains("Version:TLS_VERSION_UNKNOWN_2457"));
    assert!(records[0].contains("Received 24 bytes from [ADDR_NOT_FOUND]"));
}

#[tokio::test(start_paused = true)]
async fn test_processor_evicts_idle_connections_and_keeps_others() {
    let sink = Arc::new(MemorySink::new());
    let resolver: Arc<dyn AddressResolver> = Arc::new(NoopResolver);
    let processor = EventProcessor::new(
        ProcessorConfig {
            tick_interval: Duration::from_millis(100),
            max_idle_ticks: 2,
            queue_capacity: 4,
            shutdown_timeout: Duration::from_secs(1),
        },
        resolver,
        sink.clone(),
    );

    let idle = decode(RecordKind::SslData, &ssl_record(1, 1, b"GET /idle HTTP/1.1\r\n")).unwrap();
    let busy = |chunk: &[u8]| decode(RecordKind::SslData, &ssl_record(1, 2, chunk)).unwrap();
    let idle_uuid = idle.uuid();
    let busy_uuid = busy(b"").uuid();

    processor.route(idle).await.unwrap();
    processor.route(busy(b"GET /busy HTTP/1.1\r\n")).await.unwrap();

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        processor.route(busy(b"X-Ping: 1\r\n")).await.unwrap();
    }

    assert!(!processor.contains(&idle_uuid));
    assert!(processor.contains(&busy_uuid));

    processor.route(busy(b"\r\n")).await.unwrap();
    processor.shutdown(Duration::from_secs(1)).await.unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].starts_with(&format!("UUID:{busy_uuid}, Name:HTTPRequest")));
    assert_eq!(
        processor.route(busy(b"late")).await,
        Err(DispatchError::Closed)
    );
}
