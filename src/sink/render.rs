use crate::processor::parser::RenderedMessage;
use crate::processor::{AddressResolver, MessageMeta};
use crate::tracer::event::AttachType;

use super::hexdump::hex_dump;

pub const COLOR_RESET: &str = "\x1b[0m";
pub const COLOR_RED: &str = "\x1b[31m";
pub const COLOR_GREEN: &str = "\x1b[32m";
pub const COLOR_YELLOW: &str = "\x1b[33m";
pub const COLOR_PURPLE: &str = "\x1b[35m";

/// Shown when the resolver has no address for the connection.
pub const ADDR_NOT_FOUND: &str = "[ADDR_NOT_FOUND]";

/// Wraps `text` in `color` when coloring is enabled.
fn paint(enabled: bool, color: &str, text: &str) -> String {
    if enabled {
        format!("{color}{text}{COLOR_RESET}")
    } else {
        text.to_string()
    }
}

/// Format one completed message as a text record:
///
/// ```text
/// UUID:<uuid>, Name:<protocol>, PID:<pid>, Comm:<comm>, TID:<tid>, Version:<tls>, <direction>, Payload:
/// <hex dump>
/// ```
pub fn render(
    uuid: &str,
    meta: &MessageMeta,
    msg: &RenderedMessage,
    resolver: &dyn AddressResolver,
    color: bool,
) -> String {
    let addr = resolver
        .lookup(meta.pid, meta.fd)
        .map(|a| a.to_string())
        .unwrap_or_else(|| ADDR_NOT_FOUND.to_string());
    let len = msg.bytes.len();

    let (conn_info, prefix) = match meta.attach_type {
        AttachType::Entry => (
            format!(
                "{} {}",
                paint(color, COLOR_GREEN, &format!("Received {len} bytes from")),
                paint(color, COLOR_YELLOW, &addr)
            ),
            if color { COLOR_GREEN } else { "" },
        ),
        AttachType::Return => (
            format!(
                "{} {}",
                paint(color, COLOR_PURPLE, &format!("Send {len} bytes to")),
                paint(color, COLOR_YELLOW, &addr)
            ),
            if color { "\x1b[35m\t" } else { "\t" },
        ),
        AttachType::Unknown(raw) => (paint(color, COLOR_RED, &format!("UNKNOWN_{raw}")), ""),
    };

    let mut dump = hex_dump(&msg.bytes, prefix);
    if color {
        dump.push_str(COLOR_RESET);
    }

    format!(
        "UUID:{uuid}, Name:{}, PID:{}, Comm:{}, TID:{}, Version:{}, {conn_info}, Payload:\n{dump}",
        msg.parser_type.display_name(),
        meta.pid,
        meta.comm,
        meta.tid,
        meta.tls_version,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::processor::parser::ParserType;
    use crate::processor::NoopResolver;
    use crate::tracer::event::TlsVersion;

    struct Fixed;

    impl AddressResolver for Fixed {
        fn lookup(&self, pid: u32, fd: u32) -> Option<SocketAddrV4> {
            (pid == 100 && fd == 5).then(|| SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443))
        }
    }

    fn meta(attach_type: AttachType, tls_version: TlsVersion) -> MessageMeta {
        MessageMeta {
            pid: 100,
            tid: 200,
            fd: 5,
            comm: "curl".to_string(),
            attach_type,
            tls_version,
        }
    }

    fn msg(bytes: &[u8]) -> RenderedMessage {
        RenderedMessage {
            parser_type: ParserType::HttpRequest,
            summary: "GET / HTTP/1.1".to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_render_received_plain() {
        let out = render(
            "100_200_curl_5_0",
            &meta(AttachType::Entry, TlsVersion::Tls1_2),
            &msg(b"GET / HTTP/1.1\r\n\r\n"),
            &Fixed,
            false,
        );

        let (header, dump) = out.split_once('\n').unwrap();
        assert_eq!(
            header,
            "UUID:100_200_curl_5_0, Name:HTTPRequest, PID:100, Comm:curl, TID:200, \
             Version:TLS1_2_VERSION, Received 18 bytes from 93.184.216.34:443, Payload:"
        );
        assert_eq!(dump, hex_dump(b"GET / HTTP/1.1\r\n\r\n", ""));
        assert!(!out.contains('\x1b'));
    }

    #[test]
    fn test_render_sent_unresolved() {
        let out = render(
            "100_200_curl_9_1",
            &MessageMeta {
                fd: 9,
                ..meta(AttachType::Return, TlsVersion::Unknown(0x7f))
            },
            &msg(b"GET /"),
            &NoopResolver,
            false,
        );

        assert!(out.contains("Version:TLS_VERSION_UNKNOWN_127"));
        assert!(out.contains("Send 5 bytes to [ADDR_NOT_FOUND], Payload:\n\t00000000"));
    }

    #[test]
    fn test_render_unknown_direction() {
        let out = render(
            "u",
            &meta(AttachType::Unknown(7), TlsVersion::Tls1_3),
            &msg(b"x"),
            &Fixed,
            false,
        );
        assert!(out.contains("Version:TLS1_3_VERSION, UNKNOWN_7, Payload:\n00000000"));
    }

    #[test]
    fn test_render_colored() {
        let out = render(
            "u",
            &meta(AttachType::Entry, TlsVersion::Tls1_3),
            &msg(b"GET /"),
            &Fixed,
            true,
        );
        assert!(out.contains("\x1b[32mReceived 5 bytes from\x1b[0m \x1b[33m93.184.216.34:443\x1b[0m"));
        assert!(out.contains("Payload:\n\x1b[32m00000000"));
        assert!(out.ends_with(COLOR_RESET));
    }
}
