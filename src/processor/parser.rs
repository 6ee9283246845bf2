//! Incremental protocol-boundary detection for one connection's byte stream.
//!
//! A [`Parser`] classifies the stream once enough leading bytes are buffered
//! to tell a request line or status line apart from anything else, then
//! accumulates fed bytes until the selected strategy reports that one complete
//! message is buffered. HTTP/1.x framing follows the header block's
//! `Transfer-Encoding` / `Content-Length`; opaque streams never complete by
//! content and are only reclaimed by the worker's idle timeout.

use std::fmt;

use httparse::Status;
use thiserror::Error;

/// Maximum number of headers parsed per HTTP message.
const MAX_HEADERS: usize = 64;

/// Upper bound on bytes buffered for a single message.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Methods recognized as the start of an HTTP/1.x request line.
const HTTP_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

const HTTP_RESPONSE_PREFIX: &[u8] = b"HTTP/1.";

/// Errors raised while accumulating a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{parser}: {reason}")]
    Internal {
        parser: ParserType,
        reason: String,
    },
}

/// Strategy selected for a stream on its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserType {
    HttpRequest,
    HttpResponse,
    Opaque,
}

impl ParserType {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HttpRequest => "http_request",
            Self::HttpResponse => "http_response",
            Self::Opaque => "opaque",
        }
    }

    /// Human-readable protocol name used in rendered output.
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::HttpRequest => "HTTPRequest",
            Self::HttpResponse => "HTTPResponse",
            Self::Opaque => "Unknown",
        }
    }

    /// Classify a stream from its first bytes. `None` while `prefix` could
    /// still grow into a request method or a status line.
    pub fn classify(prefix: &[u8]) -> Option<Self> {
        if HTTP_METHODS.iter().any(|m| prefix.starts_with(m)) {
            return Some(Self::HttpRequest);
        }
        if prefix.starts_with(HTTP_RESPONSE_PREFIX) {
            return Some(Self::HttpResponse);
        }

        let pending = HTTP_METHODS
            .iter()
            .chain(std::iter::once(&HTTP_RESPONSE_PREFIX))
            .any(|token| token.len() > prefix.len() && token.starts_with(prefix));

        (!pending).then_some(Self::Opaque)
    }
}

impl fmt::Display for ParserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed message, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub parser_type: ParserType,
    /// Request line or status line; empty for opaque streams.
    pub summary: String,
    /// Exactly the bytes of the message.
    pub bytes: Vec<u8>,
}

/// How the body following an HTTP header block is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(usize),
    Chunked,
    UntilClose,
}

/// Parsed HTTP head, cached once the header block is complete.
#[derive(Debug, Clone)]
struct Head {
    header_len: usize,
    framing: Framing,
    summary: String,
}

/// Incremental, restartable message accumulator.
#[derive(Debug, Default)]
pub struct Parser {
    /// Unset until the buffered prefix is long enough to classify.
    parser_type: Option<ParserType>,
    buf: Vec<u8>,
    head: Option<Head>,
    message_len: usize,
    done: bool,
}

impl Parser {
    /// Selected strategy. Reported as `Opaque` until the stream is classified.
    pub fn parser_type(&self) -> ParserType {
        self.parser_type.unwrap_or(ParserType::Opaque)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `data` and re-evaluate completion.
    ///
    /// Returns the number of bytes accepted. A completed parser accepts
    /// nothing until [`Parser::reset`] is called.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        if self.done {
            return Ok(0);
        }
        if self.buf.len() + data.len() > MAX_MESSAGE_SIZE {
            return Err(self.internal(format!(
                "message exceeds {MAX_MESSAGE_SIZE} bytes"
            )));
        }

        self.buf.extend_from_slice(data);

        if self.parser_type.is_none() {
            self.parser_type = ParserType::classify(&self.buf);
        }

        match self.parser_type {
            Some(ParserType::HttpRequest | ParserType::HttpResponse) => self.evaluate_http()?,
            // Opaque or unclassified streams complete only through the idle timeout.
            Some(ParserType::Opaque) | None => {}
        }

        Ok(data.len())
    }

    /// Snapshot of the completed message (or everything buffered, if not done).
    pub fn emit(&self) -> RenderedMessage {
        let end = if self.done {
            self.message_len
        } else {
            self.buf.len()
        };
        RenderedMessage {
            parser_type: self.parser_type(),
            summary: self
                .head
                .as_ref()
                .map(|h| h.summary.clone())
                .unwrap_or_default(),
            bytes: self.buf.get(..end).unwrap_or(&self.buf).to_vec(),
        }
    }

    /// Discard all buffered state, including bytes past the message end.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.head = None;
        self.message_len = 0;
        self.done = false;
    }

    fn internal(&self, reason: impl Into<String>) -> ParseError {
        ParseError::Internal {
            parser: self.parser_type(),
            reason: reason.into(),
        }
    }

    fn evaluate_http(&mut self) -> Result<(), ParseError> {
        if self.head.is_none() {
            let head = match self.parser_type {
                Some(ParserType::HttpRequest) => parse_request_head(&self.buf),
                _ => parse_response_head(&self.buf),
            }
            .map_err(|reason| self.internal(reason))?;

            match head {
                Some(head) => self.head = Some(head),
                None => return Ok(()),
            }
        }

        let Some(head) = &self.head else {
            return Ok(());
        };
        let body = self.buf.get(head.header_len..).unwrap_or(&[]);

        let body_len = match head.framing {
            Framing::Length(n) => (body.len() >= n).then_some(n),
            Framing::Chunked => chunked_body_len(body).map_err(|reason| self.internal(reason))?,
            Framing::UntilClose => None,
        };

        if let Some(body_len) = body_len {
            self.message_len = head.header_len + body_len;
            self.done = true;
        }

        Ok(())
    }
}

/// Parse a request head. `Ok(None)` means the header block is incomplete.
fn parse_request_head(buf: &[u8]) -> Result<Option<Head>, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let header_len = match req.parse(buf) {
        Ok(Status::Complete(n)) => n,
        Ok(Status::Partial) => return Ok(None),
        Err(e) => return Err(format!("invalid request head: {e}")),
    };

    let summary = format!(
        "{} {} HTTP/1.{}",
        req.method.unwrap_or_default(),
        req.path.unwrap_or_default(),
        req.version.unwrap_or(1)
    );

    // Requests without a declared length carry no body.
    let framing = declared_framing(req.headers)?.unwrap_or(Framing::Length(0));

    Ok(Some(Head {
        header_len,
        framing,
        summary,
    }))
}

/// Parse a response head. `Ok(None)` means the header block is incomplete.
fn parse_response_head(buf: &[u8]) -> Result<Option<Head>, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let header_len = match resp.parse(buf) {
        Ok(Status::Complete(n)) => n,
        Ok(Status::Partial) => return Ok(None),
        Err(e) => return Err(format!("invalid response head: {e}")),
    };

    let code = resp.code.unwrap_or(0);
    let summary = format!(
        "HTTP/1.{} {} {}",
        resp.version.unwrap_or(1),
        code,
        resp.reason.unwrap_or_default()
    )
    .trim_end()
    .to_string();

    let framing = if (100..200).contains(&code) || code == 204 || code == 304 {
        Framing::Length(0)
    } else {
        declared_framing(resp.headers)?.unwrap_or(Framing::UntilClose)
    };

    Ok(Some(Head {
        header_len,
        framing,
        summary,
    }))
}

/// Body framing declared by the headers. Chunked encoding wins over a length.
fn declared_framing(headers: &[httparse::Header<'_>]) -> Result<Option<Framing>, String> {
    let mut length = None;

    for header in headers.iter().filter(|h| !h.name.is_empty()) {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = String::from_utf8_lossy(header.value).to_ascii_lowercase();
            if value.contains("chunked") {
                return Ok(Some(Framing::Chunked));
            }
        } else if header.name.eq_ignore_ascii_case("content-length") {
            let value = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| {
                    format!(
                        "invalid content-length: {:?}",
                        String::from_utf8_lossy(header.value)
                    )
                })?;
            length = Some(Framing::Length(value));
        }
    }

    Ok(length)
}

/// Length of a complete chunked body, `Ok(None)` if more data is needed.
fn chunked_body_len(data: &[u8]) -> Result<Option<usize>, String> {
    let mut pos = 0;

    loop {
        let Some(line_end) = find_crlf(data, pos) else {
            return Ok(None);
        };

        let size_line = data.get(pos..line_end).unwrap_or(&[]);
        let size_str = std::str::from_utf8(size_line)
            .map_err(|_| "chunk size line is not UTF-8".to_string())?;
        // Chunk extensions follow a semicolon.
        let size_part = size_str.split(';').next().unwrap_or(size_str).trim();
        let chunk_size = usize::from_str_radix(size_part, 16)
            .map_err(|_| format!("invalid chunk size: {size_part:?}"))?;
        if chunk_size > MAX_MESSAGE_SIZE {
            return Err(format!(
                "chunk size {chunk_size} exceeds {MAX_MESSAGE_SIZE} bytes"
            ));
        }

        pos = line_end + 2;

        if chunk_size == 0 {
            // Trailer section ends with an empty line.
            loop {
                let Some(end) = find_crlf(data, pos) else {
                    return Ok(None);
                };
                let empty = end == pos;
                pos = end + 2;
                if empty {
                    return Ok(Some(pos));
                }
            }
        }

        // End of the chunk data including its trailing CRLF.
        let chunk_end = pos
            .checked_add(chunk_size)
            .and_then(|end| end.checked_add(2))
            .ok_or_else(|| "chunk size overflow".to_string())?;
        let Some(tail) = data.get(..chunk_end) else {
            return Ok(None);
        };
        if !tail.ends_with(b"\r\n") {
            return Err("chunk data not terminated by CRLF".to_string());
        }

        pos = chunk_end;
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    const POST: &[u8] =
        b"POST /api/v1/items HTTP/1.1\r\nHost: example.com\r\nContent-Length: 11\r\n\r\nhello world";

    fn feed_in_chunks(data: &[u8], parts: usize) -> Parser {
        let mut parser = Parser::default();
        let size = data.len().div_ceil(parts);
        for chunk in data.chunks(size) {
            parser.feed(chunk).unwrap();
        }
        parser
    }

    #[test]
    fn test_classify_strategies() {
        assert_eq!(ParserType::classify(b"GET / HTTP/1.1\r\n"), Some(ParserType::HttpRequest));
        assert_eq!(ParserType::classify(b"DELETE /x HTTP/1.1"), Some(ParserType::HttpRequest));
        assert_eq!(ParserType::classify(b"HTTP/1.1 200 OK\r\n"), Some(ParserType::HttpResponse));
        assert_eq!(ParserType::classify(b"\x16\x03\x01"), Some(ParserType::Opaque));
        assert_eq!(ParserType::classify(b"GETX / HTTP/1.1"), Some(ParserType::Opaque));
    }

    #[test]
    fn test_classify_waits_for_full_token() {
        assert_eq!(ParserType::classify(b""), None);
        assert_eq!(ParserType::classify(b"G"), None);
        assert_eq!(ParserType::classify(b"GE"), None);
        assert_eq!(ParserType::classify(b"GET"), None);
        assert_eq!(ParserType::classify(b"OPTIONS"), None);
        assert_eq!(ParserType::classify(b"HTTP/1"), None);
        assert_eq!(ParserType::classify(b"P"), None);
        assert_eq!(ParserType::classify(b"GEX"), Some(ParserType::Opaque));
    }

    #[test]
    fn test_unclassified_prefix_completes_after_more_bytes() {
        let mut parser = Parser::default();
        parser.feed(b"GE").unwrap();
        assert_eq!(parser.parser_type(), ParserType::Opaque);
        assert!(!parser.is_done());

        parser.feed(b"T /x HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert!(parser.is_done());
        let msg = parser.emit();
        assert_eq!(msg.parser_type, ParserType::HttpRequest);
        assert_eq!(msg.summary, "GET /x HTTP/1.1");
    }

    #[test]
    fn test_request_with_content_length_completes_once() {
        let mut parser = Parser::default();
        let (head, body) = POST.split_at(POST.len() - 11);

        assert_eq!(parser.feed(head).unwrap(), head.len());
        assert!(!parser.is_done());

        parser.feed(&body[..5]).unwrap();
        assert!(!parser.is_done());

        parser.feed(&body[5..]).unwrap();
        assert!(parser.is_done());

        // A completed parser accepts nothing further.
        assert_eq!(parser.feed(b"more").unwrap(), 0);

        let msg = parser.emit();
        assert_eq!(msg.parser_type, ParserType::HttpRequest);
        assert_eq!(msg.summary, "POST /api/v1/items HTTP/1.1");
        assert_eq!(msg.bytes, POST);
    }

    #[test]
    fn test_split_invariance() {
        let whole = feed_in_chunks(POST, 1);
        let two = feed_in_chunks(POST, 2);
        let five = feed_in_chunks(POST, 5);

        assert!(whole.is_done() && two.is_done() && five.is_done());
        assert_eq!(whole.emit(), two.emit());
        assert_eq!(whole.emit(), five.emit());
    }

    #[test]
    fn test_split_at_every_offset() {
        let expected = feed_in_chunks(POST, 1).emit();

        for at in 1..POST.len() {
            let (a, b) = POST.split_at(at);
            let mut parser = Parser::default();
            parser.feed(a).unwrap();
            parser.feed(b).unwrap();
            assert!(parser.is_done(), "split at {at}");
            assert_eq!(parser.emit(), expected, "split at {at}");
        }

        let bytewise = feed_in_chunks(POST, POST.len());
        assert_eq!(bytewise.emit(), expected);
    }

    #[test]
    fn test_request_without_body() {
        let mut parser = Parser::default();
        parser.feed(b"GET /index.html HTTP/1.0\r\nHost: a\r\n").unwrap();
        assert!(!parser.is_done());
        parser.feed(b"\r\n").unwrap();
        assert!(parser.is_done());
        assert_eq!(parser.emit().summary, "GET /index.html HTTP/1.0");
    }

    #[test]
    fn test_pipelined_bytes_excluded_and_discarded_on_reset() {
        let data = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let mut parser = Parser::default();
        parser.feed(data).unwrap();
        assert!(parser.is_done());
        assert_eq!(parser.emit().bytes, b"GET /a HTTP/1.1\r\n\r\n");

        parser.reset();
        assert!(!parser.is_done());
        assert_eq!(parser.buffered(), 0);
        assert_eq!(parser.emit().summary, "");
    }

    #[test]
    fn test_chunked_request() {
        let data = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n";
        let mut parser = Parser::default();
        parser.feed(&data[..data.len() - 3]).unwrap();
        assert!(!parser.is_done());
        parser.feed(&data[data.len() - 3..]).unwrap();
        assert!(parser.is_done());
        assert_eq!(parser.emit().bytes, data);
    }

    #[test]
    fn test_chunked_with_trailers() {
        let data =
            b"POST /t HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\n0\r\nX-Sum: 1\r\n\r\n";
        let mut parser = Parser::default();
        parser.feed(data).unwrap();
        assert!(parser.is_done());
        assert_eq!(parser.emit().bytes.len(), data.len());
    }

    #[test]
    fn test_malformed_chunk_size_is_internal_error() {
        let data = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        let mut parser = Parser::default();
        let err = parser.feed(data).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Internal {
                parser: ParserType::HttpRequest,
                ..
            }
        ));
    }

    #[test]
    fn test_huge_chunk_size_is_internal_error() {
        let data = format!(
            "POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\nabc",
            usize::MAX - 19
        );
        let mut parser = Parser::default();
        let err = parser.feed(data.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("chunk size"), "{err}");

        // The parser is reusable after a reset.
        parser.reset();
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_invalid_header_is_internal_error() {
        let data = b"GET / HTTP/1.1\r\nBad Header\r\n\r\n";
        let mut parser = Parser::default();
        assert!(parser.feed(data).is_err());
    }

    #[test]
    fn test_invalid_content_length_is_internal_error() {
        let data = b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n";
        let mut parser = Parser::default();
        let err = parser.feed(data).unwrap_err();
        assert!(err.to_string().starts_with("http_request: invalid content-length"));
    }

    #[test]
    fn test_response_with_length() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let mut parser = Parser::default();
        parser.feed(data).unwrap();
        assert!(parser.is_done());
        let msg = parser.emit();
        assert_eq!(msg.parser_type, ParserType::HttpResponse);
        assert_eq!(msg.summary, "HTTP/1.1 200 OK");
    }

    #[test]
    fn test_response_no_content_status() {
        let data = b"HTTP/1.1 204 No Content\r\nServer: x\r\n\r\n";
        let mut parser = Parser::default();
        parser.feed(data).unwrap();
        assert!(parser.is_done());
    }

    #[test]
    fn test_response_until_close_never_completes() {
        let data = b"HTTP/1.0 200 OK\r\nServer: x\r\n\r\nstreaming body";
        let mut parser = Parser::default();
        parser.feed(data).unwrap();
        parser.feed(b" and more").unwrap();
        assert!(!parser.is_done());
    }

    #[test]
    fn test_opaque_never_completes() {
        let mut parser = Parser::default();
        parser.feed(b"\x00\x01binary").unwrap();
        parser.feed(b"more").unwrap();
        assert_eq!(parser.parser_type(), ParserType::Opaque);
        assert!(!parser.is_done());
        assert_eq!(parser.emit().bytes, b"\x00\x01binarymore");
    }

    #[test]
    fn test_message_size_limit() {
        let mut parser = Parser::default();
        parser.feed(&vec![0u8; MAX_MESSAGE_SIZE]).unwrap();
        assert!(parser.feed(b"x").is_err());
    }
}
