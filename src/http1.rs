//! HTTP/1.1 fallback used when ALPN does not select `h2`. One exchange at a
//! time per connection, keep-alive between them.

use crate::error::{Error, Result};
use crate::response::Response;
use crate::socket::BoxedTransport;
use crate::types::{Headers, Protocol};
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Responses without content-length or chunking are read to EOF, capped here.
const MAX_UNFRAMED_BODY: usize = 64 * 1024 * 1024;
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// A serial HTTP/1.1 connection over the shared transport abstraction.
pub struct Http1Connection {
    io: Mutex<Option<BoxedTransport>>,
    created_at: Instant,
    last_used: std::sync::Mutex<Instant>,
}

impl Http1Connection {
    #[must_use]
    pub fn new(transport: BoxedTransport) -> Self {
        Self {
            io: Mutex::new(Some(transport)),
            created_at: Instant::now(),
            last_used: std::sync::Mutex::new(Instant::now()),
        }
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_used.lock().expect("last_used lock").elapsed()
    }

    /// The transport is taken out of the slot on a fatal exchange error, so a
    /// closed connection is one with an empty slot.
    pub fn is_closed(&self) -> bool {
        match self.io.try_lock() {
            Ok(slot) => slot.is_none(),
            // an exchange is running right now
            Err(_) => false,
        }
    }

    /// Run one request/response exchange. `headers` is the h2-shaped list;
    /// pseudo-headers are folded into the request line and Host.
    pub async fn send_request(&self, headers: &Headers, body: &Bytes) -> Result<Response> {
        let mut slot = self.io.lock().await;
        let io = slot.as_mut().ok_or(Error::ConnectionClosed)?;

        let wire = serialize_request(headers, body)?;
        let head_request = header_value(headers, ":method") == Some("HEAD");
        trace!("h1 request: {} bytes", wire.len());
        let outcome = async {
            io.write_all(&wire).await?;
            io.flush().await?;
            read_response(io, head_request).await
        }
        .await;

        *self.last_used.lock().expect("last_used lock") = Instant::now();
        match outcome {
            Ok((response, keep_alive)) => {
                if !keep_alive {
                    debug!("peer asked to close the h1 connection");
                    *slot = None;
                }
                Ok(response)
            }
            Err(err) => {
                // a half-read exchange poisons the connection
                *slot = None;
                Err(err)
            }
        }
    }
}

fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn serialize_request(headers: &Headers, body: &Bytes) -> Result<BytesMut> {
    let method = header_value(headers, ":method")
        .ok_or_else(|| Error::InvalidRequest("missing :method".to_owned()))?;
    let path = header_value(headers, ":path")
        .ok_or_else(|| Error::InvalidRequest("missing :path".to_owned()))?;
    let authority = header_value(headers, ":authority")
        .ok_or_else(|| Error::InvalidRequest("missing :authority".to_owned()))?;

    let mut wire = BytesMut::with_capacity(256 + body.len());
    wire.extend_from_slice(format!("{method} {path} HTTP/1.1\r\n").as_bytes());
    wire.extend_from_slice(format!("host: {authority}\r\n").as_bytes());
    for (name, value) in headers {
        if name.starts_with(':') || name == "host" || name == "content-length" {
            continue;
        }
        wire.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !body.is_empty() || matches!(method, "POST" | "PUT" | "PATCH") {
        wire.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    wire.extend_from_slice(b"\r\n");
    wire.extend_from_slice(body);
    Ok(wire)
}

/// Read a full response. The bool is whether the connection may be reused.
/// `head_request` suppresses the body even when content-length says there
/// would be one.
async fn read_response(io: &mut BoxedTransport, head_request: bool) -> Result<(Response, bool)> {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    // read until the end of the header section
    let header_end = loop {
        if let Some(pos) = find_double_crlf(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::InvalidResponse("header section too large".to_owned()));
        }
        let n = io.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
    };

    let header_bytes = buf.split_to(header_end + 4);
    let header_text = std::str::from_utf8(&header_bytes)
        .map_err(|_| Error::InvalidResponse("non-utf8 response head".to_owned()))?;
    let mut lines = header_text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| Error::InvalidResponse("empty response head".to_owned()))?;
    let status = parse_status_line(status_line)?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidResponse(format!("malformed header line {line:?}")))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    let keep_alive = headers
        .get("connection")
        .map_or(true, |v| !v.eq_ignore_ascii_case("close"));

    let body = if head_request || status == 204 || status == 304 || (100..200).contains(&status) {
        Bytes::new()
    } else if headers
        .get("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        read_chunked_body(io, &mut buf).await?
    } else if let Some(length) = headers.get("content-length") {
        let length: usize = length
            .parse()
            .map_err(|_| Error::InvalidResponse("malformed content-length".to_owned()))?;
        while buf.len() < length {
            let n = io.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
        buf.split_to(length).freeze()
    } else {
        // no framing: body runs to EOF and the connection dies with it
        loop {
            if buf.len() > MAX_UNFRAMED_BODY {
                return Err(Error::InvalidResponse("unframed body too large".to_owned()));
            }
            let n = io.read_buf(&mut buf).await?;
            if n == 0 {
                break;
            }
        }
        return Ok((
            Response {
                status,
                headers,
                body: buf.freeze(),
                protocol: Protocol::Http11,
            },
            false,
        ));
    };

    Ok((
        Response {
            status,
            headers,
            body,
            protocol: Protocol::Http11,
        },
        keep_alive,
    ))
}

fn parse_status_line(line: &str) -> Result<u16> {
    // "HTTP/1.1 200 OK"
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(Error::InvalidResponse(format!(
            "unexpected version {version:?}"
        )));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..600).contains(code))
        .ok_or_else(|| Error::InvalidResponse(format!("malformed status line {line:?}")))
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

async fn read_chunked_body(io: &mut BoxedTransport, buf: &mut BytesMut) -> Result<Bytes> {
    let mut body = BytesMut::new();
    loop {
        // chunk size line
        let line_end = loop {
            if let Some(pos) = buf.windows(2).position(|window| window == b"\r\n") {
                break pos;
            }
            let n = io.read_buf(buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        };
        let size_line = buf.split_to(line_end + 2);
        let size_text = std::str::from_utf8(&size_line[..line_end])
            .map_err(|_| Error::InvalidResponse("non-utf8 chunk size".to_owned()))?;
        let size_text = size_text.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| Error::InvalidResponse(format!("malformed chunk size {size_text:?}")))?;

        if body.len() + size > MAX_UNFRAMED_BODY {
            return Err(Error::InvalidResponse("chunked body too large".to_owned()));
        }

        // chunk data plus its trailing CRLF
        while buf.len() < size + 2 {
            let n = io.read_buf(buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
        body.extend_from_slice(&buf.split_to(size));
        consume_crlf(buf)?;

        if size == 0 {
            return Ok(body.freeze());
        }
    }
}

fn consume_crlf(buf: &mut BytesMut) -> Result<()> {
    if buf.len() < 2 || &buf[..2] != b"\r\n" {
        return Err(Error::InvalidResponse(
            "chunk not terminated by CRLF".to_owned(),
        ));
    }
    let _ = buf.split_to(2);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::InMemory;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

    fn get_request() -> Headers {
        vec![
            (":method".to_owned(), "GET".to_owned()),
            (":scheme".to_owned(), "http".to_owned()),
            (":path".to_owned(), "/".to_owned()),
            (":authority".to_owned(), "example.com".to_owned()),
        ]
    }

    async fn script_server(mut io: DuplexStream, response: &'static [u8]) {
        let mut buf = Vec::new();
        loop {
            let mut chunk = [0u8; 1024];
            let n = io.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|window| window == b"\r\n\r\n") {
                break;
            }
        }
        io.write_all(response).await.unwrap();
    }

    #[tokio::test]
    async fn content_length_body() {
        let (client_io, server_io) = InMemory::pair(None, 16 * 1024);
        let server = tokio::spawn(script_server(
            server_io,
            b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n\r\nhello",
        ));
        let conn = Http1Connection::new(Box::new(client_io));
        let response = conn.send_request(&get_request(), &Bytes::new()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"hello"));
        assert_eq!(response.protocol, Protocol::Http11);
        assert!(!conn.is_closed(), "keep-alive by default");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn chunked_body() {
        let (client_io, server_io) = InMemory::pair(None, 16 * 1024);
        let server = tokio::spawn(script_server(
            server_io,
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        ));
        let conn = Http1Connection::new(Box::new(client_io));
        let response = conn.send_request(&get_request(), &Bytes::new()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"hello world"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connection_close_marks_unusable() {
        let (client_io, server_io) = InMemory::pair(None, 16 * 1024);
        let server = tokio::spawn(script_server(
            server_io,
            b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 2\r\n\r\nok",
        ));
        let conn = Http1Connection::new(Box::new(client_io));
        let response = conn.send_request(&get_request(), &Bytes::new()).await.unwrap();
        assert_eq!(response.body, Bytes::from_static(b"ok"));
        assert!(conn.is_closed());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let (client_io, server_io) = InMemory::pair(None, 16 * 1024);
        let server = tokio::spawn(script_server(
            server_io,
            b"HTTP/1.1 200 OK\r\ncontent-length: 1234\r\n\r\n",
        ));
        let conn = Http1Connection::new(Box::new(client_io));
        let mut headers = get_request();
        headers[0].1 = "HEAD".to_owned();
        let response = conn.send_request(&headers, &Bytes::new()).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.is_empty());
        assert_eq!(response.header("content-length"), Some("1234"));
        server.await.unwrap();
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK").unwrap(), 200);
        assert_eq!(parse_status_line("HTTP/1.0 404 Not Found").unwrap(), 404);
        assert!(parse_status_line("SPDY/3 200 OK").is_err());
        assert!(parse_status_line("HTTP/1.1 abc").is_err());
        assert!(parse_status_line("HTTP/1.1 999 weird").is_err());
    }

    #[test]
    fn request_serialization() {
        let headers: Headers = vec![
            (":method".to_owned(), "POST".to_owned()),
            (":scheme".to_owned(), "https".to_owned()),
            (":path".to_owned(), "/v1/x".to_owned()),
            (":authority".to_owned(), "api.example.com".to_owned()),
            ("content-type".to_owned(), "application/json".to_owned()),
        ];
        let wire = serialize_request(&headers, &Bytes::from_static(b"abc")).unwrap();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("POST /v1/x HTTP/1.1\r\n"));
        assert!(text.contains("host: api.example.com\r\n"));
        assert!(text.contains("content-type: application/json\r\n"));
        assert!(text.contains("content-length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
        assert!(!text.contains(":scheme"));
    }

    #[test]
    fn get_without_body_has_no_content_length() {
        let headers: Headers = vec![
            (":method".to_owned(), "GET".to_owned()),
            (":scheme".to_owned(), "https".to_owned()),
            (":path".to_owned(), "/".to_owned()),
            (":authority".to_owned(), "example.com".to_owned()),
        ];
        let wire = serialize_request(&headers, &Bytes::new()).unwrap();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(!text.contains("content-length"));
    }
}
