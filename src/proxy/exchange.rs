//! The wire-level HTTP/1.1 exchange with a single upstream.
//!
//! One connection per exchange: serialize the outbound request, parse the
//! response head with [`httparse`], then frame the body by Content-Length,
//! chunked transfer coding, or connection close.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::http::{Headers, Method, Request, StatusCode};

use super::ProxyError;

/// Upper bound on a buffered upstream response (head plus body).
const MAX_RESPONSE_SIZE: usize = 256 * 1024 * 1024;

/// Maximum number of response headers we support.
const MAX_HEADERS: usize = 64;

/// A parsed upstream response, before hop-by-hop header stripping.
pub(super) struct UpstreamParts {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

/// Performs one request/response exchange against `authority`.
///
/// `headers` is the fully prepared outbound header set; framing headers
/// (`Content-Length`, `Connection`) are appended here and must not be
/// included by the caller.
pub(super) async fn send(
    authority: &str,
    req: &Request,
    headers: Headers,
) -> Result<UpstreamParts, ProxyError> {
    let mut stream = TcpStream::connect(authority)
        .await
        .map_err(|source| ProxyError::Connect {
            authority: authority.to_owned(),
            source,
        })?;

    let wire = serialize_request(req, &headers);
    stream
        .write_all(&wire)
        .await
        .map_err(|source| io(authority, source))?;

    let expect_body = *req.method() != Method::Head;
    read_response(&mut stream, authority, expect_body).await
}

fn serialize_request(req: &Request, headers: &Headers) -> BytesMut {
    let body = req.body();
    let mut buf = BytesMut::with_capacity(256 + headers.len() * 64 + body.len());
    buf.put(format!("{} {} HTTP/1.1\r\n", req.method(), req.target()).as_bytes());
    for (name, value) in headers.iter() {
        buf.put(format!("{name}: {value}\r\n").as_bytes());
    }
    buf.put(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    buf.put(&b"Connection: close\r\n\r\n"[..]);
    buf.put(&body[..]);
    buf
}

async fn read_response(
    stream: &mut TcpStream,
    authority: &str,
    expect_body: bool,
) -> Result<UpstreamParts, ProxyError> {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        let head = {
            let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Response::new(&mut storage);
            match parsed.parse(&buf) {
                Ok(httparse::Status::Complete(header_len)) => {
                    let code = parsed
                        .code
                        .ok_or_else(|| invalid(authority, "missing status code"))?;
                    let mut headers = Headers::with_capacity(parsed.headers.len());
                    for header in parsed.headers.iter() {
                        if let Ok(value) = std::str::from_utf8(header.value) {
                            headers.insert(header.name, value);
                        }
                    }
                    Some((StatusCode::from_u16(code), headers, header_len))
                }
                Ok(httparse::Status::Partial) => None,
                Err(err) => return Err(invalid(authority, err)),
            }
        };

        if let Some((status, headers, header_len)) = head {
            buf.advance(header_len);
            let body = if expect_body && !status_excludes_body(status) {
                read_body(stream, buf, &headers, authority).await?
            } else {
                Bytes::new()
            };
            return Ok(UpstreamParts {
                status,
                headers,
                body,
            });
        }

        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|source| io(authority, source))?;
        if n == 0 {
            return Err(invalid(authority, "connection closed before response head"));
        }
        if buf.len() > MAX_RESPONSE_SIZE {
            return Err(invalid(authority, "response head too large"));
        }
    }
}

fn status_excludes_body(status: StatusCode) -> bool {
    let code = status.as_u16();
    code < 200 || code == 204 || code == 304
}

async fn read_body(
    stream: &mut TcpStream,
    buf: BytesMut,
    headers: &Headers,
    authority: &str,
) -> Result<Bytes, ProxyError> {
    if let Some(encoding) = headers.get("transfer-encoding") {
        if encoding.to_ascii_lowercase().contains("chunked") {
            return read_chunked(stream, buf, authority).await;
        }
    }

    if let Some(length) = headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        if length > MAX_RESPONSE_SIZE {
            return Err(invalid(authority, "response body too large"));
        }
        let mut buf = buf;
        while buf.len() < length {
            let n = stream
                .read_buf(&mut buf)
                .await
                .map_err(|source| io(authority, source))?;
            if n == 0 {
                return Err(invalid(authority, "connection closed mid body"));
            }
        }
        buf.truncate(length);
        return Ok(buf.freeze());
    }

    // No framing headers: the body runs until the upstream closes.
    let mut buf = buf;
    loop {
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|source| io(authority, source))?;
        if n == 0 {
            return Ok(buf.freeze());
        }
        if buf.len() > MAX_RESPONSE_SIZE {
            return Err(invalid(authority, "response body too large"));
        }
    }
}

async fn read_chunked(
    stream: &mut TcpStream,
    mut buf: BytesMut,
    authority: &str,
) -> Result<Bytes, ProxyError> {
    let mut body = BytesMut::new();

    loop {
        let line_end = loop {
            if let Some(pos) = find_crlf(&buf) {
                break pos;
            }
            let n = stream
                .read_buf(&mut buf)
                .await
                .map_err(|source| io(authority, source))?;
            if n == 0 {
                return Err(invalid(authority, "connection closed mid chunk"));
            }
        };

        let size = {
            let line = std::str::from_utf8(&buf[..line_end])
                .map_err(|_| invalid(authority, "chunk size is not ascii"))?;
            let digits = line.split(';').next().unwrap_or("").trim();
            usize::from_str_radix(digits, 16)
                .map_err(|_| invalid(authority, "chunk size is not hex"))?
        };
        buf.advance(line_end + 2);

        if size == 0 {
            // Trailer section, if any, is discarded unread.
            return Ok(body.freeze());
        }
        if body.len() + size > MAX_RESPONSE_SIZE {
            return Err(invalid(authority, "response body too large"));
        }

        while buf.len() < size + 2 {
            let n = stream
                .read_buf(&mut buf)
                .await
                .map_err(|source| io(authority, source))?;
            if n == 0 {
                return Err(invalid(authority, "connection closed mid chunk"));
            }
        }
        body.extend_from_slice(&buf[..size]);
        // Chunk data is followed by its own CRLF.
        buf.advance(size + 2);
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn io(authority: &str, source: std::io::Error) -> ProxyError {
    ProxyError::Io {
        authority: authority.to_owned(),
        source,
    }
}

fn invalid(authority: &str, reason: impl ToString) -> ProxyError {
    ProxyError::InvalidResponse {
        authority: authority.to_owned(),
        reason: reason.to_string(),
    }
}
