//! Minimal HTTP/1.1 request parsing and response serialization.
//!
//! Every exchange is one request and one response on a fresh connection;
//! there is no keep-alive and no chunked transfer encoding.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const READ_CHUNK: usize = 1024;

/// A parsed request. The default value is the invalid request produced by
/// malformed input; it matches no route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method, e.g. `GET`
    pub method: String,
    /// Request target as sent, including any query string
    pub path: String,
    /// Header names lowercased, values trimmed
    pub headers: Vec<(String, String)>,
    /// Body decoded leniently as UTF-8, absent when empty
    pub body: Option<String>,
}

impl HttpRequest {
    /// Whether the request line parsed
    pub fn is_valid(&self) -> bool {
        !self.method.is_empty()
    }

    /// Path without the query string
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Case-insensitive lookup in a parsed header list
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Position of the `\r\n\r\n` that ends the head, if present
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

/// Keep reading into `buf` until it holds a complete head.
///
/// Returns the head length (excluding the terminator), or `None` if the peer
/// closed or `max_head` bytes arrived without a terminator.
pub async fn read_head<R>(reader: &mut R, buf: &mut BytesMut, max_head: usize) -> io::Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_head_end(buf) {
            return Ok(Some(end));
        }
        if buf.len() >= max_head {
            return Ok(None);
        }
        buf.reserve(READ_CHUNK);
        if reader.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

/// Split a head into its start line and lowercased headers.
///
/// Lines are decoded leniently. Returns `None` if a header line has no colon.
pub fn parse_head(head: &[u8]) -> Option<(String, Vec<(String, String)>)> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let start_line = lines.next()?.to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
    Some((start_line, headers))
}

fn parse_request_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() || !version.starts_with("HTTP/") || !target.starts_with('/') {
        return None;
    }
    Some((method.to_string(), target.to_string()))
}

/// `Content-Length` value; missing or unparseable means zero
pub fn content_length(headers: &[(String, String)]) -> usize {
    find_header(headers, "content-length")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

async fn read_body<R>(reader: &mut R, buf: &mut BytesMut, length: usize) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < length {
        buf.reserve((length - buf.len()).min(READ_CHUNK * 64));
        if reader.read_buf(buf).await? == 0 {
            break;
        }
    }
    buf.truncate(length);
    Ok(())
}

/// Read a full request.
///
/// `buf` holds whatever was already read from the connection. Malformed
/// input yields [`HttpRequest::default`].
pub async fn read_request<R>(
    reader: &mut R,
    mut buf: BytesMut,
    max_head: usize,
    max_body: usize,
) -> io::Result<HttpRequest>
where
    R: AsyncRead + Unpin,
{
    let head_end = match read_head(reader, &mut buf, max_head).await? {
        Some(end) => end,
        None => return Ok(HttpRequest::default()),
    };

    let head = buf.split_to(head_end);
    let _ = buf.split_to(HEAD_TERMINATOR.len());

    let Some((start_line, headers)) = parse_head(&head) else {
        return Ok(HttpRequest::default());
    };
    let Some((method, path)) = parse_request_line(&start_line) else {
        return Ok(HttpRequest::default());
    };

    let length = content_length(&headers);
    if length > max_body {
        tracing::debug!(length, max_body, "Request body too large");
        return Ok(HttpRequest::default());
    }
    read_body(reader, &mut buf, length).await?;

    let body = if buf.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&buf).into_owned())
    };

    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

/// A response; always carries permissive CORS headers and closes the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Content type header, when there is a body worth labelling
    pub content_type: Option<String>,
    /// Response body
    pub body: Bytes,
}

impl HttpResponse {
    /// Empty `200 OK`
    pub fn ok() -> Self {
        Self {
            status: 200,
            content_type: None,
            body: Bytes::new(),
        }
    }

    /// Empty `404 Not Found`
    pub fn not_found() -> Self {
        Self {
            status: 404,
            ..Self::ok()
        }
    }

    /// Empty `500 Internal Server Error`
    pub fn internal_error() -> Self {
        Self {
            status: 500,
            ..Self::ok()
        }
    }

    /// `200 OK` with a JSON body
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::with_body("application/json", body)
    }

    /// `200 OK` with the given content type and body
    pub fn with_body(content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            body: body.into(),
        }
    }

    /// Reason phrase for the status line
    pub fn reason(&self) -> &'static str {
        reason_phrase(self.status)
    }

    /// Serialize status line, headers and body
    pub fn to_bytes(&self) -> Bytes {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET, POST, OPTIONS, DELETE\r\n\
             Access-Control-Allow-Headers: Content-Type\r\n",
            self.status,
            self.reason()
        );
        if let Some(content_type) = &self.content_type {
            head.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.body.len()
        ));

        let mut out = BytesMut::with_capacity(head.len() + self.body.len());
        out.put_slice(head.as_bytes());
        out.put_slice(&self.body);
        out.freeze()
    }

    /// Write the response and flush
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Content type for a static file, by extension
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("js") | Some("mjs") => "text/javascript",
        Some("css") => "text/css",
        Some("json") | Some("map") => "application/json",
        Some("txt") => "text/plain",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Serialize a client request, used when forwarding to a running server
pub fn encode_request(method: &str, path: &str, host: &str, body: Option<&[u8]>) -> Bytes {
    let body = body.unwrap_or_default();
    let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", method, path, host);
    if !body.is_empty() {
        head.push_str("Content-Type: application/json\r\n");
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));

    let mut out = BytesMut::with_capacity(head.len() + body.len());
    out.put_slice(head.as_bytes());
    out.put_slice(body);
    out.freeze()
}

/// Read a response written by [`HttpResponse::write_to`].
///
/// Returns the status code and body, or `None` if the peer did not speak
/// HTTP.
pub async fn read_response<R>(reader: &mut R, max_head: usize) -> io::Result<Option<(u16, Bytes)>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let head_end = match read_head(reader, &mut buf, max_head).await? {
        Some(end) => end,
        None => return Ok(None),
    };
    let head = buf.split_to(head_end);
    let _ = buf.split_to(HEAD_TERMINATOR.len());

    let Some((status_line, headers)) = parse_head(&head) else {
        return Ok(None);
    };
    let mut parts = status_line.split_whitespace();
    let status = match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => match code.parse() {
            Ok(status) => status,
            Err(_) => return Ok(None),
        },
        _ => return Ok(None),
    };

    read_body(reader, &mut buf, content_length(&headers)).await?;
    Ok(Some((status, buf.freeze())))
}
