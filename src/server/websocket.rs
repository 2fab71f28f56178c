//! RFC 6455 opening handshake and frame codec.
//!
//! Server frames are unmasked single-frame text messages. Inbound frames are
//! decoded and unmasked but otherwise ignored; the read side only exists to
//! notice when a viewer goes away.

use crate::server::http::{find_header, parse_head};
use crate::{Result, VizError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use sha1::{Digest, Sha1};
use std::io;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

/// GUID appended to the client key when computing the accept token
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const FIN: u8 = 0x80;
const MASK: u8 = 0x80;

/// Whether an initial chunk is a `GET /` carrying `Upgrade: websocket`
pub fn is_upgrade_request(chunk: &[u8]) -> bool {
    if !chunk.starts_with(b"GET / HTTP/1.1") {
        return false;
    }
    String::from_utf8_lossy(chunk)
        .split("\r\n")
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
}

/// base64(SHA-1(key + GUID))
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Accept token for an upgrade request head
pub fn accept_key_for_head(head: &[u8]) -> Result<String> {
    let (_, headers) = parse_head(head)
        .ok_or_else(|| VizError::Protocol("Malformed handshake head".to_string()))?;
    let key = find_header(&headers, "sec-websocket-key")
        .filter(|key| !key.is_empty())
        .ok_or_else(|| VizError::Protocol("No Sec-WebSocket-Key header in handshake".to_string()))?;
    Ok(accept_key(key))
}

/// `101 Switching Protocols` response for the given accept token
pub fn handshake_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept
    )
}

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation of a fragmented message
    Continuation,
    /// UTF-8 text
    Text,
    /// Binary data
    Binary,
    /// Connection close
    Close,
    /// Ping
    Ping,
    /// Pong
    Pong,
    /// Reserved opcode
    Reserved(u8),
}

impl Opcode {
    /// Decode the low nibble of the first header byte
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0f {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xa => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    /// Wire value
    pub fn as_u8(&self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xa,
            Opcode::Reserved(other) => *other & 0x0f,
        }
    }
}

/// One decoded frame, payload already unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// Frame type
    pub opcode: Opcode,
    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Final text frame
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    /// Empty close frame
    pub fn close() -> Self {
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload: Bytes::new(),
        }
    }
}

/// Codec for server-side frames: decodes masked or unmasked frames, encodes
/// unmasked ones.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    /// Codec rejecting inbound payloads larger than `max_payload`
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if src.len() < 2 {
            return Ok(None);
        }
        let first = src[0];
        let second = src[1];
        let masked = second & MASK != 0;

        let (length, length_bytes) = match second & 0x7f {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 2)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 8)
            }
            short => (u64::from(short), 0),
        };

        let length = usize::try_from(length)
            .ok()
            .filter(|length| *length <= self.max_payload)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame payload of {} bytes exceeds limit", length),
                )
            })?;

        let header_len = 2 + length_bytes + if masked { 4 } else { 0 };
        if src.len() < header_len + length {
            src.reserve(header_len + length - src.len());
            return Ok(None);
        }

        src.advance(2 + length_bytes);
        let mask_key = if masked {
            let key = [src[0], src[1], src[2], src[3]];
            src.advance(4);
            Some(key)
        } else {
            None
        };

        let mut payload = src.split_to(length);
        if let Some(key) = mask_key {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        Ok(Some(Frame {
            fin: first & FIN != 0,
            opcode: Opcode::from_u8(first),
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        let length = frame.payload.len();
        dst.reserve(length + 10);

        let fin = if frame.fin { FIN } else { 0 };
        dst.put_u8(fin | frame.opcode.as_u8());
        if length <= 125 {
            dst.put_u8(length as u8);
        } else if length <= usize::from(u16::MAX) {
            dst.put_u8(126);
            dst.put_u16(length as u16);
        } else {
            dst.put_u8(127);
            dst.put_u64(length as u64);
        }
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Encode one unmasked final text frame
pub fn encode_text(payload: &str) -> Bytes {
    encode_frame(Frame::text(Bytes::copy_from_slice(payload.as_bytes())))
}

/// Encode an unmasked frame
pub fn encode_frame(frame: Frame) -> Bytes {
    let mut buf = BytesMut::new();
    // Encoding into a BytesMut cannot fail
    let _ = FrameCodec::default().encode(frame, &mut buf);
    buf.freeze()
}

/// Next data frame from a viewer.
///
/// A close frame, end of stream, decode error or `idle` elapsing all end the
/// stream with `None`.
pub async fn next_frame<R>(frames: &mut FramedRead<R, FrameCodec>, idle: Duration) -> Option<Frame>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(idle, frames.next()).await {
        Ok(Some(Ok(frame))) if frame.opcode == Opcode::Close => None,
        Ok(Some(Ok(frame))) => Some(frame),
        Ok(Some(Err(e))) => {
            tracing::debug!(error = %e, "Dropping viewer after bad frame");
            None
        }
        Ok(None) => None,
        Err(_) => {
            tracing::debug!(idle_secs = idle.as_secs(), "Viewer read timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn masked(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_u8(FIN | opcode.as_u8());
        let len = payload.len();
        if len <= 125 {
            out.put_u8(MASK | len as u8);
        } else if len <= 65535 {
            out.put_u8(MASK | 126);
            out.put_u16(len as u16);
        } else {
            out.put_u8(MASK | 127);
            out.put_u64(len as u64);
        }
        out.put_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    #[test]
    fn test_rfc_accept_key() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_accept_key_from_head() {
        let head = b"GET / HTTP/1.1\r\nHost: x\r\nupgrade: websocket\r\nsec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==";
        assert_eq!(accept_key_for_head(head).unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");

        let missing = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket";
        assert!(matches!(accept_key_for_head(missing), Err(VizError::Protocol(_))));
    }

    #[test]
    fn test_handshake_response() {
        let response = handshake_response("abc=");
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: abc=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_upgrade_detection() {
        assert!(is_upgrade_request(b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\r\n"));
        assert!(is_upgrade_request(b"GET / HTTP/1.1\r\nupgrade:WebSocket\r\n"));
        assert!(!is_upgrade_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert!(!is_upgrade_request(b"GET /api/entries HTTP/1.1\r\nUpgrade: websocket\r\n\r\n"));
        assert!(!is_upgrade_request(b"POST / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n"));
    }

    #[test]
    fn test_text_frame_lengths_survive_codec() {
        let mut codec = FrameCodec::default();
        for len in [0usize, 125, 126, 65535, 65536] {
            let payload: String = "x".repeat(len);

            let mut server_frame = BytesMut::from(&encode_text(&payload)[..]);
            let decoded = codec.decode(&mut server_frame).unwrap().unwrap();
            assert_eq!(decoded.payload.len(), len);
            assert_eq!(&decoded.payload[..], payload.as_bytes());
            assert!(server_frame.is_empty());

            let mut client_frame = masked(Opcode::Text, payload.as_bytes(), [1, 2, 3, 4]);
            let decoded = codec.decode(&mut client_frame).unwrap().unwrap();
            assert!(decoded.fin);
            assert_eq!(decoded.opcode, Opcode::Text);
            assert_eq!(&decoded.payload[..], payload.as_bytes());
        }
    }

    #[test]
    fn test_server_frame_header_layout() {
        assert_eq!(&encode_text("hi")[..], &[0x81, 0x02, b'h', b'i']);

        let medium = encode_text(&"a".repeat(126));
        assert_eq!(&medium[..4], &[0x81, 126, 0x00, 126]);

        let large = encode_text(&"a".repeat(65536));
        assert_eq!(&large[..10], &[0x81, 127, 0, 0, 0, 0, 0, 1, 0, 0]);

        assert_eq!(&encode_frame(Frame::close())[..], &[0x88, 0x00]);
    }

    #[test]
    fn test_partial_frames_wait_for_more() {
        let mut codec = FrameCodec::default();
        let full = masked(Opcode::Text, b"hello", [9, 8, 7, 6]);

        let mut partial = BytesMut::from(&full[..1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(&codec.decode(&mut partial).unwrap().unwrap().payload[..], b"hello");
    }

    #[test]
    fn test_oversized_frame_is_an_error() {
        let mut codec = FrameCodec::new(4);
        let mut frame = masked(Opcode::Text, b"too long", [0, 0, 0, 0]);
        assert!(codec.decode(&mut frame).is_err());
    }

    #[tokio::test]
    async fn test_next_frame_stops_at_close() {
        let mut data = masked(Opcode::Text, b"ping", [5, 6, 7, 8]);
        data.extend_from_slice(&masked(Opcode::Close, b"", [1, 1, 1, 1]));
        data.extend_from_slice(&masked(Opcode::Text, b"never read", [1, 1, 1, 1]));

        let reader = Builder::new().read(&data).build();
        let mut frames = FramedRead::new(reader, FrameCodec::default());
        let idle = Duration::from_secs(1);

        let first = next_frame(&mut frames, idle).await.unwrap();
        assert_eq!(&first.payload[..], b"ping");
        assert!(next_frame(&mut frames, idle).await.is_none());
    }

    #[tokio::test]
    async fn test_next_frame_ends_on_eof() {
        let reader = Builder::new().build();
        let mut frames = FramedRead::new(reader, FrameCodec::default());
        assert!(next_frame(&mut frames, Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_next_frame_times_out() {
        let reader = Builder::new().wait(Duration::from_secs(5)).build();
        let mut frames = FramedRead::new(reader, FrameCodec::default());
        assert!(next_frame(&mut frames, Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_prefetched_bytes_are_decoded_first() {
        let reader = Builder::new()
            .read(&masked(Opcode::Text, b"second", [2, 2, 2, 2]))
            .build();
        let mut frames = FramedRead::new(reader, FrameCodec::default());
        frames
            .read_buffer_mut()
            .extend_from_slice(&masked(Opcode::Text, b"first", [3, 3, 3, 3]));

        let idle = Duration::from_secs(1);
        assert_eq!(&next_frame(&mut frames, idle).await.unwrap().payload[..], b"first");
        assert_eq!(&next_frame(&mut frames, idle).await.unwrap().payload[..], b"second");
    }
}
