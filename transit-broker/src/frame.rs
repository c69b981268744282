//! STOMP 1.2 frame codec
//!
//! Frames are `COMMAND\n(header:value\n)*\nbody\0`. Bodies are delimited by a
//! `content-length` header when present and by the first NUL byte otherwise. A bare
//! EOL between frames is a heart-beat.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound on a single frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// STOMP frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are never escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Get a header value; the first occurrence wins for repeated headers
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Decoded item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    Heartbeat,
}

/// Item to encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    Heartbeat,
}

/// Frame codec errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame header is not valid UTF-8")]
    Utf8,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    #[error("Invalid content-length: {0}")]
    InvalidContentLength(String),

    #[error("Frame body is not NUL-terminated")]
    MissingNul,

    #[error("Frame exceeds {0} bytes")]
    TooLarge(usize),
}

/// STOMP 1.2 codec
#[derive(Debug, Clone)]
pub struct StompCodec {
    max_frame_size: usize,
}

impl StompCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Locate the blank line ending the header block
///
/// Returns `(header_len, body_start)`.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some((i, i + 2)),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, i + 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

fn parse_head(head: &[u8]) -> Result<(Command, Vec<(String, String)>), FrameError> {
    let text = std::str::from_utf8(head).map_err(|_| FrameError::Utf8)?;
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let command_line = lines.next().unwrap_or_default();
    let command = Command::parse(command_line)
        .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if command.escapes_headers() {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    Ok((command, headers))
}

impl Decoder for StompCodec {
    type Item = Inbound;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, FrameError> {
        match src.first() {
            None => return Ok(None),
            Some(b'\n') => {
                src.advance(1);
                return Ok(Some(Inbound::Heartbeat));
            }
            Some(b'\r') => {
                return match src.get(1) {
                    None => Ok(None),
                    Some(b'\n') => {
                        src.advance(2);
                        Ok(Some(Inbound::Heartbeat))
                    }
                    Some(_) => Err(FrameError::UnknownCommand("\\r".to_string())),
                };
            }
            Some(_) => {}
        }

        let Some((head_len, body_start)) = find_header_end(src) else {
            if src.len() > self.max_frame_size {
                return Err(FrameError::TooLarge(self.max_frame_size));
            }
            return Ok(None);
        };

        let (command, headers) = parse_head(&src[..head_len])?;

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(v.clone()))
            })
            .transpose()?;

        let body_len = match content_length {
            Some(len) => {
                let frame_end = body_start
                    .checked_add(len)
                    .and_then(|n| n.checked_add(1))
                    .filter(|end| *end <= self.max_frame_size)
                    .ok_or(FrameError::TooLarge(self.max_frame_size))?;
                if src.len() < frame_end {
                    src.reserve(frame_end - src.len());
                    return Ok(None);
                }
                if src[body_start + len] != 0 {
                    return Err(FrameError::MissingNul);
                }
                len
            }
            None => match src[body_start..].iter().position(|b| *b == 0) {
                Some(len) => len,
                None => {
                    if src.len() > self.max_frame_size {
                        return Err(FrameError::TooLarge(self.max_frame_size));
                    }
                    return Ok(None);
                }
            },
        };

        let mut frame_bytes = src.split_to(body_start + body_len + 1);
        frame_bytes.advance(body_start);
        frame_bytes.truncate(body_len);

        Ok(Some(Inbound::Frame(Frame {
            command,
            headers,
            body: frame_bytes.freeze(),
        })))
    }
}

impl Encoder<Outbound> for StompCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), FrameError> {
        let frame = match item {
            Outbound::Heartbeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            Outbound::Frame(frame) => frame,
        };

        let escaped = frame.command.escapes_headers();
        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');
        for (name, value) in &frame.headers {
            if escaped {
                dst.put_slice(escape(name).as_bytes());
                dst.put_u8(b':');
                dst.put_slice(escape(value).as_bytes());
            } else {
                dst.put_slice(name.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        if !frame.body.is_empty() && frame.get("content-length").is_none() {
            dst.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut StompCodec, bytes: &[u8]) -> Vec<Inbound> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_decode_message_frame() {
        let mut codec = StompCodec::default();
        let raw = b"MESSAGE\nmessage-id:m-1\nack:a-1\nsubscription:s\n\n{\"a\":1}\0";
        let items = decode_all(&mut codec, raw);

        assert_eq!(items.len(), 1);
        let Inbound::Frame(frame) = &items[0] else {
            panic!("expected frame");
        };
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("message-id"), Some("m-1"));
        assert_eq!(frame.get("ack"), Some("a-1"));
        assert_eq!(&frame.body[..], b"{\"a\":1}");
    }

    #[test]
    fn test_decode_heartbeats_between_frames() {
        let mut codec = StompCodec::default();
        let raw = b"\n\r\nRECEIPT\nreceipt-id:1\n\n\0\n";
        let items = decode_all(&mut codec, raw);

        assert_eq!(items.len(), 4);
        assert_eq!(items[0], Inbound::Heartbeat);
        assert_eq!(items[1], Inbound::Heartbeat);
        assert!(matches!(&items[2], Inbound::Frame(f) if f.command == Command::Receipt));
        assert_eq!(items[3], Inbound::Heartbeat);
    }

    #[test]
    fn test_decode_partial_frame_waits() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE\nmessage-id:m-1\n\nhel"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"lo\0");
        let item = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(item, Inbound::Frame(f) if &f.body[..] == b"hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_content_length_allows_nul_in_body() {
        let mut codec = StompCodec::default();
        let raw = b"MESSAGE\ncontent-length:3\n\na\0b\0";
        let items = decode_all(&mut codec, raw);
        assert!(matches!(&items[0], Inbound::Frame(f) if &f.body[..] == b"a\0b"));
    }

    #[test]
    fn test_decode_crlf_lines() {
        let mut codec = StompCodec::default();
        let raw = b"CONNECTED\r\nversion:1.2\r\nheart-beat:0,0\r\n\r\n\0";
        let items = decode_all(&mut codec, raw);
        let Inbound::Frame(frame) = &items[0] else {
            panic!("expected frame");
        };
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.get("version"), Some("1.2"));
        assert_eq!(frame.get("heart-beat"), Some("0,0"));
    }

    #[test]
    fn test_decode_unescapes_headers() {
        let mut codec = StompCodec::default();
        let raw = b"MESSAGE\ndestination:/topic/a\\cb\\\\c\n\n\0";
        let items = decode_all(&mut codec, raw);
        let Inbound::Frame(frame) = &items[0] else {
            panic!("expected frame");
        };
        assert_eq!(frame.get("destination"), Some("/topic/a:b\\c"));
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::from(&b"BOGUS\n\n\0"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_escape() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE\nx:\\t\n\n\0"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::InvalidEscape(_))
        ));
    }

    #[test]
    fn test_decode_too_large() {
        let mut codec = StompCodec::new(16);
        let mut buf = BytesMut::from(&b"MESSAGE\nmessage-id:0123456789"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::TooLarge(16))));
    }

    #[test]
    fn test_decode_huge_content_length() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:18446744073709551615\n\nx\0"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLarge(DEFAULT_MAX_FRAME_SIZE))
        ));

        let mut codec = StompCodec::new(64);
        let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:100\n\nx\0"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::TooLarge(64))));
    }

    #[test]
    fn test_encode_escapes_and_sets_length() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::new();
        let frame = Frame::new(Command::Send)
            .header("destination", "/topic/a:b")
            .body(Bytes::from_static(b"hi"));
        codec.encode(Outbound::Frame(frame), &mut buf).unwrap();

        assert_eq!(
            &buf[..],
            b"SEND\ndestination:/topic/a\\cb\ncontent-length:2\n\nhi\0"
        );
    }

    #[test]
    fn test_encode_connect_is_not_escaped() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::new();
        let frame = Frame::new(Command::Connect).header("host", "a:b");
        codec.encode(Outbound::Frame(frame), &mut buf).unwrap();
        assert_eq!(&buf[..], b"CONNECT\nhost:a:b\n\n\0");

        buf.clear();
        codec.encode(Outbound::Heartbeat, &mut buf).unwrap();
        assert_eq!(&buf[..], b"\n");
    }

    #[test]
    fn test_encoded_frame_decodes() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::new();
        let frame = Frame::new(Command::Ack).header("id", "x\ny");
        codec.encode(Outbound::Frame(frame.clone()), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Inbound::Frame(frame));
    }
}
