//! STOMP frame codec.
//!
//! Stateless translation between [`Frame`] values and the bytes carried in a
//! single WebSocket message: a command line, `key:value` header lines, a blank
//! line, an optional body, and a NUL terminator. A heart-beat is a lone EOL.
//!
//! Encoding works on byte buffers so bodies may hold arbitrary bytes.

use std::collections::BTreeMap;

use hd_core::constants::{self, headers};
use hd_core::error::{HdError, HdResult};

use crate::credentials::Credentials;

/// Frame command, the first line of every non-heartbeat frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Send,
    Subscribe,
    Connected,
    Message,
    Error,
    Heartbeat,
    /// Any command this client does not understand. Ignored by the link.
    Unknown(String),
}

impl Command {
    /// Parse a command token.
    pub fn from_token(token: &str) -> Self {
        match token {
            "CONNECT" => Self::Connect,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "CONNECTED" => Self::Connected,
            "MESSAGE" => Self::Message,
            "ERROR" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// The command token as written on the wire. Empty for heart-beats.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connect => "CONNECT",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
            Self::Heartbeat => "",
            Self::Unknown(s) => s.as_str(),
        }
    }

    /// CONNECT and CONNECTED headers are carried verbatim; every other
    /// frame escapes `\`, `\n`, `\r` and `:` in header names and values.
    pub fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heartbeat => write!(f, "HEARTBEAT"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// A single protocol frame.
///
/// Headers live in a `BTreeMap`, so encoding is deterministic. An empty body
/// is the same as no body: the builders store `None` for it and the decoder
/// never produces `Some(vec![])`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Frame {
    /// Create a frame with no headers and no body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// The keep-alive frame.
    pub fn heartbeat() -> Self {
        Self::new(Command::Heartbeat)
    }

    /// Add a header, replacing any previous value.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach a body. An empty body is stored as `None`.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        self.body = if body.is_empty() { None } else { Some(body) };
        self
    }

    /// Look up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command == Command::Heartbeat
    }

    /// Body as UTF-8 text, empty when there is no body.
    pub fn body_text(&self) -> HdResult<&str> {
        match &self.body {
            Some(bytes) => std::str::from_utf8(bytes)
                .map_err(|e| HdError::Protocol(format!("body is not valid UTF-8: {e}"))),
            None => Ok(""),
        }
    }

    /// Human-readable error text of an ERROR frame: the `message` header and body combined.
    pub fn error_text(&self) -> String {
        let body = self
            .body
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        match self.header(headers::MESSAGE) {
            Some(message) if body.is_empty() => message.to_string(),
            Some(message) => format!("{message}: {body}"),
            None => body.into_owned(),
        }
    }

    /// CONNECT frame carrying credentials and the heart-beat contract.
    pub fn connect(credentials: &Credentials, heartbeat_ms: u64) -> Self {
        Self::new(Command::Connect)
            .with_header(headers::ACCEPT_VERSION, constants::STOMP_VERSION)
            .with_header(headers::HEART_BEAT, format!("{heartbeat_ms},{heartbeat_ms}"))
            .with_header(headers::AUTHORIZATION, format!("Bearer {}", credentials.auth_token))
            .with_header(headers::WORKSPACE_ID, credentials.workspace_id.as_str())
            .with_header(headers::DEVICE_ID, credentials.device_id.as_str())
            .with_header(headers::DEVICE_TYPE, credentials.device_type.as_str())
    }

    /// SUBSCRIBE frame for one topic.
    pub fn subscribe(destination: &str, subscription_id: &str, device_type: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header(headers::DESTINATION, destination)
            .with_header(headers::SUBSCRIPTION_ID, subscription_id)
            .with_header(headers::DEVICE_TYPE, device_type)
    }

    /// SEND frame with a JSON body.
    pub fn send_json(destination: &str, device_type: &str, json: Vec<u8>) -> Self {
        Self::new(Command::Send)
            .with_header(headers::DESTINATION, destination)
            .with_header(headers::DEVICE_TYPE, device_type)
            .with_header(headers::CONTENT_LENGTH, json.len().to_string())
            .with_header(headers::CONTENT_TYPE, constants::JSON_CONTENT_TYPE)
            .with_body(json)
    }

    /// Serialize to wire bytes.
    ///
    /// `content-length` always reflects the body actually written: it is
    /// computed here, replacing any value the caller set, and omitted when
    /// there is no body.
    pub fn encode(&self) -> Vec<u8> {
        if self.is_heartbeat() {
            return vec![b'\n'];
        }

        let body_len = self.body.as_ref().map_or(0, Vec::len);
        let content_length = self.body.as_ref().map(|body| body.len().to_string());
        let escaped = self.command.escapes_headers();

        let mut out = Vec::with_capacity(64 + body_len);
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        let lines = self
            .headers
            .iter()
            .filter(|(name, _)| name.as_str() != headers::CONTENT_LENGTH)
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .chain(content_length.as_deref().map(|len| (headers::CONTENT_LENGTH, len)));
        for (name, value) in lines {
            write_header_part(&mut out, name, escaped);
            out.push(b':');
            write_header_part(&mut out, value, escaped);
            out.push(b'\n');
        }
        out.push(b'\n');
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out.push(0);
        out
    }

    /// Parse wire bytes.
    ///
    /// Unrecognised commands decode to [`Command::Unknown`]; only structurally
    /// broken input is an error.
    pub fn decode(bytes: &[u8]) -> HdResult<Self> {
        let Some(start) = bytes.iter().position(|b| !is_eol(*b)) else {
            return Ok(Self::heartbeat());
        };
        let data = &bytes[start..];
        let (head, rest) = split_head(data);

        let head = std::str::from_utf8(head)
            .map_err(|e| HdError::Protocol(format!("header block is not valid UTF-8: {e}")))?;
        let head = if rest.is_none() {
            head.trim_end_matches(|c: char| matches!(c, '\0' | '\n' | '\r'))
        } else {
            head
        };

        let mut lines = head
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter(|line| !line.is_empty());

        let command = match lines.next() {
            Some(token) => Command::from_token(token),
            None => return Err(HdError::Protocol("frame has no command line".into())),
        };

        let escaped = command.escapes_headers();
        let mut frame = Self::new(command);
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HdError::Protocol(format!("malformed header line: {line:?}")))?;
            // First occurrence wins for repeated headers.
            let (name, value) = if escaped {
                (unescape(name), unescape(value))
            } else {
                (name.to_string(), value.to_string())
            };
            frame.headers.entry(name).or_insert(value);
        }

        if let Some(rest) = rest {
            let body = match frame.header(headers::CONTENT_LENGTH) {
                Some(raw) => {
                    let len: usize = raw.trim().parse().map_err(|_| {
                        HdError::Protocol(format!("invalid content-length: {raw:?}"))
                    })?;
                    if len > rest.len() {
                        return Err(HdError::Protocol(format!(
                            "content-length {len} exceeds {} available bytes",
                            rest.len()
                        )));
                    }
                    &rest[..len]
                }
                None => strip_terminator(rest),
            };
            if !body.is_empty() {
                frame.body = Some(body.to_vec());
            }
        }

        Ok(frame)
    }
}

fn is_eol(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

/// Split at the first blank line. The head keeps the command and header lines.
fn split_head(data: &[u8]) -> (&[u8], Option<&[u8]>) {
    let mut line_start = 0;
    while let Some(offset) = data[line_start..].iter().position(|b| *b == b'\n') {
        let line_end = line_start + offset;
        let line = &data[line_start..line_end];
        if line.is_empty() || line == b"\r" {
            return (&data[..line_start], Some(&data[line_end + 1..]));
        }
        line_start = line_end + 1;
    }
    (data, None)
}

/// Drop EOLs trailing the terminator, then the NUL terminator itself.
fn strip_terminator(rest: &[u8]) -> &[u8] {
    let mut end = rest.len();
    while end > 0 && is_eol(rest[end - 1]) {
        end -= 1;
    }
    if end > 0 && rest[end - 1] == 0 {
        end -= 1;
    }
    &rest[..end]
}

fn write_header_part(out: &mut Vec<u8>, raw: &str, escaped: bool) {
    if !escaped {
        out.extend_from_slice(raw.as_bytes());
        return;
    }
    for b in raw.bytes() {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b':' => out.extend_from_slice(b"\\c"),
            other => out.push(other),
        }
    }
}

/// Reverse of `write_header_part` escaping. Undefined escapes are kept literally.
fn unescape(raw: &str) -> String {
    if !raw.contains('\\') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
