//! # Evented HTTP framing
//!
//! HAP accessory servers keep the `PUT /characteristics` connection open
//! after an event subscription and push value changes over it. Those pushes
//! look like HTTP responses except for the start line:
//!
//! ```text
//! message    = start-line CRLF *( header CRLF ) CRLF [ body ]
//! start-line = response-line / event-line / request-line
//! response   = "HTTP/1.1" SP status-code SP reason
//! event      = "EVENT/1.0" SP status-code SP reason    ; unsolicited push
//! header     = name ":" OWS value                       ; name is case-insensitive
//! body       = Content-Length octets                    ; no Content-Length, no body
//! ```
//!
//! The device may coalesce several messages into one TCP segment or split one
//! message across many, so [`MessageDecoder`] keeps a residual buffer per
//! connection and yields only complete messages.

use std::collections::HashMap;
use bytes::{Bytes, BytesMut};
use shared::protocol::{AUTHORIZATION_HEADER, EVENT_TOKEN, HAP_JSON_CONTENT_TYPE};
use shared::types::{CharacteristicWrite, CharacteristicsWriteRequest};

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Largest start line plus headers accepted before the residue is dropped.
pub const MAX_HEAD_LEN: usize = 16 * 1024;
/// Largest accepted `Content-Length`. Larger values are treated as malformed.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

/// One framed message from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    /// First token of the start line: "HTTP/1.1", or "EVENT" for pushes
    pub protocol: String,
    /// Present only for responses
    pub status_code: Option<u16>,
    pub status_message: String,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl DecodedMessage {
    pub fn is_event(&self) -> bool {
        self.protocol == EVENT_TOKEN
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Body as text, when the message declares a JSON content type.
    pub fn json_text(&self) -> Option<&str> {
        let content_type = self.header("content-type")?;
        if !content_type.to_ascii_lowercase().contains("json") {
            return None;
        }
        std::str::from_utf8(&self.body).ok()
    }
}

/// Bytes left undecoded when a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialMessage {
    pub connection_id: String,
    pub len: usize,
}

/// Per-connection incremental decoder.
#[derive(Debug)]
pub struct MessageDecoder {
    connection_id: String,
    buffer: BytesMut,
    /// Offset up to which `buffer` is known not to contain a header end
    scanned: usize,
}

impl MessageDecoder {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            buffer: BytesMut::new(),
            scanned: 0,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Number of buffered bytes not yet part of a complete message.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Append received bytes and return every message completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<DecodedMessage> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(message) = self.decode_next() {
            messages.push(message);
        }
        messages
    }

    /// Consume the decoder at connection close, reporting any residue.
    pub fn finish(self) -> Option<PartialMessage> {
        if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        Some(PartialMessage {
            connection_id: self.connection_id,
            len: self.buffer.len(),
        })
    }

    fn decode_next(&mut self) -> Option<DecodedMessage> {
        // Some servers terminate bodies with an extra CRLF
        while self.buffer.starts_with(CRLF) {
            let _ = self.buffer.split_to(CRLF.len());
            self.scanned = self.scanned.saturating_sub(CRLF.len());
        }

        let Some(head_len) = find(&self.buffer, HEADER_END, self.scanned) else {
            if self.buffer.len() > MAX_HEAD_LEN {
                let discarded = PartialMessage {
                    connection_id: self.connection_id.clone(),
                    len: self.buffer.len(),
                };
                tracing::debug!(
                    "[{}] Discarding {} bytes without a header terminator",
                    discarded.connection_id,
                    discarded.len
                );
                self.buffer.clear();
                self.scanned = 0;
            } else {
                self.scanned = self.buffer.len().saturating_sub(HEADER_END.len() - 1);
            }
            return None;
        };
        self.scanned = head_len;
        let head = String::from_utf8_lossy(&self.buffer[..head_len]).into_owned();

        let mut lines = head.split("\r\n");
        let start_line = lines.next().unwrap_or_default();
        let (protocol, status_code, status_message) = parse_start_line(start_line);

        let mut headers = HashMap::new();
        for line in lines {
            match line.split_once(':') {
                Some((name, value)) => {
                    headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                }
                None => {
                    tracing::debug!("[{}] Skipping malformed header line {:?}", self.connection_id, line);
                }
            }
        }

        let body_len = match headers.get("content-length") {
            Some(value) => match value.parse::<usize>() {
                Ok(len) if len <= MAX_BODY_LEN => len,
                _ => {
                    tracing::debug!("[{}] Ignoring invalid Content-Length {:?}", self.connection_id, value);
                    0
                }
            },
            None => 0,
        };

        let body_start = head_len.checked_add(HEADER_END.len())?;
        let total = body_start.checked_add(body_len)?;
        if self.buffer.len() < total {
            return None;
        }
        self.scanned = 0;

        let mut message = self.buffer.split_to(total);
        let body = message.split_off(body_start).freeze();

        Some(DecodedMessage {
            protocol,
            status_code,
            status_message,
            headers,
            body,
        })
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

fn parse_start_line(line: &str) -> (String, Option<u16>, String) {
    let mut parts = line.splitn(3, ' ');
    let token = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    let reason = parts.next().unwrap_or_default().trim().to_string();

    if token.starts_with(EVENT_TOKEN) {
        return (EVENT_TOKEN.to_string(), None, reason);
    }

    match code.parse::<u16>() {
        Ok(status) => (token.to_string(), Some(status), reason),
        Err(_) => (token.to_string(), None, reason),
    }
}

/// A request to write onto a raw connection.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.path).as_bytes());
        out.extend_from_slice(format!("Host: {}\r\n", self.host).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        match &self.body {
            Some(body) => {
                out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
                out.extend_from_slice(body);
            }
            None => out.extend_from_slice(CRLF),
        }
        out.freeze()
    }
}

/// `PUT /characteristics` enabling events for every listed characteristic.
pub fn subscribe_request(
    host: &str,
    pin: &str,
    subscriptions: &[(u64, u64)],
) -> Result<Request, serde_json::Error> {
    let body = CharacteristicsWriteRequest {
        characteristics: subscriptions
            .iter()
            .map(|&(aid, iid)| CharacteristicWrite::subscribe(aid as i64, iid as i64))
            .collect(),
    };

    Ok(Request {
        method: "PUT".to_string(),
        path: "/characteristics".to_string(),
        host: host.to_string(),
        headers: vec![
            ("Content-Type".to_string(), HAP_JSON_CONTENT_TYPE.to_string()),
            (AUTHORIZATION_HEADER.to_string(), pin.to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
        ],
        body: Some(Bytes::from(serde_json::to_vec(&body)?)),
    })
}
