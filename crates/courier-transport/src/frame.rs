//! STOMP 1.2 text frames.
//!
//! ```text
//! COMMAND\n
//! name:value\n
//! ...\n
//! \n
//! body\0
//! ```
//!
//! A message made only of EOLs is a heartbeat. Header names and values are
//! escaped (`\\`, `\n`, `\r`, `\c`) on every command except `CONNECT` and
//! `CONNECTED`.

use std::fmt;

use courier_core::{CourierError, Result};

/// Wire form of an outgoing heartbeat.
pub const HEARTBEAT: &str = "\n";

/// Frame commands this client sends or understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client handshake, carrying credentials and heart-beat offer.
    Connect,
    /// Broker accepted the handshake.
    Connected,
    /// Start receiving a destination.
    Subscribe,
    /// Stop receiving a destination.
    Unsubscribe,
    /// Publish to a destination.
    Send,
    /// Broker delivery on a subscription.
    Message,
    /// Broker acknowledgement of a receipt request.
    Receipt,
    /// Broker-side failure; the connection is closed after it.
    Error,
    /// Graceful client shutdown.
    Disconnect,
}

impl Command {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    /// Parse a wire name. `STOMP` is accepted as an alias of `CONNECT`.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "CONNECT" | "STOMP" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "SEND" => Self::Send,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            _ => return None,
        })
    }

    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    headers: Vec<(String, String)>,
    /// Body text (empty for most control frames).
    pub body: String,
}

impl Frame {
    /// Frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the first header called `name`. Repeated headers keep the
    /// first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All headers in wire order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Serialize, NUL terminator included.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                push_escaped(&mut out, name);
                out.push(':');
                push_escaped(&mut out, value);
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one WebSocket text message.
    ///
    /// Returns `Ok(None)` for a heartbeat. Trailing EOLs after the NUL are
    /// ignored, and a missing NUL is tolerated.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor { text, pos: 0 };
        let command_line = cursor
            .line()
            .ok_or_else(|| decode_err("missing command line"))?;
        let command = Command::parse(command_line)
            .ok_or_else(|| decode_err(format!("unknown command `{command_line}`")))?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let line = cursor
                .line()
                .ok_or_else(|| decode_err("unterminated header block"))?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| decode_err(format!("header without `:`: `{line}`")))?;
            if escape {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let rest = &text[cursor.pos..];
        let length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| decode_err(format!("bad content-length `{v}`")))
            })
            .transpose()?;
        let body = match length {
            Some(n) => rest
                .get(..n)
                .ok_or_else(|| decode_err("body shorter than content-length"))?,
            None => rest.split('\0').next().unwrap_or_default(),
        };

        Ok(Some(Self {
            command,
            headers,
            body: body.to_string(),
        }))
    }
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Next line without its `\n` or `\r\n`, or `None` at end of input.
    fn line(&mut self) -> Option<&'a str> {
        let rest = &self.text[self.pos..];
        let end = rest.find('\n')?;
        self.pos += end + 1;
        Some(rest[..end].strip_suffix('\r').unwrap_or(&rest[..end]))
    }
}

fn push_escaped(out: &mut String, raw: &str) {
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Result<String> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => return Err(decode_err(format!("invalid escape `\\{other}`"))),
            None => return Err(decode_err("dangling `\\` in header")),
        }
    }
    Ok(out)
}

fn decode_err(msg: impl Into<String>) -> CourierError {
    CourierError::Decode(msg.into())
}
