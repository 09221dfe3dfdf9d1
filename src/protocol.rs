//! Line codec for the smtpd filter protocol.
//!
//! smtpd writes one event per line on the filter's stdin and reads
//! registrations and filter responses from its stdout.

use crate::error::{FilterError, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        ProtocolVersion { major, minor }
    }

    /// Before 0.5 the token preceded the session id in responses.
    pub fn token_first(&self) -> bool {
        *self < ProtocolVersion::new(0, 5)
    }

    /// From 0.6 on, tx-mail and tx-rcpt carry the status before the address.
    pub fn status_before_address(&self) -> bool {
        *self >= ProtocolVersion::new(0, 6)
    }
}

impl FromStr for ProtocolVersion {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || FilterError::MalformedEvent(format!("bad protocol version '{s}'"));
        let (major, minor) = s.split_once('.').ok_or_else(bad)?;
        Ok(ProtocolVersion {
            major: major.parse().map_err(|_| bad())?,
            minor: minor.parse().map_err(|_| bad())?,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Report,
    Filter,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Report => "report",
            Kind::Filter => "filter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    LinkConnect,
    LinkDisconnect,
    LinkIdentify,
    TxBegin,
    TxMail,
    TxRcpt,
    TxCommit,
    TxRollback,
    Data,
    DataLine,
    Commit,
    Unknown,
}

/// Every event the filter subscribes to.
const EVENTS: &[(Kind, &str, EventName)] = &[
    (Kind::Report, "link-connect", EventName::LinkConnect),
    (Kind::Report, "link-disconnect", EventName::LinkDisconnect),
    (Kind::Report, "link-identify", EventName::LinkIdentify),
    (Kind::Report, "tx-begin", EventName::TxBegin),
    (Kind::Report, "tx-mail", EventName::TxMail),
    (Kind::Report, "tx-rcpt", EventName::TxRcpt),
    (Kind::Report, "tx-commit", EventName::TxCommit),
    (Kind::Report, "tx-rollback", EventName::TxRollback),
    (Kind::Filter, "data", EventName::Data),
    (Kind::Filter, "data-line", EventName::DataLine),
    (Kind::Filter, "commit", EventName::Commit),
];

impl EventName {
    pub fn lookup(kind: Kind, name: &str) -> EventName {
        EVENTS
            .iter()
            .find(|(k, n, _)| *k == kind && *n == name)
            .map(|(_, _, event)| *event)
            .unwrap_or(EventName::Unknown)
    }
}

/// `register|...` lines sent once smtpd reports `config|ready`.
pub fn registrations() -> Vec<String> {
    EVENTS
        .iter()
        .map(|(kind, name, _)| format!("register|{}|smtp-in|{}", kind.as_str(), name))
        .chain(std::iter::once("register|ready".to_string()))
        .collect()
}

/// Turn one raw input line into text, one char per byte.
///
/// smtpd does not guarantee UTF-8: 8-bit message lines pass through as
/// they were received. Mapping bytes to U+0000..=U+00FF keeps every line
/// intact, and [`encode_line`] writes the same bytes back.
pub fn decode_line(bytes: &[u8]) -> String {
    bytes.iter().copied().map(char::from).collect()
}

/// Inverse of [`decode_line`]. Chars above U+00FF, which only appear in
/// text that did not come from smtpd, are written as UTF-8.
pub fn encode_line(line: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    for c in line.chars() {
        match u8::try_from(c) {
            Ok(byte) => out.push(byte),
            Err(_) => out.extend_from_slice(c.encode_utf8(&mut [0; 4]).as_bytes()),
        }
    }
    out
}

/// Text from a UTF-8 source (Rspamd's JSON) in the form [`decode_line`]
/// produces, so it is written out as the same UTF-8 bytes.
pub fn from_utf8_text(text: &str) -> String {
    decode_line(text.as_bytes())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: Kind,
    pub version: ProtocolVersion,
    pub timestamp: String,
    pub subsystem: String,
    pub name: EventName,
    /// Event name as sent, kept for logging unknown events.
    pub raw_name: String,
    pub session: String,
    /// Correlation token, present on filter events only.
    pub token: Option<String>,
    pub args: Vec<String>,
}

impl Event {
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// The last argument, or an empty string when there are none.
    pub fn last_arg(&self) -> &str {
        self.args.last().map(String::as_str).unwrap_or_default()
    }
}

/// One line read from smtpd.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Config { key: String, value: String },
    Event(Event),
}

impl FromStr for Input {
    type Err = FilterError;

    fn from_str(line: &str) -> Result<Self> {
        let malformed = || FilterError::MalformedEvent(line.to_string());

        if let Some(rest) = line.strip_prefix("config|") {
            let (key, value) = rest.split_once('|').unwrap_or((rest, ""));
            return Ok(Input::Config {
                key: key.to_string(),
                value: value.to_string(),
            });
        }

        let mut fields = line.splitn(7, '|');
        let kind = match fields.next() {
            Some("report") => Kind::Report,
            Some("filter") => Kind::Filter,
            _ => return Err(malformed()),
        };
        let version: ProtocolVersion = fields.next().ok_or_else(malformed)?.parse()?;
        let timestamp = fields.next().ok_or_else(malformed)?;
        let subsystem = fields.next().ok_or_else(malformed)?;
        let raw_name = fields.next().ok_or_else(malformed)?;
        let session = fields.next().ok_or_else(malformed)?;
        let mut rest = fields.next();

        let token = match kind {
            Kind::Report => None,
            Kind::Filter => {
                let mut parts = rest.ok_or_else(malformed)?.splitn(2, '|');
                let token = parts.next().ok_or_else(malformed)?;
                rest = parts.next();
                Some(token.to_string())
            }
        };

        let name = EventName::lookup(kind, raw_name);
        let args = match (name, rest) {
            // body lines may contain the separator themselves
            (EventName::DataLine, rest) => vec![rest.unwrap_or_default().to_string()],
            (_, Some(rest)) => rest.split('|').map(str::to_string).collect(),
            (_, None) => Vec::new(),
        };

        Ok(Input::Event(Event {
            kind,
            version,
            timestamp: timestamp.to_string(),
            subsystem: subsystem.to_string(),
            name,
            raw_name: raw_name.to_string(),
            session: session.to_string(),
            token,
            args,
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Proceed,
    Reject(String),
    DataLine(String),
}

/// One line written back to smtpd in answer to a filter event.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub version: ProtocolVersion,
    pub session: String,
    pub token: String,
    pub reply: Reply,
}

impl Response {
    pub fn new(event: &Event, reply: Reply) -> Self {
        Response {
            version: event.version,
            session: event.session.clone(),
            token: event.token.clone().unwrap_or_default(),
            reply,
        }
    }

    pub fn proceed(event: &Event) -> Self {
        Self::new(event, Reply::Proceed)
    }

    pub fn reject(event: &Event, reason: impl Into<String>) -> Self {
        Self::new(event, Reply::Reject(reason.into()))
    }

    pub fn dataline(event: &Event, line: impl Into<String>) -> Self {
        Self::new(event, Reply::DataLine(line.into()))
    }

    /// Whether this response settles the filter event it answers.
    pub fn is_terminal(&self) -> bool {
        match &self.reply {
            Reply::Proceed | Reply::Reject(_) => true,
            Reply::DataLine(line) => line == crate::session::TERMINATOR,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (first, second) = if self.version.token_first() {
            (&self.token, &self.session)
        } else {
            (&self.session, &self.token)
        };
        match &self.reply {
            Reply::Proceed => write!(f, "filter-result|{first}|{second}|proceed"),
            Reply::Reject(reason) => write!(f, "filter-result|{first}|{second}|reject|{reason}"),
            Reply::DataLine(line) => write!(f, "filter-dataline|{first}|{second}|{line}"),
        }
    }
}
