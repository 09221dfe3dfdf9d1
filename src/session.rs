use crate::error::{FilterError, Result};
use crate::message::Message;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Metadata keys forwarded to Rspamd as request headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControlKey {
    Ip,
    Hostname,
    Helo,
    QueueId,
    From,
    Rcpt,
    Pass,
}

impl ControlKey {
    /// Header name as Rspamd expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKey::Ip => "Ip",
            ControlKey::Hostname => "Hostname",
            ControlKey::Helo => "Helo",
            ControlKey::QueueId => "Queue-Id",
            ControlKey::From => "From",
            ControlKey::Rcpt => "Rcpt",
            ControlKey::Pass => "Pass",
        }
    }
}

impl fmt::Display for ControlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-transaction metadata. Only the keys in [`ControlKey`] can be stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Control {
    entries: BTreeMap<ControlKey, String>,
}

impl Control {
    pub fn set(&mut self, key: ControlKey, value: impl Into<String>) {
        self.entries.insert(key, value.into());
    }

    pub fn get(&self, key: ControlKey) -> Option<&str> {
        self.entries.get(&key).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ControlKey, &str)> {
        self.entries.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

/// Line that ends a message body on the wire.
pub const TERMINATOR: &str = ".";

/// Result of feeding one body line to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reassembly {
    Pending,
    Complete,
}

/// State tracked for one smtpd connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub control: Control,
    pub payload: Vec<String>,
    pub message: Option<Message>,
    reject_reason: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Session {
            id: id.into(),
            control: Control::default(),
            payload: Vec::new(),
            message: None,
            reject_reason: None,
        }
    }

    pub fn reject_reason(&self) -> Option<&str> {
        self.reject_reason.as_deref()
    }

    /// Record a pending rejection. An already pending reason is kept;
    /// returns whether `reason` was stored.
    pub fn set_reject_reason(&mut self, reason: impl Into<String>) -> bool {
        if self.reject_reason.is_some() {
            return false;
        }
        self.reject_reason = Some(reason.into());
        true
    }

    /// Read and clear the pending rejection in one step.
    pub fn take_reject_reason(&mut self) -> Option<String> {
        self.reject_reason.take()
    }

    /// Start a new transaction. `control` is left as commit or rollback
    /// emptied it; a leftover message or rejection is dropped.
    pub fn begin_transaction(&mut self) {
        self.payload.clear();
        self.message = None;
        if let Some(stale) = self.reject_reason.take() {
            log::warn!("Session {}: discarding unused rejection {stale:?}", self.id);
        }
    }

    /// Start a new message body.
    pub fn begin_body(&mut self) {
        self.payload.clear();
        self.message = None;
    }

    /// Buffer a body line. The terminator parses the buffered lines into
    /// `message`.
    pub fn push(&mut self, line: &str) -> Reassembly {
        if line != TERMINATOR {
            self.payload.push(line.to_string());
            return Reassembly::Pending;
        }
        self.message = Some(Message::parse(&self.payload));
        Reassembly::Complete
    }
}

/// Live sessions keyed by the identifier smtpd assigns to each connection.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, id: &str) -> Result<&mut Session> {
        if self.sessions.contains_key(id) {
            return Err(FilterError::DuplicateSession(id.to_string()));
        }
        Ok(self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id)))
    }

    pub fn get(&mut self, id: &str) -> Result<&mut Session> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| FilterError::UnknownSession(id.to_string()))
    }

    pub fn remove(&mut self, id: &str) -> Result<Session> {
        self.sessions
            .remove(id)
            .ok_or_else(|| FilterError::UnknownSession(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
