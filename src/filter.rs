use crate::config::RejectReplies;
use crate::error::{FilterError, Result};
use crate::protocol::{Event, EventName, Reply, Response};
use crate::replay;
use crate::rspamd::Scanner;
use crate::session::{ControlKey, Reassembly, SessionStore};
use crate::verdict;
use std::net::IpAddr;

/// Routes smtpd events to their handlers and owns all session state.
///
/// Events are handled strictly one after another. The scan awaited on the
/// final body line holds up every other session until it returns.
pub struct Filter {
    sessions: SessionStore,
    scanner: Box<dyn Scanner>,
    replies: RejectReplies,
}

/// Address to report as `Ip`, or `None` for local and loopback peers.
fn source_ip(src: &str) -> Option<String> {
    if src.starts_with('/') || src.starts_with("unix:") {
        return None;
    }
    let host = match src.strip_prefix('[') {
        Some(rest) => rest.split_once(']').map(|(host, _)| host)?,
        None => src.rsplit_once(':').map(|(host, _)| host).unwrap_or(src),
    };
    if host.is_empty() || host == "local" {
        return None;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => None,
        _ => Some(host.to_string()),
    }
}

impl Filter {
    pub fn new(scanner: Box<dyn Scanner>, replies: RejectReplies) -> Self {
        Filter {
            sessions: SessionStore::new(),
            scanner,
            replies,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionStore {
        &mut self.sessions
    }

    /// Handle one event and return what must be written back to smtpd.
    ///
    /// Errors stay with the event that caused them. A filter event always
    /// gets its terminal response, falling back to letting the mail through.
    pub async fn handle(&mut self, event: &Event) -> Vec<Response> {
        log::debug!(
            "{} {} session={} args={:?}",
            event.timestamp,
            event.raw_name,
            event.session,
            event.args
        );

        let responses = match self.dispatch(event).await {
            Ok(responses) => responses,
            Err(e) => {
                log::error!("Session {}: {} failed: {e}", event.session, event.raw_name);
                Self::fallback(event)
            }
        };
        debug_assert!(
            match event.name {
                EventName::Data | EventName::Commit => {
                    responses.last().is_some_and(Response::is_terminal)
                }
                EventName::DataLine => responses
                    .iter()
                    .all(|r| matches!(r.reply, Reply::DataLine(_))),
                _ => responses.is_empty(),
            },
            "{} answered with {responses:?}",
            event.raw_name
        );
        responses
    }

    fn fallback(event: &Event) -> Vec<Response> {
        match event.name {
            EventName::DataLine => vec![Response::dataline(event, event.last_arg())],
            EventName::Data | EventName::Commit => vec![Response::proceed(event)],
            _ => Vec::new(),
        }
    }

    async fn dispatch(&mut self, event: &Event) -> Result<Vec<Response>> {
        match event.name {
            EventName::LinkConnect => self.link_connect(event),
            EventName::LinkDisconnect => self.link_disconnect(event),
            EventName::LinkIdentify => self.link_identify(event),
            EventName::TxBegin => self.tx_begin(event),
            EventName::TxMail => self.tx_envelope(event, ControlKey::From),
            EventName::TxRcpt => self.tx_envelope(event, ControlKey::Rcpt),
            EventName::TxCommit | EventName::TxRollback => self.tx_cleanup(event),
            EventName::Data => self.filter_data(event),
            EventName::DataLine => self.filter_data_line(event).await,
            EventName::Commit => self.filter_commit(event),
            EventName::Unknown => {
                log::debug!("Ignoring unhandled event {}", event.raw_name);
                Ok(Vec::new())
            }
        }
    }

    fn link_connect(&mut self, event: &Event) -> Result<Vec<Response>> {
        let (rdns, src) = match (event.arg(0), event.arg(2)) {
            (Some(rdns), Some(src)) => (rdns, src),
            _ => {
                return Err(FilterError::MalformedEvent(format!(
                    "link-connect expects rdns|fcrdns|src|dest, got {:?}",
                    event.args
                )))
            }
        };

        let session = self.sessions.create(&event.session)?;
        session.control.set(ControlKey::Pass, "all");
        if let Some(ip) = source_ip(src) {
            session.control.set(ControlKey::Ip, ip);
        }
        if !rdns.is_empty() {
            session.control.set(ControlKey::Hostname, rdns);
        }
        log::info!("Session {}: connect from {src} ({rdns})", event.session);
        Ok(Vec::new())
    }

    fn link_disconnect(&mut self, event: &Event) -> Result<Vec<Response>> {
        self.sessions.remove(&event.session)?;
        log::debug!("Session {}: disconnected", event.session);
        Ok(Vec::new())
    }

    fn link_identify(&mut self, event: &Event) -> Result<Vec<Response>> {
        let helo = event.last_arg().to_string();
        self.sessions
            .get(&event.session)?
            .control
            .set(ControlKey::Helo, helo);
        Ok(Vec::new())
    }

    fn tx_begin(&mut self, event: &Event) -> Result<Vec<Response>> {
        let queue_id = event.arg(0).ok_or_else(|| {
            FilterError::MalformedEvent("tx-begin without a message id".to_string())
        })?;
        let session = self.sessions.get(&event.session)?;
        session.begin_transaction();
        session.control.set(ControlKey::QueueId, queue_id);
        Ok(Vec::new())
    }

    /// tx-mail and tx-rcpt: record the address when smtpd accepted it.
    fn tx_envelope(&mut self, event: &Event, key: ControlKey) -> Result<Vec<Response>> {
        let (address, status) = if event.version.status_before_address() {
            (event.arg(2), event.arg(1))
        } else {
            (event.arg(1), event.arg(2))
        };
        let (Some(address), Some(status)) = (address, status) else {
            return Err(FilterError::MalformedEvent(format!(
                "{} expects msgid, address and status, got {:?}",
                event.raw_name, event.args
            )));
        };

        let session = self.sessions.get(&event.session)?;
        if status == "ok" {
            session.control.set(key, address);
        } else {
            log::debug!(
                "Session {}: {} {address} not accepted ({status})",
                event.session,
                event.raw_name
            );
        }
        Ok(Vec::new())
    }

    fn tx_cleanup(&mut self, event: &Event) -> Result<Vec<Response>> {
        self.sessions.get(&event.session)?.control.clear();
        Ok(Vec::new())
    }

    /// The data phase opens the message body.
    fn filter_data(&mut self, event: &Event) -> Result<Vec<Response>> {
        self.sessions.get(&event.session)?.begin_body();
        Ok(vec![Response::proceed(event)])
    }

    async fn filter_data_line(&mut self, event: &Event) -> Result<Vec<Response>> {
        let line = event.arg(0).unwrap_or_default();
        let session = self.sessions.get(&event.session)?;
        if session.push(line) == Reassembly::Pending {
            return Ok(Vec::new());
        }

        let outcome = match &session.message {
            Some(message) => self.scanner.scan(&session.control, message).await,
            None => verdict::ScanOutcome::NoVerdict,
        };
        verdict::apply(session, &outcome, &self.replies);
        Ok(replay::emit(session, event))
    }

    fn filter_commit(&mut self, event: &Event) -> Result<Vec<Response>> {
        let session = self.sessions.get(&event.session)?;
        let response = match session.take_reject_reason() {
            Some(reason) => {
                log::info!("Session {}: rejecting message: {reason}", event.session);
                Response::reject(event, reason)
            }
            None => {
                log::info!("Session {}: accepting message", event.session);
                Response::proceed(event)
            }
        };
        Ok(vec![response])
    }
}
