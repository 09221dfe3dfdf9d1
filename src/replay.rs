use crate::protocol::{Event, Response};
use crate::session::{Session, TERMINATOR};

/// Stream the session's message back to smtpd one line at a time, closed
/// by the terminator line.
pub fn emit(session: &Session, event: &Event) -> Vec<Response> {
    let mut responses: Vec<Response> = match &session.message {
        Some(message) => message
            .lines()
            .map(|line| Response::dataline(event, line))
            .collect(),
        None => {
            log::warn!("Session {}: nothing reassembled to replay", session.id);
            Vec::new()
        }
    };
    responses.push(Response::dataline(event, TERMINATOR));
    responses
}
