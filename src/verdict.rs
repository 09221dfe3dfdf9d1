use crate::config::RejectReplies;
use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Action recommended by Rspamd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "no action")]
    NoAction,
    #[serde(rename = "add header")]
    AddHeader,
    #[serde(rename = "rewrite subject")]
    RewriteSubject,
    #[serde(rename = "reject")]
    Reject,
    #[serde(rename = "greylist")]
    Greylist,
    #[serde(rename = "soft reject")]
    SoftReject,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::NoAction => "no action",
            Action::AddHeader => "add header",
            Action::RewriteSubject => "rewrite subject",
            Action::Reject => "reject",
            Action::Greylist => "greylist",
            Action::SoftReject => "soft reject",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub action: Action,
    pub score: f64,
    pub required_score: f64,
    pub symbols: Vec<String>,
    /// Replacement subject, set when the action is `rewrite subject`.
    pub subject: Option<String>,
    /// Pre-computed DKIM-Signature values.
    pub signatures: Vec<String>,
}

impl Verdict {
    pub fn score_header(&self) -> String {
        format!(
            "{} / {}",
            format_score(self.score),
            format_score(self.required_score)
        )
    }
}

/// What a scan produced. Any scanner failure collapses to `NoVerdict`.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    NoVerdict,
    Verdict(Verdict),
}

pub const SIGNATURE_HEADER: &str = "DKIM-Signature";

/// Integral scores keep one decimal place so `1` renders as `1.0`.
pub fn format_score(score: f64) -> String {
    if score.is_finite() && score.fract() == 0.0 && score.abs() < 1e16 {
        format!("{score:.1}")
    } else {
        format!("{score}")
    }
}

/// Rewrite the session's message according to the verdict and record a
/// pending rejection when the action calls for one.
pub fn apply(session: &mut Session, outcome: &ScanOutcome, replies: &RejectReplies) {
    let verdict = match outcome {
        ScanOutcome::NoVerdict => return,
        ScanOutcome::Verdict(verdict) => verdict,
    };
    let Some(message) = session.message.as_mut() else {
        log::warn!("Session {}: verdict without a message", session.id);
        return;
    };

    if verdict.action == Action::RewriteSubject {
        if let Some(subject) = &verdict.subject {
            message.set_header("Subject", subject);
        }
    }

    message.set_header("X-Spam-Action", verdict.action.as_str());

    if verdict.action == Action::AddHeader {
        message.set_header("X-Spam", "yes");
    }

    message.set_header("X-Spam-Score", &verdict.score_header());
    message.set_header("X-Spam-Symbols", &verdict.symbols.join(", "));

    if let Some((first, rest)) = verdict.signatures.split_first() {
        message.set_header(SIGNATURE_HEADER, first);
        for signature in rest {
            message.add_header(SIGNATURE_HEADER, signature);
        }
    }

    if let Some(reason) = replies.for_action(verdict.action) {
        if !session.set_reject_reason(reason) {
            log::warn!(
                "Session {}: keeping pending rejection {:?}, ignoring {:?}",
                session.id,
                session.reject_reason(),
                reason
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn session_with(lines: &[&str]) -> Session {
        let mut session = Session::new("s1");
        session.message = Some(Message::parse(lines));
        session
    }

    fn verdict(action: Action) -> Verdict {
        Verdict {
            action,
            score: 1.0,
            required_score: 5.0,
            symbols: vec![],
            subject: None,
            signatures: vec![],
        }
    }

    #[test]
    fn test_no_verdict_leaves_message_alone() {
        let mut session = session_with(&["Subject: hi", "", "hello"]);
        let before = session.message.clone();
        apply(&mut session, &ScanOutcome::NoVerdict, &RejectReplies::default());
        assert_eq!(session.message, before);
        assert_eq!(session.reject_reason(), None);
    }

    #[test]
    fn test_add_header() {
        let mut session = session_with(&["Subject: hi", "", "hello"]);
        apply(
            &mut session,
            &ScanOutcome::Verdict(verdict(Action::AddHeader)),
            &RejectReplies::default(),
        );
        let message = session.message.as_ref().unwrap();
        assert_eq!(
            message.lines().collect::<Vec<_>>(),
            vec![
                "Subject: hi",
                "X-Spam-Action: add header",
                "X-Spam: yes",
                "X-Spam-Score: 1.0 / 5.0",
                "X-Spam-Symbols: ",
                "",
                "hello"
            ]
        );
        assert_eq!(session.reject_reason(), None);
    }

    #[test]
    fn test_rewrite_subject() {
        let mut session = session_with(&["Subject: hi", "", "hello"]);
        let mut v = verdict(Action::RewriteSubject);
        v.subject = Some("*** SPAM *** hi".to_string());
        v.symbols = vec!["BAYES_SPAM".to_string(), "R_DKIM_NA".to_string()];
        apply(&mut session, &ScanOutcome::Verdict(v), &RejectReplies::default());

        let message = session.message.as_ref().unwrap();
        assert_eq!(message.header("Subject").as_deref(), Some("*** SPAM *** hi"));
        let subjects = message.headers().iter().filter(|h| h.name() == "Subject");
        assert_eq!(subjects.count(), 1);
        assert_eq!(message.header("X-Spam"), None);
        assert_eq!(
            message.header("X-Spam-Symbols").as_deref(),
            Some("BAYES_SPAM, R_DKIM_NA")
        );
    }

    #[test]
    fn test_rejecting_actions_set_reason() {
        let cases = [
            (Action::Reject, "550 message rejected"),
            (Action::Greylist, "421 greylisted"),
            (Action::SoftReject, "451 try again later"),
        ];
        for (action, expected) in cases {
            let mut session = session_with(&["Subject: hi", "", "hello"]);
            apply(
                &mut session,
                &ScanOutcome::Verdict(verdict(action)),
                &RejectReplies::default(),
            );
            assert_eq!(session.reject_reason(), Some(expected));
            assert_eq!(
                session.message.as_ref().unwrap().header("X-Spam-Action").as_deref(),
                Some(action.as_str())
            );
        }
    }

    #[test]
    fn test_pending_reason_is_kept() {
        let mut session = session_with(&["Subject: hi"]);
        session.set_reject_reason("550 earlier");
        apply(
            &mut session,
            &ScanOutcome::Verdict(verdict(Action::Greylist)),
            &RejectReplies::default(),
        );
        assert_eq!(session.reject_reason(), Some("550 earlier"));
    }

    #[test]
    fn test_signature_overwrites_existing() {
        let mut session = session_with(&["DKIM-Signature: old", "Subject: hi", "", "hello"]);
        let mut v = verdict(Action::NoAction);
        v.signatures = vec!["v=1; d=example.com".to_string(), "v=1; d=other.com".to_string()];
        apply(&mut session, &ScanOutcome::Verdict(v), &RejectReplies::default());

        let message = session.message.as_ref().unwrap();
        let signatures = message
            .headers()
            .iter()
            .filter(|h| h.name() == SIGNATURE_HEADER);
        assert_eq!(signatures.count(), 2);
        assert_eq!(
            message.header(SIGNATURE_HEADER).as_deref(),
            Some("v=1; d=example.com")
        );
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(1.0), "1.0");
        assert_eq!(format_score(-0.5), "-0.5");
        assert_eq!(format_score(15.0), "15.0");
        assert_eq!(format_score(3.25), "3.25");
    }
}
