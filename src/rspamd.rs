use crate::config::Config;
use crate::message::Message;
use crate::protocol::{encode_line, from_utf8_text};
use crate::session::Control;
use crate::verdict::{Action, ScanOutcome, Verdict};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const CHECK_PATH: &str = "checkv2";

/// Anything that can classify a reassembled message.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Never fails: an unusable answer is reported as [`ScanOutcome::NoVerdict`].
    async fn scan(&self, control: &Control, message: &Message) -> ScanOutcome;
}

/// Client for the Rspamd `/checkv2` endpoint.
pub struct RspamdClient {
    client: Client,
    endpoint: Url,
}

#[derive(Debug, Deserialize)]
struct RspamdReply {
    action: Action,
    score: f64,
    required_score: f64,
    #[serde(default)]
    symbols: Symbols,
    #[serde(default)]
    subject: Option<String>,
    #[serde(rename = "dkim-signature", default)]
    dkim_signature: Option<Signatures>,
}

/// Rspamd reports symbols as an object keyed by name; a plain list is
/// accepted as well.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Symbols {
    Names(Vec<String>),
    Detailed(serde_json::Map<String, serde_json::Value>),
}

impl Default for Symbols {
    fn default() -> Self {
        Symbols::Names(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Signatures {
    One(String),
    Many(Vec<String>),
}

impl RspamdReply {
    fn into_verdict(self) -> anyhow::Result<Verdict> {
        if self.action == Action::RewriteSubject && self.subject.is_none() {
            anyhow::bail!("'rewrite subject' verdict without a subject");
        }

        let symbols: Vec<String> = match self.symbols {
            Symbols::Names(names) => names,
            Symbols::Detailed(map) => map.into_iter().map(|(name, _)| name).collect(),
        };
        let signatures = match self.dkim_signature {
            None => Vec::new(),
            Some(Signatures::One(sig)) => vec![sig],
            Some(Signatures::Many(sigs)) => sigs,
        };

        // the message lines hold raw bytes, bring the reply text in line
        Ok(Verdict {
            action: self.action,
            score: self.score,
            required_score: self.required_score,
            symbols: symbols.iter().map(|s| from_utf8_text(s)).collect(),
            subject: self.subject.as_deref().map(from_utf8_text),
            signatures: signatures.iter().map(|s| from_utf8_text(s)).collect(),
        })
    }
}

impl RspamdClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut builder = Client::builder().user_agent(config.user_agent.clone());
        if let Some(seconds) = config.timeout_seconds {
            builder = builder.timeout(Duration::from_secs(seconds));
        }
        let client = builder.build()?;

        let mut base = Url::parse(&config.rspamd_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join(CHECK_PATH)?;

        Ok(RspamdClient { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request_headers(control: &Control) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (key, value) in control.iter() {
            let name = match HeaderName::from_bytes(key.as_str().as_bytes()) {
                Ok(name) => name,
                Err(e) => {
                    log::warn!("Skipping control key {key}: {e}");
                    continue;
                }
            };
            match HeaderValue::from_bytes(&encode_line(value)) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(e) => log::warn!("Skipping control {key}={value:?}: {e}"),
            }
        }
        headers
    }

    async fn check(&self, control: &Control, message: &Message) -> anyhow::Result<Verdict> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(Self::request_headers(control))
            .body(encode_line(&message.to_scan_text()))
            .send()
            .await?
            .error_for_status()?;

        let reply: RspamdReply = response.json().await?;
        reply.into_verdict()
    }
}

#[async_trait]
impl Scanner for RspamdClient {
    async fn scan(&self, control: &Control, message: &Message) -> ScanOutcome {
        match self.check(control, message).await {
            Ok(verdict) => {
                log::info!(
                    "Rspamd verdict: {} ({} / {}) [{}]",
                    verdict.action,
                    verdict.score,
                    verdict.required_score,
                    verdict.symbols.join(", ")
                );
                ScanOutcome::Verdict(verdict)
            }
            Err(e) => {
                log::warn!("Rspamd scan failed, passing message unmodified: {e}");
                ScanOutcome::NoVerdict
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ControlKey;
    use serde_json::json;
    use wiremock::matchers::{body_bytes, body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(url: &str) -> RspamdClient {
        let config = Config {
            rspamd_url: url.to_string(),
            timeout_seconds: Some(5),
            ..Default::default()
        };
        RspamdClient::new(&config).unwrap()
    }

    fn message() -> Message {
        Message::parse(&["Subject: hi", "", "hello"])
    }

    fn verdict(outcome: ScanOutcome) -> Verdict {
        match outcome {
            ScanOutcome::Verdict(verdict) => verdict,
            ScanOutcome::NoVerdict => panic!("Expected a verdict"),
        }
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            client_for("http://localhost:11333").endpoint().as_str(),
            "http://localhost:11333/checkv2"
        );
        assert_eq!(
            client_for("http://scanner.local/rspamd").endpoint().as_str(),
            "http://scanner.local/rspamd/checkv2"
        );
    }

    #[tokio::test]
    async fn test_sends_control_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkv2"))
            .and(header("Helo", "example.com"))
            .and(header("Queue-Id", "1ef1c203"))
            .and(header("Pass", "all"))
            .and(body_string("Subject: hi\n\nhello\n"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "action": "add header",
                "score": 1.0,
                "required_score": 5.0,
                "symbols": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut control = Control::default();
        control.set(ControlKey::Helo, "example.com");
        control.set(ControlKey::QueueId, "1ef1c203");
        control.set(ControlKey::Pass, "all");

        let v = verdict(client_for(&server.uri()).scan(&control, &message()).await);
        assert_eq!(v.action, Action::AddHeader);
        assert_eq!(v.score, 1.0);
        assert_eq!(v.required_score, 5.0);
        assert!(v.symbols.is_empty());
        assert!(v.signatures.is_empty());
    }

    #[tokio::test]
    async fn test_eight_bit_message_is_sent_as_received() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkv2"))
            .and(body_bytes(b"Subject: caf\xe9\n\n\xc3\xa9t\xc3\xa9\n".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "action": "rewrite subject",
                "score": 9.0,
                "required_score": 15.0,
                "subject": "*** SPAM *** été"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let raw: [&[u8]; 3] = [b"Subject: caf\xe9", b"", b"\xc3\xa9t\xc3\xa9"];
        let lines = raw.map(crate::protocol::decode_line);
        let message = Message::parse(&lines);

        let v = verdict(
            client_for(&server.uri())
                .scan(&Control::default(), &message)
                .await,
        );
        let subject = v.subject.unwrap();
        assert_eq!(encode_line(&subject), "*** SPAM *** été".as_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_symbol_object_keeps_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkv2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "is_skipped": false,
                "action": "rewrite subject",
                "score": 7.5,
                "required_score": 15.0,
                "subject": "*** SPAM *** hi",
                "symbols": {
                    "R_SPF_FAIL": {"name": "R_SPF_FAIL", "score": 1.0},
                    "BAYES_SPAM": {"name": "BAYES_SPAM", "score": 5.1}
                },
                "dkim-signature": "v=1; a=rsa-sha256; d=example.com"
            })))
            .mount(&server)
            .await;

        let v = verdict(
            client_for(&server.uri())
                .scan(&Control::default(), &message())
                .await,
        );
        assert_eq!(v.action, Action::RewriteSubject);
        assert_eq!(v.subject.as_deref(), Some("*** SPAM *** hi"));
        assert_eq!(v.symbols, vec!["R_SPF_FAIL", "BAYES_SPAM"]);
        assert_eq!(v.signatures, vec!["v=1; a=rsa-sha256; d=example.com"]);
    }

    #[tokio::test]
    async fn test_server_error_is_no_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let outcome = client_for(&server.uri())
            .scan(&Control::default(), &message())
            .await;
        assert_eq!(outcome, ScanOutcome::NoVerdict);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_no_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let outcome = client_for(&server.uri())
            .scan(&Control::default(), &message())
            .await;
        assert_eq!(outcome, ScanOutcome::NoVerdict);
    }

    #[tokio::test]
    async fn test_incomplete_verdict_is_no_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "action": "rewrite subject",
                "score": 9.0,
                "required_score": 15.0,
                "symbols": []
            })))
            .mount(&server)
            .await;

        let outcome = client_for(&server.uri())
            .scan(&Control::default(), &message())
            .await;
        assert_eq!(outcome, ScanOutcome::NoVerdict);
    }

    #[tokio::test]
    async fn test_unknown_action_is_no_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "action": "quarantine",
                "score": 9.0,
                "required_score": 15.0,
                "symbols": []
            })))
            .mount(&server)
            .await;

        let outcome = client_for(&server.uri())
            .scan(&Control::default(), &message())
            .await;
        assert_eq!(outcome, ScanOutcome::NoVerdict);
    }

    #[tokio::test]
    async fn test_connection_refused_is_no_verdict() {
        let uri = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            format!("http://{}", listener.local_addr().unwrap())
        };

        let outcome = client_for(&uri).scan(&Control::default(), &message()).await;
        assert_eq!(outcome, ScanOutcome::NoVerdict);
    }
}
