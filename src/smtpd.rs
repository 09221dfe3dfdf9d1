use crate::config::Config;
use crate::filter::Filter;
use crate::protocol::{decode_line, encode_line, registrations, Input};
use crate::rspamd::RspamdClient;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const SUBSYSTEM: &str = "smtp-in";

/// The filter process as smtpd sees it: events in on one stream,
/// registrations and responses out on the other.
pub struct Smtpd {
    filter: Filter,
}

impl Smtpd {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let scanner = RspamdClient::new(config)?;
        log::info!("Scanning with Rspamd at {}", scanner.endpoint());
        Ok(Smtpd {
            filter: Filter::new(Box::new(scanner), config.reject_replies.clone()),
        })
    }

    pub fn with_filter(filter: Filter) -> Self {
        Smtpd { filter }
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Process events until smtpd closes the input stream.
    pub async fn run<R, W>(&mut self, mut input: R, mut output: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut raw = Vec::new();

        loop {
            raw.clear();
            if input.read_until(b'\n', &mut raw).await? == 0 {
                break;
            }
            let bytes = raw.strip_suffix(b"\n").unwrap_or(&raw[..]);
            let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
            let line = decode_line(bytes);

            let event = match line.parse::<Input>() {
                Ok(Input::Config { key, value }) => {
                    if key == "ready" {
                        for registration in registrations() {
                            output.write_all(registration.as_bytes()).await?;
                            output.write_all(b"\n").await?;
                        }
                        output.flush().await?;
                        log::info!("Registered with smtpd");
                    } else {
                        log::debug!("config {key}={value}");
                    }
                    continue;
                }
                Ok(Input::Event(event)) => event,
                Err(e) => {
                    log::warn!("Ignoring line from smtpd: {e}");
                    continue;
                }
            };

            if event.subsystem != SUBSYSTEM {
                log::debug!("Ignoring {} event from {}", event.raw_name, event.subsystem);
                continue;
            }

            let responses = self.filter.handle(&event).await;
            if responses.is_empty() {
                continue;
            }
            let mut buf = Vec::new();
            for response in &responses {
                buf.extend_from_slice(&encode_line(&response.to_string()));
                buf.push(b'\n');
            }
            output.write_all(&buf).await?;
            output.flush().await?;
        }

        log::info!("smtpd closed the filter stream, exiting");
        Ok(())
    }
}
