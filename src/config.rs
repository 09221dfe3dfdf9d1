use crate::verdict::Action;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/filter-rspamd.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the Rspamd normal worker.
    #[serde(default = "default_rspamd_url")]
    pub rspamd_url: String,
    /// Request timeout. The HTTP client's own default applies when unset.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub reject_replies: RejectReplies,
}

/// SMTP replies given at commit for the actions that refuse a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectReplies {
    #[serde(default = "default_reject")]
    pub reject: String,
    #[serde(default = "default_greylist")]
    pub greylist: String,
    #[serde(default = "default_soft_reject")]
    pub soft_reject: String,
}

fn default_rspamd_url() -> String {
    "http://localhost:11333".to_string()
}

fn default_user_agent() -> String {
    format!("filter-rspamd/{}", env!("CARGO_PKG_VERSION"))
}

fn default_reject() -> String {
    "550 message rejected".to_string()
}

fn default_greylist() -> String {
    "421 greylisted".to_string()
}

fn default_soft_reject() -> String {
    "451 try again later".to_string()
}

impl Default for RejectReplies {
    fn default() -> Self {
        RejectReplies {
            reject: default_reject(),
            greylist: default_greylist(),
            soft_reject: default_soft_reject(),
        }
    }
}

impl RejectReplies {
    pub fn for_action(&self, action: Action) -> Option<&str> {
        match action {
            Action::Reject => Some(&self.reject),
            Action::Greylist => Some(&self.greylist),
            Action::SoftReject => Some(&self.soft_reject),
            Action::NoAction | Action::AddHeader | Action::RewriteSubject => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rspamd_url: default_rspamd_url(),
            timeout_seconds: None,
            user_agent: default_user_agent(),
            reject_replies: RejectReplies::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.rspamd_url)
            .map_err(|e| anyhow::anyhow!("invalid rspamd_url '{}': {e}", self.rspamd_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("rspamd_url must be http or https: {}", self.rspamd_url);
        }

        let reply = Regex::new(r"^[45][0-9]{2}( |$)")?;
        for (name, text) in [
            ("reject", &self.reject_replies.reject),
            ("greylist", &self.reject_replies.greylist),
            ("soft_reject", &self.reject_replies.soft_reject),
        ] {
            if !reply.is_match(text) || !text.is_ascii() || text.contains(['\r', '\n']) {
                anyhow::bail!("reject_replies.{name} must be a 4xx/5xx SMTP reply: {text:?}");
            }
        }
        Ok(())
    }
}
