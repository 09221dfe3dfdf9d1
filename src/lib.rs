pub mod config;
pub mod error;
pub mod filter;
pub mod message;
pub mod protocol;
pub mod replay;
pub mod rspamd;
pub mod session;
pub mod smtpd;
pub mod verdict;

pub use config::Config;
pub use error::FilterError;
pub use filter::Filter;
pub use message::Message;
pub use rspamd::{RspamdClient, Scanner};
pub use session::{Session, SessionStore};
pub use smtpd::Smtpd;
pub use verdict::{ScanOutcome, Verdict};
