use thiserror::Error;

/// Failures raised while processing events from smtpd.
///
/// None of these are fatal to the process: the dispatcher logs them and
/// answers gating events with a fallback action so smtpd never stalls.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("no such session: {0}")]
    UnknownSession(String),

    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

pub type Result<T> = std::result::Result<T, FilterError>;
