use derive_more::Display;

use crate::result_code::ResultCode;

/// Failure kinds a command or a call can end with.
///
/// Every kind surfaces to the DTE as one result code, see
/// [`ModemError::result_code`]. The payload is kept for the log only.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ModemError {
    #[display("malformed command: {reason}")]
    Parse { reason: String },
    #[display("unsupported argument: {reason}")]
    Unsupported { reason: String },
    #[display("invalid in current state: {reason}")]
    State { reason: String },
    #[display("dial timed out: {target}")]
    DialTimeout { target: String },
    #[display("dial failed: {reason}")]
    DialFailed { reason: String },
    #[display("i/o error: {reason}")]
    Io { reason: String },
    #[display("transient network error: {reason}")]
    NetTransient { reason: String },
    #[display("network error: {reason}")]
    NetFatal { reason: String },
    #[display("cannot persist settings: {reason}")]
    ConfigPersist { reason: String },
}

impl std::error::Error for ModemError {}

impl ModemError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    pub fn state(reason: impl Into<String>) -> Self {
        Self::State {
            reason: reason.into(),
        }
    }

    pub fn dial_failed(reason: impl Into<String>) -> Self {
        Self::DialFailed {
            reason: reason.into(),
        }
    }

    pub fn net_fatal(reason: impl Into<String>) -> Self {
        Self::NetFatal {
            reason: reason.into(),
        }
    }

    /// The code the DTE sees when a command ends with this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            ModemError::DialTimeout { .. } => ResultCode::NoAnswer,
            ModemError::DialFailed { .. } => ResultCode::Busy,
            ModemError::NetFatal { .. } => ResultCode::NoCarrier,
            _ => ResultCode::Error,
        }
    }
}

impl From<std::io::Error> for ModemError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

/// Coerce any other failure into the taxonomy. It reports as ERROR.
impl From<anyhow::Error> for ModemError {
    fn from(err: anyhow::Error) -> Self {
        Self::Io {
            reason: format!("{err:#}"),
        }
    }
}
