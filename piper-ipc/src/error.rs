//! IPC error types

use thiserror::Error;

/// A command line that could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Nothing but whitespace on the line
    #[error("Empty command line")]
    Empty,

    /// First token is not a known tag
    #[error("Unknown command tag: {0}")]
    UnknownTag(String),

    /// Known tag, wrong shape
    #[error("Malformed {tag} command: {reason}")]
    Malformed {
        tag: String,
        /// Job id, when the line got far enough to carry one
        job_id: Option<String>,
        reason: String,
    },
}

impl ProtocolError {
    pub(crate) fn malformed(tag: &str, job_id: Option<&str>, reason: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            tag: tag.to_string(),
            job_id: job_id.map(str::to_string),
            reason: reason.into(),
        }
    }

    /// Job id of the offending task line, if one was readable
    pub fn job_id(&self) -> Option<&str> {
        match self {
            ProtocolError::Malformed { job_id, .. } => job_id.as_deref(),
            _ => None,
        }
    }
}

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Peer went away for good
    #[error("Connection closed")]
    ConnectionClosed,

    /// Line could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Pipe path was never configured
    #[error("Pipe not configured: {0}")]
    NotConfigured(&'static str),
}

impl IpcError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, IpcError::IoError(_))
    }

    /// Check if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, IpcError::ConnectionClosed | IpcError::NotConfigured(_))
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(IpcError::IoError("broken pipe".to_string()).is_retryable());
        assert!(!IpcError::ConnectionClosed.is_retryable());
        assert!(!IpcError::Protocol(ProtocolError::Empty).is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(IpcError::ConnectionClosed.is_fatal());
        assert!(IpcError::NotConfigured("output").is_fatal());
        assert!(!IpcError::IoError("interrupted".to_string()).is_fatal());
    }

    #[test]
    fn test_job_id_only_on_malformed() {
        let err = ProtocolError::malformed("EXECUTE_TASK", Some("12"), "short line");
        assert_eq!(err.job_id(), Some("12"));
        assert_eq!(ProtocolError::UnknownTag("FOO".into()).job_id(), None);
    }
}
