use std::{error::Error, fmt, sync::Arc};
use thiserror::Error;

pub type StreamResult<T> = Result<T, StreamError>;

/// Error type shared by both stream sides.
///
/// Stream-fatal errors (`Aborted`, `Other`, ...) are stored once on the owning
/// stream and replayed to every later consumer of its futures. Usage errors
/// (`LockContended`, `InvalidUsage`) are returned synchronously from the
/// offending call and never stored on the stream.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The stream was canceled by its reader.
    #[error("stream canceled")]
    Canceled,
    /// The stream was aborted by its writer.
    #[error("{}", match .0 { Some(reason) => format!("stream aborted: {reason}"), None => "stream aborted".to_string() })]
    Aborted(Option<String>),
    /// A close has been requested; no further writes are accepted.
    #[error("stream is closing")]
    Closing,
    /// The stream is closed.
    #[error("stream is closed")]
    Closed,
    /// The driver task was dropped before the operation completed.
    #[error("stream task dropped")]
    TaskDropped,
    /// A second reader or writer was attached while one was active.
    #[error("stream already locked")]
    LockContended,
    /// Protocol violation, surfaced to the offending caller only.
    #[error("invalid stream usage: {0}")]
    InvalidUsage(&'static str),
    /// Application-level error from a source, sink, or size function.
    #[error("{0}")]
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap any error type into `StreamError`.
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// True for errors that report misuse of the API rather than a failed
    /// stream.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            StreamError::LockContended | StreamError::InvalidUsage(_)
        )
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        #[derive(Debug)]
        struct Message(String);
        impl fmt::Display for Message {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl Error for Message {}
        StreamError::Other(Arc::new(Message(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::from(s.as_str())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_abort_reason_when_present() {
        assert_eq!(
            StreamError::Aborted(Some("disk full".into())).to_string(),
            "stream aborted: disk full"
        );
        assert_eq!(StreamError::Aborted(None).to_string(), "stream aborted");
    }

    #[test]
    fn classifies_usage_errors() {
        assert!(StreamError::LockContended.is_usage_error());
        assert!(StreamError::InvalidUsage("x").is_usage_error());
        assert!(!StreamError::Closed.is_usage_error());
        assert!(!StreamError::from("boom").is_usage_error());
    }

    #[test]
    fn wraps_io_errors() {
        let e: StreamError = std::io::Error::new(std::io::ErrorKind::Other, "io down").into();
        assert_eq!(e.to_string(), "io down");
    }
}
