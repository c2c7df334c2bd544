//! Error types for the chat exchange manager

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of the underlying call, before or while the response is read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The backend answered with a non-success status code
    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never produced a response (connect failure, reset, timeout)
    #[error("network failure: {cause}")]
    Network { cause: String },
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let cause = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else {
            err.to_string()
        };
        TransportError::Network { cause }
    }
}

/// Main error type for the exchange manager
#[derive(Error, Debug)]
pub enum Error {
    /// Another exchange already holds the lease for this conversation
    #[error("conversation {0} already has an exchange in flight")]
    Busy(String),

    /// Network or status failure from the transport
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Successful response whose body could not be understood
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backend reported a failure through an `error` frame
    #[error("server reported an error: {0}")]
    Server(String),

    /// The exchange was stopped by the caller
    #[error("exchange cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.into())
    }
}

impl Error {
    /// Create a busy error for a conversation
    pub fn busy(conversation_id: impl Into<String>) -> Self {
        Error::Busy(conversation_id.into())
    }

    /// Create a status transport error
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Error::Transport(TransportError::Status {
            status,
            body: body.into(),
        })
    }

    /// Create a network transport error
    pub fn network(cause: impl Into<String>) -> Self {
        Error::Transport(TransportError::Network {
            cause: cause.into(),
        })
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a server-reported error
    pub fn server(detail: impl Into<String>) -> Self {
        Error::Server(detail.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// True when the caller stopped the exchange.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True for failures that are safe to resubmit as the same query.
    ///
    /// `Busy` is excluded: it is recovered by waiting for the current
    /// exchange, not by counting a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Protocol(_) | Error::Server(_)
        )
    }

    /// Human-readable summary used as the text of a failed turn.
    ///
    /// Status errors whose body is a JSON object with a `message` string show
    /// that message, which is how the backend reports its own failures.
    pub fn summary(&self) -> String {
        match self {
            Error::Transport(TransportError::Status { status, body }) => {
                match backend_message(body) {
                    Some(message) => message,
                    None if body.trim().is_empty() => format!("Request failed with status {}", status),
                    None => format!("Request failed with status {}: {}", status, body.trim()),
                }
            }
            Error::Transport(TransportError::Network { cause }) => cause.clone(),
            Error::Protocol(msg) | Error::Server(msg) => msg.clone(),
            Error::Cancelled => "Response generation was cancelled.".to_string(),
            other => other.to_string(),
        }
    }
}

fn backend_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .and_then(|m| m.as_str())
        .filter(|m| !m.trim().is_empty())
        .map(|m| m.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_busy() {
        let err = Error::busy("conv-1");
        assert!(matches!(err, Error::Busy(_)));
        assert_eq!(
            err.to_string(),
            "conversation conv-1 already has an exchange in flight"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_status() {
        let err = Error::status(500, "boom");
        assert!(matches!(
            err,
            Error::Transport(TransportError::Status { status: 500, .. })
        ));
        assert_eq!(
            err.to_string(),
            "transport error: server returned status 500: boom"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_network() {
        let err = Error::network("connection reset");
        assert_eq!(
            err.to_string(),
            "transport error: network failure: connection reset"
        );
        assert_eq!(err.summary(), "connection reset");
    }

    #[test]
    fn test_error_protocol() {
        let err = Error::protocol("empty reply");
        assert_eq!(err.to_string(), "protocol error: empty reply");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_server() {
        let err = Error::server("model overloaded");
        assert_eq!(err.to_string(), "server reported an error: model overloaded");
        assert_eq!(err.summary(), "model overloaded");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        let err = Error::Cancelled;
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
        assert_eq!(err.summary(), "Response generation was cancelled.");
    }

    #[test]
    fn test_summary_prefers_backend_message() {
        let err = Error::status(
            503,
            r#"{"message":"Failed to get response from AI service.","reply":{}}"#,
        );
        assert_eq!(err.summary(), "Failed to get response from AI service.");
    }

    #[test]
    fn test_summary_falls_back_to_status_and_body() {
        let err = Error::status(502, "Bad Gateway\n");
        assert_eq!(err.summary(), "Request failed with status 502: Bad Gateway");

        let err = Error::status(500, "");
        assert_eq!(err.summary(), "Request failed with status 500");
    }

    #[test]
    fn test_malformed_json_reply_is_protocol_error() {
        let err = crate::types::ReplyEnvelope::parse("invalid json").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.is_retryable());
        assert!(matches!(
            crate::decoder::parse_record("{invalid"),
            Err(Error::Protocol(_))
        ));
    }
}
