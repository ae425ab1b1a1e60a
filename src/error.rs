//! Session error taxonomy.

use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Errors surfaced by session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Transport unreachable, rejected, or connect timed out.
    Connect(String),
    /// Missing or rejected credential.
    Auth(String),
    /// Explicit `error` message from the server.
    Server(String),
    /// Malformed or unparseable message.
    Protocol(String),
    /// Operation invoked in the wrong state.
    Precondition(String),
    /// A send on an established transport failed.
    Transport(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "Connect error: {msg}"),
            Self::Auth(msg) => write!(f, "Auth error: {msg}"),
            Self::Server(msg) => write!(f, "Server error: {msg}"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Precondition(msg) => write!(f, "Precondition failed: {msg}"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionFailed(msg) => Self::Connect(msg),
            TransportError::Timeout => Self::Connect("connect timed out".to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_category() {
        assert_eq!(
            SessionError::Auth("No API key configured".into()).to_string(),
            "Auth error: No API key configured"
        );
        assert!(SessionError::Precondition("no session".into())
            .to_string()
            .starts_with("Precondition failed"));
    }

    #[test]
    fn test_transport_errors_map_to_connect_or_transport() {
        assert_eq!(
            SessionError::from(TransportError::Timeout),
            SessionError::Connect("connect timed out".into())
        );
        assert!(matches!(
            SessionError::from(TransportError::SendFailed("x".into())),
            SessionError::Transport(_)
        ));
        assert!(matches!(
            SessionError::from(TransportError::ConnectionFailed("refused".into())),
            SessionError::Connect(_)
        ));
    }
}
