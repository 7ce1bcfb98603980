//! Server-level errors.

use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;

/// Errors from the listener and individual connections.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not be bound; fatal at startup.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ServerError {
    /// Whether the error only means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ServerError::WebSocket(
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
            ) => true,
            ServerError::WebSocket(tungstenite::Error::Io(e)) | ServerError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_message() {
        let err = ServerError::Bind {
            addr: "localhost:1".into(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "Failed to bind localhost:1: in use");
        assert!(!err.is_disconnect());
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(ServerError::WebSocket(tungstenite::Error::ConnectionClosed).is_disconnect());
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(ServerError::Io(reset).is_disconnect());
        assert!(!ServerError::Protocol(ProtocolError::TextFrame).is_disconnect());
    }
}
