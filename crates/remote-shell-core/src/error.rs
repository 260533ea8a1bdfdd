//! Caller-facing error kinds.

use thiserror::Error;

use crate::{traits::TransportError, types::SessionId};

/// Error surfaced by registry and executor operations.
///
/// Transport-originated variants are also recorded on the affected
/// session or command as text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShellError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Session not connected: {0}")]
    SessionNotConnected(SessionId),
    #[error("Command text is empty")]
    EmptyCommand,
    #[error("Transport failure: {0}")]
    TransportFailure(String),
    #[error("Protocol fault: {0}")]
    ProtocolFault(String),
    #[error("Session terminated: {0}")]
    SessionTerminated(String),
}

impl From<TransportError> for ShellError {
    fn from(err: TransportError) -> Self {
        Self::TransportFailure(err.to_string())
    }
}
