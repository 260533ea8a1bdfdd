//! Transport collaborator contract.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{SessionConfig, types::SessionId};

/// Event produced by the transport while a command runs.
///
/// A well-behaved stream yields any number of `Output` items followed by
/// exactly one `Exit` or `Fault`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CommandEvent {
    /// Output fragment, in arrival order.
    Output(String),
    /// Command finished with an exit code.
    Exit(i32),
    /// Command failed at the protocol level.
    Fault(String),
}

/// Stream of events for one dispatched command.
pub type CommandStream = BoxStream<'static, CommandEvent>;

/// Unsolicited notification from the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportNotice {
    /// The remote side ended the session. `None` means a clean close.
    SessionTerminated {
        session_id: SessionId,
        reason: Option<String>,
    },
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Disconnect failed: {0}")]
    Disconnect(String),
    #[error("Dispatch failed: {0}")]
    Dispatch(String),
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for the component that carries session traffic.
///
/// The session id is the handle the transport keys its connections by.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection for a session.
    async fn connect(
        &self,
        session_id: SessionId,
        config: &SessionConfig,
    ) -> Result<(), TransportError>;

    /// Tear a connection down. Must be idempotent.
    async fn disconnect(&self, session_id: SessionId) -> Result<(), TransportError>;

    /// Hand a command to the remote shell.
    ///
    /// Returning `Ok` acknowledges the dispatch.
    async fn dispatch(
        &self,
        session_id: SessionId,
        command: &str,
    ) -> Result<CommandStream, TransportError>;

    /// Subscribe to unsolicited notices.
    fn notices(&self) -> broadcast::Receiver<TransportNotice>;
}
