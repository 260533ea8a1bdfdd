//! Core abstractions for remote shell session management.
//!
//! This crate provides the fundamental building blocks:
//! - `Session` / `Command` records and their status machines
//! - `SessionConfig` - Connection parameters with validation
//! - `ShellError` - Caller-facing error kinds
//! - `Transport` - The collaborator that carries session traffic
//! - `EventLog` - Broadcast + history for observers

pub mod config;
pub mod error;
pub mod event_log;
pub mod traits;
pub mod types;

pub use config::{AuthType, Secret, SessionConfig};
pub use error::ShellError;
pub use event_log::{EventLog, ShellEvent};
pub use traits::{CommandEvent, CommandStream, Transport, TransportError, TransportNotice};
pub use types::{Command, CommandId, CommandStatus, Session, SessionId, SessionStatus};
