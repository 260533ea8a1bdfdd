//! Session and command records.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SessionConfig;

/// Session identifier.
pub type SessionId = Uuid;

/// Command identifier.
pub type CommandId = Uuid;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Connection status of a session.
///
/// The failure reason lives inside `Error`, so a reason exists exactly
/// when the status is `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for the transport to confirm the connection.
    Connecting,
    /// Ready to run commands.
    Connected,
    /// Closed by the caller or by the remote side.
    Disconnected,
    /// Connection failed or was lost.
    Error(String),
}

impl SessionStatus {
    /// Whether no further transition is possible (besides deletion).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error(_))
    }
}

/// A logical remote shell connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Connection parameters.
    pub config: SessionConfig,
    /// Current status.
    pub status: SessionStatus,
    /// Creation timestamp (Unix epoch millis).
    pub created_at: i64,
    /// Last command dispatch through this session.
    pub last_activity: i64,
}

impl Session {
    /// Create a session in `Connecting` status.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            config,
            status: SessionStatus::Connecting,
            created_at: now,
            last_activity: now,
        }
    }

    /// Last failure description, present only in `Error` status.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match &self.status {
            SessionStatus::Error(reason) => Some(reason),
            _ => None,
        }
    }

    /// Whether commands may be dispatched.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.status, SessionStatus::Connected)
    }

    /// `Connecting` -> `Connected`.
    pub fn connect_succeeded(&mut self) -> bool {
        self.transition_from_live(SessionStatus::Connected, true)
    }

    /// `Connecting` -> `Error`.
    pub fn connect_failed(&mut self, reason: impl Into<String>) -> bool {
        self.transition_from_live(SessionStatus::Error(reason.into()), true)
    }

    /// Remote termination: a reason means `Error`, none means `Disconnected`.
    pub fn terminated(&mut self, reason: Option<String>) -> bool {
        let next = reason.map_or(SessionStatus::Disconnected, SessionStatus::Error);
        self.transition_from_live(next, false)
    }

    /// Explicit close. Moves any status except `Disconnected` to `Disconnected`.
    pub fn close(&mut self) -> bool {
        if self.status == SessionStatus::Disconnected {
            return false;
        }
        self.status = SessionStatus::Disconnected;
        true
    }

    /// Record command activity.
    pub fn touch(&mut self) {
        self.last_activity = now_millis();
    }

    fn transition_from_live(&mut self, next: SessionStatus, only_connecting: bool) -> bool {
        let allowed = match self.status {
            SessionStatus::Connecting => true,
            SessionStatus::Connected => !only_connecting,
            SessionStatus::Disconnected | SessionStatus::Error(_) => false,
        };
        if allowed {
            self.status = next;
        }
        allowed
    }
}

/// Lifecycle status of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandStatus {
    /// Recorded, not yet handed to the transport.
    Pending,
    /// Dispatched; output may still arrive.
    Running,
    /// Finished with an exit code.
    Completed { exit_code: i32 },
    /// Failed before or while running.
    Error { reason: String },
}

impl CommandStatus {
    /// Whether the command has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

/// One execution request issued against a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Unique command identifier.
    pub id: CommandId,
    /// Owning session.
    pub session_id: SessionId,
    /// Literal command text.
    pub command: String,
    /// Current status.
    pub status: CommandStatus,
    /// Accumulated output in arrival order.
    pub output: String,
    /// Issue timestamp (Unix epoch millis).
    pub start_time: i64,
    /// Set once the command reaches a terminal status.
    pub end_time: Option<i64>,
}

impl Command {
    /// Create a `Pending` command.
    #[must_use]
    pub fn new(session_id: SessionId, command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            command: command.into(),
            status: CommandStatus::Pending,
            output: String::new(),
            start_time: now_millis(),
            end_time: None,
        }
    }

    /// Exit code, present only when `Completed`.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self.status {
            CommandStatus::Completed { exit_code } => Some(exit_code),
            _ => None,
        }
    }

    /// Failure description, present only in `Error` status.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match &self.status {
            CommandStatus::Error { reason } => Some(reason),
            _ => None,
        }
    }

    /// Whether the command has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `Pending` -> `Running`.
    pub fn start(&mut self) -> bool {
        if self.status != CommandStatus::Pending {
            return false;
        }
        self.status = CommandStatus::Running;
        true
    }

    /// Append an output fragment. Ignored unless `Running`.
    pub fn append_output(&mut self, fragment: &str) -> bool {
        if self.status != CommandStatus::Running {
            return false;
        }
        self.output.push_str(fragment);
        true
    }

    /// `Running` -> `Completed`.
    pub fn complete(&mut self, exit_code: i32) -> bool {
        if self.status != CommandStatus::Running {
            return false;
        }
        self.finish(CommandStatus::Completed { exit_code });
        true
    }

    /// `Pending` or `Running` -> `Error`.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.finish(CommandStatus::Error {
            reason: reason.into(),
        });
        true
    }

    fn finish(&mut self, status: CommandStatus) {
        self.status = status;
        self.end_time = Some(now_millis());
    }
}
