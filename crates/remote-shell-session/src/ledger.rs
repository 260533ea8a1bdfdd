//! In-memory ledger of sessions and commands.
//!
//! Every mutation happens under the single registry mutex and publishes its
//! event before the lock is released, so observers see commit order.

use std::{collections::HashMap, sync::Arc};

use remote_shell_core::{
    Command, CommandId, EventLog, Session, SessionId, SessionStatus, ShellError, ShellEvent,
};
use tokio::sync::{Mutex, watch};

/// Bookkeeping kept next to each session record.
pub(crate) struct SessionEntry {
    session: Session,
    /// Serializes create/disconnect/remove for this id.
    lane: Arc<Mutex<()>>,
    /// Flips to `true` once the session is terminal; dropped on removal.
    closed: watch::Sender<bool>,
    /// Ticket currently allowed to dispatch.
    dispatch_turn: Arc<watch::Sender<u64>>,
    next_ticket: u64,
}

/// A command accepted for dispatch.
pub(crate) struct Accepted {
    pub(crate) command: Command,
    pub(crate) ticket: u64,
    pub(crate) turn: watch::Receiver<u64>,
    pub(crate) turn_tx: Arc<watch::Sender<u64>>,
    pub(crate) closed: watch::Receiver<bool>,
}

pub(crate) struct Ledger {
    sessions: HashMap<SessionId, SessionEntry>,
    order: Vec<SessionId>,
    commands: HashMap<CommandId, Command>,
    history: HashMap<SessionId, Vec<CommandId>>,
    active: Option<SessionId>,
    last_error: Option<String>,
    events: Arc<EventLog>,
}

impl Ledger {
    pub(crate) fn new(events: Arc<EventLog>) -> Self {
        Self {
            sessions: HashMap::new(),
            order: Vec::new(),
            commands: HashMap::new(),
            history: HashMap::new(),
            active: None,
            last_error: None,
            events,
        }
    }

    pub(crate) fn insert_session(&mut self, session: Session, lane: Arc<Mutex<()>>) {
        let id = session.id;
        let status = session.status.clone();
        let (closed, _) = watch::channel(false);
        let (dispatch_turn, _) = watch::channel(0);

        self.sessions.insert(
            id,
            SessionEntry {
                session,
                lane,
                closed,
                dispatch_turn: Arc::new(dispatch_turn),
                next_ticket: 0,
            },
        );
        self.order.push(id);
        self.history.insert(id, Vec::new());
        self.push_status(id, status);
    }

    pub(crate) fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id).map(|e| &e.session)
    }

    pub(crate) fn lane(&self, id: SessionId) -> Option<Arc<Mutex<()>>> {
        self.sessions.get(&id).map(|e| Arc::clone(&e.lane))
    }

    pub(crate) fn sessions(&self) -> Vec<Session> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .map(|e| e.session.clone())
            .collect()
    }

    pub(crate) fn connect_succeeded(&mut self, id: SessionId) -> bool {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return false;
        };
        if !entry.session.connect_succeeded() {
            return false;
        }
        self.push_status(id, SessionStatus::Connected);
        self.set_active_unchecked(Some(id));
        true
    }

    pub(crate) fn connect_failed(&mut self, id: SessionId, reason: &str) -> bool {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return false;
        };
        if !entry.session.connect_failed(reason) {
            return false;
        }
        entry.closed.send_replace(true);
        self.push_status(id, SessionStatus::Error(reason.to_string()));
        true
    }

    /// Remote-initiated end of a live session.
    pub(crate) fn terminate(&mut self, id: SessionId, reason: Option<String>) -> bool {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return false;
        };
        if !entry.session.terminated(reason.clone()) {
            return false;
        }
        let status = entry.session.status.clone();
        self.push_status(id, status);

        let cause = reason.unwrap_or_else(|| "closed by remote host".to_string());
        self.fail_live_commands(id, &ShellError::SessionTerminated(cause));
        if self.session(id).is_some_and(|s| s.status == SessionStatus::Disconnected) {
            self.clear_active_if(id);
        }
        self.signal_closed(id);
        true
    }

    /// Explicit close; a no-op for an already disconnected session.
    pub(crate) fn close(&mut self, id: SessionId) -> bool {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return false;
        };
        if !entry.session.close() {
            return false;
        }
        self.push_status(id, SessionStatus::Disconnected);
        self.fail_live_commands(id, &ShellError::SessionTerminated("session disconnected".into()));
        self.clear_active_if(id);
        self.signal_closed(id);
        true
    }

    /// Delete the session and cascade its command history.
    pub(crate) fn remove_session(&mut self, id: SessionId) -> bool {
        let Some(entry) = self.sessions.remove(&id) else {
            return false;
        };
        entry.closed.send_replace(true);
        self.order.retain(|s| *s != id);
        for command_id in self.history.remove(&id).unwrap_or_default() {
            self.commands.remove(&command_id);
        }
        self.clear_active_if(id);
        self.events.push(ShellEvent::SessionRemoved { session_id: id });
        true
    }

    pub(crate) const fn active(&self) -> Option<SessionId> {
        self.active
    }

    pub(crate) fn set_active(&mut self, id: SessionId) -> Result<(), ShellError> {
        if !self.sessions.contains_key(&id) {
            return Err(self.reject(ShellError::SessionNotFound(id)));
        }
        self.set_active_unchecked(Some(id));
        Ok(())
    }

    fn set_active_unchecked(&mut self, id: Option<SessionId>) {
        if self.active != id {
            self.active = id;
            self.events.push(ShellEvent::ActiveSession { session_id: id });
        }
    }

    fn clear_active_if(&mut self, id: SessionId) {
        if self.active == Some(id) {
            self.set_active_unchecked(None);
        }
    }

    fn signal_closed(&self, id: SessionId) {
        if let Some(entry) = self.sessions.get(&id) {
            entry.closed.send_replace(true);
        }
    }

    fn push_status(&self, session_id: SessionId, status: SessionStatus) {
        self.events
            .push(ShellEvent::SessionStatus { session_id, status });
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    pub(crate) fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    /// Record `err` as the last error and hand it back.
    pub(crate) fn reject(&mut self, err: ShellError) -> ShellError {
        self.last_error = Some(err.to_string());
        err
    }

    /// Validate the session and record a new `Pending` command.
    pub(crate) fn accept_command(
        &mut self,
        session_id: SessionId,
        text: &str,
    ) -> Result<Accepted, ShellError> {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return Err(self.reject(ShellError::SessionNotFound(session_id)));
        };
        if !entry.session.is_connected() {
            return Err(self.reject(ShellError::SessionNotConnected(session_id)));
        }
        if text.trim().is_empty() {
            return Err(self.reject(ShellError::EmptyCommand));
        }

        entry.session.touch();
        let ticket = entry.next_ticket;
        entry.next_ticket += 1;
        let turn_tx = Arc::clone(&entry.dispatch_turn);
        let turn = turn_tx.subscribe();
        let closed = entry.closed.subscribe();

        let command = Command::new(session_id, text);
        self.history
            .entry(session_id)
            .or_default()
            .push(command.id);
        self.commands.insert(command.id, command.clone());
        self.push_command_status(&command);

        Ok(Accepted {
            command,
            ticket,
            turn,
            turn_tx,
            closed,
        })
    }

    pub(crate) fn command(&self, id: CommandId) -> Option<&Command> {
        self.commands.get(&id)
    }

    pub(crate) fn commands_for(&self, session_id: SessionId) -> Vec<Command> {
        self.history
            .get(&session_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.commands.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn all_commands(&self) -> Vec<Command> {
        self.order
            .iter()
            .flat_map(|session_id| self.commands_for(*session_id))
            .collect()
    }

    pub(crate) fn clear_history(&mut self, session_id: SessionId) -> Result<usize, ShellError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(self.reject(ShellError::SessionNotFound(session_id)));
        }
        let ids = self
            .history
            .get_mut(&session_id)
            .map(std::mem::take)
            .unwrap_or_default();
        for id in &ids {
            self.commands.remove(id);
        }
        self.events
            .push(ShellEvent::HistoryCleared { session_id });
        Ok(ids.len())
    }

    pub(crate) fn session_connected(&self, session_id: SessionId) -> bool {
        self.session(session_id).is_some_and(Session::is_connected)
    }

    pub(crate) fn start_command(&mut self, id: CommandId) {
        if let Some(command) = self.commands.get_mut(&id) {
            if command.start() {
                let snapshot = command.clone();
                self.push_command_status(&snapshot);
            }
        }
    }

    pub(crate) fn append_output(&mut self, id: CommandId, fragment: &str) {
        if let Some(command) = self.commands.get_mut(&id) {
            if command.append_output(fragment) {
                self.events.push(ShellEvent::CommandOutput {
                    session_id: command.session_id,
                    command_id: id,
                    fragment: fragment.to_string(),
                });
            }
        }
    }

    pub(crate) fn complete_command(&mut self, id: CommandId, exit_code: i32) {
        if let Some(command) = self.commands.get_mut(&id) {
            if command.complete(exit_code) {
                let snapshot = command.clone();
                self.push_command_status(&snapshot);
            }
        }
    }

    pub(crate) fn fail_command(&mut self, id: CommandId, err: &ShellError) {
        let Some(command) = self.commands.get_mut(&id) else {
            return;
        };
        if !command.fail(err.to_string()) {
            return;
        }
        let snapshot = command.clone();
        self.last_error = Some(err.to_string());
        self.push_command_status(&snapshot);
    }

    /// Force every pending or running command of a session to `Error`.
    fn fail_live_commands(&mut self, session_id: SessionId, err: &ShellError) {
        let live: Vec<CommandId> = self
            .history
            .get(&session_id)
            .into_iter()
            .flatten()
            .filter(|id| self.commands.get(*id).is_some_and(|c| !c.is_terminal()))
            .copied()
            .collect();
        for id in live {
            self.fail_command(id, err);
        }
    }

    fn push_command_status(&self, command: &Command) {
        self.events.push(ShellEvent::CommandStatus {
            session_id: command.session_id,
            command_id: command.id,
            status: command.status.clone(),
        });
    }
}
