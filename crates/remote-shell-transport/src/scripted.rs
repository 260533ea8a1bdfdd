//! Programmable in-memory transport.
//!
//! Useful for tests and demos: connections, command results and remote
//! terminations are all driven by the caller.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::StreamExt;
use remote_shell_core::{
    CommandEvent, CommandStream, SessionConfig, SessionId, Transport, TransportError,
    TransportNotice,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
struct ScriptState {
    connect_failures: HashMap<String, String>,
    connect_gates: HashMap<String, watch::Receiver<bool>>,
    disconnect_failure: Option<String>,
    disconnect_gate: Option<watch::Receiver<bool>>,
    dispatch_gates: HashMap<String, watch::Receiver<bool>>,
    scripts: HashMap<String, Vec<CommandEvent>>,
    held: HashMap<String, VecDeque<mpsc::UnboundedReceiver<CommandEvent>>>,
    dispatch_failures: HashMap<String, String>,
    connected: HashSet<SessionId>,
    dispatched: Vec<(SessionId, String)>,
    disconnects: Vec<SessionId>,
}

/// Transport whose behavior is scripted by the caller.
///
/// Unscripted commands echo their text followed by a newline and exit 0.
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
    notices: broadcast::Sender<TransportNotice>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    /// Create a transport where every connect succeeds.
    #[must_use]
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(ScriptState::default()),
            notices,
        }
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make connects to `host` fail.
    pub fn fail_connect(&self, host: impl Into<String>, reason: impl Into<String>) {
        self.state()
            .connect_failures
            .insert(host.into(), reason.into());
    }

    /// Hold connects to `host` until the returned gate is opened.
    #[must_use]
    pub fn gate_connect(&self, host: impl Into<String>) -> Gate {
        let (tx, rx) = watch::channel(false);
        self.state().connect_gates.insert(host.into(), rx);
        Gate(tx)
    }

    /// Hold every disconnect until the returned gate is opened.
    #[must_use]
    pub fn gate_disconnect(&self) -> Gate {
        let (tx, rx) = watch::channel(false);
        self.state().disconnect_gate = Some(rx);
        Gate(tx)
    }

    /// Hold dispatches of `command` until the returned gate is opened.
    #[must_use]
    pub fn gate_dispatch(&self, command: impl Into<String>) -> Gate {
        let (tx, rx) = watch::channel(false);
        self.state().dispatch_gates.insert(command.into(), rx);
        Gate(tx)
    }

    /// Make every disconnect report a failure (teardown still happens).
    pub fn fail_disconnect(&self, reason: impl Into<String>) {
        self.state().disconnect_failure = Some(reason.into());
    }

    /// Script the events produced by `command`.
    pub fn script(
        &self,
        command: impl Into<String>,
        events: impl IntoIterator<Item = CommandEvent>,
    ) {
        self.state()
            .scripts
            .insert(command.into(), events.into_iter().collect());
    }

    /// Make dispatching `command` fail.
    pub fn fail_dispatch(&self, command: impl Into<String>, reason: impl Into<String>) {
        self.state()
            .dispatch_failures
            .insert(command.into(), reason.into());
    }

    /// Drive the next dispatch of `command` by hand.
    ///
    /// Holds queue per command text, first in first out.
    #[must_use]
    pub fn hold(&self, command: impl Into<String>) -> HeldCommand {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state()
            .held
            .entry(command.into())
            .or_default()
            .push_back(rx);
        HeldCommand(tx)
    }

    /// Announce that the remote side ended a session.
    pub fn terminate(&self, session_id: SessionId, reason: Option<&str>) {
        self.state().connected.remove(&session_id);
        let _ = self.notices.send(TransportNotice::SessionTerminated {
            session_id,
            reason: reason.map(ToString::to_string),
        });
    }

    /// Commands dispatched for a session, in dispatch order.
    #[must_use]
    pub fn dispatched(&self, session_id: SessionId) -> Vec<String> {
        self.state()
            .dispatched
            .iter()
            .filter(|(id, _)| *id == session_id)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Sessions torn down, in call order.
    #[must_use]
    pub fn disconnects(&self) -> Vec<SessionId> {
        self.state().disconnects.clone()
    }

    /// Whether the transport considers a session connected.
    #[must_use]
    pub fn is_connected(&self, session_id: SessionId) -> bool {
        self.state().connected.contains(&session_id)
    }
}

/// Releases held connects.
pub struct Gate(watch::Sender<bool>);

impl Gate {
    /// Let held connects proceed.
    pub fn open(&self) {
        self.0.send_replace(true);
    }
}

/// Feeds events to a held command.
#[derive(Clone)]
pub struct HeldCommand(mpsc::UnboundedSender<CommandEvent>);

impl HeldCommand {
    /// Deliver an output fragment.
    pub fn output(&self, fragment: impl Into<String>) {
        let _ = self.0.send(CommandEvent::Output(fragment.into()));
    }

    /// Finish with an exit code.
    pub fn exit(&self, code: i32) {
        let _ = self.0.send(CommandEvent::Exit(code));
    }

    /// Finish with a protocol fault.
    pub fn fault(&self, reason: impl Into<String>) {
        let _ = self.0.send(CommandEvent::Fault(reason.into()));
    }
}

async fn pass(gate: Option<watch::Receiver<bool>>) {
    if let Some(mut gate) = gate {
        let _ = gate.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        session_id: SessionId,
        config: &SessionConfig,
    ) -> Result<(), TransportError> {
        let gate = self.state().connect_gates.get(&config.host).cloned();
        pass(gate).await;

        let mut state = self.state();
        if let Some(reason) = state.connect_failures.get(&config.host) {
            return Err(TransportError::Connect(reason.clone()));
        }
        state.connected.insert(session_id);
        Ok(())
    }

    async fn disconnect(&self, session_id: SessionId) -> Result<(), TransportError> {
        let gate = self.state().disconnect_gate.clone();
        pass(gate).await;

        let mut state = self.state();
        state.disconnects.push(session_id);
        state.connected.remove(&session_id);
        match &state.disconnect_failure {
            Some(reason) => Err(TransportError::Disconnect(reason.clone())),
            None => Ok(()),
        }
    }

    async fn dispatch(
        &self,
        session_id: SessionId,
        command: &str,
    ) -> Result<CommandStream, TransportError> {
        let gate = self.state().dispatch_gates.get(command).cloned();
        pass(gate).await;

        let mut state = self.state();
        if !state.connected.contains(&session_id) {
            return Err(TransportError::UnknownSession(session_id));
        }
        state.dispatched.push((session_id, command.to_string()));

        if let Some(reason) = state.dispatch_failures.get(command) {
            return Err(TransportError::Dispatch(reason.clone()));
        }
        if let Some(rx) = state.held.get_mut(command).and_then(VecDeque::pop_front) {
            return Ok(UnboundedReceiverStream::new(rx).boxed());
        }

        let events = state.scripts.get(command).cloned().unwrap_or_else(|| {
            vec![
                CommandEvent::Output(format!("{command}\n")),
                CommandEvent::Exit(0),
            ]
        });
        Ok(futures::stream::iter(events).boxed())
    }

    fn notices(&self) -> broadcast::Receiver<TransportNotice> {
        self.notices.subscribe()
    }
}
