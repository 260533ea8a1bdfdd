//! Session registry: session lifecycle and the active session.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use remote_shell_core::{
    EventLog, Session, SessionConfig, SessionId, SessionStatus, ShellError, Transport,
    TransportError, TransportNotice,
};
use tokio::{sync::broadcast, task::JoinHandle};

use crate::ledger::Ledger;

/// Handle returned by [`SessionRegistry::create_session`].
#[derive(Debug)]
pub struct SessionHandle {
    /// Snapshot taken at creation, in `Connecting` status.
    pub session: Session,
    completion: JoinHandle<SessionStatus>,
}

impl SessionHandle {
    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.session.id
    }

    /// Wait for the connect attempt to resolve.
    pub async fn wait(self) -> SessionStatus {
        self.completion
            .await
            .unwrap_or_else(|e| SessionStatus::Error(format!("connect task failed: {e}")))
    }
}

/// Owns the set of sessions, their status and the active session.
///
/// All state lives behind one mutex that is never held across an await.
/// Create, disconnect and remove calls for the same id are ordered by a
/// per-session lane; calls for different ids run independently.
pub struct SessionRegistry<T>
where
    T: Transport,
{
    pub(crate) transport: Arc<T>,
    ledger: Mutex<Ledger>,
    events: Arc<EventLog>,
    watcher: JoinHandle<()>,
}

impl<T> SessionRegistry<T>
where
    T: Transport + 'static,
{
    /// Create a registry over a transport.
    ///
    /// Spawns a task that applies transport notices, so this must be called
    /// from within a Tokio runtime.
    #[must_use]
    pub fn new(transport: Arc<T>) -> Arc<Self> {
        Self::with_event_log(transport, Arc::new(EventLog::new()))
    }

    /// Create a registry publishing into an existing event log.
    #[must_use]
    pub fn with_event_log(transport: Arc<T>, events: Arc<EventLog>) -> Arc<Self> {
        let notices = transport.notices();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let watcher = tokio::spawn(async move {
                let mut notices = notices;
                loop {
                    match notices.recv().await {
                        Ok(TransportNotice::SessionTerminated { session_id, reason }) => {
                            if let Some(registry) = weak.upgrade() {
                                registry.handle_session_terminated(session_id, reason);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Transport notices lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            Self {
                transport,
                ledger: Mutex::new(Ledger::new(Arc::clone(&events))),
                events,
                watcher,
            }
        })
    }

    pub(crate) fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The transport carrying session traffic.
    #[must_use]
    pub const fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Event log observers can subscribe to.
    #[must_use]
    pub const fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Validate `config`, record a `Connecting` session and start connecting.
    ///
    /// Returns as soon as the session is recorded. On success the session
    /// becomes `Connected` and active; on failure it moves to `Error` and the
    /// active session is left alone.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the config is malformed. The transport is
    /// not contacted in that case.
    pub async fn create_session(
        self: &Arc<Self>,
        config: SessionConfig,
    ) -> Result<SessionHandle, ShellError> {
        if let Err(e) = config.validate() {
            tracing::warn!("Rejected session config: {e}");
            return Err(self.ledger().reject(e));
        }

        let session = Session::new(config);
        let id = session.id;

        let lane = Arc::new(tokio::sync::Mutex::new(()));
        let guard = Arc::clone(&lane).lock_owned().await;
        self.ledger().insert_session(session.clone(), lane);

        tracing::info!(
            session_id = %id,
            host = %session.config.host,
            port = session.config.port,
            "Session connecting"
        );

        let registry = Arc::clone(self);
        let config = session.config.clone();
        let completion = tokio::spawn(async move {
            let _guard = guard;
            let result = registry.transport.connect(id, &config).await;
            let reached = result.is_ok();

            if !registry.commit_connect(id, result) && reached {
                // The session ended while connecting; drop the live link.
                tracing::info!(session_id = %id, "Session closed while connecting, tearing down");
                if let Err(e) = registry.transport.disconnect(id).await {
                    tracing::warn!(session_id = %id, "Transport teardown failed: {e}");
                }
            }

            registry
                .ledger()
                .session(id)
                .map_or(SessionStatus::Disconnected, |s| s.status.clone())
        });

        Ok(SessionHandle {
            session,
            completion,
        })
    }

    /// Apply a connect result. Returns whether the session became `Connected`.
    fn commit_connect(&self, id: SessionId, result: Result<(), TransportError>) -> bool {
        let mut ledger = self.ledger();
        match result {
            Ok(()) => {
                let committed = ledger.connect_succeeded(id);
                if committed {
                    tracing::info!(session_id = %id, "Session connected");
                }
                committed
            }
            Err(e) => {
                let err = ShellError::from(e);
                tracing::warn!(session_id = %id, "Session connect failed: {err}");
                if ledger.connect_failed(id, &err.to_string()) {
                    ledger.reject(err);
                }
                false
            }
        }
    }

    /// Tear the transport down and mark the session `Disconnected`.
    ///
    /// Disconnecting an already disconnected session succeeds without
    /// contacting the transport. Clears the active session if it was this one.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown id, or `TransportFailure` if
    /// teardown failed (the session is marked `Disconnected` regardless).
    pub async fn disconnect_session(&self, id: SessionId) -> Result<(), ShellError> {
        let lane = self.lane(id)?;
        let _guard = lane.lock().await;
        self.disconnect_in_lane(id).await
    }

    /// Delete a session and its command history.
    ///
    /// A connected session is disconnected first, so the transport is torn
    /// down before the record disappears.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown id.
    pub async fn remove_session(&self, id: SessionId) -> Result<(), ShellError> {
        let lane = self.lane(id)?;
        let _guard = lane.lock().await;

        let connected = self
            .ledger()
            .session(id)
            .map(Session::is_connected)
            .ok_or(ShellError::SessionNotFound(id));
        if connected.map_err(|e| self.ledger().reject(e))? {
            if let Err(e) = self.disconnect_in_lane(id).await {
                tracing::warn!(session_id = %id, "Removing session after failed teardown: {e}");
            }
        }

        if self.ledger().remove_session(id) {
            tracing::info!(session_id = %id, "Session removed");
        }
        Ok(())
    }

    async fn disconnect_in_lane(&self, id: SessionId) -> Result<(), ShellError> {
        let status = self.ledger().session(id).map(|s| s.status.clone());
        match status {
            None => return Err(self.ledger().reject(ShellError::SessionNotFound(id))),
            Some(SessionStatus::Disconnected) => return Ok(()),
            Some(_) => {}
        }

        let teardown = self.transport.disconnect(id).await;

        let mut ledger = self.ledger();
        if ledger.close(id) {
            tracing::info!(session_id = %id, "Session disconnected");
        }
        teardown.map_err(|e| {
            let err = ShellError::from(e);
            tracing::warn!(session_id = %id, "Transport teardown failed: {err}");
            ledger.reject(err)
        })
    }

    /// Apply a remote-initiated termination.
    ///
    /// A reason drives the session to `Error`, none to `Disconnected`. Any
    /// command still pending or running on it is failed. Sessions that are
    /// already terminal, or unknown, are left untouched.
    pub fn handle_session_terminated(&self, id: SessionId, reason: Option<String>) {
        let mut ledger = self.ledger();
        if ledger.terminate(id, reason.clone()) {
            match reason {
                Some(reason) => {
                    tracing::warn!(session_id = %id, %reason, "Session terminated by transport");
                }
                None => tracing::info!(session_id = %id, "Session closed by remote host"),
            }
        }
    }

    /// Currently active session.
    #[must_use]
    pub fn get_active_session(&self) -> Option<Session> {
        let ledger = self.ledger();
        ledger.active().and_then(|id| ledger.session(id).cloned())
    }

    /// Id of the active session.
    #[must_use]
    pub fn active_session_id(&self) -> Option<SessionId> {
        self.ledger().active()
    }

    /// Select the active session. It does not need to be connected.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown id.
    pub fn set_active_session(&self, id: SessionId) -> Result<(), ShellError> {
        self.ledger().set_active(id)
    }

    /// Look up one session.
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.ledger().session(id).cloned()
    }

    /// All sessions in creation order.
    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        self.ledger().sessions()
    }

    /// Most recent failure surfaced by any operation.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.ledger().last_error()
    }

    /// Forget the last error.
    pub fn clear_last_error(&self) {
        self.ledger().clear_last_error();
    }

    fn lane(&self, id: SessionId) -> Result<Arc<tokio::sync::Mutex<()>>, ShellError> {
        let mut ledger = self.ledger();
        match ledger.lane(id) {
            Some(lane) => Ok(lane),
            None => Err(ledger.reject(ShellError::SessionNotFound(id))),
        }
    }
}

impl<T> Drop for SessionRegistry<T>
where
    T: Transport,
{
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
