//! Shared fixtures for the unit tests.

use std::{sync::Arc, time::Duration};

use remote_shell_core::{SessionConfig, SessionId, SessionStatus};
use remote_shell_transport::ScriptedTransport;

use crate::{CommandExecutor, SessionRegistry};

pub(crate) type Registry = Arc<SessionRegistry<ScriptedTransport>>;

pub(crate) fn config(host: &str) -> SessionConfig {
    SessionConfig::with_password(host, 22, "tester", "pw")
}

pub(crate) fn setup() -> (Arc<ScriptedTransport>, Registry, CommandExecutor<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new());
    let registry = SessionRegistry::new(Arc::clone(&transport));
    let executor = CommandExecutor::new(Arc::clone(&registry));
    (transport, registry, executor)
}

/// Create a session against `host` and wait for it to connect.
pub(crate) async fn connect(registry: &Registry, host: &str) -> SessionId {
    let handle = registry.create_session(config(host)).await.unwrap();
    let id = handle.id();
    assert_eq!(handle.wait().await, SessionStatus::Connected);
    id
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
