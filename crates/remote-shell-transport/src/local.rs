//! Transport that realizes sessions on the local machine.
//!
//! Each dispatched command runs as `<shell> -c <text>` in its own process
//! group. Only loopback hosts are accepted and credentials are ignored.

use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::StreamExt;
use remote_shell_core::{
    CommandEvent, CommandStream, SessionConfig, SessionId, Transport, TransportError,
    TransportNotice,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::{broadcast, mpsc, watch},
};
use tokio_stream::wrappers::UnboundedReceiverStream;

const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

const READ_CHUNK: usize = 4096;

struct LocalSession {
    shell: PathBuf,
    shutdown: watch::Sender<bool>,
}

/// Local shell transport.
pub struct LocalShellTransport {
    sessions: Mutex<HashMap<SessionId, LocalSession>>,
    notices: broadcast::Sender<TransportNotice>,
}

impl Default for LocalShellTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalShellTransport {
    /// Create a new local transport.
    #[must_use]
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            sessions: Mutex::new(HashMap::new()),
            notices,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, LocalSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns `(shell_program, shell_arg)` for the current platform.
fn shell_command() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd".into(), "/C")
    } else {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "sh".into());
        (shell, "-c")
    }
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

async fn resolve_shell() -> Option<PathBuf> {
    let (shell, _) = shell_command();
    if let Some(found) = which_async(&shell).await {
        return Some(found);
    }
    tracing::debug!(%shell, "Configured shell not found, falling back to sh");
    which_async("sh").await
}

fn is_loopback(host: &str) -> bool {
    let host = host.trim();
    LOOPBACK_HOSTS.iter().any(|h| h.eq_ignore_ascii_case(host))
}

#[async_trait]
impl Transport for LocalShellTransport {
    async fn connect(
        &self,
        session_id: SessionId,
        config: &SessionConfig,
    ) -> Result<(), TransportError> {
        if !is_loopback(&config.host) {
            return Err(TransportError::Connect(format!(
                "local transport only reaches loopback hosts, got {}",
                config.host
            )));
        }

        let limit = config.timeout_duration();
        let shell = if limit.is_zero() {
            resolve_shell().await
        } else {
            tokio::time::timeout(limit, resolve_shell())
                .await
                .map_err(|_| {
                    TransportError::Connect(format!("timed out after {}s", limit.as_secs()))
                })?
        };
        let shell = shell.ok_or_else(|| TransportError::Connect("no shell found".into()))?;

        tracing::debug!(session_id = %session_id, shell = %shell.display(), "Local session opened");
        let (shutdown, _) = watch::channel(false);
        self.sessions()
            .insert(session_id, LocalSession { shell, shutdown });
        Ok(())
    }

    async fn disconnect(&self, session_id: SessionId) -> Result<(), TransportError> {
        if let Some(session) = self.sessions().remove(&session_id) {
            session.shutdown.send_replace(true);
            tracing::debug!(session_id = %session_id, "Local session closed");
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        session_id: SessionId,
        command: &str,
    ) -> Result<CommandStream, TransportError> {
        let (shell, shutdown) = {
            let sessions = self.sessions();
            let session = sessions
                .get(&session_id)
                .ok_or(TransportError::UnknownSession(session_id))?;
            (session.shell.clone(), session.shutdown.subscribe())
        };

        let (_, shell_arg) = shell_command();
        let mut child = Command::new(&shell)
            .arg(shell_arg)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .group_spawn()
            .map_err(|e| TransportError::Dispatch(format!("spawn failed: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();
        let pumps: Vec<_> = [
            stdout.map(|out| tokio::spawn(pump(out, tx.clone()))),
            stderr.map(|err| tokio::spawn(pump(err, tx.clone()))),
        ]
        .into_iter()
        .flatten()
        .collect();

        tokio::spawn(supervise(child, pumps, shutdown, tx));

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn notices(&self) -> broadcast::Receiver<TransportNotice> {
        self.notices.subscribe()
    }
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    Shutdown,
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Wait for the process, then report how it ended once all output is in.
async fn supervise(
    mut child: AsyncGroupChild,
    pumps: Vec<tokio::task::JoinHandle<()>>,
    mut shutdown: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<CommandEvent>,
) {
    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        () = wait_shutdown(&mut shutdown) => Outcome::Shutdown,
    };

    let event = match outcome {
        Outcome::Shutdown => kill_group(&mut child).await,
        Outcome::Exited(Ok(status)) => {
            // Background jobs may keep the pipes open after the shell exits.
            let drained = tokio::select! {
                () = drain(pumps) => true,
                () = wait_shutdown(&mut shutdown) => false,
            };
            if drained {
                status.code().map_or_else(
                    || CommandEvent::Fault("terminated by signal".into()),
                    CommandEvent::Exit,
                )
            } else {
                kill_group(&mut child).await
            }
        }
        Outcome::Exited(Err(e)) => CommandEvent::Fault(format!("wait failed: {e}")),
    };
    let _ = tx.send(event);
}

async fn drain(pumps: Vec<tokio::task::JoinHandle<()>>) {
    for pump in pumps {
        let _ = pump.await;
    }
}

/// Kill whatever is left of the process group.
async fn kill_group(child: &mut AsyncGroupChild) -> CommandEvent {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Failed to kill process group: {e}");
    }
    let _ = child.wait().await;
    CommandEvent::Fault("session closed".into())
}

/// Forward a pipe as output fragments, never splitting a UTF-8 sequence.
async fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<CommandEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Output pipe read failed: {e}");
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);

        let ready = match std::str::from_utf8(&pending) {
            Ok(s) => s.len(),
            // Incomplete trailing sequence: keep it for the next read.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => pending.len(),
        };
        if ready == 0 {
            continue;
        }
        let chunk: Vec<u8> = pending.drain(..ready).collect();
        if tx
            .send(CommandEvent::Output(String::from_utf8_lossy(&chunk).into_owned()))
            .is_err()
        {
            return;
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(CommandEvent::Output(
            String::from_utf8_lossy(&pending).into_owned(),
        ));
    }
}
