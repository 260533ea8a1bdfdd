//! Command executor: dispatches commands against connected sessions.

use std::sync::Arc;

use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use remote_shell_core::{
    Command, CommandEvent, CommandId, SessionId, ShellError, Transport,
};
use tokio::{sync::watch, task::JoinHandle};

use crate::{SessionRegistry, ledger::Accepted};

/// Handle returned by [`CommandExecutor::submit_command`].
///
/// Dropping the handle does not cancel the command.
#[derive(Debug)]
pub struct CommandHandle {
    /// Snapshot taken at acceptance, in `Pending` status.
    pub command: Command,
    completion: JoinHandle<Command>,
}

impl CommandHandle {
    /// Command id.
    #[must_use]
    pub const fn id(&self) -> CommandId {
        self.command.id
    }

    /// Wait for the command to reach a terminal status.
    pub async fn wait(self) -> Command {
        let Self {
            mut command,
            completion,
        } = self;
        match completion.await {
            Ok(finished) => finished,
            Err(e) => {
                command.fail(format!("command task failed: {e}"));
                command
            }
        }
    }
}

/// Owns command records and drives them through the transport.
pub struct CommandExecutor<T>
where
    T: Transport,
{
    registry: Arc<SessionRegistry<T>>,
}

impl<T> Clone for CommandExecutor<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> CommandExecutor<T>
where
    T: Transport + 'static,
{
    /// Create an executor over a registry.
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry<T>>) -> Self {
        Self { registry }
    }

    /// The registry this executor validates sessions against.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry<T>> {
        &self.registry
    }

    /// Run a command and wait for it to finish.
    ///
    /// A transport failure, protocol fault or session loss while running is
    /// reported through the returned command's `Error` status.
    ///
    /// # Errors
    /// Same as [`Self::submit_command`].
    pub async fn execute_command(
        &self,
        session_id: SessionId,
        text: &str,
    ) -> Result<Command, ShellError> {
        Ok(self.submit_command(session_id, text)?.wait().await)
    }

    /// Record a `Pending` command and start driving it in the background.
    ///
    /// Commands submitted to the same session reach the transport in
    /// submission order.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown session,
    /// `SessionNotConnected` if the session is not connected right now, or
    /// `EmptyCommand` for blank text. No command is recorded in those cases.
    pub fn submit_command(
        &self,
        session_id: SessionId,
        text: &str,
    ) -> Result<CommandHandle, ShellError> {
        let accepted = self.registry.ledger().accept_command(session_id, text)?;
        let command = accepted.command.clone();

        tracing::debug!(
            session_id = %session_id,
            command_id = %command.id,
            command = %command.command,
            "Command accepted"
        );

        let registry = Arc::clone(&self.registry);
        let completion = tokio::spawn(drive(registry, accepted));

        Ok(CommandHandle {
            command,
            completion,
        })
    }

    /// All commands of a session in issue order, any status.
    #[must_use]
    pub fn get_session_commands(&self, session_id: SessionId) -> Vec<Command> {
        self.registry.ledger().commands_for(session_id)
    }

    /// Every command across all sessions.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        self.registry.ledger().all_commands()
    }

    /// Look up one command.
    #[must_use]
    pub fn command(&self, id: CommandId) -> Option<Command> {
        self.registry.ledger().command(id).cloned()
    }

    /// Delete every command record of a session.
    ///
    /// Commands still running keep running; their results are discarded.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown session.
    pub fn clear_session_history(&self, session_id: SessionId) -> Result<(), ShellError> {
        let cleared = self.registry.ledger().clear_history(session_id)?;
        tracing::debug!(session_id = %session_id, cleared, "Command history cleared");
        Ok(())
    }

    /// Output fragments of a command, history first, until it finishes.
    ///
    /// A finished command yields its stored output at once and an unknown one
    /// yields nothing. The stream also ends if the command's record is
    /// cleared or its session removed.
    #[must_use]
    pub fn follow_output(&self, command_id: CommandId) -> BoxStream<'static, String> {
        // Event pushes happen under the ledger lock, so the log snapshot
        // taken here lines up with the record we just read.
        let ledger = self.registry.ledger();
        match ledger.command(command_id) {
            None => stream::empty().boxed(),
            Some(command) if command.is_terminal() => {
                let output = (!command.output.is_empty()).then(|| command.output.clone());
                stream::iter(output).boxed()
            }
            Some(command) => self
                .registry
                .events()
                .command_output_stream(command.session_id, command_id),
        }
    }
}

/// Advances the session's dispatch turn when dropped.
struct DispatchSlot(Arc<watch::Sender<u64>>);

impl Drop for DispatchSlot {
    fn drop(&mut self) {
        self.0.send_modify(|turn| *turn += 1);
    }
}

enum Step {
    Event(Option<CommandEvent>),
    Closed,
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender means the session was removed.
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn wait_turn(turn: &mut watch::Receiver<u64>, ticket: u64) -> bool {
    turn.wait_for(|current| *current >= ticket).await.is_ok()
}

async fn drive<T>(registry: Arc<SessionRegistry<T>>, accepted: Accepted) -> Command
where
    T: Transport + 'static,
{
    let Accepted {
        mut command,
        ticket,
        mut turn,
        turn_tx,
        mut closed,
    } = accepted;
    let (id, session_id) = (command.id, command.session_id);

    let outcome = run(&registry, &mut command, ticket, &mut turn, turn_tx, &mut closed).await;

    let mut ledger = registry.ledger();
    match outcome {
        Ok(exit_code) => {
            ledger.complete_command(id, exit_code);
            command.complete(exit_code);
            tracing::debug!(session_id = %session_id, command_id = %id, exit_code, "Command completed");
        }
        Err(err) => {
            tracing::warn!(session_id = %session_id, command_id = %id, "Command failed: {err}");
            ledger.fail_command(id, &err);
            command.fail(err.to_string());
        }
    }

    // The ledger copy wins unless the history was cleared meanwhile.
    ledger.command(id).cloned().unwrap_or(command)
}

async fn run<T>(
    registry: &SessionRegistry<T>,
    command: &mut Command,
    ticket: u64,
    turn: &mut watch::Receiver<u64>,
    turn_tx: Arc<watch::Sender<u64>>,
    closed: &mut watch::Receiver<bool>,
) -> Result<i32, ShellError>
where
    T: Transport + 'static,
{
    let terminated = || ShellError::SessionTerminated("session closed".to_string());
    let (id, session_id) = (command.id, command.session_id);

    let my_turn = tokio::select! {
        reached = wait_turn(turn, ticket) => reached,
        () = wait_closed(closed) => false,
    };
    if !my_turn {
        return Err(terminated());
    }
    let slot = DispatchSlot(turn_tx);

    if !registry.ledger().session_connected(session_id) {
        return Err(terminated());
    }

    tracing::debug!(session_id = %session_id, command_id = %id, "Dispatching command");
    let dispatched = tokio::select! {
        res = registry.transport.dispatch(session_id, &command.command) => Some(res),
        () = wait_closed(closed) => None,
    };
    let mut stream = match dispatched {
        Some(Ok(stream)) => stream,
        Some(Err(e)) => return Err(e.into()),
        None => return Err(terminated()),
    };

    registry.ledger().start_command(id);
    command.start();
    drop(slot);

    loop {
        let step = tokio::select! {
            next = stream.next() => Step::Event(next),
            () = wait_closed(closed) => Step::Closed,
        };
        match step {
            Step::Event(Some(CommandEvent::Output(fragment))) => {
                registry.ledger().append_output(id, &fragment);
                command.append_output(&fragment);
            }
            Step::Event(Some(CommandEvent::Exit(code))) => return Ok(code),
            Step::Event(Some(CommandEvent::Fault(reason))) => {
                return Err(ShellError::ProtocolFault(reason));
            }
            Step::Event(None) => {
                return Err(ShellError::ProtocolFault(
                    "stream ended without an exit status".to_string(),
                ));
            }
            Step::Closed => return Err(terminated()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use futures::StreamExt;
    use remote_shell_core::{CommandEvent, CommandStatus, SessionId, SessionStatus, ShellError};

    use crate::testing::{connect, eventually, setup};

    #[tokio::test]
    async fn test_session_round_trip() {
        let (transport, registry, executor) = setup();
        transport.script(
            "pwd",
            [CommandEvent::Output("/home/tester\n".into()), CommandEvent::Exit(0)],
        );

        let id = connect(&registry, "box").await;
        let pwd = executor.execute_command(id, "pwd").await.unwrap();
        assert_eq!(pwd.status, CommandStatus::Completed { exit_code: 0 });
        assert_eq!(pwd.output, "/home/tester\n");
        assert!(pwd.end_time.is_some());

        registry.disconnect_session(id).await.unwrap();
        assert_eq!(registry.session(id).unwrap().status, SessionStatus::Disconnected);
        assert_eq!(registry.get_active_session(), None);

        assert_eq!(
            executor.execute_command(id, "ls").await.unwrap_err(),
            ShellError::SessionNotConnected(id)
        );
        assert_eq!(executor.get_session_commands(id).len(), 1);

        registry.remove_session(id).await.unwrap();
        assert!(executor.get_session_commands(id).is_empty());
        assert!(executor.command(pwd.id).is_none());
    }

    #[tokio::test]
    async fn test_rejected_commands_are_not_recorded() {
        let (_, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let ghost = SessionId::new_v4();

        assert_eq!(
            executor.submit_command(ghost, "ls").unwrap_err(),
            ShellError::SessionNotFound(ghost)
        );
        assert_eq!(
            executor.submit_command(id, "   ").unwrap_err(),
            ShellError::EmptyCommand
        );
        assert!(executor.commands().is_empty());
        assert_eq!(registry.last_error(), Some(ShellError::EmptyCommand.to_string()));
    }

    #[tokio::test]
    async fn test_output_accumulates_while_running() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let held = transport.hold("make");

        let handle = executor.submit_command(id, "make").unwrap();
        assert_eq!(handle.command.status, CommandStatus::Pending);
        let command_id = handle.id();

        held.output("compiling\n");
        eventually(|| executor.command(command_id).is_some_and(|c| !c.output.is_empty())).await;
        let running = executor.command(command_id).unwrap();
        assert_eq!(running.status, CommandStatus::Running);
        assert_eq!(running.exit_code(), None);
        assert_eq!(running.end_time, None);

        held.output("linking\n");
        held.exit(2);
        let finished = handle.wait().await;
        assert_eq!(finished.output, "compiling\nlinking\n");
        assert_eq!(finished.exit_code(), Some(2));
        assert_eq!(executor.command(command_id), Some(finished));
    }

    #[tokio::test]
    async fn test_protocol_fault_errors_command() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        transport.script(
            "cat big.log",
            [CommandEvent::Output("partial".into()), CommandEvent::Fault("channel reset".into())],
        );

        let command = executor.execute_command(id, "cat big.log").await.unwrap();
        assert_eq!(command.output, "partial");
        assert_eq!(command.exit_code(), None);
        assert!(command.error().unwrap().contains("channel reset"));
        assert!(registry.last_error().unwrap().contains("Protocol fault"));
    }

    #[tokio::test]
    async fn test_stream_without_exit_is_a_protocol_fault() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        transport.script("true", Vec::new());

        let command = executor.execute_command(id, "true").await.unwrap();
        assert!(command.error().unwrap().starts_with("Protocol fault"));
    }

    #[tokio::test]
    async fn test_dispatch_failure_errors_command() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        transport.fail_dispatch("reboot", "channel open refused");

        let command = executor.execute_command(id, "reboot").await.unwrap();
        assert!(command.error().unwrap().starts_with("Transport failure"));
        assert_eq!(command.output, "");
        assert!(command.end_time.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_fails_running_command() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let _held = transport.hold("sleep 100");

        let handle = executor.submit_command(id, "sleep 100").unwrap();
        let command_id = handle.id();
        eventually(|| {
            executor
                .command(command_id)
                .is_some_and(|c| c.status == CommandStatus::Running)
        })
        .await;

        registry.disconnect_session(id).await.unwrap();
        let forced = executor.command(command_id).unwrap();
        assert!(forced.error().unwrap().starts_with("Session terminated"));

        assert_eq!(handle.wait().await, forced);
    }

    #[tokio::test]
    async fn test_remote_termination_fails_running_command() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let _held = transport.hold("top");

        let handle = executor.submit_command(id, "top").unwrap();
        let command_id = handle.id();
        eventually(|| {
            executor
                .command(command_id)
                .is_some_and(|c| c.status == CommandStatus::Running)
        })
        .await;
        transport.terminate(id, Some("connection reset"));

        let finished = handle.wait().await;
        assert!(finished.error().unwrap().contains("connection reset"));
        assert_eq!(
            registry.session(id).unwrap().status,
            SessionStatus::Error("connection reset".into())
        );
    }

    #[tokio::test]
    async fn test_cleared_history_is_not_resurrected() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let held = transport.hold("build");

        let handle = executor.submit_command(id, "build").unwrap();
        let command_id = handle.id();
        eventually(|| {
            executor
                .command(command_id)
                .is_some_and(|c| c.status == CommandStatus::Running)
        })
        .await;

        executor.clear_session_history(id).unwrap();
        assert!(executor.get_session_commands(id).is_empty());

        held.output("done\n");
        held.exit(0);
        let finished = handle.wait().await;
        assert_eq!(finished.exit_code(), Some(0));
        assert_eq!(finished.output, "done\n");
        assert!(executor.get_session_commands(id).is_empty());
        assert!(executor.command(command_id).is_none());
    }

    #[tokio::test]
    async fn test_clear_history_of_unknown_session() {
        let (_, _, executor) = setup();
        let ghost = SessionId::new_v4();
        assert_eq!(
            executor.clear_session_history(ghost),
            Err(ShellError::SessionNotFound(ghost))
        );
    }

    #[tokio::test]
    async fn test_dispatch_follows_submission_order() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let first = transport.hold("first");

        let handles: Vec<_> = ["first", "second", "third", "fourth"]
            .into_iter()
            .map(|text| executor.submit_command(id, text).unwrap())
            .collect();
        let mut handles = handles.into_iter();
        let first_handle = handles.next().unwrap();

        for handle in handles {
            assert_eq!(handle.wait().await.exit_code(), Some(0));
        }
        first.exit(0);
        assert_eq!(first_handle.wait().await.exit_code(), Some(0));

        assert_eq!(
            transport.dispatched(id),
            vec!["first", "second", "third", "fourth"]
        );
        let listed: Vec<String> = executor
            .get_session_commands(id)
            .into_iter()
            .map(|c| c.command)
            .collect();
        assert_eq!(listed, vec!["first", "second", "third", "fourth"]);
    }

    #[tokio::test]
    async fn test_output_goes_to_the_right_session() {
        let (transport, registry, executor) = setup();
        let left = connect(&registry, "left").await;
        let right = connect(&registry, "right").await;
        let tail_left = transport.hold("tail");
        let tail_right = transport.hold("tail");

        let a = executor.submit_command(left, "tail").unwrap();
        eventually(|| executor.command(a.id()).is_some_and(|c| c.status == CommandStatus::Running))
            .await;
        let b = executor.submit_command(right, "tail").unwrap();
        eventually(|| executor.command(b.id()).is_some_and(|c| c.status == CommandStatus::Running))
            .await;

        tail_right.output("from right\n");
        tail_left.output("from left\n");
        tail_right.exit(0);
        tail_left.exit(0);

        assert_eq!(a.wait().await.output, "from left\n");
        assert_eq!(b.wait().await.output, "from right\n");
        assert_eq!(executor.get_session_commands(left).len(), 1);
        assert_eq!(executor.get_session_commands(right).len(), 1);
    }

    #[tokio::test]
    async fn test_follow_output_streams_until_finished() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let held = transport.hold("journalctl -f");

        let handle = executor.submit_command(id, "journalctl -f").unwrap();
        let command_id = handle.id();
        held.output("boot\n");
        eventually(|| executor.command(command_id).is_some_and(|c| !c.output.is_empty())).await;

        let follower = tokio::spawn(executor.follow_output(command_id).collect::<Vec<_>>());
        held.output("ready\n");
        held.exit(0);
        handle.wait().await;

        let fragments = follower.await.unwrap();
        assert_eq!(fragments, vec!["boot\n".to_string(), "ready\n".to_string()]);
    }

    #[tokio::test]
    async fn test_follow_output_ends_when_history_is_cleared() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let held = transport.hold("build");

        let handle = executor.submit_command(id, "build").unwrap();
        let command_id = handle.id();
        eventually(|| {
            executor
                .command(command_id)
                .is_some_and(|c| c.status == CommandStatus::Running)
        })
        .await;

        let follower = tokio::spawn(executor.follow_output(command_id).collect::<Vec<_>>());
        executor.clear_session_history(id).unwrap();
        held.output("late\n");
        held.exit(0);
        assert_eq!(handle.wait().await.exit_code(), Some(0));

        let fragments = tokio::time::timeout(Duration::from_secs(1), follower)
            .await
            .expect("follower should end once the history is cleared")
            .unwrap();
        assert!(fragments.is_empty());
    }

    #[tokio::test]
    async fn test_follow_output_of_finished_or_unknown_command() {
        let (_, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let done = executor.execute_command(id, "echo hi").await.unwrap();

        let replay: Vec<String> = executor.follow_output(done.id).collect().await;
        assert_eq!(replay, vec!["echo hi\n".to_string()]);

        let unknown: Vec<String> = executor.follow_output(SessionId::new_v4()).collect().await;
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_fails_queued_commands() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let _gate = transport.gate_dispatch("a");

        let first = executor.submit_command(id, "a").unwrap();
        let second = executor.submit_command(id, "b").unwrap();
        tokio::task::yield_now().await;
        assert_eq!(
            executor.command(second.id()).map(|c| c.status),
            Some(CommandStatus::Pending)
        );

        registry.disconnect_session(id).await.unwrap();
        let forced = executor.get_session_commands(id);
        assert_eq!(forced.len(), 2);
        for command in &forced {
            assert!(command.error().unwrap().starts_with("Session terminated"));
            assert_eq!(command.exit_code(), None);
        }

        assert_eq!(first.wait().await, forced[0]);
        assert_eq!(second.wait().await, forced[1]);
        assert!(transport.dispatched(id).is_empty());
    }

    #[tokio::test]
    async fn test_remote_termination_fails_queued_commands() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let _gate = transport.gate_dispatch("a");

        let first = executor.submit_command(id, "a").unwrap();
        let second = executor.submit_command(id, "b").unwrap();
        transport.terminate(id, Some("link lost"));

        for handle in [first, second] {
            let finished = handle.wait().await;
            assert!(finished.error().unwrap().contains("link lost"));
        }
        assert!(transport.dispatched(id).is_empty());
    }

    #[tokio::test]
    async fn test_command_accepted_during_teardown_ends_in_error() {
        let (transport, registry, executor) = setup();
        let id = connect(&registry, "box").await;
        let gate = transport.gate_disconnect();
        let _held = transport.hold("tail -f log");

        let disconnecting = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.disconnect_session(id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.session(id).unwrap().status, SessionStatus::Connected);

        let handle = executor.submit_command(id, "tail -f log").unwrap();
        let command_id = handle.id();
        eventually(|| {
            executor
                .command(command_id)
                .is_some_and(|c| c.status == CommandStatus::Running)
        })
        .await;

        gate.open();
        disconnecting.await.unwrap().unwrap();

        let finished = handle.wait().await;
        assert!(finished.error().unwrap().starts_with("Session terminated"));
        assert_eq!(executor.command(command_id), Some(finished));
    }
}
