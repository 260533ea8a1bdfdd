//! Broadcast + history log of registry events.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{Stream, StreamExt, future, stream::BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::types::{CommandId, CommandStatus, SessionId, SessionStatus};

/// Default history size limit (8 MiB).
const HISTORY_BYTES: usize = 8 * 1024 * 1024;

/// Live channel capacity.
const CHANNEL_CAPACITY: usize = 10_000;

/// A committed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellEvent {
    SessionStatus {
        session_id: SessionId,
        status: SessionStatus,
    },
    ActiveSession {
        session_id: Option<SessionId>,
    },
    SessionRemoved {
        session_id: SessionId,
    },
    CommandStatus {
        session_id: SessionId,
        command_id: CommandId,
        status: CommandStatus,
    },
    CommandOutput {
        session_id: SessionId,
        command_id: CommandId,
        fragment: String,
    },
    HistoryCleared {
        session_id: SessionId,
    },
}

impl ShellEvent {
    /// Rough memory footprint, used to bound history.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        let payload = match self {
            Self::SessionStatus {
                status: SessionStatus::Error(reason),
                ..
            }
            | Self::CommandStatus {
                status: CommandStatus::Error { reason },
                ..
            } => reason.len(),
            Self::CommandOutput { fragment, .. } => fragment.len(),
            _ => 0,
        };
        std::mem::size_of::<Self>() + payload
    }
}

#[derive(Clone)]
struct StoredEvent {
    event: ShellEvent,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredEvent>,
    total_bytes: usize,
    limit: usize,
}

/// Event log with broadcast and history support.
///
/// Late observers receive the retained history, then live events, with no
/// gap or duplicate between the two.
pub struct EventLog {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<ShellEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Create a log with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(HISTORY_BYTES)
    }

    /// Create a log retaining at most `limit` bytes of history.
    #[must_use]
    pub fn with_history_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
                limit,
            }),
            sender,
        }
    }

    /// Push an event to live listeners and history.
    pub fn push(&self, event: ShellEvent) {
        let bytes = event.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let _ = self.sender.send(event.clone());

        while inner.total_bytes.saturating_add(bytes) > inner.limit {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredEvent { event, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<ShellEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.event.clone())
            .collect()
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> BoxStream<'static, ShellEvent> {
        let (history, rx) = self.snapshot();
        Box::pin(futures::stream::iter(history).chain(live(rx)))
    }

    /// Output fragments of one command.
    ///
    /// Replays the fragments in history, then follows live events. Ends when
    /// the command reaches a terminal status, or when a live event clears its
    /// session's history or removes the session. Clears already in history
    /// are ignored since they may predate the command.
    #[must_use]
    pub fn command_output_stream(
        &self,
        session_id: SessionId,
        command_id: CommandId,
    ) -> BoxStream<'static, String> {
        let (history, rx) = self.snapshot();

        let mut replay = Vec::new();
        for event in history {
            if ends_command(&event, command_id) {
                return futures::stream::iter(replay).boxed();
            }
            replay.extend(fragment_of(event, command_id));
        }

        let live = live(rx)
            .take_while(move |event| {
                let finished = ends_command(event, command_id)
                    || matches!(
                        event,
                        ShellEvent::HistoryCleared { session_id: sid }
                            | ShellEvent::SessionRemoved { session_id: sid }
                            if *sid == session_id
                    );
                future::ready(!finished)
            })
            .filter_map(move |event| future::ready(fragment_of(event, command_id)));

        futures::stream::iter(replay).chain(live).boxed()
    }

    /// History and a receiver subscribed under the same lock, so no event is
    /// missed or seen twice.
    fn snapshot(&self) -> (Vec<ShellEvent>, broadcast::Receiver<ShellEvent>) {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let history = inner.history.iter().map(|s| s.event.clone()).collect();
        (history, self.sender.subscribe())
    }
}

fn live(rx: broadcast::Receiver<ShellEvent>) -> impl Stream<Item = ShellEvent> + Send + 'static {
    BroadcastStream::new(rx).filter_map(|res| async move {
        match res {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("Event observer lagged: {e}");
                None
            }
        }
    })
}

fn ends_command(event: &ShellEvent, command_id: CommandId) -> bool {
    matches!(
        event,
        ShellEvent::CommandStatus { command_id: id, status, .. }
            if *id == command_id && status.is_terminal()
    )
}

fn fragment_of(event: ShellEvent, command_id: CommandId) -> Option<String> {
    match event {
        ShellEvent::CommandOutput {
            command_id: id,
            fragment,
            ..
        } if id == command_id => Some(fragment),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn output(session_id: SessionId, command_id: CommandId, fragment: &str) -> ShellEvent {
        ShellEvent::CommandOutput {
            session_id,
            command_id,
            fragment: fragment.to_string(),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let log = EventLog::with_history_limit(3 * std::mem::size_of::<ShellEvent>() + 8);
        let (session_id, command_id) = (Uuid::new_v4(), Uuid::new_v4());
        for i in 0..10 {
            log.push(output(session_id, command_id, &i.to_string()));
        }

        let history = log.history();
        assert!(history.len() <= 3);
        assert_eq!(history.last(), Some(&output(session_id, command_id, "9")));
    }

    #[tokio::test]
    async fn test_command_output_stream_spans_history_and_live() {
        let log = EventLog::new();
        let (session_id, command_id, other) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        log.push(output(session_id, command_id, "one "));
        log.push(output(session_id, other, "noise"));

        let stream = log.command_output_stream(session_id, command_id);

        log.push(output(session_id, command_id, "two"));
        log.push(ShellEvent::CommandStatus {
            session_id,
            command_id,
            status: CommandStatus::Completed { exit_code: 0 },
        });
        log.push(output(session_id, command_id, "after"));

        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments, vec!["one ".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_command_output_stream_ends_when_history_is_cleared() {
        let log = EventLog::new();
        let (session_id, command_id) = (Uuid::new_v4(), Uuid::new_v4());

        let stream = log.command_output_stream(session_id, command_id);
        log.push(output(session_id, command_id, "partial"));
        log.push(ShellEvent::HistoryCleared {
            session_id: Uuid::new_v4(),
        });
        log.push(ShellEvent::HistoryCleared { session_id });
        log.push(output(session_id, command_id, "discarded"));

        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments, vec!["partial".to_string()]);
    }

    #[tokio::test]
    async fn test_replayed_clear_does_not_end_stream() {
        let log = EventLog::new();
        let (session_id, command_id) = (Uuid::new_v4(), Uuid::new_v4());
        log.push(ShellEvent::HistoryCleared { session_id });
        log.push(output(session_id, command_id, "fresh"));

        let stream = log.command_output_stream(session_id, command_id);
        log.push(ShellEvent::CommandStatus {
            session_id,
            command_id,
            status: CommandStatus::Error {
                reason: "Protocol fault: reset".into(),
            },
        });

        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments, vec!["fresh".to_string()]);
    }

    #[test]
    fn test_event_serialization() {
        let event = ShellEvent::SessionStatus {
            session_id: Uuid::nil(),
            status: SessionStatus::Error("refused".into()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("session_status"));
        assert!(json.contains("refused"));

        let parsed: ShellEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
