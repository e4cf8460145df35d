use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{ConversationCommand, ConversationEvent};

/// Broadcast event stream type used by view subscribers.
pub type EventStream = broadcast::Receiver<ConversationEvent>;

/// Errors returned by runtime channel operations.
#[derive(Debug, Error)]
pub enum RuntimeChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command/event channel pair shared by the runtime and its views.
#[derive(Clone, Debug)]
pub struct RuntimeChannels {
    command_tx: mpsc::Sender<ConversationCommand>,
    event_tx: broadcast::Sender<ConversationEvent>,
}

impl RuntimeChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<ConversationCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Subscribe to emitted conversation events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Send one command to the runtime.
    pub async fn send_command(
        &self,
        command: ConversationCommand,
    ) -> Result<(), RuntimeChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| RuntimeChannelError::CommandChannelClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: ConversationEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Emit-only half for the runtime. It holds no command sender, so the
    /// command receiver closes once every `RuntimeChannels` clone is dropped.
    pub fn event_sink(&self) -> EventSink {
        EventSink {
            event_tx: self.event_tx.clone(),
        }
    }
}

/// Emitting side of the event broadcast.
#[derive(Clone, Debug)]
pub struct EventSink {
    event_tx: broadcast::Sender<ConversationEvent>,
}

impl EventSink {
    pub fn emit(&self, event: ConversationEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionLifecycleState;

    #[tokio::test]
    async fn sends_commands_to_receiver() {
        let (channels, mut rx) = RuntimeChannels::new(8, 8);
        channels
            .send_command(ConversationCommand::Open {
                conversation_id: "c1".into(),
            })
            .await
            .expect("command send should work");

        let cmd = rx.recv().await.expect("receiver should have a command");
        match cmd {
            ConversationCommand::Open { conversation_id } => assert_eq!(conversation_id, "c1"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _) = RuntimeChannels::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        channels.emit(ConversationEvent::StateChanged {
            state: SessionLifecycleState::Opening,
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[tokio::test]
    async fn event_sink_does_not_keep_commands_open() {
        let (channels, mut rx) = RuntimeChannels::new(4, 4);
        let sink = channels.event_sink();
        let mut events = channels.subscribe();
        drop(channels);

        assert!(rx.recv().await.is_none());
        sink.emit(ConversationEvent::StateChanged {
            state: SessionLifecycleState::Closed,
        });
        assert_eq!(
            events.recv().await.expect("sink should still emit"),
            ConversationEvent::StateChanged {
                state: SessionLifecycleState::Closed,
            }
        );
    }

    #[tokio::test]
    async fn reports_closed_command_channel() {
        let (channels, rx) = RuntimeChannels::new(1, 1);
        drop(rx);

        let err = channels
            .send_command(ConversationCommand::Close)
            .await
            .expect_err("send should fail after receiver drop");
        assert!(matches!(err, RuntimeChannelError::CommandChannelClosed));
    }
}
