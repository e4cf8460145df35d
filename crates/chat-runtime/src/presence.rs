//! Ephemeral typing facts with automatic expiry.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chat_core::TypingPresence;
use chat_platform::{PlatformError, PresenceSet, PresenceTransport};
use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type PresenceKey = (String, String);

#[derive(Debug)]
struct ExpiryTimer {
    generation: u64,
    stop: CancellationToken,
}

#[derive(Debug, Default)]
struct TimerTable {
    next_generation: u64,
    timers: HashMap<PresenceKey, ExpiryTimer>,
}

/// Publishes typing facts over a [`PresenceTransport`] and retracts them
/// after a window of inactivity.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    transport: Arc<dyn PresenceTransport>,
    expiry: Duration,
    table: Arc<Mutex<TimerTable>>,
}

impl PresenceBroadcaster {
    pub fn new(transport: Arc<dyn PresenceTransport>, expiry: Duration) -> Self {
        Self {
            transport,
            expiry,
            table: Arc::new(Mutex::new(TimerTable::default())),
        }
    }

    /// Publish or refresh a typing fact. The expiry window restarts on
    /// every call.
    pub async fn start_typing(
        &self,
        conversation_id: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<(), PlatformError> {
        let key = (conversation_id.to_owned(), user_id.to_owned());
        let stop = CancellationToken::new();
        let generation = {
            let mut table = self.table.lock().await;
            table.next_generation += 1;
            let generation = table.next_generation;
            if let Some(previous) = table.timers.insert(
                key.clone(),
                ExpiryTimer {
                    generation,
                    stop: stop.clone(),
                },
            ) {
                previous.stop.cancel();
            }
            generation
        };

        self.transport
            .join(
                conversation_id,
                TypingPresence {
                    user_id: user_id.to_owned(),
                    user_name: user_name.to_owned(),
                    timestamp: Utc::now(),
                },
            )
            .await?;

        let transport = Arc::clone(&self.transport);
        let table = Arc::clone(&self.table);
        let expiry = self.expiry;
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(expiry) => {
                    {
                        let mut table = table.lock().await;
                        let current = table
                            .timers
                            .get(&key)
                            .is_some_and(|timer| timer.generation == generation);
                        if !current {
                            return;
                        }
                        table.timers.remove(&key);
                    }
                    let (conversation_id, user_id) = key;
                    debug!(%conversation_id, %user_id, "typing fact expired");
                    if let Err(err) = transport.leave(&conversation_id, &user_id).await {
                        warn!(%conversation_id, %user_id, error = %err, "failed to retract expired typing fact");
                    }
                }
            }
        });

        trace!(%conversation_id, %user_id, generation, "typing fact published");
        Ok(())
    }

    /// Retract a typing fact early, for example on send.
    pub async fn stop_typing(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<(), PlatformError> {
        let removed = self
            .table
            .lock()
            .await
            .timers
            .remove(&(conversation_id.to_owned(), user_id.to_owned()));
        let Some(timer) = removed else {
            return Ok(());
        };
        timer.stop.cancel();
        self.transport.leave(conversation_id, user_id).await
    }

    /// Retract every fact this broadcaster published in a conversation and
    /// cancel their timers.
    pub async fn cancel_conversation(&self, conversation_id: &str) -> Result<(), PlatformError> {
        let cancelled: Vec<String> = {
            let mut table = self.table.lock().await;
            let keys: Vec<PresenceKey> = table
                .timers
                .keys()
                .filter(|(conversation, _)| conversation == conversation_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    let timer = table.timers.remove(&key)?;
                    timer.stop.cancel();
                    Some(key.1)
                })
                .collect()
        };

        for user_id in cancelled {
            self.transport.leave(conversation_id, &user_id).await?;
        }
        Ok(())
    }

    /// Live typing set of a conversation as seen by `viewer_id`.
    pub async fn subscribe(
        &self,
        conversation_id: &str,
        viewer_id: &str,
    ) -> Result<TypingSubscription, PlatformError> {
        let receiver = self.transport.watch(conversation_id).await?;
        Ok(TypingSubscription {
            conversation_id: conversation_id.to_owned(),
            viewer_id: viewer_id.to_owned(),
            receiver,
        })
    }
}

/// Typing facts of other users in one conversation.
#[derive(Debug)]
pub struct TypingSubscription {
    conversation_id: String,
    viewer_id: String,
    receiver: watch::Receiver<PresenceSet>,
}

impl TypingSubscription {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Current set, excluding the viewer's own fact.
    pub fn current(&mut self) -> Vec<TypingPresence> {
        let set = self.receiver.borrow_and_update();
        set.values()
            .filter(|presence| presence.user_id != self.viewer_id)
            .cloned()
            .collect()
    }

    /// Wait for the next membership change. `None` once the transport is gone.
    pub async fn changed(&mut self) -> Option<Vec<TypingPresence>> {
        self.receiver.changed().await.ok()?;
        Some(self.current())
    }
}
