use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use async_trait::async_trait;
use chat_core::{
    MentionRange, Message, MessageStatus, OutgoingMessage, ReadWatermark, TypingPresence,
    watermark,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    PlatformError, PresenceSet, PresenceTransport, PushEvent, PushStream, PushSubscription,
    RemoteMessageStore, WatermarkPersistence,
};

#[derive(Default)]
struct ConversationState {
    members: BTreeSet<String>,
    // Oldest first.
    messages: Vec<Message>,
    subscribers: Vec<mpsc::UnboundedSender<PushEvent>>,
}

#[derive(Default)]
struct ServiceState {
    conversations: HashMap<String, ConversationState>,
    message_owner: HashMap<String, String>,
    watermarks: HashMap<(String, String), ReadWatermark>,
    presence: HashMap<String, watch::Sender<PresenceSet>>,
    duplicate_delivery: bool,
    fail_next_send: Option<PlatformError>,
    send_latency: Option<Duration>,
}

impl ServiceState {
    fn conversation_mut(
        &mut self,
        conversation_id: &str,
    ) -> Result<&mut ConversationState, PlatformError> {
        self.conversations
            .get_mut(conversation_id)
            .ok_or_else(|| PlatformError::NotFound(format!("conversation '{conversation_id}'")))
    }

    fn presence_sender(&mut self, conversation_id: &str) -> &watch::Sender<PresenceSet> {
        self.presence
            .entry(conversation_id.to_owned())
            .or_insert_with(|| watch::channel(PresenceSet::new()).0)
    }

    // Server timestamps are strictly increasing per conversation.
    fn next_timestamp(conversation: &ConversationState) -> DateTime<Utc> {
        let now = Utc::now();
        match conversation.messages.last() {
            Some(last) if last.created_at >= now => last.created_at + TimeDelta::milliseconds(1),
            _ => now,
        }
    }

    fn publish(&mut self, input: OutgoingMessage) -> Result<Value, PlatformError> {
        let duplicate_delivery = self.duplicate_delivery;
        let conversation = self.conversation_mut(&input.conversation_id)?;
        if !conversation.members.contains(&input.sender_id) {
            return Err(PlatformError::Forbidden(format!(
                "'{}' is not a member of '{}'",
                input.sender_id, input.conversation_id
            )));
        }

        let message = Message {
            id: format!("msg-{}", Uuid::new_v4()),
            conversation_id: input.conversation_id,
            sender_id: input.sender_id,
            content: input.content,
            created_at: Self::next_timestamp(conversation),
            updated_at: None,
            reply_to_id: input.reply_to_id,
            mentions: input.mentions,
            kind: input.kind,
            status: MessageStatus::Sent,
        };
        let record = to_record(&message)?;

        conversation.messages.push(message.clone());
        let deliveries = if duplicate_delivery { 2 } else { 1 };
        for _ in 0..deliveries {
            fan_out(conversation, PushEvent::Insert(record.clone()));
        }
        self.message_owner
            .insert(message.id.clone(), message.conversation_id.clone());

        debug!(
            conversation_id = %message.conversation_id,
            message_id = %message.id,
            "message stored"
        );
        Ok(record)
    }

    fn locate(&mut self, message_id: &str) -> Result<(&mut ConversationState, usize), PlatformError> {
        let conversation_id = self
            .message_owner
            .get(message_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("message '{message_id}'")))?;
        let conversation = self.conversation_mut(&conversation_id)?;
        let index = conversation
            .messages
            .iter()
            .position(|message| message.id == message_id)
            .ok_or_else(|| PlatformError::NotFound(format!("message '{message_id}'")))?;
        Ok((conversation, index))
    }
}

fn to_record(message: &Message) -> Result<Value, PlatformError> {
    serde_json::to_value(message).map_err(|err| PlatformError::Malformed(err.to_string()))
}

fn fan_out(conversation: &mut ConversationState, event: PushEvent) {
    conversation
        .subscribers
        .retain(|subscriber| subscriber.send(event.clone()).is_ok());
}

/// Process-local implementation of every collaborator interface.
///
/// Clones share state, so one clone can play "another client" while the
/// runtime holds the other.
#[derive(Clone, Default)]
pub struct InMemoryChatService {
    state: Arc<RwLock<ServiceState>>,
}

impl InMemoryChatService {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ServiceState>, PlatformError> {
        self.state
            .read()
            .map_err(|_| PlatformError::Backend("poisoned lock".to_owned()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ServiceState>, PlatformError> {
        self.state
            .write()
            .map_err(|_| PlatformError::Backend("poisoned lock".to_owned()))
    }

    /// Create or reset a conversation with the given members.
    pub fn create_conversation<I, S>(
        &self,
        conversation_id: &str,
        members: I,
    ) -> Result<(), PlatformError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.write()?;
        state.conversations.insert(
            conversation_id.to_owned(),
            ConversationState {
                members: members.into_iter().map(Into::into).collect(),
                ..ConversationState::default()
            },
        );
        Ok(())
    }

    /// Store a historical message as-is, without push delivery.
    pub fn seed_message(&self, message: Message) -> Result<(), PlatformError> {
        let mut state = self.write()?;
        let conversation = state.conversation_mut(&message.conversation_id)?;
        let index = conversation
            .messages
            .partition_point(|existing| existing.created_at <= message.created_at);
        conversation.messages.insert(index, message.clone());
        state.message_owner.insert(message.id, message.conversation_id);
        Ok(())
    }

    /// Post a message as another client would, pushing it to subscribers.
    pub fn inject_remote_message(&self, input: OutgoingMessage) -> Result<Message, PlatformError> {
        let record = self.write()?.publish(input)?;
        serde_json::from_value(record).map_err(|err| PlatformError::Malformed(err.to_string()))
    }

    /// Push a raw record to subscribers, bypassing storage.
    pub fn push_raw(&self, conversation_id: &str, event: PushEvent) -> Result<(), PlatformError> {
        let mut state = self.write()?;
        fan_out(state.conversation_mut(conversation_id)?, event);
        Ok(())
    }

    /// Deliver every subsequent push insert twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) -> Result<(), PlatformError> {
        self.write()?.duplicate_delivery = enabled;
        Ok(())
    }

    /// Fail the next `send_message` call with `error`.
    pub fn fail_next_send(&self, error: PlatformError) -> Result<(), PlatformError> {
        self.write()?.fail_next_send = Some(error);
        Ok(())
    }

    /// Delay every `send_message` response by `latency`.
    pub fn set_send_latency(&self, latency: Option<Duration>) -> Result<(), PlatformError> {
        self.write()?.send_latency = latency;
        Ok(())
    }

    /// Stored messages of a conversation, newest first.
    pub fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, PlatformError> {
        let state = self.read()?;
        let conversation = state
            .conversations
            .get(conversation_id)
            .ok_or_else(|| PlatformError::NotFound(format!("conversation '{conversation_id}'")))?;
        Ok(conversation.messages.iter().rev().cloned().collect())
    }

    /// Open push subscriptions for a conversation.
    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.read()
            .ok()
            .and_then(|state| {
                state.conversations.get(conversation_id).map(|conversation| {
                    conversation
                        .subscribers
                        .iter()
                        .filter(|subscriber| !subscriber.is_closed())
                        .count()
                })
            })
            .unwrap_or(0)
    }

    /// Current typing facts of a conversation.
    pub fn presence_snapshot(&self, conversation_id: &str) -> PresenceSet {
        self.read()
            .ok()
            .and_then(|state| {
                state
                    .presence
                    .get(conversation_id)
                    .map(|sender| sender.borrow().clone())
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteMessageStore for InMemoryChatService {
    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: u16,
        before: Option<&str>,
    ) -> Result<Vec<Value>, PlatformError> {
        let state = self.read()?;
        let conversation = state
            .conversations
            .get(conversation_id)
            .ok_or_else(|| PlatformError::NotFound(format!("conversation '{conversation_id}'")))?;

        let end = match before {
            Some(cursor) => conversation
                .messages
                .iter()
                .position(|message| message.id == cursor)
                .ok_or_else(|| PlatformError::NotFound(format!("cursor message '{cursor}'")))?,
            None => conversation.messages.len(),
        };

        conversation.messages[..end]
            .iter()
            .rev()
            .take(usize::from(limit))
            .map(to_record)
            .collect()
    }

    async fn send_message(&self, input: OutgoingMessage) -> Result<Value, PlatformError> {
        let latency = {
            let mut state = self.write()?;
            if let Some(error) = state.fail_next_send.take() {
                debug!(client_txn_id = %input.client_txn_id, "injected send failure");
                return Err(error);
            }
            state.send_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.write()?.publish(input)
    }

    async fn edit_message(
        &self,
        message_id: &str,
        content: &str,
        mentions: &[MentionRange],
    ) -> Result<Value, PlatformError> {
        let mut state = self.write()?;
        let (conversation, index) = state.locate(message_id)?;

        let message = &mut conversation.messages[index];
        message.content = content.to_owned();
        message.mentions = mentions.to_vec();
        message.updated_at = Some(Utc::now());
        let record = to_record(message)?;

        fan_out(conversation, PushEvent::Update(record.clone()));
        Ok(record)
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), PlatformError> {
        let mut state = self.write()?;
        let (conversation, index) = state.locate(message_id)?;
        conversation.messages.remove(index);
        fan_out(
            conversation,
            PushEvent::Delete {
                message_id: message_id.to_owned(),
            },
        );
        state.message_owner.remove(message_id);
        Ok(())
    }

    async fn list_members(&self, conversation_id: &str) -> Result<Vec<String>, PlatformError> {
        let state = self.read()?;
        state
            .conversations
            .get(conversation_id)
            .map(|conversation| conversation.members.iter().cloned().collect())
            .ok_or_else(|| PlatformError::NotFound(format!("conversation '{conversation_id}'")))
    }
}

#[async_trait]
impl PushStream for InMemoryChatService {
    async fn subscribe(&self, conversation_id: &str) -> Result<PushSubscription, PlatformError> {
        let mut state = self.write()?;
        let conversation = state.conversation_mut(conversation_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        conversation
            .subscribers
            .retain(|subscriber| !subscriber.is_closed());
        conversation.subscribers.push(tx);
        trace!(%conversation_id, "push subscriber added");
        Ok(PushSubscription::new(conversation_id, rx))
    }
}

#[async_trait]
impl WatermarkPersistence for InMemoryChatService {
    async fn get_watermark(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ReadWatermark>, PlatformError> {
        let state = self.read()?;
        Ok(state
            .watermarks
            .get(&(conversation_id.to_owned(), user_id.to_owned()))
            .cloned())
    }

    async fn set_watermark(&self, watermark: &ReadWatermark) -> Result<(), PlatformError> {
        let mut state = self.write()?;
        state.conversation_mut(&watermark.conversation_id)?;
        state.watermarks.insert(
            (
                watermark.conversation_id.clone(),
                watermark.user_id.clone(),
            ),
            watermark.clone(),
        );
        Ok(())
    }

    async fn count_unread(
        &self,
        conversation_id: &str,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, PlatformError> {
        let state = self.read()?;
        let conversation = state
            .conversations
            .get(conversation_id)
            .ok_or_else(|| PlatformError::NotFound(format!("conversation '{conversation_id}'")))?;
        Ok(watermark::count_unread(&conversation.messages, since, user_id))
    }
}

#[async_trait]
impl PresenceTransport for InMemoryChatService {
    async fn join(
        &self,
        conversation_id: &str,
        presence: TypingPresence,
    ) -> Result<(), PlatformError> {
        let mut state = self.write()?;
        state.presence_sender(conversation_id).send_modify(|set| {
            set.insert(presence.user_id.clone(), presence);
        });
        Ok(())
    }

    async fn leave(&self, conversation_id: &str, user_id: &str) -> Result<(), PlatformError> {
        let mut state = self.write()?;
        state
            .presence_sender(conversation_id)
            .send_if_modified(|set| set.remove(user_id).is_some());
        Ok(())
    }

    async fn watch(
        &self,
        conversation_id: &str,
    ) -> Result<watch::Receiver<PresenceSet>, PlatformError> {
        let mut state = self.write()?;
        Ok(state.presence_sender(conversation_id).subscribe())
    }
}

#[cfg(test)]
mod tests {
    use chat_core::{MessageKind, normalize_message_record};

    use super::*;

    fn outgoing(sender: &str, content: &str) -> OutgoingMessage {
        OutgoingMessage {
            client_txn_id: chat_core::new_client_txn_id(),
            conversation_id: "c1".into(),
            sender_id: sender.into(),
            content: content.into(),
            reply_to_id: None,
            mentions: Vec::new(),
            kind: MessageKind::Text,
        }
    }

    fn service() -> InMemoryChatService {
        let service = InMemoryChatService::new();
        service
            .create_conversation("c1", ["alice", "bob"])
            .expect("conversation should be created");
        service
    }

    #[tokio::test]
    async fn send_pushes_confirmed_record_to_subscribers() {
        let service = service();
        let mut subscription = service.subscribe("c1").await.expect("subscribe should work");

        let record = service
            .send_message(outgoing("alice", "hello"))
            .await
            .expect("send should work");
        let pushed = subscription.next().await.expect("push should arrive");

        assert_eq!(pushed, PushEvent::Insert(record.clone()));
        let message = normalize_message_record(record).expect("record should normalize");
        assert_eq!(message.status, MessageStatus::Sent);
        assert!(message.id.starts_with("msg-"));
    }

    #[tokio::test]
    async fn duplicate_delivery_pushes_inserts_twice() {
        let service = service();
        service
            .set_duplicate_delivery(true)
            .expect("toggle should work");
        let mut subscription = service.subscribe("c1").await.expect("subscribe should work");

        service
            .inject_remote_message(outgoing("bob", "hi"))
            .expect("inject should work");

        let first = subscription.next().await.expect("first push");
        let second = subscription.next().await.expect("second push");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn rejects_non_members_and_injected_failures() {
        let service = service();

        let err = service
            .send_message(outgoing("mallory", "hey"))
            .await
            .expect_err("non-member send should fail");
        assert!(matches!(err, PlatformError::Forbidden(_)));

        service
            .fail_next_send(PlatformError::Unavailable("offline".into()))
            .expect("failure injection should work");
        let err = service
            .send_message(outgoing("alice", "hey"))
            .await
            .expect_err("injected failure should surface");
        assert_eq!(err, PlatformError::Unavailable("offline".into()));

        service
            .send_message(outgoing("alice", "hey"))
            .await
            .expect("failure applies to one send only");
    }

    #[tokio::test]
    async fn lists_pages_newest_first_before_cursor() {
        let service = service();
        for index in 0..5 {
            service
                .inject_remote_message(outgoing("bob", &format!("m{index}")))
                .expect("inject should work");
        }

        let page = service
            .list_messages("c1", 2, None)
            .await
            .expect("list should work");
        let first: Vec<Message> = page
            .into_iter()
            .map(|record| normalize_message_record(record).expect("record should normalize"))
            .collect();
        assert_eq!(first[0].content, "m4");
        assert_eq!(first[1].content, "m3");

        let page = service
            .list_messages("c1", 10, Some(&first[1].id))
            .await
            .expect("list should work");
        assert_eq!(page.len(), 3);
    }

    #[tokio::test]
    async fn edit_and_delete_push_changes() {
        let service = service();
        let message = service
            .inject_remote_message(outgoing("bob", "helo"))
            .expect("inject should work");
        let mut subscription = service.subscribe("c1").await.expect("subscribe should work");

        service
            .edit_message(&message.id, "hello", &[])
            .await
            .expect("edit should work");
        match subscription.next().await.expect("update push") {
            PushEvent::Update(record) => assert_eq!(record["content"], "hello"),
            other => panic!("unexpected push: {other:?}"),
        }

        service
            .delete_message(&message.id)
            .await
            .expect("delete should work");
        assert_eq!(
            subscription.next().await,
            Some(PushEvent::Delete {
                message_id: message.id.clone()
            })
        );
        assert!(
            service
                .delete_message(&message.id)
                .await
                .is_err_and(|err| matches!(err, PlatformError::NotFound(_)))
        );
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let service = service();
        let subscription = service.subscribe("c1").await.expect("subscribe should work");
        assert_eq!(service.subscriber_count("c1"), 1);

        drop(subscription);
        assert_eq!(service.subscriber_count("c1"), 0);
        service
            .inject_remote_message(outgoing("bob", "anyone?"))
            .expect("inject should work");
    }

    #[tokio::test]
    async fn counts_unread_after_watermark() {
        let service = service();
        let first = service
            .inject_remote_message(outgoing("bob", "one"))
            .expect("inject should work");
        service
            .inject_remote_message(outgoing("alice", "two"))
            .expect("inject should work");
        service
            .inject_remote_message(outgoing("bob", "three"))
            .expect("inject should work");

        assert_eq!(
            service
                .count_unread("c1", "alice", None)
                .await
                .expect("count should work"),
            2
        );

        let watermark = ReadWatermark::at("alice", &first);
        service
            .set_watermark(&watermark)
            .await
            .expect("set should work");
        let stored = service
            .get_watermark("c1", "alice")
            .await
            .expect("get should work");
        assert_eq!(stored, Some(watermark.clone()));
        assert_eq!(
            service
                .count_unread("c1", "alice", Some(watermark.last_read_at))
                .await
                .expect("count should work"),
            1
        );
    }

    #[tokio::test]
    async fn presence_join_and_leave_update_watchers() {
        let service = service();
        let mut watcher = service.watch("c1").await.expect("watch should work");

        service
            .join(
                "c1",
                TypingPresence {
                    user_id: "bob".into(),
                    user_name: "Bob".into(),
                    timestamp: Utc::now(),
                },
            )
            .await
            .expect("join should work");
        watcher.changed().await.expect("watch should fire");
        assert!(watcher.borrow_and_update().contains_key("bob"));

        service.leave("c1", "bob").await.expect("leave should work");
        watcher.changed().await.expect("watch should fire");
        assert!(watcher.borrow().is_empty());
        assert!(service.presence_snapshot("c1").is_empty());
    }
}
