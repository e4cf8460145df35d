use std::{collections::HashSet, sync::Arc, time::Duration};

use chat_core::{
    ChatError, ChatErrorCategory, ConversationCommand, ConversationEvent, ConversationTimeline,
    EventSink, EventStream, MentionRange, Message, MessageKind, OutgoingMessage,
    PENDING_ID_PREFIX, RuntimeChannelError, RuntimeChannels, RuntimeConfig, SendOutcome,
    SessionStateMachine, TimelineEvent, TimelineMergeError, TypingPresence, dividers,
    normalize_fatal_error, normalize_message_record, normalize_send_outcome,
};
use chat_platform::{
    PlatformError, PresenceTransport, PushEvent, PushStream, PushSubscription,
    RemoteMessageStore, WatermarkPersistence,
};
use chrono::{FixedOffset, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

mod presence;
mod watermark_store;

pub use presence::{PresenceBroadcaster, TypingSubscription};
pub use watermark_store::{MarkReadOutcome, UnreadSnapshot, WatermarkStore};

/// Identity of the user driving a conversation view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: String,
    pub user_name: String,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

/// Collaborators a runtime talks to.
#[derive(Clone)]
pub struct ConversationServices {
    pub messages: Arc<dyn RemoteMessageStore>,
    pub push: Arc<dyn PushStream>,
    pub watermarks: Arc<dyn WatermarkPersistence>,
    pub presence: Arc<dyn PresenceTransport>,
}

impl ConversationServices {
    /// Use one service for every collaborator role.
    pub fn from_shared<S>(service: S) -> Self
    where
        S: RemoteMessageStore + PushStream + WatermarkPersistence + PresenceTransport + 'static,
    {
        let shared = Arc::new(service);
        Self {
            messages: shared.clone(),
            push: shared.clone(),
            watermarks: shared.clone(),
            presence: shared,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub config: RuntimeConfig,
    /// Fixed offset for calendar-day comparison; the host zone when `None`.
    pub utc_offset: Option<FixedOffset>,
}

#[derive(Clone, Debug)]
pub struct ConversationHandle {
    channels: RuntimeChannels,
}

impl ConversationHandle {
    pub async fn send(&self, command: ConversationCommand) -> Result<(), RuntimeChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Spawn the single-owner actor for one conversation view.
pub fn spawn_conversation_runtime(
    context: SessionContext,
    services: ConversationServices,
    options: RuntimeOptions,
) -> ConversationHandle {
    let (channels, command_rx) = RuntimeChannels::new(
        options.config.command_buffer,
        options.config.event_buffer,
    );
    let runtime = ConversationRuntime::new(
        context,
        services,
        options,
        channels.event_sink(),
        command_rx,
    );
    tokio::spawn(async move {
        runtime.run().await;
    });

    ConversationHandle { channels }
}

#[derive(Debug)]
struct SendCompletion {
    conversation_id: String,
    client_txn_id: String,
    placeholder_id: String,
    result: Result<Value, PlatformError>,
}

struct MountedConversation {
    timeline: ConversationTimeline,
    members: HashSet<String>,
}

struct ConversationRuntime {
    context: SessionContext,
    options: RuntimeOptions,
    events: EventSink,
    command_rx: mpsc::Receiver<ConversationCommand>,
    completion_tx: mpsc::UnboundedSender<SendCompletion>,
    completion_rx: mpsc::UnboundedReceiver<SendCompletion>,
    state_machine: SessionStateMachine,
    messages: Arc<dyn RemoteMessageStore>,
    push_stream: Arc<dyn PushStream>,
    watermarks: WatermarkStore,
    presence: PresenceBroadcaster,
    mounted: Option<MountedConversation>,
    push: Option<PushSubscription>,
    typing: Option<TypingSubscription>,
}

impl ConversationRuntime {
    fn new(
        context: SessionContext,
        services: ConversationServices,
        options: RuntimeOptions,
        events: EventSink,
        command_rx: mpsc::Receiver<ConversationCommand>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let expiry = Duration::from_millis(options.config.typing_expiry_ms);
        Self {
            context,
            events,
            command_rx,
            completion_tx,
            completion_rx,
            state_machine: SessionStateMachine::default(),
            messages: services.messages,
            push_stream: services.push,
            watermarks: WatermarkStore::new(services.watermarks),
            presence: PresenceBroadcaster::new(services.presence, expiry),
            mounted: None,
            push: None,
            typing: None,
            options,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if let Err(err) = self.handle_command(command).await {
                        self.events.emit(normalize_fatal_error(err));
                    }
                }
                Some(completion) = self.completion_rx.recv() => {
                    self.handle_send_completion(completion).await;
                }
                event = next_push(&mut self.push), if self.push.is_some() => {
                    self.handle_push(event).await;
                }
                users = next_typing(&mut self.typing), if self.typing.is_some() => {
                    self.handle_typing_change(users);
                }
            }
        }

        if let Some(conversation_id) = self.mounted_id()
            && let Err(err) = self.presence.cancel_conversation(&conversation_id).await
        {
            warn!(%conversation_id, error = %err, "failed to retract typing on shutdown");
        }
        debug!(user_id = %self.context.user_id, "conversation runtime stopped");
    }

    async fn handle_command(&mut self, command: ConversationCommand) -> Result<(), ChatError> {
        match command {
            ConversationCommand::Open { conversation_id } => {
                self.handle_open(conversation_id).await
            }
            ConversationCommand::LoadOlder { limit } => self.handle_load_older(limit).await,
            ConversationCommand::Send {
                client_txn_id,
                content,
                reply_to_id,
                mentions,
                kind,
            } => {
                self.handle_send(client_txn_id, content, reply_to_id, mentions, kind)
                    .await;
                Ok(())
            }
            ConversationCommand::Edit {
                message_id,
                content,
                mentions,
            } => self.handle_edit(message_id, content, mentions).await,
            ConversationCommand::Delete { message_id } => self.handle_delete(message_id).await,
            ConversationCommand::MarkRead { message_id } => {
                self.handle_mark_read(message_id).await
            }
            ConversationCommand::StartTyping => self.handle_start_typing().await,
            ConversationCommand::StopTyping => self.handle_stop_typing().await,
            ConversationCommand::Close => self.handle_close().await,
        }
    }

    async fn handle_open(&mut self, conversation_id: String) -> Result<(), ChatError> {
        let (candidate, transition_events) =
            self.validate_transition(ConversationCommand::Open {
                conversation_id: String::new(),
            })?;

        self.unmount().await;
        self.commit_transition(candidate, transition_events);

        match self.mount(&conversation_id).await {
            Ok(()) => {
                self.finish_open(true);
                info!(%conversation_id, user_id = %self.context.user_id, "conversation opened");
                self.publish_timeline().await;
                self.publish_typing();
                Ok(())
            }
            Err(err) => {
                self.unmount().await;
                self.finish_open(false);
                Err(err)
            }
        }
    }

    async fn mount(&mut self, conversation_id: &str) -> Result<(), ChatError> {
        // Subscribe before the history read so no insert falls between them.
        self.push = Some(
            self.push_stream
                .subscribe(conversation_id)
                .await
                .map_err(|err| map_platform_error("subscribe", err))?,
        );

        let limit = ConversationTimeline::bounded_page_limit(
            self.options.config.open_limit,
            self.options.config.page_limit_cap,
        );
        let records = self
            .messages
            .list_messages(conversation_id, limit, None)
            .await
            .map_err(|err| map_platform_error("list_messages", err))?;
        let members = self
            .messages
            .list_members(conversation_id)
            .await
            .map_err(|err| map_platform_error("list_members", err))?;

        let mut timeline =
            ConversationTimeline::new(conversation_id, self.options.config.timeline_max_items);
        timeline
            .load_older(normalize_page(records))
            .map_err(map_merge_error)?;

        self.typing = Some(
            self.presence
                .subscribe(conversation_id, &self.context.user_id)
                .await
                .map_err(|err| map_platform_error("watch_presence", err))?,
        );
        self.mounted = Some(MountedConversation {
            timeline,
            members: members.into_iter().collect(),
        });
        Ok(())
    }

    async fn handle_load_older(&mut self, limit: u16) -> Result<(), ChatError> {
        let (candidate, transition_events) =
            self.validate_transition(ConversationCommand::LoadOlder { limit })?;
        self.commit_transition(candidate, transition_events);

        let mounted = self.require_mounted()?;
        let conversation_id = mounted.timeline.conversation_id().to_owned();
        let cursor = mounted.timeline.oldest_confirmed_id().map(str::to_owned);
        let limit =
            ConversationTimeline::bounded_page_limit(limit, self.options.config.page_limit_cap);

        let records = self
            .messages
            .list_messages(&conversation_id, limit, cursor.as_deref())
            .await
            .map_err(|err| map_platform_error("list_messages", err))?;
        let added = self
            .require_mounted_mut()?
            .timeline
            .load_older(normalize_page(records))
            .map_err(map_merge_error)?;

        debug!(%conversation_id, limit, added, "older history loaded");
        if added > 0 {
            self.publish_timeline().await;
        }
        Ok(())
    }

    async fn handle_send(
        &mut self,
        client_txn_id: String,
        content: String,
        reply_to_id: Option<String>,
        mentions: Vec<MentionRange>,
        kind: MessageKind,
    ) {
        match self.prepare_send(&client_txn_id, content, reply_to_id, mentions, kind) {
            Ok(outgoing) => {
                let conversation_id = outgoing.conversation_id.clone();
                if let Err(err) = self
                    .presence
                    .stop_typing(&conversation_id, &self.context.user_id)
                    .await
                {
                    warn!(%conversation_id, error = %err, "failed to retract typing on send");
                }
                self.publish_timeline().await;

                let messages = Arc::clone(&self.messages);
                let completion_tx = self.completion_tx.clone();
                let placeholder_id = outgoing.client_txn_id.clone();
                tokio::spawn(async move {
                    let result = messages.send_message(outgoing).await;
                    let _ = completion_tx.send(SendCompletion {
                        conversation_id,
                        client_txn_id,
                        placeholder_id,
                        result,
                    });
                });
            }
            Err(error) => {
                debug!(%client_txn_id, code = %error.code, "send rejected locally");
                self.events.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failure { error },
                ));
            }
        }
    }

    fn prepare_send(
        &mut self,
        client_txn_id: &str,
        content: String,
        reply_to_id: Option<String>,
        mentions: Vec<MentionRange>,
        kind: MessageKind,
    ) -> Result<OutgoingMessage, ChatError> {
        let (candidate, transition_events) =
            self.validate_transition(ConversationCommand::Send {
                client_txn_id: String::new(),
                content: String::new(),
                reply_to_id: None,
                mentions: Vec::new(),
                kind,
            })?;
        self.commit_transition(candidate, transition_events);

        if kind == MessageKind::Text && content.trim().is_empty() {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "empty_message",
                "text messages need content",
            ));
        }

        let user_id = self.context.user_id.clone();
        let mounted = self.require_mounted_mut()?;
        let conversation_id = mounted.timeline.conversation_id().to_owned();
        if !mounted.members.contains(&user_id) {
            return Err(ChatError::new(
                ChatErrorCategory::Auth,
                "not_a_member",
                format!("'{user_id}' is not a member of '{conversation_id}'"),
            ));
        }

        let outgoing = OutgoingMessage {
            client_txn_id: placeholder_id(client_txn_id),
            conversation_id,
            sender_id: user_id,
            content,
            reply_to_id: reply_to_id.filter(|value| !value.trim().is_empty()),
            mentions,
            kind,
        };
        mounted
            .timeline
            .append(Message::pending(&outgoing, Utc::now()))
            .map_err(|err| match err {
                TimelineMergeError::DuplicatePlaceholder(id) => ChatError::new(
                    ChatErrorCategory::Config,
                    "duplicate_transaction",
                    format!("transaction '{id}' is already pending"),
                ),
                other => map_merge_error(other),
            })?;
        Ok(outgoing)
    }

    async fn handle_send_completion(&mut self, completion: SendCompletion) {
        let SendCompletion {
            conversation_id,
            client_txn_id,
            placeholder_id,
            result,
        } = completion;
        let mounted_here = self.mounted_id().as_deref() == Some(conversation_id.as_str());

        let outcome = result
            .map_err(|err| map_platform_error("send_message", err))
            .and_then(normalize_message_record);

        match outcome {
            Ok(message) => {
                debug!(%conversation_id, %client_txn_id, message_id = %message.id, "send confirmed");
                self.events.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Success {
                        message_id: message.id.clone(),
                    },
                ));
                if mounted_here {
                    self.apply_timeline_event(TimelineEvent::Confirmed(message))
                        .await;
                }
            }
            Err(error) => {
                warn!(%conversation_id, %client_txn_id, code = %error.code, "send failed");
                self.events.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failure { error },
                ));
                if mounted_here {
                    self.apply_timeline_event(TimelineEvent::SendFailed {
                        pending_id: placeholder_id,
                    })
                    .await;
                }
            }
        }
    }

    async fn handle_edit(
        &mut self,
        message_id: String,
        content: String,
        mentions: Vec<MentionRange>,
    ) -> Result<(), ChatError> {
        let (candidate, transition_events) =
            self.validate_transition(ConversationCommand::Edit {
                message_id: String::new(),
                content: String::new(),
                mentions: Vec::new(),
            })?;
        self.commit_transition(candidate, transition_events);
        self.require_authored(&message_id)?;

        let record = self
            .messages
            .edit_message(&message_id, &content, &mentions)
            .await
            .map_err(|err| map_platform_error("edit_message", err))?;
        let message = normalize_message_record(record)?;

        let outcome = self
            .require_mounted_mut()?
            .timeline
            .on_updated(message)
            .map_err(map_merge_error)?;
        if outcome.changed() {
            self.publish_timeline().await;
        }
        Ok(())
    }

    async fn handle_delete(&mut self, message_id: String) -> Result<(), ChatError> {
        let (candidate, transition_events) =
            self.validate_transition(ConversationCommand::Delete {
                message_id: String::new(),
            })?;
        self.commit_transition(candidate, transition_events);
        self.require_authored(&message_id)?;

        self.messages
            .delete_message(&message_id)
            .await
            .map_err(|err| map_platform_error("delete_message", err))?;

        if self
            .require_mounted_mut()?
            .timeline
            .on_delete(&message_id)
            .changed()
        {
            self.publish_timeline().await;
        }
        Ok(())
    }

    async fn handle_mark_read(&mut self, message_id: String) -> Result<(), ChatError> {
        let (candidate, transition_events) =
            self.validate_transition(ConversationCommand::MarkRead {
                message_id: String::new(),
            })?;
        self.commit_transition(candidate, transition_events);

        let mounted = self.require_mounted()?;
        let conversation_id = mounted.timeline.conversation_id().to_owned();
        let target = resident_message(mounted, &message_id)?.clone();
        if target.is_pending() {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "message_pending",
                format!("message '{message_id}' is not confirmed yet"),
            ));
        }

        let outcome = self
            .watermarks
            .mark_read(&conversation_id, &self.context.user_id, &target)
            .await
            .map_err(|err| map_platform_error("mark_read", err))?;
        if matches!(outcome, MarkReadOutcome::Advanced(_)) {
            self.publish_timeline().await;
        }
        Ok(())
    }

    async fn handle_start_typing(&mut self) -> Result<(), ChatError> {
        let (candidate, transition_events) =
            self.validate_transition(ConversationCommand::StartTyping)?;
        self.commit_transition(candidate, transition_events);

        let conversation_id = self.require_mounted()?.timeline.conversation_id().to_owned();
        self.presence
            .start_typing(
                &conversation_id,
                &self.context.user_id,
                &self.context.user_name,
            )
            .await
            .map_err(|err| map_platform_error("start_typing", err))
    }

    async fn handle_stop_typing(&mut self) -> Result<(), ChatError> {
        let (candidate, transition_events) =
            self.validate_transition(ConversationCommand::StopTyping)?;
        self.commit_transition(candidate, transition_events);

        let conversation_id = self.require_mounted()?.timeline.conversation_id().to_owned();
        self.presence
            .stop_typing(&conversation_id, &self.context.user_id)
            .await
            .map_err(|err| map_platform_error("stop_typing", err))
    }

    async fn handle_close(&mut self) -> Result<(), ChatError> {
        let (candidate, transition_events) = self.validate_transition(ConversationCommand::Close)?;
        self.unmount().await;
        self.commit_transition(candidate, transition_events);
        Ok(())
    }

    async fn handle_push(&mut self, event: Option<PushEvent>) {
        let Some(event) = event else {
            let conversation_id = self.mounted_id().unwrap_or_default();
            warn!(%conversation_id, "push stream ended");
            self.push = None;
            self.events.emit(ConversationEvent::FatalError {
                code: "push_stream_closed".to_owned(),
                message: format!("push stream for '{conversation_id}' ended"),
                recoverable: true,
            });
            return;
        };

        let timeline_event = match event {
            PushEvent::Insert(record) => self
                .accept_pushed_record(record)
                .map(TimelineEvent::Confirmed),
            PushEvent::Update(record) => self
                .accept_pushed_record(record)
                .map(TimelineEvent::Updated),
            PushEvent::Delete { message_id } => {
                trace!(%message_id, "pushed delete received");
                Some(TimelineEvent::Deleted { message_id })
            }
        };
        if let Some(timeline_event) = timeline_event {
            self.apply_timeline_event(timeline_event).await;
        }
    }

    // Malformed or foreign records never reach the timeline.
    fn accept_pushed_record(&self, record: Value) -> Option<Message> {
        let mounted_id = self.mounted_id()?;
        match normalize_message_record(record) {
            Ok(message) if message.conversation_id == mounted_id => Some(message),
            Ok(message) => {
                warn!(
                    expected = %mounted_id,
                    actual = %message.conversation_id,
                    message_id = %message.id,
                    "dropping pushed record for another conversation"
                );
                None
            }
            Err(err) => {
                warn!(conversation_id = %mounted_id, error = %err, "dropping malformed pushed record");
                None
            }
        }
    }

    async fn apply_timeline_event(&mut self, event: TimelineEvent) {
        let Some(mounted) = self.mounted.as_mut() else {
            return;
        };
        match mounted.timeline.apply_events(std::slice::from_ref(&event)) {
            Ok(outcomes) if outcomes.iter().any(|outcome| outcome.changed()) => {
                self.publish_timeline().await;
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "timeline event rejected"),
        }
    }

    fn handle_typing_change(&mut self, users: Option<Vec<TypingPresence>>) {
        match users {
            Some(users) => {
                if let Some(conversation_id) = self.mounted_id() {
                    self.events.emit(ConversationEvent::TypingChanged {
                        conversation_id,
                        users,
                    });
                }
            }
            None => {
                warn!("presence transport closed");
                self.typing = None;
            }
        }
    }

    async fn publish_timeline(&mut self) {
        let Some(mounted) = self.mounted.as_ref() else {
            return;
        };
        let conversation_id = mounted.timeline.conversation_id().to_owned();
        let snapshot = match self
            .watermarks
            .snapshot(
                &conversation_id,
                &self.context.user_id,
                mounted.timeline.messages(),
            )
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.events
                    .emit(normalize_fatal_error(map_platform_error("unread_state", err)));
                return;
            }
        };

        let messages = mounted.timeline.messages();
        let unread = usize::try_from(snapshot.unread_count).unwrap_or(usize::MAX);
        let items = match self.options.utc_offset {
            Some(offset) => {
                dividers::compose_in(&offset, messages, unread, snapshot.watermark.as_ref())
            }
            None => dividers::compose(messages, unread, snapshot.watermark.as_ref()),
        };

        trace!(
            %conversation_id,
            items = items.len(),
            unread_count = snapshot.unread_count,
            "timeline published"
        );
        self.events.emit(ConversationEvent::TimelineUpdated {
            conversation_id,
            items,
            unread_count: snapshot.unread_count,
            latest_unread_mention_id: snapshot.latest_unread_mention_id,
        });
    }

    fn publish_typing(&mut self) {
        let Some(typing) = self.typing.as_mut() else {
            return;
        };
        let users = typing.current();
        let conversation_id = typing.conversation_id().to_owned();
        self.events.emit(ConversationEvent::TypingChanged {
            conversation_id,
            users,
        });
    }

    // In-flight sends are left running; they still produce a SendAck.
    async fn unmount(&mut self) {
        self.push = None;
        self.typing = None;
        let Some(mounted) = self.mounted.take() else {
            return;
        };
        let conversation_id = mounted.timeline.conversation_id();
        if let Err(err) = self.presence.cancel_conversation(conversation_id).await {
            warn!(%conversation_id, error = %err, "failed to retract typing on unmount");
        }
        debug!(%conversation_id, "conversation unmounted");
    }

    fn finish_open(&mut self, success: bool) {
        if let Ok(state_event) = self.state_machine.on_open_result(success) {
            self.events.emit(state_event);
        }
    }

    fn validate_transition(
        &self,
        command: ConversationCommand,
    ) -> Result<(SessionStateMachine, Vec<ConversationEvent>), ChatError> {
        let mut candidate = self.state_machine.clone();
        let events = candidate.apply(&command)?;
        Ok((candidate, events))
    }

    fn commit_transition(
        &mut self,
        candidate: SessionStateMachine,
        events: Vec<ConversationEvent>,
    ) {
        self.state_machine = candidate;
        for event in events {
            self.events.emit(event);
        }
    }

    fn mounted_id(&self) -> Option<String> {
        self.mounted
            .as_ref()
            .map(|mounted| mounted.timeline.conversation_id().to_owned())
    }

    fn require_mounted(&self) -> Result<&MountedConversation, ChatError> {
        self.mounted.as_ref().ok_or_else(not_mounted)
    }

    fn require_mounted_mut(&mut self) -> Result<&mut MountedConversation, ChatError> {
        self.mounted.as_mut().ok_or_else(not_mounted)
    }

    fn require_authored(&self, message_id: &str) -> Result<(), ChatError> {
        let message = resident_message(self.require_mounted()?, message_id)?;
        if message.sender_id != self.context.user_id {
            return Err(ChatError::new(
                ChatErrorCategory::Auth,
                "not_message_author",
                format!("message '{message_id}' belongs to another user"),
            ));
        }
        if message.is_pending() {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "message_pending",
                format!("message '{message_id}' is not confirmed yet"),
            ));
        }
        Ok(())
    }
}

async fn next_push(push: &mut Option<PushSubscription>) -> Option<PushEvent> {
    match push {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn next_typing(typing: &mut Option<TypingSubscription>) -> Option<Vec<TypingPresence>> {
    match typing {
        Some(subscription) => subscription.changed().await,
        None => std::future::pending().await,
    }
}

fn placeholder_id(client_txn_id: &str) -> String {
    if client_txn_id.starts_with(PENDING_ID_PREFIX) {
        client_txn_id.to_owned()
    } else {
        format!("{PENDING_ID_PREFIX}{client_txn_id}")
    }
}

fn normalize_page(records: Vec<Value>) -> Vec<Message> {
    records
        .into_iter()
        .filter_map(|record| match normalize_message_record(record) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(error = %err, "skipping malformed history record");
                None
            }
        })
        .collect()
}

fn resident_message<'a>(
    mounted: &'a MountedConversation,
    message_id: &str,
) -> Result<&'a Message, ChatError> {
    mounted.timeline.get(message_id).ok_or_else(|| {
        ChatError::new(
            ChatErrorCategory::NotFound,
            "message_not_found",
            format!("message '{message_id}' is not in the loaded timeline"),
        )
    })
}

fn not_mounted() -> ChatError {
    ChatError::new(
        ChatErrorCategory::Internal,
        "conversation_not_mounted",
        "no conversation is mounted",
    )
}

fn map_merge_error(err: TimelineMergeError) -> ChatError {
    ChatError::new(
        ChatErrorCategory::Internal,
        "timeline_merge_error",
        err.to_string(),
    )
}

fn map_platform_error(operation: &str, err: PlatformError) -> ChatError {
    match err {
        PlatformError::NotFound(message) => ChatError::new(
            ChatErrorCategory::NotFound,
            "not_found",
            format!("{operation}: {message}"),
        ),
        PlatformError::Forbidden(message) => ChatError::new(
            ChatErrorCategory::Auth,
            "forbidden",
            format!("{operation}: {message}"),
        ),
        PlatformError::Unavailable(message) => ChatError::new(
            ChatErrorCategory::Network,
            "unavailable",
            format!("{operation}: {message}"),
        ),
        PlatformError::Backend(message) => ChatError::new(
            ChatErrorCategory::Internal,
            "backend_failure",
            format!("{operation}: {message}"),
        ),
        PlatformError::Malformed(message) => ChatError::new(
            ChatErrorCategory::Serialization,
            "malformed_record",
            format!("{operation}: {message}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use chat_core::{MessageStatus, RenderItem, SessionLifecycleState};
    use chat_platform::InMemoryChatService;
    use chrono::{DateTime, TimeZone};
    use tokio::{sync::broadcast, time::timeout};

    use super::*;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn history(id: &str, sender: &str, created_at: DateTime<Utc>) -> Message {
        Message {
            id: id.to_owned(),
            conversation_id: "c1".to_owned(),
            sender_id: sender.to_owned(),
            content: format!("message {id}"),
            created_at,
            updated_at: None,
            reply_to_id: None,
            mentions: Vec::new(),
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
        }
    }

    fn seeded_service() -> InMemoryChatService {
        let service = InMemoryChatService::new();
        service
            .create_conversation("c1", ["alice", "bob"])
            .expect("conversation should be created");
        service
            .create_conversation("c2", ["alice", "carol"])
            .expect("conversation should be created");

        let mut mention = history("m2", "bob", at(9, 18, 0));
        mention.content = "@Alice ping".into();
        mention.mentions = vec![MentionRange {
            user_id: "alice".into(),
            display: "@Alice".into(),
            start: 0,
            end: 6,
        }];
        for message in [
            history("m1", "bob", at(9, 17, 0)),
            mention,
            history("m3", "bob", at(10, 9, 50)),
        ] {
            service.seed_message(message).expect("seed should work");
        }
        service
    }

    fn spawn(service: &InMemoryChatService) -> ConversationHandle {
        spawn_conversation_runtime(
            SessionContext::new("alice", "Alice"),
            ConversationServices::from_shared(service.clone()),
            RuntimeOptions {
                utc_offset: FixedOffset::east_opt(0),
                ..RuntimeOptions::default()
            },
        )
    }

    async fn next_matching<F>(
        events: &mut broadcast::Receiver<ConversationEvent>,
        mut predicate: F,
    ) -> ConversationEvent
    where
        F: FnMut(&ConversationEvent) -> bool,
    {
        loop {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event timeout")
                .expect("event receive");
            if predicate(&event) {
                return event;
            }
        }
    }

    async fn next_timeline(
        events: &mut broadcast::Receiver<ConversationEvent>,
    ) -> (Vec<RenderItem>, u64, Option<String>) {
        match next_matching(events, |event| {
            matches!(event, ConversationEvent::TimelineUpdated { .. })
        })
        .await
        {
            ConversationEvent::TimelineUpdated {
                items,
                unread_count,
                latest_unread_mention_id,
                ..
            } => (items, unread_count, latest_unread_mention_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn message_ids(items: &[RenderItem]) -> Vec<String> {
        items
            .iter()
            .filter_map(RenderItem::as_message)
            .map(|message| message.id.clone())
            .collect()
    }

    async fn open(handle: &ConversationHandle, conversation_id: &str) {
        handle
            .send(ConversationCommand::Open {
                conversation_id: conversation_id.to_owned(),
            })
            .await
            .expect("command should enqueue");
    }

    async fn send_text(handle: &ConversationHandle, client_txn_id: &str, content: &str) {
        handle
            .send(ConversationCommand::Send {
                client_txn_id: client_txn_id.to_owned(),
                content: content.to_owned(),
                reply_to_id: None,
                mentions: Vec::new(),
                kind: MessageKind::Text,
            })
            .await
            .expect("command should enqueue");
    }

    #[tokio::test]
    async fn open_publishes_history_with_dividers() {
        let service = seeded_service();
        let handle = spawn(&service);
        let mut events = handle.subscribe();

        open(&handle, "c1").await;

        let first = next_matching(&mut events, |_| true).await;
        assert_eq!(
            first,
            ConversationEvent::StateChanged {
                state: SessionLifecycleState::Opening
            }
        );
        next_matching(&mut events, |event| {
            *event
                == ConversationEvent::StateChanged {
                    state: SessionLifecycleState::Active,
                }
        })
        .await;

        let (items, unread_count, latest_mention) = next_timeline(&mut events).await;
        assert_eq!(message_ids(&items), ["m3", "m2", "m1"]);
        assert_eq!(unread_count, 3);
        assert_eq!(latest_mention.as_deref(), Some("m2"));
        assert!(matches!(items[1], RenderItem::DayDivider { .. }));
        assert_eq!(items.last(), Some(&RenderItem::UnreadDivider { count: 3 }));
    }

    #[tokio::test]
    async fn timeline_commands_before_open_are_rejected() {
        let service = seeded_service();
        let handle = spawn(&service);
        let mut events = handle.subscribe();

        handle
            .send(ConversationCommand::LoadOlder { limit: 10 })
            .await
            .expect("command should enqueue");

        match next_matching(&mut events, |_| true).await {
            ConversationEvent::FatalError { code, .. } => {
                assert_eq!(code, "invalid_state_transition")
            }
            other => panic!("unexpected event: {other:?}"),
        }

        send_text(&handle, "tx-early", "hello").await;
        match next_matching(&mut events, |_| true).await {
            ConversationEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "tx-early");
                assert_eq!(ack.error_code.as_deref(), Some("invalid_state_transition"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_shows_placeholder_then_single_confirmed_entry() {
        let service = seeded_service();
        service
            .set_duplicate_delivery(true)
            .expect("toggle should work");
        let handle = spawn(&service);
        let mut events = handle.subscribe();
        open(&handle, "c1").await;
        next_timeline(&mut events).await;

        send_text(&handle, "tx-1", "hello").await;

        let (items, _, _) = next_timeline(&mut events).await;
        let head = items[0].as_message().expect("head should be a message");
        assert_eq!(head.id, "local-tx-1");
        assert!(head.is_pending());

        let mut message_id = None;
        let mut confirmed = None;
        while message_id.is_none() || confirmed.is_none() {
            match next_matching(&mut events, |_| true).await {
                ConversationEvent::SendAck(ack) => {
                    assert_eq!(ack.client_txn_id, "tx-1");
                    message_id = Some(ack.message_id.expect("send should succeed"));
                }
                ConversationEvent::TimelineUpdated { items, .. }
                    if !items
                        .iter()
                        .filter_map(RenderItem::as_message)
                        .any(Message::is_pending) =>
                {
                    confirmed = Some(items);
                }
                _ => {}
            }
        }

        let message_id = message_id.expect("ack was received");
        let ids = message_ids(&confirmed.expect("confirmed timeline was received"));
        assert_eq!(ids.iter().filter(|id| **id == message_id).count(), 1);
        assert_eq!(ids[0], message_id);
        assert_eq!(ids.len(), 4);
        assert_eq!(
            service.messages("c1").expect("messages should list").len(),
            4
        );
    }

    #[tokio::test]
    async fn failed_send_removes_placeholder() {
        let service = seeded_service();
        service
            .fail_next_send(PlatformError::Unavailable("offline".into()))
            .expect("failure injection should work");
        let handle = spawn(&service);
        let mut events = handle.subscribe();
        open(&handle, "c1").await;
        let (before, _, _) = next_timeline(&mut events).await;

        send_text(&handle, "tx-2", "hello").await;
        let (pending, _, _) = next_timeline(&mut events).await;
        assert_eq!(
            pending[0].as_message().map(|message| message.id.as_str()),
            Some("local-tx-2")
        );

        match next_matching(&mut events, |event| {
            matches!(event, ConversationEvent::SendAck(_))
        })
        .await
        {
            ConversationEvent::SendAck(ack) => {
                assert_eq!(ack.message_id, None);
                assert_eq!(ack.error_code.as_deref(), Some("unavailable"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let (after, _, _) = next_timeline(&mut events).await;
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn non_member_send_is_rejected_locally() {
        let service = seeded_service();
        service
            .create_conversation("c3", ["bob"])
            .expect("conversation should be created");
        let handle = spawn(&service);
        let mut events = handle.subscribe();
        open(&handle, "c3").await;
        next_timeline(&mut events).await;

        send_text(&handle, "tx-3", "let me in").await;
        match next_matching(&mut events, |event| {
            matches!(event, ConversationEvent::SendAck(_))
        })
        .await
        {
            ConversationEvent::SendAck(ack) => {
                assert_eq!(ack.error_code.as_deref(), Some("not_a_member"))
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(service.messages("c3").expect("messages should list").is_empty());
    }

    #[tokio::test]
    async fn remote_inserts_and_mark_read_update_unread_state() {
        let service = seeded_service();
        let handle = spawn(&service);
        let mut events = handle.subscribe();
        open(&handle, "c1").await;
        next_timeline(&mut events).await;

        handle
            .send(ConversationCommand::MarkRead {
                message_id: "m3".into(),
            })
            .await
            .expect("command should enqueue");
        let (items, unread_count, latest_mention) = next_timeline(&mut events).await;
        assert_eq!(unread_count, 0);
        assert_eq!(latest_mention, None);
        assert!(
            !items
                .iter()
                .any(|item| matches!(item, RenderItem::UnreadDivider { .. }))
        );

        service
            .inject_remote_message(OutgoingMessage {
                client_txn_id: "remote".into(),
                conversation_id: "c1".into(),
                sender_id: "bob".into(),
                content: "new one".into(),
                reply_to_id: None,
                mentions: Vec::new(),
                kind: MessageKind::Text,
            })
            .expect("inject should work");

        let (items, unread_count, _) = next_timeline(&mut events).await;
        assert_eq!(unread_count, 1);
        let divider = items
            .iter()
            .position(|item| *item == RenderItem::UnreadDivider { count: 1 })
            .expect("unread divider should be present");
        assert_eq!(
            items[divider + 1].as_message().map(|message| message.id.as_str()),
            Some("m3")
        );

        handle
            .send(ConversationCommand::MarkRead {
                message_id: "m1".into(),
            })
            .await
            .expect("command should enqueue");
        handle
            .send(ConversationCommand::Close)
            .await
            .expect("command should enqueue");
        match next_matching(&mut events, |event| {
            matches!(
                event,
                ConversationEvent::TimelineUpdated { .. } | ConversationEvent::StateChanged { .. }
            )
        })
        .await
        {
            ConversationEvent::StateChanged { state } => {
                assert_eq!(state, SessionLifecycleState::Closed)
            }
            other => panic!("older mark read should not republish: {other:?}"),
        }
    }

    #[tokio::test]
    async fn editing_another_users_message_is_rejected() {
        let service = seeded_service();
        let handle = spawn(&service);
        let mut events = handle.subscribe();
        open(&handle, "c1").await;
        next_timeline(&mut events).await;

        handle
            .send(ConversationCommand::Edit {
                message_id: "m3".into(),
                content: "rewritten".into(),
                mentions: Vec::new(),
            })
            .await
            .expect("command should enqueue");

        match next_matching(&mut events, |event| {
            matches!(event, ConversationEvent::FatalError { .. })
        })
        .await
        {
            ConversationEvent::FatalError {
                code, recoverable, ..
            } => {
                assert_eq!(code, "not_message_author");
                assert!(!recoverable);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_older_appends_previous_page() {
        let service = seeded_service();
        let handle = spawn_conversation_runtime(
            SessionContext::new("alice", "Alice"),
            ConversationServices::from_shared(service.clone()),
            RuntimeOptions {
                config: RuntimeConfig {
                    open_limit: 2,
                    ..RuntimeConfig::default()
                },
                utc_offset: FixedOffset::east_opt(0),
            },
        );
        let mut events = handle.subscribe();
        open(&handle, "c1").await;
        let (items, _, _) = next_timeline(&mut events).await;
        assert_eq!(message_ids(&items), ["m3", "m2"]);

        handle
            .send(ConversationCommand::LoadOlder { limit: 50 })
            .await
            .expect("command should enqueue");
        let (items, _, _) = next_timeline(&mut events).await;
        assert_eq!(message_ids(&items), ["m3", "m2", "m1"]);
    }

    #[tokio::test]
    async fn switching_conversations_unsubscribes_the_old_one() {
        let service = seeded_service();
        let handle = spawn(&service);
        let mut events = handle.subscribe();

        open(&handle, "c1").await;
        next_timeline(&mut events).await;
        assert_eq!(service.subscriber_count("c1"), 1);

        open(&handle, "c2").await;
        match next_timeline_event(&mut events).await {
            ConversationEvent::TimelineUpdated {
                conversation_id, ..
            } => assert_eq!(conversation_id, "c2"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(service.subscriber_count("c1"), 0);
        assert_eq!(service.subscriber_count("c2"), 1);
    }

    #[tokio::test]
    async fn in_flight_send_completes_after_close() {
        let service = seeded_service();
        service
            .set_send_latency(Some(Duration::from_millis(200)))
            .expect("latency injection should work");
        let handle = spawn(&service);
        let mut events = handle.subscribe();
        open(&handle, "c1").await;
        next_timeline(&mut events).await;

        send_text(&handle, "tx-late", "see you tomorrow").await;
        let (pending, _, _) = next_timeline(&mut events).await;
        assert_eq!(
            pending[0].as_message().map(|message| message.id.as_str()),
            Some("local-tx-late")
        );

        handle
            .send(ConversationCommand::Close)
            .await
            .expect("command should enqueue");
        next_matching(&mut events, |event| {
            *event
                == ConversationEvent::StateChanged {
                    state: SessionLifecycleState::Closed,
                }
        })
        .await;

        let ack = match next_matching(&mut events, |event| {
            matches!(event, ConversationEvent::SendAck(_))
        })
        .await
        {
            ConversationEvent::SendAck(ack) => ack,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(ack.client_txn_id, "tx-late");
        assert_eq!(ack.error_code, None);
        let message_id = ack.message_id.expect("send should succeed after close");

        let stored = service.messages("c1").expect("messages should list");
        assert_eq!(stored[0].id, message_id);
        assert_eq!(stored[0].content, "see you tomorrow");
    }

    async fn wait_for_presence<F>(service: &InMemoryChatService, mut done: F)
    where
        F: FnMut(&chat_platform::PresenceSet) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            while !done(&service.presence_snapshot("c1")) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("presence should settle");
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_runtime_and_retracts_typing() {
        let service = seeded_service();
        let handle = spawn(&service);
        let mut events = handle.subscribe();
        open(&handle, "c1").await;
        next_timeline(&mut events).await;

        handle
            .send(ConversationCommand::StartTyping)
            .await
            .expect("command should enqueue");
        wait_for_presence(&service, |set| set.contains_key("alice")).await;

        drop(handle);
        wait_for_presence(&service, |set| set.is_empty()).await;
    }

    async fn next_timeline_event(
        events: &mut broadcast::Receiver<ConversationEvent>,
    ) -> ConversationEvent {
        next_matching(events, |event| {
            matches!(event, ConversationEvent::TimelineUpdated { .. })
        })
        .await
    }

    #[tokio::test]
    async fn typing_of_others_is_forwarded() {
        let service = seeded_service();
        let handle = spawn(&service);
        let mut events = handle.subscribe();
        open(&handle, "c1").await;
        next_timeline(&mut events).await;

        let bob = PresenceBroadcaster::new(Arc::new(service.clone()), Duration::from_secs(3));
        bob.start_typing("c1", "bob", "Bob")
            .await
            .expect("start should work");

        match next_matching(&mut events, |event| {
            matches!(event, ConversationEvent::TypingChanged { users, .. } if !users.is_empty())
        })
        .await
        {
            ConversationEvent::TypingChanged { users, .. } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].user_id, "bob");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        handle
            .send(ConversationCommand::StartTyping)
            .await
            .expect("command should enqueue");
        handle
            .send(ConversationCommand::Close)
            .await
            .expect("command should enqueue");
        next_matching(&mut events, |event| {
            *event
                == ConversationEvent::StateChanged {
                    state: SessionLifecycleState::Closed,
                }
        })
        .await;
        let typing = service.presence_snapshot("c1");
        assert!(!typing.contains_key("alice"));
        assert!(typing.contains_key("bob"));
    }

    #[tokio::test]
    async fn malformed_push_records_are_dropped() {
        let service = seeded_service();
        let handle = spawn(&service);
        let mut events = handle.subscribe();
        open(&handle, "c1").await;
        next_timeline(&mut events).await;

        service
            .push_raw("c1", PushEvent::Insert(serde_json::json!({ "id": "bad" })))
            .expect("push should work");
        service
            .push_raw("c1", PushEvent::Delete {
                message_id: "m1".into(),
            })
            .expect("push should work");

        let (items, _, _) = next_timeline(&mut events).await;
        assert_eq!(message_ids(&items), ["m3", "m2"]);
    }

    #[test]
    fn maps_platform_errors_to_stable_codes() {
        let err = map_platform_error("send_message", PlatformError::Forbidden("left".into()));
        assert_eq!(err.category, ChatErrorCategory::Auth);
        assert_eq!(err.code, "forbidden");

        let err = map_platform_error("list_messages", PlatformError::Unavailable("down".into()));
        assert!(err.is_recoverable());
        assert!(err.message.starts_with("list_messages"));
    }

    #[test]
    fn placeholder_ids_are_prefixed_once() {
        assert_eq!(placeholder_id("tx-1"), "local-tx-1");
        assert_eq!(placeholder_id("local-abc"), "local-abc");
    }
}
