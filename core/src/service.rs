/// Chat service: the API boundary for every client-facing operation.
///
/// Validation and authorization happen here, before anything is written.
/// State-machine violations (regressions, wrong addressee) come back as
/// `Transition` values and are logged, never raised.
use crate::chat_types::{
    now_millis, ChatEvent, ClearHorizon, ConversationId, ConversationSummary, DeliveryState,
    Identity, Message, MessageId, PresenceRecord, ScopeId, Transition, TypingSignal, UserId,
};
use crate::config::Config;
use crate::conversations::ConversationLister;
use crate::error::{ChatError, Result};
use crate::event_bus::{EventBus, Subscription, Topic};
use crate::message_store::{open_database, MessageStore};
use crate::presence::PresenceTracker;
use crate::roster::Roster;
use crate::typing::TypingChannel;
use crate::unread::{is_unread_for, unread_count};
use crate::visibility::VisibilityFilter;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ChatService {
    config: Arc<Config>,
    bus: EventBus,
    store: MessageStore,
    visibility: VisibilityFilter,
    roster: Roster,
    presence: PresenceTracker,
    typing: TypingChannel,
    lister: ConversationLister,
}

impl ChatService {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let db = open_database(config.data_dir.as_deref())?;
        let bus = EventBus::new(config.event_buffer);
        let store = MessageStore::new(&db)?;
        let visibility = VisibilityFilter::new(&db, store.clone())?;
        let roster = Roster::new(&db, bus.clone())?;
        let presence = PresenceTracker::new(&config, bus.clone());
        let typing = TypingChannel::new(bus.clone());
        let lister = ConversationLister::new(
            roster.clone(),
            visibility.clone(),
            presence.clone(),
            typing.clone(),
            bus.clone(),
        );

        info!("Chat service ready ({} stored messages)", store.count());
        Ok(Self {
            config: Arc::new(config),
            bus,
            store,
            visibility,
            roster,
            presence,
            typing,
            lister,
        })
    }

    /// Spawn background tasks (the presence liveness monitor)
    pub fn start(&self) -> JoinHandle<()> {
        let presence = self.presence.clone();
        tokio::spawn(async move { presence.run_liveness().await })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    // ─── Authorization ───────────────────────────────────────────────────────

    /// The other participant, if `caller` may act on `conversation`
    fn authorize(&self, caller: &Identity, conversation: &ConversationId) -> Result<UserId> {
        caller.validate()?;
        let other = conversation.other(&caller.user_id).ok_or_else(|| {
            ChatError::Unauthorized(format!(
                "{} is not a participant of {}",
                caller.user_id, conversation
            ))
        })?;
        if self.roster.get(&caller.branch_id, other)?.is_none() {
            return Err(ChatError::Unauthorized(format!(
                "{} is not on the roster of branch {}",
                other, caller.branch_id
            )));
        }
        Ok(other.clone())
    }

    /// Conversation between `caller` and `other`, checked for access
    pub fn conversation_with(&self, caller: &Identity, other: &UserId) -> Result<ConversationId> {
        other.validate()?;
        if other == &caller.user_id {
            return Err(ChatError::Validation(
                "cannot open a conversation with yourself".to_string(),
            ));
        }
        let conversation = ConversationId::new(&caller.user_id, other);
        self.authorize(caller, &conversation)?;
        Ok(conversation)
    }

    fn authorize_scope(&self, caller: &Identity, scope: &ScopeId) -> Result<()> {
        caller.validate()?;
        if scope == &ScopeId::branch(&caller.branch_id) {
            return Ok(());
        }
        match ConversationId::parse(scope.as_str()) {
            Ok(conversation) => self.authorize(caller, &conversation).map(|_| ()),
            Err(_) => Err(ChatError::Unauthorized(format!(
                "scope {} is outside branch {}",
                scope, caller.branch_id
            ))),
        }
    }

    // ─── Messages ────────────────────────────────────────────────────────────

    pub async fn send(
        &self,
        caller: &Identity,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("message text is empty".to_string()));
        }
        if text.chars().count() > self.config.max_message_len {
            return Err(ChatError::Validation(format!(
                "message exceeds {} characters",
                self.config.max_message_len
            )));
        }
        let receiver = self.authorize(caller, conversation)?;

        // Never land at or below a clear horizon set in the same millisecond
        let floor = self
            .visibility
            .max_horizon(conversation)?
            .map_or(i64::MIN, |h| h.saturating_add(1));
        let created_at = now_millis().max(floor);

        let message = self
            .store
            .append(conversation, &caller.user_id, &receiver, text, created_at)?;
        info!("{} sent {} in {}", caller.user_id, message.id, conversation);

        self.bus
            .publish_all(
                &self.message_topics(conversation),
                ChatEvent::MessageAppended { message: message.clone() },
            )
            .await;
        Ok(message)
    }

    pub async fn mark_delivered(&self, caller: &Identity, id: &MessageId) -> Result<Transition> {
        self.advance(caller, id, DeliveryState::Delivered).await
    }

    pub async fn mark_read(&self, caller: &Identity, id: &MessageId) -> Result<Transition> {
        self.advance(caller, id, DeliveryState::Read).await
    }

    async fn advance(
        &self,
        caller: &Identity,
        id: &MessageId,
        target: DeliveryState,
    ) -> Result<Transition> {
        let message = self
            .store
            .get(id)?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", id)))?;
        self.authorize(caller, &message.conversation_id)?;

        let (transition, message) = self.store.advance(id, &caller.user_id, target)?;
        match transition {
            Transition::Advanced(state) => {
                debug!("{} -> {:?}", id, state);
                self.bus
                    .publish_all(
                        &self.message_topics(&message.conversation_id),
                        ChatEvent::DeliveryAdvanced {
                            conversation_id: message.conversation_id.clone(),
                            message_id: id.clone(),
                            state,
                        },
                    )
                    .await;
            }
            Transition::Unchanged(state) => {
                debug!("{} already {:?}, {:?} ignored", id, state, target);
            }
            Transition::NotAddressee => {
                warn!("{} tried to mark {} {:?} but is not its receiver", caller.user_id, id, target);
            }
        }
        Ok(transition)
    }

    /// Mark every visible unread message addressed to `caller` as read
    pub async fn mark_all_read(&self, caller: &Identity, conversation: &ConversationId) -> Result<usize> {
        let mut advanced = 0;
        for message in self.visible_messages(caller, conversation).await? {
            if is_unread_for(&message, &caller.user_id) {
                if let Transition::Advanced(_) = self.mark_read(caller, &message.id).await? {
                    advanced += 1;
                }
            }
        }
        Ok(advanced)
    }

    fn message_topics(&self, conversation: &ConversationId) -> [Topic; 3] {
        let (a, b) = conversation.participants();
        [
            Topic::Conversation(conversation.clone()),
            Topic::Inbox(a.clone()),
            Topic::Inbox(b.clone()),
        ]
    }

    // ─── Visibility ──────────────────────────────────────────────────────────

    pub async fn clear_chat(&self, caller: &Identity, conversation: &ConversationId) -> Result<ClearHorizon> {
        self.authorize(caller, conversation)?;
        let horizon = self
            .visibility
            .clear_chat(conversation, &caller.user_id, now_millis())?;
        info!("{} cleared {}", caller.user_id, conversation);
        self.publish_visibility(caller, conversation).await;
        Ok(horizon)
    }

    pub async fn delete_selected(
        &self,
        caller: &Identity,
        conversation: &ConversationId,
        ids: &[MessageId],
    ) -> Result<usize> {
        if ids.is_empty() {
            return Err(ChatError::Validation("no messages selected".to_string()));
        }
        self.authorize(caller, conversation)?;
        let hidden = self
            .visibility
            .delete_selected(conversation, &caller.user_id, ids)?;
        if hidden > 0 {
            self.publish_visibility(caller, conversation).await;
        }
        Ok(hidden)
    }

    /// Visibility changes go to the caller's streams only
    async fn publish_visibility(&self, caller: &Identity, conversation: &ConversationId) {
        self.bus
            .publish_all(
                &[
                    Topic::Conversation(conversation.clone()),
                    Topic::Inbox(caller.user_id.clone()),
                ],
                ChatEvent::VisibilityChanged {
                    conversation_id: conversation.clone(),
                    user_id: caller.user_id.clone(),
                },
            )
            .await;
    }

    pub async fn visible_messages(
        &self,
        caller: &Identity,
        conversation: &ConversationId,
    ) -> Result<Vec<Message>> {
        self.authorize(caller, conversation)?;
        self.visibility.visible_messages(conversation, &caller.user_id)
    }

    pub async fn unread_count(&self, caller: &Identity, conversation: &ConversationId) -> Result<usize> {
        let visible = self.visible_messages(caller, conversation).await?;
        Ok(unread_count(&visible, &caller.user_id))
    }

    // ─── Typing ──────────────────────────────────────────────────────────────

    /// `ttl` falls back to the configured typing lifetime
    pub async fn start_typing(
        &self,
        caller: &Identity,
        conversation: &ConversationId,
        ttl: Option<Duration>,
    ) -> Result<TypingSignal> {
        self.authorize(caller, conversation)?;
        let ttl = ttl.unwrap_or(self.config.typing_ttl);
        if ttl.is_zero() {
            return Err(ChatError::Validation("typing ttl must be non-zero".to_string()));
        }
        if ttl > self.config.max_typing_ttl {
            return Err(ChatError::Validation(format!(
                "typing ttl {}ms exceeds the limit of {}ms",
                ttl.as_millis(),
                self.config.max_typing_ttl.as_millis()
            )));
        }
        Ok(self.typing.start_typing(conversation, &caller.user_id, ttl).await)
    }

    pub async fn stop_typing(&self, caller: &Identity, conversation: &ConversationId) -> Result<TypingSignal> {
        self.authorize(caller, conversation)?;
        Ok(self.typing.stop_typing(conversation, &caller.user_id).await)
    }

    // ─── Presence ────────────────────────────────────────────────────────────

    pub async fn set_online(&self, caller: &Identity, scope: &ScopeId) -> Result<Option<PresenceRecord>> {
        self.authorize_scope(caller, scope)?;
        Ok(self.presence.set_online(&caller.user_id, scope).await)
    }

    pub async fn set_offline(&self, caller: &Identity, scope: &ScopeId) -> Result<Option<PresenceRecord>> {
        self.authorize_scope(caller, scope)?;
        Ok(self.presence.set_offline(&caller.user_id, scope).await)
    }

    pub async fn heartbeat(&self, caller: &Identity, scope: &ScopeId) -> Result<bool> {
        self.authorize_scope(caller, scope)?;
        Ok(self.presence.heartbeat(&caller.user_id, scope).await)
    }

    // ─── Chat list ───────────────────────────────────────────────────────────

    pub async fn list_conversations(&self, caller: &Identity) -> Result<Vec<ConversationSummary>> {
        caller.validate()?;
        self.lister.list(caller).await
    }

    // ─── Subscriptions ───────────────────────────────────────────────────────

    pub async fn subscribe_conversations(
        &self,
        caller: &Identity,
    ) -> Result<Subscription<Vec<ConversationSummary>>> {
        caller.validate()?;
        Ok(self.lister.subscribe(caller).await)
    }

    /// Snapshot stream of the caller's visible messages, in render order.
    /// The other participant's clears and deletions never produce an emission.
    pub async fn subscribe_messages(
        &self,
        caller: &Identity,
        conversation: &ConversationId,
    ) -> Result<Subscription<Vec<Message>>> {
        self.authorize(caller, conversation)?;
        let mut events = self.bus.subscribe(Topic::Conversation(conversation.clone())).await;
        let (tx, rx) = mpsc::channel(16);
        let visibility = self.visibility.clone();
        let viewer = caller.user_id.clone();
        let conversation = conversation.clone();

        let task = tokio::spawn(async move {
            let mut last: Option<Vec<Message>> = None;
            loop {
                match visibility.visible_messages(&conversation, &viewer) {
                    Ok(visible) => {
                        if last.as_ref() != Some(&visible) {
                            if tx.send(visible.clone()).await.is_err() {
                                break;
                            }
                            last = Some(visible);
                        }
                    }
                    Err(e) => warn!("Message snapshot for {} failed: {}", viewer, e),
                }

                loop {
                    match events.recv().await {
                        Ok(ChatEvent::VisibilityChanged { user_id, .. }) if user_id != viewer => continue,
                        Ok(_) => break,
                        Err(RecvError::Lagged(n)) => {
                            debug!("Message subscriber {} lagged {} events", viewer, n);
                            break;
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        });

        Ok(Subscription::new(rx, task))
    }

    pub async fn subscribe_presence(
        &self,
        caller: &Identity,
        user: &UserId,
        scope: &ScopeId,
    ) -> Result<Subscription<PresenceRecord>> {
        self.authorize_scope(caller, scope)?;
        if user != &caller.user_id && self.roster.get(&caller.branch_id, user)?.is_none() {
            return Err(ChatError::Unauthorized(format!(
                "{} is not on the roster of branch {}",
                user, caller.branch_id
            )));
        }
        Ok(self.presence.subscribe(user, scope).await)
    }

    pub async fn subscribe_typing(
        &self,
        caller: &Identity,
        conversation: &ConversationId,
    ) -> Result<Subscription<BTreeSet<UserId>>> {
        self.authorize(caller, conversation)?;
        Ok(self.typing.subscribe(conversation).await)
    }

    /// Raw event feed of everything touching the caller's chat list
    pub async fn subscribe_inbox(&self, caller: &Identity) -> Result<broadcast::Receiver<ChatEvent>> {
        caller.validate()?;
        Ok(self.bus.subscribe(Topic::Inbox(caller.user_id.clone())).await)
    }
}
