/// Per-session client context.
///
/// Holds everything one signed-in client tracks: which conversation is open,
/// the delete-mode selection, the compose draft and the background tasks
/// that acknowledge deliveries and keep presence alive. Switching the open
/// conversation tears down the previous conversation's subscriptions before
/// the new ones start, so read receipts can never cross conversations.
use crate::chat_types::{
    ChatEvent, ClearHorizon, ConversationId, DeliveryState, Identity, Message, MessageId, ScopeId,
    UserId,
};
use crate::error::{ChatError, Result};
use crate::service::ChatService;
use crate::unread::is_unread_for;
use std::collections::BTreeSet;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delete-mode state of the open conversation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeleteMode {
    #[default]
    Off,
    Selecting(BTreeSet<MessageId>),
}

struct OpenConversation {
    conversation_id: ConversationId,
    other: UserId,
    messages: watch::Receiver<Vec<Message>>,
    other_typing: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for OpenConversation {
    fn drop(&mut self) {
        // Aborting the forwarders drops (and so cancels) their subscriptions
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct ChatSession {
    id: Uuid,
    identity: Identity,
    service: ChatService,
    open: Option<OpenConversation>,
    delete_mode: DeleteMode,
    draft: String,
    background: Vec<JoinHandle<()>>,
}

impl ChatSession {
    pub fn new(service: ChatService, identity: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            service,
            open: None,
            delete_mode: DeleteMode::Off,
            draft: String::new(),
            background: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    fn presence_scope(&self) -> ScopeId {
        ScopeId::branch(&self.identity.branch_id)
    }

    /// Go online, start heartbeats and the delivery acknowledger
    pub async fn connect(&mut self) -> Result<()> {
        self.service.set_online(&self.identity, &self.presence_scope()).await?;
        let inbox = self.service.subscribe_inbox(&self.identity).await?;

        self.background.push(tokio::spawn(acknowledge_deliveries(
            self.service.clone(),
            self.identity.clone(),
            inbox,
        )));
        self.background.push(tokio::spawn(send_heartbeats(
            self.service.clone(),
            self.identity.clone(),
            self.presence_scope(),
        )));

        info!("Session {} connected as {}", self.id, self.identity.user_id);
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.close_conversation();
        for task in self.background.drain(..) {
            task.abort();
        }
        self.service.set_offline(&self.identity, &self.presence_scope()).await?;
        info!("Session {} disconnected", self.id);
        Ok(())
    }

    // ─── Open conversation ───────────────────────────────────────────────────

    pub async fn open_conversation(&mut self, other: &UserId) -> Result<ConversationId> {
        let conversation = self.service.conversation_with(&self.identity, other)?;
        self.close_conversation();

        let mut messages_sub = self.service.subscribe_messages(&self.identity, &conversation).await?;
        let mut typing_sub = self.service.subscribe_typing(&self.identity, &conversation).await?;
        let (messages_tx, messages_rx) = watch::channel(Vec::new());
        let (typing_tx, typing_rx) = watch::channel(false);

        let service = self.service.clone();
        let identity = self.identity.clone();
        let reader = tokio::spawn(async move {
            while let Some(snapshot) = messages_sub.recv().await {
                // The conversation is on screen, so everything visible is read
                for message in snapshot.iter().filter(|m| is_unread_for(m, &identity.user_id)) {
                    if let Err(e) = service.mark_read(&identity, &message.id).await {
                        warn!("mark_read {} failed: {}", message.id, e);
                    }
                }
                if messages_tx.send(snapshot).is_err() {
                    break;
                }
            }
        });

        let watched = other.clone();
        let typing = tokio::spawn(async move {
            while let Some(set) = typing_sub.recv().await {
                if typing_tx.send(set.contains(&watched)).is_err() {
                    break;
                }
            }
        });

        debug!("Session {} opened {}", self.id, conversation);
        self.open = Some(OpenConversation {
            conversation_id: conversation.clone(),
            other: other.clone(),
            messages: messages_rx,
            other_typing: typing_rx,
            tasks: vec![reader, typing],
        });
        Ok(conversation)
    }

    pub fn close_conversation(&mut self) {
        if let Some(open) = self.open.take() {
            debug!("Session {} closed {}", self.id, open.conversation_id);
        }
        self.delete_mode = DeleteMode::Off;
    }

    pub fn open_conversation_id(&self) -> Option<&ConversationId> {
        self.open.as_ref().map(|o| &o.conversation_id)
    }

    pub fn open_with(&self) -> Option<&UserId> {
        self.open.as_ref().map(|o| &o.other)
    }

    /// Latest visible messages of the open conversation
    pub fn messages(&self) -> Option<watch::Receiver<Vec<Message>>> {
        self.open.as_ref().map(|o| o.messages.clone())
    }

    /// Whether the other participant is typing in the open conversation
    pub fn other_typing(&self) -> Option<watch::Receiver<bool>> {
        self.open.as_ref().map(|o| o.other_typing.clone())
    }

    fn require_open(&self) -> Result<ConversationId> {
        self.open
            .as_ref()
            .map(|o| o.conversation_id.clone())
            .ok_or_else(|| ChatError::Validation("no conversation is open".to_string()))
    }

    // ─── Compose ─────────────────────────────────────────────────────────────

    pub fn draft(&self) -> &str {
        &self.draft
    }

    /// Update the draft and refresh the typing signal
    pub async fn keystroke(&mut self, text: &str) -> Result<()> {
        let conversation = self.require_open()?;
        self.draft = text.to_string();
        if self.draft.is_empty() {
            self.service.stop_typing(&self.identity, &conversation).await?;
        } else {
            self.service.start_typing(&self.identity, &conversation, None).await?;
        }
        Ok(())
    }

    /// Send the draft. On failure the draft is kept for another attempt.
    pub async fn send_draft(&mut self) -> Result<Message> {
        let conversation = self.require_open()?;
        let message = self.service.send(&self.identity, &conversation, &self.draft).await?;
        self.draft.clear();
        if let Err(e) = self.service.stop_typing(&self.identity, &conversation).await {
            debug!("stop_typing after send failed: {}", e);
        }
        Ok(message)
    }

    pub fn discard_draft(&mut self) {
        self.draft.clear();
    }

    // ─── Delete mode ─────────────────────────────────────────────────────────

    pub fn delete_mode(&self) -> &DeleteMode {
        &self.delete_mode
    }

    pub fn enter_delete_mode(&mut self) -> Result<()> {
        self.require_open()?;
        if self.delete_mode == DeleteMode::Off {
            self.delete_mode = DeleteMode::Selecting(BTreeSet::new());
        }
        Ok(())
    }

    pub fn exit_delete_mode(&mut self) {
        self.delete_mode = DeleteMode::Off;
    }

    /// Toggle a message in the selection; returns whether it is now selected
    pub fn toggle_selection(&mut self, id: &MessageId) -> Result<bool> {
        match &mut self.delete_mode {
            DeleteMode::Selecting(selected) => {
                if selected.remove(id) {
                    Ok(false)
                } else {
                    selected.insert(id.clone());
                    Ok(true)
                }
            }
            DeleteMode::Off => Err(ChatError::Validation("delete mode is off".to_string())),
        }
    }

    /// Hide the selected messages for this user and leave delete mode
    pub async fn delete_selected(&mut self) -> Result<usize> {
        let conversation = self.require_open()?;
        let ids: Vec<MessageId> = match &self.delete_mode {
            DeleteMode::Selecting(selected) if !selected.is_empty() => selected.iter().cloned().collect(),
            _ => return Err(ChatError::Validation("no messages selected".to_string())),
        };
        let hidden = self
            .service
            .delete_selected(&self.identity, &conversation, &ids)
            .await?;
        self.delete_mode = DeleteMode::Off;
        Ok(hidden)
    }

    pub async fn clear_chat(&mut self) -> Result<ClearHorizon> {
        let conversation = self.require_open()?;
        let horizon = self.service.clear_chat(&self.identity, &conversation).await?;
        self.delete_mode = DeleteMode::Off;
        Ok(horizon)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

/// Delivered-ack: the first time this client sees a `Sent` message addressed
/// to it, mark it delivered. Catches up on anything sent while offline.
async fn acknowledge_deliveries(
    service: ChatService,
    identity: Identity,
    mut inbox: tokio::sync::broadcast::Receiver<ChatEvent>,
) {
    catch_up_deliveries(&service, &identity).await;
    loop {
        match inbox.recv().await {
            Ok(ChatEvent::MessageAppended { message })
                if message.receiver_id == identity.user_id
                    && message.delivery_state == DeliveryState::Sent =>
            {
                if let Err(e) = service.mark_delivered(&identity, &message.id).await {
                    warn!("mark_delivered {} failed: {}", message.id, e);
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                debug!("Delivery acknowledger lagged {} events, rescanning", n);
                catch_up_deliveries(&service, &identity).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn catch_up_deliveries(service: &ChatService, identity: &Identity) {
    let summaries = match service.list_conversations(identity).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Delivery catch-up for {} failed: {}", identity.user_id, e);
            return;
        }
    };
    for summary in summaries.iter().filter(|s| s.unread_count > 0) {
        let messages = match service.visible_messages(identity, &summary.conversation_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!("Delivery catch-up in {} failed: {}", summary.conversation_id, e);
                continue;
            }
        };
        for message in messages.iter().filter(|m| {
            m.receiver_id == identity.user_id && m.delivery_state == DeliveryState::Sent
        }) {
            if let Err(e) = service.mark_delivered(identity, &message.id).await {
                warn!("mark_delivered {} failed: {}", message.id, e);
            }
        }
    }
}

async fn send_heartbeats(service: ChatService, identity: Identity, scope: ScopeId) {
    let mut tick = interval(service.config().heartbeat_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        match service.heartbeat(&identity, &scope).await {
            Ok(true) => {}
            Ok(false) => {
                // Lease lapsed (e.g. the process was suspended); come back online
                debug!("{} lease lapsed, re-registering presence", identity.user_id);
                if let Err(e) = service.set_online(&identity, &scope).await {
                    warn!("Presence re-registration failed: {}", e);
                }
            }
            Err(e) => warn!("Heartbeat for {} failed: {}", identity.user_id, e),
        }
    }
}
