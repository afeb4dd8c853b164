/// Chat list: merges roster identity with live per-viewer conversation state.
///
/// Summaries are pure derivations over the message log, visibility state,
/// presence and typing; nothing here is stored.
use crate::chat_types::{ConversationId, ConversationSummary, Identity, RosterEntry, ScopeId};
use crate::error::Result;
use crate::event_bus::{EventBus, Subscription, Topic};
use crate::presence::PresenceTracker;
use crate::roster::Roster;
use crate::typing::{until, TypingChannel};
use crate::unread::unread_count;
use crate::visibility::VisibilityFilter;
use std::cmp::Ordering;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ConversationLister {
    roster: Roster,
    visibility: VisibilityFilter,
    presence: PresenceTracker,
    typing: TypingChannel,
    bus: EventBus,
}

impl ConversationLister {
    pub fn new(
        roster: Roster,
        visibility: VisibilityFilter,
        presence: PresenceTracker,
        typing: TypingChannel,
        bus: EventBus,
    ) -> Self {
        Self {
            roster,
            visibility,
            presence,
            typing,
            bus,
        }
    }

    pub async fn summary(&self, viewer: &Identity, other: RosterEntry) -> Result<ConversationSummary> {
        let conversation_id = ConversationId::new(&viewer.user_id, &other.user_id);
        let visible = self.visibility.visible_messages(&conversation_id, &viewer.user_id)?;
        let typing_now = self.typing.is_typing(&conversation_id, &other.user_id).await;
        let presence = self
            .presence
            .get(&other.user_id, &ScopeId::branch(&viewer.branch_id))
            .await;

        Ok(ConversationSummary {
            unread_count: unread_count(&visible, &viewer.user_id),
            last_visible_message: visible.last().cloned(),
            conversation_id,
            other_participant: other,
            typing_now,
            presence,
        })
    }

    /// Chat list for `viewer`, most recent conversation first
    pub async fn list(&self, viewer: &Identity) -> Result<Vec<ConversationSummary>> {
        let mut summaries = Vec::new();
        for member in self.roster.members(&viewer.branch_id)? {
            if member.user_id == viewer.user_id {
                continue;
            }
            summaries.push(self.summary(viewer, member).await?);
        }
        order_summaries(&mut summaries);
        Ok(summaries)
    }

    /// Push stream of the chat list. Recomputes on roster, inbox and
    /// presence changes, and when a typing signal shown in the list expires.
    pub async fn subscribe(&self, viewer: &Identity) -> Subscription<Vec<ConversationSummary>> {
        let mut inbox = self.bus.subscribe(Topic::Inbox(viewer.user_id.clone())).await;
        let mut roster = self.bus.subscribe(Topic::Roster(viewer.branch_id.clone())).await;
        let mut presence = self
            .bus
            .subscribe(Topic::Presence(ScopeId::branch(&viewer.branch_id)))
            .await;
        let (tx, rx) = mpsc::channel(8);
        let lister = self.clone();
        let viewer = viewer.clone();

        let task = tokio::spawn(async move {
            let mut last: Option<Vec<ConversationSummary>> = None;
            loop {
                match lister.list(&viewer).await {
                    Ok(list) => {
                        if last.as_ref() != Some(&list) {
                            if tx.send(list.clone()).await.is_err() {
                                break;
                            }
                            last = Some(list);
                        }
                    }
                    // Storage hiccup: keep the stream alive, retry on the next change
                    Err(e) => warn!("Chat list for {} not recomputed: {}", viewer.user_id, e),
                }

                let wake_in = lister.typing.next_expiry_for(&viewer.user_id).await.map(until);
                let closed = tokio::select! {
                    r = inbox.recv() => is_closed(r),
                    r = roster.recv() => is_closed(r),
                    r = presence.recv() => is_closed(r),
                    _ = sleep(wake_in.unwrap_or_default()), if wake_in.is_some() => false,
                };
                if closed {
                    debug!("Chat list stream for {} closed", viewer.user_id);
                    break;
                }
            }
        });

        Subscription::new(rx, task)
    }
}

fn is_closed<T>(r: std::result::Result<T, RecvError>) -> bool {
    matches!(r, Err(RecvError::Closed))
}

/// Descending by last visible message; conversations without one go last,
/// ordered by participant name.
pub fn order_summaries(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| {
        match (&a.last_visible_message, &b.last_visible_message) {
            (Some(x), Some(y)) => y.order_key().cmp(&x.order_key()),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| {
            a.other_participant
                .name
                .to_lowercase()
                .cmp(&b.other_participant.name.to_lowercase())
        })
        .then_with(|| a.other_participant.user_id.cmp(&b.other_participant.user_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_types::{DeliveryState, Message, MessageId, UserId};
    use std::collections::BTreeSet;

    fn summary(other: &str, name: &str, last_at: Option<i64>) -> ConversationSummary {
        let me = UserId::from("me");
        let other_id = UserId::from(other);
        let conversation_id = ConversationId::new(&me, &other_id);
        ConversationSummary {
            last_visible_message: last_at.map(|at| Message {
                id: MessageId::from(format!("m{}", at)),
                sender_id: other_id.clone(),
                receiver_id: me.clone(),
                conversation_id: conversation_id.clone(),
                text: "x".to_string(),
                created_at_millis: at,
                delivery_state: DeliveryState::Sent,
                deleted_by: BTreeSet::new(),
            }),
            conversation_id,
            other_participant: RosterEntry {
                user_id: other_id,
                name: name.to_string(),
                email: String::new(),
                role: String::new(),
                avatar_url: None,
            },
            unread_count: 0,
            typing_now: false,
            presence: None,
        }
    }

    #[test]
    fn test_order_by_recency_then_name() {
        let mut list = vec![
            summary("u1", "zoe", None),
            summary("u2", "Amy", None),
            summary("u3", "Bob", Some(100)),
            summary("u4", "Cal", Some(300)),
        ];
        order_summaries(&mut list);
        let names: Vec<_> = list.iter().map(|s| s.other_participant.name.as_str()).collect();
        assert_eq!(names, vec!["Cal", "Bob", "Amy", "zoe"]);
    }
}
