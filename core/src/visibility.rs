/// Per-viewer visibility: clear horizons and delete-selected tombstones.
///
/// Neither operation touches what the other participant sees; horizons are
/// keyed by (conversation, user) and tombstones only add the caller's id.
use crate::chat_types::{ClearHorizon, ConversationId, Message, MessageId, UserId};
use crate::error::{ChatError, Result};
use crate::message_store::MessageStore;
use tracing::{debug, warn};

fn horizon_key(conversation: &ConversationId, user: &UserId) -> String {
    format!("{}|{}", conversation, user)
}

#[derive(Clone)]
pub struct VisibilityFilter {
    horizons: sled::Tree,
    store: MessageStore,
}

impl VisibilityFilter {
    pub fn new(db: &sled::Db, store: MessageStore) -> Result<Self> {
        let horizons = db
            .open_tree("clear_horizons")
            .map_err(|e| ChatError::Storage(format!("Failed to open clear_horizons: {}", e)))?;
        Ok(Self { horizons, store })
    }

    pub fn horizon(&self, conversation: &ConversationId, user: &UserId) -> Result<Option<ClearHorizon>> {
        let value = self
            .horizons
            .get(horizon_key(conversation, user).as_bytes())
            .map_err(|e| ChatError::Storage(format!("get horizon: {}", e)))?;
        Ok(value.map(|v| ClearHorizon {
            conversation_id: conversation.clone(),
            user_id: user.clone(),
            cleared_at_millis: decode_millis(&v),
        }))
    }

    /// Highest horizon any participant has set on the conversation
    pub fn max_horizon(&self, conversation: &ConversationId) -> Result<Option<i64>> {
        let mut max = None;
        for entry in self.horizons.scan_prefix(format!("{}|", conversation).as_bytes()) {
            let (_, value) = entry.map_err(|e| ChatError::Storage(format!("scan horizons: {}", e)))?;
            let millis = decode_millis(&value);
            max = Some(max.map_or(millis, |m: i64| m.max(millis)));
        }
        Ok(max)
    }

    /// Hide everything up to `now_millis` from `user` only.
    /// The horizon never moves backwards, even if the clock does.
    pub fn clear_chat(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        now_millis: i64,
    ) -> Result<ClearHorizon> {
        let key = horizon_key(conversation, user);
        let updated = self
            .horizons
            .update_and_fetch(key.as_bytes(), |old| {
                let current = old.map(decode_millis).unwrap_or(i64::MIN);
                Some(current.max(now_millis).to_be_bytes().to_vec())
            })
            .map_err(|e| ChatError::Storage(format!("Failed to set horizon: {}", e)))?;

        let cleared_at_millis = updated.map(|v| decode_millis(&v)).unwrap_or(now_millis);
        debug!("{} cleared {} up to {}", user, conversation, cleared_at_millis);
        Ok(ClearHorizon {
            conversation_id: conversation.clone(),
            user_id: user.clone(),
            cleared_at_millis,
        })
    }

    /// Tombstone the listed messages for `user`. Ids outside the
    /// conversation are skipped. Returns how many were newly hidden.
    pub fn delete_selected(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        ids: &[MessageId],
    ) -> Result<usize> {
        let mut hidden = 0;
        for id in ids {
            match self.store.get(id)? {
                Some(m) if &m.conversation_id == conversation => {}
                Some(_) => {
                    warn!("Skipping {}: not part of {}", id, conversation);
                    continue;
                }
                None => {
                    warn!("Skipping unknown message {}", id);
                    continue;
                }
            }
            if let Some((true, _)) = self.store.add_tombstone(id, user)? {
                hidden += 1;
            }
        }
        debug!("{} hid {} messages in {}", user, hidden, conversation);
        Ok(hidden)
    }

    /// Messages `user` can see, in render order
    pub fn visible_messages(&self, conversation: &ConversationId, user: &UserId) -> Result<Vec<Message>> {
        let horizon = self.horizon(conversation, user)?.map(|h| h.cleared_at_millis);
        let mut messages = self.store.conversation_messages(conversation)?;
        messages.retain(|m| m.is_visible_to(user, horizon));
        Ok(messages)
    }
}

fn decode_millis(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    i64::from_be_bytes(buf)
}
