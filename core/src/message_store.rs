/// Message persistence: append-only conversation logs stored in sled DB
///
/// Keys are `<conversation>|<created_at:020>|<id>`, so a prefix scan of a
/// conversation returns its messages in render order (timestamp, then id).
/// Ids come from sled's monotonic id generator, which makes the tie-break
/// follow send order when timestamps collide.
use crate::chat_types::{ConversationId, DeliveryState, Message, MessageId, Transition, UserId};
use crate::error::{ChatError, Result};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// Open the chat database; `None` gives a throwaway temporary database
pub fn open_database(data_dir: Option<&Path>) -> Result<sled::Db> {
    match data_dir {
        Some(dir) => {
            let db_path = dir.join("chat.db");
            let db = sled::open(&db_path)
                .map_err(|e| ChatError::Storage(format!("Failed to open chat DB: {}", e)))?;
            info!("Chat database opened at {:?}", db_path);
            Ok(db)
        }
        None => sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| ChatError::Storage(format!("Failed to open temporary DB: {}", e))),
    }
}

fn message_key(conversation: &ConversationId, created_at_millis: i64, id: &MessageId) -> String {
    format!("{}|{:020}|{}", conversation, created_at_millis.max(0), id)
}

fn conversation_prefix(conversation: &ConversationId) -> String {
    format!("{}|", conversation)
}

#[derive(Clone)]
pub struct MessageStore {
    db: sled::Db,
    messages: sled::Tree,
    /// message id -> message key
    index: sled::Tree,
    /// conversation -> key of the newest message
    last_message: sled::Tree,
}

impl MessageStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| ChatError::Storage(format!("Failed to open tree {}: {}", name, e)))
        };
        Ok(Self {
            db: db.clone(),
            messages: open("messages")?,
            index: open("message_index")?,
            last_message: open("last_message")?,
        })
    }

    /// Append a new message in state `Sent`
    pub fn append(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        receiver: &UserId,
        text: &str,
        created_at_millis: i64,
    ) -> Result<Message> {
        let seq = self
            .db
            .generate_id()
            .map_err(|e| ChatError::Storage(format!("Failed to allocate message id: {}", e)))?;
        let id = MessageId(format!("m{:016x}", seq));

        let message = Message {
            id: id.clone(),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            conversation_id: conversation.clone(),
            text: text.to_string(),
            created_at_millis,
            delivery_state: DeliveryState::Sent,
            deleted_by: BTreeSet::new(),
        };

        let key = message_key(conversation, created_at_millis, &id);
        let value = serde_json::to_vec(&message).map_err(ChatError::Serialization)?;

        self.messages
            .insert(key.as_bytes(), value)
            .map_err(|e| ChatError::Storage(format!("Failed to save message: {}", e)))?;
        self.index
            .insert(id.as_str().as_bytes(), key.as_bytes())
            .map_err(|e| ChatError::Storage(format!("Failed to index message: {}", e)))?;

        // Concurrent senders race here; the pointer only ever moves to a later key
        self.last_message
            .fetch_and_update(conversation.to_string().as_bytes(), |old| match old {
                Some(existing) if existing >= key.as_bytes() => Some(existing.to_vec()),
                _ => Some(key.as_bytes().to_vec()),
            })
            .map_err(|e| ChatError::Storage(format!("Failed to update last message: {}", e)))?;

        debug!("Appended message {} to {}", id, conversation);
        Ok(message)
    }

    pub fn get(&self, id: &MessageId) -> Result<Option<Message>> {
        let key = match self
            .index
            .get(id.as_str().as_bytes())
            .map_err(|e| ChatError::Storage(format!("get message index: {}", e)))?
        {
            Some(key) => key,
            None => return Ok(None),
        };
        self.get_by_key(&key)
    }

    fn get_by_key(&self, key: &[u8]) -> Result<Option<Message>> {
        match self
            .messages
            .get(key)
            .map_err(|e| ChatError::Storage(format!("get message: {}", e)))?
        {
            Some(value) => Ok(Some(
                serde_json::from_slice(&value).map_err(ChatError::Serialization)?,
            )),
            None => Ok(None),
        }
    }

    /// All messages of a conversation, in render order
    pub fn conversation_messages(&self, conversation: &ConversationId) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        for entry in self.messages.scan_prefix(conversation_prefix(conversation).as_bytes()) {
            let (_, value) =
                entry.map_err(|e| ChatError::Storage(format!("scan messages: {}", e)))?;
            out.push(serde_json::from_slice::<Message>(&value).map_err(ChatError::Serialization)?);
        }
        Ok(out)
    }

    /// Newest message of a conversation regardless of viewer
    pub fn last_message(&self, conversation: &ConversationId) -> Result<Option<Message>> {
        match self
            .last_message
            .get(conversation.to_string().as_bytes())
            .map_err(|e| ChatError::Storage(format!("get last message: {}", e)))?
        {
            Some(key) => self.get_by_key(&key),
            None => Ok(None),
        }
    }

    /// Move a message's delivery state forward on behalf of `caller`.
    ///
    /// Runs as an atomic read-modify-write, so racing devices can never
    /// regress the state. Requests that would not move it forward, or that
    /// come from someone other than the receiver, leave the record untouched.
    pub fn advance(
        &self,
        id: &MessageId,
        caller: &UserId,
        target: DeliveryState,
    ) -> Result<(Transition, Message)> {
        let key = self
            .index
            .get(id.as_str().as_bytes())
            .map_err(|e| ChatError::Storage(format!("get message index: {}", e)))?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", id)))?;

        let mut outcome = Transition::NotAddressee;
        let mut failure: Option<serde_json::Error> = None;

        let updated = self
            .messages
            .update_and_fetch(&key, |old| {
                let bytes = old?;
                let mut message: Message = match serde_json::from_slice(bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        failure = Some(e);
                        return Some(bytes.to_vec());
                    }
                };
                if &message.receiver_id != caller {
                    outcome = Transition::NotAddressee;
                    return Some(bytes.to_vec());
                }
                if message.delivery_state >= target {
                    outcome = Transition::Unchanged(message.delivery_state);
                    return Some(bytes.to_vec());
                }
                message.delivery_state = target;
                match serde_json::to_vec(&message) {
                    Ok(v) => {
                        outcome = Transition::Advanced(target);
                        Some(v)
                    }
                    Err(e) => {
                        failure = Some(e);
                        Some(bytes.to_vec())
                    }
                }
            })
            .map_err(|e| ChatError::Storage(format!("Failed to update message state: {}", e)))?;

        if let Some(e) = failure {
            return Err(ChatError::Serialization(e));
        }
        let value = updated.ok_or_else(|| ChatError::NotFound(format!("message {}", id)))?;
        let message = serde_json::from_slice(&value).map_err(ChatError::Serialization)?;
        Ok((outcome, message))
    }

    /// Add `user` to a message's tombstone set; returns whether it was new.
    /// The set only ever grows and nothing else in the record changes.
    pub fn add_tombstone(&self, id: &MessageId, user: &UserId) -> Result<Option<(bool, Message)>> {
        let key = match self
            .index
            .get(id.as_str().as_bytes())
            .map_err(|e| ChatError::Storage(format!("get message index: {}", e)))?
        {
            Some(key) => key,
            None => return Ok(None),
        };

        let mut added = false;
        let mut failure: Option<serde_json::Error> = None;

        let updated = self
            .messages
            .update_and_fetch(&key, |old| {
                let bytes = old?;
                let mut message: Message = match serde_json::from_slice(bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        failure = Some(e);
                        return Some(bytes.to_vec());
                    }
                };
                added = message.deleted_by.insert(user.clone());
                if !added {
                    return Some(bytes.to_vec());
                }
                match serde_json::to_vec(&message) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        added = false;
                        failure = Some(e);
                        Some(bytes.to_vec())
                    }
                }
            })
            .map_err(|e| ChatError::Storage(format!("Failed to tombstone message: {}", e)))?;

        if let Some(e) = failure {
            return Err(ChatError::Serialization(e));
        }
        match updated {
            Some(value) => {
                let message = serde_json::from_slice(&value).map_err(ChatError::Serialization)?;
                Ok(Some((added, message)))
            }
            None => Ok(None),
        }
    }

    /// Get message count
    pub fn count(&self) -> usize {
        self.messages.len()
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| ChatError::Storage(format!("Failed to flush chat DB: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn users() -> (UserId, UserId, ConversationId) {
        let a = UserId::from("u1");
        let b = UserId::from("u2");
        let conv = ConversationId::new(&a, &b);
        (a, b, conv)
    }

    #[test]
    fn test_append_orders_by_timestamp_then_id() {
        let db = open_database(None).unwrap();
        let store = MessageStore::new(&db).unwrap();
        let (a, b, conv) = users();

        let late = store.append(&conv, &a, &b, "late", 2_000).unwrap();
        let first = store.append(&conv, &b, &a, "first", 1_000).unwrap();
        let second = store.append(&conv, &a, &b, "second", 1_000).unwrap();

        let texts: Vec<_> = store
            .conversation_messages(&conv)
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["first", "second", "late"]);
        assert!(first.id < second.id);
        assert_eq!(store.last_message(&conv).unwrap().unwrap().id, late.id);
    }

    #[test]
    fn test_conversations_do_not_bleed() {
        let db = open_database(None).unwrap();
        let store = MessageStore::new(&db).unwrap();
        let (a, b, conv) = users();
        let c = UserId::from("u3");
        let other = ConversationId::new(&a, &c);

        store.append(&conv, &a, &b, "to b", 1).unwrap();
        store.append(&other, &a, &c, "to c", 2).unwrap();

        assert_eq!(store.conversation_messages(&conv).unwrap().len(), 1);
        assert_eq!(store.conversation_messages(&other).unwrap().len(), 1);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_advance_is_forward_only() {
        let db = open_database(None).unwrap();
        let store = MessageStore::new(&db).unwrap();
        let (a, b, conv) = users();
        let msg = store.append(&conv, &a, &b, "hi", 10).unwrap();

        let (t, _) = store.advance(&msg.id, &b, DeliveryState::Read).unwrap();
        assert_eq!(t, Transition::Advanced(DeliveryState::Read));

        let (t, m) = store.advance(&msg.id, &b, DeliveryState::Delivered).unwrap();
        assert_eq!(t, Transition::Unchanged(DeliveryState::Read));
        assert_eq!(m.delivery_state, DeliveryState::Read);

        let (t, _) = store.advance(&msg.id, &b, DeliveryState::Read).unwrap();
        assert_eq!(t, Transition::Unchanged(DeliveryState::Read));
    }

    #[test]
    fn test_advance_by_sender_is_ignored() {
        let db = open_database(None).unwrap();
        let store = MessageStore::new(&db).unwrap();
        let (a, b, conv) = users();
        let msg = store.append(&conv, &a, &b, "hi", 10).unwrap();

        let (t, m) = store.advance(&msg.id, &a, DeliveryState::Delivered).unwrap();
        assert_eq!(t, Transition::NotAddressee);
        assert_eq!(m.delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn test_advance_unknown_message() {
        let db = open_database(None).unwrap();
        let store = MessageStore::new(&db).unwrap();
        let result = store.advance(&MessageId::from("nope"), &UserId::from("u1"), DeliveryState::Read);
        assert!(matches!(result, Err(ChatError::NotFound(_))));
    }

    #[test]
    fn test_tombstones_accumulate() {
        let db = open_database(None).unwrap();
        let store = MessageStore::new(&db).unwrap();
        let (a, b, conv) = users();
        let msg = store.append(&conv, &a, &b, "hi", 10).unwrap();

        let (added, _) = store.add_tombstone(&msg.id, &b).unwrap().unwrap();
        assert!(added);
        let (added, _) = store.add_tombstone(&msg.id, &b).unwrap().unwrap();
        assert!(!added);
        let (added, m) = store.add_tombstone(&msg.id, &a).unwrap().unwrap();
        assert!(added);
        assert_eq!(m.deleted_by.len(), 2);
        assert_eq!(m.text, "hi");
        assert_eq!(m.delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn test_messages_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let (a, b, conv) = users();
        {
            let db = open_database(Some(temp_dir.path())).unwrap();
            let store = MessageStore::new(&db).unwrap();
            store.append(&conv, &a, &b, "persisted", 5).unwrap();
            store.flush().unwrap();
        }
        let db = open_database(Some(temp_dir.path())).unwrap();
        let store = MessageStore::new(&db).unwrap();
        let messages = store.conversation_messages(&conv).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "persisted");
    }
}
