/// Unread counting, always derived from the visible message set
use crate::chat_types::{DeliveryState, Message, UserId};

/// Visible messages addressed to `viewer` that have not been read yet
pub fn unread_count(visible: &[Message], viewer: &UserId) -> usize {
    visible.iter().filter(|m| is_unread_for(m, viewer)).count()
}

pub fn is_unread_for(message: &Message, viewer: &UserId) -> bool {
    &message.receiver_id == viewer && message.delivery_state != DeliveryState::Read
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_types::{ConversationId, MessageId};
    use std::collections::BTreeSet;

    fn msg(id: &str, from: &str, to: &str, state: DeliveryState) -> Message {
        let (from, to) = (UserId::from(from), UserId::from(to));
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::new(&from, &to),
            sender_id: from,
            receiver_id: to,
            text: id.to_string(),
            created_at_millis: 0,
            delivery_state: state,
            deleted_by: BTreeSet::new(),
        }
    }

    #[test]
    fn test_counts_only_incoming_unread() {
        let me = UserId::from("b");
        let visible = vec![
            msg("1", "a", "b", DeliveryState::Sent),
            msg("2", "a", "b", DeliveryState::Delivered),
            msg("3", "a", "b", DeliveryState::Read),
            msg("4", "b", "a", DeliveryState::Sent),
        ];
        assert_eq!(unread_count(&visible, &me), 2);
        assert_eq!(unread_count(&visible, &UserId::from("a")), 1);
        assert_eq!(unread_count(&[], &me), 0);
    }
}
