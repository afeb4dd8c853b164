/// Shared types for the chat subsystem
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable user id supplied by the identity provider
    UserId
);
string_id!(
    /// Branch the user belongs to; all chat is branch-local
    BranchId
);
string_id!(
    /// Presence scope (a branch roster or a single conversation)
    ScopeId
);
string_id!(MessageId);

impl UserId {
    /// Ids are embedded in conversation ids and storage keys, so the
    /// separators used there are not allowed.
    pub fn validate(&self) -> Result<()> {
        if self.0.trim().is_empty() {
            return Err(ChatError::Validation("user id must not be empty".to_string()));
        }
        if self.0.contains(':') || self.0.contains('|') {
            return Err(ChatError::Validation(format!(
                "user id {:?} contains a reserved character",
                self.0
            )));
        }
        Ok(())
    }
}

impl BranchId {
    /// Branch ids prefix roster keys and presence scopes
    pub fn validate(&self) -> Result<()> {
        if self.0.trim().is_empty() {
            return Err(ChatError::Validation("branch id must not be empty".to_string()));
        }
        if self.0.contains(':') || self.0.contains('|') {
            return Err(ChatError::Validation(format!(
                "branch id {:?} contains a reserved character",
                self.0
            )));
        }
        Ok(())
    }
}

impl ScopeId {
    /// Presence scope covering everyone on a branch roster
    pub fn branch(branch: &BranchId) -> Self {
        Self(format!("branch:{}", branch))
    }

    /// Presence scope of a single conversation
    pub fn conversation(conversation: &ConversationId) -> Self {
        Self(conversation.to_string())
    }
}

/// Order-independent id of the 1:1 conversation between two users.
///
/// Rendered as `dm:{min_id}:{max_id}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId {
    low: UserId,
    high: UserId,
}

impl ConversationId {
    pub fn new(a: &UserId, b: &UserId) -> Self {
        if a <= b {
            Self { low: a.clone(), high: b.clone() }
        } else {
            Self { low: b.clone(), high: a.clone() }
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("dm:")
            .ok_or_else(|| ChatError::Validation(format!("malformed conversation id {:?}", s)))?;
        let (a, b) = rest
            .split_once(':')
            .ok_or_else(|| ChatError::Validation(format!("malformed conversation id {:?}", s)))?;
        let (a, b) = (UserId::from(a), UserId::from(b));
        a.validate()?;
        b.validate()?;
        if a == b {
            return Err(ChatError::Validation(
                "a conversation needs two distinct participants".to_string(),
            ));
        }
        Ok(Self::new(&a, &b))
    }

    pub fn participants(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }

    pub fn is_participant(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// The participant that is not `user`, if `user` takes part at all
    pub fn other(&self, user: &UserId) -> Option<&UserId> {
        if &self.low == user {
            Some(&self.high)
        } else if &self.high == user {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dm:{}:{}", self.low, self.high)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = ChatError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.to_string()
    }
}

/// Delivery lifecycle of a message, seen from the receiver.
/// Ordered so that a transition is valid iff it increases the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub conversation_id: ConversationId,
    pub text: String,
    pub created_at_millis: i64,
    pub delivery_state: DeliveryState,
    #[serde(default)]
    pub deleted_by: BTreeSet<UserId>,
}

impl Message {
    pub fn is_visible_to(&self, user: &UserId, cleared_at_millis: Option<i64>) -> bool {
        if self.deleted_by.contains(user) {
            return false;
        }
        match cleared_at_millis {
            Some(horizon) => self.created_at_millis > horizon,
            None => true,
        }
    }

    /// Sort key giving the total order within a conversation
    pub fn order_key(&self) -> (i64, &MessageId) {
        (self.created_at_millis, &self.id)
    }
}

/// Result of a delivery-state transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// State moved forward to the contained state
    Advanced(DeliveryState),
    /// Already at or past the requested state
    Unchanged(DeliveryState),
    /// Caller is not the receiver of the message
    NotAddressee,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub scope: ScopeId,
    pub online: bool,
    pub last_seen_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
    pub expires_at_millis: i64,
}

impl TypingSignal {
    /// Viewer-side guard: an expired signal reads as not typing no matter
    /// what was last written.
    pub fn is_active(&self, now_millis: i64) -> bool {
        self.is_typing && now_millis <= self.expires_at_millis
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearHorizon {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub cleared_at_millis: i64,
}

/// One chattable staff member, as supplied by the roster service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Session identity supplied by the authentication collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub branch_id: BranchId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: String,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, branch_id: impl Into<BranchId>) -> Self {
        Self {
            user_id: user_id.into(),
            branch_id: branch_id.into(),
            display_name: String::new(),
            role: String::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.user_id.validate()?;
        self.branch_id.validate()
    }
}

/// Summary of one conversation for the chat list (derived, never stored)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub other_participant: RosterEntry,
    pub last_visible_message: Option<Message>,
    pub unread_count: usize,
    pub typing_now: bool,
    pub presence: Option<PresenceRecord>,
}

/// Change notifications published on the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A message was appended to a conversation log
    MessageAppended { message: Message },
    /// A message's delivery state moved forward
    DeliveryAdvanced {
        conversation_id: ConversationId,
        message_id: MessageId,
        state: DeliveryState,
    },
    /// Visibility changed for one viewer only (clear or delete-selected)
    VisibilityChanged {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    PresenceChanged { record: PresenceRecord },
    TypingChanged { signal: TypingSignal },
    RosterChanged { branch_id: BranchId },
}

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
