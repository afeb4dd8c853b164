/// StaffChat - branch-local staff messaging core
///
/// 1:1 conversations between staff members of one branch with presence,
/// typing indicators, delivery receipts, unread counts and per-viewer
/// clear/delete. All state changes are pushed to subscribers.

pub mod error;
pub mod config;
pub mod chat_types;
pub mod event_bus;
pub mod message_store;
pub mod visibility;
pub mod unread;
pub mod presence;
pub mod typing;
pub mod roster;
pub mod conversations;
pub mod service;
pub mod session;
pub mod messenger_api;
pub mod utils;

pub use chat_types::{ConversationId, DeliveryState, Identity, Message, MessageId, UserId};
pub use config::Config;
pub use error::{ChatError, Result};
pub use service::ChatService;
pub use session::ChatSession;
