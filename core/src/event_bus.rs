/// Topic-keyed publish/subscribe for chat change notifications
use crate::chat_types::{BranchId, ChatEvent, ConversationId, ScopeId, UserId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Channel a change notification is published on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Message log changes of one conversation
    Conversation(ConversationId),
    /// Typing signals of one conversation
    Typing(ConversationId),
    /// Presence records within one scope
    Presence(ScopeId),
    /// Everything a user's chat list depends on
    Inbox(UserId),
    /// Roster membership of a branch
    Roster(BranchId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Conversation(id) => write!(f, "conversation/{}", id),
            Topic::Typing(id) => write!(f, "typing/{}", id),
            Topic::Presence(scope) => write!(f, "presence/{}", scope),
            Topic::Inbox(user) => write!(f, "inbox/{}", user),
            Topic::Roster(branch) => write!(f, "roster/{}", branch),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    channels: Arc<RwLock<HashMap<Topic, broadcast::Sender<ChatEvent>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> broadcast::Receiver<ChatEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to a topic; returns how many receivers got the event
    pub async fn publish(&self, topic: Topic, event: ChatEvent) -> usize {
        let delivered = {
            let channels = self.channels.read().await;
            match channels.get(&topic) {
                Some(tx) => tx.send(event).ok(),
                None => return 0,
            }
        };

        match delivered {
            Some(n) => n,
            None => {
                // Every receiver is gone; drop the channel
                let mut channels = self.channels.write().await;
                if channels
                    .get(&topic)
                    .map(|tx| tx.receiver_count() == 0)
                    .unwrap_or(false)
                {
                    channels.remove(&topic);
                    debug!("Dropped idle topic {}", topic);
                }
                0
            }
        }
    }

    /// Publish the same event on several topics
    pub async fn publish_all(&self, topics: &[Topic], event: ChatEvent) {
        for topic in topics {
            self.publish(topic.clone(), event.clone()).await;
        }
    }

    pub async fn topic_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

/// Cancellable handle to a push stream.
///
/// A forwarder task feeds the receiver; cancelling (or dropping) the handle
/// aborts the task so no listener outlives its subscriber.
pub struct Subscription<T> {
    id: Uuid,
    rx: mpsc::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(rx: mpsc::Receiver<T>, task: JoinHandle<()>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rx,
            task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next pushed value; `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn cancel(self) {
        debug!("Subscription {} cancelled", self.id);
        // Drop aborts the forwarder
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
