/// Typing signals: short-lived per-conversation, per-user flags.
///
/// Two independent guards keep a signal from sticking: every `start` schedules
/// its own expiry write, and every reader treats a signal past
/// `expires_at_millis` as not typing. Subscribers also wake up at the next
/// expiry, so they report the change even if the expiry write never lands.
/// Entries leave the map once stopped or expired.
use crate::chat_types::{now_millis, ChatEvent, ConversationId, TypingSignal, UserId};
use crate::event_bus::{EventBus, Subscription, Topic};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tracing::debug;

type TypingKey = (ConversationId, UserId);

#[derive(Debug, Clone)]
struct TypingEntry {
    signal: TypingSignal,
    /// Unique per write; a scheduled expiry only fires for its own write
    generation: u64,
}

#[derive(Clone)]
pub struct TypingChannel {
    signals: Arc<RwLock<HashMap<TypingKey, TypingEntry>>>,
    generations: Arc<AtomicU64>,
    bus: EventBus,
}

impl TypingChannel {
    pub fn new(bus: EventBus) -> Self {
        Self {
            signals: Arc::new(RwLock::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            bus,
        }
    }

    pub async fn start_typing(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        ttl: Duration,
    ) -> TypingSignal {
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at_millis = now_millis().saturating_add(ttl_millis);
        let (signal, generation) = self.write(conversation, user, expires_at_millis).await;

        let channel = self.clone();
        let conversation = conversation.clone();
        let user = user.clone();
        tokio::spawn(async move {
            sleep(ttl).await;
            channel.expire(&conversation, &user, generation).await;
        });

        signal
    }

    pub async fn stop_typing(&self, conversation: &ConversationId, user: &UserId) -> TypingSignal {
        self.signals
            .write()
            .await
            .remove(&(conversation.clone(), user.clone()));
        let signal = TypingSignal {
            conversation_id: conversation.clone(),
            user_id: user.clone(),
            is_typing: false,
            expires_at_millis: now_millis(),
        };
        self.publish(&signal).await;
        signal
    }

    async fn write(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        expires_at_millis: i64,
    ) -> (TypingSignal, u64) {
        let signal = TypingSignal {
            conversation_id: conversation.clone(),
            user_id: user.clone(),
            is_typing: true,
            expires_at_millis,
        };
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        self.signals.write().await.insert(
            (conversation.clone(), user.clone()),
            TypingEntry {
                signal: signal.clone(),
                generation,
            },
        );
        self.publish(&signal).await;
        (signal, generation)
    }

    /// Scheduled removal; a no-op if a newer keystroke or a stop superseded it
    async fn expire(&self, conversation: &ConversationId, user: &UserId, generation: u64) {
        let key = (conversation.clone(), user.clone());
        let signal = {
            let mut signals = self.signals.write().await;
            match signals.get(&key) {
                Some(entry) if entry.generation == generation => {}
                _ => return,
            }
            match signals.remove(&key) {
                Some(entry) => TypingSignal {
                    is_typing: false,
                    ..entry.signal
                },
                None => return,
            }
        };
        debug!("Typing signal of {} in {} expired", user, conversation);
        self.publish(&signal).await;
    }

    async fn publish(&self, signal: &TypingSignal) {
        let event = ChatEvent::TypingChanged { signal: signal.clone() };
        let (a, b) = signal.conversation_id.participants();
        self.bus
            .publish_all(
                &[
                    Topic::Typing(signal.conversation_id.clone()),
                    Topic::Inbox(a.clone()),
                    Topic::Inbox(b.clone()),
                ],
                event,
            )
            .await;
    }

    /// Users currently typing in a conversation
    pub async fn typing_users(&self, conversation: &ConversationId) -> BTreeSet<UserId> {
        let now = now_millis();
        let signals = self.signals.read().await;
        signals
            .values()
            .filter(|e| &e.signal.conversation_id == conversation && e.signal.is_active(now))
            .map(|e| e.signal.user_id.clone())
            .collect()
    }

    pub async fn is_typing(&self, conversation: &ConversationId, user: &UserId) -> bool {
        let signals = self.signals.read().await;
        signals
            .get(&(conversation.clone(), user.clone()))
            .map(|e| e.signal.is_active(now_millis()))
            .unwrap_or(false)
    }

    /// Earliest expiry among active signals matching `filter`
    async fn next_expiry<F>(&self, filter: F) -> Option<i64>
    where
        F: Fn(&TypingSignal) -> bool,
    {
        let now = now_millis();
        let signals = self.signals.read().await;
        signals
            .values()
            .filter(|e| e.signal.is_active(now) && filter(&e.signal))
            .map(|e| e.signal.expires_at_millis)
            .min()
    }

    /// Earliest expiry among active signals in a conversation
    pub async fn next_expiry_in(&self, conversation: &ConversationId) -> Option<i64> {
        self.next_expiry(|s| &s.conversation_id == conversation).await
    }

    /// Earliest expiry among active signals in any conversation of `user`
    pub async fn next_expiry_for(&self, user: &UserId) -> Option<i64> {
        self.next_expiry(|s| s.conversation_id.is_participant(user)).await
    }

    /// Stream of the typing set of a conversation. Emits the current set,
    /// then every change, including changes caused purely by expiry.
    pub async fn subscribe(&self, conversation: &ConversationId) -> Subscription<BTreeSet<UserId>> {
        let mut events = self.bus.subscribe(Topic::Typing(conversation.clone())).await;
        let (tx, rx) = mpsc::channel(16);
        let channel = self.clone();
        let conversation = conversation.clone();

        let task = tokio::spawn(async move {
            let mut last = channel.typing_users(&conversation).await;
            if tx.send(last.clone()).await.is_err() {
                return;
            }
            loop {
                let wake_in = channel
                    .next_expiry_in(&conversation)
                    .await
                    .map(until);

                tokio::select! {
                    event = events.recv() => match event {
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => debug!("Typing subscriber lagged {} events", n),
                        Err(RecvError::Closed) => break,
                    },
                    _ = sleep(wake_in.unwrap_or_default()), if wake_in.is_some() => {}
                }

                let current = channel.typing_users(&conversation).await;
                if current != last {
                    if tx.send(current.clone()).await.is_err() {
                        break;
                    }
                    last = current;
                }
            }
        });

        Subscription::new(rx, task)
    }
}

/// Time left until just past `at_millis`
pub(crate) fn until(at_millis: i64) -> Duration {
    let delta = at_millis - now_millis() + 1;
    Duration::from_millis(delta.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn conv() -> (ConversationId, UserId, UserId) {
        let a = UserId::from("u1");
        let b = UserId::from("u2");
        (ConversationId::new(&a, &b), a, b)
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let channel = TypingChannel::new(EventBus::new(16));
        let (c, a, _) = conv();

        channel.start_typing(&c, &a, Duration::from_secs(5)).await;
        assert!(channel.is_typing(&c, &a).await);

        channel.stop_typing(&c, &a).await;
        assert!(!channel.is_typing(&c, &a).await);
        assert!(channel.typing_users(&c).await.is_empty());
        assert!(channel.signals.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_expiry() {
        let channel = TypingChannel::new(EventBus::new(16));
        let (c, a, _) = conv();

        channel.start_typing(&c, &a, Duration::from_millis(50)).await;
        sleep(Duration::from_millis(120)).await;

        assert!(!channel.is_typing(&c, &a).await);
        assert!(channel.signals.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_expiry_after_stop_and_restart() {
        let channel = TypingChannel::new(EventBus::new(16));
        let (c, a, _) = conv();

        channel.start_typing(&c, &a, Duration::from_millis(50)).await;
        channel.stop_typing(&c, &a).await;
        channel.start_typing(&c, &a, Duration::from_millis(400)).await;
        sleep(Duration::from_millis(120)).await;

        // The first start's expiry has fired; it must not cut the restart short
        assert!(channel.is_typing(&c, &a).await);
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates() {
        let channel = TypingChannel::new(EventBus::new(16));
        let (c, a, _) = conv();

        let signal = channel
            .start_typing(&c, &a, Duration::from_millis(u64::MAX))
            .await;
        assert_eq!(signal.expires_at_millis, i64::MAX);
        channel.stop_typing(&c, &a).await;
        assert!(channel.signals.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_new_keystroke_supersedes_expiry() {
        let channel = TypingChannel::new(EventBus::new(16));
        let (c, a, _) = conv();

        channel.start_typing(&c, &a, Duration::from_millis(60)).await;
        sleep(Duration::from_millis(40)).await;
        channel.start_typing(&c, &a, Duration::from_millis(200)).await;
        sleep(Duration::from_millis(40)).await;

        // First expiry has fired by now but must not clear the newer signal
        assert!(channel.is_typing(&c, &a).await);
    }

    #[tokio::test]
    async fn test_subscriber_expires_without_expiry_write() {
        let channel = TypingChannel::new(EventBus::new(16));
        let (c, a, _) = conv();

        // Simulate a dropped expiry write: the flag is set but nothing flips it
        channel.signals.write().await.insert(
            (c.clone(), a.clone()),
            TypingEntry {
                signal: TypingSignal {
                    conversation_id: c.clone(),
                    user_id: a.clone(),
                    is_typing: true,
                    expires_at_millis: now_millis() + 80,
                },
                generation: 1,
            },
        );

        let mut sub = channel.subscribe(&c).await;
        let first = sub.recv().await.unwrap();
        assert!(first.contains(&a));

        let next = timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("subscriber never noticed the expiry")
            .unwrap();
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_sees_other_participant() {
        let channel = TypingChannel::new(EventBus::new(16));
        let (c, a, b) = conv();
        let mut sub = channel.subscribe(&c).await;
        assert!(sub.recv().await.unwrap().is_empty());

        channel.start_typing(&c, &b, Duration::from_secs(5)).await;
        let set = sub.recv().await.unwrap();
        assert!(set.contains(&b));
        assert!(!set.contains(&a));
    }
}
