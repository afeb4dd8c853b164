/// Presence tracking: online/offline + last seen per user per scope.
///
/// `set_online` registers a disconnect hook with the liveness monitor. A
/// hooked record that stops receiving heartbeats for longer than the grace
/// period is flipped offline by the monitor, so abrupt disconnects cannot
/// leave a user online forever.
use crate::chat_types::{now_millis, ChatEvent, PresenceRecord, ScopeId, UserId};
use crate::config::Config;
use crate::event_bus::{EventBus, Subscription, Topic};
use crate::utils::backoff::retry_with_backoff;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const HOOK_QUEUE: usize = 64;

type PresenceKey = (UserId, ScopeId);

#[derive(Debug, Clone)]
struct PresenceEntry {
    record: PresenceRecord,
    last_heartbeat: Instant,
}

impl PresenceEntry {
    fn is_expired(&self, grace: Duration) -> bool {
        self.record.online && self.last_heartbeat.elapsed() > grace
    }
}

#[derive(Clone)]
pub struct PresenceTracker {
    records: Arc<RwLock<HashMap<PresenceKey, PresenceEntry>>>,
    bus: EventBus,
    grace: Duration,
    sweep_interval: Duration,
    hook_tx: mpsc::Sender<PresenceKey>,
    hook_rx: Arc<Mutex<Option<mpsc::Receiver<PresenceKey>>>>,
    hook_retry_attempts: u32,
    hook_retry_base: Duration,
}

impl PresenceTracker {
    pub fn new(config: &Config, bus: EventBus) -> Self {
        let (hook_tx, hook_rx) = mpsc::channel(HOOK_QUEUE);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            bus,
            grace: config.presence_grace,
            sweep_interval: config.heartbeat_interval,
            hook_tx,
            hook_rx: Arc::new(Mutex::new(Some(hook_rx))),
            hook_retry_attempts: config.hook_retry_attempts,
            hook_retry_base: config.hook_retry_base,
        }
    }

    pub async fn set_online(&self, user: &UserId, scope: &ScopeId) -> Option<PresenceRecord> {
        let record = self.apply(user, scope, true, now_millis()).await?;
        self.register_disconnect_hook((user.clone(), scope.clone()));
        Some(record)
    }

    pub async fn set_offline(&self, user: &UserId, scope: &ScopeId) -> Option<PresenceRecord> {
        self.apply(user, scope, false, now_millis()).await
    }

    /// Refresh the liveness lease and last-seen time; returns false if the
    /// user is not online in that scope (the client must call `set_online`
    /// again). Not published: the online flag is unchanged.
    pub async fn heartbeat(&self, user: &UserId, scope: &ScopeId) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(&(user.clone(), scope.clone())) {
            Some(entry) if entry.record.online => {
                entry.last_heartbeat = Instant::now();
                entry.record.last_seen_millis = entry.record.last_seen_millis.max(now_millis());
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, user: &UserId, scope: &ScopeId) -> Option<PresenceRecord> {
        let records = self.records.read().await;
        records
            .get(&(user.clone(), scope.clone()))
            .map(|e| e.record.clone())
    }

    pub async fn scope_records(&self, scope: &ScopeId) -> Vec<PresenceRecord> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|e| &e.record.scope == scope)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Last-write-wins by timestamp; an older write is dropped
    async fn apply(
        &self,
        user: &UserId,
        scope: &ScopeId,
        online: bool,
        at_millis: i64,
    ) -> Option<PresenceRecord> {
        let record = {
            let mut records = self.records.write().await;
            let key = (user.clone(), scope.clone());
            if let Some(existing) = records.get(&key) {
                if existing.record.last_seen_millis > at_millis {
                    debug!("Dropping stale presence write for {} in {}", user, scope);
                    return None;
                }
            }
            let record = PresenceRecord {
                user_id: user.clone(),
                scope: scope.clone(),
                online,
                last_seen_millis: at_millis,
            };
            records.insert(
                key,
                PresenceEntry {
                    record: record.clone(),
                    last_heartbeat: Instant::now(),
                },
            );
            record
        };

        debug!("{} is {} in {}", user, if online { "online" } else { "offline" }, scope);
        self.bus
            .publish(
                Topic::Presence(scope.clone()),
                ChatEvent::PresenceChanged { record: record.clone() },
            )
            .await;
        Some(record)
    }

    /// Best-effort: a full hook queue is retried with backoff in the
    /// background; the caller never waits for it.
    fn register_disconnect_hook(&self, key: PresenceKey) {
        let tx = self.hook_tx.clone();
        let attempts = self.hook_retry_attempts;
        let base = self.hook_retry_base;
        tokio::spawn(async move {
            let result = retry_with_backoff(attempts, base, |_| tx.try_send(key.clone())).await;
            if let Err(e) = result {
                warn!("Disconnect hook for {} in {} not registered: {}", key.0, key.1, e);
            }
        });
    }

    /// Liveness monitor: collects disconnect hooks and flips hooked records
    /// offline once their heartbeat is older than the grace period.
    /// Only the first caller runs the monitor.
    pub async fn run_liveness(&self) {
        let mut rx = match self.hook_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("Liveness monitor already running");
                return;
            }
        };
        info!(
            "Liveness monitor started (grace {:?}, sweep every {:?})",
            self.grace, self.sweep_interval
        );

        let mut hooked: HashSet<PresenceKey> = HashSet::new();
        let mut tick = interval(self.sweep_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                key = rx.recv() => match key {
                    Some(key) => {
                        hooked.insert(key);
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    let expired = self.sweep(&mut hooked).await;
                    if expired > 0 {
                        info!("Liveness sweep flipped {} users offline", expired);
                    }
                }
            }
        }
    }

    async fn sweep(&self, hooked: &mut HashSet<PresenceKey>) -> usize {
        let flipped: Vec<PresenceRecord> = {
            let mut records = self.records.write().await;
            let detected_at = now_millis();
            let mut flipped = Vec::new();
            hooked.retain(|key| match records.get_mut(key) {
                Some(entry) if entry.is_expired(self.grace) => {
                    entry.record.online = false;
                    entry.record.last_seen_millis = detected_at;
                    flipped.push(entry.record.clone());
                    false
                }
                Some(entry) => entry.record.online,
                None => false,
            });
            flipped
        };

        for record in &flipped {
            warn!("Presence lease expired for {} in {}", record.user_id, record.scope);
            self.bus
                .publish(
                    Topic::Presence(record.scope.clone()),
                    ChatEvent::PresenceChanged { record: record.clone() },
                )
                .await;
        }
        flipped.len()
    }

    /// Stream of `user`'s presence in `scope`, starting with the current record
    pub async fn subscribe(&self, user: &UserId, scope: &ScopeId) -> Subscription<PresenceRecord> {
        let mut events = self.bus.subscribe(Topic::Presence(scope.clone())).await;
        let (tx, rx) = mpsc::channel(16);
        let tracker = self.clone();
        let user = user.clone();
        let scope = scope.clone();

        let task = tokio::spawn(async move {
            if let Some(current) = tracker.get(&user, &scope).await {
                if tx.send(current).await.is_err() {
                    return;
                }
            }
            loop {
                let next = match events.recv().await {
                    Ok(ChatEvent::PresenceChanged { record }) if record.user_id == user => record,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(n)) => {
                        debug!("Presence subscriber lagged {} events", n);
                        match tracker.get(&user, &scope).await {
                            Some(current) => current,
                            None => continue,
                        }
                    }
                    Err(RecvError::Closed) => break,
                };
                if tx.send(next).await.is_err() {
                    break;
                }
            }
        });

        Subscription::new(rx, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn fast_config() -> Config {
        Config {
            heartbeat_interval: Duration::from_millis(20),
            presence_grace: Duration::from_millis(60),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_online_offline() {
        let tracker = PresenceTracker::new(&fast_config(), EventBus::new(16));
        let user = UserId::from("u1");
        let scope = ScopeId::from("branch:b1");

        let rec = tracker.set_online(&user, &scope).await.unwrap();
        assert!(rec.online);
        assert!(tracker.heartbeat(&user, &scope).await);

        let rec = tracker.set_offline(&user, &scope).await.unwrap();
        assert!(!rec.online);
        assert!(!tracker.heartbeat(&user, &scope).await);
        assert_eq!(tracker.scope_records(&scope).await.len(), 1);
    }

    #[tokio::test]
    async fn test_older_write_loses() {
        let tracker = PresenceTracker::new(&fast_config(), EventBus::new(16));
        let user = UserId::from("u1");
        let scope = ScopeId::from("s");

        tracker.apply(&user, &scope, true, 2_000).await.unwrap();
        assert!(tracker.apply(&user, &scope, false, 1_000).await.is_none());
        assert!(tracker.get(&user, &scope).await.unwrap().online);
    }

    #[tokio::test]
    async fn test_missed_heartbeats_flip_offline() {
        let tracker = PresenceTracker::new(&fast_config(), EventBus::new(16));
        let monitor = {
            let t = tracker.clone();
            tokio::spawn(async move { t.run_liveness().await })
        };
        let user = UserId::from("u1");
        let scope = ScopeId::from("s");

        let mut sub = tracker.subscribe(&user, &scope).await;
        tracker.set_online(&user, &scope).await.unwrap();

        let went_offline = timeout(Duration::from_secs(2), async {
            while let Some(record) = sub.recv().await {
                if !record.online {
                    return record;
                }
            }
            panic!("presence stream ended");
        })
        .await
        .expect("presence never flipped offline");

        assert_eq!(went_offline.user_id, user);
        monitor.abort();
    }

    #[tokio::test]
    async fn test_heartbeats_keep_user_online() {
        let tracker = PresenceTracker::new(&fast_config(), EventBus::new(16));
        let monitor = {
            let t = tracker.clone();
            tokio::spawn(async move { t.run_liveness().await })
        };
        let user = UserId::from("u1");
        let scope = ScopeId::from("s");
        let first = tracker.set_online(&user, &scope).await.unwrap();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            assert!(tracker.heartbeat(&user, &scope).await);
        }
        let current = tracker.get(&user, &scope).await.unwrap();
        assert!(current.online);
        assert!(current.last_seen_millis >= first.last_seen_millis + 100);
        monitor.abort();
    }
}
