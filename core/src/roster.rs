/// Roster storage: chattable staff per branch, persisted in sled DB.
///
/// The roster service owns the data; this is the local copy it refreshes.
/// Every change publishes `RosterChanged` so open chat lists recompute
/// without restarting their subscriptions.
use crate::chat_types::{BranchId, ChatEvent, RosterEntry, UserId};
use crate::error::{ChatError, Result};
use crate::event_bus::{EventBus, Topic};
use tracing::{debug, info};

fn entry_key(branch: &BranchId, user: &UserId) -> String {
    format!("{}|{}", branch, user)
}

#[derive(Clone)]
pub struct Roster {
    tree: sled::Tree,
    bus: EventBus,
}

impl Roster {
    pub fn new(db: &sled::Db, bus: EventBus) -> Result<Self> {
        let tree = db
            .open_tree("roster")
            .map_err(|e| ChatError::Storage(format!("roster DB: {}", e)))?;
        Ok(Self { tree, bus })
    }

    /// Replace a branch's roster with a fresh listing
    pub async fn replace_branch(&self, branch: &BranchId, entries: Vec<RosterEntry>) -> Result<()> {
        branch.validate()?;
        for entry in &entries {
            entry.user_id.validate()?;
        }

        let mut batch = sled::Batch::default();
        for existing in self.tree.scan_prefix(format!("{}|", branch).as_bytes()) {
            let (key, _) = existing.map_err(|e| ChatError::Storage(format!("scan roster: {}", e)))?;
            batch.remove(key);
        }
        for entry in &entries {
            let val = serde_json::to_vec(entry).map_err(ChatError::Serialization)?;
            batch.insert(entry_key(branch, &entry.user_id).as_bytes(), val);
        }
        self.tree
            .apply_batch(batch)
            .map_err(|e| ChatError::Storage(format!("replace roster: {}", e)))?;

        info!("Roster for {} refreshed: {} members", branch, entries.len());
        self.notify(branch).await;
        Ok(())
    }

    pub async fn upsert(&self, branch: &BranchId, entry: RosterEntry) -> Result<()> {
        branch.validate()?;
        entry.user_id.validate()?;
        let val = serde_json::to_vec(&entry).map_err(ChatError::Serialization)?;
        self.tree
            .insert(entry_key(branch, &entry.user_id).as_bytes(), val)
            .map_err(|e| ChatError::Storage(format!("upsert roster: {}", e)))?;
        debug!("Roster {} now includes {}", branch, entry.user_id);
        self.notify(branch).await;
        Ok(())
    }

    pub async fn remove(&self, branch: &BranchId, user: &UserId) -> Result<bool> {
        branch.validate()?;
        let removed = self
            .tree
            .remove(entry_key(branch, user).as_bytes())
            .map_err(|e| ChatError::Storage(format!("remove roster: {}", e)))?;
        if removed.is_some() {
            debug!("{} removed from roster {}", user, branch);
            self.notify(branch).await;
        }
        Ok(removed.is_some())
    }

    pub fn members(&self, branch: &BranchId) -> Result<Vec<RosterEntry>> {
        branch.validate()?;
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(format!("{}|", branch).as_bytes()) {
            let (_, val) = entry.map_err(|e| ChatError::Storage(format!("scan roster: {}", e)))?;
            out.push(serde_json::from_slice::<RosterEntry>(&val).map_err(ChatError::Serialization)?);
        }
        Ok(out)
    }

    pub fn get(&self, branch: &BranchId, user: &UserId) -> Result<Option<RosterEntry>> {
        branch.validate()?;
        match self
            .tree
            .get(entry_key(branch, user).as_bytes())
            .map_err(|e| ChatError::Storage(format!("get roster entry: {}", e)))?
        {
            Some(val) => Ok(Some(
                serde_json::from_slice(&val).map_err(ChatError::Serialization)?,
            )),
            None => Ok(None),
        }
    }

    async fn notify(&self, branch: &BranchId) {
        self.bus
            .publish(
                Topic::Roster(branch.clone()),
                ChatEvent::RosterChanged { branch_id: branch.clone() },
            )
            .await;
    }
}
