use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;
use crate::protocol::{PolicyRecord, PolicySettings, SuspendRecord};

/// The host's policy and suspend storage.
///
/// Calls are made synchronously from the sync worker, one at a time. Records
/// are passed by value; the store owns them once the call returns.
pub trait QueueStore: Send + Sync {
    fn add_policy(&self, policy: PolicyRecord) -> Result<(), StoreError>;
    fn update_policy(&self, id: &str, settings: PolicySettings) -> Result<(), StoreError>;
    fn delete_policy(&self, id: &str) -> Result<(), StoreError>;
    fn add_suspend(&self, suspend: SuspendRecord) -> Result<(), StoreError>;
    fn delete_suspend(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    AddPolicy,
    UpdatePolicy,
    DeletePolicy,
    AddSuspend,
    DeleteSuspend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub op: StoreOp,
    pub id: String,
}

#[derive(Default)]
struct MemoryState {
    policies: BTreeMap<String, PolicyRecord>,
    suspends: BTreeMap<String, SuspendRecord>,
    journal: Vec<StoreCall>,
    failures: HashSet<(StoreOp, String)>,
}

/// In-process store that keeps every record in memory and journals each call.
///
/// Used by the dry-run binary and by tests; `fail` makes a given call on a
/// given id report an error.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail(&self, op: StoreOp, id: &str) {
        self.state().failures.insert((op, id.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn journal(&self) -> Vec<StoreCall> {
        self.state().journal.clone()
    }

    pub fn count(&self, op: StoreOp, id: &str) -> usize {
        self.state()
            .journal
            .iter()
            .filter(|call| call.op == op && call.id == id)
            .count()
    }

    pub fn policy(&self, id: &str) -> Option<PolicyRecord> {
        self.state().policies.get(id).cloned()
    }

    pub fn policy_ids(&self) -> Vec<String> {
        self.state().policies.keys().cloned().collect()
    }

    pub fn suspend_ids(&self) -> Vec<String> {
        self.state().suspends.keys().cloned().collect()
    }

    fn record(&self, op: StoreOp, id: &str) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let mut state = self.state();
        state.journal.push(StoreCall {
            op,
            id: id.to_string(),
        });
        if state.failures.contains(&(op, id.to_string())) {
            return Err(StoreError::new(format!("injected {op:?} failure for {id}")));
        }
        Ok(state)
    }
}

impl QueueStore for MemoryStore {
    fn add_policy(&self, policy: PolicyRecord) -> Result<(), StoreError> {
        let mut state = self.record(StoreOp::AddPolicy, &policy.id)?;
        if state.policies.contains_key(&policy.id) {
            return Err(StoreError::new(format!("policy {} already exists", policy.id)));
        }
        log::info!("Added policy {} ({:?})", policy.id, policy.kind);
        state.policies.insert(policy.id.clone(), policy);
        Ok(())
    }

    fn update_policy(&self, id: &str, settings: PolicySettings) -> Result<(), StoreError> {
        let mut state = self.record(StoreOp::UpdatePolicy, id)?;
        match state.policies.get_mut(id) {
            Some(policy) => {
                policy.settings = settings;
                log::info!("Updated policy {id}");
                Ok(())
            }
            None => Err(StoreError::new(format!("no such policy {id}"))),
        }
    }

    fn delete_policy(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.record(StoreOp::DeletePolicy, id)?;
        match state.policies.remove(id) {
            Some(_) => {
                log::info!("Deleted policy {id}");
                Ok(())
            }
            None => Err(StoreError::new(format!("no such policy {id}"))),
        }
    }

    fn add_suspend(&self, suspend: SuspendRecord) -> Result<(), StoreError> {
        let mut state = self.record(StoreOp::AddSuspend, &suspend.id)?;
        if state.suspends.contains_key(&suspend.id) {
            return Err(StoreError::new(format!(
                "suspend {} already exists",
                suspend.id
            )));
        }
        log::info!("Added suspend {}", suspend.id);
        state.suspends.insert(suspend.id.clone(), suspend);
        Ok(())
    }

    fn delete_suspend(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.record(StoreOp::DeleteSuspend, id)?;
        match state.suspends.remove(id) {
            Some(_) => {
                log::info!("Deleted suspend {id}");
                Ok(())
            }
            None => Err(StoreError::new(format!("no such suspend {id}"))),
        }
    }
}
