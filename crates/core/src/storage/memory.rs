use super::{RunLock, StateStore};
use crate::error::StateStoreError;
use crate::types::{RunId, RunState};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// In-process state store, used by tests and dry runs
#[derive(Default)]
pub struct MemoryStateStore {
    runs: RwLock<HashMap<RunId, RunState>>,
    locks: Arc<Mutex<HashSet<RunId>>>,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a run as if an earlier invocation had saved it
    pub async fn insert(&self, state: RunState) {
        self.runs.write().await.insert(state.run_id.clone(), state);
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, run_id: &RunId) -> Result<Option<RunState>, StateStoreError> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn save(&self, run_id: &RunId, state: &mut RunState) -> Result<(), StateStoreError> {
        let mut runs = self.runs.write().await;
        let found = runs.get(run_id).map_or(0, |s| s.version);
        if found != state.version {
            return Err(StateStoreError::Conflict {
                run_id: run_id.clone(),
                expected: state.version,
                found,
            });
        }

        state.version += 1;
        state.updated_at = Utc::now();
        runs.insert(run_id.clone(), state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, run_id: &RunId) -> Result<bool, StateStoreError> {
        Ok(self.runs.write().await.remove(run_id).is_some())
    }

    async fn list(&self) -> Result<Vec<RunId>, StateStoreError> {
        let mut runs: Vec<RunId> = self.runs.read().await.keys().cloned().collect();
        runs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(runs)
    }

    fn lock(&self, run_id: &RunId) -> Result<RunLock, StateStoreError> {
        RunLock::acquire_memory(run_id, self.locks.clone())
    }
}
