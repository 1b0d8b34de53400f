pub mod event_log;
pub mod file_store;
pub mod lock;
pub mod memory;

pub use event_log::JsonlEventLog;
pub use file_store::FileStateStore;
pub use lock::RunLock;
pub use memory::MemoryStateStore;

use crate::error::StateStoreError;
use crate::types::{RunId, RunState};

/// Durable record of run progress
///
/// Saves are atomic and versioned: `save` only succeeds when the stored
/// version equals `state.version`, and bumps it on success.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Prior state of a run, `None` on first run
    async fn load(&self, run_id: &RunId) -> Result<Option<RunState>, StateStoreError>;

    /// Atomically replace the stored state
    async fn save(&self, run_id: &RunId, state: &mut RunState) -> Result<(), StateStoreError>;

    /// Remove stored state; returns whether anything was removed
    async fn delete(&self, run_id: &RunId) -> Result<bool, StateStoreError>;

    /// All run ids with stored state, sorted
    async fn list(&self) -> Result<Vec<RunId>, StateStoreError>;

    /// Take the single-writer lock for a run; released when the guard drops
    fn lock(&self, run_id: &RunId) -> Result<RunLock, StateStoreError>;
}
