use super::{RunLock, StateStore};
use crate::error::StateStoreError;
use crate::types::{RunId, RunState};
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// One pretty-printed JSON file per run under `base_path`
///
/// Layout:
///   <base>/<run_id>.json    committed state
///   <base>/<run_id>.lock    flock(2) target, holds the PID of the running process
///   <base>/.<run_id>.json.tmp-<pid>   in-flight save, renamed over the state file
#[derive(Debug, Clone)]
pub struct FileStateStore {
    base_path: PathBuf,
}

impl FileStateStore {
    pub fn new(base_path: PathBuf) -> Result<Self, StateStoreError> {
        std::fs::create_dir_all(&base_path).map_err(|e| StateStoreError::io(&base_path, e))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn state_path(&self, run_id: &RunId) -> PathBuf {
        self.base_path.join(format!("{}.json", run_id))
    }

    fn lock_path(&self, run_id: &RunId) -> PathBuf {
        self.base_path.join(format!("{}.lock", run_id))
    }

    fn temp_path(&self, run_id: &RunId) -> PathBuf {
        self.base_path
            .join(format!(".{}.json.tmp-{}", run_id, std::process::id()))
    }

    async fn read_state(&self, run_id: &RunId) -> Result<Option<RunState>, StateStoreError> {
        let path = self.state_path(run_id);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateStoreError::io(&path, e)),
        };

        let state: RunState =
            serde_json::from_slice(&content).map_err(|e| StateStoreError::Corrupt {
                run_id: run_id.clone(),
                reason: e.to_string(),
            })?;

        if &state.run_id != run_id {
            return Err(StateStoreError::Corrupt {
                run_id: run_id.clone(),
                reason: format!("file records run '{}'", state.run_id),
            });
        }

        Ok(Some(state))
    }

    async fn write_atomic(&self, run_id: &RunId, bytes: &[u8]) -> Result<(), StateStoreError> {
        let temp = self.temp_path(run_id);
        let target = self.state_path(run_id);

        let result = async {
            let mut file = tokio::fs::File::create(&temp)
                .await
                .map_err(|e| StateStoreError::io(&temp, e))?;
            file.write_all(bytes)
                .await
                .map_err(|e| StateStoreError::io(&temp, e))?;
            file.sync_all()
                .await
                .map_err(|e| StateStoreError::io(&temp, e))?;
            drop(file);

            tokio::fs::rename(&temp, &target)
                .await
                .map_err(|e| StateStoreError::io(&target, e))?;

            // Make the rename itself durable
            let dir = tokio::fs::File::open(&self.base_path)
                .await
                .map_err(|e| StateStoreError::io(&self.base_path, e))?;
            dir.sync_all()
                .await
                .map_err(|e| StateStoreError::io(&self.base_path, e))
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp).await;
        }
        result
    }
}

#[async_trait::async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, run_id: &RunId) -> Result<Option<RunState>, StateStoreError> {
        self.read_state(run_id).await
    }

    async fn save(&self, run_id: &RunId, state: &mut RunState) -> Result<(), StateStoreError> {
        let found = match self.read_state(run_id).await? {
            Some(stored) => stored.version,
            None => 0,
        };
        if found != state.version {
            return Err(StateStoreError::Conflict {
                run_id: run_id.clone(),
                expected: state.version,
                found,
            });
        }

        let mut next = state.clone();
        next.version = state.version + 1;
        next.updated_at = Utc::now();

        let bytes = serde_json::to_vec_pretty(&next)
            .map_err(|e| StateStoreError::Serialize(e.to_string()))?;
        self.write_atomic(run_id, &bytes).await?;

        *state = next;
        Ok(())
    }

    async fn delete(&self, run_id: &RunId) -> Result<bool, StateStoreError> {
        let path = self.state_path(run_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateStoreError::io(&path, e)),
        }
    }

    async fn list(&self) -> Result<Vec<RunId>, StateStoreError> {
        let mut entries = tokio::fs::read_dir(&self.base_path)
            .await
            .map_err(|e| StateStoreError::io(&self.base_path, e))?;

        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateStoreError::io(&self.base_path, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(run) = name.strip_suffix(".json") {
                runs.push(RunId::new(run));
            }
        }

        runs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(runs)
    }

    fn lock(&self, run_id: &RunId) -> Result<RunLock, StateStoreError> {
        RunLock::acquire_file(run_id, self.lock_path(run_id))
    }
}
