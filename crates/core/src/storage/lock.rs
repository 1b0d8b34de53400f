use crate::error::StateStoreError;
use crate::types::RunId;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Single-writer guard for a run, released on drop
///
/// File locks are `flock(2)` locks on `<run_id>.lock`, so the kernel drops
/// them when the holder exits however it exits. The file itself is never
/// removed; it only carries the holder's PID for the `Locked` diagnostic.
pub struct RunLock {
    run_id: RunId,
    inner: LockInner,
}

enum LockInner {
    File { path: PathBuf, file: Flock<File> },
    Memory { held: Arc<Mutex<HashSet<RunId>>> },
}

impl fmt::Debug for RunLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RunLock");
        s.field("run_id", &self.run_id);
        if let LockInner::File { path, .. } = &self.inner {
            s.field("path", path);
        }
        s.finish()
    }
}

impl RunLock {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub(crate) fn acquire_file(run_id: &RunId, path: PathBuf) -> Result<Self, StateStoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StateStoreError::io(&path, e))?;

        let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(StateStoreError::Locked {
                    run_id: run_id.clone(),
                    pid: read_holder(&path)?.unwrap_or_default(),
                });
            }
            Err((_, errno)) => {
                return Err(StateStoreError::io(&path, std::io::Error::from(errno)));
            }
        };

        // Whatever a previous holder left is stale once we own the lock
        if let Some(previous) = read_holder(&path)? {
            tracing::debug!("Lock {} previously held by pid {}", path.display(), previous);
        }
        let pid = std::process::id();
        file.set_len(0)
            .and_then(|_| file.write_all(pid.to_string().as_bytes()))
            .and_then(|_| file.sync_all())
            .map_err(|e| StateStoreError::io(&path, e))?;
        tracing::debug!("Acquired lock {} (pid {})", path.display(), pid);

        Ok(Self {
            run_id: run_id.clone(),
            inner: LockInner::File { path, file },
        })
    }

    pub(crate) fn acquire_memory(
        run_id: &RunId,
        held: Arc<Mutex<HashSet<RunId>>>,
    ) -> Result<Self, StateStoreError> {
        let inserted = held
            .lock()
            .map(|mut set| set.insert(run_id.clone()))
            .unwrap_or(false);
        if !inserted {
            return Err(StateStoreError::Locked {
                run_id: run_id.clone(),
                pid: std::process::id() as i32,
            });
        }
        Ok(Self {
            run_id: run_id.clone(),
            inner: LockInner::Memory { held },
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match &self.inner {
            LockInner::File { path, file } => {
                // Clear the PID while still holding the lock; flock is released with the fd
                if let Err(e) = file.set_len(0) {
                    tracing::warn!("Failed to clear lock {}: {}", path.display(), e);
                }
            }
            LockInner::Memory { held } => {
                if let Ok(mut set) = held.lock() {
                    set.remove(&self.run_id);
                }
            }
        }
    }
}

fn read_holder(path: &Path) -> Result<Option<i32>, StateStoreError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse::<i32>().ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StateStoreError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.lock");
        let run_id = RunId::new("cp");

        let lock = RunLock::acquire_file(&run_id, path.clone()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );

        let second = RunLock::acquire_file(&run_id, path.clone());
        match second {
            Err(StateStoreError::Locked { pid, .. }) => {
                assert_eq!(pid, std::process::id() as i32)
            }
            other => panic!("expected lock contention, got {:?}", other),
        }

        drop(lock);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        assert!(RunLock::acquire_file(&run_id, path).is_ok());
    }

    #[test]
    fn pid_left_by_dead_process_does_not_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.lock");
        std::fs::write(&path, "2147483646").unwrap();

        let lock = RunLock::acquire_file(&RunId::new("cp"), path.clone()).unwrap();
        let holder = std::fs::read_to_string(&path).unwrap();
        assert_eq!(holder, std::process::id().to_string());
        drop(lock);
    }

    #[test]
    fn pid_of_live_unrelated_process_does_not_block() {
        // A recycled PID in the file is not a holder; only the flock counts
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.lock");
        std::fs::write(&path, "1").unwrap();

        assert!(RunLock::acquire_file(&RunId::new("cp"), path).is_ok());
    }

    #[test]
    fn garbage_lock_file_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.lock");
        std::fs::write(&path, "not a pid").unwrap();

        assert!(RunLock::acquire_file(&RunId::new("cp"), path).is_ok());
    }

    #[test]
    fn contenders_for_stale_lock_get_exactly_one_holder() {
        const CONTENDERS: usize = 8;

        for _ in 0..100 {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("cp.lock");
            std::fs::write(&path, "2147483646").unwrap();

            let start = Arc::new(Barrier::new(CONTENDERS));
            let attempted = Arc::new(Barrier::new(CONTENDERS));
            let handles: Vec<_> = (0..CONTENDERS)
                .map(|_| {
                    let path = path.clone();
                    let start = start.clone();
                    let attempted = attempted.clone();
                    std::thread::spawn(move || {
                        start.wait();
                        let lock = RunLock::acquire_file(&RunId::new("cp"), path);
                        // Hold until every contender has tried
                        attempted.wait();
                        lock.is_ok()
                    })
                })
                .collect();

            let holders = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|held| *held)
                .count();
            assert_eq!(holders, 1);
        }
    }

    #[test]
    fn memory_lock_is_exclusive() {
        let held = Arc::new(Mutex::new(HashSet::new()));
        let run_id = RunId::new("w1");

        let lock = RunLock::acquire_memory(&run_id, held.clone()).unwrap();
        assert!(RunLock::acquire_memory(&run_id, held.clone()).is_err());
        drop(lock);
        assert!(RunLock::acquire_memory(&run_id, held).is_ok());
    }
}
