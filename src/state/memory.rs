//! In-memory snapshot storage backend.
//!
//! Snapshots are kept as serialized JSON so that a load always goes through
//! the same parse and validation path as the file backend.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Result, StateError};

use super::lock::{generate_holder_id, LockInfo};
use super::store::SnapshotStore;
use super::types::Snapshot;

/// Snapshot store that lives for the duration of the process.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    /// Serialized snapshot, if one was saved.
    snapshot: Mutex<Option<String>>,
    /// Current lock, if any.
    lock: Mutex<Option<LockInfo>>,
}

impl MemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        let guard = self.snapshot.lock().await;
        let Some(content) = guard.as_deref() else {
            return Ok(None);
        };
        let snapshot: Snapshot = serde_json::from_str(content)
            .map_err(|e| StateError::corrupt(format!("Failed to parse snapshot: {e}")))?;
        snapshot.validate()?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let content = serde_json::to_string(snapshot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize snapshot: {e}")))?;
        *self.snapshot.lock().await = Some(content);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.snapshot.lock().await = None;
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.snapshot.lock().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().await;
        if let Some(existing) = guard.as_ref()
            && !existing.is_expired()
        {
            return Err(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }
            .into());
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id, operation);
        *guard = Some(lock_info.clone());
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut guard = self.lock.lock().await;
        if guard.as_ref().is_some_and(|lock| lock.lock_id == lock_id) {
            *guard = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
