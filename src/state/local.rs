//! Local file-based snapshot storage backend.
//!
//! The snapshot lives in `state.json` and the lock in `state.lock`, both under
//! a state directory (`.keelson` by default).

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::SnapshotStore;
use super::types::Snapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".keelson";

/// Snapshot file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based snapshot store.
#[derive(Debug)]
pub struct LocalSnapshotStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the snapshot file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalSnapshotStore {
    /// Creates a snapshot store rooted at `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            state_path: base_dir.join(STATE_FILE),
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
        }
    }

    /// Returns the snapshot file path.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::storage(format!("cannot create {}: {e}", self.base_dir.display())))?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::lock_failed(format!("cannot read lock file: {e}")).into()),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StateError::corrupt(format!("lock file is not valid JSON: {e}")).into())
    }

    /// Creates the lock file, failing if another run created it first.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;
        let content = serde_json::to_vec_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("cannot encode lock: {e}")))?;

        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await;
        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(match self.read_lock_file().await? {
                    Some(holder) => locked_by(&holder),
                    None => StateError::lock_failed("lock file vanished while acquiring"),
                }
                .into());
            }
            Err(e) => return Err(StateError::lock_failed(format!("cannot create lock file: {e}")).into()),
        };

        file.write_all(&content)
            .await
            .map_err(|e| StateError::lock_failed(format!("cannot write lock file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::lock_failed(format!("cannot sync lock file: {e}")))?;
        Ok(())
    }

    async fn remove_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(StateError::lock_failed(format!("cannot remove lock file: {e}")).into())
            }
            _ => Ok(()),
        }
    }
}

fn locked_by(lock: &LockInfo) -> StateError {
    StateError::LockedByOther {
        holder: lock.holder.clone(),
        since: lock.acquired_at.to_rfc3339(),
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No snapshot at {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => return Err(StateError::storage(format!("cannot read snapshot: {e}")).into()),
        };
        debug!("Loading snapshot from: {}", self.state_path.display());

        let snapshot: Snapshot = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupt(format!("snapshot is not valid JSON: {e}")))?;
        snapshot.validate()?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.ensure_dir().await?;
        let content = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| StateError::serialization(format!("cannot encode snapshot: {e}")))?;

        // Readers only ever see a complete file
        let temp_path = self.state_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::storage(format!("cannot create {}: {e}", temp_path.display())))?;
        file.write_all(&content)
            .await
            .map_err(|e| StateError::storage(format!("cannot write snapshot: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("cannot sync snapshot: {e}")))?;
        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::storage(format!("cannot move snapshot into place: {e}")))?;

        info!(
            "Saved snapshot serial {} ({} live resources)",
            snapshot.serial,
            snapshot.live_count()
        );
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.state_path).await {
            Ok(()) => info!("Deleted snapshot {}", self.state_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::storage(format!("cannot delete snapshot: {e}")).into()),
        }
        self.remove_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.state_path).await.unwrap_or(false))
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(locked_by(&existing).into());
            }
            warn!("Taking over expired lock held by {}", existing.holder);
            self.remove_lock_file().await?;
        }

        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder, operation);
        self.create_lock_file(&lock_info).await?;

        debug!(
            "Acquired lock {} for {operation}, expires in {LOCK_EXPIRY_SECS}s",
            lock_info.lock_id
        );
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.remove_lock_file().await?;
                debug!("Released lock {lock_id}");
            }
            Some(existing) => warn!("Not releasing lock {lock_id}: file holds {}", existing.lock_id),
            None => {}
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            warn!("Force-releasing lock held by {}", existing.holder);
        }
        self.remove_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeelsonError;
    use crate::graph::{Outputs, PropertyMap, ResourceId, Value};
    use crate::state::SnapshotEntry;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalSnapshotStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalSnapshotStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn sample_snapshot() -> Snapshot {
        let mut snapshot = Snapshot::new("test-project", "dev");
        let mut properties = PropertyMap::new();
        properties.insert("cidr_block".to_string(), Value::from("10.0.0.0/16"));
        let mut outputs = Outputs::new();
        outputs.insert("id".to_string(), Value::from("vpc-0001"));
        snapshot.set_entry(SnapshotEntry::new(
            ResourceId::new("vpc", "main"),
            properties,
            outputs,
            BTreeSet::new(),
        ));
        snapshot.serial = 3;
        snapshot
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let snapshot = sample_snapshot();
        store.save(&snapshot).await.expect("Failed to save snapshot");

        let loaded = store
            .load()
            .await
            .expect("Failed to load snapshot")
            .expect("Snapshot should exist");

        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.project, "test-project");
        assert_eq!(loaded.serial, 3);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_exists() {
        let (store, _temp) = create_test_store();

        assert!(!store.exists().await.expect("exists check failed"));

        store.save(&sample_snapshot()).await.expect("Failed to save snapshot");

        assert!(store.exists().await.expect("exists check failed"));

        store.delete().await.expect("Failed to delete snapshot");
        assert!(!store.exists().await.expect("exists check failed"));
        assert!(store.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_rejected() {
        let (store, _temp) = create_test_store();
        store.save(&sample_snapshot()).await.expect("Failed to save snapshot");

        fs::write(store.state_path(), b"{ not json")
            .await
            .expect("Failed to overwrite snapshot");

        let result = store.load().await;
        assert!(matches!(
            result,
            Err(KeelsonError::State(StateError::Corrupt { .. }))
        ));
    }

    #[tokio::test]
    async fn test_tampered_snapshot_rejected() {
        let (store, _temp) = create_test_store();
        store.save(&sample_snapshot()).await.expect("Failed to save snapshot");

        let content = fs::read_to_string(store.state_path()).await.expect("read");
        let tampered = content.replace("10.0.0.0/16", "10.6.0.0/16");
        fs::write(store.state_path(), tampered).await.expect("write");

        assert!(matches!(
            store.load().await,
            Err(KeelsonError::State(StateError::Corrupt { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2", "destroy").await;
        assert!(matches!(
            result,
            Err(KeelsonError::State(StateError::LockedByOther { ref holder, .. })) if holder == "holder-1"
        ));

        store.force_unlock().await.expect("force unlock");
        assert!(store.acquire_lock("holder-2", "destroy").await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, temp) = create_test_store();
        let mut stale = LockInfo::new("crashed-run", "apply");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        fs::write(
            temp.path().join(LOCK_FILE),
            serde_json::to_vec(&stale).expect("encode lock"),
        )
        .await
        .expect("write stale lock");

        let lock = store
            .acquire_lock("holder-2", "apply")
            .await
            .expect("expired lock should be replaced");

        let current = store.get_lock_info().await.expect("lock info").expect("lock held");
        assert_eq!(current.holder, "holder-2");
        assert_eq!(current.lock_id, lock.lock_id);
        assert_ne!(current.lock_id, stale.lock_id);
    }

    #[tokio::test]
    async fn test_floats_survive_save_and_load() {
        let (store, _temp) = create_test_store();
        let mut snapshot = sample_snapshot();

        let mut properties = PropertyMap::new();
        properties.insert("drift".to_string(), Value::Float(-1.1193133179981887e-17));
        properties.insert("weights".to_string(), Value::List(vec![Value::Float(0.1), Value::Float(1e300)]));
        let mut outputs = Outputs::new();
        outputs.insert("id".to_string(), Value::from("lb-0001"));
        outputs.insert("utilisation".to_string(), Value::Float(0.30000000000000004));
        snapshot.set_entry(SnapshotEntry::new(
            ResourceId::new("balancer", "edge"),
            properties,
            outputs,
            BTreeSet::new(),
        ));

        store.save(&snapshot).await.expect("Failed to save snapshot");
        let loaded = store
            .load()
            .await
            .expect("floats must not trip the digest check")
            .expect("Snapshot should exist");

        assert_eq!(loaded, snapshot);
    }
}
