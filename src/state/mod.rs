//! Snapshot management for the Keelson engine.
//!
//! This module provides the snapshot types recording applied resources, the
//! storage backends persisting them, and the state lock guarding runs.

mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use local::{LocalSnapshotStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use memory::MemorySnapshotStore;
pub use store::SnapshotStore;
pub use types::{
    DeposedObject, HistoryEntry, RunOperation, Snapshot, SnapshotEntry, MAX_HISTORY, SNAPSHOT_VERSION,
};
