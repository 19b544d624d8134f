//! File-based storage backend: in-memory stores persisted as JSON snapshots

use crate::backend::mem::{MemoryConnectionStore, MemoryRouteStore};
use crate::{Connection, ConnectionStore, Route, RouteStore, StorageError};
use async_trait::async_trait;
use mesh_wire::{ConnectionId, NodeId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const CONNECTIONS_FILE: &str = "connections.json";
const ROUTES_FILE: &str = "routes.json";
const SNAPSHOT_VERSION: u32 = 1;

/// Configuration for file-backed stores
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Base data directory
    pub data_dir: PathBuf,
    /// Snapshot frequency (1 = every write, N = every N writes)
    pub snapshot_every: u32,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./meshdata"),
            snapshot_every: 1,
        }
    }
}

/// On-disk snapshot content
#[derive(Serialize, Deserialize, Debug)]
struct Snapshot<T> {
    version: u32,
    records: Vec<T>,
}

/// Write-through snapshot file shared by both stores
struct SnapshotFile {
    path: PathBuf,
    snapshot_every: u32,
    pending_writes: AtomicU32,
    write_lock: Mutex<()>,
}

impl SnapshotFile {
    fn new(config: &FileStoreConfig, name: &str) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            path: config.data_dir.join(name),
            snapshot_every: config.snapshot_every.max(1),
            pending_writes: AtomicU32::new(0),
            write_lock: Mutex::new(()),
        })
    }

    fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>, StorageError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let snapshot: Snapshot<T> = serde_json::from_str(&content).map_err(|e| {
            StorageError::Corruption(format!("{}: {}", self.path.display(), e))
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StorageError::Corruption(format!(
                "{}: unsupported snapshot version {}",
                self.path.display(),
                snapshot.version
            )));
        }

        info!(
            "Loaded {} records from {}",
            snapshot.records.len(),
            self.path.display()
        );
        Ok(snapshot.records)
    }

    /// Count a mutation and write when the batch is full
    fn record_write<T: Serialize>(
        &self,
        records: impl FnOnce() -> Vec<T>,
    ) -> Result<(), StorageError> {
        let pending = self.pending_writes.fetch_add(1, Ordering::AcqRel) + 1;
        if pending >= self.snapshot_every {
            self.write(records)?;
        }
        Ok(())
    }

    /// Write a snapshot of `records`, collected while holding the file lock
    /// so snapshots reach the disk in mutation order.
    fn write<T: Serialize>(&self, records: impl FnOnce() -> Vec<T>) -> Result<(), StorageError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StorageError::Invalid("snapshot lock poisoned".to_string()))?;

        // Mutations counted before this point are in the records below
        self.pending_writes.store(0, Ordering::Release);
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            records: records(),
        };
        let content = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(&self.path, &content)?;

        debug!(
            "Wrote snapshot {} ({} records)",
            self.path.display(),
            snapshot.records.len()
        );
        Ok(())
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Connection store persisted to `connections.json`
pub struct FileConnectionStore {
    inner: MemoryConnectionStore,
    file: SnapshotFile,
}

impl FileConnectionStore {
    /// Open the store, loading any existing snapshot
    pub async fn open(config: FileStoreConfig) -> Result<Self, StorageError> {
        let file = SnapshotFile::new(&config, CONNECTIONS_FILE)?;
        let records: Vec<Connection> = file.load()?;
        Ok(Self {
            inner: MemoryConnectionStore::from_records(records),
            file,
        })
    }

    fn persist(&self) -> Result<(), StorageError> {
        self.file.record_write(|| self.inner.records())
    }
}

#[async_trait]
impl ConnectionStore for FileConnectionStore {
    async fn put(&self, connection: Connection) -> Result<(), StorageError> {
        self.inner.put(connection).await?;
        self.persist()
    }

    async fn get(&self, id: &ConnectionId) -> Result<Option<Connection>, StorageError> {
        self.inner.get(id).await
    }

    async fn update(
        &self,
        id: &ConnectionId,
        mutate: &mut (dyn for<'c> FnMut(&'c mut Connection) + Send),
    ) -> Result<Option<Connection>, StorageError> {
        let updated = self.inner.update(id, mutate).await?;
        if updated.is_some() {
            self.persist()?;
        }
        Ok(updated)
    }

    async fn remove(&self, id: &ConnectionId) -> Result<Option<Connection>, StorageError> {
        let removed = self.inner.remove(id).await?;
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<Connection>, StorageError> {
        self.inner.list().await
    }

    async fn snapshot(&self) -> Result<(), StorageError> {
        self.file.write(|| self.inner.records())
    }
}

/// Route store persisted to `routes.json`
pub struct FileRouteStore {
    inner: MemoryRouteStore,
    file: SnapshotFile,
}

impl FileRouteStore {
    /// Open the store, loading any existing snapshot
    pub async fn open(config: FileStoreConfig) -> Result<Self, StorageError> {
        let file = SnapshotFile::new(&config, ROUTES_FILE)?;
        let records: Vec<Route> = match file.load() {
            Ok(records) => records,
            Err(StorageError::Corruption(reason)) => {
                // Routes are relearned through discovery
                warn!("Discarding unreadable route snapshot: {}", reason);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            inner: MemoryRouteStore::from_records(records),
            file,
        })
    }

    fn persist(&self) -> Result<(), StorageError> {
        self.file.record_write(|| self.inner.records())
    }
}

#[async_trait]
impl RouteStore for FileRouteStore {
    async fn upsert(&self, route: Route) -> Result<(), StorageError> {
        self.inner.upsert(route).await?;
        self.persist()
    }

    async fn get_for_destination(
        &self,
        destination: &NodeId,
        now: u64,
    ) -> Result<Vec<Route>, StorageError> {
        self.inner.get_for_destination(destination, now).await
    }

    async fn get_via_next_hop(
        &self,
        next_hop: &NodeId,
        now: u64,
    ) -> Result<Vec<Route>, StorageError> {
        self.inner.get_via_next_hop(next_hop, now).await
    }

    async fn list(&self, now: u64) -> Result<Vec<Route>, StorageError> {
        self.inner.list(now).await
    }

    async fn remove_destination(&self, destination: &NodeId) -> Result<usize, StorageError> {
        let removed = self.inner.remove_destination(destination).await?;
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    async fn remove_candidate(
        &self,
        destination: &NodeId,
        next_hop: &NodeId,
    ) -> Result<bool, StorageError> {
        let removed = self.inner.remove_candidate(destination, next_hop).await?;
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    async fn purge_expired(&self, now: u64) -> Result<usize, StorageError> {
        let purged = self.inner.purge_expired(now).await?;
        if purged > 0 {
            self.persist()?;
        }
        Ok(purged)
    }

    async fn snapshot(&self) -> Result<(), StorageError> {
        self.file.write(|| self.inner.records())
    }
}
