//! Atomic snapshot persistence.
//!
//! `mark_dirty` deletes `etc/snapshot.json` before any mutation so a
//! crash mid-mutation can never resurrect a half-formed container;
//! `mark_clean` writes the new snapshot to a temp file under the
//! container's `tmp/` directory, fsyncs it, then renames it into
//! place. The rename is what makes the write atomic with respect to a
//! crash: readers only ever see a complete old file or a complete new
//! one. Sensitive/transient fields (stdin readers, stdio buffers)
//! never make it into this struct.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::ActorError;
use crate::pool::network::Subnet;
use crate::pool::port::Port;
use crate::pool::user::Uid;
#[cfg(test)]
use crate::pool::network::NetworkPool;

use super::state::ContainerState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub handle: String,
    pub state: ContainerState,
    pub network: Option<Subnet>,
    pub uid: Option<Uid>,
    pub ports: Vec<Port>,
    pub idle_timeout_secs: u64,
    pub next_job_id: u32,
    pub job_ids: Vec<u32>,
    #[serde(default)]
    pub memory_limit_in_bytes: Option<u64>,
    #[serde(default)]
    pub disk_limit_in_bytes: Option<u64>,
    #[serde(default)]
    pub bandwidth: Option<(u64, u64)>,
}

impl Snapshot {
    pub fn file_path(container_dir: &Path) -> std::path::PathBuf {
        container_dir.join("etc").join("snapshot.json")
    }

    pub async fn load(container_dir: &Path) -> Result<Option<Self>, ActorError> {
        let path = Self::file_path(container_dir);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)
                    .map_err(|e| ActorError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ActorError::Io(e)),
        }
    }

    /// Delete the snapshot file, if any. Idempotent: a missing file is
    /// not an error.
    pub async fn mark_dirty(container_dir: &Path) -> Result<(), ActorError> {
        let path = Self::file_path(container_dir);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ActorError::Io(e)),
        }
    }

    /// Write this snapshot to a temp file under `tmp/`, fsync it, then
    /// rename it over `etc/snapshot.json`.
    pub async fn mark_clean(&self, container_dir: &Path) -> Result<(), ActorError> {
        let etc_dir = container_dir.join("etc");
        let tmp_dir = container_dir.join("tmp");
        tokio::fs::create_dir_all(&etc_dir).await?;
        tokio::fs::create_dir_all(&tmp_dir).await?;

        let tmp_path = tmp_dir.join("snapshot.json.tmp");
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| ActorError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, Self::file_path(container_dir)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Snapshot {
        let pool = NetworkPool::new("10.0.0.0".parse().unwrap(), 1);
        Snapshot {
            id: "1".to_string(),
            handle: "abcdefghijk".to_string(),
            state: ContainerState::Active,
            network: Some(pool.acquire().unwrap()),
            uid: Some(Uid(10000)),
            ports: vec![],
            idle_timeout_secs: 300,
            next_job_id: 0,
            job_ids: vec![],
            memory_limit_in_bytes: None,
            disk_limit_in_bytes: None,
            bandwidth: None,
        }
    }

    #[tokio::test]
    async fn mark_clean_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let snap = sample();
        snap.mark_clean(dir.path()).await.unwrap();
        let loaded = Snapshot::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.handle, snap.handle);
        assert_eq!(loaded.state, ContainerState::Active);
    }

    #[tokio::test]
    async fn mark_dirty_removes_the_file() {
        let dir = tempdir().unwrap();
        let snap = sample();
        snap.mark_clean(dir.path()).await.unwrap();
        Snapshot::mark_dirty(dir.path()).await.unwrap();
        assert!(Snapshot::load(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_dirty_on_absent_snapshot_is_not_an_error() {
        let dir = tempdir().unwrap();
        Snapshot::mark_dirty(dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn load_on_absent_directory_is_none() {
        let dir = tempdir().unwrap();
        assert!(Snapshot::load(dir.path()).await.unwrap().is_none());
    }
}
