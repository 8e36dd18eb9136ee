//! Master Interface
//!
//! The replication RPC surface a slave sees. [`MasterClient`] implements it
//! over a transport; [`MasterImpl`] implements it against the master's own
//! store.
//!
//! [`MasterClient`]: super::client::MasterClient
//! [`MasterImpl`]: super::master_impl::MasterImpl

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use super::cursor::ReplicationCursor;
use super::types::{EntityKind, IdAllocation, IdType, LockMode, LockResult, Response};
use crate::error::{Error, Result};

/// Replication RPC
#[async_trait]
pub trait Master: Send + Sync {
    /// Grant a block of ids
    async fn allocate_ids(&self, id_type: IdType) -> Result<Response<IdAllocation>>;

    /// Id of a relationship type, creating it if needed
    async fn create_relationship_type(&self, cursor: &ReplicationCursor, name: &str) -> Result<Response<i32>>;

    /// Lock entities for the cursor's transaction
    async fn acquire_lock(
        &self,
        cursor: &ReplicationCursor,
        kind: EntityKind,
        mode: LockMode,
        ids: &[i64],
    ) -> Result<Response<LockResult>>;

    /// Commit a transaction; the master assigns its id
    async fn commit_single_resource_transaction(
        &self,
        cursor: &ReplicationCursor,
        resource: &str,
        data: Vec<u8>,
    ) -> Result<Response<i64>>;

    /// End the cursor's transaction and release its locks
    async fn finish_transaction(&self, cursor: &ReplicationCursor) -> Result<Response<()>>;

    /// Fetch missing transactions
    async fn pull_updates(&self, cursor: &ReplicationCursor) -> Result<Response<()>>;

    /// Master that committed `tx_id` in the default resource
    async fn get_master_id_for_committed_tx(&self, tx_id: i64) -> Result<Response<i32>>;

    /// Stream every store file into `writer`
    async fn copy_store(&self, cursor: &ReplicationCursor, writer: &mut dyn StoreWriter) -> Result<Response<()>>;

    /// Release connections or serving resources
    async fn shutdown(&self);

    async fn acquire_node_write_lock(&self, cursor: &ReplicationCursor, ids: &[i64]) -> Result<Response<LockResult>> {
        self.acquire_lock(cursor, EntityKind::Node, LockMode::Write, ids).await
    }

    async fn acquire_node_read_lock(&self, cursor: &ReplicationCursor, ids: &[i64]) -> Result<Response<LockResult>> {
        self.acquire_lock(cursor, EntityKind::Node, LockMode::Read, ids).await
    }

    async fn acquire_relationship_write_lock(
        &self,
        cursor: &ReplicationCursor,
        ids: &[i64],
    ) -> Result<Response<LockResult>> {
        self.acquire_lock(cursor, EntityKind::Relationship, LockMode::Write, ids).await
    }

    async fn acquire_relationship_read_lock(
        &self,
        cursor: &ReplicationCursor,
        ids: &[i64],
    ) -> Result<Response<LockResult>> {
        self.acquire_lock(cursor, EntityKind::Relationship, LockMode::Read, ids).await
    }
}

/// Receiver of a store copy
#[async_trait]
pub trait StoreWriter: Send {
    /// Store one file, `path` relative to the store directory
    async fn write(&mut self, path: &str, data: &[u8]) -> Result<()>;

    /// No more files follow
    async fn done(&mut self) -> Result<()>;
}

/// Writes copied files into a directory
pub struct DirStoreWriter {
    dir: PathBuf,
    files: usize,
    bytes: u64,
}

impl DirStoreWriter {
    /// Create a writer; the directory is created if missing
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: 0,
            bytes: 0,
        }
    }

    /// Files written so far
    pub fn files(&self) -> usize {
        self.files
    }

    /// Bytes written so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn target(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let plain = relative.components().all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !plain {
            return Err(Error::Protocol(format!("Refusing to write copied file {:?}", path)));
        }
        Ok(self.dir.join(relative))
    }
}

#[async_trait]
impl StoreWriter for DirStoreWriter {
    async fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let target = self.target(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, data).await?;
        self.files += 1;
        self.bytes += data.len() as u64;
        tracing::trace!("Copied {} ({} bytes)", path, data.len());
        Ok(())
    }

    async fn done(&mut self) -> Result<()> {
        tracing::debug!(
            "Store copy into {} finished: {} files, {} bytes",
            self.dir.display(),
            self.files,
            self.bytes
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dir_writer_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DirStoreWriter::new(dir.path());
        writer.write("graph.log.0", b"abc").await.unwrap();
        writer.write("nested/file", b"de").await.unwrap();
        writer.done().await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("graph.log.0")).unwrap(), b"abc");
        assert!(dir.path().join("nested/file").exists());
        assert_eq!(writer.files(), 2);
        assert_eq!(writer.bytes(), 5);
    }

    #[tokio::test]
    async fn test_dir_writer_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DirStoreWriter::new(dir.path());
        assert!(writer.write("../outside", b"x").await.is_err());
        assert!(writer.write("/etc/passwd", b"x").await.is_err());
        assert!(writer.write("", b"x").await.is_err());
    }
}
