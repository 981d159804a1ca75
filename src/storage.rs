use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::payload::{EncryptedRawTransaction, EncryptedTransaction};
use crate::types::MessageHash;

/// A persisted value addressed by its message hash.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn hash(&self) -> &MessageHash;
}

impl Record for EncryptedTransaction {
    fn hash(&self) -> &MessageHash {
        &self.hash
    }
}

impl Record for EncryptedRawTransaction {
    fn hash(&self) -> &MessageHash {
        &self.hash
    }
}

/// Callback run once a save has been committed.
pub type OnCommit = Box<dyn FnOnce() + Send>;

#[async_trait::async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` if the hash is taken.
    async fn save(&self, record: R) -> Result<(), StorageError>;

    /// Save, then run `on_commit`. The callback never runs for a failed save
    /// and cannot undo a successful one.
    async fn save_with_callback(&self, record: R, on_commit: OnCommit) -> Result<(), StorageError> {
        self.save(record).await?;
        on_commit();
        Ok(())
    }

    async fn update(&self, record: R) -> Result<(), StorageError>;

    /// Removing an absent record succeeds.
    async fn delete(&self, hash: &MessageHash) -> Result<(), StorageError>;

    async fn retrieve_by_hash(&self, hash: &MessageHash) -> Result<Option<R>, StorageError>;

    /// Records for the hashes that exist; unknown hashes are skipped.
    async fn find_by_hashes(&self, hashes: &[MessageHash]) -> Result<Vec<R>, StorageError>;

    async fn upcheck(&self) -> bool;
}

pub struct InMemoryStore<R> {
    records: Arc<RwLock<HashMap<MessageHash, R>>>,
}

impl<R> InMemoryStore<R> {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<R> Default for InMemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<R: Record> RecordStore<R> for InMemoryStore<R> {
    async fn save(&self, record: R) -> Result<(), StorageError> {
        let mut records = self.records.write().await;
        if records.contains_key(record.hash()) {
            return Err(StorageError::AlreadyExists(record.hash().to_base64()));
        }
        records.insert(record.hash().clone(), record);
        Ok(())
    }

    async fn update(&self, record: R) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .insert(record.hash().clone(), record);
        Ok(())
    }

    async fn delete(&self, hash: &MessageHash) -> Result<(), StorageError> {
        self.records.write().await.remove(hash);
        Ok(())
    }

    async fn retrieve_by_hash(&self, hash: &MessageHash) -> Result<Option<R>, StorageError> {
        Ok(self.records.read().await.get(hash).cloned())
    }

    async fn find_by_hashes(&self, hashes: &[MessageHash]) -> Result<Vec<R>, StorageError> {
        let records = self.records.read().await;
        Ok(hashes
            .iter()
            .filter_map(|hash| records.get(hash).cloned())
            .collect())
    }

    async fn upcheck(&self) -> bool {
        true
    }
}

/// Open (or create) the node database.
pub fn open_database<P: AsRef<Path>>(path: P) -> Result<sled::Db, StorageError> {
    sled::open(path.as_ref()).map_err(|e| StorageError::DatabaseOpen {
        name: path.as_ref().display().to_string(),
        source: e,
    })
}

/// One sled tree per record type, values bincode-encoded.
pub struct SledStore<R> {
    tree: sled::Tree,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> SledStore<R> {
    pub fn open(db: &sled::Db, table: &str) -> Result<Self, StorageError> {
        let tree = db.open_tree(table).map_err(|e| StorageError::DatabaseOpen {
            name: table.to_string(),
            source: e,
        })?;
        Ok(Self {
            tree,
            _record: PhantomData,
        })
    }

    fn encode(record: &R) -> Result<Vec<u8>, StorageError> {
        bincode::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<R, StorageError> {
        bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.tree
            .flush_async()
            .await
            .map_err(|e| StorageError::DatabaseOp(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<R: Record> RecordStore<R> for SledStore<R> {
    async fn save(&self, record: R) -> Result<(), StorageError> {
        let value = Self::encode(&record)?;
        let key = record.hash().as_bytes();

        self.tree
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))
            .map_err(|e| StorageError::DatabaseOp(e.to_string()))?
            .map_err(|_| StorageError::AlreadyExists(record.hash().to_base64()))?;

        self.flush().await
    }

    async fn update(&self, record: R) -> Result<(), StorageError> {
        let value = Self::encode(&record)?;
        self.tree
            .insert(record.hash().as_bytes(), value)
            .map_err(|e| StorageError::DatabaseOp(e.to_string()))?;
        self.flush().await
    }

    async fn delete(&self, hash: &MessageHash) -> Result<(), StorageError> {
        self.tree
            .remove(hash.as_bytes())
            .map_err(|e| StorageError::DatabaseOp(e.to_string()))?;
        self.flush().await
    }

    async fn retrieve_by_hash(&self, hash: &MessageHash) -> Result<Option<R>, StorageError> {
        match self
            .tree
            .get(hash.as_bytes())
            .map_err(|e| StorageError::DatabaseOp(e.to_string()))?
        {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn find_by_hashes(&self, hashes: &[MessageHash]) -> Result<Vec<R>, StorageError> {
        let mut found = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(bytes) = self
                .tree
                .get(hash.as_bytes())
                .map_err(|e| StorageError::DatabaseOp(e.to_string()))?
            {
                found.push(Self::decode(&bytes)?);
            }
        }
        Ok(found)
    }

    async fn upcheck(&self) -> bool {
        self.tree.first().is_ok()
    }
}
