//! Key-value persistence boundary.
//!
//! The store is the single source of truth for TXO records and wallet
//! blobs. Keys are `:`-joined segments; numeric segments are zero-padded
//! hex so prefix scans enumerate `(chain, tree, position)` in order.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database backend error: {0}")]
    Backend(String),
    #[error("Database corruption: {0}")]
    Corrupted(String),
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatabaseError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), DatabaseError>;
    async fn delete(&self, key: &str) -> Result<(), DatabaseError>;

    /// All entries whose key starts with `prefix`, in lexicographic key
    /// order.
    async fn scan_prefix(&self, prefix: &str)
    -> Result<Vec<(String, Vec<u8>)>, DatabaseError>;
}

/// Zero-pads a numeric key segment to a fixed 32-char hex width so
/// lexicographic and numeric orderings agree.
pub fn key_segment(n: u64) -> String {
    format!("{:0>32}", format!("{:x}", n))
}

pub fn join_key(segments: &[&str]) -> String {
    segments.join(":")
}

pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, DatabaseError> {
    bitcode::serialize(value).map_err(|e| DatabaseError::Corrupted(e.to_string()))
}

pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DatabaseError> {
    bitcode::deserialize(bytes).map_err(|e| DatabaseError::Corrupted(e.to_string()))
}

/// In-memory store for tests and ephemeral wallets.
#[derive(Default)]
pub struct MemoryDatabase {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), DatabaseError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, DatabaseError> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Sled-backed persistent store.
pub struct SledDatabase {
    db: sled::Db,
}

impl SledDatabase {
    pub fn open(path: &str) -> Result<Self, DatabaseError> {
        let db = sled::open(path).map_err(|e| DatabaseError::Backend(e.to_string()))?;
        Ok(SledDatabase { db })
    }
}

#[async_trait]
impl Database for SledDatabase {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.db
            .get(key.as_bytes())
            .map(|v| v.map(|ivec| ivec.to_vec()))
            .map_err(|e| DatabaseError::Backend(e.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), DatabaseError> {
        self.db
            .insert(key.as_bytes(), value)
            .map(|_| ())
            .map_err(|e| DatabaseError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.db
            .remove(key.as_bytes())
            .map(|_| ())
            .map_err(|e| DatabaseError::Backend(e.to_string()))
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, DatabaseError> {
        let mut entries = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item.map_err(|e| DatabaseError::Backend(e.to_string()))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| DatabaseError::Corrupted(e.to_string()))?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }
}
