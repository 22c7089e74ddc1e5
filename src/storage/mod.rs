//! Storage contract
//!
//! The engine treats storage as an opaque, retry-free collaborator: it loads
//! and saves raw node sets by holder key and lists known users. Whatever
//! retry or timeout policy a backend wants lives behind this trait.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::node::Node;

/// Run a storage call under a deadline, reporting expiry as [`StorageError::Timeout`]
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout),
    }
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage operation timed out")]
    Timeout,

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Persisted state of a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserData {
    pub uuid: Uuid,
    pub username: Option<String>,
    pub primary_group: String,
    pub nodes: Vec<Node>,
}

/// Persisted state of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupData {
    pub name: String,
    pub nodes: Vec<Node>,
}

/// Persisted state of a track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackData {
    pub name: String,
    pub groups: Vec<String>,
}

/// Load/save contract consumed by the managers and the engine
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    async fn load_user(&self, uuid: Uuid) -> Result<Option<UserData>, StorageError>;

    async fn save_user(&self, user: &UserData) -> Result<(), StorageError>;

    /// Every user that has persisted data
    async fn list_user_keys(&self) -> Result<Vec<Uuid>, StorageError>;

    async fn load_group(&self, name: &str) -> Result<Option<GroupData>, StorageError>;

    async fn load_all_groups(&self) -> Result<Vec<GroupData>, StorageError>;

    async fn save_group(&self, group: &GroupData) -> Result<(), StorageError>;

    async fn delete_group(&self, name: &str) -> Result<(), StorageError>;

    async fn load_all_tracks(&self) -> Result<Vec<TrackData>, StorageError>;

    async fn save_track(&self, track: &TrackData) -> Result<(), StorageError>;

    async fn delete_track(&self, name: &str) -> Result<(), StorageError>;

    /// Remember the latest username seen for a UUID
    async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<(), StorageError>;

    async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>, StorageError>;
}
