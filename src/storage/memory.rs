//! In-process storage backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{GroupData, Storage, StorageError, TrackData, UserData};

/// Storage kept in memory. Used for tests and single-process setups that
/// do not need persistence.
///
/// Writes can be made to fail and loads delayed, so callers' failure and
/// concurrency paths can be exercised.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    users: RwLock<HashMap<Uuid, UserData>>,
    groups: RwLock<HashMap<String, GroupData>>,
    tracks: RwLock<HashMap<String, TrackData>>,
    uuids: RwLock<HashMap<String, Uuid>>,
    user_loads: AtomicUsize,
    load_delay_ms: AtomicUsize,
    bulk_load_delay_ms: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every user load by `delay`
    pub fn set_load_delay(&self, delay: Duration) {
        self.load_delay_ms
            .store(delay.as_millis() as usize, Ordering::Release);
    }

    /// Delay `load_all_groups` and `load_all_tracks` by `delay` after they
    /// have read their snapshot
    pub fn set_bulk_load_delay(&self, delay: Duration) {
        self.bulk_load_delay_ms
            .store(delay.as_millis() as usize, Ordering::Release);
    }

    async fn bulk_load_pause(&self) {
        let delay = self.bulk_load_delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
    }

    /// Make every write fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// How many times `load_user` has been called
    pub fn user_loads(&self) -> usize {
        self.user_loads.load(Ordering::Acquire)
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load_user(&self, uuid: Uuid) -> Result<Option<UserData>, StorageError> {
        self.user_loads.fetch_add(1, Ordering::AcqRel);
        let delay = self.load_delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        Ok(self.users.read().get(&uuid).cloned())
    }

    async fn save_user(&self, user: &UserData) -> Result<(), StorageError> {
        self.check_writable()?;
        self.users.write().insert(user.uuid, user.clone());
        Ok(())
    }

    async fn list_user_keys(&self) -> Result<Vec<Uuid>, StorageError> {
        let mut keys: Vec<Uuid> = self.users.read().keys().copied().collect();
        keys.sort();
        Ok(keys)
    }

    async fn load_group(&self, name: &str) -> Result<Option<GroupData>, StorageError> {
        Ok(self.groups.read().get(&name.to_lowercase()).cloned())
    }

    async fn load_all_groups(&self) -> Result<Vec<GroupData>, StorageError> {
        let mut groups: Vec<GroupData> = self.groups.read().values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        self.bulk_load_pause().await;
        Ok(groups)
    }

    async fn save_group(&self, group: &GroupData) -> Result<(), StorageError> {
        self.check_writable()?;
        self.groups
            .write()
            .insert(group.name.to_lowercase(), group.clone());
        Ok(())
    }

    async fn delete_group(&self, name: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.groups.write().remove(&name.to_lowercase());
        Ok(())
    }

    async fn load_all_tracks(&self) -> Result<Vec<TrackData>, StorageError> {
        let mut tracks: Vec<TrackData> = self.tracks.read().values().cloned().collect();
        tracks.sort_by(|a, b| a.name.cmp(&b.name));
        self.bulk_load_pause().await;
        Ok(tracks)
    }

    async fn save_track(&self, track: &TrackData) -> Result<(), StorageError> {
        self.check_writable()?;
        self.tracks
            .write()
            .insert(track.name.to_lowercase(), track.clone());
        Ok(())
    }

    async fn delete_track(&self, name: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.tracks.write().remove(&name.to_lowercase());
        Ok(())
    }

    async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<(), StorageError> {
        self.check_writable()?;
        self.uuids.write().insert(username.to_lowercase(), uuid);
        Ok(())
    }

    async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>, StorageError> {
        Ok(self.uuids.read().get(&username.to_lowercase()).copied())
    }
}
