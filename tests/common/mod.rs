//! Common test utilities - PermdTest harness for end-to-end testing

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use permd::commands::{CommandExecutor, CommandOutcome, Sender};
use permd::listener::LifecycleHooks;
use permd::storage::{
    GroupData, MemoryStorage, Storage, StorageError, TrackData, UserData,
};
use permd::{Config, Engine};

/// Memory storage that can be told to fail saves for chosen holders
#[derive(Debug, Default)]
pub struct FlakyStorage {
    pub inner: MemoryStorage,
    failing: Mutex<HashSet<String>>,
}

impl FlakyStorage {
    /// Fail every save of the group or user (by UUID string) named `key`
    pub fn fail_saves_for(&self, key: &str) {
        self.failing.lock().insert(key.to_lowercase());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    fn check(&self, key: &str) -> Result<(), StorageError> {
        if self.failing.lock().contains(&key.to_lowercase()) {
            return Err(StorageError::Unavailable(format!("injected failure for {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn load_user(&self, uuid: Uuid) -> Result<Option<UserData>, StorageError> {
        self.inner.load_user(uuid).await
    }

    async fn save_user(&self, user: &UserData) -> Result<(), StorageError> {
        self.check(&user.uuid.to_string())?;
        self.inner.save_user(user).await
    }

    async fn list_user_keys(&self) -> Result<Vec<Uuid>, StorageError> {
        self.inner.list_user_keys().await
    }

    async fn load_group(&self, name: &str) -> Result<Option<GroupData>, StorageError> {
        self.inner.load_group(name).await
    }

    async fn load_all_groups(&self) -> Result<Vec<GroupData>, StorageError> {
        self.inner.load_all_groups().await
    }

    async fn save_group(&self, group: &GroupData) -> Result<(), StorageError> {
        self.check(&group.name)?;
        self.inner.save_group(group).await
    }

    async fn delete_group(&self, name: &str) -> Result<(), StorageError> {
        self.check(name)?;
        self.inner.delete_group(name).await
    }

    async fn load_all_tracks(&self) -> Result<Vec<TrackData>, StorageError> {
        self.inner.load_all_tracks().await
    }

    async fn save_track(&self, track: &TrackData) -> Result<(), StorageError> {
        self.check(&track.name)?;
        self.inner.save_track(track).await
    }

    async fn delete_track(&self, name: &str) -> Result<(), StorageError> {
        self.check(name)?;
        self.inner.delete_track(name).await
    }

    async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<(), StorageError> {
        self.inner.save_uuid_data(username, uuid).await
    }

    async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>, StorageError> {
        self.inner.get_uuid(username).await
    }
}

/// Test harness wiring an engine, command executor and lifecycle hooks
/// over fault-injectable in-memory storage
pub struct PermdTest {
    pub engine: Arc<Engine>,
    pub executor: CommandExecutor,
    pub hooks: LifecycleHooks,
    pub storage: Arc<FlakyStorage>,
}

impl PermdTest {
    pub async fn start() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let storage = Arc::new(FlakyStorage::default());
        Self::with_storage(config, storage).await
    }

    /// Start a fresh engine over existing storage, as after a restart
    pub async fn with_storage(config: Config, storage: Arc<FlakyStorage>) -> Self {
        let engine = Arc::new(Engine::new(config, storage.clone()));
        engine.start().await.expect("engine failed to start");
        Self {
            executor: CommandExecutor::new(engine.clone()),
            hooks: LifecycleHooks::new(engine.clone()),
            engine,
            storage,
        }
    }

    /// Run a console command and require it to succeed
    pub async fn run(&self, line: &str) -> CommandOutcome {
        let outcome = self.executor.execute(&Sender::Console, line).await;
        assert!(outcome.is_success(), "'{}' failed: {}", line, outcome);
        outcome
    }

    /// Run a console command, whatever the outcome
    pub async fn try_run(&self, line: &str) -> CommandOutcome {
        self.executor.execute(&Sender::Console, line).await
    }

    /// Log a fresh user in
    pub async fn login(&self, username: &str) -> Uuid {
        let uuid = Uuid::new_v4();
        assert!(self.hooks.on_login(uuid, username).await, "login of {} failed", username);
        uuid
    }
}
