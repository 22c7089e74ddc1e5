//! User registry and load/unload lifecycle
//!
//! Users are loaded when a session starts (or when a command needs an
//! offline user) and unloaded when it ends. Concurrent loads of the same
//! UUID share one in-flight storage call: the first caller spawns it, later
//! callers wait on the same outcome. Unloading waits out an in-flight load.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::holder::{PermissionHolder, User};
use crate::node::group_node;
use crate::storage::{with_timeout, Storage, StorageError, UserData};

/// Live users keyed by UUID
pub struct UserManager {
    users: RwLock<HashMap<Uuid, Arc<User>>>,
    loading: Mutex<HashMap<Uuid, watch::Receiver<Option<bool>>>>,
    storage: Arc<dyn Storage>,
    default_group: String,
    timeout: Duration,
}

impl std::fmt::Debug for UserManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserManager")
            .field("loaded", &self.users.read().len())
            .field("storage", &self.storage.name())
            .finish()
    }
}

impl UserManager {
    pub fn new(storage: Arc<dyn Storage>, default_group: &str, timeout: Duration) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            loading: Mutex::new(HashMap::new()),
            storage,
            default_group: default_group.to_lowercase(),
            timeout,
        }
    }

    pub fn get(&self, uuid: Uuid) -> Option<Arc<User>> {
        self.users.read().get(&uuid).cloned()
    }

    pub fn get_by_username(&self, username: &str) -> Option<Arc<User>> {
        self.users
            .read()
            .values()
            .find(|u| {
                u.username()
                    .is_some_and(|name| name.eq_ignore_ascii_case(username))
            })
            .cloned()
    }

    pub fn is_loaded(&self, uuid: Uuid) -> bool {
        self.users.read().contains_key(&uuid)
    }

    /// Snapshot of every loaded user. Safe to iterate while users come and go.
    pub fn all(&self) -> Vec<Arc<User>> {
        self.users.read().values().cloned().collect()
    }

    pub fn default_group(&self) -> &str {
        &self.default_group
    }

    /// Load a user from storage, creating them in the default group if they
    /// have never been seen. Resolves to whether the user is now loaded.
    pub async fn load_or_create_user(self: &Arc<Self>, uuid: Uuid, username: Option<&str>) -> bool {
        let mut rx = {
            let mut loading = self.loading.lock();
            match loading.get(&uuid) {
                Some(rx) => {
                    debug!("Joining in-flight load of user {}", uuid);
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    loading.insert(uuid, rx.clone());

                    let manager = Arc::clone(self);
                    let username = username.map(str::to_string);
                    tokio::spawn(async move {
                        let success = manager.load_from_storage(uuid, username.as_deref()).await;
                        manager.loading.lock().remove(&uuid);
                        let _ = tx.send(Some(success));
                    });
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|outcome| (*outcome).unwrap_or(false));
        outcome.unwrap_or(false)
    }

    /// Start a load and run `then` with the outcome once it completes
    pub fn load_then<F>(self: &Arc<Self>, uuid: Uuid, username: Option<&str>, then: F) -> JoinHandle<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let manager = Arc::clone(self);
        let username = username.map(str::to_string);
        tokio::spawn(async move {
            let success = manager.load_or_create_user(uuid, username.as_deref()).await;
            then(success);
        })
    }

    async fn load_from_storage(&self, uuid: Uuid, username: Option<&str>) -> bool {
        let stored = match with_timeout(self.timeout, self.storage.load_user(uuid)).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to load user {}: {}", uuid, e);
                return false;
            }
        };

        match stored {
            Some(data) => {
                let user = self.get_or_make(uuid, data.username.as_deref(), &data.primary_group);
                user.load_data(data.nodes, &data.primary_group);
                let renamed = username.is_some_and(|name| user.set_username(name));
                if renamed {
                    if let Err(e) = self.save_user(&user).await {
                        warn!("Failed to persist new username of {}: {}", uuid, e);
                    }
                }
                info!("Loaded user {} ({})", user.friendly_name(), uuid);
                true
            }
            None => {
                let user = self.get_or_make(uuid, username, &self.default_group);
                let nodes = match group_node(&self.default_group) {
                    Ok(node) => vec![node],
                    Err(e) => {
                        warn!("Default group '{}' is unusable: {}", self.default_group, e);
                        Vec::new()
                    }
                };
                user.load_data(nodes, &self.default_group);

                if let Err(e) = self.save_user(&user).await {
                    warn!("Failed to save new user {}: {}", uuid, e);
                    self.users.write().remove(&uuid);
                    return false;
                }
                info!("Created user {} ({})", user.friendly_name(), uuid);
                true
            }
        }
    }

    fn get_or_make(&self, uuid: Uuid, username: Option<&str>, primary_group: &str) -> Arc<User> {
        let user = self
            .users
            .write()
            .entry(uuid)
            .or_insert_with(|| Arc::new(User::new(uuid, username, primary_group)))
            .clone();
        if let Some(name) = username {
            user.set_username(name);
        }
        user
    }

    /// Remove a user from memory, first waiting for any in-flight load of
    /// the same UUID to finish.
    pub async fn unload_user(&self, uuid: Uuid) -> Option<Arc<User>> {
        loop {
            let mut rx = {
                let loading = self.loading.lock();
                match loading.get(&uuid) {
                    Some(rx) => rx.clone(),
                    None => {
                        let removed = self.users.write().remove(&uuid);
                        if let Some(user) = &removed {
                            info!("Unloaded user {} ({})", user.friendly_name(), uuid);
                        }
                        return removed;
                    }
                }
            };

            if rx.wait_for(Option::is_some).await.is_err() {
                // the loader went away without reporting; drop its entry
                self.loading.lock().remove(&uuid);
            }
        }
    }

    /// Unload the user unless they are online
    pub async fn cleanup(&self, user: &User) {
        if !user.is_online() {
            self.unload_user(user.uuid()).await;
        }
    }

    /// Persistable snapshot of a user
    pub fn snapshot(user: &User) -> UserData {
        UserData {
            uuid: user.uuid(),
            username: user.username(),
            primary_group: user.primary_group(),
            nodes: user.nodes(),
        }
    }

    pub async fn save_user(&self, user: &User) -> Result<(), StorageError> {
        let data = Self::snapshot(user);
        with_timeout(self.timeout, self.storage.save_user(&data)).await
    }

    /// Re-read a loaded user's data from storage, replacing memory state
    pub async fn reload_user(&self, user: &User) -> Result<(), StorageError> {
        match with_timeout(self.timeout, self.storage.load_user(user.uuid())).await? {
            Some(data) => user.load_data(data.nodes, &data.primary_group),
            None => user.load_data(Vec::new(), &self.default_group),
        }
        Ok(())
    }
}
