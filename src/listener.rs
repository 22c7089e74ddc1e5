//! Host lifecycle hooks
//!
//! The host calls these when a session starts and ends:
//! - login: remember the username, load (or create) the user, warm the cache
//! - quit: mark offline and unload

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::storage::with_timeout;

/// Session start/end handling for the host platform
#[derive(Debug, Clone)]
pub struct LifecycleHooks {
    engine: Arc<Engine>,
}

impl LifecycleHooks {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Load a user for a new session. Returns false if they could not be
    /// loaded, in which case the host should refuse or warn the player.
    pub async fn on_login(&self, uuid: Uuid, username: &str) -> bool {
        let timeout = std::time::Duration::from_millis(self.engine.config().storage_timeout_ms);
        if let Err(e) = with_timeout(timeout, self.engine.storage().save_uuid_data(username, uuid)).await
        {
            warn!("Failed to save uuid data for {}: {}", username, e);
        }

        let users = self.engine.users();
        if !users.load_or_create_user(uuid, Some(username)).await {
            warn!("Could not load data for {} ({})", username, uuid);
            return false;
        }

        let Some(user) = users.get(uuid) else {
            warn!("User {} was unloaded during login", uuid);
            return false;
        };
        user.set_online(true);
        self.engine.refresh_permissions(&user);
        info!("{} ({}) logged in", username, uuid);
        true
    }

    /// End a session
    pub async fn on_quit(&self, uuid: Uuid) {
        let users = self.engine.users();
        if let Some(user) = users.get(uuid) {
            user.set_online(false);
        }
        users.unload_user(uuid).await;
    }
}
