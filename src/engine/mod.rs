//! Engine - composition root
//!
//! Owns storage, the group/track/user registries and configuration. Every
//! mutation that must be persisted goes through here:
//!
//! 1. mutate the holder in memory (its own cache is invalidated)
//! 2. for groups, invalidate every loaded holder that inherits it
//! 3. save; on failure reload the holder from storage and report the error

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CalculatedData, Tristate};
use crate::holder::{
    validate_node, DataMutateResult, Group, HolderError, HolderKind, HolderRef, PermissionHolder,
    User,
};
use crate::inheritance::InheritanceResolver;
use crate::managers::{GroupManager, TrackManager, UserManager};
use crate::node::{group_node, unix_now, weight_node, Node, NodeParseError, QueryContext};
use crate::storage::{
    with_timeout, GroupData, MemoryStorage, SqliteStorage, Storage, StorageError, TrackData,
};
use crate::track::{Track, TrackError};
use crate::{Config, StorageBackend};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_+\-]{1,36}$").expect("static regex"));

/// Group and track names: 1-36 characters of letters, digits, `_`, `-` or `+`
pub fn validate_name(name: &str) -> Result<(), EngineError> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(EngineError::InvalidName(name.to_string()))
    }
}

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("change could not be saved and was rolled back: {0}")]
    SaveFailed(StorageError),

    #[error(transparent)]
    Holder(#[from] HolderError),

    #[error(transparent)]
    Track(#[from] TrackError),

    #[error(transparent)]
    Node(#[from] NodeParseError),

    #[error("invalid name '{0}'")]
    InvalidName(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("group '{0}' does not exist")]
    UnknownGroup(String),

    #[error("track '{0}' does not exist")]
    UnknownTrack(String),

    #[error("user {0} could not be loaded")]
    UserNotLoaded(Uuid),

    #[error("the default group cannot be deleted")]
    DefaultGroup,

    #[error("{0} is not on track '{1}'")]
    NotOnTrack(String, String),

    #[error("{0} is already at the end of track '{1}'")]
    EndOfTrack(String, String),
}

/// Result of a promotion or demotion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMove {
    pub from: String,
    pub to: String,
}

/// The authorization engine
pub struct Engine {
    config: Config,
    storage: Arc<dyn Storage>,
    groups: GroupManager,
    tracks: TrackManager,
    users: Arc<UserManager>,
    /// Serializes group and track writes against full reloads from storage
    registry_writes: Mutex<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("server", &self.config.server)
            .field("storage", &self.storage.name())
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl Engine {
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Self {
        let users = Arc::new(UserManager::new(
            storage.clone(),
            &config.default_group,
            Duration::from_millis(config.storage_timeout_ms),
        ));
        Self {
            config,
            storage,
            groups: GroupManager::new(),
            tracks: TrackManager::new(),
            users,
            registry_writes: Mutex::new(()),
        }
    }

    /// Build the configured storage backend, then create and start an engine on it
    pub async fn open(config: Config) -> anyhow::Result<Arc<Self>> {
        let storage: Arc<dyn Storage> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            StorageBackend::Sqlite => {
                Arc::new(SqliteStorage::new(config.storage.path.as_deref()).await?)
            }
        };
        info!("Using {} storage", storage.name());

        let engine = Arc::new(Self::new(config, storage));
        engine.start().await?;
        Ok(engine)
    }

    /// Load groups and tracks and make sure the default group exists
    pub async fn start(&self) -> Result<(), EngineError> {
        self.load_groups_and_tracks().await?;
        info!(
            "Loaded {} groups and {} tracks",
            self.groups.len(),
            self.tracks.all().len()
        );
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    pub fn tracks(&self) -> &TrackManager {
        &self.tracks
    }

    pub fn users(&self) -> &Arc<UserManager> {
        &self.users
    }

    pub fn default_group(&self) -> &str {
        self.users.default_group()
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.storage_timeout_ms)
    }

    pub fn resolver(&self) -> InheritanceResolver<'_> {
        InheritanceResolver::new(&self.groups, self.config.apply_wildcards)
    }

    /// The context of this host: its configured server, any world
    pub fn server_context(&self) -> QueryContext {
        QueryContext::from_args(Some(&self.config.server), None)
    }

    // -- queries --

    pub fn calculated(
        &self,
        holder: &dyn PermissionHolder,
        ctx: &QueryContext,
    ) -> Arc<CalculatedData> {
        holder.calculated(&self.resolver(), ctx)
    }

    pub fn has_permission(
        &self,
        holder: &dyn PermissionHolder,
        key: &str,
        ctx: &QueryContext,
    ) -> Tristate {
        holder.has_permission(&self.resolver(), key, ctx)
    }

    pub fn get_meta(
        &self,
        holder: &dyn PermissionHolder,
        key: &str,
        ctx: &QueryContext,
    ) -> Option<String> {
        holder.get_meta(&self.resolver(), key, ctx)
    }

    pub fn get_prefix(&self, holder: &dyn PermissionHolder, ctx: &QueryContext) -> Option<String> {
        self.calculated(holder, ctx).prefix().map(str::to_string)
    }

    pub fn get_suffix(&self, holder: &dyn PermissionHolder, ctx: &QueryContext) -> Option<String> {
        self.calculated(holder, ctx).suffix().map(str::to_string)
    }

    /// Drop a user's cached views and rebuild the one for this host's context
    pub fn refresh_permissions(&self, user: &User) {
        user.cache().invalidate();
        let ctx = self.server_context();
        let data = self.calculated(user, &ctx);
        debug!(
            "Refreshed permissions of {} ({} nodes in {})",
            user.friendly_name(),
            data.nodes().len(),
            ctx
        );
    }

    // -- lookups --

    pub fn group(&self, name: &str) -> Result<Arc<Group>, EngineError> {
        self.groups
            .get(name)
            .ok_or_else(|| EngineError::UnknownGroup(name.to_lowercase()))
    }

    pub fn track(&self, name: &str) -> Result<Arc<Track>, EngineError> {
        self.tracks
            .get(name)
            .ok_or_else(|| EngineError::UnknownTrack(name.to_lowercase()))
    }

    /// The loaded user, loading (or creating) them from storage if needed.
    /// Callers that load an offline user should hand it back via
    /// [`UserManager::cleanup`] when done.
    pub async fn user(&self, uuid: Uuid) -> Result<Arc<User>, EngineError> {
        if let Some(user) = self.users.get(uuid) {
            return Ok(user);
        }
        if !self.users.load_or_create_user(uuid, None).await {
            return Err(EngineError::UserNotLoaded(uuid));
        }
        self.users.get(uuid).ok_or(EngineError::UserNotLoaded(uuid))
    }

    /// Read-only view of a user: the loaded one, or a detached copy of the
    /// stored one. Unknown users are neither created nor registered.
    pub async fn lookup_user(&self, uuid: Uuid) -> Result<Option<Arc<User>>, EngineError> {
        if let Some(user) = self.users.get(uuid) {
            return Ok(Some(user));
        }
        let Some(data) = with_timeout(self.timeout(), self.storage.load_user(uuid)).await? else {
            return Ok(None);
        };
        let user = User::new(uuid, data.username.as_deref(), &data.primary_group);
        user.load_data(data.nodes, &data.primary_group);
        Ok(Some(Arc::new(user)))
    }

    // -- cascading invalidation --

    /// Invalidate every loaded holder that inherits `group`, directly or
    /// through other groups. Edges are read from a snapshot of the loaded
    /// holders, so users loading or unloading concurrently are tolerated.
    /// Returns how many holders were invalidated.
    pub fn invalidate_dependents(&self, group: &str) -> usize {
        let groups = self.groups.all();
        let users = self.users.all();

        let mut children: HashMap<String, Vec<&dyn PermissionHolder>> = HashMap::new();
        let holders = groups
            .iter()
            .map(|g| g.as_ref() as &dyn PermissionHolder)
            .chain(users.iter().map(|u| u.as_ref() as &dyn PermissionHolder));
        for holder in holders {
            for parent in holder.parent_names() {
                children.entry(parent).or_default().push(holder);
            }
        }

        let root = group.to_lowercase();
        let mut visited: HashSet<(HolderKind, String)> = HashSet::new();
        visited.insert((HolderKind::Group, root.clone()));
        let mut queue = VecDeque::from([root]);
        let mut invalidated = 0;

        while let Some(name) = queue.pop_front() {
            let Some(dependents) = children.get(&name) else {
                continue;
            };
            for holder in dependents {
                let id = (holder.kind(), holder.object_name());
                if !visited.insert(id.clone()) {
                    continue;
                }
                holder.cache().invalidate();
                invalidated += 1;
                if id.0 == HolderKind::Group {
                    queue.push_back(id.1);
                }
            }
        }

        debug!("Invalidated {} dependents of group {}", invalidated, group);
        invalidated
    }

    // -- holder mutations --

    /// Group edits hold the registry lock so a concurrent sync cannot
    /// overwrite them with an older storage read
    async fn lock_for(&self, holder: &HolderRef) -> Option<MutexGuard<'_, ()>> {
        match holder {
            HolderRef::Group(_) => Some(self.registry_writes.lock().await),
            HolderRef::User(_) => None,
        }
    }

    pub async fn set_node(
        &self,
        holder: &HolderRef,
        node: Node,
    ) -> Result<DataMutateResult, EngineError> {
        validate_node(&node)?;
        let _guard = self.lock_for(holder).await;
        let result = holder.as_holder().set_node(node);
        if result.changed() {
            self.commit(holder).await?;
        }
        Ok(result)
    }

    pub async fn unset_node(
        &self,
        holder: &HolderRef,
        node: &Node,
    ) -> Result<DataMutateResult, EngineError> {
        let _guard = self.lock_for(holder).await;
        let result = holder.as_holder().unset_node(node);
        if result.changed() {
            self.commit(holder).await?;
        }
        Ok(result)
    }

    pub async fn clear_nodes(
        &self,
        holder: &HolderRef,
        filter: &(dyn Fn(&Node) -> bool + Sync),
    ) -> Result<usize, EngineError> {
        let _guard = self.lock_for(holder).await;
        let removed = holder.as_holder().clear_nodes(filter);
        if removed > 0 {
            self.commit(holder).await?;
        }
        Ok(removed)
    }

    /// Replace any meta value for `key` in the same scope, then set the new one
    pub async fn set_meta(
        &self,
        holder: &HolderRef,
        key: &str,
        value: &str,
        server: Option<&str>,
        world: Option<&str>,
    ) -> Result<DataMutateResult, EngineError> {
        let node = crate::node::meta_node(key, value)?;
        let node = Node::builder(node.key())
            .maybe_server(server)
            .maybe_world(world)
            .build()?;

        let _guard = self.lock_for(holder).await;
        let target = holder.as_holder();
        let same_slot = |n: &Node| {
            n.meta().is_some_and(|(k, _)| k == key)
                && n.server() == node.server()
                && n.world() == node.world()
                && n.contexts().is_empty()
                && n != &node
        };
        let removed = target.clear_nodes(&same_slot);
        let result = target.set_node(node.clone());
        if removed > 0 || result.changed() {
            self.commit(holder).await?;
        }
        Ok(result)
    }

    /// Give a group exactly one weight, dropping any earlier `weight.*` nodes
    pub async fn set_weight(
        &self,
        group: &Arc<Group>,
        weight: i32,
    ) -> Result<DataMutateResult, EngineError> {
        let node = weight_node(weight)?;
        let holder = HolderRef::Group(group.clone());

        let _guard = self.registry_writes.lock().await;
        let removed = group.clear_nodes(&|n: &Node| n.weight().is_some() && n != &node);
        let result = group.set_node(node);
        if removed > 0 || result.changed() {
            self.commit(&holder).await?;
        }
        Ok(result)
    }

    /// Make `holder` inherit `group`, which must exist
    pub async fn add_parent(
        &self,
        holder: &HolderRef,
        group: &str,
        server: Option<&str>,
        world: Option<&str>,
    ) -> Result<DataMutateResult, EngineError> {
        let parent = self.group(group)?;
        let node = Node::builder(&format!("group.{}", parent.name()))
            .maybe_server(server)
            .maybe_world(world)
            .build()?;
        let _guard = self.lock_for(holder).await;
        let result = holder.as_holder().set_inherit_group(&node)?;
        if result.changed() {
            self.commit(holder).await?;
        }
        Ok(result)
    }

    /// Remove an inheritance edge. The group does not have to exist, so
    /// dangling references can be cleaned up. A user losing their primary
    /// group falls back to another global parent, or the default group.
    pub async fn remove_parent(
        &self,
        holder: &HolderRef,
        group: &str,
        server: Option<&str>,
        world: Option<&str>,
    ) -> Result<DataMutateResult, EngineError> {
        let node = Node::builder(&format!("group.{}", group))
            .maybe_server(server)
            .maybe_world(world)
            .build()?;
        let _guard = self.lock_for(holder).await;
        let result = holder.as_holder().unset_inherit_group(&node)?;
        if !result.changed() {
            return Ok(result);
        }

        if let HolderRef::User(user) = holder {
            let removed = node.group_name().unwrap_or_default();
            if user.primary_group() == removed && !user.inherits_group(removed) {
                let fallback = user
                    .parent_names()
                    .into_iter()
                    .find(|g| g != removed && user.inherits_group(g))
                    .unwrap_or_else(|| self.default_group().to_string());
                user.force_primary_group(&fallback);
            }
        }
        self.commit(holder).await?;
        Ok(result)
    }

    pub async fn set_primary_group(&self, user: &Arc<User>, group: &str) -> Result<(), EngineError> {
        let group = self.group(group)?;
        if user.primary_group() == group.name() {
            return Ok(());
        }
        user.set_primary_group(group.name())?;
        self.commit(&HolderRef::User(user.clone())).await
    }

    /// Invalidate dependents and save; on save failure reload from storage
    async fn commit(&self, holder: &HolderRef) -> Result<(), EngineError> {
        if let HolderRef::Group(group) = holder {
            self.invalidate_dependents(group.name());
        }

        let saved = match holder {
            HolderRef::User(user) => self.users.save_user(user).await,
            HolderRef::Group(group) => self.save_group(group).await,
        };
        if let Err(e) = saved {
            let target = holder.as_holder();
            warn!(
                "Failed to save {} {}: {}, reloading from storage",
                target.kind(),
                target.friendly_name(),
                e
            );
            self.reload_holder(holder).await;
            return Err(EngineError::SaveFailed(e));
        }
        Ok(())
    }

    async fn reload_holder(&self, holder: &HolderRef) {
        let reloaded = match holder {
            HolderRef::User(user) => self.users.reload_user(user).await,
            HolderRef::Group(group) => self.reload_group(group).await,
        };
        if let Err(e) = reloaded {
            let target = holder.as_holder();
            warn!(
                "Failed to reload {} {}, memory and storage may differ: {}",
                target.kind(),
                target.friendly_name(),
                e
            );
        }
    }

    async fn reload_group(&self, group: &Group) -> Result<(), StorageError> {
        let stored = with_timeout(self.timeout(), self.storage.load_group(group.name())).await?;
        group.replace_nodes(stored.map(|g| g.nodes).unwrap_or_default());
        self.invalidate_dependents(group.name());
        Ok(())
    }

    async fn save_group(&self, group: &Group) -> Result<(), StorageError> {
        let data = GroupData {
            name: group.name().to_string(),
            nodes: group.nodes(),
        };
        with_timeout(self.timeout(), self.storage.save_group(&data)).await
    }

    async fn save_track(&self, track: &Track) -> Result<(), StorageError> {
        let data = TrackData {
            name: track.name().to_string(),
            groups: track.groups(),
        };
        with_timeout(self.timeout(), self.storage.save_track(&data)).await
    }

    // -- groups --

    pub async fn create_group(&self, name: &str) -> Result<Arc<Group>, EngineError> {
        let _guard = self.registry_writes.lock().await;
        self.create_group_locked(name).await
    }

    async fn create_group_locked(&self, name: &str) -> Result<Arc<Group>, EngineError> {
        validate_name(name)?;
        let group = self
            .groups
            .create(name)
            .ok_or_else(|| EngineError::AlreadyExists(format!("group '{}'", name.to_lowercase())))?;

        if let Err(e) = self.save_group(&group).await {
            warn!("Failed to save new group {}: {}", group.name(), e);
            self.groups.remove(group.name());
            return Err(EngineError::SaveFailed(e));
        }
        info!("Created group {}", group.name());
        Ok(group)
    }

    /// Delete a group and scrub references to it from every loaded holder
    /// and every stored user. Tracks keep the name and report it as a
    /// broken link when walked.
    pub async fn delete_group(&self, name: &str) -> Result<(), EngineError> {
        let _guard = self.registry_writes.lock().await;
        let group = self.group(name)?;
        let name = group.name().to_string();
        if name == self.default_group() {
            return Err(EngineError::DefaultGroup);
        }

        with_timeout(self.timeout(), self.storage.delete_group(&name)).await?;
        self.invalidate_dependents(&name);
        self.groups.remove(&name);

        let references = |n: &Node| n.group_name() == Some(name.as_str());
        let mut scrubbed = 0;

        for other in self.groups.all() {
            if other.clear_nodes(&references) > 0 {
                scrubbed += 1;
                self.invalidate_dependents(other.name());
                if let Err(e) = self.save_group(&other).await {
                    warn!("Failed to save group {} after scrubbing {}: {}", other.name(), name, e);
                }
            }
        }

        for user in self.users.all() {
            if self.scrub_user(&user, &name) {
                scrubbed += 1;
                if let Err(e) = self.users.save_user(&user).await {
                    warn!("Failed to save user {} after scrubbing {}: {}", user.uuid(), name, e);
                }
            }
        }

        scrubbed += self.scrub_stored_users(&name).await;
        info!("Deleted group {} ({} holders scrubbed)", name, scrubbed);
        Ok(())
    }

    fn scrub_user(&self, user: &User, group: &str) -> bool {
        let removed = user.clear_nodes(&|n: &Node| n.group_name() == Some(group));
        let orphaned = user.primary_group() == group;
        if orphaned {
            user.force_primary_group(self.default_group());
            if let Ok(node) = group_node(self.default_group()) {
                user.set_node(node);
            }
        }
        removed > 0 || orphaned
    }

    async fn scrub_stored_users(&self, group: &str) -> usize {
        let keys = match with_timeout(self.timeout(), self.storage.list_user_keys()).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list stored users while deleting {}: {}", group, e);
                return 0;
            }
        };

        let mut scrubbed = 0;
        for uuid in keys {
            if self.users.is_loaded(uuid) {
                continue;
            }
            let mut data = match with_timeout(self.timeout(), self.storage.load_user(uuid)).await {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to load stored user {}: {}", uuid, e);
                    continue;
                }
            };

            let before = data.nodes.len();
            data.nodes.retain(|n| n.group_name() != Some(group));
            let orphaned = data.primary_group == group;
            if orphaned {
                data.primary_group = self.default_group().to_string();
                if let Ok(node) = group_node(self.default_group()) {
                    if !data.nodes.contains(&node) {
                        data.nodes.push(node);
                    }
                }
            }
            if data.nodes.len() == before && !orphaned {
                continue;
            }

            match with_timeout(self.timeout(), self.storage.save_user(&data)).await {
                Ok(()) => scrubbed += 1,
                Err(e) => warn!("Failed to save stored user {}: {}", uuid, e),
            }
        }
        scrubbed
    }

    // -- tracks --

    pub async fn create_track(&self, name: &str) -> Result<Arc<Track>, EngineError> {
        let _guard = self.registry_writes.lock().await;
        validate_name(name)?;
        let track = self
            .tracks
            .create(name)
            .ok_or_else(|| EngineError::AlreadyExists(format!("track '{}'", name.to_lowercase())))?;

        if let Err(e) = self.save_track(&track).await {
            warn!("Failed to save new track {}: {}", track.name(), e);
            self.tracks.remove(track.name());
            return Err(EngineError::SaveFailed(e));
        }
        info!("Created track {}", track.name());
        Ok(track)
    }

    pub async fn delete_track(&self, name: &str) -> Result<(), EngineError> {
        let _guard = self.registry_writes.lock().await;
        let track = self.track(name)?;
        with_timeout(self.timeout(), self.storage.delete_track(track.name())).await?;
        self.tracks.remove(track.name());
        info!("Deleted track {}", track.name());
        Ok(())
    }

    /// Append an existing group to a track
    pub async fn track_append(&self, track: &str, group: &str) -> Result<(), EngineError> {
        let _guard = self.registry_writes.lock().await;
        let track = self.track(track)?;
        let group = self.group(group)?;
        track.append(group.name())?;
        self.commit_track(&track).await
    }

    /// Insert an existing group at a zero-based position
    pub async fn track_insert(
        &self,
        track: &str,
        group: &str,
        position: usize,
    ) -> Result<(), EngineError> {
        let _guard = self.registry_writes.lock().await;
        let track = self.track(track)?;
        let group = self.group(group)?;
        track.insert(group.name(), position)?;
        self.commit_track(&track).await
    }

    pub async fn track_remove(&self, track: &str, group: &str) -> Result<(), EngineError> {
        let _guard = self.registry_writes.lock().await;
        let track = self.track(track)?;
        track.remove(group)?;
        self.commit_track(&track).await
    }

    /// Remove every group from a track
    pub async fn track_clear(&self, track: &str) -> Result<(), EngineError> {
        let _guard = self.registry_writes.lock().await;
        let track = self.track(track)?;
        track.clear();
        self.commit_track(&track).await
    }

    async fn commit_track(&self, track: &Track) -> Result<(), EngineError> {
        let Err(e) = self.save_track(track).await else {
            return Ok(());
        };
        warn!(
            "Failed to save track {}: {}, reloading from storage",
            track.name(),
            e
        );
        match with_timeout(self.timeout(), self.storage.load_all_tracks()).await {
            Ok(stored) => {
                let groups = stored
                    .into_iter()
                    .find(|t| t.name == track.name())
                    .map(|t| t.groups)
                    .unwrap_or_default();
                track.set_groups(groups);
            }
            Err(reload) => warn!("Failed to reload track {}: {}", track.name(), reload),
        }
        Err(EngineError::SaveFailed(e))
    }

    /// Move a user one group up the track
    pub async fn promote(&self, user: &Arc<User>, track: &str) -> Result<TrackMove, EngineError> {
        self.move_on_track(user, track, true).await
    }

    /// Move a user one group down the track
    pub async fn demote(&self, user: &Arc<User>, track: &str) -> Result<TrackMove, EngineError> {
        self.move_on_track(user, track, false).await
    }

    async fn move_on_track(
        &self,
        user: &Arc<User>,
        track: &str,
        up: bool,
    ) -> Result<TrackMove, EngineError> {
        let track = self.track(track)?;
        let on_track: Vec<String> = track
            .groups()
            .into_iter()
            .filter(|g| user.inherits_group(g))
            .collect();
        let current = match on_track.as_slice() {
            [] => {
                return Err(EngineError::NotOnTrack(
                    user.friendly_name(),
                    track.name().to_string(),
                ))
            }
            [only] => only.clone(),
            _ => return Err(TrackError::AmbiguousPosition(track.name().to_string()).into()),
        };

        let next = if up {
            track.next_group(&current, &self.groups)?
        } else {
            track.previous_group(&current, &self.groups)?
        };
        let Some(next) = next else {
            return Err(EngineError::EndOfTrack(
                user.friendly_name(),
                track.name().to_string(),
            ));
        };

        user.unset_node(&group_node(&current)?);
        user.set_node(group_node(&next)?);
        if user.primary_group() == current {
            user.force_primary_group(&next);
        }
        self.commit(&HolderRef::User(user.clone())).await?;

        info!(
            "Moved {} from {} to {} on track {}",
            user.friendly_name(),
            current,
            next,
            track.name()
        );
        Ok(TrackMove {
            from: current,
            to: next,
        })
    }

    // -- background maintenance --

    /// Remove expired nodes from every loaded holder. Changed holders are
    /// saved and their dependents invalidated. Returns how many changed.
    pub async fn audit_expired(&self) -> usize {
        let now = unix_now();
        let mut changed = 0;

        let guard = self.registry_writes.lock().await;
        for group in self.groups.all() {
            let expired = group.audit_expired(now);
            if expired.is_empty() {
                continue;
            }
            changed += 1;
            debug!("Expired {} nodes on group {}", expired.len(), group.name());
            self.invalidate_dependents(group.name());
            if let Err(e) = self.save_group(&group).await {
                warn!("Failed to save group {} after expiry: {}", group.name(), e);
            }
        }
        drop(guard);

        for user in self.users.all() {
            let expired = user.audit_expired(now);
            if expired.is_empty() {
                continue;
            }
            changed += 1;
            debug!("Expired {} nodes on user {}", expired.len(), user.friendly_name());
            if let Err(e) = self.users.save_user(&user).await {
                warn!("Failed to save user {} after expiry: {}", user.uuid(), e);
            }
        }
        changed
    }

    /// Re-read groups and tracks from storage, then reload every online user
    pub async fn sync(&self) -> Result<(), EngineError> {
        self.load_groups_and_tracks().await?;

        for group in self.groups.all() {
            group.cache().invalidate();
        }
        for user in self.users.all() {
            user.cache().invalidate();
            if !user.is_online() {
                continue;
            }
            match self.users.reload_user(&user).await {
                Ok(()) => self.refresh_permissions(&user),
                Err(e) => warn!("Failed to reload user {} during sync: {}", user.uuid(), e),
            }
        }
        info!("Synced {} groups from {} storage", self.groups.len(), self.storage.name());
        Ok(())
    }

    async fn load_groups_and_tracks(&self) -> Result<(), EngineError> {
        let _guard = self.registry_writes.lock().await;
        let groups = with_timeout(self.timeout(), self.storage.load_all_groups()).await?;
        let tracks = with_timeout(self.timeout(), self.storage.load_all_tracks()).await?;
        self.groups.load_all(groups);
        self.tracks.load_all(tracks);

        if !self.groups.exists(self.default_group()) {
            self.create_group_locked(self.default_group()).await?;
        }
        Ok(())
    }
}
