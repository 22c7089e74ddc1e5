//! SQLite storage backend

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};
use uuid::Uuid;

use super::{GroupData, Storage, StorageError, TrackData, UserData};
use crate::node::Node;

/// Storage backed by an SQLite database
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish()
    }
}

impl SqliteStorage {
    /// Open (or create) the database and run migrations.
    /// If path is None, uses an in-memory database.
    pub async fn new(path: Option<&str>) -> Result<Self, StorageError> {
        let conn_str = match path {
            Some(p) => format!("sqlite:{}?mode=rwc", p),
            None => "sqlite::memory:".to_string(),
        };

        let options = SqliteConnectOptions::from_str(&conn_str)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // a single connection keeps an in-memory database alive and shared
        let max_connections = if path.is_some() { 10 } else { 1 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        info!("Running storage migrations...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                uuid TEXT PRIMARY KEY,
                username TEXT,
                primary_group TEXT NOT NULL DEFAULT 'default'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_nodes (
                uuid TEXT NOT NULL,
                node TEXT NOT NULL,
                PRIMARY KEY (uuid, node)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS groups (name TEXT PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_nodes (
                name TEXT NOT NULL,
                node TEXT NOT NULL,
                PRIMARY KEY (name, node)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracks (
                name TEXT PRIMARY KEY,
                groups TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS uuid_cache (
                username TEXT PRIMARY KEY,
                uuid TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Storage migrations complete");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Parse stored node strings. A malformed row is skipped so one corrupted
    /// entry does not make the whole holder unloadable.
    fn parse_nodes(owner: &str, rows: Vec<(String,)>) -> Vec<Node> {
        rows.into_iter()
            .filter_map(|(raw,)| match raw.parse::<Node>() {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!("Skipping malformed node '{}' of {}: {}", raw, owner, e);
                    None
                }
            })
            .collect()
    }

    async fn load_group_nodes(&self, name: &str) -> Result<Vec<Node>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT node FROM group_nodes WHERE name = ?")
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        Ok(Self::parse_nodes(name, rows))
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn load_user(&self, uuid: Uuid) -> Result<Option<UserData>, StorageError> {
        let key = uuid.to_string();
        let row: Option<(Option<String>, String)> =
            sqlx::query_as("SELECT username, primary_group FROM users WHERE uuid = ?")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?;

        let Some((username, primary_group)) = row else {
            return Ok(None);
        };

        let rows: Vec<(String,)> = sqlx::query_as("SELECT node FROM user_nodes WHERE uuid = ?")
            .bind(&key)
            .fetch_all(&self.pool)
            .await?;

        Ok(Some(UserData {
            uuid,
            username,
            primary_group,
            nodes: Self::parse_nodes(&key, rows),
        }))
    }

    async fn save_user(&self, user: &UserData) -> Result<(), StorageError> {
        let key = user.uuid.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR REPLACE INTO users (uuid, username, primary_group) VALUES (?, ?, ?)")
            .bind(&key)
            .bind(&user.username)
            .bind(&user.primary_group)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM user_nodes WHERE uuid = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await?;

        for node in &user.nodes {
            sqlx::query("INSERT OR REPLACE INTO user_nodes (uuid, node) VALUES (?, ?)")
                .bind(&key)
                .bind(node.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_user_keys(&self) -> Result<Vec<Uuid>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT uuid FROM users ORDER BY uuid")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(raw,)| match Uuid::parse_str(&raw) {
                Ok(uuid) => Some(uuid),
                Err(e) => {
                    warn!("Skipping malformed user key '{}': {}", raw, e);
                    None
                }
            })
            .collect())
    }

    async fn load_group(&self, name: &str) -> Result<Option<GroupData>, StorageError> {
        let name = name.to_lowercase();
        let exists: Option<(String,)> = sqlx::query_as("SELECT name FROM groups WHERE name = ?")
            .bind(&name)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let nodes = self.load_group_nodes(&name).await?;
        Ok(Some(GroupData { name, nodes }))
    }

    async fn load_all_groups(&self) -> Result<Vec<GroupData>, StorageError> {
        let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM groups ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        let mut groups = Vec::with_capacity(names.len());
        for (name,) in names {
            let nodes = self.load_group_nodes(&name).await?;
            groups.push(GroupData { name, nodes });
        }
        Ok(groups)
    }

    async fn save_group(&self, group: &GroupData) -> Result<(), StorageError> {
        let name = group.name.to_lowercase();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO groups (name) VALUES (?)")
            .bind(&name)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM group_nodes WHERE name = ?")
            .bind(&name)
            .execute(&mut *tx)
            .await?;

        for node in &group.nodes {
            sqlx::query("INSERT OR REPLACE INTO group_nodes (name, node) VALUES (?, ?)")
                .bind(&name)
                .bind(node.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_group(&self, name: &str) -> Result<(), StorageError> {
        let name = name.to_lowercase();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM group_nodes WHERE name = ?")
            .bind(&name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM groups WHERE name = ?")
            .bind(&name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_all_tracks(&self) -> Result<Vec<TrackData>, StorageError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, groups FROM tracks ORDER BY name")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(name, groups)| {
                Ok(TrackData {
                    name,
                    groups: serde_json::from_str(&groups)?,
                })
            })
            .collect()
    }

    async fn save_track(&self, track: &TrackData) -> Result<(), StorageError> {
        let groups = serde_json::to_string(&track.groups)?;
        sqlx::query("INSERT OR REPLACE INTO tracks (name, groups) VALUES (?, ?)")
            .bind(track.name.to_lowercase())
            .bind(&groups)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_track(&self, name: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM tracks WHERE name = ?")
            .bind(name.to_lowercase())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_uuid_data(&self, username: &str, uuid: Uuid) -> Result<(), StorageError> {
        sqlx::query("INSERT OR REPLACE INTO uuid_cache (username, uuid) VALUES (?, ?)")
            .bind(username.to_lowercase())
            .bind(uuid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_uuid(&self, username: &str) -> Result<Option<Uuid>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT uuid FROM uuid_cache WHERE username = ?")
            .bind(username.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|(raw,)| Uuid::parse_str(&raw).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> Node {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_migrations_run() {
        let storage = SqliteStorage::new(None).await.unwrap();
        let result: (i32,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(result.0, 0);
    }

    #[tokio::test]
    async fn test_user_save_and_load() {
        let storage = SqliteStorage::new(None).await.unwrap();
        let uuid = Uuid::new_v4();
        let mut data = UserData {
            uuid,
            username: Some("alice".into()),
            primary_group: "default".into(),
            nodes: vec![node("group.default"), node("survival/-essentials.fly$1900000000")],
        };
        storage.save_user(&data).await.unwrap();

        let mut loaded = storage.load_user(uuid).await.unwrap().unwrap();
        loaded.nodes.sort_by_key(|n| n.to_string());
        data.nodes.sort_by_key(|n| n.to_string());
        assert_eq!(loaded, data);

        // saving again replaces the node set
        data.nodes = vec![node("group.default")];
        storage.save_user(&data).await.unwrap();
        let loaded = storage.load_user(uuid).await.unwrap().unwrap();
        assert_eq!(loaded.nodes, vec![node("group.default")]);
        assert_eq!(storage.list_user_keys().await.unwrap(), vec![uuid]);
    }

    #[tokio::test]
    async fn test_malformed_node_rows_are_skipped() {
        let storage = SqliteStorage::new(None).await.unwrap();
        storage
            .save_group(&GroupData {
                name: "admin".into(),
                nodes: vec![node("a.b")],
            })
            .await
            .unwrap();
        sqlx::query("INSERT INTO group_nodes (name, node) VALUES ('admin', 'bad node')")
            .execute(storage.pool())
            .await
            .unwrap();

        let group = storage.load_group("admin").await.unwrap().unwrap();
        assert_eq!(group.nodes, vec![node("a.b")]);
    }

    #[tokio::test]
    async fn test_groups_and_tracks() {
        let storage = SqliteStorage::new(None).await.unwrap();
        for name in ["default", "admin"] {
            storage
                .save_group(&GroupData {
                    name: name.into(),
                    nodes: vec![],
                })
                .await
                .unwrap();
        }
        storage.delete_group("ADMIN").await.unwrap();
        let names: Vec<String> = storage
            .load_all_groups()
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["default"]);

        let track = TrackData {
            name: "staff".into(),
            groups: vec!["default".into(), "mod".into()],
        };
        storage.save_track(&track).await.unwrap();
        assert_eq!(storage.load_all_tracks().await.unwrap(), vec![track]);
        storage.delete_track("staff").await.unwrap();
        assert!(storage.load_all_tracks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perms.db");
        let path = path.to_str().unwrap();
        let uuid = Uuid::new_v4();

        {
            let storage = SqliteStorage::new(Some(path)).await.unwrap();
            storage.save_uuid_data("Alice", uuid).await.unwrap();
        }

        let storage = SqliteStorage::new(Some(path)).await.unwrap();
        assert_eq!(storage.get_uuid("alice").await.unwrap(), Some(uuid));
    }
}
