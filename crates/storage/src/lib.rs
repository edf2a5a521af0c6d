use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::domain::{ConversationId, UserId};

const KEY_PROFILE: &str = "profile_snapshot";
const KEY_ACTIVE_CONVERSATION: &str = "active_conversation";
const KEY_THEME: &str = "theme_preference";

/// Persisted local state that survives a reload: the last-known identity
/// snapshot, the last active conversation, and the theme preference. Read
/// once at startup, written on change.
#[derive(Clone)]
pub struct LocalStore {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub user_id: UserId,
    pub username: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThemePreference {
    Light,
    Dark,
    #[default]
    System,
}

impl LocalStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let store = Self { pool };
        store.ensure_kv_table().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_kv_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_kv (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure local_kv table exists")?;
        Ok(())
    }

    async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)
            .with_context(|| format!("failed to encode value for key {key}"))?;
        sqlx::query(
            "INSERT INTO local_kv (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
        )
        .bind(key)
        .bind(encoded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let row = sqlx::query("SELECT value FROM local_kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.get(0);
        let decoded = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt persisted value for key {key}"))?;
        Ok(Some(decoded))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM local_kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_profile(&self, profile: &ProfileSnapshot) -> Result<()> {
        self.put(KEY_PROFILE, profile).await
    }

    pub async fn load_profile(&self) -> Result<Option<ProfileSnapshot>> {
        self.get(KEY_PROFILE).await
    }

    pub async fn clear_profile(&self) -> Result<()> {
        self.remove(KEY_PROFILE).await
    }

    pub async fn save_active_conversation(&self, conversation: ConversationId) -> Result<()> {
        self.put(KEY_ACTIVE_CONVERSATION, &conversation).await
    }

    pub async fn load_active_conversation(&self) -> Result<Option<ConversationId>> {
        self.get(KEY_ACTIVE_CONVERSATION).await
    }

    pub async fn save_theme(&self, theme: ThemePreference) -> Result<()> {
        self.put(KEY_THEME, &theme).await
    }

    pub async fn load_theme(&self) -> Result<ThemePreference> {
        Ok(self.get(KEY_THEME).await?.unwrap_or_default())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create sqlite parent dir {}", parent.display()))?;
    }
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
