use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, SqlitePool,
};

use crate::config::SourceConfig;
use crate::parser::NormalizedEntry;

/// Stored owner key for the shared scope. SQLite treats NULLs as distinct in
/// UNIQUE constraints, so the shared scope needs a concrete value.
const SHARED_OWNER_KEY: &str = "";

/// The namespace a source or entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerScope {
    /// Visible to every user; synced by the system.
    Shared,
    User(String),
}

impl OwnerScope {
    pub fn user(id: impl Into<String>) -> Self {
        OwnerScope::User(id.into())
    }

    pub fn key(&self) -> &str {
        match self {
            OwnerScope::Shared => SHARED_OWNER_KEY,
            OwnerScope::User(id) => id,
        }
    }

    pub fn from_key(key: &str) -> Self {
        if key == SHARED_OWNER_KEY {
            OwnerScope::Shared
        } else {
            OwnerScope::User(key.to_string())
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, OwnerScope::Shared)
    }
}

impl fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerScope::Shared => write!(f, "shared"),
            OwnerScope::User(id) => write!(f, "user:{}", id),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Source {
    pub id: i64,
    /// Serialized as `shared: bool`; shared sources are read-only to users
    #[serde(rename = "shared", serialize_with = "serialize_shared_owner")]
    pub owner: String,
    pub name: String,
    pub handle: String,
    pub url: String,
    pub avatar_url: Option<String>,
    pub is_active: bool,
    pub is_system: bool,
}

impl Source {
    pub fn scope(&self) -> OwnerScope {
        OwnerScope::from_key(&self.owner)
    }
}

fn serialize_shared_owner<S: Serializer>(owner: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_bool(OwnerScope::from_key(owner).is_shared())
}

#[derive(Debug, Clone, FromRow)]
pub struct Entry {
    pub id: i64,
    pub source_id: i64,
    pub owner: String,
    pub title: String,
    pub content_raw: String,
    pub content_translated: Option<String>,
    pub url: String,
    /// Unix milliseconds
    pub published_at: i64,
    pub is_read: bool,
    pub is_favorite: bool,
}

impl Entry {
    pub fn published(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.published_at).single()
    }
}

/// What a subscribe action supplies for a new source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub name: String,
    pub url: String,
    pub handle: String,
    pub avatar_url: Option<String>,
    pub is_system: bool,
}

impl SourceSpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            handle: default_handle(&name),
            name,
            url: url.into(),
            avatar_url: None,
            is_system: false,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = handle.into();
        self
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}

impl From<&SourceConfig> for SourceSpec {
    fn from(config: &SourceConfig) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            handle: config
                .handle
                .clone()
                .unwrap_or_else(|| default_handle(&config.name)),
            avatar_url: config.avatar_url.clone(),
            is_system: true,
        }
    }
}

/// Lowercased name with whitespace runs collapsed to underscores.
pub fn default_handle(name: &str) -> String {
    name.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryFilter {
    #[default]
    All,
    Unread,
    Favorite,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                handle TEXT NOT NULL,
                url TEXT NOT NULL,
                avatar_url TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_system INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(owner, url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                owner TEXT NOT NULL,
                title TEXT NOT NULL,
                content_raw TEXT NOT NULL,
                content_translated TEXT,
                url TEXT NOT NULL,
                published_at INTEGER NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(owner, url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entries_source_published
            ON entries(source_id, published_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entries_owner_published
            ON entries(owner, published_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a source, or update and reactivate the existing row for the
    /// same (owner, url).
    pub async fn upsert_source(
        &self,
        scope: &OwnerScope,
        spec: &SourceSpec,
    ) -> anyhow::Result<Source> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO sources (owner, name, handle, url, avatar_url, is_active, is_system, created_at)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(owner, url) DO UPDATE SET
                name = excluded.name,
                handle = excluded.handle,
                avatar_url = COALESCE(excluded.avatar_url, sources.avatar_url),
                is_active = 1
            "#,
        )
        .bind(scope.key())
        .bind(&spec.name)
        .bind(&spec.handle)
        .bind(&spec.url)
        .bind(&spec.avatar_url)
        .bind(spec.is_system)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.source_by_url(scope, &spec.url).await
    }

    /// Insert a seed source if missing. Existing rows get the seed's display
    /// fields but keep their active flag.
    pub async fn seed_source(&self, scope: &OwnerScope, spec: &SourceSpec) -> anyhow::Result<Source> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO sources (owner, name, handle, url, avatar_url, is_active, is_system, created_at)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(owner, url) DO UPDATE SET
                name = excluded.name,
                handle = excluded.handle,
                avatar_url = COALESCE(excluded.avatar_url, sources.avatar_url),
                is_system = excluded.is_system
            "#,
        )
        .bind(scope.key())
        .bind(&spec.name)
        .bind(&spec.handle)
        .bind(&spec.url)
        .bind(&spec.avatar_url)
        .bind(spec.is_system)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.source_by_url(scope, &spec.url).await
    }

    async fn source_by_url(&self, scope: &OwnerScope, url: &str) -> anyhow::Result<Source> {
        let source = sqlx::query_as::<_, Source>(
            r#"
            SELECT id, owner, name, handle, url, avatar_url, is_active, is_system
            FROM sources WHERE owner = ? AND url = ?
            "#,
        )
        .bind(scope.key())
        .bind(url)
        .fetch_one(&self.pool)
        .await?;
        Ok(source)
    }

    pub async fn get_source(
        &self,
        scope: &OwnerScope,
        source_id: i64,
    ) -> anyhow::Result<Option<Source>> {
        let source = sqlx::query_as::<_, Source>(
            r#"
            SELECT id, owner, name, handle, url, avatar_url, is_active, is_system
            FROM sources WHERE owner = ? AND id = ?
            "#,
        )
        .bind(scope.key())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(source)
    }

    pub async fn list_sources(
        &self,
        scope: &OwnerScope,
        only_active: bool,
    ) -> anyhow::Result<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>(
            r#"
            SELECT id, owner, name, handle, url, avatar_url, is_active, is_system
            FROM sources
            WHERE owner = ? AND (is_active = 1 OR ? = 0)
            ORDER BY id
            "#,
        )
        .bind(scope.key())
        .bind(only_active)
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    /// Sources a scope can read: its own plus the shared ones.
    pub async fn list_visible_sources(
        &self,
        scope: &OwnerScope,
        only_active: bool,
    ) -> anyhow::Result<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>(
            r#"
            SELECT id, owner, name, handle, url, avatar_url, is_active, is_system
            FROM sources
            WHERE owner IN (?, ?) AND (is_active = 1 OR ? = 0)
            ORDER BY owner = ? DESC, id
            "#,
        )
        .bind(scope.key())
        .bind(SHARED_OWNER_KEY)
        .bind(only_active)
        .bind(SHARED_OWNER_KEY)
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    pub async fn count_sources(&self, scope: &OwnerScope) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sources WHERE owner = ?")
            .bind(scope.key())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// Returns false when no source with that id exists in the scope.
    pub async fn set_source_active(
        &self,
        scope: &OwnerScope,
        source_id: i64,
        active: bool,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE sources SET is_active = ? WHERE owner = ? AND id = ?")
            .bind(active)
            .bind(scope.key())
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes the source; its entries go with it via the cascade.
    pub async fn delete_source(&self, scope: &OwnerScope, source_id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM sources WHERE owner = ? AND id = ?")
            .bind(scope.key())
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Latest stored publish time for a source, in unix milliseconds.
    pub async fn source_watermark(&self, source_id: i64) -> anyhow::Result<Option<i64>> {
        let watermark: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(published_at) FROM entries WHERE source_id = ?")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(watermark.0)
    }

    /// Insert-or-skip keyed on (owner, url). Existing rows are never touched,
    /// and a conflict is reported as `false` rather than an error.
    pub async fn insert_entry_if_absent(
        &self,
        scope: &OwnerScope,
        source_id: i64,
        entry: &NormalizedEntry,
    ) -> anyhow::Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO entries (source_id, owner, title, content_raw, url, published_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner, url) DO NOTHING
            "#,
        )
        .bind(source_id)
        .bind(scope.key())
        .bind(&entry.title)
        .bind(&entry.body)
        .bind(&entry.canonical_url)
        .bind(entry.published_at.timestamp_millis())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Looks the entry up among those `scope` can read, shared ones included.
    pub async fn get_entry(&self, scope: &OwnerScope, entry_id: i64) -> anyhow::Result<Option<Entry>> {
        let entry = sqlx::query_as::<_, Entry>(
            r#"
            SELECT id, source_id, owner, title, content_raw, content_translated, url,
                   published_at, is_read, is_favorite
            FROM entries WHERE owner IN (?, ?) AND id = ?
            "#,
        )
        .bind(scope.key())
        .bind(SHARED_OWNER_KEY)
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Entries `scope` can read, its own and the shared scope's, newest first.
    pub async fn list_entries(
        &self,
        scope: &OwnerScope,
        filter: EntryFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<Entry>> {
        let condition = match filter {
            EntryFilter::All => "",
            EntryFilter::Unread => "AND is_read = 0",
            EntryFilter::Favorite => "AND is_favorite = 1",
        };
        let query = format!(
            r#"
            SELECT id, source_id, owner, title, content_raw, content_translated, url,
                   published_at, is_read, is_favorite
            FROM entries
            WHERE owner IN (?, ?) {}
            ORDER BY published_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
            condition
        );
        let entries = sqlx::query_as::<_, Entry>(&query)
            .bind(scope.key())
            .bind(SHARED_OWNER_KEY)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    pub async fn count_entries(&self, scope: &OwnerScope) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries WHERE owner = ?")
            .bind(scope.key())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    pub async fn count_entries_for_source(&self, source_id: i64) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// Stores a translation unless one is already present.
    pub async fn set_translation(&self, entry_id: i64, text: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE entries SET content_translated = ? WHERE id = ? AND content_translated IS NULL",
        )
        .bind(text)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
