//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Timestamps are
//! stored as RFC 3339 strings.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use gantry_types::{ContainerMetadata, ContainerOwner, Version};

use crate::backend::{
    BuildArtifactRow, CheckableKind, ContainerRow, LastCheck, ResourceCacheDescriptor,
    ResourceCacheRow, StateBackend,
};
use crate::error::{self, StateError};

/// Check locks older than this are considered abandoned by a dead
/// holder and are swept before acquisition. Lock hold time is bounded
/// by the check process timeout, which is far below this.
const CHECK_LOCK_TTL: Duration = Duration::from_secs(3600);

/// Idempotent DDL for core tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS containers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_key TEXT NOT NULL,
    worker TEXT NOT NULL,
    handle TEXT NOT NULL UNIQUE,
    metadata_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (owner_key, worker)
);

CREATE TABLE IF NOT EXISTS resource_caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cache_key TEXT NOT NULL,
    build_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (cache_key, build_id)
);

CREATE TABLE IF NOT EXISTS volumes (
    handle TEXT PRIMARY KEY,
    worker TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS resource_config_scopes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    config_key TEXT NOT NULL,
    resource TEXT NOT NULL DEFAULT '',
    UNIQUE (config_key, resource)
);

CREATE TABLE IF NOT EXISTS last_checks (
    scope_id INTEGER PRIMARY KEY REFERENCES resource_config_scopes(id),
    succeeded INTEGER NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS check_locks (
    scope_id INTEGER PRIMARY KEY REFERENCES resource_config_scopes(id),
    acquired_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scope_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scope_id INTEGER NOT NULL REFERENCES resource_config_scopes(id),
    version_json TEXT NOT NULL,
    UNIQUE (scope_id, version_json)
);

CREATE TABLE IF NOT EXISTS checkables (
    pipeline_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    scope_id INTEGER NOT NULL REFERENCES resource_config_scopes(id),
    PRIMARY KEY (pipeline_id, kind, name)
);

CREATE TABLE IF NOT EXISTS pipelines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team TEXT NOT NULL,
    name TEXT NOT NULL,
    config_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (team, name)
);

CREATE TABLE IF NOT EXISTS resource_versions (
    pipeline_id INTEGER NOT NULL,
    resource TEXT NOT NULL,
    version_json TEXT NOT NULL,
    PRIMARY KEY (pipeline_id, resource)
);

CREATE TABLE IF NOT EXISTS build_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    build_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    worker TEXT NOT NULL,
    volume_handle TEXT NOT NULL
);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created, or
    /// [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn parse_time(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl StateBackend for SqliteStateBackend {
    fn find_or_create_container(
        &self,
        owner: &ContainerOwner,
        worker: &str,
        metadata: &ContainerMetadata,
    ) -> error::Result<ContainerRow> {
        let conn = self.lock_conn()?;
        let handle = Uuid::new_v4().to_string();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO containers (owner_key, worker, handle, metadata_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                owner.key(),
                worker,
                handle,
                serde_json::to_string(metadata)?,
                Utc::now().to_rfc3339(),
            ],
        )?;

        let (id, handle) = conn.query_row(
            "SELECT id, handle FROM containers WHERE owner_key = ?1 AND worker = ?2",
            rusqlite::params![owner.key(), worker],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(ContainerRow {
            id,
            handle,
            created: inserted > 0,
        })
    }

    fn find_or_create_resource_cache(
        &self,
        build_id: i64,
        descriptor: &ResourceCacheDescriptor,
    ) -> error::Result<ResourceCacheRow> {
        let key = descriptor.key();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO resource_caches (cache_key, build_id, created_at) \
             VALUES (?1, ?2, ?3)",
            rusqlite::params![key, build_id, Utc::now().to_rfc3339()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM resource_caches WHERE cache_key = ?1 AND build_id = ?2",
            rusqlite::params![key, build_id],
            |row| row.get(0),
        )?;
        Ok(ResourceCacheRow { id, key })
    }

    fn record_volume(&self, handle: &str, worker: &str) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO volumes (handle, worker, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![handle, worker, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn volume_worker(&self, handle: &str) -> error::Result<Option<String>> {
        let conn = self.lock_conn()?;
        let worker = conn
            .query_row(
                "SELECT worker FROM volumes WHERE handle = ?1",
                [handle],
                |row| row.get(0),
            )
            .optional()?;
        Ok(worker)
    }

    fn find_or_create_scope(
        &self,
        config_key: &str,
        resource: Option<&str>,
    ) -> error::Result<i64> {
        let resource = resource.unwrap_or("");
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO resource_config_scopes (config_key, resource) VALUES (?1, ?2)",
            rusqlite::params![config_key, resource],
        )?;
        let id = conn.query_row(
            "SELECT id FROM resource_config_scopes WHERE config_key = ?1 AND resource = ?2",
            rusqlite::params![config_key, resource],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn last_check(&self, scope_id: i64) -> error::Result<LastCheck> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT succeeded, start_time, end_time FROM last_checks WHERE scope_id = ?1",
                [scope_id],
                |row| {
                    let succeeded: i64 = row.get(0)?;
                    let start: String = row.get(1)?;
                    let end: String = row.get(2)?;
                    Ok((succeeded != 0, start, end))
                },
            )
            .optional()?;

        Ok(row.map_or_else(LastCheck::default, |(succeeded, start, end)| LastCheck {
            succeeded,
            start_time: Self::parse_time(&start),
            end_time: Self::parse_time(&end),
        }))
    }

    fn update_last_check(
        &self,
        scope_id: i64,
        succeeded: bool,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO last_checks (scope_id, succeeded, start_time, end_time) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(scope_id) \
             DO UPDATE SET succeeded = ?2, start_time = ?3, end_time = ?4",
            rusqlite::params![
                scope_id,
                i64::from(succeeded),
                start.to_rfc3339(),
                end.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn try_acquire_check_lock(&self, scope_id: i64) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let stale_cutoff = Utc::now()
            - chrono::Duration::from_std(CHECK_LOCK_TTL).unwrap_or(chrono::Duration::zero());
        conn.execute(
            "DELETE FROM check_locks WHERE scope_id = ?1 AND acquired_at < ?2",
            rusqlite::params![scope_id, stale_cutoff.to_rfc3339()],
        )?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO check_locks (scope_id, acquired_at) VALUES (?1, ?2)",
            rusqlite::params![scope_id, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    fn release_check_lock(&self, scope_id: i64) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM check_locks WHERE scope_id = ?1", [scope_id])?;
        Ok(())
    }

    fn save_versions(&self, scope_id: i64, versions: &[Version]) -> error::Result<()> {
        if versions.is_empty() {
            return Ok(());
        }
        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO scope_versions (scope_id, version_json) VALUES (?1, ?2)",
            )?;
            for version in versions {
                stmt.execute(rusqlite::params![
                    scope_id,
                    serde_json::to_string(version)?
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn latest_version(&self, scope_id: i64) -> error::Result<Option<Version>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT version_json FROM scope_versions \
                 WHERE scope_id = ?1 ORDER BY id DESC LIMIT 1",
                [scope_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| serde_json::from_str(&json).map_err(StateError::from))
            .transpose()
    }

    fn set_checkable_scope(
        &self,
        pipeline_id: i64,
        kind: CheckableKind,
        name: &str,
        scope_id: i64,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO checkables (pipeline_id, kind, name, scope_id) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(pipeline_id, kind, name) DO UPDATE SET scope_id = ?4",
            rusqlite::params![pipeline_id, kind.as_str(), name, scope_id],
        )?;
        Ok(())
    }

    fn checkable_scope(
        &self,
        pipeline_id: i64,
        kind: CheckableKind,
        name: &str,
    ) -> error::Result<Option<i64>> {
        let conn = self.lock_conn()?;
        let id = conn
            .query_row(
                "SELECT scope_id FROM checkables \
                 WHERE pipeline_id = ?1 AND kind = ?2 AND name = ?3",
                rusqlite::params![pipeline_id, kind.as_str(), name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn save_pipeline(
        &self,
        team: &str,
        name: &str,
        config: &serde_json::Value,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO pipelines (team, name, config_json, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(team, name) DO UPDATE SET config_json = ?3, updated_at = ?4",
            rusqlite::params![team, name, config.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn resource_version(
        &self,
        pipeline_id: i64,
        resource: &str,
    ) -> error::Result<Option<Version>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT version_json FROM resource_versions \
                 WHERE pipeline_id = ?1 AND resource = ?2",
                rusqlite::params![pipeline_id, resource],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| serde_json::from_str(&json).map_err(StateError::from))
            .transpose()
    }

    fn update_resource_version(
        &self,
        pipeline_id: i64,
        resource: &str,
        version: &Version,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO resource_versions (pipeline_id, resource, version_json) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(pipeline_id, resource) DO UPDATE SET version_json = ?3",
            rusqlite::params![pipeline_id, resource, serde_json::to_string(version)?],
        )?;
        Ok(())
    }

    fn create_build_artifact(
        &self,
        build_id: i64,
        name: &str,
        worker: &str,
        volume_handle: &str,
    ) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO build_artifacts (build_id, name, worker, volume_handle) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![build_id, name, worker, volume_handle],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn build_artifact(&self, artifact_id: i64) -> error::Result<Option<BuildArtifactRow>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT id, build_id, name, worker, volume_handle \
                 FROM build_artifacts WHERE id = ?1",
                [artifact_id],
                |row| {
                    Ok(BuildArtifactRow {
                        id: row.get(0)?,
                        build_id: row.get(1)?,
                        name: row.get(2)?,
                        worker: row.get(3)?,
                        volume_handle: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}
