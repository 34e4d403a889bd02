use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::places::PlaceRecord;
use crate::tasks::SearchTask;

pub const PLACES_TABLE: &str = "places";
pub const PENDING_TASKS_TABLE: &str = "pending_tasks";
pub const COMPLETED_TASKS_TABLE: &str = "completed_tasks";
pub const SESSION_TABLES: [&str; 3] = [PLACES_TABLE, PENDING_TASKS_TABLE, COMPLETED_TASKS_TABLE];

/// Which bookkeeping table a task row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTable {
    Pending,
    Completed,
}

impl TaskTable {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => PENDING_TASKS_TABLE,
            Self::Completed => COMPLETED_TASKS_TABLE,
        }
    }
}

/// Durable session state. Writes go into a lazily opened transaction that
/// stays open until [`SessionStore::commit`].
pub struct SessionStore {
    connection: Connection,
    path: PathBuf,
}

impl SessionStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let connection = Connection::open_with_flags(path, flags)?;
        apply_pragmas(&connection)?;
        info!(
            target: "database_bootstrap",
            path = %path.display(),
            "session store opened"
        );
        Ok(Self {
            connection,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure_schema(&self) -> AppResult<()> {
        run_migrations(&self.connection)
    }

    pub fn existing_tables(&self) -> AppResult<HashSet<String>> {
        let mut stmt = self
            .connection
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(names)
    }

    /// Inserts places, skipping identifiers already stored. Returns the number
    /// of rows actually written.
    pub fn insert_places(&self, places: &[Arc<PlaceRecord>]) -> AppResult<usize> {
        if places.is_empty() {
            return Ok(0);
        }
        self.begin_if_needed()?;
        let obtained_at = Utc::now().to_rfc3339();
        let mut stmt = self.connection.prepare_cached(
            "INSERT OR IGNORE INTO places (
                place_id, api_id, lon, lat, name, rating, scope, user_ratings_total,
                vicinity, types, price_level, business_status, raw_json, obtained_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )?;
        let mut written = 0;
        for place in places {
            let raw_json = serde_json::to_string(place.raw())?;
            written += stmt.execute(params![
                place.place_id(),
                place.api_id(),
                place.lon(),
                place.lat(),
                place.name(),
                place.rating(),
                place.scope(),
                i64::try_from(place.user_ratings_total()).unwrap_or(i64::MAX),
                place.vicinity(),
                place.types(),
                place.price_level(),
                place.business_status(),
                raw_json,
                obtained_at,
            ])?;
        }
        Ok(written)
    }

    pub fn insert_tasks(&self, table: TaskTable, tasks: &[SearchTask]) -> AppResult<usize> {
        if tasks.is_empty() {
            return Ok(0);
        }
        self.begin_if_needed()?;
        let recorded_at = Utc::now().to_rfc3339();
        let sql = format!(
            "INSERT OR IGNORE INTO {} (task_id, lon, lat, radius, place_type, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            table.name()
        );
        let mut stmt = self.connection.prepare_cached(&sql)?;
        let mut written = 0;
        for task in tasks {
            written += stmt.execute(params![
                task.task_id,
                task.lon,
                task.lat,
                task.radius,
                task.place_type,
                recorded_at,
            ])?;
        }
        Ok(written)
    }

    pub fn in_transaction(&self) -> bool {
        !self.connection.is_autocommit()
    }

    /// Commits the open transaction, if any.
    pub fn commit(&self) -> AppResult<bool> {
        if !self.in_transaction() {
            return Ok(false);
        }
        self.connection.execute_batch("COMMIT")?;
        Ok(true)
    }

    /// Pending tasks with no completion record, identifiers preserved.
    pub fn unfinished_tasks(&self) -> AppResult<Vec<SearchTask>> {
        let mut stmt = self.connection.prepare(
            "SELECT p.task_id, p.lon, p.lat, p.radius, p.place_type
             FROM pending_tasks p
             LEFT JOIN completed_tasks c ON c.task_id = p.task_id
             WHERE c.task_id IS NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(task_id, lon, lat, radius, place_type)| {
                SearchTask::with_id(task_id, lon, lat, radius, place_type)
            })
            .collect()
    }

    pub fn unfinished_count(&self) -> AppResult<u64> {
        let count: i64 = self.connection.query_row(
            "SELECT COUNT(*) FROM pending_tasks p
             WHERE NOT EXISTS (SELECT 1 FROM completed_tasks c WHERE c.task_id = p.task_id)",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn known_place_ids(&self) -> AppResult<HashSet<String>> {
        self.string_column("SELECT place_id FROM places")
    }

    pub fn completed_task_ids(&self) -> AppResult<HashSet<String>> {
        self.string_column("SELECT task_id FROM completed_tasks")
    }

    pub fn place_count(&self) -> AppResult<u64> {
        let count: i64 = self
            .connection
            .query_row("SELECT COUNT(*) FROM places", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Drops the pending and completed bookkeeping tables.
    pub fn drop_session_tables(&self) -> AppResult<()> {
        self.commit()?;
        self.connection.execute_batch(
            "DROP TABLE IF EXISTS pending_tasks;
             DROP TABLE IF EXISTS completed_tasks;",
        )?;
        Ok(())
    }

    pub fn close(self) -> AppResult<()> {
        self.commit()?;
        let path = self.path.clone();
        self.connection
            .close()
            .map_err(|(_, err)| AppError::Database(err))?;
        info!(
            target: "database_bootstrap",
            path = %path.display(),
            "session store closed"
        );
        Ok(())
    }

    fn begin_if_needed(&self) -> AppResult<()> {
        if !self.in_transaction() {
            self.connection.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(())
    }

    fn string_column(&self, sql: &str) -> AppResult<HashSet<String>> {
        let mut stmt = self.connection.prepare(sql)?;
        let values = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(values)
    }
}

fn apply_pragmas(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS places (
            place_id TEXT PRIMARY KEY,
            api_id TEXT NOT NULL,
            lon REAL NOT NULL,
            lat REAL NOT NULL,
            name TEXT NOT NULL,
            rating REAL,
            scope TEXT NOT NULL,
            user_ratings_total INTEGER NOT NULL DEFAULT 0,
            vicinity TEXT NOT NULL,
            types TEXT NOT NULL,
            price_level INTEGER,
            business_status TEXT NOT NULL,
            raw_json TEXT NOT NULL,
            obtained_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_tasks (
            task_id TEXT PRIMARY KEY,
            lon REAL NOT NULL,
            lat REAL NOT NULL,
            radius REAL NOT NULL,
            place_type TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS completed_tasks (
            task_id TEXT PRIMARY KEY,
            lon REAL NOT NULL,
            lat REAL NOT NULL,
            radius REAL NOT NULL,
            place_type TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_places_lat_lon ON places(lat, lon);
        "#,
    )?;
    Ok(())
}
