//! Local (single-process) Persistence Handle: SQLite via `rusqlite` +
//! `r2d2`, grounded on `backup-server-rs/src/db/{connection,migrate}.rs`
//! (pool + idempotent schema) and `backup-server-rs/src/models/
//! backup_job.rs` (dynamic partial-update SET-clause builder).
//!
//! Uses `WAL` journal mode rather than the teacher's `DELETE` mode: this
//! workload has many concurrent Worker tasks reading/writing one file
//! (DESIGN.md DR-8).

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, types::ToSql, Row};

use crate::error::{EngineError, Result};
use crate::model::{CompletedLog, RemoteItem, Worker, WorkerKind, WorkerStatus};

use super::{FieldValue, PersistenceHandle};

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workers (
    id              TEXT PRIMARY KEY,
    group_name      TEXT NOT NULL,
    kind            TEXT NOT NULL CHECK(kind IN ('copy','delete')),
    source_uri      TEXT,
    target_uri      TEXT NOT NULL,
    backup_uri      TEXT,
    need_backup     INTEGER NOT NULL,
    status          TEXT NOT NULL,
    error           TEXT,
    source_size     INTEGER NOT NULL,
    source_mtime_ms INTEGER NOT NULL,
    created_at      INTEGER NOT NULL,
    done_at         INTEGER,
    owner           TEXT NOT NULL,
    temp_path       TEXT,
    upload_task_id  TEXT
);

CREATE TABLE IF NOT EXISTS completed_log (
    worker_id        TEXT NOT NULL,
    done_at          INTEGER NOT NULL,
    transferred_size INTEGER NOT NULL,
    duration_ms      INTEGER NOT NULL,
    worker_json      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_completed_log_done_at ON completed_log(done_at);

CREATE TABLE IF NOT EXISTS items (
    uri          TEXT PRIMARY KEY,
    parent       TEXT NOT NULL,
    size         INTEGER NOT NULL,
    mtime        INTEGER NOT NULL,
    is_dir       INTEGER NOT NULL,
    content_hash TEXT
);
"#;

pub fn create_pool(db_path: &Path) -> Result<DbPool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )
    });
    let pool = r2d2::Pool::builder()
        .max_size(8)
        .build(manager)
        .map_err(|e| EngineError::Persistence(e.to_string()))?;
    Ok(pool)
}

pub fn migrate(pool: &DbPool) -> Result<()> {
    let conn = pool.get().map_err(|e| EngineError::Persistence(e.to_string()))?;
    conn.execute_batch(SCHEMA)
        .map_err(|e| EngineError::Persistence(e.to_string()))
}

pub struct LocalStore {
    pool: DbPool,
}

impl LocalStore {
    pub fn new(pool: DbPool) -> Self {
        LocalStore { pool }
    }

    pub fn open(db_path: &Path) -> Result<Self> {
        let pool = create_pool(db_path)?;
        migrate(&pool)?;
        Ok(LocalStore::new(pool))
    }
}

fn row_to_worker(row: &Row) -> rusqlite::Result<Worker> {
    let kind_str: String = row.get("kind")?;
    let status_str: String = row.get("status")?;
    Ok(Worker {
        id: row.get("id")?,
        group: row.get("group_name")?,
        kind: parse_kind(&kind_str),
        source_uri: row.get("source_uri")?,
        target_uri: row.get("target_uri")?,
        backup_uri: row.get("backup_uri")?,
        need_backup: row.get::<_, i64>("need_backup")? != 0,
        status: parse_status(&status_str),
        error: row.get("error")?,
        source_size: row.get::<_, i64>("source_size")? as u64,
        source_mtime_ms: row.get("source_mtime_ms")?,
        created_at: row.get("created_at")?,
        done_at: row.get("done_at")?,
        owner: row.get("owner")?,
        temp_path: row.get("temp_path")?,
        upload_task_id: row.get("upload_task_id")?,
    })
}

fn parse_kind(s: &str) -> WorkerKind {
    match s {
        "delete" => WorkerKind::Delete,
        _ => WorkerKind::Copy,
    }
}

fn parse_status(s: &str) -> WorkerStatus {
    match s {
        "back-upped" => WorkerStatus::BackedUp,
        "downloaded" => WorkerStatus::Downloaded,
        "uploaded" => WorkerStatus::Uploaded,
        "copied" => WorkerStatus::Copied,
        "deleted" => WorkerStatus::Deleted,
        "done" => WorkerStatus::Done,
        "failed" => WorkerStatus::Failed,
        _ => WorkerStatus::Init,
    }
}

fn kind_str(k: WorkerKind) -> &'static str {
    match k {
        WorkerKind::Copy => "copy",
        WorkerKind::Delete => "delete",
    }
}

#[async_trait]
impl PersistenceHandle for LocalStore {
    async fn upsert_worker(&self, w: &Worker) -> Result<()> {
        let pool = self.pool.clone();
        let w = w.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::Persistence(e.to_string()))?;
            conn.execute(
                "INSERT INTO workers (id, group_name, kind, source_uri, target_uri, backup_uri,
                    need_backup, status, error, source_size, source_mtime_ms, created_at,
                    done_at, owner, temp_path, upload_task_id)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
                 ON CONFLICT(id) DO UPDATE SET
                    status=excluded.status, error=excluded.error, done_at=excluded.done_at,
                    temp_path=excluded.temp_path, upload_task_id=excluded.upload_task_id",
                params![
                    w.id,
                    w.group,
                    kind_str(w.kind),
                    w.source_uri,
                    w.target_uri,
                    w.backup_uri,
                    w.need_backup as i64,
                    w.status.as_str(),
                    w.error,
                    w.source_size as i64,
                    w.source_mtime_ms,
                    w.created_at,
                    w.done_at,
                    w.owner,
                    w.temp_path,
                    w.upload_task_id,
                ],
            )
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?
    }

    async fn update_worker(&self, id: &str, fields: &[(&str, FieldValue)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        const ALLOWED: &[&str] = &[
            "status",
            "error",
            "done_at",
            "temp_path",
            "upload_task_id",
            "backup_uri",
        ];
        for (name, _) in fields {
            if !ALLOWED.contains(name) {
                return Err(EngineError::Persistence(format!(
                    "update_worker: field not allowed: {name}"
                )));
            }
        }
        let pool = self.pool.clone();
        let id = id.to_string();
        let fields: Vec<(String, FieldValue)> =
            fields.iter().map(|(n, v)| (n.to_string(), v.clone())).collect();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::Persistence(e.to_string()))?;
            let set_clause = fields
                .iter()
                .enumerate()
                .map(|(i, (name, _))| format!("{name} = ?{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let mut values: Vec<Box<dyn ToSql>> = fields
                .iter()
                .map(|(_, v)| field_value_to_sql(v))
                .collect();
            values.push(Box::new(id));
            let sql = format!("UPDATE workers SET {set_clause} WHERE id = ?{}", values.len());
            let params: Vec<&dyn ToSql> = values.iter().map(|b| b.as_ref()).collect();
            conn.execute(&sql, params.as_slice())
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?
    }

    async fn delete_worker(&self, id: &str) -> Result<()> {
        let pool = self.pool.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::Persistence(e.to_string()))?;
            conn.execute("DELETE FROM workers WHERE id = ?1", params![id])
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?
    }

    async fn get_workers(&self) -> Result<Vec<Worker>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::Persistence(e.to_string()))?;
            let mut stmt = conn
                .prepare("SELECT * FROM workers")
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            let rows = stmt
                .query_map([], row_to_worker)
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(|e| EngineError::Persistence(e.to_string()))?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::Persistence(e.to_string()))?;
            conn.query_row("SELECT * FROM workers WHERE id = ?1", params![id], row_to_worker)
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    e => Err(EngineError::Persistence(e.to_string())),
                })
        })
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?
    }

    async fn append_log(&self, log: &CompletedLog) -> Result<()> {
        let pool = self.pool.clone();
        let log = log.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::Persistence(e.to_string()))?;
            let worker_json = serde_json::to_string(&log.worker)
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            conn.execute(
                "INSERT INTO completed_log (worker_id, done_at, transferred_size, duration_ms, worker_json)
                 VALUES (?1,?2,?3,?4,?5)",
                params![log.worker.id, log.done_at, log.transferred_size as i64, log.duration_ms, worker_json],
            )
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?
    }

    async fn prune_completed_log(&self, retention_days: u32) -> Result<()> {
        let pool = self.pool.clone();
        let cutoff = chrono::Utc::now().timestamp() - (retention_days as i64) * 86_400;
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::Persistence(e.to_string()))?;
            conn.execute("DELETE FROM completed_log WHERE done_at < ?1", params![cutoff])
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?
    }

    async fn upsert_item(&self, uri: &str, item: &RemoteItem) -> Result<()> {
        let pool = self.pool.clone();
        let uri = uri.to_string();
        let item = item.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::Persistence(e.to_string()))?;
            conn.execute(
                "INSERT INTO items (uri, parent, size, mtime, is_dir, content_hash)
                 VALUES (?1,?2,?3,?4,?5,?6)
                 ON CONFLICT(uri) DO UPDATE SET
                    parent=excluded.parent, size=excluded.size, mtime=excluded.mtime,
                    is_dir=excluded.is_dir, content_hash=excluded.content_hash",
                params![uri, item.parent, item.size as i64, item.mtime, item.is_dir as i64, item.content_hash],
            )
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?
    }

    async fn get_item(&self, uri: &str) -> Result<Option<RemoteItem>> {
        let pool = self.pool.clone();
        let uri = uri.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| EngineError::Persistence(e.to_string()))?;
            conn.query_row(
                "SELECT uri, parent, size, mtime, is_dir, content_hash FROM items WHERE uri = ?1",
                params![uri],
                |row| {
                    Ok(RemoteItem {
                        uri: row.get(0)?,
                        parent: row.get(1)?,
                        size: row.get::<_, i64>(2)? as u64,
                        mtime: row.get(3)?,
                        is_dir: row.get::<_, i64>(4)? != 0,
                        content_hash: row.get(5)?,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(EngineError::Persistence(e.to_string())),
            })
        })
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?
    }

    async fn load_locks(&self) -> Result<HashSet<String>> {
        let workers = self.get_workers().await?;
        let mut locks = HashSet::new();
        for w in workers {
            if let Some(s) = w.source_uri {
                locks.insert(s);
            }
            locks.insert(w.target_uri);
        }
        Ok(locks)
    }
}

fn field_value_to_sql(v: &FieldValue) -> Box<dyn ToSql> {
    match v.clone() {
        FieldValue::Text(s) => Box::new(s),
        FieldValue::OptText(s) => Box::new(s),
        FieldValue::Int(i) => Box::new(i),
        FieldValue::OptInt(i) => Box::new(i),
        FieldValue::Bool(b) => Box::new(b as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Worker;

    fn sample_worker() -> Worker {
        Worker::new_copy(
            "g",
            RemoteItem {
                uri: "http://h/src/a.txt".into(),
                parent: "http://h/src".into(),
                size: 3,
                mtime: 1000,
                is_dir: false,
                content_hash: None,
            },
            "http://h/dst/a.txt".into(),
            false,
            None,
            "runner-1",
            1,
        )
    }

    #[tokio::test]
    async fn roundtrip_worker_and_partial_update() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalStore::open(&dir.path().join("state.db")).unwrap();
        let w = sample_worker();
        store.upsert_worker(&w).await.unwrap();
        let fetched = store.get_worker(&w.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, WorkerStatus::Init);

        store
            .update_worker(&w.id, &[("status", FieldValue::Text("downloaded".into()))])
            .await
            .unwrap();
        let fetched = store.get_worker(&w.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, WorkerStatus::Downloaded);
    }

    #[tokio::test]
    async fn load_locks_collects_source_and_target() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalStore::open(&dir.path().join("state.db")).unwrap();
        let w = sample_worker();
        store.upsert_worker(&w).await.unwrap();
        let locks = store.load_locks().await.unwrap();
        assert!(locks.contains("http://h/src/a.txt"));
        assert!(locks.contains("http://h/dst/a.txt"));
    }
}
