//! Persistence Handle: abstract store for live Workers, the completed-work
//! log, and the path→item metadata cache. See spec.md §4.3.
//!
//! Two interchangeable implementations, selected by whether
//! `Config::mongodb_uri` is set (`original_source/alist_sync/config.py`'s
//! `Config.handle` chooses between `ShelveHandle`/`MongoHandle` the same
//! way): [`local::LocalStore`] (SQLite, default) and, behind the `mongo`
//! feature, [`mongo::MongoStore`].

pub mod local;
#[cfg(feature = "mongo")]
pub mod mongo;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{CompletedLog, RemoteItem, Worker};

/// A single field update for [`PersistenceHandle::update_worker`]'s partial
/// update, mirroring the teacher's `Vec<Box<dyn ToSql>>` dynamic SET-clause
/// idiom (`backup-server-rs/src/models/backup_job.rs::update`) but typed.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Text(String),
    OptText(Option<String>),
    Int(i64),
    OptInt(Option<i64>),
    Bool(bool),
}

#[async_trait]
pub trait PersistenceHandle: Send + Sync {
    async fn upsert_worker(&self, w: &Worker) -> Result<()>;
    async fn update_worker(&self, id: &str, fields: &[(&str, FieldValue)]) -> Result<()>;
    async fn delete_worker(&self, id: &str) -> Result<()>;
    async fn get_workers(&self) -> Result<Vec<Worker>>;
    async fn get_worker(&self, id: &str) -> Result<Option<Worker>>;

    /// Called when a worker reaches a terminal state.
    async fn append_log(&self, log: &CompletedLog) -> Result<()>;

    /// Removes completed-log entries older than `retention_days`, when
    /// `Config::completed_log_retention_days` is set (DESIGN.md OQ-a).
    async fn prune_completed_log(&self, retention_days: u32) -> Result<()>;

    async fn upsert_item(&self, uri: &str, item: &RemoteItem) -> Result<()>;
    async fn get_item(&self, uri: &str) -> Result<Option<RemoteItem>>;

    /// The union of all non-null `source_uri`/`target_uri` across live
    /// workers, used to rebuild the in-memory lock registry on startup.
    async fn load_locks(&self) -> Result<HashSet<String>>;
}
