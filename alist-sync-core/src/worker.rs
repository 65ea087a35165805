//! Worker & Worker Pool: executes the transfer state machine described in
//! spec.md §4.6. The pool drains a priority queue with bounded parallelism.
//!
//! Action selection (§4.6.1) is ported verbatim from
//! `original_source/alist_sync/d_worker.py::action_selector`.

use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::client::{PathClient, TaskKind};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::model::{CompletedLog, PriorityKey, Worker, WorkerKind, WorkerStatus};
use crate::persistence::{FieldValue, PersistenceHandle};
use crate::tempfile_registry::TempFileRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Backup,
    Delete,
    Download,
    Upload,
    Recheck,
    Noop,
}

/// Ported from `d_worker.py::Workers.action_selector`: action selection is
/// derived purely from `(kind, status, need_backup)`.
fn select_action(w: &Worker) -> Option<Step> {
    if w.status == WorkerStatus::Init && w.need_backup {
        return Some(Step::Backup);
    }
    if w.kind == WorkerKind::Delete
        && matches!(w.status, WorkerStatus::Init | WorkerStatus::BackedUp)
    {
        return Some(Step::Delete);
    }
    if w.kind == WorkerKind::Copy
        && matches!(w.status, WorkerStatus::Init | WorkerStatus::BackedUp)
    {
        return Some(Step::Download);
    }
    if w.status == WorkerStatus::Downloaded {
        return Some(Step::Upload);
    }
    if matches!(w.status, WorkerStatus::Copied | WorkerStatus::Deleted) {
        return Some(Step::Recheck);
    }
    if w.status.is_terminal() {
        return Some(Step::Noop);
    }
    None
}

/// Outcome of running one step: either the worker's state advanced (and it
/// should be re-enqueued unless terminal), or it should be re-enqueued
/// unchanged after a short delay (back-pressure / upstream still busy).
enum StepOutcome {
    Advanced(Worker),
    Retry(Worker, Duration),
}

pub struct WorkerPool {
    persistence: Arc<dyn PersistenceHandle>,
    clients: dashmap::DashMap<String, Arc<PathClient>>,
    registry: Arc<TempFileRegistry>,
    locks: Arc<DashSet<String>>,
    heap: tokio::sync::Mutex<BinaryHeap<(PriorityKey, Worker)>>,
    notify: Notify,
    pool_semaphore: Arc<Semaphore>,
    pool_size: usize,
    download_semaphore: Arc<Semaphore>,
    upload_semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(
        persistence: Arc<dyn PersistenceHandle>,
        registry: Arc<TempFileRegistry>,
        locks: Arc<DashSet<String>>,
        pool_size: usize,
        download_concurrency: usize,
        upload_concurrency: usize,
    ) -> Self {
        let pool_size = pool_size.max(1);
        WorkerPool {
            persistence,
            clients: dashmap::DashMap::new(),
            registry,
            locks,
            heap: tokio::sync::Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            pool_semaphore: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            download_semaphore: Arc::new(Semaphore::new(download_concurrency.max(1))),
            upload_semaphore: Arc::new(Semaphore::new(upload_concurrency.max(1))),
        }
    }

    pub fn register_client(&self, base_url: &str, client: Arc<PathClient>) {
        self.clients.insert(base_url.to_string(), client);
    }

    fn client_for(&self, uri: &str) -> Option<Arc<PathClient>> {
        let parsed = url::Url::parse(uri).ok()?;
        self.clients.iter().find_map(|e| {
            let server_url = url::Url::parse(e.key()).ok()?;
            if server_url.host_str() == parsed.host_str()
                && server_url.port_or_known_default() == parsed.port_or_known_default()
            {
                Some(e.value().clone())
            } else {
                None
            }
        })
    }

    /// Persists the worker immediately (spec.md: "Workers created by
    /// Checker, persisted immediately") and enqueues it.
    pub async fn enqueue(&self, w: Worker) -> Result<()> {
        self.persistence.upsert_worker(&w).await?;
        let key = PriorityKey::of(&w);
        self.heap.lock().await.push((key, w));
        self.notify.notify_one();
        Ok(())
    }

    /// Rebuilds live workers from the persistence layer on startup
    /// (crash-recovery, spec.md §5 cancellation/timeouts).
    pub async fn restore_from_persistence(&self) -> Result<usize> {
        let workers = self.persistence.get_workers().await?;
        let mut heap = self.heap.lock().await;
        let count = workers.len();
        for w in workers {
            let key = PriorityKey::of(&w);
            heap.push((key, w));
        }
        drop(heap);
        if count > 0 {
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    /// Spawns the process-lifetime drain task for daemon mode (spec.md
    /// §4.7 step 5): pops and dispatches workers as fast as the pool
    /// permits allow, fed by every `GroupRunner::run_cycle` across daemon
    /// intervals, and never returns on its own.
    pub fn spawn_drain_loop(self: Arc<Self>, config: Arc<Config>) -> JoinHandle<()> {
        tokio::spawn(async move { self.drain(config, None).await })
    }

    /// Drains the queue until nothing is queued or in flight for
    /// `idle_grace` (one-shot mode's termination condition, spec.md §4.7).
    pub async fn run_until_idle(self: Arc<Self>, config: Arc<Config>, idle_grace: Duration) {
        self.drain(config, Some(idle_grace)).await;
    }

    /// Core of both drain modes: pops a worker, acquires a pool permit, and
    /// dispatches it onto its own spawned task so up to `pool_size` workers
    /// execute concurrently (spec.md §4.6/§5: bounded parallelism, default
    /// pool size 5-20, matching `original_source/alist_sync/d_worker.py`'s
    /// `ThreadPoolExecutor(5)`). With `idle_grace` set, returns once the
    /// heap is empty and every permit has been free for that long; with
    /// `None`, runs forever.
    async fn drain(self: Arc<Self>, config: Arc<Config>, idle_grace: Option<Duration>) {
        loop {
            let popped = self.heap.lock().await.pop();
            if let Some((_, w)) = popped {
                let permit = self.pool_semaphore.clone().acquire_owned().await.expect("pool open");
                let pool = self.clone();
                let cfg = config.clone();
                tokio::spawn(async move { pool.run_one(cfg, w, permit).await });
                continue;
            }
            match idle_grace {
                None => self.notify.notified().await,
                Some(grace) => {
                    if self.pool_semaphore.available_permits() < self.pool_size {
                        // workers still in flight; they'll notify on completion
                        let _ = tokio::time::timeout(grace, self.notify.notified()).await;
                        continue;
                    }
                    if tokio::time::timeout(grace, self.notify.notified()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_one(self: Arc<Self>, config: Arc<Config>, w: Worker, permit: OwnedSemaphorePermit) {
        match self.execute_step(&config, w).await {
            Ok(StepOutcome::Advanced(w)) if w.status.is_terminal() => {
                self.finalize(w).await;
            }
            Ok(StepOutcome::Advanced(w)) => {
                self.heap.lock().await.push((PriorityKey::of(&w), w));
            }
            Ok(StepOutcome::Retry(w, delay)) => {
                tokio::time::sleep(delay).await;
                self.heap.lock().await.push((PriorityKey::of(&w), w));
            }
            Err(e) => {
                tracing::error!(error = %e, "worker step failed without producing a worker state");
            }
        }
        drop(permit);
        self.notify.notify_one();
    }

    async fn finalize(&self, w: Worker) {
        let done_at = chrono::Utc::now().timestamp();
        let duration_ms = (done_at - w.created_at).max(0) * 1000;
        let transferred_size = if w.status == WorkerStatus::Done && w.kind == WorkerKind::Copy {
            w.source_size
        } else {
            0
        };
        let log = CompletedLog {
            worker: w.clone(),
            done_at,
            transferred_size,
            duration_ms,
        };
        if let Err(e) = self.persistence.append_log(&log).await {
            tracing::error!(error = %e, worker_id = %w.id, "failed to append completed log");
        }
        if let Err(e) = self.persistence.delete_worker(&w.id).await {
            tracing::error!(error = %e, worker_id = %w.id, "failed to delete finished worker");
        }
        for uri in w.claimed_uris() {
            self.locks.remove(uri);
        }
        if let Some(tmp) = &w.temp_path {
            self.registry.clear(std::path::Path::new(tmp));
        }
    }

    async fn execute_step(&self, config: &Config, w: Worker) -> Result<StepOutcome> {
        let Some(step) = select_action(&w) else {
            return Err(EngineError::Status {
                worker_id: w.id.clone(),
                status: w.status.as_str().to_string(),
            });
        };
        match step {
            Step::Noop => Ok(StepOutcome::Advanced(w)),
            Step::Backup => self.step_backup(config, w).await,
            Step::Delete => self.step_delete(w).await,
            Step::Download => self.step_download(w).await,
            Step::Upload => self.step_upload(w).await,
            Step::Recheck => self.step_recheck(config, w).await,
        }
    }

    /// Required when `need_backup` and the target exists. See spec.md
    /// §4.6's backup step contract.
    async fn step_backup(&self, config: &Config, mut w: Worker) -> Result<StepOutcome> {
        let Some(client) = self.client_for(&w.target_uri) else {
            return Ok(self.mark_failed(w, "no client for target server".into()).await);
        };
        let relative = url::Url::parse(&w.target_uri)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| w.target_uri.clone());
        let target_stat = client.stat(&relative).await?;
        let Some(target_item) = target_stat else {
            // Nothing to preserve; proceed as if no backup were needed.
            w.status = WorkerStatus::BackedUp;
            self.persist_status(&w).await?;
            return Ok(StepOutcome::Advanced(w));
        };

        let backup_uri = match w.backup_uri.clone() {
            Some(uri) => uri,
            None => self.default_backup_uri(config, &w, target_item.mtime),
        };
        let backup_relative = url::Url::parse(&backup_uri)
            .map(|u| u.path().to_string())
            .unwrap_or(backup_uri.clone());
        if client.stat(&backup_relative).await?.is_some() {
            return Ok(self
                .mark_failed(w, format!("backup target already exists: {backup_uri}"))
                .await);
        }
        let json_path = format!("{backup_relative}.json");
        if client.stat(&json_path).await?.is_some() {
            return Ok(self
                .mark_failed(w, format!("backup sidecar already exists: {json_path}"))
                .await);
        }

        client.rename(&relative, &backup_relative).await?;
        let stat_json = serde_json::to_vec(&target_item).map_err(|e| EngineError::Upload(e.to_string()))?;
        client
            .put(&json_path, reqwest::Body::from(stat_json), target_item.mtime)
            .await?;

        w.backup_uri = Some(backup_uri);
        w.status = WorkerStatus::BackedUp;
        self.persist_status(&w).await?;
        Ok(StepOutcome::Advanced(w))
    }

    async fn step_delete(&self, mut w: Worker) -> Result<StepOutcome> {
        debug_assert!(matches!(w.status, WorkerStatus::Init | WorkerStatus::BackedUp));
        debug_assert_eq!(w.kind, WorkerKind::Delete);
        let Some(client) = self.client_for(&w.target_uri) else {
            return Ok(self.mark_failed(w, "no client for target server".into()).await);
        };
        let relative = url::Url::parse(&w.target_uri)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| w.target_uri.clone());
        match client.remove(&relative).await {
            Ok(()) => {
                w.status = WorkerStatus::Deleted;
                self.persist_status(&w).await?;
                Ok(StepOutcome::Advanced(w))
            }
            Err(e) => Ok(self.mark_failed(w, e.to_string()).await),
        }
    }

    /// Obeys Temp-File Registry back-pressure; streams the remote file into
    /// a temp file.
    async fn step_download(&self, mut w: Worker) -> Result<StepOutcome> {
        if self.registry.should_back_pressure() {
            return Ok(StepOutcome::Retry(w, Duration::from_secs(5)));
        }
        let Some(source_uri) = w.source_uri.clone() else {
            return Ok(self.mark_failed(w, "download step requires a source_uri".into()).await);
        };
        let Some(client) = self.client_for(&source_uri) else {
            return Ok(self.mark_failed(w, "no client for source server".into()).await);
        };
        let _permit = self.download_semaphore.clone().acquire_owned().await.expect("download sem open");
        let temp_path = self.registry.cache_dir().join(format!("download_tmp_{}", w.id));
        self.registry.reserve(&temp_path, w.source_size);
        self.registry.auto_clear();

        match client.download_to_file(&source_uri, &temp_path).await {
            Ok(()) => {
                w.temp_path = Some(temp_path.to_string_lossy().into_owned());
                w.status = WorkerStatus::Downloaded;
                self.persist_status(&w).await?;
                Ok(StepOutcome::Advanced(w))
            }
            Err(e) => {
                self.registry.clear(&temp_path);
                Ok(self.mark_failed(w, e.to_string()).await)
            }
        }
    }

    /// Asserts the temp file exists and matches the recorded source size,
    /// then `PUT`s it to the target.
    async fn step_upload(&self, mut w: Worker) -> Result<StepOutcome> {
        let Some(temp) = w.temp_path.clone() else {
            return Ok(self.mark_failed(w, "upload step requires a temp file".into()).await);
        };
        let temp_path = PathBuf::from(&temp);
        let meta = match tokio::fs::metadata(&temp_path).await {
            Ok(m) => m,
            Err(e) => return Ok(self.mark_failed(w, format!("temp file missing: {e}")).await),
        };
        if meta.len() != w.source_size {
            return Ok(self
                .mark_failed(
                    w,
                    format!("temp file size mismatch: {} != {}", meta.len(), w.source_size),
                )
                .await);
        }
        let Some(client) = self.client_for(&w.target_uri) else {
            return Ok(self.mark_failed(w, "no client for target server".into()).await);
        };
        let relative = url::Url::parse(&w.target_uri)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| w.target_uri.clone());

        let _permit = self.upload_semaphore.clone().acquire_owned().await.expect("upload sem open");
        let file = match tokio::fs::File::open(&temp_path).await {
            Ok(f) => f,
            Err(e) => return Ok(self.mark_failed(w, e.to_string()).await),
        };
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));
        match client.put(&relative, body, w.source_mtime_ms).await {
            Ok(task_id) => {
                w.upload_task_id = task_id;
                w.status = WorkerStatus::Copied;
                self.persist_status(&w).await?;
                self.registry.release(&temp_path);
                Ok(StepOutcome::Advanced(w))
            }
            Err(e) => Ok(self.mark_failed(w, e.to_string()).await),
        }
    }

    /// For `copy`: if the upload task is still undone on the upstream,
    /// reschedule; otherwise re-stat the target and compare sizes. For
    /// `delete`: re-stat and confirm absence.
    async fn step_recheck(&self, _config: &Config, mut w: Worker) -> Result<StepOutcome> {
        let Some(client) = self.client_for(&w.target_uri) else {
            return Ok(self.mark_failed(w, "no client for target server".into()).await);
        };

        if w.kind == WorkerKind::Copy {
            if let Some(task_id) = &w.upload_task_id {
                let undone = client.task_undone(TaskKind::Upload).await.unwrap_or_default();
                if undone.iter().any(|id| id == task_id) {
                    return Ok(StepOutcome::Retry(w, Duration::from_secs(2)));
                }
            }
            let relative = url::Url::parse(&w.target_uri)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| w.target_uri.clone());
            match client.stat(&relative).await? {
                Some(item) if item.size == w.source_size => {
                    w.status = WorkerStatus::Done;
                }
                _ => {
                    w.status = WorkerStatus::Failed;
                    w.error = Some("recheck: target size mismatch or missing".to_string());
                }
            }
        } else {
            let relative = url::Url::parse(&w.target_uri)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| w.target_uri.clone());
            match client.stat(&relative).await? {
                None => w.status = WorkerStatus::Done,
                Some(_) => {
                    w.status = WorkerStatus::Failed;
                    w.error = Some("recheck: target still present after delete".to_string());
                }
            }
        }
        w.done_at = Some(chrono::Utc::now().timestamp());
        self.persist_status(&w).await?;
        Ok(StepOutcome::Advanced(w))
    }

    async fn mark_failed(&self, mut w: Worker, error: String) -> StepOutcome {
        w.status = WorkerStatus::Failed;
        w.error = Some(error);
        w.done_at = Some(chrono::Utc::now().timestamp());
        if let Err(e) = self.persist_status(&w).await {
            tracing::error!(error = %e, worker_id = %w.id, "failed to persist failed status");
        }
        StepOutcome::Advanced(w)
    }

    /// Fallback backup path for a worker that didn't arrive with a
    /// precomputed `backup_uri` (the Checker already precomputes one for
    /// mirror-mode deletes). Mirrors `checker.rs::Checker::backup_path_for`'s
    /// naming grammar: `member_root/backup_dir/sha1(target)_<mtime_unix>.history`.
    fn default_backup_uri(&self, config: &Config, w: &Worker, mtime_ms: i64) -> String {
        let group = config.sync_groups.iter().find(|g| g.name == w.group);
        let (member_root, backup_dir) = match group {
            Some(g) => (
                g.members()
                    .iter()
                    .filter(|m| w.target_uri.starts_with(m.as_str()))
                    .max_by_key(|m| m.len())
                    .cloned()
                    .unwrap_or_else(|| w.target_uri.clone()),
                g.backup_dir.clone(),
            ),
            None => (w.target_uri.clone(), ".alist-sync-backup".to_string()),
        };
        format!(
            "{}/{}/{}_{}.history",
            member_root.trim_end_matches('/'),
            backup_dir,
            sha1_hex(&w.target_uri),
            mtime_ms / 1000,
        )
    }

    async fn persist_status(&self, w: &Worker) -> Result<()> {
        self.persistence
            .update_worker(
                &w.id,
                &[
                    ("status", FieldValue::Text(w.status.as_str().to_string())),
                    ("error", FieldValue::OptText(w.error.clone())),
                    ("done_at", FieldValue::OptInt(w.done_at)),
                    ("temp_path", FieldValue::OptText(w.temp_path.clone())),
                    (
                        "upload_task_id",
                        FieldValue::OptText(w.upload_task_id.clone()),
                    ),
                    (
                        "backup_uri",
                        FieldValue::OptText(w.backup_uri.clone()),
                    ),
                ],
            )
            .await
    }
}

fn sha1_hex(s: &str) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_worker(status: WorkerStatus, kind: WorkerKind, need_backup: bool) -> Worker {
        Worker {
            id: "w1".into(),
            group: "g".into(),
            kind,
            source_uri: Some("http://h/src/a.txt".into()),
            target_uri: "http://h/dst/a.txt".into(),
            backup_uri: None,
            need_backup,
            status,
            error: None,
            source_size: 3,
            source_mtime_ms: 1000,
            created_at: 1,
            done_at: None,
            owner: "r".into(),
            temp_path: None,
            upload_task_id: None,
        }
    }

    #[test]
    fn action_table_matches_spec() {
        assert_eq!(
            select_action(&base_worker(WorkerStatus::Init, WorkerKind::Copy, true)),
            Some(Step::Backup)
        );
        assert_eq!(
            select_action(&base_worker(WorkerStatus::Init, WorkerKind::Copy, false)),
            Some(Step::Download)
        );
        assert_eq!(
            select_action(&base_worker(WorkerStatus::Init, WorkerKind::Delete, false)),
            Some(Step::Delete)
        );
        assert_eq!(
            select_action(&base_worker(WorkerStatus::Downloaded, WorkerKind::Copy, false)),
            Some(Step::Upload)
        );
        assert_eq!(
            select_action(&base_worker(WorkerStatus::Copied, WorkerKind::Copy, false)),
            Some(Step::Recheck)
        );
        assert_eq!(
            select_action(&base_worker(WorkerStatus::Deleted, WorkerKind::Delete, false)),
            Some(Step::Recheck)
        );
        assert_eq!(
            select_action(&base_worker(WorkerStatus::Done, WorkerKind::Copy, false)),
            Some(Step::Noop)
        );
    }

    #[test]
    fn unreachable_combination_yields_none() {
        assert_eq!(
            select_action(&base_worker(WorkerStatus::Uploaded, WorkerKind::Delete, false)),
            None
        );
    }
}
