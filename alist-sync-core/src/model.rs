//! Core data model: remote items, transfer intents (Workers), and their
//! terminal log records. See spec.md §3.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// A snapshot of a remote file or directory, as returned by `stat`/`list`.
/// Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteItem {
    pub uri: String,
    pub parent: String,
    pub size: u64,
    /// mtime in epoch milliseconds.
    pub mtime: i64,
    pub is_dir: bool,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Copy,
    Delete,
}

/// Worker status domain, with scheduling priority (lower = earlier).
/// `done(0) < failed(1) < copied(2) = deleted(2) < uploaded(3) <
/// downloaded(5) < back-upped(8) < init(9)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerStatus {
    Done,
    Failed,
    Copied,
    Deleted,
    Uploaded,
    Downloaded,
    BackedUp,
    Init,
}

impl WorkerStatus {
    pub fn priority(self) -> u8 {
        match self {
            WorkerStatus::Done => 0,
            WorkerStatus::Failed => 1,
            WorkerStatus::Copied | WorkerStatus::Deleted => 2,
            WorkerStatus::Uploaded => 3,
            WorkerStatus::Downloaded => 5,
            WorkerStatus::BackedUp => 8,
            WorkerStatus::Init => 9,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerStatus::Done | WorkerStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Init => "init",
            WorkerStatus::BackedUp => "back-upped",
            WorkerStatus::Downloaded => "downloaded",
            WorkerStatus::Uploaded => "uploaded",
            WorkerStatus::Copied => "copied",
            WorkerStatus::Deleted => "deleted",
            WorkerStatus::Done => "done",
            WorkerStatus::Failed => "failed",
        }
    }
}

/// A persisted unit of work (spec.md's `TransferIntent`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub group: String,
    pub kind: WorkerKind,
    pub source_uri: Option<String>,
    pub target_uri: String,
    pub backup_uri: Option<String>,
    pub need_backup: bool,
    pub status: WorkerStatus,
    pub error: Option<String>,
    /// Size recorded at intent-creation time, used to verify the transfer.
    pub source_size: u64,
    pub source_mtime_ms: i64,
    pub created_at: i64,
    pub done_at: Option<i64>,
    pub owner: String,
    /// Local scratch path for the download-then-upload transfer, once reserved.
    pub temp_path: Option<String>,
    /// Upstream async task id for the most recent upload/copy call.
    pub upload_task_id: Option<String>,
}

impl Worker {
    /// `id = hash(kind ∥ source ∥ created_at)`, per spec.md §3.
    pub fn make_id(kind: WorkerKind, source_or_target: &str, created_at: i64) -> String {
        let mut hasher = Sha1::new();
        hasher.update(match kind {
            WorkerKind::Copy => b"copy" as &[u8],
            WorkerKind::Delete => b"delete" as &[u8],
        });
        hasher.update(b"\0");
        hasher.update(source_or_target.as_bytes());
        hasher.update(b"\0");
        hasher.update(created_at.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn new_copy(
        group: &str,
        source: RemoteItem,
        target_uri: String,
        need_backup: bool,
        backup_uri: Option<String>,
        owner: &str,
        created_at: i64,
    ) -> Self {
        let id = Self::make_id(WorkerKind::Copy, &source.uri, created_at);
        Worker {
            id,
            group: group.to_string(),
            kind: WorkerKind::Copy,
            source_uri: Some(source.uri),
            target_uri,
            backup_uri,
            need_backup,
            status: WorkerStatus::Init,
            error: None,
            source_size: source.size,
            source_mtime_ms: source.mtime,
            created_at,
            done_at: None,
            owner: owner.to_string(),
            temp_path: None,
            upload_task_id: None,
        }
    }

    pub fn new_delete(
        group: &str,
        target_uri: String,
        need_backup: bool,
        backup_uri: Option<String>,
        owner: &str,
        created_at: i64,
    ) -> Self {
        let id = Self::make_id(WorkerKind::Delete, &target_uri, created_at);
        Worker {
            id,
            group: group.to_string(),
            kind: WorkerKind::Delete,
            source_uri: None,
            target_uri,
            backup_uri,
            need_backup,
            status: WorkerStatus::Init,
            error: None,
            source_size: 0,
            source_mtime_ms: 0,
            created_at,
            done_at: None,
            owner: owner.to_string(),
            temp_path: None,
            upload_task_id: None,
        }
    }

    /// URIs this worker claims in the lock registry.
    pub fn claimed_uris(&self) -> impl Iterator<Item = &str> {
        self.source_uri
            .as_deref()
            .into_iter()
            .chain(std::iter::once(self.target_uri.as_str()))
    }
}

/// Priority queue ordering: lower priority number first, ties broken by
/// older `created_at` first. `BinaryHeap` is a max-heap, so we invert the
/// comparison to make it behave as the min-heap spec.md §9 asks for.
#[derive(Debug, Clone)]
pub struct PriorityKey {
    pub priority: u8,
    pub created_at: i64,
}

impl PriorityKey {
    pub fn of(w: &Worker) -> Self {
        PriorityKey {
            priority: w.status.priority(),
            created_at: w.created_at,
        }
    }
}

impl PartialEq for PriorityKey {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.created_at == other.created_at
    }
}
impl Eq for PriorityKey {}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: smaller priority / older created_at should be "greater"
        // so BinaryHeap::pop returns it first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

/// Append-only record of a finished Worker. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedLog {
    pub worker: Worker,
    pub done_at: i64,
    pub transferred_size: u64,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_spec_table() {
        assert!(WorkerStatus::Done.priority() < WorkerStatus::Failed.priority());
        assert_eq!(WorkerStatus::Copied.priority(), WorkerStatus::Deleted.priority());
        assert!(WorkerStatus::Uploaded.priority() < WorkerStatus::Downloaded.priority());
        assert!(WorkerStatus::Downloaded.priority() < WorkerStatus::BackedUp.priority());
        assert!(WorkerStatus::BackedUp.priority() < WorkerStatus::Init.priority());
    }

    #[test]
    fn downloaded_dequeues_before_init() {
        let mut heap = std::collections::BinaryHeap::new();
        heap.push((
            PriorityKey {
                priority: WorkerStatus::Init.priority(),
                created_at: 1,
            },
            "init-worker",
        ));
        heap.push((
            PriorityKey {
                priority: WorkerStatus::Downloaded.priority(),
                created_at: 2,
            },
            "downloaded-worker",
        ));
        let (_, first) = heap.pop().unwrap();
        assert_eq!(first, "downloaded-worker");
    }

    #[test]
    fn worker_id_is_content_addressed() {
        let a = Worker::make_id(WorkerKind::Copy, "http://h/a", 100);
        let b = Worker::make_id(WorkerKind::Copy, "http://h/a", 100);
        let c = Worker::make_id(WorkerKind::Copy, "http://h/a", 101);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
