//! Checker: mode-specific differ. Consumes scanner items, compares against
//! sibling mounts in the group, emits Worker intents. See spec.md §4.5 and
//! SPEC_FULL.md §4.5.1.
//!
//! The relpath→{member_root: Item} matrix is grounded on
//! `original_source/alist_sync/checker.py::Checker.checker`, adapted from a
//! batch table into a structure built incrementally as scan results arrive
//! (spec.md's channel-based pipeline requires streaming, not a
//! scan-then-diff barrier).
//!
//! Deviation from a literal reading of spec.md §4.7 ("for copy/mirror, one
//! scanner on members[0]"): the Scheduler starts one scanner per member for
//! *every* mode, because `mirror`'s delete detection requires knowing which
//! target-only files exist, which is unknowable from scanning the source
//! alone. `copy` mode simply ignores matrix rows for non-source members
//! when deciding what to copy. This keeps one matrix-building code path for
//! all four modes.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use sha1::{Digest, Sha1};

use crate::config::{Config, SyncGroup, SyncMode};
use crate::error::EngineError;
use crate::model::{RemoteItem, Worker};
use crate::persistence::PersistenceHandle;

pub struct Checker {
    group: SyncGroup,
    /// relative_path -> member_root -> item
    matrix: DashMap<String, DashMap<String, RemoteItem>>,
}

impl Checker {
    pub fn new(group: SyncGroup) -> Self {
        Checker {
            group,
            matrix: DashMap::new(),
        }
    }

    /// `split(path) -> (memberRoot, relativePath)`, found by prefix match
    /// against the group's members.
    pub fn split(&self, uri: &str) -> Option<(String, String)> {
        self.group
            .members()
            .iter()
            .filter(|m| uri.starts_with(m.as_str()))
            .max_by_key(|m| m.len())
            .map(|m| {
                let rel = uri[m.len()..].trim_start_matches('/').to_string();
                (m.clone(), rel)
            })
    }

    /// `backupPathFor(path) -> memberRoot/backup_dir/sha1(target)_<mtime_unix>.history`,
    /// per spec.md §4.6's backup-name grammar.
    pub fn backup_path_for(&self, member_root: &str, relative_path: &str, mtime_ms: i64) -> String {
        let target_uri = format!("{}/{}", member_root.trim_end_matches('/'), relative_path);
        format!(
            "{}/{}/{}_{}.history",
            member_root.trim_end_matches('/'),
            self.group.backup_dir,
            sha1_hex(&target_uri),
            mtime_ms / 1000,
        )
    }

    /// Records one scanned item into the matrix (called as items stream in
    /// from any member's scanner).
    pub fn record(&self, item: RemoteItem) {
        let Some((member_root, relative_path)) = self.split(&item.uri) else {
            return;
        };
        self.matrix
            .entry(relative_path)
            .or_default()
            .insert(member_root, item);
    }

    /// Walks the matrix after all scanners for this cycle have finished,
    /// emitting copy/delete intents per the group's mode. `persistence` is
    /// the metadata cache used for the "skip paths unchanged since the last
    /// recorded snapshot" rule common to all modes (spec.md §4.5): a path
    /// whose current `(size, mtime, hash-if-present)` matches every member's
    /// last-cached item is skipped before any mode-specific diff runs.
    pub async fn finalize(
        &self,
        config: &Config,
        persistence: &dyn PersistenceHandle,
        runner_name: &str,
        now: i64,
    ) -> Vec<PendingIntent> {
        let mut out = Vec::new();
        for row in self.matrix.iter() {
            let relative_path = row.key().clone();
            let by_member: HashMap<String, RemoteItem> = row
                .value()
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect();
            if !self.changed_since_snapshot(&by_member, persistence).await {
                continue;
            }
            match self.group.mode {
                SyncMode::Copy => {
                    self.emit_copy_targets(&relative_path, &by_member, config, runner_name, now, &mut out)
                        .await;
                }
                SyncMode::Mirror => {
                    self.emit_copy_targets(&relative_path, &by_member, config, runner_name, now, &mut out)
                        .await;
                    self.emit_mirror_deletes(&relative_path, &by_member, config, runner_name, now, &mut out);
                }
                SyncMode::Sync | SyncMode::SyncIncr => {
                    self.emit_sync(&relative_path, &by_member, config, runner_name, now, &mut out)
                        .await;
                }
            }
        }
        out
    }

    async fn unchanged_in_cache(&self, item: &RemoteItem, persistence: &dyn PersistenceHandle) -> bool {
        match persistence.get_item(&item.uri).await {
            Ok(Some(cached)) => {
                cached.size == item.size
                    && cached.mtime == item.mtime
                    && cached.content_hash == item.content_hash
            }
            _ => false,
        }
    }

    async fn changed_since_snapshot(
        &self,
        by_member: &HashMap<String, RemoteItem>,
        persistence: &dyn PersistenceHandle,
    ) -> bool {
        for item in by_member.values() {
            if !self.unchanged_in_cache(item, persistence).await {
                return true;
            }
        }
        false
    }

    async fn emit_copy_targets(
        &self,
        relative_path: &str,
        by_member: &HashMap<String, RemoteItem>,
        config: &Config,
        runner_name: &str,
        now: i64,
        out: &mut Vec<PendingIntent>,
    ) {
        let source_root = &self.group.members()[0];
        let Some(source_item) = by_member.get(source_root) else {
            return;
        };
        for member_root in &self.group.members()[1..] {
            if by_member.contains_key(member_root) {
                continue;
            }
            let target_uri = format!("{}/{}", member_root.trim_end_matches('/'), relative_path);
            if cross_server(config, &source_item.uri, &target_uri) {
                out.push(PendingIntent::Rejected(EngineError::CrossServer {
                    source: source_item.uri.clone(),
                    target: target_uri,
                }));
                continue;
            }
            let worker = Worker::new_copy(
                &self.group.name,
                source_item.clone(),
                target_uri,
                false,
                None,
                runner_name,
                now,
            );
            out.push(PendingIntent::Accepted(worker));
        }
    }

    fn emit_mirror_deletes(
        &self,
        relative_path: &str,
        by_member: &HashMap<String, RemoteItem>,
        config: &Config,
        runner_name: &str,
        now: i64,
        out: &mut Vec<PendingIntent>,
    ) {
        let source_root = &self.group.members()[0];
        if by_member.contains_key(source_root) {
            return;
        }
        for (member_root, item) in by_member {
            if member_root == source_root {
                continue;
            }
            let target_uri = format!("{}/{}", member_root.trim_end_matches('/'), relative_path);
            let backup_uri = if self.group.need_backup {
                Some(self.backup_path_for(member_root, relative_path, item.mtime))
            } else {
                None
            };
            if self.group.need_backup {
                if cross_server(config, &target_uri, member_root) {
                    out.push(PendingIntent::Rejected(EngineError::CrossServer {
                        source: target_uri.clone(),
                        target: member_root.clone(),
                    }));
                    continue;
                }
            }
            let worker = Worker::new_delete(
                &self.group.name,
                target_uri,
                self.group.need_backup,
                backup_uri,
                runner_name,
                now,
            );
            out.push(PendingIntent::Accepted(worker));
        }
    }

    async fn emit_sync(
        &self,
        relative_path: &str,
        by_member: &HashMap<String, RemoteItem>,
        config: &Config,
        runner_name: &str,
        now: i64,
        out: &mut Vec<PendingIntent>,
    ) {
        if by_member.is_empty() {
            return;
        }
        let max_mtime = by_member.values().map(|i| i.mtime).max().unwrap();
        let winners: Vec<&RemoteItem> = by_member.values().filter(|i| i.mtime == max_mtime).collect();
        // Ties at the same mtime with differing size are a true conflict;
        // spec.md §9 says to reject, not guess.
        if winners.len() > 1 {
            let sizes: std::collections::HashSet<u64> = winners.iter().map(|i| i.size).collect();
            if sizes.len() > 1 {
                tracing::warn!(
                    group = %self.group.name,
                    relative_path = %relative_path,
                    "sync conflict: multiple members share the newest mtime with different sizes; skipping"
                );
                return;
            }
            // identical mtime and size everywhere present: nothing to do.
        }
        let winner = winners[0];
        for member_root in self.group.members() {
            match by_member.get(member_root) {
                Some(existing) if existing.size == winner.size && existing.mtime == winner.mtime => {
                    continue;
                }
                _ => {}
            }
            if winner.parent == *member_root {
                continue;
            }
            let target_uri = format!("{}/{}", member_root.trim_end_matches('/'), relative_path);
            if cross_server(config, &winner.uri, &target_uri) {
                out.push(PendingIntent::Rejected(EngineError::CrossServer {
                    source: winner.uri.clone(),
                    target: target_uri,
                }));
                continue;
            }
            let worker = Worker::new_copy(
                &self.group.name,
                winner.clone(),
                target_uri,
                false,
                None,
                runner_name,
                now,
            );
            out.push(PendingIntent::Accepted(worker));
        }
    }
}

pub enum PendingIntent {
    Accepted(Worker),
    /// Source and target resolve to different upstream servers; rejected
    /// per spec.md's Non-goals (inter-server transfer must be rejected with
    /// an explicit error), scenario 6. Carries the same
    /// [`EngineError::CrossServer`] a caller would construct by hand, so
    /// there is one source of truth for the rejection message.
    Rejected(EngineError),
}

fn cross_server(config: &Config, source_uri: &str, target_uri: &str) -> bool {
    match (config.server_for_uri(source_uri), config.server_for_uri(target_uri)) {
        (Some(a), Some(b)) => a.base_url != b.base_url,
        _ => false,
    }
}

fn sha1_hex(s: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Drops candidate workers whose source or target URI is already claimed by
/// a live worker; the rest are inserted into the registry atomically with
/// their acceptance (spec.md §5 Lock registry).
pub fn filter_lock_conflicts(workers: Vec<Worker>, locks: &Arc<DashSet<String>>) -> Vec<Worker> {
    let mut accepted = Vec::with_capacity(workers.len());
    for w in workers {
        let conflict = w.claimed_uris().any(|u| locks.contains(u));
        if conflict {
            tracing::debug!(worker_id = %w.id, "lock conflict, dropping intent for this cycle");
            continue;
        }
        for uri in w.claimed_uris() {
            locks.insert(uri.to_string());
        }
        accepted.push(w);
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlistServer;

    fn item(uri: &str, parent: &str, size: u64, mtime: i64) -> RemoteItem {
        RemoteItem {
            uri: uri.to_string(),
            parent: parent.to_string(),
            size,
            mtime,
            is_dir: false,
            content_hash: None,
        }
    }

    fn group(mode: SyncMode, members: Vec<&str>, need_backup: bool) -> SyncGroup {
        SyncGroup {
            enable: true,
            name: "g".into(),
            mode,
            interval: 300,
            need_backup,
            backup_dir: ".alist-sync-backup".into(),
            blacklist: vec![],
            whitelist: vec![],
            check_updates_cache: false,
            group: members.into_iter().map(String::from).collect(),
        }
    }

    #[tokio::test]
    async fn copy_mode_emits_missing_targets_only() {
        let g = group(SyncMode::Copy, vec!["http://h/src", "http://h/dst"], false);
        let checker = Checker::new(g);
        checker.record(item("http://h/src/a.txt", "http://h/src", 3, 100));
        let config = Config {
            name: "x".into(),
            cache_dir: None,
            cache_max_size: None,
            timeout: 10,
            daemon: false,
            debug: false,
            mongodb_uri: None,
            completed_log_retention_days: None,
            alist_servers: vec![],
            sync_groups: vec![],
            logs: None,
        };
        let store = crate::persistence::local::LocalStore::open(
            &tempfile::NamedTempFile::new().unwrap().path().to_path_buf(),
        )
        .unwrap();
        let intents = checker.finalize(&config, &store, "runner", 1000).await;
        assert_eq!(intents.len(), 1);
    }

    #[tokio::test]
    async fn mirror_mode_emits_delete_for_target_only_file() {
        let g = group(SyncMode::Mirror, vec!["http://h/main", "http://h/dst"], false);
        let checker = Checker::new(g);
        checker.record(item("http://h/dst/extra.txt", "http://h/dst", 1, 50));
        let config = Config {
            name: "x".into(),
            cache_dir: None,
            cache_max_size: None,
            timeout: 10,
            daemon: false,
            debug: false,
            mongodb_uri: None,
            completed_log_retention_days: None,
            alist_servers: vec![],
            sync_groups: vec![],
            logs: None,
        };
        let store = crate::persistence::local::LocalStore::open(
            &tempfile::NamedTempFile::new().unwrap().path().to_path_buf(),
        )
        .unwrap();
        let intents = checker.finalize(&config, &store, "runner", 1000).await;
        assert_eq!(intents.len(), 1);
        match &intents[0] {
            PendingIntent::Accepted(w) => assert_eq!(w.kind, crate::model::WorkerKind::Delete),
            _ => panic!("expected accepted delete"),
        }
    }

    #[test]
    fn split_picks_longest_matching_member() {
        let g = group(SyncMode::Copy, vec!["http://h/a", "http://h/a/nested"], false);
        let checker = Checker::new(g);
        let (root, rel) = checker.split("http://h/a/nested/x.txt").unwrap();
        assert_eq!(root, "http://h/a/nested");
        assert_eq!(rel, "x.txt");
    }

    #[allow(dead_code)]
    fn unused_server(base: &str) -> AlistServer {
        AlistServer {
            base_url: base.to_string(),
            username: None,
            password: None,
            token: None,
            has_opt: false,
            max_connect: 30,
            verify: true,
            headers: None,
            storage_config: None,
        }
    }
}
