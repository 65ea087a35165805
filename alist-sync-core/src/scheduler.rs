//! Per-group orchestration: wires Scanner, Checker and the Worker Pool
//! together and drives the daemon/one-shot/check run loop. See spec.md
//! §4.7 and SPEC_FULL.md §4.7.1 (grounded on `backup-agent/src/main.rs`'s
//! startup sequence and `backup-server-rs`'s `ShutdownCoordinator`).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::checker::{filter_lock_conflicts, Checker, PendingIntent};
use crate::client::PathClient;
use crate::config::{Config, SyncGroup};
use crate::error::Result;
use crate::persistence::PersistenceHandle;
use crate::scanner;
use crate::tempfile_registry::TempFileRegistry;
use crate::worker::WorkerPool;

const SCAN_POOL_SIZE: usize = 5;

/// One sync group's live state: its own Checker (fresh each cycle) sharing
/// the process-wide Worker Pool, lock registry and clients.
pub struct GroupRunner {
    group: SyncGroup,
    runner_name: String,
}

impl GroupRunner {
    pub fn new(group: SyncGroup, runner_name: String) -> Self {
        GroupRunner { group, runner_name }
    }

    /// Runs one scan+diff+enqueue cycle: scans every member (see
    /// `checker.rs`'s module doc for why every mode scans every member),
    /// builds the matrix, derives intents, drops lock conflicts, and
    /// either enqueues them (sync mode) or just counts them (check mode).
    pub async fn run_cycle(
        &self,
        config: &Config,
        clients: &HashMap<String, Arc<PathClient>>,
        persistence: &Arc<dyn PersistenceHandle>,
        locks: &Arc<DashSet<String>>,
        pool: Option<&Arc<WorkerPool>>,
    ) -> Result<Vec<PendingIntent>> {
        if !self.group.enable {
            return Ok(Vec::new());
        }
        let checker = Checker::new(self.group.clone());
        let blacklist = Arc::new(self.group.compiled_blacklist()?);
        let whitelist = Arc::new(self.group.compiled_whitelist()?);
        let (tx, mut rx) = mpsc::channel(1024);

        let mut scan_handles = Vec::new();
        for member_root in self.group.members() {
            let Some(server) = config.server_for_uri(member_root) else {
                tracing::warn!(group = %self.group.name, member = %member_root, "no server configured for member, skipping");
                continue;
            };
            let Some(client) = clients.get(&server.base_url) else {
                tracing::warn!(group = %self.group.name, member = %member_root, "no client for server, skipping");
                continue;
            };
            scan_handles.push(tokio::spawn(scanner::scan_root(
                client.clone(),
                member_root.clone(),
                blacklist.clone(),
                whitelist.clone(),
                SCAN_POOL_SIZE,
                tx.clone(),
            )));
        }
        drop(tx);

        while let Some(item) = rx.recv().await {
            if self.group.check_updates_cache {
                if let Err(e) = persistence.upsert_item(&item.uri, &item).await {
                    tracing::warn!(error = %e, uri = %item.uri, "failed to update item cache");
                }
            }
            checker.record(item);
        }
        for h in scan_handles {
            let _ = h.await;
        }

        let now = chrono::Utc::now().timestamp();
        let intents = checker
            .finalize(config, persistence.as_ref(), &self.runner_name, now)
            .await;

        if let Some(pool) = pool {
            let accepted: Vec<_> = intents
                .iter()
                .filter_map(|i| match i {
                    PendingIntent::Accepted(w) => Some(w.clone()),
                    PendingIntent::Rejected(e) => {
                        tracing::warn!(error = %e, "cross-server transfer rejected");
                        None
                    }
                })
                .collect();
            let accepted = filter_lock_conflicts(accepted, locks);
            for w in accepted {
                pool.enqueue(w).await?;
            }
        }

        Ok(intents)
    }
}

/// Builds one [`PathClient`] per configured server, keyed by `base_url`.
pub fn build_clients(config: &Config) -> Result<HashMap<String, Arc<PathClient>>> {
    let mut clients = HashMap::new();
    for server in &config.alist_servers {
        let client = PathClient::new(server.base_url.clone(), server)?;
        clients.insert(server.base_url.clone(), Arc::new(client));
    }
    Ok(clients)
}

pub async fn build_persistence(config: &Config) -> Result<Arc<dyn PersistenceHandle>> {
    if let Some(uri) = &config.mongodb_uri {
        #[cfg(feature = "mongo")]
        {
            let store = crate::persistence::mongo::MongoStore::connect(uri).await?;
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "mongo"))]
        {
            return Err(crate::error::EngineError::Config(format!(
                "mongodb_uri set ({uri}) but this build has no `mongo` feature"
            )));
        }
    }
    let db_path = config.effective_cache_dir().join("state.db");
    let store = crate::persistence::local::LocalStore::open(&db_path)?;
    Ok(Arc::new(store))
}

/// Runs the process: builds shared state, then either spawns a
/// process-lifetime drain task fed by a recurring scan/enqueue interval
/// loop (daemon mode) or runs one scan/enqueue pass per group and drains
/// the queue to completion before returning (one-shot mode). `check_only`
/// disables Worker execution entirely (spec.md's `check` subcommand):
/// only intents are reported, and no pool is built at all.
pub async fn run(
    config: Config,
    runner_name: String,
    check_only: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let persistence = build_persistence(&config).await?;
    let clients = build_clients(&config)?;
    let locks = Arc::new(DashSet::new());
    for uri in persistence.load_locks().await? {
        locks.insert(uri);
    }

    let cache_dir = config.effective_cache_dir();
    let free_bytes = estimate_free_space(&cache_dir);
    let max_bytes = match &config.cache_max_size {
        Some(raw) => crate::config::parse_cache_max_size(raw, free_bytes)?,
        None => free_bytes / 2,
    };
    let registry = Arc::new(TempFileRegistry::new(cache_dir.clone(), max_bytes));
    registry.gc_stray_temp_files().ok();

    let pool = if check_only {
        None
    } else {
        let pool = Arc::new(WorkerPool::new(
            persistence.clone(),
            registry.clone(),
            locks.clone(),
            if config.debug { 1 } else { 10 },
            if config.debug { 1 } else { 4 },
            if config.debug { 1 } else { 4 },
        ));
        for (base_url, client) in &clients {
            pool.register_client(base_url, client.clone());
        }
        pool.restore_from_persistence().await?;
        Some(pool)
    };

    let runners: Vec<GroupRunner> = config
        .sync_groups
        .iter()
        .cloned()
        .map(|g| GroupRunner::new(g, runner_name.clone()))
        .collect();

    if let Some(days) = config.completed_log_retention_days {
        persistence.prune_completed_log(days).await.ok();
    }

    let config_arc = Arc::new(config.clone());

    if config.daemon {
        // Runs for the life of the process: cycles below only enqueue,
        // this is what actually executes backup/download/upload/delete.
        if let Some(p) = &pool {
            let _drain_handle = p.clone().spawn_drain_loop(config_arc.clone());
        }
        loop {
            for runner in &runners {
                if shutdown.is_cancelled() {
                    break;
                }
                if let Err(e) = runner
                    .run_cycle(&config, &clients, &persistence, &locks, pool.as_ref())
                    .await
                {
                    tracing::error!(group = %runner.group.name, error = %e, "cycle failed");
                }
            }
            let interval = runners.iter().map(|r| r.group.interval).min().unwrap_or(300);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(interval)) => {}
            }
        }
    } else {
        for runner in &runners {
            runner
                .run_cycle(&config, &clients, &persistence, &locks, pool.as_ref())
                .await?;
        }
        if let Some(pool) = pool {
            pool.run_until_idle(config_arc, tokio::time::Duration::from_secs(5)).await;
        }
    }

    Ok(())
}

/// Free-space probe for the `"0"`/negative `cache_max_size` sentinels
/// (`config.rs::parse_cache_max_size`). Shells out to `df`, the same
/// approach `backup-server-rs/src/routes/storage.rs::disk_usage` uses
/// rather than pulling in a platform-specific statvfs crate. Falls back
/// to a conservative constant if `df` is unavailable or its output
/// doesn't parse.
fn estimate_free_space(path: &std::path::Path) -> u64 {
    std::fs::create_dir_all(path).ok();
    const FALLBACK: u64 = 10 * 1024 * 1024 * 1024;
    let Ok(output) = std::process::Command::new("df").args(["-B1", &path.to_string_lossy()]).output() else {
        return FALLBACK;
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let Some(line) = stdout.trim().lines().nth(1) else {
        return FALLBACK;
    };
    line.split_whitespace()
        .nth(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(FALLBACK)
}
