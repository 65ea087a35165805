//! YAML configuration loading, with `ALIST_SYNC_*` environment overrides.
//! See spec.md §6 and SPEC_FULL.md §2.3/§3.2/§9.1.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

fn default_true() -> bool {
    true
}
fn default_max_connect() -> u32 {
    30
}
fn default_interval() -> u64 {
    300
}
fn default_backup_dir() -> String {
    ".alist-sync-backup".to_string()
}
fn default_timeout() -> u64 {
    10
}
fn default_name() -> String {
    "alist-sync".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlistServer {
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub has_opt: bool,
    #[serde(default = "default_max_connect")]
    pub max_connect: u32,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default)]
    pub headers: Option<std::collections::HashMap<String, String>>,
    #[serde(default)]
    pub storage_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    Copy,
    Mirror,
    Sync,
    #[serde(rename = "sync-incr")]
    SyncIncr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncGroup {
    #[serde(default = "default_true")]
    pub enable: bool,
    pub name: String,
    #[serde(rename = "type")]
    pub mode: SyncMode,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub need_backup: bool,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Whether `check`-mode runs for this group also update the item cache.
    /// Open Question (b) in spec.md §9, resolved explicitly (see DESIGN.md OQ-b).
    #[serde(default)]
    pub check_updates_cache: bool,
    /// At least 2 absolute mount URIs.
    pub group: Vec<String>,
}

impl SyncGroup {
    /// Effective blacklist, always including `.alist-sync*` (spec.md §3),
    /// compiled once into a glob set for the Scanner/Checker to reuse.
    pub fn compiled_blacklist(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        builder.add(
            Glob::new(".alist-sync*").map_err(|e| EngineError::Config(e.to_string()))?,
        );
        for pattern in &self.blacklist {
            builder
                .add(Glob::new(pattern).map_err(|e| EngineError::Config(e.to_string()))?);
        }
        builder.build().map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Compiled whitelist, or `None` when empty (no include-filter: every
    /// non-blacklisted path is scanned, as if whitelisted `**`). When set,
    /// only files matching one of these globs are emitted by the Scanner;
    /// directories are always traversed regardless, so nested matches are
    /// still reachable.
    pub fn compiled_whitelist(&self) -> Result<Option<GlobSet>> {
        if self.whitelist.is_empty() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.whitelist {
            builder.add(Glob::new(pattern).map_err(|e| EngineError::Config(e.to_string()))?);
        }
        Ok(Some(builder.build().map_err(|e| EngineError::Config(e.to_string()))?))
    }

    pub fn members(&self) -> &[String] {
        &self.group
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// String with unit suffix (`B`/`KB`/`MB`/`GB`); parsed by
    /// [`parse_cache_max_size`]. `"0"` means half of free disk space, a
    /// negative value means all free disk space.
    #[serde(default)]
    pub cache_max_size: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub daemon: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub mongodb_uri: Option<String>,
    #[serde(default)]
    pub completed_log_retention_days: Option<u32>,
    #[serde(default)]
    pub alist_servers: Vec<AlistServer>,
    #[serde(default)]
    pub sync_groups: Vec<SyncGroup>,
    #[serde(default)]
    pub logs: Option<LogConfig>,
}

impl Config {
    pub fn load_from_yaml(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&text).map_err(|e| EngineError::Config(e.to_string()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// `ALIST_SYNC_*` environment variables override whatever was loaded
    /// from YAML, matching spec.md §6's env var table.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ALIST_SYNC_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("ALIST_SYNC_CACHE_MAX_SIZE") {
            self.cache_max_size = Some(v);
        }
        if let Ok(v) = std::env::var("ALIST_SYNC_DAEMON") {
            self.daemon = is_truthy(&v);
        }
        if let Ok(v) = std::env::var("ALIST_SYNC_DEBUG") {
            self.debug = is_truthy(&v);
        }
        if let Ok(v) = std::env::var("ALIST_SYNC_NAME") {
            self.name = v;
        }
        if let Ok(v) = std::env::var("ALIST_SYNC_MONGODB_URI") {
            self.mongodb_uri = Some(v);
        }
    }

    fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for group in &self.sync_groups {
            if !names.insert(&group.name) {
                return Err(EngineError::Config(format!(
                    "duplicate sync group name: {}",
                    group.name
                )));
            }
            if group.group.len() < 2 {
                return Err(EngineError::Config(format!(
                    "sync group {} must name at least 2 members",
                    group.name
                )));
            }
        }
        Ok(())
    }

    pub fn effective_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".alist-sync-cache"))
    }

    /// Resolve the `AlistServer` whose `(host, port)` matches `uri`, per
    /// `original_source/alist_sync/config.py::Config.get_server`.
    pub fn server_for_uri(&self, uri: &str) -> Option<&AlistServer> {
        let target = url::Url::parse(uri).ok()?;
        self.alist_servers.iter().find(|s| {
            url::Url::parse(&s.base_url)
                .ok()
                .map(|su| su.host_str() == target.host_str() && su.port_or_known_default() == target.port_or_known_default())
                .unwrap_or(false)
        })
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(
        v.to_lowercase().as_str(),
        "true" | "1" | "yes" | "on" | "y" | "t"
    )
}

const B: u64 = 1;
const KB: u64 = B * 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

/// Parses strings like `"10GB"`, `"512MB"`, `"0"`, `"-1"`, matching
/// `original_source/alist_sync/common.py::data_size_to_bytes`.
///
/// `free_bytes` is the free space on the cache partition, used to resolve
/// `"0"` (half of free space) and negative values (all of free space).
pub fn parse_cache_max_size(raw: &str, free_bytes: u64) -> Result<u64> {
    let trimmed = raw.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Ok(if n == 0 {
            free_bytes / 2
        } else if n < 0 {
            free_bytes
        } else {
            n as u64
        });
    }
    let (num_part, unit) = trimmed.split_at(
        trimmed
            .find(|c: char| c.is_alphabetic())
            .unwrap_or(trimmed.len()),
    );
    let n: f64 = num_part
        .parse()
        .map_err(|_| EngineError::Config(format!("invalid cache_max_size: {raw}")))?;
    let mult = match unit {
        "B" | "" => B,
        "KB" => KB,
        "MB" => MB,
        "GB" => GB,
        other => {
            return Err(EngineError::Config(format!(
                "unknown cache_max_size unit: {other}"
            )))
        }
    };
    Ok((n * mult as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_cache_max_size("10GB", 0).unwrap(), 10 * GB);
        assert_eq!(parse_cache_max_size("512MB", 0).unwrap(), 512 * MB);
        assert_eq!(parse_cache_max_size("0", 1000).unwrap(), 500);
        assert_eq!(parse_cache_max_size("-1", 1000).unwrap(), 1000);
    }

    #[test]
    fn blacklist_always_includes_backup_dir_marker() {
        let group = SyncGroup {
            enable: true,
            name: "g".into(),
            mode: SyncMode::Copy,
            interval: 300,
            need_backup: false,
            backup_dir: ".alist-sync-backup".into(),
            blacklist: vec!["*.tmp".into()],
            whitelist: vec![],
            check_updates_cache: false,
            group: vec!["http://a/1".into(), "http://a/2".into()],
        };
        let set = group.compiled_blacklist().unwrap();
        assert!(set.is_match(".alist-sync-backup/x"));
        assert!(set.is_match("skip.tmp"));
        assert!(!set.is_match("keep.dat"));
    }
}
