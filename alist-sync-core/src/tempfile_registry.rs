//! Temp-File Registry: bounds local disk used by download-then-upload
//! transfers, allowing concurrent Workers to reuse a download. See
//! spec.md §4.2 and SPEC_FULL.md §4.2.1 (grounded on
//! `original_source/alist_sync/d_worker.py::TempFiles`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Watermark above which the downloader must back off (spec.md §4.2/§4.6).
pub const PENDING_WATERMARK_BYTES: u64 = 15 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
struct Entry {
    /// Size of the remote item this local path was reserved for, known
    /// before any bytes have actually landed on disk.
    projected_size: u64,
    refer_times: i64,
}

pub struct TempFileRegistry {
    cache_dir: PathBuf,
    max_bytes: u64,
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl TempFileRegistry {
    pub fn new(cache_dir: PathBuf, max_bytes: u64) -> Self {
        TempFileRegistry {
            cache_dir,
            max_bytes,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Adds or bumps the refcount for `local_path`, remembering the
    /// projected size of `remote_size` for back-pressure accounting.
    pub fn reserve(&self, local_path: &Path, remote_size: u64) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .entry(local_path.to_path_buf())
            .and_modify(|e| e.refer_times += 1)
            .or_insert(Entry {
                projected_size: remote_size,
                refer_times: 1,
            });
    }

    pub fn release(&self, local_path: &Path) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if let Some(e) = entries.get_mut(local_path) {
            e.refer_times -= 1;
        }
    }

    pub fn clear(&self, local_path: &Path) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if entries.remove(local_path).is_some() {
            let _ = std::fs::remove_file(local_path);
        }
    }

    /// Sum of projected sizes of reserved files, independent of what has
    /// actually landed on disk yet — this is the quantity compared against
    /// the watermark before starting a new download.
    pub fn pending_total_size(&self) -> u64 {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries.values().map(|e| e.projected_size).sum()
    }

    /// Sum of bytes actually on disk right now.
    pub fn on_disk_total_size(&self) -> u64 {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .keys()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }

    /// True when the downloader should sleep and re-queue rather than start
    /// a new download right now.
    pub fn should_back_pressure(&self) -> bool {
        self.pending_total_size() > PENDING_WATERMARK_BYTES
    }

    /// Unlinks files with `refer_times <= 0` while total on-disk size
    /// exceeds `max_bytes`. Loops instead of the original's unconditional
    /// recursion to avoid unbounded stack depth on a pathological registry.
    pub fn auto_clear(&self) {
        loop {
            if self.on_disk_total_size() <= self.max_bytes {
                return;
            }
            let evictable: Vec<PathBuf> = {
                let entries = self.entries.lock().expect("registry lock poisoned");
                entries
                    .iter()
                    .filter(|(_, e)| e.refer_times <= 0)
                    .map(|(p, _)| p.clone())
                    .collect()
            };
            if evictable.is_empty() {
                return;
            }
            for path in evictable {
                self.clear(&path);
            }
        }
    }

    /// Garbage-collects stray `download_tmp_*` files left behind by a
    /// terminated process, run at process start/exit (spec.md §5).
    pub fn gc_stray_temp_files(&self) -> std::io::Result<()> {
        if !self.cache_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("download_tmp_") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn refcount_gates_eviction() {
        let dir = TempDir::new().unwrap();
        let registry = TempFileRegistry::new(dir.path().to_path_buf(), 0);
        let file = dir.path().join("a.bin");
        std::fs::write(&file, vec![0u8; 100]).unwrap();
        registry.reserve(&file, 100);
        registry.auto_clear();
        assert!(file.exists(), "refcount > 0 must not be evicted");
        registry.release(&file);
        registry.auto_clear();
        assert!(!file.exists(), "refcount == 0 under pressure must be evicted");
    }

    #[test]
    fn pending_size_tracks_projection_not_disk_bytes() {
        let dir = TempDir::new().unwrap();
        let registry = TempFileRegistry::new(dir.path().to_path_buf(), u64::MAX);
        let file = dir.path().join("b.bin");
        registry.reserve(&file, 20 * 1024 * 1024 * 1024);
        assert!(registry.should_back_pressure());
    }
}
