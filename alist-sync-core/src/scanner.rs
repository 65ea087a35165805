//! Scanner: recursive remote directory walk. See spec.md §4.4.
//!
//! Grounded on `backup-agent/src/fs/walker.rs`'s shape (bounded pool,
//! per-node task, blacklist check before recursing) but walks the
//! *upstream*'s tree through [`PathClient::list`], not the local
//! filesystem — see DESIGN.md DR-12.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use globset::GlobSet;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::client::PathClient;
use crate::model::RemoteItem;

/// Strips `group_root` from `uri` to obtain the path relative to the group
/// root, which is what the blacklist is matched against (spec.md §4.4).
pub fn relative_path(group_root: &str, uri: &str) -> String {
    uri.strip_prefix(group_root)
        .unwrap_or(uri)
        .trim_start_matches('/')
        .to_string()
}

/// Recursively enumerates `group_root`, emitting every file that passes the
/// blacklist and (if set) the whitelist onto `tx`. Directories are always
/// traversed regardless of the whitelist, so files nested under a
/// non-matching directory are still reachable. Completes once no listing
/// task is in flight. Per-root bounded worker pool of `pool_size` (default
/// 5).
pub async fn scan_root(
    client: Arc<PathClient>,
    group_root: String,
    blacklist: Arc<GlobSet>,
    whitelist: Arc<Option<GlobSet>>,
    pool_size: usize,
    tx: mpsc::Sender<RemoteItem>,
) {
    let (dir_tx, dir_rx) = mpsc::unbounded_channel::<String>();
    let dir_rx = Arc::new(Mutex::new(dir_rx));
    let pending = Arc::new(AtomicI64::new(1));
    let done = CancellationToken::new();
    let _ = dir_tx.send(group_root.clone());

    let mut handles = Vec::with_capacity(pool_size);
    for _ in 0..pool_size.max(1) {
        let client = client.clone();
        let dir_rx = dir_rx.clone();
        let dir_tx = dir_tx.clone();
        let blacklist = blacklist.clone();
        let whitelist = whitelist.clone();
        let pending = pending.clone();
        let tx = tx.clone();
        let group_root = group_root.clone();
        let done = done.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let dir = {
                    let mut rx = dir_rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = done.cancelled() => None,
                        d = rx.recv() => d,
                    }
                };
                let Some(dir) = dir else { break };

                match client.list(&dir, true).await {
                    Ok(items) => {
                        for item in items {
                            let rel = relative_path(&group_root, &item.uri);
                            if blacklist.is_match(&rel) {
                                continue;
                            }
                            if item.is_dir {
                                pending.fetch_add(1, Ordering::SeqCst);
                                let _ = dir_tx.send(item.uri);
                            } else {
                                if let Some(wl) = whitelist.as_ref() {
                                    if !wl.is_match(&rel) {
                                        continue;
                                    }
                                }
                                if tx.send(item).await.is_err() {
                                    // receiver gone; stop early.
                                    done.cancel();
                                }
                            }
                        }
                    }
                    Err(e) => {
                        // Listing errors are logged and treated as "no
                        // children" for this node; the scan is not aborted.
                        tracing::warn!(dir = %dir, error = %e, "scanner: listing failed, skipping subtree");
                    }
                }

                if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    done.cancel();
                }
            }
        }));
    }
    drop(dir_tx);
    for h in handles {
        let _ = h.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_strips_root() {
        assert_eq!(relative_path("http://h/src", "http://h/src/a/b.txt"), "a/b.txt");
        assert_eq!(relative_path("http://h/src", "http://h/src/top.txt"), "top.txt");
    }
}
