//! Path Client: rate-limited, typed access to one upstream server's file
//! API. See spec.md §4.1 and SPEC_FULL.md §4.1.1.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};

use crate::config::AlistServer;
use crate::error::{EngineError, Result};
use crate::model::RemoteItem;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const TASK_DONE_TTL: Duration = Duration::from_secs(5);
const TASK_UNDONE_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Copy,
    Upload,
}

impl TaskKind {
    fn as_str(self) -> &'static str {
        match self {
            TaskKind::Copy => "copy",
            TaskKind::Upload => "upload",
        }
    }
}

#[derive(Debug, Clone)]
struct TaskCacheEntry {
    refreshed_at: Instant,
    ids: Vec<String>,
}

/// One client per upstream server. Every outgoing request is gated by a
/// semaphore of size `max_connect` (default 30).
pub struct PathClient {
    pub server_id: String,
    base_url: url::Url,
    http: reqwest::Client,
    semaphore: Arc<Semaphore>,
    auth: AuthMode,
    // Memoized task_done/task_undone results, keyed by kind. Many Workers
    // polling the same upstream coalesce into one outbound request per TTL
    // window via the refresh mutex.
    task_done_cache: DashMap<TaskKind, TaskCacheEntry>,
    task_undone_cache: DashMap<TaskKind, TaskCacheEntry>,
    refresh_lock: Mutex<()>,
}

#[derive(Debug, Clone)]
enum AuthMode {
    Token(String),
    Basic { username: String, password: String },
    None,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: u16,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct ListRequest<'a> {
    path: &'a str,
    refresh: bool,
}

#[derive(Debug, Deserialize)]
struct ListContent {
    content: Vec<FsObj>,
}

#[derive(Debug, Deserialize)]
struct FsObj {
    name: String,
    size: u64,
    modified: String,
    is_dir: bool,
    #[serde(default)]
    hashinfo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatContent {
    name: String,
    size: u64,
    modified: String,
    is_dir: bool,
    #[serde(default)]
    hashinfo: Option<String>,
}

impl PathClient {
    pub fn new(server_id: impl Into<String>, server: &AlistServer) -> Result<Self> {
        let base_url =
            url::Url::parse(&server.base_url).map_err(|e| EngineError::Config(e.to_string()))?;
        let mut builder = reqwest::Client::builder();
        if !server.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let auth = if let Some(token) = &server.token {
            AuthMode::Token(token.clone())
        } else if let (Some(u), Some(p)) = (&server.username, &server.password) {
            AuthMode::Basic {
                username: u.clone(),
                password: p.clone(),
            }
        } else {
            AuthMode::None
        };
        Ok(PathClient {
            server_id: server_id.into(),
            base_url,
            http,
            semaphore: Arc::new(Semaphore::new(server.max_connect as usize)),
            auth,
            task_done_cache: DashMap::new(),
            task_undone_cache: DashMap::new(),
            refresh_lock: Mutex::new(()),
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            AuthMode::Token(t) => req.header("Authorization", t),
            AuthMode::Basic { username, password } => req.basic_auth(username, Some(password)),
            AuthMode::None => req,
        }
    }

    fn url(&self, path: &str) -> url::Url {
        self.base_url.join(path).expect("static api path")
    }

    async fn gated<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let _permit = self.semaphore.acquire().await.expect("semaphore open");
        f().await
    }

    /// `list(dir, refresh=true) -> [RemoteItem]`.
    pub async fn list(&self, dir: &str, refresh: bool) -> Result<Vec<RemoteItem>> {
        self.gated(|| async {
            let resp = self
                .authed(self.http.post(self.url("/api/fs/list")).json(&ListRequest {
                    path: dir,
                    refresh,
                }))
                .send()
                .await?;
            let env: Envelope<ListContent> = resp.json().await?;
            if env.code != 200 {
                return Err(EngineError::Upstream {
                    code: env.code,
                    message: env.message,
                });
            }
            let content = env.data.map(|d| d.content).unwrap_or_default();
            Ok(content
                .into_iter()
                .map(|o| to_remote_item(dir, o.name, o.size, &o.modified, o.is_dir, o.hashinfo))
                .collect())
        })
        .await
    }

    /// `stat(path) -> RemoteItem | NotFound`.
    pub async fn stat(&self, path: &str) -> Result<Option<RemoteItem>> {
        self.gated(|| async {
            let (parent, _) = split_parent(path);
            let resp = self
                .authed(
                    self.http
                        .post(self.url("/api/fs/get"))
                        .json(&ListRequest {
                            path,
                            refresh: false,
                        }),
                )
                .send()
                .await?;
            let env: Envelope<StatContent> = resp.json().await?;
            if env.code == 404 {
                return Ok(None);
            }
            if env.code != 200 {
                return Err(EngineError::Upstream {
                    code: env.code,
                    message: env.message,
                });
            }
            Ok(env.data.map(|o| {
                to_remote_item(&parent, o.name, o.size, &o.modified, o.is_dir, o.hashinfo)
            }))
        })
        .await
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.simple_post("/api/fs/mkdir", serde_json::json!({ "path": path }))
            .await
    }

    pub async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.simple_post(
            "/api/fs/rename",
            serde_json::json!({ "path": src, "name": dst }),
        )
        .await
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        let (parent, name) = split_parent(path);
        self.simple_post(
            "/api/fs/remove",
            serde_json::json!({ "dir": parent, "names": [name] }),
        )
        .await
    }

    /// `copy(src_dir, dst_dir, names) -> task_id[]`.
    pub async fn copy(&self, src_dir: &str, dst_dir: &str, names: &[String]) -> Result<Vec<String>> {
        self.gated(|| async {
            #[derive(Deserialize)]
            struct CopyData {
                #[serde(default)]
                task: Vec<TaskRef>,
            }
            #[derive(Deserialize)]
            struct TaskRef {
                id: String,
            }
            let resp = self
                .authed(self.http.post(self.url("/api/fs/copy")).json(&serde_json::json!({
                    "src_dir": src_dir,
                    "dst_dir": dst_dir,
                    "names": names,
                })))
                .send()
                .await?;
            let env: Envelope<CopyData> = resp.json().await?;
            if env.code != 200 {
                return Err(EngineError::Upstream {
                    code: env.code,
                    message: env.message,
                });
            }
            Ok(env
                .data
                .map(|d| d.task.into_iter().map(|t| t.id).collect())
                .unwrap_or_default())
        })
        .await
    }

    /// `put(path, content_stream, last_modified_ms) -> task_id`. Streams the
    /// body as `application/octet-stream`; headers carry `File-Path`
    /// (URL-quoted), `Last-Modified` (epoch ms), `As-Task: true`. See
    /// SPEC_FULL.md §4.1.1.
    pub async fn put(
        &self,
        path: &str,
        body: reqwest::Body,
        last_modified_ms: i64,
    ) -> Result<Option<String>> {
        self.gated(|| async {
            #[derive(Deserialize)]
            struct PutData {
                #[serde(default)]
                task: Option<TaskRef>,
            }
            #[derive(Deserialize)]
            struct TaskRef {
                id: String,
            }
            let req = self
                .http
                .put(self.url("/api/fs/put"))
                .timeout(UPLOAD_TIMEOUT)
                .header("As-Task", "true")
                .header("Content-Type", "application/octet-stream")
                .header("Last-Modified", last_modified_ms.to_string())
                .header("File-Path", urlencoding::encode(path).into_owned())
                .body(body);
            let resp = self.authed(req).send().await?;
            let env: Envelope<PutData> = resp.json().await?;
            if env.code != 200 {
                return Err(EngineError::Upload(format!("{}: {}", env.code, env.message)));
            }
            Ok(env.data.and_then(|d| d.task).map(|t| t.id))
        })
        .await
    }

    /// Streams `remote_uri`'s bytes into `dest`. Not part of spec.md's
    /// enumerated Path Client operations (§4.1 lists `list`/`stat`/`mkdir`/
    /// `rename`/`remove`/`put`/`copy`/`task_list`), but required to
    /// implement the Worker's `download` step contract (§4.6), which
    /// streams the remote file into a local temp file. Uses alist's public
    /// raw-download convention (`/d<path>`).
    pub async fn download_to_file(&self, remote_uri: &str, dest: &std::path::Path) -> Result<()> {
        use futures_util::StreamExt;
        use tokio::io::AsyncWriteExt;

        let parsed = url::Url::parse(remote_uri).map_err(|e| EngineError::Downloader(e.to_string()))?;
        self.gated(|| async {
            let download_url = self.url(&format!("/d{}", parsed.path()));
            let resp = self.authed(self.http.get(download_url)).send().await?;
            if !resp.status().is_success() {
                return Err(EngineError::Downloader(format!(
                    "GET {remote_uri} failed: {}",
                    resp.status()
                )));
            }
            let mut file = tokio::fs::File::create(dest).await?;
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
            }
            Ok(())
        })
        .await
    }

    /// `task_done(kind)`/`task_undone(kind)`, memoized with per-(server,
    /// kind) TTL (5s done / 1s undone) so concurrently-polling Workers
    /// coalesce into one outbound request.
    pub async fn task_done(&self, kind: TaskKind) -> Result<Vec<String>> {
        self.cached_task_list(kind, true).await
    }

    pub async fn task_undone(&self, kind: TaskKind) -> Result<Vec<String>> {
        self.cached_task_list(kind, false).await
    }

    async fn cached_task_list(&self, kind: TaskKind, done: bool) -> Result<Vec<String>> {
        let (cache, ttl) = if done {
            (&self.task_done_cache, TASK_DONE_TTL)
        } else {
            (&self.task_undone_cache, TASK_UNDONE_TTL)
        };
        if let Some(entry) = cache.get(&kind) {
            if entry.refreshed_at.elapsed() < ttl {
                return Ok(entry.ids.clone());
            }
        }
        // Only one caller actually issues the request per staleness window;
        // the rest re-check the cache after acquiring the lock.
        let _guard = self.refresh_lock.lock().await;
        if let Some(entry) = cache.get(&kind) {
            if entry.refreshed_at.elapsed() < ttl {
                return Ok(entry.ids.clone());
            }
        }
        let endpoint = format!(
            "/api/task/{}/{}",
            if done { "done" } else { "undone" },
            kind.as_str()
        );
        let ids = self
            .gated(|| async {
                #[derive(Deserialize)]
                struct TaskRef {
                    id: String,
                }
                let resp = self.authed(self.http.get(self.url(&endpoint))).send().await?;
                let env: Envelope<Vec<TaskRef>> = resp.json().await?;
                if env.code != 200 {
                    return Err(EngineError::Upstream {
                        code: env.code,
                        message: env.message,
                    });
                }
                Ok(env
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|t| t.id)
                    .collect::<Vec<_>>())
            })
            .await?;
        cache.insert(
            kind,
            TaskCacheEntry {
                refreshed_at: Instant::now(),
                ids: ids.clone(),
            },
        );
        Ok(ids)
    }

    async fn simple_post(&self, endpoint: &str, body: serde_json::Value) -> Result<()> {
        self.gated(|| async {
            let resp = self
                .authed(self.http.post(self.url(endpoint)).json(&body))
                .send()
                .await?;
            let env: Envelope<serde_json::Value> = resp.json().await?;
            if env.code != 200 {
                return Err(EngineError::Upstream {
                    code: env.code,
                    message: env.message,
                });
            }
            Ok(())
        })
        .await
    }
}

fn split_parent(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => (
            if parent.is_empty() { "/".to_string() } else { parent.to_string() },
            name.to_string(),
        ),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

fn to_remote_item(
    dir: &str,
    name: String,
    size: u64,
    modified_rfc3339: &str,
    is_dir: bool,
    hashinfo: Option<String>,
) -> RemoteItem {
    let uri = format!("{}/{}", dir.trim_end_matches('/'), name);
    let mtime = chrono::DateTime::parse_from_rfc3339(modified_rfc3339)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0);
    RemoteItem {
        uri: uri.clone(),
        parent: dir.to_string(),
        size,
        mtime,
        is_dir,
        content_hash: hashinfo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_parent_handles_root_and_nested() {
        assert_eq!(split_parent("/a/b.txt"), ("/a".to_string(), "b.txt".to_string()));
        assert_eq!(split_parent("/a.txt"), ("/".to_string(), "a.txt".to_string()));
    }
}
