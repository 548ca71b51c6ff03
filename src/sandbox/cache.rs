//! Time-expiring cache of sandbox-prepared files.
//!
//! Stable artifacts (headers, compiled checkers, immutable inputs) are
//! uploaded once and reused across testcases and submissions. Entries that
//! go unused for longer than `expire` are evicted by a background task and
//! deleted on the sandbox side. A failed delete is only a remote resource
//! leak, not a local correctness issue, so deletes are fire-and-forget;
//! they are still joined on `close` for a clean shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{delete_file_raw, PreparedFile};

struct CacheState {
    entries: HashMap<String, (PreparedFile, Instant)>,
    /// In-flight background deletes, joined on close.
    deletes: Vec<JoinHandle<()>>,
    evictor: Option<JoinHandle<()>>,
}

/// Mapping from logical identifier to sandbox file handle with background
/// eviction of entries unused for longer than `expire`.
pub struct FileCache {
    state: Arc<Mutex<CacheState>>,
    http: reqwest::Client,
    endpoint: String,
    expire: Duration,
    recycle_gap: Duration,
}

impl FileCache {
    pub fn new(
        http: reqwest::Client,
        endpoint: String,
        expire: Duration,
        recycle_gap: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                deletes: Vec::new(),
                evictor: None,
            })),
            http,
            endpoint,
            expire,
            recycle_gap,
        }
    }

    /// Look up a cached file, refreshing its last-access time.
    pub fn get(&self, id: &str) -> Option<PreparedFile> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.get_mut(id).map(|(file, last_access)| {
            *last_access = Instant::now();
            file.clone()
        })
    }

    /// Store a file under `id`. A previously stored file for the same id is
    /// scheduled for deletion on the sandbox side.
    pub fn set(&self, id: &str, file: PreparedFile) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((old, _)) = state
            .entries
            .insert(id.to_string(), (file, Instant::now()))
        {
            debug!("Replacing cached file '{}' ({})", id, old.file_id);
            let handle = spawn_delete(self.http.clone(), self.endpoint.clone(), old);
            state.deletes.push(handle);
        }
        if state.evictor.is_none() {
            state.evictor = Some(self.spawn_evictor());
        }
    }

    fn spawn_evictor(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let expire = self.expire;
        let recycle_gap = self.recycle_gap;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(recycle_gap).await;
                let now = Instant::now();
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                let expired: Vec<String> = state
                    .entries
                    .iter()
                    .filter(|(_, (_, last_access))| now.duration_since(*last_access) > expire)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    if let Some((file, _)) = state.entries.remove(&id) {
                        debug!("Evicting cached file '{}' ({})", id, file.file_id);
                        let handle = spawn_delete(http.clone(), endpoint.clone(), file);
                        state.deletes.push(handle);
                    }
                }
            }
        })
    }

    /// Stop the evictor, delete every remaining file, and join all
    /// outstanding delete tasks.
    pub async fn close(&self) {
        let (entries, deletes, evictor) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (
                std::mem::take(&mut state.entries),
                std::mem::take(&mut state.deletes),
                state.evictor.take(),
            )
        };
        if let Some(evictor) = evictor {
            evictor.abort();
        }
        let mut handles = deletes;
        for (id, (file, _)) in entries {
            debug!("Deleting cached file '{}' ({}) on close", id, file.file_id);
            handles.push(spawn_delete(self.http.clone(), self.endpoint.clone(), file));
        }
        for handle in handles {
            let _ = handle.await;
        }
        debug!("File cache closed");
    }
}

fn spawn_delete(http: reqwest::Client, endpoint: String, file: PreparedFile) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = delete_file_raw(&http, &endpoint, &file.file_id).await {
            warn!("Failed to delete cached file '{}': {}", file.file_id, e);
        }
    })
}
