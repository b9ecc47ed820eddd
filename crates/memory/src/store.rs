//! Session memory with a bounded rolling window and rolling summary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use healmate_common::{HealmateError, Result, RetryPolicy, Turn, with_retry};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::types::{MemoryConfig, Session};

/// Folds evicted turns into a session's rolling summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `evicted` is oldest first; the result replaces `previous`.
    async fn summarize(&self, previous: &str, evicted: &[Turn]) -> Result<String>;
}

/// Outcome of [`MemoryStore::append_turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub evicted: usize,
    pub summarized: bool,
}

struct SessionSlot {
    state: RwLock<Session>,
    /// Held from eviction until the summary is folded, so folds apply in
    /// eviction order.
    fold: Arc<Mutex<()>>,
}

/// A turn already in the window whose evicted turns still wait to be
/// folded into the summary. See [`MemoryStore::fold_summary`].
pub struct PendingSummary {
    user_id: String,
    slot: Arc<SessionSlot>,
    evicted: Vec<Turn>,
    fold_guard: OwnedMutexGuard<()>,
}

impl PendingSummary {
    pub fn evicted(&self) -> usize {
        self.evicted.len()
    }
}

/// The main memory store.
///
/// Sessions live in memory and are optionally mirrored to JSON snapshots.
/// Reads never wait on the summarizer.
pub struct MemoryStore {
    config: MemoryConfig,
    sessions: parking_lot::RwLock<HashMap<String, Arc<SessionSlot>>>,
    summarizer: Arc<dyn Summarizer>,
    snapshots: Option<SnapshotDir>,
    summary_failures: AtomicU64,
}

impl MemoryStore {
    pub fn new(config: MemoryConfig, summarizer: Arc<dyn Summarizer>) -> Result<Self> {
        if config.window_size == 0 {
            return Err(HealmateError::Config(
                "memory window_size must be at least 1".to_string(),
            ));
        }

        let snapshots = config
            .snapshot_dir
            .as_ref()
            .map(|dir| SnapshotDir::new(dir.clone(), config.retry.clone()));

        info!(
            window_size = config.window_size,
            snapshots = ?config.snapshot_dir,
            "Initializing memory store"
        );

        Ok(Self {
            config,
            sessions: parking_lot::RwLock::new(HashMap::new()),
            summarizer,
            snapshots,
            summary_failures: AtomicU64::new(0),
        })
    }

    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    /// Number of evictions whose summarization failed.
    pub fn summary_failures(&self) -> u64 {
        self.summary_failures.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    async fn slot(&self, user_id: &str) -> Result<Arc<SessionSlot>> {
        if user_id.trim().is_empty() {
            return Err(HealmateError::validation("session id must not be empty"));
        }
        if let Some(slot) = self.sessions.read().get(user_id) {
            return Ok(slot.clone());
        }

        let loaded = match &self.snapshots {
            Some(snapshots) => snapshots.load(user_id).await.unwrap_or_else(|e| {
                warn!(user_id, error = %e, "Failed to load session snapshot, starting fresh");
                None
            }),
            None => None,
        };

        let mut sessions = self.sessions.write();
        let slot = sessions.entry(user_id.to_string()).or_insert_with(|| {
            let session = loaded.unwrap_or_else(|| {
                debug!(user_id, "Creating new session");
                Session::new(user_id)
            });
            Arc::new(SessionSlot {
                state: RwLock::new(session),
                fold: Arc::new(Mutex::new(())),
            })
        });
        Ok(slot.clone())
    }

    /// Snapshot of the session, created empty if unknown.
    pub async fn load_session(&self, user_id: &str) -> Result<Session> {
        let slot = self.slot(user_id).await?;
        let session = slot.state.read().await.clone();
        Ok(session)
    }

    /// Hand out the next monotonic turn id for a session.
    pub async fn reserve_turn_id(&self, user_id: &str) -> Result<u64> {
        let slot = self.slot(user_id).await?;
        let mut session = slot.state.write().await;
        let id = session.next_turn_id;
        session.next_turn_id += 1;
        Ok(id)
    }

    pub async fn set_fact(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        let slot = self.slot(user_id).await?;
        let snapshot = {
            let mut session = slot.state.write().await;
            session.facts.insert(key.to_string(), value.to_string());
            session.clone()
        };
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Snapshot of a session that has been seen before, without creating it.
    pub async fn get_session(&self, user_id: &str) -> Result<Option<Session>> {
        if user_id.trim().is_empty() {
            return Ok(None);
        }
        let known = self.sessions.read().get(user_id).cloned();
        let slot = match known {
            Some(slot) => slot,
            None => {
                let on_disk = match &self.snapshots {
                    Some(snapshots) => snapshots.load(user_id).await?,
                    None => None,
                };
                if on_disk.is_none() {
                    return Ok(None);
                }
                self.slot(user_id).await?
            }
        };
        let session = slot.state.read().await.clone();
        Ok(Some(session))
    }

    /// Append a sealed turn, evicting and summarizing past the window size.
    ///
    /// Summarization is one batched call per append. When it fails or runs
    /// past `summary_timeout_ms` the evicted turns are dropped unsummarized
    /// and the failure counter grows.
    pub async fn append_turn(&self, user_id: &str, turn: Turn) -> Result<AppendOutcome> {
        let pending = self.push_turn(user_id, turn).await?;
        Ok(self.fold_summary(pending).await)
    }

    /// First half of [`append_turn`](Self::append_turn): put the turn in the
    /// window and evict past the window size. The returned value holds the
    /// session's fold lock until it is passed to
    /// [`fold_summary`](Self::fold_summary).
    pub async fn push_turn(&self, user_id: &str, turn: Turn) -> Result<PendingSummary> {
        let slot = self.slot(user_id).await?;
        let fold_guard = slot.fold.clone().lock_owned().await;

        let turn_id = turn.id;
        let evicted = {
            let mut session = slot.state.write().await;
            session.window.push_back(turn);
            session.last_active = Utc::now();
            if session.next_turn_id <= turn_id {
                session.next_turn_id = turn_id + 1;
            }

            let mut evicted = Vec::new();
            while session.window.len() > self.config.window_size {
                if let Some(old) = session.window.pop_front() {
                    evicted.push(old);
                }
            }
            session.evicted_turns += evicted.len() as u64;
            evicted
        };

        Ok(PendingSummary {
            user_id: user_id.to_string(),
            slot,
            evicted,
            fold_guard,
        })
    }

    /// Second half of [`append_turn`](Self::append_turn): fold the evicted
    /// turns into the summary, bounded by `summary_timeout_ms`, and persist.
    pub async fn fold_summary(&self, pending: PendingSummary) -> AppendOutcome {
        let PendingSummary {
            user_id,
            slot,
            evicted,
            fold_guard,
        } = pending;

        let mut summarized = false;
        if !evicted.is_empty() {
            debug!(user_id, evicted = evicted.len(), "Folding evicted turns into summary");
            let previous = slot.state.read().await.summary.clone();
            let timeout_ms = self.config.summary_timeout_ms;
            let result = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.summarizer.summarize(&previous, &evicted),
            )
            .await
            .unwrap_or_else(|_| {
                Err(HealmateError::upstream(
                    "summarizer",
                    format!("no summary within {timeout_ms} ms"),
                ))
            });

            match result {
                Ok(summary) => {
                    slot.state.write().await.summary = summary;
                    summarized = true;
                }
                Err(e) => {
                    let failures = self.summary_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        user_id,
                        evicted = evicted.len(),
                        failures,
                        error = %e,
                        "Summary generation failed, evicted turns dropped"
                    );
                }
            }
        }

        let snapshot = slot.state.read().await.clone();
        self.persist(&snapshot).await;
        drop(fold_guard);

        AppendOutcome {
            evicted: evicted.len(),
            summarized,
        }
    }

    async fn persist(&self, session: &Session) {
        if let Some(snapshots) = &self.snapshots {
            if let Err(e) = snapshots.save(session).await {
                warn!(user_id = %session.user_id, error = %e, "Failed to write session snapshot");
            }
        }
    }
}

/// JSON snapshot directory, one file per session.
struct SnapshotDir {
    dir: PathBuf,
    retry: RetryPolicy,
}

impl SnapshotDir {
    fn new(dir: PathBuf, retry: RetryPolicy) -> Self {
        Self { dir, retry }
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        let encoded: String = user_id.bytes().map(|b| format!("{b:02x}")).collect();
        self.dir.join(format!("{encoded}.json"))
    }

    async fn load(&self, user_id: &str) -> Result<Option<Session>> {
        let path = self.path_for(user_id);
        let bytes = with_retry(&self.retry, "snapshot.load", || read_if_exists(&path)).await?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.user_id);
        let bytes = serde_json::to_vec_pretty(session)?;
        with_retry(&self.retry, "snapshot.save", || {
            write_atomic(&self.dir, &path, &bytes)
        })
        .await
    }
}

async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(HealmateError::upstream("session-snapshot", e.to_string())),
    }
}

async fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let io_err = |e: std::io::Error| HealmateError::upstream("session-snapshot", e.to_string());
    tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}
