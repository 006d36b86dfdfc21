//! File-lock leader election.
//!
//! The leader holds an exclusive OS advisory lock on a JSON lock file and
//! refreshes the heartbeat inside it. This is advisory coordination for one
//! host or a shared filesystem, not consensus: a paused leader can briefly
//! overlap with its successor until its next heartbeat notices the takeover.

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("Invalid election configuration: {0}")]
    InvalidConfig(String),

    #[error("Lock file error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed leader record: {0}")]
    MalformedRecord(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    pub lock_path: PathBuf,
    pub heartbeat_interval_ms: u64,
    /// A leader whose heartbeat is older than this is presumed dead
    pub stale_threshold_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from(".agent-hive/leader.lock"),
            heartbeat_interval_ms: 5_000,
            stale_threshold_ms: 15_000,
        }
    }
}

impl ElectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn validate(&self) -> Result<(), ElectionError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ElectionError::InvalidConfig(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.stale_threshold_ms <= self.heartbeat_interval_ms.saturating_mul(2) {
            return Err(ElectionError::InvalidConfig(format!(
                "stale_threshold_ms ({}) must exceed twice heartbeat_interval_ms ({})",
                self.stale_threshold_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub agent_id: String,
    pub heartbeat: DateTime<Utc>,
    pub pid: u32,
    pub hostname: String,
    pub elected_at: DateTime<Utc>,
}

impl LeaderRecord {
    fn new(agent_id: &str) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.to_string(),
            heartbeat: now,
            pid: std::process::id(),
            hostname: hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            elected_at: now,
        }
    }
}

/// Read the leader record at `path`; `None` if there is no lock file
pub fn read_leader_record(path: &Path) -> Result<Option<LeaderRecord>, ElectionError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Who appears to hold the lock and when they last proved it.
/// An unreadable record falls back to the file's modification time.
fn observe_holder(path: &Path) -> io::Result<Option<(Option<String>, DateTime<Utc>)>> {
    match read_leader_record(path) {
        Ok(Some(record)) => Ok(Some((Some(record.agent_id), record.heartbeat))),
        Ok(None) => Ok(None),
        Err(ElectionError::Io(e)) => Err(e),
        Err(_) => match fs::metadata(path) {
            Ok(meta) => Ok(Some((None, DateTime::<Utc>::from(meta.modified()?)))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        },
    }
}

fn write_record(file: &mut File, record: &LeaderRecord) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.flush()
}

struct LockHolder {
    release_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

enum Attempt {
    Won,
    Held(Option<(Option<String>, DateTime<Utc>)>),
}

pub struct LeaderElection {
    agent_id: String,
    config: ElectionConfig,
    is_leader: Arc<AtomicBool>,
    observed_leader: Mutex<Option<String>>,
    holder: Mutex<Option<LockHolder>>,
}

impl std::fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElection")
            .field("agent_id", &self.agent_id)
            .field("lock_path", &self.config.lock_path)
            .field("is_leader", &self.is_leader())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LeaderElection {
    pub fn new(agent_id: impl Into<String>, config: ElectionConfig) -> Result<Self, ElectionError> {
        config.validate()?;
        Ok(Self {
            agent_id: agent_id.into(),
            config,
            is_leader: Arc::new(AtomicBool::new(false)),
            observed_leader: Mutex::new(None),
            holder: Mutex::new(None),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Own id while leading, otherwise the last leader seen in the lock file
    pub fn get_leader(&self) -> Option<String> {
        if self.is_leader() {
            return Some(self.agent_id.clone());
        }
        lock(&self.observed_leader).clone()
    }

    pub fn read_record(&self) -> Result<Option<LeaderRecord>, ElectionError> {
        read_leader_record(&self.config.lock_path)
    }

    /// Try to become leader. A stale lock is removed and the attempt
    /// repeated once; losing is not an error.
    pub async fn run_election(&self) -> Result<bool, ElectionError> {
        if self.is_leader() {
            return Ok(true);
        }
        self.reap_holder().await;

        for attempt in 0..2 {
            match self.try_acquire().await? {
                Attempt::Won => {
                    *lock(&self.observed_leader) = Some(self.agent_id.clone());
                    info!(
                        agent_id = %self.agent_id,
                        lock_path = ?self.config.lock_path,
                        "Elected leader"
                    );
                    return Ok(true);
                }
                Attempt::Held(None) => {
                    // lock file vanished between open and read
                    continue;
                }
                Attempt::Held(Some((holder, heartbeat))) => {
                    let age = (Utc::now() - heartbeat).to_std().unwrap_or(Duration::ZERO);
                    if attempt == 0 && age > self.config.stale_threshold() {
                        warn!(
                            agent_id = %self.agent_id,
                            stale_leader = ?holder,
                            heartbeat_age_ms = age.as_millis() as u64,
                            "Removing stale leader lock"
                        );
                        match fs::remove_file(&self.config.lock_path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                        continue;
                    }

                    debug!(agent_id = %self.agent_id, leader = ?holder, "Another agent holds leadership");
                    *lock(&self.observed_leader) = holder;
                    return Ok(false);
                }
            }
        }

        Ok(false)
    }

    async fn try_acquire(&self) -> Result<Attempt, ElectionError> {
        let path = &self.config.lock_path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = match OpenOptions::new().read(true).write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match OpenOptions::new().read(true).write(true).open(path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Attempt::Held(None)),
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let (acquired_tx, acquired_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let handle = tokio::spawn(hold_lock(
            file,
            LeaderRecord::new(&self.agent_id),
            path.clone(),
            self.config.heartbeat_interval(),
            Arc::clone(&self.is_leader),
            acquired_tx,
            release_rx,
        ));

        if acquired_rx.await.unwrap_or(false) {
            *lock(&self.holder) = Some(LockHolder { release_tx, handle });
            return Ok(Attempt::Won);
        }

        Ok(Attempt::Held(observe_holder(path)?))
    }

    /// Clear out a holder task that already stepped down
    async fn reap_holder(&self) {
        let finished = lock(&self.holder).take();
        if let Some(holder) = finished {
            let _ = holder.release_tx.send(());
            let _ = holder.handle.await;
        }
    }

    /// Give up leadership: stop heartbeating, delete the lock file if it is
    /// still ours, then release the OS lock.
    pub async fn resign(&self) {
        let holder = lock(&self.holder).take();
        let Some(holder) = holder else {
            self.is_leader.store(false, Ordering::SeqCst);
            return;
        };

        if let Ok(Some(record)) = self.read_record() {
            if record.agent_id == self.agent_id {
                if let Err(e) = fs::remove_file(&self.config.lock_path) {
                    warn!(agent_id = %self.agent_id, error = %e, "Failed to remove lock file");
                }
            }
        }

        let _ = holder.release_tx.send(());
        let _ = holder.handle.await;
        self.is_leader.store(false, Ordering::SeqCst);
        lock(&self.observed_leader).take();
        info!(agent_id = %self.agent_id, "Resigned leadership");
    }
}

impl Drop for LeaderElection {
    fn drop(&mut self) {
        if let Some(holder) = lock(&self.holder).take() {
            holder.handle.abort();
        }
    }
}

/// Owns the OS lock for as long as this agent leads. Reports through
/// `acquired_tx` whether the lock was taken, then rewrites the heartbeat
/// every `interval` until released or until the file is taken over.
async fn hold_lock(
    file: File,
    mut record: LeaderRecord,
    path: PathBuf,
    interval: Duration,
    is_leader: Arc<AtomicBool>,
    acquired_tx: oneshot::Sender<bool>,
    mut release_rx: oneshot::Receiver<()>,
) {
    let mut file_lock = RwLock::new(file);
    let mut guard = match file_lock.try_write() {
        Ok(guard) => guard,
        Err(_) => {
            let _ = acquired_tx.send(false);
            return;
        }
    };

    if let Err(e) = write_record(&mut guard, &record) {
        warn!(agent_id = %record.agent_id, error = %e, "Failed to write leader record");
        let _ = acquired_tx.send(false);
        return;
    }

    is_leader.store(true, Ordering::SeqCst);
    if acquired_tx.send(true).is_err() {
        is_leader.store(false, Ordering::SeqCst);
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut release_rx => break,
            _ = ticker.tick() => {
                match read_leader_record(&path) {
                    Ok(Some(current)) if current.agent_id == record.agent_id => {}
                    observed => {
                        let holder = match observed {
                            Ok(Some(other)) => Some(other.agent_id),
                            _ => None,
                        };
                        warn!(
                            agent_id = %record.agent_id,
                            new_holder = ?holder,
                            "Lock file taken over, stepping down"
                        );
                        is_leader.store(false, Ordering::SeqCst);
                        return;
                    }
                }

                record.heartbeat = Utc::now();
                if let Err(e) = write_record(&mut guard, &record) {
                    warn!(agent_id = %record.agent_id, error = %e, "Failed to refresh leader heartbeat");
                } else {
                    debug!(agent_id = %record.agent_id, "Leader heartbeat written");
                }
            }
        }
    }

    is_leader.store(false, Ordering::SeqCst);
}
