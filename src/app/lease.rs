use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::OrchestratorError;
use crate::manuscript::{self, BookLayout};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// A lease whose heartbeat is older than this belongs to a dead process.
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// `state/lease.json`: who is driving the run right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseDocument {
    pub run_id: String,
    pub owner: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LeaseDocument {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.heartbeat_at);
        age.to_std().is_ok_and(|age| age > STALE_AFTER)
    }
}

/// Exclusive hold on a book's `chapters/` and `state/` while a run loop is live.
/// The heartbeat task keeps the lease fresh until [`RunLease::release`].
#[derive(Debug)]
pub struct RunLease {
    path: PathBuf,
    owner: String,
    heartbeat: Option<JoinHandle<()>>,
}

impl RunLease {
    /// Takes the lease for `run_id`. A fresh lease held by someone else is
    /// refused unless `force`; a stale or unreadable one is taken over.
    pub fn acquire(layout: &BookLayout, run_id: &str, force: bool) -> anyhow::Result<Self> {
        let path = layout.lease_path();
        let now = Utc::now();
        let doc = LeaseDocument {
            run_id: run_id.to_owned(),
            owner: uuid::Uuid::new_v4().simple().to_string(),
            pid: std::process::id(),
            acquired_at: now,
            heartbeat_at: now,
        };

        for _ in 0..2 {
            if create_exclusive(&path, &doc)? {
                tracing::debug!(run_id, owner = %doc.owner, "run lease acquired");
                let heartbeat = spawn_heartbeat(path.clone(), doc.clone());
                return Ok(Self {
                    path,
                    owner: doc.owner,
                    heartbeat: Some(heartbeat),
                });
            }

            match read_lease(&path) {
                Some(held) if !force && !held.is_stale(Utc::now()) => {
                    return Err(OrchestratorError::RunLocked {
                        run_id: held.run_id,
                        pid: held.pid,
                        heartbeat_at: held.heartbeat_at,
                    }
                    .into());
                }
                held => {
                    tracing::warn!(
                        run_id,
                        previous = ?held.as_ref().map(|h| (h.pid, h.heartbeat_at)),
                        force,
                        "taking over run lease"
                    );
                    remove_if_exists(&path)?;
                }
            }
        }
        anyhow::bail!("could not acquire run lease: {}", path.display())
    }

    /// Stops the heartbeat and drops the lease file if it is still ours.
    pub async fn release(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
            let _ = heartbeat.await;
        }
        match read_lease(&self.path) {
            Some(held) if held.owner == self.owner => {
                if let Err(err) = remove_if_exists(&self.path) {
                    tracing::warn!(?err, "remove run lease");
                }
            }
            _ => tracing::warn!(path = %self.path.display(), "run lease was taken over"),
        }
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

pub fn read_lease(path: &Path) -> Option<LeaseDocument> {
    match manuscript::read_json_file(path) {
        Ok(doc) => doc,
        Err(err) => {
            tracing::warn!(?err, "unreadable run lease");
            None
        }
    }
}

/// Publishes a complete document at `path` only if nothing is there yet.
fn create_exclusive(path: &Path, doc: &LeaseDocument) -> anyhow::Result<bool> {
    let tmp = path.with_extension(format!("tmp.{}", doc.owner));
    manuscript::write_json_file(&tmp, doc)?;
    let linked = std::fs::hard_link(&tmp, path);
    let _ = std::fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("create run lease: {}", path.display())),
    }
}

fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove: {}", path.display())),
    }
}

// Writes are synchronous so that an aborted heartbeat has none in flight.
fn spawn_heartbeat(path: PathBuf, mut doc: LeaseDocument) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            doc.heartbeat_at = Utc::now();
            if let Err(err) = manuscript::write_json_file(&path, &doc) {
                tracing::warn!(?err, "refresh run lease");
            }
        }
    })
}
