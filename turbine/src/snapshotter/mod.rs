//! Durable capture of running builds across restarts.
//!
//! On startup, read the snapshot file if one exists and restore each record into the scheduler,
//! then signal readiness; on termination, drain the scheduler and persist whatever builds were
//! still running when the signal arrived. The write goes through a temp-file-then-rename
//! sequence in the same directory as the target path, so a crash mid-encode can never leave a
//! truncated file where a reader expects a complete one.


use crate::model::BuildSnapshot;
use crate::scheduler::Scheduler;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const TMP_SUFFIX: &str = ".tmp";

/// Owns the snapshot file and the scheduler it restores into / persists out of. Lives for the
/// duration of the service: `run` blocks from startup restore through the shutdown persist.
pub struct Snapshotter {
    snapshot_path: PathBuf,
    scheduler: Arc<Scheduler>,
    ready: Arc<Notify>,
    terminate: CancellationToken,
}

impl Snapshotter {
    pub fn new(snapshot_path: impl Into<PathBuf>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            scheduler,
            ready: Arc::new(Notify::new()),
            terminate: CancellationToken::new(),
        }
    }

    /// Fires once startup restore has finished, whether or not a snapshot file existed.
    pub fn ready_signal(&self) -> Arc<Notify> {
        self.ready.clone()
    }

    /// Cancel this to begin the shutdown drain-and-persist sequence.
    pub fn terminate_token(&self) -> CancellationToken {
        self.terminate.clone()
    }

    /// Restores persisted builds, signals readiness, then waits for `terminate_token` to be
    /// cancelled before draining the scheduler and persisting whatever is still running.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.restore().await;
        self.ready.notify_waiters();

        self.terminate.cancelled().await;

        info!("scheduler draining before shutdown");
        let running = self.scheduler.drain().await;

        let mut snapshots = Vec::with_capacity(running.len());
        for scheduled in running {
            snapshots.push(scheduled.to_snapshot().await);
        }

        write_atomically(&self.snapshot_path, &snapshots).await?;
        info!(count = snapshots.len(), path = %self.snapshot_path.display(), "snapshot persisted");
        Ok(())
    }

    async fn restore(&self) {
        let contents = match tokio::fs::read(&self.snapshot_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(error = %e, path = %self.snapshot_path.display(), "could not read snapshot file; starting with no restored builds");
                return;
            }
        };

        let raw_records: Vec<serde_json::Value> = match serde_json::from_slice(&contents) {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, path = %self.snapshot_path.display(), "malformed snapshot file; starting with no restored builds");
                return;
            }
        };

        // Each record is decoded independently: a single record with an unrecognized event
        // type (a forward-incompatible snapshot, e.g. written by a newer version) is logged
        // and skipped rather than failing startup for every other build in the file.
        let mut restored = 0usize;
        for (index, record) in raw_records.into_iter().enumerate() {
            match serde_json::from_value::<BuildSnapshot>(record) {
                Ok(snapshot) => {
                    restored += 1;
                    self.scheduler.restore(snapshot).await;
                }
                Err(e) => {
                    warn!(error = %e, index, path = %self.snapshot_path.display(), "skipping unreadable snapshot record");
                }
            }
        }

        info!(count = restored, "restoring builds from snapshot");
    }
}

async fn write_atomically(path: &Path, snapshots: &[BuildSnapshot]) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(snapshots)?;
    let tmp_path = tmp_path_for(path);

    tokio::fs::write(&tmp_path, &payload).await?;
    tokio::fs::rename(&tmp_path, path).await?;

    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}
