//! Cross-process store lock.
//!
//! A lock is a `create_new` file carrying JSON metadata: the holder pid and
//! the acquisition time. Staleness is judged from that recorded time, not
//! the file's mtime, so a crashed holder is reclaimed even when something
//! touched the file afterwards. Contention errors name the holder pid to
//! make "who owns my session store" answerable from the message alone.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::clock::unix_time_ms;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How long to wait for a lock, and when a holder counts as dead.
pub struct LockPolicy {
    pub wait: Duration,
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(2),
            stale_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockMetadata {
    pid: u32,
    acquired_at_unix_ms: u64,
}

#[derive(Debug)]
/// Held lock; releasing is dropping.
pub struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl StoreLock {
    /// Acquires the lock at `path`, polling until the policy's wait budget
    /// runs out. Stale locks left by dead holders are reclaimed in place.
    pub fn acquire(path: &Path, policy: LockPolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create lock directory {}", parent.display())
                })?;
            }
        }

        let started = Instant::now();
        let poll_interval = (policy.wait / 20).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);

        loop {
            match OpenOptions::new().create_new(true).write(true).open(path) {
                Ok(mut file) => {
                    let metadata = LockMetadata {
                        pid: std::process::id(),
                        acquired_at_unix_ms: unix_time_ms(),
                    };
                    let body = serde_json::to_string(&metadata)
                        .context("failed to serialize lock metadata")?;
                    let _ = file.write_all(body.as_bytes());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = read_lock_metadata(path);
                    if is_stale(path, holder.as_ref(), policy.stale_after)
                        && fs::remove_file(path).is_ok()
                    {
                        continue;
                    }
                    if started.elapsed() >= policy.wait {
                        match holder {
                            Some(holder) => bail!(
                                "gave up on lock {} after {:?}; held by pid {} since {}",
                                path.display(),
                                policy.wait,
                                holder.pid,
                                holder.acquired_at_unix_ms
                            ),
                            None => bail!(
                                "gave up on lock {} after {:?}; holder metadata unreadable",
                                path.display(),
                                policy.wait
                            ),
                        }
                    }
                    thread::sleep(poll_interval);
                }
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("failed to create lock {}", path.display()));
                }
            }
        }
    }
}

fn read_lock_metadata(path: &Path) -> Option<LockMetadata> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// A holder is stale once its recorded acquisition time is older than the
/// policy allows. Locks with unreadable metadata (including the pre-JSON
/// format) fall back to the file's age on disk.
fn is_stale(path: &Path, holder: Option<&LockMetadata>, stale_after: Duration) -> bool {
    if stale_after.is_zero() {
        return false;
    }
    let age_ms = match holder {
        Some(holder) => unix_time_ms().saturating_sub(holder.acquired_at_unix_ms),
        None => {
            let Some(modified) = fs::metadata(path).ok().and_then(|meta| meta.modified().ok())
            else {
                return false;
            };
            match modified.elapsed() {
                Ok(age) => u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                Err(_) => 0,
            }
        }
    };
    age_ms >= u64::try_from(stale_after.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{LockMetadata, LockPolicy, StoreLock};
    use crate::clock::unix_time_ms;

    fn quick_policy(wait_ms: u64, stale_ms: u64) -> LockPolicy {
        LockPolicy {
            wait: Duration::from_millis(wait_ms),
            stale_after: Duration::from_millis(stale_ms),
        }
    }

    #[test]
    fn unit_acquire_writes_metadata_and_releases_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock_path = temp.path().join("store.lock");
        {
            let _guard = StoreLock::acquire(&lock_path, quick_policy(200, 0)).expect("lock");
            let raw = std::fs::read_to_string(&lock_path).expect("read lock body");
            let metadata: LockMetadata = serde_json::from_str(&raw).expect("parse metadata");
            assert_eq!(metadata.pid, std::process::id());
            assert!(metadata.acquired_at_unix_ms > 0);
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn functional_contention_error_names_the_holder_pid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock_path = temp.path().join("store.lock");
        let _guard = StoreLock::acquire(&lock_path, quick_policy(200, 0)).expect("lock");
        let error = StoreLock::acquire(&lock_path, quick_policy(80, 0))
            .expect_err("second acquire should time out");
        let message = error.to_string();
        assert!(message.contains("gave up on lock"));
        assert!(message.contains(&format!("held by pid {}", std::process::id())));
    }

    #[test]
    fn regression_staleness_uses_recorded_time_not_mtime() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock_path = temp.path().join("store.lock");
        // A dead holder from two minutes ago; the file itself is brand new,
        // so mtime-based reclaim would refuse this.
        let body = serde_json::to_string(&LockMetadata {
            pid: 0,
            acquired_at_unix_ms: unix_time_ms().saturating_sub(120_000),
        })
        .expect("serialize");
        std::fs::write(&lock_path, body).expect("seed stale lock");
        let _guard = StoreLock::acquire(&lock_path, quick_policy(200, 30_000))
            .expect("stale lock should be reclaimed");
    }

    #[test]
    fn regression_unreadable_metadata_falls_back_to_file_age() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock_path = temp.path().join("store.lock");
        std::fs::write(&lock_path, "12345\n").expect("seed legacy lock");
        std::thread::sleep(Duration::from_millis(25));
        let _guard = StoreLock::acquire(&lock_path, quick_policy(300, 10))
            .expect("legacy lock should be reclaimed by age");
    }
}
