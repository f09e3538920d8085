//! Advisory single-writer lock: a `P.lock` file created with `create_new`,
//! holding `{pid, startedAt}` as JSON. Acquisition retries with exponential
//! backoff plus jitter; the lock is removed on drop, which also covers
//! normal process-exit paths.

use crate::{Error, Result};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockFile {
    pid: u32,
    started_at: String,
}

#[derive(Debug)]
pub struct DbLock {
    path: PathBuf,
}

impl DbLock {
    pub fn acquire(path: impl AsRef<Path>, retries: u32, backoff_ms: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        for attempt in 0..=retries {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let record = LockFile {
                        pid: std::process::id(),
                        started_at: chrono::Utc::now().to_rfc3339(),
                    };
                    let json = serde_json::to_vec_pretty(&record)
                        .map_err(|e| Error::ManifestUnreadable(format!("lock record: {e}")))?;
                    file.write_all(&json)?;
                    file.sync_all()?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    // A holder that died by signal never ran its Drop; break
                    // its lock instead of timing out.
                    if let Some(holder) = read_holder(&path)
                        && !process_alive(holder.pid)
                    {
                        tracing::warn!(pid = holder.pid, "breaking stale lock of dead process");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if attempt == retries {
                        break;
                    }
                    let base = backoff_ms.saturating_mul(1 << attempt.min(10));
                    let jitter = rand::thread_rng().gen_range(0..=backoff_ms.max(1));
                    std::thread::sleep(Duration::from_millis(base + jitter));
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let holder_pid = read_holder(&path).map(|l| l.pid).unwrap_or(0);
        Err(Error::DatabaseLocked { pid: holder_pid, path })
    }
}

fn read_holder(path: &Path) -> Option<LockFile> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid != 0 && Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // No portable liveness probe; never break another process's lock.
    true
}

impl Drop for DbLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
