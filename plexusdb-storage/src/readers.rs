//! The reader registry: one small JSON file per live snapshot, so
//! maintenance tools (compact, GC) running against the same database can
//! honor `respect_readers` even across processes.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReaderFile {
    pid: u32,
    session_id: String,
    pinned_epochs: Vec<u64>,
    started_at: String,
}

#[derive(Debug)]
pub struct ReaderRegistry {
    dir: PathBuf,
    session_id: String,
    max_readers: u32,
    pins: Mutex<HashMap<u64, usize>>,
}

impl ReaderRegistry {
    pub fn new(dir: PathBuf, session_id: String, max_readers: u32) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            session_id,
            max_readers,
            pins: Mutex::new(HashMap::new()),
        })
    }

    /// Pin `epoch` for one snapshot. The returned ticket unpins on drop.
    pub fn register(self: &Arc<Self>, epoch: u64) -> Result<ReaderTicket> {
        let ticket_id = uuid::Uuid::new_v4().to_string();
        {
            let mut pins = self.pins.lock().unwrap();
            let live: usize = pins.values().sum();
            if live >= self.max_readers as usize {
                return Err(Error::TooManyOpenReaders(self.max_readers));
            }
            *pins.entry(epoch).or_default() += 1;
        }

        let path = self.dir.join(format!("{ticket_id}.json"));
        let record = ReaderFile {
            pid: std::process::id(),
            session_id: self.session_id.clone(),
            pinned_epochs: vec![epoch],
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| Error::ManifestUnreadable(format!("reader record: {e}")))?;
        if let Err(e) = fs::write(&path, json) {
            let mut pins = self.pins.lock().unwrap();
            unpin(&mut pins, epoch);
            return Err(Error::Io(e));
        }

        Ok(ReaderTicket { registry: Arc::clone(self), epoch, path })
    }

    /// Epochs pinned by any live reader, in-process or in registry files
    /// written by other processes.
    pub fn pinned_epochs(&self) -> BTreeSet<u64> {
        let mut epochs: BTreeSet<u64> =
            self.pins.lock().unwrap().keys().copied().collect();

        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let Ok(bytes) = fs::read(entry.path()) else { continue };
                let Ok(record) = serde_json::from_slice::<ReaderFile>(&bytes) else {
                    continue;
                };
                epochs.extend(record.pinned_epochs);
            }
        }
        epochs
    }

    /// True when some live reader pins an epoch older than `epoch`.
    pub fn pins_older_than(&self, epoch: u64) -> bool {
        self.pinned_epochs().iter().any(|&e| e < epoch)
    }

    pub fn live_count(&self) -> usize {
        self.pins.lock().unwrap().values().sum()
    }
}

fn unpin(pins: &mut HashMap<u64, usize>, epoch: u64) {
    if let Some(count) = pins.get_mut(&epoch) {
        *count -= 1;
        if *count == 0 {
            pins.remove(&epoch);
        }
    }
}

#[derive(Debug)]
pub struct ReaderTicket {
    registry: Arc<ReaderRegistry>,
    epoch: u64,
    path: PathBuf,
}

impl ReaderTicket {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for ReaderTicket {
    fn drop(&mut self) {
        let mut pins = self.registry.pins.lock().unwrap();
        unpin(&mut pins, self.epoch);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry(dir: &std::path::Path, max: u32) -> Arc<ReaderRegistry> {
        Arc::new(ReaderRegistry::new(dir.join("readers"), "session".into(), max).unwrap())
    }

    #[test]
    fn register_writes_and_drop_removes_the_file() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path(), 8);

        let ticket = reg.register(3).unwrap();
        assert_eq!(reg.live_count(), 1);
        assert!(reg.pinned_epochs().contains(&3));

        drop(ticket);
        assert_eq!(reg.live_count(), 0);
        assert!(reg.pinned_epochs().is_empty());
        assert_eq!(fs::read_dir(dir.path().join("readers")).unwrap().count(), 0);
    }

    #[test]
    fn reader_cap_is_enforced() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path(), 2);

        let _a = reg.register(1).unwrap();
        let _b = reg.register(1).unwrap();
        assert!(matches!(
            reg.register(1),
            Err(Error::TooManyOpenReaders(2))
        ));
    }

    #[test]
    fn older_pins_are_detected() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path(), 8);

        let _old = reg.register(2).unwrap();
        assert!(reg.pins_older_than(5));
        assert!(!reg.pins_older_than(2));
    }
}
