//! Bounded registry of recently committed batch `txId`s.
//!
//! WAL replay skips any batch whose txId is already registered, which makes
//! replay idempotent even if the same log section is applied twice or a
//! caller re-submits a batch after a crash. Capacity is bounded; eviction is
//! LRU by timestamp. Optionally persisted to `P.txids.json`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxIdEntry {
    pub tx_id: String,
    /// UTC milliseconds at commit time; the LRU eviction key.
    pub committed_at_ms: i64,
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    entries: Vec<TxIdEntry>,
}

#[derive(Debug)]
pub struct TxIdRegistry {
    capacity: usize,
    entries: HashMap<String, TxIdEntry>,
    persist_path: Option<PathBuf>,
}

impl TxIdRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            persist_path: None,
        }
    }

    /// Load from `path` if it exists.
    ///
    /// The file is only rewritten by [`TxIdRegistry::persist`], which the
    /// engine calls when a checkpoint truncates the WAL: a txId may only
    /// gate replay once the batch it names is durable outside the log.
    pub fn persistent(path: PathBuf, capacity: usize) -> Result<Self> {
        let mut registry = Self::new(capacity);
        registry.persist_path = Some(path.clone());

        if path.exists() {
            let bytes = fs::read(&path)?;
            let file: RegistryFile = serde_json::from_slice(&bytes)
                .map_err(|e| Error::ManifestUnreadable(format!("{}: {e}", path.display())))?;
            for entry in file.entries {
                registry.entries.insert(entry.tx_id.clone(), entry);
            }
            registry.evict();
        }
        Ok(registry)
    }

    #[inline]
    pub fn contains(&self, tx_id: &str) -> bool {
        self.entries.contains_key(tx_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remember(&mut self, tx_id: &str, session_id: Option<&str>) {
        self.entries.insert(
            tx_id.to_string(),
            TxIdEntry {
                tx_id: tx_id.to_string(),
                committed_at_ms: chrono::Utc::now().timestamp_millis(),
                session_id: session_id.map(str::to_string),
            },
        );
        self.evict();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .values()
                .min_by_key(|e| (e.committed_at_ms, e.tx_id.clone()))
                .map(|e| e.tx_id.clone());
            match oldest {
                Some(tx_id) => {
                    self.entries.remove(&tx_id);
                }
                None => break,
            }
        }
    }

    /// Write the registry file, if this registry is persistent.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let mut entries: Vec<TxIdEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.committed_at_ms.cmp(&b.committed_at_ms));
        let json = serde_json::to_vec_pretty(&RegistryFile { entries })
            .map_err(|e| Error::ManifestUnreadable(format!("txid registry: {e}")))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
