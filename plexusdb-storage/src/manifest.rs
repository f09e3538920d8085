//! The manifest: authoritative index of segment pages, tombstones and
//! orphans for one epoch. Written via `manifest.json.tmp` + atomic rename so
//! readers and crash recovery only ever observe a complete document.

use crate::options::CompressionConfig;
use crate::segment::Order;
use crate::{EdgeKey, Error, PAGE_SIZE, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write as _;
use std::path::Path;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    pub primary_value: u32,
    pub offset: u64,
    /// Stored byte count; equals `raw_length` when the page is uncompressed.
    pub length: u32,
    pub raw_length: u32,
    pub crc32: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLookup {
    pub order: Order,
    pub pages: Vec<PageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderOrphans {
    pub order: Order,
    pub pages: Vec<PageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub page_size: u32,
    pub created_at: String,
    pub compression: CompressionConfig,
    pub epoch: u64,
    pub lookups: Vec<OrderLookup>,
    /// Deleted triples still physically present in some ordering.
    pub tombstones: Vec<[u32; 3]>,
    /// Pages displaced by incremental compaction, awaiting GC.
    pub orphans: Vec<OrderOrphans>,
}

impl Manifest {
    pub fn empty(page_size: u32, compression: CompressionConfig) -> Self {
        Self {
            version: MANIFEST_VERSION,
            page_size,
            created_at: chrono::Utc::now().to_rfc3339(),
            compression,
            epoch: 0,
            lookups: Order::ALL
                .iter()
                .map(|&order| OrderLookup { order, pages: Vec::new() })
                .collect(),
            tombstones: Vec::new(),
            orphans: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| Error::ManifestUnreadable(format!("{}: {e}", path.display())))?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::ManifestUnreadable(format!("{}: {e}", path.display())))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::ManifestUnreadable(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        if manifest.page_size as usize != PAGE_SIZE {
            return Err(Error::UnsupportedPageSize(manifest.page_size as u64));
        }
        Ok(manifest)
    }

    /// Load the manifest if present, otherwise a fresh empty one.
    pub fn load_or_default(path: &Path, compression: CompressionConfig) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::empty(PAGE_SIZE as u32, compression))
        }
    }

    /// Write atomically: serialize to `<path>.tmp`, fsync, rename over.
    pub fn store(&self, path: &Path, tmp_path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| {
            Error::ManifestUnreadable(format!("manifest serialization failed: {e}"))
        })?;
        {
            let mut file = fs::File::create(tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, path)?;
        Ok(())
    }

    pub fn lookup_mut(&mut self, order: Order) -> &mut OrderLookup {
        if let Some(i) = self.lookups.iter().position(|l| l.order == order) {
            return &mut self.lookups[i];
        }
        self.lookups.push(OrderLookup { order, pages: Vec::new() });
        self.lookups.last_mut().unwrap()
    }

    pub fn orphans_mut(&mut self, order: Order) -> &mut OrderOrphans {
        if let Some(i) = self.orphans.iter().position(|o| o.order == order) {
            return &mut self.orphans[i];
        }
        self.orphans.push(OrderOrphans { order, pages: Vec::new() });
        self.orphans.last_mut().unwrap()
    }

    pub fn tombstone_set(&self) -> HashSet<EdgeKey> {
        self.tombstones
            .iter()
            .map(|[s, p, o]| EdgeKey { src: *s, rel: *p, dst: *o })
            .collect()
    }

    pub fn set_tombstones(&mut self, tombstones: impl IntoIterator<Item = EdgeKey>) {
        self.tombstones = tombstones
            .into_iter()
            .map(|e| [e.src, e.rel, e.dst])
            .collect();
        self.tombstones.sort_unstable();
        self.tombstones.dedup();
    }

    pub fn add_tombstone(&mut self, e: EdgeKey) {
        let entry = [e.src, e.rel, e.dst];
        if let Err(i) = self.tombstones.binary_search(&entry) {
            self.tombstones.insert(i, entry);
        }
    }

    pub fn orphan_page_count(&self) -> usize {
        self.orphans.iter().map(|o| o.pages.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let tmp = dir.path().join("manifest.json.tmp");

        let mut manifest = Manifest::empty(PAGE_SIZE as u32, CompressionConfig::default());
        manifest.epoch = 3;
        manifest.lookup_mut(Order::Spo).pages.push(PageRecord {
            primary_value: 1,
            offset: 0,
            length: 16,
            raw_length: 16,
            crc32: 0xDEAD_BEEF,
        });
        manifest.add_tombstone(EdgeKey { src: 1, rel: 2, dst: 3 });
        manifest.store(&path, &tmp).unwrap();
        assert!(!tmp.exists());

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded.epoch, 3);
        assert_eq!(loaded.lookups.len(), 6);
        assert_eq!(loaded.tombstones, vec![[1, 2, 3]]);
        assert!(loaded.tombstone_set().contains(&EdgeKey { src: 1, rel: 2, dst: 3 }));
    }

    #[test]
    fn garbage_is_manifest_unreadable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            Manifest::load(&path),
            Err(Error::ManifestUnreadable(_))
        ));
    }

    #[test]
    fn missing_manifest_defaults_to_empty() {
        let dir = tempdir().unwrap();
        let manifest = Manifest::load_or_default(
            &dir.path().join("manifest.json"),
            CompressionConfig::default(),
        )
        .unwrap();
        assert_eq!(manifest.epoch, 0);
        assert!(manifest.tombstones.is_empty());
    }
}
