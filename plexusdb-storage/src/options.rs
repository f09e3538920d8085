use crate::{Error, PAGE_SIZE, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compression codec for segment pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    None,
    Brotli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub codec: Codec,
    /// Brotli quality, 1..=11. Ignored for `Codec::None`.
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { codec: Codec::None, level: 5 }
    }
}

impl CompressionConfig {
    pub fn brotli(level: u32) -> Self {
        Self { codec: Codec::Brotli, level }
    }

    fn validate(&self) -> Result<()> {
        if self.codec == Codec::Brotli && !(1..=11).contains(&self.level) {
            return Err(Error::InvalidArgument("brotli level must be in 1..=11"));
        }
        Ok(())
    }
}

/// Where frozen MemTables live until compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StagingMode {
    /// L0 runs are WAL-only; recovery rebuilds them by replay.
    #[default]
    #[serde(rename = "classic")]
    Classic,
    /// Frozen runs are also spilled as L0 segment files listed in
    /// `lsm-manifest.json`, which lets a checkpoint truncate the WAL while
    /// runs are still pending compaction.
    #[serde(rename = "lsm-lite")]
    LsmLite,
}

/// Options recognized on `Engine::open_with`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    /// Only 8192 is supported; anything else fails the open.
    pub page_size: u32,
    /// Codec for pages written outside compaction tiering.
    pub compression: CompressionConfig,
    /// Override used by incremental compaction for freshly spliced pages.
    pub hot_compression: Option<CompressionConfig>,
    /// Override used by rewrite compaction for full repacks.
    pub cold_compression: Option<CompressionConfig>,
    /// Persist the txId de-duplication registry across opens.
    pub enable_persistent_tx_dedupe: bool,
    /// Capacity of the txId registry; LRU-evicted by timestamp beyond this.
    pub max_remember_tx_ids: u32,
    pub staging_mode: StagingMode,
    /// Cap on concurrently registered snapshots.
    pub max_open_readers: u32,
    /// Lock acquisition attempts before `DatabaseLocked`.
    pub lock_retries: u32,
    /// Base backoff between lock attempts; doubles each retry plus jitter.
    pub lock_backoff_ms: u64,
    /// Forward-compatible bag; unknown keys are ignored with a warning.
    pub experimental: BTreeMap<String, serde_json::Value>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE as u32,
            compression: CompressionConfig::default(),
            hot_compression: None,
            cold_compression: None,
            enable_persistent_tx_dedupe: false,
            max_remember_tx_ids: 1024,
            staging_mode: StagingMode::Classic,
            max_open_readers: 256,
            lock_retries: 5,
            lock_backoff_ms: 20,
            experimental: BTreeMap::new(),
        }
    }
}

const KNOWN_EXPERIMENTAL: &[&str] = &[];

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.page_size as usize != PAGE_SIZE {
            return Err(Error::UnsupportedPageSize(self.page_size as u64));
        }
        self.compression.validate()?;
        if let Some(hot) = &self.hot_compression {
            hot.validate()?;
        }
        if let Some(cold) = &self.cold_compression {
            cold.validate()?;
        }
        if self.max_remember_tx_ids == 0 {
            return Err(Error::InvalidArgument("maxRememberTxIds must be positive"));
        }
        for key in self.experimental.keys() {
            if !KNOWN_EXPERIMENTAL.contains(&key.as_str()) {
                tracing::warn!(key, "ignoring unknown experimental option");
            }
        }
        Ok(())
    }

    /// Compression used when incremental compaction splices fresh pages.
    pub fn hot(&self) -> CompressionConfig {
        self.hot_compression.unwrap_or(self.compression)
    }

    /// Compression used when rewrite compaction repacks an ordering.
    pub fn cold(&self) -> CompressionConfig {
        self.cold_compression.unwrap_or(self.compression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn rejects_foreign_page_size() {
        let opts = Options { page_size: 4096, ..Options::default() };
        assert!(matches!(opts.validate(), Err(Error::UnsupportedPageSize(4096))));
    }

    #[test]
    fn rejects_out_of_range_brotli_level() {
        let opts = Options {
            compression: CompressionConfig::brotli(12),
            ..Options::default()
        };
        assert!(matches!(opts.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn tier_fallback_uses_base_compression() {
        let opts = Options {
            compression: CompressionConfig::brotli(5),
            cold_compression: Some(CompressionConfig::brotli(11)),
            ..Options::default()
        };
        assert_eq!(opts.hot(), CompressionConfig::brotli(5));
        assert_eq!(opts.cold(), CompressionConfig::brotli(11));
    }
}
