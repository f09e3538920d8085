//! CSR segment files: the six sort orders and their page codec.
//!
//! Every edge is stored in all six orderings so any prefix query is a prefix
//! scan on one of them. A page holds a sorted slab of triples sharing one
//! primary value (the first component of the ordering's sort key); a primary
//! may span several pages. Pages are CRC'd uncompressed and may be stored
//! Brotli-compressed; the manifest is the authoritative index of offsets.

use crate::manifest::{Manifest, PageRecord};
use crate::options::{Codec, CompressionConfig};
use crate::pager::read_exact_at;
use crate::{EdgeKey, Error, PAGE_SIZE, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Most triples a page payload can carry: `[count u32][(u32,u32,u32)·count]`.
pub const MAX_EDGES_PER_PAGE: usize = (PAGE_SIZE - 4) / 12;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Order {
    #[serde(rename = "SPO")]
    Spo,
    #[serde(rename = "SOP")]
    Sop,
    #[serde(rename = "POS")]
    Pos,
    #[serde(rename = "PSO")]
    Pso,
    #[serde(rename = "OSP")]
    Osp,
    #[serde(rename = "OPS")]
    Ops,
}

impl Order {
    pub const ALL: [Order; 6] = [
        Order::Spo,
        Order::Sop,
        Order::Pos,
        Order::Pso,
        Order::Osp,
        Order::Ops,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Order::Spo => "SPO",
            Order::Sop => "SOP",
            Order::Pos => "POS",
            Order::Pso => "PSO",
            Order::Osp => "OSP",
            Order::Ops => "OPS",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.pages", self.name())
    }

    /// The triple rearranged into this ordering's component order.
    pub fn sort_key(self, e: EdgeKey) -> (u32, u32, u32) {
        match self {
            Order::Spo => (e.src, e.rel, e.dst),
            Order::Sop => (e.src, e.dst, e.rel),
            Order::Pos => (e.rel, e.dst, e.src),
            Order::Pso => (e.rel, e.src, e.dst),
            Order::Osp => (e.dst, e.src, e.rel),
            Order::Ops => (e.dst, e.rel, e.src),
        }
    }

    /// Inverse of [`Order::sort_key`].
    pub fn edge_from_key(self, k: (u32, u32, u32)) -> EdgeKey {
        let (a, b, c) = k;
        match self {
            Order::Spo => EdgeKey { src: a, rel: b, dst: c },
            Order::Sop => EdgeKey { src: a, rel: c, dst: b },
            Order::Pos => EdgeKey { src: c, rel: a, dst: b },
            Order::Pso => EdgeKey { src: b, rel: a, dst: c },
            Order::Osp => EdgeKey { src: b, rel: c, dst: a },
            Order::Ops => EdgeKey { src: c, rel: b, dst: a },
        }
    }

    #[inline]
    pub fn primary(self, e: EdgeKey) -> u32 {
        self.sort_key(e).0
    }
}

impl std::fmt::Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One built page ready to append to an ordering file.
#[derive(Debug)]
pub struct PageBuild {
    pub record: PageRecord,
    pub bytes: Vec<u8>,
}

fn encode_payload(order: Order, edges: &[EdgeKey]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + edges.len() * 12);
    payload.extend_from_slice(&(edges.len() as u32).to_le_bytes());
    for e in edges {
        let (a, b, c) = order.sort_key(*e);
        payload.extend_from_slice(&a.to_le_bytes());
        payload.extend_from_slice(&b.to_le_bytes());
        payload.extend_from_slice(&c.to_le_bytes());
    }
    payload
}

fn compress(payload: &[u8], comp: CompressionConfig) -> Vec<u8> {
    match comp.codec {
        Codec::None => payload.to_vec(),
        Codec::Brotli => {
            let params = brotli::enc::BrotliEncoderParams {
                quality: comp.level as i32,
                ..Default::default()
            };
            let mut out = Vec::with_capacity(payload.len() / 2);
            if brotli::enc::BrotliCompress(&mut &payload[..], &mut out, &params).is_err() {
                return payload.to_vec();
            }
            // Stored-equals-raw means uncompressed on the read side, so a
            // compressed form is only kept when it is strictly smaller.
            if out.len() < payload.len() { out } else { payload.to_vec() }
        }
    }
}

fn decompress(stored: &[u8], raw_length: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(raw_length);
    brotli::BrotliDecompress(&mut &stored[..], &mut out)
        .map_err(|_| Error::StorageCorrupted("segment page failed to decompress"))?;
    Ok(out)
}

/// Pack `edges` (any order) into pages grouped by primary, assigning offsets
/// sequentially from `base_offset`.
pub fn build_pages(
    order: Order,
    mut edges: Vec<EdgeKey>,
    comp: CompressionConfig,
    base_offset: u64,
) -> Vec<PageBuild> {
    edges.sort_by_key(|e| order.sort_key(*e));
    edges.dedup();

    let mut out = Vec::new();
    let mut offset = base_offset;
    let mut i = 0;
    while i < edges.len() {
        let primary = order.primary(edges[i]);
        let mut j = i;
        while j < edges.len() && order.primary(edges[j]) == primary && j - i < MAX_EDGES_PER_PAGE {
            j += 1;
        }

        let payload = encode_payload(order, &edges[i..j]);
        let crc = crc32(&payload);
        let stored = compress(&payload, comp);
        out.push(PageBuild {
            record: PageRecord {
                primary_value: primary,
                offset,
                length: stored.len() as u32,
                raw_length: payload.len() as u32,
                crc32: crc,
            },
            bytes: stored,
        });
        offset += out.last().map(|p| p.bytes.len() as u64).unwrap_or(0);
        i = j;
    }
    out
}

/// Append built pages to an ordering file opened for write.
pub fn append_pages(file: &mut File, pages: &[PageBuild]) -> Result<()> {
    for page in pages {
        file.write_all(&page.bytes)?;
    }
    file.sync_data()?;
    Ok(())
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Read view over the segment files of one manifest epoch.
///
/// Open file handles are kept for the lifetime of the store, so snapshots
/// pinned to this epoch keep reading consistent data even after a newer
/// epoch renames the files underneath.
#[derive(Debug)]
pub struct SegmentStore {
    dir: PathBuf,
    manifest: Manifest,
    files: HashMap<Order, File>,
    tombstones: HashSet<EdgeKey>,
    /// Per-primary lookup counts feeding the compaction heuristic.
    heat: Mutex<HashMap<(Order, u32), u64>>,
}

impl SegmentStore {
    pub fn open(dir: &Path, manifest: Manifest) -> Result<Self> {
        let mut files = HashMap::new();
        for lookup in &manifest.lookups {
            if lookup.pages.is_empty() {
                continue;
            }
            let path = dir.join(lookup.order.file_name());
            let file = File::open(&path).map_err(|e| {
                Error::ManifestUnreadable(format!(
                    "segment file {} unreadable: {e}",
                    path.display()
                ))
            })?;
            files.insert(lookup.order, file);
        }

        let tombstones = manifest.tombstone_set();
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            files,
            tombstones,
            heat: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[inline]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.manifest.epoch
    }

    #[inline]
    pub fn is_tombstoned(&self, e: &EdgeKey) -> bool {
        self.tombstones.contains(e)
    }

    #[inline]
    pub fn tombstones(&self) -> &HashSet<EdgeKey> {
        &self.tombstones
    }

    pub fn order_pages(&self, order: Order) -> &[PageRecord] {
        self.manifest
            .lookups
            .iter()
            .find(|l| l.order == order)
            .map(|l| l.pages.as_slice())
            .unwrap_or(&[])
    }

    /// Decode one page, verifying its CRC against the manifest record.
    pub fn page_edges(&self, order: Order, rec: &PageRecord) -> Result<Vec<EdgeKey>> {
        let Some(file) = self.files.get(&order) else {
            return Err(Error::ManifestUnreadable(format!(
                "no open file for ordering {order}"
            )));
        };

        let mut stored = vec![0u8; rec.length as usize];
        read_exact_at(file, rec.offset, &mut stored)?;

        let raw = if rec.length == rec.raw_length {
            stored
        } else {
            let raw = decompress(&stored, rec.raw_length as usize)?;
            if raw.len() != rec.raw_length as usize {
                return Err(Error::StorageCorrupted("segment page raw length mismatch"));
            }
            raw
        };

        let actual = crc32(&raw);
        if actual != rec.crc32 {
            return Err(Error::PageCorrupt {
                order,
                primary: rec.primary_value,
                offset: rec.offset,
                expected_crc: rec.crc32,
                actual_crc: actual,
            });
        }

        decode_payload(order, &raw)
    }

    /// The stored bytes of one page, unverified. GC moves pages between
    /// files without paying for decompression.
    pub fn page_bytes(&self, order: Order, rec: &PageRecord) -> Result<Vec<u8>> {
        let Some(file) = self.files.get(&order) else {
            return Err(Error::ManifestUnreadable(format!(
                "no open file for ordering {order}"
            )));
        };
        let mut stored = vec![0u8; rec.length as usize];
        read_exact_at(file, rec.offset, &mut stored)?;
        Ok(stored)
    }

    /// All triples whose primary in `order` equals `primary`.
    pub fn scan_primary(&self, order: Order, primary: u32) -> Result<Vec<EdgeKey>> {
        self.note_heat(order, primary);

        let pages = self.order_pages(order);
        let start = pages.partition_point(|p| p.primary_value < primary);
        let mut out = Vec::new();
        for rec in &pages[start..] {
            if rec.primary_value != primary {
                break;
            }
            out.extend(self.page_edges(order, rec)?);
        }
        Ok(out)
    }

    /// Every triple of one ordering, in sort order.
    pub fn scan_order(&self, order: Order) -> Result<Vec<EdgeKey>> {
        let mut out = Vec::new();
        for rec in self.order_pages(order) {
            out.extend(self.page_edges(order, rec)?);
        }
        Ok(out)
    }

    fn note_heat(&self, order: Order, primary: u32) {
        let mut heat = self.heat.lock().unwrap();
        *heat.entry((order, primary)).or_default() += 1;
    }

    pub fn heat_snapshot(&self) -> HashMap<(Order, u32), u64> {
        self.heat.lock().unwrap().clone()
    }
}

fn decode_payload(order: Order, raw: &[u8]) -> Result<Vec<EdgeKey>> {
    if raw.len() < 4 {
        return Err(Error::StorageCorrupted("segment page shorter than header"));
    }
    let count = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
    if raw.len() != 4 + count * 12 {
        return Err(Error::StorageCorrupted("segment page count mismatch"));
    }

    let mut edges = Vec::with_capacity(count);
    for i in 0..count {
        let base = 4 + i * 12;
        let a = u32::from_le_bytes(raw[base..base + 4].try_into().unwrap());
        let b = u32::from_le_bytes(raw[base + 4..base + 8].try_into().unwrap());
        let c = u32::from_le_bytes(raw[base + 8..base + 12].try_into().unwrap());
        edges.push(order.edge_from_key((a, b, c)));
    }
    Ok(edges)
}
