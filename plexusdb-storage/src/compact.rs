//! Compaction and orphan GC.
//!
//! Rewrite mode merges segments with the L0 runs, drops tombstoned triples
//! and repacks every ordering into a fresh file (`<order>.pages.tmp` +
//! atomic rename). Incremental mode rewrites only selected primaries and
//! splices their pages into the manifest, moving the displaced pages onto
//! the orphans list for a later GC pass. Both publish the new manifest with
//! a bumped epoch; a crash at any point leaves the previous epoch intact.

use crate::engine::{Engine, PublishedState};
use crate::l0;
use crate::manifest::{Manifest, PageRecord};
use crate::segment::{self, Order, SegmentStore};
use crate::wal::WalRecord;
use crate::{EdgeKey, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering as AtomicOrdering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactMode {
    #[default]
    Rewrite,
    Incremental,
}

#[derive(Debug, Clone, Default)]
pub struct CompactOptions {
    pub mode: CompactMode,
    /// Restrict rewrite mode to a subset of orderings. A subset repack keeps
    /// the manifest tombstones and the L0 runs: tombstones may only be
    /// dropped once every ordering has been rewritten against the same fact
    /// set, and runs may only be absorbed when all orderings receive them.
    pub orders: Option<Vec<Order>>,
    /// Incremental mode: primaries to rewrite, per ordering. When absent
    /// they are derived from page counts and tombstones.
    pub primaries: Option<HashMap<Order, Vec<u32>>>,
    pub respect_readers: bool,
}

impl CompactOptions {
    pub fn rewrite() -> Self {
        Self { respect_readers: true, ..Self::default() }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactStats {
    pub mode: CompactMode,
    pub epoch: u64,
    pub orders: Vec<Order>,
    pub runs_absorbed: usize,
    pub edges_written: u64,
    pub pages_written: u64,
    pub bytes_written: u64,
    pub tombstones_dropped: u64,
    pub primaries_rewritten: u64,
}

/// Heuristic knobs for [`Engine::auto_compact`]. A primary's score is
/// `w_hot·hot + w_pages·(pages−1) + w_tomb·(tombstones? 1 : 0)`; primaries
/// with `score ≥ min_score` and `hot ≥ min_hot_count` are selected, capped
/// at `max_primaries_per_order`, best scores first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoCompactOptions {
    pub w_hot: f64,
    pub w_pages: f64,
    pub w_tomb: f64,
    pub min_score: f64,
    pub min_hot_count: u64,
    pub min_merge_pages: usize,
    pub max_primaries_per_order: usize,
    pub respect_readers: bool,
}

impl Default for AutoCompactOptions {
    fn default() -> Self {
        Self {
            w_hot: 1.0,
            w_pages: 2.0,
            w_tomb: 4.0,
            min_score: 3.0,
            min_hot_count: 1,
            min_merge_pages: 2,
            max_primaries_per_order: 64,
            respect_readers: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcOptions {
    pub respect_readers: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcStats {
    pub epoch: u64,
    pub orders_rewritten: Vec<Order>,
    pub pages_dropped: u64,
    pub bytes_reclaimed: u64,
    pub skipped_for_readers: bool,
}

impl Engine {
    pub fn compact(&self, opts: CompactOptions) -> Result<CompactStats> {
        let _guard = self.write_lock.lock().unwrap();

        if opts.respect_readers && self.readers.pins_older_than(self.epoch()) {
            return Err(Error::ActiveReadersBlockCompaction);
        }

        match opts.mode {
            CompactMode::Rewrite => self.compact_rewrite(&opts),
            CompactMode::Incremental => {
                let state = self.published.load_full();
                let selections = match &opts.primaries {
                    Some(p) => p.clone(),
                    None => default_incremental_selection(state.store.manifest()),
                };
                self.compact_incremental(selections)
            }
        }
    }

    /// Heuristic-driven incremental compaction; a no-op when nothing scores
    /// above the thresholds.
    pub fn auto_compact(&self, opts: AutoCompactOptions) -> Result<CompactStats> {
        let _guard = self.write_lock.lock().unwrap();

        if opts.respect_readers && self.readers.pins_older_than(self.epoch()) {
            return Err(Error::ActiveReadersBlockCompaction);
        }

        let state = self.published.load_full();
        let selections = score_primaries(&state.store, &opts);
        if selections.is_empty() {
            return Ok(CompactStats {
                mode: CompactMode::Incremental,
                epoch: self.epoch(),
                ..CompactStats::default()
            });
        }
        self.compact_incremental(selections)
    }

    fn compact_rewrite(&self, opts: &CompactOptions) -> Result<CompactStats> {
        let state = self.published.load_full();
        let store = &state.store;
        let full = opts.orders.is_none();
        let orders: Vec<Order> = opts
            .orders
            .clone()
            .unwrap_or_else(|| Order::ALL.to_vec());

        let mut stats = CompactStats {
            mode: CompactMode::Rewrite,
            orders: orders.clone(),
            ..CompactStats::default()
        };

        // Assemble the fact set. A full rewrite absorbs the runs and applies
        // every tombstone; a subset repack only folds the manifest
        // tombstones into the rewritten orderings.
        let mut blocked_nodes: HashSet<u32> = HashSet::new();
        let mut blocked_edges: HashSet<EdgeKey> = HashSet::new();
        let mut facts: Vec<EdgeKey> = Vec::new();
        let mut seen: HashSet<EdgeKey> = HashSet::new();

        if full {
            for run in state.runs.iter() {
                blocked_nodes.extend(run.iter_tombstoned_nodes());
                blocked_edges.extend(run.iter_tombstoned_edges());
                for e in run.iter_edges() {
                    if blocked_nodes.contains(&e.src) || blocked_nodes.contains(&e.dst) {
                        continue;
                    }
                    if blocked_edges.contains(&e) {
                        continue;
                    }
                    if seen.insert(e) {
                        facts.push(e);
                    }
                }
            }
            stats.runs_absorbed = state.runs.len();
        }

        for e in store.scan_order(Order::Spo)? {
            if store.is_tombstoned(&e) || blocked_edges.contains(&e) {
                stats.tombstones_dropped += 1;
                continue;
            }
            if blocked_nodes.contains(&e.src)
                || blocked_nodes.contains(&e.dst)
                || state.ids.is_tombstoned(e.src)
                || state.ids.is_tombstoned(e.dst)
            {
                continue;
            }
            if seen.insert(e) {
                facts.push(e);
            }
        }

        // Repack each selected ordering into a fresh file.
        let mut manifest = store.manifest().clone();
        let comp = self.opts.cold();
        manifest.compression = comp;
        for &order in &orders {
            let builds = segment::build_pages(order, facts.clone(), comp, 0);
            let tmp = self.paths.order_tmp(order);
            {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp)?;
                segment::append_pages(&mut file, &builds)?;
            }
            fs::rename(&tmp, self.paths.order_file(order))?;

            stats.pages_written += builds.len() as u64;
            stats.bytes_written += builds.iter().map(|b| b.bytes.len() as u64).sum::<u64>();
            manifest.lookup_mut(order).pages = builds.into_iter().map(|b| b.record).collect();
            manifest.orphans_mut(order).pages.clear();
        }
        stats.edges_written = facts.len() as u64;

        if full {
            manifest.tombstones.clear();
        }
        manifest.epoch += 1;
        stats.epoch = manifest.epoch;

        // Fold the runs' durable side effects in before dropping them.
        let (new_ids, new_props) = if full {
            let mut idmap = self.idmap.lock().unwrap();
            let mut props = self.props.lock().unwrap();
            for run in state.runs.iter().rev() {
                for (node, key, value) in run.iter_node_props() {
                    props.apply_node(node, key.clone(), value.clone());
                }
                for (edge, key, value) in run.iter_edge_props() {
                    props.apply_edge(edge, key.clone(), value.clone());
                }
            }
            for run in state.runs.iter() {
                for node in run.iter_tombstoned_nodes() {
                    idmap.apply_tombstone(node);
                    props.drop_node(node);
                }
                for edge in run.iter_tombstoned_edges() {
                    props.drop_edge(edge);
                }
            }
            (Arc::new(idmap.clone()), Arc::new(props.clone()))
        } else {
            (state.ids.clone(), state.props.clone())
        };

        self.finish_manifest_swap(manifest, |manifest| {
            let new_store =
                Arc::new(SegmentStore::open(&self.paths.pages_dir(), manifest.clone())?);
            self.publish(|old| PublishedState {
                runs: if full { Arc::new(Vec::new()) } else { old.runs.clone() },
                store: new_store.clone(),
                symbols: old.symbols.clone(),
                ids: new_ids.clone(),
                props: new_props.clone(),
            });
            Ok(())
        })?;

        if full {
            l0::clear(&self.paths)?;
            self.checkpoint_locked()?;
        }

        tracing::info!(
            epoch = stats.epoch,
            edges = stats.edges_written,
            pages = stats.pages_written,
            tombstones_dropped = stats.tombstones_dropped,
            "rewrite compaction finished"
        );
        Ok(stats)
    }

    fn compact_incremental(
        &self,
        selections: HashMap<Order, Vec<u32>>,
    ) -> Result<CompactStats> {
        let state = self.published.load_full();
        let store = &state.store;
        let mut manifest = store.manifest().clone();
        let comp = self.opts.hot();

        let mut stats = CompactStats {
            mode: CompactMode::Incremental,
            orders: selections.keys().copied().collect(),
            ..CompactStats::default()
        };
        stats.orders.sort_unstable();

        // Run tombstones become manifest tombstones: durable at the segment
        // layer, physically dropped from whichever primaries are rewritten
        // below, erased for good by the next full rewrite. The runs
        // themselves are not absorbed here.
        let mut dead: HashSet<EdgeKey> = store.tombstones().clone();
        for run in state.runs.iter() {
            for t in run.iter_tombstoned_edges() {
                manifest.add_tombstone(t);
                dead.insert(t);
            }
        }

        for (&order, primaries) in &selections {
            let path = self.paths.order_file(order);
            let mut file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)?;
            let mut offset = file.metadata()?.len();

            let mut fresh: Vec<PageRecord> = Vec::new();
            let mut rewritten: HashSet<u32> = HashSet::new();
            for &primary in primaries {
                if !rewritten.insert(primary) {
                    continue;
                }
                let edges: Vec<EdgeKey> = store
                    .scan_primary(order, primary)?
                    .into_iter()
                    .filter(|e| {
                        !dead.contains(e)
                            && !state.ids.is_tombstoned(e.src)
                            && !state.ids.is_tombstoned(e.dst)
                    })
                    .collect();

                let builds = segment::build_pages(order, edges, comp, offset);
                segment::append_pages(&mut file, &builds)?;
                for build in builds {
                    offset += build.bytes.len() as u64;
                    stats.bytes_written += build.bytes.len() as u64;
                    stats.edges_written += (build.record.raw_length as u64 - 4) / 12;
                    fresh.push(build.record);
                }
                stats.primaries_rewritten += 1;
            }

            let lookup = manifest.lookup_mut(order);
            let (kept, displaced): (Vec<PageRecord>, Vec<PageRecord>) = lookup
                .pages
                .iter()
                .copied()
                .partition(|p| !rewritten.contains(&p.primary_value));
            stats.pages_written += fresh.len() as u64;

            let mut pages = kept;
            pages.extend(fresh);
            pages.sort_by_key(|p| (p.primary_value, p.offset));
            lookup.pages = pages;
            manifest.orphans_mut(order).pages.extend(displaced);
        }

        manifest.epoch += 1;
        stats.epoch = manifest.epoch;

        self.finish_manifest_swap(manifest, |manifest| {
            let new_store =
                Arc::new(SegmentStore::open(&self.paths.pages_dir(), manifest.clone())?);
            self.publish(|old| PublishedState { store: new_store.clone(), ..old.clone() });
            Ok(())
        })?;

        tracing::info!(
            epoch = stats.epoch,
            primaries = stats.primaries_rewritten,
            orphaned = self.published.load().store.manifest().orphan_page_count(),
            "incremental compaction finished"
        );
        Ok(stats)
    }

    /// Reclaim orphan pages: rewrite each affected ordering file without the
    /// orphan ranges and rebase the surviving offsets.
    pub fn gc(&self, opts: GcOptions) -> Result<GcStats> {
        let _guard = self.write_lock.lock().unwrap();

        let state = self.published.load_full();
        let store = &state.store;
        let mut manifest = store.manifest().clone();

        let mut stats = GcStats { epoch: manifest.epoch, ..GcStats::default() };
        if manifest.orphan_page_count() == 0 {
            return Ok(stats);
        }

        if opts.respect_readers && self.readers.pins_older_than(manifest.epoch) {
            tracing::warn!("gc skipped: readers pin older epochs");
            stats.skipped_for_readers = true;
            return Ok(stats);
        }

        let orders_with_orphans: Vec<Order> = manifest
            .orphans
            .iter()
            .filter(|o| !o.pages.is_empty())
            .map(|o| o.order)
            .collect();

        for &order in &orders_with_orphans {
            let path = self.paths.order_file(order);
            let old_len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

            let tmp = self.paths.order_tmp(order);
            let mut new_records = Vec::new();
            {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp)?;
                let mut offset = 0u64;
                for rec in store.order_pages(order) {
                    let bytes = store.page_bytes(order, rec)?;
                    use std::io::Write as _;
                    file.write_all(&bytes)?;
                    let mut moved = *rec;
                    moved.offset = offset;
                    offset += bytes.len() as u64;
                    new_records.push(moved);
                }
                file.sync_data()?;
                stats.bytes_reclaimed += old_len.saturating_sub(offset);
            }
            fs::rename(&tmp, &path)?;

            let orphans = manifest.orphans_mut(order);
            stats.pages_dropped += orphans.pages.len() as u64;
            orphans.pages.clear();
            manifest.lookup_mut(order).pages = new_records;
            stats.orders_rewritten.push(order);
        }

        manifest.epoch += 1;
        stats.epoch = manifest.epoch;

        self.finish_manifest_swap(manifest, |manifest| {
            let new_store =
                Arc::new(SegmentStore::open(&self.paths.pages_dir(), manifest.clone())?);
            self.publish(|old| PublishedState { store: new_store.clone(), ..old.clone() });
            Ok(())
        })?;

        tracing::info!(
            epoch = stats.epoch,
            pages = stats.pages_dropped,
            bytes = stats.bytes_reclaimed,
            "gc finished"
        );
        Ok(stats)
    }

    /// Atomically link a new manifest: temp file + rename, then the WAL
    /// switch record, then the in-memory publish via `install`.
    pub(crate) fn finish_manifest_swap<F>(&self, manifest: Manifest, install: F) -> Result<()>
    where
        F: FnOnce(&Manifest) -> Result<()>,
    {
        manifest.store(&self.paths.manifest(), &self.paths.manifest_tmp())?;

        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut wal = self.wal.lock().unwrap();
            wal.append(&WalRecord::BeginBatch {
                seq,
                tx_id: uuid::Uuid::new_v4().to_string(),
            })?;
            wal.append(&WalRecord::ManifestSwitch { epoch: manifest.epoch })?;
            wal.append(&WalRecord::CommitBatch { seq })?;
            wal.fsync()?;
        }

        {
            let mut pager = self.pager.lock().unwrap();
            let revision = pager.manifest_revision() + 1;
            pager.set_manifest_revision(revision)?;
        }

        install(&manifest)
    }
}

/// Primaries worth rewriting without heat data: several pages, or tombstones
/// pointing into them.
fn default_incremental_selection(manifest: &Manifest) -> HashMap<Order, Vec<u32>> {
    let tombstones = manifest.tombstone_set();
    let mut out: HashMap<Order, Vec<u32>> = HashMap::new();

    for lookup in &manifest.lookups {
        let mut page_counts: BTreeMap<u32, usize> = BTreeMap::new();
        for page in &lookup.pages {
            *page_counts.entry(page.primary_value).or_default() += 1;
        }
        let tombstone_primaries: HashSet<u32> = tombstones
            .iter()
            .map(|e| lookup.order.primary(*e))
            .collect();

        let selected: Vec<u32> = page_counts
            .iter()
            .filter(|(primary, count)| **count > 1 || tombstone_primaries.contains(primary))
            .map(|(primary, _)| *primary)
            .collect();
        if !selected.is_empty() {
            out.insert(lookup.order, selected);
        }
    }
    out
}

fn score_primaries(
    store: &SegmentStore,
    opts: &AutoCompactOptions,
) -> HashMap<Order, Vec<u32>> {
    let heat = store.heat_snapshot();
    let manifest = store.manifest();
    let tombstones = manifest.tombstone_set();
    let mut out: HashMap<Order, Vec<u32>> = HashMap::new();

    for lookup in &manifest.lookups {
        let mut page_counts: BTreeMap<u32, usize> = BTreeMap::new();
        for page in &lookup.pages {
            *page_counts.entry(page.primary_value).or_default() += 1;
        }
        let tombstone_primaries: HashSet<u32> = tombstones
            .iter()
            .map(|e| lookup.order.primary(*e))
            .collect();

        let mut scored: Vec<(f64, u32)> = Vec::new();
        for (&primary, &pages) in &page_counts {
            let hot = heat.get(&(lookup.order, primary)).copied().unwrap_or(0);
            let has_tombstones = tombstone_primaries.contains(&primary);
            if pages < opts.min_merge_pages && !has_tombstones && hot == 0 {
                continue;
            }

            let score = opts.w_hot * hot as f64
                + opts.w_pages * (pages.saturating_sub(1)) as f64
                + opts.w_tomb * if has_tombstones { 1.0 } else { 0.0 };
            if score >= opts.min_score && hot >= opts.min_hot_count {
                scored.push((score, primary));
            }
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(opts.max_primaries_per_order);
        if !scored.is_empty() {
            out.insert(lookup.order, scored.into_iter().map(|(_, p)| p).collect());
        }
    }
    out
}

/// Maintenance entry point over a closed database path.
pub fn compact_database(base: impl AsRef<Path>, opts: CompactOptions) -> Result<CompactStats> {
    let engine = Engine::open(base)?;
    engine.compact(opts)
}

pub fn auto_compact_database(
    base: impl AsRef<Path>,
    opts: AutoCompactOptions,
) -> Result<CompactStats> {
    let engine = Engine::open(base)?;
    engine.auto_compact(opts)
}

pub fn gc_database(base: impl AsRef<Path>, opts: GcOptions) -> Result<GcStats> {
    let engine = Engine::open(base)?;
    engine.gc(opts)
}
