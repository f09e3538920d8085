//! The engine facade: lifecycle, the single-writer lock, batch transactions,
//! snapshot publication, WAL recovery and checkpointing.
//!
//! Write path: WAL append (fsync per the batch's durability flag) → apply to
//! the id/symbol tables → freeze the MemTable into an L0 run → publish one
//! new immutable state for readers. Read path: grab the published state,
//! register the pinned epoch in the reader registry, merge layers on demand.

use crate::blob::BlobStore;
use crate::dedupe::TxIdRegistry;
use crate::idmap::IdMap;
use crate::l0;
use crate::lock::DbLock;
use crate::manifest::Manifest;
use crate::memtable::MemTable;
use crate::options::{Options, StagingMode};
use crate::pager::Pager;
use crate::paths::DbPaths;
use crate::property::{self, PropertyTable};
use crate::readers::ReaderRegistry;
use crate::segment::SegmentStore;
use crate::snapshot::{L0Run, Snapshot};
use crate::symbols::SymbolTable;
use crate::wal::{CommittedBatch, Wal, WalRecord};
use crate::{
    EdgeKey, Error, ExternalId, InternalNodeId, PropertyValue, RelTypeId, Result, SymbolId,
};
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Everything a snapshot needs, swapped as one unit so readers never observe
/// a half-published commit.
#[derive(Clone)]
pub(crate) struct PublishedState {
    pub(crate) runs: Arc<Vec<Arc<L0Run>>>,
    pub(crate) store: Arc<SegmentStore>,
    pub(crate) symbols: Arc<SymbolTable>,
    pub(crate) ids: Arc<IdMap>,
    pub(crate) props: Arc<PropertyTable>,
}

pub struct Engine {
    pub(crate) paths: DbPaths,
    pub(crate) opts: Options,
    _lock: DbLock,
    pub(crate) pager: Mutex<Pager>,
    pub(crate) wal: Mutex<Wal>,
    pub(crate) idmap: Mutex<IdMap>,
    pub(crate) symbols: Mutex<SymbolTable>,
    pub(crate) props: Mutex<PropertyTable>,
    pub(crate) dedupe: Mutex<TxIdRegistry>,
    pub(crate) published: ArcSwap<PublishedState>,
    pub(crate) readers: Arc<ReaderRegistry>,
    pub(crate) write_lock: Mutex<()>,
    pub(crate) next_seq: AtomicU64,
    session_id: String,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(base, Options::default())
    }

    pub fn open_with(base: impl AsRef<Path>, opts: Options) -> Result<Self> {
        opts.validate()?;
        let paths = DbPaths::new(base);

        if let Some(parent) = paths.ndb().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(paths.pages_dir())?;

        let lock = DbLock::acquire(paths.lock(), opts.lock_retries, opts.lock_backoff_ms)?;
        remove_stale_tmp_files(&paths)?;

        let mut pager = Pager::open(paths.ndb())?;

        let mut dedupe = if opts.enable_persistent_tx_dedupe {
            TxIdRegistry::persistent(paths.txids(), opts.max_remember_tx_ids as usize)?
        } else {
            TxIdRegistry::new(opts.max_remember_tx_ids as usize)
        };

        // Checkpoint tables, if a checkpoint has ever been written.
        let mut idmap = IdMap::new();
        let mut symbols = SymbolTable::new();
        if let Some(root) = pager.interner_root() {
            let bytes = BlobStore::read(&pager, root)?;
            let mut pos = 0;
            idmap = IdMap::decode(&bytes, &mut pos)?;
            symbols = SymbolTable::decode(&bytes, &mut pos)?;
            if pos != bytes.len() {
                return Err(Error::StorageCorrupted("trailing bytes after interner table"));
            }
        }
        let mut props = PropertyTable::default();
        if let Some(root) = pager.property_root() {
            props = PropertyTable::decode(&BlobStore::read(&pager, root)?)?;
        }

        let manifest = Manifest::load_or_default(&paths.manifest(), opts.compression)?;
        let store = SegmentStore::open(&paths.pages_dir(), manifest)?;

        // L0 spill files (lsm-lite) are loaded first; WAL batches whose seq
        // is already covered only contribute their id/symbol ops.
        let spilled_runs = if opts.staging_mode == StagingMode::LsmLite {
            l0::load_runs(&paths)?
        } else {
            Vec::new()
        };
        let spilled_seqs: HashSet<u64> = spilled_runs.iter().map(|r| r.seq()).collect();

        let wal = Wal::open(paths.wal())?;
        let batches = wal.read_committed()?;
        let mut max_seq = spilled_seqs.iter().copied().max().unwrap_or(0);
        let mut wal_runs: Vec<Arc<L0Run>> = Vec::new();
        let mut replayed = 0u64;
        let mut skipped = 0u64;

        for batch in &batches {
            max_seq = max_seq.max(batch.seq);
            if dedupe.contains(&batch.tx_id) {
                skipped += 1;
                continue;
            }
            let use_graph_ops = !spilled_seqs.contains(&batch.seq);
            let run = replay_batch(&mut pager, &mut idmap, &mut symbols, batch, use_graph_ops)?;
            if let Some(run) = run {
                wal_runs.push(Arc::new(run));
            }
            dedupe.remember(&batch.tx_id, None);
            replayed += 1;
        }

        let mut runs: Vec<Arc<L0Run>> = spilled_runs.into_iter().map(Arc::new).collect();
        runs.extend(wal_runs);
        runs.sort_by_key(|r| r.seq());
        runs.reverse(); // newest first for the read path

        tracing::info!(
            base = %paths.base().display(),
            epoch = store.epoch(),
            batches = replayed,
            deduped = skipped,
            runs = runs.len(),
            nodes = idmap.len(),
            "database opened"
        );

        let session_id = uuid::Uuid::new_v4().to_string();
        let readers = Arc::new(ReaderRegistry::new(
            paths.readers_dir(),
            session_id.clone(),
            opts.max_open_readers,
        )?);

        let published = PublishedState {
            runs: Arc::new(runs),
            store: Arc::new(store),
            symbols: Arc::new(symbols.clone()),
            ids: Arc::new(idmap.clone()),
            props: Arc::new(props.clone()),
        };

        Ok(Self {
            paths,
            opts,
            _lock: lock,
            pager: Mutex::new(pager),
            wal: Mutex::new(wal),
            idmap: Mutex::new(idmap),
            symbols: Mutex::new(symbols),
            props: Mutex::new(props),
            dedupe: Mutex::new(dedupe),
            published: ArcSwap::from_pointee(published),
            readers,
            write_lock: Mutex::new(()),
            next_seq: AtomicU64::new(max_seq.saturating_add(1).max(1)),
            session_id,
        })
    }

    #[inline]
    pub fn paths(&self) -> &DbPaths {
        &self.paths
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.opts
    }

    #[inline]
    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current manifest epoch.
    pub fn epoch(&self) -> u64 {
        self.published.load().store.epoch()
    }

    /// Swap in a new published state derived from the current one.
    pub(crate) fn publish<F>(&self, f: F)
    where
        F: Fn(&PublishedState) -> PublishedState,
    {
        self.published.rcu(|old| Arc::new(f(old.as_ref())));
    }

    /// An immutable read view of the latest committed state. The snapshot
    /// pins its epoch in the reader registry until dropped.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let state = self.published.load_full();
        let ticket = self.readers.register(state.store.epoch())?;
        Ok(Snapshot::new(
            state.runs.clone(),
            state.store.clone(),
            state.symbols.clone(),
            state.ids.clone(),
            state.props.clone(),
            ticket,
        ))
    }

    pub fn with_snapshot<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> Result<T> {
        let snapshot = self.snapshot()?;
        Ok(f(&snapshot))
    }

    pub fn resolve_external(&self, external: ExternalId) -> Option<InternalNodeId> {
        self.published.load().ids.lookup(external)
    }

    pub fn symbol_id(&self, name: &str) -> Option<SymbolId> {
        self.published.load().symbols.id(name)
    }

    pub fn symbol_name(&self, id: SymbolId) -> Option<String> {
        self.published.load().symbols.name(id).map(str::to_string)
    }

    /// Intern a label or relation-type name, durably.
    ///
    /// New symbols are logged as their own committed mini-batch so a crash
    /// directly after this call cannot lose the id assignment that edges in
    /// a following batch will reference.
    pub fn get_or_create_symbol(&self, name: &str) -> Result<SymbolId> {
        {
            let symbols = self.symbols.lock().unwrap();
            if let Some(id) = symbols.id(name) {
                return Ok(id);
            }
        }

        let mut symbols = self.symbols.lock().unwrap();
        if let Some(id) = symbols.id(name) {
            return Ok(id);
        }
        let (id, _) = symbols.get_or_intern(name);

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut wal = self.wal.lock().unwrap();
            wal.append(&WalRecord::BeginBatch {
                seq,
                tx_id: uuid::Uuid::new_v4().to_string(),
            })?;
            wal.append(&WalRecord::CreateSymbol { name: name.to_string(), id })?;
            wal.append(&WalRecord::CommitBatch { seq })?;
            wal.fsync()?;
        }

        let snapshot = Arc::new(symbols.clone());
        drop(symbols);
        self.publish(|old| PublishedState { symbols: snapshot.clone(), ..old.clone() });
        Ok(id)
    }

    /// Open a write batch. Blocks until the single writer slot is free.
    pub fn begin_batch(&self, opts: BatchOptions) -> WriteBatch<'_> {
        let guard = self.write_lock.lock().unwrap();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        WriteBatch {
            engine: self,
            _guard: guard,
            seq,
            tx_id: opts.tx_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            durable: opts.durable,
            depth: 0,
            created_nodes: Vec::new(),
            created_index: HashMap::new(),
            label_adds: Vec::new(),
            label_removes: Vec::new(),
            memtable: MemTable::default(),
        }
    }

    /// Persist the interner and property tables into the pager, then truncate
    /// the WAL down to a single checkpoint batch.
    ///
    /// In classic staging mode the truncation is skipped while L0 runs exist,
    /// because their content lives only in the log; `lsm-lite` spills runs at
    /// commit, so the log can always be truncated.
    pub fn checkpoint(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        self.checkpoint_locked()
    }

    pub(crate) fn checkpoint_locked(&self) -> Result<()> {
        let runs = self.published.load().runs.clone();
        if self.opts.staging_mode == StagingMode::Classic && !runs.is_empty() {
            self.wal.lock().unwrap().fsync()?;
            self.pager.lock().unwrap().sync()?;
            tracing::debug!("checkpoint skipped wal truncation: L0 runs are wal-only");
            return Ok(());
        }

        let mut interner_buf = Vec::new();
        {
            let idmap = self.idmap.lock().unwrap();
            idmap.encode(&mut interner_buf);
        }
        let next_symbol_id;
        {
            let symbols = self.symbols.lock().unwrap();
            symbols.encode(&mut interner_buf);
            next_symbol_id = symbols.next_id();
        }
        let next_internal_id = self.idmap.lock().unwrap().next_internal_id();
        let props_buf = self.props.lock().unwrap().encode();

        let mut pager = self.pager.lock().unwrap();
        let old_interner = pager.interner_root();
        let old_props = pager.property_root();

        let interner_blob = BlobStore::prepare(&mut pager, &interner_buf)?;
        let props_blob = BlobStore::prepare(&mut pager, &props_buf)?;

        let epoch = self.epoch();
        let manifest_revision = pager.manifest_revision();
        let checkpoint = WalRecord::Checkpoint {
            epoch,
            next_internal_id,
            next_symbol_id,
            manifest_revision,
        };

        // Full page images first: a torn table write is repaired on replay.
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut wal = self.wal.lock().unwrap();
            wal.append(&WalRecord::BeginBatch {
                seq,
                tx_id: uuid::Uuid::new_v4().to_string(),
            })?;
            for (pid, image) in interner_blob.pages.iter().chain(props_blob.pages.iter()) {
                wal.append(&WalRecord::PageWrite {
                    page_id: pid.as_u32(),
                    page: image.clone(),
                })?;
            }
            wal.append(&checkpoint)?;
            wal.append(&WalRecord::CommitBatch { seq })?;
            wal.fsync()?;
        }

        interner_blob.write(&mut pager)?;
        props_blob.write(&mut pager)?;
        pager.set_interner_root(Some(interner_blob.head))?;
        pager.set_property_root(Some(props_blob.head))?;

        if let Some(head) = old_interner {
            BlobStore::free_chain(&mut pager, head)?;
        }
        if let Some(head) = old_props {
            BlobStore::free_chain(&mut pager, head)?;
        }
        pager.sync()?;
        drop(pager);

        let trunc_seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.wal.lock().unwrap().rewrite_as_snapshot(
            &self.paths.wal_tmp(),
            trunc_seq,
            &uuid::Uuid::new_v4().to_string(),
            vec![checkpoint],
        )?;
        self.dedupe.lock().unwrap().persist()?;

        tracing::info!(epoch, "checkpoint written, wal truncated");
        Ok(())
    }

    /// Fsync the WAL and write a checkpoint.
    pub fn flush(&self) -> Result<()> {
        self.wal.lock().unwrap().fsync()?;
        self.checkpoint()
    }

    /// Flush and release the lock. Dropping the engine also releases the
    /// lock, but without the final checkpoint.
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    pub fn statistics(&self) -> Result<crate::stats::GraphStatistics> {
        let snapshot = self.snapshot()?;
        crate::stats::GraphStatistics::collect(&snapshot)
    }
}

impl plexusdb_api::GraphStore for Engine {
    type Snapshot = Snapshot;

    fn snapshot(&self) -> std::result::Result<Snapshot, Error> {
        Engine::snapshot(self)
    }
}

fn remove_stale_tmp_files(paths: &DbPaths) -> Result<()> {
    // A crash mid-compaction or mid-checkpoint leaves only *.tmp artifacts;
    // the previous manifest and files are still linked and authoritative.
    let _ = fs::remove_file(paths.wal_tmp());
    if let Ok(entries) = fs::read_dir(paths.pages_dir()) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".tmp") {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
    Ok(())
}

/// Rebuild one committed batch's effects during recovery.
fn replay_batch(
    pager: &mut Pager,
    idmap: &mut IdMap,
    symbols: &mut SymbolTable,
    batch: &CommittedBatch,
    use_graph_ops: bool,
) -> Result<Option<L0Run>> {
    let mut memtable = MemTable::default();

    for op in &batch.ops {
        match op {
            WalRecord::CreateNode { external_id, internal_id } => {
                match idmap.lookup(*external_id) {
                    Some(existing) if existing == *internal_id => {}
                    Some(_) => return Err(Error::WalProtocol("external id remapped on replay")),
                    None => idmap.apply_create_node(*external_id, *internal_id)?,
                }
            }
            WalRecord::AssignLabel { node, label } => {
                idmap.apply_assign_label(*node, *label)?;
            }
            WalRecord::RemoveLabel { node, label } => {
                idmap.apply_remove_label(*node, *label)?;
            }
            WalRecord::CreateSymbol { name, id } => {
                symbols.apply_create(name, *id)?;
            }
            WalRecord::AddEdge { src, rel, dst } => {
                if use_graph_ops {
                    memtable.add_edge(*src, *rel, *dst);
                }
            }
            WalRecord::DeleteEdge { src, rel, dst } => {
                if use_graph_ops {
                    memtable.delete_edge(*src, *rel, *dst);
                }
            }
            WalRecord::TombstoneNode { node } => {
                if use_graph_ops {
                    memtable.tombstone_node(*node);
                }
            }
            WalRecord::SetNodeProperty { node, key, value } => {
                if use_graph_ops {
                    memtable.set_node_property(*node, key.clone(), value.clone());
                }
            }
            WalRecord::SetEdgeProperty { src, rel, dst, key, value } => {
                if use_graph_ops {
                    memtable.set_edge_property(
                        EdgeKey { src: *src, rel: *rel, dst: *dst },
                        key.clone(),
                        value.clone(),
                    );
                }
            }
            WalRecord::PageWrite { page_id, page } => {
                let pid = crate::pager::PageId::new(*page_id);
                pager.ensure_allocated(pid)?;
                pager.write_page(pid, page)?;
            }
            WalRecord::ManifestSwitch { .. } | WalRecord::Checkpoint { .. } => {
                // The manifest file and meta page are authoritative; these
                // records only mark the switch points in the log.
            }
            WalRecord::BeginBatch { .. } | WalRecord::CommitBatch { .. } => {
                return Err(Error::WalProtocol("nested batch marker in replay"));
            }
        }
    }

    let run = memtable.freeze_into_run(batch.seq);
    Ok((!run.is_empty()).then_some(run))
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Stable identifier for idempotent replay; generated when absent.
    pub tx_id: Option<String>,
    /// When set, `commit` fsyncs the WAL through this batch's commit record.
    /// Defaults to true; a non-durable commit may be lost on a crash but is
    /// never observed partially.
    pub durable: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { tx_id: None, durable: true }
    }
}

impl BatchOptions {
    pub fn durable() -> Self {
        Self::default()
    }
}

/// A single open write batch. All mutations stage in memory and in the
/// batch's WAL section; nothing is visible to snapshots until `commit`.
pub struct WriteBatch<'a> {
    engine: &'a Engine,
    _guard: MutexGuard<'a, ()>,
    seq: u64,
    tx_id: String,
    durable: bool,
    depth: u32,
    created_nodes: Vec<(ExternalId, InternalNodeId)>,
    created_index: HashMap<ExternalId, InternalNodeId>,
    label_adds: Vec<(InternalNodeId, SymbolId)>,
    label_removes: Vec<(InternalNodeId, SymbolId)>,
    memtable: MemTable,
}

impl<'a> WriteBatch<'a> {
    #[inline]
    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    /// Open a nested scope. Only the outermost `commit` publishes.
    pub fn begin_nested(&mut self) {
        self.depth += 1;
    }

    pub fn commit_nested(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::IllegalBatchNesting("commit_nested without begin_nested"));
        }
        self.depth -= 1;
        Ok(())
    }

    /// Map an external id, assigning a fresh dense internal id on first use.
    pub fn get_or_create_node(&mut self, external: ExternalId) -> Result<InternalNodeId> {
        if let Some(node) = self.engine.idmap.lock().unwrap().lookup(external) {
            return Ok(node);
        }
        if let Some(node) = self.created_index.get(&external) {
            return Ok(*node);
        }

        let base = self.engine.idmap.lock().unwrap().next_internal_id();
        let node = base + self.created_nodes.len() as u32;
        self.created_nodes.push((external, node));
        self.created_index.insert(external, node);
        Ok(node)
    }

    pub fn get_or_create_symbol(&self, name: &str) -> Result<SymbolId> {
        self.engine.get_or_create_symbol(name)
    }

    pub fn add_edge(&mut self, src: InternalNodeId, rel: RelTypeId, dst: InternalNodeId) {
        self.memtable.add_edge(src, rel, dst);
    }

    pub fn delete_edge(&mut self, src: InternalNodeId, rel: RelTypeId, dst: InternalNodeId) {
        self.memtable.delete_edge(src, rel, dst);
    }

    pub fn tombstone_node(&mut self, node: InternalNodeId) {
        self.memtable.tombstone_node(node);
    }

    pub fn assign_label(&mut self, node: InternalNodeId, label: SymbolId) {
        self.label_adds.push((node, label));
    }

    pub fn remove_label(&mut self, node: InternalNodeId, label: SymbolId) {
        self.label_removes.push((node, label));
    }

    pub fn set_node_property(
        &mut self,
        node: InternalNodeId,
        key: impl Into<String>,
        value: PropertyValue,
    ) -> Result<()> {
        property::check_value_size(&value)?;
        self.memtable.set_node_property(node, key.into(), value);
        Ok(())
    }

    /// Deletion is a `Null` overlay; compaction drops the pair.
    pub fn remove_node_property(&mut self, node: InternalNodeId, key: impl Into<String>) {
        self.memtable.set_node_property(node, key.into(), PropertyValue::Null);
    }

    pub fn set_edge_property(
        &mut self,
        edge: EdgeKey,
        key: impl Into<String>,
        value: PropertyValue,
    ) -> Result<()> {
        property::check_value_size(&value)?;
        self.memtable.set_edge_property(edge, key.into(), value);
        Ok(())
    }

    pub fn remove_edge_property(&mut self, edge: EdgeKey, key: impl Into<String>) {
        self.memtable.set_edge_property(edge, key.into(), PropertyValue::Null);
    }

    /// Discard every staged mutation. Nothing reached the WAL.
    pub fn abort(self) {}

    pub fn commit(self) -> Result<()> {
        if self.depth != 0 {
            return Err(Error::IllegalBatchNesting("commit with open nested scope"));
        }

        if self.engine.dedupe.lock().unwrap().contains(&self.tx_id) {
            tracing::debug!(tx_id = %self.tx_id, "duplicate txId, commit is a no-op");
            return Ok(());
        }

        let no_mutations = self.created_nodes.is_empty()
            && self.label_adds.is_empty()
            && self.label_removes.is_empty()
            && self.memtable.is_empty();
        if no_mutations {
            return Ok(());
        }

        let run = {
            let mut wal = self.engine.wal.lock().unwrap();
            wal.append(&WalRecord::BeginBatch {
                seq: self.seq,
                tx_id: self.tx_id.clone(),
            })?;

            for (external_id, internal_id) in &self.created_nodes {
                wal.append(&WalRecord::CreateNode {
                    external_id: *external_id,
                    internal_id: *internal_id,
                })?;
            }
            for (node, label) in &self.label_adds {
                wal.append(&WalRecord::AssignLabel { node: *node, label: *label })?;
            }
            for (node, label) in &self.label_removes {
                wal.append(&WalRecord::RemoveLabel { node: *node, label: *label })?;
            }
            for e in self.memtable.iter_edges() {
                wal.append(&WalRecord::AddEdge { src: e.src, rel: e.rel, dst: e.dst })?;
            }
            for node in self.memtable.iter_tombstoned_nodes() {
                wal.append(&WalRecord::TombstoneNode { node })?;
            }
            for e in self.memtable.iter_tombstoned_edges() {
                wal.append(&WalRecord::DeleteEdge { src: e.src, rel: e.rel, dst: e.dst })?;
            }
            for (node, key, value) in self.memtable.iter_node_props() {
                wal.append(&WalRecord::SetNodeProperty {
                    node,
                    key: key.clone(),
                    value: value.clone(),
                })?;
            }
            for (e, key, value) in self.memtable.iter_edge_props() {
                wal.append(&WalRecord::SetEdgeProperty {
                    src: e.src,
                    rel: e.rel,
                    dst: e.dst,
                    key: key.clone(),
                    value: value.clone(),
                })?;
            }

            wal.append(&WalRecord::CommitBatch { seq: self.seq })?;
            if self.durable {
                wal.fsync()?;
            }

            self.memtable.freeze_into_run(self.seq)
        };

        // The WAL section is complete; apply to the authoritative tables.
        let new_ids = {
            let mut idmap = self.engine.idmap.lock().unwrap();
            for (external_id, internal_id) in &self.created_nodes {
                idmap.apply_create_node(*external_id, *internal_id)?;
            }
            for (node, label) in &self.label_adds {
                idmap.apply_assign_label(*node, *label)?;
            }
            for (node, label) in &self.label_removes {
                idmap.apply_remove_label(*node, *label)?;
            }
            Arc::new(idmap.clone())
        };

        let run = Arc::new(run);
        if self.engine.opts.staging_mode == StagingMode::LsmLite && !run.is_empty() {
            l0::spill_run(&self.engine.paths, &run)?;
        }

        let publish_run = !run.is_empty();
        self.engine.publish(|old| {
            let runs = if publish_run {
                let mut next = Vec::with_capacity(old.runs.len() + 1);
                next.push(run.clone());
                next.extend(old.runs.iter().cloned());
                Arc::new(next)
            } else {
                old.runs.clone()
            };
            PublishedState { runs, ids: new_ids.clone(), ..old.clone() }
        });

        let session = self.engine.session_id().to_string();
        self.engine
            .dedupe
            .lock()
            .unwrap()
            .remember(&self.tx_id, Some(&session));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> Engine {
        Engine::open(dir.join("graph")).unwrap()
    }

    #[test]
    fn create_commit_read_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());

        let knows = engine.get_or_create_symbol("KNOWS").unwrap();
        let (a, b) = {
            let mut batch = engine.begin_batch(BatchOptions::durable());
            let a = batch.get_or_create_node(10).unwrap();
            let b = batch.get_or_create_node(20).unwrap();
            batch.add_edge(a, knows, b);
            batch.commit().unwrap();
            (a, b)
        };

        let snap = engine.snapshot().unwrap();
        let edges: Vec<EdgeKey> = snap.neighbors(a, Some(knows)).unwrap().collect();
        assert_eq!(edges, vec![EdgeKey { src: a, rel: knows, dst: b }]);
        assert_eq!(snap.resolve_external(20), Some(b));
        assert_eq!(snap.external_of(a), Some(10));
    }

    #[test]
    fn uncommitted_batch_is_invisible_and_abort_discards() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        let rel = engine.get_or_create_symbol("R").unwrap();

        {
            let mut batch = engine.begin_batch(BatchOptions::default());
            let a = batch.get_or_create_node(1).unwrap();
            let b = batch.get_or_create_node(2).unwrap();
            batch.add_edge(a, rel, b);
            batch.abort();
        }

        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.resolve_external(1), None);
        assert_eq!(snap.nodes(None).count(), 0);
    }

    #[test]
    fn recovery_replays_committed_batches() {
        let dir = tempdir().unwrap();
        let (a, rel, b);
        {
            let engine = open(dir.path());
            rel = engine.get_or_create_symbol("KNOWS").unwrap();
            let mut batch = engine.begin_batch(BatchOptions::default());
            a = batch.get_or_create_node(100).unwrap();
            b = batch.get_or_create_node(200).unwrap();
            batch.add_edge(a, rel, b);
            batch.commit().unwrap();
            // Dropped without flush: the wal was written, not fsynced.
        }

        let engine = open(dir.path());
        let snap = engine.snapshot().unwrap();
        let edges: Vec<EdgeKey> = snap.neighbors(a, Some(rel)).unwrap().collect();
        assert_eq!(edges, vec![EdgeKey { src: a, rel, dst: b }]);
    }

    #[test]
    fn duplicate_tx_id_is_a_no_op() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        let rel = engine.get_or_create_symbol("R").unwrap();

        let opts = BatchOptions { tx_id: Some("job-42".into()), durable: true };
        {
            let mut batch = engine.begin_batch(opts.clone());
            let a = batch.get_or_create_node(1).unwrap();
            let b = batch.get_or_create_node(2).unwrap();
            batch.add_edge(a, rel, b);
            batch.commit().unwrap();
        }
        {
            let mut batch = engine.begin_batch(opts);
            let a = batch.get_or_create_node(3).unwrap();
            let b = batch.get_or_create_node(4).unwrap();
            batch.add_edge(a, rel, b);
            batch.commit().unwrap(); // same txId: dropped
        }

        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.resolve_external(3), None);
        assert_eq!(snap.nodes(None).count(), 2);
    }

    #[test]
    fn nested_scopes_must_close_before_commit() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());

        let mut batch = engine.begin_batch(BatchOptions::default());
        batch.begin_nested();
        let err = batch.commit().unwrap_err();
        assert!(matches!(err, Error::IllegalBatchNesting(_)));

        let mut batch = engine.begin_batch(BatchOptions::default());
        assert!(matches!(
            batch.commit_nested(),
            Err(Error::IllegalBatchNesting(_))
        ));
        batch.begin_nested();
        batch.commit_nested().unwrap();
        batch.commit().unwrap();
    }

    #[test]
    fn oversized_property_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());

        let mut batch = engine.begin_batch(BatchOptions::default());
        let node = batch.get_or_create_node(1).unwrap();
        let err = batch
            .set_node_property(
                node,
                "blob",
                PropertyValue::Bytes(vec![0u8; crate::MAX_VALUE_BYTES + 1]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let _engine = open(dir.path());
        let err = Engine::open(dir.path().join("graph")).unwrap_err();
        assert!(matches!(err, Error::DatabaseLocked { .. }));
    }

    #[test]
    fn checkpoint_truncates_wal_after_compaction() {
        let dir = tempdir().unwrap();
        {
            let engine = open(dir.path());
            let rel = engine.get_or_create_symbol("R").unwrap();
            let mut batch = engine.begin_batch(BatchOptions::durable());
            let a = batch.get_or_create_node(1).unwrap();
            let b = batch.get_or_create_node(2).unwrap();
            batch.add_edge(a, rel, b);
            batch
                .set_node_property(a, "name", PropertyValue::String("a".into()))
                .unwrap();
            batch.commit().unwrap();

            engine
                .compact(crate::compact::CompactOptions::default())
                .unwrap();
            engine.checkpoint().unwrap();
        }

        let batches = Wal::read_committed_from_path(&DbPaths::new(dir.path().join("graph")).wal())
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert!(matches!(batches[0].ops[0], WalRecord::Checkpoint { .. }));

        let engine = open(dir.path());
        let snap = engine.snapshot().unwrap();
        let a = snap.resolve_external(1).unwrap();
        assert_eq!(
            snap.node_property(a, "name"),
            Some(PropertyValue::String("a".into()))
        );
        assert_eq!(snap.neighbors(a, None).unwrap().count(), 1);
    }

    #[test]
    fn classic_checkpoint_keeps_wal_while_runs_exist() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        let rel = engine.get_or_create_symbol("R").unwrap();
        {
            let mut batch = engine.begin_batch(BatchOptions::durable());
            let a = batch.get_or_create_node(1).unwrap();
            let b = batch.get_or_create_node(2).unwrap();
            batch.add_edge(a, rel, b);
            batch.commit().unwrap();
        }
        engine.checkpoint().unwrap();

        // Two committed batches still in the log: symbol + edge batch.
        let batches = Wal::read_committed_from_path(engine.wal.lock().unwrap().path()).unwrap();
        assert_eq!(batches.len(), 2);
    }
}
