//! L0 run spill files for the `lsm-lite` staging mode.
//!
//! Each frozen MemTable is written as `l0-<seq>.json` under `P.pages/` and
//! listed in `lsm-manifest.json`. Recovery loads the listed runs and only
//! replays WAL batches whose seq is not already covered, which in turn lets
//! a checkpoint truncate the WAL while runs are still awaiting compaction.

use crate::paths::DbPaths;
use crate::snapshot::L0Run;
use crate::{EdgeKey, Error, PropertyValue, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;

#[derive(Debug, Serialize, Deserialize)]
struct SpillRun {
    seq: u64,
    edges: Vec<[u32; 3]>,
    tombstoned_nodes: Vec<u32>,
    tombstoned_edges: Vec<[u32; 3]>,
    node_props: Vec<(u32, String, PropertyValue)>,
    edge_props: Vec<([u32; 3], String, PropertyValue)>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LsmManifest {
    pub runs: Vec<LsmRunEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsmRunEntry {
    pub seq: u64,
    pub file: String,
}

fn to_triple(e: EdgeKey) -> [u32; 3] {
    [e.src, e.rel, e.dst]
}

fn from_triple([s, p, o]: [u32; 3]) -> EdgeKey {
    EdgeKey { src: s, rel: p, dst: o }
}

pub fn load_lsm_manifest(paths: &DbPaths) -> Result<LsmManifest> {
    let path = paths.lsm_manifest();
    if !path.exists() {
        return Ok(LsmManifest::default());
    }
    let bytes = fs::read(&path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::ManifestUnreadable(format!("{}: {e}", path.display())))
}

pub fn store_lsm_manifest(paths: &DbPaths, manifest: &LsmManifest) -> Result<()> {
    let path = paths.lsm_manifest();
    let tmp = paths.pages_dir().join("lsm-manifest.json.tmp");
    let json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| Error::ManifestUnreadable(format!("lsm manifest: {e}")))?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Spill one frozen run and append it to the lsm manifest.
pub fn spill_run(paths: &DbPaths, run: &L0Run) -> Result<()> {
    let spill = SpillRun {
        seq: run.seq(),
        edges: run.iter_edges().map(to_triple).collect(),
        tombstoned_nodes: run.iter_tombstoned_nodes().collect(),
        tombstoned_edges: run.iter_tombstoned_edges().map(to_triple).collect(),
        node_props: run
            .iter_node_props()
            .map(|(n, k, v)| (n, k.clone(), v.clone()))
            .collect(),
        edge_props: run
            .iter_edge_props()
            .map(|(e, k, v)| (to_triple(e), k.clone(), v.clone()))
            .collect(),
    };

    let path = paths.l0_file(run.seq());
    let tmp = paths.pages_dir().join(format!("l0-{}.json.tmp", run.seq()));
    let json = serde_json::to_vec(&spill)
        .map_err(|e| Error::ManifestUnreadable(format!("l0 spill: {e}")))?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &path)?;

    let mut manifest = load_lsm_manifest(paths)?;
    if !manifest.runs.iter().any(|r| r.seq == run.seq()) {
        manifest.runs.push(LsmRunEntry {
            seq: run.seq(),
            file: format!("l0-{}.json", run.seq()),
        });
        manifest.runs.sort_by_key(|r| r.seq);
        store_lsm_manifest(paths, &manifest)?;
    }
    Ok(())
}

/// Load every listed run, oldest first.
pub fn load_runs(paths: &DbPaths) -> Result<Vec<L0Run>> {
    let manifest = load_lsm_manifest(paths)?;
    let mut runs = Vec::with_capacity(manifest.runs.len());
    for entry in &manifest.runs {
        let path = paths.pages_dir().join(&entry.file);
        let bytes = fs::read(&path)
            .map_err(|e| Error::ManifestUnreadable(format!("{}: {e}", path.display())))?;
        let spill: SpillRun = serde_json::from_slice(&bytes)
            .map_err(|e| Error::ManifestUnreadable(format!("{}: {e}", path.display())))?;
        runs.push(rebuild(spill));
    }
    Ok(runs)
}

/// Delete all spill files and reset the lsm manifest; called when compaction
/// has absorbed the runs.
pub fn clear(paths: &DbPaths) -> Result<()> {
    let manifest = load_lsm_manifest(paths)?;
    for entry in &manifest.runs {
        let _ = fs::remove_file(paths.pages_dir().join(&entry.file));
    }
    if paths.lsm_manifest().exists() {
        store_lsm_manifest(paths, &LsmManifest::default())?;
    }
    Ok(())
}

fn rebuild(spill: SpillRun) -> L0Run {
    let mut edges_by_src: BTreeMap<u32, Vec<EdgeKey>> = BTreeMap::new();
    let mut edges_by_dst: BTreeMap<u32, Vec<EdgeKey>> = BTreeMap::new();
    for triple in spill.edges {
        let e = from_triple(triple);
        edges_by_src.entry(e.src).or_default().push(e);
        edges_by_dst.entry(e.dst).or_default().push(e);
    }
    for list in edges_by_src.values_mut() {
        list.sort_unstable();
        list.dedup();
    }
    for list in edges_by_dst.values_mut() {
        list.sort_unstable();
        list.dedup();
    }

    let tombstoned_nodes: BTreeSet<u32> = spill.tombstoned_nodes.into_iter().collect();
    let tombstoned_edges: BTreeSet<EdgeKey> =
        spill.tombstoned_edges.into_iter().map(from_triple).collect();
    let node_props: BTreeMap<(u32, String), PropertyValue> = spill
        .node_props
        .into_iter()
        .map(|(n, k, v)| ((n, k), v))
        .collect();
    let edge_props: BTreeMap<(EdgeKey, String), PropertyValue> = spill
        .edge_props
        .into_iter()
        .map(|(e, k, v)| ((from_triple(e), k), v))
        .collect();

    L0Run::new(
        spill.seq,
        edges_by_src,
        edges_by_dst,
        tombstoned_nodes,
        tombstoned_edges,
        node_props,
        edge_props,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::MemTable;
    use tempfile::tempdir;

    #[test]
    fn spill_and_reload_runs() {
        let dir = tempdir().unwrap();
        let paths = DbPaths::new(dir.path().join("db"));
        fs::create_dir_all(paths.pages_dir()).unwrap();

        let mut mt = MemTable::default();
        mt.add_edge(1, 2, 3);
        mt.delete_edge(4, 5, 6);
        mt.set_node_property(1, "k".into(), PropertyValue::Int(7));
        let run = mt.freeze_into_run(11);
        spill_run(&paths, &run).unwrap();

        let mut mt2 = MemTable::default();
        mt2.add_edge(9, 9, 9);
        spill_run(&paths, &mt2.freeze_into_run(12)).unwrap();

        let runs = load_runs(&paths).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].seq(), 11);
        assert_eq!(runs[0].edges_for_src(1), &[EdgeKey { src: 1, rel: 2, dst: 3 }]);
        assert_eq!(runs[0].iter_tombstoned_edges().count(), 1);
        assert_eq!(
            runs[0].node_prop_delta(1, "k"),
            Some(&PropertyValue::Int(7))
        );
        assert_eq!(runs[1].seq(), 12);

        clear(&paths).unwrap();
        assert!(load_runs(&paths).unwrap().is_empty());
    }
}
