//! Compaction, tombstone and GC semantics.

use plexusdb_storage::compact::{CompactMode, CompactOptions, GcOptions};
use plexusdb_storage::engine::{BatchOptions, Engine};
use plexusdb_storage::manifest::Manifest;
use plexusdb_storage::paths::DbPaths;
use plexusdb_storage::segment::Order;
use plexusdb_storage::{EdgeKey, PropertyValue};
use std::collections::HashMap;
use tempfile::tempdir;

fn e(src: u32, rel: u32, dst: u32) -> EdgeKey {
    EdgeKey { src, rel, dst }
}

#[test]
fn rewrite_compaction_drops_tombstones_everywhere() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("graph");

    let (a, r, b, c);
    {
        let engine = Engine::open(&base).unwrap();
        r = engine.get_or_create_symbol("R").unwrap();
        {
            let mut batch = engine.begin_batch(BatchOptions::durable());
            a = batch.get_or_create_node(1).unwrap();
            b = batch.get_or_create_node(2).unwrap();
            c = batch.get_or_create_node(3).unwrap();
            batch.add_edge(a, r, b);
            batch.add_edge(a, r, c);
            batch.commit().unwrap();
        }
        {
            let mut batch = engine.begin_batch(BatchOptions::durable());
            batch.delete_edge(a, r, b);
            batch.commit().unwrap();
        }

        let stats = engine.compact(CompactOptions::rewrite()).unwrap();
        assert_eq!(stats.mode, CompactMode::Rewrite);
        assert_eq!(stats.edges_written, 1);
    }

    let engine = Engine::open(&base).unwrap();
    let snap = engine.snapshot().unwrap();
    let edges: Vec<EdgeKey> = snap.neighbors(a, Some(r)).unwrap().collect();
    assert_eq!(edges, vec![e(a, r, c)]);

    // The deleted triple is gone from every ordering, and the manifest
    // carries no tombstone for it.
    let manifest = Manifest::load(&DbPaths::new(&base).manifest()).unwrap();
    assert!(manifest.tombstones.is_empty());
    for incoming in snap.incoming_neighbors(b, None).unwrap() {
        panic!("dangling incoming edge {incoming:?}");
    }
}

#[test]
fn readding_after_tombstone_resurrects() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("graph")).unwrap();
    let r = engine.get_or_create_symbol("R").unwrap();

    let (a, b);
    {
        let mut batch = engine.begin_batch(BatchOptions::durable());
        a = batch.get_or_create_node(1).unwrap();
        b = batch.get_or_create_node(2).unwrap();
        batch.add_edge(a, r, b);
        batch.commit().unwrap();
    }
    {
        let mut batch = engine.begin_batch(BatchOptions::durable());
        batch.delete_edge(a, r, b);
        batch.commit().unwrap();
    }
    {
        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.neighbors(a, Some(r)).unwrap().count(), 0);
    }
    {
        let mut batch = engine.begin_batch(BatchOptions::durable());
        batch.add_edge(a, r, b);
        batch.commit().unwrap();
    }

    let snap = engine.snapshot().unwrap();
    let edges: Vec<EdgeKey> = snap.neighbors(a, Some(r)).unwrap().collect();
    assert_eq!(edges, vec![e(a, r, b)]);

    // Still present after the runs are compacted away.
    drop(snap);
    engine.compact(CompactOptions::rewrite()).unwrap();
    let snap = engine.snapshot().unwrap();
    assert_eq!(snap.neighbors(a, Some(r)).unwrap().count(), 1);
}

#[test]
fn node_tombstone_hides_incident_edges_and_survives_compaction() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("graph")).unwrap();
    let r = engine.get_or_create_symbol("R").unwrap();

    let (a, b, c);
    {
        let mut batch = engine.begin_batch(BatchOptions::durable());
        a = batch.get_or_create_node(1).unwrap();
        b = batch.get_or_create_node(2).unwrap();
        c = batch.get_or_create_node(3).unwrap();
        batch.add_edge(a, r, b);
        batch.add_edge(c, r, a);
        batch.commit().unwrap();
    }
    {
        let mut batch = engine.begin_batch(BatchOptions::durable());
        batch.tombstone_node(a);
        batch.commit().unwrap();
    }

    let check = |snap: &plexusdb_storage::snapshot::Snapshot| {
        assert!(snap.is_node_tombstoned(a));
        assert_eq!(snap.resolve_external(1), None);
        assert_eq!(snap.neighbors(a, None).unwrap().count(), 0);
        assert_eq!(snap.neighbors(c, None).unwrap().count(), 0);
        let nodes: Vec<u32> = snap.nodes(None).collect();
        assert_eq!(nodes, vec![b, c]);
    };
    check(&engine.snapshot().unwrap());

    engine.compact(CompactOptions::rewrite()).unwrap();
    check(&engine.snapshot().unwrap());
}

#[test]
fn compaction_sinks_properties_into_the_durable_table() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("graph");

    let (a, r, b);
    {
        let engine = Engine::open(&base).unwrap();
        r = engine.get_or_create_symbol("R").unwrap();
        {
            let mut batch = engine.begin_batch(BatchOptions::durable());
            a = batch.get_or_create_node(1).unwrap();
            b = batch.get_or_create_node(2).unwrap();
            batch.add_edge(a, r, b);
            batch
                .set_node_property(a, "age", PropertyValue::Int(30))
                .unwrap();
            batch
                .set_node_property(a, "tmp", PropertyValue::Int(1))
                .unwrap();
            batch.commit().unwrap();
        }
        {
            let mut batch = engine.begin_batch(BatchOptions::durable());
            batch.remove_node_property(a, "tmp");
            batch
                .set_edge_property(e(a, r, b), "w", PropertyValue::Float(2.0))
                .unwrap();
            batch.commit().unwrap();
        }

        engine.compact(CompactOptions::rewrite()).unwrap();
    }

    let engine = Engine::open(&base).unwrap();
    let snap = engine.snapshot().unwrap();
    assert_eq!(snap.node_property(a, "age"), Some(PropertyValue::Int(30)));
    // Dropped: its latest value was the null sentinel.
    assert_eq!(snap.node_property(a, "tmp"), None);
    assert_eq!(
        snap.edge_property(e(a, r, b), "w"),
        Some(PropertyValue::Float(2.0))
    );
}

#[test]
fn incremental_compaction_orphans_pages_and_gc_reclaims_them() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("graph");
    let engine = Engine::open(&base).unwrap();
    let r = engine.get_or_create_symbol("R").unwrap();

    let a;
    {
        let mut batch = engine.begin_batch(BatchOptions::durable());
        a = batch.get_or_create_node(1).unwrap();
        for ext in 2..20u64 {
            let dst = batch.get_or_create_node(ext).unwrap();
            batch.add_edge(a, r, dst);
        }
        batch.commit().unwrap();
    }
    engine.compact(CompactOptions::rewrite()).unwrap();

    {
        let mut batch = engine.begin_batch(BatchOptions::durable());
        batch.delete_edge(a, r, 1); // internal id of external 2
        batch.commit().unwrap();
    }

    let mut primaries = HashMap::new();
    primaries.insert(Order::Spo, vec![a]);
    let stats = engine
        .compact(CompactOptions {
            mode: CompactMode::Incremental,
            primaries: Some(primaries),
            respect_readers: true,
            ..CompactOptions::default()
        })
        .unwrap();
    assert_eq!(stats.primaries_rewritten, 1);

    let manifest = Manifest::load(&DbPaths::new(&base).manifest()).unwrap();
    assert!(manifest.orphan_page_count() > 0);
    assert!(!manifest.tombstones.is_empty());

    // Reads see the spliced pages.
    let snap = engine.snapshot().unwrap();
    assert_eq!(snap.neighbors(a, Some(r)).unwrap().count(), 17);
    drop(snap);

    let gc = engine.gc(GcOptions { respect_readers: true }).unwrap();
    assert!(!gc.skipped_for_readers);
    assert_eq!(gc.pages_dropped, 1);
    assert!(gc.orders_rewritten.contains(&Order::Spo));

    let manifest = Manifest::load(&DbPaths::new(&base).manifest()).unwrap();
    assert_eq!(manifest.orphan_page_count(), 0);

    let snap = engine.snapshot().unwrap();
    assert_eq!(snap.neighbors(a, Some(r)).unwrap().count(), 17);
}

#[test]
fn gc_skips_while_older_epochs_are_pinned() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("graph")).unwrap();
    let r = engine.get_or_create_symbol("R").unwrap();

    let a;
    {
        let mut batch = engine.begin_batch(BatchOptions::durable());
        a = batch.get_or_create_node(1).unwrap();
        let b = batch.get_or_create_node(2).unwrap();
        let c = batch.get_or_create_node(3).unwrap();
        batch.add_edge(a, r, b);
        batch.add_edge(a, r, c);
        batch.commit().unwrap();
    }
    engine.compact(CompactOptions::rewrite()).unwrap();

    // Pin the pre-splice epoch with a live snapshot.
    let pinned = engine.snapshot().unwrap();

    {
        let mut batch = engine.begin_batch(BatchOptions::durable());
        batch.delete_edge(a, r, 1);
        batch.commit().unwrap();
    }
    let mut primaries = HashMap::new();
    primaries.insert(Order::Spo, vec![a]);
    engine
        .compact(CompactOptions {
            mode: CompactMode::Incremental,
            primaries: Some(primaries),
            respect_readers: true,
            ..CompactOptions::default()
        })
        .unwrap();

    let gc = engine.gc(GcOptions { respect_readers: true }).unwrap();
    assert!(gc.skipped_for_readers);

    // The pinned snapshot still reads its own epoch's state.
    assert_eq!(pinned.neighbors(a, Some(r)).unwrap().count(), 2);
    drop(pinned);

    let gc = engine.gc(GcOptions { respect_readers: true }).unwrap();
    assert!(!gc.skipped_for_readers);
    assert!(gc.pages_dropped > 0);
}
