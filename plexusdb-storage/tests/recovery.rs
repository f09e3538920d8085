//! Crash-recovery scenarios: the reopened database must equal the last
//! committed prefix of the log.

use plexusdb_storage::engine::{BatchOptions, Engine};
use plexusdb_storage::options::{Options, StagingMode};
use plexusdb_storage::{EdgeKey, PropertyValue};
use tempfile::tempdir;

fn non_durable() -> BatchOptions {
    BatchOptions { tx_id: None, durable: false }
}

#[test]
fn redo_replays_unflushed_commit() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("graph");

    let (a, knows, b);
    {
        let engine = Engine::open(&base).unwrap();
        knows = engine.get_or_create_symbol("KNOWS").unwrap();
        let mut batch = engine.begin_batch(non_durable());
        a = batch.get_or_create_node(1).unwrap();
        b = batch.get_or_create_node(2).unwrap();
        batch.add_edge(a, knows, b);
        batch.commit().unwrap();
        // Engine dropped without flush or checkpoint.
    }

    let engine = Engine::open(&base).unwrap();
    let snap = engine.snapshot().unwrap();
    let edges: Vec<EdgeKey> = snap.neighbors(a, Some(knows)).unwrap().collect();
    assert_eq!(edges, vec![EdgeKey { src: a, rel: knows, dst: b }]);
}

#[test]
fn properties_and_tombstones_survive_reopen() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("graph");

    let (a, b, c, r);
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
            batch
                .set_node_property(a, "name", PropertyValue::String("ada".into()))
                .unwrap();
            batch
                .set_edge_property(
                    EdgeKey { src: a, rel: r, dst: b },
                    "since",
                    PropertyValue::Int(1999),
                )
                .unwrap();
            batch.commit().unwrap();
        }
        {
            let mut batch = engine.begin_batch(BatchOptions::durable());
            batch.delete_edge(a, r, b);
            batch.remove_node_property(a, "name");
            batch.commit().unwrap();
        }
    }

    let engine = Engine::open(&base).unwrap();
    let snap = engine.snapshot().unwrap();
    let edges: Vec<EdgeKey> = snap.neighbors(a, Some(r)).unwrap().collect();
    assert_eq!(edges, vec![EdgeKey { src: a, rel: r, dst: c }]);
    assert_eq!(snap.node_property(a, "name"), None);
    assert_eq!(
        snap.edge_property(EdgeKey { src: a, rel: r, dst: b }, "since"),
        Some(PropertyValue::Int(1999))
    );
}

#[test]
fn replaying_duplicate_tx_id_applies_once() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("graph");

    let opts = Options {
        enable_persistent_tx_dedupe: true,
        ..Options::default()
    };

    let (a, r, b);
    {
        let engine = Engine::open_with(&base, opts.clone()).unwrap();
        r = engine.get_or_create_symbol("R").unwrap();
        let mut batch = engine.begin_batch(BatchOptions {
            tx_id: Some("import-1".into()),
            durable: true,
        });
        a = batch.get_or_create_node(1).unwrap();
        b = batch.get_or_create_node(2).unwrap();
        batch.add_edge(a, r, b);
        batch.commit().unwrap();
        engine.close().unwrap();
    }

    // A caller resubmitting the same txId after restart must be a no-op.
    {
        let engine = Engine::open_with(&base, opts.clone()).unwrap();
        let mut batch = engine.begin_batch(BatchOptions {
            tx_id: Some("import-1".into()),
            durable: true,
        });
        let x = batch.get_or_create_node(50).unwrap();
        let y = batch.get_or_create_node(51).unwrap();
        batch.add_edge(x, r, y);
        batch.commit().unwrap();
    }

    let engine = Engine::open_with(&base, opts).unwrap();
    let snap = engine.snapshot().unwrap();
    assert_eq!(snap.resolve_external(50), None);
    assert_eq!(snap.nodes(None).count(), 2);
    assert_eq!(snap.neighbors(a, Some(r)).unwrap().count(), 1);
}

#[test]
fn lsm_lite_recovers_from_spilled_runs_after_truncation() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("graph");
    let opts = Options {
        staging_mode: StagingMode::LsmLite,
        ..Options::default()
    };

    let (a, r, b);
    {
        let engine = Engine::open_with(&base, opts.clone()).unwrap();
        r = engine.get_or_create_symbol("R").unwrap();
        let mut batch = engine.begin_batch(BatchOptions::durable());
        a = batch.get_or_create_node(1).unwrap();
        b = batch.get_or_create_node(2).unwrap();
        batch.add_edge(a, r, b);
        batch.commit().unwrap();

        // lsm-lite may truncate the wal while runs are pending: the run
        // content is durable in the l0 spill files.
        engine.checkpoint().unwrap();
    }

    let engine = Engine::open_with(&base, opts).unwrap();
    let snap = engine.snapshot().unwrap();
    let edges: Vec<EdgeKey> = snap.neighbors(a, Some(r)).unwrap().collect();
    assert_eq!(edges, vec![EdgeKey { src: a, rel: r, dst: b }]);
    assert_eq!(snap.resolve_external(1), Some(a));
}

#[test]
fn torn_wal_tail_loses_only_the_last_batch() {
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
            batch.commit().unwrap();
        }
        {
            let mut batch = engine.begin_batch(non_durable());
            let c = batch.get_or_create_node(3).unwrap();
            batch.add_edge(a, r, c);
            batch.commit().unwrap();
        }
    }

    // Corrupt the tail: flip a byte in the last 8 bytes of the wal.
    let wal_path = plexusdb_storage::paths::DbPaths::new(&base).wal();
    let mut bytes = std::fs::read(&wal_path).unwrap();
    let len = bytes.len();
    bytes[len - 4] ^= 0xFF;
    std::fs::write(&wal_path, bytes).unwrap();

    let engine = Engine::open(&base).unwrap();
    let snap = engine.snapshot().unwrap();
    let edges: Vec<EdgeKey> = snap.neighbors(a, Some(r)).unwrap().collect();
    assert_eq!(edges, vec![EdgeKey { src: a, rel: r, dst: b }]);
    assert_eq!(snap.resolve_external(3), None);
}
