//! Corruption detection and repair from the surviving fact set.

use plexusdb_storage::check::{CheckOptions, RepairOptions};
use plexusdb_storage::compact::CompactOptions;
use plexusdb_storage::engine::{BatchOptions, Engine};
use plexusdb_storage::manifest::Manifest;
use plexusdb_storage::paths::DbPaths;
use plexusdb_storage::segment::Order;
use plexusdb_storage::EdgeKey;
use tempfile::tempdir;

/// Build a compacted database and return (base, src node, rel, dst count).
fn build(dir: &std::path::Path) -> (std::path::PathBuf, u32, u32, usize) {
    let base = dir.join("graph");
    let engine = Engine::open(&base).unwrap();
    let r = engine.get_or_create_symbol("R").unwrap();

    let a;
    {
        let mut batch = engine.begin_batch(BatchOptions::durable());
        a = batch.get_or_create_node(1).unwrap();
        for ext in 2..12u64 {
            let dst = batch.get_or_create_node(ext).unwrap();
            batch.add_edge(a, r, dst);
        }
        batch.commit().unwrap();
    }
    engine.compact(CompactOptions::rewrite()).unwrap();
    engine.close().unwrap();
    (base, a, r, 10)
}

fn corrupt_first_spo_page(base: &std::path::Path) -> (u32, u64) {
    let paths = DbPaths::new(base);
    let manifest = Manifest::load(&paths.manifest()).unwrap();
    let lookup = manifest
        .lookups
        .iter()
        .find(|l| l.order == Order::Spo)
        .unwrap();
    let rec = lookup.pages[0];

    let path = paths.order_file(Order::Spo);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[rec.offset as usize + 5] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();
    (rec.primary_value, rec.offset)
}

#[test]
fn check_reports_the_corrupt_page_precisely() {
    let dir = tempdir().unwrap();
    let (base, a, _r, _n) = build(dir.path());
    let (primary, offset) = corrupt_first_spo_page(&base);
    assert_eq!(primary, a);

    let engine = Engine::open(&base).unwrap();
    let report = engine.check(CheckOptions { strict: true }).unwrap();
    assert!(!report.ok);
    assert_eq!(report.errors.len(), 1);

    let issue = &report.errors[0];
    assert_eq!(issue.order, Order::Spo);
    assert_eq!(issue.primary, primary);
    assert_eq!(issue.offset, offset);
    assert_ne!(issue.actual_crc, issue.expected_crc);

    // Reads through the damaged ordering fail fast instead of returning a
    // truncated neighbor set.
    let snap = engine.snapshot().unwrap();
    assert!(snap.neighbors(a, Some(_r)).is_err());
}

#[test]
fn fast_repair_rebuilds_only_the_damaged_primary() {
    let dir = tempdir().unwrap();
    let (base, a, r, n) = build(dir.path());
    corrupt_first_spo_page(&base);

    let engine = Engine::open(&base).unwrap();
    let report = engine.repair(RepairOptions { fast: true }).unwrap();
    assert_eq!(report.orders_repaired, vec![Order::Spo]);
    assert_eq!(report.primaries_rebuilt, 1);

    let check = engine.check(CheckOptions { strict: true }).unwrap();
    assert!(check.ok, "post-repair check failed: {:?}", check.errors);

    let snap = engine.snapshot().unwrap();
    let edges: Vec<EdgeKey> = snap.neighbors(a, Some(r)).unwrap().collect();
    assert_eq!(edges.len(), n);
}

#[test]
fn full_repair_rewrites_the_damaged_ordering() {
    let dir = tempdir().unwrap();
    let (base, a, r, n) = build(dir.path());
    corrupt_first_spo_page(&base);

    let engine = Engine::open(&base).unwrap();
    let report = engine.repair(RepairOptions { fast: false }).unwrap();
    assert_eq!(report.orders_repaired, vec![Order::Spo]);
    assert!(report.pages_rebuilt >= 1);

    let check = engine.check(CheckOptions { strict: true }).unwrap();
    assert!(check.ok);

    let snap = engine.snapshot().unwrap();
    assert_eq!(snap.neighbors(a, Some(r)).unwrap().count(), n);
}

#[test]
fn clean_database_checks_ok_and_repair_is_a_no_op() {
    let dir = tempdir().unwrap();
    let (base, _a, _r, _n) = build(dir.path());

    let engine = Engine::open(&base).unwrap();
    let report = engine.check(CheckOptions { strict: true }).unwrap();
    assert!(report.ok);
    assert!(report.pages_checked >= 6);

    let repair = engine.repair(RepairOptions { fast: true }).unwrap();
    assert!(repair.orders_repaired.is_empty());
    assert_eq!(repair.pages_rebuilt, 0);
}
