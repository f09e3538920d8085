//! Integrity check and repair.
//!
//! `check` verifies every manifest-listed page against its recorded CRC;
//! strict mode additionally cross-checks that all six orderings agree on the
//! fact set. `repair` rebuilds damaged orderings from the authoritative fact
//! set — the union of every page that still verifies, across all orderings —
//! either per damaged primary (`fast`) or as a full rewrite of each damaged
//! ordering.

use crate::engine::{Engine, PublishedState};
use crate::manifest::PageRecord;
use crate::segment::{self, Order, SegmentStore};
use crate::{EdgeKey, Error, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    /// Also verify that the orderings agree pairwise on the fact set.
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageIssue {
    pub order: Order,
    pub primary: u32,
    pub offset: u64,
    pub expected_crc: u32,
    pub actual_crc: u32,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    pub ok: bool,
    pub epoch: u64,
    pub pages_checked: u64,
    pub errors: Vec<PageIssue>,
}

#[derive(Debug, Clone, Default)]
pub struct RepairOptions {
    /// Rebuild only the damaged primaries instead of whole orderings.
    pub fast: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub ok: bool,
    pub epoch: u64,
    pub orders_repaired: Vec<Order>,
    pub primaries_rebuilt: u64,
    pub pages_rebuilt: u64,
}

impl Engine {
    pub fn check(&self, opts: CheckOptions) -> Result<CheckReport> {
        let state = self.published.load_full();
        let store = &state.store;

        let mut report = CheckReport {
            ok: true,
            epoch: store.epoch(),
            ..CheckReport::default()
        };

        let mut fact_sets: HashMap<Order, BTreeSet<EdgeKey>> = HashMap::new();
        for order in Order::ALL {
            let mut facts: BTreeSet<EdgeKey> = BTreeSet::new();
            let mut order_clean = true;
            for rec in store.order_pages(order) {
                report.pages_checked += 1;
                match store.page_edges(order, rec) {
                    Ok(edges) => {
                        facts.extend(edges);
                    }
                    Err(e) => {
                        order_clean = false;
                        report.errors.push(issue_from_error(order, rec, &e));
                    }
                }
            }
            if opts.strict && order_clean {
                fact_sets.insert(order, facts);
            }
        }

        if opts.strict {
            // Clean orderings must all index the same triple set.
            let mut iter = fact_sets.iter();
            if let Some((&reference_order, reference)) = iter.next() {
                for (&order, facts) in iter {
                    if facts != reference {
                        report.errors.push(PageIssue {
                            order,
                            primary: 0,
                            offset: 0,
                            expected_crc: 0,
                            actual_crc: 0,
                            detail: format!(
                                "fact set disagrees with {reference_order}: {} vs {} triples",
                                facts.len(),
                                reference.len()
                            ),
                        });
                    }
                }
            }
        }

        report.ok = report.errors.is_empty();
        Ok(report)
    }

    pub fn repair(&self, opts: RepairOptions) -> Result<RepairReport> {
        let _guard = self.write_lock.lock().unwrap();

        let state = self.published.load_full();
        let store = &state.store;

        // Locate every page that fails verification.
        let mut damaged: HashMap<Order, Vec<PageRecord>> = HashMap::new();
        let mut facts: BTreeSet<EdgeKey> = BTreeSet::new();
        for order in Order::ALL {
            for rec in store.order_pages(order) {
                match store.page_edges(order, rec) {
                    Ok(edges) => {
                        facts.extend(edges);
                    }
                    Err(_) => damaged.entry(order).or_default().push(*rec),
                }
            }
        }

        let mut report = RepairReport {
            ok: true,
            epoch: store.epoch(),
            ..RepairReport::default()
        };
        if damaged.is_empty() {
            return Ok(report);
        }

        let mut manifest = store.manifest().clone();
        let comp = self.opts.cold();

        for (&order, bad_pages) in &damaged {
            if opts.fast {
                // Rebuild just the primaries the bad pages covered, splicing
                // fresh pages in and orphaning every page of those primaries.
                let primaries: BTreeSet<u32> =
                    bad_pages.iter().map(|p| p.primary_value).collect();

                let path = self.paths.order_file(order);
                let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
                let mut offset = file.metadata()?.len();

                let mut fresh: Vec<PageRecord> = Vec::new();
                for &primary in &primaries {
                    let edges: Vec<EdgeKey> = facts
                        .iter()
                        .copied()
                        .filter(|e| order.primary(*e) == primary)
                        .collect();
                    let builds = segment::build_pages(order, edges, comp, offset);
                    segment::append_pages(&mut file, &builds)?;
                    for build in builds {
                        offset += build.bytes.len() as u64;
                        fresh.push(build.record);
                    }
                    report.primaries_rebuilt += 1;
                }
                report.pages_rebuilt += fresh.len() as u64;

                let lookup = manifest.lookup_mut(order);
                let (kept, displaced): (Vec<PageRecord>, Vec<PageRecord>) = lookup
                    .pages
                    .iter()
                    .copied()
                    .partition(|p| !primaries.contains(&p.primary_value));
                let mut pages = kept;
                pages.extend(fresh);
                pages.sort_by_key(|p| (p.primary_value, p.offset));
                lookup.pages = pages;
                manifest.orphans_mut(order).pages.extend(displaced);
            } else {
                // Full rewrite of the damaged ordering from the fact set.
                let edges: Vec<EdgeKey> = facts.iter().copied().collect();
                let builds = segment::build_pages(order, edges, comp, 0);
                let tmp = self.paths.order_tmp(order);
                {
                    let mut file = OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&tmp)?;
                    segment::append_pages(&mut file, &builds)?;
                }
                std::fs::rename(&tmp, self.paths.order_file(order))?;

                report.pages_rebuilt += builds.len() as u64;
                let primaries: BTreeSet<u32> =
                    builds.iter().map(|b| b.record.primary_value).collect();
                report.primaries_rebuilt += primaries.len() as u64;
                manifest.lookup_mut(order).pages =
                    builds.into_iter().map(|b| b.record).collect();
                manifest.orphans_mut(order).pages.clear();
            }
            report.orders_repaired.push(order);
        }
        report.orders_repaired.sort_unstable();

        manifest.epoch += 1;
        report.epoch = manifest.epoch;

        self.finish_manifest_swap(manifest, |manifest| {
            let new_store =
                Arc::new(SegmentStore::open(&self.paths.pages_dir(), manifest.clone())?);
            self.publish(|old| PublishedState { store: new_store.clone(), ..old.clone() });
            Ok(())
        })?;

        tracing::warn!(
            orders = ?report.orders_repaired,
            primaries = report.primaries_rebuilt,
            "repaired corrupted segment pages"
        );
        Ok(report)
    }
}

fn issue_from_error(order: Order, rec: &PageRecord, e: &Error) -> PageIssue {
    match e {
        Error::PageCorrupt { order, primary, offset, expected_crc, actual_crc } => PageIssue {
            order: *order,
            primary: *primary,
            offset: *offset,
            expected_crc: *expected_crc,
            actual_crc: *actual_crc,
            detail: "crc mismatch".to_string(),
        },
        other => PageIssue {
            order,
            primary: rec.primary_value,
            offset: rec.offset,
            expected_crc: rec.crc32,
            actual_crc: 0,
            detail: other.to_string(),
        },
    }
}

/// Maintenance entry point over a closed database path.
pub fn check_database(base: impl AsRef<Path>, opts: CheckOptions) -> Result<CheckReport> {
    let engine = Engine::open(base)?;
    engine.check(opts)
}

pub fn repair_database(base: impl AsRef<Path>, opts: RepairOptions) -> Result<RepairReport> {
    let engine = Engine::open(base)?;
    engine.repair(opts)
}
