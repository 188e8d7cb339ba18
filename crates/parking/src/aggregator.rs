//! Carpark data tree and the single consumer thread that folds row records into it.

use std::{collections::BTreeMap, thread};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::{
    record::{Rollup, RowOccupancy, RowRecord},
    sink::MetricsSink,
    telemetry,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelNode {
    pub rows: BTreeMap<String, RowOccupancy>,
    pub summary: Rollup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteNode {
    pub levels: BTreeMap<String, LevelNode>,
    pub summary: Rollup,
}

/// Accumulated occupancy for the whole deployment, `site -> level -> row`.
///
/// Rows are only ever inserted or replaced whole. Every rollup is recomputed
/// from its children after each merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarparkTree {
    pub sites: BTreeMap<String, SiteNode>,
}

impl CarparkTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Fold one row record into the tree.
    pub fn merge(&mut self, record: RowRecord) {
        let RowRecord { address, row } = record;
        let site = self.sites.entry(address.site).or_default();
        match site.levels.get_mut(&address.level) {
            Some(level) => {
                level.rows.insert(address.row, row);
            }
            None => {
                let mut level = LevelNode::default();
                level.rows.insert(address.row, row);
                site.levels.insert(address.level, level);
            }
        }
        self.recompute();
    }

    /// Rebuild every level and site rollup from the rows currently held.
    pub fn recompute(&mut self) {
        for site in self.sites.values_mut() {
            for level in site.levels.values_mut() {
                level.summary = level.rows.values().map(|row| row.summary).sum();
            }
            site.summary = site.levels.values().map(|level| level.summary).sum();
        }
    }

    /// Totals across every site.
    pub fn carpark_summary(&self) -> Rollup {
        self.sites.values().map(|site| site.summary).sum()
    }

    pub fn row(&self, site: &str, level: &str, row: &str) -> Option<&RowOccupancy> {
        self.sites.get(site)?.levels.get(level)?.rows.get(row)
    }

    pub fn level(&self, site: &str, level: &str) -> Option<&LevelNode> {
        self.sites.get(site)?.levels.get(level)
    }

    /// Nested JSON view: rows carry stall ids plus `Total/Occupied/Unoccupied`,
    /// levels carry their rollup beside their rows, and each site carries
    /// `TotalCarpark/TotalOccupiedCarpark/TotalUnoccupiedCarpark`.
    pub fn to_json(&self) -> Value {
        let mut sites = Map::new();
        for (site_name, site) in &self.sites {
            let mut site_obj = Map::new();
            for (level_name, level) in &site.levels {
                let mut level_obj = Map::new();
                for (row_name, row) in &level.rows {
                    let mut row_obj: Map<String, Value> = row
                        .stalls
                        .iter()
                        .map(|(stall, state)| (stall.to_string(), json!(state)))
                        .collect();
                    insert_rollup(&mut row_obj, row.summary, ["Total", "Occupied", "Unoccupied"]);
                    level_obj.insert(row_name.clone(), Value::Object(row_obj));
                }
                insert_rollup(&mut level_obj, level.summary, ["Total", "Occupied", "Unoccupied"]);
                site_obj.insert(level_name.clone(), Value::Object(level_obj));
            }
            insert_rollup(
                &mut site_obj,
                site.summary,
                ["TotalCarpark", "TotalOccupiedCarpark", "TotalUnoccupiedCarpark"],
            );
            sites.insert(site_name.clone(), Value::Object(site_obj));
        }
        Value::Object(sites)
    }
}

fn insert_rollup(obj: &mut Map<String, Value>, rollup: Rollup, keys: [&str; 3]) {
    obj.insert(keys[0].into(), json!(rollup.total));
    obj.insert(keys[1].into(), json!(rollup.occupied));
    obj.insert(keys[2].into(), json!(rollup.unoccupied));
}

/// Spawn the aggregator thread.
///
/// The thread blocks on `records` until every sender is dropped, forwarding
/// the whole tree to `sink` after each merge. Sink failures are logged and the
/// loop carries on. The final tree is returned on join.
pub fn spawn_aggregator(
    records: Receiver<RowRecord>,
    mut sink: Box<dyn MetricsSink>,
) -> Result<thread::JoinHandle<CarparkTree>> {
    telemetry::spawn_thread("parking-aggregator", move || {
        let span = tracing::info_span!("aggregator", sink = sink.name());
        let _guard = span.enter();
        let depth_probe = records.clone();
        let mut tree = CarparkTree::new();
        for record in records {
            debug!(address = %record.address, "merging row record");
            tree.merge(record);
            metrics::counter!("parking_aggregator_merges_total").increment(1);
            metrics::gauge!("parking_queue_depth", "queue" => "aggregation")
                .set(depth_probe.len() as f64);
            if let Err(err) = sink.write(&tree) {
                metrics::counter!("parking_sink_errors_total").increment(1);
                warn!("Metrics sink write failed: {err}");
            }
        }
        let summary = tree.carpark_summary();
        info!(
            total = summary.total,
            occupied = summary.occupied,
            "Aggregation queue closed; aggregator exiting"
        );
        tree
    })
    .context("Failed to spawn aggregator thread")
}
