//! Work-set selection, chunk partitioning, and deterministic merging.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{RunMode, TargetFilter};
use crate::model::{OutputItem, WorkItem};
use crate::phase::ChunkStrategy;

/// One backend call's worth of work.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub items: Vec<WorkItem>,
}

impl Chunk {
    /// Deterministic key derived from the chunk's item ids. An identical
    /// work set re-chunks to identical keys, so checkpointed chunks are
    /// recognized across process restarts.
    pub fn key(&self) -> String {
        let first = self.items.first().map(|i| i.id.as_str()).unwrap_or("");
        let last = self.items.last().map(|i| i.id.as_str()).unwrap_or("");
        format!("{first}..{last}/{}", self.items.len())
    }
}

/// Select the items a phase execution should process.
///
/// `covered_latest` is the id set of the phase's latest artifact;
/// `covered_ever` the union across all artifacts ever written for the key.
pub fn select_work(
    all: &[WorkItem],
    covered_latest: &BTreeSet<String>,
    covered_ever: &BTreeSet<String>,
    mode: RunMode,
    filter: &TargetFilter,
) -> Vec<WorkItem> {
    all.iter()
        .filter(|item| match &filter.scene {
            Some(scene) => &item.scene == scene,
            None => true,
        })
        .filter(|item| match &filter.route {
            Some(route) => &item.route == route,
            None => true,
        })
        .filter(|item| match mode {
            RunMode::Overwrite => true,
            RunMode::GapFill => !covered_latest.contains(&item.id),
            RunMode::NewOnly => !covered_ever.contains(&item.id),
        })
        .cloned()
        .collect()
}

/// Partition a work set into chunks, preserving input order. Groups are
/// emitted in order of first occurrence.
pub fn partition(items: Vec<WorkItem>, strategy: ChunkStrategy) -> Vec<Chunk> {
    if items.is_empty() {
        return Vec::new();
    }

    match strategy {
        ChunkStrategy::WholeProject => vec![Chunk { items }],
        ChunkStrategy::PerScene => group_by(items, |item| item.scene.clone()),
        ChunkStrategy::PerRoute => group_by(items, |item| item.route.clone()),
    }
}

fn group_by(items: Vec<WorkItem>, key_fn: impl Fn(&WorkItem) -> String) -> Vec<Chunk> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<WorkItem>> = BTreeMap::new();

    for item in items {
        let key = key_fn(&item);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(item);
    }

    order
        .into_iter()
        .map(|key| Chunk {
            items: groups.remove(&key).unwrap_or_default(),
        })
        .collect()
}

/// Merge chunk outputs deterministically: the final artifact is ordered by
/// the full input id order, never by completion order. Items retained from a
/// previous artifact (gap-fill) are kept; fresh outputs win on overlap. Ids
/// with no output (sparse phases) are simply absent.
pub fn merge_outputs(
    ordered_ids: &[String],
    retained: Vec<OutputItem>,
    fresh: Vec<Vec<OutputItem>>,
) -> Vec<OutputItem> {
    let mut by_id: BTreeMap<String, OutputItem> = BTreeMap::new();
    for item in retained {
        by_id.insert(item.id.clone(), item);
    }
    for chunk in fresh {
        for item in chunk {
            by_id.insert(item.id.clone(), item);
        }
    }

    ordered_ids
        .iter()
        .filter_map(|id| by_id.remove(id))
        .collect()
}
