//! Pending build queue.

use std::collections::{BTreeMap, BTreeSet};

use super::BuildTask;
use crate::id::BuildId;

/// A queued build with its arrival order.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: BuildId,
    pub arrival: u64,
    pub task: BuildTask,
}

/// Pending builds in arrival order.
#[derive(Debug, Clone, Default)]
pub struct BuildQueue {
    entries: Vec<QueueEntry>,
}

impl BuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: QueueEntry) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.arrival > entry.arrival)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    pub fn remove(&mut self, id: &BuildId) -> Option<QueueEntry> {
        let pos = self.entries.iter().position(|e| &e.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn get(&self, id: &BuildId) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn contains(&self, id: &BuildId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut QueueEntry> {
        self.entries.iter_mut()
    }

    /// Dependency rank of every entry.
    ///
    /// Rank 0 means no parent build is in flight. Otherwise the rank is the
    /// number of in-flight builds between the entry and the nearest settled
    /// ancestor. Recomputed on every call, so it follows parent completions.
    pub fn ranks(&self, is_running: impl Fn(&BuildId) -> bool) -> BTreeMap<BuildId, u32> {
        let mut ranks = BTreeMap::new();
        for entry in &self.entries {
            let mut rank = 0;
            let mut seen = BTreeSet::new();
            let mut parent = entry.task.parent_build.as_ref();
            while let Some(p) = parent {
                if !seen.insert(p) {
                    break;
                }
                if let Some(queued) = self.get(p) {
                    rank += 1;
                    parent = queued.task.parent_build.as_ref();
                } else if is_running(p) {
                    rank += 1;
                    break;
                } else {
                    break;
                }
            }
            ranks.insert(entry.id.clone(), rank);
        }
        ranks
    }

    /// Entries sorted by (rank, arrival).
    pub fn ordered(&self, is_running: impl Fn(&BuildId) -> bool) -> Vec<(u32, &QueueEntry)> {
        let ranks = self.ranks(is_running);
        let mut ordered: Vec<(u32, &QueueEntry)> = self
            .entries
            .iter()
            .map(|e| (ranks.get(&e.id).copied().unwrap_or(0), e))
            .collect();
        ordered.sort_by_key(|(rank, e)| (*rank, e.arrival));
        ordered
    }
}
