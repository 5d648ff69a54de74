//! Per-item history of stateful steps.
//!
//! The cache is owned by the manager. Workers get a copy of an item's
//! entries inside each task and send back the complete replacement set.

use crate::types::HistoryEntry;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct HistoryCache {
    entries: HashMap<u64, Vec<HistoryEntry>>,
}

impl HistoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries of `itemid`, empty when nothing is remembered
    pub fn get(&self, itemid: u64) -> &[HistoryEntry] {
        self.entries.get(&itemid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace the entries of `itemid` wholesale. An empty set deletes them.
    pub fn replace(&mut self, itemid: u64, history: Vec<HistoryEntry>) {
        if history.is_empty() {
            self.entries.remove(&itemid);
        } else {
            self.entries.insert(itemid, history);
        }
    }

    pub fn remove(&mut self, itemid: u64) -> bool {
        self.entries.remove(&itemid).is_some()
    }

    /// Keep only the items for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(u64) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|itemid, _| keep(*itemid));
        before - self.entries.len()
    }

    pub fn contains(&self, itemid: u64) -> bool {
        self.entries.contains_key(&itemid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
