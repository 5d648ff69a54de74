//! Item configuration model and sources
//!
//! The manager never reads the authoritative configuration store directly.
//! It polls a [`ConfigSource`] for a monotonic revision and refetches the
//! preprocessable items when that revision moves.

use crate::error::{PreprocError, Result};
use crate::types::{ItemFlags, ItemKind, Step, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// An item fed from another item's processed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentItem {
    pub itemid: u64,
    /// Dependent is a low-level discovery rule
    #[serde(default)]
    pub discovery: bool,
}

impl DependentItem {
    pub fn new(itemid: u64) -> Self {
        Self {
            itemid,
            discovery: false,
        }
    }

    pub fn flags(&self) -> ItemFlags {
        if self.discovery {
            ItemFlags::DISCOVERY_RULE
        } else {
            ItemFlags::NONE
        }
    }
}

/// Preprocessing configuration of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemConfig {
    pub itemid: u64,
    #[serde(default)]
    pub kind: ItemKind,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub dependents: Vec<DependentItem>,
    /// Configuration revision this item last changed in
    #[serde(default)]
    pub revision: u64,
}

impl ItemConfig {
    pub fn new(itemid: u64, value_type: ValueType) -> Self {
        Self {
            itemid,
            kind: ItemKind::Regular,
            value_type,
            steps: Vec::new(),
            dependents: Vec::new(),
            revision: 0,
        }
    }

    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_dependent(mut self, dependent: DependentItem) -> Self {
        self.dependents.push(dependent);
        self
    }

    /// Equal configuration, whatever revision each side was stamped with
    pub fn same_settings(&self, other: &ItemConfig) -> bool {
        self.itemid == other.itemid
            && self.kind == other.kind
            && self.value_type == other.value_type
            && self.steps == other.steps
            && self.dependents == other.dependents
    }

    /// Whether successive values must be processed strictly in order
    pub fn is_order_sensitive(&self) -> bool {
        self.steps.iter().any(|s| s.step_type.is_order_sensitive())
    }
}

/// Authoritative item configuration as seen by the manager
#[cfg_attr(test, mockall::automock)]
pub trait ConfigSource: Send {
    /// Monotonic revision of the whole configuration
    fn revision(&self) -> u64;

    /// All items that have preprocessing steps or dependents
    fn preprocessable_items(&self) -> Vec<ItemConfig>;
}

#[derive(Debug, Default)]
struct SourceState {
    revision: u64,
    items: HashMap<u64, ItemConfig>,
}

/// On-disk item store layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct ItemsFile {
    #[serde(default)]
    items: Vec<ItemConfig>,
}

/// In-memory configuration source shared between the owner and the manager.
///
/// Every mutation bumps the revision and stamps the changed item with it, so
/// the manager can tell which items changed since its last sync.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    state: Arc<RwLock<SourceState>>,
}

impl StaticConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: impl IntoIterator<Item = ItemConfig>) -> Self {
        let source = Self::new();
        source.replace_all(items);
        source
    }

    /// Load items from a TOML store with `[[items]]` tables
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PreprocError::Config(format!("Failed to read items file {:?}: {}", path, e))
        })?;
        let file: ItemsFile = toml::from_str(&content).map_err(|e| {
            PreprocError::Config(format!("Failed to parse items file {:?}: {}", path, e))
        })?;
        tracing::info!("Loaded {} items from {:?}", file.items.len(), path);
        Ok(Self::from_items(file.items))
    }

    /// Re-read a TOML store. Unchanged items keep their revision.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<()> {
        let fresh = Self::load(path)?;
        let items: Vec<ItemConfig> = fresh.items();
        self.replace_all(items);
        Ok(())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SourceState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SourceState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or replace one item
    pub fn upsert(&self, mut item: ItemConfig) -> u64 {
        let mut state = self.write();
        state.revision += 1;
        item.revision = state.revision;
        state.items.insert(item.itemid, item);
        state.revision
    }

    /// Remove one item
    pub fn remove(&self, itemid: u64) -> u64 {
        let mut state = self.write();
        if state.items.remove(&itemid).is_some() {
            state.revision += 1;
        }
        state.revision
    }

    /// Replace the whole item set.
    ///
    /// Items equal to the stored ones keep their revision; only new or
    /// changed items are stamped with the bumped one.
    pub fn replace_all(&self, items: impl IntoIterator<Item = ItemConfig>) -> u64 {
        let mut state = self.write();
        state.revision += 1;
        let revision = state.revision;
        let previous = std::mem::take(&mut state.items);
        state.items = items
            .into_iter()
            .map(|mut item| {
                item.revision = match previous.get(&item.itemid) {
                    Some(old) if old.same_settings(&item) => old.revision,
                    _ => revision,
                };
                (item.itemid, item)
            })
            .collect();
        revision
    }

    pub fn items(&self) -> Vec<ItemConfig> {
        self.read().items.values().cloned().collect()
    }
}

impl ConfigSource for StaticConfigSource {
    fn revision(&self) -> u64 {
        self.read().revision
    }

    fn preprocessable_items(&self) -> Vec<ItemConfig> {
        self.read()
            .items
            .values()
            .filter(|item| !item.steps.is_empty() || !item.dependents.is_empty())
            .cloned()
            .collect()
    }
}
