//! Manager-side snapshot of the item configuration.

use crate::config::{ConfigSource, ItemConfig};
use std::collections::HashMap;

/// Result of a refresh that found a new revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigChange {
    pub old_revision: u64,
    pub new_revision: u64,
}

#[derive(Debug, Default)]
pub struct ItemConfigCache {
    revision: u64,
    items: HashMap<u64, ItemConfig>,
}

impl ItemConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, itemid: u64) -> Option<&ItemConfig> {
        self.items.get(&itemid)
    }

    pub fn contains(&self, itemid: u64) -> bool {
        self.items.contains_key(&itemid)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Refetch the items when the source revision moved.
    ///
    /// The snapshot is replaced wholesale.
    pub fn refresh(&mut self, source: &dyn ConfigSource) -> Option<ConfigChange> {
        let revision = source.revision();
        if revision == self.revision {
            return None;
        }

        self.items = source
            .preprocessable_items()
            .into_iter()
            .map(|item| (item.itemid, item))
            .collect();

        let change = ConfigChange {
            old_revision: self.revision,
            new_revision: revision,
        };
        self.revision = revision;
        tracing::debug!(
            "Item configuration revision {} -> {}, {} items",
            change.old_revision,
            change.new_revision,
            self.items.len()
        );
        Some(change)
    }

    /// Whether history remembered for `itemid` survives a change: the item
    /// must still exist and must not have changed after `since`.
    pub fn history_valid(&self, itemid: u64, since: u64) -> bool {
        self.items
            .get(&itemid)
            .is_some_and(|item| item.revision <= since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::items::MockConfigSource;
    use crate::types::{Step, StepType, ValueType};

    fn item(itemid: u64, revision: u64) -> ItemConfig {
        let mut item = ItemConfig::new(itemid, ValueType::Float)
            .with_steps(vec![Step::new(StepType::Multiplier, "2")]);
        item.revision = revision;
        item
    }

    #[test]
    fn test_refresh_only_on_revision_change() {
        let mut source = MockConfigSource::new();
        source.expect_revision().return_const(3u64);
        source
            .expect_preprocessable_items()
            .times(1)
            .returning(|| vec![item(1, 2), item(2, 3)]);

        let mut cache = ItemConfigCache::new();
        let change = cache.refresh(&source).unwrap();
        assert_eq!(change.old_revision, 0);
        assert_eq!(change.new_revision, 3);
        assert_eq!(cache.len(), 2);

        // unchanged revision does not refetch
        assert!(cache.refresh(&source).is_none());
    }

    #[test]
    fn test_history_valid() {
        let mut source = MockConfigSource::new();
        source.expect_revision().return_const(5u64);
        source
            .expect_preprocessable_items()
            .returning(|| vec![item(1, 2), item(2, 5)]);
        let mut cache = ItemConfigCache::new();
        cache.refresh(&source);

        assert!(cache.history_valid(1, 4));
        assert!(!cache.history_valid(2, 4));
        assert!(!cache.history_valid(3, 4));
    }
}
