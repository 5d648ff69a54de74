//! Test data builders for item configuration and values

use preproc_rs::config::{DependentItem, ItemConfig};
use preproc_rs::types::{ErrorHandler, ItemKind, ItemValue, Step, StepType, Timespec, ValueType};

/// Builder for item configurations
pub struct ItemBuilder {
    item: ItemConfig,
}

impl ItemBuilder {
    pub fn new(itemid: u64) -> Self {
        Self {
            item: ItemConfig::new(itemid, ValueType::Float),
        }
    }

    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.item.value_type = value_type;
        self
    }

    pub fn internal(mut self) -> Self {
        self.item.kind = ItemKind::Internal;
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.item.steps.push(step);
        self
    }

    pub fn multiply(self, factor: &str) -> Self {
        self.step(Step::new(StepType::Multiplier, factor))
    }

    pub fn dependent(mut self, itemid: u64) -> Self {
        self.item.dependents.push(DependentItem::new(itemid));
        self
    }

    pub fn discovery_dependent(mut self, itemid: u64) -> Self {
        self.item.dependents.push(DependentItem {
            itemid,
            discovery: true,
        });
        self
    }

    pub fn build(self) -> ItemConfig {
        self.item
    }
}

/// Builder for collected values
pub struct ValueBuilder {
    value: ItemValue,
}

impl ValueBuilder {
    pub fn new(itemid: u64, value: &str) -> Self {
        Self {
            value: ItemValue::new(itemid, ValueType::Float, value),
        }
    }

    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value.value_type = value_type;
        self
    }

    pub fn at(mut self, sec: i32) -> Self {
        self.value.ts = Some(Timespec::new(sec, 0));
        self
    }

    pub fn build(self) -> ItemValue {
        self.value
    }
}

/// A step failing on anything that is not an integer, with a handler
pub fn failing_step(handler: ErrorHandler, params: &str) -> Step {
    Step::new(StepType::ValidateRegex, "^[0-9]+$").on_fail(handler, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_builder() {
        let item = ItemBuilder::new(7)
            .value_type(ValueType::Uint64)
            .multiply("2")
            .dependent(8)
            .build();

        assert_eq!(item.itemid, 7);
        assert_eq!(item.value_type, ValueType::Uint64);
        assert_eq!(item.steps.len(), 1);
        assert_eq!(item.dependents[0].itemid, 8);
    }
}
