use crate::config::{read_yaml_or_default, ConfigError};
use crate::entities::item::{ItemKind, ItemSignature};
use crate::world::economy::PriceTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_MAX_STACK: u16 = 64;

fn default_max_stack() -> u16 {
    DEFAULT_MAX_STACK
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemType {
    pub kind: ItemKind,
    #[serde(default = "default_max_stack")]
    pub max_stack: u16,
    /// Unit sale price; unpriced items cannot be sold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

#[derive(Debug, Default, Clone)]
pub struct ItemTypeIndex {
    types: HashMap<ItemKind, ItemType>,
}

impl ItemTypeIndex {
    /// Reads `items.yml`, a list of item types. A missing file yields an
    /// empty index.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let entries: Vec<ItemType> = read_yaml_or_default(path)?;
        let mut index = Self::default();
        for item in entries {
            index.insert(item)?;
        }
        Ok(index)
    }

    pub fn get(&self, kind: &ItemKind) -> Option<&ItemType> {
        self.types.get(kind)
    }

    pub fn insert(&mut self, item: ItemType) -> Result<(), ConfigError> {
        if item.max_stack == 0 {
            return Err(ConfigError::Invalid(format!(
                "item type {} has max_stack 0",
                item.kind
            )));
        }
        if let Some(price) = item.price {
            if !price.is_finite() || price < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "item type {} has invalid price {}",
                    item.kind, price
                )));
            }
        }
        if self.types.contains_key(&item.kind) {
            return Err(ConfigError::Invalid(format!(
                "item type {} already exists",
                item.kind
            )));
        }
        self.types.insert(item.kind.clone(), item);
        Ok(())
    }

    pub fn contains(&self, kind: &ItemKind) -> bool {
        self.types.contains_key(kind)
    }

    /// Plain signature for `kind`, falling back to the default stack cap
    /// for kinds the index does not know.
    pub fn signature(&self, kind: &ItemKind) -> ItemSignature {
        let max_stack = self
            .get(kind)
            .map_or(DEFAULT_MAX_STACK, |item| item.max_stack);
        ItemSignature::new(kind.clone(), max_stack)
    }

    pub fn price_table(&self) -> PriceTable {
        let mut table = PriceTable::new();
        for item in self.types.values() {
            if let Some(price) = item.price {
                table.insert(item.kind.clone(), price);
            }
        }
        table
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
