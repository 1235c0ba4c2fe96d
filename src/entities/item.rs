use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Material identity of an item, e.g. `bone` or `iron_ingot`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKind(pub String);

impl ItemKind {
    pub fn new(name: impl Into<String>) -> Self {
        ItemKind(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything beyond the kind that decides whether two items stack.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct QualityFingerprint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durability: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enchantments: BTreeMap<String, u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl QualityFingerprint {
    pub fn is_plain(&self) -> bool {
        self.durability.is_none() && self.enchantments.is_empty() && self.variant.is_none()
    }
}

/// Stacking identity of an item. Two items with equal signatures are
/// interchangeable, so quantity is tracked separately.
///
/// The native stack cap belongs to the kind; it rides along so capacity
/// math never needs a second lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemSignature {
    kind: ItemKind,
    #[serde(default, skip_serializing_if = "QualityFingerprint::is_plain")]
    quality: QualityFingerprint,
    max_stack: u16,
}

impl ItemSignature {
    pub fn new(kind: ItemKind, max_stack: u16) -> Self {
        Self {
            kind,
            quality: QualityFingerprint::default(),
            max_stack: max_stack.max(1),
        }
    }

    pub fn with_quality(kind: ItemKind, max_stack: u16, quality: QualityFingerprint) -> Self {
        Self {
            kind,
            quality,
            max_stack: max_stack.max(1),
        }
    }

    pub fn kind(&self) -> &ItemKind {
        &self.kind
    }

    pub fn quality(&self) -> &QualityFingerprint {
        &self.quality
    }

    /// Largest count one native slot can hold.
    pub fn max_stack(&self) -> u64 {
        u64::from(self.max_stack.max(1))
    }

    /// Native slots needed to hold `count` of this signature.
    pub fn slots_for(&self, count: u64) -> u64 {
        count.div_ceil(self.max_stack())
    }
}

impl fmt::Display for ItemSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(durability) = self.quality.durability {
            write!(f, "@{}", durability)?;
        }
        if let Some(variant) = &self.quality.variant {
            write!(f, "#{}", variant)?;
        }
        for (name, level) in &self.quality.enchantments {
            write!(f, "+{}{}", name, level)?;
        }
        Ok(())
    }
}

/// A signature paired with a quantity. Loot batches and withdrawals use
/// these freely above the native cap; pages split them into native slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub signature: ItemSignature,
    pub count: u64,
}

impl ItemStack {
    pub fn new(signature: ItemSignature, count: u64) -> Self {
        Self { signature, count }
    }

    pub fn slots(&self) -> u64 {
        self.signature.slots_for(self.count)
    }
}

/// Folds stacks with equal signatures together, dropping empty ones.
pub fn merge_stacks<I>(stacks: I) -> BTreeMap<ItemSignature, u64>
where
    I: IntoIterator<Item = ItemStack>,
{
    let mut merged: BTreeMap<ItemSignature, u64> = BTreeMap::new();
    for stack in stacks {
        if stack.count == 0 {
            continue;
        }
        let entry = merged.entry(stack.signature).or_insert(0);
        *entry = entry.saturating_add(stack.count);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sword(durability: u16) -> ItemSignature {
        ItemSignature::with_quality(
            ItemKind::new("iron_sword"),
            1,
            QualityFingerprint {
                durability: Some(durability),
                ..QualityFingerprint::default()
            },
        )
    }

    #[test]
    fn signatures_compare_structurally() {
        let a = ItemSignature::new(ItemKind::new("bone"), 64);
        let b = ItemSignature::new(ItemKind::new("bone"), 64);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));

        assert_ne!(sword(10), sword(11));
    }

    #[test]
    fn slots_round_up_per_native_cap() {
        let arrow = ItemSignature::new(ItemKind::new("arrow"), 64);
        assert_eq!(arrow.slots_for(0), 0);
        assert_eq!(arrow.slots_for(1), 1);
        assert_eq!(arrow.slots_for(64), 1);
        assert_eq!(arrow.slots_for(65), 2);

        let pearl = ItemSignature::new(ItemKind::new("ender_pearl"), 16);
        assert_eq!(pearl.slots_for(64), 4);
    }

    #[test]
    fn zero_cap_is_treated_as_one() {
        let odd = ItemSignature::new(ItemKind::new("odd"), 0);
        assert_eq!(odd.max_stack(), 1);
        assert_eq!(odd.slots_for(3), 3);
    }

    #[test]
    fn merge_stacks_folds_equal_signatures() {
        let bone = ItemSignature::new(ItemKind::new("bone"), 64);
        let merged = merge_stacks(vec![
            ItemStack::new(bone.clone(), 10),
            ItemStack::new(sword(3), 1),
            ItemStack::new(bone.clone(), 5),
            ItemStack::new(sword(4), 0),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get(&bone), Some(&15));
    }

    #[test]
    fn display_includes_quality() {
        let mut enchantments = BTreeMap::new();
        enchantments.insert("sharpness".to_string(), 2);
        let signature = ItemSignature::with_quality(
            ItemKind::new("bow"),
            1,
            QualityFingerprint {
                durability: Some(7),
                enchantments,
                variant: None,
            },
        );
        assert_eq!(signature.to_string(), "bow@7+sharpness2");
    }
}
