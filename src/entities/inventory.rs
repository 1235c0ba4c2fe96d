use crate::entities::item::{merge_stacks, ItemKind, ItemSignature, ItemStack};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    #[error("insufficient {signature}: requested {requested}, held {held}")]
    Insufficient {
        signature: ItemSignature,
        requested: u64,
        held: u64,
    },
}

/// Result of fitting a batch of additions into the remaining capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapacityFit {
    pub accepted: Vec<ItemStack>,
    pub truncated: Vec<ItemStack>,
}

impl CapacityFit {
    pub fn accepted_count(&self) -> u64 {
        self.accepted.iter().map(|stack| stack.count).sum()
    }

    pub fn truncated_count(&self) -> u64 {
        self.truncated.iter().map(|stack| stack.count).sum()
    }
}

/// Item storage that is not bound to a fixed grid of slots.
///
/// Quantities are kept per signature; slot usage is derived as
/// `sum(ceil(count / max_stack))` and kept up to date on every mutation.
/// `add` never rejects, so callers that must respect `max_slots` go
/// through [`LogicalInventory::clamp_additions`] or
/// [`LogicalInventory::add_within_capacity`].
#[derive(Debug, Clone)]
pub struct LogicalInventory {
    items: BTreeMap<ItemSignature, u64>,
    max_slots: u64,
    used_slots: u64,
    preferred: Option<ItemKind>,
    layout: Option<Vec<ItemStack>>,
}

impl PartialEq for LogicalInventory {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
            && self.max_slots == other.max_slots
            && self.preferred == other.preferred
    }
}

impl Eq for LogicalInventory {}

impl LogicalInventory {
    pub fn new(max_slots: u64) -> Self {
        Self {
            items: BTreeMap::new(),
            max_slots,
            used_slots: 0,
            preferred: None,
            layout: None,
        }
    }

    pub fn max_slots(&self) -> u64 {
        self.max_slots
    }

    /// Changes capacity. Shrinking below the current usage keeps the
    /// items; further additions simply stop fitting.
    pub fn set_max_slots(&mut self, max_slots: u64) {
        self.max_slots = max_slots;
    }

    pub fn used_slots(&self) -> u64 {
        self.used_slots
    }

    pub fn free_slots(&self) -> u64 {
        self.max_slots.saturating_sub(self.used_slots)
    }

    pub fn is_full(&self) -> bool {
        self.used_slots >= self.max_slots
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count_of(&self, signature: &ItemSignature) -> u64 {
        self.items.get(signature).copied().unwrap_or(0)
    }

    pub fn total_count(&self) -> u64 {
        self.items
            .values()
            .fold(0u64, |acc, count| acc.saturating_add(*count))
    }

    /// Merges stacks in without a capacity check.
    pub fn add<I>(&mut self, stacks: I)
    where
        I: IntoIterator<Item = ItemStack>,
    {
        let mut changed = false;
        for (signature, count) in merge_stacks(stacks) {
            let held = self.count_of(&signature);
            let next = held.saturating_add(count);
            self.used_slots = self
                .used_slots
                .saturating_sub(signature.slots_for(held))
                .saturating_add(signature.slots_for(next));
            self.items.insert(signature, next);
            changed = true;
        }
        if changed {
            self.layout = None;
        }
    }

    /// Removes every requested stack or nothing at all.
    pub fn remove<I>(&mut self, stacks: I) -> Result<(), InventoryError>
    where
        I: IntoIterator<Item = ItemStack>,
    {
        let requested = merge_stacks(stacks);
        for (signature, count) in &requested {
            let held = self.count_of(signature);
            if *count > held {
                return Err(InventoryError::Insufficient {
                    signature: signature.clone(),
                    requested: *count,
                    held,
                });
            }
        }
        if requested.is_empty() {
            return Ok(());
        }
        for (signature, count) in requested {
            let held = self.count_of(&signature);
            let next = held - count;
            self.used_slots = self
                .used_slots
                .saturating_sub(signature.slots_for(held))
                .saturating_add(signature.slots_for(next));
            if next == 0 {
                self.items.remove(&signature);
            } else {
                self.items.insert(signature, next);
            }
        }
        self.layout = None;
        Ok(())
    }

    /// Works out how much of `stacks` fits into the free slots.
    ///
    /// Whole signatures are placed first, cheapest in new slots first and
    /// then by signature order; what is left over is squeezed into any
    /// remaining room, including the unused tail of partially filled slots.
    pub fn clamp_additions<I>(&self, stacks: I) -> CapacityFit
    where
        I: IntoIterator<Item = ItemStack>,
    {
        let mut remaining = self.free_slots();
        let mut candidates: Vec<(ItemSignature, u64, u64)> = merge_stacks(stacks)
            .into_iter()
            .map(|(signature, count)| {
                let held = self.count_of(&signature);
                let new_slots = signature
                    .slots_for(held.saturating_add(count))
                    .saturating_sub(signature.slots_for(held));
                (signature, count, new_slots)
            })
            .collect();
        candidates.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

        let mut fit = CapacityFit::default();
        let mut deferred = Vec::new();
        for (signature, count, new_slots) in candidates {
            if new_slots <= remaining {
                remaining -= new_slots;
                fit.accepted.push(ItemStack::new(signature, count));
            } else {
                deferred.push((signature, count));
            }
        }

        for (signature, count) in deferred {
            let held = self.count_of(&signature);
            let held_slots = signature.slots_for(held);
            let headroom = held_slots
                .saturating_mul(signature.max_stack())
                .saturating_sub(held);
            let room = headroom.saturating_add(remaining.saturating_mul(signature.max_stack()));
            let placed = count.min(room);
            if placed > 0 {
                let used = signature
                    .slots_for(held + placed)
                    .saturating_sub(held_slots);
                remaining = remaining.saturating_sub(used);
                fit.accepted.push(ItemStack::new(signature.clone(), placed));
            }
            if placed < count {
                fit.truncated.push(ItemStack::new(signature, count - placed));
            }
        }
        fit
    }

    /// Adds what fits and hands back the accounting.
    pub fn add_within_capacity<I>(&mut self, stacks: I) -> CapacityFit
    where
        I: IntoIterator<Item = ItemStack>,
    {
        let fit = self.clamp_additions(stacks);
        self.add(fit.accepted.iter().cloned());
        fit
    }

    /// One stack per signature, in signature order.
    pub fn consolidated_view(&self) -> Vec<ItemStack> {
        self.items
            .iter()
            .map(|(signature, count)| ItemStack::new(signature.clone(), *count))
            .collect()
    }

    pub fn preferred_sort(&self) -> Option<&ItemKind> {
        self.preferred.as_ref()
    }

    /// Moves every signature of `kind` to the front of the page layout.
    pub fn sort_by(&mut self, kind: Option<ItemKind>) {
        if self.preferred != kind {
            self.preferred = kind;
            self.layout = None;
        }
    }

    /// The inventory broken into native-sized stacks in page order.
    pub fn display_slots(&mut self) -> &[ItemStack] {
        if self.layout.is_none() {
            self.layout = Some(self.build_layout());
        }
        self.layout.as_deref().unwrap_or(&[])
    }

    pub fn page_count(&self, page_size: usize) -> usize {
        let page_size = page_size.max(1) as u64;
        self.used_slots.div_ceil(page_size).max(1) as usize
    }

    /// Native stacks shown on `page` (zero-based).
    pub fn page(&mut self, page: usize, page_size: usize) -> Vec<ItemStack> {
        let page_size = page_size.max(1);
        let start = page.saturating_mul(page_size);
        self.display_slots()
            .iter()
            .skip(start)
            .take(page_size)
            .cloned()
            .collect()
    }

    fn build_layout(&self) -> Vec<ItemStack> {
        let mut ordered: Vec<(&ItemSignature, u64)> =
            self.items.iter().map(|(sig, count)| (sig, *count)).collect();
        if let Some(preferred) = &self.preferred {
            ordered.sort_by_key(|(signature, _)| signature.kind() != preferred);
        }
        let mut slots = Vec::with_capacity(self.used_slots.min(4096) as usize);
        for (signature, mut count) in ordered {
            let cap = signature.max_stack();
            while count > 0 {
                let take = count.min(cap);
                slots.push(ItemStack::new(signature.clone(), take));
                count -= take;
            }
        }
        slots
    }
}
