use crate::entities::item::{ItemKind, ItemSignature, ItemStack};
use crate::world::participants::ParticipantId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EconomyError {
    #[error("deposit rejected: {0}")]
    Rejected(String),
    #[error("insufficient funds for {participant:?}: need {needed}, have {available}")]
    InsufficientFunds {
        participant: ParticipantId,
        needed: f64,
        available: f64,
    },
}

pub trait PriceSource: Send + Sync {
    /// Sale price of one unit, `None` if the item cannot be sold.
    fn unit_price(&self, signature: &ItemSignature) -> Option<f64>;
}

/// Currency side of a sale.
pub trait Economy: PriceSource {
    fn deposit(&self, to: ParticipantId, amount: f64) -> Result<(), EconomyError>;

    /// Takes back a deposit; used only to undo a sale that failed halfway.
    fn reverse_deposit(&self, from: ParticipantId, amount: f64) -> Result<(), EconomyError>;
}

/// Total price of `stacks`, ignoring unsellable items.
pub fn value_of<P: PriceSource + ?Sized>(prices: &P, stacks: &[ItemStack]) -> f64 {
    stacks
        .iter()
        .filter_map(|stack| {
            prices
                .unit_price(&stack.signature)
                .map(|price| price * stack.count as f64)
        })
        .sum()
}

/// Only the stacks that have a price.
pub fn sellable<P: PriceSource + ?Sized>(prices: &P, stacks: Vec<ItemStack>) -> Vec<ItemStack> {
    stacks
        .into_iter()
        .filter(|stack| {
            prices
                .unit_price(&stack.signature)
                .map_or(false, |price| price > 0.0)
        })
        .collect()
}

/// Flat per-kind prices.
#[derive(Debug, Default, Clone)]
pub struct PriceTable {
    prices: HashMap<ItemKind, f64>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: ItemKind, price: f64) {
        self.prices.insert(kind, price);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl PriceSource for PriceTable {
    fn unit_price(&self, signature: &ItemSignature) -> Option<f64> {
        self.prices.get(signature.kind()).copied()
    }
}

/// In-process balances.
#[derive(Debug, Default)]
pub struct Ledger {
    prices: PriceTable,
    balances: Mutex<HashMap<ParticipantId, f64>>,
}

impl Ledger {
    pub fn new(prices: PriceTable) -> Self {
        Self {
            prices,
            balances: Mutex::new(HashMap::new()),
        }
    }

    pub fn balance(&self, participant: ParticipantId) -> f64 {
        self.balances().get(&participant).copied().unwrap_or(0.0)
    }

    fn balances(&self) -> MutexGuard<'_, HashMap<ParticipantId, f64>> {
        self.balances.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PriceSource for Ledger {
    fn unit_price(&self, signature: &ItemSignature) -> Option<f64> {
        self.prices.unit_price(signature)
    }
}

impl Economy for Ledger {
    fn deposit(&self, to: ParticipantId, amount: f64) -> Result<(), EconomyError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(EconomyError::Rejected(format!("invalid amount {}", amount)));
        }
        *self.balances().entry(to).or_insert(0.0) += amount;
        Ok(())
    }

    fn reverse_deposit(&self, from: ParticipantId, amount: f64) -> Result<(), EconomyError> {
        let mut balances = self.balances();
        let balance = balances.entry(from).or_insert(0.0);
        if *balance + f64::EPSILON < amount {
            return Err(EconomyError::InsufficientFunds {
                participant: from,
                needed: amount,
                available: *balance,
            });
        }
        *balance = (*balance - amount).max(0.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices() -> PriceTable {
        let mut table = PriceTable::new();
        table.insert(ItemKind::new("bone"), 2.5);
        table.insert(ItemKind::new("arrow"), 0.5);
        table
    }

    #[test]
    fn value_skips_unpriced_items() {
        let prices = prices();
        let stacks = vec![
            ItemStack::new(ItemSignature::new(ItemKind::new("bone"), 64), 4),
            ItemStack::new(ItemSignature::new(ItemKind::new("arrow"), 64), 10),
            ItemStack::new(ItemSignature::new(ItemKind::new("dirt"), 64), 99),
        ];
        assert!((value_of(&prices, &stacks) - 15.0).abs() < 1e-9);
        assert_eq!(sellable(&prices, stacks).len(), 2);
    }

    #[test]
    fn ledger_deposit_and_reverse() {
        let ledger = Ledger::new(prices());
        let who = ParticipantId(7);
        ledger.deposit(who, 12.0).expect("deposit");
        assert_eq!(ledger.balance(who), 12.0);
        ledger.reverse_deposit(who, 12.0).expect("reverse");
        assert_eq!(ledger.balance(who), 0.0);
        assert!(ledger.reverse_deposit(who, 1.0).is_err());
        assert!(ledger.deposit(who, f64::NAN).is_err());
    }
}
