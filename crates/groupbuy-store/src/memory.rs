use anyhow::Result;
use groupbuy_core::{Item, Ledger, Order};

use crate::LedgerStore;

/// Process-local store used by tests and the `memory` backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    items: Vec<Item>,
    orders: Vec<Order>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ledger(ledger: Ledger) -> Self {
        Self { items: ledger.items, orders: ledger.orders }
    }
}

impl LedgerStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn load_items(&mut self) -> Result<Vec<Item>> {
        Ok(self.items.clone())
    }

    fn load_orders(&mut self) -> Result<Vec<Order>> {
        Ok(self.orders.clone())
    }

    fn save_items(&mut self, items: &[Item]) -> Result<()> {
        self.items = items.to_vec();
        Ok(())
    }

    fn save_orders(&mut self, orders: &[Order]) -> Result<()> {
        self.orders = orders.to_vec();
        Ok(())
    }
}
