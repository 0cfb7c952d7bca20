//! Persistence adapters for the group-buy ledger.
//!
//! Every backend speaks the same flat two-table shape; matrix views are never
//! persisted.

use anyhow::Result;
use groupbuy_core::{Item, Ledger, Order};

pub mod codec;
mod csv_file;
mod memory;
mod remote;

pub use csv_file::CsvFileStore;
pub use memory::MemoryStore;
pub use remote::{RemoteConfig, RemoteFileStore, DEFAULT_TOKEN_ENV};

/// Load/save contract shared by every backend.
///
/// Loads never fail on a missing resource: they yield an empty table.
/// Saves replace the whole table.
pub trait LedgerStore {
    fn backend(&self) -> &'static str;

    /// # Errors
    /// Returns an error when the backend cannot be reached at all.
    fn load_items(&mut self) -> Result<Vec<Item>>;

    /// # Errors
    /// Returns an error when the backend cannot be reached at all.
    fn load_orders(&mut self) -> Result<Vec<Order>>;

    /// # Errors
    /// Returns an error when the backend rejects the write.
    fn save_items(&mut self, items: &[Item]) -> Result<()>;

    /// # Errors
    /// Returns an error when the backend rejects the write.
    fn save_orders(&mut self, orders: &[Order]) -> Result<()>;

    /// Load both tables and re-derive every person identifier.
    ///
    /// # Errors
    /// Propagates load failures from either table.
    fn load(&mut self) -> Result<Ledger> {
        let items = self.load_items()?;
        let orders = self.load_orders()?;
        let mut ledger = Ledger::new(items, orders);
        let changed = ledger.normalize_person_ids();
        if changed > 0 {
            tracing::info!(backend = self.backend(), changed, "re-derived person identifiers");
        }
        Ok(ledger)
    }
}

impl<S: LedgerStore + ?Sized> LedgerStore for Box<S> {
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    fn load_items(&mut self) -> Result<Vec<Item>> {
        (**self).load_items()
    }

    fn load_orders(&mut self) -> Result<Vec<Order>> {
        (**self).load_orders()
    }

    fn save_items(&mut self, items: &[Item]) -> Result<()> {
        (**self).save_items(items)
    }

    fn save_orders(&mut self, orders: &[Order]) -> Result<()> {
        (**self).save_orders(orders)
    }

    fn load(&mut self) -> Result<Ledger> {
        (**self).load()
    }
}
