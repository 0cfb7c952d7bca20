use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use groupbuy_core::{Item, Order};

use crate::codec::{
    decode_items, decode_orders, encode_items, encode_orders, ITEMS_FILE, ORDERS_FILE,
};
use crate::LedgerStore;

/// Two CSV files, `items.csv` and `orders.csv`, inside one directory.
#[derive(Debug, Clone)]
pub struct CsvFileStore {
    dir: PathBuf,
}

impl CsvFileStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_table(&self, file_name: &str) -> Option<Vec<u8>> {
        let path = self.dir.join(file_name);
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "unreadable table, using empty"
                );
                None
            }
        }
    }

    fn write_table(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create data directory {}", self.dir.display()))?;

        let path = self.dir.join(file_name);
        let staging = self.dir.join(format!(".{file_name}.tmp"));
        fs::write(&staging, bytes)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        fs::rename(&staging, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

impl LedgerStore for CsvFileStore {
    fn backend(&self) -> &'static str {
        "csv"
    }

    fn load_items(&mut self) -> Result<Vec<Item>> {
        let Some(bytes) = self.read_table(ITEMS_FILE) else {
            return Ok(Vec::new());
        };
        Ok(decode_items(&bytes))
    }

    fn load_orders(&mut self) -> Result<Vec<Order>> {
        let Some(bytes) = self.read_table(ORDERS_FILE) else {
            return Ok(Vec::new());
        };
        Ok(decode_orders(&bytes))
    }

    fn save_items(&mut self, items: &[Item]) -> Result<()> {
        self.write_table(ITEMS_FILE, &encode_items(items)?)
    }

    fn save_orders(&mut self, orders: &[Order]) -> Result<()> {
        self.write_table(ORDERS_FILE, &encode_orders(orders)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use groupbuy_core::{resolve, Ledger, NewOrder};

    use super::*;

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos());
        std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", ulid::Ulid::new()))
    }

    fn fixture_ledger() -> Ledger {
        let now = time::OffsetDateTime::UNIX_EPOCH;
        let mut ledger = Ledger::default();
        for name in ["Rice", "Oil"] {
            if let Err(err) = ledger.add_item(name, now) {
                panic!("fixture item should be accepted: {err}");
            }
        }
        let input = NewOrder {
            item_name: "Rice".to_string(),
            person_name: "Kim".to_string(),
            phone: "010-0000-1111".to_string(),
            quantity: 4,
        };
        if let Err(err) = ledger.add_order(&input, now) {
            panic!("fixture order should be accepted: {err}");
        }
        ledger
    }

    #[test]
    fn missing_directory_loads_as_empty() -> Result<()> {
        let mut store = CsvFileStore::new(unique_temp_dir("gb-missing"));
        let ledger = store.load()?;

        assert!(ledger.items.is_empty());
        assert!(ledger.orders.is_empty());
        Ok(())
    }

    #[test]
    fn save_then_load_keeps_both_tables() -> Result<()> {
        let dir = unique_temp_dir("gb-csv");
        let mut store = CsvFileStore::new(&dir);
        let ledger = fixture_ledger();

        store.save_items(&ledger.items)?;
        store.save_orders(&ledger.orders)?;
        let reloaded = CsvFileStore::new(&dir).load()?;

        assert_eq!(reloaded, ledger);
        assert_eq!(reloaded.orders[0].phone, "01000001111");
        assert_eq!(reloaded.orders[0].person_id, resolve("Kim", "01000001111"));

        fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn empty_save_writes_header_only_files() -> Result<()> {
        let dir = unique_temp_dir("gb-empty");
        let mut store = CsvFileStore::new(&dir);

        store.save_orders(&[])?;
        let text = fs::read_to_string(dir.join(ORDERS_FILE))?;

        assert_eq!(text, "item_name,name,phone,qty,received,created_at,person_id\n");
        assert!(store.load_orders()?.is_empty());

        fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn malformed_row_does_not_wipe_the_table_on_next_save() -> Result<()> {
        let dir = unique_temp_dir("gb-malformed");
        fs::create_dir_all(&dir)?;
        fs::write(
            dir.join(ORDERS_FILE),
            "item_name,name,phone,qty,received,created_at,person_id\n\
             Rice,A,01,1,False,2024-05-01T00:00:00Z,A_01\n\
             Rice,B,02,1,False,2024-05-01T00:00:00Z,B_02\n\
             Rice,Kim, Jr,03,1,False,2024-05-01T00:00:00Z,Kim, Jr_03\n\
             Rice,C,04,1,False,2024-05-01T00:00:00Z,C_04\n",
        )?;
        let mut store = CsvFileStore::new(&dir);
        fs::write(dir.join(ITEMS_FILE), "item_name,created_at\nRice,2024-05-01T00:00:00Z\n")?;

        let mut ledger = store.load()?;
        assert_eq!(ledger.orders.len(), 3);
        let input = NewOrder {
            item_name: "Rice".to_string(),
            person_name: "D".to_string(),
            phone: "05".to_string(),
            quantity: 1,
        };
        if let Err(err) = ledger.add_order(&input, time::OffsetDateTime::UNIX_EPOCH) {
            panic!("order should be accepted: {err}");
        }
        store.save_orders(&ledger.orders)?;

        let names = store
            .load_orders()?
            .into_iter()
            .map(|order| order.person_name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["A", "B", "C", "D"]);

        fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn corrupt_table_loads_as_empty() -> Result<()> {
        let dir = unique_temp_dir("gb-corrupt");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(ITEMS_FILE), b"item_name,created_at\n\"unterminated,2024-01-01\nx")?;
        let mut store = CsvFileStore::new(&dir);

        assert!(store.load_items()?.is_empty());

        fs::remove_dir_all(&dir).ok();
        Ok(())
    }
}
