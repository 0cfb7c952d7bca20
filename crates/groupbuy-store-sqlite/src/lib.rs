use std::path::Path;

use anyhow::{anyhow, Context, Result};
use groupbuy_core::{normalize_phone, resolve, Item, Order, PersonId};
use groupbuy_store::codec::{format_timestamp, parse_timestamp};
use groupbuy_store::LedgerStore;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// No foreign key from orders to items: orders of an expired item outlive
// the item row.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS items (
  item_name TEXT PRIMARY KEY CHECK (length(trim(item_name)) > 0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
  row_id INTEGER PRIMARY KEY AUTOINCREMENT,
  item_name TEXT NOT NULL,
  name TEXT NOT NULL,
  phone TEXT NOT NULL,
  qty INTEGER NOT NULL CHECK (qty >= 1),
  received INTEGER NOT NULL CHECK (received IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_item_name ON orders(item_name);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE orders ADD COLUMN person_id TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_orders_person_id ON orders(person_id);
";

pub struct SqliteLedgerStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub orders_missing_person_id: u64,
    pub schema_status: SchemaStatus,
}

impl SqliteLedgerStore {
    /// Open a SQLite-backed ledger and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open and bring the schema up to date in one step.
    ///
    /// # Errors
    /// Returns an error when opening or migrating fails.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "orders")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if !table_has_column(&self.conn, "orders", "name")?
            || !table_has_column(&self.conn, "orders", "phone")?
        {
            return Err(anyhow!("database schema is invalid: orders has no name/phone columns"));
        }

        // Tables created outside the migration runner; make sure items exists too.
        apply_migration_1(&self.conn)?;
        if table_has_column(&self.conn, "orders", "person_id")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    /// Adds `orders.person_id` and backfills it from the stored name and phone.
    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        if !table_has_column(&tx, "orders", "person_id")? {
            tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
        }

        let pending = {
            let mut stmt = tx
                .prepare("SELECT row_id, name, phone FROM orders WHERE trim(person_id) = ''")
                .context("failed to prepare person_id backfill query")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for (row_id, name, phone) in &pending {
            let phone = normalize_phone(phone);
            let person_id = resolve(name, &phone);
            tx.execute(
                "UPDATE orders SET phone = ?1, person_id = ?2 WHERE row_id = ?3",
                params![phone, person_id.as_str(), row_id],
            )
            .with_context(|| format!("failed to backfill person_id for order row {row_id}"))?;
        }

        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;

        if !pending.is_empty() {
            tracing::info!(rows = pending.len(), "migration v2 backfilled person identifiers");
        }
        Ok(())
    }

    /// Run quick-check, a person-identity check, and schema status.
    ///
    /// # Errors
    /// Returns an error when any check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let orders_missing_person_id = if table_has_column(&self.conn, "orders", "person_id")? {
            self.conn
                .query_row(
                    "SELECT COUNT(*) FROM orders WHERE trim(person_id) = ''",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to count orders without person_id")?
                .unsigned_abs()
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            orders_missing_person_id,
            schema_status,
        })
    }

    fn ensure_current_schema(&self) -> Result<()> {
        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "schema version {version} is not {LATEST_SCHEMA_VERSION}; run migrate first"
            ));
        }
        Ok(())
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn load_items(&mut self) -> Result<Vec<Item>> {
        self.ensure_current_schema()?;
        let mut stmt = self
            .conn
            .prepare("SELECT item_name, created_at FROM items ORDER BY rowid")
            .context("failed to prepare items query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(name, created_at)| -> Result<Item> {
                Ok(Item { created_at: parse_timestamp(&created_at)?, name })
            })
            .collect()
    }

    fn load_orders(&mut self) -> Result<Vec<Order>> {
        self.ensure_current_schema()?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT item_name, name, phone, qty, received, created_at, person_id
                 FROM orders ORDER BY row_id",
            )
            .context("failed to prepare orders query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(OrderRow {
                    item_name: row.get(0)?,
                    name: row.get(1)?,
                    phone: row.get(2)?,
                    qty: row.get(3)?,
                    received: row.get(4)?,
                    created_at: row.get(5)?,
                    person_id: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(OrderRow::into_order).collect()
    }

    fn save_items(&mut self, items: &[Item]) -> Result<()> {
        self.ensure_current_schema()?;
        let tx = self.conn.transaction().context("failed to start items transaction")?;
        tx.execute("DELETE FROM items", []).context("failed to clear items")?;
        for item in items {
            tx.execute(
                "INSERT INTO items(item_name, created_at) VALUES (?1, ?2)",
                params![item.name, format_timestamp(item.created_at)?],
            )
            .with_context(|| format!("failed to insert item `{}`", item.name))?;
        }
        tx.commit().context("failed to commit items")?;
        Ok(())
    }

    fn save_orders(&mut self, orders: &[Order]) -> Result<()> {
        self.ensure_current_schema()?;
        let tx = self.conn.transaction().context("failed to start orders transaction")?;
        tx.execute("DELETE FROM orders", []).context("failed to clear orders")?;
        for order in orders {
            tx.execute(
                "INSERT INTO orders(item_name, name, phone, qty, received, created_at, person_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    order.item_name,
                    order.person_name,
                    order.phone,
                    i64::from(order.quantity),
                    i64::from(order.received),
                    format_timestamp(order.created_at)?,
                    order.person_id.as_str(),
                ],
            )
            .with_context(|| format!("failed to insert order for `{}`", order.person_id))?;
        }
        tx.commit().context("failed to commit orders")?;
        Ok(())
    }
}

struct OrderRow {
    item_name: String,
    name: String,
    phone: String,
    qty: i64,
    received: i64,
    created_at: String,
    person_id: String,
}

impl OrderRow {
    fn into_order(self) -> Result<Order> {
        let quantity = u32::try_from(self.qty)
            .map_err(|_| anyhow!("stored qty {} is out of range", self.qty))?;
        Ok(Order {
            item_name: self.item_name,
            person_name: self.name,
            phone: self.phone,
            quantity,
            received: self.received != 0,
            created_at: parse_timestamp(&self.created_at)?,
            person_id: PersonId::from_stored(self.person_id),
        })
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)?;
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "orders")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "orders", "person_id")? {
        return Ok((2, true));
    }

    if table_has_column(conn, "orders", "name")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: orders has no name/phone columns"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = format_timestamp(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use groupbuy_core::{Ledger, NewOrder};
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn fixture_ledger() -> Ledger {
        let mut ledger = Ledger::default();
        for name in ["Rice", "Oil"] {
            if let Err(err) = ledger.add_item(name, fixture_time()) {
                panic!("fixture item should be accepted: {err}");
            }
        }
        for (item, name, phone, quantity) in
            [("Rice", "A", "010-1", 2), ("Oil", "B", "0020", 1), ("Rice", "B", "0020", 3)]
        {
            let input = NewOrder {
                item_name: item.to_string(),
                person_name: name.to_string(),
                phone: phone.to_string(),
                quantity,
            };
            if let Err(err) = ledger.add_order(&input, fixture_time()) {
                panic!("fixture order should be accepted: {err}");
            }
        }
        ledger
    }

    fn insert_legacy_order(conn: &Connection, name: &str, phone: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO orders(item_name, name, phone, qty, received, created_at)
             VALUES ('Rice', ?1, ?2, 1, 0, '2024-05-01 09:00:00')",
            params![name, phone],
        )?;
        Ok(())
    }

    #[test]
    fn fresh_database_migrates_to_latest() -> Result<()> {
        let mut store = SqliteLedgerStore::open(Path::new(":memory:"))?;
        store.migrate()?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 2);
        assert!(status.pending_versions.is_empty());
        assert!(!status.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> Result<()> {
        let mut store = SqliteLedgerStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        store.migrate()?;

        assert_eq!(current_schema_version(&store.conn)?, 2);
        Ok(())
    }

    #[test]
    fn migrate_v1_backfills_person_ids() -> Result<()> {
        let mut store = SqliteLedgerStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        apply_migration_1(&store.conn)?;
        insert_legacy_order(&store.conn, "Kim", "010-1234-5678")?;
        insert_legacy_order(&store.conn, "Lee", "0020")?;

        store.migrate()?;
        let orders = store.load_orders()?;

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].phone, "01012345678");
        assert_eq!(orders[0].person_id, resolve("Kim", "01012345678"));
        assert_eq!(orders[1].person_id.as_str(), "Lee_0020");
        assert_eq!(store.integrity_check()?.orders_missing_person_id, 0);
        Ok(())
    }

    #[test]
    fn schema_status_reports_pending_migration_for_unrecorded_v1() -> Result<()> {
        let store = SqliteLedgerStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn migrate_rejects_unrecognized_orders_table() -> Result<()> {
        let mut store = SqliteLedgerStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch("CREATE TABLE orders(id INTEGER PRIMARY KEY, total INTEGER);")?;

        let err = match store.migrate() {
            Ok(()) => return Err(anyhow!("expected migration to fail on unknown schema")),
            Err(err) => err,
        };

        assert!(err.to_string().contains("orders has no name/phone columns"));
        Ok(())
    }

    #[test]
    fn unmigrated_database_refuses_reads() -> Result<()> {
        let mut store = SqliteLedgerStore::open(Path::new(":memory:"))?;
        assert!(store.load_items().is_err());
        Ok(())
    }

    #[test]
    fn save_and_load_preserve_row_order_and_phones() -> Result<()> {
        let mut store = SqliteLedgerStore::open_migrated(Path::new(":memory:"))?;
        let ledger = fixture_ledger();

        store.save_items(&ledger.items)?;
        store.save_orders(&ledger.orders)?;

        assert_eq!(store.load()?, ledger);
        assert_eq!(store.load_orders()?[1].phone, "0020");
        Ok(())
    }

    #[test]
    fn save_replaces_the_whole_table() -> Result<()> {
        let mut store = SqliteLedgerStore::open_migrated(Path::new(":memory:"))?;
        let mut ledger = fixture_ledger();
        store.save_orders(&ledger.orders)?;

        ledger.remove_person(&resolve("B", "0020"));
        store.save_orders(&ledger.orders)?;

        let orders = store.load_orders()?;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].person_name, "A");
        Ok(())
    }

    #[test]
    fn file_database_survives_reopen() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("groupbuy-{}.sqlite3", ulid::Ulid::new()));
        let ledger = fixture_ledger();
        {
            let mut store = SqliteLedgerStore::open_migrated(&db_path)?;
            store.save_items(&ledger.items)?;
            store.save_orders(&ledger.orders)?;
        }

        let mut reopened = SqliteLedgerStore::open_migrated(&db_path)?;
        assert_eq!(reopened.load()?, ledger);
        assert!(reopened.integrity_check()?.quick_check_ok);

        drop(reopened);
        for suffix in ["", "-wal", "-shm"] {
            let path = std::path::PathBuf::from(format!("{}{suffix}", db_path.display()));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }
}
