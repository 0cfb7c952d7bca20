use std::path::Path;

use anyhow::{anyhow, Context, Result};
use groupbuy_core::{
    aggregate, item_totals, reconcile, Item, ItemTotal, Ledger, LedgerError, Matrix, NewOrder,
    Order, PersonId, ReceivedPolicy, ReconcileOutcome, Rename, RetentionPolicy,
};
use groupbuy_store::LedgerStore;
use groupbuy_store_sqlite::{IntegrityReport, SchemaStatus, SqliteLedgerStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod config;

pub use config::{BackendConfig, DynStore, LedgerConfig, RemoteBackendConfig, DEFAULT_DATA_DIR};

pub const API_CONTRACT_VERSION: &str = "api.v1";

type Clock = Box<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Result of an add operation. Invalid input is a no-op, never an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AddOutcome<T> {
    Added { record: T },
    Ignored { reason: String },
}

impl<T> AddOutcome<T> {
    #[must_use]
    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletePersonResult {
    pub person_id: PersonId,
    pub removed_rows: usize,
}

/// What applying an edited matrix did, plus the freshly reloaded matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyEditsResult {
    pub persisted: bool,
    pub renamed: Vec<Rename>,
    pub deleted: Vec<PersonId>,
    pub deleted_rows: usize,
    pub received_updates: usize,
    pub identity_updates: usize,
    pub unmatched: Vec<PersonId>,
    pub ignored_renames: Vec<PersonId>,
    pub ignored_quantity_edits: Vec<PersonId>,
    pub matrix: Matrix,
}

impl ApplyEditsResult {
    fn new(outcome: ReconcileOutcome, persisted: bool, matrix: Matrix) -> Self {
        Self {
            persisted,
            renamed: outcome.renamed,
            deleted: outcome.deleted,
            deleted_rows: outcome.deleted_rows,
            received_updates: outcome.received_updates,
            identity_updates: outcome.identity_updates,
            unmatched: outcome.unmatched,
            ignored_renames: outcome.ignored_renames,
            ignored_quantity_edits: outcome.ignored_quantity_edits,
            matrix,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Facade over one ledger store.
///
/// Every operation runs a full load, mutate, persist cycle against the store;
/// no state is cached between calls. A failed save leaves the store as the
/// backend left it, so callers should reload rather than trust earlier reads.
pub struct GroupBuyApi<S: LedgerStore> {
    store: S,
    policy: ReceivedPolicy,
    retention: RetentionPolicy,
    clock: Clock,
}

impl<S: LedgerStore> GroupBuyApi<S> {
    #[must_use]
    pub fn new(store: S, policy: ReceivedPolicy, retention: RetentionPolicy) -> Self {
        Self { store, policy, retention, clock: Box::new(OffsetDateTime::now_utc) }
    }

    #[must_use]
    pub fn with_clock(
        mut self,
        clock: impl Fn() -> OffsetDateTime + Send + Sync + 'static,
    ) -> Self {
        self.clock = Box::new(clock);
        self
    }

    #[must_use]
    pub fn policy(&self) -> ReceivedPolicy {
        self.policy
    }

    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Load the ledger and drop items past the retention window.
    ///
    /// Expired items are removed from storage; their orders are kept and
    /// surface as extra matrix columns.
    fn load(&mut self) -> Result<Ledger> {
        let mut ledger = self.store.load().context("failed to load ledger")?;
        let items = std::mem::take(&mut ledger.items);
        let (kept, expired) = self.retention.partition(items, (self.clock)());
        ledger.items = kept;

        if !expired.is_empty() {
            let names = expired.iter().map(|item| item.name.as_str()).collect::<Vec<_>>();
            let stranded = ledger
                .orders
                .iter()
                .filter(|order| names.contains(&order.item_name.as_str()))
                .count();
            tracing::warn!(
                expired = ?names,
                stranded_orders = stranded,
                "items expired; their orders are kept"
            );
            self.store.save_items(&ledger.items).context("failed to persist item expiry")?;
        }

        Ok(ledger)
    }

    /// Register a new item.
    ///
    /// # Errors
    /// Returns an error only when the store cannot be read or written.
    pub fn add_item(&mut self, name: &str) -> Result<AddOutcome<Item>> {
        let mut ledger = self.load()?;
        let item = match ledger.add_item(name, (self.clock)()) {
            Ok(item) => item,
            Err(err) => return Ok(ignored(&err)),
        };
        self.store.save_items(&ledger.items).context("failed to save items")?;
        tracing::info!(item = %item.name, "item added");
        Ok(AddOutcome::Added { record: item })
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_items(&mut self) -> Result<Vec<Item>> {
        Ok(self.load()?.items)
    }

    /// Append one order line for an existing item.
    ///
    /// # Errors
    /// Returns an error only when the store cannot be read or written.
    pub fn add_order(&mut self, input: &NewOrder) -> Result<AddOutcome<Order>> {
        let mut ledger = self.load()?;
        let order = match ledger.add_order(input, (self.clock)()) {
            Ok(order) => order,
            Err(err) => return Ok(ignored(&err)),
        };
        self.store.save_orders(&ledger.orders).context("failed to save orders")?;
        tracing::info!(person_id = %order.person_id, item = %order.item_name, "order added");
        Ok(AddOutcome::Added { record: order })
    }

    /// Orders in insertion order, optionally limited to one item.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_orders(&mut self, item_name: Option<&str>) -> Result<Vec<Order>> {
        let ledger = self.load()?;
        Ok(match item_name {
            Some(item_name) => ledger.orders_for_item(item_name).into_iter().cloned().collect(),
            None => ledger.orders,
        })
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn item_totals(&mut self) -> Result<Vec<ItemTotal>> {
        let ledger = self.load()?;
        Ok(item_totals(&ledger.items, &ledger.orders))
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn matrix(&mut self) -> Result<Matrix> {
        let ledger = self.load()?;
        Ok(aggregate(&ledger.orders, &ledger.items, self.policy))
    }

    /// Reconcile an edited matrix into the order table, persist, and reload.
    ///
    /// # Errors
    /// Returns an error when the matrix was built under another received
    /// policy, or the store cannot be read or written.
    pub fn apply_edits(&mut self, edited: &Matrix) -> Result<ApplyEditsResult> {
        if edited.policy != self.policy {
            return Err(anyhow!(
                "matrix uses received policy {} but this ledger uses {}",
                edited.policy.as_str(),
                self.policy.as_str()
            ));
        }
        if let Some(row) = edited.rows.iter().find(|row| row.received.policy() != self.policy) {
            return Err(anyhow!(
                "row {} carries a {} received summary",
                row.person_id,
                row.received.policy().as_str()
            ));
        }

        let mut ledger = self.load()?;
        let mut outcome = reconcile(&ledger.orders, edited);
        let persisted = outcome.changed();
        if persisted {
            ledger.replace_orders(std::mem::take(&mut outcome.orders));
            self.store.save_orders(&ledger.orders).context("failed to save reconciled orders")?;
            tracing::info!(
                renamed = outcome.renamed.len(),
                deleted_rows = outcome.deleted_rows,
                received_updates = outcome.received_updates,
                "matrix edits applied"
            );
        } else {
            tracing::debug!("matrix edits changed nothing");
        }

        let matrix = self.matrix()?;
        Ok(ApplyEditsResult::new(outcome, persisted, matrix))
    }

    /// Remove every order row of one person.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or written.
    pub fn delete_person(&mut self, person_id: &PersonId) -> Result<DeletePersonResult> {
        let mut ledger = self.load()?;
        let removed_rows = ledger.remove_person(person_id);
        if removed_rows > 0 {
            self.store.save_orders(&ledger.orders).context("failed to save orders")?;
            tracing::info!(person_id = %person_id, removed_rows, "person deleted");
        } else {
            tracing::warn!(person_id = %person_id, "no orders for person; nothing deleted");
        }
        Ok(DeletePersonResult { person_id: person_id.clone(), removed_rows })
    }
}

fn ignored<T>(err: &LedgerError) -> AddOutcome<T> {
    tracing::info!(reason = %err, "input ignored");
    AddOutcome::Ignored { reason: err.to_string() }
}

/// Inspect a `SQLite` ledger's schema without mutating data.
///
/// # Errors
/// Returns an error when the database cannot be opened or queried.
pub fn schema_status(db_path: &Path) -> Result<SchemaStatus> {
    SqliteLedgerStore::open(db_path)?.schema_status()
}

/// Apply pending `SQLite` migrations, or report the plan in dry-run mode.
///
/// # Errors
/// Returns an error when migration planning or execution fails.
pub fn migrate(db_path: &Path, dry_run: bool) -> Result<MigrateResult> {
    let mut store = SqliteLedgerStore::open(db_path)?;
    let before = store.schema_status()?;
    if dry_run {
        return Ok(MigrateResult {
            dry_run: true,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: None,
            up_to_date: None,
        });
    }

    let planned_versions = before.pending_versions;
    store.migrate()?;
    let after = store.schema_status()?;
    Ok(MigrateResult {
        dry_run: false,
        current_version: before.current_version,
        target_version: before.target_version,
        would_apply_versions: planned_versions,
        inferred_from_legacy: before.inferred_from_legacy,
        after_version: Some(after.current_version),
        up_to_date: Some(after.pending_versions.is_empty()),
    })
}

/// # Errors
/// Returns an error when any integrity check fails.
pub fn integrity_check(db_path: &Path) -> Result<IntegrityReport> {
    SqliteLedgerStore::open(db_path)?.integrity_check()
}
