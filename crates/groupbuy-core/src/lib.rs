use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

mod aggregate;
mod identity;
mod reconcile;

pub use aggregate::{
    aggregate, item_columns, item_totals, ItemTotal, Matrix, MatrixRow, ReceivedPolicy,
    ReceivedSummary,
};
pub use identity::{normalize_name, normalize_phone, resolve, PersonId};
pub use reconcile::{reconcile, ReconcileOutcome, Rename};

pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Largest window, in days, that still fits a `time::Duration` in seconds.
pub const MAX_RETENTION_DAYS: i64 = i64::MAX / 86_400;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Item {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Item {
    /// True once strictly more than `window` has elapsed since creation.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime, window: Duration) -> bool {
        now - self.created_at > window
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Order {
    pub item_name: String,
    pub person_name: String,
    pub phone: String,
    pub quantity: u32,
    pub received: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub person_id: PersonId,
}

impl Order {
    /// Build a new, not-yet-received order from raw form input.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when name, phone, or item is empty,
    /// or the quantity is not a positive integer.
    pub fn from_input(input: &NewOrder, now: OffsetDateTime) -> Result<Self, LedgerError> {
        input.validate()?;
        let quantity = u32::try_from(input.quantity).map_err(|_| {
            LedgerError::Validation(format!("quantity {} is out of range", input.quantity))
        })?;

        Ok(Self {
            item_name: input.item_name.trim().to_string(),
            person_name: normalize_name(&input.person_name),
            phone: normalize_phone(&input.phone),
            quantity,
            received: false,
            created_at: now,
            person_id: resolve(&input.person_name, &input.phone),
        })
    }

    /// Normalize the stored name and phone and re-derive `person_id` from them.
    ///
    /// A stored identifier is never trusted: one written by an older tool or
    /// by hand would otherwise split a buyer into two rows. Returns `true`
    /// when the identifier was missing or disagreed with [`resolve`].
    pub fn normalize_identity(&mut self) -> bool {
        self.person_name = normalize_name(&self.person_name);
        self.phone = normalize_phone(&self.phone);
        let derived = resolve(&self.person_name, &self.phone);
        if self.person_id == derived {
            return false;
        }
        self.person_id = derived;
        true
    }
}

/// Raw order form input, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewOrder {
    pub item_name: String,
    pub person_name: String,
    pub phone: String,
    pub quantity: i64,
}

impl NewOrder {
    /// Check the non-empty and positive-quantity rules.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] naming the first rule that fails.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.item_name.trim().is_empty() {
            return Err(LedgerError::Validation("item name MUST be provided".to_string()));
        }
        if self.person_name.trim().is_empty() {
            return Err(LedgerError::Validation("name MUST be provided".to_string()));
        }
        if normalize_phone(&self.phone).is_empty() {
            return Err(LedgerError::Validation(
                "phone MUST contain at least one digit".to_string(),
            ));
        }
        if self.quantity < 1 {
            return Err(LedgerError::Validation(format!(
                "quantity MUST be >= 1, got {}",
                self.quantity
            )));
        }
        Ok(())
    }
}

/// Optional retention window applied to items when a ledger is loaded.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct RetentionPolicy {
    pub window: Option<Duration>,
}

impl RetentionPolicy {
    #[must_use]
    pub fn keep_forever() -> Self {
        Self { window: None }
    }

    /// Window of `days` whole days. Values past [`MAX_RETENTION_DAYS`] saturate.
    #[must_use]
    pub fn days(days: i64) -> Self {
        Self { window: Some(Duration::seconds(days.saturating_mul(86_400))) }
    }

    /// Split items into `(kept, expired)` preserving order.
    ///
    /// Orders are not touched: an expired item's orders stay in the ledger.
    #[must_use]
    pub fn partition(&self, items: Vec<Item>, now: OffsetDateTime) -> (Vec<Item>, Vec<Item>) {
        let Some(window) = self.window else {
            return (items, Vec::new());
        };
        items.into_iter().partition(|item| !item.is_expired(now, window))
    }
}

/// The flat item and order tables. Matrix views are always derived from this.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Ledger {
    pub items: Vec<Item>,
    pub orders: Vec<Order>,
}

impl Ledger {
    #[must_use]
    pub fn new(items: Vec<Item>, orders: Vec<Order>) -> Self {
        Self { items, orders }
    }

    #[must_use]
    pub fn has_item(&self, name: &str) -> bool {
        self.items.iter().any(|item| item.name == name)
    }

    /// Append a new item.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for an empty or already registered name.
    pub fn add_item(&mut self, name: &str, now: OffsetDateTime) -> Result<Item, LedgerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::Validation("item name MUST be provided".to_string()));
        }
        if self.has_item(name) {
            return Err(LedgerError::Validation(format!("item `{name}` already exists")));
        }

        let item = Item { name: name.to_string(), created_at: now };
        self.items.push(item.clone());
        Ok(item)
    }

    /// Append a new order line against an existing item.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for invalid input and
    /// [`LedgerError::NotFound`] when the item is not registered.
    pub fn add_order(
        &mut self,
        input: &NewOrder,
        now: OffsetDateTime,
    ) -> Result<Order, LedgerError> {
        let order = Order::from_input(input, now)?;
        if !self.has_item(&order.item_name) {
            return Err(LedgerError::NotFound(format!("item `{}`", order.item_name)));
        }
        self.orders.push(order.clone());
        Ok(order)
    }

    /// Swap in a reconciled order list wholesale.
    pub fn replace_orders(&mut self, orders: Vec<Order>) {
        self.orders = orders;
    }

    /// Remove every order row of one person. Returns the number of rows removed.
    pub fn remove_person(&mut self, person_id: &PersonId) -> usize {
        let before = self.orders.len();
        self.orders.retain(|order| &order.person_id != person_id);
        before - self.orders.len()
    }

    /// Re-derive every person identifier. Returns how many rows changed.
    pub fn normalize_person_ids(&mut self) -> usize {
        self.orders.iter_mut().map(Order::normalize_identity).filter(|changed| *changed).count()
    }

    #[must_use]
    pub fn orders_for_item(&self, item_name: &str) -> Vec<&Order> {
        self.orders.iter().filter(|order| order.item_name == item_name).collect()
    }

    /// Distinct person identifiers in first-appearance order.
    #[must_use]
    pub fn person_ids(&self) -> Vec<PersonId> {
        let mut seen = BTreeSet::new();
        self.orders
            .iter()
            .filter(|order| seen.insert(order.person_id.clone()))
            .map(|order| order.person_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn new_order(item: &str, name: &str, phone: &str, quantity: i64) -> NewOrder {
        NewOrder {
            item_name: item.to_string(),
            person_name: name.to_string(),
            phone: phone.to_string(),
            quantity,
        }
    }

    fn ledger_with_items(names: &[&str]) -> Ledger {
        let mut ledger = Ledger::default();
        for name in names {
            if let Err(err) = ledger.add_item(name, fixture_time()) {
                panic!("fixture item should be accepted: {err}");
            }
        }
        ledger
    }

    #[test]
    fn add_item_rejects_empty_and_duplicate_names() {
        let mut ledger = ledger_with_items(&["Rice"]);

        assert!(matches!(ledger.add_item("   ", fixture_time()), Err(LedgerError::Validation(_))));
        assert!(matches!(ledger.add_item("Rice", fixture_time()), Err(LedgerError::Validation(_))));
        assert!(matches!(
            ledger.add_item(" Rice ", fixture_time()),
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(ledger.items.len(), 1);
    }

    #[test]
    fn add_order_normalizes_phone_and_derives_identity() {
        let mut ledger = ledger_with_items(&["Rice"]);
        let input = new_order("Rice", " Kim ", "010-1234-5678", 2);
        let order = match ledger.add_order(&input, fixture_time()) {
            Ok(order) => order,
            Err(err) => panic!("order should be accepted: {err}"),
        };

        assert_eq!(order.person_name, "Kim");
        assert_eq!(order.phone, "01012345678");
        assert_eq!(order.person_id, resolve("Kim", "01012345678"));
        assert!(!order.received);
        assert_eq!(ledger.orders.len(), 1);
    }

    #[test]
    fn add_order_rejects_invalid_input_without_mutation() {
        let mut ledger = ledger_with_items(&["Rice"]);

        for input in [
            new_order("Rice", "", "0101234567", 1),
            new_order("Rice", "Kim", " - ", 1),
            new_order("Rice", "Kim", "0101234567", 0),
            new_order("Rice", "Kim", "0101234567", -3),
            new_order("", "Kim", "0101234567", 1),
        ] {
            assert!(matches!(
                ledger.add_order(&input, fixture_time()),
                Err(LedgerError::Validation(_))
            ));
        }
        assert!(matches!(
            ledger.add_order(&new_order("Oil", "Kim", "0101234567", 1), fixture_time()),
            Err(LedgerError::NotFound(_))
        ));
        assert!(ledger.orders.is_empty());
    }

    #[test]
    fn remove_person_removes_only_that_person() {
        let mut ledger = ledger_with_items(&["Rice", "Oil"]);
        for input in [
            new_order("Rice", "A", "0101234567", 2),
            new_order("Oil", "A", "010-123-4567", 1),
            new_order("Rice", "B", "0209999999", 1),
        ] {
            if let Err(err) = ledger.add_order(&input, fixture_time()) {
                panic!("fixture order should be accepted: {err}");
            }
        }

        let removed = ledger.remove_person(&resolve("A", "0101234567"));

        assert_eq!(removed, 2);
        assert_eq!(ledger.orders.len(), 1);
        assert_eq!(ledger.orders[0].person_name, "B");
    }

    #[test]
    fn normalize_fills_missing_and_corrects_stale_identifiers() {
        let mut ledger = Ledger::default();
        ledger.orders.push(Order {
            item_name: "Rice".to_string(),
            person_name: "A".to_string(),
            phone: "010-1234-567".to_string(),
            quantity: 1,
            received: false,
            created_at: fixture_time(),
            person_id: PersonId::default(),
        });
        ledger.orders.push(Order {
            item_name: "Rice".to_string(),
            person_name: "B".to_string(),
            phone: "0209999999".to_string(),
            quantity: 1,
            received: false,
            created_at: fixture_time(),
            person_id: PersonId::from_stored("legacy_B"),
        });
        ledger.orders.push(Order {
            item_name: "Oil".to_string(),
            person_name: "B".to_string(),
            phone: "0209999999".to_string(),
            quantity: 1,
            received: false,
            created_at: fixture_time(),
            person_id: resolve("B", "0209999999"),
        });

        assert_eq!(ledger.normalize_person_ids(), 2);
        assert_eq!(ledger.orders[0].person_id, resolve("A", "0101234567"));
        assert_eq!(ledger.orders[0].phone, "0101234567");
        assert_eq!(ledger.orders[1].person_id, ledger.orders[2].person_id);
        assert_eq!(ledger.person_ids().len(), 2);
    }

    #[test]
    fn retention_window_is_strictly_exceeded_before_expiry() {
        let created = fixture_time();
        let item = Item { name: "Rice".to_string(), created_at: created };
        let window = Duration::days(DEFAULT_RETENTION_DAYS);

        assert!(!item.is_expired(created + window, window));
        assert!(item.is_expired(created + window + Duration::seconds(1), window));
    }

    #[test]
    fn oversized_retention_window_saturates_instead_of_panicking() {
        let now = fixture_time();
        let items =
            vec![Item { name: "Ancient".to_string(), created_at: OffsetDateTime::UNIX_EPOCH }];

        let (kept, expired) = RetentionPolicy::days(i64::MAX).partition(items, now);

        assert_eq!(kept.len(), 1);
        assert!(expired.is_empty());
        assert_eq!(
            RetentionPolicy::days(MAX_RETENTION_DAYS).window,
            Some(Duration::days(MAX_RETENTION_DAYS))
        );
    }

    #[test]
    fn retention_partition_keeps_order_and_reports_expired() {
        let now = fixture_time();
        let items = vec![
            Item { name: "Old".to_string(), created_at: now - Duration::days(8) },
            Item { name: "Fresh".to_string(), created_at: now - Duration::days(1) },
        ];

        let policy = RetentionPolicy::days(DEFAULT_RETENTION_DAYS);
        let (kept, expired) = policy.partition(items.clone(), now);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "Fresh");
        assert_eq!(expired[0].name, "Old");

        let (kept, expired) = RetentionPolicy::keep_forever().partition(items, now);
        assert_eq!(kept.len(), 2);
        assert!(expired.is_empty());
    }

    #[test]
    fn person_ids_are_listed_in_first_appearance_order() {
        let mut ledger = ledger_with_items(&["Rice"]);
        for input in [
            new_order("Rice", "B", "02", 1),
            new_order("Rice", "A", "01", 1),
            new_order("Rice", "B", "02", 1),
        ] {
            if let Err(err) = ledger.add_order(&input, fixture_time()) {
                panic!("fixture order should be accepted: {err}");
            }
        }

        assert_eq!(ledger.person_ids(), vec![resolve("B", "02"), resolve("A", "01")]);
    }

    #[test]
    fn ledger_json_keeps_phone_as_string() {
        let mut ledger = ledger_with_items(&["Rice"]);
        if let Err(err) = ledger.add_order(&new_order("Rice", "A", "0012", 1), fixture_time()) {
            panic!("fixture order should be accepted: {err}");
        }
        let json = match serde_json::to_value(&ledger) {
            Ok(value) => value,
            Err(err) => panic!("ledger should serialize: {err}"),
        };
        assert_eq!(json["orders"][0]["phone"], serde_json::json!("0012"));
        assert_eq!(json["orders"][0]["person_id"], serde_json::json!("A_0012"));
    }
}
