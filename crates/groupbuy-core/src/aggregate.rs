use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Item, Order, PersonId};

/// How `received` flags are summarized in a matrix row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReceivedPolicy {
    /// One flag per person: AND over every row of that person, across items.
    #[default]
    WholePerson,
    /// One flag per (person, item) the person ordered.
    PerItem,
}

impl ReceivedPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WholePerson => "whole_person",
            Self::PerItem => "per_item",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReceivedSummary {
    WholePerson { received: bool },
    PerItem { items: BTreeMap<String, bool> },
}

impl ReceivedSummary {
    #[must_use]
    pub fn policy(&self) -> ReceivedPolicy {
        match self {
            Self::WholePerson { .. } => ReceivedPolicy::WholePerson,
            Self::PerItem { .. } => ReceivedPolicy::PerItem,
        }
    }

    /// Whole-person view of the summary, whatever the mode.
    #[must_use]
    pub fn all_received(&self) -> bool {
        match self {
            Self::WholePerson { received } => *received,
            Self::PerItem { items } => items.values().all(|received| *received),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MatrixRow {
    /// Identity the row was aggregated under. Carried for reconciliation only.
    pub person_id: PersonId,
    pub name: String,
    pub phone: String,
    pub quantities: BTreeMap<String, u64>,
    pub received: ReceivedSummary,
    #[serde(default)]
    pub delete: bool,
}

impl MatrixRow {
    #[must_use]
    pub fn quantity(&self, item_name: &str) -> u64 {
        self.quantities.get(item_name).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_quantity(&self) -> u64 {
        self.quantities.values().sum()
    }
}

/// Person × item pivot of the order ledger.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Matrix {
    pub policy: ReceivedPolicy,
    pub items: Vec<String>,
    pub rows: Vec<MatrixRow>,
}

impl Matrix {
    #[must_use]
    pub fn column_total(&self, item_name: &str) -> u64 {
        self.rows.iter().map(|row| row.quantity(item_name)).sum()
    }

    #[must_use]
    pub fn row(&self, person_id: &PersonId) -> Option<&MatrixRow> {
        self.rows.iter().find(|row| &row.person_id == person_id)
    }

    pub fn row_mut(&mut self, person_id: &PersonId) -> Option<&mut MatrixRow> {
        self.rows.iter_mut().find(|row| &row.person_id == person_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemTotal {
    pub item_name: String,
    pub total_quantity: u64,
    pub order_count: usize,
    pub buyer_count: usize,
}

/// Column order shared by every derived view: registered items first, then
/// item names that only appear in orders, by first appearance.
#[must_use]
pub fn item_columns(items: &[Item], orders: &[Order]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .iter()
        .map(|item| item.name.as_str())
        .chain(orders.iter().map(|order| order.item_name.as_str()))
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}

struct PersonAccumulator {
    person_id: PersonId,
    name: String,
    phone: String,
    quantities: BTreeMap<String, u64>,
    all_received: bool,
    received_by_item: BTreeMap<String, bool>,
}

impl PersonAccumulator {
    fn new(order: &Order, columns: &[String]) -> Self {
        Self {
            person_id: order.person_id.clone(),
            name: order.person_name.clone(),
            phone: order.phone.clone(),
            quantities: columns.iter().map(|column| (column.clone(), 0)).collect(),
            all_received: true,
            received_by_item: BTreeMap::new(),
        }
    }

    fn add(&mut self, order: &Order) {
        *self.quantities.entry(order.item_name.clone()).or_insert(0) += u64::from(order.quantity);
        self.all_received &= order.received;
        self.received_by_item
            .entry(order.item_name.clone())
            .and_modify(|received| *received &= order.received)
            .or_insert(order.received);
    }

    fn into_row(self, policy: ReceivedPolicy) -> MatrixRow {
        let received = match policy {
            ReceivedPolicy::WholePerson => {
                ReceivedSummary::WholePerson { received: self.all_received }
            }
            ReceivedPolicy::PerItem => ReceivedSummary::PerItem { items: self.received_by_item },
        };
        MatrixRow {
            person_id: self.person_id,
            name: self.name,
            phone: self.phone,
            quantities: self.quantities,
            received,
            delete: false,
        }
    }
}

/// Build the person × item quantity matrix from the flat order list.
///
/// Rows follow the first appearance of each `person_id`; every row carries a
/// zero for each column the person did not order.
#[must_use]
pub fn aggregate(orders: &[Order], items: &[Item], policy: ReceivedPolicy) -> Matrix {
    let columns = item_columns(items, orders);
    let mut positions: BTreeMap<&PersonId, usize> = BTreeMap::new();
    let mut people: Vec<PersonAccumulator> = Vec::new();

    for order in orders {
        let position = *positions.entry(&order.person_id).or_insert_with(|| {
            people.push(PersonAccumulator::new(order, &columns));
            people.len() - 1
        });
        people[position].add(order);
    }

    Matrix {
        policy,
        items: columns,
        rows: people.into_iter().map(|person| person.into_row(policy)).collect(),
    }
}

/// Per-item totals in matrix column order.
#[must_use]
pub fn item_totals(items: &[Item], orders: &[Order]) -> Vec<ItemTotal> {
    item_columns(items, orders)
        .into_iter()
        .map(|item_name| {
            let mut buyers = BTreeSet::new();
            let mut total_quantity = 0_u64;
            let mut order_count = 0_usize;
            for order in orders.iter().filter(|order| order.item_name == item_name) {
                total_quantity += u64::from(order.quantity);
                order_count += 1;
                buyers.insert(&order.person_id);
            }
            ItemTotal { item_name, total_quantity, order_count, buyer_count: buyers.len() }
        })
        .collect()
}
