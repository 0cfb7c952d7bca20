use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    normalize_name, normalize_phone, resolve, Matrix, MatrixRow, Order, PersonId, ReceivedSummary,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Rename {
    pub from: PersonId,
    pub to: PersonId,
}

/// Updated flat order list plus an account of what the edits did.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileOutcome {
    pub orders: Vec<Order>,
    pub renamed: Vec<Rename>,
    pub deleted: Vec<PersonId>,
    pub deleted_rows: usize,
    /// Order rows whose `received` flag actually flipped.
    pub received_updates: usize,
    /// Identity fields rewritten without changing `person_id`.
    pub identity_updates: usize,
    pub unmatched: Vec<PersonId>,
    pub ignored_renames: Vec<PersonId>,
    pub ignored_quantity_edits: Vec<PersonId>,
}

impl ReconcileOutcome {
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.renamed.is_empty()
            || self.deleted_rows > 0
            || self.received_updates > 0
            || self.identity_updates > 0
    }
}

/// Translate an edited matrix back into the flat order list.
///
/// Each matrix row is matched against `original` through its pre-edit
/// `person_id`. Target rows are resolved against `original` before anything
/// is mutated, so a rename into another person's identity never redirects
/// that other person's edits. Quantities in the matrix are never written back.
#[must_use]
pub fn reconcile(original: &[Order], edited: &Matrix) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome { orders: original.to_vec(), ..ReconcileOutcome::default() };
    let mut removed = vec![false; original.len()];

    for row in &edited.rows {
        let targets = original
            .iter()
            .enumerate()
            .filter(|(_, order)| order.person_id == row.person_id)
            .map(|(index, _)| index)
            .collect::<Vec<_>>();

        if targets.is_empty() {
            tracing::warn!(
                person_id = %row.person_id,
                "edited row has no matching orders; skipping"
            );
            outcome.unmatched.push(row.person_id.clone());
            continue;
        }

        if row.delete {
            for &index in &targets {
                removed[index] = true;
            }
            outcome.deleted_rows += targets.len();
            outcome.deleted.push(row.person_id.clone());
            continue;
        }

        apply_received(original, &targets, &row.received, &mut outcome);
        apply_identity(original, &targets, row, &mut outcome);
        note_quantity_edits(original, &targets, row, &mut outcome);
    }

    if outcome.deleted_rows > 0 {
        outcome.orders = outcome
            .orders
            .into_iter()
            .zip(removed)
            .filter_map(|(order, removed)| (!removed).then_some(order))
            .collect();
    }

    outcome
}

fn apply_received(
    original: &[Order],
    targets: &[usize],
    edited: &ReceivedSummary,
    outcome: &mut ReconcileOutcome,
) {
    match edited {
        ReceivedSummary::WholePerson { received } => {
            set_received_if_changed(original, targets, *received, outcome);
        }
        ReceivedSummary::PerItem { items } => {
            for (item_name, received) in items {
                let item_targets = targets
                    .iter()
                    .copied()
                    .filter(|&index| &original[index].item_name == item_name)
                    .collect::<Vec<_>>();
                if item_targets.is_empty() {
                    tracing::debug!(
                        item = %item_name,
                        "received flag for an item the person never ordered"
                    );
                    continue;
                }
                set_received_if_changed(original, &item_targets, *received, outcome);
            }
        }
    }
}

// Only an edit that differs from the current aggregate touches rows, so a
// person with mixed flags keeps them when the summary is saved unchanged.
fn set_received_if_changed(
    original: &[Order],
    targets: &[usize],
    received: bool,
    outcome: &mut ReconcileOutcome,
) {
    let current = targets.iter().all(|&index| original[index].received);
    if current == received {
        return;
    }
    for &index in targets {
        let order = &mut outcome.orders[index];
        if order.received != received {
            order.received = received;
            outcome.received_updates += 1;
        }
    }
}

fn apply_identity(
    original: &[Order],
    targets: &[usize],
    row: &MatrixRow,
    outcome: &mut ReconcileOutcome,
) {
    let stored = &original[targets[0]];
    let name = normalize_name(&row.name);
    let phone = normalize_phone(&row.phone);

    if name == stored.person_name && phone == stored.phone {
        return;
    }
    if name.is_empty() || phone.is_empty() {
        tracing::debug!(person_id = %row.person_id, "ignoring rename to an empty name or phone");
        outcome.ignored_renames.push(row.person_id.clone());
        return;
    }

    let person_id = resolve(&name, &phone);
    for &index in targets {
        let order = &mut outcome.orders[index];
        order.person_name.clone_from(&name);
        order.phone.clone_from(&phone);
        order.person_id = person_id.clone();
    }

    if person_id == row.person_id {
        outcome.identity_updates += targets.len();
    } else {
        outcome.renamed.push(Rename { from: row.person_id.clone(), to: person_id });
    }
}

fn note_quantity_edits(
    original: &[Order],
    targets: &[usize],
    row: &MatrixRow,
    outcome: &mut ReconcileOutcome,
) {
    let mut stored: BTreeMap<&str, u64> = BTreeMap::new();
    for &index in targets {
        *stored.entry(original[index].item_name.as_str()).or_insert(0) +=
            u64::from(original[index].quantity);
    }

    let edited = row.quantities.iter().any(|(item_name, quantity)| {
        stored.get(item_name.as_str()).copied().unwrap_or(0) != *quantity
    });
    if edited {
        tracing::warn!(person_id = %row.person_id, "quantity edits are not written back to orders");
        outcome.ignored_quantity_edits.push(row.person_id.clone());
    }
}
