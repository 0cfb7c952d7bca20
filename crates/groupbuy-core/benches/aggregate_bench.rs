use criterion::{criterion_group, criterion_main, Criterion};
use groupbuy_core::{aggregate, reconcile, resolve, Item, Order, ReceivedPolicy};
use time::OffsetDateTime;

const ITEMS: [&str; 5] = ["Rice", "Oil", "Salt", "Kimchi", "Eggs"];

fn mk_items() -> Vec<Item> {
    ITEMS
        .iter()
        .map(|name| Item { name: (*name).to_string(), created_at: OffsetDateTime::UNIX_EPOCH })
        .collect()
}

fn mk_order(index: usize) -> Order {
    let name = format!("buyer{}", index % 150);
    let phone = format!("010{:08}", index % 150);
    Order {
        item_name: ITEMS[index % ITEMS.len()].to_string(),
        person_id: resolve(&name, &phone),
        person_name: name,
        phone,
        quantity: u32::try_from(index % 7 + 1).unwrap_or(1),
        received: index % 3 == 0,
        created_at: OffsetDateTime::UNIX_EPOCH,
    }
}

fn bench_aggregate(c: &mut Criterion) {
    let items = mk_items();
    let orders = (0..1_000).map(mk_order).collect::<Vec<_>>();

    c.bench_function("aggregate_1000_orders", |b| {
        b.iter(|| aggregate(&orders, &items, ReceivedPolicy::WholePerson));
    });
}

fn bench_reconcile(c: &mut Criterion) {
    let items = mk_items();
    let orders = (0..1_000).map(mk_order).collect::<Vec<_>>();
    let mut matrix = aggregate(&orders, &items, ReceivedPolicy::WholePerson);
    for row in matrix.rows.iter_mut().step_by(10) {
        row.name.push('!');
    }

    c.bench_function("reconcile_1000_orders_with_renames", |b| {
        b.iter(|| reconcile(&orders, &matrix));
    });
}

criterion_group!(ledger_benches, bench_aggregate, bench_reconcile);
criterion_main!(ledger_benches);
