//! CSV encoding of the item and order tables.
//!
//! Column order is fixed:
//! - items: `item_name, created_at`
//! - orders: `item_name, name, phone, qty, received, created_at, person_id`
//!
//! Columns are matched by header name on read, so files written before the
//! `person_id` column existed still load. Identifiers are always re-derived
//! from name and phone on read.
//!
//! A record that cannot be decoded is skipped with a warning; the rest of
//! the table still loads, so the next save never drops valid rows.

use anyhow::{anyhow, Context, Result};
use groupbuy_core::{Item, Order, PersonId};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

pub const ITEM_COLUMNS: [&str; 2] = ["item_name", "created_at"];
pub const ORDER_COLUMNS: [&str; 7] =
    ["item_name", "name", "phone", "qty", "received", "created_at", "person_id"];

/// Resource names used by file-backed stores.
pub const ITEMS_FILE: &str = "items.csv";
pub const ORDERS_FILE: &str = "orders.csv";

#[derive(Debug, Serialize, Deserialize)]
struct ItemRow {
    item_name: String,
    created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderRow {
    item_name: String,
    name: String,
    phone: String,
    qty: String,
    received: String,
    created_at: String,
    #[serde(default)]
    person_id: Option<String>,
}

/// Serialize items, always emitting the header row.
///
/// # Errors
/// Returns an error when a timestamp cannot be formatted or CSV writing fails.
pub fn encode_items(items: &[Item]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(ITEM_COLUMNS).context("failed to write items header")?;
    for item in items {
        writer
            .serialize(ItemRow {
                item_name: item.name.clone(),
                created_at: format_timestamp(item.created_at)?,
            })
            .with_context(|| format!("failed to write item `{}`", item.name))?;
    }
    writer.into_inner().map_err(|err| anyhow!("failed to flush items csv: {err}"))
}

/// Serialize orders, always emitting the header row.
///
/// # Errors
/// Returns an error when a timestamp cannot be formatted or CSV writing fails.
pub fn encode_orders(orders: &[Order]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(ORDER_COLUMNS).context("failed to write orders header")?;
    for order in orders {
        writer
            .serialize(OrderRow {
                item_name: order.item_name.clone(),
                name: order.person_name.clone(),
                phone: order.phone.clone(),
                qty: order.quantity.to_string(),
                received: format_received(order.received).to_string(),
                created_at: format_timestamp(order.created_at)?,
                person_id: Some(order.person_id.to_string()),
            })
            .with_context(|| format!("failed to write order for `{}`", order.person_id))?;
    }
    writer.into_inner().map_err(|err| anyhow!("failed to flush orders csv: {err}"))
}

/// Parse an items table. Rows that cannot be decoded are skipped with a warning.
#[must_use]
pub fn decode_items(bytes: &[u8]) -> Vec<Item> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::Headers).from_reader(bytes);
    let mut items = Vec::new();

    for (index, row) in reader.deserialize::<ItemRow>().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(row = index + 1, error = %err, "skipping malformed item record");
                continue;
            }
        };
        if row.item_name.trim().is_empty() {
            tracing::warn!(row = index + 1, "skipping item row without a name");
            continue;
        }
        match parse_timestamp(&row.created_at) {
            Ok(created_at) => items.push(Item { name: row.item_name, created_at }),
            Err(err) => tracing::warn!(row = index + 1, error = %err, "skipping item row"),
        }
    }

    items
}

/// Parse an orders table, normalizing phones and re-deriving `person_id`.
/// Rows that cannot be decoded are skipped with a warning.
#[must_use]
pub fn decode_orders(bytes: &[u8]) -> Vec<Order> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::Headers).from_reader(bytes);
    let mut orders = Vec::new();

    for (index, row) in reader.deserialize::<OrderRow>().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(row = index + 1, error = %err, "skipping malformed order record");
                continue;
            }
        };
        match order_from_row(row) {
            Ok(mut order) => {
                order.normalize_identity();
                orders.push(order);
            }
            Err(err) => tracing::warn!(row = index + 1, error = %err, "skipping order row"),
        }
    }

    orders
}

fn order_from_row(row: OrderRow) -> Result<Order> {
    Ok(Order {
        quantity: parse_quantity(&row.qty)?,
        received: parse_received(&row.received)?,
        created_at: parse_timestamp(&row.created_at)?,
        person_id: PersonId::from_stored(row.person_id.unwrap_or_default().trim()),
        item_name: row.item_name,
        person_name: row.name.trim().to_string(),
        phone: row.phone,
    })
}

fn parse_quantity(raw: &str) -> Result<u32> {
    let trimmed = raw.trim();
    let quantity = match trimmed.parse::<u32>() {
        Ok(value) => value,
        // Dataframe exports sometimes write integral columns as `3.0`.
        Err(_) => match trimmed.strip_suffix(".0").map(str::parse::<u32>) {
            Some(Ok(value)) => value,
            _ => return Err(anyhow!("invalid qty `{raw}`")),
        },
    };
    if quantity == 0 {
        return Err(anyhow!("qty MUST be >= 1"));
    }
    Ok(quantity)
}

#[must_use]
pub fn format_received(received: bool) -> &'static str {
    if received {
        "True"
    } else {
        "False"
    }
}

/// Accepts `True`/`False` in any case, and `1`/`0`.
///
/// # Errors
/// Returns an error for any other value.
pub fn parse_received(raw: &str) -> Result<bool> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") || trimmed == "1" {
        Ok(true)
    } else if trimmed.eq_ignore_ascii_case("false") || trimmed == "0" || trimmed.is_empty() {
        Ok(false)
    } else {
        Err(anyhow!("invalid received flag `{raw}`"))
    }
}

/// Format as RFC 3339.
///
/// # Errors
/// Returns an error when the timestamp is outside the RFC 3339 range.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String> {
    value.format(&Rfc3339).context("failed to format RFC3339 timestamp")
}

/// Parse RFC 3339, falling back to `YYYY-MM-DD HH:MM:SS[.ffffff]` and
/// `YYYY-MM-DD`, both read as UTC.
///
/// # Errors
/// Returns an error when none of the accepted layouts match.
pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
    let trimmed = raw.trim();
    if let Ok(value) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(value);
    }

    for layout in [
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]",
        "[year]-[month]-[day] [hour]:[minute]:[second]",
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]",
        "[year]-[month]-[day]T[hour]:[minute]:[second]",
    ] {
        let format = time::format_description::parse(layout)
            .map_err(|err| anyhow!("invalid timestamp layout {layout}: {err}"))?;
        if let Ok(value) = PrimitiveDateTime::parse(trimmed, &format) {
            return Ok(value.assume_utc());
        }
    }

    let date_format = time::format_description::parse("[year]-[month]-[day]")
        .map_err(|err| anyhow!("invalid date layout: {err}"))?;
    let date = Date::parse(trimmed, &date_format)
        .with_context(|| format!("unrecognized timestamp `{raw}`"))?;
    Ok(date.midnight().assume_utc())
}
