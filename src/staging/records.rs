//! Typed views of the source records and their flattening into staging rows.
//!
//! Every field is optional on the wire. Missing objects, lists and numbers
//! decode to empty or zero; only a value of an incompatible JSON type fails
//! the record.

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::engine::types::Entity;
use crate::error::Result;
use crate::staging::money::{Money, de_f64, de_i64, null_default};
use crate::staging::schema::{Cell, TableRows, TargetTable};

/// Default id prefix for a store: its upper-cased initial and a dash.
pub fn store_prefix(store: &str) -> String {
    match store.chars().next() {
        Some(c) => format!("{}-", c.to_uppercase()),
        None => String::new(),
    }
}

/// Reduce an opaque global id (`gid://shopify/Order/12345`) to its last
/// path segment and prepend `prefix`.
pub fn clean_id(gid: Option<&str>, prefix: &str) -> Option<String> {
    let gid = gid.filter(|g| !g.is_empty())?;
    let tail = gid.rsplit('/').next().unwrap_or(gid);
    Some(format!("{}{}", prefix, tail))
}

/// Edges come either as `{node: {...}}` or as the bare node.
fn unwrap_node(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("node") => {
            map.remove("node").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Decode one top-level record of the extracted batch.
pub fn decode_record<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(unwrap_node(value))?)
}

/// A GraphQL connection flattened to its nodes. Null edges are dropped.
#[derive(Debug, Clone)]
pub struct Connection<T>(pub Vec<T>);

impl<T> Default for Connection<T> {
    fn default() -> Self {
        Connection(Vec::new())
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Connection<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default, deserialize_with = "null_default")]
            edges: Vec<Value>,
        }

        let raw = Option::<Raw>::deserialize(deserializer)?;
        let nodes = raw
            .map(|r| r.edges)
            .unwrap_or_default()
            .into_iter()
            .map(unwrap_node)
            .filter(|v| !v.is_null())
            .map(|v| serde_json::from_value(v).map_err(D::Error::custom))
            .collect::<Result<Vec<T>, D::Error>>()?;
        Ok(Connection(nodes))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Ref {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Address {
    pub address1: Option<String>,
    pub address2: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub country: Option<String>,
    pub zip: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrderNode {
    pub id: Option<String>,
    pub name: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub processed_at: Option<String>,
    pub cancelled_at: Option<String>,
    pub cancel_reason: Option<String>,
    pub confirmed: Option<bool>,
    #[serde(deserialize_with = "null_default")]
    pub tags: Vec<String>,
    pub display_fulfillment_status: Option<String>,
    pub subtotal_price_set: Money,
    pub total_price_set: Money,
    pub total_tax_set: Money,
    pub total_discounts_set: Money,
    pub total_shipping_price_set: Money,
    pub customer: Option<Ref>,
    pub shipping_address: Option<Address>,
    pub line_items: Connection<LineItemNode>,
    pub source_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LineItemNode {
    pub id: Option<String>,
    #[serde(deserialize_with = "de_i64")]
    pub quantity: i64,
    pub title: Option<String>,
    pub variant: Option<Ref>,
    pub product: Option<Ref>,
    pub original_unit_price_set: Money,
    pub discounted_unit_price_set: Money,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomerNode {
    pub id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub state: Option<String>,
    pub tax_exempt: Option<bool>,
    #[serde(deserialize_with = "null_default")]
    pub tags: Vec<String>,
    pub note: Option<String>,
    #[serde(deserialize_with = "de_i64")]
    pub number_of_orders: i64,
    pub lifetime_duration: Option<String>,
    pub amount_spent: Money,
    pub default_address: Option<Address>,
    pub last_order: Option<LastOrder>,
    pub statistics: Option<CustomerStatistics>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LastOrder {
    pub id: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomerStatistics {
    pub predicted_spend_tier: Option<String>,
    pub rfm_group: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProductNode {
    pub id: Option<String>,
    pub title: Option<String>,
    pub handle: Option<String>,
    pub product_type: Option<String>,
    pub vendor: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    #[serde(deserialize_with = "null_default")]
    pub tags: Vec<String>,
    pub tracks_inventory: Option<bool>,
    pub variants: Connection<VariantNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VariantNode {
    pub id: Option<String>,
    pub sku: Option<String>,
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub compare_at_price: f64,
    pub available_for_sale: Option<bool>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub inventory_item: Option<InventoryItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: Option<String>,
    pub inventory_levels: Connection<InventoryLevel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InventoryLevel {
    #[serde(deserialize_with = "null_default")]
    pub quantities: Vec<NamedQuantity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NamedQuantity {
    pub name: Option<String>,
    #[serde(deserialize_with = "de_i64")]
    pub quantity: i64,
}

/// Inventory quantities summed across all locations of a variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InventoryTotals {
    pub available: i64,
    pub on_hand: i64,
    pub committed: i64,
    pub incoming: i64,
    pub reserved: i64,
}

impl InventoryTotals {
    pub fn sum(levels: &[InventoryLevel]) -> Self {
        let mut totals = Self::default();
        for q in levels.iter().flat_map(|l| &l.quantities) {
            let slot = match q.name.as_deref() {
                Some("available") => &mut totals.available,
                Some("on_hand") => &mut totals.on_hand,
                Some("committed") => &mut totals.committed,
                Some("incoming") => &mut totals.incoming,
                Some("reserved") => &mut totals.reserved,
                _ => continue,
            };
            *slot += q.quantity;
        }
        totals
    }
}

/// Inputs shared by every record of one load.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    /// Prepended to order, line item and customer ids.
    pub id_prefix: String,
    /// Stamped on inventory snapshot rows.
    pub loaded_at: DateTime<Utc>,
}

/// Rows for every table of an entity plus the batch's high-water mark.
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub tables: Vec<TableRows>,
    pub high_water_mark: Option<DateTime<Utc>>,
}

impl NormalizedBatch {
    pub fn rows_for(&self, table: TargetTable) -> &[Vec<Cell>] {
        self.tables
            .iter()
            .find(|t| t.table == table)
            .map(|t| t.rows.as_slice())
            .unwrap_or(&[])
    }
}

fn track_mark(mark: &mut Option<DateTime<Utc>>, updated_at: Option<&str>) {
    let Some(ts) = updated_at.and_then(|s| DateTime::parse_from_rfc3339(s).ok()) else {
        return;
    };
    let ts = ts.with_timezone(&Utc);
    if mark.is_none_or(|m| ts > m) {
        *mark = Some(ts);
    }
}

fn tags(tags: &[String]) -> Cell {
    Cell::text(tags.join(","))
}

/// Flatten a raw batch for `entity` into staging rows.
pub fn normalize(entity: Entity, raw: Vec<Value>, ctx: &NormalizeContext) -> Result<NormalizedBatch> {
    let mut mark = None;
    let tables = match entity {
        Entity::Orders => {
            let mut orders = TableRows::new(TargetTable::FactOrders);
            let mut items = TableRows::new(TargetTable::FactOrderItems);
            for value in raw {
                let order: OrderNode = decode_record(value)?;
                track_mark(&mut mark, order.updated_at.as_deref());
                push_order(&order, ctx, &mut orders, &mut items);
            }
            vec![orders, items]
        }
        Entity::Customers => {
            let mut customers = TableRows::new(TargetTable::DimCustomers);
            for value in raw {
                let customer: CustomerNode = decode_record(value)?;
                track_mark(&mut mark, customer.updated_at.as_deref());
                customers.rows.push(customer_row(&customer, ctx));
            }
            vec![customers]
        }
        Entity::Products => {
            let mut products = TableRows::new(TargetTable::DimProducts);
            let mut variants = TableRows::new(TargetTable::DimProductVariants);
            let mut inventory = TableRows::new(TargetTable::FactCurrentInventory);
            let mut snapshot = TableRows::new(TargetTable::InventorySnapshot);
            for value in raw {
                let product: ProductNode = decode_record(value)?;
                track_mark(&mut mark, product.updated_at.as_deref());
                push_product(
                    &product,
                    ctx,
                    &mut products,
                    &mut variants,
                    &mut inventory,
                    &mut snapshot,
                );
            }
            vec![products, variants, inventory, snapshot]
        }
    };

    Ok(NormalizedBatch {
        tables,
        high_water_mark: mark,
    })
}

fn push_order(
    order: &OrderNode,
    ctx: &NormalizeContext,
    orders: &mut TableRows,
    items: &mut TableRows,
) {
    let order_id = clean_id(order.id.as_deref(), &ctx.id_prefix);
    let line_items = &order.line_items.0;
    let mut total_quantity = 0;

    for li in line_items {
        total_quantity += li.quantity;
        items.rows.push(vec![
            Cell::Text(order_id.clone()),
            Cell::Text(clean_id(li.id.as_deref(), &ctx.id_prefix)),
            Cell::Int(li.quantity),
            Cell::Text(clean_id(li.variant.as_ref().and_then(|v| v.id.as_deref()), "")),
            Cell::Text(clean_id(li.product.as_ref().and_then(|p| p.id.as_deref()), "")),
            Cell::opt(li.title.as_deref()),
            Cell::Float(li.original_unit_price_set.amount),
            Cell::Float(li.discounted_unit_price_set.amount),
        ]);
    }

    let ship = order.shipping_address.clone().unwrap_or_default();
    orders.rows.push(vec![
        Cell::Text(order_id),
        Cell::text(order.name.as_deref().unwrap_or_default().replace('#', "")),
        Cell::opt(order.created_at.as_deref()),
        Cell::opt(order.updated_at.as_deref()),
        Cell::opt(order.processed_at.as_deref()),
        Cell::opt(order.cancelled_at.as_deref()),
        Cell::opt(order.cancel_reason.as_deref()),
        Cell::flag(Some(order.confirmed.unwrap_or(false))),
        tags(&order.tags),
        Cell::opt(order.display_fulfillment_status.as_deref()),
        Cell::Float(order.subtotal_price_set.amount),
        Cell::Text(order.total_price_set.currency.clone()),
        Cell::Float(order.total_price_set.amount),
        Cell::Float(order.total_tax_set.amount),
        Cell::Float(order.total_discounts_set.amount),
        Cell::Float(order.total_shipping_price_set.amount),
        Cell::Text(clean_id(
            order.customer.as_ref().and_then(|c| c.id.as_deref()),
            &ctx.id_prefix,
        )),
        Cell::Text(ship.address1),
        Cell::Text(ship.address2),
        Cell::Text(ship.city),
        Cell::Text(ship.province),
        Cell::Text(ship.country),
        Cell::Text(ship.zip),
        Cell::Text(ship.phone),
        Cell::Text(ship.company),
        Cell::Int(line_items.len() as i64),
        Cell::Int(total_quantity),
        Cell::opt(order.source_name.as_deref()),
    ]);
}

fn customer_row(customer: &CustomerNode, ctx: &NormalizeContext) -> Vec<Cell> {
    let addr = customer.default_address.clone().unwrap_or_default();
    let last_order = customer.last_order.clone().unwrap_or_default();
    let stats = customer.statistics.clone().unwrap_or_default();

    vec![
        Cell::Text(clean_id(customer.id.as_deref(), &ctx.id_prefix)),
        Cell::opt(customer.first_name.as_deref()),
        Cell::opt(customer.last_name.as_deref()),
        Cell::opt(customer.email.as_deref()),
        Cell::opt(customer.phone.as_deref()),
        Cell::opt(customer.created_at.as_deref()),
        Cell::opt(customer.updated_at.as_deref()),
        Cell::opt(customer.state.as_deref()),
        Cell::flag(customer.tax_exempt),
        tags(&customer.tags),
        Cell::opt(customer.note.as_deref()),
        Cell::Int(customer.number_of_orders),
        Cell::opt(customer.lifetime_duration.as_deref()),
        Cell::Float(customer.amount_spent.amount),
        Cell::Text(customer.amount_spent.currency.clone()),
        Cell::Text(addr.address1),
        Cell::Text(addr.address2),
        Cell::Text(addr.city),
        Cell::Text(addr.province),
        Cell::Text(addr.country),
        Cell::Text(addr.zip),
        Cell::Text(addr.company),
        Cell::Text(clean_id(last_order.id.as_deref(), &ctx.id_prefix)),
        Cell::Text(last_order.created_at),
        Cell::Text(stats.predicted_spend_tier),
        Cell::Text(stats.rfm_group),
    ]
}

fn push_product(
    product: &ProductNode,
    ctx: &NormalizeContext,
    products: &mut TableRows,
    variants: &mut TableRows,
    inventory: &mut TableRows,
    snapshot: &mut TableRows,
) {
    let product_id = clean_id(product.id.as_deref(), "");
    let snapshot_ts = ctx.loaded_at.to_rfc3339();
    let snapshot_date = ctx.loaded_at.format("%Y-%m-%d").to_string();

    products.rows.push(vec![
        Cell::Text(product_id.clone()),
        Cell::opt(product.title.as_deref()),
        Cell::opt(product.handle.as_deref()),
        Cell::opt(product.product_type.as_deref()),
        Cell::opt(product.vendor.as_deref()),
        Cell::opt(product.status.as_deref()),
        Cell::opt(product.created_at.as_deref()),
        Cell::opt(product.updated_at.as_deref()),
        tags(&product.tags),
        Cell::flag(product.tracks_inventory),
    ]);

    for variant in &product.variants.0 {
        let variant_id = clean_id(variant.id.as_deref(), "");
        let item = variant.inventory_item.clone().unwrap_or_default();
        let totals = InventoryTotals::sum(&item.inventory_levels.0);

        variants.rows.push(vec![
            Cell::Text(product_id.clone()),
            Cell::Text(variant_id.clone()),
            Cell::opt(variant.sku.as_deref()),
            Cell::Float(variant.price),
            Cell::Float(variant.compare_at_price),
            Cell::flag(variant.available_for_sale),
            Cell::opt(variant.created_at.as_deref()),
            Cell::opt(variant.updated_at.as_deref()),
        ]);

        inventory.rows.push(vec![
            Cell::Text(product_id.clone()),
            Cell::Text(variant_id.clone()),
            Cell::Int(totals.available),
            Cell::Int(totals.on_hand),
            Cell::Int(totals.committed),
            Cell::Int(totals.incoming),
            Cell::Int(totals.reserved),
            Cell::Text(clean_id(item.id.as_deref(), "")),
        ]);

        snapshot.rows.push(vec![
            Cell::Text(product_id.clone()),
            Cell::opt(product.title.as_deref()),
            Cell::Text(variant_id),
            Cell::opt(variant.sku.as_deref()),
            Cell::Int(totals.available),
            Cell::Int(totals.on_hand),
            Cell::Int(totals.committed),
            Cell::Int(totals.incoming),
            Cell::Int(totals.reserved),
            Cell::text(snapshot_ts.clone()),
            Cell::text(snapshot_date.clone()),
        ]);
    }
}
