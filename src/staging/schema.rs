use crate::engine::types::Entity;

/// Warehouse tables fed by the staging writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetTable {
    DimCustomers,
    DimProducts,
    DimProductVariants,
    FactCurrentInventory,
    InventorySnapshot,
    FactOrders,
    FactOrderItems,
}

impl TargetTable {
    pub fn name(&self) -> &'static str {
        match self {
            TargetTable::DimCustomers => "dim_customers",
            TargetTable::DimProducts => "dim_products",
            TargetTable::DimProductVariants => "dim_product_variants",
            TargetTable::FactCurrentInventory => "fact_current_inventory",
            TargetTable::InventorySnapshot => "inventory_snapshot",
            TargetTable::FactOrders => "fact_orders",
            TargetTable::FactOrderItems => "fact_order_items",
        }
    }

    /// Column order of the staging table. Normalized rows follow it exactly.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            TargetTable::DimCustomers => &[
                "customer_id",
                "first_name",
                "last_name",
                "email",
                "phone",
                "created_at",
                "updated_at",
                "state",
                "tax_exempt",
                "tags",
                "note",
                "number_of_orders",
                "lifetime_duration",
                "amount_spent",
                "currency",
                "address1",
                "address2",
                "city",
                "province",
                "country",
                "zip",
                "company",
                "last_order_id",
                "last_order_date",
                "predicted_spend_tier",
                "rfm_group",
            ],
            TargetTable::DimProducts => &[
                "product_id",
                "title",
                "handle",
                "product_type",
                "vendor",
                "status",
                "created_at",
                "updated_at",
                "tags",
                "tracks_inventory",
            ],
            TargetTable::DimProductVariants => &[
                "product_id",
                "variant_id",
                "sku",
                "price",
                "compare_at_price",
                "available_for_sale",
                "created_at",
                "updated_at",
            ],
            TargetTable::FactCurrentInventory => &[
                "product_id",
                "variant_id",
                "available",
                "on_hand",
                "committed",
                "incoming",
                "reserved",
                "inventory_id",
            ],
            TargetTable::InventorySnapshot => &[
                "product_id",
                "product_title",
                "variant_id",
                "sku",
                "available",
                "on_hand",
                "committed",
                "incoming",
                "reserved",
                "snapshot_ts",
                "snapshot_date",
            ],
            TargetTable::FactOrders => &[
                "order_id",
                "order_number",
                "created_at",
                "updated_at",
                "processed_at",
                "cancelled_at",
                "cancel_reason",
                "confirmed",
                "tags",
                "fulfillment_status",
                "subtotal",
                "currency",
                "total_price",
                "total_tax",
                "total_discounts",
                "total_shipping",
                "customer_id",
                "shipping_address1",
                "shipping_address2",
                "shipping_city",
                "shipping_province",
                "shipping_country",
                "shipping_zip",
                "shipping_phone",
                "shipping_company",
                "line_items_count",
                "total_quantity",
                "source_name",
            ],
            TargetTable::FactOrderItems => &[
                "order_id",
                "line_item_id",
                "quantity",
                "variant_id",
                "product_id",
                "title",
                "original_price",
                "discounted_price",
            ],
        }
    }

    /// Tables an entity's load replaces, in insert order.
    pub fn for_entity(entity: Entity) -> &'static [TargetTable] {
        match entity {
            Entity::Orders => &[TargetTable::FactOrders, TargetTable::FactOrderItems],
            Entity::Customers => &[TargetTable::DimCustomers],
            Entity::Products => &[
                TargetTable::DimProducts,
                TargetTable::DimProductVariants,
                TargetTable::FactCurrentInventory,
                TargetTable::InventorySnapshot,
            ],
        }
    }

    pub const ALL: [TargetTable; 7] = [
        TargetTable::DimCustomers,
        TargetTable::DimProducts,
        TargetTable::DimProductVariants,
        TargetTable::FactCurrentInventory,
        TargetTable::InventorySnapshot,
        TargetTable::FactOrders,
        TargetTable::FactOrderItems,
    ];

    /// Per-store staging table name, e.g. `staging_retail_fact_orders`.
    pub fn staging_name(&self, store: &str) -> String {
        format!("staging_{}_{}", store, self.name())
    }

    /// `CREATE TABLE IF NOT EXISTS` for this table's staging copy.
    pub fn staging_ddl(&self, store: &str) -> String {
        let columns: Vec<String> = self
            .columns()
            .iter()
            .map(|c| format!("{} {}", c, column_type(c).sql()))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.staging_name(store),
            columns.join(", ")
        )
    }
}

/// Storage class of a staging column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Real => "DOUBLE PRECISION",
        }
    }
}

/// Counts and quantities are integers, money is real, everything else text.
pub fn column_type(column: &str) -> ColumnType {
    match column {
        "number_of_orders" | "line_items_count" | "total_quantity" | "quantity" | "available"
        | "on_hand" | "committed" | "incoming" | "reserved" => ColumnType::Integer,
        "amount_spent" | "price" | "compare_at_price" | "subtotal" | "total_price"
        | "total_tax" | "total_discounts" | "total_shipping" | "original_price"
        | "discounted_price" => ColumnType::Real,
        _ => ColumnType::Text,
    }
}

/// A single staged value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(Option<String>),
    Int(i64),
    Float(f64),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(Some(value.into()))
    }

    pub fn opt(value: Option<&str>) -> Self {
        Cell::Text(value.map(str::to_string))
    }

    /// `true` / `false`, or NULL when the source omitted the flag.
    pub fn flag(value: Option<bool>) -> Self {
        Cell::Text(value.map(|b| b.to_string()))
    }
}

pub type Row = Vec<Cell>;

/// Normalized rows for one target table.
#[derive(Debug, Clone)]
pub struct TableRows {
    pub table: TargetTable,
    pub rows: Vec<Row>,
}

impl TableRows {
    pub fn new(table: TargetTable) -> Self {
        Self {
            table,
            rows: Vec::new(),
        }
    }
}
