//! Denormalized cache schema, generated from the engine configuration.
//!
//! Each slot owns a physically disjoint set of tables, suffixed by slot id,
//! so one slot can be dropped and rebuilt while the other is being read:
//!
//! - `product_cache_{slot}`: one row per priced product, with one column
//!   per category type, a five-column group per visibility list and a
//!   four-column group per price list. Absent list entries are NULL.
//! - `category_members_{slot}_{category}`: product ids belonging to the
//!   category or any descendant (ancestor-closure membership).
//! - `relation_cache_{slot}`: product-to-product relation instances.
//! - `id_lookup_{slot}`: internal id to external uuid, per entity kind.

use sqlx::SqlitePool;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::infra::db::map_sqlx_error;
use crate::state::SlotId;

/// Logical tables the storage adapter maps onto slot-suffixed names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalTable {
    Products,
    Relations,
    IdLookup,
    CategoryMembers(i64),
}

pub fn table_name_for(slot: SlotId, table: LogicalTable) -> String {
    match table {
        LogicalTable::Products => format!("product_cache_{}", slot.suffix()),
        LogicalTable::Relations => format!("relation_cache_{}", slot.suffix()),
        LogicalTable::IdLookup => format!("id_lookup_{}", slot.suffix()),
        LogicalTable::CategoryMembers(category_id) => {
            format!("category_members_{}_{}", slot.suffix(), category_id)
        }
    }
}

pub const VISIBILITY_FIELDS: [&str; 5] = [
    "hidden",
    "hidden_in_menu",
    "priority",
    "unavailable",
    "recommended",
];

pub const PRICE_FIELDS: [&str; 4] = [
    "price",
    "price_with_tax",
    "price_before_discount",
    "price_with_tax_before_discount",
];

pub fn category_type_column(category_type_id: i64) -> String {
    format!("ct{category_type_id}_category")
}

pub fn visibility_column(list_id: i64, field: &str) -> String {
    format!("v{list_id}_{field}")
}

pub fn price_column(list_id: i64, field: &str) -> String {
    format!("p{list_id}_{field}")
}

/// Number of columns in one product row, used to bound insert chunks.
pub fn product_column_count(config: &EngineConfig) -> usize {
    12 + config.category_types.len()
        + VISIBILITY_FIELDS.len() * config.visibility_lists.len()
        + PRICE_FIELDS.len() * config.price_lists.len()
}

pub const RELATION_COLUMNS: [&str; 9] = [
    "master_id",
    "slave_id",
    "relation_type_id",
    "priority",
    "quantity",
    "hidden",
    "systemic",
    "discount_percent",
    "master_price_share",
];

/// Drop every table belonging to a slot, including membership tables left
/// over from categories that no longer exist.
pub async fn drop_slot_tables(pool: &SqlitePool, slot: SlotId) -> Result<(), EngineError> {
    let members_prefix = format!("category_members_{}_%", slot.suffix());
    let names: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND (name = ? OR name = ? OR name = ? OR name LIKE ?)",
    )
    .bind(table_name_for(slot, LogicalTable::Products))
    .bind(table_name_for(slot, LogicalTable::Relations))
    .bind(table_name_for(slot, LogicalTable::IdLookup))
    .bind(members_prefix)
    .fetch_all(pool)
    .await
    .map_err(map_sqlx_error)?;

    for (name,) in names {
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{name}\""))
            .execute(pool)
            .await
            .map_err(map_sqlx_error)?;
    }
    Ok(())
}

/// CREATE TABLE statement for the flat product table under the current
/// configuration.
pub fn product_table_ddl(slot: SlotId, config: &EngineConfig) -> String {
    let mut columns = vec![
        "product_id INTEGER PRIMARY KEY".to_string(),
        "product_external TEXT NOT NULL".to_string(),
        "producer_id INTEGER".to_string(),
        "display_amount_id INTEGER".to_string(),
        "sold_out INTEGER NOT NULL DEFAULT 0".to_string(),
        "display_delivery_id INTEGER".to_string(),
        "name TEXT NOT NULL".to_string(),
        "code TEXT NOT NULL".to_string(),
        "code2 TEXT".to_string(),
        "external_code TEXT".to_string(),
        "barcode TEXT".to_string(),
        "attribute_values TEXT NOT NULL".to_string(),
    ];
    for ct in &config.category_types {
        columns.push(format!("{} INTEGER", category_type_column(ct.id)));
    }
    for list in &config.visibility_lists {
        for field in VISIBILITY_FIELDS {
            columns.push(format!("{} INTEGER", visibility_column(list.id, field)));
        }
    }
    for list in &config.price_lists {
        for field in PRICE_FIELDS {
            columns.push(format!("{} REAL", price_column(list.id, field)));
        }
    }
    format!(
        "CREATE TABLE {} ({})",
        table_name_for(slot, LogicalTable::Products),
        columns.join(", ")
    )
}

pub fn relation_table_ddl(slot: SlotId) -> String {
    format!(
        "CREATE TABLE {} (\
             master_id INTEGER NOT NULL,\
             slave_id INTEGER NOT NULL,\
             relation_type_id INTEGER NOT NULL,\
             priority INTEGER NOT NULL DEFAULT 0,\
             quantity REAL NOT NULL DEFAULT 1,\
             hidden INTEGER NOT NULL DEFAULT 0,\
             systemic INTEGER NOT NULL DEFAULT 0,\
             discount_percent REAL,\
             master_price_share REAL\
         )",
        table_name_for(slot, LogicalTable::Relations)
    )
}

pub fn id_lookup_table_ddl(slot: SlotId) -> String {
    format!(
        "CREATE TABLE {} (\
             kind TEXT NOT NULL,\
             internal_id INTEGER NOT NULL,\
             external_id TEXT NOT NULL,\
             PRIMARY KEY (kind, internal_id)\
         )",
        table_name_for(slot, LogicalTable::IdLookup)
    )
}

pub fn category_members_table_ddl(slot: SlotId, category_id: i64) -> String {
    format!(
        "CREATE TABLE {} (product_id INTEGER PRIMARY KEY)",
        table_name_for(slot, LogicalTable::CategoryMembers(category_id))
    )
}

/// Index statements for the flat product table: one per visibility-list
/// column group, one per price-list column group, the scalar facet columns,
/// each category-type column, and unique natural keys.
pub fn product_index_ddl(slot: SlotId, config: &EngineConfig) -> Vec<String> {
    let table = table_name_for(slot, LogicalTable::Products);
    let mut statements = Vec::new();
    let mut index = |name: String, unique: bool, columns: String| {
        let kind = if unique { "UNIQUE INDEX" } else { "INDEX" };
        statements.push(format!("CREATE {kind} {name} ON {table} ({columns})"));
    };

    for list in &config.visibility_lists {
        let columns: Vec<String> = VISIBILITY_FIELDS
            .iter()
            .map(|field| visibility_column(list.id, field))
            .collect();
        index(
            format!("ix_{table}_v{}", list.id),
            false,
            columns.join(", "),
        );
    }
    for list in &config.price_lists {
        let columns: Vec<String> = PRICE_FIELDS
            .iter()
            .map(|field| price_column(list.id, field))
            .collect();
        index(
            format!("ix_{table}_p{}", list.id),
            false,
            columns.join(", "),
        );
    }
    index(format!("ix_{table}_producer"), false, "producer_id".into());
    index(
        format!("ix_{table}_display_amount"),
        false,
        "display_amount_id".into(),
    );
    index(format!("ix_{table}_sold_out"), false, "sold_out".into());
    index(
        format!("ix_{table}_display_delivery"),
        false,
        "display_delivery_id".into(),
    );
    for ct in &config.category_types {
        let column = category_type_column(ct.id);
        index(format!("ix_{table}_{column}"), false, column);
    }
    index(format!("ux_{table}_code"), true, "code".into());
    index(format!("ux_{table}_barcode"), true, "barcode".into());
    index(
        format!("ux_{table}_external"),
        true,
        "product_external".into(),
    );
    statements
}

pub fn relation_index_ddl(slot: SlotId) -> Vec<String> {
    let table = table_name_for(slot, LogicalTable::Relations);
    vec![
        format!("CREATE INDEX ix_{table}_master ON {table} (master_id, relation_type_id)"),
        format!("CREATE INDEX ix_{table}_slave ON {table} (slave_id, relation_type_id)"),
    ]
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::config::{CategoryTypeConfig, PriceListConfig, VisibilityListConfig};

    use super::*;

    fn config() -> EngineConfig {
        EngineConfig {
            price_lists: vec![PriceListConfig {
                id: 3,
                external_id: Uuid::new_v4(),
                active: true,
                valid_from: None,
                valid_to: None,
            }],
            visibility_lists: vec![VisibilityListConfig {
                id: 7,
                external_id: Uuid::new_v4(),
            }],
            category_types: vec![CategoryTypeConfig {
                id: 2,
                external_id: Uuid::new_v4(),
            }],
            warming_timeout_secs: 60,
            insert_chunk_rows: 100,
        }
    }

    #[test]
    fn table_names_are_slot_suffixed() {
        assert_eq!(
            table_name_for(SlotId::One, LogicalTable::Products),
            "product_cache_1"
        );
        assert_eq!(
            table_name_for(SlotId::Two, LogicalTable::CategoryMembers(42)),
            "category_members_2_42"
        );
    }

    #[test]
    fn product_ddl_contains_list_scoped_columns() {
        let ddl = product_table_ddl(SlotId::One, &config());
        assert!(ddl.contains("ct2_category INTEGER"));
        assert!(ddl.contains("v7_hidden INTEGER"));
        assert!(ddl.contains("v7_recommended INTEGER"));
        assert!(ddl.contains("p3_price REAL"));
        assert!(ddl.contains("p3_price_with_tax_before_discount REAL"));
    }

    #[test]
    fn column_count_matches_generated_ddl() {
        let config = config();
        let ddl = product_table_ddl(SlotId::One, &config);
        let generated = ddl.matches(',').count() + 1;
        assert_eq!(generated, product_column_count(&config));
    }

    #[test]
    fn natural_keys_are_unique_indexes() {
        let statements = product_index_ddl(SlotId::One, &config());
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE UNIQUE INDEX") && s.ends_with("(code)")));
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE UNIQUE INDEX") && s.ends_with("(barcode)")));
    }
}
