//! Pushdown scan assembly.
//!
//! Builds the single SELECT a query streams from: the flat product table,
//! optionally joined to a category membership table, restricted by the
//! relation cache, the mandatory coalesced-price positivity predicate,
//! and any column filter predicates, with the sort pushed down.

use sqlx::{QueryBuilder, Sqlite};

use crate::domain::types::ActiveLists;
use crate::error::EngineError;
use crate::infra::schema::{LogicalTable, table_name_for};
use crate::registry::{ColumnRef, FilterValue, SortDirection, SqlScope};
use crate::state::SlotId;

/// A filter resolvable as a SQL predicate.
pub struct PushdownFilter {
    pub name: String,
    pub column: ColumnRef,
    pub value: FilterValue,
}

/// Restriction to ids present in the relation cache for one
/// (product, relation-type) pair. `anchor_is_master` distinguishes
/// "slaves of P" from "masters over P".
#[derive(Debug, Clone, Copy)]
pub struct RelationRestriction {
    pub anchor_is_master: bool,
    pub product_id: i64,
    pub relation_type_id: i64,
}

pub struct ScanSpec<'a> {
    pub slot: SlotId,
    pub active: &'a ActiveLists,
    pub pushdown: &'a [PushdownFilter],
    /// Membership table name, pre-validated to exist.
    pub category_table: Option<&'a str>,
    pub relation: Option<RelationRestriction>,
    /// Rendered order expression, if a sort was requested.
    pub order: Option<(String, SortDirection)>,
}

/// Assemble the scan. The product table is aliased `p`; the select list is
/// fixed so row decoding stays positional-by-name.
pub fn build_scan_query(spec: &ScanSpec<'_>) -> Result<QueryBuilder<'static, Sqlite>, EngineError> {
    let scope = SqlScope::new("p", spec.active);
    let price = scope.price_column("price");
    let price_with_tax = scope.price_column("price_with_tax");
    let table = table_name_for(spec.slot, LogicalTable::Products);

    let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new(format!(
        "SELECT p.product_id, p.product_external, p.producer_id, p.display_amount_id, \
         p.sold_out, p.display_delivery_id, p.name, p.code, p.code2, p.external_code, \
         p.barcode, p.attribute_values, {price} AS active_price, \
         {price_with_tax} AS active_price_with_tax FROM {table} p"
    ));

    if let Some(members) = spec.category_table {
        qb.push(format!(
            " INNER JOIN {members} cm ON cm.product_id = p.product_id"
        ));
    }

    // The coalesced active price must be positive; unpriced combinations
    // are never served.
    qb.push(format!(" WHERE {price} > 0"));

    if let Some(relation) = spec.relation {
        let relations = table_name_for(spec.slot, LogicalTable::Relations);
        let (anchor_column, member_column) = if relation.anchor_is_master {
            ("master_id", "slave_id")
        } else {
            ("slave_id", "master_id")
        };
        qb.push(format!(
            " AND EXISTS (SELECT 1 FROM {relations} r \
             WHERE r.{member_column} = p.product_id AND r.{anchor_column} = "
        ));
        qb.push_bind(relation.product_id);
        qb.push(" AND r.relation_type_id = ");
        qb.push_bind(relation.relation_type_id);
        qb.push(")");
    }

    for filter in spec.pushdown {
        qb.push(format!(" AND {} = ", scope.render(&filter.column)));
        bind_scalar(&mut qb, filter)?;
    }

    match &spec.order {
        Some((expr, direction)) => {
            qb.push(format!(
                " ORDER BY {expr} {}, p.product_id ASC",
                direction.sql()
            ));
        }
        None => {
            qb.push(" ORDER BY p.product_id ASC");
        }
    }
    Ok(qb)
}

fn bind_scalar(
    qb: &mut QueryBuilder<'static, Sqlite>,
    filter: &PushdownFilter,
) -> Result<(), EngineError> {
    match &filter.value {
        FilterValue::Text(value) => {
            qb.push_bind(value.clone());
        }
        FilterValue::Int(value) => {
            qb.push_bind(*value);
        }
        FilterValue::Float(value) => {
            qb.push_bind(*value);
        }
        FilterValue::Bool(value) => {
            qb.push_bind(*value);
        }
        other => {
            return Err(EngineError::invalid_filter(
                filter.name.as_str(),
                format!("column filters take scalar values, got {other:?}"),
            ));
        }
    }
    Ok(())
}
