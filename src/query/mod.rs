//! Query engine: filter/sort/facet-count queries against the serving slot.
//!
//! A query runs as one streamed scan over the flat product table. Filters
//! resolvable as SQL predicates are pushed down; faceted and set-membership
//! filters are evaluated in-memory per row so facet counts can apply the
//! self-exclusion rule. The scan is a plain stream: a caller that drops the
//! future abandons it, and the row loop is a cancellation point.

pub mod facets;
pub mod sql;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use metrics::{counter, histogram};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::domain::types::{ActiveLists, CandidateRow, EntityKind, Facet};
use crate::error::EngineError;
use crate::infra::db::map_sqlx_error;
use crate::infra::schema::{LogicalTable, table_name_for};
use crate::registry::{
    CATEGORY_FILTER, DynamicPredicate, FilterExpr, FilterRegistry, FilterValue, OrderExpr,
    OrderRegistry, RELATED_TYPE_MASTER_FILTER, RELATED_TYPE_SLAVE_FILTER, ResolvedValue,
    SortDirection, SqlScope,
};
use crate::state::{SlotId, SlotStore};

use facets::{DynamicEval, FacetAccumulator};
use sql::{PushdownFilter, RelationRestriction, ScanSpec};

/// One cache query: a named filter map, an optional sort, and the caller's
/// active list sets in coalesce priority order.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub filters: Vec<(String, FilterValue)>,
    pub sort: Option<(String, SortDirection)>,
    pub active: ActiveLists,
}

impl QueryRequest {
    pub fn new(active: ActiveLists) -> Self {
        Self {
            filters: Vec::new(),
            sort: None,
            active,
        }
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: FilterValue) -> Self {
        self.filters.push((name.into(), value));
        self
    }

    pub fn with_sort(mut self, name: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some((name.into(), direction));
        self
    }
}

/// Facet counts and bounds, keyed by external identifiers.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub product_ids: Vec<Uuid>,
    pub producer_counts: HashMap<Uuid, u64>,
    pub attribute_value_counts: HashMap<Uuid, u64>,
    pub display_amount_counts: HashMap<Uuid, u64>,
    pub display_delivery_counts: HashMap<Uuid, u64>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub price_with_tax_min: Option<f64>,
    pub price_with_tax_max: Option<f64>,
}

/// A query either runs against the serving slot or reports the cache as
/// unavailable; callers must then degrade to an uncached path.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Ready(QueryResult),
    Unavailable,
}

struct DynamicInstance {
    facet: Option<Facet>,
    predicate: DynamicPredicate,
    value: ResolvedValue,
}

/// Read path over the serving slot. Cheap to clone per caller; holds no
/// mutable state.
#[derive(Clone)]
pub struct QueryEngine {
    pool: SqlitePool,
    config: Arc<EngineConfig>,
    filters: Arc<FilterRegistry>,
    orders: Arc<OrderRegistry>,
    slots: SlotStore,
}

impl QueryEngine {
    pub fn new(
        pool: SqlitePool,
        config: Arc<EngineConfig>,
        filters: Arc<FilterRegistry>,
        orders: Arc<OrderRegistry>,
        slots: SlotStore,
    ) -> Self {
        crate::infra::telemetry::describe_metrics();
        Self {
            pool,
            config,
            filters,
            orders,
            slots,
        }
    }

    #[tracing::instrument(skip(self, request))]
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryOutcome, EngineError> {
        let started = Instant::now();
        self.validate_active(&request.active)?;

        let Some(slot) = self.slots.serving_slot().await? else {
            counter!("scaffale_query_unavailable_total").increment(1);
            debug!("query answered unavailable: no ready slot");
            return Ok(QueryOutcome::Unavailable);
        };

        let maps = self.load_id_maps(slot).await?;
        let plan = match self.plan(slot, request, &maps).await? {
            Plan::Scan(plan) => plan,
            // A filter referenced an id the snapshot has never seen; the
            // result is simply empty.
            Plan::Empty => return Ok(QueryOutcome::Ready(QueryResult::default())),
        };

        let spec = ScanSpec {
            slot,
            active: &request.active,
            pushdown: &plan.pushdown,
            category_table: plan.category_table.as_deref(),
            relation: plan.relation,
            order: plan.order,
        };
        let mut qb = sql::build_scan_query(&spec)?;
        let query = qb.build();
        let mut rows = query.fetch(&self.pool);

        let mut accumulator = FacetAccumulator::new();
        let mut product_ids = Vec::new();
        let mut scanned: u64 = 0;
        let mut evals: Vec<DynamicEval> = Vec::with_capacity(plan.dynamic.len());

        while let Some(row) = rows.next().await {
            let row = row.map_err(map_sqlx_error)?;
            let candidate = decode_row(&row)?;
            scanned += 1;

            evals.clear();
            for filter in &plan.dynamic {
                evals.push(DynamicEval {
                    facet: filter.facet,
                    passed: (filter.predicate)(&candidate, &filter.value, &request.active),
                });
            }
            if accumulator.observe(&candidate, &evals) {
                product_ids.push(candidate.external_id);
            }
        }

        counter!("scaffale_query_rows_scanned_total").increment(scanned);
        histogram!("scaffale_query_duration_ms").record(started.elapsed().as_millis() as f64);

        Ok(QueryOutcome::Ready(translate(
            product_ids,
            accumulator,
            &maps,
        )))
    }

    fn validate_active(&self, active: &ActiveLists) -> Result<(), EngineError> {
        if active.price_lists.is_empty() {
            return Err(EngineError::configuration(
                "at least one active price list is required",
            ));
        }
        for &id in &active.price_lists {
            if !self.config.has_price_list(id) {
                return Err(EngineError::UnknownPriceList { id });
            }
        }
        for &id in &active.visibility_lists {
            if !self.config.has_visibility_list(id) {
                return Err(EngineError::UnknownVisibilityList { id });
            }
        }
        Ok(())
    }

    async fn plan(
        &self,
        slot: SlotId,
        request: &QueryRequest,
        maps: &IdMaps,
    ) -> Result<Plan, EngineError> {
        let mut pushdown = Vec::new();
        let mut dynamic = Vec::new();
        let mut category_table = None;
        let mut relation: Option<RelationRestriction> = None;

        for (name, value) in &request.filters {
            let name = name.as_str();
            match name {
                CATEGORY_FILTER => {
                    let FilterValue::Id(external) = value else {
                        return Err(EngineError::invalid_filter(
                            name,
                            "category filter takes a single category id",
                        ));
                    };
                    let Some(internal) = self
                        .lookup_internal(slot, EntityKind::Category, *external)
                        .await?
                    else {
                        return Ok(Plan::Empty);
                    };
                    let table =
                        table_name_for(slot, LogicalTable::CategoryMembers(internal));
                    if !self.table_exists(&table).await? {
                        // Category exists but no product reached it.
                        return Ok(Plan::Empty);
                    }
                    category_table = Some(table);
                }
                RELATED_TYPE_MASTER_FILTER | RELATED_TYPE_SLAVE_FILTER => {
                    if relation.is_some() {
                        return Err(EngineError::invalid_filter(
                            name,
                            "related_type_master and related_type_slave are mutually exclusive",
                        ));
                    }
                    let FilterValue::Relation {
                        product,
                        relation_type,
                    } = value
                    else {
                        return Err(EngineError::invalid_filter(
                            name,
                            "relation filters take a (product, relation type) pair",
                        ));
                    };
                    let product_id = self
                        .lookup_internal(slot, EntityKind::Product, *product)
                        .await?;
                    let relation_type_id = self
                        .lookup_internal(slot, EntityKind::RelationType, *relation_type)
                        .await?;
                    let (Some(product_id), Some(relation_type_id)) =
                        (product_id, relation_type_id)
                    else {
                        return Ok(Plan::Empty);
                    };
                    relation = Some(RelationRestriction {
                        anchor_is_master: name == RELATED_TYPE_MASTER_FILTER,
                        product_id,
                        relation_type_id,
                    });
                }
                _ => match self.filters.get(name) {
                    Some(FilterExpr::Column(column)) => pushdown.push(PushdownFilter {
                        name: name.to_string(),
                        column: column.clone(),
                        value: value.clone(),
                    }),
                    Some(FilterExpr::Dynamic { facet, predicate }) => {
                        dynamic.push(DynamicInstance {
                            facet: *facet,
                            predicate: Arc::clone(predicate),
                            value: resolve_value(name, *facet, value, maps)?,
                        });
                    }
                    None => return Err(EngineError::unknown_filter(name)),
                },
            }
        }

        let order = match &request.sort {
            Some((name, direction)) => {
                let scope = SqlScope::new("p", &request.active);
                let rendered = match self.orders.get(name) {
                    Some(OrderExpr::Column(column)) => scope.render(column),
                    Some(OrderExpr::Sql(compose)) => compose(&scope),
                    None => return Err(EngineError::unknown_order(name.clone())),
                };
                Some((rendered, *direction))
            }
            None => None,
        };

        Ok(Plan::Scan(ScanPlan {
            pushdown,
            dynamic,
            category_table,
            relation,
            order,
        }))
    }

    async fn load_id_maps(&self, slot: SlotId) -> Result<IdMaps, EngineError> {
        let table = table_name_for(slot, LogicalTable::IdLookup);
        let rows = sqlx::query(&format!(
            "SELECT kind, internal_id, external_id FROM {table} \
             WHERE kind IN ('producer', 'attribute_value', 'display_amount', 'display_delivery')"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut maps = IdMaps::default();
        for row in rows {
            let kind: String = row.try_get("kind").map_err(map_sqlx_error)?;
            let internal: i64 = row.try_get("internal_id").map_err(map_sqlx_error)?;
            let external: String = row.try_get("external_id").map_err(map_sqlx_error)?;
            let Some(kind) = EntityKind::parse(&kind) else {
                continue;
            };
            let Ok(external) = Uuid::parse_str(&external) else {
                warn!(kind = kind.as_str(), internal, "skipping malformed external id");
                continue;
            };
            maps.forward.insert((kind, internal), external);
            maps.reverse.insert((kind, external), internal);
        }
        Ok(maps)
    }

    async fn lookup_internal(
        &self,
        slot: SlotId,
        kind: EntityKind,
        external: Uuid,
    ) -> Result<Option<i64>, EngineError> {
        let table = table_name_for(slot, LogicalTable::IdLookup);
        let row = sqlx::query(&format!(
            "SELECT internal_id FROM {table} WHERE kind = ? AND external_id = ?"
        ))
        .bind(kind.as_str())
        .bind(external.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.map(|row| row.try_get::<i64, _>("internal_id"))
            .transpose()
            .map_err(map_sqlx_error)
    }

    async fn table_exists(&self, name: &str) -> Result<bool, EngineError> {
        let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.is_some())
    }
}

enum Plan {
    Scan(ScanPlan),
    Empty,
}

struct ScanPlan {
    pushdown: Vec<PushdownFilter>,
    dynamic: Vec<DynamicInstance>,
    category_table: Option<String>,
    relation: Option<RelationRestriction>,
    order: Option<(String, SortDirection)>,
}

#[derive(Default)]
struct IdMaps {
    forward: HashMap<(EntityKind, i64), Uuid>,
    reverse: HashMap<(EntityKind, Uuid), i64>,
}

/// Sentinel internal id for external ids the snapshot has never seen; it
/// matches no row, so such filters simply yield empty facets.
const UNRESOLVED_ID: i64 = i64::MIN;

fn facet_kind(facet: Facet) -> Option<EntityKind> {
    match facet {
        Facet::Producer => Some(EntityKind::Producer),
        Facet::AttributeValue => Some(EntityKind::AttributeValue),
        Facet::DisplayAmount => Some(EntityKind::DisplayAmount),
        Facet::DisplayDelivery => Some(EntityKind::DisplayDelivery),
        Facet::Price => None,
    }
}

fn resolve_value(
    name: &str,
    facet: Option<Facet>,
    value: &FilterValue,
    maps: &IdMaps,
) -> Result<ResolvedValue, EngineError> {
    let kind_for_ids = || {
        facet.and_then(facet_kind).ok_or_else(|| {
            EngineError::invalid_filter(name, "id values are only valid for faceted filters")
        })
    };
    let resolve_one =
        |kind: EntityKind, id: &Uuid| maps.reverse.get(&(kind, *id)).copied().unwrap_or(UNRESOLVED_ID);

    Ok(match value {
        FilterValue::Text(v) => ResolvedValue::Text(v.clone()),
        FilterValue::Int(v) => ResolvedValue::Int(*v),
        FilterValue::Float(v) => ResolvedValue::Float(*v),
        FilterValue::Bool(v) => ResolvedValue::Bool(*v),
        FilterValue::Id(id) => ResolvedValue::Id(resolve_one(kind_for_ids()?, id)),
        FilterValue::IdList(ids) => {
            let kind = kind_for_ids()?;
            ResolvedValue::IdSet(ids.iter().map(|id| resolve_one(kind, id)).collect())
        }
        FilterValue::IdGroups(groups) => {
            let kind = kind_for_ids()?;
            ResolvedValue::IdGroups(
                groups
                    .iter()
                    .map(|group| {
                        group
                            .iter()
                            .map(|id| resolve_one(kind, id))
                            .collect::<HashSet<i64>>()
                    })
                    .collect(),
            )
        }
        FilterValue::Relation { .. } => {
            return Err(EngineError::invalid_filter(
                name,
                "relation pairs are only valid for the reserved relation filters",
            ));
        }
    })
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<CandidateRow, EngineError> {
    let external: String = row.try_get("product_external").map_err(map_sqlx_error)?;
    let external_id = Uuid::parse_str(&external)
        .map_err(|err| EngineError::storage(format!("malformed product external id: {err}")))?;
    let attribute_values: String = row.try_get("attribute_values").map_err(map_sqlx_error)?;
    let attribute_values: Vec<i64> = serde_json::from_str(&attribute_values)
        .map_err(|err| EngineError::storage(format!("malformed attribute value set: {err}")))?;

    Ok(CandidateRow {
        product_id: row.try_get("product_id").map_err(map_sqlx_error)?,
        external_id,
        producer_id: row.try_get("producer_id").map_err(map_sqlx_error)?,
        display_amount_id: row.try_get("display_amount_id").map_err(map_sqlx_error)?,
        sold_out: row.try_get("sold_out").map_err(map_sqlx_error)?,
        display_delivery_id: row.try_get("display_delivery_id").map_err(map_sqlx_error)?,
        attribute_values: attribute_values.into_iter().collect(),
        name: row.try_get("name").map_err(map_sqlx_error)?,
        code: row.try_get("code").map_err(map_sqlx_error)?,
        code2: row.try_get("code2").map_err(map_sqlx_error)?,
        external_code: row.try_get("external_code").map_err(map_sqlx_error)?,
        barcode: row.try_get("barcode").map_err(map_sqlx_error)?,
        price: row.try_get("active_price").map_err(map_sqlx_error)?,
        price_with_tax: row
            .try_get("active_price_with_tax")
            .map_err(map_sqlx_error)?,
    })
}

fn translate(product_ids: Vec<Uuid>, accumulator: FacetAccumulator, maps: &IdMaps) -> QueryResult {
    let translate_counts = |kind: EntityKind, counts: HashMap<i64, u64>| {
        let mut out = HashMap::with_capacity(counts.len());
        for (internal, count) in counts {
            match maps.forward.get(&(kind, internal)) {
                Some(external) => {
                    out.insert(*external, count);
                }
                None => {
                    warn!(
                        kind = kind.as_str(),
                        internal, "dropping facet count with no external id mapping"
                    );
                }
            }
        }
        out
    };

    QueryResult {
        product_ids,
        producer_counts: translate_counts(EntityKind::Producer, accumulator.producer_counts),
        attribute_value_counts: translate_counts(
            EntityKind::AttributeValue,
            accumulator.attribute_value_counts,
        ),
        display_amount_counts: translate_counts(
            EntityKind::DisplayAmount,
            accumulator.display_amount_counts,
        ),
        display_delivery_counts: translate_counts(
            EntityKind::DisplayDelivery,
            accumulator.display_delivery_counts,
        ),
        price_min: accumulator.price_min,
        price_max: accumulator.price_max,
        price_with_tax_min: accumulator.price_with_tax_min,
        price_with_tax_max: accumulator.price_with_tax_max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_external_ids_map_to_sentinel() {
        let maps = IdMaps::default();
        let resolved = resolve_value(
            "producer",
            Some(Facet::Producer),
            &FilterValue::Id(Uuid::new_v4()),
            &maps,
        )
        .expect("id value on faceted filter");
        assert_eq!(resolved, ResolvedValue::Id(UNRESOLVED_ID));
    }

    #[test]
    fn id_values_require_a_faceted_filter() {
        let maps = IdMaps::default();
        let result = resolve_value("search", None, &FilterValue::Id(Uuid::new_v4()), &maps);
        assert!(matches!(result, Err(EngineError::InvalidFilter { .. })));

        let result = resolve_value(
            "price_at_least",
            Some(Facet::Price),
            &FilterValue::IdList(vec![]),
            &maps,
        );
        assert!(matches!(result, Err(EngineError::InvalidFilter { .. })));
    }

    #[test]
    fn scalar_values_resolve_structurally() {
        let maps = IdMaps::default();
        let resolved =
            resolve_value("price_at_least", Some(Facet::Price), &FilterValue::Float(9.5), &maps)
                .expect("scalar");
        assert_eq!(resolved, ResolvedValue::Float(9.5));
    }
}
