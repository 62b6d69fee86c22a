//! Filter and order expression registries.
//!
//! A registry maps a public filter/sort name to either a direct column
//! reference (pushed down into the slot query, with list-scoped columns
//! rewritten to a COALESCE over the request's active lists) or a dynamic
//! callback evaluated in-memory per candidate row. Registries are built
//! once at startup, are append-only, and are passed into the builder and
//! the query engine explicitly so tests can run with isolated tables.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::domain::types::{ActiveLists, CandidateRow, Facet};
use crate::error::EngineError;
use crate::infra::schema;

/// Filter names the query engine interprets itself: category filtering
/// joins a membership table and relation filtering joins the relation
/// cache, neither is a generic column predicate.
pub const CATEGORY_FILTER: &str = "category";
pub const RELATED_TYPE_MASTER_FILTER: &str = "related_type_master";
pub const RELATED_TYPE_SLAVE_FILTER: &str = "related_type_slave";

const RESERVED_NAMES: [&str; 3] = [
    CATEGORY_FILTER,
    RELATED_TYPE_MASTER_FILTER,
    RELATED_TYPE_SLAVE_FILTER,
];

/// A caller-supplied filter value. External identifiers are uuids; the
/// engine resolves them to internal ids before the scan.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Id(Uuid),
    IdList(Vec<Uuid>),
    /// Attribute-value groups: values within a group OR together, groups
    /// AND together (one group per attribute).
    IdGroups(Vec<Vec<Uuid>>),
    /// Relation 2-tuple for the reserved relation filters.
    Relation {
        product: Uuid,
        relation_type: Uuid,
    },
}

/// A filter value after external-to-internal id resolution. Unknown
/// external ids resolve to a sentinel that matches no row.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Id(i64),
    IdSet(std::collections::HashSet<i64>),
    IdGroups(Vec<std::collections::HashSet<i64>>),
}

/// Sort direction for order expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn sql(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

/// A column reference, optionally scoped to the active price or visibility
/// lists. List-scoped references render as a COALESCE over the active
/// lists in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Plain(String),
    PriceList(String),
    VisibilityList(String),
}

/// Renders column references for a concrete request: a table alias plus
/// the request's active list sets.
pub struct SqlScope<'a> {
    alias: &'a str,
    active: &'a ActiveLists,
}

impl<'a> SqlScope<'a> {
    pub fn new(alias: &'a str, active: &'a ActiveLists) -> Self {
        Self { alias, active }
    }

    pub fn column(&self, name: &str) -> String {
        format!("{}.{name}", self.alias)
    }

    /// Coalesce a price-list column group over the active price lists.
    pub fn price_column(&self, field: &str) -> String {
        self.coalesce(
            self.active
                .price_lists
                .iter()
                .map(|&list| schema::price_column(list, field)),
        )
    }

    /// Coalesce a visibility-list column group over the active visibility
    /// lists.
    pub fn visibility_column(&self, field: &str) -> String {
        self.coalesce(
            self.active
                .visibility_lists
                .iter()
                .map(|&list| schema::visibility_column(list, field)),
        )
    }

    pub fn render(&self, column: &ColumnRef) -> String {
        match column {
            ColumnRef::Plain(name) => self.column(name),
            ColumnRef::PriceList(field) => self.price_column(field),
            ColumnRef::VisibilityList(field) => self.visibility_column(field),
        }
    }

    fn coalesce(&self, columns: impl Iterator<Item = String>) -> String {
        let qualified: Vec<String> = columns
            .map(|column| format!("{}.{column}", self.alias))
            .collect();
        match qualified.as_slice() {
            [] => "NULL".to_string(),
            [single] => single.clone(),
            many => format!("COALESCE({})", many.join(", ")),
        }
    }
}

/// In-memory per-row predicate: candidate row, resolved filter value,
/// active list sets.
pub type DynamicPredicate =
    Arc<dyn Fn(&CandidateRow, &ResolvedValue, &ActiveLists) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum FilterExpr {
    /// Pushed down as a SQL equality predicate.
    Column(ColumnRef),
    /// Evaluated in-memory per candidate row. `facet` names the dimension
    /// this filter constrains, enabling facet-count self-exclusion.
    Dynamic {
        facet: Option<Facet>,
        predicate: DynamicPredicate,
    },
}

/// SQL fragment composer for callback order expressions.
pub type OrderSqlFn = Arc<dyn Fn(&SqlScope<'_>) -> String + Send + Sync>;

#[derive(Clone)]
pub enum OrderExpr {
    Column(ColumnRef),
    /// Composes a SQL fragment; order expressions are always pushed down.
    Sql(OrderSqlFn),
}

/// Named filter expressions. Populated once at startup, append-only.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    entries: HashMap<String, FilterExpr>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in filter set.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let register = |registry: &mut Self, name: &str, expr: FilterExpr| {
            registry
                .register(name, expr)
                .unwrap_or_else(|_| unreachable!("standard names are distinct"));
        };

        register(
            &mut registry,
            "producer",
            FilterExpr::Dynamic {
                facet: Some(Facet::Producer),
                predicate: Arc::new(|row, value, _| id_matches(row.producer_id, value)),
            },
        );
        register(
            &mut registry,
            "attribute_value",
            FilterExpr::Dynamic {
                facet: Some(Facet::AttributeValue),
                predicate: Arc::new(|row, value, _| match value {
                    ResolvedValue::Id(id) => row.attribute_values.contains(id),
                    ResolvedValue::IdSet(set) => !row.attribute_values.is_disjoint(set),
                    ResolvedValue::IdGroups(groups) => groups
                        .iter()
                        .all(|group| !row.attribute_values.is_disjoint(group)),
                    _ => false,
                }),
            },
        );
        register(
            &mut registry,
            "display_amount",
            FilterExpr::Dynamic {
                facet: Some(Facet::DisplayAmount),
                predicate: Arc::new(|row, value, _| id_matches(row.display_amount_id, value)),
            },
        );
        register(
            &mut registry,
            "display_delivery",
            FilterExpr::Dynamic {
                facet: Some(Facet::DisplayDelivery),
                predicate: Arc::new(|row, value, _| id_matches(row.display_delivery_id, value)),
            },
        );
        register(
            &mut registry,
            "price_at_least",
            FilterExpr::Dynamic {
                facet: Some(Facet::Price),
                predicate: Arc::new(|row, value, _| match numeric(value) {
                    Some(bound) => row.price.is_some_and(|price| price >= bound),
                    None => false,
                }),
            },
        );
        register(
            &mut registry,
            "price_at_most",
            FilterExpr::Dynamic {
                facet: Some(Facet::Price),
                predicate: Arc::new(|row, value, _| match numeric(value) {
                    Some(bound) => row.price.is_some_and(|price| price <= bound),
                    None => false,
                }),
            },
        );
        register(
            &mut registry,
            "search",
            FilterExpr::Dynamic {
                facet: None,
                predicate: Arc::new(|row, value, _| match value {
                    ResolvedValue::Text(needle) => {
                        let needle = needle.to_lowercase();
                        row.name.to_lowercase().contains(&needle)
                            || row.code.to_lowercase().contains(&needle)
                            || row
                                .code2
                                .as_deref()
                                .is_some_and(|v| v.to_lowercase().contains(&needle))
                            || row
                                .external_code
                                .as_deref()
                                .is_some_and(|v| v.to_lowercase().contains(&needle))
                            || row
                                .barcode
                                .as_deref()
                                .is_some_and(|v| v.to_lowercase().contains(&needle))
                    }
                    _ => false,
                }),
            },
        );

        register(
            &mut registry,
            "sold_out",
            FilterExpr::Column(ColumnRef::Plain("sold_out".into())),
        );
        register(
            &mut registry,
            "code",
            FilterExpr::Column(ColumnRef::Plain("code".into())),
        );
        register(
            &mut registry,
            "barcode",
            FilterExpr::Column(ColumnRef::Plain("barcode".into())),
        );
        register(
            &mut registry,
            "external_code",
            FilterExpr::Column(ColumnRef::Plain("external_code".into())),
        );
        for field in ["hidden", "hidden_in_menu", "unavailable", "recommended"] {
            register(
                &mut registry,
                field,
                FilterExpr::Column(ColumnRef::VisibilityList(field.into())),
            );
        }
        registry
    }

    /// Register a filter. Names are append-only and must not collide with
    /// the reserved category/relation filters.
    pub fn register(&mut self, name: &str, expr: FilterExpr) -> Result<(), EngineError> {
        if RESERVED_NAMES.contains(&name) {
            return Err(EngineError::configuration(format!(
                "filter name `{name}` is reserved"
            )));
        }
        if self.entries.contains_key(name) {
            return Err(EngineError::configuration(format!(
                "filter `{name}` is already registered"
            )));
        }
        self.entries.insert(name.to_string(), expr);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FilterExpr> {
        self.entries.get(name)
    }
}

/// Named order expressions. Populated once at startup, append-only.
#[derive(Clone, Default)]
pub struct OrderRegistry {
    entries: HashMap<String, OrderExpr>,
}

impl OrderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in sort set.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let register = |registry: &mut Self, name: &str, expr: OrderExpr| {
            registry
                .register(name, expr)
                .unwrap_or_else(|_| unreachable!("standard names are distinct"));
        };

        register(
            &mut registry,
            "name",
            OrderExpr::Column(ColumnRef::Plain("name".into())),
        );
        register(
            &mut registry,
            "code",
            OrderExpr::Column(ColumnRef::Plain("code".into())),
        );
        register(
            &mut registry,
            "price",
            OrderExpr::Column(ColumnRef::PriceList("price".into())),
        );
        register(
            &mut registry,
            "price_with_tax",
            OrderExpr::Column(ColumnRef::PriceList("price_with_tax".into())),
        );
        register(
            &mut registry,
            "priority",
            OrderExpr::Column(ColumnRef::VisibilityList("priority".into())),
        );
        register(
            &mut registry,
            "recommended",
            OrderExpr::Column(ColumnRef::VisibilityList("recommended".into())),
        );
        register(
            &mut registry,
            "discount",
            OrderExpr::Sql(Arc::new(|scope| {
                format!(
                    "({} - {})",
                    scope.price_column("price_before_discount"),
                    scope.price_column("price")
                )
            })),
        );
        registry
    }

    pub fn register(&mut self, name: &str, expr: OrderExpr) -> Result<(), EngineError> {
        if self.entries.contains_key(name) {
            return Err(EngineError::configuration(format!(
                "sort `{name}` is already registered"
            )));
        }
        self.entries.insert(name.to_string(), expr);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&OrderExpr> {
        self.entries.get(name)
    }
}

fn id_matches(candidate: Option<i64>, value: &ResolvedValue) -> bool {
    let Some(id) = candidate else {
        return false;
    };
    match value {
        ResolvedValue::Id(expected) => id == *expected,
        ResolvedValue::IdSet(set) => set.contains(&id),
        _ => false,
    }
}

fn numeric(value: &ResolvedValue) -> Option<f64> {
    match value {
        ResolvedValue::Float(v) => Some(*v),
        ResolvedValue::Int(v) => Some(*v as f64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn row() -> CandidateRow {
        CandidateRow {
            product_id: 1,
            external_id: Uuid::new_v4(),
            producer_id: Some(10),
            display_amount_id: Some(20),
            sold_out: false,
            display_delivery_id: None,
            attribute_values: HashSet::from([100, 101]),
            name: "Walnut Desk".into(),
            code: "WD-100".into(),
            code2: None,
            external_code: Some("EXT-7".into()),
            barcode: None,
            price: Some(250.0),
            price_with_tax: Some(302.5),
        }
    }

    fn eval(registry: &FilterRegistry, name: &str, value: ResolvedValue) -> bool {
        let FilterExpr::Dynamic { predicate, .. } = registry.get(name).expect("registered") else {
            panic!("{name} should be dynamic");
        };
        predicate(&row(), &value, &ActiveLists::default())
    }

    #[test]
    fn producer_filter_matches_by_internal_id() {
        let registry = FilterRegistry::standard();
        assert!(eval(&registry, "producer", ResolvedValue::Id(10)));
        assert!(!eval(&registry, "producer", ResolvedValue::Id(11)));
        assert!(eval(
            &registry,
            "producer",
            ResolvedValue::IdSet(HashSet::from([9, 10]))
        ));
    }

    #[test]
    fn attribute_groups_and_across_or_within() {
        let registry = FilterRegistry::standard();
        // Both groups overlap the row's {100, 101}.
        assert!(eval(
            &registry,
            "attribute_value",
            ResolvedValue::IdGroups(vec![HashSet::from([100, 200]), HashSet::from([101])])
        ));
        // Second group has no overlap.
        assert!(!eval(
            &registry,
            "attribute_value",
            ResolvedValue::IdGroups(vec![HashSet::from([100]), HashSet::from([300])])
        ));
    }

    #[test]
    fn price_bounds() {
        let registry = FilterRegistry::standard();
        assert!(eval(&registry, "price_at_least", ResolvedValue::Float(250.0)));
        assert!(!eval(&registry, "price_at_least", ResolvedValue::Float(250.01)));
        assert!(eval(&registry, "price_at_most", ResolvedValue::Int(300)));
        assert!(!eval(&registry, "price_at_most", ResolvedValue::Int(200)));
    }

    #[test]
    fn search_is_case_insensitive_across_fields() {
        let registry = FilterRegistry::standard();
        assert!(eval(&registry, "search", ResolvedValue::Text("walnut".into())));
        assert!(eval(&registry, "search", ResolvedValue::Text("wd-1".into())));
        assert!(eval(&registry, "search", ResolvedValue::Text("ext-7".into())));
        assert!(!eval(&registry, "search", ResolvedValue::Text("oak".into())));
    }

    #[test]
    fn reserved_and_duplicate_names_rejected() {
        let mut registry = FilterRegistry::standard();
        let expr = FilterExpr::Column(ColumnRef::Plain("sold_out".into()));
        assert!(registry.register(CATEGORY_FILTER, expr.clone()).is_err());
        assert!(registry.register("producer", expr.clone()).is_err());
        assert!(registry.register("my_filter", expr).is_ok());
    }

    #[test]
    fn scope_coalesces_in_priority_order() {
        let active = ActiveLists {
            price_lists: vec![3, 7],
            visibility_lists: vec![5],
        };
        let scope = SqlScope::new("p", &active);
        assert_eq!(
            scope.price_column("price"),
            "COALESCE(p.p3_price, p.p7_price)"
        );
        assert_eq!(scope.visibility_column("hidden"), "p.v5_hidden");
        assert_eq!(
            scope.render(&ColumnRef::Plain("sold_out".into())),
            "p.sold_out"
        );
    }
}
