//! Shared value types.
//!
//! Cache rows carry compact internal `i64` identifiers throughout the build
//! and scan paths; external `Uuid` identifiers only appear at the API
//! boundary (filter values in, count maps and product lists out).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of entities tracked in the per-slot id-lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Producer,
    AttributeValue,
    DisplayAmount,
    DisplayDelivery,
    Category,
    RelationType,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Producer => "producer",
            EntityKind::AttributeValue => "attribute_value",
            EntityKind::DisplayAmount => "display_amount",
            EntityKind::DisplayDelivery => "display_delivery",
            EntityKind::Category => "category",
            EntityKind::RelationType => "relation_type",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "product" => Some(EntityKind::Product),
            "producer" => Some(EntityKind::Producer),
            "attribute_value" => Some(EntityKind::AttributeValue),
            "display_amount" => Some(EntityKind::DisplayAmount),
            "display_delivery" => Some(EntityKind::DisplayDelivery),
            "category" => Some(EntityKind::Category),
            "relation_type" => Some(EntityKind::RelationType),
            _ => None,
        }
    }
}

/// Faceted dimensions. Dynamic filters are tagged with the facet they
/// constrain so facet tallies can exclude the facet's own filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facet {
    Producer,
    AttributeValue,
    DisplayAmount,
    DisplayDelivery,
    Price,
}

/// Per-price-list resolved prices for one product. Absent lists are stored
/// as NULL column groups, never zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTuple {
    pub price: f64,
    pub price_with_tax: f64,
    pub price_before_discount: Option<f64>,
    pub price_with_tax_before_discount: Option<f64>,
}

/// Per-visibility-list flags for one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityTuple {
    pub hidden: bool,
    pub hidden_in_menu: bool,
    pub priority: i64,
    pub unavailable: bool,
    pub recommended: bool,
}

/// Request-scoped active list sets, in coalesce priority order: the first
/// list holding a non-null value wins.
#[derive(Debug, Clone, Default)]
pub struct ActiveLists {
    pub price_lists: Vec<i64>,
    pub visibility_lists: Vec<i64>,
}

/// The per-row view handed to dynamic filters during a scan. Prices are
/// already coalesced over the request's active price lists.
#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub product_id: i64,
    pub external_id: Uuid,
    pub producer_id: Option<i64>,
    pub display_amount_id: Option<i64>,
    pub sold_out: bool,
    pub display_delivery_id: Option<i64>,
    pub attribute_values: HashSet<i64>,
    pub name: String,
    pub code: String,
    pub code2: Option<String>,
    pub external_code: Option<String>,
    pub barcode: Option<String>,
    pub price: Option<f64>,
    pub price_with_tax: Option<f64>,
}
