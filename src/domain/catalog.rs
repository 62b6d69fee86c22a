//! Upstream catalog source boundary.
//!
//! The builder consumes already-resolved catalog data through this trait:
//! products with price-list entries, visibility entries, attribute values
//! and category assignments, plus relation records and category ancestor
//! paths. The engine treats the source as a read-only snapshot and never
//! mutates business data.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

use super::types::{EntityKind, PriceTuple, VisibilityTuple};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog source error: {message}")]
    Source { message: String },
    #[error("unknown category {category_id}")]
    UnknownCategory { category_id: i64 },
}

impl CatalogError {
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
        }
    }
}

/// A display-amount bucket assignment. The sold-out flag on the cache row
/// is derived from the bucket's amount at build time.
#[derive(Debug, Clone, Copy)]
pub struct AmountBucket {
    pub id: i64,
    pub amount: f64,
}

/// One candidate product as provided by the upstream catalog.
#[derive(Debug, Clone)]
pub struct ProductSource {
    pub id: i64,
    pub external_id: Uuid,
    pub producer_id: Option<i64>,
    pub display_amount: Option<AmountBucket>,
    pub display_delivery_id: Option<i64>,
    pub name: String,
    pub code: String,
    pub code2: Option<String>,
    pub external_code: Option<String>,
    pub barcode: Option<String>,
    pub attribute_value_ids: Vec<i64>,
    /// Resolved prices keyed by price-list id.
    pub prices: HashMap<i64, PriceTuple>,
    /// Visibility flags keyed by visibility-list id.
    pub visibility: HashMap<i64, VisibilityTuple>,
    /// Primary category keyed by category-type id.
    pub primary_categories: HashMap<i64, i64>,
    /// Directly tagged categories; ancestor chains are resolved via
    /// [`CatalogSource::category_ancestors`].
    pub category_ids: Vec<i64>,
}

/// One product-to-product relation instance.
#[derive(Debug, Clone)]
pub struct RelationSource {
    pub master_id: i64,
    pub slave_id: i64,
    pub relation_type_id: i64,
    pub priority: i64,
    pub quantity: f64,
    pub hidden: bool,
    pub systemic: bool,
    pub discount_percent: Option<f64>,
    pub master_price_share: Option<f64>,
}

/// Internal-to-external id mapping for one entity.
#[derive(Debug, Clone, Copy)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
    pub external_id: Uuid,
}

/// Read-only snapshot access to the upstream catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Stream all candidate products.
    fn stream_products(&self) -> BoxStream<'_, Result<ProductSource, CatalogError>>;

    /// Stream all relation records.
    fn stream_relations(&self) -> BoxStream<'_, Result<RelationSource, CatalogError>>;

    /// The ancestor chain of a category, including the category itself.
    /// Order is irrelevant to the builder; membership is a set union.
    async fn category_ancestors(&self, category_id: i64) -> Result<Vec<i64>, CatalogError>;

    /// Internal-to-external id mappings for every entity the cache refers
    /// to. Written into the per-slot lookup table for response translation.
    async fn entity_refs(&self) -> Result<Vec<EntityRef>, CatalogError>;
}
