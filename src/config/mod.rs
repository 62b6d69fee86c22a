//! Engine configuration.
//!
//! The cache schema is generated from this configuration at build time: one
//! column per category type, a five-column group per visibility list and a
//! four-column group per price list. The number of lists is fixed per
//! deployment, not per compile, so the configuration is validated once and
//! then treated as immutable by both the builder and the query engine.

use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EngineError;

const DEFAULT_WARMING_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_INSERT_CHUNK_ROWS: usize = 20_000;

/// A configured price list. Prices are resolved upstream; the engine only
/// needs the list identity and its activity window to decide which entries
/// participate in a build.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceListConfig {
    pub id: i64,
    pub external_id: Uuid,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_to: Option<OffsetDateTime>,
}

impl PriceListConfig {
    /// Whether the list participates in a build starting at `now`.
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        if !self.active {
            return false;
        }
        if let Some(from) = self.valid_from
            && now < from
        {
            return false;
        }
        if let Some(to) = self.valid_to
            && now > to
        {
            return false;
        }
        true
    }
}

/// A configured visibility list (per-audience hidden/priority flags).
#[derive(Debug, Clone, Deserialize)]
pub struct VisibilityListConfig {
    pub id: i64,
    pub external_id: Uuid,
}

/// A configured category type. Each product resolves at most one primary
/// category per type.
#[derive(Debug, Clone, Deserialize)]
pub struct CategoryTypeConfig {
    pub id: i64,
    pub external_id: Uuid,
}

/// Immutable-after-init engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub price_lists: Vec<PriceListConfig>,
    pub visibility_lists: Vec<VisibilityListConfig>,
    pub category_types: Vec<CategoryTypeConfig>,
    /// A slot stuck in `warming` longer than this is presumed crashed and
    /// reset to `empty` on the next scheduling decision.
    #[serde(default = "default_warming_timeout_secs")]
    pub warming_timeout_secs: u64,
    /// Upper bound on rows per bulk insert. The effective chunk is further
    /// capped by the SQLite bind-parameter budget.
    #[serde(default = "default_insert_chunk_rows")]
    pub insert_chunk_rows: usize,
}

fn default_true() -> bool {
    true
}

fn default_warming_timeout_secs() -> u64 {
    DEFAULT_WARMING_TIMEOUT_SECS
}

fn default_insert_chunk_rows() -> usize {
    DEFAULT_INSERT_CHUNK_ROWS
}

impl EngineConfig {
    /// Validate list identities. Column names are derived from the numeric
    /// ids, so duplicates would collide in the generated schema.
    pub fn validate(&self) -> Result<(), EngineError> {
        check_unique("price list", self.price_lists.iter().map(|list| list.id))?;
        check_unique(
            "visibility list",
            self.visibility_lists.iter().map(|list| list.id),
        )?;
        check_unique("category type", self.category_types.iter().map(|ct| ct.id))?;
        if self.insert_chunk_rows == 0 {
            return Err(EngineError::configuration(
                "insert_chunk_rows must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn has_price_list(&self, id: i64) -> bool {
        self.price_lists.iter().any(|list| list.id == id)
    }

    pub fn has_visibility_list(&self, id: i64) -> bool {
        self.visibility_lists.iter().any(|list| list.id == id)
    }

    /// Price lists participating in a build starting at `now`.
    pub fn valid_price_lists(&self, now: OffsetDateTime) -> Vec<&PriceListConfig> {
        self.price_lists
            .iter()
            .filter(|list| list.is_valid_at(now))
            .collect()
    }

    pub fn warming_timeout(&self) -> time::Duration {
        time::Duration::seconds(self.warming_timeout_secs as i64)
    }
}

fn check_unique(kind: &str, ids: impl Iterator<Item = i64>) -> Result<(), EngineError> {
    let mut seen = std::collections::HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(EngineError::configuration(format!(
                "duplicate {kind} id {id}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn price_list(id: i64) -> PriceListConfig {
        PriceListConfig {
            id,
            external_id: Uuid::new_v4(),
            active: true,
            valid_from: None,
            valid_to: None,
        }
    }

    fn config_with_lists(ids: &[i64]) -> EngineConfig {
        EngineConfig {
            price_lists: ids.iter().map(|&id| price_list(id)).collect(),
            visibility_lists: vec![],
            category_types: vec![],
            warming_timeout_secs: DEFAULT_WARMING_TIMEOUT_SECS,
            insert_chunk_rows: DEFAULT_INSERT_CHUNK_ROWS,
        }
    }

    #[test]
    fn duplicate_price_list_ids_rejected() {
        let config = config_with_lists(&[1, 2, 1]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn unique_ids_accepted() {
        let config = config_with_lists(&[1, 2, 3]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn price_list_validity_window() {
        let mut list = price_list(1);
        list.valid_from = Some(datetime!(2026-01-01 00:00 UTC));
        list.valid_to = Some(datetime!(2026-12-31 00:00 UTC));

        assert!(!list.is_valid_at(datetime!(2025-06-01 00:00 UTC)));
        assert!(list.is_valid_at(datetime!(2026-06-01 00:00 UTC)));
        assert!(!list.is_valid_at(datetime!(2027-06-01 00:00 UTC)));

        list.active = false;
        assert!(!list.is_valid_at(datetime!(2026-06-01 00:00 UTC)));
    }
}
