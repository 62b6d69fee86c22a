use thiserror::Error;

use crate::domain::catalog::CatalogError;

/// Crate-level error for cache build and query operations.
///
/// Configuration and caller errors (unknown filter/sort names, malformed
/// filter values) are programming errors and surface as distinct variants;
/// storage and catalog failures are transient/operational.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported filter `{name}`")]
    UnknownFilter { name: String },
    #[error("unsupported sort `{name}`")]
    UnknownOrder { name: String },
    #[error("invalid value for filter `{name}`: {message}")]
    InvalidFilter { name: String, message: String },
    #[error("price list {id} is not configured")]
    UnknownPriceList { id: i64 },
    #[error("visibility list {id} is not configured")]
    UnknownVisibilityList { id: i64 },
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl EngineError {
    pub fn unknown_filter(name: impl Into<String>) -> Self {
        Self::UnknownFilter { name: name.into() }
    }

    pub fn unknown_order(name: impl Into<String>) -> Self {
        Self::UnknownOrder { name: name.into() }
    }

    pub fn invalid_filter(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFilter {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
