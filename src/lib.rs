//! Faceted product cache and search engine for storefront catalogs.
//!
//! The engine maintains exactly two physical copies ("slots") of a
//! denormalized catalog snapshot so that one copy can be rebuilt while the
//! other keeps serving queries. A rebuild streams the upstream catalog into
//! flat, query-optimized tables; queries combine SQL pushdown predicates
//! with per-row dynamic filters to produce ordered product ids, facet
//! counts with self-exclusion semantics, and price bounds.
//!
//! Entry points:
//! - [`state::SlotStore`] — the two-slot state machine (install, warm,
//!   promote, serve).
//! - [`builder::CacheBuilder`] — rebuilds a slot from a
//!   [`domain::catalog::CatalogSource`].
//! - [`query::QueryEngine`] — answers filter/sort/facet queries against the
//!   serving slot.

pub mod builder;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod query;
pub mod registry;
pub mod state;

pub use builder::{BuildReport, CacheBuilder, RebuildOutcome};
pub use config::EngineConfig;
pub use error::EngineError;
pub use query::{QueryEngine, QueryOutcome, QueryRequest, QueryResult};
pub use registry::{FilterRegistry, FilterValue, OrderRegistry, SortDirection};
pub use state::{SlotId, SlotState, SlotStore};
