//! Core domain types for the cache engine.

pub mod catalog;
pub mod types;

pub use types::{
    ActiveLists, CandidateRow, EntityKind, Facet, PriceTuple, VisibilityTuple,
};
