//! Facet tallies with self-exclusion.
//!
//! A row counts toward a facet's tally when it passes every dynamic filter
//! *except* those belonging to that facet, so the UI can show "pick this
//! value and you'd get N results" next to unselected values of an already
//! constrained dimension. Price bounds follow the same rule with the price
//! facet: they ignore price-range filters but honor everything else.

use std::collections::HashMap;

use crate::domain::types::{CandidateRow, Facet};

/// Outcome of one dynamic filter against one row.
#[derive(Debug, Clone, Copy)]
pub struct DynamicEval {
    pub facet: Option<Facet>,
    pub passed: bool,
}

/// Which facets a row may be counted into, given its filter evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eligibility {
    /// Passed everything: counts in the result set and every facet.
    All,
    /// Failed only filters of a single facet: counts in that facet alone.
    Only(Facet),
    /// Failed a non-facet filter or filters of multiple facets.
    None,
}

fn eligibility(evals: &[DynamicEval]) -> Eligibility {
    let mut failed: Option<Facet> = None;
    for eval in evals {
        if eval.passed {
            continue;
        }
        match (eval.facet, failed) {
            (None, _) => return Eligibility::None,
            (Some(facet), None) => failed = Some(facet),
            (Some(facet), Some(previous)) if facet != previous => return Eligibility::None,
            _ => {}
        }
    }
    match failed {
        None => Eligibility::All,
        Some(facet) => Eligibility::Only(facet),
    }
}

/// Running facet counts and price bounds over a scan, keyed by internal
/// ids. Translation to external identifiers happens after the scan.
#[derive(Debug, Default)]
pub struct FacetAccumulator {
    pub producer_counts: HashMap<i64, u64>,
    pub attribute_value_counts: HashMap<i64, u64>,
    pub display_amount_counts: HashMap<i64, u64>,
    pub display_delivery_counts: HashMap<i64, u64>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub price_with_tax_min: Option<f64>,
    pub price_with_tax_max: Option<f64>,
}

impl FacetAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one row in. Returns whether the row passed all dynamic filters
    /// and belongs in the ordered result list.
    pub fn observe(&mut self, row: &CandidateRow, evals: &[DynamicEval]) -> bool {
        let eligibility = eligibility(evals);
        if eligibility == Eligibility::None {
            return false;
        }

        if self.counts(eligibility, Facet::Producer)
            && let Some(id) = row.producer_id
        {
            *self.producer_counts.entry(id).or_default() += 1;
        }
        if self.counts(eligibility, Facet::AttributeValue) {
            for &id in &row.attribute_values {
                *self.attribute_value_counts.entry(id).or_default() += 1;
            }
        }
        if self.counts(eligibility, Facet::DisplayAmount)
            && let Some(id) = row.display_amount_id
        {
            *self.display_amount_counts.entry(id).or_default() += 1;
        }
        if self.counts(eligibility, Facet::DisplayDelivery)
            && let Some(id) = row.display_delivery_id
        {
            *self.display_delivery_counts.entry(id).or_default() += 1;
        }
        if self.counts(eligibility, Facet::Price) {
            if let Some(price) = row.price {
                self.price_min = Some(self.price_min.map_or(price, |v| v.min(price)));
                self.price_max = Some(self.price_max.map_or(price, |v| v.max(price)));
            }
            if let Some(price) = row.price_with_tax {
                self.price_with_tax_min =
                    Some(self.price_with_tax_min.map_or(price, |v| v.min(price)));
                self.price_with_tax_max =
                    Some(self.price_with_tax_max.map_or(price, |v| v.max(price)));
            }
        }

        eligibility == Eligibility::All
    }

    fn counts(&self, eligibility: Eligibility, facet: Facet) -> bool {
        match eligibility {
            Eligibility::All => true,
            Eligibility::Only(failed) => failed == facet,
            Eligibility::None => false,
        }
    }
}
