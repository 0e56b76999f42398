//! Core domain model for the apartment listing hunter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "alh-core";

/// Canonical persisted listing record.
///
/// `canonical_id` is the absolute listing URL and is the unique identity used
/// for deduplication. A listing with an empty `canonical_id` has no stable
/// identity and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub canonical_id: String,
    pub address: String,
    /// Monthly rent in whole dollars.
    pub rent: u32,
    /// Display form of the neighborhood ("East Harlem").
    pub neighborhood: String,
    /// Hyphenated lowercase slug ("east-harlem") used when issuing fetches.
    pub neighborhood_slug: String,
    pub image_url: String,
    pub no_fee: bool,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub contacted_at: Option<DateTime<Utc>>,
}

impl NormalizedListing {
    pub fn has_identity(&self) -> bool {
        !self.canonical_id.is_empty()
    }
}

/// A listing plus its derived ranking data.
///
/// The score is recomputed on read from the current criteria so that
/// criteria changes re-rank existing data without a migration; it is never
/// persisted as authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredListing {
    #[serde(flatten)]
    pub listing: NormalizedListing,
    /// Desirability score in `[0, 100]`.
    pub score: u8,
    /// Whether annual income covers 40x the monthly rent.
    pub passes_budget_rule: bool,
    pub budget: BudgetBreakdown,
}

/// One crawlable sub-market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTarget {
    pub slug: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Immutable search criteria snapshot for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub min_rent: u32,
    pub max_rent: u32,
    pub bedrooms: u32,
    /// Annual gross income, drives the 40x affordability rule.
    pub income: u32,
    pub targets: Vec<SearchTarget>,
    #[serde(default)]
    pub no_fee_preferred: bool,
}

impl SearchCriteria {
    /// The 40x-rule rent ceiling: the highest rent the income supports.
    pub fn affordability_ceiling(&self) -> u32 {
        self.income / 40
    }

    pub fn passes_budget_rule(&self, rent: u32) -> bool {
        self.income as u64 >= rent as u64 * 40
    }

    pub fn rent_in_range(&self, rent: u32) -> bool {
        rent >= self.min_rent && rent <= self.max_rent
    }

    /// Enabled targets in configured order.
    pub fn enabled_targets(&self) -> impl Iterator<Item = &SearchTarget> {
        self.targets.iter().filter(|t| t.enabled)
    }
}

/// Operator identity used for inquiry form fill and message generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    pub availability: String,
}

/// Fixed monthly cost assumptions behind the budget residual calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub take_home: u32,
    pub utilities: u32,
    pub groceries: u32,
    pub transport: u32,
    pub target_dining: u32,
    pub target_savings: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            take_home: 5250,
            utilities: 150,
            groceries: 400,
            transport: 132,
            target_dining: 500,
            target_savings: 1000,
        }
    }
}

impl BudgetConfig {
    /// Utilities + groceries + transport.
    pub fn fixed_costs(&self) -> u32 {
        self.utilities + self.groceries + self.transport
    }
}

/// Monthly residuals for a given rent. Dining and savings are floor-clamped
/// at zero; an over-budget rent reports zero discretionary spend rather than
/// a negative number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetBreakdown {
    pub rent: u32,
    pub utilities: u32,
    pub groceries: u32,
    pub transport: u32,
    pub dining: u32,
    pub savings: u32,
    pub total_expenses: u32,
}

/// Lifecycle state of one inquiry task.
///
/// Transitions are driven solely by the inquiry sequencer. `Confirmed`,
/// `Skipped` and `Failed` are terminal and never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InquiryState {
    Pending,
    Navigated,
    FormFound,
    FormFilled,
    AwaitingReview,
    Confirmed,
    Skipped,
    Failed,
}

impl InquiryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Skipped | Self::Failed)
    }
}

/// A per-listing inquiry with its current state and, for skipped or failed
/// tasks, the reported reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InquiryTask {
    pub listing: NormalizedListing,
    pub state: InquiryState,
    #[serde(default)]
    pub detail: Option<String>,
}

impl InquiryTask {
    pub fn new(listing: NormalizedListing) -> Self {
        Self {
            listing,
            state: InquiryState::Pending,
            detail: None,
        }
    }
}

/// Convert a hyphenated lowercase slug into space-separated title case for
/// display. The slug form remains the fetch identity.
pub fn slug_to_display(slug: &str) -> String {
    slug.split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    let mut s = String::new();
                    s.extend(first.to_uppercase());
                    s.push_str(chars.as_str());
                    s
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> SearchCriteria {
        SearchCriteria {
            min_rent: 2400,
            max_rent: 3200,
            bedrooms: 1,
            income: 110_000,
            targets: vec![
                SearchTarget { slug: "east-harlem".into(), enabled: true },
                SearchTarget { slug: "inwood".into(), enabled: false },
            ],
            no_fee_preferred: true,
        }
    }

    #[test]
    fn budget_rule_boundary() {
        let c = criteria();
        assert!(c.passes_budget_rule(2600));
        // 110000 / 40 == 2750 exactly.
        assert!(c.passes_budget_rule(2750));
        assert!(!c.passes_budget_rule(2751));
        assert!(!c.passes_budget_rule(3200));
        assert!(c.passes_budget_rule(0));
        assert_eq!(c.affordability_ceiling(), 2750);
    }

    #[test]
    fn only_enabled_targets_are_iterated() {
        let c = criteria();
        let slugs: Vec<_> = c.enabled_targets().map(|t| t.slug.as_str()).collect();
        assert_eq!(slugs, vec!["east-harlem"]);
    }

    #[test]
    fn slug_title_casing() {
        assert_eq!(slug_to_display("east-harlem"), "East Harlem");
        assert_eq!(slug_to_display("upper-east-side"), "Upper East Side");
        assert_eq!(slug_to_display("yorkville"), "Yorkville");
        assert_eq!(slug_to_display(""), "");
    }

    #[test]
    fn terminal_states() {
        assert!(InquiryState::Confirmed.is_terminal());
        assert!(InquiryState::Skipped.is_terminal());
        assert!(InquiryState::Failed.is_terminal());
        assert!(!InquiryState::AwaitingReview.is_terminal());
        assert!(!InquiryState::Pending.is_terminal());
    }
}
