//! Field extraction and listing normalization.
//!
//! The fetched markup changes without notice, so every field resolves
//! through an ordered list of extraction strategies: first non-empty result
//! wins, and a failing strategy degrades to the next one (and ultimately
//! the field default) without aborting the rest of the record.

use alh_core::{slug_to_display, NormalizedListing};
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

pub const CRATE_NAME: &str = "alh-extract";

/// Semantic fields resolvable from one listing fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Address,
    Price,
    DetailUrl,
    Image,
    NoFee,
}

/// One named rule for locating a field within a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// Element carrying `data-testid` equal to the given value.
    ByTestId(&'static str),
    /// First descendant whose `class` attribute matches the regex.
    ByClassPattern(&'static str),
    /// First descendant with the given tag name.
    ByTag(&'static str),
    /// First `<a href>` whose href contains the needle; yields the href.
    ByLinkHrefContains(&'static str),
    /// First `<img>` descendant; yields its `src`.
    ByImageSrc,
    /// Fragment text contains the needle (case-insensitive); yields the
    /// needle itself. Used for boolean badge fields.
    ByTextContains(&'static str),
}

/// Result of resolving one field: the value (or the empty string) and
/// whether any strategy matched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extracted {
    pub value: String,
    pub matched: bool,
}

impl Extracted {
    fn hit(value: String) -> Self {
        Self { value, matched: true }
    }
}

/// Fixed priority list of strategies for a field.
pub fn field_plan(kind: FieldKind) -> &'static [ExtractionStrategy] {
    use ExtractionStrategy::*;
    match kind {
        FieldKind::Address => &[ByTag("address"), ByClassPattern("(?i)address")],
        FieldKind::Price => &[ByClassPattern("(?i)price")],
        FieldKind::DetailUrl => &[ByLinkHrefContains("/rental/")],
        FieldKind::Image => &[ByImageSrc],
        FieldKind::NoFee => &[ByClassPattern("(?i)no[-_ ]?fee"), ByTextContains("no fee")],
    }
}

/// Resolve one field from a fragment, walking the field's strategy list in
/// priority order. The first strategy yielding a non-empty value
/// short-circuits the rest.
pub fn extract(fragment: &ElementRef<'_>, kind: FieldKind) -> Extracted {
    for strategy in field_plan(kind) {
        if let Some(value) = apply_strategy(fragment, strategy) {
            return Extracted::hit(value);
        }
    }
    Extracted::default()
}

fn apply_strategy(fragment: &ElementRef<'_>, strategy: &ExtractionStrategy) -> Option<String> {
    match strategy {
        ExtractionStrategy::ByTestId(value) => {
            let selector = Selector::parse(&format!("[data-testid=\"{value}\"]")).ok()?;
            fragment
                .select(&selector)
                .next()
                .and_then(|n| text_or_none(n.text().collect::<String>()))
        }
        ExtractionStrategy::ByClassPattern(pattern) => {
            let re = Regex::new(pattern).ok()?;
            let selector = Selector::parse("*").ok()?;
            fragment
                .select(&selector)
                .find(|el| {
                    el.value()
                        .attr("class")
                        .map(|classes| re.is_match(classes))
                        .unwrap_or(false)
                })
                .and_then(|el| text_or_none(el.text().collect::<String>()))
        }
        ExtractionStrategy::ByTag(tag) => {
            let selector = Selector::parse(tag).ok()?;
            fragment
                .select(&selector)
                .next()
                .and_then(|n| text_or_none(n.text().collect::<String>()))
        }
        ExtractionStrategy::ByLinkHrefContains(needle) => {
            let selector = Selector::parse("a[href]").ok()?;
            fragment
                .select(&selector)
                .filter_map(|n| n.value().attr("href"))
                .find(|href| href.contains(needle))
                .and_then(|href| text_or_none(href.to_string()))
        }
        ExtractionStrategy::ByImageSrc => {
            let selector = Selector::parse("img").ok()?;
            fragment
                .select(&selector)
                .next()
                .and_then(|n| n.value().attr("src"))
                .and_then(|src| text_or_none(src.to_string()))
        }
        ExtractionStrategy::ByTextContains(needle) => {
            let text = fragment.text().collect::<String>().to_ascii_lowercase();
            if text.contains(needle) {
                Some(needle.to_string())
            } else {
                None
            }
        }
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// The resolved field strings for one fragment, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawListing {
    pub address: Extracted,
    pub price_text: Extracted,
    pub detail_url: Extracted,
    pub image_url: Extracted,
    pub no_fee: Extracted,
}

/// Resolve every field of one fragment. Field resolutions are isolated from
/// each other: a miss on one field never affects the others.
pub fn extract_raw(fragment: &ElementRef<'_>) -> RawListing {
    RawListing {
        address: extract(fragment, FieldKind::Address),
        price_text: extract(fragment, FieldKind::Price),
        detail_url: extract(fragment, FieldKind::DetailUrl),
        image_url: extract(fragment, FieldKind::Image),
        no_fee: extract(fragment, FieldKind::NoFee),
    }
}

/// A parsed search-results page.
pub struct ListingPage {
    document: Html,
}

/// Fragment selectors tried in priority order; the site has shipped both.
/// Doubles as the required-element wait set handed to the fetcher.
pub const FRAGMENT_SELECTORS: &[&str] =
    &["div.listingCard", "article[data-testid=\"listing-card\"]"];

impl ListingPage {
    pub fn parse(html: &str) -> Self {
        Self {
            document: Html::parse_document(html),
        }
    }

    /// Listing fragments in document order. Falls back through
    /// [`FRAGMENT_SELECTORS`]; an unmatchable page yields no fragments
    /// rather than an error.
    pub fn fragments(&self) -> Vec<ElementRef<'_>> {
        for raw in FRAGMENT_SELECTORS {
            let Ok(selector) = Selector::parse(raw) else {
                continue;
            };
            let found: Vec<_> = self.document.select(&selector).collect();
            if !found.is_empty() {
                return found;
            }
        }
        Vec::new()
    }
}

/// Context for normalizing fragments of one search target.
#[derive(Debug, Clone)]
pub struct NormalizeContext<'a> {
    /// Site origin relative detail URLs are joined against.
    pub base_origin: &'a str,
    pub neighborhood_slug: &'a str,
    pub min_rent: u32,
    pub max_rent: u32,
    pub now: DateTime<Utc>,
}

/// Outcome of normalizing one raw listing. Rejections are expected filter
/// results, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeOutcome {
    Accepted(NormalizedListing),
    /// Rent falls outside the active `[min_rent, max_rent]` window.
    OutOfRange { rent: u32 },
    /// No resolvable detail URL, so no stable identity to dedup on.
    NoIdentity,
}

const DEFAULT_ADDRESS: &str = "Unknown Address";

/// Assemble extracted fields into a canonical record.
pub fn normalize(raw: &RawListing, ctx: &NormalizeContext<'_>) -> NormalizeOutcome {
    let canonical_id = canonical_url(ctx.base_origin, &raw.detail_url.value);
    if canonical_id.is_empty() {
        return NormalizeOutcome::NoIdentity;
    }

    let rent = parse_rent(&raw.price_text.value);
    if rent < ctx.min_rent || rent > ctx.max_rent {
        return NormalizeOutcome::OutOfRange { rent };
    }

    let address = if raw.address.matched && !raw.address.value.is_empty() {
        raw.address.value.clone()
    } else {
        DEFAULT_ADDRESS.to_string()
    };

    NormalizeOutcome::Accepted(NormalizedListing {
        canonical_id,
        address,
        rent,
        neighborhood: slug_to_display(ctx.neighborhood_slug),
        neighborhood_slug: ctx.neighborhood_slug.to_string(),
        image_url: raw.image_url.value.clone(),
        no_fee: raw.no_fee.matched,
        discovered_at: ctx.now,
        contacted_at: None,
    })
}

/// Strip every non-digit character and parse what remains. An empty result
/// parses to zero.
pub fn parse_rent(price_text: &str) -> u32 {
    let digits: String = price_text.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Resolve a detail href into an absolute canonical URL. Already-absolute
/// URLs pass through unchanged; relative ones are joined against the base
/// origin. Anything unjoinable resolves to the empty string.
pub fn canonical_url(base_origin: &str, href: &str) -> String {
    if href.is_empty() {
        return String::new();
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    Url::parse(base_origin)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .unwrap_or_default()
}
