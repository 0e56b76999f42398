//! Crawl and inquiry pipeline orchestration.
//!
//! One run owns its dedup set and result batch from trigger to terminal
//! state; targets and listings are processed strictly sequentially because
//! the rendering session is not safely shared across concurrent
//! navigations. Per-item faults (one target, one listing, one field) are
//! converted into skips; only failing to acquire the session itself is
//! run-fatal.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alh_core::{
    BudgetBreakdown, BudgetConfig, InquiryState, InquiryTask, NormalizedListing, Profile,
    ScoredListing, SearchCriteria,
};
use alh_extract::{extract_raw, normalize, ListingPage, NormalizeContext, NormalizeOutcome};
use alh_storage::{
    BrowserSession, HttpPageFetcher, ListingStore, Locator, PageFetcher, PageFetcherConfig,
    SessionError, StoreError,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "alh-pipeline";

// Scoring weights. Empirical constants carried over from the source
// criteria; the total of all components is exactly 100.
pub const AFFORDABILITY_WEIGHT: f64 = 40.0;
pub const DINING_TARGET_POINTS: f64 = 15.0;
pub const SAVINGS_TARGET_POINTS: f64 = 15.0;
pub const PRICE_POSITION_WEIGHT: f64 = 20.0;
pub const NO_FEE_BONUS: f64 = 10.0;

/// Share of post-fixed-cost income allotted to dining before savings.
pub const DINING_SPLIT: f64 = 0.5;

/// Monthly residuals for a given rent. Pure; clamping, not erroring, is the
/// policy for over-budget rents.
pub fn budget(rent: u32, cfg: &BudgetConfig) -> BudgetBreakdown {
    let after_fixed = cfg.take_home as i64 - rent as i64 - cfg.fixed_costs() as i64;
    let dining_raw = (after_fixed as f64 * DINING_SPLIT).max(0.0).round();
    let dining = dining_raw.min(cfg.target_dining as f64) as u32;
    let savings = (after_fixed - dining as i64).max(0) as u32;
    BudgetBreakdown {
        rent,
        utilities: cfg.utilities,
        groceries: cfg.groceries,
        transport: cfg.transport,
        dining,
        savings,
        total_expenses: rent + cfg.fixed_costs() + dining,
    }
}

/// Affordability component: one linear ramp worth up to
/// [`AFFORDABILITY_WEIGHT`] points. 20 exactly at the 40x ceiling, growing
/// with margin below it, degrading linearly above it, floored at 0.
fn affordability_component(rent: u32, ceiling: u32) -> f64 {
    if ceiling == 0 {
        return 0.0;
    }
    let span = 2.0 * ceiling as f64;
    (AFFORDABILITY_WEIGHT * (span - rent as f64) / span).clamp(0.0, AFFORDABILITY_WEIGHT)
}

/// Price-position component: cheaper within `[min_rent, max_rent]` scores
/// higher; a zero-width range contributes nothing.
fn price_position_component(rent: u32, min_rent: u32, max_rent: u32) -> f64 {
    if max_rent <= min_rent {
        return 0.0;
    }
    let ratio = (max_rent as f64 - rent as f64) / (max_rent as f64 - min_rent as f64);
    (PRICE_POSITION_WEIGHT * ratio).clamp(0.0, PRICE_POSITION_WEIGHT)
}

/// Deterministic desirability score in `[0, 100]`. Reproducible bit-for-bit
/// for the same inputs; no randomness.
pub fn score(rent: u32, no_fee: bool, criteria: &SearchCriteria, cfg: &BudgetConfig) -> u8 {
    let residuals = budget(rent, cfg);
    let mut total = affordability_component(rent, criteria.affordability_ceiling());
    if residuals.dining >= cfg.target_dining {
        total += DINING_TARGET_POINTS;
    }
    if residuals.savings >= cfg.target_savings {
        total += SAVINGS_TARGET_POINTS;
    }
    total += price_position_component(rent, criteria.min_rent, criteria.max_rent);
    if no_fee {
        total += NO_FEE_BONUS;
    }
    total.round().clamp(0.0, 100.0) as u8
}

/// Attach the derived score and budget view to a stored listing.
pub fn score_listing(
    listing: &NormalizedListing,
    criteria: &SearchCriteria,
    cfg: &BudgetConfig,
) -> ScoredListing {
    ScoredListing {
        score: score(listing.rent, listing.no_fee, criteria, cfg),
        passes_budget_rule: criteria.passes_budget_rule(listing.rent),
        budget: budget(listing.rent, cfg),
        listing: listing.clone(),
    }
}

/// Score and rank stored listings against the current criteria, best first.
/// Scores are recomputed here on every read so criteria changes re-rank
/// existing data without a migration.
pub fn rank_listings(
    listings: &[NormalizedListing],
    criteria: &SearchCriteria,
    cfg: &BudgetConfig,
) -> Vec<ScoredListing> {
    let mut scored: Vec<_> = listings
        .iter()
        .map(|l| score_listing(l, criteria, cfg))
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(a.listing.rent.cmp(&b.listing.rent))
    });
    scored
}

/// Canonical-id set owned exclusively by the active run. Seeded once per
/// run from the store, then updated synchronously as records are accepted,
/// so revisited pages cannot produce duplicate persisted records.
#[derive(Debug, Default)]
pub struct SeenSet {
    seen: HashSet<String>,
}

impl SeenSet {
    pub fn seed<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            seen: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_new(&self, canonical_id: &str) -> bool {
        !self.seen.contains(canonical_id)
    }

    /// Record an id; returns `false` if it was already known.
    pub fn mark_seen(&mut self, canonical_id: impl Into<String>) -> bool {
        self.seen.insert(canonical_id.into())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Events surfaced to the operator stream. Delivery is fire-and-forget,
/// at-most-once: a lost event never corrupts pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Progress {
        run_id: Uuid,
        target: String,
        percent_complete: u8,
        count_so_far: usize,
    },
    ListingFound {
        run_id: Uuid,
        listing: ScoredListing,
    },
    TargetFailed {
        run_id: Uuid,
        target: String,
        reason: String,
    },
    RunComplete {
        run_id: Uuid,
        total_found: usize,
        passing_budget_rule: usize,
    },
    RunFailed {
        run_id: Uuid,
        reason: String,
    },
    InquiryProgress {
        run_id: Uuid,
        canonical_id: String,
        state: InquiryState,
        detail: Option<String>,
    },
    InquiryReady {
        run_id: Uuid,
        canonical_id: String,
        address: String,
    },
    InquiriesComplete {
        run_id: Uuid,
        confirmed: usize,
        skipped: usize,
        failed: usize,
    },
}

/// Broadcast hub decoupling pipeline execution from observers. Publishing
/// with no (or slow, or lagged) subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<RunEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore send errors (no active receivers).
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a run is already active for this pipeline")]
    Busy,
    #[error("failed to acquire fetch session: {0}")]
    Session(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Single worker slot per pipeline: a trigger while a run is active is
/// rejected, never interleaved onto the shared rendering session.
#[derive(Debug, Clone)]
pub struct RunSlot {
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl RunSlot {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(tokio::sync::Semaphore::new(1)),
        }
    }

    pub fn try_acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit, RunError> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| RunError::Busy)
    }
}

impl Default for RunSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Crawl run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running(usize),
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlSettings {
    /// Site origin search URLs are built on and relative hrefs join against.
    pub base_origin: String,
    pub user_agent: String,
    /// Uniform politeness delay bounds applied before each target fetch.
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    /// Per-target fragment cap, oldest-first truncation.
    pub max_per_target: usize,
    pub fetch_timeout_secs: u64,
    /// Fixed human-review pause before an inquiry is confirmed.
    pub review_wait_secs: u64,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            base_origin: "https://streeteasy.com".to_string(),
            user_agent: PageFetcherConfig::default().user_agent,
            delay_min_ms: 2000,
            delay_max_ms: 5000,
            max_per_target: 10,
            fetch_timeout_secs: 10,
            review_wait_secs: 30,
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("tracked_listings.json")
}

/// Immutable per-run configuration snapshot. Loaded once, shared via `Arc`;
/// a running pipeline never observes mutation. Updates build a new snapshot
/// for the next run.
#[derive(Debug, Clone, Deserialize)]
pub struct HuntConfig {
    pub criteria: SearchCriteria,
    pub profile: Profile,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub crawl: CrawlSettings,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

impl HuntConfig {
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("ALH_STORE_PATH") {
            self.store_path = PathBuf::from(path);
        }
        if let Ok(agent) = std::env::var("ALH_USER_AGENT") {
            self.crawl.user_agent = agent;
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.crawl.fetch_timeout_secs)
    }

    pub fn review_wait(&self) -> Duration {
        Duration::from_secs(self.crawl.review_wait_secs)
    }
}

/// Search-results URL for one target under the active criteria.
pub fn search_url(base_origin: &str, slug: &str, criteria: &SearchCriteria) -> String {
    format!(
        "{base_origin}/for-rent/{slug}/price:{}-{}%7Cbeds:{}",
        criteria.min_rent, criteria.max_rent, criteria.bedrooms
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets_crawled: usize,
    pub targets_failed: usize,
    pub total_found: usize,
    pub passing_budget_rule: usize,
    pub appended: usize,
}

/// Sequences fetch → extract → normalize → dedup → score → emit across the
/// enabled search targets. One background task per external trigger.
pub struct CrawlOrchestrator {
    config: Arc<HuntConfig>,
    store: ListingStore,
    hub: EventHub,
    slot: RunSlot,
    state: Mutex<RunState>,
}

impl CrawlOrchestrator {
    pub fn new(config: Arc<HuntConfig>, hub: EventHub) -> Self {
        let store = ListingStore::new(&config.store_path);
        Self {
            config,
            store,
            hub,
            slot: RunSlot::new(),
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(RunState::Idle)
    }

    fn set_state(&self, state: RunState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    /// Acquire an HTTP fetch session and run. Session acquisition is the
    /// one run-fatal fault.
    pub async fn run_http(&self) -> Result<CrawlSummary, RunError> {
        let fetcher_config = PageFetcherConfig {
            user_agent: self.config.crawl.user_agent.clone(),
            timeout: self.config.fetch_timeout(),
        };
        let fetcher = match HttpPageFetcher::new(&fetcher_config) {
            Ok(fetcher) => fetcher,
            Err(err) => {
                let reason = format!("session acquisition failed: {err:#}");
                self.set_state(RunState::Aborted);
                self.hub.publish(RunEvent::RunFailed {
                    run_id: Uuid::new_v4(),
                    reason: reason.clone(),
                });
                return Err(RunError::Session(reason));
            }
        };
        self.run(&fetcher).await
    }

    /// One full crawl across all enabled targets. A failure on one target
    /// is never fatal to the run; the run reaches `Completed` after the
    /// last target regardless.
    pub async fn run(&self, fetcher: &dyn PageFetcher) -> Result<CrawlSummary, RunError> {
        let _permit = self.slot.try_acquire()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        // Seed the dedup set from every identity already persisted.
        let mut seen = match self.store.load_all().await {
            Ok(existing) => SeenSet::seed(existing.into_iter().map(|l| l.canonical_id)),
            Err(err) => {
                self.set_state(RunState::Aborted);
                self.hub.publish(RunEvent::RunFailed {
                    run_id,
                    reason: err.to_string(),
                });
                return Err(err.into());
            }
        };

        let criteria = &self.config.criteria;
        let targets: Vec<_> = criteria.enabled_targets().cloned().collect();
        let total_targets = targets.len().max(1);

        let mut batch: Vec<NormalizedListing> = Vec::new();
        let mut passing_budget_rule = 0usize;
        let mut targets_failed = 0usize;

        for (index, target) in targets.iter().enumerate() {
            self.set_state(RunState::Running(index));
            self.hub.publish(RunEvent::Progress {
                run_id,
                target: target.slug.clone(),
                percent_complete: (index * 100 / total_targets) as u8,
                count_so_far: batch.len(),
            });

            self.politeness_delay().await;

            let url = search_url(&self.config.crawl.base_origin, &target.slug, criteria);
            debug!(target = %target.slug, %url, "fetching search page");
            let html = match fetcher
                .fetch(&url, alh_extract::FRAGMENT_SELECTORS, self.config.fetch_timeout())
                .await
            {
                Ok(html) => html,
                Err(err) => {
                    warn!(target = %target.slug, error = %err, "target fetch failed");
                    targets_failed += 1;
                    self.hub.publish(RunEvent::TargetFailed {
                        run_id,
                        target: target.slug.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let page = ListingPage::parse(&html);
            let mut fragments = page.fragments();
            if fragments.len() > self.config.crawl.max_per_target {
                fragments.truncate(self.config.crawl.max_per_target);
            }
            info!(target = %target.slug, fragments = fragments.len(), "extracting fragments");

            let ctx = NormalizeContext {
                base_origin: &self.config.crawl.base_origin,
                neighborhood_slug: &target.slug,
                min_rent: criteria.min_rent,
                max_rent: criteria.max_rent,
                now: Utc::now(),
            };

            for fragment in fragments {
                let raw = extract_raw(&fragment);
                let listing = match normalize(&raw, &ctx) {
                    NormalizeOutcome::Accepted(listing) => listing,
                    NormalizeOutcome::OutOfRange { rent } => {
                        debug!(target = %target.slug, rent, "dropped out-of-range listing");
                        continue;
                    }
                    NormalizeOutcome::NoIdentity => {
                        debug!(target = %target.slug, "dropped listing without identity");
                        continue;
                    }
                };

                if !seen.mark_seen(listing.canonical_id.clone()) {
                    debug!(canonical_id = %listing.canonical_id, "dropped duplicate listing");
                    continue;
                }

                let scored = score_listing(&listing, criteria, &self.config.budget);
                if scored.passes_budget_rule {
                    passing_budget_rule += 1;
                }
                self.hub.publish(RunEvent::ListingFound {
                    run_id,
                    listing: scored,
                });
                batch.push(listing);
            }
        }

        let appended = match self.store.append_batch(&batch).await {
            Ok(appended) => appended,
            Err(err) => {
                self.set_state(RunState::Aborted);
                self.hub.publish(RunEvent::RunFailed {
                    run_id,
                    reason: err.to_string(),
                });
                return Err(err.into());
            }
        };

        self.set_state(RunState::Completed);
        self.hub.publish(RunEvent::RunComplete {
            run_id,
            total_found: batch.len(),
            passing_budget_rule,
        });
        info!(
            total_found = batch.len(),
            passing_budget_rule, targets_failed, "crawl run complete"
        );

        Ok(CrawlSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            targets_crawled: targets.len(),
            targets_failed,
            total_found: batch.len(),
            passing_budget_rule,
            appended,
        })
    }

    /// Uniform random delay within the configured bounds. Politeness, not
    /// retry backoff.
    async fn politeness_delay(&self) {
        let (min, max) = (self.config.crawl.delay_min_ms, self.config.crawl.delay_max_ms);
        let ms = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

// Contact affordance and form-field locators, tried in order; the first
// match wins, exactly as with extraction strategies.
const CONTACT_LOCATORS: &[&str] = &[
    "button[data-testid=\"contact-button\"]",
    "button.contact-button",
    "a[href*=\"contact\"]",
    ".listing-agent-contact button",
];
const MESSAGE_LOCATORS: &[&str] = &[
    "textarea[name=\"message\"]",
    "textarea",
    "#message",
    ".message-input",
];
const NAME_LOCATORS: &[&str] = &["input[name=\"name\"]", "#name", "input[placeholder*=\"name\"]"];
const EMAIL_LOCATORS: &[&str] = &["input[name=\"email\"]", "#email", "input[type=\"email\"]"];
const PHONE_LOCATORS: &[&str] = &["input[name=\"phone\"]", "#phone", "input[type=\"tel\"]"];

fn locators(css_list: &[&str]) -> Vec<Locator> {
    css_list.iter().map(|css| Locator::css(*css)).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct InquirySummary {
    pub run_id: Uuid,
    pub processed: usize,
    pub confirmed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub tasks: Vec<InquiryTask>,
}

/// Per-listing state machine driving form discovery, fill, human-review
/// pause and confirmation against a rendered session.
pub struct InquirySequencer {
    config: Arc<HuntConfig>,
    store: ListingStore,
    hub: EventHub,
    slot: RunSlot,
}

impl InquirySequencer {
    pub fn new(config: Arc<HuntConfig>, hub: EventHub) -> Self {
        let store = ListingStore::new(&config.store_path);
        Self {
            config,
            store,
            hub,
            slot: RunSlot::new(),
        }
    }

    /// Drive inquiries for the selected listings. Partial failure of one
    /// listing never blocks the remainder of the batch.
    pub async fn run(
        &self,
        session: &mut dyn BrowserSession,
        selected: &[NormalizedListing],
    ) -> Result<InquirySummary, RunError> {
        let _permit = self.slot.try_acquire()?;
        let run_id = Uuid::new_v4();

        let mut tasks = Vec::with_capacity(selected.len());
        for listing in selected {
            let task = self.process_listing(session, listing, run_id).await;
            tasks.push(task);
        }

        let confirmed = tasks
            .iter()
            .filter(|t| t.state == InquiryState::Confirmed)
            .count();
        let skipped = tasks
            .iter()
            .filter(|t| t.state == InquiryState::Skipped)
            .count();
        let failed = tasks
            .iter()
            .filter(|t| t.state == InquiryState::Failed)
            .count();

        self.hub.publish(RunEvent::InquiriesComplete {
            run_id,
            confirmed,
            skipped,
            failed,
        });
        info!(confirmed, skipped, failed, "inquiry run complete");

        Ok(InquirySummary {
            run_id,
            processed: tasks.len(),
            confirmed,
            skipped,
            failed,
            tasks,
        })
    }

    async fn process_listing(
        &self,
        session: &mut dyn BrowserSession,
        listing: &NormalizedListing,
        run_id: Uuid,
    ) -> InquiryTask {
        let mut task = InquiryTask::new(listing.clone());
        match self.drive(session, &mut task, run_id).await {
            Ok(()) => task,
            Err(err) => {
                // Any unexpected fault fails this task only; the batch
                // proceeds.
                warn!(canonical_id = %listing.canonical_id, error = %err, "inquiry failed");
                self.transition(&mut task, InquiryState::Failed, Some(err.to_string()), run_id);
                task
            }
        }
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        task: &mut InquiryTask,
        run_id: Uuid,
    ) -> Result<(), SessionError> {
        session.navigate(&task.listing.canonical_id).await?;
        self.transition(task, InquiryState::Navigated, None, run_id);

        let Some(contact) = session.find_any(&locators(CONTACT_LOCATORS)).await? else {
            self.transition(
                task,
                InquiryState::Skipped,
                Some("no contact affordance found".to_string()),
                run_id,
            );
            return Ok(());
        };
        session.click(&contact).await?;
        self.transition(task, InquiryState::FormFound, None, run_id);

        let profile = &self.config.profile;
        let message = inquiry_message(
            &task.listing.address,
            None,
            self.config.criteria.bedrooms,
            profile,
        );
        let fills: [(&[&str], &str); 4] = [
            (MESSAGE_LOCATORS, message.as_str()),
            (NAME_LOCATORS, profile.name.as_str()),
            (EMAIL_LOCATORS, profile.email.as_str()),
            (PHONE_LOCATORS, profile.phone.as_str()),
        ];
        for (css_list, value) in fills {
            // Fields whose source value is empty are skipped, not filled.
            if value.is_empty() {
                continue;
            }
            let filled = session.fill_any(&locators(css_list), value).await?;
            if !filled {
                debug!(canonical_id = %task.listing.canonical_id, "form field not present");
            }
        }
        self.transition(task, InquiryState::FormFilled, None, run_id);

        self.hub.publish(RunEvent::InquiryReady {
            run_id,
            canonical_id: task.listing.canonical_id.clone(),
            address: task.listing.address.clone(),
        });
        self.transition(task, InquiryState::AwaitingReview, None, run_id);

        // Bounded, fixed, not extendable; the operator reviews and submits
        // within this window.
        tokio::time::sleep(self.config.review_wait()).await;

        let contacted_at = Utc::now();
        self.store
            .mark_contacted(&task.listing.canonical_id, contacted_at)
            .await
            .map_err(|err| SessionError::Interaction {
                message: format!("recording contacted status: {err}"),
            })?;
        task.listing.contacted_at = Some(contacted_at);
        self.transition(task, InquiryState::Confirmed, None, run_id);
        Ok(())
    }

    fn transition(
        &self,
        task: &mut InquiryTask,
        state: InquiryState,
        detail: Option<String>,
        run_id: Uuid,
    ) {
        task.state = state;
        task.detail = detail.clone();
        self.hub.publish(RunEvent::InquiryProgress {
            run_id,
            canonical_id: task.listing.canonical_id.clone(),
            state,
            detail,
        });
    }
}

/// Standing inquiry message for one listing, personalized when the broker
/// is known.
pub fn inquiry_message(
    address: &str,
    broker_name: Option<&str>,
    bedrooms: u32,
    profile: &Profile,
) -> String {
    let greeting = match broker_name {
        Some(name) if !name.is_empty() => format!("Hi {name},"),
        _ => "Hi,".to_string(),
    };
    format!(
        "{greeting}\n\n\
         I'm interested in the {bedrooms}-bedroom at {address}. A few questions:\n\n\
         1. Is the unit still available for immediate move-in?\n\
         2. Are there any additional fees beyond rent (amenity fees, move-in fees, etc.)?\n\
         3. What are the income/credit requirements for approval?\n\
         4. Is there any flexibility on the lease terms?\n\n\
         I'd love to schedule a viewing at your earliest convenience. I'm available {availability}.\n\n\
         Thanks!\n{name}",
        availability = profile.availability,
        name = profile.name,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMethod {
    FaceTime,
    InPerson,
}

/// Reply to a broker proposing a viewing slot.
pub fn schedule_response(broker: &str, method: ScheduleMethod, profile: &Profile) -> String {
    match method {
        ScheduleMethod::FaceTime => format!(
            "Hi {broker},\n\nThanks for getting back to me! I can't make weekday mornings \
             since I'm working — would you be open to a quick FaceTime tour instead?\n\n\
             Thanks!\n{}",
            profile.name
        ),
        ScheduleMethod::InPerson => format!(
            "Hi {broker},\n\nI'd love to see the unit. Available {availability}.\n\n\
             Thanks!\n{}",
            profile.name,
            availability = profile.availability,
        ),
    }
}

/// Opening offer at a target rent, thousands-separated.
pub fn negotiation_message(broker: &str, target_rent: u32, profile: &Profile) -> String {
    format!(
        "Hi {broker},\n\nThanks for showing me the apartment! I'm very interested. \
         Would you be open to ${rent}/month? I'm ready to sign quickly.\n\n\
         Thanks!\n{}",
        profile.name,
        rent = format_dollars(target_rent),
    )
}

/// Thousands-separated dollar amount ("2600" → "2,600").
pub fn format_dollars(amount: u32) -> String {
    let digits = amount.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
