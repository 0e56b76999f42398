//! End-to-end pipeline runs against scripted fetch/session collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alh_core::{InquiryState, NormalizedListing, Profile, SearchCriteria, SearchTarget};
use alh_pipeline::{
    search_url, CrawlOrchestrator, CrawlSettings, EventHub, HuntConfig, InquirySequencer,
    RunEvent, RunState,
};
use alh_storage::{
    BrowserSession, FetchError, ListingStore, Locator, PageFetcher, SessionError,
};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

const PAGE_EAST_HARLEM: &str = r#"<html><body>
  <div class="listingCard">
    <address>344 East 110th Street #6D</address>
    <span class="price">$2,650</span>
    <span class="NoFeeBadge">NO FEE</span>
    <a href="/rental/101">View</a>
    <img src="https://photos.test/101.jpg">
  </div>
  <div class="listingCard">
    <address>200 East 105th Street</address>
    <span class="price">$2,500</span>
    <a href="/rental/202">View</a>
  </div>
  <div class="listingCard">
    <address>Pricey Tower PH</address>
    <span class="price">$3,900</span>
    <a href="/rental/303">View</a>
  </div>
  <div class="listingCard">
    <address>Already Known Ct</address>
    <span class="price">$2,700</span>
    <a href="/rental/900">View</a>
  </div>
</body></html>"#;

const PAGE_YORKVILLE: &str = r#"<html><body>
  <div class="listingCard">
    <address>200 East 105th Street</address>
    <span class="price">$2,500</span>
    <a href="/rental/202">View</a>
  </div>
  <div class="listingCard">
    <address>88 York Ave #2B</address>
    <span class="price">$3,000</span>
    <a href="/rental/404">View</a>
  </div>
</body></html>"#;

struct ScriptedFetcher {
    pages: HashMap<String, String>,
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        url: &str,
        _wait_for_any: &[&str],
        timeout: Duration,
    ) -> Result<String, FetchError> {
        match self.pages.get(url) {
            Some(html) => Ok(html.clone()),
            None => Err(FetchError::Timeout {
                url: url.to_string(),
                waited: timeout,
            }),
        }
    }
}

fn criteria(targets: &[&str]) -> SearchCriteria {
    SearchCriteria {
        min_rent: 2400,
        max_rent: 3200,
        bedrooms: 1,
        income: 110_000,
        targets: targets
            .iter()
            .map(|slug| SearchTarget {
                slug: slug.to_string(),
                enabled: true,
            })
            .collect(),
        no_fee_preferred: true,
    }
}

fn config(dir: &TempDir, targets: &[&str], max_per_target: usize) -> Arc<HuntConfig> {
    Arc::new(HuntConfig {
        criteria: criteria(targets),
        profile: Profile {
            name: "Ishan".into(),
            email: "ishan@example.com".into(),
            phone: String::new(),
            availability: "weekdays after 5:30pm or weekends anytime".into(),
        },
        budget: Default::default(),
        crawl: CrawlSettings {
            base_origin: "https://s.test".into(),
            delay_min_ms: 0,
            delay_max_ms: 0,
            max_per_target,
            fetch_timeout_secs: 1,
            review_wait_secs: 0,
            ..Default::default()
        },
        store_path: dir.path().join("tracked.json"),
    })
}

fn scripted_fetcher(config: &HuntConfig) -> ScriptedFetcher {
    let mut pages = HashMap::new();
    pages.insert(
        search_url(&config.crawl.base_origin, "east-harlem", &config.criteria),
        PAGE_EAST_HARLEM.to_string(),
    );
    pages.insert(
        search_url(&config.crawl.base_origin, "yorkville", &config.criteria),
        PAGE_YORKVILLE.to_string(),
    );
    // No page registered for "harlem": that target fetch times out.
    ScriptedFetcher { pages }
}

fn seeded_listing() -> NormalizedListing {
    NormalizedListing {
        canonical_id: "https://s.test/rental/900".into(),
        address: "Already Known Ct".into(),
        rent: 2700,
        neighborhood: "East Harlem".into(),
        neighborhood_slug: "east-harlem".into(),
        image_url: String::new(),
        no_fee: false,
        discovered_at: Utc::now(),
        contacted_at: None,
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn crawl_dedups_filters_and_survives_target_failure() {
    let dir = TempDir::new().expect("tempdir");
    let config = config(&dir, &["east-harlem", "yorkville", "harlem"], 10);
    let store = ListingStore::new(&config.store_path);
    store
        .append_batch(&[seeded_listing()])
        .await
        .expect("seed store");

    let hub = EventHub::new();
    let mut rx = hub.subscribe();
    let orchestrator = CrawlOrchestrator::new(config.clone(), hub);
    let fetcher = scripted_fetcher(&config);

    let summary = orchestrator.run(&fetcher).await.expect("run");

    // 101 + 202 + 404 are new and in range; 303 is out of range, 900 is a
    // store duplicate, and 202's second appearance is an in-run duplicate.
    assert_eq!(summary.total_found, 3);
    assert_eq!(summary.appended, 3);
    assert_eq!(summary.passing_budget_rule, 2);
    assert_eq!(summary.targets_crawled, 3);
    assert_eq!(summary.targets_failed, 1);
    assert_eq!(orchestrator.state(), RunState::Completed);

    let stored = store.load_all().await.expect("load");
    assert_eq!(stored.len(), 4);
    let ids: Vec<_> = stored.iter().map(|l| l.canonical_id.as_str()).collect();
    assert!(ids.contains(&"https://s.test/rental/101"));
    assert!(ids.contains(&"https://s.test/rental/202"));
    assert!(ids.contains(&"https://s.test/rental/404"));
    assert!(!ids.contains(&"https://s.test/rental/303"), "out-of-range rent must never be stored");
    assert_eq!(
        ids.iter()
            .filter(|&&id| id == "https://s.test/rental/202")
            .count(),
        1
    );

    let events = drain(&mut rx);
    let found: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::ListingFound { listing, .. } => Some(listing),
            _ => None,
        })
        .collect();
    assert_eq!(found.len(), 3);
    let no_fee = found
        .iter()
        .find(|l| l.listing.canonical_id.ends_with("/rental/101"))
        .expect("listing 101");
    assert!(no_fee.listing.no_fee);
    assert_eq!(no_fee.listing.neighborhood, "East Harlem");

    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::TargetFailed { target, .. } if target == "harlem"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::RunComplete { total_found: 3, passing_budget_rule: 2, .. }
    )));
    let progress_count = events
        .iter()
        .filter(|e| matches!(e, RunEvent::Progress { .. }))
        .count();
    assert_eq!(progress_count, 3, "one progress event per enabled target");
}

#[tokio::test]
async fn fragment_cap_truncates_oldest_first() {
    let dir = TempDir::new().expect("tempdir");
    let config = config(&dir, &["east-harlem"], 1);
    let hub = EventHub::new();
    let orchestrator = CrawlOrchestrator::new(config.clone(), hub);
    let fetcher = scripted_fetcher(&config);

    let summary = orchestrator.run(&fetcher).await.expect("run");

    // Only the first card in document order survives the cap.
    assert_eq!(summary.total_found, 1);
    let stored = ListingStore::new(&config.store_path)
        .load_all()
        .await
        .expect("load");
    assert_eq!(stored[0].canonical_id, "https://s.test/rental/101");
}

#[tokio::test]
async fn rerun_finds_nothing_new() {
    let dir = TempDir::new().expect("tempdir");
    let config = config(&dir, &["east-harlem", "yorkville"], 10);
    let hub = EventHub::new();
    let orchestrator = CrawlOrchestrator::new(config.clone(), hub);
    let fetcher = scripted_fetcher(&config);

    let first = orchestrator.run(&fetcher).await.expect("first run");
    assert_eq!(first.total_found, 4);

    // Same pages again: every identity is already persisted.
    let second = orchestrator.run(&fetcher).await.expect("second run");
    assert_eq!(second.total_found, 0);
    assert_eq!(second.appended, 0);

    let stored = ListingStore::new(&config.store_path)
        .load_all()
        .await
        .expect("load");
    assert_eq!(stored.len(), 4);
}

#[derive(Default)]
struct ScriptedSession {
    contact_present: bool,
    fail_navigation_for: Option<String>,
    navigated: Vec<String>,
    fill_requests: Vec<(Vec<String>, String)>,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        if let Some(needle) = &self.fail_navigation_for {
            if url.contains(needle.as_str()) {
                return Err(SessionError::Navigation {
                    url: url.to_string(),
                    message: "renderer crashed".into(),
                });
            }
        }
        self.navigated.push(url.to_string());
        Ok(())
    }

    async fn find_any(&mut self, locators: &[Locator]) -> Result<Option<Locator>, SessionError> {
        if self.contact_present {
            Ok(locators.first().cloned())
        } else {
            Ok(None)
        }
    }

    async fn click(&mut self, _locator: &Locator) -> Result<(), SessionError> {
        Ok(())
    }

    async fn fill_any(
        &mut self,
        locators: &[Locator],
        value: &str,
    ) -> Result<bool, SessionError> {
        self.fill_requests.push((
            locators.iter().map(|l| l.css.clone()).collect(),
            value.to_string(),
        ));
        Ok(true)
    }
}

#[tokio::test]
async fn inquiry_confirms_and_stamps_contacted() {
    let dir = TempDir::new().expect("tempdir");
    let config = config(&dir, &["east-harlem"], 10);
    let store = ListingStore::new(&config.store_path);
    store
        .append_batch(&[seeded_listing()])
        .await
        .expect("seed");

    let hub = EventHub::new();
    let mut rx = hub.subscribe();
    let sequencer = InquirySequencer::new(config.clone(), hub);
    let mut session = ScriptedSession {
        contact_present: true,
        ..Default::default()
    };

    let summary = sequencer
        .run(&mut session, &[seeded_listing()])
        .await
        .expect("run");
    assert_eq!(summary.confirmed, 1);
    assert_eq!(summary.tasks[0].state, InquiryState::Confirmed);
    assert!(summary.tasks[0].listing.contacted_at.is_some());

    let stored = store.load_all().await.expect("load");
    assert!(stored[0].contacted_at.is_some());

    // Empty profile phone: the phone field list is never requested.
    assert!(session
        .fill_requests
        .iter()
        .all(|(lists, _)| !lists.iter().any(|css| css.contains("phone"))));
    // Message, name and email were filled.
    assert_eq!(session.fill_requests.len(), 3);
    assert!(session.fill_requests[0].1.contains("Already Known Ct"));

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, RunEvent::InquiryReady { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::InquiriesComplete { confirmed: 1, skipped: 0, failed: 0, .. }
    )));
}

#[tokio::test]
async fn inquiry_without_affordance_skips_before_form_found() {
    let dir = TempDir::new().expect("tempdir");
    let config = config(&dir, &["east-harlem"], 10);
    let hub = EventHub::new();
    let mut rx = hub.subscribe();
    let sequencer = InquirySequencer::new(config.clone(), hub);
    let mut session = ScriptedSession::default();

    let summary = sequencer
        .run(&mut session, &[seeded_listing()])
        .await
        .expect("run");
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.tasks[0].state, InquiryState::Skipped);
    assert!(summary.tasks[0]
        .detail
        .as_deref()
        .expect("reason")
        .contains("no contact affordance"));

    // Pending → Navigated → Skipped: the task never visits FormFound.
    let visited: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            RunEvent::InquiryProgress { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(visited, vec![InquiryState::Navigated, InquiryState::Skipped]);
}

#[tokio::test]
async fn inquiry_fault_fails_one_task_and_batch_continues() {
    let dir = TempDir::new().expect("tempdir");
    let config = config(&dir, &["east-harlem"], 10);
    let store = ListingStore::new(&config.store_path);

    let healthy = seeded_listing();
    let mut doomed = seeded_listing();
    doomed.canonical_id = "https://s.test/rental/666".into();
    doomed.address = "Haunted House".into();
    store
        .append_batch(&[doomed.clone(), healthy.clone()])
        .await
        .expect("seed");

    let hub = EventHub::new();
    let sequencer = InquirySequencer::new(config.clone(), hub);
    let mut session = ScriptedSession {
        contact_present: true,
        fail_navigation_for: Some("/rental/666".into()),
        ..Default::default()
    };

    let summary = sequencer
        .run(&mut session, &[doomed, healthy])
        .await
        .expect("run");
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.confirmed, 1);
    assert_eq!(summary.tasks[0].state, InquiryState::Failed);
    assert!(summary.tasks[0]
        .detail
        .as_deref()
        .expect("fault")
        .contains("renderer crashed"));
    assert_eq!(summary.tasks[1].state, InquiryState::Confirmed);
}
