//! Listing tracker store + page fetch boundary.
//!
//! The store is an append-friendly JSON log: existing records are never
//! edited except for contacted status. The fetch side defines the contracts
//! this system consumes from a rendering engine, plus an HTTP-backed
//! default implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alh_core::NormalizedListing;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "alh-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading tracker file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing tracker file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("tracker file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// On-disk shape of the tracker file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackerFile {
    listings: Vec<NormalizedListing>,
}

/// JSON tracker file holding every persisted listing.
#[derive(Debug, Clone)]
pub struct ListingStore {
    path: PathBuf,
}

impl ListingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All persisted listings. A missing file is an empty store.
    pub async fn load_all(&self) -> Result<Vec<NormalizedListing>, StoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => {
                let file: TrackerFile =
                    serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
                        path: self.path.clone(),
                        source,
                    })?;
                Ok(file.listings)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(StoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Append a batch of new listings. Records without a canonical identity
    /// are refused at this boundary and do not count toward the returned
    /// total.
    pub async fn append_batch(
        &self,
        batch: &[NormalizedListing],
    ) -> Result<usize, StoreError> {
        let mut listings = self.load_all().await?;
        let mut appended = 0usize;
        for listing in batch {
            if !listing.has_identity() {
                warn!(address = %listing.address, "refusing listing without canonical id");
                continue;
            }
            listings.push(listing.clone());
            appended += 1;
        }
        self.write_atomic(&TrackerFile { listings }).await?;
        debug!(appended, path = %self.path.display(), "appended listing batch");
        Ok(appended)
    }

    /// Stamp contacted status on one listing. Returns whether the canonical
    /// id was found. No other field of an existing record is ever edited.
    pub async fn mark_contacted(
        &self,
        canonical_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut listings = self.load_all().await?;
        let mut found = false;
        for listing in &mut listings {
            if listing.canonical_id == canonical_id {
                listing.contacted_at = Some(timestamp);
                found = true;
            }
        }
        if found {
            self.write_atomic(&TrackerFile { listings }).await?;
        }
        Ok(found)
    }

    /// Serialize and persist via temp file + atomic rename, so a crash
    /// mid-write never leaves a truncated tracker behind.
    async fn write_atomic(&self, file: &TrackerFile) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(file).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Write {
                        path: self.path.clone(),
                        source,
                    })?;
            }
        }

        let temp_path = self
            .path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        let write = async {
            let mut f = fs::File::create(&temp_path).await?;
            f.write_all(&bytes).await?;
            f.flush().await?;
            drop(f);
            fs::rename(&temp_path, &self.path).await
        };
        match write.await {
            Ok(()) => Ok(()),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Write {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("required element did not appear for {url} within {waited:?}")]
    Timeout { url: String, waited: Duration },
    #[error("http status {status} for {url}")]
    Http { status: u16, url: String },
    #[error("request failed for {url}: {message}")]
    Request { url: String, message: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Rendered-page fetch contract.
///
/// `wait_for_any` is the required-element set: the fetch only succeeds once
/// at least one of the selectors is present in the rendered document, and
/// absence within the timeout reports [`FetchError::Timeout`].
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        wait_for_any: &[&str],
        timeout: Duration,
    ) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct PageFetcherConfig {
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for PageFetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Plain-HTTP implementation of the fetch contract. It cannot wait on
/// client-side rendering, so the required-element condition is checked
/// against the fetched body after the fact; a page that never shipped the
/// element reports the same soft [`FetchError::Timeout`] a render wait
/// would.
#[derive(Debug)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new(config: &PageFetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

/// Whether any selector of the required set matches the document.
pub fn any_selector_present(html: &str, selectors: &[&str]) -> bool {
    if selectors.is_empty() {
        return true;
    }
    let document = Html::parse_document(html);
    selectors.iter().any(|raw| {
        Selector::parse(raw)
            .map(|sel| document.select(&sel).next().is_some())
            .unwrap_or(false)
    })
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(
        &self,
        url: &str,
        wait_for_any: &[&str],
        timeout: Duration,
    ) -> Result<String, FetchError> {
        let span = info_span!("page_fetch", url);
        let _guard = span.enter();

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    FetchError::Timeout {
                        url: url.to_string(),
                        waited: timeout,
                    }
                } else {
                    FetchError::Request {
                        url: url.to_string(),
                        message: err.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.text().await.map_err(|err| FetchError::Request {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        if !any_selector_present(&body, wait_for_any) {
            return Err(FetchError::Timeout {
                url: url.to_string(),
                waited: timeout,
            });
        }
        Ok(body)
    }
}

/// CSS locator for one interactive element, tried within an ordered
/// fallback list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub css: String,
}

impl Locator {
    pub fn css(css: impl Into<String>) -> Self {
        Self { css: css.into() }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("interaction failed: {message}")]
    Interaction { message: String },
}

/// Interactive rendered-session contract consumed by the inquiry flow.
/// Implemented externally by a browser automation engine; its driver
/// lifecycle and anti-detection concerns live behind this trait.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError>;

    /// First locator from the list that matches an element, if any.
    async fn find_any(&mut self, locators: &[Locator]) -> Result<Option<Locator>, SessionError>;

    async fn click(&mut self, locator: &Locator) -> Result<(), SessionError>;

    /// Fill the first matching field with `value`; `false` when no locator
    /// matched.
    async fn fill_any(&mut self, locators: &[Locator], value: &str)
        -> Result<bool, SessionError>;
}

/// Chromium-backed session: the real rendering engine behind both
/// contracts. One session owns one page; it is never shared across
/// concurrent navigations.
pub struct ChromeSession {
    browser: chromiumoxide::Browser,
    page: chromiumoxide::Page,
    handler_task: tokio::task::JoinHandle<()>,
}

impl ChromeSession {
    /// Launch a headless browser and open a blank page. Failure here is the
    /// one run-fatal fault in the pipelines.
    pub async fn launch(config: &PageFetcherConfig) -> anyhow::Result<Self> {
        use chromiumoxide::browser::{Browser, BrowserConfig};
        use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
        use futures::StreamExt;

        let browser_config = BrowserConfig::builder()
            .no_sandbox()
            .build()
            .map_err(|e| anyhow::anyhow!(e))
            .context("building browser config")?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("launching browser")?;
        // The handler stream must be polled for the session to make
        // progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser handler event error");
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("opening page")?;
        page.set_user_agent(SetUserAgentOverrideParams::new(
            config.user_agent.clone(),
        ))
        .await
        .context("setting user agent")?;

        Ok(Self {
            browser,
            page,
            handler_task,
        })
    }

    pub async fn close(mut self) {
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "closing browser");
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}

#[async_trait]
impl PageFetcher for ChromeSession {
    async fn fetch(
        &self,
        url: &str,
        wait_for_any: &[&str],
        timeout: Duration,
    ) -> Result<String, FetchError> {
        self.page.goto(url).await.map_err(|err| FetchError::Request {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        let _ = self.page.wait_for_navigation().await;

        // Poll for the required element set until the bounded wait runs
        // out.
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for selector in wait_for_any {
                if self.page.find_element(*selector).await.is_ok() {
                    return self.page.content().await.map_err(|err| {
                        FetchError::Request {
                            url: url.to_string(),
                            message: err.to_string(),
                        }
                    });
                }
            }
            if wait_for_any.is_empty() {
                return self.page.content().await.map_err(|err| FetchError::Request {
                    url: url.to_string(),
                    message: err.to_string(),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        self.page
            .goto(url)
            .await
            .map_err(|err| SessionError::Navigation {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        let _ = self.page.wait_for_navigation().await;
        Ok(())
    }

    async fn find_any(&mut self, locators: &[Locator]) -> Result<Option<Locator>, SessionError> {
        for locator in locators {
            if self.page.find_element(locator.css.clone()).await.is_ok() {
                return Ok(Some(locator.clone()));
            }
        }
        Ok(None)
    }

    async fn click(&mut self, locator: &Locator) -> Result<(), SessionError> {
        let element = self
            .page
            .find_element(locator.css.clone())
            .await
            .map_err(|err| SessionError::Interaction {
                message: format!("locating {}: {err}", locator.css),
            })?;
        element.click().await.map_err(|err| SessionError::Interaction {
            message: format!("clicking {}: {err}", locator.css),
        })?;
        Ok(())
    }

    async fn fill_any(
        &mut self,
        locators: &[Locator],
        value: &str,
    ) -> Result<bool, SessionError> {
        for locator in locators {
            let Ok(element) = self.page.find_element(locator.css.clone()).await else {
                continue;
            };
            element
                .click()
                .await
                .map_err(|err| SessionError::Interaction {
                    message: format!("focusing {}: {err}", locator.css),
                })?;
            element
                .type_str(value)
                .await
                .map_err(|err| SessionError::Interaction {
                    message: format!("filling {}: {err}", locator.css),
                })?;
            return Ok(true);
        }
        Ok(false)
    }
}
