use std::path::PathBuf;
use std::sync::Arc;

use alh_core::NormalizedListing;
use alh_pipeline::{
    budget, format_dollars, rank_listings, CrawlOrchestrator, EventHub, HuntConfig,
    InquirySequencer, RunEvent,
};
use alh_storage::{ChromeSession, ListingStore, PageFetcherConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "alh")]
#[command(about = "Apartment listing hunter command-line interface")]
struct Cli {
    /// Hunt configuration file (criteria, profile, budget, crawl settings).
    #[arg(long, default_value = "hunt.yaml", env = "ALH_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled search target and append new listings.
    Hunt {
        /// Drive a headless Chromium session instead of plain HTTP fetches.
        #[arg(long)]
        chrome: bool,
    },
    /// Open stored listings in a browser session and prepare inquiries.
    Inquire {
        /// Canonical listing URLs to contact; defaults to every listing not
        /// yet contacted.
        ids: Vec<String>,
    },
    /// Show stored listings ranked against the current criteria.
    List,
    /// Print budget scenarios across the configured rent range.
    Budget,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(HuntConfig::from_yaml_file(&cli.config)?);

    match cli.command.unwrap_or(Commands::Hunt { chrome: false }) {
        Commands::Hunt { chrome } => hunt(config, chrome).await,
        Commands::Inquire { ids } => inquire(config, ids).await,
        Commands::List => list(config).await,
        Commands::Budget => print_budget(config),
    }
}

fn spawn_event_printer(hub: &EventHub) -> tokio::task::JoinHandle<()> {
    let mut rx = hub.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => render_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn render_event(event: &RunEvent) {
    match event {
        RunEvent::Progress {
            target,
            percent_complete,
            count_so_far,
            ..
        } => println!("[{percent_complete:>3}%] searching {target} ({count_so_far} found so far)"),
        RunEvent::ListingFound { listing, .. } => {
            let l = &listing.listing;
            println!(
                "  {:>3}  ${:>5}  {}  ({}){}{}",
                listing.score,
                format_dollars(l.rent),
                l.address,
                l.neighborhood,
                if l.no_fee { "  NO FEE" } else { "" },
                if listing.passes_budget_rule { "" } else { "  over 40x" },
            );
        }
        RunEvent::TargetFailed { target, reason, .. } => {
            println!("  !! {target}: {reason}");
        }
        RunEvent::RunComplete {
            total_found,
            passing_budget_rule,
            ..
        } => println!("done: {total_found} new listings, {passing_budget_rule} pass the 40x rule"),
        RunEvent::RunFailed { reason, .. } => println!("run failed: {reason}"),
        RunEvent::InquiryProgress {
            canonical_id,
            state,
            detail,
            ..
        } => match detail {
            Some(detail) => println!("  {canonical_id}: {state:?} ({detail})"),
            None => println!("  {canonical_id}: {state:?}"),
        },
        RunEvent::InquiryReady { address, .. } => {
            println!("review and submit the inquiry form for {address}");
        }
        RunEvent::InquiriesComplete {
            confirmed,
            skipped,
            failed,
            ..
        } => println!("inquiries done: {confirmed} confirmed, {skipped} skipped, {failed} failed"),
    }
}

async fn hunt(config: Arc<HuntConfig>, chrome: bool) -> Result<()> {
    let hub = EventHub::new();
    let printer = spawn_event_printer(&hub);
    let orchestrator = CrawlOrchestrator::new(config.clone(), hub.clone());

    let summary = if chrome {
        let fetcher_config = PageFetcherConfig {
            user_agent: config.crawl.user_agent.clone(),
            timeout: config.fetch_timeout(),
        };
        let session = ChromeSession::launch(&fetcher_config)
            .await
            .context("acquiring browser session")?;
        let summary = orchestrator.run(&session).await;
        session.close().await;
        summary?
    } else {
        orchestrator.run_http().await?
    };

    drop(orchestrator);
    drop(hub);
    printer.await.ok();

    println!(
        "hunt complete: run_id={} targets={} failed={} found={} appended={}",
        summary.run_id,
        summary.targets_crawled,
        summary.targets_failed,
        summary.total_found,
        summary.appended,
    );
    Ok(())
}

async fn inquire(config: Arc<HuntConfig>, ids: Vec<String>) -> Result<()> {
    let store = ListingStore::new(&config.store_path);
    let stored = store.load_all().await?;

    let selected: Vec<NormalizedListing> = if ids.is_empty() {
        stored
            .into_iter()
            .filter(|l| l.contacted_at.is_none())
            .collect()
    } else {
        for id in &ids {
            if !stored.iter().any(|l| &l.canonical_id == id) {
                warn!(canonical_id = %id, "selected listing is not in the store");
            }
        }
        stored
            .into_iter()
            .filter(|l| ids.iter().any(|id| id == &l.canonical_id))
            .collect()
    };

    if selected.is_empty() {
        println!("no listings selected for inquiry");
        return Ok(());
    }
    println!("preparing {} inquiries...", selected.len());

    let fetcher_config = PageFetcherConfig {
        user_agent: config.crawl.user_agent.clone(),
        timeout: config.fetch_timeout(),
    };
    let mut session = ChromeSession::launch(&fetcher_config)
        .await
        .context("acquiring browser session")?;

    let hub = EventHub::new();
    let printer = spawn_event_printer(&hub);
    let sequencer = InquirySequencer::new(config, hub.clone());
    let summary = sequencer.run(&mut session, &selected).await;
    session.close().await;

    drop(sequencer);
    drop(hub);
    printer.await.ok();

    let summary = summary?;
    println!(
        "inquiry run {}: {} processed, {} confirmed, {} skipped, {} failed",
        summary.run_id, summary.processed, summary.confirmed, summary.skipped, summary.failed,
    );
    Ok(())
}

async fn list(config: Arc<HuntConfig>) -> Result<()> {
    let store = ListingStore::new(&config.store_path);
    let stored = store.load_all().await?;
    if stored.is_empty() {
        println!("no listings tracked yet; run `alh hunt` first");
        return Ok(());
    }

    let ranked = rank_listings(&stored, &config.criteria, &config.budget);
    println!(
        "{} listings, ranked against ${} - ${} ({} pass the 40x rule)",
        ranked.len(),
        format_dollars(config.criteria.min_rent),
        format_dollars(config.criteria.max_rent),
        ranked.iter().filter(|l| l.passes_budget_rule).count(),
    );
    for scored in &ranked {
        let l = &scored.listing;
        println!(
            "  {:>3}  ${:>5}  {}  ({}){}{}{}  dining ${} savings ${}",
            scored.score,
            format_dollars(l.rent),
            l.address,
            l.neighborhood,
            if l.no_fee { "  NO FEE" } else { "" },
            if scored.passes_budget_rule { "" } else { "  over 40x" },
            if l.contacted_at.is_some() { "  contacted" } else { "" },
            format_dollars(scored.budget.dining),
            format_dollars(scored.budget.savings),
        );
    }
    Ok(())
}

fn print_budget(config: Arc<HuntConfig>) -> Result<()> {
    let criteria = &config.criteria;
    println!(
        "budget ${} - ${}, 40x ceiling ${}/mo",
        format_dollars(criteria.min_rent),
        format_dollars(criteria.max_rent),
        format_dollars(criteria.affordability_ceiling()),
    );

    let step = ((criteria.max_rent - criteria.min_rent) / 4).max(1);
    let mut rent = criteria.min_rent;
    while rent <= criteria.max_rent {
        let b = budget(rent, &config.budget);
        let status = if criteria.passes_budget_rule(rent) {
            "PASS"
        } else {
            "FAIL"
        };
        println!(
            "  ${}: {status} | dining ${} | savings ${}",
            format_dollars(rent),
            format_dollars(b.dining),
            format_dollars(b.savings),
        );
        rent += step;
    }
    Ok(())
}
