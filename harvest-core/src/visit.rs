use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserResult, BrowsingSession, SessionTab};
use crate::config::{ListingSection, PacingSection};
use crate::delivery::DeliveryPipeline;
use crate::extract::{ExtractionOutcome, ExtractionRace};
use crate::metrics::HarvestMetrics;

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PageReport {
    pub page_number: u32,
    pub links_found: usize,
    pub links_visited: usize,
    pub rerendered: bool,
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total_wait_ms: u64,
    pub errors: Vec<String>,
    pub metrics: HarvestMetrics,
}

impl PageReport {
    fn new(page_number: u32) -> Self {
        Self {
            page_number,
            ..Default::default()
        }
    }
}

/// Walks the detail links of one listing page.
pub struct PageVisitController {
    listing: ListingSection,
    max_results: usize,
    race: ExtractionRace,
    delivery: DeliveryPipeline,
    pacer: VisitPacer,
}

impl PageVisitController {
    pub fn new(
        listing: ListingSection,
        max_results: usize,
        pacing: &PacingSection,
        race: ExtractionRace,
        delivery: DeliveryPipeline,
    ) -> Self {
        let range = (pacing.visit_delay_ms[0], pacing.visit_delay_ms[1]);
        Self {
            listing,
            max_results,
            race,
            delivery,
            pacer: VisitPacer::new(range),
        }
    }

    /// Only link collection failures escape; every per-link error is
    /// recorded in the report.
    pub async fn visit_page(
        &mut self,
        session: &dyn BrowsingSession,
        listing_tab: &mut dyn SessionTab,
        page_number: u32,
    ) -> BrowserResult<PageReport> {
        let mut report = PageReport::new(page_number);

        let mut links = self.collect_links(listing_tab).await?;
        if links.is_empty() {
            report.rerendered = true;
            info!(page = page_number, "no detail links found, re-rendering once");
            scroll_listing(listing_tab, &self.listing).await?;
            links = self.collect_links(listing_tab).await?;
            if links.is_empty() {
                warn!(page = page_number, "listing page still empty after re-render");
                self.capture_debug_screenshot(listing_tab, page_number).await;
            }
        }

        report.links_found = links.len();
        links.truncate(self.max_results);
        report.metrics.record_page(report.links_found, report.rerendered);
        info!(
            page = page_number,
            found = report.links_found,
            visiting = links.len(),
            "detail links collected"
        );

        for (index, url) in links.iter().enumerate() {
            debug!(page = page_number, index = index + 1, url = %url, "visiting detail page");
            let outcome = self.visit_link(session, url, page_number, &mut report).await;
            match &outcome {
                ExtractionOutcome::Success(_) => report.saved += 1,
                ExtractionOutcome::Skipped { url, reason } => {
                    report.skipped += 1;
                    info!(page = page_number, url = %url, reason = %reason, "detail page skipped");
                }
                ExtractionOutcome::Failed { url, error } => {
                    report.failed += 1;
                    report.errors.push(format!("{url}: {error}"));
                    warn!(page = page_number, url = %url, error = %error, "detail page failed");
                }
            }
            report.metrics.record_outcome(&outcome);
            report.links_visited += 1;

            report.total_wait_ms += self.pacer.wait().await;
        }

        info!(
            page = page_number,
            saved = report.saved,
            skipped = report.skipped,
            failed = report.failed,
            "listing page finished"
        );
        Ok(report)
    }

    async fn visit_link(
        &self,
        session: &dyn BrowsingSession,
        url: &str,
        page_number: u32,
        report: &mut PageReport,
    ) -> ExtractionOutcome {
        let mut tab = match session.open_tab().await {
            Ok(tab) => tab,
            Err(err) => {
                return ExtractionOutcome::Failed {
                    url: url.to_string(),
                    error: err.to_string(),
                }
            }
        };

        let outcome = self.race.extract(tab.as_mut(), url, page_number).await;
        if let Err(err) = tab.close().await {
            warn!(url, error = %err, "failed to close detail tab");
        }

        match outcome {
            ExtractionOutcome::Success(record) => {
                match self.delivery.deliver(record.clone()).await {
                    Ok(receipt) => {
                        report.metrics.record_forward(receipt.forwarded);
                        ExtractionOutcome::Success(record)
                    }
                    Err(err) => ExtractionOutcome::Failed {
                        url: url.to_string(),
                        error: err.to_string(),
                    },
                }
            }
            other => other,
        }
    }

    async fn collect_links(&self, tab: &mut dyn SessionTab) -> BrowserResult<Vec<String>> {
        let script = link_collection_script(&self.listing.link_selector)?;
        let value = tab.evaluate(&script).await?;
        let hrefs = match value {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            Value::Null => Vec::new(),
            other => {
                return Err(BrowserError::Script(format!(
                    "link collection returned {other}"
                )))
            }
        };
        Ok(dedupe_links(hrefs))
    }

    async fn capture_debug_screenshot(&self, tab: &mut dyn SessionTab, page_number: u32) {
        let Some(dir) = self.listing.debug_dir.as_deref() else {
            return;
        };
        let path = PathBuf::from(dir).join(format!(
            "empty-page-{page_number}-{}.png",
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        let result = async {
            let bytes = tab.screenshot().await?;
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, bytes).await?;
            BrowserResult::Ok(())
        }
        .await;
        match result {
            Ok(()) => info!(page = page_number, path = %path.display(), "debug screenshot saved"),
            Err(err) => warn!(page = page_number, error = %err, "debug screenshot failed"),
        }
    }
}

/// Scrolls the listing in steps so lazily rendered cards attach.
pub async fn scroll_listing(tab: &mut dyn SessionTab, listing: &ListingSection) -> BrowserResult<()> {
    for pass in 0..listing.scroll_passes {
        let offset = u64::from(pass + 1) * u64::from(listing.scroll_step_px);
        tab.evaluate(&format!("window.scrollTo(0, {offset})")).await?;
        sleep(Duration::from_millis(listing.scroll_pause_ms)).await;
    }
    if listing.post_scroll_ms > 0 {
        sleep(Duration::from_millis(listing.post_scroll_ms)).await;
    }
    Ok(())
}

fn link_collection_script(selector: &str) -> BrowserResult<String> {
    let selector = serde_json::to_string(selector)
        .map_err(|err| BrowserError::Script(err.to_string()))?;
    Ok(format!(
        "Array.from(document.querySelectorAll({selector})).map(a => a.href || '')"
    ))
}

/// Keeps the first occurrence of every non-empty URL, in page order.
pub fn dedupe_links(hrefs: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    hrefs
        .into_iter()
        .map(|href| href.trim().to_string())
        .filter(|href| !href.is_empty())
        .filter(|href| seen.insert(href.clone()))
        .collect()
}

struct VisitPacer {
    range: (u64, u64),
}

impl VisitPacer {
    fn new(range: (u64, u64)) -> Self {
        Self { range }
    }

    async fn wait(&mut self) -> u64 {
        if self.range.0 == 0 && self.range.1 == 0 {
            return 0;
        }
        let delay = {
            let mut rng = rand::thread_rng();
            let lower = self.range.0.min(self.range.1);
            let upper = self.range.0.max(self.range.1);
            rng.gen_range(lower..=upper)
        };
        sleep(Duration::from_millis(delay)).await;
        delay
    }
}
