use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::browser::{BrowserError, BrowsingSession, SessionTab};
use crate::config::HarvestConfig;
use crate::cursor::{
    compute_batch, BatchSource, Cursor, CursorStore, KeyValueStore, PageBatch, PaginationState,
    Paginator, RunPlan, SqliteStateStore, StateError,
};
use crate::delivery::{DeliveryError, DeliveryPipeline, JsonlDataset, WebhookForwarder};
use crate::error::ConfigError;
use crate::extract::ExtractionRace;
use crate::filters::{FilterReport, SearchFilters};
use crate::metrics::HarvestMetrics;
use crate::visit::{scroll_listing, PageReport, PageVisitController};

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("page {page} failed before any page of the batch completed: {source}")]
    BatchAborted {
        page: u32,
        #[source]
        source: BrowserError,
    },
}

/// Per-invocation values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub page: Option<u32>,
    pub max_pages: Option<u32>,
    pub max_results: Option<usize>,
    pub batch_size: Option<u32>,
}

impl RunOverrides {
    pub fn apply(&self, config: &mut HarvestConfig) -> Result<(), ConfigError> {
        if let Some(page) = self.page {
            config.run.page = Some(page);
        }
        if let Some(max_pages) = self.max_pages {
            config.run.max_pages = max_pages;
        }
        if let Some(max_results) = self.max_results {
            config.run.max_results = max_results;
        }
        if let Some(batch_size) = self.batch_size {
            config.run.batch_size = batch_size;
        }
        config.validate()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: PaginationState,
    pub batch: PageBatch,
    pub source: BatchSource,
    pub search_context: Option<String>,
    pub filters: FilterReport,
    pub pages: Vec<PageReport>,
    /// Page the batch stopped at after a page-level failure.
    pub stopped_at: Option<u32>,
    pub cursor_after: Option<Cursor>,
    pub metrics: HarvestMetrics,
}

impl RunReport {
    fn new(plan: &RunPlan, state: PaginationState) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            state,
            batch: plan.batch.clone(),
            source: plan.source,
            search_context: None,
            filters: FilterReport::default(),
            pages: Vec::new(),
            stopped_at: None,
            cursor_after: None,
            metrics: HarvestMetrics::default(),
        }
    }

    pub fn records_saved(&self) -> usize {
        self.pages.iter().map(|page| page.saved).sum()
    }
}

/// Batch the next run would process, read without side effects.
pub fn preview_batch(
    store: Arc<dyn KeyValueStore>,
    config: &HarvestConfig,
) -> Result<(Cursor, PageBatch, BatchSource), StateError> {
    let cursor = CursorStore::new(store, config.state.cursor_key.clone()).load()?;
    let (basis, source) = match config.run.page {
        Some(page) => (Cursor::starting_at(page), BatchSource::Override),
        None => (cursor.clone(), BatchSource::Cursor),
    };
    let batch = compute_batch(&basis, config.run.batch_size, config.run.max_pages);
    Ok((cursor, batch, source))
}

/// Strips the fragment so page markers can be appended.
pub fn search_context_from(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.split('#').next().unwrap_or(url).to_string(),
    }
}

pub struct HarvestEngine {
    config: HarvestConfig,
    paginator: Paginator,
    filters: SearchFilters,
    controller: PageVisitController,
}

impl HarvestEngine {
    pub fn new(
        config: HarvestConfig,
        store: Arc<dyn KeyValueStore>,
        delivery: DeliveryPipeline,
    ) -> Self {
        let cursors = CursorStore::new(store, config.state.cursor_key.clone());
        let paginator = Paginator::new(cursors, config.run.batch_size, config.run.max_pages);
        let filters = SearchFilters::new(config.filters.clone(), &config.run);
        let race = ExtractionRace::new(config.extraction.clone());
        let controller = PageVisitController::new(
            config.listing.clone(),
            config.run.max_results,
            &config.pacing,
            race,
            delivery,
        );
        Self {
            config,
            paginator,
            filters,
            controller,
        }
    }

    /// Builds the SQLite state store, JSONL dataset and optional webhook
    /// described by `config`, resolving relative paths against `base_dir`.
    pub fn from_config(mut config: HarvestConfig, base_dir: &Path) -> EngineResult<Self> {
        if let Some(dir) = config.listing.debug_dir.take() {
            let resolved = config.resolve_path(base_dir, &dir);
            config.listing.debug_dir = Some(resolved.to_string_lossy().into_owned());
        }

        let database = config.resolve_path(base_dir, &config.state.database);
        let store = SqliteStateStore::new(&database)?;
        store.initialize()?;

        let dataset_path = config.resolve_path(base_dir, &config.delivery.dataset_path);
        let mut delivery = DeliveryPipeline::new(
            Arc::new(JsonlDataset::new(dataset_path)),
            config.delivery.record_type.clone(),
            config.run.location.clone(),
        );
        if let Some(webhook) = WebhookForwarder::from_config(&config.delivery.webhook)? {
            info!(url = webhook.url(), "webhook forwarding enabled");
            delivery = delivery.with_forwarder(Arc::new(webhook));
        }

        Ok(Self::new(config, Arc::new(store), delivery))
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Report for a run with no pages left, built without touching a browser.
    /// `None` when there is work to do.
    pub fn exhausted_report(&self) -> EngineResult<Option<RunReport>> {
        let plan = self.paginator.preview(self.config.run.page)?;
        if !plan.batch.is_empty() {
            return Ok(None);
        }
        info!(
            next_page = plan.cursor.next_page,
            max_pages = self.config.run.max_pages,
            "all pages processed, nothing to do"
        );
        let mut report = RunReport::new(&plan, PaginationState::Exhausted);
        report.finished_at = Some(Utc::now());
        Ok(Some(report))
    }

    /// Runs one batch. Errors mean the cursor was left untouched.
    pub async fn run(&mut self, session: &dyn BrowsingSession) -> EngineResult<RunReport> {
        let plan = self.paginator.begin(self.config.run.page)?;
        let mut report = RunReport::new(&plan, self.paginator.state());

        if plan.batch.is_empty() {
            info!(
                next_page = plan.cursor.next_page,
                max_pages = self.config.run.max_pages,
                "all pages processed, nothing to do"
            );
            report.finished_at = Some(Utc::now());
            return Ok(report);
        }

        self.paginator.start()?;
        let mut tab = match session.open_tab().await {
            Ok(tab) => tab,
            Err(err) => {
                self.paginator.abandon();
                return Err(err.into());
            }
        };

        let result = self.walk_batch(session, tab.as_mut(), &plan, &mut report).await;
        if let Err(err) = tab.close().await {
            warn!(error = %err, "failed to close listing tab");
        }

        match result {
            Ok(()) => {
                report.state = self.paginator.state();
                report.finished_at = Some(Utc::now());
                info!(
                    run_id = %report.run_id,
                    pages = report.pages.len(),
                    saved = report.records_saved(),
                    next_page = report.cursor_after.as_ref().map(|cursor| cursor.next_page),
                    "harvest run finished"
                );
                Ok(report)
            }
            Err(err) => {
                self.paginator.abandon();
                warn!(run_id = %report.run_id, error = %err, "harvest run aborted, cursor untouched");
                Err(err)
            }
        }
    }

    async fn walk_batch(
        &mut self,
        session: &dyn BrowsingSession,
        tab: &mut dyn SessionTab,
        plan: &RunPlan,
        report: &mut RunReport,
    ) -> EngineResult<()> {
        let listing = self.config.listing.clone();
        let first_page = plan.batch.first().unwrap_or(1);

        info!(url = %listing.base_url, "opening listing");
        tab.navigate(
            &listing.base_url,
            listing.wait_strategy,
            listing.navigation_timeout(),
        )
        .await
        .map_err(|source| EngineError::BatchAborted {
            page: first_page,
            source,
        })?;
        sleep(Duration::from_millis(listing.warmup_ms)).await;

        report.filters = self.filters.apply(tab).await;
        for _ in &report.filters.failed {
            report.metrics.record_filter_failure();
        }
        sleep(Duration::from_millis(listing.filter_settle_ms)).await;

        let current = match tab.current_url().await {
            Ok(Some(url)) => url,
            Ok(None) => listing.base_url.clone(),
            Err(err) => {
                warn!(error = %err, "could not read filtered url, using base url");
                listing.base_url.clone()
            }
        };
        let search_context = search_context_from(&current);
        info!(search_context = %search_context, "search context captured");
        report.search_context = Some(search_context.clone());

        for page in plan.batch.iter() {
            match self.process_page(session, tab, &search_context, page).await {
                Ok(page_report) => {
                    self.paginator.page_completed(page)?;
                    report.metrics.merge(&page_report.metrics);
                    report.pages.push(page_report);
                }
                Err(source) if self.paginator.last_completed().is_none() => {
                    return Err(EngineError::BatchAborted { page, source });
                }
                Err(err) => {
                    warn!(page, error = %err, "page failed, stopping batch early");
                    report.stopped_at = Some(page);
                    report.cursor_after =
                        self.paginator
                            .stop_before(page, &search_context, Utc::now())?;
                    return Ok(());
                }
            }
        }

        report.cursor_after = self.paginator.finish(&search_context, Utc::now())?;
        Ok(())
    }

    async fn process_page(
        &mut self,
        session: &dyn BrowsingSession,
        tab: &mut dyn SessionTab,
        search_context: &str,
        page: u32,
    ) -> Result<PageReport, BrowserError> {
        let listing = &self.config.listing;
        if page > 1 {
            let url = format!("{search_context}#{}={page}", listing.page_fragment_key);
            info!(page, url = %url, "navigating to results page");
            tab.navigate(&url, listing.wait_strategy, listing.navigation_timeout())
                .await?;
            sleep(Duration::from_millis(listing.page_settle_ms)).await;
        }
        scroll_listing(tab, listing).await?;
        self.controller.visit_page(session, tab, page).await
    }
}
