use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;

use harvest_core::browser::{
    Action, BrowserError, BrowserResult, BrowsingSession, ObservedResponse, ResponseFilter,
    ResponseSubscription, SessionTab, WaitStrategy,
};
use harvest_core::{
    BatchSource, Cursor, CursorStore, DatasetEntry, DeliveryError, DeliveryPipeline,
    DeliveryResult, EngineError, ExtractionOrigin, FiltersSection, Forwarder, HarvestConfig,
    HarvestEngine, JsonlDataset, PaginationState, SqliteStateStore,
};

const BASE: &str = "https://cars.test/Cars/l-Used-SUV";
const DETAIL: &str = "https://cars.test/Cars/vdp.action";

#[derive(Clone)]
struct Detail {
    payload: Option<(Duration, String)>,
    rendered: Value,
    fail: bool,
}

impl Detail {
    fn rendered(title: &str) -> Self {
        Self {
            payload: None,
            rendered: json!({ "title": title }),
            fail: false,
        }
    }
}

#[derive(Default)]
struct Site {
    links: HashMap<u32, Vec<String>>,
    details: HashMap<String, Detail>,
    empty_once: HashSet<u32>,
    always_empty: HashSet<u32>,
    fail_base: bool,
    fail_pages: HashSet<u32>,
    navigations: Vec<String>,
    open_tabs: usize,
    max_open_tabs: usize,
    screenshots: usize,
}

impl Site {
    fn links_for(&self, page: u32) -> Vec<String> {
        self.links
            .get(&page)
            .cloned()
            .unwrap_or_else(|| vec![format!("{DETAIL}?id={page}-1")])
    }

    fn detail_for(&self, url: &str) -> Detail {
        self.details
            .get(url)
            .cloned()
            .unwrap_or_else(|| Detail::rendered(&format!("Listing {url}")))
    }
}

fn page_of(url: &str) -> u32 {
    url.split("#resultsPage=")
        .nth(1)
        .and_then(|page| page.parse().ok())
        .unwrap_or(1)
}

#[derive(Clone)]
struct MockSession {
    site: Rc<RefCell<Site>>,
}

struct MockTab {
    site: Rc<RefCell<Site>>,
    url: Option<String>,
    sender: Option<UnboundedSender<ObservedResponse>>,
}

#[async_trait(?Send)]
impl BrowsingSession for MockSession {
    async fn open_tab(&self) -> BrowserResult<Box<dyn SessionTab>> {
        let mut site = self.site.borrow_mut();
        site.open_tabs += 1;
        site.max_open_tabs = site.max_open_tabs.max(site.open_tabs);
        Ok(Box::new(MockTab {
            site: self.site.clone(),
            url: None,
            sender: None,
        }))
    }
}

#[async_trait(?Send)]
impl SessionTab for MockTab {
    async fn navigate(&mut self, url: &str, _: WaitStrategy, _: Duration) -> BrowserResult<()> {
        let mut site = self.site.borrow_mut();
        site.navigations.push(url.to_string());
        let failure = || BrowserError::Navigation {
            url: url.to_string(),
            reason: "net::ERR_TIMED_OUT".into(),
        };
        if url.starts_with(DETAIL) {
            let detail = site.detail_for(url);
            if detail.fail {
                return Err(failure());
            }
            if let (Some((delay, body)), Some(sender)) = (detail.payload, self.sender.clone()) {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(ObservedResponse {
                        url: "https://cars.test/Cars/detailListingJson.action?id=1".into(),
                        status: 200,
                        body,
                    });
                });
            }
        } else if url == BASE && site.fail_base {
            return Err(failure());
        } else if site.fail_pages.contains(&page_of(url)) {
            return Err(failure());
        }
        self.url = Some(url.to_string());
        Ok(())
    }

    async fn observe_responses(&mut self, _: ResponseFilter) -> BrowserResult<ResponseSubscription> {
        let (sender, subscription) = ResponseSubscription::channel();
        self.sender = Some(sender);
        Ok(subscription)
    }

    async fn interact(&mut self, _: &str, _: Action, _: Duration) -> BrowserResult<()> {
        Ok(())
    }

    async fn evaluate(&mut self, script: &str) -> BrowserResult<Value> {
        let url = self.url.clone().unwrap_or_default();
        let mut site = self.site.borrow_mut();
        if script.contains("__PREFLIGHT__") {
            return Ok(site.detail_for(&url).rendered);
        }
        if script.contains("querySelectorAll(") && script.contains("a.href") {
            let page = page_of(&url);
            if site.always_empty.contains(&page) || site.empty_once.remove(&page) {
                return Ok(json!([]));
            }
            return Ok(Value::from(site.links_for(page)));
        }
        Ok(Value::Null)
    }

    async fn screenshot(&mut self) -> BrowserResult<Vec<u8>> {
        self.site.borrow_mut().screenshots += 1;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn current_url(&mut self) -> BrowserResult<Option<String>> {
        Ok(self
            .url
            .as_ref()
            .map(|url| format!("{url}?searchId=42#resultsPage=1")))
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        self.site.borrow_mut().open_tabs -= 1;
        Ok(())
    }
}

struct FailingForwarder {
    calls: AtomicUsize,
}

#[async_trait]
impl Forwarder for FailingForwarder {
    async fn forward(&self, _: &DatasetEntry) -> DeliveryResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DeliveryError::Rejected { status: 503 })
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<SqliteStateStore>,
    dataset: Arc<JsonlDataset>,
    config: HarvestConfig,
    site: Rc<RefCell<Site>>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStateStore::new(dir.path().join("state.sqlite")).unwrap();
        store.initialize().unwrap();
        let dataset = JsonlDataset::new(dir.path().join("listings.jsonl"));

        let mut config = HarvestConfig::default();
        config.listing.base_url = BASE.to_string();
        config.listing.debug_dir = Some(dir.path().join("debug").display().to_string());
        config.filters = FiltersSection {
            makes: Vec::new(),
            body_types: Vec::new(),
            max_mileage: None,
            min_price: None,
            deal_ratings: Vec::new(),
        };
        config.pacing.visit_delay_ms = [0, 0];
        config.run.max_pages = 10;
        config.run.batch_size = 1;

        Self {
            dir,
            store: Arc::new(store),
            dataset: Arc::new(dataset),
            config,
            site: Rc::new(RefCell::new(Site::default())),
        }
    }

    fn pipeline(&self) -> DeliveryPipeline {
        DeliveryPipeline::new(self.dataset.clone(), "car_listing", "H3H")
    }

    fn engine(&self) -> HarvestEngine {
        HarvestEngine::new(self.config.clone(), self.store.clone(), self.pipeline())
    }

    fn session(&self) -> MockSession {
        MockSession {
            site: self.site.clone(),
        }
    }

    fn cursors(&self) -> CursorStore {
        CursorStore::new(self.store.clone(), "SCRAPER_STATE")
    }

    fn entries(&self) -> Vec<DatasetEntry> {
        self.dataset.entries().unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn batch_resumes_from_stored_cursor() {
    let mut harness = Harness::new();
    harness.config.run.batch_size = 3;
    harness.cursors().save(&Cursor::starting_at(5)).unwrap();

    let report = harness.engine().run(&harness.session()).await.unwrap();

    assert_eq!(report.batch.pages(), &[5, 6, 7]);
    assert_eq!(report.source, BatchSource::Cursor);
    assert_eq!(report.state, PaginationState::Advanced);
    let cursor = harness.cursors().load().unwrap();
    assert_eq!(cursor.next_page, 8);
    assert_eq!(cursor.last_page, 7);
    assert_eq!(cursor.search_context, format!("{BASE}?searchId=42"));
    assert_eq!(report.cursor_after, Some(cursor));

    let site = harness.site.borrow();
    for page in 5..=7 {
        let expected = format!("{BASE}?searchId=42#resultsPage={page}");
        assert!(site.navigations.contains(&expected), "missing {expected}");
    }
    let pages: Vec<u32> = harness
        .entries()
        .iter()
        .map(|entry| entry.record.page_number)
        .collect();
    assert_eq!(pages, vec![5, 6, 7]);
}

#[tokio::test(start_paused = true)]
async fn repeated_runs_advance_monotonically_until_exhausted() {
    let mut harness = Harness::new();
    harness.config.run.max_pages = 4;
    harness.config.run.batch_size = 3;

    let first = harness.engine().run(&harness.session()).await.unwrap();
    assert_eq!(first.batch.pages(), &[1, 2, 3]);
    assert_eq!(harness.cursors().load().unwrap().next_page, 4);

    let second = harness.engine().run(&harness.session()).await.unwrap();
    assert_eq!(second.batch.pages(), &[4]);
    assert_eq!(harness.cursors().load().unwrap().next_page, 5);

    let navigations_before = harness.site.borrow().navigations.len();
    let third = harness.engine().run(&harness.session()).await.unwrap();
    assert!(third.batch.is_empty());
    assert_eq!(third.state, PaginationState::Exhausted);
    assert_eq!(harness.site.borrow().navigations.len(), navigations_before);
    assert_eq!(harness.cursors().load().unwrap().next_page, 5);
}

#[tokio::test(start_paused = true)]
async fn exhausted_report_needs_no_session() {
    let mut harness = Harness::new();
    harness.config.run.max_pages = 4;

    assert!(harness.engine().exhausted_report().unwrap().is_none());

    harness.cursors().save(&Cursor::starting_at(5)).unwrap();
    let report = harness.engine().exhausted_report().unwrap().unwrap();
    assert!(report.batch.is_empty());
    assert_eq!(report.state, PaginationState::Exhausted);
    assert!(report.cursor_after.is_none());
    assert_eq!(harness.cursors().load().unwrap().next_page, 5);
    assert!(harness.site.borrow().navigations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failure_before_any_page_leaves_cursor_untouched() {
    let harness = Harness::new();
    harness.cursors().save(&Cursor::starting_at(3)).unwrap();
    harness.site.borrow_mut().fail_base = true;

    let err = harness.engine().run(&harness.session()).await.unwrap_err();
    assert!(matches!(err, EngineError::BatchAborted { page: 3, .. }));
    assert_eq!(harness.cursors().load().unwrap(), Cursor::starting_at(3));

    harness.site.borrow_mut().fail_base = false;
    let retry = harness.engine().run(&harness.session()).await.unwrap();
    assert_eq!(retry.batch.pages(), &[3]);
}

#[tokio::test(start_paused = true)]
async fn first_page_failure_aborts_the_batch() {
    let mut harness = Harness::new();
    harness.config.run.batch_size = 2;
    harness.cursors().save(&Cursor::starting_at(5)).unwrap();
    harness.site.borrow_mut().fail_pages.insert(5);

    let err = harness.engine().run(&harness.session()).await.unwrap_err();
    assert!(matches!(err, EngineError::BatchAborted { page: 5, .. }));
    assert_eq!(harness.cursors().load().unwrap().next_page, 5);
    assert_eq!(harness.site.borrow().open_tabs, 0);
}

#[tokio::test(start_paused = true)]
async fn later_page_failure_keeps_completed_pages() {
    let mut harness = Harness::new();
    harness.config.run.batch_size = 3;
    harness.cursors().save(&Cursor::starting_at(5)).unwrap();
    harness.site.borrow_mut().fail_pages.insert(6);

    let report = harness.engine().run(&harness.session()).await.unwrap();
    assert_eq!(report.stopped_at, Some(6));
    assert_eq!(report.pages.len(), 1);
    let cursor = harness.cursors().load().unwrap();
    assert_eq!(cursor.next_page, 6);
    assert_eq!(cursor.last_page, 5);
}

#[tokio::test(start_paused = true)]
async fn empty_page_is_rerendered_once() {
    let harness = Harness::new();
    harness.site.borrow_mut().empty_once.insert(1);

    let report = harness.engine().run(&harness.session()).await.unwrap();
    let page = &report.pages[0];
    assert!(page.rerendered);
    assert_eq!(page.links_found, 1);
    assert_eq!(page.saved, 1);
    assert_eq!(harness.site.borrow().screenshots, 0);
}

#[tokio::test(start_paused = true)]
async fn persistently_empty_page_still_advances_cursor() {
    let harness = Harness::new();
    harness.site.borrow_mut().always_empty.insert(1);

    let report = harness.engine().run(&harness.session()).await.unwrap();
    assert_eq!(report.pages[0].links_found, 0);
    assert!(report.pages[0].rerendered);
    assert_eq!(harness.cursors().load().unwrap().next_page, 2);
    assert_eq!(harness.site.borrow().screenshots, 1);
    let debug_files = std::fs::read_dir(harness.dir.path().join("debug"))
        .unwrap()
        .count();
    assert_eq!(debug_files, 1);
}

#[tokio::test(start_paused = true)]
async fn failing_item_does_not_stop_the_page() {
    let harness = Harness::new();
    let links: Vec<String> = (1..=3).map(|i| format!("{DETAIL}?id=1-{i}")).collect();
    {
        let mut site = harness.site.borrow_mut();
        site.links.insert(1, links.clone());
        site.details.insert(
            links[1].clone(),
            Detail {
                fail: true,
                ..Detail::rendered("broken")
            },
        );
    }

    let report = harness.engine().run(&harness.session()).await.unwrap();
    let page = &report.pages[0];
    assert_eq!(page.links_visited, 3);
    assert_eq!(page.saved, 2);
    assert_eq!(page.failed, 1);
    let urls: Vec<String> = harness
        .entries()
        .into_iter()
        .map(|entry| entry.record.source_url)
        .collect();
    assert_eq!(urls, vec![links[0].clone(), links[2].clone()]);
    assert_eq!(harness.cursors().load().unwrap().next_page, 2);
}

#[tokio::test(start_paused = true)]
async fn links_are_deduplicated_and_capped() {
    let mut harness = Harness::new();
    harness.config.run.max_results = 2;
    let links = vec![
        format!("{DETAIL}?id=a"),
        format!("{DETAIL}?id=a"),
        format!("{DETAIL}?id=b"),
        format!("{DETAIL}?id=c"),
    ];
    harness.site.borrow_mut().links.insert(1, links);

    let report = harness.engine().run(&harness.session()).await.unwrap();
    assert_eq!(report.pages[0].links_found, 3);
    assert_eq!(report.pages[0].links_visited, 2);
    let detail_visits = harness
        .site
        .borrow()
        .navigations
        .iter()
        .filter(|url| url.starts_with(DETAIL))
        .count();
    assert_eq!(detail_visits, 2);
}

#[tokio::test(start_paused = true)]
async fn payload_and_fallback_origins_are_recorded() {
    let harness = Harness::new();
    let fast = format!("{DETAIL}?id=fast");
    let silent = format!("{DETAIL}?id=silent");
    {
        let mut site = harness.site.borrow_mut();
        site.links.insert(1, vec![fast.clone(), silent.clone()]);
        site.details.insert(
            fast.clone(),
            Detail {
                payload: Some((
                    Duration::from_secs(2),
                    json!({ "listing": { "vin": "VIN-FAST", "modelYear": 2021, "makeName": "Ram", "modelName": "1500" } })
                        .to_string(),
                )),
                rendered: json!({ "dealer_city": "Montreal" }),
                fail: false,
            },
        );
        site.details.insert(
            silent.clone(),
            Detail {
                payload: None,
                rendered: json!({ "vin": "VIN-DOM", "title": "2017 Cadillac XT5" }),
                fail: false,
            },
        );
    }

    let report = harness.engine().run(&harness.session()).await.unwrap();
    assert_eq!(report.metrics.structured_records, 1);
    assert_eq!(report.metrics.rendered_records, 1);

    let entries = harness.entries();
    assert_eq!(entries[0].record.extraction_origin, ExtractionOrigin::Structured);
    assert_eq!(entries[0].record.title.as_deref(), Some("2021 Ram 1500"));
    assert_eq!(entries[0].record.seller_location.as_deref(), Some("Montreal"));
    assert_eq!(entries[1].record.extraction_origin, ExtractionOrigin::Rendered);
    assert_eq!(entries[1].record.identifier.as_deref(), Some("VIN-DOM"));
    assert!(entries.iter().all(|entry| entry.kind == "car_listing" && entry.location == "H3H"));
}

#[tokio::test(start_paused = true)]
async fn records_without_identity_are_skipped() {
    let harness = Harness::new();
    let url = format!("{DETAIL}?id=1-1");
    harness.site.borrow_mut().details.insert(
        url,
        Detail {
            payload: None,
            rendered: json!({ "price": 100 }),
            fail: false,
        },
    );

    let report = harness.engine().run(&harness.session()).await.unwrap();
    assert_eq!(report.pages[0].skipped, 1);
    assert!(harness.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn forwarding_failure_is_swallowed() {
    let harness = Harness::new();
    let forwarder = Arc::new(FailingForwarder {
        calls: AtomicUsize::new(0),
    });
    let delivery = harness.pipeline().with_forwarder(forwarder.clone());
    let mut engine = HarvestEngine::new(harness.config.clone(), harness.store.clone(), delivery);

    let report = engine.run(&harness.session()).await.unwrap();
    assert_eq!(report.pages[0].saved, 1);
    assert_eq!(report.metrics.forward_failed, 1);
    assert_eq!(forwarder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.entries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn explicit_page_is_not_persisted() {
    let mut harness = Harness::new();
    harness.cursors().save(&Cursor::starting_at(2)).unwrap();
    harness.config.run.page = Some(9);

    let report = harness.engine().run(&harness.session()).await.unwrap();
    assert_eq!(report.source, BatchSource::Override);
    assert_eq!(report.batch.pages(), &[9]);
    assert!(report.cursor_after.is_none());
    assert_eq!(harness.cursors().load().unwrap().next_page, 2);
}

#[tokio::test(start_paused = true)]
async fn visits_are_sequential_and_paced() {
    let mut harness = Harness::new();
    harness.config.pacing.visit_delay_ms = [2_000, 5_000];
    let links: Vec<String> = (1..=3).map(|i| format!("{DETAIL}?id=p{i}")).collect();
    harness.site.borrow_mut().links.insert(1, links);

    let started = tokio::time::Instant::now();
    let report = harness.engine().run(&harness.session()).await.unwrap();
    let waited = report.pages[0].total_wait_ms;
    assert!((6_000..=15_000).contains(&waited), "waited {waited}");
    assert!(started.elapsed() >= Duration::from_millis(waited));
    let site = harness.site.borrow();
    assert_eq!(site.max_open_tabs, 2);
    assert_eq!(site.open_tabs, 0);
    assert!(report.finished_at.unwrap() >= report.started_at);
    assert!(report.started_at <= Utc::now());
}
