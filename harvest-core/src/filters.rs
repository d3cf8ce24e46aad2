use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::browser::{Action, BrowserError, BrowserResult, SessionTab};
use crate::config::{FiltersSection, LocationUpdate, RunSection};

const BODY_STYLE_TRIGGER: &str = "#BodyStyle-accordion-trigger";
const MAKE_TRIGGER: &str = "#MakeAndModel-accordion-trigger";
const PRICE_TRIGGER: &str = "#Price-accordion-trigger";
const MILEAGE_TRIGGER: &str = "#Mileage-accordion-trigger";
const DEAL_RATING_TRIGGER: &str = "#DealRating-accordion-trigger";
const MIN_PRICE_INPUT: &str = r#"input[id*="min"][id*="price"], input[placeholder*="Min"]"#;
const MAX_MILEAGE_INPUT: &str = r#"input[id*="max"][id*="mileage"], input[placeholder*="Max"]"#;
const LOCATION_TRIGGER: &str = r#"button[data-testid="zipCodeLink"]"#;
const LOCATION_INPUT: &str =
    r#"input[placeholder*="postal"], input[name*="zip"], input[id*="location"]"#;
const RADIUS_SELECT: &str = r#"select[data-testid="select-filter-distance"]"#;
const LOCATION_CONFIRM_LABELS: [&str; 3] = ["Update", "Search", "Apply"];

const STEP_TIMEOUT: Duration = Duration::from_secs(10);
const ACCORDION_PAUSE: Duration = Duration::from_millis(1_000);
const OPTION_PAUSE: Duration = Duration::from_millis(300);
const RESULTS_PAUSE: Duration = Duration::from_millis(2_000);

/// What happened to each filter step of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterReport {
    pub applied: Vec<String>,
    pub failed: Vec<String>,
}

impl FilterReport {
    fn applied(&mut self, step: impl Into<String>) {
        self.applied.push(step.into());
    }

    fn failed(&mut self, step: impl Into<String>, err: &BrowserError) {
        let step = step.into();
        warn!(step = %step, error = %err, "filter step failed, continuing");
        self.failed.push(format!("{step}: {err}"));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionState {
    Clicked,
    AlreadySelected,
    Missing,
}

/// Narrows the catalog through its filter UI. Every step is best-effort.
#[derive(Debug, Clone)]
pub struct SearchFilters {
    filters: FiltersSection,
    location: String,
    radius_km: u32,
    location_update: LocationUpdate,
}

impl SearchFilters {
    pub fn new(filters: FiltersSection, run: &RunSection) -> Self {
        Self {
            filters,
            location: run.location.clone(),
            radius_km: run.search_radius_km,
            location_update: run.location_update,
        }
    }

    pub async fn apply(&self, tab: &mut dyn SessionTab) -> FilterReport {
        let mut report = FilterReport::default();
        info!(
            makes = self.filters.makes.len(),
            body_types = self.filters.body_types.len(),
            deal_ratings = self.filters.deal_ratings.len(),
            location_update = ?self.location_update,
            "applying search filters"
        );

        if self.location_update == LocationUpdate::BeforeFilters {
            self.apply_location(tab, &mut report).await;
        }

        self.apply_options(
            tab,
            "body_type",
            BODY_STYLE_TRIGGER,
            &self.filters.body_types,
            body_type_selectors,
            &mut report,
        )
        .await;
        self.apply_options(
            tab,
            "make",
            MAKE_TRIGGER,
            &self.filters.makes,
            make_selectors,
            &mut report,
        )
        .await;
        if let Some(min_price) = self.filters.min_price {
            match self
                .fill_range(tab, PRICE_TRIGGER, MIN_PRICE_INPUT, min_price)
                .await
            {
                Ok(()) => report.applied(format!("min_price={min_price}")),
                Err(err) => report.failed("min_price", &err),
            }
        }
        if let Some(max_mileage) = self.filters.max_mileage {
            match self
                .fill_range(tab, MILEAGE_TRIGGER, MAX_MILEAGE_INPUT, max_mileage)
                .await
            {
                Ok(()) => report.applied(format!("max_mileage={max_mileage}")),
                Err(err) => report.failed("max_mileage", &err),
            }
        }
        self.apply_options(
            tab,
            "deal_rating",
            DEAL_RATING_TRIGGER,
            &self.filters.deal_ratings,
            deal_rating_selectors,
            &mut report,
        )
        .await;

        if self.location_update == LocationUpdate::AfterFilters {
            self.apply_location(tab, &mut report).await;
        }

        info!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            "search filters applied"
        );
        report
    }

    async fn apply_options(
        &self,
        tab: &mut dyn SessionTab,
        kind: &str,
        trigger: &str,
        values: &[String],
        selectors: fn(&str) -> Vec<String>,
        report: &mut FilterReport,
    ) {
        if values.is_empty() {
            return;
        }
        if let Err(err) = tab.interact(trigger, Action::Click, STEP_TIMEOUT).await {
            report.failed(kind, &err);
            return;
        }
        sleep(ACCORDION_PAUSE).await;

        for value in values {
            let step = format!("{kind}={value}");
            match toggle_option(tab, &selectors(value), value).await {
                Ok(OptionState::Clicked) => {
                    report.applied(step);
                    sleep(OPTION_PAUSE).await;
                }
                Ok(OptionState::AlreadySelected) => report.applied(step),
                Ok(OptionState::Missing) => {
                    report.failed(step, &BrowserError::ElementNotFound(value.clone()))
                }
                Err(err) => report.failed(step, &err),
            }
        }
        sleep(RESULTS_PAUSE).await;
    }

    async fn fill_range(
        &self,
        tab: &mut dyn SessionTab,
        trigger: &str,
        input: &str,
        value: u64,
    ) -> BrowserResult<()> {
        tab.interact(trigger, Action::Click, STEP_TIMEOUT).await?;
        sleep(ACCORDION_PAUSE).await;
        tab.interact(input, Action::Fill(value.to_string()), STEP_TIMEOUT)
            .await?;
        sleep(Duration::from_millis(500)).await;
        tab.interact(input, Action::Press("Enter".to_string()), STEP_TIMEOUT)
            .await?;
        sleep(RESULTS_PAUSE).await;
        Ok(())
    }

    async fn apply_location(&self, tab: &mut dyn SessionTab, report: &mut FilterReport) {
        let step = format!("location={} ({} km)", self.location, self.radius_km);
        match self.update_location(tab).await {
            Ok(()) => report.applied(step),
            Err(err) => report.failed(step, &err),
        }
    }

    async fn update_location(&self, tab: &mut dyn SessionTab) -> BrowserResult<()> {
        tab.interact(LOCATION_TRIGGER, Action::Click, STEP_TIMEOUT)
            .await?;
        sleep(ACCORDION_PAUSE).await;
        tab.interact(
            LOCATION_INPUT,
            Action::Fill(self.location.clone()),
            STEP_TIMEOUT,
        )
        .await?;
        tab.interact(
            RADIUS_SELECT,
            Action::Select(self.radius_km.to_string()),
            STEP_TIMEOUT,
        )
        .await?;
        let script = format!(
            "((labels) => {{ const button = Array.from(document.querySelectorAll('button')).find(b => labels.includes((b.textContent || '').trim())); if (!button) return false; button.click(); return true; }})({})",
            js_literal(&LOCATION_CONFIRM_LABELS)?
        );
        match tab.evaluate(&script).await? {
            Value::Bool(true) => {}
            _ => {
                return Err(BrowserError::ElementNotFound(
                    "location confirm button".to_string(),
                ))
            }
        }
        sleep(Duration::from_millis(3_000)).await;
        Ok(())
    }
}

async fn toggle_option(
    tab: &mut dyn SessionTab,
    selectors: &[String],
    label: &str,
) -> BrowserResult<OptionState> {
    let script = format!(
        r#"((selectors, text) => {{
    let el = null;
    for (const selector of selectors) {{
        try {{ el = document.querySelector(selector); }} catch (e) {{ el = null; }}
        if (el) break;
    }}
    if (!el && text) {{
        el = Array.from(document.querySelectorAll('label, button'))
            .find(c => (c.textContent || '').trim() === text) || null;
    }}
    if (!el) return 'missing';
    const input = el.matches('input') ? el : el.querySelector('input[type="checkbox"]');
    const checked = (input && input.checked)
        || el.getAttribute('aria-checked') === 'true'
        || el.getAttribute('aria-pressed') === 'true';
    if (checked) return 'already';
    el.scrollIntoView({{ block: 'center' }});
    el.click();
    return 'clicked';
}})({}, {})"#,
        js_literal(selectors)?,
        js_literal(label)?
    );
    match tab.evaluate(&script).await? {
        Value::String(state) if state == "clicked" => Ok(OptionState::Clicked),
        Value::String(state) if state == "already" => Ok(OptionState::AlreadySelected),
        Value::String(state) if state == "missing" => Ok(OptionState::Missing),
        other => Err(BrowserError::Script(format!(
            "option toggle returned {other}"
        ))),
    }
}

fn js_literal<T: Serialize + ?Sized>(value: &T) -> BrowserResult<String> {
    serde_json::to_string(value).map_err(|err| BrowserError::Script(err.to_string()))
}

fn token(value: &str) -> String {
    value
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find(|part| !part.is_empty())
        .unwrap_or_default()
        .to_ascii_uppercase()
}

fn body_type_selectors(body_type: &str) -> Vec<String> {
    let token = token(body_type);
    vec![
        format!(r#"button[id*="{token}"]"#),
        format!(r#"input[id*="{token}"]"#),
    ]
}

fn make_selectors(make: &str) -> Vec<String> {
    let sanitized: String = make
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '-')
        .collect();
    vec![
        format!(r#"button[id*="{}"]"#, sanitized.to_ascii_uppercase()),
        format!(r#"button[aria-label*="{sanitized}"]"#),
    ]
}

fn deal_rating_selectors(rating: &str) -> Vec<String> {
    let sanitized: String = rating
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    vec![format!(r"#FILTER\.DEAL_RATING\.{sanitized}")]
}
