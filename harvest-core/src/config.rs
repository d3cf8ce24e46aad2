use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::browser::WaitStrategy;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub run: RunSection,
    pub filters: FiltersSection,
    pub browser: BrowserSection,
    pub listing: ListingSection,
    pub extraction: ExtractionSection,
    pub pacing: PacingSection,
    pub delivery: DeliverySection,
    pub state: StateSection,
}

impl HarvestConfig {
    /// Checks values the engine cannot run with and normalizes the ones it can
    /// repair (inverted ranges).
    pub fn validate(&mut self) -> Result<()> {
        if self.run.max_pages == 0 {
            return Err(ConfigError::invalid("run.max_pages", "must be at least 1"));
        }
        if self.run.max_results == 0 {
            return Err(ConfigError::invalid("run.max_results", "must be at least 1"));
        }
        if self.run.batch_size == 0 {
            return Err(ConfigError::invalid("run.batch_size", "must be at least 1"));
        }
        if let Some(page) = self.run.page {
            if page == 0 {
                return Err(ConfigError::invalid("run.page", "pages are numbered from 1"));
            }
        }
        if self.listing.base_url.trim().is_empty() {
            return Err(ConfigError::invalid("listing.base_url", "must not be empty"));
        }
        url::Url::parse(&self.listing.base_url)
            .map_err(|err| ConfigError::invalid("listing.base_url", err.to_string()))?;
        if self.listing.link_selector.trim().is_empty() {
            return Err(ConfigError::invalid(
                "listing.link_selector",
                "must not be empty",
            ));
        }
        if self.extraction.endpoint_pattern.trim().is_empty() {
            return Err(ConfigError::invalid(
                "extraction.endpoint_pattern",
                "must not be empty",
            ));
        }
        if self.extraction.deadline_seconds == 0 {
            return Err(ConfigError::invalid(
                "extraction.deadline_seconds",
                "must be at least 1",
            ));
        }
        let [low, high] = self.pacing.visit_delay_ms;
        self.pacing.visit_delay_ms = [low.min(high), low.max(high)];
        if self.delivery.webhook.enabled && self.delivery.webhook.url.is_none() {
            return Err(ConfigError::invalid(
                "delivery.webhook.url",
                "required when the webhook is enabled",
            ));
        }
        Ok(())
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, base_dir: &Path, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocationUpdate {
    /// Keep whatever location the base URL implies.
    #[default]
    Skip,
    BeforeFilters,
    AfterFilters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub location: String,
    pub search_radius_km: u32,
    pub max_pages: u32,
    pub max_results: usize,
    pub batch_size: u32,
    /// Explicit page; bypasses the stored cursor for one run.
    pub page: Option<u32>,
    pub location_update: LocationUpdate,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            location: "H3H".to_string(),
            search_radius_km: 100,
            max_pages: 73,
            max_results: 24,
            batch_size: 1,
            page: None,
            location_update: LocationUpdate::Skip,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FiltersSection {
    pub makes: Vec<String>,
    pub body_types: Vec<String>,
    pub max_mileage: Option<u64>,
    pub min_price: Option<u64>,
    pub deal_ratings: Vec<String>,
}

impl Default for FiltersSection {
    fn default() -> Self {
        Self {
            makes: ["Ford", "GMC", "Chevrolet", "Toyota", "Cadillac", "Ram", "Jeep"]
                .into_iter()
                .map(String::from)
                .collect(),
            body_types: vec!["SUV / Crossover".to_string(), "Pickup Truck".to_string()],
            max_mileage: Some(140_000),
            min_price: Some(35_000),
            deal_ratings: ["GREAT_PRICE", "GOOD_PRICE", "FAIR_PRICE"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub user_agents: Vec<String>,
    pub viewport: [u32; 2],
    pub lang: Option<String>,
    pub accept_language: Option<String>,
    pub extra_args: Vec<String>,
    pub request_timeout_seconds: Option<u64>,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: false,
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_string(),
            ],
            viewport: [1920, 1080],
            lang: Some("en-CA".to_string()),
            accept_language: Some("en-CA,en;q=0.9".to_string()),
            extra_args: vec![
                "--disable-blink-features=AutomationControlled".to_string(),
                "--disable-features=IsolateOrigins,site-per-process".to_string(),
            ],
            request_timeout_seconds: Some(90),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListingSection {
    pub base_url: String,
    pub page_fragment_key: String,
    pub link_selector: String,
    pub wait_strategy: WaitStrategy,
    pub navigation_timeout_seconds: u64,
    pub warmup_ms: u64,
    pub filter_settle_ms: u64,
    pub page_settle_ms: u64,
    pub scroll_passes: u32,
    pub scroll_step_px: u32,
    pub scroll_pause_ms: u64,
    pub post_scroll_ms: u64,
    pub debug_dir: Option<String>,
}

impl ListingSection {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_seconds)
    }
}

impl Default for ListingSection {
    fn default() -> Self {
        Self {
            base_url: "https://www.cargurus.ca/Cars/l-Used-SUV-Crossover-bg7".to_string(),
            page_fragment_key: "resultsPage".to_string(),
            link_selector: "a[href*=\"vdp.action\"]".to_string(),
            wait_strategy: WaitStrategy::DomContentLoaded,
            navigation_timeout_seconds: 90,
            warmup_ms: 5_000,
            filter_settle_ms: 3_000,
            page_settle_ms: 3_000,
            scroll_passes: 3,
            scroll_step_px: 1_000,
            scroll_pause_ms: 2_000,
            post_scroll_ms: 3_000,
            debug_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionSection {
    /// Substring identifying the structured-data endpoint in response URLs.
    pub endpoint_pattern: String,
    pub deadline_seconds: u64,
    pub wait_strategy: WaitStrategy,
    pub navigation_timeout_seconds: u64,
    pub settle_ms: u64,
    pub identifier_label: String,
}

impl ExtractionSection {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_seconds)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_seconds)
    }
}

impl Default for ExtractionSection {
    fn default() -> Self {
        Self {
            endpoint_pattern: "detailListingJson.action".to_string(),
            deadline_seconds: 35,
            wait_strategy: WaitStrategy::DomContentLoaded,
            navigation_timeout_seconds: 60,
            settle_ms: 2_000,
            identifier_label: "vin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingSection {
    pub visit_delay_ms: [u64; 2],
}

impl Default for PacingSection {
    fn default() -> Self {
        Self {
            visit_delay_ms: [2_000, 5_000],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
    pub dataset_path: String,
    pub record_type: String,
    pub webhook: WebhookSection,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            dataset_path: "data/listings.jsonl".to_string(),
            record_type: "car_listing".to_string(),
            webhook: WebhookSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookSection {
    pub enabled: bool,
    pub url: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            timeout_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateSection {
    pub database: String,
    pub cursor_key: String,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            database: "data/state.sqlite".to_string(),
            cursor_key: "SCRAPER_STATE".to_string(),
        }
    }
}

/// Loads and validates the harvester config.
pub fn load_harvest_config<P: AsRef<Path>>(path: P) -> Result<HarvestConfig> {
    let mut config: HarvestConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/harvest.toml");
        let config = load_harvest_config(path).expect("fixture config should parse");
        assert_eq!(config.run.location, "H3H");
        assert_eq!(config.run.batch_size, 3);
        assert_eq!(config.extraction.endpoint_pattern, "detailListingJson.action");
        assert_eq!(config.state.cursor_key, "SCRAPER_STATE");
        assert!(!config.filters.makes.is_empty());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let mut config: HarvestConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.run.max_pages, 73);
        assert_eq!(config.run.max_results, 24);
        assert_eq!(config.run.batch_size, 1);
        assert_eq!(config.extraction.deadline_seconds, 35);
        assert_eq!(config.pacing.visit_delay_ms, [2_000, 5_000]);
        assert_eq!(config.run.location_update, LocationUpdate::Skip);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config: HarvestConfig = toml::from_str("[run]\nbatch_size = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "run.batch_size",
                ..
            }
        ));
    }

    #[test]
    fn inverted_delay_range_is_normalized() {
        let mut config: HarvestConfig =
            toml::from_str("[pacing]\nvisit_delay_ms = [5000, 1000]\n").unwrap();
        config.validate().unwrap();
        assert_eq!(config.pacing.visit_delay_ms, [1_000, 5_000]);
    }

    #[test]
    fn enabled_webhook_requires_url() {
        let mut config: HarvestConfig =
            toml::from_str("[delivery.webhook]\nenabled = true\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn location_update_parses_snake_case() {
        let config: HarvestConfig =
            toml::from_str("[run]\nlocation_update = \"after_filters\"\n").unwrap();
        assert_eq!(config.run.location_update, LocationUpdate::AfterFilters);
    }
}
