use chrono::Utc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::browser::{BrowserResult, ResponseFilter, ResponseSubscription, SessionTab};
use crate::config::ExtractionSection;

use super::record::ExtractionOutcome;
use super::resolver::{ListingFields, RecordSourceResolver};

/// Extracts one detail page: the structured-data response races a deadline,
/// then the rendered document fills in whatever the payload lacked.
#[derive(Debug, Clone)]
pub struct ExtractionRace {
    config: ExtractionSection,
    resolver: RecordSourceResolver,
}

impl ExtractionRace {
    pub fn new(config: ExtractionSection) -> Self {
        let resolver = RecordSourceResolver::new(config.identifier_label.clone());
        Self { config, resolver }
    }

    pub fn resolver(&self) -> &RecordSourceResolver {
        &self.resolver
    }

    /// Never fails: browser errors come back as [`ExtractionOutcome::Failed`].
    pub async fn extract(
        &self,
        tab: &mut dyn SessionTab,
        url: &str,
        page_number: u32,
    ) -> ExtractionOutcome {
        match self.try_extract(tab, url, page_number).await {
            Ok(outcome) => outcome,
            Err(err) => ExtractionOutcome::Failed {
                url: url.to_string(),
                error: err.to_string(),
            },
        }
    }

    async fn try_extract(
        &self,
        tab: &mut dyn SessionTab,
        url: &str,
        page_number: u32,
    ) -> BrowserResult<ExtractionOutcome> {
        // Subscribe before navigating so an early response is not missed.
        let filter = ResponseFilter::url_contains(self.config.endpoint_pattern.clone());
        let mut subscription = tab.observe_responses(filter).await?;
        let deadline = Instant::now() + self.config.deadline();

        tab.navigate(
            url,
            self.config.wait_strategy,
            self.config.navigation_timeout(),
        )
        .await?;

        let structured = self.await_payload(&mut subscription, deadline, url).await;
        drop(subscription);

        if self.config.settle_ms > 0 {
            time::sleep(std::time::Duration::from_millis(self.config.settle_ms)).await;
        }

        let rendered = match tab.evaluate(self.resolver.rendered_script()).await {
            Ok(value) => self.resolver.parse_rendered(value),
            Err(err) if structured.is_some() => {
                warn!(url, error = %err, "rendered extraction failed, keeping structured payload");
                None
            }
            Err(err) => return Err(err),
        };

        let outcome =
            self.resolver
                .resolve(structured, rendered, url, page_number, Utc::now());
        if let ExtractionOutcome::Success(record) = &outcome {
            debug!(
                url,
                origin = %record.extraction_origin,
                identifier = record.identifier.as_deref().unwrap_or("-"),
                "record resolved"
            );
        }
        Ok(outcome)
    }

    async fn await_payload(
        &self,
        subscription: &mut ResponseSubscription,
        deadline: Instant,
        url: &str,
    ) -> Option<ListingFields> {
        tokio::select! {
            biased;
            response = subscription.next() => match response {
                Some(response) => {
                    info!(url, endpoint = %response.url, status = response.status, "structured response intercepted");
                    let fields = self.resolver.parse_structured(&response.body);
                    if fields.is_none() {
                        warn!(url, "structured response unusable, using rendered document");
                    }
                    fields
                }
                None => {
                    debug!(url, "response stream closed before any match");
                    None
                }
            },
            _ = time::sleep_until(deadline) => {
                info!(url, deadline_seconds = self.config.deadline_seconds, "no structured response before deadline");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedSender;

    use super::*;
    use crate::browser::{Action, BrowserError, ObservedResponse, WaitStrategy};
    use crate::extract::ExtractionOrigin;

    struct ScriptedTab {
        responses: Vec<(Duration, String)>,
        rendered: Value,
        fail_navigation: bool,
        sender: Option<UnboundedSender<ObservedResponse>>,
        accepted: Arc<AtomicUsize>,
    }

    impl ScriptedTab {
        fn new(payload: Option<(Duration, String)>, rendered: Value) -> Self {
            Self::with_responses(payload.into_iter().collect(), rendered)
        }

        fn with_responses(responses: Vec<(Duration, String)>, rendered: Value) -> Self {
            Self {
                responses,
                rendered,
                fail_navigation: false,
                sender: None,
                accepted: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait(?Send)]
    impl SessionTab for ScriptedTab {
        async fn navigate(&mut self, url: &str, _: WaitStrategy, _: Duration) -> BrowserResult<()> {
            if self.fail_navigation {
                return Err(BrowserError::Navigation {
                    url: url.to_string(),
                    reason: "net::ERR_CONNECTION_RESET".into(),
                });
            }
            if self.responses.is_empty() {
                return Ok(());
            }
            let Some(sender) = self.sender.take() else {
                return Ok(());
            };
            let responses = self.responses.clone();
            let accepted = self.accepted.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                for (at, body) in responses {
                    time::sleep_until(started + at).await;
                    let sent = sender.send(ObservedResponse {
                        url: "https://x.test/detailListingJson.action?id=9".into(),
                        status: 200,
                        body,
                    });
                    if sent.is_ok() {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
            Ok(())
        }

        async fn observe_responses(
            &mut self,
            _: ResponseFilter,
        ) -> BrowserResult<ResponseSubscription> {
            let (sender, subscription) = ResponseSubscription::channel();
            self.sender = Some(sender);
            Ok(subscription)
        }

        async fn interact(&mut self, _: &str, _: Action, _: Duration) -> BrowserResult<()> {
            Ok(())
        }

        async fn evaluate(&mut self, _: &str) -> BrowserResult<Value> {
            Ok(self.rendered.clone())
        }

        async fn screenshot(&mut self) -> BrowserResult<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn current_url(&mut self) -> BrowserResult<Option<String>> {
            Ok(None)
        }

        async fn close(self: Box<Self>) -> BrowserResult<()> {
            Ok(())
        }
    }

    fn race() -> ExtractionRace {
        ExtractionRace::new(ExtractionSection::default())
    }

    fn payload() -> String {
        payload_with_vin("1GNSKCKD0NR000001")
    }

    fn payload_with_vin(vin: &str) -> String {
        json!({
            "listing": {
                "vin": vin,
                "modelYear": 2022,
                "makeName": "Chevrolet",
                "modelName": "Tahoe",
                "expectedPrice": 72500
            }
        })
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn payload_before_deadline_wins() {
        let mut tab = ScriptedTab::new(
            Some((Duration::from_secs(2), payload())),
            json!({ "title": "Used Tahoe", "body_type": "SUV / Crossover" }),
        );
        let started = Instant::now();
        let outcome = race().extract(&mut tab, "https://x.test/vdp.action?id=9", 4).await;
        let record = outcome.record().expect("record").clone();
        assert_eq!(record.extraction_origin, ExtractionOrigin::Structured);
        assert_eq!(record.title.as_deref(), Some("2022 Chevrolet Tahoe"));
        assert_eq!(record.category.as_deref(), Some("SUV / Crossover"));
        assert_eq!(record.page_number, 4);
        assert!(started.elapsed() < Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn only_first_matching_response_counts() {
        let mut tab = ScriptedTab::with_responses(
            vec![
                (Duration::from_secs(1), payload_with_vin("VIN-FIRST")),
                (Duration::from_secs(2), payload_with_vin("VIN-SECOND")),
            ],
            json!({}),
        );
        let accepted = tab.accepted.clone();
        let outcome = race().extract(&mut tab, "https://x.test/vdp.action?id=7", 1).await;
        time::sleep(Duration::from_secs(5)).await;

        let record = outcome.record().expect("record").clone();
        assert_eq!(record.identifier.as_deref(), Some("VIN-FIRST"));
        assert_eq!(record.extraction_origin, ExtractionOrigin::Structured);
        // the subscription is gone once the race settles
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_falls_back_to_rendered_document() {
        let mut tab = ScriptedTab::new(None, json!({ "vin": "VIN-R", "title": "2019 GMC Acadia" }));
        let started = Instant::now();
        let outcome = race().extract(&mut tab, "https://x.test/vdp.action?id=2", 1).await;
        let record = outcome.record().expect("record").clone();
        assert_eq!(record.extraction_origin, ExtractionOrigin::Rendered);
        assert_eq!(record.identifier.as_deref(), Some("VIN-R"));
        assert!(started.elapsed() >= Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn late_payload_is_ignored() {
        let mut tab = ScriptedTab::new(
            Some((Duration::from_secs(40), payload())),
            json!({ "title": "2019 GMC Acadia" }),
        );
        let outcome = race().extract(&mut tab, "https://x.test/vdp.action?id=3", 1).await;
        assert_eq!(
            outcome.record().expect("record").extraction_origin,
            ExtractionOrigin::Rendered
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_falls_back() {
        let mut tab = ScriptedTab::new(
            Some((Duration::from_secs(1), "not json".into())),
            json!({ "title": "2020 Jeep Grand Cherokee" }),
        );
        let outcome = race().extract(&mut tab, "https://x.test/vdp.action?id=4", 1).await;
        assert_eq!(
            outcome.record().expect("record").extraction_origin,
            ExtractionOrigin::Rendered
        );
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_error_is_reported_as_failed() {
        let mut tab = ScriptedTab::new(None, Value::Null);
        tab.fail_navigation = true;
        let outcome = race().extract(&mut tab, "https://x.test/vdp.action?id=5", 1).await;
        assert!(matches!(outcome, ExtractionOutcome::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_page_is_skipped() {
        let mut tab = ScriptedTab::new(None, json!({}));
        let outcome = race().extract(&mut tab, "https://x.test/vdp.action?id=6", 1).await;
        assert!(matches!(outcome, ExtractionOutcome::Skipped { .. }));
    }
}
