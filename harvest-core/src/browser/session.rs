use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::BrowserResult;

/// How far a navigation must progress before `navigate` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Return once the navigation request is committed.
    Commit,
    #[default]
    DomContentLoaded,
    Load,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Click,
    Fill(String),
    Press(String),
    Select(String),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click => f.write_str("click"),
            Action::Fill(_) => f.write_str("fill"),
            Action::Press(key) => write!(f, "press {key}"),
            Action::Select(value) => write!(f, "select {value}"),
        }
    }
}

/// Matches intercepted responses by URL substring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFilter {
    url_contains: String,
}

impl ResponseFilter {
    pub fn url_contains(pattern: impl Into<String>) -> Self {
        Self {
            url_contains: pattern.into(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.url_contains
    }

    pub fn matches(&self, url: &str) -> bool {
        url.contains(&self.url_contains)
    }
}

#[derive(Debug, Clone)]
pub struct ObservedResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Single-subscriber stream of responses observed on one tab.
///
/// Dropping the subscription stops the forwarder feeding it, so nothing
/// observed for one visit can leak into the next.
#[derive(Debug)]
pub struct ResponseSubscription {
    receiver: mpsc::UnboundedReceiver<ObservedResponse>,
    forwarder: Option<JoinHandle<()>>,
}

impl ResponseSubscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<ObservedResponse>,
        forwarder: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            receiver,
            forwarder,
        }
    }

    /// A subscription fed directly through the returned sender.
    pub fn channel() -> (mpsc::UnboundedSender<ObservedResponse>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx, None))
    }

    pub async fn next(&mut self) -> Option<ObservedResponse> {
        self.receiver.recv().await
    }
}

impl Drop for ResponseSubscription {
    fn drop(&mut self) {
        self.receiver.close();
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

/// One browser tab as seen by the engine.
#[async_trait(?Send)]
pub trait SessionTab {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitStrategy,
        timeout: Duration,
    ) -> BrowserResult<()>;

    async fn observe_responses(
        &mut self,
        filter: ResponseFilter,
    ) -> BrowserResult<ResponseSubscription>;

    async fn interact(
        &mut self,
        selector: &str,
        action: Action,
        timeout: Duration,
    ) -> BrowserResult<()>;

    async fn evaluate(&mut self, script: &str) -> BrowserResult<Value>;

    async fn screenshot(&mut self) -> BrowserResult<Vec<u8>>;

    async fn current_url(&mut self) -> BrowserResult<Option<String>>;

    async fn close(self: Box<Self>) -> BrowserResult<()>;
}

/// The capability handed to the engine; it never launches a browser itself.
#[async_trait(?Send)]
pub trait BrowsingSession {
    async fn open_tab(&self) -> BrowserResult<Box<dyn SessionTab>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_substring() {
        let filter = ResponseFilter::url_contains("detailListingJson.action");
        assert!(filter.matches("https://x.test/Cars/detailListingJson.action?inventoryListing=1"));
        assert!(!filter.matches("https://x.test/Cars/listingSearch.action"));
    }

    #[tokio::test]
    async fn dropped_subscription_closes_sender_side() {
        let (tx, subscription) = ResponseSubscription::channel();
        drop(subscription);
        let sent = tx.send(ObservedResponse {
            url: "https://x.test".into(),
            status: 200,
            body: "{}".into(),
        });
        assert!(sent.is_err());
    }
}
