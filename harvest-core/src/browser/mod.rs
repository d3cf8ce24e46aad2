mod chromium;
mod error;
mod session;

pub use chromium::{ChromiumLauncher, ChromiumSession, ChromiumTab, LaunchOverrides, ViewportSpec};
pub use error::{BrowserError, BrowserResult};
pub use session::{
    Action, BrowsingSession, ObservedResponse, ResponseFilter, ResponseSubscription, SessionTab,
    WaitStrategy,
};
